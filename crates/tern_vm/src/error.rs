use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("undefined variable: {0}")]
    UnresolvedIdentifier(String),
    #[error("cannot reassign constant '{0}'")]
    ConstReassignment(String),
    #[error("invalid assignment target: {0}")]
    InvalidAssignmentTarget(String),
    #[error("missing initializer in const declaration '{0}'")]
    ConstWithoutInitializer(String),
    #[error("break used outside of a loop")]
    BreakOutsideLoop,
    #[error("continue used outside of a loop")]
    ContinueOutsideLoop,
    #[error("return used outside of a function")]
    ReturnOutsideFunction,
    #[error("{name} expects {expected} argument(s), got {got}")]
    ArityMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("malformed literal: {0}")]
    MalformedLiteral(String),
    #[error("too many {what} (limit {limit})")]
    LimitExceeded { what: &'static str, limit: usize },
    #[error("jump target {0} does not fit in a 16-bit operand")]
    JumpOutOfRange(usize),
    #[error("jump at offset {0} was never patched")]
    UnpatchedJump(usize),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("stack overflow")]
    StackOverflow,
    #[error("call depth exceeded (limit {0})")]
    FrameOverflow(usize),
    #[error("stack underflow")]
    StackUnderflow,
    #[error("unsupported operand types for {op}: {left} and {right}")]
    UnsupportedBinaryOperands {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
    #[error("cannot compare {left} and {right} with {op}")]
    UnsupportedComparison {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
    #[error("unsupported type for negation: {0}")]
    UnsupportedNegation(&'static str),
    #[error("calling non-function: {0}")]
    NotCallable(&'static str),
    #[error("wrong number of arguments: want={expected}, got={got}")]
    WrongArgumentCount { expected: usize, got: usize },
    #[error("unusable as dictionary key: {0}")]
    UnusableDictKey(&'static str),
    #[error("index operator not supported: {container}[{index}]")]
    UnsupportedIndex {
        container: &'static str,
        index: &'static str,
    },
    #[error("{name}: {message}")]
    BuiltinArgument { name: &'static str, message: String },
    #[error("unknown opcode {byte} at offset {offset}")]
    UnknownOpcode { byte: u8, offset: usize },
    #[error("invalid constant index {0}")]
    InvalidConstant(usize),
    #[error("invalid free variable index {0}")]
    InvalidFreeVariable(usize),
    #[error("invalid builtin index {0}")]
    InvalidBuiltin(usize),
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("invalid bytecode: {0}")]
    Decode(#[from] bincode::Error),
}
