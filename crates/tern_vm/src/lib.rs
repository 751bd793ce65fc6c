//! Bytecode compiler and stack virtual machine for tern programs.
//!
//! [`compile`] lowers a [`tern_syntax::Program`] to [`Bytecode`]; [`run`]
//! executes it and returns the last value popped from the operand stack.
//! [`Session`] keeps globals between programs for interactive use.

pub mod builtins;
pub mod code;
pub mod compiler;
pub mod error;
pub mod frame;
pub mod session;
pub mod symbol;
pub mod value;
pub mod vm;

pub use builtins::Builtin;
pub use code::{Instructions, Opcode};
pub use compiler::{compile, Bytecode, Compiler};
pub use error::{CompileError, RuntimeError, VmError};
pub use session::Session;
pub use symbol::{Symbol, SymbolScope, SymbolTable};
pub use value::{format_value, Closure, CompiledFunction, DictKey, Value};
pub use vm::{Vm, VmLimits, GLOBALS_SIZE, MAX_FRAMES, STACK_SIZE};

/// Execute compiled bytecode with default limits, printing `log` output.
pub fn run(bytecode: &Bytecode) -> Result<Value, RuntimeError> {
    let mut vm = Vm::new(bytecode.clone());
    vm.run()?;
    Ok(vm.last_popped_stack_elem())
}

/// Compile and run a program in one step.
pub fn eval(program: &tern_syntax::Program) -> Result<Value, VmError> {
    let bytecode = compile(program)?;
    Ok(run(&bytecode)?)
}
