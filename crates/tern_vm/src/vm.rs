use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::builtins::{Builtin, OutputBuffer};
use crate::code::Opcode;
use crate::compiler::Bytecode;
use crate::error::RuntimeError;
use crate::frame::Frame;
use crate::value::{Closure, CompiledFunction, DictKey, Value};

pub const STACK_SIZE: usize = 2048;
/// Global slots addressable by a two-byte operand.
pub const GLOBALS_SIZE: usize = 65536;
pub const MAX_FRAMES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmLimits {
    /// Operand stack slots, shared by every frame.
    pub stack_size: usize,
    /// Maximum call depth, main frame included.
    pub max_frames: usize,
}

impl Default for VmLimits {
    fn default() -> Self {
        Self {
            stack_size: STACK_SIZE,
            max_frames: MAX_FRAMES,
        }
    }
}

pub struct Vm {
    constants: Vec<Value>,
    stack: Vec<Value>,
    /// Next free slot; `stack[sp - 1]` is the top.
    sp: usize,
    globals: Vec<Value>,
    frames: Vec<Frame>,
    limits: VmLimits,
    output_buffer: Option<OutputBuffer>,
}

impl Vm {
    pub fn new(bytecode: Bytecode) -> Self {
        Self::with_limits(bytecode, VmLimits::default())
    }

    pub fn with_limits(bytecode: Bytecode, limits: VmLimits) -> Self {
        Self::with_globals(bytecode, Vec::new(), limits)
    }

    /// Start from globals left behind by an earlier run.
    pub fn with_globals(bytecode: Bytecode, globals: Vec<Value>, limits: VmLimits) -> Self {
        let main = CompiledFunction {
            instructions: bytecode.instructions,
            num_locals: 0,
            num_params: 0,
            name: Some("<main>".to_string()),
        };
        let main = Closure {
            function: Rc::new(main),
            free: Vec::new(),
        };
        let mut frames = Vec::with_capacity(64);
        frames.push(Frame::new(Rc::new(main), 0));
        Self {
            constants: bytecode.constants,
            stack: vec![Value::Null; limits.stack_size],
            sp: 0,
            globals,
            frames,
            limits,
            output_buffer: None,
        }
    }

    /// Collect `log` output instead of printing it.
    pub fn with_output_capture(self) -> Self {
        self.with_output_buffer(Rc::new(RefCell::new(Vec::new())))
    }

    pub fn with_output_buffer(mut self, buffer: OutputBuffer) -> Self {
        self.output_buffer = Some(buffer);
        self
    }

    pub fn get_output(&self) -> Option<Vec<String>> {
        self.output_buffer.as_ref().map(|buf| buf.borrow().clone())
    }

    pub fn into_globals(self) -> Vec<Value> {
        self.globals
    }

    /// Top of the operand stack, if anything is on it.
    pub fn stack_top(&self) -> Option<&Value> {
        self.sp.checked_sub(1).map(|top| &self.stack[top])
    }

    /// The value most recently removed from the stack.
    pub fn last_popped_stack_elem(&self) -> Value {
        self.stack.get(self.sp).cloned().unwrap_or(Value::Null)
    }

    pub fn run(&mut self) -> Result<(), RuntimeError> {
        let result = self.execute();
        if let Err(err) = &result {
            debug!(error = %err, depth = self.frames.len(), "run aborted");
        }
        result
    }

    fn execute(&mut self) -> Result<(), RuntimeError> {
        loop {
            let frame_index = self.frames.len() - 1;
            let ip = self.frames[frame_index].ip;
            let byte = self.frames[frame_index].instructions().get(ip);
            let Some(byte) = byte else {
                if frame_index == 0 {
                    return Ok(());
                }
                // Falling off a function body returns null.
                self.push(Value::Null)?;
                self.return_from_call()?;
                continue;
            };
            let opcode = Opcode::try_from(byte)
                .map_err(|byte| RuntimeError::UnknownOpcode { byte, offset: ip })?;
            let width = opcode.definition().operand_width();
            if ip + width >= self.frames[frame_index].instructions().len() {
                return Err(RuntimeError::UnknownOpcode { byte, offset: ip });
            }
            self.frames[frame_index].ip = ip + 1 + width;
            trace!(ip, opcode = opcode.name(), sp = self.sp);

            match opcode {
                Opcode::Constant => {
                    let index = self.read_u16(ip + 1);
                    let value = self
                        .constants
                        .get(index)
                        .cloned()
                        .ok_or(RuntimeError::InvalidConstant(index))?;
                    self.push(value)?;
                }
                Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                    self.execute_binary_operation(opcode)?;
                }
                Opcode::True => self.push(Value::Boolean(true))?,
                Opcode::False => self.push(Value::Boolean(false))?,
                Opcode::Null => self.push(Value::Null)?,
                Opcode::Equals
                | Opcode::NotEquals
                | Opcode::GreaterThan
                | Opcode::GreaterThanEquals => self.execute_comparison(opcode)?,
                Opcode::Not => {
                    let operand = self.pop()?;
                    self.push(Value::Boolean(!operand.is_truthy()))?;
                }
                Opcode::Minus => match self.pop()? {
                    Value::Number(number) => self.push(Value::Number(-number))?,
                    other => return Err(RuntimeError::UnsupportedNegation(other.type_name())),
                },
                Opcode::Pop => {
                    self.pop()?;
                }
                Opcode::Jump => {
                    let target = self.read_u16(ip + 1);
                    self.frames[frame_index].ip = target;
                }
                Opcode::JumpNotTruthy => {
                    let target = self.read_u16(ip + 1);
                    if !self.pop()?.is_truthy() {
                        self.frames[frame_index].ip = target;
                    }
                }
                Opcode::SetGlobal => {
                    let index = self.read_u16(ip + 1);
                    let value = self.pop()?;
                    if index >= self.globals.len() {
                        self.globals.resize(index + 1, Value::Null);
                    }
                    self.globals[index] = value;
                }
                Opcode::GetGlobal => {
                    let index = self.read_u16(ip + 1);
                    let value = self.globals.get(index).cloned().unwrap_or(Value::Null);
                    self.push(value)?;
                }
                Opcode::SetLocal => {
                    let slot = self.local_slot(frame_index, self.read_u8(ip + 1))?;
                    let value = self.pop()?;
                    self.stack[slot] = value;
                }
                Opcode::GetLocal => {
                    let slot = self.local_slot(frame_index, self.read_u8(ip + 1))?;
                    let value = self.stack[slot].clone();
                    self.push(value)?;
                }
                Opcode::GetFree => {
                    let index = self.read_u8(ip + 1);
                    let value = self.frames[frame_index]
                        .closure
                        .free
                        .get(index)
                        .cloned()
                        .ok_or(RuntimeError::InvalidFreeVariable(index))?;
                    self.push(value)?;
                }
                Opcode::GetBuiltin => {
                    let index = self.read_u8(ip + 1);
                    let builtin =
                        Builtin::from_index(index).ok_or(RuntimeError::InvalidBuiltin(index))?;
                    self.push(Value::Builtin(builtin))?;
                }
                Opcode::CurrentClosure => {
                    let closure = self.frames[frame_index].closure.clone();
                    self.push(Value::Closure(closure))?;
                }
                Opcode::Array => {
                    let count = self.read_u16(ip + 1);
                    let elements = self.take_top(count)?;
                    self.push(Value::array(elements))?;
                }
                Opcode::Dict => {
                    let count = self.read_u16(ip + 1);
                    let items = self.take_top(count * 2)?;
                    let dict = build_dict(items)?;
                    self.push(dict)?;
                }
                Opcode::ObjectCall => {
                    let index = self.pop()?;
                    let container = self.pop()?;
                    self.push(index_value(&container, &index)?)?;
                }
                Opcode::Closure => {
                    let index = self.read_u16(ip + 1);
                    let free_count = self.read_u8(ip + 3);
                    self.push_closure(index, free_count)?;
                }
                Opcode::FunctionCall => {
                    let argc = self.read_u8(ip + 1);
                    self.call(argc)?;
                }
                Opcode::Return => {
                    if frame_index == 0 {
                        self.pop()?;
                        return Ok(());
                    }
                    self.return_from_call()?;
                }
            }
        }
    }

    fn read_u16(&self, offset: usize) -> usize {
        self.current_frame().instructions().read_u16(offset)
    }

    fn read_u8(&self, offset: usize) -> usize {
        self.current_frame().instructions().read_u8(offset)
    }

    fn current_frame(&self) -> &Frame {
        &self.frames[self.frames.len() - 1]
    }

    fn local_slot(&self, frame_index: usize, index: usize) -> Result<usize, RuntimeError> {
        let slot = self.frames[frame_index].base_pointer + index;
        if slot >= self.stack.len() {
            return Err(RuntimeError::StackOverflow);
        }
        Ok(slot)
    }

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.sp >= self.stack.len() {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    // The popped slot is left in place so `last_popped_stack_elem` can read it.
    fn pop(&mut self) -> Result<Value, RuntimeError> {
        if self.sp == 0 {
            return Err(RuntimeError::StackUnderflow);
        }
        self.sp -= 1;
        Ok(self.stack[self.sp].clone())
    }

    /// Remove the top `count` values, oldest first.
    fn take_top(&mut self, count: usize) -> Result<Vec<Value>, RuntimeError> {
        let start = self
            .sp
            .checked_sub(count)
            .ok_or(RuntimeError::StackUnderflow)?;
        let values = self.stack[start..self.sp].to_vec();
        self.sp = start;
        Ok(values)
    }

    fn execute_binary_operation(&mut self, opcode: Opcode) -> Result<(), RuntimeError> {
        let right = self.pop()?;
        let left = self.pop()?;
        let result = match (&left, &right) {
            (Value::Number(l), Value::Number(r)) => Value::Number(match opcode {
                Opcode::Add => l + r,
                Opcode::Sub => l - r,
                Opcode::Mul => l * r,
                Opcode::Div => l / r,
                _ => l % r,
            }),
            (Value::String(l), Value::String(r)) if opcode == Opcode::Add => {
                let mut joined = String::with_capacity(l.len() + r.len());
                joined.push_str(l);
                joined.push_str(r);
                Value::String(Rc::from(joined))
            }
            _ => {
                return Err(RuntimeError::UnsupportedBinaryOperands {
                    op: opcode.name(),
                    left: left.type_name(),
                    right: right.type_name(),
                })
            }
        };
        self.push(result)
    }

    fn execute_comparison(&mut self, opcode: Opcode) -> Result<(), RuntimeError> {
        let right = self.pop()?;
        let left = self.pop()?;
        let unsupported = || RuntimeError::UnsupportedComparison {
            op: opcode.name(),
            left: left.type_name(),
            right: right.type_name(),
        };
        let result = match opcode {
            Opcode::Equals => values_equal(&left, &right).ok_or_else(unsupported)?,
            Opcode::NotEquals => !values_equal(&left, &right).ok_or_else(unsupported)?,
            _ => {
                let ordering = match (&left, &right) {
                    (Value::Number(l), Value::Number(r)) => l.partial_cmp(r),
                    (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
                    _ => return Err(unsupported()),
                };
                match (opcode, ordering) {
                    (_, None) => false,
                    (Opcode::GreaterThan, Some(ordering)) => ordering.is_gt(),
                    (_, Some(ordering)) => ordering.is_ge(),
                }
            }
        };
        self.push(Value::Boolean(result))
    }

    fn push_closure(&mut self, index: usize, free_count: usize) -> Result<(), RuntimeError> {
        let function = match self.constants.get(index) {
            Some(Value::CompiledFunction(function)) => function.clone(),
            _ => return Err(RuntimeError::InvalidConstant(index)),
        };
        let free = self.take_top(free_count)?;
        self.push(Value::Closure(Rc::new(Closure { function, free })))
    }

    fn call(&mut self, argc: usize) -> Result<(), RuntimeError> {
        let callee_slot = self
            .sp
            .checked_sub(argc + 1)
            .ok_or(RuntimeError::StackUnderflow)?;
        match self.stack[callee_slot].clone() {
            Value::Closure(closure) => self.call_closure(closure, argc),
            Value::Builtin(builtin) => {
                let args = self.stack[callee_slot + 1..self.sp].to_vec();
                let result = builtin.call(&args, self.output_buffer.as_ref())?;
                self.sp = callee_slot;
                self.push(result)
            }
            other => Err(RuntimeError::NotCallable(other.type_name())),
        }
    }

    fn call_closure(&mut self, closure: Rc<Closure>, argc: usize) -> Result<(), RuntimeError> {
        let function = &closure.function;
        if argc != function.num_params {
            return Err(RuntimeError::WrongArgumentCount {
                expected: function.num_params,
                got: argc,
            });
        }
        if self.frames.len() >= self.limits.max_frames {
            return Err(RuntimeError::FrameOverflow(self.limits.max_frames));
        }
        let base_pointer = self.sp - argc;
        let top = base_pointer + function.num_locals.max(argc);
        if top > self.stack.len() {
            return Err(RuntimeError::StackOverflow);
        }
        for slot in &mut self.stack[self.sp..top] {
            *slot = Value::Null;
        }
        self.sp = top;
        self.frames.push(Frame::new(closure, base_pointer));
        Ok(())
    }

    /// Pop the return value and the callee frame, drop the callee and its
    /// locals, and push the value for the caller.
    fn return_from_call(&mut self) -> Result<(), RuntimeError> {
        let value = self.pop()?;
        let frame = self.frames.pop().ok_or(RuntimeError::StackUnderflow)?;
        self.sp = frame
            .base_pointer
            .checked_sub(1)
            .ok_or(RuntimeError::StackUnderflow)?;
        self.push(value)
    }
}

/// Structural equality, or `None` when the two kinds cannot be compared.
pub fn values_equal(left: &Value, right: &Value) -> Option<bool> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => Some(l == r),
        (Value::Boolean(l), Value::Boolean(r)) => Some(l == r),
        (Value::String(l), Value::String(r)) => Some(l == r),
        // Null compares with every kind instead of raising a type error.
        (Value::Null, other) | (other, Value::Null) => Some(matches!(other, Value::Null)),
        (Value::Array(l), Value::Array(r)) => Some(l == r),
        (Value::Dict(l), Value::Dict(r)) => Some(l == r),
        (Value::Closure(l), Value::Closure(r)) => Some(Rc::ptr_eq(l, r)),
        (Value::CompiledFunction(l), Value::CompiledFunction(r)) => Some(Rc::ptr_eq(l, r)),
        (Value::Builtin(l), Value::Builtin(r)) => Some(l == r),
        _ => None,
    }
}

fn build_dict(items: Vec<Value>) -> Result<Value, RuntimeError> {
    let mut entries = IndexMap::with_capacity(items.len() / 2);
    let mut items = items.into_iter();
    while let (Some(key), Some(value)) = (items.next(), items.next()) {
        let key = DictKey::try_from_value(&key)
            .ok_or(RuntimeError::UnusableDictKey(key.type_name()))?;
        entries.insert(key, value);
    }
    Ok(Value::Dict(Rc::new(entries)))
}

/// Element lookup. Missing elements read as `null`.
fn index_value(container: &Value, index: &Value) -> Result<Value, RuntimeError> {
    match (container, index) {
        (Value::Array(items), Value::Number(position)) => Ok(array_position(*position, items.len())
            .and_then(|position| items.get(position).cloned())
            .unwrap_or(Value::Null)),
        (Value::String(text), Value::Number(position)) => Ok(array_position(*position, usize::MAX)
            .and_then(|position| text.chars().nth(position))
            .map(|ch| Value::String(Rc::from(ch.to_string())))
            .unwrap_or(Value::Null)),
        (Value::Dict(entries), key) => {
            let key = DictKey::try_from_value(key)
                .ok_or(RuntimeError::UnusableDictKey(key.type_name()))?;
            Ok(entries.get(&key).cloned().unwrap_or(Value::Null))
        }
        _ => Err(RuntimeError::UnsupportedIndex {
            container: container.type_name(),
            index: index.type_name(),
        }),
    }
}

fn array_position(position: f64, len: usize) -> Option<usize> {
    if position < 0.0 || position.fract() != 0.0 || position >= len as f64 {
        return None;
    }
    Some(position as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{make, Instructions};
    use crate::compiler::compile;
    use tern_syntax::{BinaryOp, Expr, Program, Stmt};

    fn run_program(body: Vec<Stmt>) -> Result<Value, RuntimeError> {
        let bytecode = compile(&Program::new(body)).expect("compile");
        let mut vm = Vm::new(bytecode);
        vm.run()?;
        Ok(vm.last_popped_stack_elem())
    }

    fn num(value: f64) -> Expr {
        Expr::number(value)
    }

    #[test]
    fn arithmetic() {
        let cases = [
            (BinaryOp::Add, 1.0, 2.0, 3.0),
            (BinaryOp::Sub, 1.0, 2.0, -1.0),
            (BinaryOp::Mul, 4.0, 2.5, 10.0),
            (BinaryOp::Div, 9.0, 2.0, 4.5),
            (BinaryOp::Mod, 7.0, 4.0, 3.0),
        ];
        for (op, left, right, expected) in cases {
            let result = run_program(vec![Stmt::expr(Expr::binary(op, num(left), num(right)))])
                .expect("run");
            assert_eq!(result, Value::Number(expected), "{op}");
        }
    }

    #[test]
    fn comparisons() {
        let cases = [
            (Expr::binary(BinaryOp::Eq, num(1.0), num(1.0)), true),
            (Expr::binary(BinaryOp::Neq, num(1.0), num(2.0)), true),
            (Expr::binary(BinaryOp::Lt, num(1.0), num(2.0)), true),
            (Expr::binary(BinaryOp::Lte, num(2.0), num(2.0)), true),
            (Expr::binary(BinaryOp::Gt, num(1.0), num(2.0)), false),
            (Expr::binary(BinaryOp::Gt, Expr::string("b"), Expr::string("a")), true),
            (Expr::binary(BinaryOp::Eq, Expr::null(), num(0.0)), false),
            (Expr::binary(BinaryOp::Eq, Expr::null(), Expr::null()), true),
            (
                Expr::binary(
                    BinaryOp::Eq,
                    Expr::array(vec![num(1.0), Expr::string("x")]),
                    Expr::array(vec![num(1.0), Expr::string("x")]),
                ),
                true,
            ),
        ];
        for (expr, expected) in cases {
            let result = run_program(vec![Stmt::expr(expr.clone())]).expect("run");
            assert_eq!(result, Value::Boolean(expected), "{expr:?}");
        }
    }

    #[test]
    fn mixed_kind_comparison_is_an_error() {
        let err = run_program(vec![Stmt::expr(Expr::binary(
            BinaryOp::Eq,
            num(1.0),
            Expr::string("1"),
        ))])
        .expect_err("should fail");
        assert_eq!(
            err,
            RuntimeError::UnsupportedComparison {
                op: "Equals",
                left: "number",
                right: "string",
            }
        );
    }

    #[test]
    fn string_concatenation() {
        let result = run_program(vec![Stmt::expr(Expr::binary(
            BinaryOp::Add,
            Expr::string("foo"),
            Expr::string("bar"),
        ))])
        .expect("run");
        assert_eq!(result, Value::string("foobar"));

        let err = run_program(vec![Stmt::expr(Expr::binary(
            BinaryOp::Sub,
            Expr::string("foo"),
            num(1.0),
        ))])
        .expect_err("should fail");
        assert!(matches!(err, RuntimeError::UnsupportedBinaryOperands { op: "Sub", .. }));
    }

    #[test]
    fn stack_is_balanced_after_statements() {
        let bytecode = compile(&Program::new(vec![
            Stmt::var("a", num(1.0)),
            Stmt::if_else(Expr::boolean(false), vec![Stmt::expr(num(2.0))], None),
            Stmt::expr(Expr::ident("a")),
        ]))
        .expect("compile");
        let mut vm = Vm::new(bytecode);
        vm.run().expect("run");
        assert!(vm.stack_top().is_none());
        assert_eq!(vm.last_popped_stack_elem(), Value::Number(1.0));
    }

    #[test]
    fn calls_with_locals_and_arguments() {
        let result = run_program(vec![
            Stmt::function(
                "sum",
                &["a", "b"],
                vec![
                    Stmt::var("c", Expr::binary(BinaryOp::Add, Expr::ident("a"), Expr::ident("b"))),
                    Stmt::ret(Some(Expr::ident("c"))),
                ],
            ),
            Stmt::expr(Expr::binary(
                BinaryOp::Add,
                Expr::call(Expr::ident("sum"), vec![num(1.0), num(2.0)]),
                Expr::call(Expr::ident("sum"), vec![num(3.0), num(4.0)]),
            )),
        ])
        .expect("run");
        assert_eq!(result, Value::Number(10.0));
    }

    #[test]
    fn wrong_argument_count() {
        let err = run_program(vec![
            Stmt::var("f", Expr::function(&["a"], vec![Stmt::expr(Expr::ident("a"))])),
            Stmt::expr(Expr::call(Expr::ident("f"), vec![])),
        ])
        .expect_err("should fail");
        assert_eq!(err, RuntimeError::WrongArgumentCount { expected: 1, got: 0 });
    }

    #[test]
    fn calling_a_number_fails() {
        let err = run_program(vec![Stmt::expr(Expr::call(num(1.0), vec![]))])
            .expect_err("should fail");
        assert_eq!(err, RuntimeError::NotCallable("number"));
    }

    #[test]
    fn unbounded_recursion_overflows_frames() {
        let err = run_program(vec![
            Stmt::function(
                "forever",
                &[],
                vec![Stmt::expr(Expr::call(Expr::ident("forever"), vec![]))],
            ),
            Stmt::expr(Expr::call(Expr::ident("forever"), vec![])),
        ])
        .expect_err("should fail");
        assert_eq!(err, RuntimeError::FrameOverflow(MAX_FRAMES));
    }

    #[test]
    fn small_stack_overflows() {
        let bytecode = compile(&Program::new(vec![Stmt::expr(Expr::array(
            (0..16).map(|i| num(i as f64)).collect(),
        ))]))
        .expect("compile");
        let mut vm = Vm::with_limits(
            bytecode,
            VmLimits {
                stack_size: 8,
                max_frames: MAX_FRAMES,
            },
        );
        assert_eq!(vm.run(), Err(RuntimeError::StackOverflow));
    }

    #[test]
    fn indexing() {
        let array = Expr::array(vec![num(1.0), num(2.0), num(3.0)]);
        let cases = [
            (Expr::index(array.clone(), num(1.0)), Value::Number(2.0)),
            (Expr::index(array.clone(), num(3.0)), Value::Null),
            (Expr::index(array.clone(), num(-1.0)), Value::Null),
            (Expr::index(array, num(0.5)), Value::Null),
            (
                Expr::index(Expr::dict(vec![(num(1.0), num(1.0))]), num(1.0)),
                Value::Number(1.0),
            ),
            (
                Expr::member(Expr::dict(vec![(Expr::string("a"), num(1.0))]), "b"),
                Value::Null,
            ),
            (Expr::index(Expr::string("héllo"), num(1.0)), Value::string("é")),
        ];
        for (expr, expected) in cases {
            let result = run_program(vec![Stmt::expr(expr.clone())]).expect("run");
            assert_eq!(result, expected, "{expr:?}");
        }
    }

    #[test]
    fn unhashable_dict_key() {
        let err = run_program(vec![Stmt::expr(Expr::dict(vec![(
            Expr::function(&[], vec![]),
            num(1.0),
        )]))])
        .expect_err("should fail");
        assert_eq!(err, RuntimeError::UnusableDictKey("closure"));
    }

    #[test]
    fn log_goes_to_capture_buffer() {
        let bytecode = compile(&Program::new(vec![Stmt::expr(Expr::call(
            Expr::ident("log"),
            vec![Expr::string("hello"), num(42.0)],
        ))]))
        .expect("compile");
        let mut vm = Vm::new(bytecode).with_output_capture();
        vm.run().expect("run");
        assert_eq!(vm.get_output(), Some(vec!["hello 42".to_string()]));
        assert_eq!(vm.last_popped_stack_elem(), Value::Null);
    }

    #[test]
    fn unknown_opcode_aborts() {
        let bytecode = Bytecode {
            instructions: Instructions(vec![250]),
            constants: Vec::new(),
        };
        let mut vm = Vm::new(bytecode);
        assert_eq!(
            vm.run(),
            Err(RuntimeError::UnknownOpcode {
                byte: 250,
                offset: 0
            })
        );
    }

    #[test]
    fn truncated_instruction_aborts() {
        let mut instructions = make(Opcode::Constant, &[0]);
        instructions.pop();
        let mut vm = Vm::new(Bytecode {
            instructions: Instructions(instructions),
            constants: vec![Value::Number(1.0)],
        });
        assert!(matches!(vm.run(), Err(RuntimeError::UnknownOpcode { .. })));
    }
}
