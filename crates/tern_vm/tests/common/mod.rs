#![allow(dead_code)]

use serde_json::Value as JsonValue;
use tern_syntax::{Program, Stmt};
use tern_vm::{compile, Bytecode, CompileError, RuntimeError, Value, Vm};

pub fn program(body: Vec<Stmt>) -> Program {
    Program::new(body)
}

/// Build a program from ESTree-shaped JSON statements.
pub fn program_json(body: JsonValue) -> Program {
    serde_json::from_value(serde_json::json!({ "type": "Program", "body": body }))
        .expect("valid syntax tree")
}

pub fn bytecode(body: Vec<Stmt>) -> Bytecode {
    compile(&program(body)).expect("compile")
}

pub fn run(body: Vec<Stmt>) -> Value {
    run_program(&program(body)).expect("run")
}

pub fn run_program(program: &Program) -> Result<Value, RuntimeError> {
    let bytecode = compile(program).expect("compile");
    let mut vm = Vm::new(bytecode).with_output_capture();
    vm.run()?;
    Ok(vm.last_popped_stack_elem())
}

pub fn run_err(body: Vec<Stmt>) -> RuntimeError {
    run_program(&program(body)).expect_err("run should fail")
}

pub fn compile_err(body: Vec<Stmt>) -> CompileError {
    compile(&program(body)).expect_err("compile should fail")
}

pub fn num(value: f64) -> Value {
    Value::Number(value)
}
