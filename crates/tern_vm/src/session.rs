use std::cell::RefCell;
use std::rc::Rc;

use tern_syntax::Program;
use tracing::debug;

use crate::builtins::OutputBuffer;
use crate::compiler::Compiler;
use crate::error::VmError;
use crate::symbol::SymbolTable;
use crate::value::Value;
use crate::vm::{Vm, VmLimits};

/// Compiler and VM state that outlives a single program, as a REPL needs.
///
/// Each [`Session::eval`] is all-or-nothing: a compile error restores the
/// symbol table, and a runtime error discards the globals the failed run
/// wrote.
pub struct Session {
    symbols: SymbolTable,
    constants: Vec<Value>,
    globals: Vec<Value>,
    limits: VmLimits,
    output_buffer: Option<OutputBuffer>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self::with_limits(VmLimits::default())
    }

    pub fn with_limits(limits: VmLimits) -> Self {
        Self {
            symbols: SymbolTable::with_builtins(),
            constants: Vec::new(),
            globals: Vec::new(),
            limits,
            output_buffer: None,
        }
    }

    pub fn with_output_capture(mut self) -> Self {
        self.output_buffer = Some(Rc::new(RefCell::new(Vec::new())));
        self
    }

    /// Drain captured `log` lines.
    pub fn take_output(&mut self) -> Vec<String> {
        self.output_buffer
            .as_ref()
            .map(|buf| std::mem::take(&mut *buf.borrow_mut()))
            .unwrap_or_default()
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn globals(&self) -> &[Value] {
        &self.globals
    }

    /// Forget every binding and constant.
    pub fn reset(&mut self) {
        self.symbols = SymbolTable::with_builtins();
        self.constants.clear();
        self.globals.clear();
    }

    /// Compile and run one program against the accumulated state, returning
    /// the last value popped from the stack.
    pub fn eval(&mut self, program: &Program) -> Result<Value, VmError> {
        let snapshot = self.symbols.clone();
        let constants_before = self.constants.len();
        let mut compiler = Compiler::new_with_state(
            std::mem::take(&mut self.symbols),
            std::mem::take(&mut self.constants),
        );
        let compiled = compiler.compile(program);
        let (bytecode, symbols) = compiler.finish();
        if let Err(err) = compiled {
            debug!(error = %err, "compile failed, restoring symbol table");
            self.symbols = snapshot;
            self.constants = bytecode.constants;
            self.constants.truncate(constants_before);
            return Err(err.into());
        }
        self.symbols = symbols;
        self.constants = bytecode.constants.clone();

        let mut vm = Vm::with_globals(bytecode, self.globals.clone(), self.limits);
        if let Some(buffer) = &self.output_buffer {
            vm = vm.with_output_buffer(buffer.clone());
        }
        match vm.run() {
            Ok(()) => {
                let result = vm.last_popped_stack_elem();
                self.globals = vm.into_globals();
                Ok(result)
            }
            Err(err) => {
                debug!(error = %err, "run failed, discarding globals");
                Err(err.into())
            }
        }
    }
}
