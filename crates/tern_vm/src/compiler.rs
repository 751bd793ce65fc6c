use std::collections::HashMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tern_syntax::{
    lookup_builtin, AssignOp, BinaryOp, DeclKind, Expr, ForInit, Ident, LogicalOp,
    ObjectProperty, Program, Stmt, UnaryOp, VariableDeclarator,
};
use tracing::debug;

use crate::code::{make, Instructions, Opcode};
use crate::error::CompileError;
use crate::symbol::{LeftScope, ScopeKind, Symbol, SymbolScope, SymbolTable};
use crate::value::{CompiledFunction, Value};
use crate::vm::GLOBALS_SIZE;

/// Largest value a two-byte operand can carry.
const MAX_U16_OPERAND: usize = u16::MAX as usize;
/// Largest value a one-byte operand can carry.
const MAX_U8_OPERAND: usize = u8::MAX as usize;

/// Operand written into a jump until its target is known.
const JUMP_PLACEHOLDER: usize = 0xFFFF;

/// Compiled program: the top-level instructions plus the constant pool they
/// (and every nested function) index into.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bytecode {
    pub instructions: Instructions,
    pub constants: Vec<Value>,
}

impl Bytecode {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Listing of the top-level instructions followed by every function in
    /// the constant pool.
    pub fn disassemble(&self) -> String {
        let mut listing = format!("== main ==\n{}", self.instructions);
        for (index, constant) in self.constants.iter().enumerate() {
            if let Value::CompiledFunction(function) = constant {
                listing.push_str(&format!(
                    "\n== constant {index}: {} (params {}, locals {}) ==\n{}",
                    function.name.as_deref().unwrap_or("<anonymous>"),
                    function.num_params,
                    function.num_locals,
                    function.instructions,
                ));
            }
        }
        listing
    }
}

/// Compile a whole program with a fresh symbol table and constant pool.
pub fn compile(program: &Program) -> Result<Bytecode, CompileError> {
    let mut compiler = Compiler::new();
    compiler.compile(program)?;
    Ok(compiler.bytecode())
}

#[derive(Debug, Clone, Copy)]
struct EmittedInstruction {
    opcode: Opcode,
    position: usize,
}

/// Handle to a jump whose target operand still holds the placeholder.
#[must_use]
#[derive(Debug)]
struct JumpPatch(usize);

#[derive(Debug, Default)]
struct LoopContext {
    breaks: Vec<JumpPatch>,
    continues: Vec<JumpPatch>,
}

/// Instruction buffer of one function body (or of the top level).
#[derive(Debug, Default)]
struct CompilationScope {
    instructions: Instructions,
    last: Option<EmittedInstruction>,
    previous: Option<EmittedInstruction>,
    unpatched: Vec<usize>,
    loop_stack: Vec<LoopContext>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstantKey {
    Number(u64),
    String(Rc<str>),
}

impl ConstantKey {
    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => Some(ConstantKey::Number(number.to_bits())),
            Value::String(text) => Some(ConstantKey::String(text.clone())),
            _ => None,
        }
    }
}

pub struct Compiler {
    constants: Vec<Value>,
    constant_index: HashMap<ConstantKey, usize>,
    symbols: SymbolTable,
    scopes: Vec<CompilationScope>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Self::new_with_state(SymbolTable::with_builtins(), Vec::new())
    }

    /// Continue from the symbol table and constant pool of an earlier
    /// compilation, as a REPL does between inputs.
    pub fn new_with_state(symbols: SymbolTable, constants: Vec<Value>) -> Self {
        let constant_index = constants
            .iter()
            .enumerate()
            .filter_map(|(index, value)| ConstantKey::of(value).map(|key| (key, index)))
            .collect();
        Self {
            constants,
            constant_index,
            symbols,
            scopes: vec![CompilationScope::default()],
        }
    }

    pub fn compile(&mut self, program: &Program) -> Result<(), CompileError> {
        for stmt in &program.body {
            self.compile_stmt(stmt)?;
        }
        if let Some(position) = self.scope().unpatched.first() {
            return Err(CompileError::UnpatchedJump(*position));
        }
        debug!(
            instructions = self.scope().instructions.len(),
            constants = self.constants.len(),
            globals = self.symbols.num_globals(),
            "compiled program"
        );
        Ok(())
    }

    pub fn bytecode(&self) -> Bytecode {
        Bytecode {
            instructions: self.scope().instructions.clone(),
            constants: self.constants.clone(),
        }
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Consume the compiler, handing back its output and symbol table.
    pub fn finish(mut self) -> (Bytecode, SymbolTable) {
        let instructions = std::mem::take(&mut self.scopes[0].instructions);
        (
            Bytecode {
                instructions,
                constants: self.constants,
            },
            self.symbols,
        )
    }

    fn compile_stmts(&mut self, stmts: &[Stmt]) -> Result<(), CompileError> {
        for stmt in stmts {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::VariableDeclaration { kind, declarations } => {
                for declarator in declarations {
                    self.compile_declarator(*kind, declarator)?;
                }
            }
            Stmt::ExpressionStatement { expression } => {
                self.compile_expr(expression)?;
                self.emit(Opcode::Pop, &[]);
            }
            Stmt::BlockStatement { body } => {
                self.symbols.enter_scope(ScopeKind::Block);
                self.compile_stmts(body)?;
                self.symbols.leave_scope();
            }
            Stmt::IfStatement {
                test,
                consequent,
                alternate,
            } => {
                self.compile_if(test, consequent, alternate.as_deref())?;
                self.emit(Opcode::Pop, &[]);
            }
            Stmt::WhileStatement { test, body } => {
                let loop_start = self.current_position();
                self.compile_expr(test)?;
                let exit = self.emit_jump(Opcode::JumpNotTruthy);
                self.scope_mut().loop_stack.push(LoopContext::default());
                self.compile_stmt(body)?;
                self.emit_jump_to(Opcode::Jump, loop_start)?;
                let end = self.current_position();
                self.patch_jump(exit, end)?;
                self.finish_loop(end, loop_start)?;
                self.emit_loop_result();
            }
            Stmt::ForStatement {
                init,
                test,
                update,
                body,
            } => {
                self.symbols.enter_scope(ScopeKind::Block);
                match init {
                    Some(ForInit::Statement(init)) => self.compile_stmt(init)?,
                    Some(ForInit::Expression(init)) => {
                        self.compile_expr(init)?;
                        self.emit(Opcode::Pop, &[]);
                    }
                    None => {}
                }
                let loop_start = self.current_position();
                let exit = match test {
                    Some(test) => {
                        self.compile_expr(test)?;
                        Some(self.emit_jump(Opcode::JumpNotTruthy))
                    }
                    None => None,
                };
                self.scope_mut().loop_stack.push(LoopContext::default());
                self.compile_stmt(body)?;
                let continue_target = self.current_position();
                if let Some(update) = update {
                    self.compile_expr(update)?;
                    self.emit(Opcode::Pop, &[]);
                }
                self.emit_jump_to(Opcode::Jump, loop_start)?;
                let end = self.current_position();
                if let Some(exit) = exit {
                    self.patch_jump(exit, end)?;
                }
                self.finish_loop(end, continue_target)?;
                self.symbols.leave_scope();
                self.emit_loop_result();
            }
            Stmt::ReturnStatement { argument } => {
                if self.scopes.len() == 1 {
                    return Err(CompileError::ReturnOutsideFunction);
                }
                match argument {
                    Some(argument) => self.compile_expr(argument)?,
                    None => {
                        self.emit(Opcode::Null, &[]);
                    }
                }
                self.emit(Opcode::Return, &[]);
            }
            Stmt::BreakStatement {} => {
                if self.scope().loop_stack.is_empty() {
                    return Err(CompileError::BreakOutsideLoop);
                }
                let jump = self.emit_jump(Opcode::Jump);
                if let Some(context) = self.scope_mut().loop_stack.last_mut() {
                    context.breaks.push(jump);
                }
            }
            Stmt::ContinueStatement {} => {
                if self.scope().loop_stack.is_empty() {
                    return Err(CompileError::ContinueOutsideLoop);
                }
                let jump = self.emit_jump(Opcode::Jump);
                if let Some(context) = self.scope_mut().loop_stack.last_mut() {
                    context.continues.push(jump);
                }
            }
            Stmt::FunctionDeclaration { id, params, body } => {
                let symbol = self.define(&id.name, false)?;
                self.compile_function(Some(id.name.as_str()), params, &body.body)?;
                self.store_symbol(&symbol)?;
            }
            Stmt::EmptyStatement {} => {}
        }
        Ok(())
    }

    fn compile_declarator(
        &mut self,
        kind: DeclKind,
        declarator: &VariableDeclarator,
    ) -> Result<(), CompileError> {
        let name = &declarator.id.name;
        match &declarator.init {
            // An anonymous function takes the name it is bound to, so it can
            // call itself.
            Some(Expr::FunctionExpression { id, params, body }) => {
                let self_name = id.as_ref().map_or(name.as_str(), |id| id.name.as_str());
                self.compile_function(Some(self_name), params, &body.body)?;
            }
            Some(init) => self.compile_expr(init)?,
            None if kind == DeclKind::Const => {
                return Err(CompileError::ConstWithoutInitializer(name.clone()));
            }
            None => {
                self.emit(Opcode::Null, &[]);
            }
        }
        let symbol = self.define(name, kind == DeclKind::Const)?;
        self.store_symbol(&symbol)
    }

    /// Leaves exactly one value on the stack whichever branch runs.
    fn compile_if(
        &mut self,
        test: &Expr,
        consequent: &Stmt,
        alternate: Option<&Stmt>,
    ) -> Result<(), CompileError> {
        self.compile_expr(test)?;
        let skip_consequent = self.emit_jump(Opcode::JumpNotTruthy);
        self.compile_branch(consequent)?;
        let skip_alternate = self.emit_jump(Opcode::Jump);

        let alternate_start = self.current_position();
        self.patch_jump(skip_consequent, alternate_start)?;
        match alternate {
            Some(alternate) => self.compile_branch(alternate)?,
            None => {
                self.emit(Opcode::Null, &[]);
            }
        }
        let end = self.current_position();
        self.patch_jump(skip_alternate, end)
    }

    fn compile_branch(&mut self, branch: &Stmt) -> Result<(), CompileError> {
        match branch {
            Stmt::BlockStatement { body } => self.compile_block_value(body),
            Stmt::IfStatement {
                test,
                consequent,
                alternate,
            } => self.compile_if(test, consequent, alternate.as_deref()),
            other => self.compile_block_value(std::slice::from_ref(other)),
        }
    }

    /// Compile a block whose value is its trailing expression statement, or
    /// `null` when it has none.
    fn compile_block_value(&mut self, body: &[Stmt]) -> Result<(), CompileError> {
        self.symbols.enter_scope(ScopeKind::Block);
        let start = self.current_position();
        self.compile_stmts(body)?;
        if self.last_instruction_since(Opcode::Pop, start) {
            self.remove_last_pop();
        } else {
            self.emit(Opcode::Null, &[]);
        }
        self.symbols.leave_scope();
        Ok(())
    }

    fn finish_loop(
        &mut self,
        break_target: usize,
        continue_target: usize,
    ) -> Result<(), CompileError> {
        let context = self.scope_mut().loop_stack.pop().unwrap_or_default();
        for jump in context.breaks {
            self.patch_jump(jump, break_target)?;
        }
        for jump in context.continues {
            self.patch_jump(jump, continue_target)?;
        }
        Ok(())
    }

    /// Loop statements evaluate to `null`.
    fn emit_loop_result(&mut self) {
        self.emit(Opcode::Null, &[]);
        self.emit(Opcode::Pop, &[]);
    }

    fn compile_function(
        &mut self,
        name: Option<&str>,
        params: &[Ident],
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        if params.len() > MAX_U8_OPERAND {
            return Err(CompileError::LimitExceeded {
                what: "parameters",
                limit: MAX_U8_OPERAND,
            });
        }

        self.enter_scope();
        if let Some(name) = name {
            self.symbols.define_function_name(name);
        }
        for param in params {
            self.define(&param.name, false)?;
        }
        self.compile_stmts(body)?;
        if self.last_instruction_since(Opcode::Pop, 0) {
            self.replace_last_pop_with_return();
        }
        if !self.last_instruction_since(Opcode::Return, 0) {
            self.emit(Opcode::Null, &[]);
            self.emit(Opcode::Return, &[]);
        }
        let (instructions, left) = self.leave_scope()?;

        let LeftScope {
            free_symbols,
            num_definitions,
        } = left;
        if free_symbols.len() > MAX_U8_OPERAND {
            return Err(CompileError::LimitExceeded {
                what: "free variables",
                limit: MAX_U8_OPERAND,
            });
        }
        for free in &free_symbols {
            self.load_symbol(free);
        }
        let function = CompiledFunction {
            instructions,
            num_locals: num_definitions,
            num_params: params.len(),
            name: name.map(str::to_string),
        };
        let index = self.add_constant(Value::CompiledFunction(Rc::new(function)))?;
        self.emit(Opcode::Closure, &[index, free_symbols.len()]);
        Ok(())
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Identifier { name } => {
                let symbol = self.resolve(name)?;
                self.load_symbol(&symbol);
            }
            Expr::NumericLiteral { value } => {
                if !value.is_finite() {
                    return Err(CompileError::MalformedLiteral(value.to_string()));
                }
                self.emit_constant(Value::Number(*value))?;
            }
            Expr::StringLiteral { value } => self.emit_constant(Value::string(value))?,
            Expr::BooleanLiteral { value } => {
                self.emit(if *value { Opcode::True } else { Opcode::False }, &[]);
            }
            Expr::NullLiteral {} => {
                self.emit(Opcode::Null, &[]);
            }
            Expr::BinaryExpression {
                operator,
                left,
                right,
            } => {
                let (opcode, swapped) = binary_instruction(*operator);
                let (first, second) = if swapped { (right, left) } else { (left, right) };
                self.compile_expr(first)?;
                self.compile_expr(second)?;
                self.emit(opcode, &[]);
            }
            Expr::LogicalExpression {
                operator,
                left,
                right,
            } => self.compile_logical(*operator, left, right)?,
            Expr::UnaryExpression { operator, argument } => {
                self.compile_expr(argument)?;
                let opcode = match operator {
                    UnaryOp::Neg => Opcode::Minus,
                    UnaryOp::Not => Opcode::Not,
                };
                self.emit(opcode, &[]);
            }
            Expr::AssignmentExpression {
                operator,
                left,
                right,
            } => self.compile_assignment(*operator, left, right)?,
            Expr::CallExpression { callee, arguments } => {
                self.compile_call(callee, arguments)?
            }
            Expr::ArrayExpression { elements } => {
                if elements.len() > MAX_U16_OPERAND {
                    return Err(CompileError::LimitExceeded {
                        what: "array elements",
                        limit: MAX_U16_OPERAND,
                    });
                }
                for element in elements {
                    self.compile_expr(element)?;
                }
                self.emit(Opcode::Array, &[elements.len()]);
            }
            Expr::ObjectExpression { properties } => self.compile_object(properties)?,
            Expr::MemberExpression {
                object,
                property,
                computed,
            } => {
                self.compile_expr(object)?;
                match property.as_ref() {
                    Expr::Identifier { name } if !computed => {
                        self.emit_constant(Value::string(name))?
                    }
                    property => self.compile_expr(property)?,
                }
                self.emit(Opcode::ObjectCall, &[]);
            }
            Expr::FunctionExpression { id, params, body } => {
                let name = id.as_ref().map(|id| id.name.as_str());
                self.compile_function(name, params, &body.body)?;
            }
        }
        Ok(())
    }

    /// `&&` and `||` short-circuit and always produce a boolean.
    fn compile_logical(
        &mut self,
        operator: LogicalOp,
        left: &Expr,
        right: &Expr,
    ) -> Result<(), CompileError> {
        self.compile_expr(left)?;
        let left_falsy = self.emit_jump(Opcode::JumpNotTruthy);
        match operator {
            LogicalOp::And => {
                self.compile_truthiness(right)?;
                let to_end = self.emit_jump(Opcode::Jump);
                let false_branch = self.current_position();
                self.patch_jump(left_falsy, false_branch)?;
                self.emit(Opcode::False, &[]);
                let end = self.current_position();
                self.patch_jump(to_end, end)
            }
            LogicalOp::Or => {
                self.emit(Opcode::True, &[]);
                let to_end = self.emit_jump(Opcode::Jump);
                let right_start = self.current_position();
                self.patch_jump(left_falsy, right_start)?;
                self.compile_truthiness(right)?;
                let end = self.current_position();
                self.patch_jump(to_end, end)
            }
        }
    }

    fn compile_truthiness(&mut self, expr: &Expr) -> Result<(), CompileError> {
        self.compile_expr(expr)?;
        self.emit(Opcode::Not, &[]);
        self.emit(Opcode::Not, &[]);
        Ok(())
    }

    fn compile_assignment(
        &mut self,
        operator: AssignOp,
        target: &Expr,
        value: &Expr,
    ) -> Result<(), CompileError> {
        let name = match target {
            Expr::Identifier { name } => name,
            Expr::MemberExpression { .. } => {
                return Err(CompileError::InvalidAssignmentTarget(
                    "member expression".to_string(),
                ))
            }
            _ => {
                return Err(CompileError::InvalidAssignmentTarget(
                    "expression".to_string(),
                ))
            }
        };
        let symbol = self.resolve(name)?;
        if !matches!(symbol.scope, SymbolScope::Global | SymbolScope::Local) {
            return Err(CompileError::InvalidAssignmentTarget(name.clone()));
        }
        if symbol.constant {
            return Err(CompileError::ConstReassignment(name.clone()));
        }

        match operator.binary_op() {
            Some(op) => {
                self.load_symbol(&symbol);
                self.compile_expr(value)?;
                self.emit(binary_instruction(op).0, &[]);
            }
            None => self.compile_expr(value)?,
        }
        self.store_symbol(&symbol)?;
        self.load_symbol(&symbol);
        Ok(())
    }

    fn compile_call(&mut self, callee: &Expr, arguments: &[Expr]) -> Result<(), CompileError> {
        if arguments.len() > MAX_U8_OPERAND {
            return Err(CompileError::LimitExceeded {
                what: "arguments",
                limit: MAX_U8_OPERAND,
            });
        }
        if let Expr::Identifier { name } = callee {
            let symbol = self.resolve(name)?;
            if symbol.scope == SymbolScope::Builtin {
                let arity = lookup_builtin(name).and_then(|(_, meta)| meta.arity);
                if let Some(expected) = arity {
                    if expected != arguments.len() {
                        return Err(CompileError::ArityMismatch {
                            name: name.clone(),
                            expected,
                            got: arguments.len(),
                        });
                    }
                }
            }
        }

        self.compile_expr(callee)?;
        for argument in arguments {
            self.compile_expr(argument)?;
        }
        self.emit(Opcode::FunctionCall, &[arguments.len()]);
        Ok(())
    }

    fn compile_object(&mut self, properties: &[ObjectProperty]) -> Result<(), CompileError> {
        if properties.len() > MAX_U16_OPERAND {
            return Err(CompileError::LimitExceeded {
                what: "dictionary entries",
                limit: MAX_U16_OPERAND,
            });
        }
        for property in properties {
            match &property.key {
                Expr::Identifier { name } if !property.computed => {
                    self.emit_constant(Value::string(name))?
                }
                key => self.compile_expr(key)?,
            }
            self.compile_expr(&property.value)?;
        }
        self.emit(Opcode::Dict, &[properties.len()]);
        Ok(())
    }

    fn resolve(&mut self, name: &str) -> Result<Symbol, CompileError> {
        self.symbols
            .resolve(name)
            .ok_or_else(|| CompileError::UnresolvedIdentifier(name.to_string()))
    }

    fn define(&mut self, name: &str, constant: bool) -> Result<Symbol, CompileError> {
        if let Some(existing) = self.symbols.lookup_current(name) {
            if existing.constant
                && matches!(existing.scope, SymbolScope::Global | SymbolScope::Local)
            {
                return Err(CompileError::ConstReassignment(name.to_string()));
            }
        }
        let symbol = self.symbols.define(name, constant);
        match symbol.scope {
            SymbolScope::Global if symbol.index >= GLOBALS_SIZE => {
                Err(CompileError::LimitExceeded {
                    what: "globals",
                    limit: GLOBALS_SIZE,
                })
            }
            SymbolScope::Local if symbol.index > MAX_U8_OPERAND => {
                Err(CompileError::LimitExceeded {
                    what: "locals",
                    limit: MAX_U8_OPERAND + 1,
                })
            }
            _ => Ok(symbol),
        }
    }

    fn load_symbol(&mut self, symbol: &Symbol) {
        match symbol.scope {
            SymbolScope::Global => self.emit(Opcode::GetGlobal, &[symbol.index]),
            SymbolScope::Local => self.emit(Opcode::GetLocal, &[symbol.index]),
            SymbolScope::Free => self.emit(Opcode::GetFree, &[symbol.index]),
            SymbolScope::Builtin => self.emit(Opcode::GetBuiltin, &[symbol.index]),
            SymbolScope::Function => self.emit(Opcode::CurrentClosure, &[]),
        };
    }

    fn store_symbol(&mut self, symbol: &Symbol) -> Result<(), CompileError> {
        match symbol.scope {
            SymbolScope::Global => self.emit(Opcode::SetGlobal, &[symbol.index]),
            SymbolScope::Local => self.emit(Opcode::SetLocal, &[symbol.index]),
            _ => return Err(CompileError::InvalidAssignmentTarget(symbol.name.clone())),
        };
        Ok(())
    }

    fn add_constant(&mut self, value: Value) -> Result<usize, CompileError> {
        let key = ConstantKey::of(&value);
        if let Some(index) = key.as_ref().and_then(|key| self.constant_index.get(key)) {
            return Ok(*index);
        }
        if self.constants.len() > MAX_U16_OPERAND {
            return Err(CompileError::LimitExceeded {
                what: "constants",
                limit: MAX_U16_OPERAND + 1,
            });
        }
        let index = self.constants.len();
        self.constants.push(value);
        if let Some(key) = key {
            self.constant_index.insert(key, index);
        }
        Ok(index)
    }

    fn emit_constant(&mut self, value: Value) -> Result<(), CompileError> {
        let index = self.add_constant(value)?;
        self.emit(Opcode::Constant, &[index]);
        Ok(())
    }

    fn scope(&self) -> &CompilationScope {
        &self.scopes[self.scopes.len() - 1]
    }

    fn scope_mut(&mut self) -> &mut CompilationScope {
        let last = self.scopes.len() - 1;
        &mut self.scopes[last]
    }

    fn enter_scope(&mut self) {
        self.scopes.push(CompilationScope::default());
        self.symbols.enter_scope(ScopeKind::Function);
    }

    fn leave_scope(&mut self) -> Result<(Instructions, LeftScope), CompileError> {
        let left = self.symbols.leave_scope();
        let scope = self.scopes.pop().unwrap_or_default();
        if let Some(position) = scope.unpatched.first() {
            return Err(CompileError::UnpatchedJump(*position));
        }
        Ok((scope.instructions, left))
    }

    fn current_position(&self) -> usize {
        self.scope().instructions.len()
    }

    fn emit(&mut self, opcode: Opcode, operands: &[usize]) -> usize {
        let instruction = make(opcode, operands);
        let scope = self.scope_mut();
        let position = scope.instructions.push(&instruction);
        scope.previous = scope.last.replace(EmittedInstruction { opcode, position });
        position
    }

    fn emit_jump(&mut self, opcode: Opcode) -> JumpPatch {
        let position = self.emit(opcode, &[JUMP_PLACEHOLDER]);
        self.scope_mut().unpatched.push(position);
        JumpPatch(position)
    }

    fn emit_jump_to(&mut self, opcode: Opcode, target: usize) -> Result<(), CompileError> {
        if target > MAX_U16_OPERAND {
            return Err(CompileError::JumpOutOfRange(target));
        }
        self.emit(opcode, &[target]);
        Ok(())
    }

    fn patch_jump(&mut self, jump: JumpPatch, target: usize) -> Result<(), CompileError> {
        if target > MAX_U16_OPERAND {
            return Err(CompileError::JumpOutOfRange(target));
        }
        let scope = self.scope_mut();
        scope
            .instructions
            .replace(jump.0 + 1, &(target as u16).to_be_bytes());
        scope.unpatched.retain(|position| *position != jump.0);
        Ok(())
    }

    fn last_instruction_since(&self, opcode: Opcode, start: usize) -> bool {
        matches!(
            self.scope().last,
            Some(last) if last.opcode == opcode && last.position >= start
        )
    }

    fn remove_last_pop(&mut self) {
        let scope = self.scope_mut();
        if let Some(last) = scope.last {
            scope.instructions.truncate(last.position);
            scope.last = scope.previous.take();
        }
    }

    fn replace_last_pop_with_return(&mut self) {
        let scope = self.scope_mut();
        if let Some(last) = scope.last.as_mut() {
            scope
                .instructions
                .replace(last.position, &make(Opcode::Return, &[]));
            last.opcode = Opcode::Return;
        }
    }
}

/// Opcode for a binary operator, and whether its operands are compiled in
/// reverse order.
fn binary_instruction(op: BinaryOp) -> (Opcode, bool) {
    match op {
        BinaryOp::Add => (Opcode::Add, false),
        BinaryOp::Sub => (Opcode::Sub, false),
        BinaryOp::Mul => (Opcode::Mul, false),
        BinaryOp::Div => (Opcode::Div, false),
        BinaryOp::Mod => (Opcode::Mod, false),
        BinaryOp::Eq => (Opcode::Equals, false),
        BinaryOp::Neq => (Opcode::NotEquals, false),
        BinaryOp::Gt => (Opcode::GreaterThan, false),
        BinaryOp::Gte => (Opcode::GreaterThanEquals, false),
        BinaryOp::Lt => (Opcode::GreaterThan, true),
        BinaryOp::Lte => (Opcode::GreaterThanEquals, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(body: Vec<Stmt>) -> Program {
        Program::new(body)
    }

    fn instructions(parts: Vec<Vec<u8>>) -> Instructions {
        Instructions::from(parts)
    }

    fn compile_ok(body: Vec<Stmt>) -> Bytecode {
        compile(&program(body)).expect("compile")
    }

    fn compile_err(body: Vec<Stmt>) -> CompileError {
        compile(&program(body)).expect_err("compile should fail")
    }

    fn function_at(bytecode: &Bytecode, index: usize) -> &CompiledFunction {
        match &bytecode.constants[index] {
            Value::CompiledFunction(function) => function,
            other => panic!("constant {index} is not a function: {other:?}"),
        }
    }

    #[test]
    fn arithmetic_emits_constants_then_operator() {
        let bytecode = compile_ok(vec![Stmt::expr(Expr::binary(
            BinaryOp::Add,
            Expr::number(1.0),
            Expr::number(2.0),
        ))]);
        assert_eq!(bytecode.constants, vec![Value::Number(1.0), Value::Number(2.0)]);
        assert_eq!(
            bytecode.instructions,
            instructions(vec![
                make(Opcode::Constant, &[0]),
                make(Opcode::Constant, &[1]),
                make(Opcode::Add, &[]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn less_than_swaps_operands() {
        let bytecode = compile_ok(vec![Stmt::expr(Expr::binary(
            BinaryOp::Lt,
            Expr::number(1.0),
            Expr::number(2.0),
        ))]);
        assert_eq!(bytecode.constants, vec![Value::Number(2.0), Value::Number(1.0)]);
        assert_eq!(
            bytecode.instructions,
            instructions(vec![
                make(Opcode::Constant, &[0]),
                make(Opcode::Constant, &[1]),
                make(Opcode::GreaterThan, &[]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn constants_are_deduplicated() {
        let bytecode = compile_ok(vec![
            Stmt::expr(Expr::number(7.0)),
            Stmt::expr(Expr::string("seven")),
            Stmt::expr(Expr::number(7.0)),
            Stmt::expr(Expr::string("seven")),
        ]);
        assert_eq!(bytecode.constants.len(), 2);
    }

    #[test]
    fn if_without_else_yields_null() {
        let bytecode = compile_ok(vec![
            Stmt::if_else(Expr::boolean(true), vec![Stmt::expr(Expr::number(10.0))], None),
            Stmt::expr(Expr::number(3333.0)),
        ]);
        assert_eq!(
            bytecode.instructions,
            instructions(vec![
                make(Opcode::True, &[]),
                make(Opcode::JumpNotTruthy, &[10]),
                make(Opcode::Constant, &[0]),
                make(Opcode::Jump, &[11]),
                make(Opcode::Null, &[]),
                make(Opcode::Pop, &[]),
                make(Opcode::Constant, &[1]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn if_else_branches_each_leave_one_value() {
        let bytecode = compile_ok(vec![Stmt::if_else(
            Expr::boolean(true),
            vec![Stmt::expr(Expr::number(10.0))],
            Some(vec![Stmt::var("x", Expr::number(20.0))]),
        )]);
        assert_eq!(
            bytecode.instructions,
            instructions(vec![
                make(Opcode::True, &[]),
                make(Opcode::JumpNotTruthy, &[10]),
                make(Opcode::Constant, &[0]),
                make(Opcode::Jump, &[17]),
                make(Opcode::Constant, &[1]),
                make(Opcode::SetGlobal, &[0]),
                make(Opcode::Null, &[]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn globals_get_sequential_slots() {
        let bytecode = compile_ok(vec![
            Stmt::var("one", Expr::number(1.0)),
            Stmt::var("two", Expr::number(2.0)),
            Stmt::expr(Expr::ident("two")),
        ]);
        assert_eq!(
            bytecode.instructions,
            instructions(vec![
                make(Opcode::Constant, &[0]),
                make(Opcode::SetGlobal, &[0]),
                make(Opcode::Constant, &[1]),
                make(Opcode::SetGlobal, &[1]),
                make(Opcode::GetGlobal, &[1]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn compound_assignment_reloads_the_target() {
        let bytecode = compile_ok(vec![
            Stmt::var("x", Expr::number(1.0)),
            Stmt::expr(Expr::assign(AssignOp::AddAssign, "x", Expr::number(2.0))),
        ]);
        assert_eq!(
            bytecode.instructions,
            instructions(vec![
                make(Opcode::Constant, &[0]),
                make(Opcode::SetGlobal, &[0]),
                make(Opcode::GetGlobal, &[0]),
                make(Opcode::Constant, &[1]),
                make(Opcode::Add, &[]),
                make(Opcode::SetGlobal, &[0]),
                make(Opcode::GetGlobal, &[0]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn function_body_returns_trailing_expression() {
        let bytecode = compile_ok(vec![Stmt::expr(Expr::function(
            &[],
            vec![Stmt::expr(Expr::binary(
                BinaryOp::Add,
                Expr::number(5.0),
                Expr::number(10.0),
            ))],
        ))]);
        let function = function_at(&bytecode, 2);
        assert_eq!(
            function.instructions,
            instructions(vec![
                make(Opcode::Constant, &[0]),
                make(Opcode::Constant, &[1]),
                make(Opcode::Add, &[]),
                make(Opcode::Return, &[]),
            ])
        );
        assert_eq!(
            bytecode.instructions,
            instructions(vec![make(Opcode::Closure, &[2, 0]), make(Opcode::Pop, &[])])
        );
    }

    #[test]
    fn empty_function_returns_null() {
        let bytecode = compile_ok(vec![Stmt::expr(Expr::function(&[], vec![]))]);
        assert_eq!(
            function_at(&bytecode, 0).instructions,
            instructions(vec![make(Opcode::Null, &[]), make(Opcode::Return, &[])])
        );
    }

    #[test]
    fn nested_closures_capture_free_variables() {
        let bytecode = compile_ok(vec![Stmt::expr(Expr::function(
            &["a"],
            vec![Stmt::expr(Expr::function(
                &["b"],
                vec![Stmt::expr(Expr::binary(
                    BinaryOp::Add,
                    Expr::ident("a"),
                    Expr::ident("b"),
                ))],
            ))],
        ))]);

        let inner = function_at(&bytecode, 0);
        assert_eq!(
            inner.instructions,
            instructions(vec![
                make(Opcode::GetFree, &[0]),
                make(Opcode::GetLocal, &[0]),
                make(Opcode::Add, &[]),
                make(Opcode::Return, &[]),
            ])
        );
        let outer = function_at(&bytecode, 1);
        assert_eq!(
            outer.instructions,
            instructions(vec![
                make(Opcode::GetLocal, &[0]),
                make(Opcode::Closure, &[0, 1]),
                make(Opcode::Return, &[]),
            ])
        );
        assert_eq!(
            bytecode.instructions,
            instructions(vec![make(Opcode::Closure, &[1, 0]), make(Opcode::Pop, &[])])
        );
    }

    #[test]
    fn bound_anonymous_function_recurses_through_current_closure() {
        let bytecode = compile_ok(vec![
            Stmt::var(
                "countDown",
                Expr::function(
                    &["x"],
                    vec![Stmt::expr(Expr::call(
                        Expr::ident("countDown"),
                        vec![Expr::binary(BinaryOp::Sub, Expr::ident("x"), Expr::number(1.0))],
                    ))],
                ),
            ),
            Stmt::expr(Expr::call(Expr::ident("countDown"), vec![Expr::number(1.0)])),
        ]);

        let function = function_at(&bytecode, 1);
        assert_eq!(function.name.as_deref(), Some("countDown"));
        assert_eq!(
            function.instructions,
            instructions(vec![
                make(Opcode::CurrentClosure, &[]),
                make(Opcode::GetLocal, &[0]),
                make(Opcode::Constant, &[0]),
                make(Opcode::Sub, &[]),
                make(Opcode::FunctionCall, &[1]),
                make(Opcode::Return, &[]),
            ])
        );
        assert_eq!(
            bytecode.instructions,
            instructions(vec![
                make(Opcode::Closure, &[1, 0]),
                make(Opcode::SetGlobal, &[0]),
                make(Opcode::GetGlobal, &[0]),
                make(Opcode::Constant, &[0]),
                make(Opcode::FunctionCall, &[1]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn builtins_load_by_registry_index() {
        let bytecode = compile_ok(vec![
            Stmt::expr(Expr::call(Expr::ident("len"), vec![Expr::array(vec![])])),
            Stmt::expr(Expr::call(
                Expr::ident("push"),
                vec![Expr::array(vec![]), Expr::number(1.0)],
            )),
        ]);
        assert_eq!(
            bytecode.instructions,
            instructions(vec![
                make(Opcode::GetBuiltin, &[0]),
                make(Opcode::Array, &[0]),
                make(Opcode::FunctionCall, &[1]),
                make(Opcode::Pop, &[]),
                make(Opcode::GetBuiltin, &[1]),
                make(Opcode::Array, &[0]),
                make(Opcode::Constant, &[0]),
                make(Opcode::FunctionCall, &[2]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn break_jumps_past_the_loop() {
        let bytecode = compile_ok(vec![Stmt::while_loop(
            Expr::boolean(true),
            vec![Stmt::BreakStatement {}],
        )]);
        assert_eq!(
            bytecode.instructions,
            instructions(vec![
                make(Opcode::True, &[]),
                make(Opcode::JumpNotTruthy, &[10]),
                make(Opcode::Jump, &[10]),
                make(Opcode::Jump, &[0]),
                make(Opcode::Null, &[]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn block_locals_get_distinct_slots() {
        let bytecode = compile_ok(vec![Stmt::expr(Expr::function(
            &[],
            vec![
                Stmt::var("a", Expr::number(1.0)),
                Stmt::block(vec![Stmt::var("b", Expr::number(2.0))]),
                Stmt::block(vec![Stmt::var("c", Expr::number(3.0))]),
            ],
        ))]);
        assert_eq!(function_at(&bytecode, 3).num_locals, 3);
    }

    #[test]
    fn dict_and_member_keys() {
        let bytecode = compile_ok(vec![Stmt::expr(Expr::member(
            Expr::dict(vec![(Expr::string("a"), Expr::number(1.0))]),
            "a",
        ))]);
        assert_eq!(
            bytecode.instructions,
            instructions(vec![
                make(Opcode::Constant, &[0]),
                make(Opcode::Constant, &[1]),
                make(Opcode::Dict, &[1]),
                make(Opcode::Constant, &[0]),
                make(Opcode::ObjectCall, &[]),
                make(Opcode::Pop, &[]),
            ])
        );
    }

    #[test]
    fn rejects_invalid_programs() {
        assert_eq!(
            compile_err(vec![
                Stmt::constant("a", Expr::number(1.0)),
                Stmt::expr(Expr::assign(AssignOp::Assign, "a", Expr::number(2.0))),
            ]),
            CompileError::ConstReassignment("a".to_string())
        );
        assert_eq!(
            compile_err(vec![Stmt::expr(Expr::ident("nope"))]),
            CompileError::UnresolvedIdentifier("nope".to_string())
        );
        assert_eq!(
            compile_err(vec![Stmt::BreakStatement {}]),
            CompileError::BreakOutsideLoop
        );
        assert_eq!(
            compile_err(vec![Stmt::ContinueStatement {}]),
            CompileError::ContinueOutsideLoop
        );
        assert_eq!(
            compile_err(vec![Stmt::ret(None)]),
            CompileError::ReturnOutsideFunction
        );
        assert_eq!(
            compile_err(vec![Stmt::decl(DeclKind::Const, "c", None)]),
            CompileError::ConstWithoutInitializer("c".to_string())
        );
        assert_eq!(
            compile_err(vec![Stmt::expr(Expr::call(
                Expr::ident("len"),
                vec![Expr::number(1.0), Expr::number(2.0)],
            ))]),
            CompileError::ArityMismatch {
                name: "len".to_string(),
                expected: 1,
                got: 2,
            }
        );
        assert_eq!(
            compile_err(vec![Stmt::expr(Expr::assign(
                AssignOp::Assign,
                "len",
                Expr::number(1.0)
            ))]),
            CompileError::InvalidAssignmentTarget("len".to_string())
        );
    }

    #[test]
    fn captured_variables_are_read_only() {
        let err = compile_err(vec![Stmt::expr(Expr::function(
            &["a"],
            vec![Stmt::expr(Expr::function(
                &[],
                vec![Stmt::expr(Expr::assign(
                    AssignOp::Assign,
                    "a",
                    Expr::number(1.0),
                ))],
            ))],
        ))]);
        assert_eq!(err, CompileError::InvalidAssignmentTarget("a".to_string()));
    }

    #[test]
    fn break_inside_nested_function_is_not_a_loop_break() {
        let err = compile_err(vec![Stmt::while_loop(
            Expr::boolean(true),
            vec![Stmt::expr(Expr::function(&[], vec![Stmt::BreakStatement {}]))],
        )]);
        assert_eq!(err, CompileError::BreakOutsideLoop);
    }

    #[test]
    fn too_many_parameters() {
        let names: Vec<String> = (0..256).map(|i| format!("p{i}")).collect();
        let params: Vec<&str> = names.iter().map(String::as_str).collect();
        let err = compile_err(vec![Stmt::function("f", &params, vec![])]);
        assert!(matches!(
            err,
            CompileError::LimitExceeded { what: "parameters", .. }
        ));
    }

    #[test]
    fn non_finite_literals_are_rejected() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = compile_err(vec![Stmt::expr(Expr::number(value))]);
            assert!(matches!(err, CompileError::MalformedLiteral(_)), "{value}");
        }
    }

    #[test]
    fn too_many_locals() {
        let body: Vec<Stmt> = (0..257)
            .map(|i| Stmt::var(&format!("v{i}"), Expr::null()))
            .collect();
        let err = compile_err(vec![Stmt::function("f", &[], body)]);
        assert_eq!(
            err,
            CompileError::LimitExceeded {
                what: "locals",
                limit: 256,
            }
        );
    }

    #[test]
    fn too_many_globals() {
        let mut symbols = SymbolTable::with_builtins();
        for i in 0..GLOBALS_SIZE {
            symbols.define(&format!("g{i}"), false);
        }
        let mut compiler = Compiler::new_with_state(symbols, Vec::new());
        let err = compiler
            .compile(&program(vec![Stmt::var("extra", Expr::number(1.0))]))
            .expect_err("globals are full");
        assert_eq!(
            err,
            CompileError::LimitExceeded {
                what: "globals",
                limit: GLOBALS_SIZE,
            }
        );
        assert!(compiler.symbols().lookup_current("g0").is_some());
    }

    #[test]
    fn too_many_constants() {
        let constants = (0..=MAX_U16_OPERAND)
            .map(|i| Value::Number(i as f64))
            .collect();
        let mut compiler = Compiler::new_with_state(SymbolTable::with_builtins(), constants);

        // Existing constants are reused, so a full pool still accepts them.
        compiler
            .compile(&program(vec![Stmt::expr(Expr::number(7.0))]))
            .expect("deduplicated constant");
        let err = compiler
            .compile(&program(vec![Stmt::expr(Expr::number(-1.0))]))
            .expect_err("pool is full");
        assert_eq!(
            err,
            CompileError::LimitExceeded {
                what: "constants",
                limit: MAX_U16_OPERAND + 1,
            }
        );
    }

    #[test]
    fn jump_past_two_byte_range() {
        let big_array = || Stmt::expr(Expr::array(vec![Expr::number(1.0); 30_000]));
        let err = compile_err(vec![Stmt::if_else(
            Expr::boolean(true),
            vec![big_array(), big_array(), big_array()],
            None,
        )]);
        assert!(matches!(err, CompileError::JumpOutOfRange(target) if target > MAX_U16_OPERAND));
    }

    #[test]
    fn dangling_jump_is_reported() {
        let mut compiler = Compiler::new();
        let _jump = compiler.emit_jump(Opcode::Jump);
        let err = compiler.compile(&program(vec![])).expect_err("unpatched");
        assert_eq!(err, CompileError::UnpatchedJump(0));
    }

    #[test]
    fn compilation_is_deterministic() {
        let body = vec![
            Stmt::var("a", Expr::number(1.0)),
            Stmt::function(
                "f",
                &["x"],
                vec![Stmt::ret(Some(Expr::binary(
                    BinaryOp::Mul,
                    Expr::ident("x"),
                    Expr::ident("a"),
                )))],
            ),
            Stmt::expr(Expr::call(Expr::ident("f"), vec![Expr::number(2.0)])),
        ];
        assert_eq!(compile_ok(body.clone()), compile_ok(body));
    }

    #[test]
    fn bytecode_survives_serialization() {
        let bytecode = compile_ok(vec![
            Stmt::function("id", &["x"], vec![Stmt::expr(Expr::ident("x"))]),
            Stmt::expr(Expr::call(Expr::ident("id"), vec![Expr::string("hi")])),
        ]);
        let bytes = bytecode.to_bytes().expect("serialize");
        let decoded = Bytecode::from_bytes(&bytes).expect("deserialize");
        assert_eq!(decoded, bytecode);
        assert!(Bytecode::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }
}
