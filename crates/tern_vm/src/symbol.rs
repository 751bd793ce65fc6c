//! Lexical scope resolution.
//!
//! Scopes form an arena linked by parent indices. Scopes are strictly nested,
//! so the current scope is always the last one in the arena and leaving it
//! pops it.
//!
//! Slot indices are handed out by the nearest *owning* scope (the global
//! scope or a function scope). Block scopes only hold names, which keeps every
//! local of a function in a distinct frame slot however deeply its blocks nest.

use std::collections::HashMap;

use tern_syntax::BUILTIN_TABLE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolScope {
    Global,
    Local,
    Free,
    Builtin,
    /// Self-reference of a named function, loaded with `CurrentClosure`.
    Function,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub scope: SymbolScope,
    pub index: usize,
    pub constant: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Global,
    Function,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeId(usize);

#[derive(Debug, Clone)]
struct Scope {
    kind: ScopeKind,
    parent: Option<ScopeId>,
    store: HashMap<String, Symbol>,
    free_symbols: Vec<Symbol>,
    num_definitions: usize,
}

impl Scope {
    fn new(kind: ScopeKind, parent: Option<ScopeId>) -> Self {
        Self {
            kind,
            parent,
            store: HashMap::new(),
            free_symbols: Vec::new(),
            num_definitions: 0,
        }
    }

    fn owns_slots(&self) -> bool {
        self.kind != ScopeKind::Block
    }
}

/// What a function scope leaves behind for the compiler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeftScope {
    /// Captured symbols, as they resolve in the enclosing scope, in capture order.
    pub free_symbols: Vec<Symbol>,
    pub num_definitions: usize,
}

#[derive(Debug, Clone)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
    builtins: HashMap<String, Symbol>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope::new(ScopeKind::Global, None)],
            builtins: HashMap::new(),
        }
    }

    /// A global table with every registry builtin defined.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        for (index, meta) in BUILTIN_TABLE.iter().enumerate() {
            table.define_builtin(index, meta.name);
        }
        table
    }

    fn current(&self) -> ScopeId {
        ScopeId(self.scopes.len() - 1)
    }

    fn owner(&self, mut id: ScopeId) -> ScopeId {
        while !self.scopes[id.0].owns_slots() {
            match self.scopes[id.0].parent {
                Some(parent) => id = parent,
                None => break,
            }
        }
        id
    }

    pub fn enter_scope(&mut self, kind: ScopeKind) {
        let parent = self.current();
        self.scopes.push(Scope::new(kind, Some(parent)));
    }

    /// Pops the current scope. Leaving the global scope is a no-op.
    pub fn leave_scope(&mut self) -> LeftScope {
        if self.scopes.len() == 1 {
            return LeftScope::default();
        }
        match self.scopes.pop() {
            Some(scope) if scope.kind == ScopeKind::Function => LeftScope {
                free_symbols: scope.free_symbols,
                num_definitions: scope.num_definitions,
            },
            _ => LeftScope::default(),
        }
    }

    /// The binding `name` has in the current scope itself, if any.
    pub fn lookup_current(&self, name: &str) -> Option<&Symbol> {
        self.scopes[self.current().0].store.get(name)
    }

    /// Binds `name` in the current scope. Redeclaring a Global or Local that
    /// already lives in this scope reuses its slot.
    pub fn define(&mut self, name: &str, constant: bool) -> Symbol {
        let current = self.current();
        if let Some(existing) = self.scopes[current.0].store.get_mut(name) {
            if matches!(existing.scope, SymbolScope::Global | SymbolScope::Local) {
                existing.constant = constant;
                return existing.clone();
            }
        }

        let owner = self.owner(current);
        let owner_scope = &mut self.scopes[owner.0];
        let scope = match owner_scope.kind {
            ScopeKind::Global => SymbolScope::Global,
            _ => SymbolScope::Local,
        };
        let symbol = Symbol {
            name: name.to_string(),
            scope,
            index: owner_scope.num_definitions,
            constant,
        };
        owner_scope.num_definitions += 1;
        self.scopes[current.0]
            .store
            .insert(name.to_string(), symbol.clone());
        symbol
    }

    pub fn define_function_name(&mut self, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Function,
            index: 0,
            constant: true,
        };
        let current = self.current();
        self.scopes[current.0]
            .store
            .insert(name.to_string(), symbol.clone());
        symbol
    }

    pub fn define_builtin(&mut self, index: usize, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Builtin,
            index,
            constant: true,
        };
        self.builtins.insert(name.to_string(), symbol.clone());
        symbol
    }

    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        let current = self.current();
        self.resolve_in(current, name)
    }

    fn resolve_in(&mut self, id: ScopeId, name: &str) -> Option<Symbol> {
        if let Some(symbol) = self.scopes[id.0].store.get(name) {
            return Some(symbol.clone());
        }
        let Some(parent) = self.scopes[id.0].parent else {
            return self.builtins.get(name).cloned();
        };
        let symbol = self.resolve_in(parent, name)?;
        if matches!(symbol.scope, SymbolScope::Global | SymbolScope::Builtin)
            || self.scopes[id.0].kind != ScopeKind::Function
        {
            return Some(symbol);
        }
        Some(self.define_free(id, symbol))
    }

    fn define_free(&mut self, id: ScopeId, original: Symbol) -> Symbol {
        let scope = &mut self.scopes[id.0];
        let symbol = Symbol {
            name: original.name.clone(),
            scope: SymbolScope::Free,
            index: scope.free_symbols.len(),
            constant: original.constant,
        };
        scope.free_symbols.push(original);
        scope.store.insert(symbol.name.clone(), symbol.clone());
        symbol
    }

    /// Number of global slots handed out so far.
    pub fn num_globals(&self) -> usize {
        self.scopes[0].num_definitions
    }
}
