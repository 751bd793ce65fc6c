//! Syntax tree consumed by the tern compiler.
//!
//! Node kinds follow the ESTree/Babel shape so that trees produced by an
//! external JavaScript-style parser can be fed in as JSON. Every node kind is a
//! variant of a closed enum tagged by its `"type"` field; an unknown kind is
//! rejected when the tree is deserialised.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    pub body: Vec<Stmt>,
}

impl Program {
    pub fn new(body: Vec<Stmt>) -> Self {
        Self { body }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ident {
    pub name: String,
}

impl Ident {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Brace-delimited statement list used as a function body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Block {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclKind {
    Var,
    Let,
    Const,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDeclarator {
    pub id: Ident,
    #[serde(default)]
    pub init: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ForInit {
    Statement(Box<Stmt>),
    Expression(Expr),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Stmt {
    VariableDeclaration {
        kind: DeclKind,
        declarations: Vec<VariableDeclarator>,
    },
    ExpressionStatement {
        expression: Expr,
    },
    BlockStatement {
        body: Vec<Stmt>,
    },
    IfStatement {
        test: Expr,
        consequent: Box<Stmt>,
        #[serde(default)]
        alternate: Option<Box<Stmt>>,
    },
    WhileStatement {
        test: Expr,
        body: Box<Stmt>,
    },
    ForStatement {
        #[serde(default)]
        init: Option<ForInit>,
        #[serde(default)]
        test: Option<Expr>,
        #[serde(default)]
        update: Option<Expr>,
        body: Box<Stmt>,
    },
    ReturnStatement {
        #[serde(default)]
        argument: Option<Expr>,
    },
    BreakStatement {},
    ContinueStatement {},
    FunctionDeclaration {
        id: Ident,
        params: Vec<Ident>,
        body: Block,
    },
    EmptyStatement {},
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Expr {
    Identifier {
        name: String,
    },
    NumericLiteral {
        value: f64,
    },
    StringLiteral {
        value: String,
    },
    BooleanLiteral {
        value: bool,
    },
    NullLiteral {},
    BinaryExpression {
        operator: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    LogicalExpression {
        operator: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    UnaryExpression {
        operator: UnaryOp,
        argument: Box<Expr>,
    },
    AssignmentExpression {
        operator: AssignOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    CallExpression {
        callee: Box<Expr>,
        arguments: Vec<Expr>,
    },
    ArrayExpression {
        elements: Vec<Expr>,
    },
    ObjectExpression {
        properties: Vec<ObjectProperty>,
    },
    MemberExpression {
        object: Box<Expr>,
        property: Box<Expr>,
        #[serde(default)]
        computed: bool,
    },
    FunctionExpression {
        #[serde(default)]
        id: Option<Ident>,
        params: Vec<Ident>,
        body: Block,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectProperty {
    pub key: Expr,
    pub value: Expr,
    #[serde(default)]
    pub computed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Sub,
    #[serde(rename = "*")]
    Mul,
    #[serde(rename = "/")]
    Div,
    #[serde(rename = "%")]
    Mod,
    #[serde(rename = "==", alias = "===")]
    Eq,
    #[serde(rename = "!=", alias = "!==")]
    Neq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    #[serde(rename = "&&")]
    And,
    #[serde(rename = "||")]
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    #[serde(rename = "-")]
    Neg,
    #[serde(rename = "!")]
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignOp {
    #[serde(rename = "=")]
    Assign,
    #[serde(rename = "+=")]
    AddAssign,
    #[serde(rename = "-=")]
    SubAssign,
    #[serde(rename = "*=")]
    MulAssign,
    #[serde(rename = "/=")]
    DivAssign,
    #[serde(rename = "%=")]
    ModAssign,
}

impl AssignOp {
    /// The arithmetic operator a compound assignment applies, if any.
    pub fn binary_op(self) -> Option<BinaryOp> {
        match self {
            AssignOp::Assign => None,
            AssignOp::AddAssign => Some(BinaryOp::Add),
            AssignOp::SubAssign => Some(BinaryOp::Sub),
            AssignOp::MulAssign => Some(BinaryOp::Mul),
            AssignOp::DivAssign => Some(BinaryOp::Div),
            AssignOp::ModAssign => Some(BinaryOp::Mod),
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Neq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
        };
        f.write_str(text)
    }
}

impl fmt::Display for AssignOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.binary_op() {
            Some(op) => write!(f, "{op}="),
            None => f.write_str("="),
        }
    }
}

impl Stmt {
    pub fn expr(expression: Expr) -> Self {
        Stmt::ExpressionStatement { expression }
    }

    pub fn decl(kind: DeclKind, name: &str, init: Option<Expr>) -> Self {
        Stmt::VariableDeclaration {
            kind,
            declarations: vec![VariableDeclarator {
                id: Ident::new(name),
                init,
            }],
        }
    }

    pub fn var(name: &str, init: Expr) -> Self {
        Stmt::decl(DeclKind::Var, name, Some(init))
    }

    pub fn constant(name: &str, init: Expr) -> Self {
        Stmt::decl(DeclKind::Const, name, Some(init))
    }

    pub fn block(body: Vec<Stmt>) -> Self {
        Stmt::BlockStatement { body }
    }

    pub fn if_else(test: Expr, consequent: Vec<Stmt>, alternate: Option<Vec<Stmt>>) -> Self {
        Stmt::IfStatement {
            test,
            consequent: Box::new(Stmt::block(consequent)),
            alternate: alternate.map(|body| Box::new(Stmt::block(body))),
        }
    }

    pub fn while_loop(test: Expr, body: Vec<Stmt>) -> Self {
        Stmt::WhileStatement {
            test,
            body: Box::new(Stmt::block(body)),
        }
    }

    pub fn ret(argument: Option<Expr>) -> Self {
        Stmt::ReturnStatement { argument }
    }

    pub fn function(name: &str, params: &[&str], body: Vec<Stmt>) -> Self {
        Stmt::FunctionDeclaration {
            id: Ident::new(name),
            params: params.iter().copied().map(Ident::new).collect(),
            body: Block { body },
        }
    }
}

impl Expr {
    pub fn ident(name: &str) -> Self {
        Expr::Identifier {
            name: name.to_string(),
        }
    }

    pub fn number(value: f64) -> Self {
        Expr::NumericLiteral { value }
    }

    pub fn string(value: &str) -> Self {
        Expr::StringLiteral {
            value: value.to_string(),
        }
    }

    pub fn boolean(value: bool) -> Self {
        Expr::BooleanLiteral { value }
    }

    pub fn null() -> Self {
        Expr::NullLiteral {}
    }

    pub fn binary(operator: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::BinaryExpression {
            operator,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn logical(operator: LogicalOp, left: Expr, right: Expr) -> Self {
        Expr::LogicalExpression {
            operator,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn unary(operator: UnaryOp, argument: Expr) -> Self {
        Expr::UnaryExpression {
            operator,
            argument: Box::new(argument),
        }
    }

    pub fn assign(operator: AssignOp, name: &str, right: Expr) -> Self {
        Expr::AssignmentExpression {
            operator,
            left: Box::new(Expr::ident(name)),
            right: Box::new(right),
        }
    }

    pub fn call(callee: Expr, arguments: Vec<Expr>) -> Self {
        Expr::CallExpression {
            callee: Box::new(callee),
            arguments,
        }
    }

    pub fn array(elements: Vec<Expr>) -> Self {
        Expr::ArrayExpression { elements }
    }

    pub fn dict(entries: Vec<(Expr, Expr)>) -> Self {
        Expr::ObjectExpression {
            properties: entries
                .into_iter()
                .map(|(key, value)| ObjectProperty {
                    key,
                    value,
                    computed: true,
                })
                .collect(),
        }
    }

    pub fn index(object: Expr, index: Expr) -> Self {
        Expr::MemberExpression {
            object: Box::new(object),
            property: Box::new(index),
            computed: true,
        }
    }

    pub fn member(object: Expr, name: &str) -> Self {
        Expr::MemberExpression {
            object: Box::new(object),
            property: Box::new(Expr::ident(name)),
            computed: false,
        }
    }

    pub fn function(params: &[&str], body: Vec<Stmt>) -> Self {
        Expr::FunctionExpression {
            id: None,
            params: params.iter().copied().map(Ident::new).collect(),
            body: Block { body },
        }
    }

    pub fn named_function(name: &str, params: &[&str], body: Vec<Stmt>) -> Self {
        Expr::FunctionExpression {
            id: Some(Ident::new(name)),
            params: params.iter().copied().map(Ident::new).collect(),
            body: Block { body },
        }
    }
}

/// Canonical metadata for a single builtin function.
///
/// Table order is significant: a builtin's position is the operand the
/// compiler emits to load it, and the VM maps the same position back to its
/// native implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinMeta {
    pub name: &'static str,
    /// Required argument count; `None` for variadic builtins.
    pub arity: Option<usize>,
}

pub static BUILTIN_TABLE: &[BuiltinMeta] = &[
    BuiltinMeta {
        name: "len",
        arity: Some(1),
    },
    BuiltinMeta {
        name: "push",
        arity: Some(2),
    },
    BuiltinMeta {
        name: "log",
        arity: None,
    },
];

/// Look up a builtin by name, returning its registry index.
pub fn lookup_builtin(name: &str) -> Option<(usize, &'static BuiltinMeta)> {
    BUILTIN_TABLE
        .iter()
        .enumerate()
        .find(|(_, meta)| meta.name == name)
}
