use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tern_syntax::BUILTIN_TABLE;

use crate::error::RuntimeError;
use crate::value::Value;

/// Lines written by `log` when a VM captures its output instead of printing.
pub type OutputBuffer = Rc<RefCell<Vec<String>>>;

/// Native functions, in registry order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Builtin {
    Len,
    Push,
    Log,
}

impl Builtin {
    pub const ALL: [Builtin; 3] = [Builtin::Len, Builtin::Push, Builtin::Log];

    pub fn from_index(index: usize) -> Option<Self> {
        Builtin::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        BUILTIN_TABLE[self.index()].name
    }

    pub fn call(
        self,
        args: &[Value],
        output: Option<&OutputBuffer>,
    ) -> Result<Value, RuntimeError> {
        if let Some(expected) = BUILTIN_TABLE[self.index()].arity {
            if args.len() != expected {
                return Err(RuntimeError::WrongArgumentCount {
                    expected,
                    got: args.len(),
                });
            }
        }
        match self {
            Builtin::Len => len(&args[0]),
            Builtin::Push => push(&args[0], &args[1]),
            Builtin::Log => {
                let line = args
                    .iter()
                    .map(Value::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                match output {
                    Some(buffer) => buffer.borrow_mut().push(line),
                    None => println!("{line}"),
                }
                Ok(Value::Null)
            }
        }
    }
}

fn len(value: &Value) -> Result<Value, RuntimeError> {
    match value {
        Value::Array(items) => Ok(Value::Number(items.len() as f64)),
        Value::String(text) => Ok(Value::Number(text.chars().count() as f64)),
        other => Err(RuntimeError::BuiltinArgument {
            name: "len",
            message: format!("argument not supported, got {}", other.type_name()),
        }),
    }
}

fn push(target: &Value, value: &Value) -> Result<Value, RuntimeError> {
    match target {
        Value::Array(items) => {
            let mut extended = Vec::with_capacity(items.len() + 1);
            extended.extend(items.iter().cloned());
            extended.push(value.clone());
            Ok(Value::array(extended))
        }
        other => Err(RuntimeError::BuiltinArgument {
            name: "push",
            message: format!("first argument must be array, got {}", other.type_name()),
        }),
    }
}
