use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::builtins::Builtin;
use crate::code::Instructions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledFunction {
    pub instructions: Instructions,
    pub num_locals: usize,
    pub num_params: usize,
    #[serde(default)]
    pub name: Option<String>,
}

/// A compiled function paired with the values it captured when it was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Closure {
    pub function: Rc<CompiledFunction>,
    pub free: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Number(f64),
    String(Rc<str>),
    Boolean(bool),
    Null,
    Array(Rc<Vec<Value>>),
    Dict(Rc<IndexMap<DictKey, Value>>),
    CompiledFunction(Rc<CompiledFunction>),
    Closure(Rc<Closure>),
    Builtin(Builtin),
}

/// Hashable projection of a [`Value`] used to key dictionaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DictKey {
    Number(u64),
    String(Rc<str>),
    Boolean(bool),
    Null,
    Array(Vec<DictKey>),
}

impl DictKey {
    /// Returns `None` for values that cannot key a dictionary.
    pub fn try_from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => Some(DictKey::Number(number_key_bits(*number))),
            Value::String(text) => Some(DictKey::String(text.clone())),
            Value::Boolean(flag) => Some(DictKey::Boolean(*flag)),
            Value::Null => Some(DictKey::Null),
            Value::Array(items) => {
                let mut converted = Vec::with_capacity(items.len());
                for item in items.iter() {
                    converted.push(DictKey::try_from_value(item)?);
                }
                Some(DictKey::Array(converted))
            }
            Value::Dict(_)
            | Value::CompiledFunction(_)
            | Value::Closure(_)
            | Value::Builtin(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            DictKey::Number(bits) => Value::Number(f64::from_bits(*bits)),
            DictKey::String(text) => Value::String(text.clone()),
            DictKey::Boolean(flag) => Value::Boolean(*flag),
            DictKey::Null => Value::Null,
            DictKey::Array(items) => {
                Value::Array(Rc::new(items.iter().map(DictKey::to_value).collect()))
            }
        }
    }
}

// 0.0 and -0.0 compare equal as values, so they must share a key; every NaN
// collapses to one key.
fn number_key_bits(number: f64) -> u64 {
    if number == 0.0 {
        0.0f64.to_bits()
    } else if number.is_nan() {
        f64::NAN.to_bits()
    } else {
        number.to_bits()
    }
}

impl Value {
    pub fn string(text: &str) -> Self {
        Value::String(Rc::from(text))
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(items))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Boolean(_) => "boolean",
            Value::Null => "null",
            Value::Array(_) => "array",
            Value::Dict(_) => "dict",
            Value::CompiledFunction(_) => "function",
            Value::Closure(_) => "closure",
            Value::Builtin(_) => "builtin",
        }
    }

    /// Only `false` and `null` are falsy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Boolean(false) | Value::Null)
    }
}

/// Debug-style rendering: strings are quoted.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::String(text) => format!("{text:?}"),
        other => other.to_string(),
    }
}

fn format_number(number: f64) -> String {
    if number.is_nan() {
        "NaN".to_string()
    } else if number.is_infinite() {
        if number > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if number == number.trunc() && number.abs() < 1e15 {
        format!("{}", number as i64)
    } else {
        number.to_string()
    }
}

/// Display form, as written by `log`: top-level strings are unquoted.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(number) => f.write_str(&format_number(*number)),
            Value::String(text) => f.write_str(text),
            Value::Boolean(flag) => write!(f, "{flag}"),
            Value::Null => f.write_str("null"),
            Value::Array(items) => {
                let items = items.iter().map(format_value).collect::<Vec<_>>();
                write!(f, "[{}]", items.join(", "))
            }
            Value::Dict(entries) => {
                let entries = entries
                    .iter()
                    .map(|(key, value)| {
                        format!("{}: {}", format_value(&key.to_value()), format_value(value))
                    })
                    .collect::<Vec<_>>();
                write!(f, "{{{}}}", entries.join(", "))
            }
            Value::CompiledFunction(function) => match &function.name {
                Some(name) => write!(f, "<function {name}>"),
                None => f.write_str("<function>"),
            },
            Value::Closure(closure) => match &closure.function.name {
                Some(name) => write!(f, "<closure {name}>"),
                None => f.write_str("<closure>"),
            },
            Value::Builtin(builtin) => write!(f, "<builtin {}>", builtin.name()),
        }
    }
}
