use std::collections::BTreeMap;
use std::fmt;

/// A value from the render data context, or produced by evaluating an expression.
#[derive(Debug, Clone)]
pub enum RuntimeValue {
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    List(Vec<RuntimeValue>),
    Record(BTreeMap<String, RuntimeValue>),
}

impl RuntimeValue {
    pub fn record<K: Into<String>>(fields: impl IntoIterator<Item = (K, RuntimeValue)>) -> Self {
        RuntimeValue::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn string(s: impl Into<String>) -> Self {
        RuntimeValue::String(s.into())
    }

    pub fn is_truthy(&self) -> bool {
        !self.is_falsy()
    }

    pub fn is_falsy(&self) -> bool {
        match self {
            RuntimeValue::Null => true,
            RuntimeValue::Boolean(b) => !b,
            RuntimeValue::Number(n) => *n == 0.0 || n.is_nan(),
            RuntimeValue::String(s) => s.is_empty(),
            RuntimeValue::List(items) => items.is_empty(),
            RuntimeValue::Record(_) => false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RuntimeValue::Null => "Null",
            RuntimeValue::Boolean(_) => "Boolean",
            RuntimeValue::Number(_) => "Number",
            RuntimeValue::String(_) => "String",
            RuntimeValue::List(_) => "List",
            RuntimeValue::Record(_) => "Record",
        }
    }

    /// Field of a record; None for anything else.
    pub fn field(&self, name: &str) -> Option<&RuntimeValue> {
        match self {
            RuntimeValue::Record(fields) => fields.get(name),
            _ => None,
        }
    }

    /// Numeric view used by comparisons: numbers, and strings that parse as numbers.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            RuntimeValue::Number(n) => Some(*n),
            RuntimeValue::String(s) => s.trim().parse::<f64>().ok(),
            RuntimeValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

impl fmt::Display for RuntimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeValue::Null => Ok(()),
            RuntimeValue::Boolean(b) => write!(f, "{}", if *b { "1" } else { "" }),
            RuntimeValue::Number(n) => {
                if n.is_finite() && *n == n.floor() && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            RuntimeValue::String(s) => write!(f, "{}", s),
            RuntimeValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "{}", parts.join(", "))
            }
            RuntimeValue::Record(fields) => {
                let parts: Vec<String> = fields.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
        }
    }
}

impl PartialEq for RuntimeValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RuntimeValue::Null, RuntimeValue::Null) => true,
            (RuntimeValue::Boolean(a), RuntimeValue::Boolean(b)) => a == b,
            (RuntimeValue::Number(a), RuntimeValue::Number(b)) => a == b, // NaN != NaN per IEEE 754
            (RuntimeValue::String(a), RuntimeValue::String(b)) => a == b,
            (RuntimeValue::List(a), RuntimeValue::List(b)) => a == b,
            (RuntimeValue::Record(a), RuntimeValue::Record(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for RuntimeValue {
    fn from(s: &str) -> Self {
        RuntimeValue::String(s.to_string())
    }
}

impl From<String> for RuntimeValue {
    fn from(s: String) -> Self {
        RuntimeValue::String(s)
    }
}

impl From<f64> for RuntimeValue {
    fn from(n: f64) -> Self {
        RuntimeValue::Number(n)
    }
}

impl From<i64> for RuntimeValue {
    fn from(n: i64) -> Self {
        RuntimeValue::Number(n as f64)
    }
}

impl From<bool> for RuntimeValue {
    fn from(b: bool) -> Self {
        RuntimeValue::Boolean(b)
    }
}

impl From<Vec<RuntimeValue>> for RuntimeValue {
    fn from(items: Vec<RuntimeValue>) -> Self {
        RuntimeValue::List(items)
    }
}
