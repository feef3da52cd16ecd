//! Runtime values with JavaScript-like semantics and a serde_json bridge.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<RefCell<BTreeMap<String, Value>>>),
    Function(Rc<FunctionValue>),
}

#[derive(Debug)]
pub struct FunctionValue {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<crate::ast::Stmt>,
}

impl Value {
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn object(fields: BTreeMap<String, Value>) -> Self {
        Value::Object(Rc::new(RefCell::new(fields)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) | Value::Function(_) => true,
        }
    }

    /// `===` semantics. Arrays and objects compare by reference.
    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// `==` semantics, limited to number/string/bool coercion.
    pub fn loose_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Str(b)) => b.parse::<f64>().map_or(false, |n| *a == n),
            (Value::Str(a), Value::Number(b)) => a.parse::<f64>().map_or(false, |n| n == *b),
            (Value::Bool(a), b) => Value::Number(if *a { 1.0 } else { 0.0 }).loose_equals(b),
            (a, Value::Bool(b)) => a.loose_equals(&Value::Number(if *b { 1.0 } else { 0.0 })),
            _ => self.strict_equals(other),
        }
    }

    /// String form used by `+` concatenation and host calls.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Str(s) => s.clone(),
            Value::Array(items) => {
                let inner: Vec<String> = items
                    .borrow()
                    .iter()
                    .map(|v| v.to_display_string())
                    .collect();
                inner.join(",")
            }
            Value::Object(_) => "[object Object]".to_string(),
            Value::Function(f) => format!("function {}", f.name),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Functions convert to null; they have no JSON form.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null | Value::Function(_) => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => {
                // Integral doubles serialize as JSON integers, the way a
                // JS engine would print them.
                if n.fract() == 0.0 && n.is_finite() && n.abs() < 9e15 {
                    serde_json::Value::Number(serde_json::Number::from(*n as i64))
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                }
            }
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.borrow().iter().map(|v| v.to_json()).collect())
            }
            Value::Object(fields) => serde_json::Value::Object(
                fields
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

/// Integral doubles print without a trailing `.0`, as JS does.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(Value::Number(-1.0).is_truthy());
        assert!(Value::array(vec![]).is_truthy());
    }

    #[test]
    fn test_strict_vs_loose_equality() {
        let one = Value::Number(1.0);
        let one_str = Value::Str("1".into());
        assert!(!one.strict_equals(&one_str));
        assert!(one.loose_equals(&one_str));
        assert!(Value::Bool(true).loose_equals(&one));
    }

    #[test]
    fn test_reference_equality_for_arrays() {
        let a = Value::array(vec![Value::Number(1.0)]);
        let b = Value::array(vec![Value::Number(1.0)]);
        assert!(!a.strict_equals(&b));
        assert!(a.strict_equals(&a.clone()));
    }

    #[test]
    fn test_json_round_trip() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"value": 21, "tags": ["a", "b"], "ok": true}"#).unwrap();
        let value = Value::from_json(&json);
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_number(42.0), "42");
        assert_eq!(format_number(1.5), "1.5");
    }
}
