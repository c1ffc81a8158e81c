//! Runtime values produced by query execution.

use crate::types::Person;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::sync::Arc;

/// A value produced while evaluating a query.
///
/// The shape of a query result is decided by the expression, so results are
/// kept as a tree of these rather than a fixed schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    /// A dataset record, shared with the source it came from.
    Record(Arc<Person>),
    /// An anonymous projection; field order is declaration order.
    Shape(Vec<(String, Value)>),
    Sequence(Vec<Value>),
}

impl Value {
    /// Name of the runtime type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "Bool",
            Value::Integer(_) => "Int",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::Record(_) => "Person",
            Value::Shape(_) => "shape",
            Value::Sequence(_) => "sequence",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Equality with numeric widening, so `1 == 1.0`.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => {
                (*a as f64) == *b
            }
            (Value::Shape(a), Value::Shape(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((na, va), (nb, vb))| na == nb && va.loosely_equals(vb))
            }
            (Value::Sequence(a), Value::Sequence(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loosely_equals(y))
            }
            _ => self == other,
        }
    }

    /// Total order used for sorting and `Min`/`Max`: nulls first, then
    /// numbers, strings and booleans.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Bool(_) => 1,
                Value::Integer(_) | Value::Float(_) => 2,
                Value::String(_) => 3,
                Value::Record(_) => 4,
                Value::Shape(_) => 5,
                Value::Sequence(_) => 6,
            }
        }

        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (a, b) if rank(a) == 2 && rank(b) == 2 => {
                let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                x.total_cmp(&y)
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Record(a), Value::Record(b)) => a.index.cmp(&b.index),
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(v) => write!(f, "{}", if *v { "True" } else { "False" }),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(v) => f.write_str(v),
            Value::Record(p) => write!(f, "{{ Name = {}, Index = {} }}", p.name, p.index),
            Value::Shape(fields) => {
                f.write_str("{ ")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name} = {value}")?;
                }
                f.write_str(" }")
            }
            Value::Sequence(items) => write!(f, "[{} items]", items.len()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::Integer(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::String(v) => serializer.serialize_str(v),
            Value::Record(p) => (**p).serialize(serializer),
            Value::Shape(fields) => {
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (name, value) in fields {
                    map.serialize_entry(&camel_case(name), value)?;
                }
                map.end()
            }
            Value::Sequence(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

/// Lower-case the leading capital run of a member name (`Name` → `name`,
/// `ID` → `id`, `URLPath` → `urlPath`).
pub fn camel_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len());
    for (i, c) in chars.iter().enumerate() {
        let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
        if c.is_uppercase() && !(i > 0 && next_is_lower) {
            out.extend(c.to_lowercase());
        } else {
            out.push_str(&chars[i..].iter().collect::<String>());
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camel_case() {
        assert_eq!(camel_case("Name"), "name");
        assert_eq!(camel_case("Index"), "index");
        assert_eq!(camel_case("ID"), "id");
        assert_eq!(camel_case("URLPath"), "urlPath");
        assert_eq!(camel_case("double"), "double");
        assert_eq!(camel_case(""), "");
    }

    #[test]
    fn test_serialize_shape_preserves_order() {
        let v = Value::Shape(vec![
            ("Name".to_string(), Value::String("Minion #1".into())),
            ("Index".to_string(), Value::Integer(1)),
        ]);
        assert_eq!(
            serde_json::to_string(&v).unwrap(),
            r#"{"name":"Minion #1","index":1}"#
        );
    }

    #[test]
    fn test_serialize_sequence_of_records() {
        let v = Value::Sequence(vec![Value::Record(Arc::new(Person::new(2))), Value::Null]);
        assert_eq!(
            serde_json::to_string(&v).unwrap(),
            r#"[{"name":"Minion #2","index":2},null]"#
        );
    }

    #[test]
    fn test_loose_equality_widens_numbers() {
        assert!(Value::Integer(2).loosely_equals(&Value::Float(2.0)));
        assert!(!Value::Integer(2).loosely_equals(&Value::String("2".into())));
        assert!(Value::Null.loosely_equals(&Value::Null));
    }

    #[test]
    fn test_sort_cmp_nulls_first() {
        let mut values = vec![
            Value::Integer(3),
            Value::Null,
            Value::Float(1.5),
            Value::Integer(-1),
        ];
        values.sort_by(|a, b| a.sort_cmp(b));
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Integer(-1),
                Value::Float(1.5),
                Value::Integer(3)
            ]
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Bool(true).to_string(), "True");
        assert_eq!(Value::Null.to_string(), "");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
    }
}
