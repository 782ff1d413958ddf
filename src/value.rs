//! Dynamic values seen by template expressions.

use crate::codegen::Function;
use crate::error::EvalError;
use crate::eval::Scope;
use crate::template::{Instance, Template};
use indexmap::IndexMap;
use std::fmt;
use std::rc::{Rc, Weak};

pub type NativeFn = dyn Fn(&[Value]) -> Result<Value, EvalError>;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    /// Lists and tuples.
    List(Rc<Vec<Value>>),
    Dict(Rc<IndexMap<String, Value>>),
    Callable(Callable),
    Template(Template),
    Instance(Instance),
}

/// Something an expression can call.
#[derive(Clone)]
pub struct Callable(pub(crate) CallableKind);

#[derive(Clone)]
pub(crate) enum CallableKind {
    Builtin(&'static str),
    Native(Rc<NativeFn>),
    /// A builtin method together with its receiver, e.g. `', '.join`.
    Method(Box<Value>, Rc<str>),
    /// A template function bound to the instance that owns it.
    Bound(Instance, Rc<Function>),
    /// A function defined inside another function body.
    Closure(Rc<Closure>),
}

pub(crate) struct Closure {
    pub function: Rc<Function>,
    pub instance: Instance,
    pub scope: Weak<Scope>,
}

impl Callable {
    pub fn name(&self) -> &str {
        match &self.0 {
            CallableKind::Builtin(name) => name,
            CallableKind::Native(_) => "<native>",
            CallableKind::Method(_, name) => name,
            CallableKind::Bound(_, function) => &function.name,
            CallableKind::Closure(closure) => &closure.function.name,
        }
    }
}

impl Value {
    /// Wrap a Rust closure so templates can call it.
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, EvalError> + 'static,
    {
        Value::Callable(Callable(CallableKind::Native(Rc::new(f))))
    }

    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::List(Rc::new(items.into_iter().map(Into::into).collect()))
    }

    pub fn dict<I, K, V>(items: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Value::Dict(Rc::new(
            items.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        ))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Callable(_) => "function",
            Value::Template(_) => "template",
            Value::Instance(_) => "instance",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Dict(map) => !map.is_empty(),
            Value::Callable(_) | Value::Template(_) | Value::Instance(_) => true,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            other => other.as_int().map(|i| i as f64),
        }
    }

    /// Items of an iterable value: list elements, dict keys or string
    /// characters.
    pub fn iter_items(&self) -> Result<Vec<Value>, EvalError> {
        match self {
            Value::List(items) => Ok(items.as_ref().clone()),
            Value::Dict(map) => Ok(map.keys().map(|k| Value::from(k.as_str())).collect()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::from(c.to_string())).collect()),
            other => Err(EvalError::Type(format!(
                "'{}' object is not iterable",
                other.type_name()
            ))),
        }
    }

    /// Recursively expand nested lists into their leaves, in order.
    /// `None` and empty strings produce nothing.
    pub fn flatten_into(&self, out: &mut Vec<Value>) {
        match self {
            Value::None => {}
            Value::Str(s) if s.is_empty() => {}
            Value::List(items) => items.iter().for_each(|item| item.flatten_into(out)),
            leaf => out.push(leaf.clone()),
        }
    }

    /// Python-style `repr`.
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            other => other.to_string(),
        }
    }
}

fn write_float(f: &mut fmt::Formatter<'_>, x: f64) -> fmt::Result {
    if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 {
        write!(f, "{x:.1}")
    } else if x.is_nan() {
        f.write_str("nan")
    } else if x.is_infinite() {
        f.write_str(if x > 0.0 { "inf" } else { "-inf" })
    } else {
        write!(f, "{x}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write_float(f, *x),
            Value::Str(s) => f.write_str(s),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    f.write_str(&item.repr())?;
                }
                f.write_str("]")
            }
            Value::Dict(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "'{}': {}", k, v.repr())?;
                }
                f.write_str("}")
            }
            Value::Callable(c) => write!(f, "<function {}>", c.name()),
            Value::Template(t) => write!(f, "<template {}>", t.name()),
            Value::Instance(i) => write!(f, "<instance of {}>", i.template().name()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (
                Value::Bool(_) | Value::Int(_) | Value::Float(_),
                Value::Bool(_) | Value::Int(_) | Value::Float(_),
            ) => self.as_f64() == other.as_f64(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => a == b,
            (Value::Template(a), Value::Template(b)) => a.ptr_eq(b),
            (Value::Instance(a), Value::Instance(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i.into())
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        i64::try_from(i).map(Value::Int).unwrap_or(Value::Float(i as f64))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s.into())
    }
}

impl From<Rc<str>> for Value {
    fn from(s: Rc<str>) -> Self {
        Value::Str(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::list(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::None, Into::into)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(map: IndexMap<String, Value>) -> Self {
        Value::Dict(Rc::new(map))
    }
}

impl From<Template> for Value {
    fn from(t: Template) -> Self {
        Value::Template(t)
    }
}

impl From<Instance> for Value {
    fn from(i: Instance) -> Self {
        Value::Instance(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattening_is_recursive_and_skips_empty() {
        let nested = Value::list(vec![
            Value::list(vec!["a", "b"]),
            Value::from("c"),
            Value::None,
            Value::from(""),
            Value::list(Vec::<Value>::new()),
        ]);
        let mut out = Vec::new();
        nested.flatten_into(&mut out);
        assert_eq!(out, vec![Value::from("a"), Value::from("b"), Value::from("c")]);
    }

    #[test]
    fn truthiness_follows_python() {
        assert!(!Value::None.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::list(Vec::<Value>::new()).is_truthy());
        assert!(Value::from("0").is_truthy());
        assert!(Value::Float(0.5).is_truthy());
    }

    #[test]
    fn display_and_repr() {
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(Value::Bool(true).to_string(), "True");
        assert_eq!(
            Value::list(vec![Value::from("a"), Value::Int(1)]).to_string(),
            "['a', 1]"
        );
        assert_eq!(Value::dict([("k", "it's")]).to_string(), r"{'k': 'it\'s'}");
    }

    #[test]
    fn numbers_compare_across_types() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_ne!(Value::Int(1), Value::from("1"));
        assert_ne!(Value::Bool(true), Value::from("True"));
        assert_eq!(Value::Bool(true), Value::Int(1));
        assert_eq!(Value::Bool(false), Value::Float(0.0));
        assert_ne!(Value::Bool(true), Value::Int(2));
    }
}
