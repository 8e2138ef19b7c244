use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::lua::{Lua, ObjectRef};

mod convert;
mod error;

pub use convert::{FunctionBox, Marshal, Nil, Point, TypeChecker};
pub use error::{Error, Result};

/// A host closure callable from Lua.
///
/// The closure reads its arguments off the stack and returns how many values it pushed as results.
pub type Function = Rc<dyn Fn(&Lua) -> Result<usize>>;

/// Method name -> value mapping used to describe libraries
pub type StringTable = BTreeMap<String, Value>;

/// The coarse type of a stack slot
///
/// Numbers are split by their subtype tag: a slot is an Integer only if Lua stored it as one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    String,
    Integer,
    Double,
    Bool,
    Function,
    Table,
    Nil,
    /// Full userdata
    Userdata,
    /// Threads and light userdata
    Other,
    /// No value at this position
    None,
}

impl Kind {
    pub fn name(self) -> &'static str {
        match self {
            Kind::String => "String",
            Kind::Integer => "Integer",
            Kind::Double => "Double",
            Kind::Bool => "Boolean",
            Kind::Function => "Function",
            Kind::Table => "Table",
            Kind::Nil => "nil",
            Kind::Userdata => "Userdata",
            Kind::Other => "other",
            Kind::None => "no value",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Anything that can cross the bridge
#[derive(Clone)]
pub enum Value {
    String(String),
    Integer(i64),
    Double(f64),
    Bool(bool),
    Function(Function),
    Table(Table),
    Nil,
    /// A host object previously embedded into Lua
    Object(ObjectRef),
}

impl Value {
    /// Wraps a host closure
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&Lua) -> Result<usize> + 'static,
    {
        Value::Function(Rc::new(f))
    }

    pub fn kind(&self) -> Kind {
        match self {
            Value::String(_) => Kind::String,
            Value::Integer(_) => Kind::Integer,
            Value::Double(_) => Kind::Double,
            Value::Bool(_) => Kind::Bool,
            Value::Function(_) => Kind::Function,
            Value::Table(_) => Kind::Table,
            Value::Nil => Kind::Nil,
            Value::Object(_) => Kind::Userdata,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.debug_tuple("String").field(s).finish(),
            Value::Integer(i) => f.debug_tuple("Integer").field(i).finish(),
            Value::Double(n) => f.debug_tuple("Double").field(n).finish(),
            Value::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Value::Function(func) => write!(f, "Function({:p})", Rc::as_ptr(func) as *const ()),
            Value::Table(t) => f.debug_tuple("Table").field(t).finish(),
            Value::Nil => f.write_str("Nil"),
            Value::Object(o) => f.debug_tuple("Object").field(o).finish(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Table(a), Value::Table(b)) => a == b,
            (Value::Nil, Value::Nil) => true,
            (Value::Object(a), Value::Object(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Double(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Table> for Value {
    fn from(t: Table) -> Self {
        Value::Table(t)
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Value::Function(f)
    }
}

impl From<ObjectRef> for Value {
    fn from(o: ObjectRef) -> Self {
        Value::Object(o)
    }
}

/// An ordered list of key/value pairs.
///
/// Keys may repeat; lookups behave like a Lua table where the last write wins.
#[derive(Clone, Default)]
pub struct Table {
    pairs: Vec<(Value, Value)>,
}

impl Table {
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pairs: Vec::with_capacity(capacity),
        }
    }

    /// Builds a sequence table (keys 1..=n)
    pub fn sequence<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let pairs = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| (Value::Integer(i as i64 + 1), v.into()))
            .collect();
        Self { pairs }
    }

    pub fn insert(&mut self, key: impl Into<Value>, value: impl Into<Value>) {
        self.pairs.push((key.into(), value.into()));
    }

    /// Looks up `key`, honoring last-write-wins
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Number of stored pairs, duplicates included
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.pairs.iter()
    }

    /// The distinct keys in first-seen order
    pub fn keys(&self) -> Vec<&Value> {
        let mut keys: Vec<&Value> = Vec::with_capacity(self.pairs.len());
        for (k, _) in &self.pairs {
            if !keys.contains(&k) {
                keys.push(k);
            }
        }
        keys
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.pairs.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

/// Tables compare as mappings: order and shadowed duplicates do not matter
impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        let keys = self.keys();
        if keys.len() != other.keys().len() {
            return false;
        }
        keys.into_iter().all(|k| self.get(k) == other.get(k))
    }
}

impl<K: Into<Value>, V: Into<Value>> FromIterator<(K, V)> for Table {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            pairs: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl IntoIterator for Table {
    type Item = (Value, Value);
    type IntoIter = std::vec::IntoIter<(Value, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.pairs.into_iter()
    }
}
