use std::collections::HashMap;
use std::hash::Hash;

use crate::base::{Function, Kind, Table};
use crate::lua::{Lua, StackIndex};

/// Predicate deciding whether a stack slot holds a given type
pub type Validator = fn(&Lua, StackIndex) -> bool;

/// A type's diagnostic name paired with its validity check, used by [`Lua::check_args`]
#[derive(Clone, Copy)]
pub struct TypeChecker {
    pub type_name: &'static str,
    pub is_valid: Validator,
}

impl TypeChecker {
    pub fn check(&self, lua: &Lua, position: StackIndex) -> bool {
        (self.is_valid)(lua, position)
    }
}

impl std::fmt::Debug for TypeChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeChecker")
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// A host type with a fixed Lua representation.
///
/// `is_valid` must return true exactly when `from_lua` would return `Some`.
/// `from_lua` returning `None` means "wrong type", never "failure".
pub trait Marshal: Sized {
    /// Pushes `self` onto the top of the stack
    fn push_value(&self, lua: &Lua);

    /// Decodes the slot at `position` if it holds exactly this type
    fn from_lua(lua: &Lua, position: StackIndex) -> Option<Self>;

    fn type_name() -> &'static str;

    /// The coarse Lua type this maps to
    fn kind() -> Kind;

    fn arg() -> TypeChecker {
        TypeChecker {
            type_name: Self::type_name(),
            is_valid: Self::is_valid,
        }
    }

    fn is_valid(lua: &Lua, position: StackIndex) -> bool {
        lua.kind(position) == Self::kind()
    }
}

impl Marshal for String {
    fn push_value(&self, lua: &Lua) {
        lua.push_string(self)
    }

    fn from_lua(lua: &Lua, position: StackIndex) -> Option<Self> {
        if lua.kind(position) != Kind::String {
            return None;
        }
        lua.get_string(position)
    }

    fn type_name() -> &'static str {
        "String"
    }

    fn kind() -> Kind {
        Kind::String
    }

    // Lua strings are byte strings; only valid UTF-8 decodes
    fn is_valid(lua: &Lua, position: StackIndex) -> bool {
        Self::from_lua(lua, position).is_some()
    }
}

impl Marshal for i64 {
    fn push_value(&self, lua: &Lua) {
        lua.push_integer(*self)
    }

    fn from_lua(lua: &Lua, position: StackIndex) -> Option<Self> {
        if lua.kind(position) != Kind::Integer {
            return None;
        }
        lua.get_integer(position)
    }

    fn type_name() -> &'static str {
        "Integer"
    }

    fn kind() -> Kind {
        Kind::Integer
    }
}

impl Marshal for f64 {
    fn push_value(&self, lua: &Lua) {
        lua.push_double(*self)
    }

    fn from_lua(lua: &Lua, position: StackIndex) -> Option<Self> {
        if lua.kind(position) != Kind::Double {
            return None;
        }
        lua.get_number(position)
    }

    fn type_name() -> &'static str {
        "Double"
    }

    fn kind() -> Kind {
        Kind::Double
    }
}

impl Marshal for bool {
    fn push_value(&self, lua: &Lua) {
        lua.push_bool(*self)
    }

    fn from_lua(lua: &Lua, position: StackIndex) -> Option<Self> {
        if lua.kind(position) != Kind::Bool {
            return None;
        }
        Some(lua.get_bool(position))
    }

    fn type_name() -> &'static str {
        "Boolean"
    }

    fn kind() -> Kind {
        Kind::Bool
    }
}

/// Carries a host closure into Lua.
///
/// Functions only travel one way: a Lua function has no host identity to rebuild, so
/// `from_lua` never succeeds and `is_valid` is always false. Use [`Lua::check_kinds`] with
/// [`Kind::Function`] to check that an argument is callable.
#[derive(Clone)]
pub struct FunctionBox(pub Function);

impl FunctionBox {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Lua) -> crate::Result<usize> + 'static,
    {
        Self(std::rc::Rc::new(f))
    }
}

impl Marshal for FunctionBox {
    fn push_value(&self, lua: &Lua) {
        lua.push_function(self.0.clone())
    }

    fn from_lua(_lua: &Lua, _position: StackIndex) -> Option<Self> {
        None
    }

    fn type_name() -> &'static str {
        "Function"
    }

    fn kind() -> Kind {
        Kind::Function
    }

    fn is_valid(_lua: &Lua, _position: StackIndex) -> bool {
        false
    }
}

/// Lua's nil
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Nil;

impl Marshal for Nil {
    fn push_value(&self, lua: &Lua) {
        lua.push_nil()
    }

    fn from_lua(lua: &Lua, position: StackIndex) -> Option<Self> {
        (lua.kind(position) == Kind::Nil).then_some(Nil)
    }

    fn type_name() -> &'static str {
        "nil"
    }

    fn kind() -> Kind {
        Kind::Nil
    }
}

impl Marshal for Table {
    fn push_value(&self, lua: &Lua) {
        lua.push_table(self)
    }

    fn from_lua(lua: &Lua, position: StackIndex) -> Option<Self> {
        lua.get_table(position)
    }

    fn type_name() -> &'static str {
        "Table"
    }

    fn kind() -> Kind {
        Kind::Table
    }

    fn is_valid(lua: &Lua, position: StackIndex) -> bool {
        Self::from_lua(lua, position).is_some()
    }
}

/// A screen coordinate, represented in Lua as `{x = ..., y = ...}`
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl Marshal for Point {
    fn push_value(&self, lua: &Lua) {
        lua.create_table(0, 2);
        lua.push_double(self.x);
        lua.raw_set_field("x", -2);
        lua.push_double(self.y);
        lua.raw_set_field("y", -2);
    }

    // Whole-number coordinates written in a script arrive as integers; both are accepted.
    // Extra keys are ignored.
    fn from_lua(lua: &Lua, position: StackIndex) -> Option<Self> {
        if lua.kind(position) != Kind::Table {
            return None;
        }
        let table = lua.abs_index(position);
        let x = read_coordinate(lua, table, "x")?;
        let y = read_coordinate(lua, table, "y")?;
        Some(Point { x, y })
    }

    fn type_name() -> &'static str {
        "Point"
    }

    fn kind() -> Kind {
        Kind::Table
    }

    fn is_valid(lua: &Lua, position: StackIndex) -> bool {
        Self::from_lua(lua, position).is_some()
    }
}

fn read_coordinate(lua: &Lua, table: StackIndex, key: &str) -> Option<f64> {
    let n = match lua.raw_get_field(key, table) {
        Kind::Integer | Kind::Double => lua.get_number(-1),
        _ => None,
    };
    lua.pop(1);
    n
}

/// A sequence (keys `1..=n`, nothing else) of one element type
impl<T: Marshal> Marshal for Vec<T> {
    fn push_value(&self, lua: &Lua) {
        lua.create_table(self.len(), 0);
        for (i, v) in self.iter().enumerate() {
            v.push_value(lua);
            lua.raw_set_index(-2, i as i64 + 1);
        }
    }

    fn from_lua(lua: &Lua, position: StackIndex) -> Option<Self> {
        if lua.kind(position) != Kind::Table {
            return None;
        }
        let table = lua.abs_index(position);
        let len = lua.raw_len(table);
        if lua.count_pairs(table) != len {
            return None;
        }

        let mut out = Vec::with_capacity(len);
        for i in 1..=len {
            lua.raw_get_index(table, i as i64);
            let v = T::from_lua(lua, -1);
            lua.pop(1);
            out.push(v?);
        }
        Some(out)
    }

    fn type_name() -> &'static str {
        "Sequence"
    }

    fn kind() -> Kind {
        Kind::Table
    }

    fn is_valid(lua: &Lua, position: StackIndex) -> bool {
        Self::from_lua(lua, position).is_some()
    }
}

/// A table whose keys and values each decode as one host type
impl<K, V> Marshal for HashMap<K, V>
where
    K: Marshal + Eq + Hash,
    V: Marshal,
{
    fn push_value(&self, lua: &Lua) {
        lua.create_table(0, self.len());
        for (k, v) in self {
            k.push_value(lua);
            if !lua.is_valid_key(-1) {
                lua.pop(1);
                continue;
            }
            v.push_value(lua);
            lua.raw_set(-3);
        }
    }

    fn from_lua(lua: &Lua, position: StackIndex) -> Option<Self> {
        if lua.kind(position) != Kind::Table {
            return None;
        }
        let table = lua.abs_index(position);
        let mut out = HashMap::new();
        let complete = lua.for_each_pair(table, |lua| {
            match (K::from_lua(lua, -2), V::from_lua(lua, -1)) {
                (Some(k), Some(v)) => {
                    out.insert(k, v);
                    true
                }
                _ => false,
            }
        });
        complete.then_some(out)
    }

    fn type_name() -> &'static str {
        "KeyedTable"
    }

    fn kind() -> Kind {
        Kind::Table
    }

    fn is_valid(lua: &Lua, position: StackIndex) -> bool {
        Self::from_lua(lua, position).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::Value;

    fn lua() -> Lua {
        Lua::new().expect("Failed to create Lua")
    }

    fn round_trip<T: Marshal + PartialEq + std::fmt::Debug>(lua: &Lua, v: T) {
        v.push_value(lua);
        assert!(T::is_valid(lua, -1), "{} not valid after push", T::type_name());
        assert_eq!(T::from_lua(lua, -1), Some(v));
        lua.pop(1);
    }

    #[test]
    fn test_primitive_round_trips() {
        let lua = lua();
        round_trip(&lua, String::new());
        round_trip(&lua, "hello".to_string());
        round_trip(&lua, "nul\0inside".to_string());
        round_trip(&lua, "héllo wörld ✓ 日本語".to_string());
        round_trip(&lua, 0i64);
        round_trip(&lua, i64::MIN);
        round_trip(&lua, i64::MAX);
        round_trip(&lua, 0.5f64);
        round_trip(&lua, -1e300f64);
        round_trip(&lua, 3.0f64);
        round_trip(&lua, true);
        round_trip(&lua, false);
        round_trip(&lua, Nil);
        assert_eq!(lua.top(), 0);
    }

    #[test]
    fn test_string_discrimination() {
        let lua = lua();
        "42".to_string().push_value(&lua);
        assert!(String::is_valid(&lua, -1));
        assert!(!i64::is_valid(&lua, -1));
        assert!(!f64::is_valid(&lua, -1));
        assert!(!bool::is_valid(&lua, -1));
        assert!(!Table::is_valid(&lua, -1));
        assert!(!Nil::is_valid(&lua, -1));
        assert_eq!(i64::from_lua(&lua, -1), None);
    }

    #[test]
    fn test_number_subtype_policy() {
        let lua = lua();
        lua.push_integer(3);
        assert_eq!(i64::from_lua(&lua, -1), Some(3));
        assert_eq!(f64::from_lua(&lua, -1), None);
        lua.push_double(3.0);
        assert_eq!(f64::from_lua(&lua, -1), Some(3.0));
        assert_eq!(i64::from_lua(&lua, -1), None);

        let out = lua.do_string("return 2^53, 7 // 2").expect("eval");
        assert_eq!(out, vec![Value::Double(9007199254740992.0), Value::Integer(3)]);
    }

    #[test]
    fn test_invalid_utf8_is_not_a_string() {
        let lua = lua();
        lua.push_bytes(&[0xff, 0xfe, 0x00]);
        assert_eq!(lua.kind(-1), Kind::String);
        assert!(!String::is_valid(&lua, -1));
        assert_eq!(String::from_lua(&lua, -1), None);
        assert_eq!(lua.get_bytes(-1), Some(vec![0xff, 0xfe, 0x00]));
    }

    #[test]
    fn test_functions_do_not_come_back() {
        let lua = lua();
        let f = FunctionBox::new(|_| Ok(0));
        f.push_value(&lua);
        assert_eq!(lua.kind(-1), Kind::Function);
        assert!(FunctionBox::from_lua(&lua, -1).is_none());
        assert!(!FunctionBox::is_valid(&lua, -1));
    }

    #[test]
    fn test_point() {
        let lua = lua();
        round_trip(&lua, Point::new(1.5, -2.0));

        lua.do_string("p = {x = 10, y = 20, label = 'corner'}; q = {x = 1}")
            .expect("eval");
        lua.get_global("p").expect("global");
        assert_eq!(Point::from_lua(&lua, -1), Some(Point::new(10.0, 20.0)));
        lua.get_global("q").expect("global");
        assert!(!Point::is_valid(&lua, -1));
        assert_eq!(Point::from_lua(&lua, -1), None);
    }

    #[test]
    fn test_keyed_table() {
        let lua = lua();
        let mut m = HashMap::new();
        m.insert("x".to_string(), 1.0f64);
        m.insert("y".to_string(), 2.0f64);
        round_trip(&lua, m);

        lua.do_string("mixed = {x = 1.0, y = 'no'}").expect("eval");
        lua.get_global("mixed").expect("global");
        assert!(!HashMap::<String, f64>::is_valid(&lua, -1));
    }

    #[test]
    fn test_sequence() {
        let lua = lua();
        round_trip(&lua, vec![1i64, 2, 3]);
        round_trip(&lua, Vec::<String>::new());

        lua.do_string("extra = {1, 2, name = 'x'}").expect("eval");
        lua.get_global("extra").expect("global");
        assert_eq!(Vec::<i64>::from_lua(&lua, -1), None);
    }

    #[test]
    fn test_arg_checker_names() {
        let c = i64::arg();
        assert_eq!(c.type_name, "Integer");
        let lua = lua();
        lua.push_integer(1);
        assert!(c.check(&lua, -1));
        assert!(!String::arg().check(&lua, -1));
    }
}
