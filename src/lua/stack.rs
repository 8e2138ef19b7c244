//! Raw stack protocol.
//!
//! Every other part of the bridge reaches Lua through these methods. Relative (negative)
//! indices shift whenever something is pushed or popped, so anything that must survive a
//! push, a pop or a nested call should be turned into an absolute index first.

use std::ffi::{c_char, c_int, CString};
use std::slice;

use mlua_sys as ffi;
use tracing::trace;

use crate::base::{Error, Kind, Result, Table, TypeChecker, Value};
use crate::lua::bridge::{Lua, StackIndex};
use crate::lua::closure::Failure;
use crate::lua::embedder_api::DepthContext;

/// Pass as `nresults` to keep every value a call returns
pub const MULTRET: i32 = ffi::LUA_MULTRET;

impl Lua {
    /// Index of the top slot (also the number of slots in use)
    pub fn top(&self) -> StackIndex {
        unsafe { ffi::lua_gettop(self.state) }
    }

    pub fn set_top(&self, top: StackIndex) {
        unsafe { ffi::lua_settop(self.state, top) }
    }

    /// Converts a possibly relative index into one that stays valid across pushes and pops
    pub fn abs_index(&self, position: StackIndex) -> StackIndex {
        unsafe { ffi::lua_absindex(self.state, position) }
    }

    pub fn pop(&self, n: usize) {
        if cfg!(feature = "trace_stack") {
            trace!(n, top = self.top(), "pop");
        }
        unsafe { ffi::lua_pop(self.state, n as c_int) }
    }

    /// Makes room for `n` more slots
    pub(crate) fn ensure_stack(&self, n: usize) {
        let ok = unsafe { ffi::lua_checkstack(self.state, n as c_int) };
        assert!(ok != 0, "Lua stack overflow (could not grow by {n} slots)");
    }

    pub fn kind(&self, position: StackIndex) -> Kind {
        unsafe {
            match ffi::lua_type(self.state, position) {
                ffi::LUA_TNONE => Kind::None,
                ffi::LUA_TNIL => Kind::Nil,
                ffi::LUA_TBOOLEAN => Kind::Bool,
                ffi::LUA_TNUMBER => {
                    if ffi::lua_isinteger(self.state, position) != 0 {
                        Kind::Integer
                    } else {
                        Kind::Double
                    }
                }
                ffi::LUA_TSTRING => Kind::String,
                ffi::LUA_TTABLE => Kind::Table,
                ffi::LUA_TFUNCTION => Kind::Function,
                ffi::LUA_TUSERDATA => Kind::Userdata,
                _ => Kind::Other,
            }
        }
    }

    // push

    pub fn push_nil(&self) {
        unsafe { ffi::lua_pushnil(self.state) }
    }

    pub fn push_bool(&self, value: bool) {
        unsafe { ffi::lua_pushboolean(self.state, value as c_int) }
    }

    pub fn push_integer(&self, n: i64) {
        unsafe { ffi::lua_pushinteger(self.state, n) }
    }

    pub fn push_double(&self, n: f64) {
        unsafe { ffi::lua_pushnumber(self.state, n) }
    }

    pub fn push_string(&self, s: &str) {
        self.push_bytes(s.as_bytes())
    }

    /// Pushes raw bytes; Lua strings may hold NULs and invalid UTF-8
    pub fn push_bytes(&self, bytes: &[u8]) {
        unsafe {
            ffi::lua_pushlstring(self.state, bytes.as_ptr() as *const c_char, bytes.len());
        }
    }

    /// Pushes a new empty table with preallocated sequence and hash parts
    pub fn create_table(&self, sequence_capacity: usize, key_capacity: usize) {
        unsafe {
            ffi::lua_createtable(
                self.state,
                sequence_capacity.min(c_int::MAX as usize) as c_int,
                key_capacity.min(c_int::MAX as usize) as c_int,
            )
        }
    }

    pub fn push_table(&self, table: &Table) {
        self.ensure_stack(3);
        self.create_table(0, table.len());
        let t = self.abs_index(-1);
        for (key, value) in table.iter() {
            self.push(key);
            // nil and NaN cannot index a Lua table; a collected object pushes as nil
            if !self.is_valid_key(-1) {
                self.pop(1);
                continue;
            }
            self.push(value);
            self.raw_set(t);
        }
    }

    /// Pushes a copy of the value at `position`
    pub fn push_from_stack(&self, position: StackIndex) {
        unsafe { ffi::lua_pushvalue(self.state, position) }
    }

    pub fn push(&self, value: &Value) {
        if cfg!(feature = "trace_stack") {
            trace!(kind = %value.kind(), top = self.top(), "push");
        }
        match value {
            Value::String(s) => self.push_string(s),
            Value::Integer(i) => self.push_integer(*i),
            Value::Double(n) => self.push_double(*n),
            Value::Bool(b) => self.push_bool(*b),
            Value::Function(f) => self.push_function(f.clone()),
            Value::Table(t) => self.push_table(t),
            Value::Nil => self.push_nil(),
            Value::Object(o) => self.push_object(o),
        }
    }

    // get

    /// Decodes any representable value.
    ///
    /// Returns `None` for Lua functions, threads, light userdata, userdata not created by this
    /// bridge, strings that are not valid UTF-8, and tables that contain any of those or
    /// nest deeper than the configured limit.
    pub fn get(&self, position: StackIndex) -> Option<Value> {
        self.get_nested(position, DepthContext::new(&self.shared.config))
    }

    fn get_nested(&self, position: StackIndex, depth: DepthContext) -> Option<Value> {
        match self.kind(position) {
            Kind::Nil => Some(Value::Nil),
            Kind::Bool => Some(Value::Bool(self.get_bool(position))),
            Kind::Integer => self.get_integer(position).map(Value::Integer),
            Kind::Double => self.get_number(position).map(Value::Double),
            Kind::String => self.get_string(position).map(Value::String),
            Kind::Table => self.read_table(position, depth).map(Value::Table),
            Kind::Userdata => self.get_object(position).map(Value::Object),
            Kind::Function | Kind::Other | Kind::None => None,
        }
    }

    pub fn get_bytes(&self, position: StackIndex) -> Option<Vec<u8>> {
        // lua_tolstring converts numbers in place, which would confuse table traversal
        if self.kind(position) != Kind::String {
            return None;
        }
        unsafe {
            let mut len = 0usize;
            let ptr = ffi::lua_tolstring(self.state, position, &mut len);
            if ptr.is_null() {
                return None;
            }
            Some(slice::from_raw_parts(ptr as *const u8, len).to_vec())
        }
    }

    pub fn get_string(&self, position: StackIndex) -> Option<String> {
        self.get_bytes(position)
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }

    /// Lua truthiness: everything but nil and false is true
    pub fn get_bool(&self, position: StackIndex) -> bool {
        unsafe { ffi::lua_toboolean(self.state, position) != 0 }
    }

    pub fn get_number(&self, position: StackIndex) -> Option<f64> {
        let mut isnum: c_int = 0;
        let n = unsafe { ffi::lua_tonumberx(self.state, position, &mut isnum) };
        (isnum != 0).then_some(n)
    }

    pub fn get_integer(&self, position: StackIndex) -> Option<i64> {
        let mut isnum: c_int = 0;
        let n = unsafe { ffi::lua_tointegerx(self.state, position, &mut isnum) };
        (isnum != 0).then_some(n)
    }

    pub fn get_table(&self, position: StackIndex) -> Option<Table> {
        self.read_table(position, DepthContext::new(&self.shared.config))
    }

    fn read_table(&self, position: StackIndex, depth: DepthContext) -> Option<Table> {
        if self.kind(position) != Kind::Table {
            return None;
        }
        let inner = depth.nest()?;
        let table = self.abs_index(position);
        let mut out = Table::new();
        let complete = self.for_each_pair(table, |lua| {
            match (lua.get_nested(-2, inner), lua.get_nested(-1, inner)) {
                (Some(k), Some(v)) => {
                    out.insert(k, v);
                    true
                }
                _ => false,
            }
        });
        complete.then_some(out)
    }

    /// Walks a table with `next`. `f` sees the key at -2 and the value at -1 and must leave
    /// the stack as it found it; returning false stops the walk early.
    ///
    /// Returns true if every pair was visited.
    pub fn for_each_pair<F>(&self, table: StackIndex, mut f: F) -> bool
    where
        F: FnMut(&Lua) -> bool,
    {
        self.ensure_stack(3);
        let table = self.abs_index(table);
        self.push_nil();
        while unsafe { ffi::lua_next(self.state, table) } != 0 {
            if !f(self) {
                self.pop(2);
                return false;
            }
            self.pop(1);
        }
        true
    }

    pub fn count_pairs(&self, table: StackIndex) -> usize {
        let mut n = 0;
        self.for_each_pair(table, |_| {
            n += 1;
            true
        });
        n
    }

    /// Length of the sequence part, without metamethods
    pub fn raw_len(&self, table: StackIndex) -> usize {
        unsafe { ffi::lua_rawlen(self.state, table) as usize }
    }

    // tables

    /// `t[k] = v` where `t` is at `table`, `k` at -2 and `v` at -1. Pops key and value.
    /// May run metamethods.
    pub fn set_table(&self, table: StackIndex) {
        unsafe { ffi::lua_settable(self.state, table) }
    }

    /// Pushes `t[k]` where `k` is on top (replaced by the result). May run metamethods.
    pub fn index_table(&self, table: StackIndex) -> Kind {
        unsafe { ffi::lua_gettable(self.state, table) };
        self.kind(-1)
    }

    /// Like `set_table` without metamethods
    pub fn raw_set(&self, table: StackIndex) {
        unsafe { ffi::lua_rawset(self.state, table) }
    }

    /// Like `index_table` without metamethods
    pub fn raw_get(&self, table: StackIndex) -> Kind {
        unsafe { ffi::lua_rawget(self.state, table) };
        self.kind(-1)
    }

    /// Pushes `t[index]` without metamethods
    pub fn raw_get_index(&self, table: StackIndex, index: i64) -> Kind {
        unsafe { ffi::lua_rawgeti(self.state, table, index) };
        self.kind(-1)
    }

    /// Pops the top value into `t[index]` without metamethods
    pub fn raw_set_index(&self, table: StackIndex, index: i64) {
        unsafe { ffi::lua_rawseti(self.state, table, index) }
    }

    /// Pushes `t[key]` without metamethods
    pub fn raw_get_field(&self, key: &str, table: StackIndex) -> Kind {
        let table = self.abs_index(table);
        self.push_string(key);
        self.raw_get(table)
    }

    /// Pops the top value into `t[key]` without metamethods
    pub fn raw_set_field(&self, key: &str, table: StackIndex) {
        let table = self.abs_index(table);
        self.push_string(key);
        unsafe { ffi::lua_insert(self.state, -2) };
        self.raw_set(table);
    }

    /// Pops the top value into `t[name]`
    pub fn set_field(&self, name: &str, table: StackIndex) -> Result<()> {
        let name = CString::new(name)?;
        unsafe { ffi::lua_setfield(self.state, table, name.as_ptr()) };
        Ok(())
    }

    /// Pushes `t[name]`
    pub fn get_field(&self, name: &str, table: StackIndex) -> Result<Kind> {
        let name = CString::new(name)?;
        unsafe { ffi::lua_getfield(self.state, table, name.as_ptr()) };
        Ok(self.kind(-1))
    }

    /// Pops the top value into the global `name`
    pub fn set_global(&self, name: &str) -> Result<()> {
        let name = CString::new(name)?;
        unsafe { ffi::lua_setglobal(self.state, name.as_ptr()) };
        Ok(())
    }

    /// Pushes the global `name`
    pub fn get_global(&self, name: &str) -> Result<Kind> {
        let name = CString::new(name)?;
        unsafe { ffi::lua_getglobal(self.state, name.as_ptr()) };
        Ok(self.kind(-1))
    }

    /// Whether the slot can be used as a table key (not nil, not NaN)
    pub fn is_valid_key(&self, position: StackIndex) -> bool {
        match self.kind(position) {
            Kind::Nil | Kind::None => false,
            Kind::Double => !self.get_number(position).is_some_and(f64::is_nan),
            _ => true,
        }
    }

    /// Sets `t[key] = value` on the table at `table`, without metamethods
    pub fn push_onto_table(&self, key: &Value, value: &Value, table: StackIndex) -> Result<()> {
        let table = self.abs_index(table);
        self.push_key(key)?;
        self.push(value);
        self.raw_set(table);
        Ok(())
    }

    /// Sets `t[key]` to a host closure on the table at `table`, without metamethods
    pub fn push_method(&self, key: &Value, method: crate::Function, table: StackIndex) -> Result<()> {
        let table = self.abs_index(table);
        self.push_key(key)?;
        self.push_function(method);
        self.raw_set(table);
        Ok(())
    }

    fn push_key(&self, key: &Value) -> Result<()> {
        self.push(key);
        if self.is_valid_key(-1) {
            return Ok(());
        }
        let found = self.kind(-1).name();
        self.pop(1);
        Err(Error::InvalidKey { found })
    }

    // argument checks

    /// Validates arguments 1..=n against `types`, failing on the first mismatch
    pub fn check_args(&self, types: &[TypeChecker]) -> Result<()> {
        for (i, checker) in types.iter().enumerate() {
            let position = i as StackIndex + 1;
            if !checker.check(self, position) {
                return Err(Error::TypeMismatch {
                    position,
                    expected: checker.type_name,
                    found: self.kind(position).name(),
                });
            }
        }
        Ok(())
    }

    /// Coarse form of `check_args`. `Kind::None` asserts that there is no argument there.
    pub fn check_kinds(&self, kinds: &[Kind]) -> Result<()> {
        for (i, kind) in kinds.iter().enumerate() {
            let position = i as StackIndex + 1;
            let found = self.kind(position);
            if found != *kind {
                return Err(Error::TypeMismatch {
                    position,
                    expected: kind.name(),
                    found: found.name(),
                });
            }
        }
        Ok(())
    }

    // eval

    /// Compiles `source` and pushes the resulting chunk as a function
    pub fn load_string(&self, source: &str) -> Result<()> {
        let status = unsafe {
            ffi::luaL_loadbufferx(
                self.state,
                source.as_ptr() as *const c_char,
                source.len(),
                c"=chunk".as_ptr(),
                std::ptr::null(),
            )
        };
        if status == ffi::LUA_OK {
            return Ok(());
        }
        let message = self.get_string(-1).unwrap_or_default();
        self.pop(1);
        Err(match status {
            ffi::LUA_ERRMEM => Error::Memory(message),
            _ => Error::Syntax(message),
        })
    }

    /// Calls the function below its `nargs` arguments in protected mode.
    ///
    /// On success the function and arguments are replaced by `nresults` results (all of them
    /// with [`MULTRET`]). On failure they are removed and the error is returned.
    pub fn call(&self, nargs: usize, nresults: i32) -> Result<()> {
        let nargs = nargs as c_int;
        let traceback = self.shared.config.traceback;
        let handler = if traceback {
            let base = self.top() - nargs;
            unsafe {
                ffi::lua_pushcfunction(self.state, traceback_handler);
                ffi::lua_insert(self.state, base);
            }
            base
        } else {
            0
        };

        let status = unsafe { ffi::lua_pcall(self.state, nargs, nresults, handler) };

        if traceback {
            unsafe { ffi::lua_remove(self.state, handler) };
        }
        if status != ffi::LUA_OK && self.has_pending_panic() {
            self.pop(1);
        }
        // a panic is resumed even when a script pcall already swallowed its failure
        self.resume_pending_panic();
        if status == ffi::LUA_OK {
            return Ok(());
        }
        Err(self.pop_error(status))
    }

    /// Loads and runs `source`, returning everything it returns
    pub fn do_string(&self, source: &str) -> Result<Vec<Value>> {
        let base = self.top();
        self.load_string(source)?;
        self.call(0, MULTRET)?;
        self.collect_results(base)
    }

    /// Pops every slot above `base` and decodes them in order
    pub fn collect_results(&self, base: StackIndex) -> Result<Vec<Value>> {
        let top = self.top();
        let mut out = Vec::with_capacity((top - base).max(0) as usize);
        let mut bad = None;
        for position in (base + 1)..=top {
            match self.get(position) {
                Some(v) => out.push(v),
                None => {
                    bad = Some(Error::Unrepresentable {
                        position: position - base,
                        found: self.kind(position).name(),
                    });
                    break;
                }
            }
        }
        self.set_top(base);
        match bad {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    /// Converts and pops the error object a failed protected call left on top
    fn pop_error(&self, status: c_int) -> Error {
        match self.take_failure(-1) {
            Some(Some(Failure::Error(e))) => {
                self.pop(1);
                return e;
            }
            // payload already resumed once
            Some(Some(Failure::Panic(message))) => {
                self.pop(1);
                return Error::External(format!("host closure panicked: {message}"));
            }
            Some(None) => {
                self.pop(1);
                return Error::External("host error was already handled".into());
            }
            None => {}
        }

        let payload = self.get(-1).unwrap_or(Value::Nil);
        let message = match &payload {
            Value::String(s) => s.clone(),
            _ => format!("(error object is a {} value)", self.kind(-1).name()),
        };
        self.pop(1);
        match status {
            ffi::LUA_ERRMEM => Error::Memory(message),
            _ => Error::Eval { message, payload },
        }
    }
}

/// Message handler appending a traceback to string errors. Other error objects pass through
unsafe extern "C-unwind" fn traceback_handler(state: *mut ffi::lua_State) -> c_int {
    if ffi::lua_type(state, 1) == ffi::LUA_TSTRING {
        let msg = ffi::lua_tolstring(state, 1, std::ptr::null_mut());
        ffi::luaL_traceback(state, state, msg, 1);
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua::embedder_api::BridgeConfig;

    fn lua() -> Lua {
        Lua::new().expect("Failed to create Lua")
    }

    #[test]
    fn test_abs_index_survives_pushes() {
        let lua = lua();
        lua.push_integer(1);
        lua.push_integer(2);
        let abs = lua.abs_index(-1);
        assert_eq!(abs, 2);
        lua.push_string("x");
        lua.push_string("y");
        assert_eq!(lua.get(abs), Some(Value::Integer(2)));
        assert_eq!(lua.get(-1), Some(Value::from("y")));
        lua.pop(3);
        assert_eq!(lua.top(), 1);
    }

    #[test]
    fn test_kinds() {
        let lua = lua();
        lua.push_nil();
        lua.push_bool(false);
        lua.push_integer(1);
        lua.push_double(1.0);
        lua.push_string("s");
        lua.create_table(0, 0);
        assert_eq!(lua.kind(1), Kind::Nil);
        assert_eq!(lua.kind(2), Kind::Bool);
        assert_eq!(lua.kind(3), Kind::Integer);
        assert_eq!(lua.kind(4), Kind::Double);
        assert_eq!(lua.kind(5), Kind::String);
        assert_eq!(lua.kind(6), Kind::Table);
        assert_eq!(lua.kind(7), Kind::None);
    }

    #[test]
    fn test_table_pairs_read_back() {
        let lua = lua();
        let t: Table = vec![("x", 1i64), ("y", 2i64)].into_iter().collect();
        lua.push_table(&t);
        let back = lua.get_table(-1).expect("table");
        assert_eq!(back.len(), 2);
        assert_eq!(back.get(&"x".into()), Some(&Value::Integer(1)));
        assert_eq!(back.get(&"y".into()), Some(&Value::Integer(2)));
        assert_eq!(back, t);
    }

    #[test]
    fn test_table_duplicate_keys_collapse() {
        let lua = lua();
        let mut t = Table::new();
        t.insert("k", 1i64);
        t.insert("k", 2i64);
        lua.push_table(&t);
        let back = lua.get_table(-1).expect("table");
        assert_eq!(back.len(), 1);
        assert_eq!(back.get(&"k".into()), Some(&Value::Integer(2)));
    }

    #[test]
    fn test_nested_tables() {
        let lua = lua();
        let out = lua
            .do_string("return {name = 'main', frame = {x = 1, y = 2.5}, tags = {'a', 'b'}}")
            .expect("eval");
        let t = out[0].as_table().expect("table");
        let frame = t.get(&"frame".into()).and_then(Value::as_table).expect("frame");
        assert_eq!(frame.get(&"y".into()), Some(&Value::Double(2.5)));
        let tags = t.get(&"tags".into()).and_then(Value::as_table).expect("tags");
        assert_eq!(tags, &Table::sequence(["a", "b"]));
    }

    #[test]
    fn test_cyclic_table_is_rejected() {
        let lua = Lua::with_config(BridgeConfig::new(true, 8, false)).expect("Failed to create Lua");
        let err = lua.do_string("local t = {}; t.self = t; return t").unwrap_err();
        assert!(matches!(err, Error::Unrepresentable { position: 1, found: "Table" }));
        assert_eq!(lua.top(), 0);
    }

    #[test]
    fn test_table_with_function_is_not_representable() {
        let lua = lua();
        lua.do_string("t = {f = print}").expect("eval");
        lua.get_global("t").expect("global");
        assert_eq!(lua.get(-1), None);
        assert!(!<Table as crate::Marshal>::is_valid(&lua, -1));
    }

    #[test]
    fn test_raw_get_index() {
        let lua = lua();
        lua.push_table(&Table::sequence([10i64, 20, 30]));
        assert_eq!(lua.raw_get_index(-1, 2), Kind::Integer);
        assert_eq!(lua.get(-1), Some(Value::Integer(20)));
        lua.pop(1);
        assert_eq!(lua.raw_get_index(-1, 4), Kind::Nil);
    }

    #[test]
    fn test_globals_and_fields() {
        let lua = lua();
        lua.create_table(0, 1);
        lua.push_string("value");
        lua.set_field("field", -2).unwrap();
        lua.set_global("G").unwrap();
        assert_eq!(lua.do_string("return G.field").unwrap(), vec![Value::from("value")]);

        assert_eq!(lua.get_global("G").unwrap(), Kind::Table);
        assert_eq!(lua.get_field("field", -1).unwrap(), Kind::String);
        assert!(matches!(lua.set_global("bad\0name"), Err(Error::InvalidName(_))));
    }

    #[test]
    fn test_push_onto_table() {
        let lua = lua();
        lua.create_table(0, 0);
        lua.push_onto_table(&"a".into(), &Value::Integer(1), -1).unwrap();
        let seven: crate::Function = std::rc::Rc::new(|lua: &Lua| -> Result<usize> {
            lua.push_integer(7);
            Ok(1)
        });
        lua.push_method(&"f".into(), seven, -1).unwrap();
        lua.set_global("T").unwrap();
        assert_eq!(
            lua.do_string("return T.a, T.f()").unwrap(),
            vec![Value::Integer(1), Value::Integer(7)]
        );
    }

    #[test]
    fn test_nil_and_nan_keys_rejected() {
        let lua = lua();
        lua.create_table(0, 0);
        let err = lua.push_onto_table(&Value::Nil, &Value::Integer(1), -1).unwrap_err();
        assert!(matches!(err, Error::InvalidKey { found: "nil" }));
        let err = lua
            .push_onto_table(&Value::Double(f64::NAN), &Value::Integer(1), -1)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidKey { found: "Double" }));
        let noop: crate::Function = std::rc::Rc::new(|_: &Lua| -> Result<usize> { Ok(0) });
        assert!(lua.push_method(&Value::Nil, noop, -1).is_err());
        assert_eq!(lua.top(), 1);
        assert_eq!(lua.count_pairs(-1), 0);
    }

    struct Marker;

    impl crate::Embeddable for Marker {
        fn type_name() -> &'static str {
            "Marker"
        }

        fn equals(&self, _: &Self) -> bool {
            true
        }
    }

    #[test]
    fn test_collected_object_key_is_skipped() {
        let lua = lua();
        let marker = lua.embed(Marker).unwrap();
        lua.pop(1);
        lua.collect_garbage();
        assert_eq!(lua.object_count(), 0);

        let mut t = Table::new();
        t.insert(Value::Object(marker.clone()), 1i64);
        t.insert("kept", 2i64);
        lua.push_table(&t);
        let back = lua.get_table(-1).expect("table");
        assert_eq!(back.len(), 1);
        assert_eq!(back.get(&"kept".into()), Some(&Value::Integer(2)));
        lua.pop(1);

        lua.create_table(0, 0);
        let err = lua
            .push_onto_table(&Value::Object(marker), &Value::Integer(1), -1)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidKey { found: "nil" }));
        assert_eq!(lua.top(), 1);
    }

    #[test]
    fn test_runtime_error_is_recoverable() {
        let lua = lua();
        let err = lua.do_string("local x = nil; x()").unwrap_err();
        match err {
            Error::Eval { message, payload } => {
                assert!(message.contains("attempt to call"), "{message}");
                assert_eq!(payload, Value::String(message.clone()));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(lua.top(), 0);
        assert_eq!(lua.do_string("return 1 + 1").unwrap(), vec![Value::Integer(2)]);
    }

    #[test]
    fn test_non_string_error_payload() {
        let lua = lua();
        let err = lua.do_string("error({code = 7})").unwrap_err();
        let Error::Eval { payload, .. } = err else {
            panic!("expected eval error");
        };
        let t = payload.as_table().expect("table payload");
        assert_eq!(t.get(&"code".into()), Some(&Value::Integer(7)));
    }

    #[test]
    fn test_syntax_error() {
        let lua = lua();
        let err = lua.do_string("return +").unwrap_err();
        assert!(matches!(err, Error::Syntax(_)));
        assert_eq!(lua.top(), 0);
    }

    #[test]
    fn test_traceback() {
        let lua = Lua::with_config(BridgeConfig::new(true, 8, true)).expect("Failed to create Lua");
        let err = lua.do_string("error('boom')").unwrap_err();
        assert!(err.to_string().contains("stack traceback"), "{err}");
        assert_eq!(lua.top(), 0);
        assert_eq!(lua.do_string("return 'ok'").unwrap(), vec![Value::from("ok")]);
    }

    #[test]
    fn test_call_keeps_results() {
        let lua = lua();
        lua.load_string("return 1, 2, 3").unwrap();
        lua.call(0, 2).unwrap();
        assert_eq!(lua.top(), 2);
        assert_eq!(lua.get(1), Some(Value::Integer(1)));
        assert_eq!(lua.get(2), Some(Value::Integer(2)));
    }

    #[test]
    fn test_unrepresentable_result() {
        let lua = lua();
        let err = lua.do_string("return 1, print").unwrap_err();
        assert!(matches!(err, Error::Unrepresentable { position: 2, found: "Function" }));
        assert_eq!(lua.top(), 0);
    }

    #[test]
    fn test_check_kinds() {
        let lua = lua();
        lua.push_string("s");
        lua.create_table(0, 0);
        assert!(lua.check_kinds(&[Kind::String, Kind::Table, Kind::None]).is_ok());
        let err = lua.check_kinds(&[Kind::String, Kind::Function]).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { position: 2, expected: "Function", found: "Table" }));
    }

    #[test]
    fn test_without_stdlib() {
        let lua = Lua::with_config(BridgeConfig::new(false, 8, false)).expect("Failed to create Lua");
        assert_eq!(lua.get_global("print").unwrap(), Kind::Nil);
        assert_eq!(lua.do_string("return 6 * 7").unwrap(), vec![Value::Integer(42)]);
    }
}
