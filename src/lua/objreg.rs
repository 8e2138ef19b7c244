//! Host objects embedded into Lua as userdata.
//!
//! The userdata itself only carries an [`ObjectId`]. The object lives host-side in the
//! [`ObjectRegistry`], which keeps it alive until Lua's collector finalizes the userdata.

use std::any::Any;
use std::collections::HashMap;
use std::ffi::{c_int, c_void, CStr, CString};
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::Rc;

use mlua_sys as ffi;
use tracing::{debug, warn};

use crate::base::{Kind, Result, StringTable};
use crate::lua::bridge::{shared_ref, Lua, StackIndex};

/// Metatable field marking userdata created by [`Lua::embed`]
const EMBED_MARKER: &std::ffi::CStr = c"__hostlua_object";

// Address is the registry key of the id -> userdata cache
static OBJECT_CACHE_KEY: u8 = 0;

fn object_cache_key() -> *const c_void {
    &OBJECT_CACHE_KEY as *const u8 as *const c_void
}

/// A host type that can be embedded into Lua
pub trait Embeddable: Any + Sized {
    /// Stable name of the type. Also names its metatable, so it must be unique per type
    fn type_name() -> &'static str;

    /// Called exactly once, after Lua has dropped its last reference
    fn finalize(&self) {}

    /// Backs the `==` operator between two embedded objects of this type
    fn equals(&self, other: &Self) -> bool;

    /// Methods reachable as `obj:name(...)` from scripts
    fn instance_methods() -> StringTable {
        StringTable::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// An ID for an object in the object registry
pub struct ObjectId(u64);

impl ObjectId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Entry {
    type_name: &'static str,
    object: Rc<dyn Any>,
    finalize: fn(&dyn Any),
}

/// Keep-alive set for embedded objects. Entries are added by `embed` and removed only by the
/// userdata finalizer.
pub(crate) struct ObjectRegistry {
    entries: HashMap<ObjectId, Entry>,
    next_id: u64,
}

impl ObjectRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    fn insert<T: Embeddable>(&mut self, object: Rc<T>) -> ObjectId {
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                type_name: T::type_name(),
                object,
                finalize: finalize_entry::<T>,
            },
        );
        id
    }

    fn get(&self, id: ObjectId) -> Option<ObjectRef> {
        self.entries.get(&id).map(|e| ObjectRef {
            id,
            type_name: e.type_name,
            object: e.object.clone(),
        })
    }

    fn remove(&mut self, id: ObjectId) -> Option<Entry> {
        self.entries.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

fn finalize_entry<T: Embeddable>(object: &dyn Any) {
    if let Some(object) = object.downcast_ref::<T>() {
        object.finalize();
    }
}

/// Host-side handle onto an embedded object
#[derive(Clone)]
pub struct ObjectRef {
    id: ObjectId,
    type_name: &'static str,
    object: Rc<dyn Any>,
}

impl ObjectRef {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns the object if it is a `T`
    pub fn downcast<T: Embeddable>(&self) -> Option<Rc<T>> {
        self.object.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.type_name, self.id)
    }
}

impl Lua {
    pub(crate) fn init_object_cache(&self) {
        unsafe {
            ffi::lua_createtable(self.state, 0, 0);
            ffi::lua_createtable(self.state, 0, 1);
            ffi::lua_pushstring(self.state, c"v".as_ptr());
            ffi::lua_setfield(self.state, -2, c"__mode".as_ptr());
            ffi::lua_setmetatable(self.state, -2);
            ffi::lua_rawsetp(self.state, ffi::LUA_REGISTRYINDEX, object_cache_key());
        }
    }

    /// Moves `object` into Lua and pushes the userdata standing for it.
    ///
    /// The object stays in the keep-alive registry until Lua finalizes the userdata.
    pub fn embed<T: Embeddable>(&self, object: T) -> Result<ObjectRef> {
        let name = CString::new(T::type_name())?;
        let object = Rc::new(object);
        let id = self.shared.objects.borrow_mut().insert(object.clone());

        self.ensure_stack(4);
        unsafe {
            let payload =
                ffi::lua_newuserdatauv(self.state, mem::size_of::<u64>(), 0) as *mut u64;
            ptr::write(payload, id.get());
            self.push_object_metatable::<T>(&name);
            ffi::lua_setmetatable(self.state, -2);

            ffi::lua_rawgetp(self.state, ffi::LUA_REGISTRYINDEX, object_cache_key());
            ffi::lua_pushvalue(self.state, -2);
            ffi::lua_rawseti(self.state, -2, id.get() as ffi::lua_Integer);
            ffi::lua_pop(self.state, 1);
        }

        debug!(%id, type_name = T::type_name(), "embedded object");
        Ok(ObjectRef {
            id,
            type_name: T::type_name(),
            object,
        })
    }

    /// Reads the slot back as a `T`.
    ///
    /// `None` unless the slot holds userdata carrying `T`'s metatable whose object is still
    /// registered.
    pub fn extract<T: Embeddable>(&self, position: StackIndex) -> Option<Rc<T>> {
        let name = CString::new(T::type_name()).ok()?;
        let id = unsafe {
            let payload =
                ffi::luaL_testudata(self.state, position, name.as_ptr()) as *const u64;
            if payload.is_null() {
                return None;
            }
            *payload
        };
        self.shared
            .objects
            .borrow()
            .get(ObjectId(id))?
            .downcast::<T>()
    }

    /// Reads any userdata created by [`Lua::embed`], whatever its type
    pub fn get_object(&self, position: StackIndex) -> Option<ObjectRef> {
        let id = unsafe {
            if ffi::lua_type(self.state, position) != ffi::LUA_TUSERDATA {
                return None;
            }
            if ffi::lua_getmetatable(self.state, position) == 0 {
                return None;
            }
            let marked = ffi::lua_getfield(self.state, -1, EMBED_MARKER.as_ptr()) != ffi::LUA_TNIL;
            ffi::lua_pop(self.state, 2);
            if !marked {
                return None;
            }
            *(ffi::lua_touserdata(self.state, position) as *const u64)
        };
        self.shared.objects.borrow().get(ObjectId(id))
    }

    /// Pushes the userdata for an embedded object, or nil if Lua has already collected it
    pub fn push_object(&self, object: &ObjectRef) {
        self.ensure_stack(2);
        unsafe {
            ffi::lua_rawgetp(self.state, ffi::LUA_REGISTRYINDEX, object_cache_key());
            let kind = ffi::lua_rawgeti(self.state, -1, object.id.get() as ffi::lua_Integer);
            ffi::lua_remove(self.state, -2);
            if kind != ffi::LUA_TUSERDATA {
                warn!(id = %object.id, type_name = object.type_name, "pushing an object Lua has already collected");
                ffi::lua_pop(self.state, 1);
                ffi::lua_pushnil(self.state);
            }
        }
    }

    /// Pushes the metatable for `T`, filling in the object fields the first time.
    ///
    /// The metatable may already exist without them when a library of the same name was
    /// installed first; its entries are kept.
    unsafe fn push_object_metatable<T: Embeddable>(&self, name: &CString) {
        ffi::luaL_newmetatable(self.state, name.as_ptr());
        let marked = ffi::lua_getfield(self.state, -1, EMBED_MARKER.as_ptr()) != ffi::LUA_TNIL;
        ffi::lua_pop(self.state, 1);
        if marked {
            return;
        }
        debug!(type_name = T::type_name(), "preparing object metatable");

        ffi::lua_pushboolean(self.state, 1);
        ffi::lua_setfield(self.state, -2, EMBED_MARKER.as_ptr());

        ffi::lua_pushcfunction(self.state, finalize_object);
        ffi::lua_setfield(self.state, -2, c"__gc".as_ptr());

        ffi::lua_pushcfunction(self.state, object_to_string);
        ffi::lua_setfield(self.state, -2, c"__tostring".as_ptr());

        self.push_closure(|lua| {
            let equal = match (lua.extract::<T>(1), lua.extract::<T>(2)) {
                (Some(a), Some(b)) => Rc::ptr_eq(&a, &b) || a.equals(&b),
                _ => false,
            };
            lua.push_bool(equal);
            Ok(1)
        });
        ffi::lua_setfield(self.state, -2, c"__eq".as_ptr());

        let methods = T::instance_methods();
        let has_index = self.raw_get_field("__index", -1) != Kind::Nil;
        self.pop(1);
        if !methods.is_empty() && !has_index {
            self.create_table(0, methods.len());
            for (name, method) in &methods {
                self.push(method);
                self.raw_set_field(name, -2);
            }
            ffi::lua_setfield(self.state, -2, c"__index".as_ptr());
        }
    }
}

/// `__gc` of embedded objects: drop from the registry, then run the teardown hook
unsafe extern "C-unwind" fn finalize_object(state: *mut ffi::lua_State) -> c_int {
    let payload = ffi::lua_touserdata(state, 1) as *mut u64;
    if payload.is_null() {
        return 0;
    }
    let id = ptr::replace(payload, 0);
    if id == 0 {
        return 0;
    }
    let Some(shared) = shared_ref(state) else {
        return 0;
    };
    let finalized = panic::catch_unwind(AssertUnwindSafe(|| {
        let entry = shared.objects.borrow_mut().remove(ObjectId(id));
        if let Some(entry) = entry {
            debug!(id, type_name = entry.type_name, "finalizing object");
            (entry.finalize)(&*entry.object);
        }
    }));
    if let Err(payload) = finalized {
        let message = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("<non-string panic payload>");
        warn!(id, message, "object teardown panicked");
    }
    0
}

/// `__tostring` of embedded objects. Anything else sharing the metatable (a library table of
/// the same name) renders the way Lua does by default.
unsafe extern "C-unwind" fn object_to_string(state: *mut ffi::lua_State) -> c_int {
    let payload = if ffi::lua_type(state, 1) == ffi::LUA_TUSERDATA {
        ffi::lua_touserdata(state, 1) as *const u64
    } else {
        ptr::null()
    };
    let id = if payload.is_null() { 0 } else { *payload };
    let type_name = shared_ref(state).and_then(|shared| {
        shared
            .objects
            .try_borrow()
            .ok()
            .and_then(|objects| objects.get(ObjectId(id)).map(|o| o.type_name))
    });
    let text = match type_name {
        Some(type_name) => format!("{type_name}: {id}"),
        None => default_to_string(state),
    };
    ffi::lua_pushlstring(state, text.as_ptr() as *const _, text.len());
    1
}

unsafe fn default_to_string(state: *mut ffi::lua_State) -> String {
    let field = ffi::luaL_getmetafield(state, 1, c"__name".as_ptr());
    let name = if field == ffi::LUA_TSTRING {
        let name = CStr::from_ptr(ffi::lua_tostring(state, -1)).to_string_lossy().into_owned();
        ffi::lua_pop(state, 1);
        name
    } else {
        if field != ffi::LUA_TNIL {
            ffi::lua_pop(state, 1);
        }
        CStr::from_ptr(ffi::lua_typename(state, ffi::lua_type(state, 1)))
            .to_string_lossy()
            .into_owned()
    };
    format!("{name}: {:p}", ffi::lua_topointer(state, 1))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::base::Value;

    struct Window {
        handle: u32,
        title: String,
        finalized: Rc<Cell<u32>>,
    }

    impl Window {
        fn new(handle: u32, finalized: &Rc<Cell<u32>>) -> Self {
            Self {
                handle,
                title: format!("window {handle}"),
                finalized: finalized.clone(),
            }
        }
    }

    impl Embeddable for Window {
        fn type_name() -> &'static str {
            "Window"
        }

        fn finalize(&self) {
            self.finalized.set(self.finalized.get() + 1);
        }

        fn equals(&self, other: &Self) -> bool {
            self.handle == other.handle
        }

        fn instance_methods() -> StringTable {
            let mut methods = StringTable::new();
            methods.insert(
                "title".into(),
                Value::function(|lua| {
                    let window = lua.extract::<Window>(1).ok_or(crate::Error::TypeMismatch {
                        position: 1,
                        expected: "Window",
                        found: lua.kind(1).name(),
                    })?;
                    lua.push_string(&window.title);
                    Ok(1)
                }),
            );
            methods
        }
    }

    struct Screen;

    impl Embeddable for Screen {
        fn type_name() -> &'static str {
            "Screen"
        }

        fn equals(&self, _: &Self) -> bool {
            true
        }
    }

    #[test]
    fn test_lifetime() {
        let lua = Lua::new().unwrap();
        let finalized = Rc::new(Cell::new(0));

        lua.embed(Window::new(1, &finalized)).unwrap();
        assert_eq!(lua.object_count(), 1);
        lua.collect_garbage();
        assert_eq!(lua.object_count(), 1);
        assert_eq!(finalized.get(), 0);

        lua.pop(1);
        lua.collect_garbage();
        assert_eq!(lua.object_count(), 0);
        assert_eq!(finalized.get(), 1);

        lua.collect_garbage();
        drop(lua);
        assert_eq!(finalized.get(), 1);
    }

    #[test]
    fn test_finalized_on_close() {
        let finalized = Rc::new(Cell::new(0));
        {
            let lua = Lua::new().unwrap();
            lua.embed(Window::new(1, &finalized)).unwrap();
            lua.set_global("w").unwrap();
        }
        assert_eq!(finalized.get(), 1);
    }

    #[test]
    fn test_extract() {
        let lua = Lua::new().unwrap();
        let finalized = Rc::new(Cell::new(0));
        lua.embed(Window::new(7, &finalized)).unwrap();

        let window = lua.extract::<Window>(-1).unwrap();
        assert_eq!(window.handle, 7);
        assert!(lua.extract::<Screen>(-1).is_none());

        lua.push_integer(7);
        assert!(lua.extract::<Window>(-1).is_none());
        lua.push_string("Window");
        assert!(lua.extract::<Window>(-1).is_none());
        lua.create_table(0, 0);
        assert!(lua.extract::<Window>(-1).is_none());
    }

    #[test]
    fn test_other_userdata_is_not_an_object() {
        let lua = Lua::new().unwrap();
        lua.push_closure(|_| Ok(0));
        assert!(lua.get(-1).is_none());

        // the io library's file handles are foreign userdata
        lua.get_global("io").unwrap();
        lua.get_field("stdout", -1).unwrap();
        assert_eq!(lua.kind(-1), crate::Kind::Userdata);
        assert!(lua.get(-1).is_none());
        assert!(lua.get_object(-1).is_none());
    }

    #[test]
    fn test_equality() {
        let lua = Lua::new().unwrap();
        let finalized = Rc::new(Cell::new(0));
        lua.embed(Window::new(1, &finalized)).unwrap();
        lua.set_global("a").unwrap();
        lua.embed(Window::new(1, &finalized)).unwrap();
        lua.set_global("b").unwrap();
        lua.embed(Window::new(2, &finalized)).unwrap();
        lua.set_global("c").unwrap();
        lua.embed(Screen).unwrap();
        lua.set_global("s").unwrap();

        let out = lua
            .do_string("return a == b, a == c, rawequal(a, b), a == a, a == s")
            .unwrap();
        assert_eq!(
            out,
            vec![
                Value::Bool(true),
                Value::Bool(false),
                Value::Bool(false),
                Value::Bool(true),
                Value::Bool(false),
            ]
        );
    }

    #[test]
    fn test_get_returns_object() {
        let lua = Lua::new().unwrap();
        let finalized = Rc::new(Cell::new(0));
        let embedded = lua.embed(Window::new(3, &finalized)).unwrap();
        lua.set_global("w").unwrap();

        let out = lua.do_string("return w, {w}").unwrap();
        let Value::Object(object) = &out[0] else {
            panic!("expected object, got {:?}", out[0]);
        };
        assert_eq!(object.id(), embedded.id());
        assert_eq!(object.type_name(), "Window");
        assert_eq!(object.downcast::<Window>().unwrap().handle, 3);
        assert!(object.downcast::<Screen>().is_none());

        let nested = out[1].as_table().unwrap();
        assert_eq!(nested.get(&Value::Integer(1)), Some(&out[0]));
    }

    #[test]
    fn test_push_object_is_the_same_userdata() {
        let lua = Lua::new().unwrap();
        let finalized = Rc::new(Cell::new(0));
        let embedded = lua.embed(Window::new(3, &finalized)).unwrap();
        lua.set_global("w").unwrap();

        lua.push(&Value::Object(embedded.clone()));
        lua.set_global("again").unwrap();
        assert_eq!(
            lua.do_string("return rawequal(w, again)").unwrap(),
            vec![Value::Bool(true)]
        );

        lua.do_string("w = nil again = nil").unwrap();
        lua.collect_garbage();
        assert_eq!(finalized.get(), 1);

        // the host handle outlives the userdata, but Lua can no longer see it
        lua.push_object(&embedded);
        assert_eq!(lua.kind(-1), crate::Kind::Nil);
        assert_eq!(embedded.downcast::<Window>().unwrap().handle, 3);
    }

    struct Fragile;

    impl Embeddable for Fragile {
        fn type_name() -> &'static str {
            "Fragile"
        }

        fn finalize(&self) {
            panic!("teardown failed");
        }

        fn equals(&self, _: &Self) -> bool {
            false
        }
    }

    #[test]
    fn test_panicking_teardown_is_contained() {
        let lua = Lua::new().unwrap();
        lua.embed(Fragile).unwrap();
        lua.pop(1);
        lua.collect_garbage();
        assert_eq!(lua.object_count(), 0);
        assert_eq!(lua.do_string("return 'alive'").unwrap(), vec![Value::from("alive")]);
    }

    #[test]
    fn test_tostring_of_table_sharing_the_metatable() {
        let lua = Lua::new().unwrap();
        let finalized = Rc::new(Cell::new(0));
        lua.embed(Window::new(4, &finalized)).unwrap();
        lua.set_global("w").unwrap();

        let out = lua
            .do_string(
                "local t = setmetatable({}, debug.getregistry().Window)
                 return tostring(t):match('^Window: 0x') ~= nil, tostring(w)",
            )
            .unwrap();
        assert_eq!(out[0], Value::Bool(true));
        assert!(out[1].as_str().unwrap().starts_with("Window: "));
        assert!(!out[1].as_str().unwrap().contains("0x"));
    }

    #[test]
    fn test_instance_methods() {
        let lua = Lua::new().unwrap();
        let finalized = Rc::new(Cell::new(0));
        lua.embed(Window::new(9, &finalized)).unwrap();
        lua.set_global("w").unwrap();

        assert_eq!(
            lua.do_string("return w:title()").unwrap(),
            vec![Value::from("window 9")]
        );
        assert!(lua.do_string("return w.title(5)").unwrap_err().is_type_mismatch());
        assert_eq!(
            lua.do_string("return tostring(w):match('^Window')").unwrap(),
            vec![Value::from("Window")]
        );
    }
}
