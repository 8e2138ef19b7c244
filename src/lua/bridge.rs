use std::cell::RefCell;
use std::any::Any;
use std::collections::HashMap;
use std::ffi::{c_int, c_void};
use std::rc::Rc;

use mlua_sys as ffi;
use tracing::debug;

use crate::base::{Error, Result};
use crate::lua::closure::FunctionStore;
use crate::lua::embedder_api::BridgeConfig;
use crate::lua::objreg::ObjectRegistry;

/// Index into the Lua stack. Positive values count from the bottom (1-based),
/// negative values from the top (-1 is the top slot).
pub type StackIndex = i32;

/// Host-side state shared by every handle onto one Lua state
pub(crate) struct Shared {
    pub(crate) config: BridgeConfig,
    pub(crate) functions: RefCell<FunctionStore>,
    pub(crate) objects: RefCell<ObjectRegistry>,
    /// Live registry keys and how many `RegistryRef`s hold each one.
    /// Every nil value pins the same key, so counts can exceed one.
    pub(crate) references: RefCell<HashMap<c_int, usize>>,
    /// First panic caught in a host closure, resumed at the next protected-call boundary
    pub(crate) pending_panic: RefCell<Option<Box<dyn Any + Send + 'static>>>,
}

// Address is the registry key for the Shared pointer
static SHARED_KEY: u8 = 0;

fn shared_key() -> *const c_void {
    &SHARED_KEY as *const u8 as *const c_void
}

/// Handle onto an embedded Lua state.
///
/// This struct is not thread safe: the state, its stack and the keep-alive registry must all
/// be driven from one thread. The handle passed to host closures refers to the same state and
/// registries, but does not own the state.
pub struct Lua {
    pub(crate) state: *mut ffi::lua_State,
    pub(crate) shared: Rc<Shared>,
    owned: bool,
}

impl Lua {
    /// Creates a new Lua state with the default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> Result<Self> {
        let state = unsafe { ffi::luaL_newstate() };
        if state.is_null() {
            return Err(Error::Memory("failed to allocate a Lua state".into()));
        }

        let open_libs = config.open_libs;
        let shared = Rc::new(Shared {
            config,
            functions: RefCell::new(FunctionStore::new()),
            objects: RefCell::new(ObjectRegistry::new()),
            references: RefCell::new(HashMap::new()),
            pending_panic: RefCell::new(None),
        });

        unsafe {
            if open_libs {
                ffi::luaL_openlibs(state);
            }
            ffi::lua_pushlightuserdata(state, Rc::as_ptr(&shared) as *mut c_void);
            ffi::lua_rawsetp(state, ffi::LUA_REGISTRYINDEX, shared_key());
        }

        let lua = Lua {
            state,
            shared,
            owned: true,
        };
        lua.init_object_cache();

        debug!(open_libs, "created Lua state");
        Ok(lua)
    }

    /// Rebuilds a non-owning handle from inside a callback
    pub(crate) unsafe fn borrowed(state: *mut ffi::lua_State) -> Option<Lua> {
        let ptr = shared_ptr(state);
        if ptr.is_null() {
            return None;
        }
        Rc::increment_strong_count(ptr);
        Some(Lua {
            state,
            shared: Rc::from_raw(ptr),
            owned: false,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    /// Runs a full garbage collection cycle, finalizers included
    pub fn collect_garbage(&self) {
        unsafe {
            ffi::lua_gc(self.state, ffi::LUA_GCCOLLECT);
        }
        // script finalizers may have called into a host closure that panicked
        self.resume_pending_panic();
    }

    /// Number of embedded host objects Lua can still reach
    pub fn object_count(&self) -> usize {
        self.shared.objects.borrow().len()
    }

    /// Number of host closures Lua can still reach
    pub fn function_count(&self) -> usize {
        self.shared.functions.borrow().len()
    }

    /// Number of live registry references
    pub fn reference_count(&self) -> usize {
        self.shared.references.borrow().values().sum()
    }
}

impl Drop for Lua {
    fn drop(&mut self) {
        if self.owned {
            debug!(
                objects = self.object_count(),
                functions = self.function_count(),
                "closing Lua state"
            );
            // Finalizers run here and still reach `shared`
            unsafe { ffi::lua_close(self.state) }
        }
    }
}

/// Reads the Shared pointer stored in the registry. Null if the state was not created by us.
pub(crate) unsafe fn shared_ptr(state: *mut ffi::lua_State) -> *const Shared {
    ffi::lua_rawgetp(state, ffi::LUA_REGISTRYINDEX, shared_key());
    let ptr = ffi::lua_touserdata(state, -1) as *const Shared;
    ffi::lua_pop(state, 1);
    ptr
}

/// Borrows the Shared state for the duration of a finalizer
pub(crate) unsafe fn shared_ref<'a>(state: *mut ffi::lua_State) -> Option<&'a Shared> {
    shared_ptr(state).as_ref()
}
