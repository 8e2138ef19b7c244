//! Host closures as Lua functions.
//!
//! A pushed closure lives in a [`FunctionStore`] slot. Lua sees a C closure over one
//! upvalue: a small userdata holding the slot index. When Lua collects the function the
//! userdata goes with it and its `__gc` frees the slot.
//!
//! Errors raised by a host closure travel through Lua as a [`Failure`] userdata and are turned
//! back into host errors at the next protected call. A panic also raises a failure, so the
//! script unwinds, but its payload is parked host-side and resumed when the protected call
//! returns, even if a script `pcall` swallowed the failure on the way.

use std::any::Any;
use std::collections::VecDeque;
use std::ffi::c_int;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use mlua_sys as ffi;
use tracing::{debug, trace, warn};

use crate::base::{Error, Function, Result};
use crate::lua::bridge::{shared_ref, Lua, StackIndex};

const FUNCTION_HANDLE_MT: &std::ffi::CStr = c"hostlua.function";
const FAILURE_MT: &std::ffi::CStr = c"hostlua.failure";

/// Slot table for host closures. Freed slots are reused.
pub(crate) struct FunctionStore {
    slots: Vec<Option<Function>>,
    free: VecDeque<usize>,
}

impl FunctionStore {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: VecDeque::new(),
        }
    }

    pub(crate) fn add(&mut self, f: Function) -> usize {
        if let Some(index) = self.free.pop_front() {
            self.slots[index] = Some(f);
            return index;
        }
        self.slots.push(Some(f));
        self.slots.len() - 1
    }

    pub(crate) fn get(&self, index: usize) -> Option<Function> {
        self.slots.get(index).and_then(|f| f.clone())
    }

    /// Empties the slot and hands back its closure so the caller can drop it outside the borrow
    pub(crate) fn take(&mut self, index: usize) -> Option<Function> {
        let f = self.slots.get_mut(index)?.take()?;
        self.free.push_back(index);
        Some(f)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

/// What a failed host closure hands back to Lua
pub(crate) enum Failure {
    Error(Error),
    /// The payload itself waits in `Shared::pending_panic`
    Panic(String),
}

impl Lua {
    /// Pushes a host closure as a Lua function
    pub fn push_function(&self, f: Function) {
        let index = self.shared.functions.borrow_mut().add(f);
        trace!(index, "registered host closure");
        unsafe {
            let handle = ffi::lua_newuserdatauv(self.state, mem::size_of::<usize>(), 0) as *mut usize;
            ptr::write(handle, index);
            if ffi::luaL_newmetatable(self.state, FUNCTION_HANDLE_MT.as_ptr()) != 0 {
                ffi::lua_pushcfunction(self.state, release_function);
                ffi::lua_setfield(self.state, -2, c"__gc".as_ptr());
            }
            ffi::lua_setmetatable(self.state, -2);
            ffi::lua_pushcclosure(self.state, trampoline, 1);
        }
    }

    /// Convenience over [`Lua::push_function`] for plain closures
    pub fn push_closure<F>(&self, f: F)
    where
        F: Fn(&Lua) -> Result<usize> + 'static,
    {
        self.push_function(std::rc::Rc::new(f))
    }

    /// Takes the failure out of a failure object at `position`.
    ///
    /// `None` if the slot is not a failure object; `Some(None)` if it was already taken.
    pub(crate) fn take_failure(&self, position: StackIndex) -> Option<Option<Failure>> {
        unsafe {
            let slot = ffi::luaL_testudata(self.state, position, FAILURE_MT.as_ptr())
                as *mut Option<Failure>;
            if slot.is_null() {
                return None;
            }
            Some((*slot).take())
        }
    }

    /// Resumes a panic caught in a host closure since the last check
    pub(crate) fn resume_pending_panic(&self) {
        let pending = self.shared.pending_panic.borrow_mut().take();
        if let Some(payload) = pending {
            panic::resume_unwind(payload);
        }
    }

    pub(crate) fn has_pending_panic(&self) -> bool {
        self.shared.pending_panic.borrow().is_some()
    }
}

/// Entry point Lua calls for every host closure
unsafe extern "C-unwind" fn trampoline(state: *mut ffi::lua_State) -> c_int {
    match invoke(state) {
        Some(nresults) => nresults,
        // Nothing with a destructor is alive in this frame
        None => ffi::lua_error(state),
    }
}

/// Runs the closure. On failure, leaves a failure object on top and returns `None`.
unsafe fn invoke(state: *mut ffi::lua_State) -> Option<c_int> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<c_int> {
        let nargs = ffi::lua_gettop(state);
        let index = *(ffi::lua_touserdata(state, ffi::lua_upvalueindex(1)) as *const usize);
        let lua = Lua::borrowed(state)
            .ok_or_else(|| Error::External("Lua state has no host bridge attached".into()))?;
        let f = lua
            .shared
            .functions
            .borrow()
            .get(index)
            .ok_or_else(|| Error::External(format!("host closure {index} was released")))?;

        let declared = f(&lua)?;

        let produced = lua.top() - nargs;
        if produced != declared as c_int {
            panic!(
                "host closure declared {declared} results but left {produced} values above its {nargs} arguments"
            );
        }
        Ok(declared as c_int)
    }));

    match outcome {
        Ok(Ok(nresults)) => Some(nresults),
        Ok(Err(e)) => {
            push_failure(state, Failure::Error(e));
            None
        }
        Err(payload) => {
            let message = panic_message(&*payload).to_string();
            park_panic(state, payload);
            push_failure(state, Failure::Panic(message));
            None
        }
    }
}

/// Keeps the first panic until the host's protected call returns
unsafe fn park_panic(state: *mut ffi::lua_State, payload: Box<dyn Any + Send + 'static>) {
    let Some(shared) = shared_ref(state) else {
        warn!(message = panic_message(&*payload), "host closure panicked outside a bridged state");
        return;
    };
    let mut pending = shared.pending_panic.borrow_mut();
    if pending.is_none() {
        *pending = Some(payload);
    } else {
        warn!(message = panic_message(&*payload), "dropping host closure panic, an earlier one is pending");
    }
}

unsafe fn push_failure(state: *mut ffi::lua_State, failure: Failure) {
    let slot = ffi::lua_newuserdatauv(state, mem::size_of::<Option<Failure>>(), 0)
        as *mut Option<Failure>;
    ptr::write(slot, Some(failure));
    if ffi::luaL_newmetatable(state, FAILURE_MT.as_ptr()) != 0 {
        ffi::lua_pushcfunction(state, drop_failure);
        ffi::lua_setfield(state, -2, c"__gc".as_ptr());
        ffi::lua_pushcfunction(state, failure_to_string);
        ffi::lua_setfield(state, -2, c"__tostring".as_ptr());
    }
    ffi::lua_setmetatable(state, -2);
}

unsafe extern "C-unwind" fn drop_failure(state: *mut ffi::lua_State) -> c_int {
    let slot = ffi::lua_touserdata(state, 1) as *mut Option<Failure>;
    if !slot.is_null() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| ptr::drop_in_place(slot))) {
            warn!(message = panic_message(&*payload), "panic while dropping a host error");
        }
        ptr::write(slot, None);
    }
    0
}

unsafe extern "C-unwind" fn failure_to_string(state: *mut ffi::lua_State) -> c_int {
    let slot = ffi::luaL_testudata(state, 1, FAILURE_MT.as_ptr()) as *const Option<Failure>;
    let message = match slot.as_ref() {
        Some(Some(Failure::Error(e))) => e.to_string(),
        Some(Some(Failure::Panic(message))) => format!("host closure panicked: {message}"),
        Some(None) => "host error (already handled)".to_string(),
        None => "not a host error".to_string(),
    };
    ffi::lua_pushlstring(state, message.as_ptr() as *const _, message.len());
    1
}

fn panic_message(p: &(dyn Any + Send)) -> &str {
    if let Some(s) = p.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = p.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

/// `__gc` of a function handle: frees the closure slot
unsafe extern "C-unwind" fn release_function(state: *mut ffi::lua_State) -> c_int {
    let handle = ffi::lua_touserdata(state, 1) as *mut usize;
    let Some(shared) = shared_ref(state) else {
        return 0;
    };
    if handle.is_null() || *handle == usize::MAX {
        return 0;
    }
    let index = ptr::replace(handle, usize::MAX);
    let released = panic::catch_unwind(AssertUnwindSafe(|| {
        let f = shared.functions.borrow_mut().take(index);
        debug!(index, "released host closure");
        drop(f);
    }));
    if let Err(payload) = released {
        warn!(index, message = panic_message(&*payload), "panic while releasing a host closure");
    }
    0
}
