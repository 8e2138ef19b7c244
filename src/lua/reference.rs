use std::ffi::c_int;

use mlua_sys as ffi;
use tracing::trace;

use crate::base::{Error, Kind, Result, Value};
use crate::lua::bridge::{Lua, StackIndex};

/// A value pinned in the Lua registry.
///
/// Stays valid until [`Lua::release_reference`]. Unlike a stack position it survives calls
/// into Lua, which makes it the way to hold on to script callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistryRef {
    key: c_int,
}

impl RegistryRef {
    pub fn key(&self) -> i32 {
        self.key
    }
}

impl Lua {
    /// Pins the value at `position`. The stack is left unchanged.
    ///
    /// Nil values all share Lua's `LUA_REFNIL` key; each such reference stays valid until it
    /// is released itself.
    pub fn reference(&self, position: StackIndex) -> RegistryRef {
        self.push_from_stack(position);
        let key = unsafe { ffi::luaL_ref(self.state, ffi::LUA_REGISTRYINDEX) };
        *self.shared.references.borrow_mut().entry(key).or_insert(0) += 1;
        trace!(key, "pinned value");
        RegistryRef { key }
    }

    /// Pushes the pinned value
    pub fn push_reference(&self, reference: RegistryRef) -> Result<Kind> {
        self.check_reference(reference)?;
        Ok(self.raw_get_index(ffi::LUA_REGISTRYINDEX, reference.key as i64))
    }

    /// Unpins the value. Further use of `reference` fails with `UnknownReference`.
    pub fn release_reference(&self, reference: RegistryRef) -> Result<()> {
        let last = {
            let mut references = self.shared.references.borrow_mut();
            let Some(count) = references.get_mut(&reference.key) else {
                return Err(Error::UnknownReference(reference.key));
            };
            *count -= 1;
            if *count == 0 {
                references.remove(&reference.key);
                true
            } else {
                false
            }
        };
        if last {
            unsafe { ffi::luaL_unref(self.state, ffi::LUA_REGISTRYINDEX, reference.key) };
        }
        trace!(key = reference.key, "released value");
        Ok(())
    }

    /// Calls the pinned value with `args`, returning up to `nresults` results
    /// (all of them with [`MULTRET`](crate::lua::MULTRET))
    pub fn call_reference(
        &self,
        reference: RegistryRef,
        args: &[Value],
        nresults: i32,
    ) -> Result<Vec<Value>> {
        self.check_reference(reference)?;
        self.ensure_stack(args.len() + 1);
        let base = self.top();
        self.raw_get_index(ffi::LUA_REGISTRYINDEX, reference.key as i64);
        for arg in args {
            self.push(arg);
        }
        self.call(args.len(), nresults)?;
        self.collect_results(base)
    }

    fn check_reference(&self, reference: RegistryRef) -> Result<()> {
        if self.shared.references.borrow().contains_key(&reference.key) {
            Ok(())
        } else {
            Err(Error::UnknownReference(reference.key))
        }
    }
}
