use std::ffi::CString;

use mlua_sys as ffi;
use tracing::{debug, trace};

use crate::base::{Kind, Result, StringTable, Value};
use crate::lua::bridge::Lua;

/// A named set of methods exposed to scripts as one table
#[derive(Clone, Debug, Default)]
pub struct Library {
    pub name: String,
    /// Installed on the library table and on its metatable, which doubles as `__index`
    pub instance_methods: StringTable,
    /// Installed on the library table only
    pub class_methods: StringTable,
    /// Installed on the metatable only (`__call`, `__tostring`, ...)
    pub meta_methods: StringTable,
}

impl Library {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn instance_method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&Lua) -> Result<usize> + 'static,
    {
        self.instance_methods.insert(name.to_string(), Value::function(f));
        self
    }

    pub fn class_method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&Lua) -> Result<usize> + 'static,
    {
        self.class_methods.insert(name.to_string(), Value::function(f));
        self
    }

    pub fn meta_method<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&Lua) -> Result<usize> + 'static,
    {
        self.meta_methods.insert(name.to_string(), Value::function(f));
        self
    }

    /// Adds a non-function class member, e.g. a constant
    pub fn class_value(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.class_methods.insert(name.to_string(), value.into());
        self
    }
}

impl Lua {
    /// Pushes a table for `lib`, attaching the metatable registered under `lib.name`.
    ///
    /// The metatable is only built when no metatable of that name exists yet. Returns whether
    /// this call created it.
    pub fn push_library(&self, lib: &Library) -> Result<bool> {
        let name = CString::new(lib.name.as_str())?;
        self.ensure_stack(4);

        self.create_table(0, lib.class_methods.len() + lib.instance_methods.len());
        for (key, value) in lib.class_methods.iter().chain(&lib.instance_methods) {
            self.push(value);
            self.raw_set_field(key, -2);
        }

        let created = unsafe { ffi::luaL_newmetatable(self.state, name.as_ptr()) } != 0;
        if created {
            for (key, value) in lib.instance_methods.iter().chain(&lib.meta_methods) {
                self.push(value);
                self.raw_set_field(key, -2);
            }
            if self.raw_get_field("__index", -1) == Kind::Nil {
                self.pop(1);
                self.push_from_stack(-1);
                self.raw_set_field("__index", -2);
            } else {
                self.pop(1);
            }
            debug!(
                library = %lib.name,
                instance = lib.instance_methods.len(),
                class = lib.class_methods.len(),
                meta = lib.meta_methods.len(),
                "registered library metatable"
            );
        } else {
            trace!(library = %lib.name, "library metatable already registered");
        }

        unsafe { ffi::lua_setmetatable(self.state, -2) };
        Ok(created)
    }

    /// [`Lua::push_library`], then stores the table in the global `lib.name`
    pub fn install_library(&self, lib: &Library) -> Result<bool> {
        let created = self.push_library(lib)?;
        self.set_global(&lib.name)?;
        Ok(created)
    }
}
