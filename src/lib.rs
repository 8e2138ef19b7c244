//! Typed bridge between host values and an embedded Lua 5.4 state.
//!
//! Host values cross as [`Value`]s or through [`Marshal`] implementations, host closures
//! become Lua functions, and host objects are embedded as userdata that Lua's collector
//! finalizes. A [`Library`] groups closures into a script-visible table.

pub mod base;
pub mod lua;

pub use base::{
    Error, Function, FunctionBox, Kind, Marshal, Nil, Point, Result, StringTable, Table,
    TypeChecker, Value,
};
pub use lua::{
    BridgeConfig, Embeddable, Library, Lua, ObjectId, ObjectRef, RegistryRef, StackIndex,
    MULTRET,
};

/// Default limit on table nesting when reading values back from Lua
pub const MAX_TABLE_DEPTH: usize = 32;
