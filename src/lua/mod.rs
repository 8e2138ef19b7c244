/// Lua state handle and the host state shared with callbacks
pub mod bridge;
/// Stack protocol: push, read, tables, globals, protected calls
mod stack;
/// Host closures callable from Lua
mod closure;
/// Host objects embedded as userdata
mod objreg;
mod library;
mod reference;
pub mod embedder_api;

pub use bridge::{Lua, StackIndex};
pub use embedder_api::BridgeConfig;
pub use library::Library;
pub use objreg::{Embeddable, ObjectId, ObjectRef};
pub use reference::RegistryRef;
pub use stack::MULTRET;
