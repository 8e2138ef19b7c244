use crate::base::Value;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while moving values and calls across the bridge
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A stack slot did not hold the type an argument check or extraction asked for
    #[error("bad argument #{position} (expected {expected}, got {found})")]
    TypeMismatch {
        position: i32,
        expected: &'static str,
        found: &'static str,
    },

    /// Lua raised an error inside a protected call
    #[error("{message}")]
    Eval {
        message: String,
        /// The error object Lua raised, decoded where possible (nil otherwise)
        payload: Value,
    },

    /// A chunk failed to compile
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Lua could not allocate
    #[error("memory error: {0}")]
    Memory(String),

    /// A value on the stack has no host representation
    #[error("cannot represent Lua {found} value at position {position} on the host")]
    Unrepresentable { position: i32, found: &'static str },

    /// Tables cannot be indexed by nil or NaN
    #[error("invalid table key ({found})")]
    InvalidKey { found: &'static str },

    /// A registry reference was used after release (or was never issued)
    #[error("unknown registry reference {0}")]
    UnknownReference(i32),

    /// Names handed to Lua must not contain NUL bytes
    #[error("invalid name {0:?}: names must not contain NUL bytes")]
    InvalidName(String),

    #[error("invalid bridge configuration: {0}")]
    Config(String),

    /// Free-form failure reported by a host closure
    #[error("{0}")]
    External(String),
}

impl Error {
    /// Wraps any displayable failure so a host closure can return it with `?`
    pub fn external(e: impl std::fmt::Display) -> Self {
        Error::External(e.to_string())
    }

    pub fn is_type_mismatch(&self) -> bool {
        matches!(self, Error::TypeMismatch { .. })
    }
}

impl From<std::ffi::NulError> for Error {
    fn from(e: std::ffi::NulError) -> Self {
        let bytes = e.into_vec();
        Error::InvalidName(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}
