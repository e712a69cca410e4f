//! The error kinds surfaced at the engine's boundaries. Rule loading, chain loading, and
//! dispatching all degrade gracefully: most of these are logged and absorbed rather than
//! propagated to the host, which only ever sees the integer codes of the exported functions.
//! Outcomes that the ABI reports as plain integer codes or warnings (a conflicting pointer
//! assertion, an event no rule matched, an incomplete entry section) have no variant here.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RouteError>;

#[derive(Debug, Error)]
pub enum RouteError {
    /// Null or out-of-range input at a public boundary.
    #[error("invalid argument: {0}")]
    BadArg(&'static str),

    /// A rule file could not be opened or read. Not fatal; previously loaded rules persist.
    #[error("could not open {path}: {source}")]
    FileOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Arithmetic or capacity overflow while growing a side table.
    #[error("capacity overflow in {0}")]
    Overflow(&'static str),

    /// The chain loader or the dispatcher detected a repeat of an ancestor already on the stack.
    #[error("cycle detected at {plugin}.{interface}")]
    Cycle { plugin: String, interface: String },

    /// The validation probe call into a target function reported failure.
    #[error("validation probe failed for {0}")]
    ProbeFailed(String),

    /// The platform shim could not load a target binary.
    #[error("failed to load library {0}")]
    LibraryLoad(String),

    /// The target binary loaded but does not export the requested interface.
    #[error("symbol {symbol} not found in {plugin}")]
    SymbolNotFound { plugin: String, symbol: String },

    /// The target exports no usable metadata surface, so its interface cannot be sized.
    #[error("no interface metadata for {plugin}.{interface}")]
    NoMetadata { plugin: String, interface: String },

    /// An interface state row was entered while its `in_use` flag was already set.
    #[error("recursive re-entry into {plugin}.{interface}")]
    Reentry { plugin: String, interface: String },

    /// A parameter pack failed its structural validation.
    #[error("parameter pack failed validation")]
    PackInvalid,

    /// A rule supplied a parameter index outside the target's declared arity.
    #[error("parameter index {index} out of range for {plugin}.{interface}")]
    ParamOutOfRange {
        plugin: String,
        interface: String,
        index: i32,
    },
}
