//! A cross-plugin parameter-routing runtime. Loaded next to a set of otherwise unrelated
//! plugins, it intercepts calls on "source" plugins and dispatches their arguments and return
//! values into "target" plugins under declarative `.nxpt` rules, marshalling everything through a
//! self-describing parameter packet any callee can decode.

#[macro_use]
pub mod debug;

pub mod api;
pub mod chain;
pub mod context;
pub mod dispatch;
pub mod entry;
pub mod error;
pub mod pack;
pub mod platform;
pub mod rules;
pub mod util;
pub mod validate;

// Re-exported because the `nx_*!()` macros expand to `$crate::log::...` calls.
pub use log;
