// NOTE: Exporting macros in Rust is a bit weird. `#[macro_export]` causes them to be exported to
//       the crate root, but that makes it difficult to include just the macros without using
//       `#[macro_use] extern crate nxroute;`. That's why the macros are also re-exported from this
//       module.

/// Write something to the logger at the INFO level. This is the level the routing engine narrates
/// rule matches and plugin calls at, and the level the `DisableInfoLog` rule-file option mutes.
///
/// The logger's behavior can be controlled by setting the `NXROUTE_LOG` environment variable to:
///
/// - `stderr`, in which case the log output always gets written to STDERR.
/// - A file path, in which case the output gets appended to the end of that file which will be
///   created if necessary.
#[macro_export]
macro_rules! nx_log {
    ($($args:tt)*) => (
        $crate::log::info!($($args)*)
    );
}
pub use nx_log;

/// Similar to `nx_log!()`, for recoverable problems: unreadable rule files, rejected rules,
/// detected cycles. Never muted by `DisableInfoLog`.
#[macro_export]
macro_rules! nx_warn {
    ($($args:tt)*) => (
        $crate::log::warn!($($args)*)
    );
}
pub use nx_warn;

/// Similar to `nx_log!()`, more scream-y. Used for printing fatal errors.
#[macro_export]
macro_rules! nx_error {
    ($($args:tt)*) => (
        $crate::log::error!($($args)*)
    );
}
pub use nx_error;

/// Analogues to the `dbg!()` macro, but respecting the `NXROUTE_LOG` environment variable and with
/// all of the same logging features as the other `nx_*!()` macros. Like the `nx_debug_assert*!()`
/// macros, this is only shown when compiling in debug mode, but the macro will still return the
/// value in non-debug modes.
#[macro_export]
macro_rules! nx_dbg {
    () => {
        $crate::log::debug!("");
    };
    ($val:expr $(,)?) => {
        // Match here acts as a let-binding: https://stackoverflow.com/questions/48732263/why-is-rusts-assert-eq-implemented-using-a-match/48732525#48732525
        match $val {
            tmp => {
                $crate::log::debug!("{} = {:#?}", stringify!($val), &tmp);
                tmp
            }
        }
    };
    ($($val:expr),+ $(,)?) => { ($($crate::nx_dbg!($val)),+,) };
}
pub use nx_dbg;

/// A `debug_assert!()` analogue that prints the error with line number information instead of
/// panicking. A host process should never be taken down by its routing layer.
#[macro_export]
macro_rules! nx_debug_assert {
    ($cond:expr $(,)?) => (
        if cfg!(debug_assertions) && !$cond {
            $crate::log::debug!(concat!("Debug assertion failed: ", stringify!($cond)));
        }
    );
    ($cond:expr, $format:expr $(, $($args:tt)*)?) => (
        if cfg!(debug_assertions) && !$cond {
            $crate::log::debug!(concat!("Debug assertion failed: ", stringify!($cond), ", ", $format), $($($args)*)?);
        }
    );
}
pub use nx_debug_assert;

/// An unconditional debug assertion failure, for if the condition has already been checked
/// elsewhere.
#[macro_export]
macro_rules! nx_debug_assert_failure {
    () => (
        if cfg!(debug_assertions) {
            $crate::log::debug!("Debug assertion failed");
        }
    );
    ($format:expr $(, $($args:tt)*)?) => (
        if cfg!(debug_assertions) {
            $crate::log::debug!(concat!("Debug assertion failed: ", $format), $($($args)*)?);
        }
    );
}
pub use nx_debug_assert_failure;
