//! The process-wide routing context. Everything the engine owns lives here: the rule store, the
//! NXPT tracker, loaded plugin handles, interface state rows, the last-transferred-pointer slot,
//! and the entry configuration. Engine functions take `&mut RouteContext`; a pinned default
//! instance backs the exported C ABI.

use std::os::raw::c_void;

use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::chain::NxptTracker;
use crate::dispatch::state::InterfaceState;
use crate::error::{Result, RouteError};
use crate::pack::ParamType;
use crate::platform::{LibHandle, Platform, SystemPlatform};
use crate::rules::parser::EntryConfig;
use crate::rules::RuleStore;

/// The single-slot "last-transferred pointer" context `TransferPointer` maintains.
#[derive(Debug)]
pub struct StoredPointer {
    pub ptr: *mut c_void,
    pub tag: ParamType,
    pub type_name: Option<String>,
    pub size: usize,
}

impl Default for StoredPointer {
    fn default() -> StoredPointer {
        StoredPointer {
            ptr: std::ptr::null_mut(),
            tag: ParamType::Void,
            type_name: None,
            size: 0,
        }
    }
}

/// One loaded target binary, cached by plugin name.
#[derive(Debug)]
pub struct LoadedPlugin {
    pub name: String,
    pub path: String,
    pub handle: LibHandle,
}

pub struct RouteContext {
    pub platform: Box<dyn Platform + Send>,
    pub stored: StoredPointer,
    pub rules: RuleStore,
    pub tracker: NxptTracker,
    pub plugins: Vec<LoadedPlugin>,
    pub states: Vec<InterfaceState>,
    pub ignore_plugins: Vec<String>,
    pub enable_validation: bool,
    pub disable_info_log: bool,
    pub entry: EntryConfig,
    /// The engine's own on-disk path, resolved at attach time.
    pub library_path: Option<String>,
}

// The context holds raw pointers (stored pointer, resolved symbols). The runtime is
// single-threaded by contract; the façade Mutex is the only thing that ever hands the context
// across threads.
unsafe impl Send for RouteContext {}

impl RouteContext {
    pub fn new(platform: Box<dyn Platform + Send>) -> RouteContext {
        RouteContext {
            platform,
            stored: StoredPointer::default(),
            rules: RuleStore::new(),
            tracker: NxptTracker::new(),
            plugins: Vec::new(),
            states: Vec::new(),
            ignore_plugins: Vec::new(),
            enable_validation: false,
            disable_info_log: false,
            entry: EntryConfig::default(),
            library_path: None,
        }
    }

    /// Load a rule file and apply the global options it carries. Returns the number of rules
    /// added.
    pub fn load_rules(&mut self, path: &str) -> Result<usize> {
        let outcome = self.rules.load_file(path)?;
        self.apply_flags(outcome.disable_info_log, outcome.enable_validation);
        Ok(outcome.added)
    }

    /// Apply the `[EntryPlugin]` options. `DisableInfoLog` maps straight onto the logger's max
    /// level so the INFO-level routing narration disappears without touching warnings.
    pub fn apply_flags(&mut self, disable_info_log: Option<bool>, enable_validation: Option<bool>) {
        if let Some(disable) = disable_info_log {
            self.disable_info_log = disable;
            if disable {
                log::set_max_level(log::LevelFilter::Warn);
            } else {
                log::set_max_level(log::LevelFilter::Info);
            }
            nx_log!(
                "DisableInfoLog configuration: {} ({})",
                disable as i32,
                if disable {
                    "INFO logs disabled"
                } else {
                    "INFO logs enabled"
                }
            );
        }
        if let Some(enable) = enable_validation {
            self.enable_validation = enable;
            nx_log!(
                "EnableValidation configuration: {} ({})",
                enable as i32,
                if enable {
                    "validation enabled"
                } else {
                    "validation disabled"
                }
            );
        }
    }

    /// Merge the ignore list from an entry section: trimmed, duplicates coalesced.
    pub fn add_ignored_plugins(&mut self, entries: &[String]) {
        for entry in entries {
            if !self.ignore_plugins.iter().any(|existing| existing == entry) {
                nx_log!("added ignored plugin path from config: {}", entry);
                self.ignore_plugins.push(entry.clone());
            }
        }
    }

    pub fn find_plugin(&self, plugin_name: &str) -> Option<LibHandle> {
        self.plugins
            .iter()
            .find(|plugin| plugin.name == plugin_name)
            .map(|plugin| plugin.handle)
    }

    /// Resolve a plugin name to a loaded library handle, loading the binary on first use.
    pub fn ensure_plugin_loaded(&mut self, plugin_name: &str, plugin_path: &str) -> Result<LibHandle> {
        if let Some(handle) = self.find_plugin(plugin_name) {
            return Ok(handle);
        }

        let handle = self.platform.open_library(plugin_path).ok_or_else(|| {
            nx_warn!(
                "failed to load target plugin: {} from {}",
                plugin_name,
                plugin_path
            );
            RouteError::LibraryLoad(plugin_path.to_owned())
        })?;

        self.plugins.push(LoadedPlugin {
            name: plugin_name.to_owned(),
            path: plugin_path.to_owned(),
            handle,
        });
        nx_log!("loaded target plugin {} from {}", plugin_name, plugin_path);
        Ok(handle)
    }

    pub fn find_state(&self, plugin_name: &str, interface_name: &str) -> Option<usize> {
        self.states.iter().position(|state| {
            state.plugin_name == plugin_name && state.interface_name == interface_name
        })
    }

    /// Release everything: interface rows first, then the loaded libraries in teardown order.
    /// Callers holding pointers into unloaded libraries are on their own afterwards.
    pub fn teardown(&mut self) {
        self.states.clear();
        for plugin in self.plugins.drain(..) {
            self.platform.close_library(plugin.handle);
        }
        self.rules = RuleStore::new();
        self.tracker = NxptTracker::new();
        self.ignore_plugins.clear();
        self.stored = StoredPointer::default();
        self.entry = EntryConfig::default();
        self.library_path = None;
    }
}

lazy_static! {
    static ref CONTEXT: Mutex<Option<RouteContext>> = Mutex::new(None);
}

/// Run `f` against the pinned default context, creating it on first use. The exported C ABI
/// functions funnel through here; the lock is taken once per exported call and recursion happens
/// entirely inside one hold.
pub fn with_context<R>(f: impl FnOnce(&mut RouteContext) -> R) -> R {
    let mut guard = CONTEXT.lock();
    let ctx = guard.get_or_insert_with(|| RouteContext::new(Box::new(SystemPlatform::new())));
    f(ctx)
}

/// Tear down and drop the pinned default context. Safe to call when none was ever created.
pub fn teardown_global() {
    if let Some(mut ctx) = CONTEXT.lock().take() {
        ctx.teardown();
    }
}
