//! Library attach/detach glue. When the host maps this library, the engine installs its logger,
//! locates its own on-disk path, loads its own rule file, chain-loads everything the entry
//! configuration reaches, and optionally fires the configured auto-run interface once.

use std::fs::OpenOptions;
use std::os::raw::c_void;

use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode, WriteLogger};

use crate::chain;
use crate::context::RouteContext;
#[cfg(not(test))]
use crate::context::{teardown_global, with_context};
use crate::dispatch::dispatch_event;
use crate::rules::parser;

/// Install the logger once. `NXROUTE_LOG` picks the sink: unset or `stderr` logs to the
/// terminal, anything else is treated as a file path to append to.
pub fn setup_logger() {
    let level = LevelFilter::Info;

    match std::env::var("NXROUTE_LOG") {
        Ok(path) if !path.is_empty() && path != "stderr" => {
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => {
                    let _ = WriteLogger::init(level, Config::default(), file);
                }
                Err(_) => {
                    let _ = TermLogger::init(
                        level,
                        Config::default(),
                        TerminalMode::Stderr,
                        ColorChoice::Auto,
                    );
                }
            }
        }
        _ => {
            let _ = TermLogger::init(
                level,
                Config::default(),
                TerminalMode::Stderr,
                ColorChoice::Auto,
            );
        }
    }
}

/// The full initialization protocol: derive our own `.nxpt` from our on-disk path, load it, and
/// follow its entry configuration.
pub fn initialize(ctx: &mut RouteContext) {
    let Some(library_path) = ctx.platform.current_library_path() else {
        nx_warn!("could not determine the engine's own library path, no rules loaded");
        return;
    };
    let library_path = library_path.to_string_lossy().into_owned();
    let own_nxpt = chain::nxpt_path_for(&library_path);
    ctx.library_path = Some(library_path);

    // The engine's own rule file may carry both rules and the entry section.
    let _ = ctx.load_rules(&own_nxpt);
    initialize_from_entry_file(ctx, &own_nxpt);
}

/// Apply an entry rule file: entry options, the entry plugin's own rule file, the transitive
/// chain behind it, and the optional auto-run interface.
pub fn initialize_from_entry_file(ctx: &mut RouteContext, nxpt_path: &str) {
    let Ok(text) = std::fs::read_to_string(nxpt_path) else {
        // Unreadable files were already warned about by the rule loader.
        return;
    };

    let entry = parser::parse_entry_config(&text);
    ctx.apply_flags(entry.disable_info_log, entry.enable_validation);
    ctx.add_ignored_plugins(&entry.ignore_plugins);
    if !entry.is_complete() {
        nx_warn!("entry plugin config incomplete");
    } else {
        nx_log!(
            "entry plugin config: name={}, path={}, nxpt={}",
            entry.plugin_name.as_deref().unwrap_or("?"),
            entry.plugin_path.as_deref().unwrap_or("not specified"),
            entry.nxpt_path.as_deref().unwrap_or("?"),
        );
    }
    ctx.entry = entry;

    let entry_name = ctx.entry.plugin_name.clone();
    let entry_nxpt = ctx.entry.nxpt_path.clone();
    if let (Some(entry_name), Some(entry_nxpt)) = (entry_name, entry_nxpt) {
        nx_log!("loading entry plugin rule file: {}", entry_nxpt);
        if ctx.load_rules(&entry_nxpt).is_ok() {
            ctx.tracker.mark_loaded(&entry_name, &entry_nxpt);

            // Kick off the chain loader against every enabled rule's target.
            let targets: Vec<(String, String)> = ctx
                .rules
                .rules()
                .iter()
                .filter(|rule| rule.enabled)
                .filter_map(|rule| {
                    let name = rule.target_plugin.clone()?;
                    let path = rule.target_plugin_path.clone()?;
                    (!path.is_empty()).then_some((name, path))
                })
                .collect();
            for (target_name, target_path) in targets {
                if !ctx.tracker.is_loaded(&target_name) {
                    let _ = chain::chain_load(ctx, &target_name, &target_path);
                }
            }
        }
    }

    auto_run(ctx);
}

type AutoRunFn = unsafe extern "C" fn(*mut c_void) -> i32;

/// Resolve and invoke the configured auto-run interface once, then re-route its return value as
/// a source event so rules can react to it.
fn auto_run(ctx: &mut RouteContext) {
    let (Some(plugin_name), Some(plugin_path), Some(interface_name)) = (
        ctx.entry.plugin_name.clone(),
        ctx.entry.plugin_path.clone(),
        ctx.entry.auto_run_interface.clone(),
    ) else {
        return;
    };

    let Ok(handle) = ctx.ensure_plugin_loaded(&plugin_name, &plugin_path) else {
        return;
    };
    let Some(symbol) = ctx.platform.resolve_symbol(handle, &interface_name) else {
        nx_warn!(
            "auto-run interface {} not found in entry plugin {}",
            interface_name,
            plugin_name
        );
        return;
    };

    let mut return_value = unsafe {
        let auto_run_fn: AutoRunFn = std::mem::transmute(symbol);
        auto_run_fn(std::ptr::null_mut())
    };
    nx_log!(
        "auto-ran {}.{}, result = {}",
        plugin_name,
        interface_name,
        return_value
    );

    let mut frames = Vec::new();
    dispatch_event(
        ctx,
        &plugin_name,
        &interface_name,
        -1,
        &mut return_value as *mut i32 as *mut c_void,
        0,
        &mut frames,
    );
}

#[cfg(not(test))]
fn engine_attach() {
    setup_logger();
    nx_log!("parameter routing engine attached");
    with_context(initialize);
}

#[cfg(not(test))]
fn engine_detach() {
    teardown_global();
}

cfg_if::cfg_if! {
    if #[cfg(all(unix, not(test)))] {
        unsafe extern "C" fn module_attach() {
            engine_attach();
        }

        unsafe extern "C" fn module_detach() {
            engine_detach();
        }

        #[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_init_func")]
        #[cfg_attr(not(target_os = "macos"), link_section = ".init_array")]
        #[used]
        static ENGINE_ATTACH: unsafe extern "C" fn() = module_attach;

        #[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_term_func")]
        #[cfg_attr(not(target_os = "macos"), link_section = ".fini_array")]
        #[used]
        static ENGINE_DETACH: unsafe extern "C" fn() = module_detach;
    } else if #[cfg(all(windows, not(test)))] {
        const DLL_PROCESS_DETACH: u32 = 0;
        const DLL_PROCESS_ATTACH: u32 = 1;

        /// # Safety
        ///
        /// Called by the Windows loader.
        #[no_mangle]
        #[allow(non_snake_case)]
        pub unsafe extern "system" fn DllMain(
            _instance: *mut c_void,
            reason: u32,
            _reserved: *mut c_void,
        ) -> i32 {
            match reason {
                DLL_PROCESS_ATTACH => engine_attach(),
                DLL_PROCESS_DETACH => engine_detach(),
                _ => {}
            }
            1
        }
    }
}
