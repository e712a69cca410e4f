//! The validation cache. Before the first real call into a target function, the engine probes it
//! with a dummy pack and records the outcome in a `.nxpv` side file keyed by the binary's mtime,
//! so the probe only ever runs again after the binary changes.

use std::io::Write;
use std::path::Path;

use crate::dispatch::call::{call_through, effective_return_type, ReturnType};
use crate::error::{Result, RouteError};
use crate::pack::serialize::serialize_pack;
use crate::pack::ParamPack;
use crate::platform::{Platform, SymbolAddr};
use crate::util::swap_extension;

/// Side-file path for a plugin binary: extension swapped for `.nxpv`.
pub fn nxpv_path_for(binary_path: &str) -> String {
    swap_extension(binary_path, ".nxpv")
}

/// Read a side-file's `(timestamp, valid)` pair. Unknown lines are ignored; missing keys default
/// to `(0, false)`.
pub fn read_nxpv(nxpv_path: &str) -> Option<(i64, bool)> {
    let text = std::fs::read_to_string(nxpv_path).ok()?;

    let mut timestamp = 0i64;
    let mut valid = false;
    for line in text.lines() {
        if let Some(value) = line.strip_prefix("Timestamp=") {
            timestamp = value.trim().parse().unwrap_or(0);
        } else if let Some(value) = line.strip_prefix("Valid=") {
            valid = value.trim() == "1";
        }
    }

    Some((timestamp, valid))
}

/// Write a binary's side-file: two `key=value` lines.
pub fn write_nxpv(binary_path: &str, timestamp: i64, valid: bool) -> std::io::Result<()> {
    let nxpv_path = nxpv_path_for(binary_path);
    let mut file = std::fs::File::create(nxpv_path)?;
    writeln!(file, "Timestamp={}", timestamp)?;
    writeln!(file, "Valid={}", if valid { 1 } else { 0 })
}

/// Ignore-list matching: normalise `\` to `/`, take the substring from `plugins/` onward, and
/// exact-compare against the configured entries. A path without the literal segment never
/// matches; that fragility is part of the contract.
pub fn is_ignored(ignore_list: &[String], binary_path: &str) -> bool {
    if ignore_list.is_empty() {
        return false;
    }

    let normalized = binary_path.replace('\\', "/");
    let Some(plugins_offset) = normalized.find("plugins/") else {
        return false;
    };
    let relative = &normalized[plugins_offset..];

    ignore_list.iter().any(|entry| entry == relative)
}

/// Whether the cached side-file lets us skip the probe: its timestamp equals the binary's current
/// mtime and it recorded `Valid=1`.
pub fn cache_is_valid(platform: &dyn Platform, binary_path: &str) -> bool {
    let Some((cached_timestamp, cached_valid)) = read_nxpv(&nxpv_path_for(binary_path)) else {
        return false;
    };
    let Some(current_timestamp) = platform.file_mtime(binary_path) else {
        return false;
    };

    cached_valid && cached_timestamp == current_timestamp
}

/// For every sibling binary in the target's directory tree whose side-file is absent or stale,
/// write a fresh one with `Valid=0`: known, but not yet tested.
pub fn refresh_sibling_side_files(
    platform: &dyn Platform,
    ignore_list: &[String],
    target_binary: &str,
) {
    let directory = match Path::new(target_binary).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };

    let mut siblings = Vec::new();
    platform.find_binaries_under(&directory, &mut siblings);
    if !siblings.is_empty() {
        nx_log!(
            "found {} plugin binaries under {}, refreshing validation side files",
            siblings.len(),
            directory.display()
        );
    }

    for sibling in siblings {
        let sibling_path = sibling.to_string_lossy().into_owned();
        // The target itself is handled by the probe that follows.
        if sibling_path == target_binary {
            continue;
        }
        if is_ignored(ignore_list, &sibling_path) {
            nx_log!("skipping ignored plugin binary: {}", sibling_path);
            continue;
        }

        let Some(sibling_timestamp) = platform.file_mtime(&sibling_path) else {
            continue;
        };
        let stale = match read_nxpv(&nxpv_path_for(&sibling_path)) {
            Some((cached_timestamp, _)) => cached_timestamp != sibling_timestamp,
            None => true,
        };
        if stale && write_nxpv(&sibling_path, sibling_timestamp, false).is_ok() {
            nx_log!(
                "generated validation side file for {} (timestamp={}, deferred)",
                sibling_path,
                sibling_timestamp
            );
        }
    }
}

/// Probe a target function with a dummy pack of its declared arity (all-zero int32 scalars).
/// Any failure along the way counts as a failed probe.
pub fn probe_function(
    func: SymbolAddr,
    arity: usize,
    return_type: ReturnType,
    return_size: usize,
) -> Result<()> {
    let pack = ParamPack::probe(arity);
    pack.validate()?;
    let block = serialize_pack(&pack)?;

    let effective = effective_return_type(return_type, return_size);
    let mut struct_buffer = vec![0u8; return_size.max(1)];
    unsafe {
        call_through(
            func,
            block.as_ptr(),
            effective,
            return_size,
            Some(&mut struct_buffer),
        )?;
    }

    Ok(())
}

/// The full first-touch validation for a target function. Returns `Ok` when the function may be
/// called: the target is ignored, the cache is warm, or the probe passed. The probe's outcome is
/// recorded in the side-file alongside the binary's current mtime either way.
pub fn validate_target(
    platform: &mut dyn Platform,
    ignore_list: &[String],
    binary_path: &str,
    interface_name: &str,
    func: SymbolAddr,
    arity: usize,
    return_type: ReturnType,
    return_size: usize,
) -> Result<()> {
    if is_ignored(ignore_list, binary_path) {
        nx_log!(
            "validation skipped, plugin is on the ignore list: {}",
            binary_path
        );
        return Ok(());
    }

    refresh_sibling_side_files(platform, ignore_list, binary_path);

    if cache_is_valid(platform, binary_path) {
        nx_log!(
            "validation skipped, cached result still valid: {} ({})",
            binary_path,
            interface_name
        );
        return Ok(());
    }

    let probe_outcome = probe_function(func, arity, return_type, return_size);
    let passed = probe_outcome.is_ok();

    if let Some(timestamp) = platform.file_mtime(binary_path) {
        if write_nxpv(binary_path, timestamp, passed).is_ok() {
            nx_log!(
                "recorded validation result for {}: valid={} (timestamp={})",
                binary_path,
                passed as i32,
                timestamp
            );
        } else {
            nx_warn!("failed to write validation side file for {}", binary_path);
        }
    } else {
        nx_warn!("failed to stat plugin binary for validation: {}", binary_path);
    }

    if passed {
        nx_log!(
            "validation probe passed for {}.{}",
            binary_path,
            interface_name
        );
        Ok(())
    } else {
        nx_error!(
            "validation probe failed for {}.{}",
            binary_path,
            interface_name
        );
        Err(RouteError::ProbeFailed(format!(
            "{}:{}",
            binary_path, interface_name
        )))
    }
}
