//! The dispatcher: matches a `(source-plugin, interface, parameter)` event against the rule
//! store, feeds each target's interface-state row, and fires the target function once its
//! argument set is complete. A target's return value is re-routed as a fresh event, which is how
//! chained transformations compose.

use std::os::raw::c_void;

use crate::chain;
use crate::context::RouteContext;
use crate::error::{Result, RouteError};
use crate::pack::serialize::serialize_pack;
use crate::pack::ParamType;
use crate::rules::{Rule, TransferMode};
use crate::validate;

pub mod call;
pub mod state;

use call::{call_through, effective_return_type, ReturnType};
use state::InterfaceState;

/// Depth past which the dispatcher starts warning. Recursion is never aborted on depth alone;
/// the ancestor stack is what actually breaks cycles.
pub const RECURSION_SOFT_LIMIT: u32 = 16;

/// The visible window of the `(plugin, interface)` ancestor stack.
pub const MAX_CALL_FRAMES: usize = 32;

/// One `(plugin, interface)` pair currently on the dispatch stack.
pub type CallFrame = (String, String);

#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchOutcome {
    /// Rules whose mode and condition admitted them.
    pub matched: usize,
    /// Rule applications that completed without error.
    pub succeeded: usize,
}

/// Match an event against the store and apply every admitted rule: broadcast and multicast rules
/// first in insertion order, then unicast rules in insertion order, stopping early only when a
/// later unicast rule names the exact same target location.
pub fn dispatch_event(
    ctx: &mut RouteContext,
    source_plugin: &str,
    source_interface: &str,
    param_index: i32,
    value: *mut c_void,
    depth: u32,
    frames: &mut Vec<CallFrame>,
) -> DispatchOutcome {
    if depth > RECURSION_SOFT_LIMIT {
        nx_warn!(
            "dispatch depth {} exceeds the soft limit of {} ({}.{}[{}])",
            depth,
            RECURSION_SOFT_LIMIT,
            source_plugin,
            source_interface,
            param_index
        );
    }

    let positions = ctx
        .rules
        .find_rules(source_plugin, source_interface, param_index);
    let mut outcome = DispatchOutcome::default();

    // Broadcast and multicast fires complete before any unicast fire.
    for &position in &positions {
        let rule = ctx.rules.rule(position).clone();
        match rule.mode {
            TransferMode::Broadcast => {}
            TransferMode::Multicast => {
                // Group membership policy is the caller's; the engine only gates on presence.
                if rule
                    .multicast_group
                    .as_deref()
                    .map_or(true, |group| group.is_empty())
                {
                    continue;
                }
            }
            TransferMode::Unicast => continue,
        }
        if !condition_admits(&rule, position, value) {
            continue;
        }

        outcome.matched += 1;
        log_application(&rule, position, source_plugin, source_interface, param_index);
        match apply_rule(ctx, &rule, value, depth, frames) {
            Ok(()) => outcome.succeeded += 1,
            Err(err) => nx_warn!("failed to apply transfer rule {}: {}", position, err),
        }
    }

    for (order, &position) in positions.iter().enumerate() {
        let rule = ctx.rules.rule(position).clone();
        if rule.mode != TransferMode::Unicast {
            continue;
        }
        if !condition_admits(&rule, position, value) {
            continue;
        }

        outcome.matched += 1;
        log_application(&rule, position, source_plugin, source_interface, param_index);
        match apply_rule(ctx, &rule, value, depth, frames) {
            Ok(()) => outcome.succeeded += 1,
            Err(err) => nx_warn!("failed to apply transfer rule {}: {}", position, err),
        }

        // A later unicast rule for the very same (plugin, interface, param) would be a duplicate
        // fire; distinct parameter indices of one interface are fine and keep accumulating.
        let has_exact_duplicate = positions[order + 1..].iter().any(|&later| {
            let later_rule = ctx.rules.rule(later);
            later_rule.mode == TransferMode::Unicast && later_rule.same_target(&rule)
        });
        if has_exact_duplicate {
            break;
        }
    }

    outcome
}

fn condition_admits(rule: &Rule, position: usize, value: *mut c_void) -> bool {
    let Some(condition) = rule.condition else {
        return true;
    };
    let admitted = unsafe { condition.evaluate(value) };
    if !admitted {
        nx_log!("transfer rule {} condition not met, skipping", position);
    }
    admitted
}

fn log_application(
    rule: &Rule,
    position: usize,
    source_plugin: &str,
    source_interface: &str,
    param_index: i32,
) {
    nx_log!(
        "applying transfer rule {} ({}) - {}.{}[{}] to {}.{}[{}]",
        position,
        rule.mode.name(),
        source_plugin,
        source_interface,
        param_index,
        rule.target_plugin.as_deref().unwrap_or("unknown"),
        rule.target_interface.as_deref().unwrap_or("unknown"),
        rule.target_param_index,
    );
}

/// Apply one admitted rule: locate or create the target's state row, write the argument (or the
/// rule's constant), and fire the row if it is now complete.
fn apply_rule(
    ctx: &mut RouteContext,
    rule: &Rule,
    value: *mut c_void,
    depth: u32,
    frames: &mut Vec<CallFrame>,
) -> Result<()> {
    let target_plugin = rule
        .target_plugin
        .as_deref()
        .ok_or(RouteError::BadArg("rule has no target plugin"))?
        .to_owned();
    let target_interface = rule
        .target_interface
        .as_deref()
        .ok_or(RouteError::BadArg("rule has no target interface"))?
        .to_owned();

    // Refuse to re-enter any (plugin, interface) already on the dispatch stack.
    if frames
        .iter()
        .any(|(plugin, interface)| *plugin == target_plugin && *interface == target_interface)
    {
        nx_warn!(
            "call cycle detected, refusing to re-enter {}.{}",
            target_plugin,
            target_interface
        );
        return Err(RouteError::Cycle {
            plugin: target_plugin,
            interface: target_interface,
        });
    }

    let state_index = find_or_create_state(ctx, rule, &target_plugin, &target_interface)?;

    {
        // The asserted size travels with the value only while it is the last-transferred pointer.
        let stored_size = if !value.is_null() && value == ctx.stored.ptr {
            ctx.stored.size
        } else {
            0
        };

        let state = &mut ctx.states[state_index];
        if let Some(constant) = &rule.target_constant {
            state.store_constant(rule.target_param_index, constant)?;
        } else {
            unsafe { state.store_incoming(rule.target_param_index, value, stored_size)? };
        }

        if state.is_variadic
            && rule.target_param_index >= 0
            && (rule.target_param_index as usize) < state.min_param_count
        {
            nx_warn!(
                "variadic interface {}.{} rejects parameter index {} below its minimum {}",
                target_plugin,
                target_interface,
                rule.target_param_index,
                state.min_param_count
            );
            return Err(RouteError::ParamOutOfRange {
                plugin: target_plugin,
                interface: target_interface,
                index: rule.target_param_index,
            });
        }
    }

    if ctx.states[state_index].is_ready() {
        invoke_row(ctx, state_index, depth, frames)?;
    }

    Ok(())
}

/// Interface state rows are created lazily on first touch and then live until teardown.
fn find_or_create_state(
    ctx: &mut RouteContext,
    rule: &Rule,
    target_plugin: &str,
    target_interface: &str,
) -> Result<usize> {
    if let Some(index) = ctx.find_state(target_plugin, target_interface) {
        return Ok(index);
    }

    let plugin_path = rule
        .target_plugin_path
        .as_deref()
        .filter(|path| !path.is_empty())
        .ok_or_else(|| {
            nx_warn!("no plugin path configured for {}", target_plugin);
            RouteError::BadArg("rule has no target plugin path")
        })?
        .to_owned();

    // First touch also pulls in the target's own rule file, transitively.
    if !ctx.tracker.is_loaded(target_plugin) {
        let _ = chain::chain_load(ctx, target_plugin, &plugin_path);
    }

    let handle = ctx.ensure_plugin_loaded(target_plugin, &plugin_path)?;
    let func = ctx
        .platform
        .resolve_symbol(handle, target_interface)
        .ok_or_else(|| {
            nx_error!(
                "plugin {} does not export required function {}",
                target_plugin,
                target_interface
            );
            RouteError::SymbolNotFound {
                plugin: target_plugin.to_owned(),
                symbol: target_interface.to_owned(),
            }
        })?;

    let meta = state::query_interface_metadata(
        ctx.platform.as_mut(),
        handle,
        target_plugin,
        target_interface,
    )?;

    ctx.states.push(InterfaceState::new(
        target_plugin,
        target_interface,
        &plugin_path,
        handle,
        func,
        meta,
    ));
    Ok(ctx.states.len() - 1)
}

fn push_frame(frames: &mut Vec<CallFrame>, plugin: String, interface: String) {
    // Collapse the bottom of the stack past the window; cycles within it are still caught.
    if frames.len() >= MAX_CALL_FRAMES {
        frames.remove(0);
    }
    frames.push((plugin, interface));
}

/// Fire a completed row: validate on first touch, marshal, call, re-route the return value.
fn invoke_row(
    ctx: &mut RouteContext,
    state_index: usize,
    depth: u32,
    frames: &mut Vec<CallFrame>,
) -> Result<()> {
    if ctx.enable_validation && !ctx.states[state_index].validation_done {
        let (plugin_path, interface_name, func, arity, return_type, return_size) = {
            let state = &ctx.states[state_index];
            (
                state.plugin_path.clone(),
                state.interface_name.clone(),
                state.func,
                state.param_count,
                state.return_type,
                state.return_size,
            )
        };
        let ignore_list = ctx.ignore_plugins.clone();
        validate::validate_target(
            ctx.platform.as_mut(),
            &ignore_list,
            &plugin_path,
            &interface_name,
            func,
            arity,
            return_type,
            return_size,
        )?;
        ctx.states[state_index].validation_done = true;
    }

    if ctx.states[state_index].in_use {
        let state = &ctx.states[state_index];
        nx_warn!(
            "rejecting re-entry into {}.{} while a call is in flight",
            state.plugin_name,
            state.interface_name
        );
        return Err(RouteError::Reentry {
            plugin: state.plugin_name.clone(),
            interface: state.interface_name.clone(),
        });
    }
    ctx.states[state_index].in_use = true;

    let result = invoke_row_inner(ctx, state_index, depth, frames);

    ctx.states[state_index].in_use = false;
    ctx.states[state_index].clear_params();
    result
}

fn invoke_row_inner(
    ctx: &mut RouteContext,
    state_index: usize,
    depth: u32,
    frames: &mut Vec<CallFrame>,
) -> Result<()> {
    let (plugin_name, interface_name, func, return_type, return_size) = {
        let state = &ctx.states[state_index];
        (
            state.plugin_name.clone(),
            state.interface_name.clone(),
            state.func,
            state.return_type,
            state.return_size,
        )
    };

    // The pack must outlive the call: small owned payloads alias its buffers.
    let pack = unsafe { ctx.states[state_index].build_pack() };
    pack.validate()?;
    let block = serialize_pack(&pack)?;

    let effective = effective_return_type(return_type, return_size);
    let mut struct_buffer = match effective {
        ReturnType::StructLarge => vec![0u8; return_size],
        ReturnType::StructSmall if return_size > 0 => vec![0u8; return_size],
        _ => Vec::new(),
    };
    let buffer_slice = if struct_buffer.is_empty() {
        None
    } else {
        Some(&mut struct_buffer[..])
    };

    let mut result = unsafe {
        call_through(func, block.as_ptr(), effective, return_size, buffer_slice)?
    };

    match effective {
        ReturnType::Float | ReturnType::Double => nx_log!(
            "called {}.{}, result = {} ({})",
            plugin_name,
            interface_name,
            result.float,
            effective.name()
        ),
        ReturnType::StructSmall | ReturnType::StructLarge => nx_log!(
            "called {}.{}, result = {:#x} ({}, size={})",
            plugin_name,
            interface_name,
            result.integer,
            effective.name(),
            return_size
        ),
        ReturnType::Integer => nx_log!(
            "called {}.{}, result = {} (integer/pointer)",
            plugin_name,
            interface_name,
            result.integer
        ),
    }

    // Re-route the return value as a fresh event so rule chains compose. The pair goes on the
    // ancestor stack first, which is what stops self-recursive rule cycles.
    push_frame(frames, plugin_name.clone(), interface_name.clone());
    let value_ptr: *mut c_void = match effective {
        ReturnType::Float | ReturnType::Double => &mut result.float as *mut f64 as *mut c_void,
        ReturnType::StructLarge if !struct_buffer.is_empty() => {
            struct_buffer.as_mut_ptr() as *mut c_void
        }
        ReturnType::StructSmall => {
            ctx.stored.tag = ParamType::String;
            ctx.stored.size = std::mem::size_of::<*const c_void>();
            result.integer as usize as *mut c_void
        }
        _ => {
            ctx.stored.tag = ParamType::Int64;
            ctx.stored.size = std::mem::size_of::<i64>();
            &mut result.integer as *mut i64 as *mut c_void
        }
    };
    dispatch_event(
        ctx,
        &plugin_name,
        &interface_name,
        -1,
        value_ptr,
        depth + 1,
        frames,
    );
    frames.pop();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::serialize::{deserialize, RawPackHeader};
    use crate::platform::testing::FakePlatform;
    use crate::util::strlcpy;
    use state::{PARAM_COUNT_FIXED, PARAM_COUNT_VARIADIC};
    use std::os::raw::c_char;
    use std::sync::Mutex;

    /// The dispatch tests share process-global call logs, so they serialize on this.
    static TEST_GUARD: Mutex<()> = Mutex::new(());
    static CALL_LOG: Mutex<Vec<(&'static str, i64)>> = Mutex::new(Vec::new());

    fn record(label: &'static str, value: i64) {
        CALL_LOG.lock().unwrap().push((label, value));
    }

    fn take_log() -> Vec<(&'static str, i64)> {
        std::mem::take(&mut *CALL_LOG.lock().unwrap())
    }

    unsafe fn first_i32(pack: *mut c_void) -> i32 {
        let header = deserialize(pack).expect("valid pack");
        read_i32(header, 0)
    }

    unsafe fn read_i32(header: *mut RawPackHeader, index: usize) -> i32 {
        assert!((*header).count > index as i64);
        (*(*header).slots.add(index)).payload as u32 as i32
    }

    unsafe fn copy_out(text: &str, dest: *mut c_char, dest_size: usize) {
        if !dest.is_null() && dest_size > 0 {
            strlcpy(std::slice::from_raw_parts_mut(dest, dest_size), text);
        }
    }

    /// Generates the four metadata exports for a fake plugin with one fixed-arity interface.
    macro_rules! fake_metadata {
        ($module:ident, $interface:literal, $description:literal, $arity:expr, $count_kind:expr, $min:expr) => {
            mod $module {
                use super::*;

                pub unsafe extern "C" fn interface_count(count: *mut usize) -> i32 {
                    *count = 1;
                    0
                }

                pub unsafe extern "C" fn interface_info(
                    index: usize,
                    name: *mut c_char,
                    name_size: usize,
                    description: *mut c_char,
                    description_size: usize,
                    version: *mut c_char,
                    version_size: usize,
                ) -> i32 {
                    if index != 0 {
                        return -1;
                    }
                    copy_out($interface, name, name_size);
                    copy_out($description, description, description_size);
                    copy_out("1.0.0", version, version_size);
                    0
                }

                pub unsafe extern "C" fn param_count(
                    index: usize,
                    count_type: *mut i32,
                    min: *mut i32,
                    max: *mut i32,
                ) -> i32 {
                    if index != 0 {
                        return -1;
                    }
                    *count_type = $count_kind;
                    *min = $min;
                    *max = $arity;
                    0
                }

                pub unsafe extern "C" fn param_info(
                    index: usize,
                    param: i32,
                    name: *mut c_char,
                    name_size: usize,
                    tag: *mut i32,
                    type_name: *mut c_char,
                    type_name_size: usize,
                ) -> i32 {
                    if index != 0 || param < 0 || param >= $arity {
                        return -1;
                    }
                    copy_out("value", name, name_size);
                    copy_out("int32_t", type_name, type_name_size);
                    *tag = ParamType::Int32 as i32;
                    0
                }
            }
        };
    }

    fake_metadata!(meta_g, "g", "takes and returns an int", 1, PARAM_COUNT_FIXED, 1);
    fake_metadata!(meta_h, "h", "consumes an int", 1, PARAM_COUNT_FIXED, 1);
    fake_metadata!(meta_pair, "pair", "sums two ints", 2, PARAM_COUNT_FIXED, 2);
    fake_metadata!(meta_f, "f", "echoes an int", 1, PARAM_COUNT_FIXED, 1);
    fake_metadata!(meta_many, "many", "variadic sink", 3, PARAM_COUNT_VARIADIC, 0);

    macro_rules! register_fake {
        ($platform:expr, $path:expr, $interface:literal, $module:ident, $func:expr) => {{
            let address = $func as unsafe extern "C" fn(*mut c_void) -> i32 as *const c_void;
            $platform.add_symbol($path, $interface, address);
            $platform.add_symbol(
                $path,
                state::SYM_GET_INTERFACE_COUNT,
                $module::interface_count as *const c_void,
            );
            $platform.add_symbol(
                $path,
                state::SYM_GET_INTERFACE_INFO,
                $module::interface_info as *const c_void,
            );
            $platform.add_symbol(
                $path,
                state::SYM_GET_INTERFACE_PARAM_COUNT,
                $module::param_count as *const c_void,
            );
            $platform.add_symbol(
                $path,
                state::SYM_GET_INTERFACE_PARAM_INFO,
                $module::param_info as *const c_void,
            );
        }};
    }

    unsafe extern "C" fn b_g_echo(pack: *mut c_void) -> i32 {
        let value = first_i32(pack);
        record("B.g", value as i64);
        value
    }

    unsafe extern "C" fn b_g_returns_seven(pack: *mut c_void) -> i32 {
        record("B.g", first_i32(pack) as i64);
        7
    }

    unsafe extern "C" fn c_h_sink(pack: *mut c_void) -> i32 {
        record("C.h", first_i32(pack) as i64);
        0
    }

    unsafe extern "C" fn d_h_sink(pack: *mut c_void) -> i32 {
        record("D.h", first_i32(pack) as i64);
        0
    }

    unsafe extern "C" fn b_pair_sum(pack: *mut c_void) -> i32 {
        let header = deserialize(pack).expect("valid pack");
        let sum = read_i32(header, 0) + read_i32(header, 1);
        record("B.pair", sum as i64);
        sum
    }

    unsafe extern "C" fn a_f_echo(pack: *mut c_void) -> i32 {
        let value = first_i32(pack);
        record("A.f", value as i64);
        value
    }

    unsafe extern "C" fn b_many_sink(pack: *mut c_void) -> i32 {
        let header = deserialize(pack).expect("valid pack");
        record("B.many", (*header).count);
        0
    }

    fn unicast(source: (&str, &str, i32), target: (&str, &str, &str, i32)) -> Rule {
        Rule {
            source_plugin: Some(source.0.to_owned()),
            source_interface: Some(source.1.to_owned()),
            source_param_index: source.2,
            target_plugin: Some(target.0.to_owned()),
            target_plugin_path: Some(target.1.to_owned()),
            target_interface: Some(target.2.to_owned()),
            target_param_index: target.3,
            ..Rule::default()
        }
    }

    fn test_context() -> RouteContext {
        RouteContext::new(Box::new(FakePlatform::new()))
    }

    fn platform_of(ctx: &mut RouteContext) -> &mut FakePlatform {
        // Tests construct the context with a FakePlatform just above.
        unsafe {
            &mut *(ctx.platform.as_mut() as *mut (dyn crate::platform::Platform + Send)
                as *mut FakePlatform)
        }
    }

    fn dispatch(
        ctx: &mut RouteContext,
        source: (&str, &str, i32),
        value: *mut c_void,
    ) -> DispatchOutcome {
        let mut frames = Vec::new();
        dispatch_event(ctx, source.0, source.1, source.2, value, 0, &mut frames)
    }

    #[test]
    fn pass_through_calls_the_target_with_the_source_value() {
        let _guard = TEST_GUARD.lock().unwrap();
        take_log();

        let mut ctx = test_context();
        register_fake!(platform_of(&mut ctx), "./B.so", "g", meta_g, b_g_echo);
        ctx.rules
            .append_rules([unicast(("A", "f", 0), ("B", "./B.so", "g", 0))]);

        let mut value = 42i32;
        let outcome = dispatch(&mut ctx, ("A", "f", 0), &mut value as *mut i32 as *mut c_void);

        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(take_log(), vec![("B.g", 42)]);
    }

    #[test]
    fn broadcast_fans_out_to_every_target_once() {
        let _guard = TEST_GUARD.lock().unwrap();
        take_log();

        let mut ctx = test_context();
        register_fake!(platform_of(&mut ctx), "./B.so", "g", meta_g, b_g_echo);
        register_fake!(platform_of(&mut ctx), "./C.so", "h", meta_h, c_h_sink);

        let mut to_b = unicast(("A", "f", 0), ("B", "./B.so", "g", 0));
        to_b.mode = TransferMode::Broadcast;
        let mut to_c = unicast(("A", "f", 0), ("C", "./C.so", "h", 0));
        to_c.mode = TransferMode::Broadcast;
        ctx.rules.append_rules([to_b, to_c]);

        let mut value = 5i32;
        let outcome = dispatch(&mut ctx, ("A", "f", 0), &mut value as *mut i32 as *mut c_void);

        assert_eq!(outcome.matched, 2);
        assert_eq!(outcome.succeeded, 2);
        assert_eq!(take_log(), vec![("B.g", 5), ("C.h", 5)]);
    }

    #[test]
    fn return_values_feed_the_next_stage() {
        let _guard = TEST_GUARD.lock().unwrap();
        take_log();

        let mut ctx = test_context();
        register_fake!(platform_of(&mut ctx), "./B.so", "g", meta_g, b_g_returns_seven);
        register_fake!(platform_of(&mut ctx), "./C.so", "h", meta_h, c_h_sink);
        ctx.rules.append_rules([
            unicast(("A", "f", 0), ("B", "./B.so", "g", 0)),
            unicast(("B", "g", -1), ("C", "./C.so", "h", 0)),
        ]);

        let mut value = 1i32;
        dispatch(&mut ctx, ("A", "f", 0), &mut value as *mut i32 as *mut c_void);

        assert_eq!(take_log(), vec![("B.g", 1), ("C.h", 7)]);
    }

    #[test]
    fn condition_gates_the_whole_event() {
        let _guard = TEST_GUARD.lock().unwrap();
        take_log();

        let mut ctx = test_context();
        register_fake!(platform_of(&mut ctx), "./B.so", "g", meta_g, b_g_echo);
        let mut gated = unicast(("A", "f", 0), ("B", "./B.so", "g", 0));
        gated.condition = Some(crate::rules::Condition::NotNull);
        ctx.rules.append_rules([gated]);

        // A null value fails the predicate: nothing matched, nothing called.
        let outcome = dispatch(&mut ctx, ("A", "f", 0), std::ptr::null_mut());
        assert_eq!(outcome.matched, 0);
        assert!(take_log().is_empty());

        let mut value = 9i32;
        let outcome = dispatch(&mut ctx, ("A", "f", 0), &mut value as *mut i32 as *mut c_void);
        assert_eq!(outcome.matched, 1);
        assert_eq!(take_log(), vec![("B.g", 9)]);
    }

    #[test]
    fn broadcast_and_multicast_fire_before_unicast() {
        let _guard = TEST_GUARD.lock().unwrap();
        take_log();

        let mut ctx = test_context();
        register_fake!(platform_of(&mut ctx), "./B.so", "g", meta_g, b_g_echo);
        register_fake!(platform_of(&mut ctx), "./C.so", "h", meta_h, c_h_sink);
        register_fake!(platform_of(&mut ctx), "./D.so", "h", meta_h, d_h_sink);

        // Textual order: unicast first, then broadcast, then multicast. Fire order must not be
        // textual order.
        let to_b = unicast(("A", "f", 0), ("B", "./B.so", "g", 0));
        let mut to_c = unicast(("A", "f", 0), ("C", "./C.so", "h", 0));
        to_c.mode = TransferMode::Broadcast;
        let mut to_d = unicast(("A", "f", 0), ("D", "./D.so", "h", 0));
        to_d.mode = TransferMode::Multicast;
        to_d.multicast_group = Some("group-1".to_owned());
        ctx.rules.append_rules([to_b, to_c, to_d]);

        let mut value = 3i32;
        dispatch(&mut ctx, ("A", "f", 0), &mut value as *mut i32 as *mut c_void);

        assert_eq!(take_log(), vec![("C.h", 3), ("D.h", 3), ("B.g", 3)]);
    }

    #[test]
    fn multicast_without_a_group_never_fires() {
        let _guard = TEST_GUARD.lock().unwrap();
        take_log();

        let mut ctx = test_context();
        register_fake!(platform_of(&mut ctx), "./B.so", "g", meta_g, b_g_echo);
        let mut groupless = unicast(("A", "f", 0), ("B", "./B.so", "g", 0));
        groupless.mode = TransferMode::Multicast;
        ctx.rules.append_rules([groupless]);

        let mut value = 1i32;
        let outcome = dispatch(&mut ctx, ("A", "f", 0), &mut value as *mut i32 as *mut c_void);
        assert_eq!(outcome.matched, 0);
        assert!(take_log().is_empty());
    }

    #[test]
    fn duplicate_unicast_targets_fire_once() {
        let _guard = TEST_GUARD.lock().unwrap();
        take_log();

        let mut ctx = test_context();
        register_fake!(platform_of(&mut ctx), "./B.so", "g", meta_g, b_g_echo);
        ctx.rules.append_rules([
            unicast(("A", "f", 0), ("B", "./B.so", "g", 0)),
            unicast(("A", "f", 0), ("B", "./B.so", "g", 0)),
        ]);

        let mut value = 11i32;
        dispatch(&mut ctx, ("A", "f", 0), &mut value as *mut i32 as *mut c_void);

        assert_eq!(take_log(), vec![("B.g", 11)]);
    }

    #[test]
    fn one_event_may_populate_several_parameters_of_one_interface() {
        let _guard = TEST_GUARD.lock().unwrap();
        take_log();

        let mut ctx = test_context();
        register_fake!(platform_of(&mut ctx), "./B.so", "pair", meta_pair, b_pair_sum);
        // Same source event feeds both parameters; the second write completes the row.
        let mut first = unicast(("A", "f", 0), ("B", "./B.so", "pair", 0));
        first.target_constant = Some("40".to_owned());
        ctx.rules.append_rules([
            first,
            unicast(("A", "f", 0), ("B", "./B.so", "pair", 1)),
        ]);

        let mut value = 2i32;
        dispatch(&mut ctx, ("A", "f", 0), &mut value as *mut i32 as *mut c_void);

        assert_eq!(take_log(), vec![("B.pair", 42)]);
    }

    #[test]
    fn self_cycle_is_cut_on_the_return_path() {
        let _guard = TEST_GUARD.lock().unwrap();
        take_log();

        let mut ctx = test_context();
        register_fake!(platform_of(&mut ctx), "./A.so", "f", meta_f, a_f_echo);
        // The return value of A.f routes straight back into A.f.
        ctx.rules
            .append_rules([unicast(("A", "f", -1), ("A", "./A.so", "f", 0))]);

        let mut value = 1i32;
        let outcome = dispatch(&mut ctx, ("A", "f", -1), &mut value as *mut i32 as *mut c_void);

        // Exactly one call: the re-dispatch of its return value finds (A, f) on the stack.
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(take_log(), vec![("A.f", 1)]);
    }

    #[test]
    fn variadic_rows_fire_at_the_leading_prefix() {
        let _guard = TEST_GUARD.lock().unwrap();
        take_log();

        let mut ctx = test_context();
        register_fake!(platform_of(&mut ctx), "./B.so", "many", meta_many, b_many_sink);
        ctx.rules
            .append_rules([unicast(("A", "f", 0), ("B", "./B.so", "many", 0))]);

        let mut value = 1i32;
        dispatch(&mut ctx, ("A", "f", 0), &mut value as *mut i32 as *mut c_void);

        // min_param_count is 0, so the first stored argument completes the row.
        assert_eq!(take_log(), vec![("B.many", 1)]);
    }

    #[test]
    fn rows_reset_after_each_fire() {
        let _guard = TEST_GUARD.lock().unwrap();
        take_log();

        let mut ctx = test_context();
        register_fake!(platform_of(&mut ctx), "./B.so", "g", meta_g, b_g_echo);
        ctx.rules
            .append_rules([unicast(("A", "f", 0), ("B", "./B.so", "g", 0))]);

        let mut value = 1i32;
        dispatch(&mut ctx, ("A", "f", 0), &mut value as *mut i32 as *mut c_void);
        value = 2;
        dispatch(&mut ctx, ("A", "f", 0), &mut value as *mut i32 as *mut c_void);

        assert_eq!(take_log(), vec![("B.g", 1), ("B.g", 2)]);
        // One row, not two, and the binary loaded once.
        assert_eq!(ctx.states.len(), 1);
        assert_eq!(platform_of(&mut ctx).open_count("./B.so"), 1);
    }

    #[test]
    fn unresolvable_targets_fail_the_rule_not_the_event() {
        let _guard = TEST_GUARD.lock().unwrap();
        take_log();

        let mut ctx = test_context();
        register_fake!(platform_of(&mut ctx), "./B.so", "g", meta_g, b_g_echo);
        let mut missing = unicast(("A", "f", 0), ("Ghost", "./ghost.so", "spook", 0));
        missing.mode = TransferMode::Broadcast;
        ctx.rules.append_rules([
            missing,
            unicast(("A", "f", 0), ("B", "./B.so", "g", 0)),
        ]);

        let mut value = 4i32;
        let outcome = dispatch(&mut ctx, ("A", "f", 0), &mut value as *mut i32 as *mut c_void);

        assert_eq!(outcome.matched, 2);
        assert_eq!(outcome.succeeded, 1);
        assert_eq!(take_log(), vec![("B.g", 4)]);
    }
}
