//! The exported C ABI: the two dispatcher entry points every host and plugin can call, plus the
//! nxld metadata surface describing them. Nothing here unwinds across the FFI boundary; outcomes
//! are the integer codes the ecosystem expects.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};

use crate::context::{with_context, StoredPointer};
use crate::dispatch::dispatch_event;
use crate::dispatch::state::PARAM_COUNT_FIXED;
use crate::pack::ParamType;
use crate::util::strlcpy;

/// The identity this engine presents to the rule store: rules that react to `TransferPointer`
/// name this plugin as their source.
pub const ENGINE_PLUGIN_NAME: &str = "PointerTransferPlugin";
pub const ENGINE_VERSION: &str = "1.2.0";

const INTERFACE_NAMES: [&str; 2] = ["TransferPointer", "CallPlugin"];
const INTERFACE_DESCRIPTIONS: [&str; 2] = [
    "registers a typed pointer value and routes it onward",
    "signals that a source plugin's parameter has a value",
];
const INTERFACE_VERSIONS: [&str; 2] = [ENGINE_VERSION, ENGINE_VERSION];

const TRANSFER_POINTER_PARAMS: [(&str, ParamType, &str); 4] = [
    ("ptr", ParamType::Pointer, "void*"),
    ("expected_type", ParamType::Int32, "nxld_param_type_t"),
    ("type_name", ParamType::String, "const char*"),
    ("data_size", ParamType::Int64, "size_t"),
];

const CALL_PLUGIN_PARAMS: [(&str, ParamType, &str); 4] = [
    ("source_plugin_name", ParamType::String, "const char*"),
    ("source_interface_name", ParamType::String, "const char*"),
    ("param_index", ParamType::Int32, "int"),
    ("param_value", ParamType::Pointer, "void*"),
];

/// The compatibility lattice for repeated pointer assertions: identical tags match, `any` accepts
/// everything, and `pointer`/`string` are interchangeable.
pub fn tags_compatible(stored: ParamType, asserted: ParamType) -> bool {
    stored == asserted
        || asserted == ParamType::Any
        || (asserted == ParamType::Pointer && stored == ParamType::String)
        || (asserted == ParamType::String && stored == ParamType::Pointer)
}

unsafe fn copy_to_buffer(text: &str, buffer: *mut c_char, buffer_size: usize) {
    if !buffer.is_null() && buffer_size > 0 {
        strlcpy(std::slice::from_raw_parts_mut(buffer, buffer_size), text);
    }
}

/// Register a typed pointer value and route it onward.
///
/// Returns 0 on clean storage, 1 when the assertion conflicts with what was stored for the same
/// address (the new assertion still wins), and -1 for a null pointer.
///
/// # Safety
///
/// `type_name` must be null or a valid C string; `ptr` must stay valid for as long as rules may
/// route it onward.
#[no_mangle]
pub unsafe extern "C" fn TransferPointer(
    ptr: *mut c_void,
    expected_type: c_int,
    type_name: *const c_char,
    data_size: usize,
) -> c_int {
    if ptr.is_null() {
        nx_warn!("TransferPointer: received null pointer");
        return -1;
    }

    let asserted_tag = ParamType::from_raw(expected_type).unwrap_or(ParamType::Unknown);
    let asserted_name = if type_name.is_null() {
        None
    } else {
        let name = CStr::from_ptr(type_name).to_string_lossy().into_owned();
        (!name.is_empty()).then_some(name)
    };

    with_context(|ctx| {
        let mut mismatch = false;
        if !ctx.stored.ptr.is_null() && ctx.stored.ptr == ptr {
            if !tags_compatible(ctx.stored.tag, asserted_tag) {
                nx_warn!(
                    "TransferPointer: type mismatch for pointer {:?} - stored: {} ({}), asserted: {} ({})",
                    ptr,
                    ctx.stored.tag.name(),
                    ctx.stored.type_name.as_deref().unwrap_or("unknown"),
                    asserted_tag.name(),
                    asserted_name.as_deref().unwrap_or("unknown"),
                );
                mismatch = true;
            }
            if data_size > 0 && ctx.stored.size > 0 && data_size != ctx.stored.size {
                nx_warn!(
                    "TransferPointer: size mismatch for pointer {:?} - stored: {}, asserted: {}",
                    ptr,
                    ctx.stored.size,
                    data_size
                );
                mismatch = true;
            }
        }

        // The new assertion wins either way.
        ctx.stored = StoredPointer {
            ptr,
            tag: asserted_tag,
            type_name: asserted_name,
            size: data_size,
        };

        if mismatch {
            nx_log!(
                "TransferPointer: pointer stored with mismatch warning - type: {}, size: {}",
                asserted_tag.name(),
                data_size
            );
            return 1;
        }

        nx_log!(
            "TransferPointer: pointer transferred - type: {}, size: {}",
            asserted_tag.name(),
            data_size
        );

        let mut frames = Vec::new();
        dispatch_event(ctx, ENGINE_PLUGIN_NAME, "TransferPointer", 0, ptr, 0, &mut frames);
        0
    })
}

/// Signal that a source plugin's parameter (or return value, index -1) has a value.
///
/// Returns 0 when at least one target call succeeded, -1 when no rule matched or every target
/// call failed.
///
/// # Safety
///
/// The name arguments must be valid C strings; `param_value` must be null or point at a value of
/// the type the matching rules expect.
#[no_mangle]
pub unsafe extern "C" fn CallPlugin(
    source_plugin_name: *const c_char,
    source_interface_name: *const c_char,
    param_index: c_int,
    param_value: *mut c_void,
) -> c_int {
    if source_plugin_name.is_null() || source_interface_name.is_null() {
        nx_warn!("CallPlugin: invalid parameters");
        return -1;
    }

    let source_plugin = CStr::from_ptr(source_plugin_name).to_string_lossy().into_owned();
    let source_interface = CStr::from_ptr(source_interface_name)
        .to_string_lossy()
        .into_owned();

    nx_log!(
        "CallPlugin: source_plugin={}, source_interface={}, param_index={}",
        source_plugin,
        source_interface,
        param_index
    );

    with_context(|ctx| {
        let mut frames = Vec::new();
        let outcome = dispatch_event(
            ctx,
            &source_plugin,
            &source_interface,
            param_index,
            param_value,
            0,
            &mut frames,
        );

        if outcome.matched == 0 {
            nx_warn!(
                "CallPlugin: no matching rule for {}.{}[{}]; transfer rules must be configured in a .nxpt file",
                source_plugin,
                source_interface,
                param_index
            );
            return -1;
        }

        nx_log!(
            "CallPlugin: processed {} rules, {} successful",
            outcome.matched,
            outcome.succeeded
        );
        if outcome.succeeded > 0 {
            0
        } else {
            -1
        }
    })
}

/// # Safety
///
/// `name` must point at a writable buffer of `name_size` bytes.
#[no_mangle]
pub unsafe extern "C" fn nxld_plugin_get_name(name: *mut c_char, name_size: usize) -> i32 {
    if name.is_null() || name_size == 0 {
        return -1;
    }
    copy_to_buffer(ENGINE_PLUGIN_NAME, name, name_size);
    0
}

/// # Safety
///
/// `version` must point at a writable buffer of `version_size` bytes.
#[no_mangle]
pub unsafe extern "C" fn nxld_plugin_get_version(version: *mut c_char, version_size: usize) -> i32 {
    if version.is_null() || version_size == 0 {
        return -1;
    }
    copy_to_buffer(ENGINE_VERSION, version, version_size);
    0
}

/// # Safety
///
/// `count` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn nxld_plugin_get_interface_count(count: *mut usize) -> i32 {
    if count.is_null() {
        return -1;
    }
    *count = INTERFACE_NAMES.len();
    0
}

/// # Safety
///
/// Every non-null buffer must be writable at its declared size.
#[no_mangle]
pub unsafe extern "C" fn nxld_plugin_get_interface_info(
    index: usize,
    name: *mut c_char,
    name_size: usize,
    description: *mut c_char,
    description_size: usize,
    version: *mut c_char,
    version_size: usize,
) -> i32 {
    if index >= INTERFACE_NAMES.len() {
        return -1;
    }
    copy_to_buffer(INTERFACE_NAMES[index], name, name_size);
    copy_to_buffer(INTERFACE_DESCRIPTIONS[index], description, description_size);
    copy_to_buffer(INTERFACE_VERSIONS[index], version, version_size);
    0
}

/// # Safety
///
/// The out-parameters must be valid pointers.
#[no_mangle]
pub unsafe extern "C" fn nxld_plugin_get_interface_param_count(
    index: usize,
    count_type: *mut i32,
    min_count: *mut i32,
    max_count: *mut i32,
) -> i32 {
    if index >= INTERFACE_NAMES.len()
        || count_type.is_null()
        || min_count.is_null()
        || max_count.is_null()
    {
        return -1;
    }

    *count_type = PARAM_COUNT_FIXED;
    *min_count = 4;
    *max_count = 4;
    0
}

/// # Safety
///
/// `param_name` and `param_type` must be valid; `type_name` may be null.
#[no_mangle]
pub unsafe extern "C" fn nxld_plugin_get_interface_param_info(
    index: usize,
    param_index: i32,
    param_name: *mut c_char,
    name_size: usize,
    param_type: *mut i32,
    type_name: *mut c_char,
    type_name_size: usize,
) -> i32 {
    if index >= INTERFACE_NAMES.len()
        || param_name.is_null()
        || name_size == 0
        || param_type.is_null()
    {
        return -1;
    }

    let params: &[(&str, ParamType, &str)] = if index == 0 {
        &TRANSFER_POINTER_PARAMS
    } else {
        &CALL_PLUGIN_PARAMS
    };
    let Ok(param_index) = usize::try_from(param_index) else {
        return -1;
    };
    let Some((name, tag, c_type_name)) = params.get(param_index) else {
        return -1;
    };

    copy_to_buffer(name, param_name, name_size);
    *param_type = *tag as i32;
    copy_to_buffer(c_type_name, type_name, type_name_size);
    0
}
