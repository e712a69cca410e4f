//! Return-type classification and the five trampolines. Every target function takes exactly one
//! packed-argument pointer; the only thing that varies is how its return value travels, so five
//! calling shapes cover the whole ecosystem.

use std::os::raw::c_void;

use crate::error::{Result, RouteError};
use crate::platform::SymbolAddr;

/// Classification of a target function's return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnType {
    /// Integer or pointer, returned in the integer register.
    #[default]
    Integer,
    Float,
    Double,
    /// A struct or string returned by pointer.
    StructSmall,
    /// A large struct returned by value through a hidden output-buffer parameter.
    StructLarge,
}

impl ReturnType {
    pub fn name(&self) -> &'static str {
        match self {
            ReturnType::Integer => "integer",
            ReturnType::Float => "float",
            ReturnType::Double => "double",
            ReturnType::StructSmall => "struct_small",
            ReturnType::StructLarge => "struct_large",
        }
    }
}

/// Classify from the interface's textual description. Struct returns start as `StructSmall` and
/// get re-classified by [`effective_return_type`] once the size is known.
pub fn classify_return(description: &str) -> ReturnType {
    let description = description.to_ascii_lowercase();
    if description.contains("float") {
        ReturnType::Float
    } else if description.contains("double") {
        ReturnType::Double
    } else if description.contains("string") || description.contains("struct") {
        ReturnType::StructSmall
    } else {
        ReturnType::Integer
    }
}

/// The by-value cutoff for struct returns is fixed by the host platform's calling convention:
/// 8 bytes on the Windows ABI, 16 on SysV.
cfg_if::cfg_if! {
    if #[cfg(windows)] {
        pub const STRUCT_RETURN_SPLIT: usize = 8;
    } else {
        pub const STRUCT_RETURN_SPLIT: usize = 16;
    }
}

/// Re-classify a small-struct return as large once its size crosses the ABI split.
pub fn effective_return_type(return_type: ReturnType, return_size: usize) -> ReturnType {
    if return_type == ReturnType::StructSmall && return_size > STRUCT_RETURN_SPLIT {
        ReturnType::StructLarge
    } else {
        return_type
    }
}

type IntegerFn = unsafe extern "C" fn(*mut c_void) -> i32;
type FloatFn = unsafe extern "C" fn(*mut c_void) -> f32;
type DoubleFn = unsafe extern "C" fn(*mut c_void) -> f64;
type StructPtrFn = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
type StructValFn = unsafe extern "C" fn(*mut c_void, *mut c_void);

/// Both register images of a call's return value; which one is meaningful depends on the
/// classification.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallResult {
    pub integer: i64,
    pub float: f64,
}

/// Call `func` with a serialized pack through the trampoline for `return_type`.
///
/// The large-struct trampoline threads `struct_buffer` as the hidden output parameter; the
/// small-struct one copies through the returned pointer when a buffer is present.
///
/// # Safety
///
/// `func` must be a function of the matching trampoline shape and `pack` a valid serialized pack
/// for its declared arity.
pub unsafe fn call_through(
    func: SymbolAddr,
    pack: *mut c_void,
    return_type: ReturnType,
    return_size: usize,
    struct_buffer: Option<&mut [u8]>,
) -> Result<CallResult> {
    if func.is_null() || pack.is_null() {
        return Err(RouteError::BadArg("null function or pack"));
    }

    let mut result = CallResult::default();
    match return_type {
        ReturnType::Float => {
            let f: FloatFn = std::mem::transmute(func);
            result.float = f(pack) as f64;
        }
        ReturnType::Double => {
            let f: DoubleFn = std::mem::transmute(func);
            result.float = f(pack);
        }
        ReturnType::StructSmall => {
            let f: StructPtrFn = std::mem::transmute(func);
            let returned = f(pack);
            if let Some(buffer) = struct_buffer {
                if !returned.is_null() && return_size > 0 {
                    let length = return_size.min(buffer.len());
                    std::ptr::copy_nonoverlapping(
                        returned as *const u8,
                        buffer.as_mut_ptr(),
                        length,
                    );
                }
            }
            result.integer = returned as usize as i64;
        }
        ReturnType::StructLarge => {
            let buffer = struct_buffer.ok_or(RouteError::BadArg("missing struct buffer"))?;
            if return_size == 0 || buffer.len() < return_size {
                return Err(RouteError::BadArg("undersized struct buffer"));
            }
            let f: StructValFn = std::mem::transmute(func);
            f(pack, buffer.as_mut_ptr() as *mut c_void);
        }
        ReturnType::Integer => {
            let f: IntegerFn = std::mem::transmute(func);
            result.integer = f(pack) as i64;
        }
    }

    Ok(result)
}
