//! Interface state rows: the per-(target-plugin, target-interface) accumulator that collects
//! argument values until the call is ready. Rows are created lazily on first touch by querying
//! the target's own metadata surface, and live until teardown.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};

use super::call::{classify_return, ReturnType};
use crate::error::{Result, RouteError};
use crate::pack::{PackPayload, Param, ParamPack, ParamType};
use crate::platform::{LibHandle, Platform, SymbolAddr};

/// `nxld_param_count_type_t`: how an interface's arity is declared.
pub const PARAM_COUNT_FIXED: i32 = 0;
pub const PARAM_COUNT_VARIADIC: i32 = 1;

/// The metadata surface every routable plugin exports.
pub const SYM_GET_INTERFACE_COUNT: &str = "nxld_plugin_get_interface_count";
pub const SYM_GET_INTERFACE_INFO: &str = "nxld_plugin_get_interface_info";
pub const SYM_GET_INTERFACE_PARAM_COUNT: &str = "nxld_plugin_get_interface_param_count";
pub const SYM_GET_INTERFACE_PARAM_INFO: &str = "nxld_plugin_get_interface_param_info";

pub type GetInterfaceCountFn = unsafe extern "C" fn(*mut usize) -> i32;
pub type GetInterfaceInfoFn = unsafe extern "C" fn(
    usize,
    *mut c_char,
    usize,
    *mut c_char,
    usize,
    *mut c_char,
    usize,
) -> i32;
pub type GetInterfaceParamCountFn =
    unsafe extern "C" fn(usize, *mut i32, *mut i32, *mut i32) -> i32;
pub type GetInterfaceParamInfoFn =
    unsafe extern "C" fn(usize, i32, *mut c_char, usize, *mut i32, *mut c_char, usize) -> i32;

/// What the metadata surface told us about one interface.
#[derive(Debug)]
pub struct InterfaceMeta {
    pub description: String,
    pub is_variadic: bool,
    pub min_param_count: usize,
    pub param_types: Vec<ParamType>,
}

fn buffer_to_string(buffer: &[c_char]) -> String {
    unsafe { CStr::from_ptr(buffer.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Resolve the target's metadata exports and describe `interface_name`. A target without the
/// metadata surface cannot be sized and is rejected.
pub fn query_interface_metadata(
    platform: &mut dyn Platform,
    handle: LibHandle,
    plugin_name: &str,
    interface_name: &str,
) -> Result<InterfaceMeta> {
    let no_metadata = || RouteError::NoMetadata {
        plugin: plugin_name.to_owned(),
        interface: interface_name.to_owned(),
    };

    let get_count = platform
        .resolve_symbol(handle, SYM_GET_INTERFACE_COUNT)
        .ok_or_else(no_metadata)?;
    let get_info = platform
        .resolve_symbol(handle, SYM_GET_INTERFACE_INFO)
        .ok_or_else(no_metadata)?;
    let get_param_count = platform
        .resolve_symbol(handle, SYM_GET_INTERFACE_PARAM_COUNT)
        .ok_or_else(no_metadata)?;
    let get_param_info = platform
        .resolve_symbol(handle, SYM_GET_INTERFACE_PARAM_INFO)
        .ok_or_else(no_metadata)?;

    unsafe {
        let get_count: GetInterfaceCountFn = std::mem::transmute(get_count);
        let get_info: GetInterfaceInfoFn = std::mem::transmute(get_info);
        let get_param_count: GetInterfaceParamCountFn = std::mem::transmute(get_param_count);
        let get_param_info: GetInterfaceParamInfoFn = std::mem::transmute(get_param_info);

        let mut interface_count: usize = 0;
        if get_count(&mut interface_count) != 0 {
            return Err(no_metadata());
        }

        // Find the interface by name; keep its description for return-type classification.
        let mut interface_index = None;
        let mut description = String::new();
        for index in 0..interface_count {
            let mut name_buffer = [0 as c_char; 256];
            let mut description_buffer = [0 as c_char; 512];
            let mut version_buffer = [0 as c_char; 64];
            if get_info(
                index,
                name_buffer.as_mut_ptr(),
                name_buffer.len(),
                description_buffer.as_mut_ptr(),
                description_buffer.len(),
                version_buffer.as_mut_ptr(),
                version_buffer.len(),
            ) != 0
            {
                continue;
            }
            if buffer_to_string(&name_buffer) == interface_name {
                interface_index = Some(index);
                description = buffer_to_string(&description_buffer);
                break;
            }
        }
        let interface_index = interface_index.ok_or_else(no_metadata)?;

        let mut count_type: i32 = PARAM_COUNT_FIXED;
        let mut min_count: i32 = 0;
        let mut max_count: i32 = 0;
        if get_param_count(interface_index, &mut count_type, &mut min_count, &mut max_count) != 0 {
            return Err(no_metadata());
        }

        let is_variadic = count_type == PARAM_COUNT_VARIADIC;
        let min_param_count = min_count.max(0) as usize;
        let declared = max_count.max(min_count).max(0) as usize;

        let mut param_types = Vec::with_capacity(declared);
        for param_index in 0..declared {
            let mut name_buffer = [0 as c_char; 256];
            let mut type_name_buffer = [0 as c_char; 128];
            let mut raw_type: i32 = ParamType::Unknown as i32;
            if get_param_info(
                interface_index,
                param_index as i32,
                name_buffer.as_mut_ptr(),
                name_buffer.len(),
                &mut raw_type,
                type_name_buffer.as_mut_ptr(),
                type_name_buffer.len(),
            ) != 0
            {
                param_types.push(ParamType::Unknown);
                continue;
            }
            param_types.push(ParamType::from_raw(raw_type).unwrap_or(ParamType::Unknown));
        }

        Ok(InterfaceMeta {
            description,
            is_variadic,
            min_param_count,
            param_types,
        })
    }
}

/// Where one parameter slot's current value lives.
#[derive(Debug, Clone, Copy)]
pub enum SlotSource {
    Empty,
    /// The row's integer-constants array (int32/int64/char, widened).
    IntConst,
    /// The row's float-constants array (float/double, widened).
    FloatConst,
    /// A pointer stored verbatim.
    Ptr(*mut c_void),
}

/// One interface state row.
#[derive(Debug)]
pub struct InterfaceState {
    pub plugin_name: String,
    pub interface_name: String,
    pub plugin_path: String,
    pub handle: LibHandle,
    pub func: SymbolAddr,
    pub param_count: usize,
    pub param_types: Vec<ParamType>,
    pub ready: Vec<bool>,
    pub sizes: Vec<usize>,
    pub sources: Vec<SlotSource>,
    pub int_consts: Vec<i64>,
    pub float_consts: Vec<f64>,
    /// Owned storage for string constants, so their pointers stay valid while a partially
    /// filled row waits for the rest of its arguments.
    string_consts: Vec<Option<CString>>,
    pub is_variadic: bool,
    pub min_param_count: usize,
    pub return_type: ReturnType,
    pub return_size: usize,
    pub in_use: bool,
    pub validation_done: bool,
}

impl InterfaceState {
    pub fn new(
        plugin_name: &str,
        interface_name: &str,
        plugin_path: &str,
        handle: LibHandle,
        func: SymbolAddr,
        meta: InterfaceMeta,
    ) -> InterfaceState {
        let param_count = meta.param_types.len();
        InterfaceState {
            plugin_name: plugin_name.to_owned(),
            interface_name: interface_name.to_owned(),
            plugin_path: plugin_path.to_owned(),
            handle,
            func,
            param_count,
            param_types: meta.param_types,
            ready: vec![false; param_count],
            sizes: vec![0; param_count],
            sources: vec![SlotSource::Empty; param_count],
            int_consts: vec![0; param_count],
            float_consts: vec![0.0; param_count],
            string_consts: vec![None; param_count],
            is_variadic: meta.is_variadic,
            min_param_count: meta.min_param_count,
            return_type: classify_return(&meta.description),
            return_size: 0,
            in_use: false,
            validation_done: false,
        }
    }

    fn check_index(&self, param_index: i32) -> Result<usize> {
        let index = usize::try_from(param_index).map_err(|_| RouteError::ParamOutOfRange {
            plugin: self.plugin_name.clone(),
            interface: self.interface_name.clone(),
            index: param_index,
        })?;
        if index >= self.param_count {
            return Err(RouteError::ParamOutOfRange {
                plugin: self.plugin_name.clone(),
                interface: self.interface_name.clone(),
                index: param_index,
            });
        }
        Ok(index)
    }

    /// Type-directed coercion of an incoming value (spec'd by the target's declared tag).
    /// `stored_size` is the size the source asserted via `TransferPointer`, if any.
    ///
    /// # Safety
    ///
    /// A non-null `value` must point at a live object readable at the width the target tag
    /// implies.
    pub unsafe fn store_incoming(
        &mut self,
        param_index: i32,
        value: *mut c_void,
        stored_size: usize,
    ) -> Result<()> {
        let index = self.check_index(param_index)?;

        match self.param_types[index] {
            ParamType::Int32 => {
                self.int_consts[index] = if value.is_null() {
                    0
                } else {
                    *(value as *const i32) as i64
                };
                self.set_slot(index, SlotSource::IntConst, std::mem::size_of::<i32>());
            }
            ParamType::Int64 => {
                self.int_consts[index] = if value.is_null() {
                    0
                } else {
                    *(value as *const i64)
                };
                self.set_slot(index, SlotSource::IntConst, std::mem::size_of::<i64>());
            }
            ParamType::Float => {
                self.float_consts[index] = if value.is_null() {
                    0.0
                } else {
                    *(value as *const f32) as f64
                };
                self.set_slot(index, SlotSource::FloatConst, std::mem::size_of::<f32>());
            }
            ParamType::Double => {
                self.float_consts[index] = if value.is_null() {
                    0.0
                } else {
                    *(value as *const f64)
                };
                self.set_slot(index, SlotSource::FloatConst, std::mem::size_of::<f64>());
            }
            ParamType::Char => {
                self.int_consts[index] = if value.is_null() {
                    0
                } else {
                    *(value as *const u8) as i64
                };
                self.set_slot(index, SlotSource::IntConst, std::mem::size_of::<u8>());
            }
            ParamType::Pointer | ParamType::String => {
                let size = if stored_size > 0 {
                    stored_size
                } else {
                    std::mem::size_of::<*const c_void>()
                };
                self.set_slot(index, SlotSource::Ptr(value), size);
            }
            ParamType::Variadic | ParamType::Any | ParamType::Unknown | ParamType::Void => {
                // Values that fit the 8-byte window widen to int64, everything else stays a
                // pointer.
                if stored_size > 0 && stored_size <= 8 && !value.is_null() {
                    self.int_consts[index] = *(value as *const i64);
                    self.set_slot(index, SlotSource::IntConst, stored_size);
                } else {
                    let size = if stored_size > 0 {
                        stored_size
                    } else {
                        std::mem::size_of::<*const c_void>()
                    };
                    self.set_slot(index, SlotSource::Ptr(value), size);
                }
            }
        }

        nx_log!(
            "stored parameter {} for {}.{} ({}, size={})",
            index,
            self.plugin_name,
            self.interface_name,
            self.param_types[index].name(),
            self.sizes[index],
        );
        Ok(())
    }

    /// Parse a rule-provided literal to the target parameter's tag and write it into the row's
    /// constant slot. An unparsable literal rejects the rule.
    pub fn store_constant(&mut self, param_index: i32, literal: &str) -> Result<()> {
        let index = self.check_index(param_index)?;
        if literal.is_empty() {
            return Err(RouteError::BadArg("empty constant"));
        }

        match self.param_types[index] {
            ParamType::Int32 => {
                let parsed: i32 = literal
                    .parse()
                    .map_err(|_| RouteError::BadArg("unparsable int32 constant"))?;
                self.int_consts[index] = parsed as i64;
                self.set_slot(index, SlotSource::IntConst, std::mem::size_of::<i32>());
            }
            ParamType::Int64 => {
                let parsed: i64 = literal
                    .parse()
                    .map_err(|_| RouteError::BadArg("unparsable int64 constant"))?;
                self.int_consts[index] = parsed;
                self.set_slot(index, SlotSource::IntConst, std::mem::size_of::<i64>());
            }
            ParamType::Float => {
                let parsed: f32 = literal
                    .parse()
                    .map_err(|_| RouteError::BadArg("unparsable float constant"))?;
                self.float_consts[index] = parsed as f64;
                self.set_slot(index, SlotSource::FloatConst, std::mem::size_of::<f32>());
            }
            ParamType::Double => {
                let parsed: f64 = literal
                    .parse()
                    .map_err(|_| RouteError::BadArg("unparsable double constant"))?;
                self.float_consts[index] = parsed;
                self.set_slot(index, SlotSource::FloatConst, std::mem::size_of::<f64>());
            }
            ParamType::Char => {
                self.int_consts[index] = literal.as_bytes()[0] as i64;
                self.set_slot(index, SlotSource::IntConst, std::mem::size_of::<u8>());
            }
            ParamType::String => {
                let cstring = CString::new(literal)
                    .map_err(|_| RouteError::BadArg("string constant with embedded nul"))?;
                let stored = self.string_consts[index].insert(cstring);
                let pointer = stored.as_ptr() as *mut c_void;
                self.set_slot(index, SlotSource::Ptr(pointer), literal.len() + 1);
            }
            _ => return Err(RouteError::BadArg("constant for non-scalar parameter")),
        }

        nx_log!(
            "using constant value for parameter {} of {}.{}: {}",
            index,
            self.plugin_name,
            self.interface_name,
            literal
        );
        Ok(())
    }

    fn set_slot(&mut self, index: usize, source: SlotSource, size: usize) {
        self.sources[index] = source;
        self.sizes[index] = size;
        self.ready[index] = true;
    }

    /// How many leading parameters are ready.
    pub fn ready_prefix(&self) -> usize {
        self.ready.iter().take_while(|ready| **ready).count()
    }

    /// Whether the row has everything it needs: all fixed parameters, or the variadic minimum
    /// (and at least one argument, unless the interface takes none at all).
    pub fn is_ready(&self) -> bool {
        if self.param_count == 0 {
            return true;
        }
        if self.is_variadic {
            let prefix = self.ready_prefix();
            prefix >= self.min_param_count && prefix > 0
        } else {
            self.ready.iter().all(|ready| *ready)
        }
    }

    /// The number of arguments the next call will carry.
    pub fn actual_param_count(&self) -> usize {
        if self.is_variadic {
            self.ready_prefix()
        } else {
            self.param_count
        }
    }

    /// Materialize the accumulated arguments as a parameter pack.
    ///
    /// # Safety
    ///
    /// Pointer-sourced slots must still point at live data; the dispatcher only builds packs
    /// while the originating event is on the stack.
    pub unsafe fn build_pack(&self) -> ParamPack {
        let count = self.actual_param_count();
        let mut pack = ParamPack::new();

        for index in 0..count {
            let tag = self.param_types[index];
            let size = self.sizes[index];
            let payload = match self.sources[index] {
                SlotSource::Empty => match tag.is_reference() {
                    true => PackPayload::Ptr(std::ptr::null_mut()),
                    false => PackPayload::Bits(0),
                },
                SlotSource::IntConst => {
                    let value = self.int_consts[index];
                    match tag {
                        ParamType::Int32 => PackPayload::Bits(value as i32 as u32 as u64),
                        ParamType::Char => PackPayload::Bits(value as u8 as u64),
                        _ => PackPayload::Bits(value as u64),
                    }
                }
                SlotSource::FloatConst => {
                    let value = self.float_consts[index];
                    match tag {
                        ParamType::Float => PackPayload::Bits((value as f32).to_bits() as u64),
                        _ => PackPayload::Bits(value.to_bits()),
                    }
                }
                SlotSource::Ptr(pointer) => {
                    if !tag.is_reference() && !pointer.is_null() && size > 0 {
                        // A by-value blob: the pack owns a copy.
                        let bytes = std::slice::from_raw_parts(pointer as *const u8, size);
                        PackPayload::Owned(bytes.to_vec().into_boxed_slice())
                    } else {
                        PackPayload::Ptr(pointer)
                    }
                }
            };

            pack.push(Param { tag, size, payload });
        }

        pack
    }

    /// Reset the argument accumulator after a dispatch. The row itself lives on.
    pub fn clear_params(&mut self) {
        for ready in &mut self.ready {
            *ready = false;
        }
        for source in &mut self.sources {
            *source = SlotSource::Empty;
        }
    }
}
