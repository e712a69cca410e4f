//! The serialized, single-allocation form of a parameter pack.
//!
//! The over-the-wire layout is fixed for every callee in the ecosystem:
//!
//! ```text
//! +0      : count           (signed, 8 bytes)
//! +8      : slot array ptr  (= base + 16)
//! +16     : slot[0]         fixed-stride 24-byte records
//! ...
//! +16+N*S : trailing payload region (copies of >8-byte by-value data)
//! ```
//!
//! A slot's payload pointer that references the trailing region is stored as an absolute address
//! inside the block, so the callee needs no fix-ups. Exactly one allocation backs the whole block.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::os::raw::c_void;
use std::ptr::NonNull;

use super::{PackPayload, ParamPack, ParamType, MAX_PACK_PARAMS};
use crate::error::{Result, RouteError};

/// One wire slot: `{tag (4 bytes), padding, size (8 bytes), payload (8 bytes)}`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawSlot {
    pub tag: i32,
    pub size: u64,
    pub payload: u64,
}

/// The block header a callee casts its argument to.
#[repr(C)]
#[derive(Debug)]
pub struct RawPackHeader {
    pub count: i64,
    pub slots: *mut RawSlot,
}

const HEADER_SIZE: usize = std::mem::size_of::<RawPackHeader>();
const SLOT_SIZE: usize = std::mem::size_of::<RawSlot>();

/// An owned serialized block. Freed as one unit on drop.
pub struct SerializedPack {
    base: NonNull<u8>,
    layout: Layout,
}

impl SerializedPack {
    /// The pointer handed to the target function.
    pub fn as_ptr(&self) -> *mut c_void {
        self.base.as_ptr() as *mut c_void
    }

    pub fn byte_len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for SerializedPack {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// Serialize a validated pack into a fresh contiguous block.
///
/// Reference-tagged payloads keep the caller's pointer; owned by-value payloads larger than the
/// 8-byte inline window are copied into the trailing region and their slots point into the block.
/// Owned payloads that do fit 8 bytes keep pointing at the pack's own buffer, so the pack must
/// outlive the call that consumes the block (the dispatcher holds both across the call).
pub fn serialize_pack(pack: &ParamPack) -> Result<SerializedPack> {
    pack.validate()?;

    let count = pack.param_count();
    let mut trailing_size = 0usize;
    for param in pack.params() {
        if let PackPayload::Owned(data) = &param.payload {
            if param.size > 8 {
                trailing_size = trailing_size
                    .checked_add(data.len())
                    .ok_or(RouteError::Overflow("serialized pack"))?;
            }
        }
    }

    let total_size = HEADER_SIZE + count * SLOT_SIZE + trailing_size;
    let layout = Layout::from_size_align(total_size, std::mem::align_of::<RawPackHeader>())
        .map_err(|_| RouteError::Overflow("serialized pack layout"))?;

    unsafe {
        let Some(base) = NonNull::new(alloc_zeroed(layout)) else {
            std::alloc::handle_alloc_error(layout);
        };
        let header = base.as_ptr() as *mut RawPackHeader;
        let slots = base.as_ptr().add(HEADER_SIZE) as *mut RawSlot;
        (*header).count = count as i64;
        (*header).slots = slots;

        let mut trailing = base.as_ptr().add(HEADER_SIZE + count * SLOT_SIZE);
        for (index, param) in pack.params().iter().enumerate() {
            let slot = slots.add(index);
            (*slot).tag = param.tag as i32;
            (*slot).size = param.size as u64;
            (*slot).payload = match &param.payload {
                PackPayload::Bits(bits) => *bits,
                PackPayload::Ptr(ptr) => *ptr as usize as u64,
                PackPayload::Owned(data) => {
                    if param.size > 8 {
                        std::ptr::copy_nonoverlapping(data.as_ptr(), trailing, data.len());
                        let address = trailing as usize as u64;
                        trailing = trailing.add(data.len());
                        address
                    } else {
                        data.as_ptr() as usize as u64
                    }
                }
            };
        }

        nx_debug_assert!(
            trailing as usize == base.as_ptr() as usize + total_size,
            "trailing region fill must consume the block exactly"
        );

        Ok(SerializedPack { base, layout })
    }
}

/// Structural validation of a raw block, for packs that arrived over the ABI.
///
/// # Safety
///
/// `header` must point at a readable block in the serialized layout (or be null).
pub unsafe fn validate_raw(header: *const RawPackHeader) -> bool {
    if header.is_null() {
        return false;
    }

    let count = (*header).count;
    if count < 0 || count as usize > MAX_PACK_PARAMS {
        nx_error!(
            "invalid param pack: param_count={} (must be 0-{})",
            count,
            MAX_PACK_PARAMS
        );
        return false;
    }

    if count > 0 {
        let slots = (*header).slots;
        if slots.is_null() {
            nx_error!(
                "invalid param pack: slot array is null but param_count={}",
                count
            );
            return false;
        }
        for index in 0..count as usize {
            let tag = (*slots.add(index)).tag;
            if ParamType::from_raw(tag).is_none() {
                nx_error!("invalid param pack: param[{}] has invalid tag={}", index, tag);
                return false;
            }
        }
    }

    true
}

/// Reinterpret a received block as a pack header. The embedded slot pointer is recomputed from
/// the base address when it is null; the count is bounds-checked; the pointer is then returned
/// unchanged. Callees may equally well cast the block directly.
///
/// # Safety
///
/// `data` must be null or point at a block in the serialized layout.
pub unsafe fn deserialize(data: *mut c_void) -> Option<*mut RawPackHeader> {
    if data.is_null() {
        return None;
    }

    let header = data as *mut RawPackHeader;
    let count = (*header).count;
    if count < 0 || count as usize > MAX_PACK_PARAMS {
        return None;
    }

    if (*header).slots.is_null() {
        (*header).slots = (data as *mut u8).add(HEADER_SIZE) as *mut RawSlot;
    }

    Some(header)
}
