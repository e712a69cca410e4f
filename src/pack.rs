//! The typed parameter container handed to every target function. Arguments accumulate in an
//! [`ParamPack`], get validated, and are then serialized into a single contiguous block
//! ([`serialize::SerializedPack`]) whose layout every callee in the ecosystem understands.

use std::os::raw::c_void;

pub mod serialize;

/// The hard ceiling on parameters per pack. Part of the wire contract.
pub const MAX_PACK_PARAMS: usize = 256;

/// The closed set of parameter type tags. The discriminants are the on-the-wire values and must
/// not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ParamType {
    Void = 0,
    Int32,
    Int64,
    Float,
    Double,
    Char,
    Pointer,
    String,
    Variadic,
    Any,
    Unknown,
}

impl ParamType {
    pub fn from_raw(raw: i32) -> Option<ParamType> {
        match raw {
            0 => Some(ParamType::Void),
            1 => Some(ParamType::Int32),
            2 => Some(ParamType::Int64),
            3 => Some(ParamType::Float),
            4 => Some(ParamType::Double),
            5 => Some(ParamType::Char),
            6 => Some(ParamType::Pointer),
            7 => Some(ParamType::String),
            8 => Some(ParamType::Variadic),
            9 => Some(ParamType::Any),
            10 => Some(ParamType::Unknown),
            _ => None,
        }
    }

    /// Tags whose payloads are carried by reference: the callee receives the caller's pointer
    /// verbatim, and serialization never relocates them into the trailing region.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            ParamType::Pointer
                | ParamType::String
                | ParamType::Variadic
                | ParamType::Any
                | ParamType::Unknown
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ParamType::Void => "void",
            ParamType::Int32 => "int32",
            ParamType::Int64 => "int64",
            ParamType::Float => "float",
            ParamType::Double => "double",
            ParamType::Char => "char",
            ParamType::Pointer => "pointer",
            ParamType::String => "string",
            ParamType::Variadic => "variadic",
            ParamType::Any => "any",
            ParamType::Unknown => "unknown",
        }
    }
}

/// One parameter's payload. Scalars live as the raw 8 payload bytes of the wire slot, reference
/// tags alias the caller's pointer, and by-value blobs own a copy of the caller's data.
#[derive(Debug, Clone)]
pub enum PackPayload {
    /// The low-order slice of these 8 bytes is the scalar, exactly as the slot union stores it.
    Bits(u64),
    /// The caller's pointer, stored verbatim.
    Ptr(*mut c_void),
    /// A by-value blob copied out of the caller's buffer at pack-construction time.
    Owned(Box<[u8]>),
}

#[derive(Debug, Clone)]
pub struct Param {
    pub tag: ParamType,
    pub size: usize,
    pub payload: PackPayload,
}

/// The in-memory parameter pack.
///
/// Scalar payloads are carried by value in the slot, pointer/string payloads keep the caller's
/// pointer, and by-value blobs own a copy of the caller's data. Dispatch builds packs from the
/// accumulated interface-state rows; the validation cache builds its probe packs with
/// [`ParamPack::probe`]. (The C ancestor of this format fell back to aliasing the caller's
/// pointer with the size zeroed when the by-value copy's allocation failed; in Rust the copy is
/// infallible, but a by-value tag supplied with size 0 still produces the same non-owning
/// verbatim-pointer slot.)
#[derive(Debug, Clone, Default)]
pub struct ParamPack {
    params: Vec<Param>,
}

impl ParamPack {
    pub fn new() -> ParamPack {
        ParamPack { params: Vec::new() }
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn push(&mut self, param: Param) {
        self.params.push(param);
    }

    /// The probe pack used by the validation cache: `arity` all-zero int32 scalars.
    pub fn probe(arity: usize) -> ParamPack {
        let mut pack = ParamPack::new();
        for _ in 0..arity {
            pack.push(Param {
                tag: ParamType::Int32,
                size: std::mem::size_of::<i32>(),
                payload: PackPayload::Bits(0),
            });
        }

        pack
    }

    /// Structural validation: the count must fit the wire bound. (Tags are valid by construction
    /// on the Rust side; the raw-block validation in [`serialize`] re-checks them for packs that
    /// arrived over the ABI.)
    pub fn validate(&self) -> Result<(), crate::error::RouteError> {
        if self.params.len() > MAX_PACK_PARAMS {
            nx_error!(
                "invalid param pack: param_count={} (must be 0-{})",
                self.params.len(),
                MAX_PACK_PARAMS
            );
            return Err(crate::error::RouteError::PackInvalid);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_pack_shape() {
        let pack = ParamPack::probe(3);
        assert_eq!(pack.param_count(), 3);
        for param in pack.params() {
            assert_eq!(param.tag, ParamType::Int32);
            assert!(matches!(param.payload, PackPayload::Bits(0)));
        }
        assert!(pack.validate().is_ok());
    }

    #[test]
    fn oversized_pack_fails_validation() {
        let mut pack = ParamPack::new();
        for _ in 0..=MAX_PACK_PARAMS {
            pack.push(Param {
                tag: ParamType::Int32,
                size: 4,
                payload: PackPayload::Bits(0),
            });
        }
        assert!(pack.validate().is_err());
    }

    #[test]
    fn tag_round_trip() {
        for raw in 0..=10 {
            let tag = ParamType::from_raw(raw).unwrap();
            assert_eq!(tag as i32, raw);
        }
        assert!(ParamType::from_raw(11).is_none());
        assert!(ParamType::from_raw(-1).is_none());
    }
}
