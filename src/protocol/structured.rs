//! Hook for marshalling user-defined structures.
//!
//! Compound payloads (blocks whose type is [`DataType::Compound`](crate::data::DataType))
//! are not understood by the wire codec itself. They are handed to a [`StructuredCodec`],
//! which owns their layout on the wire.
use std::io::{Read, Write};

use crate::data::OpaqueType;

use super::{ProtocolError, codec::MAX_ELEMENTS};

pub trait StructuredCodec: Send + Sync {
    fn send(
        &self,
        out: &mut dyn Write,
        opaque_type: OpaqueType,
        payload: &[u8],
    ) -> Result<(), ProtocolError>;

    fn receive(
        &self,
        input: &mut dyn Read,
        opaque_type: OpaqueType,
    ) -> Result<Vec<u8>, ProtocolError>;
}

/// Moves structured payloads as length-prefixed byte blobs.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpaquePassthrough;

impl StructuredCodec for OpaquePassthrough {
    fn send(
        &self,
        out: &mut dyn Write,
        _opaque_type: OpaqueType,
        payload: &[u8],
    ) -> Result<(), ProtocolError> {
        let len = payload.len() as u64;
        if len > MAX_ELEMENTS {
            return Err(ProtocolError::AllocationTooLarge {
                what: "structure",
                count: len,
                limit: MAX_ELEMENTS,
            });
        }
        out.write_all(&(len as u32).to_be_bytes())?;
        out.write_all(payload)?;
        Ok(())
    }

    fn receive(
        &self,
        input: &mut dyn Read,
        _opaque_type: OpaqueType,
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut len = [0u8; 4];
        input.read_exact(&mut len)?;
        let len = u32::from_be_bytes(len) as u64;
        if len > MAX_ELEMENTS {
            return Err(ProtocolError::AllocationTooLarge {
                what: "structure",
                count: len,
                limit: MAX_ELEMENTS,
            });
        }

        let mut payload = vec![0u8; len as usize];
        input.read_exact(&mut payload)?;
        Ok(payload)
    }
}
