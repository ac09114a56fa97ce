//! Uncompressed region image format.
//!
//! ```text
//! repeat 1024 times (slot index 0..1023):
//!   u8  has_generator   (0 | 1)
//!   [u32 BE length, bytes]  if has_generator
//!   u8  has_environment (0 | 1)
//!   [u32 BE length, bytes]  if has_environment
//! ```

use snapvault_common::{SLOTS_PER_REGION, SlotPayloads};
use std::io::{ErrorKind, Read};

use crate::store::StoreError;

/// Largest payload accepted when decoding.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// Builds a region image one slot at a time, in slot index order.
#[derive(Debug, Default)]
pub struct RegionEncoder {
    buf: Vec<u8>,
    slots: usize,
}

impl RegionEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, slot: &SlotPayloads) -> Result<(), StoreError> {
        if self.slots == SLOTS_PER_REGION {
            return Err(StoreError::SlotCount {
                expected: SLOTS_PER_REGION,
                actual: self.slots + 1,
            });
        }
        write_payload(&mut self.buf, self.slots, slot.generator.as_deref())?;
        write_payload(&mut self.buf, self.slots, slot.environment.as_deref())?;
        self.slots += 1;
        Ok(())
    }

    /// Returns the image; fails unless exactly 1024 slots were pushed.
    pub fn finish(self) -> Result<Vec<u8>, StoreError> {
        if self.slots != SLOTS_PER_REGION {
            return Err(StoreError::SlotCount {
                expected: SLOTS_PER_REGION,
                actual: self.slots,
            });
        }
        Ok(self.buf)
    }
}

fn write_payload(buf: &mut Vec<u8>, slot: usize, payload: Option<&[u8]>) -> Result<(), StoreError> {
    match payload {
        None => buf.push(0),
        Some(bytes) => {
            let len = u32::try_from(bytes.len())
                .ok()
                .filter(|len| *len as usize <= MAX_PAYLOAD_LEN)
                .ok_or(StoreError::PayloadTooLarge {
                    slot,
                    len: bytes.len(),
                })?;
            buf.push(1);
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(bytes);
        }
    }
    Ok(())
}

/// Encodes a full slot array.
pub fn encode_region(slots: &[SlotPayloads]) -> Result<Vec<u8>, StoreError> {
    let mut encoder = RegionEncoder::new();
    for slot in slots {
        encoder.push(slot)?;
    }
    encoder.finish()
}

/// Decodes a region image into its 1024 slots.
///
/// The reader must contain exactly one image; trailing bytes are an error.
pub fn decode_region<R: Read>(mut reader: R) -> Result<Vec<SlotPayloads>, StoreError> {
    let mut slots = Vec::with_capacity(SLOTS_PER_REGION);
    for index in 0..SLOTS_PER_REGION {
        let generator = read_payload(&mut reader, index)?;
        let environment = read_payload(&mut reader, index)?;
        slots.push(SlotPayloads {
            generator,
            environment,
        });
    }
    let mut trailing = [0u8; 1];
    loop {
        match reader.read(&mut trailing) {
            Ok(0) => break,
            Ok(_) => return Err(StoreError::TrailingBytes),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(slots)
}

fn read_payload<R: Read>(reader: &mut R, slot: usize) -> Result<Option<Vec<u8>>, StoreError> {
    let mut flag = [0u8; 1];
    read_exact(reader, &mut flag, slot)?;
    match flag[0] {
        0 => Ok(None),
        1 => {
            let mut len = [0u8; 4];
            read_exact(reader, &mut len, slot)?;
            let len = u32::from_be_bytes(len) as usize;
            if len > MAX_PAYLOAD_LEN {
                return Err(StoreError::PayloadTooLarge { slot, len });
            }
            let mut payload = vec![0u8; len];
            read_exact(reader, &mut payload, slot)?;
            Ok(Some(payload))
        }
        value => Err(StoreError::InvalidFlag { slot, value }),
    }
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], slot: usize) -> Result<(), StoreError> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            StoreError::Truncated { slot }
        } else {
            StoreError::Io(e)
        }
    })
}
