//! Byte layouts shared by mailbox writers and the leader.
//!
//! Control block (fixed size, little-endian):
//!
//! ```text
//! offset  size  field
//! 0       4     processId            i32
//! 4       4     argumentCount        i32
//! 8       1     usesSecondaryRegion  u8 (0/1)
//! 9       16    rendezvousId         UUID bytes, nil = mailbox vacant
//! 25      8     dataLength           i64
//! ```
//!
//! Argument block (secondary region, `dataLength` bytes):
//!
//! ```text
//! [i32 maxArgLen] ([i32 len][UTF-8 bytes of len])*
//! ```

use crate::error::{RelayError, Result};
use bytes::{Buf, BufMut};
use uuid::Uuid;

/// Size of the mailbox region.
pub const CONTROL_BLOCK_SIZE: usize = 4 + 4 + 1 + 16 + 8;

const RENDEZVOUS_OFFSET: usize = 9;

/// The record a follower leaves in the mailbox region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MailboxControlBlock {
    pub process_id: i32,
    pub argument_count: i32,
    pub uses_secondary_region: bool,
    pub rendezvous_id: Uuid,
    pub data_length: i64,
}

impl MailboxControlBlock {
    /// A mailbox holding no message.
    pub fn vacant() -> Self {
        Self::default()
    }

    pub fn is_vacant(&self) -> bool {
        self.rendezvous_id.is_nil()
    }

    pub fn encode(&self) -> [u8; CONTROL_BLOCK_SIZE] {
        let mut out = [0u8; CONTROL_BLOCK_SIZE];
        let mut buf = &mut out[..];
        buf.put_i32_le(self.process_id);
        buf.put_i32_le(self.argument_count);
        buf.put_u8(u8::from(self.uses_secondary_region));
        buf.put_slice(self.rendezvous_id.as_bytes());
        buf.put_i64_le(self.data_length);
        out
    }

    /// Parse and sanity-check a block read from the mailbox region.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CONTROL_BLOCK_SIZE {
            return Err(RelayError::malformed(format!(
                "control block is {} bytes, expected {}",
                bytes.len(),
                CONTROL_BLOCK_SIZE
            )));
        }
        let mut buf = &bytes[..CONTROL_BLOCK_SIZE];
        let process_id = buf.get_i32_le();
        let argument_count = buf.get_i32_le();
        let uses_secondary_region = match buf.get_u8() {
            0 => false,
            1 => true,
            other => {
                return Err(RelayError::malformed(format!(
                    "invalid secondary-region flag {}",
                    other
                )))
            }
        };
        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let data_length = buf.get_i64_le();

        let block = Self {
            process_id,
            argument_count,
            uses_secondary_region,
            rendezvous_id: Uuid::from_bytes(id),
            data_length,
        };
        block.validate()?;
        Ok(block)
    }

    fn validate(&self) -> Result<()> {
        if self.argument_count < 0 {
            return Err(RelayError::malformed(format!(
                "negative argument count {}",
                self.argument_count
            )));
        }
        if self.data_length < 0 {
            return Err(RelayError::malformed(format!(
                "negative data length {}",
                self.data_length
            )));
        }
        if (self.argument_count > 0) != self.uses_secondary_region {
            return Err(RelayError::malformed(format!(
                "{} arguments but secondary region flag is {}",
                self.argument_count, self.uses_secondary_region
            )));
        }
        Ok(())
    }
}

/// The rendezvous id of a raw block, even if the rest of it fails validation.
pub fn raw_rendezvous_id(bytes: &[u8]) -> Option<Uuid> {
    let id = Uuid::from_slice(bytes.get(RENDEZVOUS_OFFSET..RENDEZVOUS_OFFSET + 16)?).ok()?;
    (!id.is_nil()).then_some(id)
}

/// Serialize arguments into the secondary-region layout.
pub fn encode_arguments(args: &[String]) -> Result<Vec<u8>> {
    let to_i32 = |len: usize| {
        i32::try_from(len).map_err(|_| RelayError::PacketTooLarge {
            size: len,
            max: i32::MAX as usize,
        })
    };

    let max_len = args.iter().map(String::len).max().unwrap_or(0);
    let total = 4 + args.iter().map(|a| 4 + a.len()).sum::<usize>();

    let mut out = Vec::with_capacity(total);
    out.put_i32_le(to_i32(max_len)?);
    for arg in args {
        out.put_i32_le(to_i32(arg.len())?);
        out.put_slice(arg.as_bytes());
    }
    Ok(out)
}

/// Parse `count` arguments from a secondary region's contents.
///
/// Every argument is staged through one scratch buffer sized by the block's
/// declared maximum length; an argument longer than that is malformed.
pub fn decode_arguments(data: &[u8], count: usize) -> Result<Vec<String>> {
    let mut buf = data;
    if buf.remaining() < 4 {
        return Err(RelayError::malformed("argument block is missing its header"));
    }
    let max_len = buf.get_i32_le();
    let max_len = usize::try_from(max_len)
        .map_err(|_| RelayError::malformed(format!("negative maximum length {}", max_len)))?;
    if max_len > buf.remaining() {
        return Err(RelayError::malformed(format!(
            "maximum argument length {} exceeds block size",
            max_len
        )));
    }
    // Each argument carries at least its 4-byte length
    if count > buf.remaining() / 4 {
        return Err(RelayError::malformed(format!(
            "{} arguments cannot fit in {} bytes",
            count,
            buf.remaining()
        )));
    }

    let mut scratch = vec![0u8; max_len];
    let mut args = Vec::with_capacity(count);
    for index in 0..count {
        if buf.remaining() < 4 {
            return Err(RelayError::malformed(format!(
                "argument {} length is truncated",
                index
            )));
        }
        let len = buf.get_i32_le();
        let len = usize::try_from(len)
            .ok()
            .filter(|len| *len <= max_len)
            .ok_or_else(|| {
                RelayError::malformed(format!("argument {} has invalid length {}", index, len))
            })?;
        if len > buf.remaining() {
            return Err(RelayError::malformed(format!("argument {} is truncated", index)));
        }
        buf.copy_to_slice(&mut scratch[..len]);
        let text = std::str::from_utf8(&scratch[..len]).map_err(|e| {
            RelayError::malformed(format!("argument {} is not UTF-8: {}", index, e))
        })?;
        args.push(text.to_string());
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_block_size() {
        assert_eq!(CONTROL_BLOCK_SIZE, 33);
        assert_eq!(MailboxControlBlock::vacant().encode(), [0u8; 33]);
    }

    #[test]
    fn test_control_block_layout() {
        let id = Uuid::new_v4();
        let block = MailboxControlBlock {
            process_id: 0x0102_0304,
            argument_count: 2,
            uses_secondary_region: true,
            rendezvous_id: id,
            data_length: 20,
        };
        let bytes = block.encode();
        assert_eq!(&bytes[0..4], &[4, 3, 2, 1]);
        assert_eq!(&bytes[4..8], &[2, 0, 0, 0]);
        assert_eq!(bytes[8], 1);
        assert_eq!(&bytes[9..25], id.as_bytes());
        assert_eq!(&bytes[25..33], &20i64.to_le_bytes());

        assert_eq!(MailboxControlBlock::decode(&bytes).unwrap(), block);
    }

    #[test]
    fn test_vacant_block() {
        let block = MailboxControlBlock::decode(&[0u8; CONTROL_BLOCK_SIZE]).unwrap();
        assert!(block.is_vacant());
    }

    #[test]
    fn test_control_block_rejects_inconsistent_fields() {
        let base = MailboxControlBlock {
            process_id: 1,
            argument_count: 1,
            uses_secondary_region: true,
            rendezvous_id: Uuid::new_v4(),
            data_length: 9,
        };

        let negative = MailboxControlBlock {
            argument_count: -3,
            ..base
        };
        let flag_mismatch = MailboxControlBlock {
            uses_secondary_region: false,
            ..base
        };
        for block in [negative, flag_mismatch] {
            assert!(MailboxControlBlock::decode(&block.encode()).is_err());
        }

        let mut bad_flag = base.encode();
        bad_flag[8] = 7;
        assert!(MailboxControlBlock::decode(&bad_flag).is_err());
        assert_eq!(raw_rendezvous_id(&bad_flag), Some(base.rendezvous_id));
        assert!(MailboxControlBlock::decode(&bad_flag[..10]).is_err());
    }

    #[test]
    fn test_argument_block_layout() {
        let args = vec!["ab".to_string(), "".to_string(), "xyz".to_string()];
        let data = encode_arguments(&args).unwrap();
        assert_eq!(&data[0..4], &3i32.to_le_bytes());
        assert_eq!(&data[4..8], &2i32.to_le_bytes());
        assert_eq!(&data[8..10], b"ab");
        assert_eq!(data.len(), 4 + (4 + 2) + 4 + (4 + 3));

        assert_eq!(decode_arguments(&data, args.len()).unwrap(), args);
    }

    #[test]
    fn test_ten_thousand_single_byte_arguments() {
        let args: Vec<String> = (0..10_000u32)
            .map(|i| char::from(b'a' + (i % 26) as u8).to_string())
            .collect();
        let data = encode_arguments(&args).unwrap();
        assert_eq!(data.len(), 4 + 10_000 * 5);
        assert_eq!(decode_arguments(&data, args.len()).unwrap(), args);
    }

    #[test]
    fn test_unicode_arguments() {
        let args = vec!["日本語".to_string(), "emoji 🚀".to_string(), "nul\0".to_string()];
        let data = encode_arguments(&args).unwrap();
        assert_eq!(decode_arguments(&data, 3).unwrap(), args);
    }

    #[test]
    fn test_decode_arguments_rejects_corruption() {
        let data = encode_arguments(&["hello".to_string()]).unwrap();

        // Count larger than what the block holds
        assert!(decode_arguments(&data, 2).is_err());
        // Truncated payload
        assert!(decode_arguments(&data[..data.len() - 1], 1).is_err());
        // Argument longer than the declared maximum
        let mut lying = data.clone();
        lying[0..4].copy_from_slice(&2i32.to_le_bytes());
        assert!(decode_arguments(&lying, 1).is_err());
        // Invalid UTF-8
        let mut invalid = data.clone();
        invalid[8] = 0xFF;
        assert!(decode_arguments(&invalid, 1).is_err());
        // Empty block
        assert!(decode_arguments(&[], 0).is_err());
    }
}
