//! TiVo private-data packets: the in-band key distribution channel.
//!
//! The stream the PMT declares with type 0x97 periodically carries a table
//! of (PID, stream id, 16-byte Turing key) entries. Every entry refreshes
//! the named PID's cipher state.

use super::pat::{get_u8, get_u16, get_u32, take};
use crate::error::{DecodeError, Result};

/// Tag opening every TiVo private-data payload ("TiVo").
const FILE_TYPE: u32 = 0x5469_566F;

/// Fixed validator word following the tag.
const VALIDATOR: u16 = 0x8103;

/// Bytes per key entry: PID, stream id, reserved, 16 key bytes.
const ENTRY_SIZE: i32 = 20;

/// One key refresh for a single PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyUpdate {
    pub pid: u16,
    pub stream_id: u8,
    pub key: [u8; 16],
}

/// Parse a TiVo private-data packet payload into its key updates.
pub fn parse(payload: &[u8]) -> Result<Vec<KeyUpdate>> {
    let mut buf = payload;

    let file_type = get_u32(&mut buf)?;
    if file_type != FILE_TYPE {
        return Err(malformed(format!("bad file type 0x{file_type:08x}")));
    }
    let validator = get_u16(&mut buf)?;
    if validator != VALIDATOR {
        return Err(malformed(format!("bad validator 0x{validator:04x}")));
    }
    take(&mut buf, 3)?;

    let mut stream_length = get_u8(&mut buf)? as i32;
    let mut updates = Vec::new();
    while stream_length > 0 {
        let pid = get_u16(&mut buf)?;
        let stream_id = get_u8(&mut buf)?;
        take(&mut buf, 1)?;
        let mut key = [0u8; 16];
        key.copy_from_slice(take(&mut buf, 16)?);
        stream_length -= ENTRY_SIZE;

        updates.push(KeyUpdate {
            pid,
            stream_id,
            key,
        });
    }

    Ok(updates)
}

fn malformed(reason: String) -> DecodeError {
    DecodeError::MalformedTable {
        table: "TiVo private data",
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(entries: &[(u16, u8, [u8; 16])]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&FILE_TYPE.to_be_bytes());
        out.extend_from_slice(&VALIDATOR.to_be_bytes());
        out.extend_from_slice(&[0, 0, 0]);
        out.push((entries.len() * 20) as u8);
        for (pid, stream_id, key) in entries {
            out.extend_from_slice(&pid.to_be_bytes());
            out.push(*stream_id);
            out.push(0);
            out.extend_from_slice(key);
        }
        out
    }

    #[test]
    fn parses_key_entries() {
        let key_a = [0xAA; 16];
        let key_b = [0xBB; 16];
        let updates = parse(&payload(&[(0x31, 0xE0, key_a), (0x34, 0xC0, key_b)])).unwrap();
        assert_eq!(
            updates,
            vec![
                KeyUpdate {
                    pid: 0x31,
                    stream_id: 0xE0,
                    key: key_a
                },
                KeyUpdate {
                    pid: 0x34,
                    stream_id: 0xC0,
                    key: key_b
                },
            ]
        );
    }

    #[test]
    fn rejects_bad_file_type() {
        let mut raw = payload(&[]);
        raw[0] = 0x00;
        assert!(matches!(
            parse(&raw),
            Err(DecodeError::MalformedTable { .. })
        ));
    }

    #[test]
    fn rejects_bad_validator() {
        let mut raw = payload(&[]);
        raw[5] = 0x00;
        assert!(parse(&raw).is_err());
    }

    #[test]
    fn rejects_truncated_entries() {
        let mut raw = payload(&[(0x31, 0xE0, [0x11; 16])]);
        raw.truncate(raw.len() - 4);
        assert!(parse(&raw).is_err());
    }
}
