//! PMT (Program Map Table) parsing.
//!
//! The PMT declares the program's elementary streams. The decoder cares
//! about the broad class of each stream: audio/video payloads that may be
//! encrypted, and the TiVo private-data stream that carries Turing keys.

use log::trace;

use super::pat::{get_u8, get_u16, take};
use crate::error::{DecodeError, Result};

/// Broad class of an elementary stream, from the PMT's stream_type field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Audio,
    Video,
    /// TiVo's key-carrying private-data stream (type 0x97).
    PrivateData,
    Other,
    None,
    /// Placeholder for PIDs that packets arrived on without a PMT entry.
    NotInPmt,
}

impl StreamType {
    pub fn from_id(id: u8) -> Self {
        match id {
            0x01 | 0x02 | 0x10 | 0x1b | 0x80 | 0xea => StreamType::Video,
            0x03 | 0x04 | 0x0f | 0x11 | 0x81 | 0x8a => StreamType::Audio,
            0x05..=0x0e | 0x12..=0x1a | 0x7f => StreamType::Other,
            0x00 => StreamType::None,
            _ => StreamType::PrivateData,
        }
    }
}

/// One elementary-stream declaration from the PMT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmtStream {
    pub pid: u16,
    pub stream_type_id: u8,
    pub stream_type: StreamType,
}

/// Parse a PMT packet payload into its stream declarations.
pub fn parse(payload: &[u8], payload_unit_start: bool) -> Result<Vec<PmtStream>> {
    let mut buf = payload;
    if payload_unit_start {
        // Pointer field
        take(&mut buf, 1)?;
    }

    let table_id = get_u8(&mut buf)?;
    if table_id != 0x02 {
        return Err(malformed(format!(
            "table ID must be 0x02, found 0x{table_id:02x}"
        )));
    }

    let pmt_field = get_u16(&mut buf)?;
    if pmt_field & 0x8000 == 0 {
        return Err(malformed("unknown section syntax".into()));
    }
    let mut section_length = (pmt_field & 0x0FFF) as i32;

    // Program number
    let program_number = get_u16(&mut buf)?;
    section_length -= 2;
    let version_field = get_u8(&mut buf)?;
    let version = version_field & 0x3E;
    let current_next = version_field & 0x01 != 0;
    section_length -= 1;
    let section_number = get_u8(&mut buf)?;
    let last_section_number = get_u8(&mut buf)?;
    section_length -= 2;
    let pcr_pid = get_u16(&mut buf)? & 0x1FFF;
    section_length -= 2;
    let program_info_length = (get_u16(&mut buf)? & 0x0FFF) as usize;
    section_length -= 2;

    trace!(
        "PMT: program 0x{program_number:04x} version 0x{version:02x} current={current_next} \
         section {section_number}/{last_section_number} PCR PID 0x{pcr_pid:04x}"
    );

    if program_info_length > 0 {
        trace!("skipping {program_info_length} bytes of program descriptors");
        take(&mut buf, program_info_length)?;
        section_length -= program_info_length as i32;
    }

    // CRC at the end of the section
    section_length -= 4;

    let mut streams = Vec::new();
    while section_length > 0 {
        let stream_type_id = get_u8(&mut buf)?;
        section_length -= 1;
        let pid = get_u16(&mut buf)? & 0x1FFF;
        section_length -= 2;
        let es_info_length = (get_u16(&mut buf)? & 0x0FFF) as usize;
        section_length -= 2;
        take(&mut buf, es_info_length)?;
        section_length -= es_info_length as i32;

        streams.push(PmtStream {
            pid,
            stream_type_id,
            stream_type: StreamType::from_id(stream_type_id),
        });
    }
    if section_length < 0 {
        return Err(malformed("section length ran out mid-entry".into()));
    }

    Ok(streams)
}

fn malformed(reason: String) -> DecodeError {
    DecodeError::MalformedTable {
        table: "PMT",
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pmt_payload() -> Vec<u8> {
        vec![
            0x00, // pointer
            0x02, // table_id
            0xB0, 0x17, // section syntax + length 23
            0x00, 0x01, // program number
            0xC1, // version
            0x00, 0x00, // section numbers
            0xE0, 0x31, // PCR PID
            0xF0, 0x00, // program info length 0
            // video, PID 0x0031
            0x02, 0xE0, 0x31, 0xF0, 0x00,
            // TiVo private data, PID 0x0032
            0x97, 0xE0, 0x32, 0xF0, 0x00,
            0xDE, 0xAD, 0xBE, 0xEF, // CRC (unchecked)
        ]
    }

    #[test]
    fn declares_each_stream() {
        let streams = parse(&pmt_payload(), true).unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].pid, 0x0031);
        assert_eq!(streams[0].stream_type, StreamType::Video);
        assert_eq!(streams[1].pid, 0x0032);
        assert_eq!(streams[1].stream_type, StreamType::PrivateData);
    }

    #[test]
    fn rejects_wrong_table_id() {
        let mut payload = pmt_payload();
        payload[1] = 0x00;
        assert!(matches!(
            parse(&payload, true),
            Err(DecodeError::MalformedTable { table: "PMT", .. })
        ));
    }

    #[test]
    fn rejects_short_syntax() {
        let mut payload = pmt_payload();
        payload[2] = 0x30;
        assert!(parse(&payload, true).is_err());
    }

    #[test]
    fn stream_type_mapping() {
        assert_eq!(StreamType::from_id(0x02), StreamType::Video);
        assert_eq!(StreamType::from_id(0x1b), StreamType::Video);
        assert_eq!(StreamType::from_id(0x04), StreamType::Audio);
        assert_eq!(StreamType::from_id(0x81), StreamType::Audio);
        assert_eq!(StreamType::from_id(0x06), StreamType::Other);
        assert_eq!(StreamType::from_id(0x97), StreamType::PrivateData);
        assert_eq!(StreamType::from_id(0x00), StreamType::None);
        // Unlisted ids are treated as potential key carriers.
        assert_eq!(StreamType::from_id(0x42), StreamType::PrivateData);
    }
}
