//! PAT (Program Association Table) parsing.
//!
//! The PAT is transmitted on PID 0x0000 and names the PID carrying each
//! program's PMT. TiVo recordings carry a single program; the last entry
//! wins.

use bytes::Buf;

use crate::error::{DecodeError, Result};

/// Parsed PAT state, kept only to detect updates and route PMT packets.
#[derive(Debug, Clone, Default)]
pub struct PatData {
    pub version_number: u8,
    pub section_number: u8,
    pub last_section_number: u8,
    /// PID of the program map table, from the final program entry.
    pub program_map_pid: u16,
    /// Every PMT PID named by this PAT, in order of appearance.
    pub pmt_pids: Vec<u16>,
}

impl PatData {
    /// Parse a PAT from a packet payload.
    pub fn parse(payload: &[u8], payload_unit_start: bool) -> Result<Self> {
        let mut buf = payload;
        if payload_unit_start {
            // Pointer field
            take(&mut buf, 1)?;
        }

        let table_id = get_u8(&mut buf)?;
        if table_id != 0x00 {
            return Err(malformed(format!(
                "table ID must be 0x00, found 0x{table_id:02x}"
            )));
        }

        let pat_field = get_u16(&mut buf)?;
        if pat_field & 0xC000 != 0x8000 {
            return Err(malformed(format!(
                "failed to validate misc field: 0x{pat_field:04x}"
            )));
        }
        if pat_field & 0x0C00 != 0x0000 {
            return Err(malformed("reserved bits of section length set".into()));
        }
        let mut section_length = (pat_field & 0x0FFF) as i32;

        // Transport stream ID
        get_u16(&mut buf)?;
        section_length -= 2;

        let mut pat = PatData {
            version_number: get_u8(&mut buf)? & 0x3E,
            ..Default::default()
        };
        pat.section_number = get_u8(&mut buf)?;
        pat.last_section_number = get_u8(&mut buf)?;
        section_length -= 3;

        // CRC at the end of the section
        section_length -= 4;

        while section_length > 0 {
            // Program number
            get_u16(&mut buf)?;
            section_length -= 2;

            let entry = get_u16(&mut buf)?;
            section_length -= 2;
            pat.program_map_pid = entry & 0x1FFF;
            pat.pmt_pids.push(pat.program_map_pid);
        }
        if section_length < 0 {
            return Err(malformed("section length ran out mid-entry".into()));
        }

        Ok(pat)
    }
}

fn malformed(reason: String) -> DecodeError {
    DecodeError::MalformedTable {
        table: "PAT",
        reason,
    }
}

pub(super) fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if buf.len() < n {
        return Err(DecodeError::MalformedTable {
            table: "PSI section",
            reason: "truncated".into(),
        });
    }
    let (head, rest) = buf.split_at(n);
    *buf = rest;
    Ok(head)
}

pub(super) fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    Ok(take(buf, 1)?[0])
}

pub(super) fn get_u16(buf: &mut &[u8]) -> Result<u16> {
    let mut bytes = take(buf, 2)?;
    Ok(bytes.get_u16())
}

pub(super) fn get_u32(buf: &mut &[u8]) -> Result<u32> {
    let mut bytes = take(buf, 4)?;
    Ok(bytes.get_u32())
}
