//! Per-PID stream state: PES header tracking and payload decryption.

use log::{debug, warn};

use super::packet::{TsHeader, TS_FRAME_SIZE};
use super::pmt::StreamType;
use crate::crypto::{StreamKey, TuringPool};
use crate::error::{DecodeError, Result};
use crate::pes::{PesScanner, ScanResume};

/// State kept for every PID seen in the transport stream.
///
/// Decryption state machine: a stream starts active with no key, pauses on
/// sync loss, and returns to active when a fresh key arrives in a TiVo
/// private-data packet (or when the decoder-wide resume point is reached).
pub struct PidStream {
    stream_type: StreamType,
    stream_id: u8,
    key: Option<StreamKey>,
    paused: bool,
    /// Bytes of the next packet's payload that are still PES header.
    pes_carry: usize,
    /// The previous packet ended mid-header with no measurable overshoot;
    /// scanning continues at the next packet's first payload byte.
    pes_open: bool,
    resume: ScanResume,
}

impl PidStream {
    pub fn new(stream_type: StreamType) -> Self {
        Self {
            stream_type,
            stream_id: 0,
            key: None,
            paused: false,
            pes_carry: 0,
            pes_open: false,
            resume: ScanResume::None,
        }
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn set_stream_id(&mut self, id: u8) {
        self.stream_id = id;
    }

    /// Install fresh key material. A paused stream resumes: the new key
    /// re-aligns its cipher state.
    pub fn install_key(&mut self, key: [u8; 16]) {
        self.key = Some(StreamKey(key));
        if self.paused {
            debug!("fresh key resumes decryption for stream 0x{:02x}", self.stream_id);
            self.paused = false;
        }
    }

    /// Stop decrypting until a fresh key arrives or the decoder resumes
    /// globally.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Work out where this packet's PES header material ends, decrypt the
    /// payload past it when scrambled, and clear the scramble bits.
    pub fn process_frame(
        &mut self,
        frame: &mut [u8; TS_FRAME_SIZE],
        header: &TsHeader,
        pool: &mut TuringPool,
        pid: u16,
    ) -> Result<()> {
        let payload_len = TS_FRAME_SIZE - header.length;

        // A header carried over from earlier packets may span this one
        // entirely.
        if self.pes_carry > payload_len {
            self.pes_carry -= payload_len;
            return Ok(());
        }

        let mut pes_offset = 0usize;
        if header.payload_unit_start || self.pes_carry > 0 || self.pes_open {
            let scan = {
                let payload = &frame[header.length + self.pes_carry..];
                PesScanner::new(payload, std::mem::take(&mut self.resume)).scan()
            };
            if scan.scrambled {
                self.pes_carry = 0;
                self.pes_open = false;
            } else {
                let total = self.pes_carry + scan.header_bytes;
                if total <= payload_len {
                    pes_offset = total;
                    self.pes_carry = 0;
                    self.pes_open = scan.exhausted;
                    self.resume = scan.resume;
                } else {
                    pes_offset = payload_len;
                    self.pes_carry = total - payload_len;
                    self.pes_open = false;
                }
            }
        }

        if header.scrambling_control == 0 || self.paused {
            return Ok(());
        }
        let Some(key) = self.key else {
            warn!("scrambled packet on PID 0x{pid:04x} before any key; passing through");
            return Ok(());
        };
        if payload_len <= pes_offset {
            return Ok(());
        }
        if !key.is_complete() {
            return Err(DecodeError::StreamKeyCheck(pid));
        }

        let stream = pool.prepare_frame(self.stream_id, key.block_number());
        TsHeader::clear_scramble(frame);
        stream.decrypt(&mut frame[header.length + pes_offset..]);
        Ok(())
    }
}
