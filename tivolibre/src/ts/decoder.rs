//! Transport Stream decoder: framing, table handling, resynchronization,
//! and output.

use std::io::{Read, Write};

use log::{debug, info, warn};

use super::packet::{PidClass, TsHeader, TsParseError, SYNC_BYTE, TS_FRAME_SIZE};
use super::pat::PatData;
use super::pmt;
use super::pmt::StreamType;
use super::private;
use super::stream::PidStream;
use crate::crypto::TuringPool;
use crate::error::{DecodeError, Result};
use crate::io::CountingReader;

/// Consecutive sync bytes at frame spacing required to declare resync.
const PACKETS_UNTIL_RESYNC: usize = 4;

/// Decryption resumes at the next multiple of this after a sync loss.
const DECRYPTION_PAUSED_INTERVAL: u64 = 0x10_0000;

/// 13-bit PID space, stored flat.
const PID_SPACE: usize = 0x2000;

pub struct TsDecoder<'a, R, W> {
    input: &'a mut CountingReader<R>,
    output: &'a mut W,
    pool: TuringPool,
    streams: Box<[Option<PidStream>]>,
    pat: Option<PatData>,
    compatibility_mode: bool,

    packet_count: u64,
    bytes_written: u64,
    decryption_paused: bool,
    resume_decryption_at: u64,
    next_interval_offset: u64,
    next_mask_offset: u64,

    /// Bytes recovered during resync, consumed before reading more input.
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<'a, R: Read, W: Write> TsDecoder<'a, R, W> {
    pub fn new(
        input: &'a mut CountingReader<R>,
        output: &'a mut W,
        pool: TuringPool,
        compatibility_mode: bool,
    ) -> Self {
        let mut streams: Vec<Option<PidStream>> = Vec::with_capacity(PID_SPACE);
        streams.resize_with(PID_SPACE, || None);
        // The PAT always has a stream slot.
        streams[0] = Some(PidStream::new(StreamType::None));

        Self {
            input,
            output,
            pool,
            streams: streams.into_boxed_slice(),
            pat: None,
            compatibility_mode,
            packet_count: 0,
            bytes_written: 0,
            decryption_paused: false,
            resume_decryption_at: 0,
            next_interval_offset: 0,
            next_mask_offset: 0,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    /// Consume the input to its end, writing decrypted 188-byte frames.
    pub fn process(&mut self) -> Result<()> {
        loop {
            let mut frame = [0u8; TS_FRAME_SIZE];
            let got = self.fill_frame(&mut frame)?;
            if got == 0 {
                info!("end of input reached after {} packets", self.packet_count);
                return Ok(());
            }
            if got < TS_FRAME_SIZE {
                warn!("trailing {got} bytes do not form a whole packet");
                return Ok(());
            }
            self.packet_count += 1;

            let header = match TsHeader::parse(&frame) {
                Ok(header) => header,
                Err(TsParseError::PrivateAdaptation) => {
                    return Err(DecodeError::PrivateAdaptation);
                }
                Err(TsParseError::SyncLost(byte)) => {
                    warn!(
                        "sync lost at packet {} (first byte 0x{byte:02x})",
                        self.packet_count
                    );
                    match self.resync(&frame)? {
                        Some((resynced, header)) => {
                            frame = resynced;
                            info!(
                                "re-synched at packet {} (byte 0x{:x})",
                                self.packet_count, self.bytes_written
                            );
                            header
                        }
                        None => {
                            info!("end of input reached during resync");
                            return Ok(());
                        }
                    }
                }
            };

            match PidClass::of(header.pid) {
                PidClass::Pat => self.process_pat(&frame, &header)?,
                PidClass::Elementary => {
                    if self.pat.as_ref().map(|p| p.program_map_pid) == Some(header.pid) {
                        self.process_pmt(&frame, &header)?;
                    } else if self.stream_type(header.pid) == Some(StreamType::PrivateData) {
                        self.process_tivo(&frame, &header)?;
                    }
                }
                PidClass::Null => {
                    debug!("NULL packet");
                    if !self.compatibility_mode {
                        self.bytes_written += TS_FRAME_SIZE as u64;
                        continue;
                    }
                }
                PidClass::Reserved => {
                    return Err(DecodeError::UnsupportedPid(header.pid));
                }
            }

            self.decrypt_and_write(&mut frame, &header)?;
        }
    }

    fn stream_type(&self, pid: u16) -> Option<StreamType> {
        self.streams[pid as usize].as_ref().map(|s| s.stream_type())
    }

    fn process_pat(&mut self, frame: &[u8; TS_FRAME_SIZE], header: &TsHeader) -> Result<()> {
        let pat = PatData::parse(&frame[header.length..], header.payload_unit_start)?;
        for &pid in &pat.pmt_pids {
            let slot = &mut self.streams[pid as usize];
            if slot.is_none() {
                info!("creating a new stream for PMT PID 0x{pid:04x}");
                *slot = Some(PidStream::new(StreamType::None));
            }
        }
        self.pat = Some(pat);
        Ok(())
    }

    fn process_pmt(&mut self, frame: &[u8; TS_FRAME_SIZE], header: &TsHeader) -> Result<()> {
        for declared in pmt::parse(&frame[header.length..], header.payload_unit_start)? {
            let slot = &mut self.streams[declared.pid as usize];
            if slot.is_none() {
                debug!(
                    "creating a new {:?} stream for PID 0x{:04x} (type=0x{:02x})",
                    declared.stream_type, declared.pid, declared.stream_type_id
                );
                *slot = Some(PidStream::new(declared.stream_type));
            }
        }
        Ok(())
    }

    fn process_tivo(&mut self, frame: &[u8; TS_FRAME_SIZE], header: &TsHeader) -> Result<()> {
        for update in private::parse(&frame[header.length..])? {
            let stream = self
                .streams
                .get_mut(update.pid as usize)
                .and_then(|slot| slot.as_mut())
                .ok_or_else(|| DecodeError::MalformedTable {
                    table: "TiVo private data",
                    reason: format!("no stream with PID 0x{:04x}", update.pid),
                })?;
            stream.set_stream_id(update.stream_id);
            stream.install_key(update.key);
        }
        Ok(())
    }

    fn decrypt_and_write(
        &mut self,
        frame: &mut [u8; TS_FRAME_SIZE],
        header: &TsHeader,
    ) -> Result<()> {
        let pool = &mut self.pool;
        let stream = self.streams[header.pid as usize].get_or_insert_with(|| {
            warn!(
                "no stream exists with PID 0x{:04x}, creating one",
                header.pid
            );
            PidStream::new(StreamType::NotInPmt)
        });
        stream.process_frame(frame, header, pool, header.pid)?;

        if self.decryption_paused && self.compatibility_mode {
            self.mask_bytes(frame);
        }
        self.write_frame(frame)?;

        if self.resume_decryption_at > 0 && self.resume_decryption_at <= self.bytes_written {
            warn!(
                "resuming decryption at 0x{:x}, bytes written = 0x{:x}",
                self.resume_decryption_at, self.bytes_written
            );
            self.resume_decryption();
        }
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8; TS_FRAME_SIZE]) -> Result<()> {
        if !self.decryption_paused || self.compatibility_mode {
            self.output.write_all(frame)?;
        }
        self.bytes_written += TS_FRAME_SIZE as u64;
        Ok(())
    }

    /// Pull a frame from resync leftovers first, then from the input.
    fn fill_frame(&mut self, frame: &mut [u8; TS_FRAME_SIZE]) -> Result<usize> {
        let buffered = self.pending.len() - self.pending_pos;
        if buffered > 0 {
            let from_pending = buffered.min(TS_FRAME_SIZE);
            frame[..from_pending]
                .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + from_pending]);
            self.pending_pos += from_pending;
            if self.pending_pos == self.pending.len() {
                self.pending.clear();
                self.pending_pos = 0;
            }
            if from_pending < TS_FRAME_SIZE {
                let rest = self.input.read_fully(&mut frame[from_pending..])?;
                return Ok(from_pending + rest);
            }
            return Ok(TS_FRAME_SIZE);
        }
        Ok(self.input.read_fully(frame)?)
    }

    /// Search forward for a position with [`PACKETS_UNTIL_RESYNC`] sync
    /// bytes at frame spacing. Returns the re-aligned frame, or None when
    /// the input ends first.
    fn resync(
        &mut self,
        bad_frame: &[u8; TS_FRAME_SIZE],
    ) -> Result<Option<([u8; TS_FRAME_SIZE], TsHeader)>> {
        let mut buf = bad_frame.to_vec();
        // Leftovers from an earlier resync are part of the search space.
        buf.extend_from_slice(&self.pending[self.pending_pos..]);
        self.pending.clear();
        self.pending_pos = 0;

        let mut pos = 1;
        loop {
            let needed = pos + PACKETS_UNTIL_RESYNC * TS_FRAME_SIZE + 1;
            if buf.len() < needed {
                let start = buf.len();
                buf.resize(needed, 0);
                let got = self.input.read_fully(&mut buf[start..])?;
                buf.truncate(start + got);
                if buf.len() < needed {
                    return Ok(None);
                }
            }

            if buf[pos] == SYNC_BYTE
                && (1..=PACKETS_UNTIL_RESYNC).all(|k| buf[pos + k * TS_FRAME_SIZE] == SYNC_BYTE)
            {
                let mut frame = [0u8; TS_FRAME_SIZE];
                frame.copy_from_slice(&buf[pos..pos + TS_FRAME_SIZE]);
                match TsHeader::parse(&frame) {
                    Ok(header) => {
                        let (skipped, rest) = buf.split_at_mut(pos);
                        self.handle_unsynchronized(skipped)?;
                        self.pause_decryption();
                        self.pending = rest[TS_FRAME_SIZE..].to_vec();
                        self.pending_pos = 0;
                        return Ok(Some((frame, header)));
                    }
                    Err(TsParseError::PrivateAdaptation) => {
                        return Err(DecodeError::PrivateAdaptation);
                    }
                    Err(TsParseError::SyncLost(_)) => {
                        warn!("problem with the packet at the candidate sync position, moving on");
                    }
                }
            }
            pos += 1;
        }
    }

    /// Deal with the bytes skipped during resync: decide the resume point,
    /// apply the reference filter's masking, and (in compatibility mode)
    /// copy them to the output.
    fn handle_unsynchronized(&mut self, skipped: &mut [u8]) -> Result<()> {
        let length = skipped.len() as u64;
        let delta_to_next_interval =
            DECRYPTION_PAUSED_INTERVAL - (self.bytes_written % DECRYPTION_PAUSED_INTERVAL);

        // Decryption resumes at the next whole interval past the skip.
        let past_skip = self.bytes_written + length;
        self.resume_decryption_at =
            past_skip.div_ceil(DECRYPTION_PAUSED_INTERVAL) * DECRYPTION_PAUSED_INTERVAL;
        debug!("resume decryption at 0x{:x}", self.resume_decryption_at);

        let mask_third_byte = self.next_interval_offset == 0;
        self.next_interval_offset = self.bytes_written + delta_to_next_interval;

        if mask_third_byte && skipped.len() > 3 {
            // The reference filter masks this byte; its purpose is unknown.
            skipped[3] &= 0x3F;
        }
        while self.next_interval_offset <= self.bytes_written + length {
            let at = (self.next_interval_offset - self.bytes_written) as usize + 3;
            if at < skipped.len() {
                skipped[at] &= 0x3F;
            }
            self.next_interval_offset += DECRYPTION_PAUSED_INTERVAL;
        }

        if self.compatibility_mode {
            debug!(
                "writing {} unsynchronized bytes at 0x{:x}",
                length, self.bytes_written
            );
            self.output.write_all(skipped)?;
        }
        // Count the skipped bytes either way; the resume point depends on it.
        self.bytes_written += length;
        Ok(())
    }

    fn pause_decryption(&mut self) {
        self.decryption_paused = true;
        for stream in self.streams.iter_mut().flatten() {
            stream.pause();
        }
    }

    fn resume_decryption(&mut self) {
        self.decryption_paused = false;
        self.resume_decryption_at = 0;
        self.next_interval_offset = 0;
        self.next_mask_offset = 0;
        for stream in self.streams.iter_mut().flatten() {
            stream.resume();
        }
    }

    /// Reference-filter quirk: while decryption is paused, the byte at each
    /// interval boundary has its top bits masked, and a boundary that looks
    /// like a TS header chains one extra mask a frame later. The exact rules
    /// are a best guess against the filter's output.
    fn mask_bytes(&mut self, frame: &mut [u8; TS_FRAME_SIZE]) {
        let frame_len = TS_FRAME_SIZE as u64;
        if self.next_interval_offset > 0
            && self.next_interval_offset >= self.bytes_written
            && self.bytes_written + frame_len > self.next_interval_offset + 3
        {
            let offset = (self.next_interval_offset - self.bytes_written) as usize;
            let looks_like_header =
                frame[offset] == SYNC_BYTE && frame[offset + 1] & 0x20 == 0;
            if looks_like_header {
                debug!(
                    "valid TS header at interval boundary 0x{:x}, checking next frame",
                    self.next_interval_offset
                );
                self.next_mask_offset = self.next_interval_offset + frame_len;
            }
            self.next_interval_offset += DECRYPTION_PAUSED_INTERVAL;
            frame[offset + 3] &= 0x3F;
        }

        if self.next_mask_offset > 0
            && self.next_mask_offset >= self.bytes_written
            && self.bytes_written + frame_len > self.next_mask_offset + 3
        {
            let offset = (self.next_mask_offset - self.bytes_written) as usize;
            debug!("masking byte at 0x{:x}", self.next_mask_offset);
            frame[offset + 3] &= 0x3F;
            if frame[offset] == SYNC_BYTE {
                self.next_mask_offset += frame_len;
            } else {
                self.next_mask_offset = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn null_packet(counter: u8) -> Vec<u8> {
        let mut packet = vec![0u8; TS_FRAME_SIZE];
        packet[0] = 0x47;
        packet[1] = 0x1F;
        packet[2] = 0xFF;
        packet[3] = 0x10 | (counter & 0x0F);
        packet
    }

    fn passthrough_packet(pid: u16, counter: u8) -> Vec<u8> {
        let mut packet = vec![0u8; TS_FRAME_SIZE];
        packet[0] = 0x47;
        packet[1] = (pid >> 8) as u8;
        packet[2] = pid as u8;
        packet[3] = 0x10 | (counter & 0x0F);
        for (i, byte) in packet[4..].iter_mut().enumerate() {
            *byte = (i as u8) ^ 0x5A;
        }
        packet
    }

    fn run(input: &[u8], compat: bool) -> (Vec<u8>, Result<()>) {
        let mut reader = CountingReader::new(input);
        let mut output = Vec::new();
        let pool = TuringPool::new([0x61; 20]);
        let result = TsDecoder::new(&mut reader, &mut output, pool, compat).process();
        (output, result)
    }

    #[test]
    fn null_packets_are_dropped_without_compat() {
        let mut input = Vec::new();
        for i in 0..10 {
            input.extend(null_packet(i));
        }
        let (output, result) = run(&input, false);
        result.unwrap();
        assert!(output.is_empty());
    }

    #[test]
    fn null_packets_pass_through_in_compat_mode() {
        let mut input = Vec::new();
        for i in 0..10 {
            input.extend(null_packet(i));
        }
        let (output, result) = run(&input, true);
        result.unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn unknown_pid_passes_through_with_a_placeholder_stream() {
        let packet = passthrough_packet(0x0100, 0);
        let (output, result) = run(&packet, false);
        result.unwrap();
        assert_eq!(output, packet);
    }

    #[test]
    fn reserved_pid_is_fatal() {
        let packet = passthrough_packet(0x0011, 0);
        let (_, result) = run(&packet, false);
        assert!(matches!(result, Err(DecodeError::UnsupportedPid(0x0011))));
    }

    #[test]
    fn resync_skips_garbage_and_realigns() {
        let mut input = Vec::new();
        for i in 0..3 {
            input.extend(passthrough_packet(0x0100, i));
        }
        let mut garbage = vec![0x00u8; 100];
        garbage[3] = 0xFF; // shows the unexplained third-byte mask
        input.extend_from_slice(&garbage);
        let after: Vec<Vec<u8>> = (0..6).map(|i| passthrough_packet(0x0100, i)).collect();
        for packet in &after {
            input.extend(packet);
        }

        // Compatibility mode keeps every byte, with the mask applied.
        let (output, result) = run(&input, true);
        result.unwrap();
        assert_eq!(output.len(), input.len());
        assert_eq!(&output[..3 * TS_FRAME_SIZE], &input[..3 * TS_FRAME_SIZE]);
        let out_garbage = &output[3 * TS_FRAME_SIZE..3 * TS_FRAME_SIZE + 100];
        assert_eq!(out_garbage[3], 0x3F);
        assert_eq!(&out_garbage[4..], &garbage[4..]);
        for (i, packet) in after.iter().enumerate() {
            let start = 3 * TS_FRAME_SIZE + 100 + i * TS_FRAME_SIZE;
            assert_eq!(&output[start..start + TS_FRAME_SIZE], &packet[..]);
        }

        // Without compatibility mode the garbage and everything until the
        // resume point are suppressed.
        let (output, result) = run(&input, false);
        result.unwrap();
        assert_eq!(output, &input[..3 * TS_FRAME_SIZE]);
    }

    #[test]
    fn resync_at_end_of_input_ends_cleanly() {
        let mut input = Vec::new();
        input.extend(passthrough_packet(0x0100, 0));
        input.extend(vec![0x00u8; 300]);
        let (output, result) = run(&input, false);
        result.unwrap();
        assert_eq!(output, &input[..TS_FRAME_SIZE]);
    }

    #[test]
    fn pat_and_pmt_populate_the_stream_map() {
        let mut pat_packet = vec![0u8; TS_FRAME_SIZE];
        pat_packet[..4].copy_from_slice(&[0x47, 0x40, 0x00, 0x10]);
        let pat_payload: &[u8] = &[
            0x00, // pointer
            0x00, 0xB0, 0x0D, // table, syntax + length
            0x00, 0x01, 0xC1, 0x00, 0x00, // ids and versions
            0x00, 0x01, 0xE0, 0x30, // program 1 -> PMT PID 0x30
            0x00, 0x00, 0x00, 0x00, // CRC
        ];
        pat_packet[4..4 + pat_payload.len()].copy_from_slice(pat_payload);

        let mut pmt_packet = vec![0u8; TS_FRAME_SIZE];
        pmt_packet[..4].copy_from_slice(&[0x47, 0x40, 0x30, 0x10]);
        let pmt_payload: &[u8] = &[
            0x00, // pointer
            0x02, 0xB0, 0x17, // table, syntax + length
            0x00, 0x01, 0xC1, 0x00, 0x00, // program, version, sections
            0xE0, 0x31, 0xF0, 0x00, // PCR PID, program info length
            0x02, 0xE0, 0x31, 0xF0, 0x00, // MPEG-2 video on PID 0x31
            0x97, 0xE0, 0x32, 0xF0, 0x00, // TiVo private data on PID 0x32
            0x00, 0x00, 0x00, 0x00, // CRC
        ];
        pmt_packet[4..4 + pmt_payload.len()].copy_from_slice(pmt_payload);

        let video_packet = passthrough_packet(0x0031, 0);

        let mut input = Vec::new();
        input.extend_from_slice(&pat_packet);
        input.extend_from_slice(&pmt_packet);
        input.extend_from_slice(&video_packet);

        let mut reader = CountingReader::new(&input[..]);
        let mut output = Vec::new();
        let pool = TuringPool::new([0x61; 20]);
        let mut decoder = TsDecoder::new(&mut reader, &mut output, pool, false);
        decoder.process().unwrap();

        assert_eq!(decoder.pat.as_ref().unwrap().program_map_pid, 0x0030);
        assert_eq!(decoder.stream_type(0x0031), Some(StreamType::Video));
        assert_eq!(decoder.stream_type(0x0032), Some(StreamType::PrivateData));
        assert_eq!(decoder.stream_type(0x0033), None);

        // All three packets pass through unmodified.
        assert_eq!(output.len(), 3 * TS_FRAME_SIZE);
        assert_eq!(&output[2 * TS_FRAME_SIZE..], &video_packet[..]);
    }
}
