//! Program Stream decoder.
//!
//! Scans the input byte by byte for 0x000001 start codes, reconstructs PES
//! packets, and decrypts the ones whose scramble-control field carries the
//! private value 3. The per-packet Turing key rides inside the PES private
//! data field and is re-derived for every scrambled packet.

use std::io::{Read, Write};

use log::{info, warn};

use crate::crypto::{StreamKey, TuringPool};
use crate::error::{DecodeError, Result};
use crate::io::CountingReader;

/// PES packets top out at a 16-bit length plus slack for the length field
/// and cipher block remainder.
const PACKET_BUFFER_SIZE: usize = 65536 + 8 + 2;

/// Header scratch: 5 fixed bytes plus at most a 27-byte extension.
const HEADER_BUFFER_SIZE: usize = 32;

const MAX_PES_HEADER_LENGTH: u8 = 27;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketType {
    /// Pack headers, system headers, and video structures below 0xBB: the
    /// code byte passes through and scanning continues.
    Special,
    /// PES packets with no header extension.
    PesSimple,
    /// PES packets that may carry a header extension with private data.
    PesComplex,
}

impl PacketType {
    fn of(code: u8) -> Self {
        match code {
            0x00..=0xba => PacketType::Special,
            0xbb | 0xbc | 0xbe | 0xbf | 0xf0..=0xf2 | 0xf8 | 0xfa..=0xff => PacketType::PesSimple,
            0xbd | 0xc0..=0xef | 0xf3..=0xf7 | 0xf9 => PacketType::PesComplex,
        }
    }
}

enum Frame {
    /// The start code opened a PES packet that has been written out whole.
    Consumed,
    /// A special code: the caller emits the code byte and keeps scanning.
    Special,
}

pub struct PsDecoder<'a, R, W> {
    input: &'a mut CountingReader<R>,
    output: &'a mut W,
    pool: TuringPool,
    /// (stream id, block number) of the most recent private-data key, used
    /// to fetch the prepared cipher stream at decryption time.
    active: Option<(u8, u32)>,
}

impl<'a, R: Read, W: Write> PsDecoder<'a, R, W> {
    pub fn new(input: &'a mut CountingReader<R>, output: &'a mut W, pool: TuringPool) -> Self {
        Self {
            input,
            output,
            pool,
            active: None,
        }
    }

    /// Consume the input to its end, writing the decrypted program stream.
    pub fn process(&mut self) -> Result<()> {
        let mut marker: u32 = 0xFFFF_FFFF;
        let mut code: u8 = 0;
        let mut first = true;

        loop {
            if marker & 0xFFFF_FF00 == 0x100 {
                match self.process_frame(code) {
                    Ok(Frame::Consumed) => marker = 0xFFFF_FFFF,
                    Ok(Frame::Special) => self.output.write_all(&[code])?,
                    Err(DecodeError::Io(e))
                        if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                    {
                        info!("end of input reached");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            } else if !first {
                self.output.write_all(&[code])?;
            }

            marker <<= 8;
            code = match self.input.read_u8() {
                Ok(byte) => byte,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    info!("end of input reached");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            marker |= code as u32;
            first = false;
        }
    }

    fn process_frame(&mut self, code: u8) -> Result<Frame> {
        let packet_type = PacketType::of(code);
        let mut header = [0u8; HEADER_BUFFER_SIZE];
        let mut header_len = 0usize;
        let mut scramble = 0u8;

        match packet_type {
            PacketType::Special => return Ok(Frame::Special),
            PacketType::PesComplex => {
                self.input.read_exact(&mut header[..5])?;
                header_len = 5;
                if header[2] >> 6 != 0b10 {
                    warn!(
                        "PES (0x{code:02X}) header mark != 0b10: 0x{:x} (is this an MPEG2-PS file?)",
                        header[2] >> 6
                    );
                }
                scramble = (header[2] >> 4) & 0x3;
                let pes_header_length = header[4];
                match scramble {
                    0 => {}
                    3 => {
                        header_len =
                            self.process_scrambled_packet(code, &mut header, pes_header_length)?;
                    }
                    _ => {
                        warn!("PES scramble control {scramble} treated as clear");
                        scramble = 0;
                    }
                }
            }
            PacketType::PesSimple => {
                self.input.read_exact(&mut header[..2])?;
                header_len = 2;
            }
        }

        let length = u16::from_be_bytes([header[0], header[1]]) as usize;
        let mut packet = vec![0u8; PACKET_BUFFER_SIZE];
        packet[..header_len].copy_from_slice(&header[..header_len]);
        let wanted = (length + 2).saturating_sub(header_len);
        let read = self.read_fully(&mut packet[header_len..header_len + wanted])?;
        let available = header_len + read;

        if scramble == 3 {
            let pes_header_length = header[4] as usize;
            let (offset, size) = if pes_header_length > 0 {
                (header_len, (length + 2).saturating_sub(header_len))
            } else {
                // No header extension: decryption starts right after the
                // length field and covers the flag bytes too.
                (2, length)
            };
            let end = (offset + size).min(available);
            if let Some((stream_id, block)) = self.active {
                let stream = self.pool.prepare_frame(stream_id, block);
                stream.decrypt(&mut packet[offset..end]);
            } else {
                warn!("scrambled PES packet before any private key data; left as-is");
            }
            packet[2] &= !0x30;
        } else if code == 0xbc {
            packet[2] &= !0x20;
        }

        self.output.write_all(&[code])?;
        self.output.write_all(&packet[..(length + 2).min(available)])?;
        Ok(Frame::Consumed)
    }

    /// Walk the PES header extension flags to locate the 16 bytes of private
    /// key data, rekeying the cipher stream for this packet. Returns the
    /// number of header bytes now buffered.
    fn process_scrambled_packet(
        &mut self,
        code: u8,
        header: &mut [u8; HEADER_BUFFER_SIZE],
        pes_header_length: u8,
    ) -> Result<usize> {
        let mut header_len = 5usize;
        if header[3] & 0x1 == 0 {
            return Ok(header_len);
        }
        if pes_header_length > MAX_PES_HEADER_LENGTH {
            return Err(DecodeError::MalformedPesHeader("extension too long"));
        }

        let extension_len = pes_header_length as usize;
        self.input
            .read_exact(&mut header[header_len..header_len + extension_len])?;
        header_len += extension_len;

        // Unwritten scratch bytes read as zero, so a walk past the buffered
        // extension simply finds no flags set.
        let mut key_offset = 6usize;
        let mut ext_byte = 5usize;
        loop {
            let mut go_again = false;
            if ext_byte >= header.len() {
                return Err(DecodeError::MalformedPesHeader("flag walk out of range"));
            }
            let flags = header[ext_byte];

            if flags & 0x20 != 0 {
                key_offset += 4;
            }
            if flags & 0x80 != 0 {
                if key_offset + 16 > header.len() {
                    return Err(DecodeError::MalformedPesHeader("key data out of range"));
                }
                let mut key = [0u8; 16];
                key.copy_from_slice(&header[key_offset..key_offset + 16]);
                self.process_private_data(code, StreamKey(key))?;
            }
            // P-STD buffer field
            if flags & 0x10 != 0 {
                key_offset += 2;
            }
            // Second extension flag chains another flag byte.
            if flags & 0x1 != 0 {
                ext_byte = key_offset;
                key_offset += 1;
                go_again = true;
            }
            if !go_again {
                break;
            }
        }
        Ok(header_len)
    }

    /// Install this packet's key: check its fixed bits, prepare the Turing
    /// frame for (start code, block number), and burn the 4-byte sentinel to
    /// advance the cipher.
    fn process_private_data(&mut self, code: u8, key: StreamKey) -> Result<()> {
        if !key.is_complete() {
            return Err(DecodeError::StreamKeyCheck(code as u16));
        }
        let block = key.block_number();
        self.active = Some((code, block));
        let stream = self.pool.prepare_frame(code, block);
        let mut sentinel = key.crypted().to_be_bytes();
        stream.decrypt(&mut sentinel);
        Ok(())
    }

    fn read_fully(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.input.read_fully(buf)?)
    }
}
