//! The outer ".TiVo" container: a fixed header followed by metadata chunks.
//!
//! The first plaintext chunk seeds both cipher keys; encrypted chunks are
//! decrypted in order through a shared metadata keystream whose offset
//! tracks their position in the file.

use std::io::Read;

use bytes::Buf;
use log::debug;

use crate::crypto::{keys, TuringPool};
use crate::error::{DecodeError, Result};
use crate::io::CountingReader;

/// Bytes of fixed header before the chunk table.
const HEADER_SIZE: usize = 16;

/// Bytes of per-chunk header before the payload.
const CHUNK_HEADER_SIZE: u64 = 12;

/// Flag bit distinguishing Transport Stream recordings from Program Stream.
const FLAG_TRANSPORT_STREAM: u16 = 0x20;

/// The recording's payload format, chosen by the header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    ProgramStream,
    TransportStream,
}

/// The fixed 16-byte record at the start of every recording.
#[derive(Debug, Clone, Copy)]
pub struct EnvelopeHeader {
    pub flags: u16,
    /// Absolute byte offset at which MPEG payload begins.
    pub mpeg_offset: u32,
    pub chunk_count: u16,
}

impl EnvelopeHeader {
    pub fn read<R: Read>(input: &mut CountingReader<R>) -> Result<Self> {
        let mut raw = [0u8; HEADER_SIZE];
        input.read_exact(&mut raw).map_err(short_read)?;

        let mut buf = &raw[..];
        let mut tag = [0u8; 4];
        buf.copy_to_slice(&mut tag);
        if &tag != b"TiVo" {
            return Err(DecodeError::BadMagic(tag));
        }
        let _ = buf.get_u16();
        let flags = buf.get_u16();
        let _ = buf.get_u16();
        let mpeg_offset = buf.get_u32();
        let chunk_count = buf.get_u16();

        Ok(Self {
            flags,
            mpeg_offset,
            chunk_count,
        })
    }

    pub fn format(&self) -> Format {
        if self.flags & FLAG_TRANSPORT_STREAM != 0 {
            Format::TransportStream
        } else {
            Format::ProgramStream
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Plaintext,
    Encrypted,
}

/// One metadata chunk; `data` holds the decrypted payload once the envelope
/// has been read.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: u16,
    pub kind: ChunkKind,
    pub data: Vec<u8>,
}

impl Chunk {
    fn read<R: Read>(input: &mut CountingReader<R>) -> Result<Self> {
        let mut raw = [0u8; CHUNK_HEADER_SIZE as usize];
        input.read_exact(&mut raw).map_err(short_read)?;

        let mut buf = &raw[..];
        let chunk_size = buf.get_u32() as u64;
        let data_size = buf.get_u32() as u64;
        let id = buf.get_u16();
        let kind = match buf.get_u16() {
            0 => ChunkKind::Plaintext,
            1 => ChunkKind::Encrypted,
            kind => return Err(DecodeError::UnsupportedChunkKind { id, kind }),
        };

        if chunk_size < data_size + CHUNK_HEADER_SIZE {
            return Err(DecodeError::EnvelopeMalformed(
                "chunk smaller than its own payload",
            ));
        }

        let mut data = vec![0u8; data_size as usize];
        input.read_exact(&mut data).map_err(short_read)?;
        input
            .skip(chunk_size - data_size - CHUNK_HEADER_SIZE)
            .map_err(short_read)?;

        Ok(Self { id, kind, data })
    }
}

/// The parsed envelope: header, decrypted chunks, and the media cipher key
/// derived from the first plaintext chunk.
pub struct Envelope {
    pub header: EnvelopeHeader,
    pub chunks: Vec<Chunk>,
    pub media_key: Option<[u8; 20]>,
}

impl Envelope {
    /// Read the header and every metadata chunk, decrypting encrypted
    /// chunks in the order they appear.
    pub fn read<R: Read>(input: &mut CountingReader<R>, mak: &str) -> Result<Self> {
        let header = EnvelopeHeader::read(input)?;
        debug!(
            "envelope: flags={:#06x} mpeg_offset={} chunks={}",
            header.flags, header.mpeg_offset, header.chunk_count
        );

        let mut chunks = Vec::with_capacity(header.chunk_count as usize);
        let mut media_key = None;
        let mut meta_pool: Option<TuringPool> = None;
        let mut meta_cursor: u64 = 0;

        for index in 0..header.chunk_count {
            let data_pos = input.position() + CHUNK_HEADER_SIZE;
            let mut chunk = Chunk::read(input)?;
            match chunk.kind {
                ChunkKind::Plaintext => {
                    media_key = Some(keys::media_key(mak, &chunk.data));
                    meta_pool = Some(TuringPool::new(keys::metadata_key(mak, &chunk.data)));
                    meta_cursor = data_pos + chunk.data.len() as u64;
                }
                ChunkKind::Encrypted => {
                    let pool = meta_pool.as_mut().ok_or(DecodeError::EnvelopeMalformed(
                        "encrypted chunk before any plaintext chunk",
                    ))?;
                    let offset = data_pos.checked_sub(meta_cursor).ok_or(
                        DecodeError::EnvelopeMalformed("metadata cursor ran ahead of chunk"),
                    )?;
                    let stream = pool.prepare_frame(0, 0);
                    stream.skip(offset as usize);
                    stream.decrypt(&mut chunk.data);
                    meta_cursor = data_pos + chunk.data.len() as u64;
                }
            }
            debug!(
                "chunk {index}: id={} kind={:?} {} bytes",
                chunk.id,
                chunk.kind,
                chunk.data.len()
            );
            chunks.push(chunk);
        }

        Ok(Self {
            header,
            chunks,
            media_key,
        })
    }
}

/// Short reads inside the envelope are a structural failure, not a clean end
/// of input.
fn short_read(e: std::io::Error) -> DecodeError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        DecodeError::EnvelopeMalformed("unexpected end of input")
    } else {
        DecodeError::Io(e)
    }
}
