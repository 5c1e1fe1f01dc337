//! Error types for TiVo file decoding.

use thiserror::Error;

/// Errors surfaced while decoding a TiVo recording.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The outer header did not start with the "TiVo" tag.
    #[error("not a TiVo file: bad magic {0:02x?}")]
    BadMagic([u8; 4]),

    /// The envelope's structure is inconsistent or truncated.
    #[error("malformed envelope: {0}")]
    EnvelopeMalformed(&'static str),

    /// A metadata chunk declared a kind other than plaintext or encrypted.
    #[error("chunk {id} has unsupported kind {kind}")]
    UnsupportedChunkKind { id: u16, kind: u16 },

    /// A TS adaptation field carries private data.
    #[error("TS packet carries private adaptation field data")]
    PrivateAdaptation,

    /// PAT, PMT, or TiVo private-data structure did not validate.
    #[error("malformed {table}: {reason}")]
    MalformedTable {
        table: &'static str,
        reason: String,
    },

    /// A packet arrived on a PID the decoder has no handling for.
    #[error("unsupported PID 0x{0:04x}")]
    UnsupportedPid(u16),

    /// The Program Stream scanner hit a start code it cannot classify.
    #[error("unknown MPEG start code 0x{0:08x}")]
    UnknownStartCode(u32),

    /// A PES private header is structurally out of range.
    #[error("malformed PES header: {0}")]
    MalformedPesHeader(&'static str),

    /// An installed 16-byte stream key failed its must-be-1 bit check.
    #[error("stream key failed its bit check (stream 0x{0:04x})")]
    StreamKeyCheck(u16),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DecodeError>;
