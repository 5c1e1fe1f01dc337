//! Transport Stream decoding: 188-byte framing, PSI tables, TiVo key
//! distribution, and per-PID decryption.

pub mod decoder;
pub mod packet;
pub mod pat;
pub mod pmt;
pub mod private;
pub mod stream;

pub use decoder::TsDecoder;
pub use packet::{TsHeader, SYNC_BYTE, TS_FRAME_SIZE};
pub use pmt::StreamType;
pub use stream::PidStream;
