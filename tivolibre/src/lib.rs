//! tivolibre - decrypt TiVo recording files into standard MPEG streams.
//!
//! A TiVo recording wraps an ordinary MPEG Program Stream or Transport
//! Stream in a small envelope of metadata chunks. Payload bytes are
//! encrypted with the Turing stream cipher under keys derived from the
//! owner's Media Access Key (MAK) and per-recording secrets; Transport
//! Stream recordings refresh their keys in-band through a private data
//! stream.
//!
//! The two entry points mirror the two things a caller wants to do:
//!
//! - [`decode`] - decrypt a whole recording to an output sink.
//! - [`decode_metadata`] - read only the (decrypted) metadata chunks.
//!
//! [`TivoDecoder`] exposes the same pipeline as a struct for callers that
//! need both the video and the metadata from a single, non-seekable input.

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod io;
pub mod pes;
pub mod ps;
pub mod ts;

mod decoder;

pub use decoder::{decode, decode_metadata, DecoderOptions, TivoDecoder};
pub use envelope::{Envelope, Format};
pub use error::{DecodeError, Result};
