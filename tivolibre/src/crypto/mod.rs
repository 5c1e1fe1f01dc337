//! Cipher primitives: the Turing stream cipher, per-stream keystream state,
//! and the key-derivation routines that tie them to a recording's MAK.

pub mod keys;
pub mod pool;
pub mod stream;
pub mod turing;

pub use keys::StreamKey;
pub use pool::TuringPool;
pub use stream::TuringStream;
pub use turing::Turing;
