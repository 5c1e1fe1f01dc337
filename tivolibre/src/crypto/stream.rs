//! Keystream state for a single cipher stream.

use super::turing::{Turing, MAX_STREAM_LENGTH};

/// Whole-word round output may land past the frame end, so the buffer keeps
/// a little slack.
const CIPHER_BUF_LEN: usize = MAX_STREAM_LENGTH + 8;

/// One logical cipher stream: a Turing instance plus the frame of keystream
/// it last generated and a cursor into it.
///
/// Streams are created and rekeyed by [`super::pool::TuringPool`]; decryption
/// borrows a stream mutably for the duration of one call.
pub struct TuringStream {
    stream_id: u8,
    block_id: u32,
    cipher_pos: usize,
    cipher_len: usize,
    cipher: Box<[u8; CIPHER_BUF_LEN]>,
    turing: Turing,
}

impl TuringStream {
    pub(crate) fn new(stream_id: u8, block_id: u32) -> Self {
        Self {
            stream_id,
            block_id,
            cipher_pos: 0,
            cipher_len: 0,
            cipher: Box::new([0; CIPHER_BUF_LEN]),
            turing: Turing::new(),
        }
    }

    pub fn stream_id(&self) -> u8 {
        self.stream_id
    }

    pub fn block_id(&self) -> u32 {
        self.block_id
    }

    /// Rekey the underlying cipher and regenerate the first frame.
    pub(crate) fn reset(&mut self, stream_id: u8, block_id: u32, key: &[u8; 20], iv: &[u8; 20]) {
        self.stream_id = stream_id;
        self.block_id = block_id;
        self.turing.set_key(key);
        self.turing.set_iv(iv);
        self.cipher.fill(0);
        self.generate();
    }

    fn generate(&mut self) {
        self.cipher_len = self.turing.generate(&mut self.cipher[..]);
        self.cipher_pos = 0;
    }

    /// Advance the keystream cursor by `n` bytes, regenerating whole frames
    /// as needed.
    pub fn skip(&mut self, mut n: usize) {
        if self.cipher_pos + n < self.cipher_len {
            self.cipher_pos += n;
        } else {
            loop {
                n -= self.cipher_len - self.cipher_pos;
                self.generate();
                if n < self.cipher_len {
                    break;
                }
            }
            self.cipher_pos = n;
        }
    }

    /// XOR `buf` in place with the next `buf.len()` keystream bytes.
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        for byte in buf {
            if self.cipher_pos >= self.cipher_len {
                self.generate();
            }
            *byte ^= self.cipher[self.cipher_pos];
            self.cipher_pos += 1;
        }
    }
}
