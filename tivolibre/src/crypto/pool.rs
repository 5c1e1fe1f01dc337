//! Pool of per-stream Turing cipher states.

use std::collections::HashMap;

use sha1::{Digest, Sha1};

use super::stream::TuringStream;

/// Only the first 17 bytes of the 20-byte working key are hashed into the
/// Turing round key; the remaining three go into the IV alone. This is part
/// of the scheme, not an oversight.
const SHORTENED_KEY_LENGTH: usize = 17;

/// Owns every [`TuringStream`] derived from one 20-byte base key, rekeying
/// a stream whenever its block number changes.
pub struct TuringPool {
    key: [u8; 20],
    streams: HashMap<u8, TuringStream>,
}

impl TuringPool {
    pub fn new(key: [u8; 20]) -> Self {
        Self {
            key,
            streams: HashMap::new(),
        }
    }

    /// Locate or create the stream for `stream_id`, rekeying it if its
    /// current block differs from `block_id`.
    pub fn prepare_frame(&mut self, stream_id: u8, block_id: u32) -> &mut TuringStream {
        let key = &mut self.key;
        let stream = self.streams.entry(stream_id).or_insert_with(|| {
            let mut stream = TuringStream::new(stream_id, block_id);
            rekey(key, &mut stream, stream_id, block_id);
            stream
        });
        if stream.block_id() != block_id {
            rekey(key, stream, stream_id, block_id);
        }
        stream
    }
}

/// Scatter the stream and block ids over the key tail, then derive the
/// Turing round key and IV by SHA-1.
fn rekey(key: &mut [u8; 20], stream: &mut TuringStream, stream_id: u8, block_id: u32) {
    key[16] = stream_id;
    key[17] = (block_id >> 16) as u8;
    key[18] = (block_id >> 8) as u8;
    key[19] = block_id as u8;

    let round_key: [u8; 20] = Sha1::digest(&key[..SHORTENED_KEY_LENGTH]).into();
    let iv: [u8; 20] = Sha1::digest(&key[..]).into();
    stream.reset(stream_id, block_id, &round_key, &iv);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_twice_restores_the_input() {
        let mut pool = TuringPool::new([0x42; 20]);
        let original: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let mut data = original.clone();

        pool.prepare_frame(0xE0, 7).decrypt(&mut data);
        assert_ne!(data, original);

        // Rekey through a different block, then back, to force a fresh
        // keystream for the same (stream, block) pair.
        pool.prepare_frame(0xE0, 8);
        pool.prepare_frame(0xE0, 7).decrypt(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn skip_matches_discarded_decryption() {
        let mut skipped = TuringPool::new([0x17; 20]);
        let stream = skipped.prepare_frame(0xC0, 1);
        stream.skip(700);
        let mut via_skip = [0u8; 32];
        stream.decrypt(&mut via_skip);

        let mut drained = TuringPool::new([0x17; 20]);
        let stream = drained.prepare_frame(0xC0, 1);
        let mut discard = [0u8; 700];
        stream.decrypt(&mut discard);
        let mut via_decrypt = [0u8; 32];
        stream.decrypt(&mut via_decrypt);

        assert_eq!(via_skip, via_decrypt);
    }

    #[test]
    fn streams_with_different_ids_are_independent() {
        let mut pool = TuringPool::new([0x99; 20]);
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        pool.prepare_frame(0xE0, 3).decrypt(&mut a);
        pool.prepare_frame(0xC0, 3).decrypt(&mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn block_change_rekeys_the_stream() {
        let mut pool = TuringPool::new([0x10; 20]);
        let mut a = [0u8; 64];
        pool.prepare_frame(0xE0, 1).decrypt(&mut a);
        let mut b = [0u8; 64];
        pool.prepare_frame(0xE0, 2).decrypt(&mut b);
        assert_ne!(a, b);
    }
}
