//! Key derivation for TiVo recordings.

use md5::Md5;
use sha1::{Digest, Sha1};

/// Prefix hashed with the MAK to derive the metadata key.
const METADATA_MAK_PREFIX: &[u8] = b"tivo:TiVo DVR:";

/// Media cipher key: SHA-1 over the MAK bytes followed by the first
/// plaintext chunk's payload.
pub fn media_key(mak: &str, chunk_data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(mak.as_bytes());
    hasher.update(chunk_data);
    hasher.finalize().into()
}

/// Metadata cipher key: the lowercase MD5 hex digest of
/// `"tivo:TiVo DVR:" || MAK` stands in for the MAK in the media-key routine.
pub fn metadata_key(mak: &str, chunk_data: &[u8]) -> [u8; 20] {
    let mut hasher = Md5::new();
    hasher.update(METADATA_MAK_PREFIX);
    hasher.update(mak.as_bytes());
    let digest = hex::encode(hasher.finalize());
    media_key(&digest, chunk_data)
}

/// The 16 bytes of per-stream key material delivered by a TiVo private-data
/// packet (TS) or a PES private-data field (PS).
///
/// A 20-bit block number and a 32-bit sentinel are scattered across the key
/// bytes; six fixed bits must be set for the key to count as installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamKey(pub [u8; 16]);

impl StreamKey {
    /// Every well-formed key has these six bits set.
    pub fn is_complete(&self) -> bool {
        let k = &self.0;
        k[0] & 0x80 != 0
            && k[1] & 0x40 != 0
            && k[3] & 0x20 != 0
            && k[4] & 0x10 != 0
            && k[0xd] & 0x02 != 0
            && k[0xf] & 0x01 != 0
    }

    /// The Turing block number, scattered over bytes 1..=4.
    pub fn block_number(&self) -> u32 {
        let k = &self.0;
        ((k[1] as u32 & 0x3f) << 18)
            | ((k[2] as u32) << 10)
            | ((k[3] as u32 & 0xc0) << 2)
            | ((k[3] as u32 & 0x1f) << 3)
            | ((k[4] as u32 & 0xe0) >> 5)
    }

    /// The sentinel scattered over bytes 11..=15; the PS path decrypts its
    /// big-endian representation to advance the cipher.
    pub fn crypted(&self) -> u32 {
        let k = &self.0;
        ((k[0xb] as u32 & 0x03) << 0x1e)
            | ((k[0xc] as u32) << 0x16)
            | ((k[0xd] as u32 & 0xfc) << 0x0e)
            | ((k[0xd] as u32 & 0x01) << 0x0f)
            | ((k[0xe] as u32) << 0x07)
            | ((k[0xf] as u32 & 0xfe) >> 0x01)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The minimal key with every must-be-1 bit set and nothing else.
    fn bare_key() -> [u8; 16] {
        let mut k = [0u8; 16];
        k[0] = 0x80;
        k[1] = 0x40;
        k[3] = 0x20;
        k[4] = 0x10;
        k[0xd] = 0x02;
        k[0xf] = 0x01;
        k
    }

    #[test]
    fn complete_key_passes_the_bit_check() {
        assert!(StreamKey(bare_key()).is_complete());
    }

    #[test]
    fn each_missing_bit_fails_the_check() {
        for (byte, bit) in [(0, 0x80), (1, 0x40), (3, 0x20), (4, 0x10), (0xd, 0x02), (0xf, 0x01)] {
            let mut k = bare_key();
            k[byte] &= !bit;
            assert!(!StreamKey(k).is_complete(), "byte {byte} bit {bit:#x}");
        }
    }

    #[test]
    fn block_number_scatter() {
        let mut k = bare_key();
        // Bits chosen so every source field contributes.
        k[1] |= 0x15; // 0b010101 -> bits 18..24
        k[2] = 0xff;
        k[3] |= 0xc0 | 0x1f;
        k[4] |= 0xe0;
        let expected = (0x15 << 18) | (0xff << 10) | (0xc0 << 2) | (0x1f << 3) | (0xe0 >> 5);
        assert_eq!(StreamKey(k).block_number(), expected);
    }

    #[test]
    fn crypted_scatter() {
        let mut k = bare_key();
        k[0xb] = 0x03;
        k[0xc] = 0xff;
        k[0xd] = 0xff;
        k[0xe] = 0xff;
        k[0xf] = 0xff;
        assert_eq!(StreamKey(k).crypted(), 0xffffffff);
    }

    #[test]
    fn media_and_metadata_keys_differ() {
        let chunk = b"<TvBusMarshalledRecording/>";
        let media = media_key("1234567890", chunk);
        let meta = metadata_key("1234567890", chunk);
        assert_ne!(media, meta);
    }

    #[test]
    fn metadata_key_matches_manual_derivation() {
        let mak = "0123456789";
        let chunk = b"payload";
        let mut md5 = Md5::new();
        md5.update(b"tivo:TiVo DVR:");
        md5.update(mak.as_bytes());
        let hex_digest = hex::encode(md5.finalize());

        let mut sha = Sha1::new();
        sha.update(hex_digest.as_bytes());
        sha.update(chunk);
        let expected: [u8; 20] = sha.finalize().into();

        assert_eq!(metadata_key(mak, chunk), expected);
    }
}
