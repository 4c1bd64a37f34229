//! # Masking
//!
//! Client-to-server frames carry a 4-byte key that every payload byte is XOR-ed with, byte `i`
//! using `key[i % 4]`. Masking is its own inverse.
//!
//! Keys come from a [`MaskGenerator`] owned by the connection's encoder, so each connection
//! draws from its own seedable source instead of a process-wide one.
use rand::{rngs::StdRng, RngCore, SeedableRng};

/// XORs `buf` in place with `key`, starting at key position 0.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    let word = u32::from_ne_bytes(key);
    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let masked = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ word;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }
    for (byte, k) in chunks.into_remainder().iter_mut().zip(key) {
        *byte ^= k;
    }
}

/// Writes `src` XOR `key` into `dst`, which must be exactly as long as `src`.
///
/// Used by the encoder to mask while copying into the outgoing buffer, leaving the caller's
/// payload untouched.
#[inline]
pub fn mask_into(dst: &mut [u8], src: &[u8], key: [u8; 4]) {
    debug_assert_eq!(dst.len(), src.len());
    for (i, (out, byte)) in dst.iter_mut().zip(src).enumerate() {
        *out = byte ^ key[i & 3];
    }
}

/// Source of masking keys for one connection.
#[derive(Debug)]
pub struct MaskGenerator {
    rng: StdRng,
}

impl MaskGenerator {
    /// A generator seeded from the operating system.
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// A deterministic generator, for reproducible tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draws the next 4-byte key.
    pub fn next_key(&mut self) -> [u8; 4] {
        self.rng.next_u32().to_ne_bytes()
    }
}

impl Default for MaskGenerator {
    fn default() -> Self {
        Self::from_entropy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(buf: &[u8], key: [u8; 4]) -> Vec<u8> {
        buf.iter().enumerate().map(|(i, b)| b ^ key[i % 4]).collect()
    }

    #[test]
    fn test_matches_bytewise_reference_for_all_lengths() {
        let key = [0x6d, 0xb6, 0xb2, 0x80];
        let data: Vec<u8> = (0..67u8).map(|i| i.wrapping_mul(31)).collect();
        for len in 0..data.len() {
            let mut masked = data[..len].to_vec();
            apply_mask(&mut masked, key);
            assert_eq!(masked, reference(&data[..len], key), "length {len}");
        }
    }

    #[test]
    fn test_masking_twice_restores_payload() {
        let key = [0xAA, 0xBB, 0xCC, 0xDD];
        let original = b"masking is an involution".to_vec();
        let mut data = original.clone();
        apply_mask(&mut data, key);
        assert_ne!(data, original);
        apply_mask(&mut data, key);
        assert_eq!(data, original);
    }

    #[test]
    fn test_mask_into_leaves_source_untouched() {
        let key = [0x12, 0x34, 0x56, 0x78];
        let src = [0xAB, 0xCD, 0xEF, 0x01, 0x23];
        let mut dst = [0u8; 5];
        mask_into(&mut dst, &src, key);
        assert_eq!(dst.to_vec(), reference(&src, key));
        assert_eq!(src, [0xAB, 0xCD, 0xEF, 0x01, 0x23]);
    }

    #[test]
    fn test_zero_key_is_identity() {
        let mut data = b"unchanged".to_vec();
        apply_mask(&mut data, [0; 4]);
        assert_eq!(data, b"unchanged");
    }

    #[test]
    fn test_seeded_generator_is_reproducible() {
        let mut a = MaskGenerator::seeded(7);
        let mut b = MaskGenerator::seeded(7);
        let keys_a: Vec<_> = (0..8).map(|_| a.next_key()).collect();
        let keys_b: Vec<_> = (0..8).map(|_| b.next_key()).collect();
        assert_eq!(keys_a, keys_b);
    }
}
