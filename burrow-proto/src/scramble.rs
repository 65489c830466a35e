//! The pluggable obfuscation seam.
//!
//! Only the very first data packet of each stream (sequence 1, see
//! [`SCRAMBLE_UNTIL`](crate::SCRAMBLE_UNTIL)) passes through this transform
//! before transmission, hiding the most recognizable bytes of common
//! plaintext protocols from naive middlebox matching. This is explicitly
//! not a security boundary; anything needing confidentiality belongs in the
//! byte-streams being tunneled.

/// An invertible byte transform: `decode(encode(x)) == x` for all inputs.
pub trait Scramble {
    fn encode(&self, data: &[u8]) -> Vec<u8>;
    fn decode(&self, data: &[u8]) -> Vec<u8>;
}

/// The default transform: XOR against a splitmix64 keystream derived from a
/// shared seed. XOR with a fixed keystream is its own inverse, so encode and
/// decode are the same operation.
#[derive(Debug, Clone, Copy)]
pub struct XorScramble {
    seed: u64,
}

impl XorScramble {
    pub const fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn apply(&self, data: &[u8]) -> Vec<u8> {
        let mut state = self.seed;
        let mut out = Vec::with_capacity(data.len());

        for chunk in data.chunks(8) {
            state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
            let mut word = state;
            word = (word ^ (word >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            word = (word ^ (word >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            word ^= word >> 31;

            for (byte, key) in chunk.iter().zip(word.to_le_bytes()) {
                out.push(byte ^ key);
            }
        }

        out
    }
}

impl Scramble for XorScramble {
    fn encode(&self, data: &[u8]) -> Vec<u8> {
        self.apply(data)
    }

    fn decode(&self, data: &[u8]) -> Vec<u8> {
        self.apply(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MAX_PAYLOAD, SCRAMBLE_SEED};

    #[test]
    fn decode_inverts_encode() {
        let scramble = XorScramble::new(SCRAMBLE_SEED);

        let mut cases: Vec<Vec<u8>> = vec![
            Vec::new(),
            vec![0],
            b"GET / HTTP/1.1\r\n".to_vec(),
            vec![0xff; 7],
            vec![0; MAX_PAYLOAD],
        ];
        // Every length around the keystream word boundary.
        for len in 1..=17 {
            cases.push((0..len as u8).collect());
        }

        for data in cases {
            assert_eq!(scramble.decode(&scramble.encode(&data)), data, "len {}", data.len());
        }
    }

    #[test]
    fn encode_changes_the_bytes() {
        let scramble = XorScramble::new(SCRAMBLE_SEED);
        let data = b"CONNECT example.com:443".to_vec();
        assert_ne!(scramble.encode(&data), data);
    }

    #[test]
    fn encode_preserves_length() {
        let scramble = XorScramble::new(SCRAMBLE_SEED);
        for len in [0usize, 1, 8, 9, 100, MAX_PAYLOAD] {
            assert_eq!(scramble.encode(&vec![7u8; len]).len(), len);
        }
    }

    #[test]
    fn different_seeds_disagree() {
        let a = XorScramble::new(1);
        let b = XorScramble::new(2);
        let data = vec![0u8; 32];
        assert_ne!(a.encode(&data), b.encode(&data));
    }
}
