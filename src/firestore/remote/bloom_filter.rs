use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Bloom filter sent with an existence filter. Membership is tested against
/// full document resource names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    padding: u8,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    /// Validates the wire form. `padding` must be in `0..=7` and a non-empty
    /// bitmap needs at least one hash function.
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> FirestoreResult<Self> {
        if !(0..8).contains(&padding) {
            return Err(invalid_argument(format!("Invalid padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument("Invalid hash count: 0"));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument(format!(
                "Invalid padding when bitmap length is 0: {padding}"
            )));
        }
        let bit_count = bitmap.len() as u64 * 8 - padding as u64;
        Ok(Self {
            bitmap,
            padding: padding as u8,
            hash_count: hash_count as u32,
            bit_count,
        })
    }

    /// Empty filter of `bit_count` bits, filled with [`BloomFilter::insert`].
    pub fn with_bit_count(bit_count: u64, hash_count: u32) -> Self {
        let bytes = bit_count.div_ceil(8) as usize;
        let padding = (bytes as u64 * 8 - bit_count) as u8;
        Self {
            bitmap: vec![0; bytes],
            padding,
            hash_count,
            bit_count,
        }
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    pub fn padding(&self) -> u8 {
        self.padding
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (h1, h2) = hash_halves(value);
        (0..self.hash_count).all(|i| self.is_bit_set(self.bit_index(h1, h2, i)))
    }

    pub fn insert(&mut self, value: &str) {
        if self.bit_count == 0 {
            return;
        }
        let (h1, h2) = hash_halves(value);
        for i in 0..self.hash_count {
            let index = self.bit_index(h1, h2, i);
            self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add(h2.wrapping_mul(i as u64)) % self.bit_count
    }

    fn is_bit_set(&self, index: u64) -> bool {
        self.bitmap[(index / 8) as usize] & (1 << (index % 8)) != 0
    }
}

fn hash_halves(value: &str) -> (u64, u64) {
    let digest = md5::compute(value.as_bytes()).0;
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    second.copy_from_slice(&digest[8..]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}
