//! A fixed-length bitmap, used for the oopmaps of archived heap regions.
//!
//! Bit `i` covers the `i`-th narrow-oop slot of a region. The on-disk form is a sequence of
//! little-endian 64-bit words; `size_in_bits` is recorded separately in the region descriptor.

use byteorder::{ByteOrder, LittleEndian};

const BITS_IN_WORD: usize = u64::BITS as usize;

#[derive(Clone, PartialEq, Eq)]
pub struct BitMap {
    words: Vec<u64>,
    size_in_bits: usize,
}

impl BitMap {
    /// A bitmap of `size_in_bits` cleared bits.
    pub fn new(size_in_bits: usize) -> Self {
        BitMap {
            words: vec![0; Self::words_for(size_in_bits)],
            size_in_bits,
        }
    }

    fn words_for(size_in_bits: usize) -> usize {
        size_in_bits.div_ceil(BITS_IN_WORD)
    }

    pub fn size_in_bits(&self) -> usize {
        self.size_in_bits
    }

    pub fn is_empty(&self) -> bool {
        self.size_in_bits == 0
    }

    /// Number of bytes of the serialized form.
    pub fn size_in_bytes(&self) -> usize {
        self.words.len() * (BITS_IN_WORD / 8)
    }

    pub fn set_bit(&mut self, index: usize) {
        assert!(index < self.size_in_bits, "bit {} out of range", index);
        self.words[index / BITS_IN_WORD] |= 1u64 << (index % BITS_IN_WORD);
    }

    pub fn clear_bit(&mut self, index: usize) {
        assert!(index < self.size_in_bits, "bit {} out of range", index);
        self.words[index / BITS_IN_WORD] &= !(1u64 << (index % BITS_IN_WORD));
    }

    pub fn at(&self, index: usize) -> bool {
        index < self.size_in_bits && self.words[index / BITS_IN_WORD] & (1u64 << (index % BITS_IN_WORD)) != 0
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterate over the indices of the set bits, in increasing order.
    pub fn iter_set_bits(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .filter(|(_, w)| **w != 0)
            .flat_map(|(wi, w)| {
                let mut word = *w;
                std::iter::from_fn(move || {
                    if word == 0 {
                        return None;
                    }
                    let bit = word.trailing_zeros() as usize;
                    word &= word - 1;
                    Some(wi * BITS_IN_WORD + bit)
                })
            })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.size_in_bytes()];
        LittleEndian::write_u64_into(&self.words, &mut bytes);
        bytes
    }

    /// Rebuild a bitmap from its serialized form. Returns `None` if `bytes` is shorter than
    /// `size_in_bits` requires, or if a bit beyond `size_in_bits` is set.
    pub fn from_bytes(bytes: &[u8], size_in_bits: usize) -> Option<Self> {
        let n_words = Self::words_for(size_in_bits);
        if bytes.len() < n_words * 8 {
            return None;
        }
        let mut words = vec![0u64; n_words];
        LittleEndian::read_u64_into(&bytes[..n_words * 8], &mut words);
        let tail = size_in_bits % BITS_IN_WORD;
        if tail != 0 && words[n_words - 1] >> tail != 0 {
            return None;
        }
        Some(BitMap {
            words,
            size_in_bits,
        })
    }
}

impl std::fmt::Debug for BitMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BitMap({} bits, {} set)",
            self.size_in_bits,
            self.count_ones()
        )
    }
}
