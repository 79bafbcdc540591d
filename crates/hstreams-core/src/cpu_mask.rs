//! Fixed-width CPU mask over hardware thread IDs.
//!
//! Every operation is total: bit indices beyond [`CPU_MASK_BITS`] are
//! silently ignored and queries on them report "not set".

use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor, Range};

use serde::{Deserialize, Serialize};

/// Number of 64-bit words in a mask.
pub const CPU_MASK_WORDS: usize = 16;

/// Number of hardware threads a mask can describe.
pub const CPU_MASK_BITS: usize = CPU_MASK_WORDS * 64;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CpuMask {
    words: [u64; CPU_MASK_WORDS],
}

impl CpuMask {
    /// An empty mask.
    pub const fn new() -> Self {
        Self {
            words: [0; CPU_MASK_WORDS],
        }
    }

    pub const fn from_words(words: [u64; CPU_MASK_WORDS]) -> Self {
        Self { words }
    }

    pub const fn words(&self) -> &[u64; CPU_MASK_WORDS] {
        &self.words
    }

    /// Mask with every bit of `range` set.
    pub fn from_range(range: Range<usize>) -> Self {
        let mut mask = Self::new();
        for bit in range {
            mask.set(bit);
        }
        mask
    }

    /// Mask with the listed bits set.
    pub fn from_bits<I: IntoIterator<Item = usize>>(bits: I) -> Self {
        let mut mask = Self::new();
        for bit in bits {
            mask.set(bit);
        }
        mask
    }

    pub fn set(&mut self, bit: usize) {
        if bit < CPU_MASK_BITS {
            self.words[bit / 64] |= 1u64 << (bit % 64);
        }
    }

    pub fn clear(&mut self, bit: usize) {
        if bit < CPU_MASK_BITS {
            self.words[bit / 64] &= !(1u64 << (bit % 64));
        }
    }

    pub fn clear_all(&mut self) {
        self.words = [0; CPU_MASK_WORDS];
    }

    pub fn is_set(&self, bit: usize) -> bool {
        bit < CPU_MASK_BITS && self.words[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn and(&self, other: &CpuMask) -> CpuMask {
        let mut out = *self;
        for (dst, src) in out.words.iter_mut().zip(other.words.iter()) {
            *dst &= *src;
        }
        out
    }

    pub fn or(&self, other: &CpuMask) -> CpuMask {
        let mut out = *self;
        for (dst, src) in out.words.iter_mut().zip(other.words.iter()) {
            *dst |= *src;
        }
        out
    }

    pub fn xor(&self, other: &CpuMask) -> CpuMask {
        let mut out = *self;
        for (dst, src) in out.words.iter_mut().zip(other.words.iter()) {
            *dst ^= *src;
        }
        out
    }

    /// True when the two masks share at least one bit.
    pub fn intersects(&self, other: &CpuMask) -> bool {
        self.words.iter().zip(other.words.iter()).any(|(a, b)| a & b != 0)
    }

    /// True when every bit of `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &CpuMask) -> bool {
        self.words.iter().zip(other.words.iter()).all(|(a, b)| a & !b == 0)
    }

    pub fn first_set(&self) -> Option<usize> {
        self.iter().next()
    }

    pub fn highest_set(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .rev()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i * 64 + 63 - w.leading_zeros() as usize)
    }

    /// Set bits in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, word)| {
            let mut w = *word;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(i * 64 + bit)
            })
        })
    }

    /// Translate into the OS affinity type.
    #[cfg(target_os = "linux")]
    pub fn to_native(&self) -> libc::cpu_set_t {
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::CPU_ZERO(&mut set);
        }
        let limit = std::cmp::min(CPU_MASK_BITS, libc::CPU_SETSIZE as usize);
        for bit in self.iter().take_while(|b| *b < limit) {
            unsafe {
                libc::CPU_SET(bit, &mut set);
            }
        }
        set
    }

    /// Translate from the OS affinity type.
    #[cfg(target_os = "linux")]
    pub fn from_native(set: &libc::cpu_set_t) -> Self {
        let limit = std::cmp::min(CPU_MASK_BITS, libc::CPU_SETSIZE as usize);
        let mut mask = Self::new();
        for bit in 0..limit {
            if unsafe { libc::CPU_ISSET(bit, set) } {
                mask.set(bit);
            }
        }
        mask
    }
}

impl BitAnd for CpuMask {
    type Output = CpuMask;

    fn bitand(self, rhs: CpuMask) -> CpuMask {
        self.and(&rhs)
    }
}

impl BitOr for CpuMask {
    type Output = CpuMask;

    fn bitor(self, rhs: CpuMask) -> CpuMask {
        self.or(&rhs)
    }
}

impl BitXor for CpuMask {
    type Output = CpuMask;

    fn bitxor(self, rhs: CpuMask) -> CpuMask {
        self.xor(&rhs)
    }
}

// Renders as compact ranges, e.g. `{0-7,12}`.
impl fmt::Display for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        let mut first = true;
        let mut bits = self.iter().peekable();
        while let Some(start) = bits.next() {
            let mut end = start;
            while bits.peek() == Some(&(end + 1)) {
                end += 1;
                bits.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        f.write_str("}")
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask{self}")
    }
}
