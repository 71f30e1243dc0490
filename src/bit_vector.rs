// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-length bit vectors over word storage owned by someone else.
//!
//! A [`BitVector`] never allocates. It is either a view over a borrowed
//! `&[Word]`/`&mut [Word]` buffer, or wraps a fixed array for the cases where
//! the bitmap lives inline in another structure.

use axerrno::{AxResult, ax_err};

/// Storage word of a [`BitVector`].
pub type Word = usize;

/// Number of bits in one [`Word`].
pub const WORD_BITS: usize = Word::BITS as usize;

/// Returns the number of words needed to hold `bits` bits.
pub const fn words_for(bits: usize) -> usize {
    bits.div_ceil(WORD_BITS)
}

#[inline]
const fn word_index(bit: usize) -> usize {
    bit / WORD_BITS
}

#[inline]
const fn bit_offset(bit: usize) -> usize {
    bit % WORD_BITS
}

#[inline]
const fn bit_mask(bit: usize) -> Word {
    1 << bit_offset(bit)
}

/// Mask of the `count` lowest bits, `count < WORD_BITS`.
#[inline]
const fn low_mask(count: usize) -> Word {
    (1 << count) - 1
}

/// A fixed-length bit vector.
///
/// The length is always a whole multiple of [`WORD_BITS`]. Queries outside the
/// vector never fault: single-bit tests read as clear, run searches report
/// "not found" and mutations are clipped to the vector.
///
/// There is no internal synchronization. Mutation needs `&mut self`, so the
/// borrow checker provides the single-writer discipline.
#[derive(Clone)]
pub struct BitVector<B> {
    buffer: B,
    size_in_bits: usize,
}

impl<B: AsRef<[Word]>> BitVector<B> {
    /// Creates a bit vector spanning the whole buffer.
    pub fn new(buffer: B) -> Self {
        let size_in_bits = buffer.as_ref().len() * WORD_BITS;
        Self {
            buffer,
            size_in_bits,
        }
    }

    /// Creates a bit vector of `size_in_bits` bits over the head of `buffer`.
    pub fn with_size(buffer: B, size_in_bits: usize) -> AxResult<Self> {
        if bit_offset(size_in_bits) != 0 {
            return ax_err!(InvalidInput, "bit length is not a whole number of words");
        }
        if word_index(size_in_bits) > buffer.as_ref().len() {
            return ax_err!(InvalidInput, "buffer is shorter than the bit length");
        }
        Ok(Self {
            buffer,
            size_in_bits,
        })
    }

    /// Number of bits in the vector.
    pub fn size_in_bits(&self) -> usize {
        self.size_in_bits
    }

    /// Number of bytes in the vector.
    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bits / 8
    }

    /// The words backing the vector.
    pub fn as_words(&self) -> &[Word] {
        &self.buffer.as_ref()[..word_index(self.size_in_bits)]
    }

    /// Consumes the vector, returning the underlying storage.
    pub fn into_inner(self) -> B {
        self.buffer
    }

    /// Returns whether `bit` is set. Bits beyond the vector read as clear.
    pub fn test(&self, bit: usize) -> bool {
        bit < self.size_in_bits && self.as_words()[word_index(bit)] & bit_mask(bit) != 0
    }

    /// Index of the first set bit, or [`size_in_bits`](Self::size_in_bits) if
    /// every bit is clear.
    pub fn find_first_set(&self) -> usize {
        self.find_first_single(true)
    }

    /// Index of the first clear bit, or [`size_in_bits`](Self::size_in_bits)
    /// if every bit is set.
    pub fn find_first_clear(&self) -> usize {
        self.find_first_single(false)
    }

    /// Lowest index at which `count` consecutive set bits begin.
    pub fn find_first_set_run(&self, count: usize) -> Option<usize> {
        self.find_run(0, count, true)
    }

    /// Lowest index at which `count` consecutive clear bits begin.
    pub fn find_first_clear_run(&self, count: usize) -> Option<usize> {
        self.find_run(0, count, false)
    }

    /// Lowest index `>= index` at which `count` consecutive set bits begin.
    ///
    /// `None` if no such run exists or `count` exceeds the vector. An `index`
    /// beyond the vector restarts the search at 0, and a zero `count` yields
    /// `index` rounded down to a byte boundary.
    pub fn find_first_set_run_from(&self, index: usize, count: usize) -> Option<usize> {
        self.find_run(index, count, true)
    }

    /// Lowest index `>= index` at which `count` consecutive clear bits begin.
    ///
    /// Same corner cases as [`find_first_set_run_from`](Self::find_first_set_run_from).
    pub fn find_first_clear_run_from(&self, index: usize, count: usize) -> Option<usize> {
        self.find_run(index, count, false)
    }

    /// Length of the run of set bits starting exactly at `index`, capped at
    /// `count` and at the end of the vector.
    pub fn get_length_of_set(&self, index: usize, count: usize) -> usize {
        self.run_length(index, count, true)
    }

    /// Length of the run of clear bits starting exactly at `index`, capped at
    /// `count` and at the end of the vector.
    pub fn get_length_of_clear(&self, index: usize, count: usize) -> usize {
        self.run_length(index, count, false)
    }

    /// Whether all of `[index, index + count)` is set.
    ///
    /// False for an empty, out-of-bounds or overflowing range.
    pub fn are_bits_set(&self, index: usize, count: usize) -> bool {
        self.range_is_valid(index, count) && self.get_length_of_set(index, count) >= count
    }

    /// Whether all of `[index, index + count)` is clear.
    ///
    /// False for an empty, out-of-bounds or overflowing range.
    pub fn are_bits_clear(&self, index: usize, count: usize) -> bool {
        self.range_is_valid(index, count) && self.get_length_of_clear(index, count) >= count
    }

    pub fn all_set(&self) -> bool {
        self.are_bits_set(0, self.size_in_bits)
    }

    pub fn all_clear(&self) -> bool {
        self.are_bits_clear(0, self.size_in_bits)
    }

    fn range_is_valid(&self, index: usize, count: usize) -> bool {
        matches!(index.checked_add(count), Some(end) if end > index && end <= self.size_in_bits)
    }

    fn find_first_single(&self, set: bool) -> usize {
        self.as_words()
            .iter()
            .map(|&word| if set { word } else { !word })
            .enumerate()
            .find(|&(_, word)| word != 0)
            .map_or(self.size_in_bits, |(index, word)| {
                (index * WORD_BITS + word.trailing_zeros() as usize).min(self.size_in_bits)
            })
    }

    fn find_run(&self, index: usize, count: usize, set: bool) -> Option<usize> {
        if count > self.size_in_bits {
            return None;
        }

        let index = if index >= self.size_in_bits { 0 } else { index };
        if count == 0 {
            return Some(index & !7);
        }

        let mut current = index;
        while current + count <= self.size_in_bits {
            current += self.run_length(current, usize::MAX, !set);

            let length = self.run_length(current, count, set);
            if length >= count {
                return Some(current);
            }

            current += length;
        }

        None
    }

    /// Scans for the first bit that differs from `set`, starting at `index`.
    fn run_length(&self, index: usize, count: usize, set: bool) -> usize {
        if index >= self.size_in_bits {
            return 0;
        }

        let count = count.min(self.size_in_bits - index);
        if count == 0 {
            return 0;
        }

        let words = self.as_words();
        // After this transform, the bits that end the run are the ones.
        let load = |i: usize| if set { !words[i] } else { words[i] };

        let last = word_index(index + count - 1);
        let mut word = word_index(index);
        let mut value = load(word) >> bit_offset(index) << bit_offset(index);

        while value == 0 && word < last {
            word += 1;
            value = load(word);
        }

        if value == 0 {
            return count;
        }

        let length = word * WORD_BITS + value.trailing_zeros() as usize - index;
        length.min(count)
    }
}

impl<B: AsRef<[Word]> + AsMut<[Word]>> BitVector<B> {
    fn words_mut(&mut self) -> &mut [Word] {
        let len = word_index(self.size_in_bits);
        &mut self.buffer.as_mut()[..len]
    }

    /// Sets a single bit. Bits beyond the vector are ignored.
    pub fn set(&mut self, bit: usize) {
        if bit < self.size_in_bits {
            self.words_mut()[word_index(bit)] |= bit_mask(bit);
        }
    }

    /// Clears a single bit. Bits beyond the vector are ignored.
    pub fn clear(&mut self, bit: usize) {
        if bit < self.size_in_bits {
            self.words_mut()[word_index(bit)] &= !bit_mask(bit);
        }
    }

    /// Sets `[index, index + count)`, clipped to the vector.
    pub fn set_range(&mut self, index: usize, count: usize) {
        self.update_range(index, count, true);
    }

    /// Clears `[index, index + count)`, clipped to the vector.
    pub fn clear_range(&mut self, index: usize, count: usize) {
        self.update_range(index, count, false);
    }

    pub fn set_all(&mut self) {
        self.words_mut().fill(Word::MAX);
    }

    pub fn clear_all(&mut self) {
        self.words_mut().fill(0);
    }

    /// Partial first word, whole interior words, partial last word. Bits
    /// outside the range are preserved.
    fn update_range(&mut self, index: usize, count: usize, set: bool) {
        if index >= self.size_in_bits {
            return;
        }

        let mut count = count.min(self.size_in_bits - index);
        if count == 0 {
            return;
        }

        let apply = |word: &mut Word, mask: Word| {
            if set {
                *word |= mask;
            } else {
                *word &= !mask;
            }
        };

        let words = self.words_mut();
        let mut word = word_index(index);
        let offset = bit_offset(index);

        if offset != 0 {
            let head = WORD_BITS - offset;
            if count < head {
                apply(&mut words[word], low_mask(count) << offset);
                return;
            }

            apply(&mut words[word], Word::MAX << offset);
            word += 1;
            count -= head;
        }

        let full = count / WORD_BITS;
        words[word..word + full].fill(if set { Word::MAX } else { 0 });
        word += full;

        let tail = bit_offset(count);
        if tail != 0 {
            apply(&mut words[word], low_mask(tail));
        }
    }
}

impl<const N: usize> Default for BitVector<[Word; N]> {
    fn default() -> Self {
        Self::new([0; N])
    }
}

impl<B: AsRef<[Word]>> core::fmt::Debug for BitVector<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BitVector")
            .field("size_in_bits", &self.size_in_bits)
            .field("first_set", &self.find_first_set())
            .finish()
    }
}
