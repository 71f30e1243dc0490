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

//! Intercept bitmaps consumed by the VMX execution controls.

use axerrno::{AxResult, ax_err};

use crate::bit_vector::{BitVector, Word, words_for};

const IO_PORT_COUNT: usize = 0x1_0000;
const IO_BITMAP_WORDS: usize = words_for(IO_PORT_COUNT);

/// I/O bitmaps A and B, one bit per port. (SDM Vol. 3C, Section 25.6.4)
///
/// A set bit makes the port exit.
#[derive(Clone, Default)]
pub struct IoBitmap {
    bits: BitVector<[Word; IO_BITMAP_WORDS]>,
}

impl IoBitmap {
    /// A bitmap that lets every port through.
    pub fn passthrough_all() -> Self {
        Self::default()
    }

    /// A bitmap that intercepts every port.
    pub fn intercept_all() -> Self {
        let mut bitmap = Self::default();
        bitmap.set_all(true);
        bitmap
    }

    pub fn set_all(&mut self, intercept: bool) {
        if intercept {
            self.bits.set_all();
        } else {
            self.bits.clear_all();
        }
    }

    pub fn set_intercept(&mut self, port: u16, intercept: bool) {
        self.set_intercept_of_range(port, 1, intercept);
    }

    /// Updates `count` ports starting at `port_base`, clipped at port 0xffff.
    pub fn set_intercept_of_range(&mut self, port_base: u16, count: usize, intercept: bool) {
        if intercept {
            self.bits.set_range(port_base as usize, count);
        } else {
            self.bits.clear_range(port_base as usize, count);
        }
    }

    pub fn is_intercepted(&self, port: u16) -> bool {
        self.bits.test(port as usize)
    }

    /// Raw words, bitmap A first, as the processor expects them.
    pub fn as_words(&self) -> &[Word] {
        self.bits.as_words()
    }
}

const MSR_RANGE_SIZE: u32 = 0x2000;
const MSR_LOW_BASE: u32 = 0;
const MSR_HIGH_BASE: u32 = 0xc000_0000;
const MSR_BITMAP_BITS: usize = 4 * MSR_RANGE_SIZE as usize;
const MSR_BITMAP_WORDS: usize = words_for(MSR_BITMAP_BITS);

/// The 4K MSR bitmap. (SDM Vol. 3C, Section 25.6.9)
///
/// Four 1K regions: reads of low MSRs, reads of high MSRs, writes of low MSRs,
/// writes of high MSRs. Low MSRs are `0..0x2000`, high MSRs are
/// `0xc000_0000..0xc000_2000`. Accesses to MSRs outside both ranges always exit.
#[derive(Clone, Default)]
pub struct MsrBitmap {
    bits: BitVector<[Word; MSR_BITMAP_WORDS]>,
}

impl MsrBitmap {
    /// A bitmap that lets every MSR access through.
    pub fn passthrough_all() -> Self {
        Self::default()
    }

    /// A bitmap that intercepts every MSR access.
    pub fn intercept_all() -> Self {
        let mut bitmap = Self::default();
        bitmap.set_all(true);
        bitmap
    }

    pub fn set_all(&mut self, intercept: bool) {
        if intercept {
            self.bits.set_all();
        } else {
            self.bits.clear_all();
        }
    }

    fn bit_index(msr: u32, is_write: bool) -> Option<usize> {
        let (region, offset) = match msr {
            MSR_LOW_BASE..0x2000 => (0, msr - MSR_LOW_BASE),
            MSR_HIGH_BASE..0xc000_2000 => (1, msr - MSR_HIGH_BASE),
            _ => return None,
        };
        let region = if is_write { region + 2 } else { region };
        Some(region * MSR_RANGE_SIZE as usize + offset as usize)
    }

    fn set_intercept(&mut self, msr: u32, is_write: bool, intercept: bool) -> AxResult {
        let Some(bit) = Self::bit_index(msr, is_write) else {
            return ax_err!(
                InvalidInput,
                alloc::format!("MSR {msr:#x} is not covered by the MSR bitmap")
            );
        };
        if intercept {
            self.bits.set(bit);
        } else {
            self.bits.clear(bit);
        }
        Ok(())
    }

    pub fn set_read_intercept(&mut self, msr: u32, intercept: bool) -> AxResult {
        self.set_intercept(msr, false, intercept)
    }

    pub fn set_write_intercept(&mut self, msr: u32, intercept: bool) -> AxResult {
        self.set_intercept(msr, true, intercept)
    }

    /// Whether RDMSR of `msr` exits. MSRs outside the bitmap always do.
    pub fn is_read_intercepted(&self, msr: u32) -> bool {
        Self::bit_index(msr, false).is_none_or(|bit| self.bits.test(bit))
    }

    /// Whether WRMSR of `msr` exits. MSRs outside the bitmap always do.
    pub fn is_write_intercepted(&self, msr: u32) -> bool {
        Self::bit_index(msr, true).is_none_or(|bit| self.bits.test(bit))
    }

    pub fn as_words(&self) -> &[Word] {
        self.bits.as_words()
    }
}
