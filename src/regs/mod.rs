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

mod diff;

pub use diff::GeneralRegistersDiff;

use bit_field::BitField;

/// General-purpose registers of a guest, saved by the engine on VM exit.
///
/// The layout follows the x86 register numbering used by exit qualifications.
/// The RSP slot is unused: the guest stack pointer lives in the guest-state
/// area, see [`GuestState::rsp`](crate::GuestState).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    _unused_rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

macro_rules! low_dword_accessors {
    ($($reg:ident => $get:ident, $set:ident;)*) => {
        $(
            #[doc = concat!("Low 32 bits of `", stringify!($reg), "`.")]
            pub fn $get(&self) -> u32 {
                self.$reg as u32
            }

            #[doc = concat!("Writes the low 32 bits of `", stringify!($reg), "`, zeroing the upper half.")]
            pub fn $set(&mut self, value: u32) {
                self.$reg = value as u64;
            }
        )*
    };
}

impl GeneralRegisters {
    /// Register names indexed by x86 register number.
    pub const REGISTER_NAMES: [&'static str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];

    /// Returns the name of the register with the given x86 register number.
    pub fn register_name(index: u8) -> &'static str {
        Self::REGISTER_NAMES[index as usize]
    }

    /// Returns the value of the register with the given x86 register number.
    ///
    /// # Panics
    ///
    /// Panics on index 4 (RSP is not stored here) and on indices above 15.
    pub fn get_reg_of_index(&self, index: u8) -> u64 {
        match index {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => panic!("Illegal index of GeneralRegisters {}", index),
        }
    }

    /// Sets the value of the register with the given x86 register number.
    ///
    /// # Panics
    ///
    /// Panics on index 4 (RSP is not stored here) and on indices above 15.
    pub fn set_reg_of_index(&mut self, index: u8, value: u64) {
        match index {
            0 => self.rax = value,
            1 => self.rcx = value,
            2 => self.rdx = value,
            3 => self.rbx = value,
            5 => self.rbp = value,
            6 => self.rsi = value,
            7 => self.rdi = value,
            8 => self.r8 = value,
            9 => self.r9 = value,
            10 => self.r10 = value,
            11 => self.r11 = value,
            12 => self.r12 = value,
            13 => self.r13 = value,
            14 => self.r14 = value,
            15 => self.r15 = value,
            _ => panic!("Illegal index of GeneralRegisters {}", index),
        }
    }

    low_dword_accessors! {
        rax => eax, set_eax;
        rcx => ecx, set_ecx;
        rdx => edx, set_edx;
        rbx => ebx, set_ebx;
    }

    /// `EDX:EAX` as one 64-bit value.
    pub fn get_edx_eax(&self) -> u64 {
        (self.rdx.get_bits(0..32) << 32) | self.rax.get_bits(0..32)
    }

    /// Splits `value` into `EDX:EAX`, zeroing the upper halves of RDX and RAX.
    pub fn set_edx_eax(&mut self, value: u64) {
        self.rax = value.get_bits(0..32);
        self.rdx = value.get_bits(32..64);
    }
}
