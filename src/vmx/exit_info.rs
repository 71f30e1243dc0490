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

//! Decoders for the VM-exit information fields.

use axerrno::{AxResult, ax_err};
use bit_field::BitField;

use super::definitions::{VmxExitReason, VmxInterruptionType};

/// VM-Exit Informations. (SDM Vol. 3C, Section 24.9.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxExitInfo {
    /// VM-entry failure. (0 = true VM exit; 1 = VM-entry failure)
    pub entry_failure: bool,
    /// Basic exit reason, kept raw so reserved values survive decoding.
    pub raw_reason: u32,
    /// For VM exits resulting from instruction execution, this field receives
    /// the length in bytes of the instruction whose execution led to the VM exit.
    pub exit_instruction_length: u32,
    /// Guest `RIP` where the VM exit occurs.
    pub guest_rip: usize,
}

impl VmxExitInfo {
    /// Decodes the full 32-bit exit reason field.
    pub fn new(full_reason: u32, exit_instruction_length: u32, guest_rip: usize) -> Self {
        Self {
            entry_failure: full_reason.get_bit(31),
            raw_reason: full_reason.get_bits(0..16),
            exit_instruction_length,
            guest_rip,
        }
    }

    /// The basic exit reason, or `None` for reserved or unknown values.
    pub fn exit_reason(&self) -> Option<VmxExitReason> {
        VmxExitReason::try_from(self.raw_reason).ok()
    }
}

/// VM-Entry/VM-Exit Interruption-Information Field. (SDM Vol. 3C, Section 24.8.3, 24.9.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxInterruptInfo {
    /// Vector of interrupt or exception.
    pub vector: u8,
    /// Determines details of how the injection is performed.
    pub int_type: VmxInterruptionType,
    /// For hardware exceptions that would have delivered an error code on the stack.
    pub err_code: Option<u32>,
    /// Whether the field is valid.
    pub valid: bool,
}

impl VmxInterruptInfo {
    /// An event of an explicit type, e.g. re-injecting a software exception.
    pub fn new(int_type: VmxInterruptionType, vector: u8, err_code: Option<u32>) -> Self {
        Self {
            vector,
            int_type,
            err_code,
            valid: true,
        }
    }

    /// Hardware exception with its architectural error code, if it has one.
    pub fn exception(vector: u8, err_code: u32) -> Self {
        let err_code = VmxInterruptionType::vector_has_error_code(vector).then_some(err_code);
        Self::new(VmxInterruptionType::HardException, vector, err_code)
    }

    /// Decodes the exit interruption-information field along with the exit
    /// interruption error code.
    pub fn decode(info: u32, error_code: u32) -> Self {
        // Three bits always map onto a variant.
        let int_type = VmxInterruptionType::try_from(info.get_bits(8..11) as u8)
            .unwrap_or(VmxInterruptionType::Other);
        Self {
            vector: info.get_bits(0..8) as u8,
            int_type,
            err_code: info.get_bit(11).then_some(error_code),
            valid: info.get_bit(31),
        }
    }

    /// Raw bits for writing to VMCS.
    pub fn bits(&self) -> u32 {
        let mut bits = self.vector as u32;
        bits |= (self.int_type as u32) << 8;
        bits.set_bit(11, self.err_code.is_some());
        bits.set_bit(31, self.valid);
        bits
    }
}

numeric_enum_macro::numeric_enum! {
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Access type of a control-register access exit.
pub enum CrAccessType {
    MovToCr = 0,
    MovFromCr = 1,
    Clts = 2,
    Lmsw = 3,
}
}

/// Exit Qualification for Control-Register Accesses. (SDM Vol. 3C, Section 28.2.1, Table 28-3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrAccessInfo {
    /// Number of control register
    pub cr_number: u8,
    /// Access type
    pub access_type: CrAccessType,
    /// LMSW operand type, `true` for a memory operand.
    pub lmsw_op_type: bool,
    /// For MOV CR, the general-purpose register
    pub gpr: u8,
    /// For LMSW, the LMSW source data
    pub lmsw_source_data: u16,
}

impl CrAccessInfo {
    pub fn from_qualification(qualification: u64) -> Self {
        let access_type = match qualification.get_bits(4..6) {
            0 => CrAccessType::MovToCr,
            1 => CrAccessType::MovFromCr,
            2 => CrAccessType::Clts,
            _ => CrAccessType::Lmsw,
        };
        Self {
            cr_number: qualification.get_bits(0..4) as u8,
            access_type,
            lmsw_op_type: qualification.get_bit(6),
            gpr: qualification.get_bits(8..12) as u8,
            lmsw_source_data: qualification.get_bits(16..32) as u16,
        }
    }
}

/// Exit Qualification for MOV DR. (SDM Vol. 3C, Section 28.2.1, Table 28-4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrAccessInfo {
    pub dr_number: u8,
    /// `true` for MOV from DR, `false` for MOV to DR.
    pub is_read: bool,
    pub gpr: u8,
}

impl DrAccessInfo {
    pub fn from_qualification(qualification: u64) -> Self {
        Self {
            dr_number: qualification.get_bits(0..3) as u8,
            is_read: qualification.get_bit(4),
            gpr: qualification.get_bits(8..12) as u8,
        }
    }
}

/// Exit Qualification for I/O Instructions. (SDM Vol. 3C, Section 28.2.1, Table 28-5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxIoExitInfo {
    /// Size of access.
    pub access_size: u8,
    /// Direction of the attempted access (0 = OUT, 1 = IN).
    pub is_in: bool,
    /// String instruction (0 = not string; 1 = string).
    pub is_string: bool,
    /// REP prefixed (0 = not REP; 1 = REP).
    pub is_repeat: bool,
    /// Port number. (as specified in DX or in an immediate operand)
    pub port: u16,
}

impl VmxIoExitInfo {
    pub fn from_qualification(qualification: u64) -> Self {
        Self {
            access_size: qualification.get_bits(0..3) as u8 + 1,
            is_in: qualification.get_bit(3),
            is_string: qualification.get_bit(4),
            is_repeat: qualification.get_bit(5),
            port: qualification.get_bits(16..32) as u16,
        }
    }
}

numeric_enum_macro::numeric_enum! {
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Instruction identity of a descriptor-table exit for GDTR/IDTR.
pub enum GdtrIdtrInstruction {
    Sgdt = 0,
    Sidt = 1,
    Lgdt = 2,
    Lidt = 3,
}
}

numeric_enum_macro::numeric_enum! {
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Instruction identity of a descriptor-table exit for LDTR/TR.
pub enum LdtrTrInstruction {
    Sldt = 0,
    Str = 1,
    Lldt = 2,
    Ltr = 3,
}
}

numeric_enum_macro::numeric_enum! {
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Segment register encoding used by the VM-exit instruction-information field.
pub enum SegmentRegister {
    ES = 0,
    CS = 1,
    SS = 2,
    DS = 3,
    FS = 4,
    GS = 5,
}
}

/// VM-Exit Instruction-Information Field. (SDM Vol. 3C, Section 28.2.5)
///
/// The layout depends on the exit reason. The accessors below cover the
/// memory-operand encoding shared by descriptor-table, INVEPT, INVPCID and
/// INVVPID exits.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct InstructionInfo(pub u32);

impl InstructionInfo {
    /// Scale factor applied to the index register: 1, 2, 4 or 8.
    pub fn scale(&self) -> u64 {
        1 << self.0.get_bits(0..2)
    }

    /// Address size in bits.
    pub fn address_size(&self) -> AxResult<u32> {
        match self.0.get_bits(7..10) {
            0 => Ok(16),
            1 => Ok(32),
            2 => Ok(64),
            v => ax_err!(InvalidInput, alloc::format!("Invalid address size {v}")),
        }
    }

    /// Mask applied to effective addresses of this address size.
    pub fn address_mask(&self) -> AxResult<u64> {
        Ok(match self.address_size()? {
            16 => 0xffff,
            32 => 0xffff_ffff,
            _ => u64::MAX,
        })
    }

    pub fn segment(&self) -> AxResult<SegmentRegister> {
        let raw = self.0.get_bits(15..18) as u8;
        SegmentRegister::try_from(raw)
            .or_else(|_| ax_err!(InvalidInput, alloc::format!("Invalid segment {raw}")))
    }

    /// Index register, `None` when the operand has no index.
    pub fn index_reg(&self) -> Option<u8> {
        (!self.0.get_bit(22)).then(|| self.0.get_bits(18..22) as u8)
    }

    /// Base register, `None` when the operand has no base.
    pub fn base_reg(&self) -> Option<u8> {
        (!self.0.get_bit(27)).then(|| self.0.get_bits(23..27) as u8)
    }

    /// Register operand of SLDT/STR/LLDT/LTR when [`Self::is_register_operand`].
    pub fn reg1(&self) -> u8 {
        self.0.get_bits(3..7) as u8
    }

    /// Whether LDTR/TR instructions use a register rather than a memory operand.
    pub fn is_register_operand(&self) -> bool {
        self.0.get_bit(10)
    }

    /// Register operand of INVEPT/INVPCID/INVVPID.
    pub fn reg2(&self) -> u8 {
        self.0.get_bits(28..32) as u8
    }

    pub fn gdtr_idtr_instruction(&self) -> GdtrIdtrInstruction {
        match self.0.get_bits(28..30) {
            0 => GdtrIdtrInstruction::Sgdt,
            1 => GdtrIdtrInstruction::Sidt,
            2 => GdtrIdtrInstruction::Lgdt,
            _ => GdtrIdtrInstruction::Lidt,
        }
    }

    pub fn ldtr_tr_instruction(&self) -> LdtrTrInstruction {
        match self.0.get_bits(28..30) {
            0 => LdtrTrInstruction::Sldt,
            1 => LdtrTrInstruction::Str,
            2 => LdtrTrInstruction::Lldt,
            _ => LdtrTrInstruction::Ltr,
        }
    }
}

impl core::fmt::Debug for InstructionInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InstructionInfo")
            .field("raw", &format_args!("{:#x}", self.0))
            .field("scale", &self.scale())
            .field("address_size", &self.address_size().ok())
            .field("segment", &self.segment().ok())
            .field("index", &self.index_reg())
            .field("base", &self.base_reg())
            .finish()
    }
}
