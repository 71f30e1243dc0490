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

use axaddrspace::GuestPhysAddr;
use axerrno::AxResult;
use bit_field::BitField;
use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::registers::rflags::RFlags;

use crate::ept::EptViolationInfo;
use crate::msr::Msr;
use crate::regs::GeneralRegisters;
use crate::vmx::{
    CrAccessInfo, DrAccessInfo, InstructionInfo, SegmentRegister, VmxExitInfo, VmxExitReason,
    VmxInterruptInfo, VmxIoExitInfo,
};

/// Base and limit of the guest GDTR or IDTR.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTableRegister {
    pub base: u64,
    pub limit: u16,
}

/// The guest-state fields a trap handler may read or write.
///
/// The engine loads these from the VMCS before dispatch and writes back the
/// ones a handler changed before resuming the guest.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestState {
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,

    pub cr0: u64,
    /// CR0 read shadow, the value the guest believes it has.
    pub cr0_shadow: u64,
    pub cr3: u64,
    pub cr4: u64,
    /// CR4 read shadow.
    pub cr4_shadow: u64,

    pub dr7: u64,
    pub debugctl: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,

    pub gdtr: DescriptorTableRegister,
    pub idtr: DescriptorTableRegister,

    pub cs_selector: u16,
    pub cs_access_rights: u32,
    pub ldtr_selector: u16,
    pub tr_selector: u16,

    /// VPID tagging the guest's TLB entries.
    pub vpid: u16,
}

impl GuestState {
    /// Current privilege level, from the RPL of CS.
    pub fn cpl(&self) -> u8 {
        (self.cs_selector & 0b11) as u8
    }

    /// Descriptor privilege level of the guest CS.
    pub fn cs_dpl(&self) -> u8 {
        self.cs_access_rights.get_bits(5..7) as u8
    }

    /// Whether the guest executes 64-bit code (CS.L).
    pub fn is_64bit_code(&self) -> bool {
        self.cs_access_rights.get_bit(13)
    }

    pub fn cr0_flags(&self) -> Cr0Flags {
        Cr0Flags::from_bits_truncate(self.cr0)
    }

    pub fn cr4_flags(&self) -> Cr4Flags {
        Cr4Flags::from_bits_truncate(self.cr4)
    }

    pub fn rflags(&self) -> RFlags {
        RFlags::from_bits_truncate(self.rflags)
    }

    /// The guest-state field backing `msr`, for MSRs the processor swaps on
    /// VM entry and exit rather than leaving to the host.
    pub fn msr_mut(&mut self, msr: Msr) -> Option<&mut u64> {
        match msr {
            Msr::IA32_SYSENTER_CS => Some(&mut self.sysenter_cs),
            Msr::IA32_SYSENTER_ESP => Some(&mut self.sysenter_esp),
            Msr::IA32_SYSENTER_EIP => Some(&mut self.sysenter_eip),
            Msr::IA32_DEBUGCTL => Some(&mut self.debugctl),
            Msr::IA32_FS_BASE => Some(&mut self.fs_base),
            Msr::IA32_GS_BASE => Some(&mut self.gs_base),
            _ => None,
        }
    }
}

/// Everything the engine captured about one VM exit, plus the effects the
/// handler chain wants applied before the next VM entry.
#[derive(Debug, Clone)]
pub struct VmExitContext {
    pub exit_info: VmxExitInfo,
    pub exit_qualification: u64,
    pub exit_interrupt_info: u32,
    pub exit_interrupt_error_code: u32,
    pub exit_instruction_info: u32,
    pub guest_linear_address: u64,
    pub guest_physical_address: u64,

    pub regs: GeneralRegisters,
    pub guest: GuestState,

    /// Event to inject on the next VM entry.
    pub entry_event: Option<VmxInterruptInfo>,
    /// VM-entry instruction length, used by software interrupts and exceptions.
    pub entry_instruction_length: u32,
}

impl VmExitContext {
    /// A context with zeroed registers and exit fields for the given exit.
    pub fn new(exit_info: VmxExitInfo) -> Self {
        Self {
            exit_info,
            exit_qualification: 0,
            exit_interrupt_info: 0,
            exit_interrupt_error_code: 0,
            exit_instruction_info: 0,
            guest_linear_address: 0,
            guest_physical_address: 0,
            regs: GeneralRegisters::default(),
            guest: GuestState {
                rip: exit_info.guest_rip as u64,
                ..Default::default()
            },
            entry_event: None,
            entry_instruction_length: 0,
        }
    }

    /// The basic exit reason, `None` for reserved values.
    pub fn exit_reason(&self) -> Option<VmxExitReason> {
        self.exit_info.exit_reason()
    }

    pub fn exit_qualification(&self) -> u64 {
        self.exit_qualification
    }

    pub fn registers(&self) -> &GeneralRegisters {
        &self.regs
    }

    pub fn registers_mut(&mut self) -> &mut GeneralRegisters {
        &mut self.regs
    }

    pub fn exit_instruction_length(&self) -> u32 {
        self.exit_info.exit_instruction_length
    }

    /// Decoded exit interruption information.
    pub fn exit_interrupt_info(&self) -> VmxInterruptInfo {
        VmxInterruptInfo::decode(self.exit_interrupt_info, self.exit_interrupt_error_code)
    }

    pub fn instruction_info(&self) -> InstructionInfo {
        InstructionInfo(self.exit_instruction_info)
    }

    pub fn cr_access_info(&self) -> CrAccessInfo {
        CrAccessInfo::from_qualification(self.exit_qualification)
    }

    pub fn dr_access_info(&self) -> DrAccessInfo {
        DrAccessInfo::from_qualification(self.exit_qualification)
    }

    pub fn io_exit_info(&self) -> VmxIoExitInfo {
        VmxIoExitInfo::from_qualification(self.exit_qualification)
    }

    pub fn ept_violation_info(&self) -> EptViolationInfo {
        EptViolationInfo::new(
            self.exit_qualification,
            GuestPhysAddr::from_usize(self.guest_physical_address as usize),
            self.guest_linear_address,
        )
    }

    /// Reads a general-purpose register by its x86 number, RSP included.
    pub fn gpr(&self, index: u8) -> u64 {
        match index & 0xf {
            4 => self.guest.rsp,
            i => self.regs.get_reg_of_index(i),
        }
    }

    /// Writes a general-purpose register by its x86 number, RSP included.
    pub fn set_gpr(&mut self, index: u8, value: u64) {
        match index & 0xf {
            4 => self.guest.rsp = value,
            i => self.regs.set_reg_of_index(i, value),
        }
    }

    /// Queues `event` for injection on the next VM entry.
    pub fn inject(&mut self, event: VmxInterruptInfo) {
        self.entry_event = Some(event);
    }

    /// Moves the guest past the exiting instruction.
    pub fn advance_rip(&mut self) {
        self.guest.rip = self
            .guest
            .rip
            .wrapping_add(self.exit_info.exit_instruction_length as u64);
    }

    /// Linear address of the memory operand described by the instruction
    /// information field, with the displacement taken from the exit
    /// qualification.
    pub fn memory_operand_address(&self) -> AxResult<u64> {
        let info = self.instruction_info();
        let mask = info.address_mask()?;

        let base = info.base_reg().map_or(0, |reg| self.gpr(reg));
        let index = info.index_reg().map_or(0, |reg| self.gpr(reg));
        let displacement = self.exit_qualification;

        // Only FS and GS carry a base in 64-bit mode.
        let segment_base = match info.segment()? {
            SegmentRegister::FS if self.guest.is_64bit_code() => self.guest.fs_base,
            SegmentRegister::GS if self.guest.is_64bit_code() => self.guest.gs_base,
            _ => 0,
        };

        let offset = base
            .wrapping_add(index.wrapping_mul(info.scale()))
            .wrapping_add(displacement)
            & mask;
        Ok(segment_base.wrapping_add(offset))
    }
}
