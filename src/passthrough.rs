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

//! A handler that makes every VM exit look, to the guest, as if the
//! instruction had run on bare hardware.

use axaddrspace::device::AccessWidth;
use axerrno::{AxResult, ax_err};
use bit_field::BitField;
use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::registers::rflags::RFlags;

use crate::context::{DescriptorTableRegister, VmExitContext};
use crate::hal::{InvVpidKind, VmExitHal};
use crate::handler::{TerminateReason, VmExitAction, VmExitHandler};
use crate::msr::Msr;
use crate::vmx::{
    CrAccessType, Dr6Flags, Dr7Flags, ExceptionVector, GdtrIdtrInstruction, LdtrTrInstruction,
    VmxInterruptInfo, VmxInterruptionType,
};
use crate::vmx::definitions::DR6_BREAKPOINT_CONDITION;

/// VMCALL with this value in RCX, issued at CPL 0, stops virtualization.
pub const VMCALL_TERMINATE_ID: u64 = 0xDEAD;
/// VMCALL with this value in RCX breaks into the host debugger.
pub const VMCALL_BREAKPOINT_ID: u64 = 0xAABB;

/// DR6 bits that always read as 1.
const DR6_FIXED_1: u64 = 0xffff_0ff0;
/// DR7 bit 10 always reads as 1.
const DR7_FIXED_1: u64 = 1 << 10;
/// DR7 bits 11, 12, 14 and 15 always read as 0.
const DR7_FIXED_0: u64 = 0xd800;

/// Size of a 64-bit pseudo-descriptor as stored by SGDT/SIDT.
const PSEUDO_DESCRIPTOR_SIZE: usize = 10;
/// Busy flag of a TSS descriptor (type bit 1).
const TSS_BUSY_BIT: usize = 41;

/// Re-executes or emulates every trapped operation with its native effect.
///
/// Meant as the base of other handlers: wrap it and forward the hooks you do
/// not override.
pub struct PassthroughHandler<H: VmExitHal> {
    hal: H,
}

impl<H: VmExitHal> PassthroughHandler<H> {
    pub const fn new(hal: H) -> Self {
        Self { hal }
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// Turns an emulation failure into #GP(0), the fault a real processor
    /// raises for the bad operands or memory that cause most of them.
    fn or_general_protection(
        ctx: &VmExitContext,
        result: AxResult<VmExitAction>,
    ) -> VmExitAction {
        result.unwrap_or_else(|err| {
            debug!(
                "Emulating {:?} @ RIP({:#x}) failed: {:?}, injecting #GP(0)",
                ctx.exit_reason(),
                ctx.guest.rip,
                err
            );
            VmExitAction::general_protection()
        })
    }

    fn read_guest<const N: usize>(&self, ctx: &VmExitContext, gva: u64) -> AxResult<[u8; N]> {
        let mut buf = [0; N];
        self.hal.read_guest_memory(ctx.guest.cr3, gva, &mut buf)?;
        Ok(buf)
    }

    fn write_guest(&self, ctx: &VmExitContext, gva: u64, buf: &[u8]) -> AxResult {
        self.hal.write_guest_memory(ctx.guest.cr3, gva, buf)
    }

    fn emulate_io(&self, ctx: &mut VmExitContext) -> AxResult<VmExitAction> {
        let io_info = ctx.io_exit_info();
        let port = io_info.port;
        let width = match io_info.access_size {
            1 => AccessWidth::Byte,
            2 => AccessWidth::Word,
            4 => AccessWidth::Dword,
            size => return ax_err!(InvalidInput, alloc::format!("I/O access of {size} bytes")),
        };
        let size = io_info.access_size as usize;

        if !io_info.is_string {
            if io_info.is_in {
                let value = self.hal.port_read(port, width);
                if width == AccessWidth::Dword {
                    // 32-bit register writes clear the upper half.
                    ctx.regs.rax = value as u64;
                } else {
                    ctx.regs.rax.set_bits(width.bits_range(), value as u64);
                }
            } else {
                let value = ctx.regs.rax.get_bits(width.bits_range()) as u32;
                self.hal.port_write(port, width, value);
            }
            return Ok(VmExitAction::Advance);
        }

        // REP takes its count from CX, ECX or RCX, by address size.
        let count_mask = ctx.instruction_info().address_mask()?;
        let count = if io_info.is_repeat {
            ctx.regs.rcx & count_mask
        } else {
            1
        };
        let backward = ctx.guest.rflags().contains(RFlags::DIRECTION_FLAG);
        let mut addr = if io_info.is_in {
            ctx.regs.rdi
        } else {
            ctx.regs.rsi
        };

        for _ in 0..count {
            let mut buf = [0u8; 4];
            if io_info.is_in {
                let value = self.hal.port_read(port, width);
                buf.copy_from_slice(&value.to_le_bytes());
                self.write_guest(ctx, addr, &buf[..size])?;
            } else {
                self.hal
                    .read_guest_memory(ctx.guest.cr3, addr, &mut buf[..size])?;
                self.hal.port_write(port, width, u32::from_le_bytes(buf));
            }
            addr = if backward {
                addr.wrapping_sub(size as u64)
            } else {
                addr.wrapping_add(size as u64)
            };
        }

        if io_info.is_in {
            ctx.regs.rdi = addr;
        } else {
            ctx.regs.rsi = addr;
        }
        if io_info.is_repeat {
            if count_mask == 0xffff {
                ctx.regs.rcx &= !count_mask;
            } else {
                ctx.regs.rcx = 0;
            }
        }
        Ok(VmExitAction::Advance)
    }

    fn emulate_gdtr_idtr(&self, ctx: &mut VmExitContext) -> AxResult<VmExitAction> {
        let gva = ctx.memory_operand_address()?;
        let instruction = ctx.instruction_info().gdtr_idtr_instruction();

        let store = |table: DescriptorTableRegister| {
            let mut buf = [0u8; PSEUDO_DESCRIPTOR_SIZE];
            buf[0..2].copy_from_slice(&table.limit.to_le_bytes());
            buf[2..10].copy_from_slice(&table.base.to_le_bytes());
            buf
        };
        let load = |buf: [u8; PSEUDO_DESCRIPTOR_SIZE]| DescriptorTableRegister {
            limit: u16::from_le_bytes([buf[0], buf[1]]),
            base: u64::from_le_bytes([
                buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
            ]),
        };

        match instruction {
            GdtrIdtrInstruction::Sgdt => self.write_guest(ctx, gva, &store(ctx.guest.gdtr))?,
            GdtrIdtrInstruction::Sidt => self.write_guest(ctx, gva, &store(ctx.guest.idtr))?,
            GdtrIdtrInstruction::Lgdt => ctx.guest.gdtr = load(self.read_guest(ctx, gva)?),
            GdtrIdtrInstruction::Lidt => ctx.guest.idtr = load(self.read_guest(ctx, gva)?),
        }
        Ok(VmExitAction::Advance)
    }

    fn emulate_ldtr_tr(&self, ctx: &mut VmExitContext) -> AxResult<VmExitAction> {
        let info = ctx.instruction_info();
        let reg = info.reg1();

        match info.ldtr_tr_instruction() {
            instruction @ (LdtrTrInstruction::Sldt | LdtrTrInstruction::Str) => {
                let selector = if instruction == LdtrTrInstruction::Sldt {
                    ctx.guest.ldtr_selector
                } else {
                    ctx.guest.tr_selector
                };
                if info.is_register_operand() {
                    let mut value = ctx.gpr(reg);
                    value.set_bits(0..16, selector as u64);
                    ctx.set_gpr(reg, value);
                } else {
                    let gva = ctx.memory_operand_address()?;
                    self.write_guest(ctx, gva, &selector.to_le_bytes())?;
                }
            }
            instruction @ (LdtrTrInstruction::Lldt | LdtrTrInstruction::Ltr) => {
                let selector = if info.is_register_operand() {
                    ctx.gpr(reg) as u16
                } else {
                    let gva = ctx.memory_operand_address()?;
                    u16::from_le_bytes(self.read_guest(ctx, gva)?)
                };
                if instruction == LdtrTrInstruction::Lldt {
                    ctx.guest.ldtr_selector = selector;
                } else {
                    ctx.guest.tr_selector = selector;
                    // LTR marks the TSS descriptor busy.
                    let descriptor_gva = ctx.guest.gdtr.base.wrapping_add((selector & !0b111) as u64);
                    let mut descriptor = u64::from_le_bytes(self.read_guest(ctx, descriptor_gva)?);
                    descriptor.set_bit(TSS_BUSY_BIT, true);
                    self.write_guest(ctx, descriptor_gva, &descriptor.to_le_bytes())?;
                }
            }
        }
        Ok(VmExitAction::Advance)
    }

    fn emulate_invpcid(&self, ctx: &mut VmExitContext) -> AxResult<VmExitAction> {
        let info = ctx.instruction_info();
        let kind = ctx.gpr(info.reg2());
        if kind > 3 {
            return Ok(VmExitAction::general_protection());
        }

        let gva = ctx.memory_operand_address()?;
        let descriptor: [u8; 16] = self.read_guest(ctx, gva)?;
        let (low, high) = descriptor.split_at(8);
        let mut low_bytes = [0u8; 8];
        low_bytes.copy_from_slice(low);
        let mut high_bytes = [0u8; 8];
        high_bytes.copy_from_slice(high);
        let low = u64::from_le_bytes(low_bytes);
        let linear_address = u64::from_le_bytes(high_bytes);

        let pcid = low.get_bits(0..12);
        if low.get_bits(12..64) != 0 {
            return Ok(VmExitAction::general_protection());
        }
        if kind <= 1 && pcid != 0 && !ctx.guest.cr4_flags().contains(Cr4Flags::PCID) {
            return Ok(VmExitAction::general_protection());
        }

        // INVVPID cannot single out a PCID, so types 1 and 2 drop the whole VPID.
        let vpid = ctx.guest.vpid;
        match kind {
            0 => self
                .hal
                .invvpid(InvVpidKind::IndividualAddress, vpid, linear_address),
            1 | 2 => self.hal.invvpid(InvVpidKind::SingleContext, vpid, 0),
            _ => self
                .hal
                .invvpid(InvVpidKind::SingleContextRetainingGlobals, vpid, 0),
        }
        Ok(VmExitAction::Advance)
    }
}

impl<H: VmExitHal> VmExitHandler for PassthroughHandler<H> {
    fn setup(&mut self, ctx: &mut VmExitContext) -> AxResult {
        ctx.guest.cr0_shadow = ctx.guest.cr0;
        ctx.guest.cr4_shadow = ctx.guest.cr4;
        Ok(())
    }

    fn invoke_termination(&mut self) {
        self.hal.vmcall(VMCALL_TERMINATE_ID);
    }

    fn handle_exception_nmi(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        let intr_info = ctx.exit_interrupt_info();

        if intr_info.int_type == VmxInterruptionType::HardException {
            match intr_info.vector {
                ExceptionVector::DOUBLE_FAULT | ExceptionVector::MACHINE_CHECK => {
                    error!(
                        "Guest {} @ RIP({:#x})",
                        ExceptionVector::name(intr_info.vector),
                        ctx.guest.rip
                    );
                    return VmExitAction::Terminate(TerminateReason::FatalException(
                        intr_info.vector,
                    ));
                }
                ExceptionVector::PAGE_FAULT => self.hal.write_cr2(ctx.exit_qualification),
                _ => {}
            }
        }

        VmExitAction::Inject(VmxInterruptInfo::new(
            intr_info.int_type,
            intr_info.vector,
            intr_info.err_code,
        ))
    }

    fn handle_triple_fault(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        error!("Guest triple fault @ RIP({:#x})", ctx.guest.rip);
        VmExitAction::Terminate(TerminateReason::TripleFault)
    }

    fn handle_invalid_guest_state(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        error!("VM entry failed on guest state: {:#x?}", ctx.exit_info);
        VmExitAction::Terminate(TerminateReason::InvalidGuestState)
    }

    fn handle_msr_load_fail(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        error!("VM entry failed on MSR loading: {:#x?}", ctx.exit_info);
        VmExitAction::Terminate(TerminateReason::InvalidGuestState)
    }

    fn handle_mce_during_vmentry(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        error!("VM entry failed on machine check: {:#x?}", ctx.exit_info);
        VmExitAction::Terminate(TerminateReason::InvalidGuestState)
    }

    fn handle_cpuid(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        let res = self.hal.cpuid(ctx.regs.eax(), ctx.regs.ecx());
        ctx.regs.rax = res.eax as u64;
        ctx.regs.rbx = res.ebx as u64;
        ctx.regs.rcx = res.ecx as u64;
        ctx.regs.rdx = res.edx as u64;
        VmExitAction::Advance
    }

    fn handle_invd(&mut self, _ctx: &mut VmExitContext) -> VmExitAction {
        // INVD would drop dirty lines the host still needs.
        self.hal.wbinvd();
        VmExitAction::Advance
    }

    fn handle_wbinvd(&mut self, _ctx: &mut VmExitContext) -> VmExitAction {
        self.hal.wbinvd();
        VmExitAction::Advance
    }

    fn handle_invlpg(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        self.hal.invvpid(
            InvVpidKind::IndividualAddress,
            ctx.guest.vpid,
            ctx.exit_qualification,
        );
        VmExitAction::Advance
    }

    fn handle_rdtsc(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        ctx.regs.set_edx_eax(self.hal.rdtsc());
        VmExitAction::Advance
    }

    fn handle_rdtscp(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        let (tsc, aux) = self.hal.rdtscp();
        ctx.regs.set_edx_eax(tsc);
        ctx.regs.rcx = aux as u64;
        VmExitAction::Advance
    }

    fn handle_vmcall(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        match ctx.regs.rcx {
            VMCALL_TERMINATE_ID if ctx.guest.cpl() == 0 => {
                info!("Guest requested termination @ RIP({:#x})", ctx.guest.rip);
                VmExitAction::Terminate(TerminateReason::GuestRequest)
            }
            VMCALL_BREAKPOINT_ID => {
                self.hal.debug_break();
                VmExitAction::Advance
            }
            _ => self.handle_vm_fallback(ctx),
        }
    }

    fn handle_cr_access(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        let cr_access_info = ctx.cr_access_info();
        let reg = cr_access_info.gpr;
        let cr = cr_access_info.cr_number;

        match cr_access_info.access_type {
            CrAccessType::MovToCr => {
                let value = ctx.gpr(reg);
                match cr {
                    0 => {
                        ctx.guest.cr0 = value;
                        ctx.guest.cr0_shadow = value;
                    }
                    3 => {
                        let mut cr3 = value;
                        // Bit 63 only selects whether to flush, it is never stored.
                        if ctx.guest.cr4_flags().contains(Cr4Flags::PCID) {
                            cr3.set_bit(63, false);
                        }
                        ctx.guest.cr3 = cr3;
                        self.hal.invvpid(
                            InvVpidKind::SingleContextRetainingGlobals,
                            ctx.guest.vpid,
                            0,
                        );
                    }
                    4 => {
                        let old = ctx.guest.cr4_flags();
                        let new = Cr4Flags::from_bits_truncate(value);
                        if old.contains(Cr4Flags::PAGE_GLOBAL) != new.contains(Cr4Flags::PAGE_GLOBAL)
                        {
                            self.hal
                                .invvpid(InvVpidKind::SingleContext, ctx.guest.vpid, 0);
                        }
                        ctx.guest.cr4 = value;
                        ctx.guest.cr4_shadow = value;
                    }
                    _ => trace!("MOV to CR{} ignored", cr),
                }
            }
            CrAccessType::MovFromCr => match cr {
                3 => ctx.set_gpr(reg, ctx.guest.cr3),
                _ => trace!("MOV from CR{} ignored", cr),
            },
            CrAccessType::Clts => {
                let cr0 = ctx.guest.cr0_flags() - Cr0Flags::TASK_SWITCHED;
                ctx.guest.cr0 = cr0.bits();
                ctx.guest.cr0_shadow = cr0.bits();
            }
            CrAccessType::Lmsw => {
                // Loads PE, MP, EM and TS, but never clears PE.
                let msw = cr_access_info.lmsw_source_data as u64;
                let mut cr0 = ctx.guest.cr0;
                cr0 &= !0b1110;
                cr0 |= msw & 0b1111;
                ctx.guest.cr0 = cr0;
                ctx.guest.cr0_shadow = cr0;
            }
        }
        VmExitAction::Advance
    }

    fn handle_dr_access(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        let dr_access_info = ctx.dr_access_info();
        let reg = dr_access_info.gpr;

        // MOV DR exits take priority over the privilege check.
        if ctx.guest.cs_dpl() != 0 {
            return VmExitAction::general_protection();
        }

        let mut dr = dr_access_info.dr_number;
        if dr == 4 || dr == 5 {
            if ctx
                .guest
                .cr4_flags()
                .contains(Cr4Flags::DEBUGGING_EXTENSIONS)
            {
                return VmExitAction::invalid_opcode();
            }
            dr += 2;
        }

        if Dr7Flags::from_bits_truncate(ctx.guest.dr7).contains(Dr7Flags::GD) {
            let mut dr6 = Dr6Flags::from_bits_retain(self.hal.read_dr(6));
            dr6.remove(DR6_BREAKPOINT_CONDITION);
            dr6.insert(Dr6Flags::BD);
            self.hal.write_dr(6, dr6.bits());
            ctx.guest.dr7 &= !Dr7Flags::GD.bits();
            return VmExitAction::Inject(VmxInterruptInfo::exception(ExceptionVector::DEBUG, 0));
        }

        if dr_access_info.is_read {
            let value = match dr {
                7 => ctx.guest.dr7,
                _ => self.hal.read_dr(dr),
            };
            ctx.set_gpr(reg, value);
        } else {
            let value = ctx.gpr(reg);
            if (dr == 6 || dr == 7) && value.get_bits(32..64) != 0 {
                return VmExitAction::general_protection();
            }
            match dr {
                0..=3 => self.hal.write_dr(dr, value),
                6 => self.hal.write_dr(6, value | DR6_FIXED_1),
                _ => ctx.guest.dr7 = (value | DR7_FIXED_1) & !DR7_FIXED_0,
            }
        }
        VmExitAction::Advance
    }

    fn handle_io_instruction(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        let result = self.emulate_io(ctx);
        Self::or_general_protection(ctx, result)
    }

    fn handle_msr_read(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        let msr = ctx.regs.ecx();
        let guest_value = Msr::try_from(msr)
            .ok()
            .and_then(|msr| ctx.guest.msr_mut(msr).map(|value| *value));
        let value = match guest_value {
            Some(value) => value,
            None => match self.hal.read_msr(msr) {
                Ok(value) => value,
                Err(_) => return VmExitAction::general_protection(),
            },
        };
        ctx.regs.set_edx_eax(value);
        VmExitAction::Advance
    }

    fn handle_msr_write(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        let msr = ctx.regs.ecx();
        let value = ctx.regs.get_edx_eax();

        match Msr::try_from(msr) {
            Ok(Msr::IA32_FEATURE_CONTROL) => {
                warn!("Guest tried to write IA32_FEATURE_CONTROL: {:#x}", value);
                return VmExitAction::general_protection();
            }
            Ok(known) => {
                if let Some(slot) = ctx.guest.msr_mut(known) {
                    *slot = value;
                    return VmExitAction::Advance;
                }
            }
            Err(_) => {}
        }

        match self.hal.write_msr(msr, value) {
            Ok(()) => VmExitAction::Advance,
            Err(_) => VmExitAction::general_protection(),
        }
    }

    fn handle_gdtr_idtr(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        let result = self.emulate_gdtr_idtr(ctx);
        Self::or_general_protection(ctx, result)
    }

    fn handle_ldtr_tr(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        let result = self.emulate_ldtr_tr(ctx);
        Self::or_general_protection(ctx, result)
    }

    fn handle_xsetbv(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        match self.hal.xsetbv(ctx.regs.ecx(), ctx.regs.get_edx_eax()) {
            Ok(()) => VmExitAction::Advance,
            Err(_) => VmExitAction::general_protection(),
        }
    }

    fn handle_invpcid(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        let result = self.emulate_invpcid(ctx);
        Self::or_general_protection(ctx, result)
    }

    fn handle_ept_violation(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        let ept_info = ctx.ept_violation_info();
        error!(
            "Unhandled EPT violation @ RIP({:#x}): {:#x?}",
            ctx.guest.rip, ept_info
        );
        VmExitAction::Terminate(TerminateReason::UnhandledEptViolation(ept_info.guest_paddr))
    }

    fn handle_ept_misconfig(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        error!(
            "EPT misconfiguration at GPA {:#x}",
            ctx.guest_physical_address
        );
        VmExitAction::Terminate(TerminateReason::Unhandled(ctx.exit_info.raw_reason))
    }
}

