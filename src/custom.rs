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

//! A handler built on [`PassthroughHandler`] that lets the guest hide code
//! pages: reads see one page, instruction fetches another.

use axaddrspace::{GuestPhysAddr, HostPhysAddr, MappingFlags};
use axerrno::AxResult;
use memory_addr::MemoryAddr;

use crate::context::VmExitContext;
use crate::hal::VmExitHal;
use crate::handler::{VmExitAction, VmExitHandler};
use crate::passthrough::PassthroughHandler;
use crate::vmx::{IoBitmap, MsrBitmap};

/// CPUID leaf answered with [`HOOK_SIGNATURE`], so the guest can detect the
/// handler before issuing hook hypercalls.
pub const HOOK_SIGNATURE_LEAF: u32 = 0x4000_00c1;
/// Returned in EAX, EBX, ECX and EDX for [`HOOK_SIGNATURE_LEAF`].
pub const HOOK_SIGNATURE: [u8; 16] = *b"x86_vmexit hooks";

/// VMCALL number that hides a page: RDX is the guest virtual address of the
/// page reads should see, R8 the one instruction fetches should see.
pub const VMCALL_HOOK_PAGE: u64 = 0xc1;
/// VMCALL number that restores the page R8 points at.
pub const VMCALL_UNHOOK_PAGE: u64 = 0xc2;

/// Pages one handler can track at a time.
pub const TRACKED_PAGE_CAPACITY: usize = 32;

/// A guest page whose reads are redirected to a companion page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedPage {
    /// The page seen by data accesses.
    pub page_read: GuestPhysAddr,
    /// The page seen by instruction fetches. Also the page the entry is
    /// keyed by.
    pub page_exec: GuestPhysAddr,
}

/// Hides guest code pages behind execute-only EPT mappings; every other exit
/// is passed through.
pub struct CustomHandler<H: VmExitHal> {
    passthrough: PassthroughHandler<H>,
    tracked: [Option<TrackedPage>; TRACKED_PAGE_CAPACITY],
    io_bitmap: IoBitmap,
    msr_bitmap: MsrBitmap,
}

// Guest physical memory is identity mapped.
fn identity(gpa: GuestPhysAddr) -> HostPhysAddr {
    HostPhysAddr::from_usize(gpa.as_usize())
}

impl<H: VmExitHal> CustomHandler<H> {
    pub fn new(hal: H) -> Self {
        Self {
            passthrough: PassthroughHandler::new(hal),
            tracked: [None; TRACKED_PAGE_CAPACITY],
            io_bitmap: IoBitmap::passthrough_all(),
            msr_bitmap: MsrBitmap::passthrough_all(),
        }
    }

    pub fn hal(&self) -> &H {
        self.passthrough.hal()
    }

    /// The entry tracking the execute page containing `gpa`.
    pub fn tracked_page(&self, gpa: GuestPhysAddr) -> Option<&TrackedPage> {
        let page = gpa.align_down_4k();
        self.tracked.iter().flatten().find(|p| p.page_exec == page)
    }

    pub fn tracked_pages(&self) -> impl Iterator<Item = &TrackedPage> {
        self.tracked.iter().flatten()
    }

    fn translate_page(&self, ctx: &VmExitContext, gva: u64) -> AxResult<GuestPhysAddr> {
        let gpa = self.hal().translate_guest_va(ctx.guest.cr3, gva)?;
        Ok(gpa.align_down_4k())
    }

    fn remap(&self, gpa: GuestPhysAddr, hpa: HostPhysAddr, flags: MappingFlags) -> AxResult {
        self.hal().ept_map_4k(gpa, hpa, flags)?;
        self.hal().invept_single_context();
        Ok(())
    }

    fn hook_page(&mut self, ctx: &VmExitContext) -> AxResult<VmExitAction> {
        let page_read = self.translate_page(ctx, ctx.regs.rdx)?;
        let page_exec = self.translate_page(ctx, ctx.regs.r8)?;

        let slot = match self
            .tracked
            .iter()
            .position(|p| p.is_some_and(|p| p.page_exec == page_exec))
        {
            Some(index) => Some(index),
            None => self.tracked.iter().position(Option::is_none),
        };
        let Some(index) = slot else {
            warn!(
                "No room to track page {:#x}, {} pages tracked",
                page_exec, TRACKED_PAGE_CAPACITY
            );
            return Ok(VmExitAction::Advance);
        };
        // Only track the page once the EPT agrees with the table.
        self.remap(page_exec, identity(page_exec), MappingFlags::EXECUTE)?;
        self.tracked[index] = Some(TrackedPage {
            page_read,
            page_exec,
        });

        info!("Hooked page {:#x}, reads from {:#x}", page_exec, page_read);
        Ok(VmExitAction::Advance)
    }

    fn unhook_page(&mut self, ctx: &VmExitContext) -> AxResult<VmExitAction> {
        let page_exec = self.translate_page(ctx, ctx.regs.r8)?;

        self.remap(
            page_exec,
            identity(page_exec),
            MappingFlags::READ | MappingFlags::WRITE | MappingFlags::EXECUTE,
        )?;
        for slot in self.tracked.iter_mut() {
            if slot.is_some_and(|p| p.page_exec == page_exec) {
                *slot = None;
            }
        }

        info!("Unhooked page {:#x}", page_exec);
        Ok(VmExitAction::Advance)
    }
}

impl<H: VmExitHal> VmExitHandler for CustomHandler<H> {
    fn setup(&mut self, ctx: &mut VmExitContext) -> AxResult {
        self.passthrough.setup(ctx)?;
        self.io_bitmap.set_all(true);
        self.msr_bitmap.set_all(true);
        self.hal().load_io_bitmap(&self.io_bitmap);
        self.hal().load_msr_bitmap(&self.msr_bitmap);
        Ok(())
    }

    fn invoke_termination(&mut self) {
        self.passthrough.invoke_termination();
    }

    fn handle_cpuid(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        if ctx.regs.eax() != HOOK_SIGNATURE_LEAF {
            return self.passthrough.handle_cpuid(ctx);
        }

        let word = |i: usize| {
            u32::from_le_bytes([
                HOOK_SIGNATURE[i * 4],
                HOOK_SIGNATURE[i * 4 + 1],
                HOOK_SIGNATURE[i * 4 + 2],
                HOOK_SIGNATURE[i * 4 + 3],
            ]) as u64
        };
        ctx.regs.rax = word(0);
        ctx.regs.rbx = word(1);
        ctx.regs.rcx = word(2);
        ctx.regs.rdx = word(3);
        VmExitAction::Advance
    }

    fn handle_vmcall(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        let result = match ctx.regs.rcx {
            VMCALL_HOOK_PAGE => self.hook_page(ctx),
            VMCALL_UNHOOK_PAGE => self.unhook_page(ctx),
            _ => return self.passthrough.handle_vmcall(ctx),
        };
        result.unwrap_or_else(|err| {
            warn!(
                "Hook hypercall {:#x} @ RIP({:#x}) failed: {:?}",
                ctx.regs.rcx, ctx.guest.rip, err
            );
            VmExitAction::general_protection()
        })
    }

    fn handle_ept_violation(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        let ept_info = ctx.ept_violation_info();
        let Some(page) = self.tracked_page(ept_info.guest_paddr).copied() else {
            return self.passthrough.handle_ept_violation(ctx);
        };

        let result = if ept_info.is_read() || ept_info.is_write() {
            trace!(
                "Data access to {:#x}, showing {:#x}",
                ept_info.guest_paddr, page.page_read
            );
            self.remap(
                page.page_exec,
                identity(page.page_read),
                MappingFlags::READ | MappingFlags::WRITE,
            )
        } else {
            trace!("Instruction fetch from {:#x}", ept_info.guest_paddr);
            self.remap(page.page_exec, identity(page.page_exec), MappingFlags::EXECUTE)
        };

        match result {
            Ok(()) => VmExitAction::Resume,
            Err(err) => {
                warn!("Remapping {:#x} failed: {:?}", page.page_exec, err);
                self.passthrough.handle_ept_violation(ctx)
            }
        }
    }

    fn handle_fallback(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        self.passthrough.dispatch(ctx)
    }

    fn handle_vm_fallback(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
        self.passthrough.dispatch(ctx)
    }
}
