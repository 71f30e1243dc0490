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

use axaddrspace::device::AccessWidth;
use axaddrspace::{GuestPhysAddr, HostPhysAddr, MappingFlags};
use axerrno::{AxResult, ax_err};
use raw_cpuid::{CpuIdResult, cpuid};

use super::bitmap::{IoBitmap, MsrBitmap};
use super::instructions::{self, InvEptType};
use crate::hal::{InvVpidKind, VmExitHal};

/// The parts of the platform that belong to the VMX engine rather than to
/// the processor: guest memory access, EPT management and the VMCS
/// bitmap pointers.
pub trait EngineHal {
    fn read_guest_memory(&self, cr3: u64, gva: u64, buf: &mut [u8]) -> AxResult;
    fn write_guest_memory(&self, cr3: u64, gva: u64, buf: &[u8]) -> AxResult;
    fn translate_guest_va(&self, cr3: u64, gva: u64) -> AxResult<GuestPhysAddr>;
    fn ept_map_4k(&self, gpa: GuestPhysAddr, hpa: HostPhysAddr, flags: MappingFlags)
    -> AxResult;
    /// The EPT pointer of the current guest.
    fn eptp(&self) -> u64;
    fn load_io_bitmap(&self, bitmap: &IoBitmap);
    fn load_msr_bitmap(&self, bitmap: &MsrBitmap);
    /// Reads or writes an MSR, returning `None` if the processor raised #GP.
    ///
    /// Probing an MSR needs an exception fixup, which only the engine can
    /// install.
    fn read_msr_safe(&self, msr: u32) -> Option<u64>;
    fn write_msr_safe(&self, msr: u32, value: u64) -> Option<()>;
}

/// [`VmExitHal`] on the physical processor, in VMX root operation.
pub struct NativeHal<E: EngineHal> {
    engine: E,
}

impl<E: EngineHal> NativeHal<E> {
    pub const fn new(engine: E) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }
}

impl<E: EngineHal> VmExitHal for NativeHal<E> {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult {
        cpuid!(leaf, subleaf)
    }

    fn rdtsc(&self) -> u64 {
        unsafe { x86::time::rdtsc() }
    }

    fn rdtscp(&self) -> (u64, u32) {
        let mut aux = 0;
        let tsc = unsafe { core::arch::x86_64::__rdtscp(&mut aux) };
        (tsc, aux)
    }

    fn read_msr(&self, msr: u32) -> AxResult<u64> {
        match self.engine.read_msr_safe(msr) {
            Some(value) => Ok(value),
            None => ax_err!(InvalidInput, alloc::format!("RDMSR {msr:#x} faulted")),
        }
    }

    fn write_msr(&self, msr: u32, value: u64) -> AxResult {
        match self.engine.write_msr_safe(msr, value) {
            Some(()) => Ok(()),
            None => ax_err!(InvalidInput, alloc::format!("WRMSR {msr:#x} faulted")),
        }
    }

    fn port_read(&self, port: u16, width: AccessWidth) -> u32 {
        unsafe {
            match width {
                AccessWidth::Byte => x86::io::inb(port) as u32,
                AccessWidth::Word => x86::io::inw(port) as u32,
                _ => x86::io::inl(port),
            }
        }
    }

    fn port_write(&self, port: u16, width: AccessWidth, value: u32) {
        unsafe {
            match width {
                AccessWidth::Byte => x86::io::outb(port, value as u8),
                AccessWidth::Word => x86::io::outw(port, value as u16),
                _ => x86::io::outl(port, value),
            }
        }
    }

    fn read_dr(&self, index: u8) -> u64 {
        instructions::read_dr(index)
    }

    fn write_dr(&self, index: u8, value: u64) {
        unsafe { instructions::write_dr(index, value) }
    }

    fn write_cr2(&self, value: u64) {
        unsafe { instructions::write_cr2(value) }
    }

    fn xsetbv(&self, xcr: u32, value: u64) -> AxResult {
        // Only XCR0 exists; anything else would #GP in the host.
        if xcr != 0 {
            return ax_err!(InvalidInput, alloc::format!("XSETBV to XCR{xcr}"));
        }
        unsafe { instructions::xsetbv(xcr, value) };
        Ok(())
    }

    fn wbinvd(&self) {
        unsafe { instructions::wbinvd() }
    }

    fn invvpid(&self, kind: InvVpidKind, vpid: u16, addr: u64) {
        if let Err(err) = unsafe { instructions::invvpid(kind as u64, vpid, addr) } {
            warn!("INVVPID {kind:?} for VPID {vpid} failed: {err:?}");
        }
    }

    fn invept_single_context(&self) {
        let eptp = self.engine.eptp();
        if let Err(err) = unsafe { instructions::invept(InvEptType::SingleContext, eptp) } {
            warn!("INVEPT for EPTP {eptp:#x} failed: {err:?}");
        }
    }

    fn ept_map_4k(
        &self,
        gpa: GuestPhysAddr,
        hpa: HostPhysAddr,
        flags: MappingFlags,
    ) -> AxResult {
        self.engine.ept_map_4k(gpa, hpa, flags)
    }

    fn read_guest_memory(&self, cr3: u64, gva: u64, buf: &mut [u8]) -> AxResult {
        self.engine.read_guest_memory(cr3, gva, buf)
    }

    fn write_guest_memory(&self, cr3: u64, gva: u64, buf: &[u8]) -> AxResult {
        self.engine.write_guest_memory(cr3, gva, buf)
    }

    fn translate_guest_va(&self, cr3: u64, gva: u64) -> AxResult<GuestPhysAddr> {
        self.engine.translate_guest_va(cr3, gva)
    }

    fn load_io_bitmap(&self, bitmap: &IoBitmap) {
        self.engine.load_io_bitmap(bitmap)
    }

    fn load_msr_bitmap(&self, bitmap: &MsrBitmap) {
        self.engine.load_msr_bitmap(bitmap)
    }

    fn vmcall(&self, id: u64) {
        unsafe { instructions::vmcall(id) }
    }

    fn debug_break(&self) {
        instructions::int3()
    }
}
