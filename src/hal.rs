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
use axerrno::AxResult;
use raw_cpuid::CpuIdResult;

use crate::vmx::{IoBitmap, MsrBitmap};

/// INVVPID invalidation types. (SDM Vol. 3C, Section 30.3, INVVPID)
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvVpidKind {
    /// Entries for one linear address tagged with the VPID.
    IndividualAddress = 0,
    /// All entries tagged with the VPID.
    SingleContext = 1,
    /// All entries of all VPIDs except VPID 0.
    AllContext = 2,
    /// All entries tagged with the VPID except global translations.
    SingleContextRetainingGlobals = 3,
}

/// The host operations trap handlers need from the platform.
///
/// Every native instruction a passthrough handler executes on the guest's
/// behalf goes through this trait, so that handlers can be driven by a
/// recording implementation in tests. On real hardware, see
/// [`NativeHal`](crate::NativeHal).
pub trait VmExitHal {
    /// Executes CPUID natively.
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult;
    /// Reads the time-stamp counter.
    fn rdtsc(&self) -> u64;
    /// Reads the time-stamp counter and `IA32_TSC_AUX`.
    fn rdtscp(&self) -> (u64, u32);

    /// Reads a physical MSR, failing if the processor faults on it.
    fn read_msr(&self, msr: u32) -> AxResult<u64>;
    /// Writes a physical MSR, failing if the processor faults on it.
    fn write_msr(&self, msr: u32, value: u64) -> AxResult;

    /// Reads an I/O port.
    fn port_read(&self, port: u16, width: AccessWidth) -> u32;
    /// Writes an I/O port.
    fn port_write(&self, port: u16, width: AccessWidth, value: u32);

    /// Reads host debug register `DR<index>`.
    fn read_dr(&self, index: u8) -> u64;
    /// Writes host debug register `DR<index>`.
    fn write_dr(&self, index: u8, value: u64);
    /// Writes CR2, ahead of injecting a page fault.
    fn write_cr2(&self, value: u64);
    /// Writes the extended control register selected by `xcr`.
    fn xsetbv(&self, xcr: u32, value: u64) -> AxResult;
    /// Writes back and invalidates all caches.
    fn wbinvd(&self);

    /// Invalidates TLB entries tagged with `vpid`.
    fn invvpid(&self, kind: InvVpidKind, vpid: u16, addr: u64);
    /// Invalidates the EPT-derived mappings of the current EPT pointer.
    fn invept_single_context(&self);
    /// Maps one 4K guest-physical page to `hpa` with `flags`.
    fn ept_map_4k(&self, gpa: GuestPhysAddr, hpa: HostPhysAddr, flags: MappingFlags)
    -> AxResult;

    /// Copies guest memory at virtual address `gva` into `buf`, walking the
    /// guest page tables rooted at `cr3`.
    fn read_guest_memory(&self, cr3: u64, gva: u64, buf: &mut [u8]) -> AxResult;
    /// Copies `buf` into guest memory at virtual address `gva`.
    fn write_guest_memory(&self, cr3: u64, gva: u64, buf: &[u8]) -> AxResult;
    /// Translates a guest virtual address through the guest page tables.
    fn translate_guest_va(&self, cr3: u64, gva: u64) -> AxResult<GuestPhysAddr>;

    /// Installs the I/O bitmap in the controlling structure.
    fn load_io_bitmap(&self, bitmap: &IoBitmap);
    /// Installs the MSR bitmap in the controlling structure.
    fn load_msr_bitmap(&self, bitmap: &MsrBitmap);

    /// Issues a VMCALL from the host, used to ask the engine to tear the
    /// guest down.
    fn vmcall(&self, id: u64);
    /// Breaks into an attached debugger.
    fn debug_break(&self);
}
