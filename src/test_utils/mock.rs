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

//! An in-memory [`VmExitHal`] that records every privileged effect.

use std::cell::RefCell;
use std::collections::BTreeMap;

use axaddrspace::device::AccessWidth;
use axaddrspace::{GuestPhysAddr, HostPhysAddr, MappingFlags};
use axerrno::{AxResult, ax_err};
use raw_cpuid::CpuIdResult;

use crate::hal::{InvVpidKind, VmExitHal};
use crate::vmx::{IoBitmap, MsrBitmap};

pub const MOCK_TSC: u64 = 0x1122_3344_5566_7788;
pub const MOCK_TSC_AUX: u32 = 3;

/// Host-visible state the mock tracks. Two equal snapshots mean a handler
/// left the host untouched in between.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct HostEffects {
    pub msr_writes: Vec<(u32, u64)>,
    /// Port, access size in bytes, value.
    pub port_writes: Vec<(u16, u8, u32)>,
    pub dr_writes: Vec<(u8, u64)>,
    pub cr2: Option<u64>,
    pub xcr_writes: Vec<(u32, u64)>,
    pub wbinvd_count: usize,
    pub invvpid: Vec<(InvVpidKind, u16, u64)>,
    pub invept_count: usize,
    pub ept_mappings: Vec<(GuestPhysAddr, HostPhysAddr, MappingFlags)>,
    pub vmcalls: Vec<u64>,
    pub debug_breaks: usize,
    pub io_bitmap_loads: usize,
    pub msr_bitmap_loads: usize,
}

#[derive(Default)]
struct MockState {
    msrs: BTreeMap<u32, u64>,
    ports: BTreeMap<u16, u32>,
    drs: [u64; 8],
    memory: BTreeMap<u64, u8>,
    translations: BTreeMap<u64, GuestPhysAddr>,
    io_bitmap: Option<IoBitmap>,
    msr_bitmap: Option<MsrBitmap>,
    ept_fails: bool,
    effects: HostEffects,
}

/// Hardware stand-in for handler tests.
///
/// MSRs and ports must be seeded before they can be read; unknown MSRs fault
/// like they would on hardware. Guest memory is byte-addressed by guest
/// virtual address, ignoring CR3.
#[derive(Default)]
pub struct MockHal {
    state: RefCell<MockState>,
}

fn width_bytes(width: AccessWidth) -> u8 {
    match width {
        AccessWidth::Byte => 1,
        AccessWidth::Word => 2,
        AccessWidth::Dword => 4,
        AccessWidth::Qword => 8,
    }
}

impl MockHal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_msr(self, msr: u32, value: u64) -> Self {
        self.state.borrow_mut().msrs.insert(msr, value);
        self
    }

    pub fn with_port(self, port: u16, value: u32) -> Self {
        self.state.borrow_mut().ports.insert(port, value);
        self
    }

    /// Maps `bytes` into guest memory at `gva`.
    pub fn with_memory(self, gva: u64, bytes: &[u8]) -> Self {
        {
            let mut state = self.state.borrow_mut();
            for (i, &b) in bytes.iter().enumerate() {
                state.memory.insert(gva + i as u64, b);
            }
        }
        self
    }

    /// Translates the guest virtual page of `gva` to the page of `gpa`.
    pub fn with_translation(self, gva: u64, gpa: usize) -> Self {
        self.state
            .borrow_mut()
            .translations
            .insert(gva & !0xfff, GuestPhysAddr::from_usize(gpa & !0xfff));
        self
    }

    /// Makes every later EPT mapping request fail without effect.
    pub fn fail_ept_mappings(&self) {
        self.state.borrow_mut().ept_fails = true;
    }

    pub fn set_dr(&self, index: u8, value: u64) {
        self.state.borrow_mut().drs[index as usize] = value;
    }

    pub fn dr(&self, index: u8) -> u64 {
        self.state.borrow().drs[index as usize]
    }

    pub fn msr(&self, msr: u32) -> Option<u64> {
        self.state.borrow().msrs.get(&msr).copied()
    }

    pub fn memory(&self, gva: u64, len: usize) -> Option<Vec<u8>> {
        let state = self.state.borrow();
        (0..len as u64)
            .map(|i| state.memory.get(&(gva + i)).copied())
            .collect()
    }

    pub fn loaded_io_bitmap(&self) -> Option<IoBitmap> {
        self.state.borrow().io_bitmap.clone()
    }

    pub fn loaded_msr_bitmap(&self) -> Option<MsrBitmap> {
        self.state.borrow().msr_bitmap.clone()
    }

    /// Everything the handlers did to the host so far.
    pub fn effects(&self) -> HostEffects {
        self.state.borrow().effects.clone()
    }
}

impl VmExitHal for MockHal {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuIdResult {
        CpuIdResult {
            eax: leaf,
            ebx: subleaf,
            ecx: 0x6c65_746e,
            edx: 0x4965_6e69,
        }
    }

    fn rdtsc(&self) -> u64 {
        MOCK_TSC
    }

    fn rdtscp(&self) -> (u64, u32) {
        (MOCK_TSC, MOCK_TSC_AUX)
    }

    fn read_msr(&self, msr: u32) -> AxResult<u64> {
        match self.state.borrow().msrs.get(&msr) {
            Some(&value) => Ok(value),
            None => ax_err!(InvalidInput, "MSR faulted"),
        }
    }

    fn write_msr(&self, msr: u32, value: u64) -> AxResult {
        let mut state = self.state.borrow_mut();
        if !state.msrs.contains_key(&msr) {
            return ax_err!(InvalidInput, "MSR faulted");
        }
        state.msrs.insert(msr, value);
        state.effects.msr_writes.push((msr, value));
        Ok(())
    }

    fn port_read(&self, port: u16, width: AccessWidth) -> u32 {
        let value = self.state.borrow().ports.get(&port).copied().unwrap_or(u32::MAX);
        match width_bytes(width) {
            1 => value & 0xff,
            2 => value & 0xffff,
            _ => value,
        }
    }

    fn port_write(&self, port: u16, width: AccessWidth, value: u32) {
        self.state
            .borrow_mut()
            .effects
            .port_writes
            .push((port, width_bytes(width), value));
    }

    fn read_dr(&self, index: u8) -> u64 {
        self.dr(index)
    }

    fn write_dr(&self, index: u8, value: u64) {
        let mut state = self.state.borrow_mut();
        state.drs[index as usize] = value;
        state.effects.dr_writes.push((index, value));
    }

    fn write_cr2(&self, value: u64) {
        self.state.borrow_mut().effects.cr2 = Some(value);
    }

    fn xsetbv(&self, xcr: u32, value: u64) -> AxResult {
        if xcr != 0 {
            return ax_err!(InvalidInput, "XSETBV to an unsupported XCR");
        }
        self.state.borrow_mut().effects.xcr_writes.push((xcr, value));
        Ok(())
    }

    fn wbinvd(&self) {
        self.state.borrow_mut().effects.wbinvd_count += 1;
    }

    fn invvpid(&self, kind: InvVpidKind, vpid: u16, addr: u64) {
        self.state
            .borrow_mut()
            .effects
            .invvpid
            .push((kind, vpid, addr));
    }

    fn invept_single_context(&self) {
        self.state.borrow_mut().effects.invept_count += 1;
    }

    fn ept_map_4k(
        &self,
        gpa: GuestPhysAddr,
        hpa: HostPhysAddr,
        flags: MappingFlags,
    ) -> AxResult {
        let mut state = self.state.borrow_mut();
        if state.ept_fails {
            return ax_err!(NoMemory, "EPT mapping refused");
        }
        state.effects.ept_mappings.push((gpa, hpa, flags));
        Ok(())
    }

    fn read_guest_memory(&self, _cr3: u64, gva: u64, buf: &mut [u8]) -> AxResult {
        let state = self.state.borrow();
        for (i, b) in buf.iter_mut().enumerate() {
            match state.memory.get(&(gva + i as u64)) {
                Some(&v) => *b = v,
                None => return ax_err!(BadAddress, "guest page not present"),
            }
        }
        Ok(())
    }

    fn write_guest_memory(&self, _cr3: u64, gva: u64, buf: &[u8]) -> AxResult {
        let mut state = self.state.borrow_mut();
        if (0..buf.len() as u64).any(|i| !state.memory.contains_key(&(gva + i))) {
            return ax_err!(BadAddress, "guest page not present");
        }
        for (i, &b) in buf.iter().enumerate() {
            state.memory.insert(gva + i as u64, b);
        }
        Ok(())
    }

    fn translate_guest_va(&self, _cr3: u64, gva: u64) -> AxResult<GuestPhysAddr> {
        match self.state.borrow().translations.get(&(gva & !0xfff)) {
            Some(&page) => Ok(GuestPhysAddr::from_usize(
                page.as_usize() + (gva & 0xfff) as usize,
            )),
            None => ax_err!(BadAddress, "guest page not present"),
        }
    }

    fn load_io_bitmap(&self, bitmap: &IoBitmap) {
        let mut state = self.state.borrow_mut();
        state.io_bitmap = Some(bitmap.clone());
        state.effects.io_bitmap_loads += 1;
    }

    fn load_msr_bitmap(&self, bitmap: &MsrBitmap) {
        let mut state = self.state.borrow_mut();
        state.msr_bitmap = Some(bitmap.clone());
        state.effects.msr_bitmap_loads += 1;
    }

    fn vmcall(&self, id: u64) {
        self.state.borrow_mut().effects.vmcalls.push(id);
    }

    fn debug_break(&self) {
        self.state.borrow_mut().effects.debug_breaks += 1;
    }
}
