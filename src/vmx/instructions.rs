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

//! Thin wrappers around the instructions the native HAL executes.

use core::arch::asm;

use x86::bits64::rflags::{self, RFlags};
use x86::vmx::{Result, VmFail};

/// INVEPT type. (SDM Vol. 3C, Section 30.3, INVEPT)
#[repr(u64)]
#[derive(Debug, Clone, Copy)]
pub enum InvEptType {
    /// Invalidates mappings associated with a single EPTP.
    SingleContext = 1,
}

/// VMX instructions report failure in CF (VMfailInvalid) or ZF (VMfailValid).
#[inline(always)]
fn vmx_capture_status() -> Result<()> {
    let flags = rflags::read();
    if flags.contains(RFlags::FLAGS_ZF) {
        Err(VmFail::VmFailValid)
    } else if flags.contains(RFlags::FLAGS_CF) {
        Err(VmFail::VmFailInvalid)
    } else {
        Ok(())
    }
}

/// Invalidate Translations Derived from EPT.
///
/// # Safety
///
/// Must run in VMX root operation.
pub unsafe fn invept(inv_type: InvEptType, eptp: u64) -> Result<()> {
    let invept_desc = [eptp, 0];
    unsafe {
        asm!("invept {0}, [{1}]", in(reg) inv_type as u64, in(reg) &invept_desc);
    }
    vmx_capture_status()
}

/// Invalidate Translations Based on VPID.
///
/// # Safety
///
/// Must run in VMX root operation.
pub unsafe fn invvpid(inv_type: u64, vpid: u16, addr: u64) -> Result<()> {
    let invvpid_desc = [vpid as u64, addr];
    unsafe {
        asm!("invvpid {0}, [{1}]", in(reg) inv_type, in(reg) &invvpid_desc);
    }
    vmx_capture_status()
}

/// Writes `value` to the extended control register `xcr`.
///
/// # Safety
///
/// Faults with #GP on an unsupported XCR or an invalid value.
pub unsafe fn xsetbv(xcr: u32, value: u64) {
    unsafe {
        asm!(
            "xsetbv",
            in("ecx") xcr,
            in("eax") value as u32,
            in("edx") (value >> 32) as u32,
            options(nostack, preserves_flags),
        );
    }
}

/// Write back and invalidate all caches.
///
/// # Safety
///
/// Privileged; may take a very long time.
pub unsafe fn wbinvd() {
    unsafe { asm!("wbinvd", options(nostack, preserves_flags)) }
}

/// # Safety
///
/// Only meaningful in VMX non-root operation or with a hypervisor listening.
pub unsafe fn vmcall(id: u64) {
    unsafe { asm!("vmcall", in("rcx") id, options(nostack)) }
}

/// Breakpoint trap, `int3`.
pub fn int3() {
    unsafe { asm!("int3", options(nomem, nostack)) }
}

/// Writes CR2.
///
/// # Safety
///
/// Clobbers the host's record of its last page fault.
pub unsafe fn write_cr2(value: u64) {
    unsafe { asm!("mov cr2, {}", in(reg) value, options(nostack, preserves_flags)) }
}

macro_rules! debug_register_accessors {
    ($($index:literal),*) => {
        /// Reads debug register `DR<index>`. Indices other than 0-3, 6 and 7 read as 0.
        pub fn read_dr(index: u8) -> u64 {
            let value: u64;
            match index {
                $($index => unsafe {
                    asm!(concat!("mov {}, dr", $index), out(reg) value, options(nomem, nostack, preserves_flags))
                },)*
                _ => return 0,
            }
            value
        }

        /// Writes debug register `DR<index>`. Other indices are ignored.
        ///
        /// # Safety
        ///
        /// Changes the host's hardware breakpoints.
        pub unsafe fn write_dr(index: u8, value: u64) {
            match index {
                $($index => unsafe {
                    asm!(concat!("mov dr", $index, ", {}"), in(reg) value, options(nomem, nostack, preserves_flags))
                },)*
                _ => {}
            }
        }
    };
}

debug_register_accessors!(0, 1, 2, 3, 6, 7);
