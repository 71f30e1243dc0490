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

//! Shared fixtures for unit tests.

pub mod mock;

use std::cell::RefCell;
use std::sync::Once;

use log::{LevelFilter, Log, Metadata, Record};

use crate::context::VmExitContext;
use crate::vmx::{VmxExitInfo, VmxExitReason};

pub const GUEST_RIP: u64 = 0x1000;
pub const INSTRUCTION_LENGTH: u32 = 3;
/// Access rights of a present, DPL 0, 64-bit code segment.
pub const CS_ACCESS_RIGHTS_64: u32 = 0xa09b;

/// A context for an exit of `reason` at [`GUEST_RIP`], as if taken from
/// 64-bit ring 0 code.
pub fn exit_context(reason: VmxExitReason) -> VmExitContext {
    let mut ctx = VmExitContext::new(VmxExitInfo::new(
        reason as u32,
        INSTRUCTION_LENGTH,
        GUEST_RIP as usize,
    ));
    ctx.guest.cs_access_rights = CS_ACCESS_RIGHTS_64;
    ctx.guest.cs_selector = 0x8;
    ctx.guest.vpid = 1;
    ctx
}

/// A context for an exit with a raw, possibly reserved, reason number.
pub fn raw_exit_context(raw_reason: u32) -> VmExitContext {
    VmExitContext::new(VmxExitInfo::new(
        raw_reason,
        INSTRUCTION_LENGTH,
        GUEST_RIP as usize,
    ))
}

/// A CPUID exit for `leaf`.
pub fn cpuid_exit(leaf: u32) -> VmExitContext {
    let mut ctx = exit_context(VmxExitReason::CPUID);
    ctx.regs.rax = leaf as u64;
    ctx
}

/// An RDMSR or WRMSR exit for `msr`.
pub fn msr_exit(msr: u32, is_write: bool) -> VmExitContext {
    let reason = if is_write {
        VmxExitReason::MSR_WRITE
    } else {
        VmxExitReason::MSR_READ
    };
    let mut ctx = exit_context(reason);
    ctx.regs.rcx = msr as u64;
    ctx
}

/// An I/O instruction exit. `size` is in bytes.
pub fn io_exit(port: u16, size: u64, is_in: bool) -> VmExitContext {
    let mut ctx = exit_context(VmxExitReason::IO_INSTRUCTION);
    ctx.exit_qualification = (port as u64) << 16 | (is_in as u64) << 3 | (size - 1);
    ctx
}

/// A control-register access exit.
pub fn cr_exit(cr: u64, access_type: u64, gpr: u64) -> VmExitContext {
    let mut ctx = exit_context(VmxExitReason::CR_ACCESS);
    ctx.exit_qualification = cr | access_type << 4 | gpr << 8;
    ctx
}

/// A debug-register access exit.
pub fn dr_exit(dr: u64, is_read: bool, gpr: u64) -> VmExitContext {
    let mut ctx = exit_context(VmxExitReason::DR_ACCESS);
    ctx.exit_qualification = dr | (is_read as u64) << 4 | gpr << 8;
    ctx
}

/// An exception exit with a valid interruption-information field.
pub fn exception_exit(vector: u8, int_type: u32, err_code: Option<u32>) -> VmExitContext {
    let mut ctx = exit_context(VmxExitReason::EXCEPTION_NMI);
    ctx.exit_interrupt_info = vector as u32 | int_type << 8 | 1 << 31;
    if let Some(code) = err_code {
        ctx.exit_interrupt_info |= 1 << 11;
        ctx.exit_interrupt_error_code = code;
    }
    ctx
}

/// An EPT violation exit at `gpa`. `qualification` holds the access bits.
pub fn ept_violation_exit(gpa: u64, qualification: u64) -> VmExitContext {
    let mut ctx = exit_context(VmxExitReason::EPT_VIOLATION);
    ctx.exit_qualification = qualification;
    ctx.guest_physical_address = gpa;
    ctx
}

std::thread_local! {
    static CAPTURED: RefCell<Option<Vec<String>>> = const { RefCell::new(None) };
}

/// Records log lines on threads that asked for them.
struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        CAPTURED.with(|lines| lines.borrow().is_some())
    }

    fn log(&self, record: &Record) {
        CAPTURED.with(|lines| {
            if let Some(lines) = lines.borrow_mut().as_mut() {
                lines.push(record.args().to_string());
            }
        });
    }

    fn flush(&self) {}
}

static CAPTURE_LOGGER: CaptureLogger = CaptureLogger;

/// Runs `f` and returns the log lines it emitted on this thread.
pub fn capture_logs(f: impl FnOnce()) -> Vec<String> {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        if log::set_logger(&CAPTURE_LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Trace);
        }
    });

    CAPTURED.with(|lines| *lines.borrow_mut() = Some(Vec::new()));
    f();
    CAPTURED
        .with(|lines| lines.borrow_mut().take())
        .unwrap_or_default()
}
