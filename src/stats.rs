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

//! Per-CPU VM-exit counters.
//!
//! Every logical processor counts into its own [`StatsBlock`], so counting
//! needs no locks. [`StatsHandler::dump`] folds the blocks together.

use alloc::alloc::{Layout, alloc_zeroed};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::AtomicBool;

use axerrno::{AxResult, ax_err};

use crate::bit_vector::{BitVector, Word, words_for};
use crate::context::VmExitContext;
use crate::handler::VmExitObserver;
use crate::vmx::{
    CrAccessType, ExceptionVector, GdtrIdtrInstruction, LdtrTrInstruction, VMX_EXIT_REASON_COUNT,
    VmxExitReason, VmxInterruptionType,
};

/// Leaves counted individually in each CPUID range.
pub const CPUID_BUCKETS: usize = 16;
const CPUID_HIGH_BASE: u32 = 0x8000_0000;
/// MSRs counted individually in each MSR range.
pub const MSR_BUCKETS: usize = 0x2000;
const MSR_HIGH_BASE: u32 = 0xc000_0000;
const IO_PORT_COUNT: usize = 0x1_0000;
const EXCEPTION_VECTOR_COUNT: usize = 32;

/// One slot per countable event, generic over the slot type so the same
/// layout serves counters and breakpoint flags.
#[repr(C)]
pub struct VmExitStorage<T> {
    pub vmexit: [T; VMX_EXIT_REASON_COUNT],
    pub expt_vector: [T; EXCEPTION_VECTOR_COUNT],
    pub cpuid_0: [T; CPUID_BUCKETS],
    pub cpuid_8: [T; CPUID_BUCKETS],
    pub cpuid_other: T,
    pub mov_from_cr: [T; 16],
    pub mov_to_cr: [T; 16],
    pub clts: T,
    pub lmsw: T,
    pub mov_from_dr: [T; 8],
    pub mov_to_dr: [T; 8],
    pub gdtr_idtr: [T; 4],
    pub ldtr_tr: [T; 4],
    pub io_in: [T; IO_PORT_COUNT],
    pub io_out: [T; IO_PORT_COUNT],
    pub rdmsr_0: [T; MSR_BUCKETS],
    pub rdmsr_c: [T; MSR_BUCKETS],
    pub rdmsr_other: T,
    pub wrmsr_0: [T; MSR_BUCKETS],
    pub wrmsr_c: [T; MSR_BUCKETS],
    pub wrmsr_other: T,
}

/// VM-exit counters of one logical processor.
pub type StatsBlock = VmExitStorage<u64>;

/// Slot types whose all-zero bit pattern is a valid initial value.
///
/// # Safety
///
/// Implementors must be valid when zero-initialized.
pub(crate) unsafe trait ZeroedSlot {}

unsafe impl ZeroedSlot for u64 {}
unsafe impl ZeroedSlot for AtomicBool {}

/// Allocates `count` zeroed storages on the heap. Storages are far too large
/// to be built on the stack first.
pub(crate) fn alloc_storages<T: ZeroedSlot>(count: usize) -> AxResult<Box<[VmExitStorage<T>]>> {
    if count == 0 {
        return Ok(Vec::new().into_boxed_slice());
    }
    let Ok(layout) = Layout::array::<VmExitStorage<T>>(count) else {
        return ax_err!(NoMemory, "VM-exit storage too large");
    };
    // SAFETY: `layout` has non-zero size, and `T: ZeroedSlot` makes the zeroed
    // memory a valid `[VmExitStorage<T>]` of `count` elements.
    unsafe {
        let ptr = alloc_zeroed(layout) as *mut VmExitStorage<T>;
        if ptr.is_null() {
            return ax_err!(NoMemory, "failed to allocate VM-exit storage");
        }
        Ok(Box::from_raw(core::ptr::slice_from_raw_parts_mut(ptr, count)))
    }
}

/// Allocates a single zeroed storage on the heap.
pub(crate) fn alloc_storage<T: ZeroedSlot>() -> AxResult<Box<VmExitStorage<T>>> {
    let layout = Layout::new::<VmExitStorage<T>>();
    // SAFETY: as in `alloc_storages`.
    unsafe {
        let ptr = alloc_zeroed(layout) as *mut VmExitStorage<T>;
        if ptr.is_null() {
            return ax_err!(NoMemory, "failed to allocate VM-exit storage");
        }
        Ok(Box::from_raw(ptr))
    }
}

/// The bucket a VM exit is counted in, beyond its exit reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsKey {
    /// Hardware or software exception with this vector.
    Exception(u8),
    /// CPUID leaf `0..16`.
    CpuidLow(u32),
    /// CPUID leaf `0x8000_0000..0x8000_0010`, as an offset.
    CpuidHigh(u32),
    CpuidOther,
    MovToCr(u8),
    MovFromCr(u8),
    Clts,
    Lmsw,
    MovToDr(u8),
    MovFromDr(u8),
    GdtrIdtr(GdtrIdtrInstruction),
    LdtrTr(LdtrTrInstruction),
    IoIn(u16),
    IoOut(u16),
    /// RDMSR of an MSR in `0..0x2000`.
    RdmsrLow(u32),
    /// RDMSR of an MSR in `0xc000_0000..0xc000_2000`, as an offset.
    RdmsrHigh(u32),
    RdmsrOther,
    WrmsrLow(u32),
    WrmsrHigh(u32),
    WrmsrOther,
}

impl StatsKey {
    fn cpuid(leaf: u32) -> Self {
        match leaf {
            0..0x10 => Self::CpuidLow(leaf),
            CPUID_HIGH_BASE..0x8000_0010 => Self::CpuidHigh(leaf - CPUID_HIGH_BASE),
            _ => Self::CpuidOther,
        }
    }

    fn msr(msr: u32, is_write: bool) -> Self {
        match (msr, is_write) {
            (0..0x2000, false) => Self::RdmsrLow(msr),
            (MSR_HIGH_BASE..0xc000_2000, false) => Self::RdmsrHigh(msr - MSR_HIGH_BASE),
            (_, false) => Self::RdmsrOther,
            (0..0x2000, true) => Self::WrmsrLow(msr),
            (MSR_HIGH_BASE..0xc000_2000, true) => Self::WrmsrHigh(msr - MSR_HIGH_BASE),
            (_, true) => Self::WrmsrOther,
        }
    }

    /// Buckets a VM exit. `None` for exits counted by reason only.
    pub fn from_context(ctx: &VmExitContext) -> Option<Self> {
        let key = match ctx.exit_reason()? {
            VmxExitReason::EXCEPTION_NMI => {
                let intr_info = ctx.exit_interrupt_info();
                match intr_info.int_type {
                    VmxInterruptionType::HardException | VmxInterruptionType::SoftException
                        if (intr_info.vector as usize) < EXCEPTION_VECTOR_COUNT =>
                    {
                        Self::Exception(intr_info.vector)
                    }
                    _ => return None,
                }
            }
            VmxExitReason::CPUID => Self::cpuid(ctx.regs.eax()),
            VmxExitReason::CR_ACCESS => {
                let cr_access_info = ctx.cr_access_info();
                match cr_access_info.access_type {
                    CrAccessType::MovToCr => Self::MovToCr(cr_access_info.cr_number),
                    CrAccessType::MovFromCr => Self::MovFromCr(cr_access_info.cr_number),
                    CrAccessType::Clts => Self::Clts,
                    CrAccessType::Lmsw => Self::Lmsw,
                }
            }
            VmxExitReason::DR_ACCESS => {
                let dr_access_info = ctx.dr_access_info();
                if dr_access_info.is_read {
                    Self::MovFromDr(dr_access_info.dr_number)
                } else {
                    Self::MovToDr(dr_access_info.dr_number)
                }
            }
            VmxExitReason::IO_INSTRUCTION => {
                let io_info = ctx.io_exit_info();
                if io_info.is_in {
                    Self::IoIn(io_info.port)
                } else {
                    Self::IoOut(io_info.port)
                }
            }
            VmxExitReason::MSR_READ => Self::msr(ctx.regs.ecx(), false),
            VmxExitReason::MSR_WRITE => Self::msr(ctx.regs.ecx(), true),
            VmxExitReason::GDTR_IDTR => {
                Self::GdtrIdtr(ctx.instruction_info().gdtr_idtr_instruction())
            }
            VmxExitReason::LDTR_TR => Self::LdtrTr(ctx.instruction_info().ldtr_tr_instruction()),
            _ => return None,
        };
        Some(key)
    }
}

impl<T> VmExitStorage<T> {
    /// The slot counting exits with this raw reason.
    pub fn reason_slot(&self, raw_reason: u32) -> Option<&T> {
        self.vmexit.get(raw_reason as usize)
    }

    pub fn reason_slot_mut(&mut self, raw_reason: u32) -> Option<&mut T> {
        self.vmexit.get_mut(raw_reason as usize)
    }

    pub fn slot(&self, key: StatsKey) -> &T {
        match key {
            StatsKey::Exception(v) => &self.expt_vector[v as usize % EXCEPTION_VECTOR_COUNT],
            StatsKey::CpuidLow(leaf) => &self.cpuid_0[leaf as usize % CPUID_BUCKETS],
            StatsKey::CpuidHigh(leaf) => &self.cpuid_8[leaf as usize % CPUID_BUCKETS],
            StatsKey::CpuidOther => &self.cpuid_other,
            StatsKey::MovToCr(cr) => &self.mov_to_cr[cr as usize % 16],
            StatsKey::MovFromCr(cr) => &self.mov_from_cr[cr as usize % 16],
            StatsKey::Clts => &self.clts,
            StatsKey::Lmsw => &self.lmsw,
            StatsKey::MovToDr(dr) => &self.mov_to_dr[dr as usize % 8],
            StatsKey::MovFromDr(dr) => &self.mov_from_dr[dr as usize % 8],
            StatsKey::GdtrIdtr(instruction) => &self.gdtr_idtr[instruction as usize],
            StatsKey::LdtrTr(instruction) => &self.ldtr_tr[instruction as usize],
            StatsKey::IoIn(port) => &self.io_in[port as usize],
            StatsKey::IoOut(port) => &self.io_out[port as usize],
            StatsKey::RdmsrLow(msr) => &self.rdmsr_0[msr as usize % MSR_BUCKETS],
            StatsKey::RdmsrHigh(msr) => &self.rdmsr_c[msr as usize % MSR_BUCKETS],
            StatsKey::RdmsrOther => &self.rdmsr_other,
            StatsKey::WrmsrLow(msr) => &self.wrmsr_0[msr as usize % MSR_BUCKETS],
            StatsKey::WrmsrHigh(msr) => &self.wrmsr_c[msr as usize % MSR_BUCKETS],
            StatsKey::WrmsrOther => &self.wrmsr_other,
        }
    }

    pub fn slot_mut(&mut self, key: StatsKey) -> &mut T {
        match key {
            StatsKey::Exception(v) => &mut self.expt_vector[v as usize % EXCEPTION_VECTOR_COUNT],
            StatsKey::CpuidLow(leaf) => &mut self.cpuid_0[leaf as usize % CPUID_BUCKETS],
            StatsKey::CpuidHigh(leaf) => &mut self.cpuid_8[leaf as usize % CPUID_BUCKETS],
            StatsKey::CpuidOther => &mut self.cpuid_other,
            StatsKey::MovToCr(cr) => &mut self.mov_to_cr[cr as usize % 16],
            StatsKey::MovFromCr(cr) => &mut self.mov_from_cr[cr as usize % 16],
            StatsKey::Clts => &mut self.clts,
            StatsKey::Lmsw => &mut self.lmsw,
            StatsKey::MovToDr(dr) => &mut self.mov_to_dr[dr as usize % 8],
            StatsKey::MovFromDr(dr) => &mut self.mov_from_dr[dr as usize % 8],
            StatsKey::GdtrIdtr(instruction) => &mut self.gdtr_idtr[instruction as usize],
            StatsKey::LdtrTr(instruction) => &mut self.ldtr_tr[instruction as usize],
            StatsKey::IoIn(port) => &mut self.io_in[port as usize],
            StatsKey::IoOut(port) => &mut self.io_out[port as usize],
            StatsKey::RdmsrLow(msr) => &mut self.rdmsr_0[msr as usize % MSR_BUCKETS],
            StatsKey::RdmsrHigh(msr) => &mut self.rdmsr_c[msr as usize % MSR_BUCKETS],
            StatsKey::RdmsrOther => &mut self.rdmsr_other,
            StatsKey::WrmsrLow(msr) => &mut self.wrmsr_0[msr as usize % MSR_BUCKETS],
            StatsKey::WrmsrHigh(msr) => &mut self.wrmsr_c[msr as usize % MSR_BUCKETS],
            StatsKey::WrmsrOther => &mut self.wrmsr_other,
        }
    }
}

impl<T> VmExitStorage<T> {
    /// Every slot, grouped by field in declaration order.
    pub fn fields(&self) -> [&[T]; 21] {
        [
            &self.vmexit,
            &self.expt_vector,
            &self.cpuid_0,
            &self.cpuid_8,
            core::slice::from_ref(&self.cpuid_other),
            &self.mov_from_cr,
            &self.mov_to_cr,
            core::slice::from_ref(&self.clts),
            core::slice::from_ref(&self.lmsw),
            &self.mov_from_dr,
            &self.mov_to_dr,
            &self.gdtr_idtr,
            &self.ldtr_tr,
            &self.io_in,
            &self.io_out,
            &self.rdmsr_0,
            &self.rdmsr_c,
            core::slice::from_ref(&self.rdmsr_other),
            &self.wrmsr_0,
            &self.wrmsr_c,
            core::slice::from_ref(&self.wrmsr_other),
        ]
    }

    pub fn fields_mut(&mut self) -> [&mut [T]; 21] {
        [
            &mut self.vmexit,
            &mut self.expt_vector,
            &mut self.cpuid_0,
            &mut self.cpuid_8,
            core::slice::from_mut(&mut self.cpuid_other),
            &mut self.mov_from_cr,
            &mut self.mov_to_cr,
            core::slice::from_mut(&mut self.clts),
            core::slice::from_mut(&mut self.lmsw),
            &mut self.mov_from_dr,
            &mut self.mov_to_dr,
            &mut self.gdtr_idtr,
            &mut self.ldtr_tr,
            &mut self.io_in,
            &mut self.io_out,
            &mut self.rdmsr_0,
            &mut self.rdmsr_c,
            core::slice::from_mut(&mut self.rdmsr_other),
            &mut self.wrmsr_0,
            &mut self.wrmsr_c,
            core::slice::from_mut(&mut self.wrmsr_other),
        ]
    }
}

impl StatsBlock {
    /// Adds every counter of `other` into `self`.
    pub fn merge(&mut self, other: &StatsBlock) {
        for (dst, src) in self.fields_mut().into_iter().zip(other.fields()) {
            for (d, s) in dst.iter_mut().zip(src) {
                *d += *s;
            }
        }
    }

    /// Zeroes every counter.
    pub fn reset(&mut self) {
        for field in self.fields_mut() {
            field.fill(0);
        }
    }

    /// Total number of exits counted.
    pub fn total(&self) -> u64 {
        self.vmexit.iter().sum()
    }

    /// Logs every non-zero counter, grouped under its exit reason.
    fn log(&self) {
        for (raw, &count) in self.vmexit.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let Ok(reason) = VmxExitReason::try_from(raw as u32) else {
                info!("EXIT_REASON_{}: {}", raw, count);
                continue;
            };
            info!("{:?}: {}", reason, count);

            match reason {
                VmxExitReason::EXCEPTION_NMI => {
                    log_nonzero(&self.expt_vector, |v| ExceptionVector::name(v as u8).into());
                }
                VmxExitReason::CPUID => {
                    log_nonzero(&self.cpuid_0, |i| alloc::format!("{:#010x}", i));
                    log_nonzero(&self.cpuid_8, |i| {
                        alloc::format!("{:#010x}", i as u32 + CPUID_HIGH_BASE)
                    });
                    if self.cpuid_other > 0 {
                        info!("    (OTHER): {}", self.cpuid_other);
                    }
                }
                VmxExitReason::CR_ACCESS => {
                    log_nonzero(&self.mov_from_cr, |i| alloc::format!("mov_from_cr[{i}]"));
                    log_nonzero(&self.mov_to_cr, |i| alloc::format!("mov_to_cr[{i}]"));
                    if self.clts > 0 {
                        info!("    clts: {}", self.clts);
                    }
                    if self.lmsw > 0 {
                        info!("    lmsw: {}", self.lmsw);
                    }
                }
                VmxExitReason::DR_ACCESS => {
                    log_nonzero(&self.mov_from_dr, |i| alloc::format!("mov_from_dr[{i}]"));
                    log_nonzero(&self.mov_to_dr, |i| alloc::format!("mov_to_dr[{i}]"));
                }
                VmxExitReason::GDTR_IDTR => {
                    log_nonzero(&self.gdtr_idtr, |i| match GdtrIdtrInstruction::try_from(i as u8) {
                        Ok(instruction) => alloc::format!("{instruction:?}"),
                        Err(_) => alloc::format!("{i}"),
                    });
                }
                VmxExitReason::LDTR_TR => {
                    log_nonzero(&self.ldtr_tr, |i| match LdtrTrInstruction::try_from(i as u8) {
                        Ok(instruction) => alloc::format!("{instruction:?}"),
                        Err(_) => alloc::format!("{i}"),
                    });
                }
                VmxExitReason::IO_INSTRUCTION => {
                    log_nonzero(&self.io_in, |i| alloc::format!("in ({i:#06x})"));
                    log_nonzero(&self.io_out, |i| alloc::format!("out ({i:#06x})"));
                }
                VmxExitReason::MSR_READ => {
                    log_nonzero(&self.rdmsr_0, |i| alloc::format!("{i:#010x}"));
                    log_nonzero(&self.rdmsr_c, |i| {
                        alloc::format!("{:#010x}", i as u32 + MSR_HIGH_BASE)
                    });
                    if self.rdmsr_other > 0 {
                        info!("    (OTHER): {}", self.rdmsr_other);
                    }
                }
                VmxExitReason::MSR_WRITE => {
                    log_nonzero(&self.wrmsr_0, |i| alloc::format!("{i:#010x}"));
                    log_nonzero(&self.wrmsr_c, |i| {
                        alloc::format!("{:#010x}", i as u32 + MSR_HIGH_BASE)
                    });
                    if self.wrmsr_other > 0 {
                        info!("    (OTHER): {}", self.wrmsr_other);
                    }
                }
                _ => {}
            }
        }
    }
}

fn log_nonzero(counters: &[u64], label: impl Fn(usize) -> alloc::string::String) {
    for (i, &count) in counters.iter().enumerate() {
        if count > 0 {
            info!("    {}: {}", label(i), count);
        }
    }
}

type TraceBitmap = BitVector<[Word; words_for(VMX_EXIT_REASON_COUNT)]>;

/// Counts VM exits per logical processor.
///
/// ```ignore
/// let mut stats = StatsHandler::new();
/// stats.initialize(cpu_count)?;
/// for (cpu, observer) in stats.observers().enumerate() {
///     vcpus[cpu].add_observer(observer)?;
/// }
/// ```
pub struct StatsHandler {
    blocks: Option<Box<[StatsBlock]>>,
    merged: Option<Box<StatsBlock>>,
    trace: TraceBitmap,
}

impl Default for StatsHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsHandler {
    pub fn new() -> Self {
        Self {
            blocks: None,
            merged: None,
            trace: TraceBitmap::default(),
        }
    }

    /// Allocates one zeroed block per logical processor, plus the block
    /// [`Self::dump`] merges into.
    ///
    /// Fails with [`NoMemory`](axerrno::AxError::NoMemory) if the blocks
    /// cannot be allocated; the handler is then left uninitialized.
    pub fn initialize(&mut self, cpu_count: usize) -> AxResult {
        if self.blocks.is_some() {
            return ax_err!(BadState, "VM-exit statistics already initialized");
        }
        if cpu_count == 0 {
            return ax_err!(InvalidInput, "no logical processors to count for");
        }
        let blocks = alloc_storages::<u64>(cpu_count)?;
        let merged = alloc_storage::<u64>()?;
        debug!(
            "VM-exit statistics: {} blocks of {} bytes",
            cpu_count,
            core::mem::size_of::<StatsBlock>()
        );
        self.blocks = Some(blocks);
        self.merged = Some(merged);
        Ok(())
    }

    pub fn cpu_count(&self) -> usize {
        self.blocks.as_ref().map_or(0, |blocks| blocks.len())
    }

    /// The counters of one logical processor.
    pub fn block(&self, cpu: usize) -> Option<&StatsBlock> {
        self.blocks.as_ref()?.get(cpu)
    }

    /// One observer per logical processor, in CPU order. Each borrows only
    /// its own block.
    pub fn observers(&mut self) -> impl Iterator<Item = StatsObserver<'_>> {
        let trace = &self.trace;
        self.blocks
            .iter_mut()
            .flat_map(|blocks| blocks.iter_mut())
            .map(move |block| StatsObserver { block, trace })
    }

    /// Merges all per-CPU blocks, logs the non-zero counters and returns
    /// the aggregate.
    pub fn dump(&mut self) -> AxResult<&StatsBlock> {
        let (Some(blocks), Some(merged)) = (self.blocks.as_ref(), self.merged.as_mut()) else {
            return ax_err!(BadState, "VM-exit statistics not initialized");
        };
        merged.reset();
        for block in blocks.iter() {
            merged.merge(block);
        }
        merged.log();
        Ok(&**merged)
    }

    /// Releases all blocks. Harmless if [`Self::initialize`] never ran or
    /// failed.
    pub fn destroy(&mut self) {
        self.blocks = None;
        self.merged = None;
    }

    /// Emits a trace line for every exit with this reason.
    pub fn enable_trace(&mut self, reason: VmxExitReason) {
        self.trace.set(reason as usize);
    }

    pub fn disable_trace(&mut self, reason: VmxExitReason) {
        self.trace.clear(reason as usize);
    }

    /// Enables or disables tracing for every exit reason.
    pub fn trace_all(&mut self, enable: bool) {
        if enable {
            self.trace.set_range(0, VMX_EXIT_REASON_COUNT);
        } else {
            self.trace.clear_all();
        }
    }

    pub fn is_traced(&self, reason: VmxExitReason) -> bool {
        self.trace.test(reason as usize)
    }
}

/// Counts the exits of one logical processor into its block.
pub struct StatsObserver<'a> {
    block: &'a mut StatsBlock,
    trace: &'a TraceBitmap,
}

impl StatsObserver<'_> {
    pub fn block(&self) -> &StatsBlock {
        self.block
    }
}

impl VmExitObserver for StatsObserver<'_> {
    fn observe(&mut self, ctx: &VmExitContext) {
        let raw_reason = ctx.exit_info.raw_reason;
        if let Some(count) = self.block.reason_slot_mut(raw_reason) {
            *count += 1;
        }
        let key = StatsKey::from_context(ctx);
        if let Some(key) = key {
            *self.block.slot_mut(key) += 1;
        }
        if self.trace.test(raw_reason as usize) {
            trace!(
                "{:?} @ RIP({:#x}): {}",
                ctx.exit_reason(),
                ctx.guest.rip,
                ExitDetail(ctx)
            );
        }
    }
}

/// The operands of an exit, as shown in its trace line.
pub(crate) struct ExitDetail<'a>(pub &'a VmExitContext);

impl fmt::Display for ExitDetail<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ctx = self.0;
        let Some(reason) = ctx.exit_reason() else {
            return write!(f, "raw reason {:#x}", ctx.exit_info.raw_reason);
        };
        match reason {
            VmxExitReason::EXCEPTION_NMI => {
                let vector = ctx.exit_interrupt_info().vector;
                write!(f, "{} ({})", ExceptionVector::name(vector), vector)
            }
            VmxExitReason::CPUID => write!(
                f,
                "eax {:#010x} ecx {:#010x}",
                ctx.regs.eax(),
                ctx.regs.ecx()
            ),
            VmxExitReason::INVLPG => write!(f, "{:#x}", ctx.exit_qualification),
            VmxExitReason::CR_ACCESS => {
                let info = ctx.cr_access_info();
                match info.access_type {
                    CrAccessType::MovToCr => write!(
                        f,
                        "mov cr{}, gpr{} ({:#x})",
                        info.cr_number,
                        info.gpr,
                        ctx.gpr(info.gpr)
                    ),
                    CrAccessType::MovFromCr => {
                        write!(f, "mov gpr{}, cr{}", info.gpr, info.cr_number)
                    }
                    CrAccessType::Clts => write!(f, "clts"),
                    CrAccessType::Lmsw => write!(f, "lmsw {:#x}", info.lmsw_source_data),
                }
            }
            VmxExitReason::DR_ACCESS => {
                let info = ctx.dr_access_info();
                if info.is_read {
                    write!(f, "mov gpr{}, dr{}", info.gpr, info.dr_number)
                } else {
                    write!(
                        f,
                        "mov dr{}, gpr{} ({:#x})",
                        info.dr_number,
                        info.gpr,
                        ctx.gpr(info.gpr)
                    )
                }
            }
            VmxExitReason::IO_INSTRUCTION => {
                let info = ctx.io_exit_info();
                let direction = if info.is_in { "in" } else { "out" };
                write!(
                    f,
                    "{} port {:#06x}, {} bytes",
                    direction, info.port, info.access_size
                )
            }
            VmxExitReason::MSR_READ => write!(f, "ecx {:#010x}", ctx.regs.ecx()),
            VmxExitReason::MSR_WRITE => write!(
                f,
                "ecx {:#010x} value {:#x}",
                ctx.regs.ecx(),
                ctx.regs.get_edx_eax()
            ),
            VmxExitReason::GDTR_IDTR => {
                write!(f, "{:?}", ctx.instruction_info().gdtr_idtr_instruction())
            }
            VmxExitReason::LDTR_TR => {
                write!(f, "{:?}", ctx.instruction_info().ldtr_tr_instruction())
            }
            VmxExitReason::XSETBV => write!(
                f,
                "xcr{} = {:#x}",
                ctx.regs.ecx(),
                ctx.regs.get_edx_eax()
            ),
            VmxExitReason::EPT_VIOLATION | VmxExitReason::EPT_MISCONFIG => {
                write!(f, "gpa {:#x}", ctx.guest_physical_address)
            }
            _ => Ok(()),
        }
    }
}
