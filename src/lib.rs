#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

pub(crate) mod msr;
pub(crate) mod regs;

mod bit_vector;
mod context;
mod custom;
mod dbgbreak;
mod ept;
mod hal;
mod handler;
mod passthrough;
mod stats;
mod vmx;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

pub use bit_vector::{BitVector, WORD_BITS, Word, words_for};
pub use context::{DescriptorTableRegister, GuestState, VmExitContext};
pub use custom::{
    CustomHandler, HOOK_SIGNATURE, HOOK_SIGNATURE_LEAF, TRACKED_PAGE_CAPACITY, TrackedPage,
    VMCALL_HOOK_PAGE, VMCALL_UNHOOK_PAGE,
};
pub use dbgbreak::{BreakpointTable, DebugBreakObserver};
pub use ept::{EptViolationInfo, EptViolationQualification};
pub use hal::{InvVpidKind, VmExitHal};
pub use handler::{TerminateReason, VmExitAction, VmExitHandler, VmExitObserver};
pub use msr::Msr;
pub use passthrough::{PassthroughHandler, VMCALL_BREAKPOINT_ID, VMCALL_TERMINATE_ID};
pub use regs::{GeneralRegisters, GeneralRegistersDiff};
pub use stats::{
    CPUID_BUCKETS, MSR_BUCKETS, StatsBlock, StatsHandler, StatsKey, StatsObserver, VmExitStorage,
};

pub use vmx::{
    CrAccessInfo, CrAccessType, Dr6Flags, Dr7Flags, DrAccessInfo, ExceptionVector,
    GdtrIdtrInstruction, InstructionInfo, IoBitmap, LdtrTrInstruction, MsrBitmap, SegmentRegister,
    VMX_EXIT_REASON_COUNT, VmExitHandlerState, VmxExitInfo, VmxExitReason, VmxExitVcpu,
    VmxInterruptInfo, VmxInterruptionType, VmxIoExitInfo,
};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use vmx::{EngineHal, NativeHal, has_hardware_support};
    }
}
