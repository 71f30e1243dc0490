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

use crate::context::VmExitContext;
use crate::vmx::definitions::ExceptionVector;
use crate::vmx::{VmxExitReason, VmxInterruptInfo};

/// Why a handler asked for the guest to be torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateReason {
    /// The guest issued the termination hypercall.
    GuestRequest,
    TripleFault,
    /// An EPT violation no handler claimed.
    UnhandledEptViolation(GuestPhysAddr),
    /// An exception the guest cannot survive, e.g. #DF or #MC.
    FatalException(u8),
    /// VM entry failed on guest state, MSR loading or a machine check.
    InvalidGuestState,
    /// A raw exit reason with no meaningful passthrough.
    Unhandled(u32),
}

/// What to do with the guest once a VM exit has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExitAction {
    /// Resume after the exiting instruction.
    Advance,
    /// Resume at the same RIP.
    Resume,
    /// Resume at the same RIP, delivering an event first.
    Inject(VmxInterruptInfo),
    /// Stop running the guest.
    Terminate(TerminateReason),
}

impl VmExitAction {
    /// Invalid-opcode fault, the answer to instructions the guest may not use.
    pub fn invalid_opcode() -> Self {
        Self::Inject(VmxInterruptInfo::exception(
            ExceptionVector::INVALID_OPCODE,
            0,
        ))
    }

    /// General-protection fault with error code 0.
    pub fn general_protection() -> Self {
        Self::Inject(VmxInterruptInfo::exception(
            ExceptionVector::GENERAL_PROTECTION,
            0,
        ))
    }
}

/// Watches every VM exit before it is handled.
///
/// Observers cannot change the exit's outcome; the single resolving
/// [`VmExitHandler`] does that.
pub trait VmExitObserver {
    fn observe(&mut self, ctx: &VmExitContext);
}

macro_rules! define_vmexit_handler {
    (
        fallback: [$($reason:ident),* $(,)?],
        vm_fallback: [$($vm_reason:ident),* $(,)?] $(,)?
    ) => {
        paste::paste! {
            /// A resolver for VM exits.
            ///
            /// Every exit reason has a `handle_*` hook. Hooks not overridden
            /// fall back to [`VmExitHandler::handle_fallback`], except those
            /// for VMX instructions which land in
            /// [`VmExitHandler::handle_vm_fallback`].
            pub trait VmExitHandler {
                /// Prepares guest state before the first VM entry.
                fn setup(&mut self, ctx: &mut VmExitContext) -> AxResult {
                    let _ = ctx;
                    Ok(())
                }

                /// Asks the engine to tear the guest down.
                fn invoke_termination(&mut self) {}

                $(
                    #[doc = "Handles `" $reason "` exits."]
                    fn [<handle_ $reason:lower>](&mut self, ctx: &mut VmExitContext) -> VmExitAction {
                        self.handle_fallback(ctx)
                    }
                )*

                $(
                    #[doc = "Handles `" $vm_reason "` exits."]
                    fn [<handle_ $vm_reason:lower>](&mut self, ctx: &mut VmExitContext) -> VmExitAction {
                        self.handle_vm_fallback(ctx)
                    }
                )*

                /// Catch-all for hooks that were not overridden and for
                /// reserved exit reasons.
                fn handle_fallback(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
                    match ctx.exit_reason() {
                        Some(reason) => {
                            debug!(
                                "VM exit {:?} @ RIP({:#x}) not handled",
                                reason, ctx.guest.rip
                            );
                            if reason.has_instruction_length() {
                                VmExitAction::Advance
                            } else {
                                VmExitAction::Resume
                            }
                        }
                        None => {
                            warn!(
                                "Unknown VM exit reason {} @ RIP({:#x})",
                                ctx.exit_info.raw_reason, ctx.guest.rip
                            );
                            VmExitAction::Resume
                        }
                    }
                }

                /// Catch-all for VMX instructions: nested virtualization is
                /// not offered, so the guest gets #UD.
                fn handle_vm_fallback(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
                    trace!(
                        "VMX instruction {:?} @ RIP({:#x}), injecting #UD",
                        ctx.exit_reason(),
                        ctx.guest.rip
                    );
                    VmExitAction::invalid_opcode()
                }

                /// Routes the exit to the hook of its reason.
                fn dispatch(&mut self, ctx: &mut VmExitContext) -> VmExitAction {
                    match ctx.exit_reason() {
                        $(Some(VmxExitReason::$reason) => self.[<handle_ $reason:lower>](ctx),)*
                        $(Some(VmxExitReason::$vm_reason) => self.[<handle_ $vm_reason:lower>](ctx),)*
                        None => self.handle_fallback(ctx),
                    }
                }
            }
        }
    };
}

define_vmexit_handler! {
    fallback: [
        EXCEPTION_NMI,
        EXTERNAL_INTERRUPT,
        TRIPLE_FAULT,
        INIT,
        SIPI,
        SMI,
        OTHER_SMI,
        INTERRUPT_WINDOW,
        NMI_WINDOW,
        TASK_SWITCH,
        CPUID,
        GETSEC,
        HLT,
        INVD,
        INVLPG,
        RDPMC,
        RDTSC,
        RSM,
        CR_ACCESS,
        DR_ACCESS,
        IO_INSTRUCTION,
        MSR_READ,
        MSR_WRITE,
        INVALID_GUEST_STATE,
        MSR_LOAD_FAIL,
        MWAIT_INSTRUCTION,
        MONITOR_TRAP_FLAG,
        MONITOR_INSTRUCTION,
        PAUSE_INSTRUCTION,
        MCE_DURING_VMENTRY,
        TPR_BELOW_THRESHOLD,
        APIC_ACCESS,
        VIRTUALIZED_EOI,
        GDTR_IDTR,
        LDTR_TR,
        EPT_VIOLATION,
        EPT_MISCONFIG,
        RDTSCP,
        PREEMPTION_TIMER,
        WBINVD,
        XSETBV,
        APIC_WRITE,
        RDRAND,
        INVPCID,
        ENCLS,
        RDSEED,
        PML_FULL,
        XSAVES,
        XRSTORS,
    ],
    vm_fallback: [
        VMCALL,
        VMCLEAR,
        VMLAUNCH,
        VMPTRLD,
        VMPTRST,
        VMREAD,
        VMRESUME,
        VMWRITE,
        VMOFF,
        VMON,
        INVEPT,
        INVVPID,
        VMFUNC,
    ],
}
