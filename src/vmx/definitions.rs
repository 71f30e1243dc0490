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

/// Number of basic exit reason slots, reserved ones included.
pub const VMX_EXIT_REASON_COUNT: usize = 65;

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
/// VMX basic exit reasons. (SDM Vol. 3D, Appendix C)
pub enum VmxExitReason {
    EXCEPTION_NMI = 0,
    EXTERNAL_INTERRUPT = 1,
    TRIPLE_FAULT = 2,
    INIT = 3,
    SIPI = 4,
    SMI = 5,
    OTHER_SMI = 6,
    INTERRUPT_WINDOW = 7,
    NMI_WINDOW = 8,
    TASK_SWITCH = 9,
    CPUID = 10,
    GETSEC = 11,
    HLT = 12,
    INVD = 13,
    INVLPG = 14,
    RDPMC = 15,
    RDTSC = 16,
    RSM = 17,
    VMCALL = 18,
    VMCLEAR = 19,
    VMLAUNCH = 20,
    VMPTRLD = 21,
    VMPTRST = 22,
    VMREAD = 23,
    VMRESUME = 24,
    VMWRITE = 25,
    VMOFF = 26,
    VMON = 27,
    CR_ACCESS = 28,
    DR_ACCESS = 29,
    IO_INSTRUCTION = 30,
    MSR_READ = 31,
    MSR_WRITE = 32,
    INVALID_GUEST_STATE = 33,
    MSR_LOAD_FAIL = 34,
    MWAIT_INSTRUCTION = 36,
    MONITOR_TRAP_FLAG = 37,
    MONITOR_INSTRUCTION = 39,
    PAUSE_INSTRUCTION = 40,
    MCE_DURING_VMENTRY = 41,
    TPR_BELOW_THRESHOLD = 43,
    APIC_ACCESS = 44,
    VIRTUALIZED_EOI = 45,
    GDTR_IDTR = 46,
    LDTR_TR = 47,
    EPT_VIOLATION = 48,
    EPT_MISCONFIG = 49,
    INVEPT = 50,
    RDTSCP = 51,
    PREEMPTION_TIMER = 52,
    INVVPID = 53,
    WBINVD = 54,
    XSETBV = 55,
    APIC_WRITE = 56,
    RDRAND = 57,
    INVPCID = 58,
    VMFUNC = 59,
    ENCLS = 60,
    RDSEED = 61,
    PML_FULL = 62,
    XSAVES = 63,
    XRSTORS = 64,
}
}

impl VmxExitReason {
    /// Whether this exit is caused by the execution of an instruction, so that
    /// emulating it means stepping over that instruction.
    pub const fn has_instruction_length(self) -> bool {
        !matches!(
            self,
            Self::EXCEPTION_NMI
                | Self::EXTERNAL_INTERRUPT
                | Self::TRIPLE_FAULT
                | Self::INIT
                | Self::SIPI
                | Self::SMI
                | Self::OTHER_SMI
                | Self::INTERRUPT_WINDOW
                | Self::NMI_WINDOW
                | Self::TASK_SWITCH
                | Self::INVALID_GUEST_STATE
                | Self::MSR_LOAD_FAIL
                | Self::MONITOR_TRAP_FLAG
                | Self::MCE_DURING_VMENTRY
                | Self::TPR_BELOW_THRESHOLD
                | Self::APIC_ACCESS
                | Self::VIRTUALIZED_EOI
                | Self::EPT_VIOLATION
                | Self::EPT_MISCONFIG
                | Self::PREEMPTION_TIMER
                | Self::APIC_WRITE
                | Self::PML_FULL
        )
    }

    /// Whether this exit comes from a VMX instruction the guest tried to use
    /// to run its own hypervisor.
    pub const fn is_nested_virtualization(self) -> bool {
        matches!(
            self,
            Self::VMCLEAR
                | Self::VMLAUNCH
                | Self::VMPTRLD
                | Self::VMPTRST
                | Self::VMREAD
                | Self::VMRESUME
                | Self::VMWRITE
                | Self::VMOFF
                | Self::VMON
                | Self::INVEPT
                | Self::INVVPID
                | Self::VMFUNC
        )
    }
}

numeric_enum_macro::numeric_enum! {
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The interruption type (bits 10:8) in VM-Entry Interruption-Information Field
/// and VM-Exit Interruption-Information Field. (SDM Vol. 3C, Section 24.8.3, 24.9.2)
pub enum VmxInterruptionType {
    /// External interrupt
    External = 0,
    /// Reserved
    Reserved = 1,
    /// Non-maskable interrupt (NMI)
    NMI = 2,
    /// Hardware exception (e.g,. #PF)
    HardException = 3,
    /// Software interrupt (INT n)
    SoftIntr = 4,
    /// Privileged software exception (INT1)
    PrivSoft = 5,
    /// Software exception (INT3 or INTO)
    SoftException = 6,
    /// Other event
    Other = 7,
}
}

impl VmxInterruptionType {
    /// Whether the exception/interrupt with `vector` has an error code.
    pub const fn vector_has_error_code(vector: u8) -> bool {
        use ExceptionVector::*;
        matches!(
            vector,
            DOUBLE_FAULT
                | INVALID_TSS
                | SEGMENT_NOT_PRESENT
                | STACK_SEGMENT_FAULT
                | GENERAL_PROTECTION
                | PAGE_FAULT
                | ALIGNMENT_CHECK
                | CONTROL_PROTECTION
        )
    }

    /// Determine interruption type by the interrupt vector.
    pub const fn from_vector(vector: u8) -> Self {
        use ExceptionVector::*;
        match vector {
            DEBUG => Self::PrivSoft,
            NMI => Self::NMI,
            BREAKPOINT | OVERFLOW => Self::SoftException,
            0..=31 => Self::HardException,
            _ => Self::External,
        }
    }

    /// Is the interruption type a software interrupt or exception, whose
    /// injection needs the instruction length.
    pub const fn is_soft(&self) -> bool {
        matches!(
            *self,
            Self::SoftIntr | Self::PrivSoft | Self::SoftException
        )
    }
}

/// Architectural exception vectors.
#[allow(non_snake_case)]
pub mod ExceptionVector {
    pub const DIVIDE_ERROR: u8 = 0;
    pub const DEBUG: u8 = 1;
    pub const NMI: u8 = 2;
    pub const BREAKPOINT: u8 = 3;
    pub const OVERFLOW: u8 = 4;
    pub const BOUND_RANGE_EXCEEDED: u8 = 5;
    pub const INVALID_OPCODE: u8 = 6;
    pub const DEVICE_NOT_AVAILABLE: u8 = 7;
    pub const DOUBLE_FAULT: u8 = 8;
    pub const INVALID_TSS: u8 = 10;
    pub const SEGMENT_NOT_PRESENT: u8 = 11;
    pub const STACK_SEGMENT_FAULT: u8 = 12;
    pub const GENERAL_PROTECTION: u8 = 13;
    pub const PAGE_FAULT: u8 = 14;
    pub const X87_FLOATING_POINT: u8 = 16;
    pub const ALIGNMENT_CHECK: u8 = 17;
    pub const MACHINE_CHECK: u8 = 18;
    pub const SIMD_FLOATING_POINT: u8 = 19;
    pub const VIRTUALIZATION: u8 = 20;
    pub const CONTROL_PROTECTION: u8 = 21;

    const NAMES: [&str; 22] = [
        "DIVIDE_ERROR",
        "DEBUG",
        "NMI",
        "BREAKPOINT",
        "OVERFLOW",
        "BOUND_RANGE_EXCEEDED",
        "INVALID_OPCODE",
        "DEVICE_NOT_AVAILABLE",
        "DOUBLE_FAULT",
        "COPROCESSOR_SEGMENT_OVERRUN",
        "INVALID_TSS",
        "SEGMENT_NOT_PRESENT",
        "STACK_SEGMENT_FAULT",
        "GENERAL_PROTECTION",
        "PAGE_FAULT",
        "RESERVED",
        "X87_FLOATING_POINT",
        "ALIGNMENT_CHECK",
        "MACHINE_CHECK",
        "SIMD_FLOATING_POINT",
        "VIRTUALIZATION",
        "CONTROL_PROTECTION",
    ];

    /// Human-readable name of an exception vector.
    pub fn name(vector: u8) -> &'static str {
        NAMES.get(vector as usize).copied().unwrap_or("RESERVED")
    }
}

bitflags::bitflags! {
    /// DR6 bits the debug-register emulation touches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Dr6Flags: u64 {
        const B0 = 1 << 0;
        const B1 = 1 << 1;
        const B2 = 1 << 2;
        const B3 = 1 << 3;
        /// Debug register access detected.
        const BD = 1 << 13;
        const BS = 1 << 14;
        const BT = 1 << 15;
    }
}

bitflags::bitflags! {
    /// DR7 bits the debug-register emulation touches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Dr7Flags: u64 {
        /// General detect enable.
        const GD = 1 << 13;
    }
}

/// Breakpoint-condition bits of DR6.
pub const DR6_BREAKPOINT_CONDITION: Dr6Flags = Dr6Flags::B0
    .union(Dr6Flags::B1)
    .union(Dr6Flags::B2)
    .union(Dr6Flags::B3);
