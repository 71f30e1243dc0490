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

mod bitmap;
pub(crate) mod definitions;
mod exit_info;
mod vcpu;

pub use self::bitmap::{IoBitmap, MsrBitmap};
pub use self::definitions::{
    Dr6Flags, Dr7Flags, ExceptionVector, VMX_EXIT_REASON_COUNT, VmxExitReason,
    VmxInterruptionType,
};
pub use self::exit_info::{
    CrAccessInfo, CrAccessType, DrAccessInfo, GdtrIdtrInstruction, InstructionInfo,
    LdtrTrInstruction, SegmentRegister, VmxExitInfo, VmxInterruptInfo, VmxIoExitInfo,
};
pub use self::vcpu::{VmExitHandlerState, VmxExitVcpu};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod instructions;
        mod native;

        pub use self::native::{EngineHal, NativeHal};
    }
}

/// Return if current platform support virtualization extension.
#[cfg(target_arch = "x86_64")]
pub fn has_hardware_support() -> bool {
    if let Some(feature) = raw_cpuid::CpuId::new().get_feature_info() {
        feature.has_vmx()
    } else {
        false
    }
}
