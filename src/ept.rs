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

use axaddrspace::{GuestPhysAddr, MappingFlags, NestedPageFaultInfo};

bitflags::bitflags! {
    /// Exit Qualification for EPT Violations. (SDM Vol. 3C, Section 28.2.1, Table 28-7)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EptViolationQualification: u64 {
        /// The access causing the violation was a data read.
        const READ = 1 << 0;
        /// The access causing the violation was a data write.
        const WRITE = 1 << 1;
        /// The access causing the violation was an instruction fetch.
        const EXECUTE = 1 << 2;
        /// The guest-physical address was readable.
        const READABLE = 1 << 3;
        /// The guest-physical address was writable.
        const WRITABLE = 1 << 4;
        /// The guest-physical address was executable.
        const EXECUTABLE = 1 << 5;
        /// The guest linear-address field is valid.
        const LINEAR_ADDRESS_VALID = 1 << 7;
    }
}

/// The information of an EPT violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EptViolationInfo {
    pub qualification: EptViolationQualification,
    /// The guest-physical address that faulted.
    pub guest_paddr: GuestPhysAddr,
    /// The guest linear address, if the processor reported one.
    pub guest_vaddr: Option<u64>,
}

impl EptViolationInfo {
    pub fn new(qualification: u64, guest_paddr: GuestPhysAddr, guest_linear_address: u64) -> Self {
        let qualification = EptViolationQualification::from_bits_truncate(qualification);
        let guest_vaddr = qualification
            .contains(EptViolationQualification::LINEAR_ADDRESS_VALID)
            .then_some(guest_linear_address);
        Self {
            qualification,
            guest_paddr,
            guest_vaddr,
        }
    }

    pub fn is_read(&self) -> bool {
        self.qualification.contains(EptViolationQualification::READ)
    }

    pub fn is_write(&self) -> bool {
        self.qualification.contains(EptViolationQualification::WRITE)
    }

    pub fn is_execute(&self) -> bool {
        self.qualification.contains(EptViolationQualification::EXECUTE)
    }

    /// The kind of access that faulted, as mapping flags.
    pub fn access_flags(&self) -> MappingFlags {
        let mut flags = MappingFlags::empty();
        if self.is_read() {
            flags |= MappingFlags::READ;
        }
        if self.is_write() {
            flags |= MappingFlags::WRITE;
        }
        if self.is_execute() {
            flags |= MappingFlags::EXECUTE;
        }
        flags
    }
}

impl From<EptViolationInfo> for NestedPageFaultInfo {
    fn from(info: EptViolationInfo) -> Self {
        NestedPageFaultInfo {
            access_flags: info.access_flags(),
            fault_guest_paddr: info.guest_paddr,
        }
    }
}
