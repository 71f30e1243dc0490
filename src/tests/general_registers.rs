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

//! Tests for the guest register image and its diff.

use crate::regs::{GeneralRegisters, GeneralRegistersDiff};

fn numbered_registers() -> GeneralRegisters {
    let mut regs = GeneralRegisters::default();
    for i in (0..16u8).filter(|&i| i != 4) {
        regs.set_reg_of_index(i, 0x1000 + i as u64);
    }
    regs
}

#[test]
fn test_general_registers_default() {
    let regs = GeneralRegisters::default();
    for i in (0..16u8).filter(|&i| i != 4) {
        assert_eq!(regs.get_reg_of_index(i), 0);
    }
}

#[test]
fn test_register_numbering_matches_fields() {
    let regs = numbered_registers();
    assert_eq!(regs.rax, 0x1000);
    assert_eq!(regs.rcx, 0x1001);
    assert_eq!(regs.rdx, 0x1002);
    assert_eq!(regs.rbx, 0x1003);
    assert_eq!(regs.rbp, 0x1005);
    assert_eq!(regs.rsi, 0x1006);
    assert_eq!(regs.rdi, 0x1007);
    assert_eq!(regs.r8, 0x1008);
    assert_eq!(regs.r15, 0x100f);
}

#[test]
fn test_register_name_function() {
    assert_eq!(GeneralRegisters::register_name(0), "rax");
    assert_eq!(GeneralRegisters::register_name(4), "rsp");
    assert_eq!(GeneralRegisters::register_name(8), "r8");
    assert_eq!(GeneralRegisters::register_name(15), "r15");
}

#[test]
#[should_panic(expected = "Illegal index")]
fn test_get_rsp_panics() {
    GeneralRegisters::default().get_reg_of_index(4);
}

#[test]
#[should_panic(expected = "Illegal index")]
fn test_set_out_of_range_panics() {
    GeneralRegisters::default().set_reg_of_index(16, 0);
}

#[test]
fn test_low_dword_accessors() {
    let mut regs = GeneralRegisters::default();
    regs.rax = 0xdead_beef_1234_5678;
    assert_eq!(regs.eax(), 0x1234_5678);

    regs.set_ecx(0xcafe_babe);
    assert_eq!(regs.rcx, 0xcafe_babe);

    regs.rbx = u64::MAX;
    regs.set_ebx(1);
    assert_eq!(regs.rbx, 1);
}

#[test]
fn test_edx_eax() {
    let mut regs = GeneralRegisters::default();
    regs.rax = 0xffff_ffff_0000_0002;
    regs.rdx = 0xffff_ffff_0000_0001;
    assert_eq!(regs.get_edx_eax(), 0x1_0000_0002);

    regs.set_edx_eax(0x1122_3344_5566_7788);
    assert_eq!(regs.rax, 0x5566_7788);
    assert_eq!(regs.rdx, 0x1122_3344);
}

#[test]
fn test_diff_same() {
    let regs = numbered_registers();
    let diff = GeneralRegistersDiff::new(regs, regs);
    assert!(diff.is_same());
    assert_eq!(diff.changed().count(), 0);
}

#[test]
fn test_diff_reports_changed_registers() {
    let before = numbered_registers();
    let mut after = before;
    after.rax = 0;
    after.r12 = 0x42;

    let diff = GeneralRegistersDiff::new(before, after);
    assert!(!diff.is_same());

    let changed: alloc::vec::Vec<_> = diff.changed().collect();
    assert_eq!(changed, [(0, 0x1000, 0), (12, 0x100c, 0x42)]);

    let debug_str = alloc::format!("{:?}", diff);
    assert!(debug_str.contains("rax"));
    assert!(debug_str.contains("0x100c -> 0x42"));
    assert!(!debug_str.contains("rbx"));
}
