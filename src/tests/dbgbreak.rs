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

//! Tests for one-shot VM-exit breakpoints.

use crate::dbgbreak::{BreakpointTable, DebugBreakObserver};
use crate::handler::VmExitObserver;
use crate::stats::StatsKey;
use crate::test_utils::mock::MockHal;
use crate::test_utils::*;
use crate::vmx::{ExceptionVector, VmxExitReason};

#[test]
fn test_arm_and_disarm() {
    let table = BreakpointTable::new().unwrap();
    assert!(!table.is_armed(StatsKey::Clts));
    assert!(!table.is_reason_armed(VmxExitReason::CPUID));

    table.arm(StatsKey::Clts);
    table.arm(StatsKey::RdmsrHigh(0x80));
    table.arm_reason(VmxExitReason::CPUID);
    assert!(table.is_armed(StatsKey::Clts));
    assert!(table.is_armed(StatsKey::RdmsrHigh(0x80)));
    assert!(!table.is_armed(StatsKey::RdmsrLow(0x80)));
    assert!(table.is_reason_armed(VmxExitReason::CPUID));

    table.disarm_all();
    assert!(!table.is_armed(StatsKey::Clts));
    assert!(!table.is_armed(StatsKey::RdmsrHigh(0x80)));
    assert!(!table.is_reason_armed(VmxExitReason::CPUID));
}

#[test]
fn test_observer_breaks_on_matching_key() {
    let table = BreakpointTable::new().unwrap();
    let hal = MockHal::new();
    let mut observer = DebugBreakObserver::new(&table, &hal);

    table.arm(StatsKey::Exception(ExceptionVector::PAGE_FAULT));
    observer.observe(&exception_exit(ExceptionVector::GENERAL_PROTECTION, 3, Some(0)));
    assert_eq!(hal.effects().debug_breaks, 0);

    observer.observe(&exception_exit(ExceptionVector::PAGE_FAULT, 3, Some(2)));
    assert_eq!(hal.effects().debug_breaks, 1);
    observer.observe(&exception_exit(ExceptionVector::PAGE_FAULT, 3, Some(2)));
    assert_eq!(hal.effects().debug_breaks, 1);
}

#[test]
fn test_reason_and_key_hit_together_break_once() {
    let table = BreakpointTable::new().unwrap();
    let hal = MockHal::new();
    let mut observer = DebugBreakObserver::new(&table, &hal);

    table.arm_reason(VmxExitReason::CPUID);
    table.arm(StatsKey::CpuidLow(1));
    observer.observe(&cpuid_exit(1));

    assert_eq!(hal.effects().debug_breaks, 1);
    assert!(!table.is_reason_armed(VmxExitReason::CPUID));
    assert!(!table.is_armed(StatsKey::CpuidLow(1)));
}

#[test]
fn test_concurrent_hits_break_exactly_once() {
    const CPUS: usize = 8;

    let table = BreakpointTable::new().unwrap();
    table.arm(StatsKey::IoIn(0x60));
    let breaks: usize = std::thread::scope(|s| {
        let cpus: Vec<_> = (0..CPUS)
            .map(|_| {
                let table = &table;
                s.spawn(move || {
                    let hal = MockHal::new();
                    let mut observer = DebugBreakObserver::new(table, &hal);
                    for _ in 0..16 {
                        observer.observe(&io_exit(0x60, 1, true));
                    }
                    hal.effects().debug_breaks
                })
            })
            .collect();
        cpus.into_iter().map(|cpu| cpu.join().unwrap()).sum()
    });
    assert_eq!(breaks, 1);
}
