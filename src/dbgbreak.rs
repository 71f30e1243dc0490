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

//! One-shot debugger breaks on chosen VM exits.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, Ordering};

use axerrno::AxResult;

use crate::context::VmExitContext;
use crate::hal::VmExitHal;
use crate::handler::VmExitObserver;
use crate::stats::{StatsKey, VmExitStorage, alloc_storage};
use crate::vmx::VmxExitReason;

/// Armed breakpoints, keyed like the statistics counters and shared by all
/// logical processors.
pub struct BreakpointTable {
    slots: Box<VmExitStorage<AtomicBool>>,
}

impl BreakpointTable {
    /// A table with nothing armed.
    pub fn new() -> AxResult<Self> {
        Ok(Self {
            slots: alloc_storage()?,
        })
    }

    /// Breaks on the next exit with this reason, on any processor.
    pub fn arm_reason(&self, reason: VmxExitReason) {
        if let Some(slot) = self.slots.reason_slot(reason as u32) {
            slot.store(true, Ordering::Release);
        }
    }

    /// Breaks on the next exit counted under `key`, on any processor.
    pub fn arm(&self, key: StatsKey) {
        self.slots.slot(key).store(true, Ordering::Release);
    }

    pub fn is_armed(&self, key: StatsKey) -> bool {
        self.slots.slot(key).load(Ordering::Acquire)
    }

    pub fn is_reason_armed(&self, reason: VmxExitReason) -> bool {
        self.slots
            .reason_slot(reason as u32)
            .is_some_and(|slot| slot.load(Ordering::Acquire))
    }

    pub fn disarm_all(&self) {
        for field in self.slots.fields() {
            for slot in field {
                slot.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Disarms the breakpoints `ctx` hits, returning whether any was armed.
    /// Of several processors hitting the same breakpoint, exactly one wins.
    fn take(&self, ctx: &VmExitContext) -> bool {
        let take_slot = |slot: &AtomicBool| {
            slot.compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        };
        let by_reason = self
            .slots
            .reason_slot(ctx.exit_info.raw_reason)
            .is_some_and(take_slot);
        let by_key = StatsKey::from_context(ctx).is_some_and(|key| take_slot(self.slots.slot(key)));
        by_reason || by_key
    }
}

/// Breaks into the debugger when an exit hits an armed breakpoint.
pub struct DebugBreakObserver<'a, H: VmExitHal> {
    table: &'a BreakpointTable,
    hal: &'a H,
}

impl<'a, H: VmExitHal> DebugBreakObserver<'a, H> {
    pub fn new(table: &'a BreakpointTable, hal: &'a H) -> Self {
        Self { table, hal }
    }
}

impl<H: VmExitHal> VmExitObserver for DebugBreakObserver<'_, H> {
    fn observe(&mut self, ctx: &VmExitContext) {
        if self.table.take(ctx) {
            info!(
                "Breakpoint on {:?} @ RIP({:#x})",
                ctx.exit_reason(),
                ctx.guest.rip
            );
            self.hal.debug_break();
        }
    }
}
