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

use super::GeneralRegisters;
use alloc::format;
use core::fmt::Debug;

/// The registers a VM-exit hook changed in the guest register image.
pub struct GeneralRegistersDiff {
    before: GeneralRegisters,
    after: GeneralRegisters,
}

impl GeneralRegistersDiff {
    const RSP_INDEX: u8 = 4;

    /// Compares the register image before and after a hook ran.
    pub fn new(before: GeneralRegisters, after: GeneralRegisters) -> Self {
        Self { before, after }
    }

    /// Returns `true` if the hook left every register untouched.
    pub fn is_same(&self) -> bool {
        self.before == self.after
    }

    /// Iterates over `(index, before, after)` for every changed register.
    pub fn changed(&self) -> impl Iterator<Item = (u8, u64, u64)> + '_ {
        (0..16u8)
            .filter(|&i| i != Self::RSP_INDEX)
            .map(|i| {
                (
                    i,
                    self.before.get_reg_of_index(i),
                    self.after.get_reg_of_index(i),
                )
            })
            .filter(|(_, before, after)| before != after)
    }
}

impl Debug for GeneralRegistersDiff {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let mut debug = f.debug_struct("GeneralRegistersDiff");
        for (i, before, after) in self.changed() {
            debug.field(
                GeneralRegisters::register_name(i),
                &format!("{before:#x} -> {after:#x}"),
            );
        }
        debug.finish()
    }
}
