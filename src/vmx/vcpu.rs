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

use alloc::boxed::Box;
use alloc::format;
use alloc::vec::Vec;

use axerrno::{AxResult, ax_err};

use crate::context::VmExitContext;
use crate::handler::{VmExitAction, VmExitHandler, VmExitObserver};

/// Lifecycle of the trap-handling side of a virtual CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmExitHandlerState {
    /// Created, observers may still be attached.
    Uninitialized,
    /// Set up and handling VM exits.
    Active,
    /// A handler or the host asked for the guest to stop. Exits arriving
    /// before the engine acts on it are still handled.
    Terminating,
    /// Torn down.
    Destroyed,
}

/// One virtual CPU's VM-exit pipeline: a chain of observers followed by the
/// handler that resolves the exit.
pub struct VmxExitVcpu<'a, R: VmExitHandler> {
    id: usize,
    state: VmExitHandlerState,
    observers: Vec<Box<dyn VmExitObserver + 'a>>,
    handler: R,
}

impl<'a, R: VmExitHandler> VmxExitVcpu<'a, R> {
    pub fn new(id: usize, handler: R) -> Self {
        Self {
            id,
            state: VmExitHandlerState::Uninitialized,
            observers: Vec::new(),
            handler,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> VmExitHandlerState {
        self.state
    }

    /// Whether termination was requested, by a handler or the host.
    pub fn is_terminated(&self) -> bool {
        matches!(
            self.state,
            VmExitHandlerState::Terminating | VmExitHandlerState::Destroyed
        )
    }

    pub fn handler(&self) -> &R {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut R {
        &mut self.handler
    }

    /// Runs `f` if the current state is `from`, moving to `to` if it succeeds.
    ///
    /// The state is left untouched on any error.
    fn with_state_transition<F, T>(
        &mut self,
        from: VmExitHandlerState,
        to: VmExitHandlerState,
        f: F,
    ) -> AxResult<T>
    where
        F: FnOnce(&mut Self) -> AxResult<T>,
    {
        if self.state != from {
            return ax_err!(
                BadState,
                format!("VCpu {} state is not {:?}, but {:?}", self.id, from, self.state)
            );
        }
        let result = f(self)?;
        self.state = to;
        Ok(result)
    }

    /// Appends an observer. Observers run in insertion order, before the
    /// handler, on every exit.
    pub fn add_observer(&mut self, observer: impl VmExitObserver + 'a) -> AxResult {
        if self.state != VmExitHandlerState::Uninitialized {
            return ax_err!(
                BadState,
                format!("VCpu {} observers are fixed once set up", self.id)
            );
        }
        self.observers.push(Box::new(observer));
        Ok(())
    }

    /// Lets the handler prepare guest state before the first VM entry.
    pub fn setup(&mut self, ctx: &mut VmExitContext) -> AxResult {
        self.with_state_transition(
            VmExitHandlerState::Uninitialized,
            VmExitHandlerState::Active,
            |vcpu| vcpu.handler.setup(ctx),
        )
    }

    /// Handles one VM exit and applies the resulting action to `ctx`.
    pub fn handle_exit(&mut self, ctx: &mut VmExitContext) -> AxResult<VmExitAction> {
        if !matches!(
            self.state,
            VmExitHandlerState::Active | VmExitHandlerState::Terminating
        ) {
            return ax_err!(
                BadState,
                format!("VCpu {} cannot handle VM exits in {:?}", self.id, self.state)
            );
        }

        for observer in self.observers.iter_mut() {
            observer.observe(ctx);
        }

        #[cfg(feature = "tracing")]
        let regs_before = ctx.regs;

        let action = self.handler.dispatch(ctx);

        #[cfg(feature = "tracing")]
        {
            let diff = crate::regs::GeneralRegistersDiff::new(regs_before, ctx.regs);
            if !diff.is_same() {
                trace!(
                    "VCpu {} {:?} -> {:?}, {:?}",
                    self.id,
                    ctx.exit_reason(),
                    action,
                    diff
                );
            }
        }

        match action {
            VmExitAction::Advance => ctx.advance_rip(),
            VmExitAction::Resume => {}
            VmExitAction::Inject(event) => {
                if event.int_type.is_soft() {
                    ctx.entry_instruction_length = ctx.exit_instruction_length();
                }
                ctx.inject(event);
            }
            VmExitAction::Terminate(reason) => {
                info!("VCpu {} terminating: {:?}", self.id, reason);
                if self.state == VmExitHandlerState::Active {
                    self.state = VmExitHandlerState::Terminating;
                }
            }
        }
        Ok(action)
    }

    /// Asks the handler to have the guest torn down.
    pub fn invoke_termination(&mut self) -> AxResult {
        self.with_state_transition(
            VmExitHandlerState::Active,
            VmExitHandlerState::Terminating,
            |vcpu| {
                vcpu.handler.invoke_termination();
                Ok(())
            },
        )
    }

    /// Releases the observers once the guest has stopped.
    pub fn destroy(&mut self) -> AxResult {
        self.with_state_transition(
            VmExitHandlerState::Terminating,
            VmExitHandlerState::Destroyed,
            |vcpu| {
                vcpu.observers.clear();
                Ok(())
            },
        )
    }
}
