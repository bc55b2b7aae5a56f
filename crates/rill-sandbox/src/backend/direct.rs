//! Trusted evaluation: no memory limit, no hard interrupt
//!
//! Only the cooperative budget can stop a script here. Each context gets a
//! fresh interpreter so contexts still share no globals.

use std::rc::Rc;

use super::{open_in_process, ContextList, Interpreter, SharedInterpreter};
use crate::capabilities::{Isolation, RuntimeOptions, SandboxCapabilities};
use crate::error::SandboxError;
use crate::interrupt::InterruptState;
use crate::sandbox::{SandboxContext, SandboxProvider, SandboxRuntime};

const NAME: &str = "direct";

const CAPABILITIES: SandboxCapabilities = SandboxCapabilities {
    hard_interrupt: false,
    isolation: Isolation::None,
    async_eval: true,
    memory_limit: false,
    reentrant_calls: false,
};

/// Provider for the `direct` backend
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectProvider;

impl SandboxProvider for DirectProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> SandboxCapabilities {
        CAPABILITIES
    }

    fn create_runtime(&self, options: &RuntimeOptions) -> Result<Rc<dyn SandboxRuntime>, SandboxError> {
        Ok(Rc::new(DirectRuntime {
            options: options.clone(),
            contexts: ContextList::default(),
        }))
    }
}

struct DirectRuntime {
    options: RuntimeOptions,
    contexts: ContextList,
}

impl SandboxRuntime for DirectRuntime {
    fn create_context(&self) -> Result<Rc<dyn SandboxContext>, SandboxError> {
        self.contexts.check_open()?;
        let interrupts = InterruptState::new(self.options.clock.clone());
        let shared = SharedInterpreter::new(Interpreter::new(&self.options, false, interrupts)?);
        let context = open_in_process(shared, &self.options, NAME, CAPABILITIES)?;
        Ok(self.contexts.track(context))
    }

    fn dispose(&self) {
        self.contexts.dispose_all();
    }

    fn is_disposed(&self) -> bool {
        self.contexts.is_disposed()
    }
}
