//! In-process QuickJS: one interpreter per runtime, many contexts

use std::rc::Rc;

use super::{open_in_process, ContextList, Interpreter, SharedInterpreter};
use crate::capabilities::{Isolation, RuntimeOptions, SandboxCapabilities};
use crate::error::SandboxError;
use crate::interrupt::InterruptState;
use crate::sandbox::{SandboxContext, SandboxProvider, SandboxRuntime};

const NAME: &str = "quickjs";

const CAPABILITIES: SandboxCapabilities = SandboxCapabilities {
    hard_interrupt: true,
    isolation: Isolation::Interpreter,
    async_eval: true,
    memory_limit: true,
    reentrant_calls: false,
};

/// Provider for the `quickjs` backend
#[derive(Debug, Default, Clone, Copy)]
pub struct QuickJsProvider;

impl SandboxProvider for QuickJsProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> SandboxCapabilities {
        CAPABILITIES
    }

    fn create_runtime(&self, options: &RuntimeOptions) -> Result<Rc<dyn SandboxRuntime>, SandboxError> {
        let interrupts = InterruptState::new(options.clock.clone());
        let interp = Interpreter::new(options, true, interrupts)?;
        Ok(Rc::new(QuickJsRuntime {
            shared: SharedInterpreter::new(interp),
            options: options.clone(),
            contexts: ContextList::default(),
        }))
    }
}

struct QuickJsRuntime {
    shared: Rc<SharedInterpreter>,
    options: RuntimeOptions,
    contexts: ContextList,
}

impl SandboxRuntime for QuickJsRuntime {
    fn create_context(&self) -> Result<Rc<dyn SandboxContext>, SandboxError> {
        self.contexts.check_open()?;
        let context = open_in_process(self.shared.clone(), &self.options, NAME, CAPABILITIES)?;
        Ok(self.contexts.track(context))
    }

    fn dispose(&self) {
        self.contexts.dispose_all();
    }

    fn is_disposed(&self) -> bool {
        self.contexts.is_disposed()
    }
}
