//! One QuickJS interpreter with limits, interrupts and promise pumping

use rquickjs::{Context, Runtime};
use std::sync::Arc;

use crate::capabilities::RuntimeOptions;
use crate::error::SandboxError;
use crate::host::ContextControls;
use crate::interrupt::InterruptState;
use crate::js::{self, Envelope, GuestRequest};

pub(crate) struct Interpreter {
    runtime: Runtime,
    interrupts: Arc<InterruptState>,
    hard_timeout_ms: Option<u64>,
}

impl Interpreter {
    /// Create an interpreter. With `enforce_limits` off, only the stack limit
    /// applies and nothing can interrupt the guest.
    pub(crate) fn new(
        options: &RuntimeOptions,
        enforce_limits: bool,
        interrupts: Arc<InterruptState>,
    ) -> Result<Self, SandboxError> {
        let runtime = Runtime::new().map_err(|e| SandboxError::Backend(format!("failed to create runtime: {}", e)))?;
        if let Some(bytes) = options.max_stack_bytes {
            runtime.set_max_stack_size(bytes);
        }
        let mut hard_timeout_ms = None;
        if enforce_limits {
            if let Some(bytes) = options.memory_limit_bytes {
                runtime.set_memory_limit(bytes);
            }
            let state = interrupts.clone();
            runtime.set_interrupt_handler(Some(Box::new(move || state.should_interrupt())));
            hard_timeout_ms = options.hard_timeout_ms;
        }
        Ok(Self {
            runtime,
            interrupts,
            hard_timeout_ms,
        })
    }

    pub(crate) fn new_context(&self) -> Result<Context, SandboxError> {
        Context::full(&self.runtime).map_err(|e| SandboxError::Backend(format!("failed to create context: {}", e)))
    }

    /// Run one request as a guest turn: budget restarted, interrupts armed,
    /// and promise jobs drained when the guest replies `pending`.
    pub(crate) fn run(
        &self,
        context: &Context,
        controls: &ContextControls,
        request: &GuestRequest,
    ) -> Result<Envelope, SandboxError> {
        let text = serde_json::to_string(request)?;
        controls.restart_budget();
        let _turn = self.interrupts.begin(controls.handler(), self.hard_timeout_ms);
        match self.step(context, request, &text)? {
            Envelope::Pending(slot) => self.settle(context, slot),
            done => Ok(done),
        }
    }

    fn step(&self, context: &Context, request: &GuestRequest, text: &str) -> Result<Envelope, SandboxError> {
        context
            .with(|ctx| js::run(&ctx, request, text, &self.interrupts))
            .map_err(SandboxError::from)
    }

    fn settle(&self, context: &Context, slot: u64) -> Result<Envelope, SandboxError> {
        self.drain_jobs()?;
        let request = GuestRequest::Settled { slot };
        let text = serde_json::to_string(&request)?;
        self.step(context, &request, &text)
    }

    fn drain_jobs(&self) -> Result<(), SandboxError> {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(_) if self.interrupts.is_fired() => return Err(SandboxError::Interrupted),
                Err(job) => {
                    job.0.with(|ctx| {
                        ctx.catch();
                    });
                    tracing::debug!("guest job raised an uncaught exception");
                }
            }
        }
    }
}
