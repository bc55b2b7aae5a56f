//! QuickJS on a dedicated OS thread per context
//!
//! Only JSON text crosses the thread boundary. While a request runs, the host
//! thread blocks on the reply channel and serves host calls coming back from
//! the worker; a host call may itself send a nested request, which the
//! worker serves on the same stack. That makes host → guest → host → guest
//! re-entry work here, unlike the in-process backends.

use crossbeam::channel::{self, Receiver, Sender};
use rquickjs::{Context, Ctx, Function};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::{ContextList, Interpreter};
use crate::capabilities::{Isolation, RuntimeOptions, SandboxCapabilities};
use crate::error::SandboxError;
use crate::host::{BridgedContext, ContextControls, GuestPort, HostSide};
use crate::interrupt::InterruptState;
use crate::js::{self, Envelope, GuestRequest};
use crate::sandbox::{next_context_id, SandboxContext, SandboxProvider, SandboxRuntime};

const NAME: &str = "worker";

const WORKER_STACK_SIZE: usize = 16 * 1024 * 1024;

const CAPABILITIES: SandboxCapabilities = SandboxCapabilities {
    hard_interrupt: true,
    isolation: Isolation::Thread,
    async_eval: true,
    memory_limit: true,
    reentrant_calls: true,
};

enum ToWorker {
    Request(String),
    HostReply(String),
    Shutdown,
}

enum FromWorker {
    Reply(Result<String, SandboxError>),
    HostCall { id: String, args: String },
}

/// Provider for the `worker` backend
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerProvider;

impl SandboxProvider for WorkerProvider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capabilities(&self) -> SandboxCapabilities {
        CAPABILITIES
    }

    fn create_runtime(&self, options: &RuntimeOptions) -> Result<Rc<dyn SandboxRuntime>, SandboxError> {
        Ok(Rc::new(WorkerRuntime {
            options: options.clone(),
            contexts: ContextList::default(),
        }))
    }
}

struct WorkerRuntime {
    options: RuntimeOptions,
    contexts: ContextList,
}

impl SandboxRuntime for WorkerRuntime {
    fn create_context(&self) -> Result<Rc<dyn SandboxContext>, SandboxError> {
        self.contexts.check_open()?;
        let id = next_context_id();
        let controls = ContextControls::new(self.options.clock.clone());
        let host = Rc::new(HostSide::new(id, self.options.max_codec_depth));
        let port = WorkerPort::spawn(id, &self.options, controls.clone())?;
        tracing::debug!(context = id, backend = NAME, "context created");
        let context = BridgedContext::new(NAME, CAPABILITIES, controls, host, Box::new(port));
        Ok(self.contexts.track(context))
    }

    fn dispose(&self) {
        self.contexts.dispose_all();
    }

    fn is_disposed(&self) -> bool {
        self.contexts.is_disposed()
    }
}

// ============================================================================
// Host side
// ============================================================================

struct WorkerPort {
    to_worker: Sender<ToWorker>,
    from_worker: Receiver<FromWorker>,
    interrupts: Arc<InterruptState>,
    thread: RefCell<Option<JoinHandle<()>>>,
}

impl WorkerPort {
    fn spawn(context_id: u64, options: &RuntimeOptions, controls: ContextControls) -> Result<Self, SandboxError> {
        let (to_worker, worker_rx) = channel::unbounded();
        let (worker_tx, from_worker) = channel::unbounded();
        let (ready_tx, ready_rx) = channel::bounded(1);
        let interrupts = InterruptState::new(options.clock.clone());

        let worker = Worker {
            context_id,
            options: options.clone(),
            controls,
            interrupts: interrupts.clone(),
            rx: worker_rx,
            tx: worker_tx,
            stopping: Cell::new(false),
        };
        let thread = thread::Builder::new()
            .name(format!("rill-worker-{}", context_id))
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || worker.run(ready_tx))
            .map_err(|e| SandboxError::Backend(format!("failed to spawn worker thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(err);
            }
            Err(_) => return Err(SandboxError::WorkerGone),
        }

        Ok(Self {
            to_worker,
            from_worker,
            interrupts,
            thread: RefCell::new(Some(thread)),
        })
    }
}

impl GuestPort for WorkerPort {
    fn request(&self, request: &GuestRequest, host: &HostSide) -> Result<Envelope, SandboxError> {
        if self.thread.borrow().is_none() {
            return Err(SandboxError::ContextDisposed);
        }
        let text = serde_json::to_string(request)?;
        self.to_worker
            .send(ToWorker::Request(text))
            .map_err(|_| SandboxError::WorkerGone)?;
        loop {
            match self.from_worker.recv() {
                Ok(FromWorker::Reply(reply)) => return Ok(serde_json::from_str(&reply?)?),
                Ok(FromWorker::HostCall { id, args }) => {
                    let reply = host.host_call(&id, &args);
                    // The worker may have stopped during the call; its final reply is still queued.
                    let _ = self.to_worker.send(ToWorker::HostReply(reply));
                }
                Err(_) => return Err(SandboxError::WorkerGone),
            }
        }
    }

    fn shutdown(&self) {
        let Some(thread) = self.thread.borrow_mut().take() else {
            return;
        };
        self.interrupts.terminate();
        let _ = self.to_worker.send(ToWorker::Shutdown);
        if thread.join().is_err() {
            tracing::error!(backend = NAME, "worker thread panicked");
        }
    }
}

impl Drop for WorkerPort {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Worker thread
// ============================================================================

struct Worker {
    context_id: u64,
    options: RuntimeOptions,
    controls: ContextControls,
    interrupts: Arc<InterruptState>,
    rx: Receiver<ToWorker>,
    tx: Sender<FromWorker>,
    stopping: Cell<bool>,
}

impl Worker {
    fn run(self, ready: Sender<Result<(), SandboxError>>) {
        let worker = Rc::new(self);
        let (interp, context) = match worker.boot() {
            Ok(booted) => booted,
            Err(err) => {
                let _ = ready.send(Err(err));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        while let Ok(message) = worker.rx.recv() {
            match message {
                ToWorker::Request(text) => {
                    let reply = worker.serve(&interp, &context, &text);
                    if worker.tx.send(FromWorker::Reply(reply)).is_err() {
                        break;
                    }
                }
                ToWorker::HostReply(_) => {
                    tracing::warn!(context = worker.context_id, "host reply outside a host call");
                }
                ToWorker::Shutdown => break,
            }
            if worker.stopping.get() {
                break;
            }
        }
        drop(context);
        drop(interp);
        tracing::debug!(context = worker.context_id, "worker stopped");
    }

    fn boot(self: &Rc<Self>) -> Result<(Interpreter, Context), SandboxError> {
        let interp = Interpreter::new(&self.options, true, self.interrupts.clone())?;
        let context = interp.new_context()?;
        let worker = Rc::clone(self);
        let budget = self.controls.budget.clone();
        let context_id = self.context_id;
        context
            .with(|ctx| -> rquickjs::Result<()> {
                let host_call = Function::new(
                    ctx.clone(),
                    move |ctx: Ctx<'_>, function_id: String, args: String| -> rquickjs::Result<String> {
                        Ok(worker.host_call(&ctx, function_id, args))
                    },
                )?
                .with_name(js::HOST_CALL_HOOK)?;
                ctx.globals().set(js::HOST_CALL_HOOK, host_call)?;
                js::install(&ctx, context_id, budget)
            })
            .map_err(|e| SandboxError::Backend(format!("failed to install guest prelude: {}", e)))?;
        Ok((interp, context))
    }

    fn serve(&self, interp: &Interpreter, context: &Context, text: &str) -> Result<String, SandboxError> {
        let request: GuestRequest = serde_json::from_str(text)?;
        let envelope = interp.run(context, &self.controls, &request)?;
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Serve a request that arrived while the guest is blocked in a host call.
    /// Promise jobs cannot be drained here, so a pending reply stays pending.
    fn serve_nested(&self, ctx: &Ctx<'_>, text: &str) -> Result<String, SandboxError> {
        let request: GuestRequest = serde_json::from_str(text)?;
        let envelope = js::run(ctx, &request, text, &self.interrupts)?;
        Ok(serde_json::to_string(&envelope)?)
    }

    fn host_call(&self, ctx: &Ctx<'_>, id: String, args: String) -> String {
        if self.tx.send(FromWorker::HostCall { id, args }).is_err() {
            return HostSide::disposed_reply();
        }
        loop {
            match self.rx.recv() {
                Ok(ToWorker::HostReply(reply)) => return reply,
                Ok(ToWorker::Request(text)) => {
                    let reply = self.serve_nested(ctx, &text);
                    if self.tx.send(FromWorker::Reply(reply)).is_err() {
                        return HostSide::disposed_reply();
                    }
                }
                Ok(ToWorker::Shutdown) | Err(_) => {
                    self.stopping.set(true);
                    self.interrupts.terminate();
                    return HostSide::disposed_reply();
                }
            }
        }
    }
}
