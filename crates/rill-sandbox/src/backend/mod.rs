//! Sandbox backends
//!
//! Every backend runs QuickJS behind the same guest prelude and differs in
//! where the interpreter lives and which limits it enforces:
//!
//! | backend   | interpreter                   | hard interrupt | memory limit |
//! |-----------|-------------------------------|----------------|--------------|
//! | `quickjs` | one per runtime, host thread  | yes            | yes          |
//! | `direct`  | one per context, host thread  | no             | no           |
//! | `worker`  | one per context, own thread   | yes            | yes          |

mod direct;
mod interp;
mod quickjs;
mod worker;

pub use direct::DirectProvider;
pub use quickjs::QuickJsProvider;
pub use worker::WorkerProvider;

use rquickjs::{Context, Function};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::capabilities::{Backend, RuntimeOptions, SandboxCapabilities};
use crate::error::SandboxError;
use crate::host::{BridgedContext, ContextControls, GuestPort, HostSide};
use crate::js::{self, Envelope, GuestRequest};
use crate::sandbox::{next_context_id, SandboxContext, SandboxProvider};
use interp::Interpreter;

/// Provider for a backend
pub fn provider(backend: Backend) -> Box<dyn SandboxProvider> {
    match backend {
        Backend::QuickJs => Box::new(QuickJsProvider),
        Backend::Worker => Box::new(WorkerProvider),
        Backend::Direct => Box::new(DirectProvider),
    }
}

// ============================================================================
// Runtime bookkeeping
// ============================================================================

/// Contexts created by one runtime, disposed with it
#[derive(Default)]
pub(crate) struct ContextList {
    contexts: RefCell<Vec<Weak<BridgedContext>>>,
    disposed: Cell<bool>,
}

impl ContextList {
    fn check_open(&self) -> Result<(), SandboxError> {
        if self.disposed.get() {
            Err(SandboxError::RuntimeDisposed)
        } else {
            Ok(())
        }
    }

    fn track(&self, context: Rc<BridgedContext>) -> Rc<dyn SandboxContext> {
        let mut contexts = self.contexts.borrow_mut();
        contexts.retain(|c| c.strong_count() > 0);
        contexts.push(Rc::downgrade(&context));
        context
    }

    fn dispose_all(&self) {
        if self.disposed.replace(true) {
            return;
        }
        let contexts = std::mem::take(&mut *self.contexts.borrow_mut());
        for context in contexts.iter().filter_map(Weak::upgrade) {
            context.dispose();
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.get()
    }
}

// ============================================================================
// In-process port
// ============================================================================

/// An interpreter on the host thread, shared by the contexts of one runtime
pub(crate) struct SharedInterpreter {
    interp: Interpreter,
    entered: Cell<bool>,
}

impl SharedInterpreter {
    fn new(interp: Interpreter) -> Rc<Self> {
        Rc::new(Self {
            interp,
            entered: Cell::new(false),
        })
    }
}

struct EnteredGuard<'a>(&'a Cell<bool>);

impl Drop for EnteredGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Port into a context of an in-process interpreter
struct InProcessPort {
    context: RefCell<Option<Context>>,
    shared: Rc<SharedInterpreter>,
    controls: ContextControls,
}

impl GuestPort for InProcessPort {
    fn request(&self, request: &GuestRequest, _host: &HostSide) -> Result<Envelope, SandboxError> {
        let context = self.context.borrow().clone().ok_or(SandboxError::ContextDisposed)?;
        // QuickJS cannot be re-entered while a host function runs on its stack.
        if self.shared.entered.replace(true) {
            return Err(SandboxError::Busy);
        }
        let _entered = EnteredGuard(&self.shared.entered);
        self.shared.interp.run(&context, &self.controls, request)
    }

    fn shutdown(&self) {
        self.context.borrow_mut().take();
    }
}

/// Open a context on an in-process interpreter
fn open_in_process(
    shared: Rc<SharedInterpreter>,
    options: &RuntimeOptions,
    backend: &'static str,
    capabilities: SandboxCapabilities,
) -> Result<Rc<BridgedContext>, SandboxError> {
    let id = next_context_id();
    let controls = ContextControls::new(options.clock.clone());
    let host = Rc::new(HostSide::new(id, options.max_codec_depth));
    let context = shared.interp.new_context()?;

    let weak_host = Rc::downgrade(&host);
    let budget = controls.budget.clone();
    context
        .with(|ctx| -> rquickjs::Result<()> {
            let host_call = Function::new(
                ctx.clone(),
                move |function_id: String, args: String| -> rquickjs::Result<String> {
                    Ok(match weak_host.upgrade() {
                        Some(host) => host.host_call(&function_id, &args),
                        None => HostSide::disposed_reply(),
                    })
                },
            )?
            .with_name(js::HOST_CALL_HOOK)?;
            ctx.globals().set(js::HOST_CALL_HOOK, host_call)?;
            js::install(&ctx, id, budget)
        })
        .map_err(|e| SandboxError::Backend(format!("failed to install guest prelude: {}", e)))?;

    let port = InProcessPort {
        context: RefCell::new(Some(context)),
        shared,
        controls: controls.clone(),
    };
    tracing::debug!(context = id, backend, "context created");
    Ok(BridgedContext::new(backend, capabilities, controls, host, Box::new(port)))
}
