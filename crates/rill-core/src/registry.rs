//! Callback registry
//!
//! Functions cannot cross the boundary, so the side that owns a function
//! keeps it here and hands the other side an opaque [`CallbackId`]. Entries
//! are reference counted: every crossing of the same function takes one
//! reference, and the entry is destroyed when the last reference is
//! released. Afterwards the id resolves to [`CallError::HandleNotFound`].

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;

use crate::error::{CallError, RegistryError};
use crate::value::{function_key, FunctionKey, FunctionValue, RuntimeValue};

/// Opaque handle id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackId(String);

impl CallbackId {
    /// Wrap an id string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallbackId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Side of the boundary a function lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnerSide {
    /// Host closure
    Host,
    /// Guest function reached through a proxy
    Guest,
}

/// Handle metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackHandle {
    /// Handle id
    pub id: CallbackId,
    /// Owning side
    pub owner: OwnerSide,
}

struct Entry {
    func: FunctionValue,
    key: FunctionKey,
    owner: OwnerSide,
    refcount: usize,
}

#[derive(Default)]
struct RegistryState {
    entries: FxHashMap<CallbackId, Entry>,
    by_key: FxHashMap<FunctionKey, CallbackId>,
    next_id: u64,
}

/// Reference-counted table of functions addressable by id
///
/// The registry never holds a borrow of its own state while a function runs,
/// so callbacks may register or release other callbacks freely.
pub struct CallbackRegistry {
    state: RefCell<RegistryState>,
    dedup: bool,
}

impl CallbackRegistry {
    /// Create a registry that deduplicates by function identity
    pub fn new() -> Self {
        Self::with_dedup(true)
    }

    /// Create a registry with explicit deduplication policy
    pub fn with_dedup(dedup: bool) -> Self {
        Self {
            state: RefCell::new(RegistryState::default()),
            dedup,
        }
    }

    /// Is identity deduplication enabled?
    pub fn dedup(&self) -> bool {
        self.dedup
    }

    /// Register a function and take one reference on its handle.
    ///
    /// With deduplication on, a function that is already registered keeps
    /// its id and gains a reference.
    pub fn register(&self, func: FunctionValue) -> CallbackId {
        let key = function_key(&func);
        let mut state = self.state.borrow_mut();

        if self.dedup {
            if let Some(id) = state.by_key.get(&key).cloned() {
                if let Some(entry) = state.entries.get_mut(&id) {
                    entry.refcount += 1;
                    return id;
                }
            }
        }

        state.next_id += 1;
        let id = CallbackId(format!("cb_{}", state.next_id));
        let owner = if func.identity().is_some() {
            OwnerSide::Guest
        } else {
            OwnerSide::Host
        };
        if self.dedup {
            state.by_key.insert(key.clone(), id.clone());
        }
        state.entries.insert(
            id.clone(),
            Entry {
                func,
                key,
                owner,
                refcount: 1,
            },
        );
        tracing::trace!(id = %id, "callback registered");
        id
    }

    /// Take an additional reference on an existing handle
    pub fn retain(&self, id: &CallbackId) -> Result<usize, RegistryError> {
        let mut state = self.state.borrow_mut();
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::HandleNotFound(id.clone()))?;
        entry.refcount += 1;
        Ok(entry.refcount)
    }

    /// Drop one reference; the handle is destroyed at zero.
    ///
    /// Returns the remaining reference count.
    pub fn release(&self, id: &CallbackId) -> Result<usize, RegistryError> {
        let removed = {
            let mut state = self.state.borrow_mut();
            let entry = state
                .entries
                .get_mut(id)
                .ok_or_else(|| RegistryError::HandleNotFound(id.clone()))?;
            entry.refcount -= 1;
            if entry.refcount > 0 {
                return Ok(entry.refcount);
            }
            let entry = state.entries.remove(id);
            if let Some(entry) = &entry {
                if state.by_key.get(&entry.key) == Some(id) {
                    state.by_key.remove(&entry.key);
                }
            }
            entry
        };
        // Proxies may run release hooks on drop; do it outside the borrow.
        drop(removed);
        tracing::trace!(id = %id, "callback destroyed");
        Ok(0)
    }

    /// Is the handle alive?
    pub fn has(&self, id: &CallbackId) -> bool {
        self.state.borrow().entries.contains_key(id)
    }

    /// Number of live handles
    pub fn count(&self) -> usize {
        self.state.borrow().entries.len()
    }

    /// Current reference count of a handle
    pub fn refcount(&self, id: &CallbackId) -> Option<usize> {
        self.state.borrow().entries.get(id).map(|e| e.refcount)
    }

    /// Metadata for a live handle
    pub fn handle(&self, id: &CallbackId) -> Option<CallbackHandle> {
        self.state.borrow().entries.get(id).map(|e| CallbackHandle {
            id: id.clone(),
            owner: e.owner,
        })
    }

    /// Look up the function behind a handle
    pub fn get(&self, id: &CallbackId) -> Option<FunctionValue> {
        self.state.borrow().entries.get(id).map(|e| e.func.clone())
    }

    /// Invoke synchronously.
    ///
    /// A throw inside the callee is logged and reported as `undefined`.
    /// Unknown handles and boundary failures propagate.
    pub fn invoke(&self, id: &CallbackId, args: &[RuntimeValue]) -> Result<RuntimeValue, CallError> {
        let func = self.lookup(id)?;
        match func.call(args) {
            Err(CallError::Thrown(err)) => {
                tracing::warn!(id = %id, error = %err, "callback threw");
                Ok(RuntimeValue::Undefined)
            }
            other => other,
        }
    }

    /// Invoke and wait for the result; throws and rejections propagate
    pub fn invoke_async(&self, id: &CallbackId, args: &[RuntimeValue]) -> Result<RuntimeValue, CallError> {
        let func = self.lookup(id)?;
        func.call_async(args)
    }

    /// Destroy every handle
    pub fn clear(&self) {
        let entries = {
            let mut state = self.state.borrow_mut();
            state.by_key.clear();
            std::mem::take(&mut state.entries)
        };
        drop(entries);
    }

    fn lookup(&self, id: &CallbackId) -> Result<FunctionValue, CallError> {
        self.get(id).ok_or_else(|| CallError::HandleNotFound(id.clone()))
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("count", &self.count())
            .field("dedup", &self.dedup)
            .finish()
    }
}
