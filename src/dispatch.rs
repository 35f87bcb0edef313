// src/dispatch.rs
//
// Listener registry and fan-out of tagged samples.
//
// Registration has set semantics keyed on the listener's identity (the
// `Arc` allocation). Dispatch snapshots the set under the lock and calls
// listeners after releasing it, so a listener may add or remove listeners
// (itself included) without deadlocking. A listener that errors or panics is
// logged and skipped; the rest still receive the sample.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use crate::io::{Sample, Transport};

/// Consumer of tagged samples
pub trait SampleListener: Send + Sync {
    fn on_sample(&self, sample: &Sample, source: Transport) -> anyhow::Result<()>;
}

impl<F> SampleListener for F
where
    F: Fn(&Sample, Transport) -> anyhow::Result<()> + Send + Sync,
{
    fn on_sample(&self, sample: &Sample, source: Transport) -> anyhow::Result<()> {
        self(sample, source)
    }
}

pub type ListenerHandle = Arc<dyn SampleListener>;

#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<ListenerHandle>>,
}

fn same_listener(a: &ListenerHandle, b: &ListenerHandle) -> bool {
    // Compare data pointers only; vtable pointers can differ across codegen units
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`. Returns false if it was already registered.
    pub fn add(&self, listener: ListenerHandle) -> bool {
        let mut guard = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        guard.push(listener);
        true
    }

    /// Unregister `listener`. Returns false if it was not registered.
    pub fn remove(&self, listener: &ListenerHandle) -> bool {
        let mut guard = match self.listeners.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = guard.len();
        guard.retain(|l| !same_listener(l, listener));
        guard.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver one sample to every listener, in registration order.
    /// Returns how many listeners accepted it.
    pub fn dispatch(&self, sample: &Sample, source: Transport) -> usize {
        let snapshot: Vec<ListenerHandle> = match self.listeners.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        let mut delivered = 0;
        for listener in &snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener.on_sample(sample, source))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => tracing::warn!("[dispatch] Listener failed on {} sample: {:#}", source, e),
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!("[dispatch] Listener panicked on {} sample: {}", source, msg);
                }
            }
        }
        delivered
    }
}
