//! In-process pub/sub for run lifecycle events.
//!
//! Every listener is delivered events synchronously, in the order they were
//! emitted, before `emit` returns to its caller, mirroring the ordering
//! guarantee the specification places on `run:complete`/`run:fail` versus a
//! concurrent `triggerAndWait` subscription. A panicking listener is caught
//! and reported rather than poisoning the rest of the delivery fan-out.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use super::types::{Event, EventKind};

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

enum Filter {
    Any,
    Kind(&'static str),
    Run(String),
    Job(String),
}

impl Filter {
    fn matches(&self, event: &Event) -> bool {
        match self {
            Filter::Any => true,
            Filter::Kind(kind) => event.kind_name() == *kind,
            Filter::Run(run_id) => event.run_id() == Some(run_id.as_str()),
            // `log:write` carries no `job_name`, so a job-scoped subscriber
            // never sees it — only unfiltered (`Filter::Any`) subscribers do.
            Filter::Job(job_name) => {
                event.kind_name() != "log:write" && event.job_name() == Some(job_name.as_str())
            }
        }
    }
}

struct Registration {
    filter: Filter,
    listener: Listener,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    listeners: HashMap<u64, Registration>,
}

struct Shared {
    sequence: AtomicU64,
    inner: Mutex<Inner>,
}

/// Cheaply cloneable; every clone shares the same listener table and
/// sequence counter.
#[derive(Clone)]
pub struct EventEmitter {
    shared: Arc<Shared>,
}

/// Guard returned by the various `on_*` methods. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    shared: Arc<Shared>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.inner.lock().unwrap().listeners.remove(&self.id);
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                sequence: AtomicU64::new(0),
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    pub fn emit(&self, kind: EventKind) -> Event {
        let event = Event {
            kind,
            sequence: self.shared.sequence.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
        };
        let matching: Vec<Listener> = {
            let inner = self.shared.inner.lock().unwrap();
            inner
                .listeners
                .values()
                .filter(|reg| reg.filter.matches(&event))
                .map(|reg| reg.listener.clone())
                .collect()
        };
        for listener in matching {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::error!("event listener panicked");
            }
        }
        event
    }

    pub fn on_any<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(Filter::Any, listener)
    }

    pub fn on_kind<F>(&self, kind: &'static str, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(Filter::Kind(kind), listener)
    }

    pub fn on_run<F>(&self, run_id: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(Filter::Run(run_id.into()), listener)
    }

    pub fn on_job<F>(&self, job_name: impl Into<String>, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(Filter::Job(job_name.into()), listener)
    }

    fn register<F>(&self, filter: Filter, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut inner = self.shared.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.insert(
            id,
            Registration {
                filter,
                listener: Arc::new(listener),
            },
        );
        drop(inner);
        Subscription {
            id,
            shared: self.shared.clone(),
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
