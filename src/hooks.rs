//! Lifecycle hooks around key state transitions.
//!
//! The event set is fixed and each event carries a fixed set of fields, so
//! registering against an unknown event or firing with the wrong shape is a
//! compile error rather than a runtime one. Each event holds three callback
//! lists: `before`, `after`, and an `around` chain composed right-to-left so
//! the first-registered around is outermost. Firing order: all befores in
//! registration order, then the around chain wrapping the body, then all
//! afters.

use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::broker::protocol::WorkerConfig;
use crate::job::Job;

/// A lifecycle event. Variants borrow from the call site; observers that
/// need to retain data must copy it out.
#[derive(Debug)]
pub enum Event<'a> {
    Error {
        worker: &'a str,
        job: &'a Job,
        error: &'a str,
    },
    ExceptionalExit {
        worker: &'a str,
        error: &'a str,
    },
    Execute {
        worker: &'a str,
    },
    InvokeJob {
        job: &'a Job,
    },
    Loop {
        worker: &'a str,
    },
    Perform {
        worker: &'a str,
        job: &'a Job,
    },
    Pop {
        worker: &'a str,
    },
    Retry {
        worker: &'a str,
        job: &'a Job,
        error: &'a str,
    },
    WorkQueuePop {
        server: &'a str,
        config: &'a WorkerConfig,
    },
    CheckForWork {
        server: &'a str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Error,
    ExceptionalExit,
    Execute,
    InvokeJob,
    Loop,
    Perform,
    Pop,
    Retry,
    WorkQueuePop,
    CheckForWork,
}

impl Event<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Error { .. } => EventKind::Error,
            Event::ExceptionalExit { .. } => EventKind::ExceptionalExit,
            Event::Execute { .. } => EventKind::Execute,
            Event::InvokeJob { .. } => EventKind::InvokeJob,
            Event::Loop { .. } => EventKind::Loop,
            Event::Perform { .. } => EventKind::Perform,
            Event::Pop { .. } => EventKind::Pop,
            Event::Retry { .. } => EventKind::Retry,
            Event::WorkQueuePop { .. } => EventKind::WorkQueuePop,
            Event::CheckForWork { .. } => EventKind::CheckForWork,
        }
    }
}

type HookFn = Box<dyn Fn(&Event<'_>) + Send + Sync>;
type AroundFn =
    Box<dyn for<'a> Fn(&'a Event<'a>, BoxFuture<'a, ()>) -> BoxFuture<'a, ()> + Send + Sync>;

/// Registry of lifecycle callbacks. Registration happens at startup, before
/// the registry is shared; firing takes `&self`.
#[derive(Default)]
pub struct Callbacks {
    before: HashMap<EventKind, Vec<HookFn>>,
    after: HashMap<EventKind, Vec<HookFn>>,
    around: HashMap<EventKind, Vec<AroundFn>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before(&mut self, kind: EventKind, f: impl Fn(&Event<'_>) + Send + Sync + 'static) {
        self.before.entry(kind).or_default().push(Box::new(f));
    }

    pub fn after(&mut self, kind: EventKind, f: impl Fn(&Event<'_>) + Send + Sync + 'static) {
        self.after.entry(kind).or_default().push(Box::new(f));
    }

    /// Register an around callback. The callback receives the event and the
    /// inner action as a boxed future and must drive it (observers that
    /// swallow the inner future suppress the action).
    pub fn around(
        &mut self,
        kind: EventKind,
        f: impl for<'a> Fn(&'a Event<'a>, BoxFuture<'a, ()>) -> BoxFuture<'a, ()>
            + Send
            + Sync
            + 'static,
    ) {
        self.around.entry(kind).or_default().push(Box::new(f));
    }

    /// Fire an event with no wrapped body: all befores, then all afters.
    pub fn fire(&self, event: &Event<'_>) {
        let kind = event.kind();
        if let Some(hooks) = self.before.get(&kind) {
            for hook in hooks {
                hook(event);
            }
        }
        if let Some(hooks) = self.after.get(&kind) {
            for hook in hooks {
                hook(event);
            }
        }
    }

    /// Fire an event around an async body: befores, then the around chain
    /// with `body` innermost, then afters.
    pub async fn wrap<'a>(&'a self, event: &'a Event<'a>, body: BoxFuture<'a, ()>) {
        let kind = event.kind();
        if let Some(hooks) = self.before.get(&kind) {
            for hook in hooks {
                hook(event);
            }
        }
        let mut composed = body;
        if let Some(chain) = self.around.get(&kind) {
            for layer in chain.iter().rev() {
                composed = layer(event, composed);
            }
        }
        composed.await;
        if let Some(hooks) = self.after.get(&kind) {
            for hook in hooks {
                hook(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static LOG: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    // Tests in this module share LOG; serialize them.
    static GUARD: Mutex<()> = Mutex::new(());

    fn log(entry: &'static str) {
        LOG.lock().unwrap().push(entry);
    }

    fn outer<'a>(_event: &'a Event<'a>, inner: BoxFuture<'a, ()>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            log("outer:in");
            inner.await;
            log("outer:out");
        })
    }

    fn inner_layer<'a>(_event: &'a Event<'a>, inner: BoxFuture<'a, ()>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            log("inner:in");
            inner.await;
            log("inner:out");
        })
    }

    #[tokio::test]
    async fn firing_order_is_befores_arounds_body_afters() {
        let mut callbacks = Callbacks::new();
        callbacks.before(EventKind::Execute, |_| log("before:1"));
        callbacks.before(EventKind::Execute, |_| log("before:2"));
        // First-registered around is outermost.
        callbacks.around(EventKind::Execute, outer);
        callbacks.around(EventKind::Execute, inner_layer);
        callbacks.after(EventKind::Execute, |_| log("after:1"));

        let _guard = GUARD.lock().unwrap();
        LOG.lock().unwrap().clear();
        let event = Event::Execute { worker: "w1" };
        callbacks
            .wrap(&event, Box::pin(async { log("body") }))
            .await;

        assert_eq!(
            *LOG.lock().unwrap(),
            vec![
                "before:1", "before:2", "outer:in", "inner:in", "body", "inner:out", "outer:out",
                "after:1",
            ]
        );
    }

    #[tokio::test]
    async fn fire_runs_befores_then_afters() {
        let mut callbacks = Callbacks::new();
        callbacks.before(EventKind::Pop, |_| log("pop:before"));
        callbacks.after(EventKind::Pop, |_| log("pop:after"));

        let _guard = GUARD.lock().unwrap();
        LOG.lock().unwrap().clear();
        callbacks.fire(&Event::Pop { worker: "w1" });
        assert_eq!(*LOG.lock().unwrap(), vec!["pop:before", "pop:after"]);
    }

    #[tokio::test]
    async fn events_without_registrations_are_no_ops() {
        let callbacks = Callbacks::new();
        callbacks.fire(&Event::Loop { worker: "w1" });
        let event = Event::Execute { worker: "w1" };
        let mut ran = false;
        callbacks
            .wrap(&event, Box::pin(async { ran = true }))
            .await;
        assert!(ran);
    }
}
