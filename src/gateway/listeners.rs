use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::{common::errors::LinkResult, gateway::types::GatewayPayload};

pub type ListenerFuture = BoxFuture<'static, LinkResult<()>>;
pub type Listener = Arc<dyn Fn(GatewayPayload) -> ListenerFuture + Send + Sync>;
pub type Validator = Arc<dyn Fn(&GatewayPayload) -> bool + Send + Sync>;

/// Matches on opcode and, optionally, on a set of dispatch event names.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerFilter {
    op: u8,
    events: Option<HashSet<String>>,
}

impl ListenerFilter {
    pub fn op(op: u8) -> Self {
        Self { op, events: None }
    }

    pub fn events<I, S>(op: u8, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            op,
            events: Some(names.into_iter().map(Into::into).collect()),
        }
    }

    pub fn matches(&self, payload: &GatewayPayload) -> bool {
        payload.op == self.op
            && self.events.as_ref().is_none_or(|names| {
                payload
                    .event_name()
                    .is_some_and(|name| names.contains(name))
            })
    }
}

/// Returned by `add_listener`; pass it back to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

struct Entry {
    id: u64,
    filter: ListenerFilter,
    listener: Listener,
}

/// Ordered table of listeners, built up explicitly at runtime.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    entries: RwLock<Vec<Entry>>,
}

impl ListenerRegistry {
    pub fn add(&self, filter: ListenerFilter, listener: Listener) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().push(Entry {
            id,
            filter,
            listener,
        });
        ListenerHandle(id)
    }

    pub fn remove(&self, handle: ListenerHandle) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.id != handle.0);
        entries.len() != before
    }

    pub fn matching(&self, payload: &GatewayPayload) -> Vec<Listener> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.filter.matches(payload))
            .map(|e| e.listener.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Describes a one-shot wait for a gateway message.
#[derive(Clone)]
pub struct EventWait {
    pub(crate) filter: ListenerFilter,
    pub(crate) validator: Option<Validator>,
    pub(crate) timeout: Option<Duration>,
}

impl EventWait {
    pub fn op(op: u8) -> Self {
        Self::filter(ListenerFilter::op(op))
    }

    pub fn event(op: u8, name: &str) -> Self {
        Self::filter(ListenerFilter::events(op, [name]))
    }

    pub fn filter(filter: ListenerFilter) -> Self {
        Self {
            filter,
            validator: None,
            timeout: None,
        }
    }

    /// Only messages for which `f` returns true resolve the wait.
    pub fn validate(mut self, f: impl Fn(&GatewayPayload) -> bool + Send + Sync + 'static) -> Self {
        self.validator = Some(Arc::new(f));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
