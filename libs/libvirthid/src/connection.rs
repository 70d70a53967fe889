//! Per-client connection state

use std::sync::{Arc, Weak};

use tracing::debug;

use crate::dispatch::{self, MethodCall, MethodReply};
use crate::error::{Error, Result};
use crate::memory::{TaskId, TaskMemory};
use crate::provider::Provider;
use crate::subscription::{self, NotifyThrottle, SubscriberSlot};

/// One attached client
///
/// Created when a client attaches and shared with the provider only through
/// [`ConnectionRef`], so the provider never keeps a detached client alive.
pub struct Connection {
    task: Arc<dyn TaskMemory>,
    provider: Arc<dyn Provider>,
    subscriber: SubscriberSlot,
    throttle: NotifyThrottle,
    this: Weak<Connection>,
}

impl Connection {
    /// Attach a client task to a provider
    pub fn new(
        task: Arc<dyn TaskMemory>,
        provider: Arc<dyn Provider>,
        throttle: NotifyThrottle,
    ) -> Arc<Self> {
        debug!("{}: connection opened", task.task_id());
        Arc::new_cyclic(|this| Self {
            task,
            provider,
            subscriber: SubscriberSlot::default(),
            throttle,
            this: this.clone(),
        })
    }

    /// Identity of the owning client task
    pub fn task_id(&self) -> TaskId {
        self.task.task_id()
    }

    /// Handle a client request
    pub fn external_method(&self, selector: u32, call: MethodCall) -> Result<MethodReply> {
        dispatch::dispatch(self, selector, call)
    }

    /// Deliver a provider-originated report to the subscriber
    pub fn notify(&self, report: &[u8]) -> Result<()> {
        subscription::notify(self, report)
    }

    /// Whether a subscription target is registered
    pub fn has_subscriber(&self) -> bool {
        self.subscriber.is_registered()
    }

    /// Client detach: release the subscription target
    pub fn close(&self) {
        if self.subscriber.clear() {
            debug!("{}: subscriber released on close", self.task_id());
        }
        debug!("{}: connection closed", self.task_id());
    }

    /// Non-owning handle for the provider
    pub fn downgrade(&self) -> ConnectionRef {
        ConnectionRef(self.this.clone())
    }

    pub(crate) fn task(&self) -> &dyn TaskMemory {
        self.task.as_ref()
    }

    pub(crate) fn provider(&self) -> &dyn Provider {
        self.provider.as_ref()
    }

    pub(crate) fn subscriber(&self) -> &SubscriberSlot {
        &self.subscriber
    }

    pub(crate) fn throttle(&self) -> &NotifyThrottle {
        &self.throttle
    }
}

impl core::fmt::Debug for Connection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Connection")
            .field("task", &self.task_id())
            .field("subscribed", &self.has_subscriber())
            .field("throttle", &self.throttle)
            .finish()
    }
}

/// Provider-side handle to a connection
#[derive(Clone)]
pub struct ConnectionRef(Weak<Connection>);

impl ConnectionRef {
    /// Deliver a report; fails if the client has detached
    pub fn notify(&self, report: &[u8]) -> Result<()> {
        let conn = self
            .0
            .upgrade()
            .ok_or(Error::FailedPrecondition("connection closed"))?;
        conn.notify(report)
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.0.upgrade().map(|conn| conn.task_id())
    }

    /// Check whether both handles refer to the same connection
    pub fn same_connection(&self, other: &ConnectionRef) -> bool {
        Weak::ptr_eq(&self.0, &other.0)
    }
}

impl core::fmt::Debug for ConnectionRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.task_id() {
            Some(id) => write!(f, "ConnectionRef({})", id),
            None => f.write_str("ConnectionRef(closed)"),
        }
    }
}
