//! Observable progress and status stream.
//!
//! The scheduler publishes a [`TransferEvent`] on every throttled progress
//! update and every state transition. Subscribers pick a scope with
//! [`EventFilter`]: everything, one resource, or one unit.
//!
//! Delivery uses `tokio::sync::broadcast`. A subscriber that falls more than
//! the buffer size behind receives [`RecvError::Lagged`] and keeps going;
//! [`RecvError::Closed`] means the scheduler has shut down.

use serde::Serialize;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::RecvError;

use crate::store::{PauseReason, RecordStatus, TaskId, TaskStatus};

/// Default buffer size for the event channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

/// A change observable by the UI/playback layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferEvent {
    /// Throttled byte progress of one unit.
    TaskProgress {
        id: TaskId,
        bytes_transferred: u64,
        bytes_total: Option<u64>,
    },
    /// A unit changed lifecycle state. `Removed` units carry no status.
    TaskStatusChanged {
        id: TaskId,
        status: Option<TaskStatus>,
        pause_reason: Option<PauseReason>,
        retry_count: u32,
        error: Option<String>,
    },
    /// A resource's aggregate changed.
    ResourceChanged {
        resource_id: String,
        status: RecordStatus,
        completed_units: u32,
        total_units: u32,
        fraction: f64,
    },
    /// A resource and all its files were deleted.
    ResourceRemoved { resource_id: String },
}

impl TransferEvent {
    /// Resource the event belongs to.
    #[must_use]
    pub fn resource_id(&self) -> &str {
        match self {
            Self::TaskProgress { id, .. } | Self::TaskStatusChanged { id, .. } => &id.resource_id,
            Self::ResourceChanged { resource_id, .. } | Self::ResourceRemoved { resource_id } => {
                resource_id
            }
        }
    }

    /// Unit the event belongs to, for unit-level events.
    #[must_use]
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::TaskProgress { id, .. } | Self::TaskStatusChanged { id, .. } => Some(id),
            Self::ResourceChanged { .. } | Self::ResourceRemoved { .. } => None,
        }
    }
}

/// Which events a stream yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    /// Unit and aggregate events of one resource.
    Resource(String),
    /// Events of a single unit.
    Unit(TaskId),
}

impl EventFilter {
    #[must_use]
    pub fn matches(&self, event: &TransferEvent) -> bool {
        match self {
            Self::All => true,
            Self::Resource(resource_id) => event.resource_id() == resource_id,
            Self::Unit(id) => event.task_id() == Some(id),
        }
    }
}

/// Publisher side, shared by the scheduler and the façade.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TransferEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes to all current subscribers. Having none is not an error.
    pub fn emit(&self, event: TransferEvent) {
        let _ = self.sender.send(event);
    }

    #[must_use]
    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Filtered subscription.
#[derive(Debug)]
pub struct EventStream {
    receiver: broadcast::Receiver<TransferEvent>,
    filter: EventFilter,
}

impl EventStream {
    /// Next matching event.
    ///
    /// # Errors
    ///
    /// [`RecvError::Lagged`] when events were dropped for this subscriber;
    /// [`RecvError::Closed`] once the bus is gone.
    pub async fn recv(&mut self) -> Result<TransferEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    #[must_use]
    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }
}
