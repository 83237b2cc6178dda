//! `im2-events`: pipeline events and their transport abstraction.
//!
//! The job store is the source of truth; events are a notification stream
//! for observers (dashboards, notifiers, log shippers).

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::{PipelineEvent, PipelineEventKind};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
