//! Collector-side ingestion of exporter batches
//!
//! Batches are authenticated against the project registry, validated event
//! by event, appended to the event store and handed to the detection
//! engine's bounded queues.

mod gateway;
mod registry;
mod store;
mod validate;

pub use gateway::{IngestGateway, IngestReceipt, RETRY_AFTER_SECS};
pub use registry::{hash_credential, ProjectRegistry, StaticRegistry};
pub use store::{EventStore, JsonlEventStore, MemoryEventStore};
pub use validate::{validate_event, ValidationLimits};
