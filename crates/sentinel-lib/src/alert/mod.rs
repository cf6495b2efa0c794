//! Alert dispatch for detected anomalies
//!
//! Anomalies are deduplicated, gated by a per-channel cooldown and fanned
//! out to the project's email, Slack and webhook channels with bounded
//! retries.

mod channels;
mod dispatcher;
mod payload;

pub use channels::{
    ChannelAdapter, EmailAdapter, EmailProvider, EmailSettings, SlackAdapter, WebhookAdapter,
    DEFAULT_CHANNEL_TIMEOUT,
};
pub use dispatcher::{
    AlertDispatcher, DeliveryLog, DispatchReport, DEFAULT_DEDUP_BUCKET_SECS, DEFAULT_LOG_CAPACITY,
};
pub use payload::AlertPayload;
