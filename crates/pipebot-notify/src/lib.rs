//! Outbound replies for pipeline dispatch results.
//!
//! [`NotificationComposer`] turns dispatch outcomes into the requester reply
//! and an optional announcement; [`ChatTransport`] is the seam the chat
//! adapter implements.

pub mod notification_composer;
pub mod transport;

pub use notification_composer::{
    NotificationComposer, DONE_REPLY_PREFIX, MAX_DETAIL_CHARS, NOTHING_TO_RUN_REPLY,
};
pub use transport::{ChatTransport, OutboundMessage, RecordingTransport};
