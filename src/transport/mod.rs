//! Upstream messaging transport interface.
//!
//! The MTProto client itself is an external collaborator: this module
//! defines the seam the collection machinery runs against. A transport
//! owns the wire session and translates upstream objects into [`RawValue`]
//! trees at the boundary; everything above it is transport-agnostic.

mod entity;
#[cfg(test)]
pub mod mock;
mod value;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::mpsc;

pub use entity::EntityRef;
pub use value::{RawValue, TYPE_KEY};

use crate::session::Credentials;

/// Errors surfaced by the upstream API.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("entity '{0}' is private")]
    PrivateEntity(String),

    #[error("entity '{0}' does not seem to exist")]
    InvalidIdentifier(String),

    #[error("rate-limited, wait of {seconds}s required")]
    RateLimited { seconds: u64 },

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("request timed out")]
    Timeout,

    #[error("session is no longer authorized")]
    AuthExpired,

    #[error("a login code was sent and must be supplied")]
    CodeRequested,

    #[error("connection failed: {0}")]
    Connection(String),
}

/// Live events delivered while listening on a set of entities.
///
/// Event callbacks are deliberately absent: transports push immutable
/// events onto a channel and the single worker loop drains it each tick,
/// so no accumulator state is shared across the concurrency boundary.
#[derive(Debug, Clone)]
pub enum LiveEvent {
    /// A message was posted in one of the watched entities.
    NewMessage(RawValue),
    /// A message in a watched channel was forwarded elsewhere. The
    /// referenced message must be fetched before it can be normalized.
    ForwardNotice { channel_id: i64, message_id: i64 },
}

/// Lazy sequence of raw messages, newest first.
pub type MessageStream<'a> = BoxStream<'a, Result<RawValue, TransportError>>;

/// Connection to the upstream messaging API.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open or resume the session stored at `session_path`.
    ///
    /// A missing or fresh artifact triggers a login: the upstream side
    /// sends a verification code to the account, and the transport fails
    /// with [`TransportError::CodeRequested`] until `code` carries it.
    /// A stale artifact fails with [`TransportError::AuthExpired`].
    /// On success the artifact is created or refreshed on disk.
    async fn start(
        &self,
        session_path: &Path,
        credentials: &Credentials,
        code: Option<&str>,
    ) -> Result<(), TransportError>;

    /// Tear down the connection. Safe to call when not connected.
    async fn disconnect(&self);

    /// Iterate an entity's history in reverse chronological order.
    ///
    /// `offset_date` bounds the newest message returned; only messages
    /// with id strictly greater than `min_id` are yielded.
    fn iter_messages(
        &self,
        entity: &EntityRef,
        offset_date: Option<DateTime<Utc>>,
        min_id: i64,
    ) -> MessageStream<'_>;

    /// Resolve an entity reference to its upstream object.
    async fn get_entity(&self, entity: &EntityRef) -> Result<RawValue, TransportError>;

    /// Resolve an entity reference to its canonical peer id.
    async fn get_peer_id(&self, entity: &EntityRef) -> Result<i64, TransportError>;

    /// Fetch a single message by channel and message id.
    async fn get_message(
        &self,
        channel_id: i64,
        message_id: i64,
    ) -> Result<RawValue, TransportError>;

    /// Fetch full metadata for a channel reference.
    async fn full_channel(&self, channel_id: i64) -> Result<RawValue, TransportError>;

    /// Fetch full metadata for a user reference.
    async fn full_user(&self, user_id: i64) -> Result<RawValue, TransportError>;

    /// Subscribe to live events for the given entities.
    async fn subscribe(
        &self,
        entities: &[EntityRef],
    ) -> Result<mpsc::Receiver<LiveEvent>, TransportError>;
}
