//! Entity collection loop.
//!
//! Drives the historical backfill: one entity at a time (upstream rate
//! limits are shared, so nothing is gained by fetching in parallel),
//! paginating newest-first inside the requested date window, normalizing
//! every accepted message and handing batches to the segment store. After
//! the backfill, continuous mode transfers control to
//! [`continuous::ContinuousEngine`].

pub mod continuous;
mod query;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub use continuous::ContinuousEngine;
pub use query::{CollectionQuery, QueryError, MAX_ENTITIES_PER_QUERY};

use crate::normalize::{flatten, to_canonical_record};
use crate::repository::{StoreError, SubfileRecord};
use crate::segments::SegmentStore;
use crate::session::AuthError;
use crate::sink::RemoteSink;
use crate::status::StatusReporter;
use crate::transport::{EntityRef, Transport, TransportError};

/// Tuning knobs for the retry/backoff state machine.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Rate-limit waits at or above this many seconds abort the run's
    /// remaining entities instead of blocking.
    pub rate_limit_ceiling_secs: u64,
    /// Transient-timeout retries per entity before it is skipped.
    pub max_retries: u32,
    /// First retry delay; doubles on every further retry.
    pub retry_base_delay_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            rate_limit_ceiling_secs: 600,
            max_retries: 3,
            retry_base_delay_secs: 10,
        }
    }
}

/// External signals a running collection reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    None,
    /// Finish cleanly: flush what is pending, bundle, exit.
    Stop,
    /// Abort: unwind with [`CollectError::Interrupted`].
    Cancel,
}

/// Shared interrupt flag, checked at every blocking point.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicU8>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(1, Ordering::SeqCst);
    }

    pub fn request_cancel(&self) {
        self.0.store(2, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    pub fn get(&self) -> Interrupt {
        match self.0.load(Ordering::SeqCst) {
            1 => Interrupt::Stop,
            2 => Interrupt::Cancel,
            _ => Interrupt::None,
        }
    }

    pub fn is_raised(&self) -> bool {
        self.get() != Interrupt::None
    }
}

/// Per-run mutable state.
///
/// The resolution caches live here, not in any global: a new run starts
/// with empty caches and nothing is persisted.
pub struct RunContext {
    /// Successfully resolved references, by peer id.
    pub details_cache: HashMap<i64, Value>,
    /// References that failed to resolve; never retried within a run.
    pub failures_cache: HashSet<i64>,
    /// True only while every entity has been collected without any
    /// recoverable error.
    pub flawless: bool,
    pub interrupt: InterruptFlag,
}

impl RunContext {
    pub fn new(interrupt: InterruptFlag) -> Self {
        Self {
            details_cache: HashMap::new(),
            failures_cache: HashSet::new(),
            flawless: true,
            interrupt,
        }
    }
}

/// Fatal collection errors. Recoverable per-entity failures are handled
/// inside the loop and only flip the run's flawless flag.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("interrupted while fetching message data from the Telegram API")]
    Interrupted,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Remote destination for flushed segments.
#[derive(Clone, Copy)]
pub struct UploadTarget<'a> {
    pub sink: &'a dyn RemoteSink,
    pub folder_id: &'a str,
}

/// Summary of a finished collection run.
#[derive(Debug)]
pub struct RunOutcome {
    pub records_written: usize,
    pub flawless: bool,
    pub segments: Vec<String>,
}

/// Collect the historical backfill for every entity in the query.
///
/// Returns flattened messages in discovery order: newest first within
/// each entity, entities in request order. Callers must reverse a batch
/// before persisting it.
pub async fn collect_entities(
    transport: &dyn Transport,
    query: &CollectionQuery,
    ctx: &mut RunContext,
    config: &CollectorConfig,
    reporter: &dyn StatusReporter,
    markers: &HashMap<String, i64>,
) -> Result<Vec<Value>, CollectError> {
    let mut collected: Vec<Value> = Vec::new();
    let mut work: Vec<EntityRef> = query.entities.clone();
    let mut completed = 0usize;
    let mut no_additional_entities = false;

    let mut index = 0;
    while index < work.len() {
        let entity = work[index].clone();
        index += 1;

        if no_additional_entities {
            reporter.update_status(
                &format!("Rate-limited by Telegram; not collecting entity '{}'", entity),
                false,
            );
            completed += 1;
            reporter.update_progress(completed as f64 / work.len() as f64);
            continue;
        }

        let mut min_id = 0i64;
        if query.continuous && !markers.is_empty() {
            reporter.update_status(
                "This is a restarted continuous collection; only retrieving messages missed since then",
                false,
            );
            if let Ok(peer_id) = transport.get_peer_id(&entity).await {
                if let Some(marker) = markers.get(&peer_id.to_string()) {
                    min_id = *marker;
                }
            }
        }

        let mut accepted = 0usize;
        let mut seen = 0usize;
        let mut retries = 0u32;
        let mut delay = config.retry_base_delay_secs;
        let mut reply_channel_added = false;
        let mut last_id: Option<i64> = None;
        // on retry, everything at or above this id has been handled
        let mut skip_at_or_above: Option<i64> = None;

        'attempt: loop {
            if ctx.interrupt.is_raised() {
                return Err(CollectError::Interrupted);
            }
            reporter.update_status(&format!("Fetching messages for entity '{}'", entity), false);

            let mut stream = transport.iter_messages(&entity, query.max_date, min_id);
            let outcome: Result<(), TransportError> = loop {
                let item = match stream.next().await {
                    Some(item) => item,
                    None => break Ok(()),
                };
                let raw = match item {
                    Ok(raw) => raw,
                    Err(e) => break Err(e),
                };

                if ctx.interrupt.is_raised() {
                    return Err(CollectError::Interrupted);
                }

                let mut message = flatten(&raw);
                let message_id = message.get("id").and_then(Value::as_i64).unwrap_or(0);
                if let Some(boundary) = skip_at_or_above {
                    if message_id >= boundary {
                        continue;
                    }
                }

                seen += 1;
                if seen % 100 == 0 {
                    reporter.update_status(
                        &format!("Retrieved {} messages for entity '{}'", seen, entity),
                        false,
                    );
                }

                // e.g. someone joining the channel is not an actual message
                let is_action = message
                    .get("action")
                    .map(|a| !a.is_null())
                    .unwrap_or(false);
                if is_action && !query.include_non_message_events {
                    continue;
                }

                if query.retrieve_linked_replies && !reply_channel_added {
                    if let Some(channel_id) = message
                        .get("replies")
                        .and_then(|r| r.get("channel_id"))
                        .and_then(Value::as_i64)
                    {
                        let reply_channel = EntityRef::NumericId(channel_id);
                        // resolve it once now so the session has it cached
                        let _ = transport.get_entity(&reply_channel).await;
                        if !work.contains(&reply_channel) {
                            reporter.update_status(
                                &format!(
                                    "Reply channel '{}' found and added to the collection queue",
                                    channel_id
                                ),
                                false,
                            );
                            work.push(reply_channel);
                        }
                        reply_channel_added = true;
                    }
                }

                if query.resolve_references {
                    message = resolve_value(transport, ctx, message).await;
                }

                // stop as soon as the window's lower bound is crossed
                if let (Some(min_date), Some(date)) =
                    (query.min_date, message.get("date").and_then(Value::as_i64))
                {
                    if date < min_date {
                        break Ok(());
                    }
                }

                last_id = Some(message_id);
                collected.push(message);
                accepted += 1;
                if accepted >= query.max_items_per_entity {
                    break Ok(());
                }
            };
            drop(stream);

            match outcome {
                Ok(()) => break 'attempt,
                Err(TransportError::PrivateEntity(_)) => {
                    reporter.update_status(
                        &format!("Entity '{}' is private, skipping", entity),
                        false,
                    );
                    ctx.flawless = false;
                    break 'attempt;
                }
                Err(TransportError::InvalidIdentifier(_)) => {
                    reporter.update_status(
                        &format!(
                            "Could not collect entity '{}', it does not seem to exist, skipping",
                            entity
                        ),
                        false,
                    );
                    ctx.flawless = false;
                    break 'attempt;
                }
                Err(TransportError::MalformedRequest(detail)) => {
                    reporter.update_status(
                        &format!(
                            "Error '{}' while collecting entity '{}', skipping",
                            detail, entity
                        ),
                        false,
                    );
                    ctx.flawless = false;
                    break 'attempt;
                }
                Err(TransportError::RateLimited { seconds }) => {
                    if seconds < config.rate_limit_ceiling_secs {
                        reporter.update_status(
                            &format!("Rate-limited by Telegram, waiting {}s", seconds),
                            false,
                        );
                        tokio::time::sleep(Duration::from_secs(seconds)).await;
                        skip_at_or_above = last_id;
                        continue 'attempt;
                    }
                    reporter.update_status(
                        &format!(
                            "Telegram wait grew to {} minutes, not attempting further entities",
                            seconds / 60
                        ),
                        false,
                    );
                    ctx.flawless = false;
                    no_additional_entities = true;
                    break 'attempt;
                }
                Err(TransportError::Timeout) => {
                    if retries >= config.max_retries {
                        reporter.update_status(
                            &format!(
                                "Fetching messages for entity '{}' timed out {} times, skipping",
                                entity, retries
                            ),
                            false,
                        );
                        ctx.flawless = false;
                        break 'attempt;
                    }
                    retries += 1;
                    reporter.update_status(
                        &format!(
                            "Timeout from Telegram while fetching messages for entity '{}', trying again in {}s",
                            entity, delay
                        ),
                        false,
                    );
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    delay *= 2;
                    skip_at_or_above = last_id;
                    continue 'attempt;
                }
                Err(e) => return Err(e.into()),
            }
        }

        completed += 1;
        reporter.update_progress(completed as f64 / work.len() as f64);
    }

    Ok(collected)
}

/// Recursively resolve embedded peer references in a flattened message.
///
/// Channel and user references are replaced with their full metadata,
/// fetched on demand. Lookups that succeed land in the run's details
/// cache; lookups that fail land in the negative cache so the same
/// reference is never retried within the run.
fn resolve_value<'a>(
    transport: &'a dyn Transport,
    ctx: &'a mut RunContext,
    value: Value,
) -> BoxFuture<'a, Value> {
    Box::pin(async move {
        let fields = match value {
            Value::Object(fields) => fields,
            other => return other,
        };

        let tag = fields
            .get("_type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        if tag == "InputPeerChannel" || tag == "PeerChannel" {
            if let Some(channel_id) = fields.get("channel_id").and_then(Value::as_i64) {
                if ctx.failures_cache.contains(&channel_id) {
                    return Value::Object(fields);
                }
                if !ctx.details_cache.contains_key(&channel_id) {
                    match transport.full_channel(channel_id).await {
                        Ok(raw) => {
                            ctx.details_cache.insert(channel_id, flatten(&raw));
                        }
                        Err(e) => {
                            ctx.failures_cache.insert(channel_id);
                            debug!(
                                "Cannot resolve channel {} ({}), leaving as-is",
                                channel_id, e
                            );
                            return Value::Object(fields);
                        }
                    }
                }
                let mut resolved = ctx
                    .details_cache
                    .get(&channel_id)
                    .cloned()
                    .unwrap_or_else(|| Value::Object(fields));
                if let Value::Object(map) = &mut resolved {
                    map.insert("channel_id".to_string(), Value::from(channel_id));
                }
                return resolved;
            }
            return Value::Object(fields);
        }

        if tag == "PeerUser" {
            if let Some(user_id) = fields.get("user_id").and_then(Value::as_i64) {
                if ctx.failures_cache.contains(&user_id) {
                    return Value::Object(fields);
                }
                if !ctx.details_cache.contains_key(&user_id) {
                    match transport.full_user(user_id).await {
                        Ok(raw) => {
                            ctx.details_cache.insert(user_id, flatten(&raw));
                        }
                        Err(e) => {
                            ctx.failures_cache.insert(user_id);
                            debug!("Cannot resolve user {} ({}), leaving as-is", user_id, e);
                            return Value::Object(fields);
                        }
                    }
                }
                return ctx
                    .details_cache
                    .get(&user_id)
                    .cloned()
                    .unwrap_or_else(|| Value::Object(fields));
            }
            return Value::Object(fields);
        }

        let mut resolved = serde_json::Map::new();
        for (key, field_value) in fields {
            let resolved_value = if field_value.is_object() {
                resolve_value(transport, &mut *ctx, field_value).await
            } else {
                field_value
            };
            resolved.insert(key, resolved_value);
        }
        Value::Object(resolved)
    })
}

/// Upload a flushed segment to the remote sink, best effort.
pub(crate) async fn upload_segment(
    store: &SegmentStore,
    record: &mut SubfileRecord,
    target: UploadTarget<'_>,
) {
    let path = Path::new(&record.file_path).to_path_buf();
    match target
        .sink
        .upload(&path, store.format().mime_type(), target.folder_id)
        .await
    {
        Ok(remote_id) => {
            debug!("Uploaded {} as remote file {}", path.display(), remote_id);
            if let Err(e) = store.mark_uploaded(record) {
                warn!("Could not record upload of {}: {}", path.display(), e);
            }
        }
        Err(e) => {
            warn!(
                "Failed to upload {} to remote storage, continuing with collection: {}",
                path.display(),
                e
            );
        }
    }
}

/// Run a full collection: backfill, flush, and (if requested) continuous
/// listening until stopped.
pub async fn run_collection(
    transport: &dyn Transport,
    query: &CollectionQuery,
    store: &SegmentStore,
    upload: Option<UploadTarget<'_>>,
    reporter: &dyn StatusReporter,
    config: &CollectorConfig,
    interrupt: InterruptFlag,
) -> Result<RunOutcome, CollectError> {
    let mut ctx = RunContext::new(interrupt);
    let markers = store.checkpoint_markers()?;
    let initial_file = markers.is_empty();

    let flat = collect_entities(transport, query, &mut ctx, config, reporter, &markers).await?;

    // messages arrive newest-first; the persisted file is oldest-first
    let mut records: Vec<_> = flat.iter().map(to_canonical_record).collect();
    records.reverse();
    let mut records_written = records.len();

    let written = store.flush(&records, initial_file)?;
    let wrote_backfill = written.is_some();
    if let (Some(mut record), Some(target)) = (written, upload) {
        upload_segment(store, &mut record, target).await;
    }

    if query.continuous {
        let engine = ContinuousEngine::new(config.clone());
        let claim_initial = initial_file && !wrote_backfill;
        records_written += engine
            .run(transport, query, &mut ctx, store, upload, reporter, claim_initial)
            .await?;
        reporter.update_status("Stopping ongoing collection due to user request.", false);
    }

    if !ctx.flawless {
        reporter.update_status(
            "Collection completed, but some requested entities were unavailable (they may \
             have been private). Check the log file for details.",
            true,
        );
    }

    Ok(RunOutcome {
        records_written,
        flawless: ctx.flawless,
        segments: store
            .registered_segments()?
            .into_iter()
            .map(|record| record.file_path)
            .collect(),
    })
}
