//! Continuous collection engine.
//!
//! After the historical backfill, a continuous collection keeps listening
//! for new and forwarded messages on the requested entities. The engine
//! is a single cooperative loop: each tick drains the transport's event
//! channel, then checks (in priority order) the flush condition, the stop
//! signal, the configured end time, and the cancel signal. Every flush
//! goes through the segment store and advances the checkpoint markers, so
//! a crash between ticks loses nothing that was flushed.

use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::sync::mpsc::error::TryRecvError;
use tracing::debug;

use super::{
    upload_segment, CollectError, CollectorConfig, CollectionQuery, Interrupt, RunContext,
    UploadTarget,
};
use crate::normalize::{flatten, to_canonical_record, NormalizedRecord};
use crate::segments::SegmentStore;
use crate::status::StatusReporter;
use crate::transport::{EntityRef, LiveEvent, Transport, TransportError};

const TICK: Duration = Duration::from_millis(100);

/// Event-driven listener that collects until stopped.
pub struct ContinuousEngine {
    config: CollectorConfig,
    tick: Duration,
}

/// Whether the listening loop should keep running after an event.
enum EventOutcome {
    KeepListening,
    EndListening,
}

impl ContinuousEngine {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config, tick: TICK }
    }

    /// Listen on the query's entities until a terminal condition.
    ///
    /// `claim_initial` marks that no segment has been written yet this
    /// run, so the first flush claims the primary output path. Returns
    /// the number of records flushed while listening.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        transport: &dyn Transport,
        query: &CollectionQuery,
        ctx: &mut RunContext,
        store: &SegmentStore,
        upload: Option<UploadTarget<'_>>,
        reporter: &dyn StatusReporter,
        claim_initial: bool,
    ) -> Result<usize, CollectError> {
        reporter.update_status(
            "Checking that the entities to collect from still exist",
            false,
        );

        let mut live: Vec<EntityRef> = Vec::new();
        for entity in &query.entities {
            match transport.get_entity(entity).await {
                Ok(_) => live.push(entity.clone()),
                Err(
                    TransportError::InvalidIdentifier(_)
                    | TransportError::PrivateEntity(_)
                    | TransportError::MalformedRequest(_),
                ) => {
                    reporter.update_status(
                        &format!(
                            "Could not poll entity '{}', it does not seem to exist, skipping",
                            entity
                        ),
                        false,
                    );
                    ctx.flawless = false;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if live.is_empty() {
            reporter.update_status(
                "None of the listed entities could be found. Exiting collection",
                false,
            );
            return Ok(0);
        }

        reporter.update_status("Adding listeners for new and forwarded messages", false);
        let mut events = transport.subscribe(&live).await?;
        reporter.update_status("Listening for new messages", false);

        let mut pending: Vec<NormalizedRecord> = Vec::new();
        let mut flushed_total = 0usize;
        let mut claim_initial = claim_initial;
        let mut last_day: NaiveDate = Utc::now().date_naive();

        loop {
            tokio::time::sleep(self.tick).await;

            let mut end_listening = false;
            loop {
                if ctx.interrupt.get() == Interrupt::Cancel {
                    return Err(CollectError::Interrupted);
                }
                match events.try_recv() {
                    Ok(event) => {
                        let outcome = self
                            .handle_event(transport, ctx, reporter, &mut pending, event)
                            .await;
                        if matches!(outcome, EventOutcome::EndListening) {
                            end_listening = true;
                            break;
                        }
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }

            // 1. flush: enough pending records, or the day rolled over
            // with anything at all pending
            let today = Utc::now().date_naive();
            let day_rolled = today != last_day;
            last_day = today;
            if pending.len() >= query.max_items_per_entity || (day_rolled && !pending.is_empty())
            {
                flushed_total += self
                    .flush(store, upload, &mut pending, &mut claim_initial)
                    .await?;
            }

            // 2. clean stop: flush the tail and bundle everything
            if ctx.interrupt.get() == Interrupt::Stop {
                if !pending.is_empty() {
                    reporter
                        .update_status("Saving latest messages before stopping collection", false);
                    flushed_total += self
                        .flush(store, upload, &mut pending, &mut claim_initial)
                        .await?;
                }
                store.bundle_archive()?;
                return Ok(flushed_total);
            }

            // 3. configured end of collection
            if let Some(max_date) = query.max_date {
                if Utc::now() > max_date {
                    reporter.update_status(
                        &format!(
                            "Stopping ongoing collection due to requested max date: {}",
                            max_date
                        ),
                        false,
                    );
                    return Ok(flushed_total);
                }
            }

            // 4. hard interruption
            if ctx.interrupt.get() == Interrupt::Cancel {
                return Err(CollectError::Interrupted);
            }

            if end_listening {
                return Ok(flushed_total);
            }
        }
    }

    async fn flush(
        &self,
        store: &SegmentStore,
        upload: Option<UploadTarget<'_>>,
        pending: &mut Vec<NormalizedRecord>,
        claim_initial: &mut bool,
    ) -> Result<usize, CollectError> {
        // events arrive in chronological order, which is the on-disk order
        let written = store.flush(pending, *claim_initial)?;
        *claim_initial = false;
        let count = pending.len();
        pending.clear();

        if let (Some(mut record), Some(target)) = (written, upload) {
            upload_segment(store, &mut record, target).await;
        }
        Ok(count)
    }

    /// Turn one live event into a pending record.
    ///
    /// Forwarded-message notifications need a follow-up fetch, which is
    /// subject to the same rate-limit and timeout policy as pagination;
    /// an unrecoverable rate limit ends the listening phase.
    async fn handle_event(
        &self,
        transport: &dyn Transport,
        ctx: &mut RunContext,
        reporter: &dyn StatusReporter,
        pending: &mut Vec<NormalizedRecord>,
        event: LiveEvent,
    ) -> EventOutcome {
        match event {
            LiveEvent::NewMessage(raw) => {
                debug!("New message received");
                pending.push(to_canonical_record(&flatten(&raw)));
                EventOutcome::KeepListening
            }
            LiveEvent::ForwardNotice {
                channel_id,
                message_id,
            } => {
                reporter.update_status(
                    "Forwarded message found, retrieving the referenced message",
                    false,
                );
                let mut retries = 0u32;
                let mut delay = self.config.retry_base_delay_secs;
                loop {
                    match transport.get_message(channel_id, message_id).await {
                        Ok(raw) => {
                            pending.push(to_canonical_record(&flatten(&raw)));
                            return EventOutcome::KeepListening;
                        }
                        Err(TransportError::RateLimited { seconds }) => {
                            if seconds < self.config.rate_limit_ceiling_secs {
                                reporter.update_status(
                                    &format!("Rate-limited by Telegram, waiting {}s", seconds),
                                    false,
                                );
                                tokio::time::sleep(Duration::from_secs(seconds)).await;
                            } else {
                                reporter.update_status(
                                    &format!(
                                        "Telegram wait grew to {} minutes, ending collection",
                                        seconds / 60
                                    ),
                                    false,
                                );
                                ctx.flawless = false;
                                return EventOutcome::EndListening;
                            }
                        }
                        Err(TransportError::Timeout) => {
                            if retries >= self.config.max_retries {
                                reporter.update_status(
                                    &format!(
                                        "Retrieving message {} from channel {} timed out {} times, dropping it",
                                        message_id, channel_id, retries
                                    ),
                                    false,
                                );
                                ctx.flawless = false;
                                return EventOutcome::KeepListening;
                            }
                            retries += 1;
                            tokio::time::sleep(Duration::from_secs(delay)).await;
                            delay *= 2;
                        }
                        Err(e) => {
                            reporter.update_status(
                                &format!(
                                    "Could not retrieve message {} from channel {}: {}",
                                    message_id, channel_id, e
                                ),
                                false,
                            );
                            return EventOutcome::KeepListening;
                        }
                    }
                }
            }
        }
    }
}
