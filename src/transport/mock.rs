//! In-memory transport for exercising the collection machinery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;

use super::{EntityRef, LiveEvent, MessageStream, RawValue, Transport, TransportError};
use crate::session::Credentials;

/// A failure injected into an entity's message stream: `after` items are
/// yielded first, then the error.
pub struct PlannedFailure {
    pub after: usize,
    pub error: TransportError,
}

/// Arguments of one `iter_messages` invocation.
#[derive(Debug, Clone)]
pub struct IterCall {
    pub entity: String,
    pub offset_date: Option<DateTime<Utc>>,
    pub min_id: i64,
}

#[derive(Default)]
struct MockState {
    histories: HashMap<String, Vec<RawValue>>,
    peer_ids: HashMap<String, i64>,
    resolvable: HashSet<String>,
    failures: HashMap<String, VecDeque<PlannedFailure>>,
    iter_calls: Vec<IterCall>,
    fetchable: HashMap<(i64, i64), RawValue>,
    full_channels: HashMap<i64, RawValue>,
    full_users: HashMap<i64, RawValue>,
    full_channel_calls: usize,
    full_user_calls: usize,
    start_plan: VecDeque<Result<(), TransportError>>,
    start_codes: Vec<Option<String>>,
    events: Option<mpsc::Receiver<LiveEvent>>,
    event_tx: Option<mpsc::Sender<LiveEvent>>,
    subscribe_calls: usize,
}

/// Scriptable in-memory transport.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity with its history, newest message first.
    pub fn add_history(&self, entity: &str, messages: Vec<RawValue>) {
        let mut state = self.state.lock().unwrap();
        state.resolvable.insert(entity.to_string());
        state.histories.insert(entity.to_string(), messages);
    }

    /// Register a resolvable entity with a canonical peer id.
    pub fn add_peer(&self, entity: &str, peer_id: i64) {
        let mut state = self.state.lock().unwrap();
        state.resolvable.insert(entity.to_string());
        state.peer_ids.insert(entity.to_string(), peer_id);
    }

    /// Inject a failure into the next stream opened for an entity.
    pub fn plan_failure(&self, entity: &str, after: usize, error: TransportError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(entity.to_string())
            .or_default()
            .push_back(PlannedFailure { after, error });
    }

    /// Queue an outcome for the next `start` call. Defaults to success.
    pub fn plan_start(&self, result: Result<(), TransportError>) {
        self.state.lock().unwrap().start_plan.push_back(result);
    }

    /// Make a single message fetchable by (channel_id, message_id).
    pub fn add_fetchable(&self, channel_id: i64, message_id: i64, message: RawValue) {
        self.state
            .lock()
            .unwrap()
            .fetchable
            .insert((channel_id, message_id), message);
    }

    pub fn add_full_channel(&self, channel_id: i64, value: RawValue) {
        self.state
            .lock()
            .unwrap()
            .full_channels
            .insert(channel_id, value);
    }

    pub fn add_full_user(&self, user_id: i64, value: RawValue) {
        self.state.lock().unwrap().full_users.insert(user_id, value);
    }

    /// Create the live event channel; the returned sender feeds events to
    /// whatever subscribes later.
    pub fn events_channel(&self, capacity: usize) -> mpsc::Sender<LiveEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        let mut state = self.state.lock().unwrap();
        state.events = Some(rx);
        state.event_tx = Some(tx.clone());
        tx
    }

    pub fn iter_calls(&self) -> Vec<IterCall> {
        self.state.lock().unwrap().iter_calls.clone()
    }

    pub fn full_channel_calls(&self) -> usize {
        self.state.lock().unwrap().full_channel_calls
    }

    pub fn full_user_calls(&self) -> usize {
        self.state.lock().unwrap().full_user_calls
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().unwrap().subscribe_calls
    }

    pub fn start_codes(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().start_codes.clone()
    }
}

fn message_id(message: &RawValue) -> i64 {
    match message.get("id") {
        Some(RawValue::Int(id)) => *id,
        _ => 0,
    }
}

fn message_date(message: &RawValue) -> Option<DateTime<Utc>> {
    match message.get("date") {
        Some(RawValue::Date(date)) => Some(*date),
        Some(RawValue::Int(epoch)) => Utc.timestamp_opt(*epoch, 0).single(),
        _ => None,
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(
        &self,
        _session_path: &Path,
        _credentials: &Credentials,
        code: Option<&str>,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.start_codes.push(code.map(String::from));
        state.start_plan.pop_front().unwrap_or(Ok(()))
    }

    async fn disconnect(&self) {}

    fn iter_messages(
        &self,
        entity: &EntityRef,
        offset_date: Option<DateTime<Utc>>,
        min_id: i64,
    ) -> MessageStream<'_> {
        let mut state = self.state.lock().unwrap();
        let key = entity.to_string();
        state.iter_calls.push(IterCall {
            entity: key.clone(),
            offset_date,
            min_id,
        });

        let planned = state
            .failures
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());

        let matching: Vec<RawValue> = state
            .histories
            .get(&key)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|m| message_id(m) > min_id)
            .filter(|m| match (offset_date, message_date(m)) {
                (Some(bound), Some(date)) => date <= bound,
                _ => true,
            })
            .collect();

        let items: Vec<Result<RawValue, TransportError>> = match planned {
            Some(PlannedFailure { after, error }) => matching
                .into_iter()
                .take(after)
                .map(Ok)
                .chain(std::iter::once(Err(error)))
                .collect(),
            None => matching.into_iter().map(Ok).collect(),
        };

        Box::pin(futures::stream::iter(items))
    }

    async fn get_entity(&self, entity: &EntityRef) -> Result<RawValue, TransportError> {
        let state = self.state.lock().unwrap();
        let key = entity.to_string();
        if state.resolvable.contains(&key) {
            let id = state.peer_ids.get(&key).copied().unwrap_or_default();
            Ok(RawValue::object("Channel", [("id", RawValue::Int(id))]))
        } else {
            Err(TransportError::InvalidIdentifier(key))
        }
    }

    async fn get_peer_id(&self, entity: &EntityRef) -> Result<i64, TransportError> {
        let state = self.state.lock().unwrap();
        let key = entity.to_string();
        state
            .peer_ids
            .get(&key)
            .copied()
            .ok_or(TransportError::InvalidIdentifier(key))
    }

    async fn get_message(
        &self,
        channel_id: i64,
        message_id: i64,
    ) -> Result<RawValue, TransportError> {
        let state = self.state.lock().unwrap();
        state
            .fetchable
            .get(&(channel_id, message_id))
            .cloned()
            .ok_or_else(|| {
                TransportError::InvalidIdentifier(format!("{}/{}", channel_id, message_id))
            })
    }

    async fn full_channel(&self, channel_id: i64) -> Result<RawValue, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.full_channel_calls += 1;
        state
            .full_channels
            .get(&channel_id)
            .cloned()
            .ok_or_else(|| TransportError::InvalidIdentifier(channel_id.to_string()))
    }

    async fn full_user(&self, user_id: i64) -> Result<RawValue, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.full_user_calls += 1;
        state
            .full_users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| TransportError::InvalidIdentifier(user_id.to_string()))
    }

    async fn subscribe(
        &self,
        _entities: &[EntityRef],
    ) -> Result<mpsc::Receiver<LiveEvent>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.subscribe_calls += 1;
        match state.events.take() {
            Some(rx) => Ok(rx),
            None => {
                // keep the sender alive so the channel stays open
                let (tx, rx) = mpsc::channel(16);
                state.event_tx = Some(tx);
                Ok(rx)
            }
        }
    }
}

/// Build a plausible raw message for tests, with chat and sender attached.
pub fn message(id: i64, epoch: i64, body: &str, channel_id: i64) -> RawValue {
    RawValue::object(
        "Message",
        [
            ("id", RawValue::Int(id)),
            (
                "date",
                RawValue::Date(Utc.timestamp_opt(epoch, 0).single().unwrap()),
            ),
            ("message", RawValue::Str(body.to_string())),
            ("action", RawValue::Null),
            (
                "_chat",
                RawValue::object(
                    "Channel",
                    [
                        ("id", RawValue::Int(channel_id)),
                        ("username", RawValue::Str(format!("chan{}", channel_id))),
                    ],
                ),
            ),
            (
                "_sender",
                RawValue::object(
                    "User",
                    [
                        ("id", RawValue::Int(500 + id)),
                        ("username", RawValue::Str(format!("user{}", id))),
                        ("bot", RawValue::Bool(false)),
                    ],
                ),
            ),
        ],
    )
}
