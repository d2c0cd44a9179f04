use async_trait::async_trait;
use futures::{future::join_all, Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt::Display;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use url::Url;
use uuid::Uuid;

use crate::{config::Config, error::AppError, models::Event};

/// A bounded query for a single event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventQuery {
    pub kind: u16,
    pub limit: usize,
    pub timeout: Duration,
}

/// Events answering one query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventBatch {
    pub events: Vec<Event>,
    /// Events on the subscription that could not be decoded
    pub dropped: usize,
}

/// Anything that can answer event queries, usually a set of relays
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Fetch events matching `query`, returning once the source is exhausted
    /// or the query timeout elapses.
    async fn query(&self, query: &EventQuery) -> Result<EventBatch, AppError>;
}

/// Frames a relay sends to a client (NIP-01)
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { subscription: String, event: Event },
    InvalidEvent { subscription: String, reason: String },
    EndOfStoredEvents { subscription: String },
    Closed { subscription: String, message: String },
    Notice { message: String },
    Other(String),
}

impl RelayMessage {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let frame: Vec<Value> = serde_json::from_str(raw)?;
        let mut parts = frame.into_iter();

        let label = match parts.next() {
            Some(Value::String(label)) => label,
            _ => {
                return Err(AppError::ValidationError(
                    "Relay frame without a label".to_string(),
                ))
            }
        };

        let message = match label.as_str() {
            "EVENT" => {
                let subscription = next_string(&mut parts, &label, "a subscription id")?;
                match parts.next() {
                    Some(value) => match serde_json::from_value::<Event>(value) {
                        Ok(event) => RelayMessage::Event {
                            subscription,
                            event,
                        },
                        Err(e) => RelayMessage::InvalidEvent {
                            subscription,
                            reason: e.to_string(),
                        },
                    },
                    None => {
                        return Err(AppError::ValidationError(
                            "EVENT frame is missing the event".to_string(),
                        ))
                    }
                }
            }
            "EOSE" => RelayMessage::EndOfStoredEvents {
                subscription: next_string(&mut parts, &label, "a subscription id")?,
            },
            "CLOSED" => {
                let subscription = next_string(&mut parts, &label, "a subscription id")?;
                let message = next_string(&mut parts, &label, "a message").unwrap_or_default();
                RelayMessage::Closed {
                    subscription,
                    message,
                }
            }
            "NOTICE" => RelayMessage::Notice {
                message: next_string(&mut parts, &label, "a message")?,
            },
            _ => RelayMessage::Other(label.clone()),
        };

        Ok(message)
    }
}

fn next_string(
    parts: &mut impl Iterator<Item = Value>,
    label: &str,
    what: &str,
) -> Result<String, AppError> {
    match parts.next() {
        Some(Value::String(s)) => Ok(s),
        _ => Err(AppError::ValidationError(format!(
            "{} frame is missing {}",
            label, what
        ))),
    }
}

/// Queries every configured relay and merges their answers
#[derive(Debug, Clone)]
pub struct RelayPool {
    relays: Vec<Url>,
    connect_timeout: Duration,
}

impl RelayPool {
    pub fn new(relays: Vec<Url>, connect_timeout: Duration) -> Self {
        Self {
            relays,
            connect_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.relays.clone(), config.connect_timeout)
    }

    pub fn relays(&self) -> &[Url] {
        &self.relays
    }
}

#[async_trait]
impl EventSource for RelayPool {
    async fn query(&self, query: &EventQuery) -> Result<EventBatch, AppError> {
        let fetches = self
            .relays
            .iter()
            .map(|relay| fetch_from_relay(relay, query, self.connect_timeout));
        let results = join_all(fetches).await;

        merge_relay_batches(&self.relays, results, query.kind)
    }
}

/// Combine per-relay answers, keeping the first copy of each event id.
/// Fails only when every relay failed.
fn merge_relay_batches(
    relays: &[Url],
    results: Vec<Result<EventBatch, AppError>>,
    kind: u16,
) -> Result<EventBatch, AppError> {
    // The same event is usually served by several relays
    let mut seen = HashSet::new();
    let mut merged = EventBatch::default();
    let mut failures = 0;

    for (relay, result) in relays.iter().zip(results) {
        match result {
            Ok(batch) => {
                tracing::debug!(
                    "Relay {} returned {} events for kind {} ({} dropped)",
                    relay,
                    batch.events.len(),
                    kind,
                    batch.dropped
                );
                merged.dropped += batch.dropped;
                for event in batch.events {
                    if seen.insert(event.id.clone()) {
                        merged.events.push(event);
                    }
                }
            }
            Err(e) => {
                failures += 1;
                tracing::warn!("Relay {} failed for kind {}: {}", relay, kind, e);
            }
        }
    }

    if !relays.is_empty() && failures == relays.len() {
        return Err(AppError::RequestError(format!(
            "All {} relays failed for kind {}",
            failures, kind
        )));
    }

    Ok(merged)
}

/// Run one subscription against one relay
async fn fetch_from_relay(
    relay: &Url,
    query: &EventQuery,
    connect_timeout: Duration,
) -> Result<EventBatch, AppError> {
    let (mut ws, _) = tokio::time::timeout(connect_timeout, connect_async(relay.as_str()))
        .await
        .map_err(|_| AppError::TimeoutError(format!("Connecting to {} timed out", relay)))??;

    let subscription = Uuid::new_v4().simple().to_string();
    let request = json!(["REQ", subscription, {"kinds": [query.kind], "limit": query.limit}]);
    ws.send(Message::Text(request.to_string())).await?;

    let mut batch = EventBatch::default();
    match tokio::time::timeout(
        query.timeout,
        collect_events(&mut ws, &subscription, &mut batch),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(
            "Relay {} dropped kind {} subscription: {}, keeping {} events",
            relay,
            query.kind,
            e,
            batch.events.len()
        ),
        Err(_) => tracing::debug!(
            "Relay {} did not finish kind {} within {:?}, keeping {} events",
            relay,
            query.kind,
            query.timeout,
            batch.events.len()
        ),
    }

    close_subscription(&mut ws, &subscription, connect_timeout).await;

    Ok(batch)
}

/// Send CLOSE for the subscription and shut the connection, giving each step
/// at most `limit`
async fn close_subscription<W>(sink: &mut W, subscription: &str, limit: Duration)
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let close = json!(["CLOSE", subscription]);
    match tokio::time::timeout(limit, sink.send(Message::Text(close.to_string()))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Failed to close subscription {}: {}", subscription, e),
        Err(_) => tracing::debug!("Closing subscription {} timed out", subscription),
    }

    match tokio::time::timeout(limit, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Failed to close relay connection: {}", e),
        Err(_) => tracing::debug!("Closing relay connection timed out after {:?}", limit),
    }
}

/// Read frames until the relay signals the end of stored events
async fn collect_events<S>(
    stream: &mut S,
    subscription: &str,
    batch: &mut EventBatch,
) -> Result<(), AppError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let text = match frame? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        match RelayMessage::parse(&text) {
            Ok(RelayMessage::Event {
                subscription: sub,
                event,
            }) if sub == subscription => batch.events.push(event),
            Ok(RelayMessage::InvalidEvent {
                subscription: sub,
                reason,
            }) if sub == subscription => {
                tracing::warn!("Skipping malformed event: {}", reason);
                batch.dropped += 1;
            }
            Ok(RelayMessage::EndOfStoredEvents { subscription: sub }) if sub == subscription => {
                break
            }
            Ok(RelayMessage::Closed {
                subscription: sub,
                message,
            }) if sub == subscription => {
                tracing::warn!("Relay closed subscription: {}", message);
                break;
            }
            Ok(RelayMessage::Notice { message }) => tracing::info!("Relay notice: {}", message),
            Ok(_) => {}
            Err(e) => tracing::debug!("Skipping unparseable relay frame: {}", e),
        }
    }

    Ok(())
}
