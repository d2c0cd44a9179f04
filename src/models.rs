use bech32::{Bech32, Hrp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use crate::error::AppError;
use crate::utils::timestamp;

/// NIP-90 service announcement (NIP-89 handler information)
pub const ANNOUNCEMENT_KIND: u16 = 31990;
/// NIP-90 job request kinds
pub const JOB_REQUEST_KINDS: Range<u16> = 5000..6000;
/// NIP-90 job result kinds
pub const JOB_RESULT_KINDS: Range<u16> = 6000..7000;
/// NIP-90 job feedback
pub const JOB_FEEDBACK_KIND: u16 = 7000;

/// Maximum number of characters of result content kept per observation
pub const RESULT_EXCERPT_LIMIT: usize = 500;

/// Protocol role of an event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Announcement,
    JobRequest,
    JobResult,
    JobFeedback,
    Other,
}

impl EventKind {
    pub fn classify(kind: u16) -> Self {
        match kind {
            ANNOUNCEMENT_KIND => EventKind::Announcement,
            JOB_FEEDBACK_KIND => EventKind::JobFeedback,
            k if JOB_REQUEST_KINDS.contains(&k) => EventKind::JobRequest,
            k if JOB_RESULT_KINDS.contains(&k) => EventKind::JobResult,
            _ => EventKind::Other,
        }
    }
}

/// A Nostr event as served by relays
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    #[serde(default, deserialize_with = "lenient_tags")]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub sig: String,
}

/// Tag elements should be strings, but some relays serve numbers or booleans.
/// Those are kept in their JSON text form so the rest of the tag stays usable.
fn lenient_tags<'de, D>(deserializer: D) -> Result<Vec<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<Vec<Value>>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|tag| {
            tag.into_iter()
                .map(|element| match element {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect()
        })
        .collect())
}

impl Event {
    /// The event author as a vendor identity
    pub fn author(&self) -> Result<VendorIdentity, AppError> {
        self.pubkey.parse()
    }
}

/// 32-byte public key identifying a vendor
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VendorIdentity([u8; 32]);

impl VendorIdentity {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// NIP-19 `npub` encoding
    pub fn to_bech32(&self) -> Result<String, AppError> {
        let hrp = Hrp::parse("npub").map_err(|e| AppError::ValidationError(e.to_string()))?;
        bech32::encode::<Bech32>(hrp, &self.0)
            .map_err(|e| AppError::ValidationError(format!("Failed to encode npub: {}", e)))
    }

    /// First 16 hex characters followed by an ellipsis
    pub fn abbreviated(&self) -> String {
        format!("{}...", &self.to_hex()[..16])
    }
}

impl FromStr for VendorIdentity {
    type Err = AppError;

    /// Accepts only the canonical form: 64 lowercase hex characters
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(AppError::ValidationError(format!(
                "Invalid public key {:?}: hex must be lowercase",
                s
            )));
        }

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| {
            AppError::ValidationError(format!("Invalid public key {:?}: {}", s, e))
        })?;
        Ok(VendorIdentity(bytes))
    }
}

impl fmt::Display for VendorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for VendorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VendorIdentity({})", self.to_hex())
    }
}

impl Serialize for VendorIdentity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for VendorIdentity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Aggregated knowledge about a single vendor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VendorRecord {
    #[serde(rename = "pubkey")]
    pub identity: VendorIdentity,
    pub npub: String,
    #[serde(with = "timestamp")]
    pub first_seen: DateTime<Utc>,
    #[serde(with = "timestamp::option", default)]
    last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub announcements: Vec<AnnouncementObservation>,
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
    #[serde(default)]
    pub results: Vec<ResultObservation>,
    #[serde(default)]
    pub request_count: u64,
}

impl VendorRecord {
    pub fn new(identity: VendorIdentity, now: DateTime<Utc>) -> Result<Self, AppError> {
        Ok(VendorRecord {
            npub: identity.to_bech32()?,
            identity,
            first_seen: now,
            last_seen: Some(now),
            announcements: Vec::new(),
            services: Vec::new(),
            results: Vec::new(),
            request_count: 0,
        })
    }

    /// Latest observation time; records from older snapshots may lack one
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen.unwrap_or(self.first_seen)
    }

    /// Advance `last_seen`, never moving it backwards
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_seen = Some(self.last_seen().max(at));
    }

    pub fn has_service(&self, service_id: &str) -> bool {
        self.services.iter().any(|s| s.id == service_id)
    }

    /// Add a service unless one with the same id is known. Returns whether it was added
    pub fn add_service(&mut self, service_id: &str) -> bool {
        if self.has_service(service_id) {
            return false;
        }
        self.services.push(ServiceDescriptor::unknown(service_id));
        true
    }
}

/// Snapshot of one announcement event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnnouncementObservation {
    pub event_id: String,
    pub created_at: i64,
    pub content: String,
    pub tags: Vec<Vec<String>>,
    #[serde(with = "timestamp")]
    pub discovered_at: DateTime<Utc>,
}

/// A service offered by a vendor, unique by id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceDescriptor {
    pub id: String,
    #[serde(rename = "type")]
    pub kind_tag: String,
}

impl ServiceDescriptor {
    pub fn unknown(id: &str) -> Self {
        ServiceDescriptor {
            id: id.to_string(),
            kind_tag: "unknown".to_string(),
        }
    }
}

/// Snapshot of one job result event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultObservation {
    pub event_id: String,
    pub kind: u16,
    pub created_at: i64,
    #[serde(rename = "content")]
    pub content_excerpt: String,
    #[serde(with = "timestamp")]
    pub discovered_at: DateTime<Utc>,
}
