use chrono::{DateTime, Utc};

use super::registry::Registry;
use super::tags::{typed_tags, TagKind};
use crate::error::AppError;
use crate::models::{
    AnnouncementObservation, Event, EventKind, ResultObservation, VendorIdentity,
    RESULT_EXCERPT_LIMIT,
};
use crate::utils::truncate_chars;

/// Which query phase an event was fetched in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Announcement,
    Result,
    Request,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Announcement => "announcement",
            Phase::Result => "result",
            Phase::Request => "request",
        }
    }

    /// Whether an event of `kind` belongs in this phase
    pub fn accepts(&self, kind: u16) -> bool {
        matches!(
            (self, EventKind::classify(kind)),
            (Phase::Announcement, EventKind::Announcement)
                | (Phase::Result, EventKind::JobResult)
                | (Phase::Request, EventKind::JobRequest)
        )
    }
}

/// What a single merge did to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Announcement {
        vendor: VendorIdentity,
        created: bool,
        new_services: usize,
    },
    Result {
        vendor: VendorIdentity,
        created: bool,
    },
    Request {
        /// Identities whose request count was incremented, one entry per matching tag
        credited: Vec<VendorIdentity>,
    },
}

/// Totals for one batch of events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub applied: usize,
    pub skipped: usize,
}

/// Merge one event into the registry.
///
/// `now` is the observation time recorded as `discovered_at` and used to
/// advance `last_seen`. On error the registry is left unchanged.
pub fn merge(
    registry: &mut Registry,
    event: &Event,
    phase: Phase,
    now: DateTime<Utc>,
) -> Result<MergeOutcome, AppError> {
    if !phase.accepts(event.kind) {
        return Err(AppError::ValidationError(format!(
            "Event {} has kind {}, not a {} kind",
            event.id,
            event.kind,
            phase.name()
        )));
    }

    match phase {
        Phase::Announcement => merge_announcement(registry, event, now),
        Phase::Result => merge_result(registry, event, now),
        Phase::Request => Ok(merge_request(registry, event)),
    }
}

fn merge_announcement(
    registry: &mut Registry,
    event: &Event,
    now: DateTime<Utc>,
) -> Result<MergeOutcome, AppError> {
    let vendor = event.author()?;
    let created = !registry.contains(&vendor);
    let record = registry.get_or_create(vendor, now)?;

    record.announcements.push(AnnouncementObservation {
        event_id: event.id.clone(),
        created_at: event.created_at,
        content: event.content.clone(),
        tags: event.tags.clone(),
        discovered_at: now,
    });
    record.touch(now);

    let mut new_services = 0;
    for tag in typed_tags(&event.tags) {
        match tag.kind {
            TagKind::ServiceId => {
                if record.add_service(tag.value) {
                    new_services += 1;
                }
            }
            // Logged only; supported kinds are not part of the record
            TagKind::SupportedKind => tracing::info!("  DVM supports kind: {}", tag.value),
            TagKind::PubkeyRef => {}
        }
    }

    tracing::info!(
        "Discovered DVM: {} | Services: {}",
        vendor.abbreviated(),
        record.services.len()
    );

    Ok(MergeOutcome::Announcement {
        vendor,
        created,
        new_services,
    })
}

fn merge_result(
    registry: &mut Registry,
    event: &Event,
    now: DateTime<Utc>,
) -> Result<MergeOutcome, AppError> {
    let vendor = event.author()?;
    let created = !registry.contains(&vendor);
    let record = registry.get_or_create(vendor, now)?;

    record.results.push(ResultObservation {
        event_id: event.id.clone(),
        kind: event.kind,
        created_at: event.created_at,
        content_excerpt: truncate_chars(&event.content, RESULT_EXCERPT_LIMIT),
        discovered_at: now,
    });
    record.touch(now);

    tracing::info!(
        "Found DVM result from: {} (kind {})",
        vendor.abbreviated(),
        event.kind
    );

    Ok(MergeOutcome::Result { vendor, created })
}

// Requests are authored by customers; only their `p` targets matter, and only
// targets already in the registry are credited.
fn merge_request(registry: &mut Registry, event: &Event) -> MergeOutcome {
    let mut credited = Vec::new();

    for tag in typed_tags(&event.tags).filter(|t| t.kind == TagKind::PubkeyRef) {
        let target = match tag.value.parse::<VendorIdentity>() {
            Ok(target) => target,
            Err(_) => {
                tracing::debug!("Ignoring malformed request target {:?}", tag.value);
                continue;
            }
        };

        match registry.get_mut(&target) {
            Some(record) => {
                record.request_count += 1;
                credited.push(target);
            }
            None => tracing::debug!(
                "Request {} targets unknown vendor {}",
                event.id,
                target.abbreviated()
            ),
        }
    }

    MergeOutcome::Request { credited }
}

/// Merge a batch in order. Malformed events are logged and skipped.
pub fn ingest(
    registry: &mut Registry,
    events: &[Event],
    phase: Phase,
    now: DateTime<Utc>,
) -> BatchStats {
    let mut stats = BatchStats::default();

    for event in events {
        match merge(registry, event, phase, now) {
            Ok(outcome) => {
                match outcome {
                    MergeOutcome::Announcement {
                        vendor,
                        created,
                        new_services,
                    } if created || new_services > 0 => tracing::debug!(
                        "Vendor {} (new: {}) gained {} services",
                        vendor.abbreviated(),
                        created,
                        new_services
                    ),
                    MergeOutcome::Result {
                        vendor,
                        created: true,
                    } => tracing::debug!("New vendor from result: {}", vendor.abbreviated()),
                    MergeOutcome::Request { credited } if !credited.is_empty() => {
                        tracing::debug!(
                            "Request {} credited {} vendor targets",
                            event.id,
                            credited.len()
                        )
                    }
                    _ => {}
                }
                stats.applied += 1;
            }
            Err(e) => {
                tracing::warn!("Error processing {} event {}: {}", phase.name(), event.id, e);
                stats.skipped += 1;
            }
        }
    }

    stats
}
