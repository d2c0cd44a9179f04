use chrono::{SecondsFormat, Utc};

use super::aggregator::{ingest, Phase};
use super::registry::{Registry, RegistryStore};
use super::relay::{EventQuery, EventSource};
use crate::{config::Config, error::AppError, models::ANNOUNCEMENT_KIND};

/// Service ids listed per vendor in the summary
const SUMMARY_SERVICE_LIMIT: usize = 5;

/// Counters for one scan phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseReport {
    pub queries: usize,
    pub failed_queries: usize,
    pub fetched: usize,
    pub applied: usize,
    pub skipped: usize,
}

/// Outcome of a complete scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub announcements: PhaseReport,
    pub results: PhaseReport,
    pub requests: PhaseReport,
    pub vendors: usize,
}

/// Runs the announcement, result and request phases against an event source
pub struct Scanner<S> {
    config: Config,
    source: S,
    store: RegistryStore,
}

impl<S: EventSource> Scanner<S> {
    pub fn new(config: Config, source: S) -> Self {
        let store = RegistryStore::new(&config.data_file);
        Self {
            config,
            source,
            store,
        }
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    /// Queries issued for a phase, in order
    pub fn plan(&self, phase: Phase) -> Vec<EventQuery> {
        let timeout = self.config.query_timeout;
        let per_kind = |kind| EventQuery {
            kind,
            limit: self.config.kind_limit,
            timeout,
        };

        match phase {
            Phase::Announcement => vec![EventQuery {
                kind: ANNOUNCEMENT_KIND,
                limit: self.config.announcement_limit,
                timeout,
            }],
            Phase::Result => self.config.result_kinds.clone().map(per_kind).collect(),
            Phase::Request => self.config.request_kinds.clone().map(per_kind).collect(),
        }
    }

    /// Run every query of a phase sequentially, merging each batch once it is complete
    pub async fn run_phase(&self, registry: &mut Registry, phase: Phase) -> PhaseReport {
        let mut report = PhaseReport::default();

        for query in self.plan(phase) {
            report.queries += 1;

            let batch = match self.source.query(&query).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(
                        "Error scanning {} events (kind {}): {}",
                        phase.name(),
                        query.kind,
                        e
                    );
                    report.failed_queries += 1;
                    continue;
                }
            };

            tracing::info!(
                "Found {} {} events for kind {}",
                batch.events.len(),
                phase.name(),
                query.kind
            );
            if batch.dropped > 0 {
                tracing::warn!(
                    "Skipped {} malformed {} events for kind {}",
                    batch.dropped,
                    phase.name(),
                    query.kind
                );
            }

            // Undecodable events never reach the aggregator but still count as skipped
            let stats = ingest(registry, &batch.events, phase, Utc::now());
            report.fetched += batch.events.len() + batch.dropped;
            report.applied += stats.applied;
            report.skipped += stats.skipped + batch.dropped;
        }

        report
    }

    /// Run all phases in order on `registry`, then save it
    pub async fn run(&self, registry: &mut Registry) -> Result<ScanReport, AppError> {
        tracing::info!(
            "Subscribing to NIP-90 DVM announcements (kind {})...",
            ANNOUNCEMENT_KIND
        );
        let announcements = self.run_phase(registry, Phase::Announcement).await;

        tracing::info!(
            "Scanning for recent DVM result events (kinds {}-{})...",
            self.config.result_kinds.start,
            self.config.result_kinds.end.saturating_sub(1)
        );
        let results = self.run_phase(registry, Phase::Result).await;

        tracing::info!(
            "Scanning for recent DVM request events (kinds {}-{})...",
            self.config.request_kinds.start,
            self.config.request_kinds.end.saturating_sub(1)
        );
        let requests = self.run_phase(registry, Phase::Request).await;

        self.store.save(registry).await?;

        Ok(ScanReport {
            announcements,
            results,
            requests,
            vendors: registry.len(),
        })
    }

    /// Load the previous registry, scan, save and log a summary
    pub async fn scan(&self) -> Result<(Registry, ScanReport), AppError> {
        tracing::info!("{}", "=".repeat(80));
        tracing::info!("Starting NIP-90 DVM Scanner");
        tracing::info!("{}", "=".repeat(80));

        let mut registry = self.store.load().await;
        tracing::info!(
            "Loaded {} existing vendors from previous scans",
            registry.len()
        );

        let report = self.run(&mut registry).await?;

        for line in render_summary(&registry, &self.config) {
            tracing::info!("{}", line);
        }

        Ok((registry, report))
    }
}

/// Human-readable summary of the registry, one line per entry
pub fn render_summary(registry: &Registry, config: &Config) -> Vec<String> {
    let rule = "=".repeat(80);
    let mut lines = vec![
        rule.clone(),
        format!(
            "SCAN COMPLETE - Discovered {} unique DVM vendors",
            registry.len()
        ),
        rule.clone(),
    ];

    for (identity, vendor) in registry.iter() {
        lines.push(format!("Vendor: {}", identity.abbreviated()));
        lines.push(format!("  NPub: {}", vendor.npub));
        lines.push(format!(
            "  First Seen: {}",
            vendor.first_seen.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        lines.push(format!(
            "  Last Seen: {}",
            vendor.last_seen().to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        lines.push(format!("  Announcements: {}", vendor.announcements.len()));
        lines.push(format!("  Services: {}", vendor.services.len()));
        lines.push(format!("  Results Found: {}", vendor.results.len()));
        lines.push(format!("  Request Count: {}", vendor.request_count));
        for service in vendor.services.iter().take(SUMMARY_SERVICE_LIMIT) {
            lines.push(format!("    - Service: {}", service.id));
        }
    }

    lines.push(rule.clone());
    lines.push(format!("All data saved to: {}", config.data_file.display()));
    lines.push(format!("Master log saved to: {}", config.log_file.display()));
    lines.push(rule);
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::relay::EventBatch;
    use crate::models::{Event, VendorIdentity};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const X: &str = "3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d";
    const Y: &str = "82341f882b6eabcd2ba7f1ef90aad961cf074af15b9ef44a09f9d2a8fbfbe6a2";
    const Z: &str = "e88a691e98d9987c964521dff60025f60700378a4879180dcbbb4a5027850411";

    /// In-memory source answering from canned batches, recording every query
    #[derive(Default)]
    struct StaticSource {
        batches: HashMap<u16, Vec<Event>>,
        dropped: HashMap<u16, usize>,
        failing: Vec<u16>,
        queries: Mutex<Vec<EventQuery>>,
    }

    impl StaticSource {
        fn with(mut self, event: Event) -> Self {
            self.batches.entry(event.kind).or_default().push(event);
            self
        }

        fn dropping(mut self, kind: u16, count: usize) -> Self {
            self.dropped.insert(kind, count);
            self
        }

        fn failing(mut self, kind: u16) -> Self {
            self.failing.push(kind);
            self
        }

        fn kinds_queried(&self) -> Vec<u16> {
            self.queries.lock().unwrap().iter().map(|q| q.kind).collect()
        }
    }

    #[async_trait]
    impl EventSource for StaticSource {
        async fn query(&self, query: &EventQuery) -> Result<EventBatch, AppError> {
            self.queries.lock().unwrap().push(*query);
            if self.failing.contains(&query.kind) {
                return Err(AppError::RequestError(format!(
                    "relays unreachable for kind {}",
                    query.kind
                )));
            }
            Ok(EventBatch {
                events: self.batches.get(&query.kind).cloned().unwrap_or_default(),
                dropped: self.dropped.get(&query.kind).copied().unwrap_or_default(),
            })
        }
    }

    fn id(hex: &str) -> VendorIdentity {
        hex.parse().unwrap()
    }

    fn event(event_id: &str, author: &str, kind: u16, content: &str, tags: &[&[&str]]) -> Event {
        Event {
            id: event_id.to_string(),
            pubkey: author.to_string(),
            created_at: 1_714_564_800,
            kind,
            tags: tags
                .iter()
                .map(|t| t.iter().map(|s| s.to_string()).collect())
                .collect(),
            content: content.to_string(),
            sig: String::new(),
        }
    }

    fn config_in(dir: &std::path::Path) -> Config {
        Config {
            data_file: dir.join("dvm_vendors.json"),
            log_file: dir.join("dvm_scan_master.log"),
            ..Config::default()
        }
    }

    #[test]
    fn plan_follows_configured_kinds() {
        let scanner = Scanner::new(Config::default(), StaticSource::default());

        let announcements = scanner.plan(Phase::Announcement);
        assert_eq!(announcements.len(), 1);
        assert_eq!(announcements[0].kind, 31990);
        assert_eq!(announcements[0].limit, 1000);

        let results: Vec<u16> = scanner.plan(Phase::Result).iter().map(|q| q.kind).collect();
        assert_eq!(results, (6000..6010).collect::<Vec<_>>());
        assert!(scanner.plan(Phase::Request).iter().all(|q| q.limit == 100));
    }

    #[tokio::test]
    async fn announcement_into_empty_registry() {
        let dir = tempdir().unwrap();
        let source = StaticSource::default().with(event(
            "a1",
            X,
            31990,
            "{}",
            &[&["d", "svc1"], &["k", "5000"]],
        ));
        let scanner = Scanner::new(config_in(dir.path()), source);

        let (registry, report) = scanner.scan().await.unwrap();

        assert_eq!(registry.len(), 1);
        let record = registry.get(&id(X)).unwrap();
        assert_eq!(record.announcements.len(), 1);
        assert_eq!(record.services.len(), 1);
        assert_eq!(record.services[0].id, "svc1");
        assert_eq!(report.announcements.applied, 1);
        assert_eq!(report.vendors, 1);
    }

    #[tokio::test]
    async fn full_scan_merges_into_prior_registry() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());

        let earlier = Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap();
        let mut prior = Registry::new();
        prior.get_or_create(id(X), earlier).unwrap();
        prior.get_or_create(id(Y), earlier).unwrap();
        RegistryStore::new(&config.data_file)
            .save(&prior)
            .await
            .unwrap();

        let source = StaticSource::default()
            .with(event("r1", X, 6000, &"b".repeat(600), &[]))
            .with(event("q1", Z, 5000, "", &[&["p", X], &["p", Z]]))
            .with(event("q2", Z, 5001, "", &[&["p", "not-hex"]]))
            .with(event("bad", "nope", 6001, "", &[]))
            .failing(6003);
        let scanner = Scanner::new(config, source);

        let (registry, report) = scanner.scan().await.unwrap();

        assert_eq!(registry.len(), 2);
        let x = registry.get(&id(X)).unwrap();
        assert_eq!(x.first_seen, earlier);
        assert!(x.last_seen() > earlier);
        assert_eq!(x.results.len(), 1);
        assert_eq!(x.results[0].content_excerpt.chars().count(), 500);
        assert_eq!(x.request_count, 1);
        assert!(!registry.contains(&id(Z)));
        assert_eq!(registry.get(&id(Y)).unwrap().request_count, 0);

        assert_eq!(report.results.queries, 10);
        assert_eq!(report.results.failed_queries, 1);
        assert_eq!(report.results.fetched, 2);
        assert_eq!(report.results.skipped, 1);
        assert_eq!(report.requests.applied, 2);

        let reloaded = scanner.store().load().await;
        assert_eq!(reloaded, registry);
    }

    #[tokio::test]
    async fn undecodable_events_count_as_skipped() {
        let dir = tempdir().unwrap();
        let source = StaticSource::default()
            .with(event("a1", X, 31990, "{}", &[&["d", "svc1"]]))
            .dropping(31990, 2);
        let scanner = Scanner::new(config_in(dir.path()), source);

        let (registry, report) = scanner.scan().await.unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(report.announcements.fetched, 3);
        assert_eq!(report.announcements.applied, 1);
        assert_eq!(report.announcements.skipped, 2);
    }

    #[tokio::test]
    async fn phases_run_in_order() {
        let dir = tempdir().unwrap();
        let scanner = Scanner::new(config_in(dir.path()), StaticSource::default());

        let mut registry = Registry::new();
        scanner.run(&mut registry).await.unwrap();

        let mut expected = vec![31990];
        expected.extend(6000..6010);
        expected.extend(5000..5010);
        assert_eq!(scanner.source.kinds_queried(), expected);
    }

    #[tokio::test]
    async fn vendor_announced_in_same_scan_receives_requests() {
        // Requests run last, so a vendor announced in this scan is credited
        let dir = tempdir().unwrap();
        let source = StaticSource::default()
            .with(event("q1", Y, 5005, "", &[&["p", X]]))
            .with(event("a1", X, 31990, "{}", &[&["d", "svc"]]));
        let scanner = Scanner::new(config_in(dir.path()), source);

        let (registry, _) = scanner.scan().await.unwrap();
        assert_eq!(registry.get(&id(X)).unwrap().request_count, 1);
    }

    #[tokio::test]
    async fn save_failure_fails_the_scan() {
        let dir = tempdir().unwrap();
        let config = Config {
            data_file: dir.path().join("missing").join("dvm_vendors.json"),
            ..Config::default()
        };
        let scanner = Scanner::new(config, StaticSource::default());

        let err = scanner.scan().await.unwrap_err();
        assert!(matches!(err, AppError::StorageError(_)));
    }

    #[test]
    fn summary_lists_vendors_in_registry_order() {
        let now = Utc.with_ymd_and_hms(2025, 2, 3, 4, 5, 6).unwrap();
        let mut registry = Registry::new();
        let x = registry.get_or_create(id(X), now).unwrap();
        for n in 0..7 {
            x.add_service(&format!("svc{}", n));
        }
        x.request_count = 4;
        registry.get_or_create(id(Y), now).unwrap();

        let lines = render_summary(&registry, &Config::default());

        assert_eq!(
            lines[1],
            "SCAN COMPLETE - Discovered 2 unique DVM vendors"
        );
        assert_eq!(lines[3], "Vendor: 3bf0c63fcb934634...");
        assert_eq!(
            lines[4],
            "  NPub: npub180cvv07tjdrrgpa0j7j7tmnyl2yr6yr7l8j4s3evf6u64th6gkwsyjh6w6"
        );
        assert_eq!(lines[5], "  First Seen: 2025-02-03T04:05:06Z");
        assert!(lines.contains(&"  Services: 7".to_string()));
        assert!(lines.contains(&"  Request Count: 4".to_string()));
        let listed = lines.iter().filter(|l| l.starts_with("    - Service:")).count();
        assert_eq!(listed, 5);
        assert!(lines.contains(&"Vendor: 82341f882b6eabcd...".to_string()));
        assert_eq!(
            lines[lines.len() - 3],
            "All data saved to: dvm_vendors.json"
        );
        assert_eq!(render_summary(&registry, &Config::default()), lines);
    }
}
