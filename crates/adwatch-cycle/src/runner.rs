use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use adwatch_adapters::{
    ClassifiedAdCollector, ClassifiedAdConfig, GeoIndex, RoomCollector, RoomSearchConfig,
    ScopeCollector, SessionProvider,
};
use adwatch_core::DeletePolicy;
use adwatch_storage::{Fetcher, FetcherConfig, PartitionStore, RetryPolicy};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{CycleConfig, Rotation, ScopeRegistry, SourceConfig};
use crate::context::CycleContext;
use crate::reconcile::{reconcile_soft_deletes, ContactEnrichment, MergeReconciler};

/// Builds a fresh collector per cycle. Collectors that hold cycle-bound
/// state (an authenticated session) are rebuilt on every trigger.
#[async_trait]
pub trait CollectorFactory: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn build(&self) -> Result<Box<dyn ScopeCollector>>;

    fn enrichment(&self) -> Option<&ContactEnrichment> {
        None
    }
}

pub struct ClassifiedAdFactory {
    config: ClassifiedAdConfig,
    enrichment: Option<ContactEnrichment>,
}

impl ClassifiedAdFactory {
    pub fn new(config: ClassifiedAdConfig, enrichment: Option<ContactEnrichment>) -> Self {
        Self { config, enrichment }
    }
}

#[async_trait]
impl CollectorFactory for ClassifiedAdFactory {
    fn source_id(&self) -> &'static str {
        "classified-ads"
    }

    async fn build(&self) -> Result<Box<dyn ScopeCollector>> {
        Ok(Box::new(ClassifiedAdCollector::new(self.config.clone())))
    }

    fn enrichment(&self) -> Option<&ContactEnrichment> {
        self.enrichment.as_ref()
    }
}

pub struct RoomFactory {
    config: RoomSearchConfig,
    sessions: Arc<dyn SessionProvider>,
    geo: GeoIndex,
}

impl RoomFactory {
    pub fn new(config: RoomSearchConfig, sessions: Arc<dyn SessionProvider>, geo: GeoIndex) -> Self {
        Self {
            config,
            sessions,
            geo,
        }
    }
}

#[async_trait]
impl CollectorFactory for RoomFactory {
    fn source_id(&self) -> &'static str {
        "rental-rooms"
    }

    async fn build(&self) -> Result<Box<dyn ScopeCollector>> {
        let session = self
            .sessions
            .session()
            .await
            .context("obtaining room search session")?;
        Ok(Box::new(RoomCollector::new(
            self.config.clone(),
            session,
            self.geo.clone(),
        )))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub skipped: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scopes_scanned: usize,
    pub scopes_aborted: usize,
    pub records_seen: usize,
    pub soft_deleted: usize,
    pub restored: usize,
}

impl CycleSummary {
    fn begun(run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            skipped: false,
            started_at: now,
            finished_at: now,
            scopes_scanned: 0,
            scopes_aborted: 0,
            records_seen: 0,
            soft_deleted: 0,
            restored: 0,
        }
    }

    fn skipped(run_id: Uuid) -> Self {
        Self {
            skipped: true,
            ..Self::begun(run_id)
        }
    }
}

/// Drives one scan cycle across every enabled source in the registry.
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Triggers are single-flight: a cycle still running when the next one
/// fires makes the new trigger a no-op.
pub struct CycleRunner {
    config: CycleConfig,
    store: PartitionStore,
    http: Fetcher,
    factories: Vec<Box<dyn CollectorFactory>>,
    in_flight: AtomicBool,
    rotors: Mutex<HashMap<String, usize>>,
}

impl CycleRunner {
    pub fn new(config: CycleConfig, factories: Vec<Box<dyn CollectorFactory>>) -> Result<Self> {
        let store = PartitionStore::new(&config.data_dir);
        let http = Fetcher::new(FetcherConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            retry: RetryPolicy::default(),
        })?;
        Ok(Self {
            config,
            store,
            http,
            factories,
            in_flight: AtomicBool::new(false),
            rotors: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &PartitionStore {
        &self.store
    }

    pub async fn run_once(&self) -> Result<CycleSummary> {
        let run_id = Uuid::new_v4();
        if self.in_flight.swap(true, Ordering::SeqCst) {
            warn!(%run_id, "previous cycle still in flight, skipping this trigger");
            return Ok(CycleSummary::skipped(run_id));
        }
        // Cleared in Drop: the flag releases even when this future is
        // cancelled mid-cycle.
        let _guard = InFlightGuard {
            flag: &self.in_flight,
        };
        self.run_cycle(run_id).await
    }

    async fn run_cycle(&self, run_id: Uuid) -> Result<CycleSummary> {
        let mut summary = CycleSummary::begun(run_id);
        // Reloaded on every trigger so scope edits land without a
        // restart.
        let registry = ScopeRegistry::load(&self.config.registry_path).await?;
        // Fresh per cycle: the enrichment failure streak never leaks
        // into the next run.
        let mut ctx = CycleContext::new(run_id);
        info!(%run_id, sources = registry.sources.len(), "cycle started");

        for source in &registry.sources {
            if !source.enabled {
                continue;
            }
            let Some(factory) = self
                .factories
                .iter()
                .find(|f| f.source_id() == source.source_id)
            else {
                warn!(source = %source.source_id, "no collector registered for source");
                continue;
            };
            let collector = match factory.build().await {
                Ok(collector) => collector,
                Err(err) => {
                    warn!(source = %source.source_id, error = %err, "collector unavailable this cycle");
                    continue;
                }
            };

            let mut all_ok = true;
            for scope in self.pick_scopes(source).await {
                let ok = self
                    .scan_one(collector.as_ref(), factory.enrichment(), &scope, &mut ctx, &mut summary)
                    .await;
                all_ok &= ok;
            }
            // A failed scan leaves the rotor in place so the same scope
            // is retried next cycle.
            if source.rotation == Rotation::RoundRobin && all_ok {
                self.advance_rotor(&source.source_id).await;
            }
        }

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            scanned = summary.scopes_scanned,
            aborted = summary.scopes_aborted,
            records = summary.records_seen,
            soft_deleted = summary.soft_deleted,
            restored = summary.restored,
            "cycle finished"
        );
        Ok(summary)
    }

    async fn scan_one(
        &self,
        collector: &dyn ScopeCollector,
        enrichment: Option<&ContactEnrichment>,
        scope: &str,
        ctx: &mut CycleContext,
        summary: &mut CycleSummary,
    ) -> bool {
        let partition_id = format!("{}-{}", collector.source_id(), scope);
        let mut sink = MergeReconciler::new(
            &self.store,
            &self.http,
            collector.profile(),
            &partition_id,
            enrichment,
            ctx,
        );
        let result = collector.scan_scope(&self.http, scope, &mut sink).await;
        let observed = sink.into_observed();

        match result {
            Ok(outcome) => {
                summary.scopes_scanned += 1;
                summary.records_seen += outcome.records_seen;
                if outcome.completed
                    && collector.profile().delete_policy == DeletePolicy::SoftDelete
                {
                    match reconcile_soft_deletes(
                        &self.store,
                        &partition_id,
                        collector.profile(),
                        &observed,
                        Utc::now(),
                    )
                    .await
                    {
                        Ok(diff) => {
                            summary.soft_deleted += diff.deleted;
                            summary.restored += diff.restored;
                        }
                        Err(err) => {
                            warn!(partition_id, error = %err, "soft-delete reconciliation failed");
                        }
                    }
                }
                true
            }
            Err(err) => {
                summary.scopes_aborted += 1;
                // Merged pages up to the failure are already durable;
                // only the deletion diff is withheld.
                warn!(scope, error = %err, "scope scan aborted, keeping previous deletion state");
                false
            }
        }
    }

    async fn pick_scopes(&self, source: &SourceConfig) -> Vec<String> {
        match source.rotation {
            Rotation::FullSweep => source.scopes.clone(),
            Rotation::RoundRobin => {
                if source.scopes.is_empty() {
                    return Vec::new();
                }
                let rotors = self.rotors.lock().await;
                let idx = rotors.get(&source.source_id).copied().unwrap_or(0) % source.scopes.len();
                vec![source.scopes[idx].clone()]
            }
        }
    }

    async fn advance_rotor(&self, source_id: &str) {
        let mut rotors = self.rotors.lock().await;
        *rotors.entry(source_id.to_string()).or_insert(0) += 1;
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.cycle_cron.clone();
        let runner = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let runner = Arc::clone(&runner);
            Box::pin(async move {
                match runner.run_once().await {
                    Ok(summary) if summary.skipped => {}
                    Ok(summary) => {
                        info!(run_id = %summary.run_id, "scheduled cycle finished");
                    }
                    Err(err) => warn!(error = %err, "scheduled cycle failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adwatch_adapters::{CollectError, PageSink, ScanOutcome, RENTAL_ROOMS};
    use adwatch_core::{DomainProfile, ListingRecord};
    use serde_json::json;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;
    use tokio::sync::{mpsc, Notify};

    fn record(value: serde_json::Value) -> ListingRecord {
        ListingRecord::from_value(value).expect("object")
    }

    #[derive(Clone)]
    struct FakeCollector {
        source: &'static str,
        profile: &'static DomainProfile,
        pages: Vec<Vec<ListingRecord>>,
        fail_after_first: bool,
        scanned: Arc<StdMutex<Vec<String>>>,
        started: Option<mpsc::Sender<()>>,
        release: Option<Arc<Notify>>,
    }

    impl FakeCollector {
        fn rooms(pages: Vec<Vec<ListingRecord>>) -> Self {
            Self {
                source: "fake-rooms",
                profile: &RENTAL_ROOMS,
                pages,
                fail_after_first: false,
                scanned: Arc::new(StdMutex::new(Vec::new())),
                started: None,
                release: None,
            }
        }
    }

    #[async_trait]
    impl ScopeCollector for FakeCollector {
        fn source_id(&self) -> &'static str {
            self.source
        }

        fn profile(&self) -> &'static DomainProfile {
            self.profile
        }

        async fn scan_scope(
            &self,
            _http: &Fetcher,
            scope: &str,
            sink: &mut dyn PageSink,
        ) -> Result<ScanOutcome, CollectError> {
            self.scanned.lock().expect("lock").push(scope.to_string());
            if let Some(tx) = &self.started {
                let _ = tx.send(()).await;
            }
            if let Some(release) = &self.release {
                release.notified().await;
            }

            let mut outcome = ScanOutcome::default();
            for page in &self.pages {
                sink.accept_page(page.clone()).await?;
                outcome.pages_fetched += 1;
                outcome.records_seen += page.len();
                if self.fail_after_first {
                    return Err(CollectError::Malformed("search page truncated".into()));
                }
            }
            outcome.completed = true;
            Ok(outcome)
        }
    }

    struct FakeFactory {
        collector: FakeCollector,
    }

    #[async_trait]
    impl CollectorFactory for FakeFactory {
        fn source_id(&self) -> &'static str {
            self.collector.source
        }

        async fn build(&self) -> Result<Box<dyn ScopeCollector>> {
            Ok(Box::new(self.collector.clone()))
        }
    }

    fn test_config(dir: &Path) -> CycleConfig {
        CycleConfig {
            data_dir: dir.join("data"),
            registry_path: dir.join("scopes.yaml"),
            webhook_url: None,
            user_agent: "adwatch-test".to_string(),
            http_timeout_secs: 5,
            scheduler_enabled: false,
            cycle_cron: "0 */10 * * * *".to_string(),
            enrichment_delay_ms: 0,
        }
    }

    fn write_registry(dir: &Path, yaml: &str) {
        std::fs::write(dir.join("scopes.yaml"), yaml).expect("write registry");
    }

    fn runner(dir: &Path, collector: FakeCollector) -> CycleRunner {
        CycleRunner::new(test_config(dir), vec![Box::new(FakeFactory { collector })])
            .expect("runner")
    }

    const ROOMS_REGISTRY: &str = r#"
sources:
  - source_id: fake-rooms
    enabled: true
    rotation: full_sweep
    scopes: ["769"]
"#;

    #[tokio::test]
    async fn completed_cycle_merges_and_soft_deletes() {
        let dir = tempdir().expect("tempdir");
        write_registry(dir.path(), ROOMS_REGISTRY);

        let collector = FakeCollector::rooms(vec![vec![
            record(json!({"_id": "a", "price": 7})),
            record(json!({"_id": "c"})),
        ]]);
        let runner = runner(dir.path(), collector);

        runner
            .store()
            .write(
                "fake-rooms-769",
                &[record(json!({"_id": "a"})), record(json!({"_id": "b"}))],
            )
            .await
            .expect("seed");

        let summary = runner.run_once().await.expect("cycle");
        assert!(!summary.skipped);
        assert_eq!(summary.scopes_scanned, 1);
        assert_eq!(summary.records_seen, 2);
        assert_eq!(summary.soft_deleted, 1);
        assert_eq!(summary.restored, 0);

        let by_id: HashMap<String, ListingRecord> = runner
            .store()
            .read("fake-rooms-769")
            .await
            .into_iter()
            .filter_map(|r| r.id(&RENTAL_ROOMS).map(|id| (id, r)))
            .collect();
        assert_eq!(by_id.len(), 3);
        assert!(!by_id["a"].is_deleted());
        assert_eq!(by_id["a"].u64_field("price"), Some(7));
        assert!(by_id["b"].is_deleted());
        assert!(!by_id["c"].is_deleted());
    }

    #[tokio::test]
    async fn aborted_scan_keeps_merged_pages_but_skips_deletion_diff() {
        let dir = tempdir().expect("tempdir");
        write_registry(dir.path(), ROOMS_REGISTRY);

        let mut collector = FakeCollector::rooms(vec![vec![record(json!({"_id": "a"}))]]);
        collector.fail_after_first = true;
        let runner = runner(dir.path(), collector);

        runner
            .store()
            .write(
                "fake-rooms-769",
                &[record(json!({"_id": "a"})), record(json!({"_id": "b"}))],
            )
            .await
            .expect("seed");

        let summary = runner.run_once().await.expect("cycle");
        assert_eq!(summary.scopes_aborted, 1);
        assert_eq!(summary.soft_deleted, 0);

        // b was absent from the partial scan but must not be stamped.
        let records = runner.store().read("fake-rooms-769").await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| !r.is_deleted()));
    }

    #[tokio::test]
    async fn round_robin_advances_one_scope_per_successful_cycle() {
        let dir = tempdir().expect("tempdir");
        write_registry(
            dir.path(),
            r#"
sources:
  - source_id: fake-rooms
    enabled: true
    rotation: round_robin
    scopes: ["111", "222"]
"#,
        );

        let collector = FakeCollector::rooms(vec![vec![record(json!({"_id": "a"}))]]);
        let scanned = Arc::clone(&collector.scanned);
        let runner = runner(dir.path(), collector);

        runner.run_once().await.expect("first cycle");
        runner.run_once().await.expect("second cycle");
        runner.run_once().await.expect("third cycle");

        assert_eq!(*scanned.lock().expect("lock"), vec!["111", "222", "111"]);
    }

    #[tokio::test]
    async fn failed_scan_retries_the_same_scope_next_cycle() {
        let dir = tempdir().expect("tempdir");
        write_registry(
            dir.path(),
            r#"
sources:
  - source_id: fake-rooms
    enabled: true
    rotation: round_robin
    scopes: ["111", "222"]
"#,
        );

        let mut collector = FakeCollector::rooms(vec![vec![record(json!({"_id": "a"}))]]);
        collector.fail_after_first = true;
        let scanned = Arc::clone(&collector.scanned);
        let runner = runner(dir.path(), collector);

        runner.run_once().await.expect("first cycle");
        runner.run_once().await.expect("second cycle");

        assert_eq!(*scanned.lock().expect("lock"), vec!["111", "111"]);
    }

    #[tokio::test]
    async fn trigger_while_in_flight_is_skipped() {
        let dir = tempdir().expect("tempdir");
        write_registry(dir.path(), ROOMS_REGISTRY);

        let (started_tx, mut started_rx) = mpsc::channel(1);
        let release = Arc::new(Notify::new());
        let mut collector = FakeCollector::rooms(vec![vec![record(json!({"_id": "a"}))]]);
        collector.started = Some(started_tx);
        collector.release = Some(Arc::clone(&release));
        let runner = Arc::new(runner(dir.path(), collector));

        let background = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run_once().await })
        };
        started_rx.recv().await.expect("first cycle started");

        let second = runner.run_once().await.expect("second trigger");
        assert!(second.skipped);

        release.notify_one();
        let first = background.await.expect("join").expect("first cycle");
        assert!(!first.skipped);

        // The flag clears once the cycle finishes. The permit below is
        // stored for the third run's wait.
        release.notify_one();
        let third = runner.run_once().await.expect("third trigger");
        assert!(!third.skipped);
    }

    #[tokio::test]
    async fn aborted_cycle_releases_the_in_flight_flag() {
        let dir = tempdir().expect("tempdir");
        write_registry(dir.path(), ROOMS_REGISTRY);

        let (started_tx, mut started_rx) = mpsc::channel(1);
        let release = Arc::new(Notify::new());
        let mut collector = FakeCollector::rooms(vec![vec![record(json!({"_id": "a"}))]]);
        collector.started = Some(started_tx);
        collector.release = Some(Arc::clone(&release));
        let runner = Arc::new(runner(dir.path(), collector));

        let background = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run_once().await })
        };
        started_rx.recv().await.expect("first cycle started");

        // Cancel the cycle mid-scan, as a torn-down scheduler would.
        background.abort();
        assert!(background.await.expect_err("aborted").is_cancelled());

        release.notify_one();
        let next = runner.run_once().await.expect("trigger after abort");
        assert!(!next.skipped);
    }

    #[tokio::test]
    async fn disabled_sources_are_not_scanned() {
        let dir = tempdir().expect("tempdir");
        write_registry(
            dir.path(),
            r#"
sources:
  - source_id: fake-rooms
    enabled: false
    rotation: full_sweep
    scopes: ["769"]
"#,
        );

        let collector = FakeCollector::rooms(vec![vec![record(json!({"_id": "a"}))]]);
        let scanned = Arc::clone(&collector.scanned);
        let runner = runner(dir.path(), collector);

        let summary = runner.run_once().await.expect("cycle");
        assert_eq!(summary.scopes_scanned, 0);
        assert!(scanned.lock().expect("lock").is_empty());
    }
}
