use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use adwatch_adapters::{PageSink, PhoneLookup, PhoneOutcome, NotificationSink, PHONE_HIDDEN_SENTINEL};
use adwatch_core::{merge_records, DomainProfile, ListingRecord};
use adwatch_storage::{Fetcher, PartitionStore};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};

use crate::context::CycleContext;

/// Folds each incoming page into the partition's persisted state.
///
/// The full collection is re-read before every batch on purpose: it
/// tolerates concurrent external mutation of the store and never loses
/// updates from a previous batch within the same cycle.
pub struct MergeReconciler<'a> {
    store: &'a PartitionStore,
    http: &'a Fetcher,
    profile: &'static DomainProfile,
    partition_id: String,
    enrichment: Option<&'a ContactEnrichment>,
    ctx: &'a mut CycleContext,
    observed: BTreeSet<String>,
}

impl<'a> MergeReconciler<'a> {
    pub fn new(
        store: &'a PartitionStore,
        http: &'a Fetcher,
        profile: &'static DomainProfile,
        partition_id: impl Into<String>,
        enrichment: Option<&'a ContactEnrichment>,
        ctx: &'a mut CycleContext,
    ) -> Self {
        Self {
            store,
            http,
            profile,
            partition_id: partition_id.into(),
            enrichment,
            ctx,
            observed: BTreeSet::new(),
        }
    }

    /// Identifiers seen so far in this scan, for soft-delete diffing.
    pub fn into_observed(self) -> BTreeSet<String> {
        self.observed
    }
}

#[async_trait]
impl PageSink for MergeReconciler<'_> {
    async fn accept_page(&mut self, records: Vec<ListingRecord>) -> Result<()> {
        let mut working = keyed_by_id(self.store.read(&self.partition_id).await, self.profile);

        for incoming in records {
            let Some(id) = incoming.id(self.profile) else {
                warn!(partition = self.partition_id, "dropping record without an identifier");
                continue;
            };
            let mut merged = match working.get(&id) {
                Some(existing) => merge_records(existing, &incoming, self.profile),
                None => incoming,
            };
            if let Some(enrichment) = self.enrichment {
                enrichment
                    .apply(self.http, self.profile, &mut merged, self.ctx)
                    .await;
            }
            self.observed.insert(id.clone());
            working.insert(id, merged);
        }

        let collection: Vec<ListingRecord> = working.into_values().collect();
        self.store.write(&self.partition_id, &collection).await
    }
}

fn keyed_by_id(
    records: Vec<ListingRecord>,
    profile: &DomainProfile,
) -> BTreeMap<String, ListingRecord> {
    records
        .into_iter()
        .filter_map(|record| record.id(profile).map(|id| (id, record)))
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftDeleteSummary {
    pub deleted: usize,
    pub restored: usize,
}

/// Runs once per completed scope scan: previously known identifiers
/// absent from the observed set are stamped `deleted_at`; observed
/// identifiers carrying a stale `deleted_at` are revived. Callers must
/// skip this for aborted scans, since absence is only evidence of removal
/// when the scan walked the whole result set.
pub async fn reconcile_soft_deletes(
    store: &PartitionStore,
    partition_id: &str,
    profile: &DomainProfile,
    observed: &BTreeSet<String>,
    now: DateTime<Utc>,
) -> Result<SoftDeleteSummary> {
    let records = store.read(partition_id).await;
    let mut summary = SoftDeleteSummary::default();
    let mut updated = Vec::with_capacity(records.len());

    for mut record in records {
        match record.id(profile) {
            Some(id) if observed.contains(&id) => {
                if record.is_deleted() {
                    record.clear_deleted_at();
                    summary.restored += 1;
                }
            }
            Some(_) => {
                if !record.is_deleted() {
                    record.set_deleted_at(now);
                    summary.deleted += 1;
                }
            }
            None => {}
        }
        updated.push(record);
    }

    if summary != SoftDeleteSummary::default() {
        store.write(partition_id, &updated).await?;
    }
    Ok(summary)
}

const PHONE_FIELD: &str = "phone";
const LOOKUP_ID_FIELD: &str = "list_id";

/// Contact enrichment for merged records lacking a phone number, with
/// the run-scoped circuit breaker around the protected endpoint.
pub struct ContactEnrichment {
    lookup: PhoneLookup,
    notifications: Option<NotificationSink>,
    attempt_delay: Duration,
}

impl ContactEnrichment {
    pub fn new(
        lookup: PhoneLookup,
        notifications: Option<NotificationSink>,
        attempt_delay: Duration,
    ) -> Self {
        Self {
            lookup,
            notifications,
            attempt_delay,
        }
    }

    fn eligible(record: &ListingRecord) -> Option<u64> {
        if record.str_field(PHONE_FIELD).is_some_and(|p| !p.is_empty()) {
            return None;
        }
        if record.bool_field("company_ad") || record.bool_field("phone_hidden") {
            return None;
        }
        record.u64_field(LOOKUP_ID_FIELD)
    }

    pub async fn apply(
        &self,
        http: &Fetcher,
        profile: &DomainProfile,
        record: &mut ListingRecord,
        ctx: &mut CycleContext,
    ) {
        let Some(list_id) = Self::eligible(record) else {
            return;
        };

        if ctx.breaker_open() {
            self.route_to_sink(profile, record);
            return;
        }

        debug!(list_id, "looking up contact");
        let outcome = self.lookup.lookup(http, list_id).await;
        absorb_outcome(record, ctx, outcome);
        // Fixed pause after every attempt so the protected endpoint
        // never sees a burst.
        tokio::time::sleep(self.attempt_delay).await;
    }

    fn route_to_sink(&self, profile: &DomainProfile, record: &ListingRecord) {
        let Some(sink) = &self.notifications else {
            return;
        };
        let id = record.id(profile).unwrap_or_default();
        let phone = record.str_field(PHONE_FIELD).unwrap_or("unknown");
        let payload = format!("{id} | {phone}");
        let sink = sink.clone();
        // Dispatched without awaiting; notify logs and swallows its
        // own failures.
        tokio::spawn(async move { sink.notify(payload).await });
    }
}

fn absorb_outcome(record: &mut ListingRecord, ctx: &mut CycleContext, outcome: PhoneOutcome) {
    match outcome {
        PhoneOutcome::Found(phone) => {
            record.set(PHONE_FIELD, json!(phone));
            ctx.reset_phone_failures();
        }
        PhoneOutcome::HiddenExpired => {
            record.set(PHONE_FIELD, json!(PHONE_HIDDEN_SENTINEL));
        }
        PhoneOutcome::RateLimited => ctx.record_rate_limit(),
        PhoneOutcome::Failed => {
            debug!("phone lookup failed, leaving contact unset");
        }
    }
}
