//! Public classified-ad listing collector: offset pagination driven by
//! the total-result count on page 1.

use std::time::Duration;

use adwatch_core::{DeletePolicy, DomainProfile, ListingRecord};
use adwatch_storage::Fetcher;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{CollectError, PageSink, ScanOutcome, ScopeCollector};

/// Classified ads carry their authoritative image list on every
/// response, so lists replace; vanished listings expire upstream on
/// their own, so absence is not treated as deletion.
pub const CLASSIFIED_ADS: DomainProfile = DomainProfile {
    id_field: "ad_id",
    media_union_fields: &[],
    delete_policy: DeletePolicy::ReplaceOnly,
};

pub const DEFAULT_LISTING_URL: &str = "https://gateway.chotot.com/v1/public/ad-listing";

#[derive(Debug, Clone)]
pub struct ClassifiedAdConfig {
    pub base_url: String,
    /// Region the scanned areas belong to.
    pub region: String,
    /// Listing category (rooms-for-rent bucket).
    pub category: String,
    pub page_size: u64,
    pub include_expired: bool,
    /// Fixed delay between page requests.
    pub page_delay: Duration,
}

impl Default for ClassifiedAdConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_LISTING_URL.to_string(),
            region: "13000".to_string(),
            category: "1050".to_string(),
            page_size: 50,
            include_expired: true,
            page_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListingPage {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    ads: Vec<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ClassifiedAdCollector {
    config: ClassifiedAdConfig,
}

impl ClassifiedAdCollector {
    pub fn new(config: ClassifiedAdConfig) -> Self {
        Self { config }
    }

    fn page_url(&self, scope: &str, page: u64) -> String {
        let offset = (page - 1) * self.config.page_size;
        format!(
            "{}?region_v2={}&area_v2={}&cg={}&limit={}&page={}&o={}&include_expired_ads={}",
            self.config.base_url,
            self.config.region,
            scope,
            self.config.category,
            self.config.page_size,
            page,
            offset,
            self.config.include_expired,
        )
    }

    async fn fetch_page(
        &self,
        http: &Fetcher,
        scope: &str,
        page: u64,
    ) -> Result<ListingPage, CollectError> {
        let url = self.page_url(scope, page);
        debug!(%url, "fetching listing page");
        let resp = http.get_with_retry(&url).await?;
        serde_json::from_slice(&resp.body)
            .map_err(|err| CollectError::Malformed(format!("listing page {page}: {err}")))
    }
}

fn page_records(page: ListingPage) -> Vec<ListingRecord> {
    page.ads
        .into_iter()
        .filter_map(ListingRecord::from_value)
        .collect()
}

#[async_trait]
impl ScopeCollector for ClassifiedAdCollector {
    fn source_id(&self) -> &'static str {
        "classified-ads"
    }

    fn profile(&self) -> &'static DomainProfile {
        &CLASSIFIED_ADS
    }

    async fn scan_scope(
        &self,
        http: &Fetcher,
        scope: &str,
        sink: &mut dyn PageSink,
    ) -> Result<ScanOutcome, CollectError> {
        // Page 1 is the single source of truth for the total count; if
        // it fails after retries the whole scope scan is aborted.
        let first = self.fetch_page(http, scope, 1).await?;
        let total = first.total;
        let total_pages = total.div_ceil(self.config.page_size).max(1);
        info!(scope, total, total_pages, "starting classified-ad scan");

        let mut outcome = ScanOutcome {
            completed: true,
            pages_fetched: 1,
            records_seen: 0,
        };

        let records = page_records(first);
        outcome.records_seen += records.len();
        sink.accept_page(records).await?;

        for page in 2..=total_pages {
            tokio::time::sleep(self.config.page_delay).await;
            match self.fetch_page(http, scope, page).await {
                Ok(page_data) => {
                    let records = page_records(page_data);
                    outcome.pages_fetched += 1;
                    outcome.records_seen += records.len();
                    if !records.is_empty() {
                        sink.accept_page(records).await?;
                    }
                }
                // Partial completeness beats losing the whole scope
                // refresh: log the gap and keep walking.
                Err(err) => {
                    warn!(scope, page, error = %err, "page failed after retries, continuing with a gap");
                }
            }
        }

        info!(
            scope,
            pages = outcome.pages_fetched,
            records = outcome.records_seen,
            "classified-ad scan finished"
        );
        Ok(outcome)
    }
}
