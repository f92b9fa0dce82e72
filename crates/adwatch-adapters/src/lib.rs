//! Source protocol clients: the two scope collectors, the encrypted
//! contact-lookup client, and the notification webhook.

use adwatch_core::ListingRecord;
use adwatch_storage::{FetchError, Fetcher};
use async_trait::async_trait;
use thiserror::Error;

pub mod classified;
pub mod geo;
pub mod phone;
pub mod rooms;
pub mod webhook;

pub use classified::{ClassifiedAdCollector, ClassifiedAdConfig, CLASSIFIED_ADS};
pub use geo::GeoIndex;
pub use phone::{PhoneLookup, PhoneOutcome, TokenEncoder, PHONE_HIDDEN_SENTINEL};
pub use rooms::{
    RoomCollector, RoomSearchConfig, Session, SessionProvider, StaticSessionProvider, RENTAL_ROOMS,
};
pub use webhook::NotificationSink;

pub const CRATE_NAME: &str = "adwatch-adapters";

/// Result of scanning one scope. `completed` means the scan walked the
/// whole result set (possibly with page-local gaps); an uncompleted
/// scan must not be used as evidence that absent records were removed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOutcome {
    pub completed: bool,
    pub pages_fetched: usize,
    pub records_seen: usize,
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed listing payload: {0}")]
    Malformed(String),
    #[error(transparent)]
    Sink(#[from] anyhow::Error),
}

/// Receives each fetched page before the next page is requested, so a
/// failure on page K preserves merged state through page K-1.
#[async_trait]
pub trait PageSink: Send {
    async fn accept_page(&mut self, records: Vec<ListingRecord>) -> anyhow::Result<()>;
}

/// One scope's paginated collection, page by page into a sink.
#[async_trait]
pub trait ScopeCollector: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn profile(&self) -> &'static adwatch_core::DomainProfile;

    async fn scan_scope(
        &self,
        http: &Fetcher,
        scope: &str,
        sink: &mut dyn PageSink,
    ) -> Result<ScanOutcome, CollectError>;
}
