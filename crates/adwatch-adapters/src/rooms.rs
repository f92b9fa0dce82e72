//! Authenticated rental-room collector: cursor-paginated search plus a
//! per-record image fragment, with address obfuscation for display.

use std::time::Duration;

use adwatch_core::{obfuscate_address, DeletePolicy, DomainProfile, ListingRecord};
use adwatch_storage::Fetcher;
use anyhow::Result;
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::geo::GeoIndex;
use crate::{CollectError, PageSink, ScanOutcome, ScopeCollector};

/// Room images arrive a few at a time from the image endpoint, so the
/// stored list accumulates; vanished rooms are soft-deleted on the
/// next completed district sweep.
pub const RENTAL_ROOMS: DomainProfile = DomainProfile {
    id_field: "_id",
    media_union_fields: &["images"],
    delete_policy: DeletePolicy::SoftDelete,
};

/// Session token/cookie pair obtained by an external login
/// collaborator; this crate never performs authentication itself.
#[derive(Debug, Clone)]
pub struct Session {
    pub csrf_token: String,
    pub cookies: String,
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn session(&self) -> Result<Session>;
}

/// Fixed token/cookie pair supplied by configuration, standing in for
/// the external login collaborator.
#[derive(Debug, Clone)]
pub struct StaticSessionProvider {
    session: Session,
}

impl StaticSessionProvider {
    pub fn new(session: Session) -> Self {
        Self { session }
    }
}

#[async_trait]
impl SessionProvider for StaticSessionProvider {
    async fn session(&self) -> Result<Session> {
        Ok(self.session.clone())
    }
}

#[derive(Debug, Clone)]
pub struct RoomSearchConfig {
    pub base_url: String,
    /// Opaque cursor advances by this fixed increment per page.
    pub cursor_step: u64,
    /// Deadline for the per-record image fragment; a miss just means
    /// no new images this scan.
    pub image_timeout: Duration,
    pub province_id: u64,
}

impl Default for RoomSearchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://quanly.nhatrovn.vn".to_string(),
            cursor_step: 10,
            image_timeout: Duration::from_millis(1500),
            province_id: 79,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    rows: Vec<Value>,
}

pub struct RoomCollector {
    config: RoomSearchConfig,
    session: Session,
    geo: GeoIndex,
}

impl RoomCollector {
    pub fn new(config: RoomSearchConfig, session: Session, geo: GeoIndex) -> Self {
        Self {
            config,
            session,
            geo,
        }
    }

    fn auth_headers(&self) -> [(&'static str, String); 2] {
        [
            ("X-CSRF-TOKEN", self.session.csrf_token.clone()),
            ("Cookie", self.session.cookies.clone()),
        ]
    }

    /// Stamps the scope fields and derived display fields onto a raw
    /// search row. Rows without an identifier are dropped.
    fn normalize_row(&self, row: Value, scope: &str) -> Option<ListingRecord> {
        let mut record = ListingRecord::from_value(row)?;

        // Identifiers arrive as numbers; the merge key is a string.
        let id = record.id(&RENTAL_ROOMS)?;
        record.set("_id", Value::String(id));

        record.set("province_id", json!(self.config.province_id));
        record.set("district_id", scope.parse::<u64>().map_or(Value::Null, |c| json!(c)));
        record.set("ward_id", Value::Null);
        record.set("deleted_at", Value::Null);

        if let Some(house_address) = record.str_field("house_address").map(str::to_string) {
            // The trailing components of the full address are
            // ward / district / province display names.
            let parts: Vec<&str> = house_address.split(", ").collect();
            if parts.len() >= 3 {
                let ward = self.geo.ward_code(parts[parts.len() - 3]);
                let district = self.geo.district_code(parts[parts.len() - 2]);
                record.set("ward_id", ward.map_or(Value::Null, |c| json!(c)));
                record.set("district_id", district.map_or(Value::Null, |c| json!(c)));
            }

            let obfuscated = obfuscate_address(&house_address);
            record.set("fake_address", Value::String(obfuscated.address));
            record.set("fake_road", Value::String(obfuscated.road));
        }

        Some(record)
    }

    async fn fetch_images(&self, http: &Fetcher, house_key: &str, room_id: &str) -> Vec<String> {
        let url = format!("{}/main/room-sale/init-edit-images-room", self.config.base_url);
        let form = [
            ("house_key", house_key.to_string()),
            ("_id", room_id.to_string()),
        ];
        match http
            .post_form_once(&url, &form, &self.auth_headers(), self.config.image_timeout)
            .await
        {
            Ok(resp) if resp.status.is_success() => {
                parse_image_srcs(&String::from_utf8_lossy(&resp.body))
            }
            Ok(resp) => {
                debug!(room_id, status = %resp.status, "image fragment unavailable");
                Vec::new()
            }
            Err(err) => {
                debug!(room_id, error = %err, "image fragment fetch failed");
                Vec::new()
            }
        }
    }
}

/// Pulls the image URLs out of the HTML fragment the image endpoint
/// returns.
pub fn parse_image_srcs(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("img.img-fluid").expect("static selector");
    document
        .select(&selector)
        .filter_map(|img| img.value().attr("src"))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl ScopeCollector for RoomCollector {
    fn source_id(&self) -> &'static str {
        "rental-rooms"
    }

    fn profile(&self) -> &'static DomainProfile {
        &RENTAL_ROOMS
    }

    async fn scan_scope(
        &self,
        http: &Fetcher,
        scope: &str,
        sink: &mut dyn PageSink,
    ) -> Result<ScanOutcome, CollectError> {
        let search_url = format!("{}/main/room-sale/search", self.config.base_url);
        let mut cursor: u64 = 0;
        let mut outcome = ScanOutcome::default();
        info!(scope, "starting rental-room sweep");

        loop {
            let form = [
                ("_lastKey", cursor.to_string()),
                ("sort-by", "1".to_string()),
                ("district-code", scope.to_string()),
            ];
            // Exhausted retries on the search call are scope-fatal:
            // the caller must not soft-delete on incomplete evidence.
            let resp = http
                .post_form_with_retry(&search_url, &form, &self.auth_headers())
                .await?;
            let page: SearchPage = serde_json::from_slice(&resp.body)
                .map_err(|err| CollectError::Malformed(format!("search page: {err}")))?;

            if page.rows.is_empty() {
                break;
            }
            outcome.pages_fetched += 1;

            let mut records = Vec::with_capacity(page.rows.len());
            for row in page.rows {
                let Some(mut record) = self.normalize_row(row, scope) else {
                    warn!(scope, "dropping search row without an identifier");
                    continue;
                };
                let room_id = record.id(&RENTAL_ROOMS).expect("id set by normalize_row");
                if let Some(house_key) = record.str_field("house_key").map(str::to_string) {
                    let images = self.fetch_images(http, &house_key, &room_id).await;
                    record.set("images", json!(images));
                }
                records.push(record);
            }

            outcome.records_seen += records.len();
            sink.accept_page(records).await?;
            cursor += self.config.cursor_step;
        }

        outcome.completed = true;
        info!(
            scope,
            pages = outcome.pages_fetched,
            records = outcome.records_seen,
            "rental-room sweep finished"
        );
        Ok(outcome)
    }
}
