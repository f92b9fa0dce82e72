//! Lookup tables resolving ward/district display names (as they
//! appear in listing addresses) back to their administrative codes.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct DistrictEntry {
    code: u64,
    name_with_type: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WardEntry {
    code: u64,
    name_with_type: String,
}

/// Name-to-code index built from the static administrative-division
/// data files shipped alongside the store.
#[derive(Debug, Clone, Default)]
pub struct GeoIndex {
    districts: HashMap<String, u64>,
    wards: HashMap<String, u64>,
}

impl GeoIndex {
    pub fn from_data_files(
        districts_path: impl AsRef<Path>,
        wards_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let districts_path = districts_path.as_ref();
        let wards_path = wards_path.as_ref();

        let districts: Vec<DistrictEntry> = serde_json::from_str(
            &std::fs::read_to_string(districts_path)
                .with_context(|| format!("reading {}", districts_path.display()))?,
        )
        .with_context(|| format!("parsing {}", districts_path.display()))?;

        let wards: HashMap<String, Vec<WardEntry>> = serde_json::from_str(
            &std::fs::read_to_string(wards_path)
                .with_context(|| format!("reading {}", wards_path.display()))?,
        )
        .with_context(|| format!("parsing {}", wards_path.display()))?;

        Ok(Self {
            districts: districts
                .into_iter()
                .map(|d| (d.name_with_type, d.code))
                .collect(),
            wards: wards
                .into_values()
                .flatten()
                .map(|w| (w.name_with_type, w.code))
                .collect(),
        })
    }

    #[cfg(test)]
    pub(crate) fn from_maps(districts: HashMap<String, u64>, wards: HashMap<String, u64>) -> Self {
        Self { districts, wards }
    }

    pub fn district_code(&self, name_with_type: &str) -> Option<u64> {
        self.districts.get(name_with_type).copied()
    }

    pub fn ward_code(&self, name_with_type: &str) -> Option<u64> {
        self.wards.get(name_with_type).copied()
    }
}
