//! Core domain model for adwatch: loosely-typed listing records,
//! per-source reconciliation profiles, non-destructive merge, and the
//! address obfuscation transform.

mod address;
mod merge;
mod record;

pub use address::{obfuscate_address, title_case, ObfuscatedAddress, HOUSE_NUMBER_OFFSET};
pub use merge::merge_records;
pub use record::{DeletePolicy, DomainProfile, ListingRecord};

pub const CRATE_NAME: &str = "adwatch-core";
