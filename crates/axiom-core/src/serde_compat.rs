//! JSON snapshot format.
//!
//! ```json
//! {
//!   "version": "1",
//!   "timestamp": "2026-10-18T09:00:00Z",
//!   "next_local_id": 42,
//!   "layout": { "entity_bits": 4, "domain_bits": 4, "local_bits": 24 },
//!   "tokens": [ { "id": 16777217, ..., "coordinates": { "l1_physical": [0, 0, 0], "l2_sensory": null, ... } } ]
//! }
//! ```
//!
//! `next_local_id` is the counter high-water mark, so ids freed by deletes
//! stay retired across an export/import cycle.

use serde::{Deserialize, Serialize};

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::identity::IdLayout;
use crate::space::TokenSpace;
use crate::token::Token;

pub const CURRENT_VERSION: &str = "1";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: String,
    #[serde(default)]
    pub timestamp: String,
    pub next_local_id: u32,
    #[serde(default)]
    pub layout: IdLayout,
    pub tokens: Vec<Token>,
}

/// Serialize every live token plus the id counter.
pub fn export_json(space: &TokenSpace) -> std::result::Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&space.snapshot())
}

/// Parse a snapshot and rebuild a space (records and all layer grids) under
/// `config`. The snapshot's id layout must match the configured one.
pub fn import_json(json: &str, config: CoreConfig) -> Result<TokenSpace> {
    let snapshot: Snapshot =
        serde_json::from_str(json).map_err(|e| CoreError::InvalidSnapshot(e.to_string()))?;
    if snapshot.version != CURRENT_VERSION {
        return Err(CoreError::InvalidSnapshot(format!(
            "unsupported snapshot version {:?}",
            snapshot.version
        )));
    }
    TokenSpace::from_snapshot(snapshot, config)
}
