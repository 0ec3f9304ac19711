//! Axiom layered token space.
//!
//! Tokens are compact 32-bit addressable records positioned in up to eight
//! independent coordinate layers (L1 physical .. L8 abstract). Each layer is
//! indexed by a uniform spatial grid so radius queries cost the cells they
//! touch, not the size of the store.
//!
//! Zero I/O: in-memory structures only. Persistence and fan-out live in
//! sibling crates.

pub mod config;
pub mod constants;
pub mod error;
pub mod grid;
pub mod identity;
pub mod layer;
pub mod serde_compat;
pub mod space;
pub mod store;
pub mod time;
pub mod token;

pub use config::{CoreConfig, GridConfig};
pub use constants::{
    DEFAULT_CELL_SIZE, DEFAULT_MAX_RESULTS, LAYER_COUNT, MAX_FIELD_RADIUS, MAX_RESULTS_CAP,
};
pub use error::{CoreError, Result};
pub use grid::{CellKey, GridHit, GridHits, GridStats, LayerGrid};
pub use identity::{IdLayout, TokenId, pack, unpack};
pub use layer::{Coordinates, Layer, LayerSet, Vec3};
pub use serde_compat::{CURRENT_VERSION, Snapshot, export_json, import_json};
pub use space::{Change, RangeHit, RangeOutcome, TokenSpace};
pub use store::TokenStore;
pub use time::{now_unix_secs, unix_to_iso8601};
pub use token::{LayerPatch, Token, TokenAttrs, TokenFlags, TokenPatch};
