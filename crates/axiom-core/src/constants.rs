/// Number of coordinate layers a token can occupy (L1..L8).
pub const LAYER_COUNT: usize = 8;

/// Upper bound for `weight` and `field_strength`.
pub const MAX_UNIT: f32 = 1.0;

/// Upper bound for `field_radius` (one byte of hundredths on the wire).
pub const MAX_FIELD_RADIUS: f32 = 2.55;

pub const DEFAULT_WEIGHT: f32 = 0.5;
pub const DEFAULT_FIELD_RADIUS: f32 = 1.0;
pub const DEFAULT_FIELD_STRENGTH: f32 = 1.0;

/// Grid cell edge length used when a layer has no override.
pub const DEFAULT_CELL_SIZE: f32 = 1.0;

/// Result count used when a range query does not ask for one.
pub const DEFAULT_MAX_RESULTS: usize = 100;

/// Hard ceiling on results returned by a single range query.
pub const MAX_RESULTS_CAP: usize = 10_000;

/// Cells visited between deadline checks during a grid scan.
pub const DEADLINE_CHECK_INTERVAL: usize = 64;

/// First local id handed out by a fresh store. Zero is never assigned.
pub const FIRST_LOCAL_ID: u32 = 1;
