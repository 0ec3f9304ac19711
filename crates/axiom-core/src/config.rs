use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_CELL_SIZE, DEFAULT_MAX_RESULTS, MAX_RESULTS_CAP};
use crate::error::{CoreError, Result};
use crate::identity::IdLayout;
use crate::layer::Layer;

/// Grid cell edge length per layer.
///
/// ```toml
/// [core.grid]
/// cell_size = 1.0
///
/// [core.grid.overrides]
/// l7_temporal = 60.0
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub cell_size: f32,
    pub overrides: BTreeMap<Layer, f32>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            cell_size: DEFAULT_CELL_SIZE,
            overrides: BTreeMap::new(),
        }
    }
}

impl GridConfig {
    pub fn uniform(cell_size: f32) -> Self {
        Self {
            cell_size,
            overrides: BTreeMap::new(),
        }
    }

    pub fn cell_size_for(&self, layer: Layer) -> f32 {
        self.overrides.get(&layer).copied().unwrap_or(self.cell_size)
    }

    pub fn validate(&self) -> Result<()> {
        check_cell_size("cell_size", self.cell_size)?;
        for (layer, size) in &self.overrides {
            check_cell_size(layer.as_str(), *size)?;
        }
        Ok(())
    }
}

fn check_cell_size(field: &'static str, size: f32) -> Result<()> {
    if !size.is_finite() || size <= 0.0 {
        return Err(CoreError::OutOfRange {
            field,
            value: size as f64,
        });
    }
    Ok(())
}

/// Tunables for a [`crate::TokenSpace`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub layout: IdLayout,
    pub grid: GridConfig,
    /// Used when a query names no result count.
    pub default_max_results: usize,
    /// Hard ceiling; larger requests are clamped.
    pub max_results_cap: usize,
    /// Deadline applied by the façade when the caller supplies none.
    pub query_timeout_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            layout: IdLayout::DEFAULT,
            grid: GridConfig::default(),
            default_max_results: DEFAULT_MAX_RESULTS,
            max_results_cap: MAX_RESULTS_CAP,
            query_timeout_ms: 250,
        }
    }
}

impl CoreConfig {
    pub fn validate(&self) -> Result<()> {
        self.layout.validate()?;
        self.grid.validate()?;
        if self.max_results_cap == 0 {
            return Err(CoreError::InvalidRange {
                field: "max_results_cap",
                value: 0,
                max: u64::MAX,
            });
        }
        Ok(())
    }

    /// Resolve a requested result count: default when absent, clamped to the cap.
    pub fn result_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_max_results)
            .min(self.max_results_cap)
    }
}
