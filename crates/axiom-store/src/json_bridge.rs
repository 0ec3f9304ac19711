use std::fs;
use std::path::Path;

use axiom_core::{CoreConfig, TokenSpace, export_json, import_json};

use crate::error::{Result, StoreError};
use crate::store::TokenDb;

impl TokenDb {
    /// Import a JSON snapshot file, replacing the database contents.
    /// Returns the number of tokens written.
    pub fn import_json_file(&self, path: &Path, config: CoreConfig) -> Result<usize> {
        let json = fs::read_to_string(path).map_err(|e| {
            StoreError::InvalidData(format!("failed to read {}: {e}", path.display()))
        })?;
        self.import_json_str(&json, config)
    }

    /// The snapshot is fully validated, grids and all, before anything is
    /// written.
    pub fn import_json_str(&self, json: &str, config: CoreConfig) -> Result<usize> {
        let space = import_json(json, config)?;
        self.save_space(&space)?;
        Ok(space.len())
    }

    pub fn export_json_file(&self, path: &Path, config: CoreConfig) -> Result<()> {
        let json = self.export_json_string(config)?;
        fs::write(path, json).map_err(|e| {
            StoreError::InvalidData(format!("failed to write {}: {e}", path.display()))
        })
    }

    pub fn export_json_string(&self, config: CoreConfig) -> Result<String> {
        let space: TokenSpace = self.load_space(config)?;
        export_json(&space).map_err(|e| StoreError::InvalidData(format!("JSON export failed: {e}")))
    }
}
