use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use axiom_core::{
    Coordinates, CoreConfig, CURRENT_VERSION, IdLayout, Layer, Snapshot, Token, TokenFlags,
    TokenId, TokenSpace, Vec3, unix_to_iso8601, now_unix_secs,
};

use crate::error::{Result, StoreError};
use crate::schema;

const NEXT_LOCAL_ID: &str = "next_local_id";
const ID_LAYOUT: &str = "id_layout";

/// SQLite home of a token space.
///
/// Rows mirror the in-memory records one to one. Floats are `f32` in memory
/// and `REAL` on disk, which widens and narrows without loss.
pub struct TokenDb {
    conn: Connection,
}

impl TokenDb {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // --- Metadata ---

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        set_metadata_on(&self.conn, key, value)
    }

    /// Persisted id counter high-water mark.
    pub fn next_local_id(&self) -> Result<Option<u32>> {
        self.get_metadata(NEXT_LOCAL_ID)?
            .map(|v| {
                v.parse::<u32>()
                    .map_err(|e| StoreError::InvalidData(format!("{NEXT_LOCAL_ID} = {v:?}: {e}")))
            })
            .transpose()
    }

    fn layout(&self) -> Result<Option<IdLayout>> {
        self.get_metadata(ID_LAYOUT)?
            .map(|v| {
                serde_json::from_str(&v)
                    .map_err(|e| StoreError::InvalidData(format!("{ID_LAYOUT} = {v:?}: {e}")))
            })
            .transpose()
    }

    pub fn token_count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT count(*) FROM tokens", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    // --- Save ---

    /// Replace the database contents with the space, in one transaction.
    pub fn save_space(&self, space: &TokenSpace) -> Result<()> {
        self.save_snapshot(&space.snapshot())
    }

    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch("DELETE FROM token_coordinates; DELETE FROM tokens;")?;
        for token in &snapshot.tokens {
            upsert_row_on(&tx, token)?;
            insert_coordinates_on(&tx, token)?;
        }
        set_metadata_on(&tx, NEXT_LOCAL_ID, &snapshot.next_local_id.to_string())?;
        set_layout_on(&tx, snapshot.layout)?;
        tx.commit()?;
        tracing::debug!(tokens = snapshot.tokens.len(), "saved token space");
        Ok(())
    }

    /// Write one token through, replacing its previous row and coordinates.
    /// The persisted counter only ever moves forward.
    pub fn upsert_token(&self, token: &Token, next_local_id: u32) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM token_coordinates WHERE token_id = ?1",
            [token.id.raw()],
        )?;
        upsert_row_on(&tx, token)?;
        insert_coordinates_on(&tx, token)?;
        bump_next_local_id_on(&tx, next_local_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn delete_token(&self, id: TokenId) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM tokens WHERE id = ?1", [id.raw()])?;
        Ok(rows > 0)
    }

    // --- Load ---

    /// Records in creation order plus the persisted counter and layout.
    pub fn load_snapshot(&self) -> Result<Snapshot> {
        let mut stmt = self.conn.prepare(
            "SELECT id, entity_type, domain, local_id, weight, field_radius, field_strength, timestamp, flags
             FROM tokens ORDER BY local_id",
        )?;
        let mut tokens: Vec<Token> = stmt
            .query_map([], |row| {
                Ok(Token {
                    id: TokenId(row.get(0)?),
                    entity_type: row.get(1)?,
                    domain: row.get(2)?,
                    local_id: row.get(3)?,
                    weight: row.get::<_, f64>(4)? as f32,
                    field_radius: row.get::<_, f64>(5)? as f32,
                    field_strength: row.get::<_, f64>(6)? as f32,
                    timestamp: row.get::<_, i64>(7)? as u64,
                    flags: TokenFlags::from_bits_retain(row.get(8)?),
                    coordinates: Coordinates::new(),
                })
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut coords = self
            .conn
            .prepare("SELECT token_id, layer, x, y, z FROM token_coordinates")?;
        let rows: Vec<(u32, i64, f64, f64, f64)> = coords
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let position: std::collections::HashMap<u32, usize> = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.raw(), i))
            .collect();
        for (token_id, layer, x, y, z) in rows {
            let layer = usize::try_from(layer)
                .ok()
                .and_then(Layer::from_index)
                .ok_or_else(|| StoreError::InvalidData(format!("layer index {layer}")))?;
            let &i = position.get(&token_id).ok_or_else(|| {
                StoreError::InvalidData(format!("coordinates for unknown token {token_id}"))
            })?;
            tokens[i]
                .coordinates
                .set(layer, Some(Vec3::new(x as f32, y as f32, z as f32)));
        }

        Ok(Snapshot {
            version: CURRENT_VERSION.to_string(),
            timestamp: unix_to_iso8601(now_unix_secs()),
            next_local_id: self.next_local_id()?.unwrap_or(0),
            layout: self.layout()?.unwrap_or_default(),
            tokens,
        })
    }

    /// Rebuild a token space, grids included, under `config`.
    ///
    /// A database written under a different id layout is refused.
    pub fn load_space(&self, config: CoreConfig) -> Result<TokenSpace> {
        let snapshot = self.load_snapshot()?;
        if snapshot.layout != config.layout {
            return Err(StoreError::InvalidData(format!(
                "database id layout {:?} differs from configured {:?}",
                snapshot.layout, config.layout
            )));
        }
        let count = snapshot.tokens.len();
        let space = TokenSpace::from_snapshot(snapshot, config)?;
        tracing::debug!(tokens = count, "loaded token space");
        Ok(space)
    }

    /// Fold the WAL back into the main database file.
    pub fn checkpoint_truncate(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }
}

fn set_metadata_on(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn set_layout_on(conn: &Connection, layout: IdLayout) -> Result<()> {
    let json = serde_json::to_string(&layout)
        .map_err(|e| StoreError::InvalidData(format!("layout: {e}")))?;
    set_metadata_on(conn, ID_LAYOUT, &json)
}

fn bump_next_local_id_on(conn: &Connection, next_local_id: u32) -> Result<()> {
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value
         WHERE CAST(excluded.value AS INTEGER) > CAST(metadata.value AS INTEGER)",
        params![NEXT_LOCAL_ID, next_local_id.to_string()],
    )?;
    Ok(())
}

/// Insert the row, or overwrite the mutable columns of an existing one.
fn upsert_row_on(conn: &Connection, token: &Token) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO tokens (id, entity_type, domain, local_id, weight, field_radius, field_strength, timestamp, flags)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
            weight = excluded.weight,
            field_radius = excluded.field_radius,
            field_strength = excluded.field_strength,
            timestamp = excluded.timestamp,
            flags = excluded.flags",
    )?
    .execute(params![
        token.id.raw(),
        token.entity_type,
        token.domain,
        token.local_id,
        token.weight as f64,
        token.field_radius as f64,
        token.field_strength as f64,
        token.timestamp as i64,
        token.flags.bits(),
    ])?;
    Ok(())
}

fn insert_coordinates_on(conn: &Connection, token: &Token) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO token_coordinates (token_id, layer, x, y, z) VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (layer, v) in token.coordinates.iter() {
        stmt.execute(params![
            token.id.raw(),
            layer.index() as i64,
            v.x as f64,
            v.y as f64,
            v.z as f64
        ])?;
    }
    Ok(())
}
