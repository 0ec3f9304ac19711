//! Token store and per-layer grids composed into one consistent unit.
//!
//! Locking:
//! - the store and each of the eight layer grids sit behind their own
//!   `RwLock`;
//! - writers lock the layers they touch in ascending layer order, then the
//!   store, and hold everything until both sides agree;
//! - readers lock one layer for reading, then the store for reading.
//!
//! A query therefore waits only on writers touching its own layer, and can
//! never see the store and the grid disagree about a token.

use std::time::Instant;

use parking_lot::{RwLock, RwLockWriteGuard};
use serde::Serialize;

use crate::config::CoreConfig;
use crate::constants::LAYER_COUNT;
use crate::error::{CoreError, Result};
use crate::grid::{GridStats, LayerGrid};
use crate::identity::TokenId;
use crate::layer::{Coordinates, Layer, LayerSet, Vec3};
use crate::serde_compat::{CURRENT_VERSION, Snapshot};
use crate::store::TokenStore;
use crate::time::{now_unix_secs, unix_to_iso8601};
use crate::token::{Token, TokenAttrs, TokenPatch};

/// Result of a mutation: the record after the change and the layers whose
/// index entries moved.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Change {
    pub token: Token,
    pub layers: LayerSet,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RangeHit {
    pub token: Token,
    pub distance: f64,
}

/// Range query result. `Partial` means the deadline passed mid-scan and the
/// hits are whatever had been gathered by then.
#[derive(Clone, Debug, PartialEq)]
pub enum RangeOutcome {
    Complete(Vec<RangeHit>),
    Partial(Vec<RangeHit>),
}

impl RangeOutcome {
    pub fn hits(&self) -> &[RangeHit] {
        match self {
            Self::Complete(hits) | Self::Partial(hits) => hits,
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Partial(_))
    }

    pub fn into_hits(self) -> Vec<RangeHit> {
        match self {
            Self::Complete(hits) | Self::Partial(hits) => hits,
        }
    }

    /// For callers that treat an expired deadline as an error.
    pub fn into_complete(self) -> Result<Vec<RangeHit>> {
        match self {
            Self::Complete(hits) => Ok(hits),
            Self::Partial(_) => Err(CoreError::Timeout),
        }
    }
}

type LayerGuards<'a> = [Option<RwLockWriteGuard<'a, LayerGrid>>; LAYER_COUNT];

pub struct TokenSpace {
    config: CoreConfig,
    store: RwLock<TokenStore>,
    grids: [RwLock<LayerGrid>; LAYER_COUNT],
}

impl std::fmt::Debug for TokenSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSpace")
            .field("tokens", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

impl TokenSpace {
    pub fn new(config: CoreConfig) -> Result<Self> {
        config.validate()?;
        let store = TokenStore::new(config.layout);
        Ok(Self::assemble(config, store))
    }

    /// Build the grids from whatever the store already holds.
    fn assemble(config: CoreConfig, store: TokenStore) -> Self {
        let mut grids: [LayerGrid; LAYER_COUNT] = std::array::from_fn(|i| {
            let layer = Layer::ALL[i];
            LayerGrid::new(layer, config.grid.cell_size_for(layer))
        });
        for token in store.iter() {
            for (layer, position) in token.coordinates.iter() {
                grids[layer.index()].insert(token.id, position);
            }
        }
        Self {
            config,
            store: RwLock::new(store),
            grids: grids.map(RwLock::new),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Write-lock the given layers. `from_fn` visits indices in order, which
    /// is the global lock order.
    fn lock_layers(&self, layers: LayerSet) -> LayerGuards<'_> {
        std::array::from_fn(|i| {
            layers
                .has(Layer::ALL[i])
                .then(|| self.grids[i].write())
        })
    }

    pub fn create(&self, attrs: &TokenAttrs, coordinates: Coordinates) -> Result<Change> {
        let layers = coordinates.populated();
        let mut guards = self.lock_layers(layers);
        let mut store = self.store.write();
        let token = store.create(attrs, coordinates, now_unix_secs())?;
        for (layer, position) in token.coordinates.iter() {
            if let Some(grid) = guards[layer.index()].as_mut() {
                grid.insert(token.id, position);
            }
        }
        Ok(Change { token, layers })
    }

    pub fn get(&self, id: TokenId) -> Result<Token> {
        self.store.read().get(id).cloned()
    }

    pub fn update(&self, id: TokenId, patch: &TokenPatch) -> Result<Change> {
        patch.validate()?;
        let mut guards = self.lock_layers(patch.touched_layers());
        let mut store = self.store.write();
        let before = store.get(id)?.coordinates.clone();
        let token = store.update(id, patch)?;

        let mut moved = LayerSet::empty();
        for layer in patch.touched_layers().layers() {
            let Some(grid) = guards[layer.index()].as_mut() else {
                continue;
            };
            match (before.get(layer), token.coordinates.get(layer)) {
                (Some(old), Some(new)) if old != new => grid.relocate(id, old, new),
                (Some(old), None) => {
                    grid.remove(id, old);
                }
                (None, Some(new)) => grid.insert(id, new),
                _ => continue,
            }
            moved.insert(layer.bit());
        }
        Ok(Change {
            token,
            layers: moved,
        })
    }

    /// Remove the token from the store and from every layer it occupies.
    ///
    /// The occupied layers are read first so only those are locked; if an
    /// update changes them before the locks are taken, the attempt is retried.
    pub fn delete(&self, id: TokenId) -> Result<Change> {
        loop {
            let layers = self.store.read().get(id)?.coordinates.populated();
            let mut guards = self.lock_layers(layers);
            let mut store = self.store.write();
            if store.get(id)?.coordinates.populated() != layers {
                continue;
            }
            let token = store.delete(id)?;
            for (layer, position) in token.coordinates.iter() {
                if let Some(grid) = guards[layer.index()].as_mut() {
                    grid.remove(id, position);
                }
            }
            return Ok(Change { token, layers });
        }
    }

    pub fn list(&self, limit: usize, offset: usize) -> Vec<Token> {
        self.store.read().list(limit, offset)
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    pub fn next_local_id(&self) -> u32 {
        self.store.read().next_local_id()
    }

    /// Tokens within `radius` of `center` in `layer`, nearest first.
    ///
    /// `max_results` defaults and is clamped per [`CoreConfig::result_limit`].
    /// The index pass yields ids; records are then read from the store while
    /// the layer is still read-locked.
    pub fn range_query(
        &self,
        layer: Layer,
        center: Vec3,
        radius: f64,
        max_results: Option<usize>,
        deadline: Option<Instant>,
    ) -> Result<RangeOutcome> {
        let limit = self.config.result_limit(max_results);
        let grid = self.grids[layer.index()].read();
        let found = grid.range_query(center, radius, limit, deadline)?;
        let store = self.store.read();
        let hits = found
            .hits
            .iter()
            .filter_map(|hit| {
                store.get(hit.id).ok().map(|token| RangeHit {
                    token: token.clone(),
                    distance: hit.distance,
                })
            })
            .collect();
        Ok(if found.complete {
            RangeOutcome::Complete(hits)
        } else {
            RangeOutcome::Partial(hits)
        })
    }

    pub fn grid_stats(&self, layer: Layer) -> GridStats {
        self.grids[layer.index()].read().stats()
    }

    pub fn all_grid_stats(&self) -> Vec<GridStats> {
        self.grids.iter().map(|g| g.read().stats()).collect()
    }

    /// Consistent copy of every record. Takes the store read lock only.
    pub fn snapshot(&self) -> Snapshot {
        let store = self.store.read();
        Snapshot {
            version: CURRENT_VERSION.to_string(),
            timestamp: unix_to_iso8601(now_unix_secs()),
            next_local_id: store.next_local_id(),
            layout: store.layout(),
            tokens: store.iter().cloned().collect(),
        }
    }

    /// Rebuild a space, store and grids, from a snapshot.
    pub fn from_snapshot(snapshot: Snapshot, config: CoreConfig) -> Result<Self> {
        config.validate()?;
        if snapshot.layout != config.layout {
            return Err(CoreError::InvalidSnapshot(format!(
                "snapshot id layout {:?} differs from configured {:?}",
                snapshot.layout, config.layout
            )));
        }
        let store = TokenStore::restore(config.layout, snapshot.tokens, snapshot.next_local_id)?;
        Ok(Self::assemble(config, store))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::config::GridConfig;

    fn space() -> TokenSpace {
        TokenSpace::new(CoreConfig::default()).unwrap()
    }

    fn at(layer: Layer, x: f32, y: f32, z: f32) -> Coordinates {
        Coordinates::new().with(layer, Vec3::new(x, y, z))
    }

    fn ids(outcome: &RangeOutcome) -> Vec<TokenId> {
        outcome.hits().iter().map(|h| h.token.id).collect()
    }

    #[test]
    fn test_create_indexes_every_populated_layer() {
        let s = space();
        let coords = at(Layer::Physical, 1.0, 2.0, 3.0).with(Layer::Social, Vec3::ZERO);
        let change = s.create(&TokenAttrs::default(), coords).unwrap();
        assert_eq!(change.layers.len(), 2);

        for (layer, center) in [
            (Layer::Physical, Vec3::new(1.0, 2.0, 3.0)),
            (Layer::Social, Vec3::ZERO),
        ] {
            let hits = s.range_query(layer, center, 0.0, None, None).unwrap();
            assert_eq!(ids(&hits), vec![change.token.id]);
        }
        assert!(
            s.range_query(Layer::Sensory, Vec3::ZERO, 100.0, None, None)
                .unwrap()
                .hits()
                .is_empty()
        );
    }

    #[test]
    fn test_failed_create_touches_nothing() {
        let s = space();
        let mut attrs = TokenAttrs::default();
        attrs.field_strength = 2.0;
        assert!(s.create(&attrs, at(Layer::Physical, 0.0, 0.0, 0.0)).is_err());
        assert!(s.is_empty());
        assert_eq!(s.grid_stats(Layer::Physical).tokens, 0);
    }

    #[test]
    fn test_update_moves_and_clears() {
        let s = space();
        let t = s
            .create(
                &TokenAttrs::default(),
                at(Layer::Motor, 0.0, 0.0, 0.0).with(Layer::Temporal, Vec3::ZERO),
            )
            .unwrap()
            .token;

        let patch = TokenPatch::new()
            .set_layer(Layer::Motor, Vec3::new(50.0, 0.0, 0.0))
            .clear_layer(Layer::Temporal)
            .set_layer(Layer::Abstract, Vec3::new(1.0, 1.0, 1.0));
        let change = s.update(t.id, &patch).unwrap();
        let moved: Vec<Layer> = change.layers.layers().collect();
        assert_eq!(moved, vec![Layer::Motor, Layer::Temporal, Layer::Abstract]);

        assert!(
            s.range_query(Layer::Motor, Vec3::ZERO, 1.0, None, None)
                .unwrap()
                .hits()
                .is_empty()
        );
        let hits = s
            .range_query(Layer::Motor, Vec3::new(50.0, 0.0, 0.0), 0.0, None, None)
            .unwrap();
        assert_eq!(ids(&hits), vec![t.id]);
        assert_eq!(s.grid_stats(Layer::Temporal).tokens, 0);
        assert_eq!(s.grid_stats(Layer::Abstract).tokens, 1);
    }

    #[test]
    fn test_update_same_position_reports_no_move() {
        let s = space();
        let t = s
            .create(&TokenAttrs::default(), at(Layer::Physical, 1.0, 1.0, 1.0))
            .unwrap()
            .token;
        let change = s
            .update(
                t.id,
                &TokenPatch::new().set_layer(Layer::Physical, Vec3::new(1.0, 1.0, 1.0)),
            )
            .unwrap();
        assert!(change.layers.is_empty());
    }

    #[test]
    fn test_failed_update_touches_nothing() {
        let s = space();
        let t = s
            .create(&TokenAttrs::default(), at(Layer::Physical, 0.0, 0.0, 0.0))
            .unwrap()
            .token;
        let patch = TokenPatch::new()
            .weight(7.0)
            .set_layer(Layer::Physical, Vec3::new(9.0, 9.0, 9.0));
        assert!(s.update(t.id, &patch).is_err());
        assert_eq!(s.get(t.id).unwrap(), t);
        let hits = s
            .range_query(Layer::Physical, Vec3::ZERO, 0.0, None, None)
            .unwrap();
        assert_eq!(ids(&hits), vec![t.id]);
    }

    #[test]
    fn test_delete_clears_every_layer() {
        let s = space();
        let coords = Layer::ALL
            .into_iter()
            .fold(Coordinates::new(), |c, l| c.with(l, Vec3::ZERO));
        let t = s.create(&TokenAttrs::default(), coords).unwrap().token;
        let change = s.delete(t.id).unwrap();
        assert_eq!(change.layers, LayerSet::all());
        for layer in Layer::ALL {
            assert!(
                s.range_query(layer, Vec3::ZERO, 10.0, None, None)
                    .unwrap()
                    .hits()
                    .is_empty()
            );
        }
        assert_eq!(s.delete(t.id), Err(CoreError::NotFound(t.id)));
    }

    #[test]
    fn test_results_clamped_to_cap() {
        let config = CoreConfig {
            max_results_cap: 2,
            ..CoreConfig::default()
        };
        let s = TokenSpace::new(config).unwrap();
        for i in 0..5 {
            s.create(&TokenAttrs::default(), at(Layer::Physical, i as f32 * 0.1, 0.0, 0.0))
                .unwrap();
        }
        let hits = s
            .range_query(Layer::Physical, Vec3::ZERO, 5.0, Some(100), None)
            .unwrap();
        assert_eq!(hits.hits().len(), 2);
    }

    #[test]
    fn test_partial_outcome() {
        let s = space();
        s.create(&TokenAttrs::default(), at(Layer::Physical, 0.0, 0.0, 0.0))
            .unwrap();
        let past = Instant::now() - Duration::from_millis(1);
        let outcome = s
            .range_query(Layer::Physical, Vec3::ZERO, 1.0, None, Some(past))
            .unwrap();
        assert!(outcome.is_partial());
        assert_eq!(outcome.into_complete(), Err(CoreError::Timeout));

        let outcome = s
            .range_query(Layer::Physical, Vec3::ZERO, 1.0, None, None)
            .unwrap();
        assert!(!outcome.is_partial());
        assert_eq!(outcome.into_complete().unwrap().len(), 1);
    }

    #[test]
    fn test_per_layer_cell_sizes() {
        let mut grid = GridConfig::uniform(1.0);
        grid.overrides.insert(Layer::Temporal, 3600.0);
        let s = TokenSpace::new(CoreConfig {
            grid,
            ..CoreConfig::default()
        })
        .unwrap();
        assert_eq!(s.grid_stats(Layer::Temporal).cell_size, 3600.0);
        assert_eq!(s.grid_stats(Layer::Physical).cell_size, 1.0);
    }

    #[test]
    fn test_snapshot_rebuilds_grids() {
        let s = space();
        let a = s
            .create(&TokenAttrs::new(1, 1), at(Layer::Physical, 1.0, 0.0, 0.0))
            .unwrap()
            .token;
        let b = s
            .create(&TokenAttrs::new(2, 2), at(Layer::Cognitive, 0.0, 5.0, 0.0))
            .unwrap()
            .token;
        s.delete(a.id).unwrap();

        let restored = TokenSpace::from_snapshot(s.snapshot(), CoreConfig::default()).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored.next_local_id(), 3);
        let hits = restored
            .range_query(Layer::Cognitive, Vec3::new(0.0, 5.0, 0.0), 0.0, None, None)
            .unwrap();
        assert_eq!(ids(&hits), vec![b.id]);
    }

    #[test]
    fn test_snapshot_layout_mismatch() {
        let s = space();
        let config = CoreConfig {
            layout: crate::IdLayout {
                entity_bits: 8,
                domain_bits: 8,
                local_bits: 16,
            },
            ..CoreConfig::default()
        };
        assert!(matches!(
            TokenSpace::from_snapshot(s.snapshot(), config),
            Err(CoreError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn test_concurrent_writers_and_readers_stay_consistent() {
        let s = Arc::new(space());
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let s = Arc::clone(&s);
                thread::spawn(move || {
                    for i in 0..50 {
                        let t = s
                            .create(
                                &TokenAttrs::new(w, 0),
                                at(Layer::Physical, i as f32, w as f32, 0.0),
                            )
                            .unwrap()
                            .token;
                        if i % 3 == 0 {
                            s.update(
                                t.id,
                                &TokenPatch::new().set_layer(Layer::Sensory, Vec3::ZERO),
                            )
                            .unwrap();
                        }
                        if i % 5 == 0 {
                            s.delete(t.id).unwrap();
                        }
                    }
                })
            })
            .collect();
        let reader = {
            let s = Arc::clone(&s);
            thread::spawn(move || {
                for _ in 0..200 {
                    let outcome = s
                        .range_query(Layer::Physical, Vec3::new(25.0, 2.0, 0.0), 30.0, Some(10_000), None)
                        .unwrap();
                    for hit in outcome.hits() {
                        assert!(hit.token.coordinates.get(Layer::Physical).is_some());
                    }
                }
            })
        };
        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();

        // 4 writers x 50, one in five deleted.
        assert_eq!(s.len(), 160);
        assert_eq!(s.grid_stats(Layer::Physical).tokens, 160);
        for token in s.list(usize::MAX, 0) {
            let p = token.coordinates.get(Layer::Physical).unwrap();
            let hits = s.range_query(Layer::Physical, p, 0.0, Some(10_000), None).unwrap();
            assert!(ids(&hits).contains(&token.id));
        }
    }
}
