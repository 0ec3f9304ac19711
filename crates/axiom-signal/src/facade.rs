use std::sync::Arc;
use std::time::{Duration, Instant};

use axiom_core::{
    Coordinates, CoreConfig, GridStats, Layer, RangeOutcome, Token, TokenAttrs, TokenId,
    TokenPatch, TokenSpace, Vec3,
};
use serde::Serialize;

use crate::error::Result;
use crate::event::{QUERIES_CHANNEL, QueryEvent, TokenEvent};
use crate::registry::{
    ChannelRegistry, ConnectionId, Dispatch, RegistryStats, SignalConfig, Subscriber,
};

/// Token space plus channel registry: the operation surface transports call.
///
/// Mutations go to the space first; only after the store and every affected
/// layer grid agree is the change published. Publishing never blocks on or
/// fails because of subscribers. Cloning is cheap.
#[derive(Clone)]
pub struct Axiom {
    inner: Arc<AxiomInner>,
}

struct AxiomInner {
    space: TokenSpace,
    registry: ChannelRegistry,
}

#[derive(Clone, Debug, Serialize)]
pub struct AxiomStatus {
    pub tokens: usize,
    pub next_local_id: u32,
    pub registry: RegistryStats,
    pub layers: Vec<GridStats>,
}

impl Axiom {
    pub fn new(core: CoreConfig, signal: SignalConfig) -> Result<Self> {
        Ok(Self::from_space(TokenSpace::new(core)?, signal))
    }

    /// Wrap an existing space, e.g. one restored from disk.
    pub fn from_space(space: TokenSpace, signal: SignalConfig) -> Self {
        Self {
            inner: Arc::new(AxiomInner {
                space,
                registry: ChannelRegistry::new(signal),
            }),
        }
    }

    pub fn space(&self) -> &TokenSpace {
        &self.inner.space
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.inner.registry
    }

    pub fn create_token(&self, attrs: &TokenAttrs, coordinates: Coordinates) -> Result<Token> {
        let change = self.inner.space.create(attrs, coordinates)?;
        self.publish(TokenEvent::Created {
            token: change.token.clone(),
            layers: change.layers,
        });
        Ok(change.token)
    }

    pub fn get_token(&self, id: TokenId) -> Result<Token> {
        Ok(self.inner.space.get(id)?)
    }

    pub fn update_token(&self, id: TokenId, patch: &TokenPatch) -> Result<Token> {
        let change = self.inner.space.update(id, patch)?;
        self.publish(TokenEvent::Updated {
            token: change.token.clone(),
            layers: change.layers,
        });
        Ok(change.token)
    }

    /// Returns the removed record.
    pub fn delete_token(&self, id: TokenId) -> Result<Token> {
        let change = self.inner.space.delete(id)?;
        self.publish(TokenEvent::deleted(&change.token, change.layers));
        Ok(change.token)
    }

    pub fn list_tokens(&self, limit: usize, offset: usize) -> Vec<Token> {
        self.inner.space.list(limit, offset)
    }

    /// Radius query on one layer. Without an explicit `timeout` the configured
    /// query timeout applies; `Duration::ZERO` in config means no deadline.
    pub fn range_query(
        &self,
        layer: Layer,
        center: Vec3,
        radius: f64,
        max_results: Option<usize>,
        timeout: Option<Duration>,
    ) -> Result<RangeOutcome> {
        let timeout = timeout.or_else(|| {
            let ms = self.inner.space.config().query_timeout_ms;
            (ms > 0).then(|| Duration::from_millis(ms))
        });
        let deadline = timeout.map(|t| Instant::now() + t);
        let outcome = self
            .inner
            .space
            .range_query(layer, center, radius, max_results, deadline)?;

        if outcome.is_partial() {
            tracing::debug!(%layer, radius, hits = outcome.hits().len(), "range query hit its deadline");
        }
        let summary = QueryEvent {
            layer,
            center,
            radius,
            max_results,
            returned: outcome.hits().len(),
            partial: outcome.is_partial(),
        };
        self.emit(QUERIES_CHANNEL, to_payload(&summary));
        Ok(outcome)
    }

    pub fn register_connection(&self, id: impl Into<ConnectionId>) -> Result<Subscriber> {
        self.inner.registry.register_connection(id)
    }

    pub fn subscribe<I, S>(&self, id: &ConnectionId, channels: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.registry.subscribe(id, channels)
    }

    pub fn unsubscribe<I, S>(&self, id: &ConnectionId, channels: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.registry.unsubscribe(id, channels)
    }

    pub fn unregister_connection(&self, id: &ConnectionId) -> Result<()> {
        self.inner.registry.unregister_connection(id)
    }

    /// Publish an arbitrary payload, e.g. a client-side signal.
    pub fn broadcast_to_channel(&self, channel: &str, payload: serde_json::Value) -> Dispatch {
        self.emit(channel, payload)
    }

    pub fn status(&self) -> AxiomStatus {
        let space = &self.inner.space;
        AxiomStatus {
            tokens: space.len(),
            next_local_id: space.next_local_id(),
            registry: self.inner.registry.stats(),
            layers: space.all_grid_stats(),
        }
    }

    fn emit(&self, channel: &str, payload: serde_json::Value) -> Dispatch {
        self.inner.registry.broadcast_to_channel(channel, payload)
    }

    fn publish(&self, event: TokenEvent) {
        let payload = to_payload(&event);
        for channel in event.channels() {
            // Detached: delivery outcomes are recorded by the registry.
            drop(self.emit(&channel, payload.clone()));
        }
    }
}

fn to_payload<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        tracing::error!("event serialization failed: {e}");
        serde_json::Value::Null
    })
}
