//! Payloads the façade publishes, and the channels they go to.

use axiom_core::{Layer, LayerSet, Token, TokenId, Vec3};
use serde::Serialize;

/// Every token change.
pub const TOKENS_CHANNEL: &str = "tokens";
/// Range query summaries.
pub const QUERIES_CHANNEL: &str = "queries";

/// Per-domain token channel, e.g. `tokens.domain.3`.
pub fn domain_channel(domain: u8) -> String {
    format!("{TOKENS_CHANNEL}.domain.{domain}")
}

/// A token change. `layers` names the layers whose index entries moved.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TokenEvent {
    Created { token: Token, layers: LayerSet },
    Updated { token: Token, layers: LayerSet },
    Deleted {
        id: TokenId,
        id_hex: String,
        domain: u8,
        layers: LayerSet,
    },
}

impl TokenEvent {
    pub fn deleted(token: &Token, layers: LayerSet) -> Self {
        TokenEvent::Deleted {
            id: token.id,
            id_hex: token.id.hex(),
            domain: token.domain,
            layers,
        }
    }

    pub fn domain(&self) -> u8 {
        match self {
            TokenEvent::Created { token, .. } | TokenEvent::Updated { token, .. } => token.domain,
            TokenEvent::Deleted { domain, .. } => *domain,
        }
    }

    /// Channels this event is published on.
    pub fn channels(&self) -> [String; 2] {
        [TOKENS_CHANNEL.to_string(), domain_channel(self.domain())]
    }
}

/// Summary of one range query, published on [`QUERIES_CHANNEL`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryEvent {
    pub layer: Layer,
    pub center: Vec3,
    pub radius: f64,
    pub max_results: Option<usize>,
    pub returned: usize,
    pub partial: bool,
}
