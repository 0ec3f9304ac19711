//! Wire shapes shared by the HTTP server and the one-shot commands.

use std::collections::BTreeMap;

use axiom_core::{
    Coordinates, Layer, LayerPatch, RangeHit, Token, TokenAttrs, TokenId, TokenPatch, Vec3,
    now_unix_secs,
};
use serde::{Deserialize, Serialize};

/// `{ "success": true, "data": ... }`
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// A token as clients see it: the record plus derived fields.
#[derive(Debug, Serialize)]
pub struct TokenView {
    #[serde(flatten)]
    pub token: Token,
    pub id_hex: String,
    pub state: BTreeMap<&'static str, bool>,
    pub age_seconds: u64,
}

impl TokenView {
    pub fn new(token: Token) -> Self {
        Self {
            id_hex: token.id.hex(),
            state: token.flags.to_map(),
            age_seconds: token.age_seconds(now_unix_secs()),
            token,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListView {
    pub tokens: Vec<TokenView>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct DeletedView {
    pub id: TokenId,
    pub id_hex: String,
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct HitView {
    pub token: TokenView,
    pub distance: f64,
}

#[derive(Debug, Serialize)]
pub struct QueryView {
    pub hits: Vec<HitView>,
    pub partial: bool,
}

impl QueryView {
    pub fn new(hits: Vec<RangeHit>, partial: bool) -> Self {
        Self {
            hits: hits
                .into_iter()
                .map(|h| HitView {
                    token: TokenView::new(h.token),
                    distance: h.distance,
                })
                .collect(),
            partial,
        }
    }
}

/// Layer keys accept any form [`Layer::parse`] does.
fn layer_key(key: &str) -> Result<Layer, String> {
    Layer::parse(key).ok_or_else(|| format!("unknown layer {key:?}"))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateTokenRequest {
    pub entity_type: u8,
    pub domain: u8,
    pub weight: Option<f32>,
    pub field_radius: Option<f32>,
    pub field_strength: Option<f32>,
    pub persistent: bool,
    pub coordinates: BTreeMap<String, [f32; 3]>,
}

impl CreateTokenRequest {
    pub fn into_parts(self) -> Result<(TokenAttrs, Coordinates), String> {
        let defaults = TokenAttrs::new(self.entity_type, self.domain);
        let attrs = TokenAttrs {
            weight: self.weight.unwrap_or(defaults.weight),
            field_radius: self.field_radius.unwrap_or(defaults.field_radius),
            field_strength: self.field_strength.unwrap_or(defaults.field_strength),
            persistent: self.persistent,
            ..defaults
        };
        let mut coordinates = Coordinates::new();
        for (key, position) in self.coordinates {
            coordinates.set(layer_key(&key)?, Some(Vec3::from(position)));
        }
        Ok((attrs, coordinates))
    }
}

/// Omitted fields are kept. In `coordinates`, `null` clears a layer.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UpdateTokenRequest {
    pub weight: Option<f32>,
    pub field_radius: Option<f32>,
    pub field_strength: Option<f32>,
    pub active: Option<bool>,
    pub persistent: Option<bool>,
    pub locked: Option<bool>,
    pub coordinates: BTreeMap<String, Option<[f32; 3]>>,
}

impl UpdateTokenRequest {
    pub fn into_patch(self) -> Result<TokenPatch, String> {
        let mut patch = TokenPatch {
            weight: self.weight,
            field_radius: self.field_radius,
            field_strength: self.field_strength,
            active: self.active,
            persistent: self.persistent,
            locked: self.locked,
            ..TokenPatch::default()
        };
        for (key, position) in self.coordinates {
            patch.layers[layer_key(&key)?.index()] = match position {
                Some(p) => LayerPatch::Set(Vec3::from(p)),
                None => LayerPatch::Clear,
            };
        }
        Ok(patch)
    }
}

#[derive(Debug, Deserialize)]
pub struct RangeQueryRequest {
    pub layer: String,
    pub center: [f32; 3],
    pub radius: f64,
    #[serde(default)]
    pub max_results: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Return what was found when the deadline hits instead of failing.
    #[serde(default)]
    pub allow_partial: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ListParams {
    pub limit: usize,
    pub offset: usize,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}
