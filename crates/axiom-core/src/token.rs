use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::{
    DEFAULT_FIELD_RADIUS, DEFAULT_FIELD_STRENGTH, DEFAULT_WEIGHT, LAYER_COUNT, MAX_FIELD_RADIUS,
    MAX_UNIT,
};
use crate::error::{CoreError, Result};
use crate::identity::TokenId;
use crate::layer::{Coordinates, Layer, LayerSet, Vec3};

bitflags::bitflags! {
    /// Token state bits. Serialized as the raw byte.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct TokenFlags: u8 {
        const ACTIVE = 1 << 0;
        const PERSISTENT = 1 << 1;
        const LOCKED = 1 << 2;
        const DIRTY = 1 << 3;
    }
}

impl Default for TokenFlags {
    fn default() -> Self {
        Self::ACTIVE
    }
}

impl TokenFlags {
    /// Named view, e.g. `{"active": true, "persistent": false, ..}`.
    pub fn to_map(self) -> BTreeMap<&'static str, bool> {
        BTreeMap::from([
            ("active", self.contains(Self::ACTIVE)),
            ("persistent", self.contains(Self::PERSISTENT)),
            ("locked", self.contains(Self::LOCKED)),
            ("dirty", self.contains(Self::DIRTY)),
        ])
    }
}

impl Serialize for TokenFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for TokenFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        u8::deserialize(deserializer).map(Self::from_bits_retain)
    }
}

/// Canonical record for a live token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub entity_type: u8,
    pub domain: u8,
    pub local_id: u32,
    pub weight: f32,
    pub field_radius: f32,
    pub field_strength: f32,
    /// Creation time, Unix seconds.
    pub timestamp: u64,
    pub flags: TokenFlags,
    pub coordinates: Coordinates,
}

impl Token {
    pub fn age_seconds(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamp)
    }

    pub fn is_active(&self) -> bool {
        self.flags.contains(TokenFlags::ACTIVE)
    }

    pub fn is_persistent(&self) -> bool {
        self.flags.contains(TokenFlags::PERSISTENT)
    }
}

/// Inputs for creating a token. Identity and timestamp are assigned by the store.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenAttrs {
    pub entity_type: u8,
    pub domain: u8,
    pub weight: f32,
    pub field_radius: f32,
    pub field_strength: f32,
    pub persistent: bool,
}

impl Default for TokenAttrs {
    fn default() -> Self {
        Self {
            entity_type: 0,
            domain: 0,
            weight: DEFAULT_WEIGHT,
            field_radius: DEFAULT_FIELD_RADIUS,
            field_strength: DEFAULT_FIELD_STRENGTH,
            persistent: false,
        }
    }
}

impl TokenAttrs {
    pub fn new(entity_type: u8, domain: u8) -> Self {
        Self {
            entity_type,
            domain,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_bound("weight", self.weight, MAX_UNIT)?;
        check_bound("field_radius", self.field_radius, MAX_FIELD_RADIUS)?;
        check_bound("field_strength", self.field_strength, MAX_UNIT)
    }

    pub(crate) fn flags(&self) -> TokenFlags {
        let mut flags = TokenFlags::ACTIVE;
        flags.set(TokenFlags::PERSISTENT, self.persistent);
        flags
    }
}

/// What an update does to one layer.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum LayerPatch {
    /// Leave the layer as it is.
    #[default]
    Keep,
    Set(Vec3),
    /// Make the layer absent.
    Clear,
}

/// Partial update: only `Some` attributes and non-`Keep` layers are applied.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TokenPatch {
    pub weight: Option<f32>,
    pub field_radius: Option<f32>,
    pub field_strength: Option<f32>,
    pub active: Option<bool>,
    pub persistent: Option<bool>,
    pub locked: Option<bool>,
    pub layers: [LayerPatch; LAYER_COUNT],
}

impl TokenPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn weight(mut self, weight: f32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn field_radius(mut self, radius: f32) -> Self {
        self.field_radius = Some(radius);
        self
    }

    pub fn field_strength(mut self, strength: f32) -> Self {
        self.field_strength = Some(strength);
        self
    }

    pub fn set_layer(mut self, layer: Layer, position: Vec3) -> Self {
        self.layers[layer.index()] = LayerPatch::Set(position);
        self
    }

    pub fn clear_layer(mut self, layer: Layer) -> Self {
        self.layers[layer.index()] = LayerPatch::Clear;
        self
    }

    pub fn layer(&self, layer: Layer) -> LayerPatch {
        self.layers[layer.index()]
    }

    /// Layers this patch sets or clears.
    pub fn touched_layers(&self) -> LayerSet {
        Layer::ALL
            .into_iter()
            .filter(|l| self.layer(*l) != LayerPatch::Keep)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(w) = self.weight {
            check_bound("weight", w, MAX_UNIT)?;
        }
        if let Some(r) = self.field_radius {
            check_bound("field_radius", r, MAX_FIELD_RADIUS)?;
        }
        if let Some(s) = self.field_strength {
            check_bound("field_strength", s, MAX_UNIT)?;
        }
        for layer in Layer::ALL {
            if let LayerPatch::Set(v) = self.layer(layer)
                && !v.is_finite()
            {
                return Err(non_finite(layer, v));
            }
        }
        Ok(())
    }

    /// Apply to a record. Callers validate first; this never fails.
    pub(crate) fn apply(&self, token: &mut Token) {
        if let Some(w) = self.weight {
            token.weight = w;
        }
        if let Some(r) = self.field_radius {
            token.field_radius = r;
        }
        if let Some(s) = self.field_strength {
            token.field_strength = s;
        }
        for (flag, value) in [
            (TokenFlags::ACTIVE, self.active),
            (TokenFlags::PERSISTENT, self.persistent),
            (TokenFlags::LOCKED, self.locked),
        ] {
            if let Some(on) = value {
                token.flags.set(flag, on);
            }
        }
        for layer in Layer::ALL {
            match self.layer(layer) {
                LayerPatch::Keep => {}
                LayerPatch::Set(v) => token.coordinates.set(layer, Some(v)),
                LayerPatch::Clear => token.coordinates.set(layer, None),
            }
        }
    }
}

fn check_bound(field: &'static str, value: f32, max: f32) -> Result<()> {
    if !value.is_finite() || !(0.0..=max).contains(&value) {
        return Err(CoreError::OutOfRange {
            field,
            value: value as f64,
        });
    }
    Ok(())
}

pub(crate) fn non_finite(layer: Layer, v: Vec3) -> CoreError {
    let bad = [v.x, v.y, v.z]
        .into_iter()
        .find(|c| !c.is_finite())
        .unwrap_or(f32::NAN);
    CoreError::OutOfRange {
        field: layer.as_str(),
        value: bad as f64,
    }
}

pub(crate) fn validate_coordinates(coords: &Coordinates) -> Result<()> {
    match coords.first_non_finite() {
        Some(layer) => Err(non_finite(layer, coords.get(layer).unwrap_or_default())),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_attrs_are_valid() {
        let attrs = TokenAttrs::default();
        assert!(attrs.validate().is_ok());
        assert_eq!(attrs.flags(), TokenFlags::ACTIVE);
    }

    #[test]
    fn test_attr_bounds() {
        let mut attrs = TokenAttrs::default();
        attrs.field_radius = 2.55;
        assert!(attrs.validate().is_ok());
        attrs.field_radius = 2.56;
        assert!(matches!(
            attrs.validate(),
            Err(CoreError::OutOfRange { field: "field_radius", .. })
        ));

        let mut attrs = TokenAttrs::default();
        attrs.weight = -0.01;
        assert!(attrs.validate().is_err());
        attrs.weight = f32::NAN;
        assert!(attrs.validate().is_err());

        let mut attrs = TokenAttrs::default();
        attrs.field_strength = 1.5;
        assert!(matches!(
            attrs.validate(),
            Err(CoreError::OutOfRange { field: "field_strength", .. })
        ));
    }

    #[test]
    fn test_persistent_flag() {
        let attrs = TokenAttrs {
            persistent: true,
            ..TokenAttrs::default()
        };
        assert!(attrs.flags().contains(TokenFlags::PERSISTENT | TokenFlags::ACTIVE));
    }

    #[test]
    fn test_flags_serialize_as_byte() {
        let flags = TokenFlags::ACTIVE | TokenFlags::LOCKED;
        assert_eq!(serde_json::to_string(&flags).unwrap(), "5");
        let back: TokenFlags = serde_json::from_str("5").unwrap();
        assert_eq!(back, flags);
        // Unknown bits survive a round trip.
        let odd: TokenFlags = serde_json::from_str("129").unwrap();
        assert_eq!(odd.bits(), 129);
    }

    #[test]
    fn test_flag_map() {
        let map = (TokenFlags::ACTIVE | TokenFlags::PERSISTENT).to_map();
        assert_eq!(map["active"], true);
        assert_eq!(map["persistent"], true);
        assert_eq!(map["locked"], false);
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn test_patch_touched_layers() {
        let patch = TokenPatch::new()
            .weight(0.2)
            .set_layer(Layer::Motor, Vec3::ZERO)
            .clear_layer(Layer::Physical);
        let touched: Vec<Layer> = patch.touched_layers().layers().collect();
        assert_eq!(touched, vec![Layer::Physical, Layer::Motor]);
    }

    #[test]
    fn test_patch_rejects_non_finite_layer() {
        let patch = TokenPatch::new().set_layer(Layer::Social, Vec3::new(0.0, f32::INFINITY, 0.0));
        assert!(matches!(
            patch.validate(),
            Err(CoreError::OutOfRange { field: "l6_social", .. })
        ));
    }

    #[test]
    fn test_patch_apply_merges() {
        let mut token = Token {
            id: TokenId(1),
            entity_type: 0,
            domain: 0,
            local_id: 1,
            weight: 0.5,
            field_radius: 1.0,
            field_strength: 1.0,
            timestamp: 0,
            flags: TokenFlags::ACTIVE,
            coordinates: Coordinates::new()
                .with(Layer::Physical, Vec3::new(1.0, 2.0, 3.0))
                .with(Layer::Sensory, Vec3::ZERO),
        };
        TokenPatch::new()
            .field_strength(0.25)
            .clear_layer(Layer::Sensory)
            .set_layer(Layer::Abstract, Vec3::new(9.0, 9.0, 9.0))
            .apply(&mut token);

        assert_eq!(token.weight, 0.5);
        assert_eq!(token.field_strength, 0.25);
        assert_eq!(token.coordinates.get(Layer::Physical), Some(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(token.coordinates.get(Layer::Sensory), None);
        assert_eq!(token.coordinates.get(Layer::Abstract), Some(Vec3::new(9.0, 9.0, 9.0)));
    }

    #[test]
    fn test_age_seconds_saturates() {
        let token = Token {
            id: TokenId(1),
            entity_type: 0,
            domain: 0,
            local_id: 1,
            weight: 0.5,
            field_radius: 1.0,
            field_strength: 1.0,
            timestamp: 100,
            flags: TokenFlags::default(),
            coordinates: Coordinates::new(),
        };
        assert_eq!(token.age_seconds(160), 60);
        assert_eq!(token.age_seconds(50), 0);
    }
}
