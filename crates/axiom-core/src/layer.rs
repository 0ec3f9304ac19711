use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::LAYER_COUNT;

/// One of the eight coordinate spaces a token can be positioned in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Layer {
    #[serde(rename = "l1_physical")]
    Physical,
    #[serde(rename = "l2_sensory")]
    Sensory,
    #[serde(rename = "l3_motor")]
    Motor,
    #[serde(rename = "l4_emotional")]
    Emotional,
    #[serde(rename = "l5_cognitive")]
    Cognitive,
    #[serde(rename = "l6_social")]
    Social,
    #[serde(rename = "l7_temporal")]
    Temporal,
    #[serde(rename = "l8_abstract")]
    Abstract,
}

impl Layer {
    pub const ALL: [Layer; LAYER_COUNT] = [
        Layer::Physical,
        Layer::Sensory,
        Layer::Motor,
        Layer::Emotional,
        Layer::Cognitive,
        Layer::Social,
        Layer::Temporal,
        Layer::Abstract,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn bit(self) -> LayerSet {
        LayerSet::from_bits_retain(1 << self.index())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Physical => "l1_physical",
            Self::Sensory => "l2_sensory",
            Self::Motor => "l3_motor",
            Self::Emotional => "l4_emotional",
            Self::Cognitive => "l5_cognitive",
            Self::Social => "l6_social",
            Self::Temporal => "l7_temporal",
            Self::Abstract => "l8_abstract",
        }
    }

    /// Accepts `l3`, `L3`, `motor` or `l3_motor`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|layer| {
            let full = layer.as_str();
            let (short, name) = full.split_at(2);
            s == full || s == short || s == name[1..]
        })
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A position inside one layer. Serialized as `[x, y, z]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 3]", into = "[f32; 3]")]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Euclidean distance, accumulated in f64.
    pub fn distance(self, other: Self) -> f64 {
        let dx = self.x as f64 - other.x as f64;
        let dy = self.y as f64 - other.y as f64;
        let dz = self.z as f64 - other.z as f64;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn to_array(self) -> [f32; 3] {
        [self.x, self.y, self.z]
    }
}

impl From<[f32; 3]> for Vec3 {
    fn from([x, y, z]: [f32; 3]) -> Self {
        Self { x, y, z }
    }
}

impl From<Vec3> for [f32; 3] {
    fn from(v: Vec3) -> Self {
        v.to_array()
    }
}

bitflags::bitflags! {
    /// Set of layers, one bit per layer index.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct LayerSet: u8 {
        const PHYSICAL = 1 << 0;
        const SENSORY = 1 << 1;
        const MOTOR = 1 << 2;
        const EMOTIONAL = 1 << 3;
        const COGNITIVE = 1 << 4;
        const SOCIAL = 1 << 5;
        const TEMPORAL = 1 << 6;
        const ABSTRACT = 1 << 7;
    }
}

impl LayerSet {
    pub fn has(self, layer: Layer) -> bool {
        self.contains(layer.bit())
    }

    pub fn len(self) -> usize {
        self.bits().count_ones() as usize
    }

    /// Member layers in ascending layer order.
    pub fn layers(self) -> impl Iterator<Item = Layer> {
        Layer::ALL.into_iter().filter(move |l| self.has(*l))
    }
}

impl FromIterator<Layer> for LayerSet {
    fn from_iter<I: IntoIterator<Item = Layer>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), |set, layer| set | layer.bit())
    }
}

impl Serialize for LayerSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.layers())
    }
}

/// Per-layer positions. A `None` slot is an absent layer, which is not the
/// same thing as a layer positioned at the origin.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Coordinates([Option<Vec3>; LAYER_COUNT]);

impl Coordinates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, layer: Layer, position: Vec3) -> Self {
        self.set(layer, Some(position));
        self
    }

    pub fn get(&self, layer: Layer) -> Option<Vec3> {
        self.0[layer.index()]
    }

    pub fn set(&mut self, layer: Layer, position: Option<Vec3>) {
        self.0[layer.index()] = position;
    }

    /// Present layers only, ascending.
    pub fn iter(&self) -> impl Iterator<Item = (Layer, Vec3)> + '_ {
        Layer::ALL
            .into_iter()
            .filter_map(|layer| self.get(layer).map(|v| (layer, v)))
    }

    pub fn populated(&self) -> LayerSet {
        self.iter().map(|(layer, _)| layer).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }

    /// First layer holding a non-finite component, if any.
    pub fn first_non_finite(&self) -> Option<Layer> {
        self.iter().find(|(_, v)| !v.is_finite()).map(|(l, _)| l)
    }
}

impl Serialize for Coordinates {
    /// Always writes all eight layer keys; absent layers as `null`.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(LAYER_COUNT))?;
        for layer in Layer::ALL {
            map.serialize_entry(layer.as_str(), &self.get(layer))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Coordinates {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, Option<Vec3>>::deserialize(deserializer)?;
        let mut coords = Coordinates::new();
        for (key, value) in raw {
            let layer = Layer::parse(&key)
                .ok_or_else(|| D::Error::custom(format!("unknown layer '{key}'")))?;
            coords.set(layer, value);
        }
        Ok(coords)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_indices_are_dense() {
        for (i, layer) in Layer::ALL.iter().enumerate() {
            assert_eq!(layer.index(), i);
            assert_eq!(Layer::from_index(i), Some(*layer));
        }
        assert_eq!(Layer::from_index(8), None);
    }

    #[test]
    fn test_layer_parse_forms() {
        assert_eq!(Layer::parse("l3"), Some(Layer::Motor));
        assert_eq!(Layer::parse("L3"), Some(Layer::Motor));
        assert_eq!(Layer::parse("motor"), Some(Layer::Motor));
        assert_eq!(Layer::parse("l3_motor"), Some(Layer::Motor));
        assert_eq!(Layer::parse("l8_abstract"), Some(Layer::Abstract));
        assert_eq!(Layer::parse("l9"), None);
        assert_eq!(Layer::parse(""), None);
    }

    #[test]
    fn test_distance() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(3.0, 4.0, 0.0);
        assert!((a.distance(b) - 5.0).abs() < 1e-12);
        assert_eq!(a.distance(a), 0.0);
    }

    #[test]
    fn test_layer_set_iterates_ascending() {
        let set: LayerSet = [Layer::Abstract, Layer::Physical, Layer::Social]
            .into_iter()
            .collect();
        let order: Vec<Layer> = set.layers().collect();
        assert_eq!(order, vec![Layer::Physical, Layer::Social, Layer::Abstract]);
        assert_eq!(set.len(), 3);
        assert!(!set.has(Layer::Motor));
        assert_eq!(set, LayerSet::PHYSICAL | LayerSet::SOCIAL | LayerSet::ABSTRACT);
        assert_eq!(LayerSet::all().len(), 8);
        assert_eq!(
            serde_json::to_value(set).unwrap(),
            serde_json::json!(["l1_physical", "l6_social", "l8_abstract"])
        );
    }

    #[test]
    fn test_layer_bits_match_named_flags() {
        assert_eq!(Layer::Physical.bit(), LayerSet::PHYSICAL);
        assert_eq!(Layer::Cognitive.bit(), LayerSet::COGNITIVE);
        assert_eq!(Layer::Abstract.bit(), LayerSet::ABSTRACT);
        let union = Layer::ALL
            .into_iter()
            .fold(LayerSet::empty(), |set, layer| set | layer.bit());
        assert_eq!(union, LayerSet::all());
    }

    #[test]
    fn test_absent_and_zero_are_distinct() {
        let coords = Coordinates::new().with(Layer::Physical, Vec3::ZERO);
        assert_eq!(coords.get(Layer::Physical), Some(Vec3::ZERO));
        assert_eq!(coords.get(Layer::Sensory), None);
        assert_eq!(coords.populated().len(), 1);
    }

    #[test]
    fn test_coordinates_json_shape() {
        let coords = Coordinates::new()
            .with(Layer::Physical, Vec3::ZERO)
            .with(Layer::Temporal, Vec3::new(1.5, -2.0, 0.25));
        let json = serde_json::to_value(&coords).unwrap();

        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 8);
        assert_eq!(json["l1_physical"], serde_json::json!([0.0, 0.0, 0.0]));
        assert!(json["l2_sensory"].is_null());
        assert_eq!(json["l7_temporal"], serde_json::json!([1.5, -2.0, 0.25]));

        let back: Coordinates = serde_json::from_value(json).unwrap();
        assert_eq!(back, coords);
    }

    #[test]
    fn test_coordinates_reject_unknown_layer() {
        let err = serde_json::from_str::<Coordinates>(r#"{"l9_dream": [0, 0, 0]}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_first_non_finite() {
        let coords = Coordinates::new()
            .with(Layer::Physical, Vec3::ZERO)
            .with(Layer::Motor, Vec3::new(f32::NAN, 0.0, 0.0));
        assert_eq!(coords.first_non_finite(), Some(Layer::Motor));
    }
}
