use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Packed 32-bit token identifier.
///
/// Layout (default): `entity_type:4 | domain:4 | local_id:24`, entity type in
/// the most significant bits. The components only mean something relative to
/// an [`IdLayout`]; decode with [`IdLayout::unpack`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub u32);

impl TokenId {
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Zero-padded hex form, e.g. `0x1A000003`.
    pub fn hex(self) -> String {
        format!("0x{:08X}", self.0)
    }

    /// Accepts decimal or `0x`-prefixed hex.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let raw = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => s.parse().ok()?,
        };
        Some(Self(raw))
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for TokenId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Bit widths of the three identity components. Must sum to 32.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdLayout {
    pub entity_bits: u8,
    pub domain_bits: u8,
    pub local_bits: u8,
}

impl Default for IdLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

const fn mask(bits: u8) -> u32 {
    if bits >= 32 { u32::MAX } else { (1u32 << bits) - 1 }
}

impl IdLayout {
    pub const DEFAULT: Self = Self {
        entity_bits: 4,
        domain_bits: 4,
        local_bits: 24,
    };

    /// Entity type and domain are stored as bytes, so each is capped at 8 bits.
    pub fn validate(self) -> Result<Self> {
        let total = self.entity_bits as u64 + self.domain_bits as u64 + self.local_bits as u64;
        if total != 32 {
            return Err(CoreError::InvalidRange {
                field: "layout_bits",
                value: total,
                max: 32,
            });
        }
        for (field, bits, max) in [
            ("entity_bits", self.entity_bits, 8u64),
            ("domain_bits", self.domain_bits, 8),
            ("local_bits", self.local_bits, 30),
        ] {
            if bits == 0 || bits as u64 > max {
                return Err(CoreError::InvalidRange {
                    field,
                    value: bits as u64,
                    max,
                });
            }
        }
        Ok(self)
    }

    pub fn max_entity_type(self) -> u8 {
        mask(self.entity_bits) as u8
    }

    pub fn max_domain(self) -> u8 {
        mask(self.domain_bits) as u8
    }

    pub fn max_local_id(self) -> u32 {
        mask(self.local_bits)
    }

    pub fn pack(self, entity_type: u8, domain: u8, local_id: u32) -> Result<TokenId> {
        check("entity_type", entity_type as u64, self.max_entity_type() as u64)?;
        check("domain", domain as u64, self.max_domain() as u64)?;
        check("local_id", local_id as u64, self.max_local_id() as u64)?;

        let raw = ((entity_type as u32) << (self.domain_bits + self.local_bits))
            | ((domain as u32) << self.local_bits)
            | local_id;
        Ok(TokenId(raw))
    }

    /// Total inverse of [`IdLayout::pack`]: every u32 decomposes.
    pub fn unpack(self, id: TokenId) -> (u8, u8, u32) {
        let raw = id.0;
        let local_id = raw & mask(self.local_bits);
        let domain = (raw >> self.local_bits) & mask(self.domain_bits);
        let entity_type = (raw >> (self.domain_bits + self.local_bits)) & mask(self.entity_bits);
        (entity_type as u8, domain as u8, local_id)
    }
}

fn check(field: &'static str, value: u64, max: u64) -> Result<()> {
    if value > max {
        return Err(CoreError::InvalidRange { field, value, max });
    }
    Ok(())
}

/// Pack with the default 4/4/24 layout.
pub fn pack(entity_type: u8, domain: u8, local_id: u32) -> Result<TokenId> {
    IdLayout::DEFAULT.pack(entity_type, domain, local_id)
}

/// Unpack with the default 4/4/24 layout.
pub fn unpack(id: TokenId) -> (u8, u8, u32) {
    IdLayout::DEFAULT.unpack(id)
}
