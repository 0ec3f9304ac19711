use std::collections::BTreeMap;

use crate::constants::FIRST_LOCAL_ID;
use crate::error::{CoreError, Result};
use crate::identity::{IdLayout, TokenId};
use crate::layer::Coordinates;
use crate::token::{Token, TokenAttrs, TokenPatch, validate_coordinates};

/// Canonical token records.
///
/// Records are keyed by local id. Local ids come from one store-wide counter
/// that only moves forward, so key order is creation order and a deleted id
/// is never handed out again.
///
/// The store does no locking of its own; [`crate::TokenSpace`] wraps it.
#[derive(Debug, Clone)]
pub struct TokenStore {
    layout: IdLayout,
    tokens: BTreeMap<u32, Token>,
    next_local_id: u32,
    last_timestamp: u64,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new(IdLayout::DEFAULT)
    }
}

impl TokenStore {
    pub fn new(layout: IdLayout) -> Self {
        Self {
            layout,
            tokens: BTreeMap::new(),
            next_local_id: FIRST_LOCAL_ID,
            last_timestamp: 0,
        }
    }

    pub fn layout(&self) -> IdLayout {
        self.layout
    }

    /// The local id the next `create` will use.
    pub fn next_local_id(&self) -> u32 {
        self.next_local_id
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Tokens in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Token> {
        self.tokens.values()
    }

    /// Validate, assign identity and timestamp, and store. Nothing is written
    /// if any check fails.
    pub fn create(&mut self, attrs: &TokenAttrs, coordinates: Coordinates, now: u64) -> Result<Token> {
        attrs.validate()?;
        validate_coordinates(&coordinates)?;

        let local_id = self.next_local_id;
        let id = self.layout.pack(attrs.entity_type, attrs.domain, local_id)?;
        // Clock steps backwards are absorbed so timestamps never decrease.
        let timestamp = now.max(self.last_timestamp);

        let token = Token {
            id,
            entity_type: attrs.entity_type,
            domain: attrs.domain,
            local_id,
            weight: attrs.weight,
            field_radius: attrs.field_radius,
            field_strength: attrs.field_strength,
            timestamp,
            flags: attrs.flags(),
            coordinates,
        };
        self.tokens.insert(local_id, token.clone());
        self.next_local_id = local_id.saturating_add(1);
        self.last_timestamp = timestamp;
        Ok(token)
    }

    pub fn get(&self, id: TokenId) -> Result<&Token> {
        let (_, _, local_id) = self.layout.unpack(id);
        self.tokens
            .get(&local_id)
            .filter(|t| t.id == id)
            .ok_or(CoreError::NotFound(id))
    }

    pub fn contains(&self, id: TokenId) -> bool {
        self.get(id).is_ok()
    }

    /// Merge a patch. The id never changes; omitted fields and `Keep` layers
    /// stay as they were.
    pub fn update(&mut self, id: TokenId, patch: &TokenPatch) -> Result<Token> {
        patch.validate()?;
        let (_, _, local_id) = self.layout.unpack(id);
        let token = self
            .tokens
            .get_mut(&local_id)
            .filter(|t| t.id == id)
            .ok_or(CoreError::NotFound(id))?;
        patch.apply(token);
        Ok(token.clone())
    }

    pub fn delete(&mut self, id: TokenId) -> Result<Token> {
        self.get(id)?;
        let (_, _, local_id) = self.layout.unpack(id);
        self.tokens.remove(&local_id).ok_or(CoreError::NotFound(id))
    }

    /// One page in creation order. `limit == 0` yields nothing.
    pub fn list(&self, limit: usize, offset: usize) -> Vec<Token> {
        self.tokens.values().skip(offset).take(limit).cloned().collect()
    }

    /// Rebuild from persisted records.
    ///
    /// Every record must decompose under `layout` into its own fields, carry
    /// in-range attributes and finite coordinates, and be unique. The counter
    /// resumes at the larger of `next_local_id` and one past the highest
    /// restored local id.
    pub fn restore(layout: IdLayout, tokens: Vec<Token>, next_local_id: u32) -> Result<Self> {
        let mut store = Self::new(layout.validate()?);
        for token in tokens {
            let expected = layout
                .pack(token.entity_type, token.domain, token.local_id)
                .map_err(|e| CoreError::InvalidSnapshot(format!("token {}: {e}", token.id)))?;
            if expected != token.id {
                return Err(CoreError::InvalidSnapshot(format!(
                    "token {} does not match its components (expected {})",
                    token.id.hex(),
                    expected.hex()
                )));
            }
            let attrs = TokenAttrs {
                entity_type: token.entity_type,
                domain: token.domain,
                weight: token.weight,
                field_radius: token.field_radius,
                field_strength: token.field_strength,
                persistent: token.is_persistent(),
            };
            attrs
                .validate()
                .and_then(|_| validate_coordinates(&token.coordinates))
                .map_err(|e| CoreError::InvalidSnapshot(format!("token {}: {e}", token.id)))?;

            store.last_timestamp = store.last_timestamp.max(token.timestamp);
            let local_id = token.local_id;
            if store.tokens.insert(local_id, token).is_some() {
                return Err(CoreError::InvalidSnapshot(format!(
                    "duplicate local id {local_id}"
                )));
            }
        }
        let after_last = store
            .tokens
            .keys()
            .next_back()
            .map_or(FIRST_LOCAL_ID, |l| l.saturating_add(1));
        store.next_local_id = next_local_id.max(after_last).max(FIRST_LOCAL_ID);
        Ok(store)
    }
}
