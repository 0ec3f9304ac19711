//! Live side of the Axiom token space.
//!
//! [`ChannelRegistry`] tracks connections and their channel subscriptions
//! and fans broadcasts out through one ordered delivery task per connection.
//! [`Axiom`] composes it with an [`axiom_core::TokenSpace`] so every token
//! change is published once the store and the layer grids agree.

pub mod error;
pub mod event;
pub mod facade;
pub mod registry;

pub use error::{DeliveryError, DeliveryFailure, Result, SignalError};
pub use event::{QUERIES_CHANNEL, QueryEvent, TOKENS_CHANNEL, TokenEvent, domain_channel};
pub use facade::{Axiom, AxiomStatus};
pub use registry::{
    ChannelMessage, ChannelRegistry, ConnectionId, Delivery, DeliveryReport, Dispatch,
    RegistryStats, SignalConfig, Subscriber,
};
