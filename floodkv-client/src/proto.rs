//! Client core, as a state machine without IO.
//!
//! Everything in here is synchronous and deterministic: timing enters only
//! through explicit `now` arguments and the store is never touched. The
//! [`crate::client`] module wraps this state machine in an actor that owns
//! the IO.

mod backoff;
pub mod state;
pub mod types;

pub use backoff::ExpBackoff;
pub use state::{AdvertiseBatch, ClientState, Config, PersistUpdate, ReconcileEvent};
pub use types::{AreaId, Key, KeyFilter, NodeId, Payload, Publication, Ttl, Value};
