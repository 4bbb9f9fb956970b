//! Persist and defend keys in a flooded key-value store.
//!
//! A link-state routing daemon replicates its state through a gossip-style
//! key-value store. This crate is the client that runs next to such a store
//! inside the routing process: local producers declare the keys this node
//! owns, and the client advertises them, renews their ttl before expiry and
//! reclaims ownership whenever the network reflects back a stale or foreign
//! record for one of them. Convergence is eventual, with last-writer-wins
//! on `(version, originator, ttl version)`.
//!
//! The conflict-resolution core is an IO-free state machine in [`proto`];
//! [`client`] wraps it in an actor that owns all state, the timers and the
//! store IO. [`prefix`] shows a typical producer on top of the client.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod client;
pub mod metrics;
pub mod prefix;
pub mod proto;
pub mod store;

pub use client::{Client, KeyCallback};
pub use proto::{AreaId, Config, Key, KeyFilter, NodeId, Publication, Ttl, Value};
pub use store::Store;
