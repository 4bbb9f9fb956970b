//! Core data types shared between the state machine and the client.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    fmt,
    hash::{Hash, Hasher},
    time::Duration,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifier of a flooding scope.
///
/// All per-key state is partitioned by area; reconciliation never crosses
/// areas.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AreaId(String);

impl AreaId {
    /// Create an area id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The area id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AreaId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for AreaId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A key in the store, unique within an area.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(String);

impl Key {
    /// Create a key. Keys must be non-empty.
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        debug_assert!(!key.is_empty(), "keys must be non-empty");
        Self(key)
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the node that originated a value.
///
/// Ties in `version` are broken in favor of the larger originator byte
/// string, so two nodes overwriting each other converge on one winner.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The node id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty. Empty node ids are rejected at client
    /// construction.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A time-to-live in milliseconds, with an explicit infinite sentinel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ttl(i64);

impl Ttl {
    /// The value never expires and is never refreshed.
    pub const INFINITE: Ttl = Ttl(i64::MAX);

    /// A finite ttl from milliseconds.
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    /// The ttl in milliseconds.
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// False for [`Ttl::INFINITE`].
    pub const fn is_finite(self) -> bool {
        self.0 < Self::INFINITE.0
    }

    /// A quarter of the ttl, used as the refresh interval so a value is
    /// refreshed roughly three times before it would lapse.
    pub(crate) fn refresh_interval(self) -> Duration {
        Duration::from_millis((self.0 / 4).max(0) as u64)
    }
}

impl From<Duration> for Ttl {
    fn from(value: Duration) -> Self {
        Self(value.as_millis() as i64)
    }
}

impl fmt::Debug for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_finite() {
            write!(f, "{}ms", self.0)
        } else {
            write!(f, "inf")
        }
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The payload of a value record.
///
/// A received entry is either a full value or a lifetime refresh that must
/// not disturb the stored payload. Modeling this as a sum type keeps the
/// reconciler's branches exhaustive.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// An opaque value, produced and consumed by the store's clients.
    Data(Bytes),
    /// A value-less record that only refreshes the key's lifetime.
    TtlOnly,
}

impl Payload {
    /// The payload bytes, if this is a full value.
    pub fn data(&self) -> Option<&Bytes> {
        match self {
            Payload::Data(bytes) => Some(bytes),
            Payload::TtlOnly => None,
        }
    }

    /// Whether this is a lifetime-only record.
    pub fn is_ttl_only(&self) -> bool {
        matches!(self, Payload::TtlOnly)
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Data(value)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Payload::Data(bytes) => write!(f, "<{}b>", bytes.len()),
            Payload::TtlOnly => write!(f, "ttl-only"),
        }
    }
}

/// A value record as flooded by the store.
///
/// Precedence between two records for the same key is decided by
/// [`Value::cmp_precedence`]; the payload never participates.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    /// Version of the payload. Higher wins unconditionally.
    pub version: u32,
    /// The node that produced this record.
    pub originator: NodeId,
    /// Lifetime of the key in the store.
    pub ttl: Ttl,
    /// Monotone counter bumped by lifetime refreshes. Never touches the
    /// payload.
    pub ttl_version: u32,
    /// The payload, or a marker that this record is a lifetime refresh.
    pub payload: Payload,
    /// Optional content hash over `(version, originator, payload)`.
    pub hash: Option<u64>,
}

impl Value {
    /// Create a full value record, computing its content hash.
    pub fn new(version: u32, originator: NodeId, payload: Bytes, ttl: Ttl) -> Self {
        let hash = Self::content_hash(version, &originator, &payload);
        Self {
            version,
            originator,
            ttl,
            ttl_version: 0,
            payload: Payload::Data(payload),
            hash: Some(hash),
        }
    }

    /// Create a value-less record that only refreshes lifetime.
    pub fn ttl_only(version: u32, originator: NodeId, ttl: Ttl, ttl_version: u32) -> Self {
        Self {
            version,
            originator,
            ttl,
            ttl_version,
            payload: Payload::TtlOnly,
            hash: None,
        }
    }

    /// Hash over the fields that identify a payload revision.
    pub fn content_hash(version: u32, originator: &NodeId, payload: &Bytes) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        version.hash(&mut hasher);
        originator.hash(&mut hasher);
        payload.hash(&mut hasher);
        hasher.finish()
    }

    /// Recompute and store the content hash, for records whose payload or
    /// version was just rewritten.
    pub(crate) fn rehash(&mut self) {
        self.hash = self
            .payload
            .data()
            .map(|data| Self::content_hash(self.version, &self.originator, data));
    }

    /// Total precedence order on `(version, originator, ttl_version)`.
    pub fn cmp_precedence(&self, other: &Value) -> Ordering {
        (self.version, &self.originator, self.ttl_version).cmp(&(
            other.version,
            &other.originator,
            other.ttl_version,
        ))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Value(v{} {} ttlv{} {} {:?})",
            self.version, self.originator, self.ttl_version, self.ttl, self.payload
        )
    }
}

/// A batch of updates for one area, as delivered by the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Publication {
    /// The flooding scope this publication belongs to.
    pub area: AreaId,
    /// Updated key/value records.
    pub key_vals: BTreeMap<Key, Value>,
    /// Keys whose lifetime lapsed. Already absent from the store.
    pub expired_keys: Vec<Key>,
}

impl Publication {
    /// An empty publication for an area.
    pub fn new(area: AreaId) -> Self {
        Self {
            area,
            key_vals: BTreeMap::new(),
            expired_keys: Vec::new(),
        }
    }
}

/// Filter over `(key, value)` pairs for the prefix-filter subscription.
///
/// A pair matches if its key starts with any of the configured prefixes or
/// its originator is one of the configured node ids. An empty filter matches
/// everything.
#[derive(Clone, Debug, Default)]
pub struct KeyFilter {
    prefixes: Vec<String>,
    originators: BTreeSet<NodeId>,
}

impl KeyFilter {
    /// Create a filter from key prefixes and originator ids.
    pub fn new(
        prefixes: impl IntoIterator<Item = String>,
        originators: impl IntoIterator<Item = NodeId>,
    ) -> Self {
        Self {
            prefixes: prefixes.into_iter().collect(),
            originators: originators.into_iter().collect(),
        }
    }

    /// Whether the pair passes the filter.
    pub fn matches(&self, key: &Key, value: &Value) -> bool {
        if self.prefixes.is_empty() && self.originators.is_empty() {
            return true;
        }
        if self.prefixes.iter().any(|p| key.as_str().starts_with(p)) {
            return true;
        }
        self.originators.contains(&value.originator)
    }
}
