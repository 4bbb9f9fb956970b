//! A minimal prefix manager, as a consumer of the client contract.
//!
//! The prefix manager owns the set of routed prefixes this node originates
//! and mirrors it into the store: one persisted key per prefix and area,
//! withdrawn keys overwritten with an empty record that ages out. Route
//! selection, origination policy and the surrounding service glue live
//! elsewhere; this type only demonstrates how a producer drives the client.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    client::{Client, KeyCallback},
    proto::{AreaId, Key, KeyFilter, NodeId, Ttl},
};

/// Key namespace for prefix advertisements.
const PREFIX_KEY_NAMESPACE: &str = "prefix:";

/// One prefix advertised by a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixEntry {
    /// The advertised prefix in CIDR notation.
    pub prefix: String,
    /// Path preference; higher is preferred on ties.
    pub preference: u32,
    /// Forwarding metric towards the prefix.
    pub metric: u32,
}

/// Mirrors this node's originated prefixes into the store.
pub struct PrefixManager {
    client: Client,
    node_id: NodeId,
    areas: Vec<AreaId>,
    key_ttl: Ttl,
    /// Currently advertised prefixes, keyed by CIDR.
    prefixes: BTreeMap<String, PrefixEntry>,
    /// Keys advertised earlier that must be withdrawn on the next sync.
    keys_to_clear: BTreeSet<Key>,
}

impl PrefixManager {
    /// Create a manager advertising into `areas` with the given key ttl.
    pub fn new(client: Client, node_id: NodeId, areas: Vec<AreaId>, key_ttl: Ttl) -> Self {
        Self {
            client,
            node_id,
            areas,
            key_ttl,
            prefixes: BTreeMap::new(),
            keys_to_clear: BTreeSet::new(),
        }
    }

    /// The store key under which a node advertises a prefix.
    pub fn prefix_key(node_id: &NodeId, prefix: &str) -> Key {
        Key::new(format!("{PREFIX_KEY_NAMESPACE}{node_id}:{prefix}"))
    }

    /// Advertise prefixes, replacing existing entries for the same CIDR.
    /// Returns whether anything changed.
    pub async fn advertise(&mut self, entries: Vec<PrefixEntry>) -> Result<bool> {
        let mut changed = false;
        for entry in entries {
            if self.prefixes.get(&entry.prefix) == Some(&entry) {
                continue;
            }
            debug!(prefix = %entry.prefix, "advertising prefix");
            self.prefixes.insert(entry.prefix.clone(), entry);
            changed = true;
        }
        if changed {
            self.sync().await?;
        }
        Ok(changed)
    }

    /// Withdraw prefixes by CIDR. Returns whether anything changed.
    pub async fn withdraw(&mut self, prefixes: Vec<String>) -> Result<bool> {
        let mut changed = false;
        for prefix in prefixes {
            if self.prefixes.remove(&prefix).is_some() {
                debug!(prefix = %prefix, "withdrawing prefix");
                self.keys_to_clear
                    .insert(Self::prefix_key(&self.node_id, &prefix));
                changed = true;
            }
        }
        if changed {
            self.sync().await?;
        }
        Ok(changed)
    }

    /// Push the whole prefix table into every area and clear withdrawn
    /// keys. Unchanged entries are no-ops in the client.
    pub async fn sync(&mut self) -> Result<()> {
        for area in self.areas.clone() {
            for (prefix, entry) in &self.prefixes {
                let key = Self::prefix_key(&self.node_id, prefix);
                let payload: Bytes = postcard::to_stdvec(entry)?.into();
                self.client
                    .persist_key(area.clone(), key, payload, self.key_ttl)
                    .await?;
            }
            for key in &self.keys_to_clear {
                self.client
                    .clear_key(area.clone(), key.clone(), Bytes::new(), self.key_ttl)
                    .await?;
            }
        }
        self.keys_to_clear.clear();
        Ok(())
    }

    /// Observe prefix advertisements of other nodes. Own advertisements
    /// never loop back through the filter.
    pub async fn watch(&self, callback: KeyCallback) -> Result<()> {
        self.client
            .subscribe_key_filter(
                KeyFilter::new([PREFIX_KEY_NAMESPACE.to_string()], []),
                callback,
            )
            .await
    }

    /// The currently advertised prefixes.
    pub fn prefixes(&self) -> impl Iterator<Item = &PrefixEntry> {
        self.prefixes.values()
    }
}
