//! The contract the client consumes from the co-resident store, and an
//! in-memory store used by tests and demos.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;

use crate::proto::{AreaId, Key, Payload, Publication, Value};

/// Stream of publications delivered by the store. Finite on shutdown.
pub type PublicationStream = futures_lite::stream::Boxed<Publication>;

/// What the client needs from the key-value store it fronts.
///
/// The store is co-resident: calls are in-process RPCs that block the
/// current cooperative step, and the client holds a non-owning handle whose
/// lifetime exceeds the client's.
pub trait Store: Send + 'static {
    /// Subscribe to the store's publication feed.
    ///
    /// The stream ends when the store shuts down, which stops the client's
    /// intake cleanly.
    fn updates(&self) -> PublicationStream;

    /// Read the current records for a set of keys. Absent keys are simply
    /// missing from the response.
    fn get_key_vals(
        &self,
        area: &AreaId,
        keys: Vec<Key>,
    ) -> impl Future<Output = Result<Publication>> + Send;

    /// Merge a batch of records into an area.
    fn set_key_vals(
        &self,
        area: &AreaId,
        key_vals: BTreeMap<Key, Value>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Dump the records of each requested area whose keys start with
    /// `prefix`. An empty prefix dumps everything.
    fn dump_key_vals(
        &self,
        areas: Vec<AreaId>,
        prefix: &str,
    ) -> impl Future<Output = Result<Vec<Publication>>> + Send;
}

/// An in-memory [`Store`] with the same merge rules as a flooding store.
///
/// Accepted writes are published back to every subscriber, including the
/// writer, which mirrors how a real store reflects a node's own updates.
/// Failure injection makes backoff paths testable.
#[derive(Clone, Debug, Default)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    areas: HashMap<AreaId, BTreeMap<Key, Value>>,
    subscribers: Vec<mpsc::UnboundedSender<Publication>>,
    fail_sets: u32,
    set_attempts: usize,
}

impl Inner {
    fn broadcast(&mut self, publication: Publication) {
        if publication.key_vals.is_empty() && publication.expired_keys.is_empty() {
            return;
        }
        self.subscribers
            .retain(|tx| tx.send(publication.clone()).is_ok());
    }

    fn merge(&mut self, area: &AreaId, key_vals: BTreeMap<Key, Value>) -> Publication {
        let entries = self.areas.entry(area.clone()).or_default();
        let mut accepted = Publication::new(area.clone());
        for (key, rcvd) in key_vals {
            match entries.get_mut(&key) {
                None => {
                    // a ttl refresh for an unknown key has nothing to refresh
                    if rcvd.payload.data().is_some() {
                        entries.insert(key.clone(), rcvd.clone());
                        accepted.key_vals.insert(key, rcvd);
                    }
                }
                Some(existing) => match &rcvd.payload {
                    Payload::Data(_) => {
                        if rcvd.cmp_precedence(existing) == Ordering::Greater {
                            *existing = rcvd.clone();
                            accepted.key_vals.insert(key, rcvd);
                        }
                    }
                    Payload::TtlOnly => {
                        if rcvd.version == existing.version
                            && rcvd.originator == existing.originator
                            && rcvd.ttl_version > existing.ttl_version
                        {
                            existing.ttl_version = rcvd.ttl_version;
                            existing.ttl = rcvd.ttl;
                            accepted.key_vals.insert(key, rcvd);
                        }
                    }
                },
            }
        }
        accepted
    }
}

impl MemStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one record.
    pub fn get(&self, area: &AreaId, key: &Key) -> Option<Value> {
        self.inner
            .lock()
            .unwrap()
            .areas
            .get(area)
            .and_then(|entries| entries.get(key).cloned())
    }

    /// Number of `set_key_vals` calls seen so far, including failed ones.
    pub fn set_attempts(&self) -> usize {
        self.inner.lock().unwrap().set_attempts
    }

    /// Make the next `n` `set_key_vals` calls fail.
    pub fn fail_next_sets(&self, n: u32) {
        self.inner.lock().unwrap().fail_sets = n;
    }

    /// Insert a record as if it was flooded in from a peer, and publish it.
    pub fn inject(&self, area: &AreaId, key: Key, value: Value) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .areas
            .entry(area.clone())
            .or_default()
            .insert(key.clone(), value.clone());
        let mut publication = Publication::new(area.clone());
        publication.key_vals.insert(key, value);
        inner.broadcast(publication);
    }

    /// Silently lose a record, without notifying subscribers.
    pub fn drop_key(&self, area: &AreaId, key: &Key) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entries) = inner.areas.get_mut(area) {
            entries.remove(key);
        }
    }

    /// Expire keys: remove them and publish them on the expired list.
    pub fn expire(&self, area: &AreaId, keys: Vec<Key>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entries) = inner.areas.get_mut(area) {
            for key in &keys {
                entries.remove(key);
            }
        }
        let mut publication = Publication::new(area.clone());
        publication.expired_keys = keys;
        inner.broadcast(publication);
    }
}

impl Store for MemStore {
    fn updates(&self) -> PublicationStream {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().subscribers.push(tx);
        Box::pin(futures_lite::stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }

    async fn get_key_vals(&self, area: &AreaId, keys: Vec<Key>) -> Result<Publication> {
        let inner = self.inner.lock().unwrap();
        let mut publication = Publication::new(area.clone());
        if let Some(entries) = inner.areas.get(area) {
            for key in keys {
                if let Some(value) = entries.get(&key) {
                    publication.key_vals.insert(key, value.clone());
                }
            }
        }
        Ok(publication)
    }

    async fn set_key_vals(&self, area: &AreaId, key_vals: BTreeMap<Key, Value>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.set_attempts += 1;
        if inner.fail_sets > 0 {
            inner.fail_sets -= 1;
            return Err(anyhow!("injected store failure"));
        }
        let accepted = inner.merge(area, key_vals);
        inner.broadcast(accepted);
        Ok(())
    }

    async fn dump_key_vals(&self, areas: Vec<AreaId>, prefix: &str) -> Result<Vec<Publication>> {
        let inner = self.inner.lock().unwrap();
        let mut publications = Vec::new();
        for area in areas {
            let mut publication = Publication::new(area.clone());
            if let Some(entries) = inner.areas.get(&area) {
                for (key, value) in entries {
                    if key.as_str().starts_with(prefix) {
                        publication.key_vals.insert(key.clone(), value.clone());
                    }
                }
            }
            publications.push(publication);
        }
        Ok(publications)
    }
}
