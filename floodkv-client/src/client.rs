//! The client actor and the handle used to talk to it.
//!
//! All client state lives inside a single actor task: public operations are
//! messages answered over oneshots, and the advertise timer, the ttl timer,
//! the persistence sweeper and the publication intake are arms of one
//! `select!` loop. This is the whole concurrency story: no table is ever
//! touched from two tasks.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures_lite::StreamExt;
use iroh_metrics::{inc, inc_by};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error_span, trace, warn, Instrument};

use crate::{
    metrics::Metrics,
    proto::{
        AreaId, ClientState, Config, Key, KeyFilter, NodeId, Publication, ReconcileEvent, Ttl,
        Value,
    },
    store::{PublicationStream, Store},
};

mod util;

use self::util::Timers;

/// Channel capacity for the ToActor message queue (single)
const TO_ACTOR_CAP: usize = 64;
/// Sweeper retry delay after a store read failure.
const SWEEP_RETRY: Duration = Duration::from_secs(1);

/// Callback invoked with updates for a key, or with `None` when the key
/// expired from the store.
///
/// Callbacks run on the actor task: they must not block, and they must be
/// unregistered before whatever they capture is torn down.
pub type KeyCallback = Box<dyn FnMut(&Key, Option<&Value>) + Send + 'static>;

/// Handle to the key-value client for one node.
///
/// Cheaply cloneable. The actor stops once every handle is dropped, when
/// [`Client::shutdown`] is called, or when the store's publication stream
/// ends.
#[derive(Debug, Clone)]
pub struct Client {
    to_actor_tx: mpsc::Sender<ToActor>,
    _actor_handle: Arc<JoinHandle<()>>,
}

impl Client {
    /// Spawn the client actor for `node_id` on top of a store.
    ///
    /// # Panics
    ///
    /// Panics if `node_id` is empty. The originator identity takes part in
    /// conflict resolution and must exist.
    pub fn spawn<S: Store>(store: S, node_id: NodeId, config: Config) -> Self {
        assert!(!node_id.is_empty(), "node id must be non-empty");

        let updates = store.updates();
        let (to_actor_tx, to_actor_rx) = mpsc::channel(TO_ACTOR_CAP);
        let me = node_id.clone();
        let actor = Actor {
            state: ClientState::new(node_id, config),
            store,
            updates,
            to_actor_rx,
            timers: Timers::new(),
            key_callbacks: HashMap::new(),
            kv_callback: None,
            filter_callback: None,
        };
        let actor_handle =
            tokio::spawn(actor.run().instrument(error_span!("kv-client", node = %me)));
        Self {
            to_actor_tx,
            _actor_handle: Arc::new(actor_handle),
        }
    }

    /// Declare ongoing ownership of `(area, key)` and keep defending it.
    ///
    /// The key is advertised with a version above anything the store
    /// currently holds, refreshed before its ttl lapses, and re-advertised
    /// whenever the store reflects back a conflicting record. Returns
    /// `false` when the same payload and ttl are already persisted.
    pub async fn persist_key(
        &self,
        area: AreaId,
        key: Key,
        payload: Bytes,
        ttl: Ttl,
    ) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::PersistKey {
            area,
            key,
            payload,
            ttl,
            reply,
        })
        .await?;
        rx.await.map_err(|_| anyhow!("client actor dropped"))
    }

    /// Publish a record once, without defending it.
    ///
    /// With `version` 0 the record is published one version above the
    /// store's current one. Returns `None` when the store rejected the
    /// write.
    ///
    /// Note that a finite-ttl set keeps its lifetime refreshed until a
    /// stronger record displaces it through the update stream, so a one-shot
    /// set is not entirely fire-and-forget.
    pub async fn set_key(
        &self,
        area: AreaId,
        key: Key,
        payload: Bytes,
        version: u32,
        ttl: Ttl,
    ) -> Result<Option<()>> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::SetKey {
            area,
            key,
            payload,
            version,
            ttl,
            reply,
        })
        .await?;
        rx.await.map_err(|_| anyhow!("client actor dropped"))
    }

    /// Stop defending a key. The store keeps the last record until its ttl
    /// lapses; nothing is injected.
    pub async fn unset_key(&self, area: AreaId, key: Key) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::UnsetKey { area, key, reply }).await?;
        rx.await.map_err(|_| anyhow!("client actor dropped"))
    }

    /// Stop defending a key and overwrite it once with a replacement value
    /// that will age out, the standard withdrawal pattern.
    pub async fn clear_key(
        &self,
        area: AreaId,
        key: Key,
        replacement: Bytes,
        ttl: Ttl,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::ClearKey {
            area,
            key,
            replacement,
            ttl,
            reply,
        })
        .await?;
        rx.await.map_err(|_| anyhow!("client actor dropped"))
    }

    /// Read the store's current record for a key. `None` on store failure
    /// or when the key is absent.
    pub async fn get_key(&self, area: AreaId, key: Key) -> Result<Option<Value>> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::GetKey { area, key, reply }).await?;
        rx.await.map_err(|_| anyhow!("client actor dropped"))
    }

    /// Read all records of an area whose keys start with `prefix`. `None`
    /// on store failure.
    pub async fn dump_all_with_prefix(
        &self,
        area: AreaId,
        prefix: String,
    ) -> Result<Option<BTreeMap<Key, Value>>> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::DumpPrefix {
            area,
            prefix,
            reply,
        })
        .await?;
        rx.await.map_err(|_| anyhow!("client actor dropped"))
    }

    /// Register a callback for updates to one key. With `fetch` the store's
    /// current record is read and returned.
    pub async fn subscribe_key(
        &self,
        area: AreaId,
        key: Key,
        callback: KeyCallback,
        fetch: bool,
    ) -> Result<Option<Value>> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::SubscribeKey {
            area,
            key,
            callback,
            fetch,
            reply,
        })
        .await?;
        rx.await.map_err(|_| anyhow!("client actor dropped"))
    }

    /// Remove the callback for one key.
    pub async fn unsubscribe_key(&self, area: AreaId, key: Key) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::UnsubscribeKey { area, key, reply })
            .await?;
        rx.await.map_err(|_| anyhow!("client actor dropped"))
    }

    /// Install the prefix-filter callback. It fires for matching updates to
    /// keys this node does not persist, so a node never observes its own
    /// advertisements through the filter.
    pub async fn subscribe_key_filter(
        &self,
        filter: KeyFilter,
        callback: KeyCallback,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::SubscribeKeyFilter {
            filter,
            callback,
            reply,
        })
        .await?;
        rx.await.map_err(|_| anyhow!("client actor dropped"))
    }

    /// Remove the prefix-filter callback.
    pub async fn unsubscribe_key_filter(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::UnsubscribeKeyFilter { reply }).await?;
        rx.await.map_err(|_| anyhow!("client actor dropped"))
    }

    /// Install or remove the catch-all callback, invoked for every received
    /// update and every expiry.
    pub async fn set_kv_callback(&self, callback: Option<KeyCallback>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::SetKvCallback { callback, reply }).await?;
        rx.await.map_err(|_| anyhow!("client actor dropped"))
    }

    /// Stop the actor and wait until it drained.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ToActor::Shutdown { reply }).await?;
        rx.await.map_err(|_| anyhow!("client actor dropped"))
    }

    async fn send(&self, msg: ToActor) -> Result<()> {
        self.to_actor_tx
            .send(msg)
            .await
            .map_err(|_| anyhow!("client actor dropped"))
    }
}

/// Input messages for the client [`Actor`].
#[derive(derive_more::Debug)]
enum ToActor {
    PersistKey {
        area: AreaId,
        key: Key,
        payload: Bytes,
        ttl: Ttl,
        #[debug("reply")]
        reply: oneshot::Sender<bool>,
    },
    SetKey {
        area: AreaId,
        key: Key,
        payload: Bytes,
        version: u32,
        ttl: Ttl,
        #[debug("reply")]
        reply: oneshot::Sender<Option<()>>,
    },
    UnsetKey {
        area: AreaId,
        key: Key,
        #[debug("reply")]
        reply: oneshot::Sender<()>,
    },
    ClearKey {
        area: AreaId,
        key: Key,
        replacement: Bytes,
        ttl: Ttl,
        #[debug("reply")]
        reply: oneshot::Sender<()>,
    },
    GetKey {
        area: AreaId,
        key: Key,
        #[debug("reply")]
        reply: oneshot::Sender<Option<Value>>,
    },
    DumpPrefix {
        area: AreaId,
        prefix: String,
        #[debug("reply")]
        reply: oneshot::Sender<Option<BTreeMap<Key, Value>>>,
    },
    SubscribeKey {
        area: AreaId,
        key: Key,
        #[debug("callback")]
        callback: KeyCallback,
        fetch: bool,
        #[debug("reply")]
        reply: oneshot::Sender<Option<Value>>,
    },
    UnsubscribeKey {
        area: AreaId,
        key: Key,
        #[debug("reply")]
        reply: oneshot::Sender<()>,
    },
    SubscribeKeyFilter {
        filter: KeyFilter,
        #[debug("callback")]
        callback: KeyCallback,
        #[debug("reply")]
        reply: oneshot::Sender<()>,
    },
    UnsubscribeKeyFilter {
        #[debug("reply")]
        reply: oneshot::Sender<()>,
    },
    SetKvCallback {
        #[debug("callback")]
        callback: Option<KeyCallback>,
        #[debug("reply")]
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        #[debug("reply")]
        reply: oneshot::Sender<()>,
    },
}

/// The timers multiplexed onto the actor loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum TimerKind {
    /// Drain the pending-advertise sets, then clear elapsed backoffs.
    Advertise,
    /// Send due ttl refreshes.
    Ttl,
    /// Verify the store still holds every persisted key.
    SweepPersisted,
}

/// Actor that owns all client state and performs the store IO.
struct Actor<S> {
    state: ClientState,
    store: S,
    updates: PublicationStream,
    to_actor_rx: mpsc::Receiver<ToActor>,
    timers: Timers<TimerKind>,
    /// Per-(area, key) subscription callbacks.
    key_callbacks: HashMap<AreaId, HashMap<Key, KeyCallback>>,
    /// Catch-all callback, fired for every received update and expiry.
    kv_callback: Option<KeyCallback>,
    /// Prefix-filter callback, fired for matching non-persisted keys only.
    filter_callback: Option<(KeyFilter, KeyCallback)>,
}

impl<S: Store> Actor<S> {
    async fn run(mut self) {
        debug!("client actor started");
        if let Some(period) = self.state.config().check_persist_key_period {
            self.timers
                .reschedule(TimerKind::SweepPersisted, Instant::now() + period);
        }
        loop {
            tokio::select! {
                biased;
                msg = self.to_actor_rx.recv() => {
                    match msg {
                        Some(ToActor::Shutdown { reply }) => {
                            debug!("shutdown requested, stopping client actor");
                            reply.send(()).ok();
                            break;
                        }
                        Some(msg) => self.handle_msg(msg).await,
                        None => {
                            debug!("all client handles dropped, stopping client actor");
                            break;
                        }
                    }
                }
                publication = self.updates.next() => {
                    match publication {
                        Some(publication) => self.process_publication(publication).await,
                        None => {
                            debug!("publication stream closed, stopping client actor");
                            break;
                        }
                    }
                }
                kind = self.timers.wait_next() => {
                    trace!(?kind, "timer fired");
                    match kind {
                        TimerKind::Advertise => {
                            self.advertise_pending().await;
                            self.state.reset_elapsed_backoffs(Instant::now());
                        }
                        TimerKind::Ttl => self.advertise_ttl_updates().await,
                        TimerKind::SweepPersisted => self.check_persisted_keys().await,
                    }
                }
            }
        }
    }

    async fn handle_msg(&mut self, msg: ToActor) {
        trace!(?msg, "handle message");
        match msg {
            ToActor::PersistKey {
                area,
                key,
                payload,
                ttl,
                reply,
            } => {
                let changed = self.persist_key(area, key, payload, ttl).await;
                reply.send(changed).ok();
            }
            ToActor::SetKey {
                area,
                key,
                payload,
                version,
                ttl,
                reply,
            } => {
                let res = self.set_key(area, key, payload, version, ttl).await;
                reply.send(res).ok();
            }
            ToActor::UnsetKey { area, key, reply } => {
                self.state.unset(&area, &key);
                reply.send(()).ok();
            }
            ToActor::ClearKey {
                area,
                key,
                replacement,
                ttl,
                reply,
            } => {
                self.clear_key(area, key, replacement, ttl).await;
                reply.send(()).ok();
            }
            ToActor::GetKey { area, key, reply } => {
                let value = self.fetch_key(&area, &key).await;
                reply.send(value).ok();
            }
            ToActor::DumpPrefix {
                area,
                prefix,
                reply,
            } => {
                let dump = self.dump_all_with_prefix(&area, &prefix).await;
                reply.send(dump).ok();
            }
            ToActor::SubscribeKey {
                area,
                key,
                callback,
                fetch,
                reply,
            } => {
                self.key_callbacks
                    .entry(area.clone())
                    .or_default()
                    .insert(key.clone(), callback);
                let value = if fetch {
                    self.fetch_key(&area, &key).await
                } else {
                    None
                };
                reply.send(value).ok();
            }
            ToActor::UnsubscribeKey { area, key, reply } => {
                let removed = self
                    .key_callbacks
                    .get_mut(&area)
                    .and_then(|callbacks| callbacks.remove(&key));
                if removed.is_none() {
                    warn!(%area, %key, "unsubscribe for a key without callback");
                }
                reply.send(()).ok();
            }
            ToActor::SubscribeKeyFilter {
                filter,
                callback,
                reply,
            } => {
                self.filter_callback = Some((filter, callback));
                reply.send(()).ok();
            }
            ToActor::UnsubscribeKeyFilter { reply } => {
                self.filter_callback = None;
                reply.send(()).ok();
            }
            ToActor::SetKvCallback { callback, reply } => {
                self.kv_callback = callback;
                reply.send(()).ok();
            }
            ToActor::Shutdown { reply } => {
                // handled in the run loop; kept here for exhaustiveness
                reply.send(()).ok();
            }
        }
    }

    async fn persist_key(&mut self, area: AreaId, key: Key, payload: Bytes, ttl: Ttl) -> bool {
        // seed from the store only when the key is not persisted yet
        let stored = if self.state.persisted_value(&area, &key).is_none() {
            self.fetch_key(&area, &key).await
        } else {
            None
        };
        let Some(update) = self
            .state
            .persist(&area, &key, payload, ttl, stored, Instant::now())
        else {
            return false;
        };
        if update.value_change {
            if let Some(callback) = self
                .key_callbacks
                .get_mut(&area)
                .and_then(|callbacks| callbacks.get_mut(&key))
            {
                callback(&key, Some(&update.record));
            }
        }
        self.advertise_pending().await;
        self.advertise_ttl_updates().await;
        true
    }

    async fn set_key(
        &mut self,
        area: AreaId,
        key: Key,
        payload: Bytes,
        version: u32,
        ttl: Ttl,
    ) -> Option<()> {
        // one version above whatever the store currently holds
        let version = if version == 0 {
            self.fetch_key(&area, &key)
                .await
                .map(|stored| stored.version + 1)
                .unwrap_or(1)
        } else {
            version
        };
        let value = Value::new(version, self.state.node_id().clone(), payload, ttl);
        self.set_value(area, key, value).await
    }

    /// Push one fully-formed record and register its ttl refresh. Also the
    /// sweeper's re-injection path.
    async fn set_value(&mut self, area: AreaId, key: Key, value: Value) -> Option<()> {
        let mut key_vals = BTreeMap::new();
        key_vals.insert(key.clone(), value.clone());
        let res = self.push_key_vals(&area, key_vals).await;
        self.state.schedule_ttl(
            &area,
            &key,
            value.version,
            value.ttl_version,
            value.ttl,
            false,
            Instant::now(),
        );
        self.advertise_ttl_updates().await;
        res
    }

    async fn clear_key(&mut self, area: AreaId, key: Key, replacement: Bytes, ttl: Ttl) {
        self.state.unset(&area, &key);
        // if the store no longer holds the key there is nothing to overwrite
        let Some(stored) = self.fetch_key(&area, &key).await else {
            return;
        };
        let value = Value::new(
            stored.version + 1,
            self.state.node_id().clone(),
            replacement,
            ttl,
        );
        let mut key_vals = BTreeMap::new();
        key_vals.insert(key, value);
        self.push_key_vals(&area, key_vals).await;
    }

    async fn process_publication(&mut self, publication: Publication) {
        trace!(
            area = %publication.area,
            keys = publication.key_vals.len(),
            expired = publication.expired_keys.len(),
            "publication received"
        );
        inc!(Metrics, publications_processed);

        if let Some(callback) = self.kv_callback.as_mut() {
            for (key, value) in &publication.key_vals {
                if value.payload.is_ttl_only() {
                    continue;
                }
                callback(key, Some(value));
            }
        }

        for event in self.state.reconcile(&publication) {
            match event {
                ReconcileEvent::Foreign { key, value } => {
                    if let Some(callback) = self
                        .key_callbacks
                        .get_mut(&publication.area)
                        .and_then(|callbacks| callbacks.get_mut(&key))
                    {
                        callback(&key, Some(&value));
                    }
                    if let Some((filter, callback)) = self.filter_callback.as_mut() {
                        if filter.matches(&key, &value) {
                            callback(&key, Some(&value));
                        }
                    }
                }
                ReconcileEvent::Reasserted { key, value } => {
                    inc!(Metrics, reassertions);
                    if let Some(callback) = self
                        .key_callbacks
                        .get_mut(&publication.area)
                        .and_then(|callbacks| callbacks.get_mut(&key))
                    {
                        callback(&key, Some(&value));
                    }
                }
            }
        }

        self.advertise_pending().await;

        if !publication.expired_keys.is_empty() {
            self.process_expired_keys(&publication);
        }
    }

    fn process_expired_keys(&mut self, publication: &Publication) {
        for key in &publication.expired_keys {
            if let Some(callback) = self.kv_callback.as_mut() {
                callback(key, None);
            }
            if let Some(callback) = self
                .key_callbacks
                .get_mut(&publication.area)
                .and_then(|callbacks| callbacks.get_mut(key))
            {
                callback(key, None);
            }
        }
    }

    /// Push every due pending key and rearm the advertise timer.
    async fn advertise_pending(&mut self) {
        let now = Instant::now();
        let (batches, timeout) = self.state.advertise_batches(now);
        for batch in batches {
            let keys: Vec<Key> = batch.key_vals.keys().cloned().collect();
            if self.push_key_vals(&batch.area, batch.key_vals).await.is_some() {
                inc_by!(Metrics, keys_advertised, keys.len() as u64);
                self.state.advertise_done(&batch.area, keys.iter());
            }
            // on failure the keys stay pending and retry under backoff
        }
        trace!(?timeout, "rearming advertise timer");
        self.timers.reschedule(TimerKind::Advertise, now + timeout);
    }

    /// Send every due ttl refresh and rearm the ttl timer.
    async fn advertise_ttl_updates(&mut self) {
        let now = Instant::now();
        let (batches, timeout) = self.state.ttl_batches(now);
        for batch in batches {
            let len = batch.key_vals.len() as u64;
            if self.push_key_vals(&batch.area, batch.key_vals).await.is_some() {
                inc_by!(Metrics, ttl_refreshes_sent, len);
            }
        }
        trace!(?timeout, "rearming ttl timer");
        self.timers.reschedule(TimerKind::Ttl, now + timeout);
    }

    /// Verify the store still holds every persisted key, re-advertise lost
    /// ones and reconcile the fetched records.
    async fn check_persisted_keys(&mut self) {
        let Some(period) = self.state.config().check_persist_key_period else {
            return;
        };
        let mut timeout = period;
        for area in self.state.areas_with_persisted() {
            let keys = self.state.persisted_keys(&area);
            let publication = match self.store.get_key_vals(&area, keys).await {
                Ok(publication) => publication,
                Err(err) => {
                    warn!(%area, "failed to read persisted keys back: {err:#}");
                    timeout = SWEEP_RETRY;
                    continue;
                }
            };
            let missing = self.state.sweep_missing(&area, &publication);
            if !missing.is_empty() {
                warn!(%area, keys = missing.len(), "store lost persisted keys, re-advertising");
                inc_by!(Metrics, keys_restored, missing.len() as u64);
                self.push_key_vals(&area, missing).await;
            }
            // fetched records go through the normal conflict resolution
            self.process_publication(publication).await;
        }
        self.timers
            .reschedule(TimerKind::SweepPersisted, Instant::now() + timeout.min(period));
    }

    async fn fetch_key(&mut self, area: &AreaId, key: &Key) -> Option<Value> {
        let publication = match self.store.get_key_vals(area, vec![key.clone()]).await {
            Ok(publication) => publication,
            Err(err) => {
                warn!(%area, %key, "failed to get key from store: {err:#}");
                return None;
            }
        };
        let value = publication.key_vals.get(key).cloned();
        if value.is_none() {
            debug!(%area, %key, "key not found in store");
        }
        value
    }

    async fn dump_all_with_prefix(
        &mut self,
        area: &AreaId,
        prefix: &str,
    ) -> Option<BTreeMap<Key, Value>> {
        match self.store.dump_key_vals(vec![area.clone()], prefix).await {
            Ok(publications) => publications
                .into_iter()
                .next()
                .map(|publication| publication.key_vals),
            Err(err) => {
                warn!(%area, "failed to dump keys from store: {err:#}");
                None
            }
        }
    }

    async fn push_key_vals(
        &mut self,
        area: &AreaId,
        key_vals: BTreeMap<Key, Value>,
    ) -> Option<()> {
        if key_vals.is_empty() {
            return Some(());
        }
        match self.store.set_key_vals(area, key_vals).await {
            Ok(()) => Some(()),
            Err(err) => {
                inc!(Metrics, store_write_errors);
                warn!(%area, "failed to push key-vals to store: {err:#}");
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use tokio::time::{sleep, timeout};
    use tracing_subscriber::{prelude::*, EnvFilter};

    use super::*;
    use crate::store::MemStore;

    fn setup_logging() {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(EnvFilter::from_default_env())
            .try_init()
            .ok();
    }

    fn config() -> Config {
        Config {
            initial_backoff: Duration::from_millis(4),
            max_backoff: Duration::from_millis(100),
            max_ttl_update_interval: Duration::from_secs(60),
            check_persist_key_period: None,
        }
    }

    fn area() -> AreaId {
        "default".into()
    }

    fn payload(data: &'static [u8]) -> Bytes {
        Bytes::from_static(data)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// A callback that records every invocation.
    fn recording_callback() -> (KeyCallback, Arc<Mutex<Vec<(Key, Option<Value>)>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let cb_log = log.clone();
        let callback: KeyCallback = Box::new(move |key, value| {
            cb_log.lock().unwrap().push((key.clone(), value.cloned()));
        });
        (callback, log)
    }

    #[tokio::test]
    async fn fresh_persist_reaches_store_and_refreshes() {
        setup_logging();
        let store = MemStore::new();
        let client = Client::spawn(store.clone(), "A".into(), config());

        let changed = client
            .persist_key(area(), "k".into(), payload(b"v1"), Ttl::from_millis(400))
            .await
            .unwrap();
        assert!(changed);

        wait_for(|| store.get(&area(), &"k".into()).is_some()).await;
        let stored = store.get(&area(), &"k".into()).unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.originator, "A".into());
        assert_eq!(stored.ttl_version, 0);
        assert_eq!(stored.payload.data(), Some(&payload(b"v1")));

        // a value-less refresh bumps the ttl version without touching the rest
        wait_for(|| store.get(&area(), &"k".into()).unwrap().ttl_version >= 1).await;
        let stored = store.get(&area(), &"k".into()).unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.payload.data(), Some(&payload(b"v1")));

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn foreign_overwrite_is_reasserted() {
        setup_logging();
        let store = MemStore::new();
        let client = Client::spawn(store.clone(), "A".into(), config());

        client
            .persist_key(area(), "k".into(), payload(b"v1"), Ttl::INFINITE)
            .await
            .unwrap();
        wait_for(|| store.get(&area(), &"k".into()).is_some()).await;

        // a peer overwrites our key with the same version
        store.inject(
            &area(),
            "k".into(),
            Value::new(1, "B".into(), payload(b"vB"), Ttl::INFINITE),
        );

        wait_for(|| {
            let stored = store.get(&area(), &"k".into()).unwrap();
            stored.version == 2 && stored.originator == "A".into()
        })
        .await;
        let stored = store.get(&area(), &"k".into()).unwrap();
        assert_eq!(stored.payload.data(), Some(&payload(b"v1")));
        assert_eq!(stored.ttl_version, 0);

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn repeated_persist_is_a_no_op() {
        setup_logging();
        let store = MemStore::new();
        let client = Client::spawn(store.clone(), "A".into(), config());

        let changed = client
            .persist_key(area(), "k".into(), payload(b"v1"), Ttl::INFINITE)
            .await
            .unwrap();
        assert!(changed);
        wait_for(|| store.get(&area(), &"k".into()).is_some()).await;
        let attempts = store.set_attempts();

        let changed = client
            .persist_key(area(), "k".into(), payload(b"v1"), Ttl::INFINITE)
            .await
            .unwrap();
        assert!(!changed);
        sleep(Duration::from_millis(30)).await;
        assert_eq!(store.set_attempts(), attempts);

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn clear_key_withdraws_and_stops_defending() {
        setup_logging();
        let store = MemStore::new();
        let client = Client::spawn(store.clone(), "A".into(), config());

        client
            .persist_key(area(), "k".into(), payload(b"v1"), Ttl::INFINITE)
            .await
            .unwrap();
        wait_for(|| store.get(&area(), &"k".into()).is_some()).await;

        client
            .clear_key(area(), "k".into(), payload(b""), Ttl::from_millis(400))
            .await
            .unwrap();
        let stored = store.get(&area(), &"k".into()).unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.originator, "A".into());
        assert_eq!(stored.payload.data(), Some(&payload(b"")));

        // the key is no longer defended: a foreign record stays
        store.inject(
            &area(),
            "k".into(),
            Value::new(3, "B".into(), payload(b"vB"), Ttl::INFINITE),
        );
        sleep(Duration::from_millis(50)).await;
        let stored = store.get(&area(), &"k".into()).unwrap();
        assert_eq!(stored.originator, "B".into());
        assert_eq!(stored.version, 3);

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn sweeper_restores_lost_keys() {
        setup_logging();
        let store = MemStore::new();
        let mut config = config();
        config.check_persist_key_period = Some(Duration::from_millis(50));
        let client = Client::spawn(store.clone(), "A".into(), config);

        client
            .persist_key(area(), "k".into(), payload(b"v1"), Ttl::INFINITE)
            .await
            .unwrap();
        wait_for(|| store.get(&area(), &"k".into()).is_some()).await;

        store.drop_key(&area(), &"k".into());
        assert!(store.get(&area(), &"k".into()).is_none());

        wait_for(|| store.get(&area(), &"k".into()).is_some()).await;
        let stored = store.get(&area(), &"k".into()).unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.originator, "A".into());

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn failed_pushes_retry_under_backoff() {
        setup_logging();
        let store = MemStore::new();
        let client = Client::spawn(store.clone(), "A".into(), config());

        store.fail_next_sets(2);
        client
            .persist_key(area(), "k".into(), payload(b"v1"), Ttl::INFINITE)
            .await
            .unwrap();

        wait_for(|| store.get(&area(), &"k".into()).is_some()).await;
        assert!(store.set_attempts() >= 3);

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn one_shot_set_is_not_defended_but_keeps_refreshing() {
        setup_logging();
        let store = MemStore::new();
        let client = Client::spawn(store.clone(), "A".into(), config());

        client
            .set_key(area(), "k".into(), payload(b"v1"), 0, Ttl::from_millis(400))
            .await
            .unwrap()
            .expect("store accepted the set");
        let stored = store.get(&area(), &"k".into()).unwrap();
        assert_eq!(stored.version, 1);

        // the ttl keeps being refreshed
        wait_for(|| store.get(&area(), &"k".into()).unwrap().ttl_version >= 1).await;

        // but a dominating record is not fought
        store.inject(
            &area(),
            "k".into(),
            Value::new(2, "B".into(), payload(b"vB"), Ttl::INFINITE),
        );
        sleep(Duration::from_millis(50)).await;
        let stored = store.get(&area(), &"k".into()).unwrap();
        assert_eq!(stored.originator, "B".into());
        assert_eq!(stored.version, 2);

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn set_key_uses_version_above_stored() {
        setup_logging();
        let store = MemStore::new();
        let client = Client::spawn(store.clone(), "A".into(), config());

        store.inject(
            &area(),
            "k".into(),
            Value::new(6, "B".into(), payload(b"vB"), Ttl::INFINITE),
        );
        client
            .set_key(area(), "k".into(), payload(b"v1"), 0, Ttl::INFINITE)
            .await
            .unwrap()
            .expect("store accepted the set");
        let stored = store.get(&area(), &"k".into()).unwrap();
        assert_eq!(stored.version, 7);
        assert_eq!(stored.originator, "A".into());

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn subscriptions_observe_updates_and_expiry() {
        setup_logging();
        let store = MemStore::new();
        let client = Client::spawn(store.clone(), "A".into(), config());

        let (callback, log) = recording_callback();
        let fetched = client
            .subscribe_key(area(), "w".into(), callback, true)
            .await
            .unwrap();
        assert!(fetched.is_none());

        store.inject(
            &area(),
            "w".into(),
            Value::new(1, "B".into(), payload(b"vB"), Ttl::from_millis(400)),
        );
        wait_for(|| !log.lock().unwrap().is_empty()).await;
        {
            let log = log.lock().unwrap();
            let (key, value) = &log[0];
            assert_eq!(key, &Key::from("w"));
            assert_eq!(value.as_ref().unwrap().originator, "B".into());
        }

        store.expire(&area(), vec!["w".into()]);
        wait_for(|| log.lock().unwrap().len() >= 2).await;
        {
            let log = log.lock().unwrap();
            let (key, value) = &log[1];
            assert_eq!(key, &Key::from("w"));
            assert!(value.is_none());
        }

        client.unsubscribe_key(area(), "w".into()).await.unwrap();
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn filter_skips_own_persisted_keys() {
        setup_logging();
        let store = MemStore::new();
        let client = Client::spawn(store.clone(), "A".into(), config());

        let (callback, log) = recording_callback();
        client
            .subscribe_key_filter(
                KeyFilter::new(["prefix:".to_string()], []),
                callback,
            )
            .await
            .unwrap();

        // our own persisted key matches the filter but must not loop back
        client
            .persist_key(area(), "prefix:mine".into(), payload(b"v1"), Ttl::INFINITE)
            .await
            .unwrap();
        wait_for(|| store.get(&area(), &"prefix:mine".into()).is_some()).await;

        store.inject(
            &area(),
            "prefix:theirs".into(),
            Value::new(1, "B".into(), payload(b"vB"), Ttl::INFINITE),
        );
        wait_for(|| !log.lock().unwrap().is_empty()).await;
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, Key::from("prefix:theirs"));

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn catch_all_callback_sees_every_update() {
        setup_logging();
        let store = MemStore::new();
        let client = Client::spawn(store.clone(), "A".into(), config());

        let (callback, log) = recording_callback();
        client.set_kv_callback(Some(callback)).await.unwrap();

        store.inject(
            &area(),
            "x".into(),
            Value::new(1, "B".into(), payload(b"vB"), Ttl::INFINITE),
        );
        wait_for(|| !log.lock().unwrap().is_empty()).await;

        client.set_kv_callback(None).await.unwrap();
        store.inject(
            &area(),
            "y".into(),
            Value::new(1, "B".into(), payload(b"vB"), Ttl::INFINITE),
        );
        sleep(Duration::from_millis(30)).await;
        assert_eq!(log.lock().unwrap().len(), 1);

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn dump_returns_matching_keys() {
        setup_logging();
        let store = MemStore::new();
        let client = Client::spawn(store.clone(), "A".into(), config());

        client
            .persist_key(area(), "adj:x".into(), payload(b"1"), Ttl::INFINITE)
            .await
            .unwrap();
        client
            .persist_key(area(), "prefix:y".into(), payload(b"2"), Ttl::INFINITE)
            .await
            .unwrap();
        wait_for(|| store.get(&area(), &"prefix:y".into()).is_some()).await;

        let dump = client
            .dump_all_with_prefix(area(), "prefix:".to_string())
            .await
            .unwrap()
            .expect("dump succeeded");
        assert_eq!(dump.len(), 1);
        assert!(dump.contains_key(&Key::from("prefix:y")));

        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_the_actor() {
        setup_logging();
        let store = MemStore::new();
        let client = Client::spawn(store.clone(), "A".into(), config());
        client.shutdown().await.unwrap();
        let res = client
            .persist_key(area(), "k".into(), payload(b"v"), Ttl::INFINITE)
            .await;
        assert!(res.is_err());
    }
}
