//! The client's per-area state machine, without IO.
//!
//! [`ClientState`] owns every table the client keeps: the persisted keys
//! this node defends, their advertise backoffs, the pending-advertise set
//! and the ttl refresh skeletons. All methods are synchronous and take an
//! explicit `now` where timing matters; the actor in [`crate::client`] is
//! responsible for store IO, callbacks and timers.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use bytes::Bytes;
use indexmap::IndexSet;
use tracing::{debug, trace, warn};

use super::{
    backoff::ExpBackoff,
    types::{AreaId, Key, NodeId, Payload, Publication, Ttl, Value},
};

/// Tunables for the advertise and ttl schedulers.
#[derive(Clone, Debug)]
pub struct Config {
    /// First retry window armed when a key is advertised.
    pub initial_backoff: Duration,
    /// Upper bound for the advertise backoff and for the advertise timer.
    pub max_backoff: Duration,
    /// Upper bound on the ttl scheduler tick, so a single long ttl cannot
    /// park the timer for hours.
    pub max_ttl_update_interval: Duration,
    /// Period of the persistence sweeper. `None` disables the sweeper.
    pub check_persist_key_period: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(4),
            max_backoff: Duration::from_millis(8192),
            max_ttl_update_interval: Duration::from_secs(300),
            check_persist_key_period: None,
        }
    }
}

/// Lifetime refresh state for one finite-ttl key: the value-less record to
/// send and the (effectively periodic) backoff pacing it.
#[derive(Debug)]
struct TtlRefresh {
    skeleton: Value,
    backoff: ExpBackoff,
}

/// Per-area tables. Created empty on first touch of an area.
#[derive(Debug, Default)]
struct AreaState {
    /// Keys this node declares it owns, with the currently declared record.
    persisted: HashMap<Key, Value>,
    /// One advertise backoff per persisted key.
    backoffs: HashMap<Key, ExpBackoff>,
    /// Refresh skeletons for finite-ttl keys (persisted or one-shot set).
    ttl_refresh: HashMap<Key, TtlRefresh>,
    /// Keys whose declared value changed and has not been pushed yet.
    /// Insertion order, so batches are deterministic.
    pending: IndexSet<Key>,
}

/// Effect of a successful [`ClientState::persist`].
#[derive(Debug)]
pub struct PersistUpdate {
    /// The newly declared record.
    pub record: Value,
    /// Whether the declared payload or version changed. When true the
    /// per-key callback fires and the key was added to the pending set.
    pub value_change: bool,
}

/// Outcome of reconciling one received entry, for callback dispatch.
#[derive(Debug)]
pub enum ReconcileEvent {
    /// An update for a key this node does not own.
    Foreign {
        /// The received key.
        key: Key,
        /// The received record.
        value: Value,
    },
    /// Ownership of a persisted key was reasserted with a dominating record.
    Reasserted {
        /// The defended key.
        key: Key,
        /// The new declared record.
        value: Value,
    },
}

/// A batch of records to push to the store for one area.
#[derive(Debug)]
pub struct AdvertiseBatch {
    /// Target area.
    pub area: AreaId,
    /// Records keyed by their key.
    pub key_vals: BTreeMap<Key, Value>,
}

/// All per-area client state, owned by the actor task.
#[derive(Debug)]
pub struct ClientState {
    node_id: NodeId,
    config: Config,
    areas: HashMap<AreaId, AreaState>,
}

impl ClientState {
    /// Create empty state for a node.
    pub fn new(node_id: NodeId, config: Config) -> Self {
        Self {
            node_id,
            config,
            areas: HashMap::new(),
        }
    }

    /// This node's originator identity.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The scheduler tunables.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn area(&mut self, area: &AreaId) -> &mut AreaState {
        self.areas.entry(area.clone()).or_default()
    }

    /// The record currently declared for a persisted key, if any.
    pub fn persisted_value(&self, area: &AreaId, key: &Key) -> Option<&Value> {
        self.areas.get(area)?.persisted.get(key)
    }

    /// All persisted keys of an area.
    pub fn persisted_keys(&self, area: &AreaId) -> Vec<Key> {
        self.areas
            .get(area)
            .map(|st| st.persisted.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Areas that currently have at least one persisted key.
    pub fn areas_with_persisted(&self) -> Vec<AreaId> {
        self.areas
            .iter()
            .filter(|(_, st)| !st.persisted.is_empty())
            .map(|(area, _)| area.clone())
            .collect()
    }

    /// Declare ongoing ownership of `(area, key)`.
    ///
    /// `stored` is the store's current record for the key, fetched by the
    /// caller only when the key was not persisted before; it seeds the
    /// version counter so a re-declared key resumes above whatever the
    /// network last saw. Returns `None` when the declaration is a no-op
    /// (same payload, same ttl).
    pub fn persist(
        &mut self,
        area: &AreaId,
        key: &Key,
        payload: Bytes,
        ttl: Ttl,
        stored: Option<Value>,
        now: Instant,
    ) -> Option<PersistUpdate> {
        let node_id = self.node_id.clone();
        let (initial_backoff, max_backoff) =
            (self.config.initial_backoff, self.config.max_backoff);
        let st = self.area(area);

        let mut value = match st.persisted.get(key) {
            Some(current) => {
                if current.payload.data() == Some(&payload) && current.ttl == ttl {
                    return None;
                }
                let mut value = current.clone();
                // resume the refresh counter so the next ttl update still
                // dominates the store's copy
                if let Some(refresh) = st.ttl_refresh.get(key) {
                    value.ttl_version = refresh.skeleton.ttl_version;
                }
                value
            }
            None => match stored {
                Some(stored) => stored,
                None => Value::new(0, node_id.clone(), payload.clone(), ttl),
            },
        };

        let mut value_change = false;
        if value.version == 0 {
            value.version = 1;
            value_change = true;
        } else if value.originator != node_id || value.payload.data() != Some(&payload) {
            value.version += 1;
            value.ttl_version = 0;
            value.originator = node_id;
            value.payload = Payload::Data(payload);
            value_change = true;
        }

        let has_ttl_changed = value.ttl != ttl;
        value.ttl = ttl;
        value.rehash();

        trace!(%area, %key, ?value, value_change, "persist");
        st.persisted.insert(key.clone(), value.clone());
        // a fresh backoff, so the change can be pushed immediately
        st.backoffs
            .insert(key.clone(), ExpBackoff::new(initial_backoff, max_backoff));
        if value_change {
            st.pending.insert(key.clone());
        }

        self.schedule_ttl(
            area,
            key,
            value.version,
            value.ttl_version,
            ttl,
            has_ttl_changed,
            now,
        );

        Some(PersistUpdate {
            record: value,
            value_change,
        })
    }

    /// Remove a key from all four per-area tables.
    ///
    /// No record is injected into the store; the store drops the key when
    /// its ttl lapses.
    pub fn unset(&mut self, area: &AreaId, key: &Key) {
        if let Some(st) = self.areas.get_mut(area) {
            st.persisted.remove(key);
            st.backoffs.remove(key);
            st.ttl_refresh.remove(key);
            st.pending.shift_remove(key);
        }
    }

    /// Install, replace or drop the ttl refresh entry for a key.
    ///
    /// Infinite ttls drop the entry. A finite ttl installs a value-less
    /// skeleton paced at roughly a quarter of the ttl; unless
    /// `advertise_immediately` is set, the first refresh is delayed by one
    /// full interval since the key itself was just advertised.
    #[allow(clippy::too_many_arguments)]
    pub fn schedule_ttl(
        &mut self,
        area: &AreaId,
        key: &Key,
        version: u32,
        ttl_version: u32,
        ttl: Ttl,
        advertise_immediately: bool,
        now: Instant,
    ) {
        let node_id = self.node_id.clone();
        let st = self.area(area);
        if !ttl.is_finite() {
            st.ttl_refresh.remove(key);
            return;
        }
        if ttl.as_millis() <= 0 {
            warn!(%area, %key, ?ttl, "refusing ttl refresh for non-positive ttl");
            st.ttl_refresh.remove(key);
            return;
        }

        let skeleton = Value::ttl_only(version, node_id, ttl, ttl_version);
        let interval = ttl.refresh_interval();
        let mut backoff = ExpBackoff::new(interval, interval + Duration::from_millis(1));
        if !advertise_immediately {
            backoff.report_error(now);
        }
        st.ttl_refresh
            .insert(key.clone(), TtlRefresh { skeleton, backoff });
    }

    /// Apply the conflict-resolution rules to a received publication.
    ///
    /// Mutates the tables, queues reassertions on the pending set and
    /// returns the events the caller must dispatch to callbacks. Lifetime
    /// refresh entries (value-less) are ignored.
    pub fn reconcile(&mut self, publication: &Publication) -> Vec<ReconcileEvent> {
        let node_id = self.node_id.clone();
        let mut events = Vec::new();
        let AreaState {
            persisted,
            ttl_refresh,
            pending,
            ..
        } = self.area(&publication.area);

        for (key, rcvd) in &publication.key_vals {
            let Payload::Data(rcvd_payload) = &rcvd.payload else {
                continue;
            };
            trace!(area = %publication.area, %key, value = ?rcvd, "reconcile");

            let Some(current) = persisted.get_mut(key) else {
                // a key we set once but do not defend: a dominating record
                // ends the refreshing, a reflected refresh lifts our counter
                let mut taken_over = false;
                if let Some(refresh) = ttl_refresh.get_mut(key) {
                    let set = &mut refresh.skeleton;
                    match (rcvd.version, &rcvd.originator).cmp(&(set.version, &set.originator)) {
                        Ordering::Greater => taken_over = true,
                        Ordering::Equal if rcvd.ttl_version > set.ttl_version => {
                            set.ttl_version = rcvd.ttl_version + 1;
                        }
                        _ => {}
                    }
                }
                if taken_over {
                    debug!(%key, "one-shot key taken over, stopping ttl refresh");
                    ttl_refresh.remove(key);
                }
                events.push(ReconcileEvent::Foreign {
                    key: key.clone(),
                    value: rcvd.clone(),
                });
                continue;
            };

            if current.version > rcvd.version {
                continue;
            }

            let mut value_change = false;
            if current.version < rcvd.version {
                current.version = rcvd.version + 1;
                current.originator = node_id.clone();
                current.ttl_version = 0;
                value_change = true;
            } else if rcvd.originator != node_id {
                // same version from a different originator: reclaim
                current.version += 1;
                current.originator = node_id.clone();
                current.ttl_version = 0;
                value_change = true;
            } else if current.payload.data() != Some(rcvd_payload) {
                // our own record came back with a diverging payload
                current.version += 1;
                current.originator = node_id.clone();
                current.ttl_version = 0;
                value_change = true;
            }

            if let Some(refresh) = ttl_refresh.get(key) {
                current.ttl_version = refresh.skeleton.ttl_version;
            }
            // the ttl scheduler bumps before sending, so adopting the
            // received counter is enough to stay ahead
            if current.ttl_version < rcvd.ttl_version {
                current.ttl_version = rcvd.ttl_version;
                if let Some(refresh) = ttl_refresh.get_mut(key) {
                    refresh.skeleton.ttl_version = rcvd.ttl_version;
                }
            }

            if value_change {
                current.rehash();
                debug!(area = %publication.area, %key, value = ?current, "reasserting ownership");
                pending.insert(key.clone());
                events.push(ReconcileEvent::Reasserted {
                    key: key.clone(),
                    value: current.clone(),
                });
            }
        }
        events
    }

    /// Build the advertise batches that are due at `now`.
    ///
    /// Every included key's backoff is advanced before the attempt, so a
    /// failed push is retried under backoff without further bookkeeping.
    /// Also returns the delay until the advertise timer should fire again.
    pub fn advertise_batches(&mut self, now: Instant) -> (Vec<AdvertiseBatch>, Duration) {
        let mut timeout = self.config.max_backoff;
        let (initial_backoff, max_backoff) =
            (self.config.initial_backoff, self.config.max_backoff);
        let mut batches = Vec::new();

        for (area, st) in self.areas.iter_mut() {
            if st.pending.is_empty() {
                continue;
            }
            let mut key_vals = BTreeMap::new();
            for key in st.pending.iter() {
                let value = st
                    .persisted
                    .get(key)
                    .expect("pending key missing from persisted table");
                let backoff = st
                    .backoffs
                    .entry(key.clone())
                    .or_insert_with(|| ExpBackoff::new(initial_backoff, max_backoff));
                if !backoff.can_try_now(now) {
                    trace!(%area, %key, "skipping advertisement, backing off");
                    timeout = timeout.min(backoff.time_until_retry(now));
                    continue;
                }
                backoff.report_error(now);
                timeout = timeout.min(backoff.time_until_retry(now));
                debug!(%area, %key, value = ?value, "advertising");
                key_vals.insert(key.clone(), value.clone());
            }
            if !key_vals.is_empty() {
                batches.push(AdvertiseBatch {
                    area: area.clone(),
                    key_vals,
                });
            }
        }
        (batches, timeout)
    }

    /// Drop successfully pushed keys from the pending set.
    pub fn advertise_done<'a>(&mut self, area: &AreaId, keys: impl Iterator<Item = &'a Key>) {
        if let Some(st) = self.areas.get_mut(area) {
            for key in keys {
                st.pending.shift_remove(key);
            }
        }
    }

    /// Reset every advertise backoff whose retry window has elapsed, so a
    /// quiet steady state returns to the initial backoff.
    pub fn reset_elapsed_backoffs(&mut self, now: Instant) {
        for st in self.areas.values_mut() {
            for backoff in st.backoffs.values_mut() {
                if backoff.can_try_now(now) {
                    backoff.report_success();
                }
            }
        }
    }

    /// Build the ttl refresh batches that are due at `now` and bump each
    /// sent skeleton's ttl version.
    ///
    /// Skeletons of persisted keys first catch up with the persisted
    /// record's version. Also returns the delay until the ttl timer should
    /// fire again, capped by `max_ttl_update_interval`.
    pub fn ttl_batches(&mut self, now: Instant) -> (Vec<AdvertiseBatch>, Duration) {
        let mut timeout = self.config.max_ttl_update_interval;
        let mut batches = Vec::new();

        for (area, st) in self.areas.iter_mut() {
            let AreaState {
                persisted,
                ttl_refresh,
                ..
            } = st;
            let mut key_vals = BTreeMap::new();
            for (key, refresh) in ttl_refresh.iter_mut() {
                if !refresh.backoff.can_try_now(now) {
                    timeout = timeout.min(refresh.backoff.time_until_retry(now));
                    continue;
                }
                refresh.backoff.report_error(now);
                timeout = timeout.min(refresh.backoff.time_until_retry(now));

                if let Some(current) = persisted.get(key) {
                    if refresh.skeleton.version < current.version {
                        refresh.skeleton.version = current.version;
                        refresh.skeleton.ttl_version = current.ttl_version;
                    }
                }
                refresh.skeleton.ttl_version += 1;
                trace!(%area, %key, value = ?refresh.skeleton, "refreshing ttl");
                key_vals.insert(key.clone(), refresh.skeleton.clone());
            }
            if !key_vals.is_empty() {
                batches.push(AdvertiseBatch {
                    area: area.clone(),
                    key_vals,
                });
            }
        }
        (batches, timeout)
    }

    /// Persisted keys of an area that are absent from a sweep response.
    pub fn sweep_missing(&self, area: &AreaId, response: &Publication) -> BTreeMap<Key, Value> {
        let Some(st) = self.areas.get(area) else {
            return BTreeMap::new();
        };
        st.persisted
            .iter()
            .filter(|(key, _)| !response.key_vals.contains_key(*key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    #[cfg(test)]
    fn ttl_skeleton(&self, area: &AreaId, key: &Key) -> Option<&Value> {
        Some(&self.areas.get(area)?.ttl_refresh.get(key)?.skeleton)
    }

    #[cfg(test)]
    fn is_pending(&self, area: &AreaId, key: &Key) -> bool {
        self.areas
            .get(area)
            .map(|st| st.pending.contains(key))
            .unwrap_or(false)
    }
}
