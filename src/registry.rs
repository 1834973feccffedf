//! Subscriber registry: one record per live subscriber, keyed by name,
//! partitioned by [`Mode`] but unique across both partitions.
//!
//! Grounded on `mem_etcd::store::Store`, which guards its maps with a
//! `DashMap`/`RwLock` mix; here the whole state lives behind a single
//! `parking_lot::RwLock` (spec's concurrency discipline (a)) because the
//! stream workers need one consistent snapshot per block boundary rather
//! than per-key atomicity.

use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::RwLock;

use crate::types::{Mode, SubscriberName};

/// One subscriber's live state.
#[derive(Debug, Clone)]
pub struct SubscriberRecord {
    pub endpoint: SocketAddr,
    pub mode: Mode,
    pub filter: Vec<String>,
    pub lease: i64,
}

impl SubscriberRecord {
    fn matches(&self, op_type: Option<&str>) -> bool {
        if self.filter.is_empty() {
            return false;
        }
        match op_type {
            Some(t) => self.filter.iter().any(|f| f == t),
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    head: HashMap<SubscriberName, SubscriberRecord>,
    irreversible: HashMap<SubscriberName, SubscriberRecord>,
    modes: HashMap<SubscriberName, Mode>,
}

impl RegistryState {
    fn table(&self, mode: Mode) -> &HashMap<SubscriberName, SubscriberRecord> {
        match mode {
            Mode::Head => &self.head,
            Mode::Irreversible => &self.irreversible,
        }
    }

    fn table_mut(&mut self, mode: Mode) -> &mut HashMap<SubscriberName, SubscriberRecord> {
        match mode {
            Mode::Head => &mut self.head,
            Mode::Irreversible => &mut self.irreversible,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("subscriber name {0:?} is already in use")]
    NameInUse(SubscriberName),
    #[error("subscriber {0:?} is not registered")]
    NotRegistered(SubscriberName),
}

/// Outcome of one lease-decrement sweep, performed at every upstream block
/// boundary for a given mode.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LeaseSweep {
    /// Subscribers whose lease fell to zero or below, but not yet past
    /// `-ttl_tolerance`: emit `refresh_req` to nudge them.
    pub refresh: Vec<SubscriberName>,
    /// Subscribers whose lease fell to or below `-ttl_tolerance`: evict and
    /// notify `client_delete`.
    pub evict: Vec<SubscriberName>,
    /// `(name, endpoint)` for each evicted subscriber, captured before
    /// removal so the caller can still send a `client_delete` notice.
    pub evicted_endpoints: Vec<(SubscriberName, SocketAddr)>,
}

/// Registry of live subscribers across both stream modes, guarded by a
/// single reader-writer lock (spec concurrency discipline (a)).
#[derive(Debug, Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub fn register(
        &self,
        name: SubscriberName,
        mode: Mode,
        endpoint: SocketAddr,
        ttl: i64,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.write();
        if state.modes.contains_key(&name) {
            return Err(RegistryError::NameInUse(name));
        }
        state.modes.insert(name.clone(), mode);
        state.table_mut(mode).insert(
            name,
            SubscriberRecord {
                endpoint,
                mode,
                filter: Vec::new(),
                lease: ttl,
            },
        );
        Ok(())
    }

    /// Remove `name` and hand back its record, so the caller can still
    /// notify its stored endpoint after it's gone from the registry.
    pub fn unregister(&self, name: &SubscriberName) -> Result<SubscriberRecord, RegistryError> {
        let mut state = self.state.write();
        let mode = state
            .modes
            .remove(name)
            .ok_or_else(|| RegistryError::NotRegistered(name.clone()))?;
        state
            .table_mut(mode)
            .remove(name)
            .ok_or_else(|| RegistryError::NotRegistered(name.clone()))
    }

    pub fn refresh(&self, name: &SubscriberName, ttl: i64) -> Result<(), RegistryError> {
        let mut state = self.state.write();
        let mode = *state
            .modes
            .get(name)
            .ok_or_else(|| RegistryError::NotRegistered(name.clone()))?;
        let record = state
            .table_mut(mode)
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotRegistered(name.clone()))?;
        record.lease = ttl;
        Ok(())
    }

    pub fn is_registered(&self, name: &SubscriberName) -> bool {
        self.state.read().modes.contains_key(name)
    }

    pub fn info(&self, name: &SubscriberName) -> Option<SubscriberRecord> {
        let state = self.state.read();
        let mode = *state.modes.get(name)?;
        state.table(mode).get(name).cloned()
    }

    pub fn set_subs(&self, name: &SubscriberName, subs: Vec<String>) -> Result<(), RegistryError> {
        self.with_record_mut(name, |record| record.filter = subs)
    }

    pub fn add_subs(&self, name: &SubscriberName, subs: Vec<String>) -> Result<(), RegistryError> {
        self.with_record_mut(name, |record| {
            for s in subs {
                if !record.filter.contains(&s) {
                    record.filter.push(s);
                }
            }
        })
    }

    pub fn rem_subs(&self, name: &SubscriberName, subs: Vec<String>) -> Result<(), RegistryError> {
        self.with_record_mut(name, |record| {
            record.filter.retain(|f| !subs.contains(f));
        })
    }

    fn with_record_mut(
        &self,
        name: &SubscriberName,
        f: impl FnOnce(&mut SubscriberRecord),
    ) -> Result<(), RegistryError> {
        let mut state = self.state.write();
        let mode = *state
            .modes
            .get(name)
            .ok_or_else(|| RegistryError::NotRegistered(name.clone()))?;
        let record = state
            .table_mut(mode)
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotRegistered(name.clone()))?;
        f(record);
        Ok(())
    }

    /// Point-in-time snapshot of every subscriber in `mode`, for the stream
    /// worker's per-block fan-out pass. Taken under a single read lock so
    /// the worker never observes a registration that's half-applied.
    pub fn snapshot(&self, mode: Mode) -> Vec<(SubscriberName, SubscriberRecord)> {
        self.state
            .read()
            .table(mode)
            .iter()
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect()
    }

    /// Decrement every subscriber's lease in `mode` by one block, producing
    /// a disjoint refresh/evict split from one consistent write-locked pass,
    /// and applying the evictions before releasing the lock. A lease that
    /// reaches zero is past due for a refresh; one that falls to or below
    /// `-ttl_tolerance` is evicted outright.
    pub fn decrement_leases(&self, mode: Mode, ttl_tolerance: i64) -> LeaseSweep {
        let mut state = self.state.write();
        let mut sweep = LeaseSweep::default();
        let mut evicted = Vec::new();

        for (name, record) in state.table_mut(mode).iter_mut() {
            record.lease -= 1;
            if record.lease <= -ttl_tolerance {
                evicted.push((name.clone(), record.endpoint));
            } else if record.lease <= 0 {
                sweep.refresh.push(name.clone());
            }
        }

        for (name, _) in &evicted {
            state.table_mut(mode).remove(name);
            state.modes.remove(name);
        }
        sweep.evict = evicted.iter().map(|(name, _)| name.clone()).collect();
        sweep.evicted_endpoints = evicted;
        sweep
    }

    /// Subscribers in `mode` whose filter matches `op_type` (empty filter
    /// matches nothing: a subscriber must opt in via set_subs/add_subs
    /// before anything is fanned out to it), for a single transaction's
    /// fan-out.
    pub fn matching(&self, mode: Mode, op_type: Option<&str>) -> Vec<(SubscriberName, SocketAddr)> {
        self.state
            .read()
            .table(mode)
            .iter()
            .filter(|(_, record)| record.matches(op_type))
            .map(|(name, record)| (name.clone(), record.endpoint))
            .collect()
    }

    pub fn count(&self, mode: Mode) -> usize {
        self.state.read().table(mode).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn name(s: &str) -> SubscriberName {
        SubscriberName::new(s).unwrap()
    }

    #[test]
    fn register_rejects_duplicate_name_across_modes() {
        let reg = Registry::new();
        reg.register(name("a"), Mode::Head, addr(1), 10).unwrap();
        let err = reg
            .register(name("a"), Mode::Irreversible, addr(2), 10)
            .unwrap_err();
        assert!(matches!(err, RegistryError::NameInUse(_)));
    }

    #[test]
    fn unregister_removes_from_name_and_mode_tables() {
        let reg = Registry::new();
        reg.register(name("a"), Mode::Head, addr(1), 10).unwrap();
        reg.unregister(&name("a")).unwrap();
        assert!(!reg.is_registered(&name("a")));
        assert_eq!(reg.count(Mode::Head), 0);
        // name is free again
        reg.register(name("a"), Mode::Irreversible, addr(3), 10)
            .unwrap();
    }

    #[test]
    fn refresh_resets_lease_to_full_ttl() {
        let reg = Registry::new();
        reg.register(name("a"), Mode::Head, addr(1), 10).unwrap();
        reg.decrement_leases(Mode::Head, 2);
        reg.refresh(&name("a"), 10).unwrap();
        assert_eq!(reg.info(&name("a")).unwrap().lease, 10);
    }

    #[test]
    fn decrement_leases_splits_refresh_and_evict_disjointly() {
        let reg = Registry::new();
        // One decrement past due (lease -> 0): refresh, not evicted.
        reg.register(name("due"), Mode::Head, addr(1), 1).unwrap();
        // Past due by more than ttl_tolerance: evicted outright.
        reg.register(name("overdue"), Mode::Head, addr(2), -1)
            .unwrap();
        reg.register(name("healthy"), Mode::Head, addr(3), 100)
            .unwrap();

        let sweep = reg.decrement_leases(Mode::Head, 2);

        assert_eq!(sweep.refresh, vec![name("due")]);
        assert_eq!(sweep.evict, vec![name("overdue")]);
        assert!(reg.is_registered(&name("due")));
        assert!(!reg.is_registered(&name("overdue")));
        assert!(reg.is_registered(&name("healthy")));
    }

    #[test]
    fn decrement_leases_matches_ttl_tolerance_block_counts() {
        // ttl=3, ttl_tolerance=2: refresh once 3 decrements have landed,
        // evict once 3 + 2 = 5 decrements have landed.
        let reg = Registry::new();
        reg.register(name("watcher"), Mode::Head, addr(1), 3).unwrap();

        for _ in 0..2 {
            let sweep = reg.decrement_leases(Mode::Head, 2);
            assert!(sweep.refresh.is_empty());
            assert!(sweep.evict.is_empty());
        }

        let sweep = reg.decrement_leases(Mode::Head, 2);
        assert_eq!(sweep.refresh, vec![name("watcher")]);
        assert!(sweep.evict.is_empty());

        let sweep = reg.decrement_leases(Mode::Head, 2);
        assert_eq!(sweep.refresh, vec![name("watcher")]);
        assert!(sweep.evict.is_empty());

        let sweep = reg.decrement_leases(Mode::Head, 2);
        assert!(sweep.refresh.is_empty());
        assert_eq!(sweep.evict, vec![name("watcher")]);
        assert!(!reg.is_registered(&name("watcher")));
    }

    #[test]
    fn matching_honors_empty_and_nonempty_filters() {
        let reg = Registry::new();
        reg.register(name("unfiltered"), Mode::Head, addr(1), 10)
            .unwrap();
        reg.register(name("picky"), Mode::Head, addr(2), 10)
            .unwrap();
        reg.set_subs(&name("picky"), vec!["transfer".into()])
            .unwrap();

        // An empty filter matches nothing: "unfiltered" never hears from
        // the stream until it opts in with set_subs/add_subs.
        let matches = reg.matching(Mode::Head, Some("transfer"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].0, name("picky"));

        let matches = reg.matching(Mode::Head, Some("vote"));
        assert!(matches.is_empty());
    }

    #[test]
    fn add_and_rem_subs_are_idempotent_and_order_independent() {
        let reg = Registry::new();
        reg.register(name("a"), Mode::Head, addr(1), 10).unwrap();
        reg.add_subs(&name("a"), vec!["transfer".into(), "vote".into()])
            .unwrap();
        reg.add_subs(&name("a"), vec!["transfer".into()]).unwrap();
        assert_eq!(reg.info(&name("a")).unwrap().filter.len(), 2);

        reg.rem_subs(&name("a"), vec!["vote".into()]).unwrap();
        assert_eq!(reg.info(&name("a")).unwrap().filter, vec!["transfer"]);
    }
}
