//! Lock table
//!
//! Shared/exclusive grants per DBO, on behalf of transactions.
//!
//! - Re-entrant: a holder never blocks on its own grants
//! - A holder may escalate Shared to Exclusive once it is the only sharer
//! - Grants are indexed per holder and released in bulk by `release_all`
//!
//! There is no deadlock detection. Callers acquire in a stable object order,
//! and an optional wait bound turns a stuck acquisition into an error.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::catalogue::Name;

use super::errors::LockError;
use super::types::TransactionId;

/// Lock mode
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct LockEntry {
    shared: HashSet<TransactionId>,
    exclusive: Option<TransactionId>,
}

impl LockEntry {
    fn grantable(&self, holder: TransactionId, mode: LockMode) -> bool {
        let no_foreign_writer = self.exclusive.map_or(true, |h| h == holder);
        match mode {
            LockMode::Shared => no_foreign_writer,
            LockMode::Exclusive => no_foreign_writer && self.shared.iter().all(|h| *h == holder),
        }
    }

    fn grant(&mut self, holder: TransactionId, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                self.shared.insert(holder);
            }
            LockMode::Exclusive => {
                self.shared.remove(&holder);
                self.exclusive = Some(holder);
            }
        }
    }

    fn release(&mut self, holder: TransactionId) {
        self.shared.remove(&holder);
        if self.exclusive == Some(holder) {
            self.exclusive = None;
        }
    }

    fn is_free(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none()
    }
}

#[derive(Debug, Default)]
struct LockState {
    objects: HashMap<Name, LockEntry>,
    grants: HashMap<TransactionId, HashMap<Name, LockMode>>,
}

/// The process-wide lock table
#[derive(Debug, Default)]
pub struct LockTable {
    state: Mutex<LockState>,
    released: Condvar,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocking acquire without a wait bound
    pub fn request(&self, holder: TransactionId, object: &Name, mode: LockMode) {
        // Without a deadline the acquisition cannot time out.
        let _ = self.request_timeout(holder, object, mode, None);
    }

    /// Blocking acquire, giving up after `timeout` if one is set
    pub fn request_timeout(
        &self,
        holder: TransactionId,
        object: &Name,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<(), LockError> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let mut state = self.state.lock();

        loop {
            {
                let st = &mut *state;
                let held = st.grants.get(&holder).and_then(|g| g.get(object)).copied();
                if held == Some(LockMode::Exclusive)
                    || (held.is_some() && mode == LockMode::Shared)
                {
                    return Ok(());
                }

                let entry = st.objects.entry(object.clone()).or_default();
                if entry.grantable(holder, mode) {
                    entry.grant(holder, mode);
                    st.grants
                        .entry(holder)
                        .or_default()
                        .insert(object.clone(), mode);
                    trace!(tx = %holder, object = %object, ?mode, "lock granted");
                    return Ok(());
                }
            }

            trace!(tx = %holder, object = %object, ?mode, "waiting for lock");
            match deadline {
                None => self.released.wait(&mut state),
                Some(deadline) => {
                    if self.released.wait_until(&mut state, deadline).timed_out() {
                        let entry_free = state.objects.get(object).map(LockEntry::is_free);
                        if entry_free == Some(true) {
                            state.objects.remove(object);
                        }
                        return Err(LockError::Timeout {
                            holder,
                            object: object.clone(),
                            mode,
                            waited: started.elapsed(),
                        });
                    }
                }
            }
        }
    }

    /// Release every grant of `holder`; returns the number of objects released
    pub fn release_all(&self, holder: TransactionId) -> usize {
        let released = {
            let mut state = self.state.lock();
            let Some(grants) = state.grants.remove(&holder) else {
                return 0;
            };
            for object in grants.keys() {
                let free = match state.objects.get_mut(object) {
                    Some(entry) => {
                        entry.release(holder);
                        entry.is_free()
                    }
                    None => false,
                };
                if free {
                    state.objects.remove(object);
                }
            }
            grants.len()
        };
        self.released.notify_all();
        released
    }

    /// Mode in which `holder` holds `object`
    pub fn mode_of(&self, holder: TransactionId, object: &Name) -> Option<LockMode> {
        self.state
            .lock()
            .grants
            .get(&holder)
            .and_then(|g| g.get(object))
            .copied()
    }

    /// All grants of `holder`
    pub fn held_by(&self, holder: TransactionId) -> Vec<(Name, LockMode)> {
        let state = self.state.lock();
        let mut held: Vec<_> = state
            .grants
            .get(&holder)
            .map(|g| g.iter().map(|(n, m)| (n.clone(), *m)).collect())
            .unwrap_or_default();
        held.sort_by(|a, b| a.0.cmp(&b.0));
        held
    }

    pub fn is_locked(&self, object: &Name) -> bool {
        self.state.lock().objects.contains_key(object)
    }

    /// Number of objects with at least one grant
    pub fn locked_objects(&self) -> usize {
        self.state.lock().objects.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::EntityName;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn tx(id: u64) -> TransactionId {
        TransactionId::new(id)
    }

    fn entity(name: &str) -> Name {
        EntityName::new("s", name).into()
    }

    #[test]
    fn test_shared_grants_are_compatible() {
        let table = LockTable::new();
        table.request(tx(1), &entity("a"), LockMode::Shared);
        table.request(tx(2), &entity("a"), LockMode::Shared);
        assert_eq!(table.mode_of(tx(1), &entity("a")), Some(LockMode::Shared));
        assert_eq!(table.mode_of(tx(2), &entity("a")), Some(LockMode::Shared));
    }

    #[test]
    fn test_reentrant_requests_do_not_block() {
        let table = LockTable::new();
        table.request(tx(1), &entity("a"), LockMode::Exclusive);
        table.request(tx(1), &entity("a"), LockMode::Shared);
        table.request(tx(1), &entity("a"), LockMode::Exclusive);
        assert_eq!(table.mode_of(tx(1), &entity("a")), Some(LockMode::Exclusive));
        assert_eq!(table.release_all(tx(1)), 1);
    }

    #[test]
    fn test_escalation_of_sole_sharer() {
        let table = LockTable::new();
        table.request(tx(1), &entity("a"), LockMode::Shared);
        table.request(tx(1), &entity("a"), LockMode::Exclusive);
        assert_eq!(table.mode_of(tx(1), &entity("a")), Some(LockMode::Exclusive));
        assert_eq!(table.held_by(tx(1)).len(), 1);
    }

    #[test]
    fn test_escalation_waits_for_other_sharers() {
        let table = LockTable::new();
        table.request(tx(1), &entity("a"), LockMode::Shared);
        table.request(tx(2), &entity("a"), LockMode::Shared);

        let err = table
            .request_timeout(
                tx(1),
                &entity("a"),
                LockMode::Exclusive,
                Some(Duration::from_millis(20)),
            )
            .unwrap_err();
        assert_eq!(err.code(), "QDB_LOCK_TIMEOUT");

        table.release_all(tx(2));
        table
            .request_timeout(tx(1), &entity("a"), LockMode::Exclusive, Some(Duration::from_secs(1)))
            .unwrap();
    }

    #[test]
    fn test_exclusive_blocks_until_release() {
        let table = Arc::new(LockTable::new());
        table.request(tx(1), &entity("a"), LockMode::Exclusive);

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let table = Arc::clone(&table);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                table.request(tx(2), &entity("a"), LockMode::Shared);
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));

        table.release_all(tx(1));
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(table.mode_of(tx(2), &entity("a")), Some(LockMode::Shared));
    }

    #[test]
    fn test_release_all_counts_distinct_objects() {
        let table = LockTable::new();
        table.request(tx(1), &entity("a"), LockMode::Shared);
        table.request(tx(1), &entity("a"), LockMode::Exclusive);
        table.request(tx(1), &entity("b"), LockMode::Shared);
        table.request(tx(1), &Name::Catalogue, LockMode::Shared);

        assert_eq!(table.release_all(tx(1)), 3);
        assert!(table.held_by(tx(1)).is_empty());
        assert_eq!(table.locked_objects(), 0);
        assert_eq!(table.release_all(tx(1)), 0);
    }

    #[test]
    fn test_timeout_leaves_no_trace() {
        let table = LockTable::new();
        table.request(tx(1), &entity("a"), LockMode::Exclusive);
        assert!(table
            .request_timeout(tx(2), &entity("a"), LockMode::Shared, Some(Duration::from_millis(10)))
            .is_err());
        assert!(table.held_by(tx(2)).is_empty());
        table.release_all(tx(1));
        assert!(!table.is_locked(&entity("a")));
    }
}
