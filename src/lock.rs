//! # Key Locks
//!
//! Advisory locks keyed on identifying values. A transaction names every email
//! and phone it will touch up front and is granted the whole set at once, so
//! two holders never wait on each other while holding part of a set.

use crate::model::{Contact, IdentityKey, Observation};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// The identifying keys an operation holds exclusively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockScope {
    keys: BTreeSet<IdentityKey>,
}

impl LockScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_observation(observation: &Observation) -> Self {
        Self {
            keys: observation.identity_keys().collect(),
        }
    }

    pub fn for_contact(contact: &Contact) -> Self {
        Self {
            keys: contact.identity_keys().collect(),
        }
    }

    pub fn add_contact(&mut self, contact: &Contact) {
        self.keys.extend(contact.identity_keys());
    }

    pub fn extend(&mut self, other: &LockScope) {
        self.keys.extend(other.keys.iter().cloned());
    }

    pub fn covers(&self, other: &LockScope) -> bool {
        other.keys.is_subset(&self.keys)
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IdentityKey> {
        self.keys.iter()
    }
}

#[derive(Debug, Default)]
struct LockTable {
    held: Mutex<HashSet<IdentityKey>>,
    released: Condvar,
}

/// Shared lock table. Clones refer to the same table.
#[derive(Debug, Clone, Default)]
pub struct KeyLocks {
    table: Arc<LockTable>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until every key in `scope` is free, then take all of them.
    pub fn acquire(&self, scope: &LockScope) -> ScopeGuard {
        let mut held = self.table.held.lock();
        while scope.iter().any(|key| held.contains(key)) {
            self.table.released.wait(&mut held);
        }
        held.extend(scope.iter().cloned());
        ScopeGuard {
            table: Arc::clone(&self.table),
            keys: scope.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
impl KeyLocks {
    /// Take every key in `scope` only if all are free right now.
    pub fn try_acquire(&self, scope: &LockScope) -> Option<ScopeGuard> {
        let mut held = self.table.held.lock();
        if scope.iter().any(|key| held.contains(key)) {
            return None;
        }
        held.extend(scope.iter().cloned());
        Some(ScopeGuard {
            table: Arc::clone(&self.table),
            keys: scope.iter().cloned().collect(),
        })
    }

    pub fn held_count(&self) -> usize {
        self.table.held.lock().len()
    }
}

/// Releases its keys on drop.
#[derive(Debug)]
pub struct ScopeGuard {
    table: Arc<LockTable>,
    keys: Vec<IdentityKey>,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        let mut held = self.table.held.lock();
        for key in &self.keys {
            held.remove(key);
        }
        drop(held);
        self.table.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn scope(keys: &[IdentityKey]) -> LockScope {
        LockScope {
            keys: keys.iter().cloned().collect(),
        }
    }

    fn email(value: &str) -> IdentityKey {
        IdentityKey::Email(value.to_string())
    }

    fn phone(value: &str) -> IdentityKey {
        IdentityKey::Phone(value.to_string())
    }

    #[test]
    fn scope_covers_subsets_only() {
        let wide = scope(&[email("a@x.com"), phone("111")]);
        let narrow = scope(&[phone("111")]);
        assert!(wide.covers(&narrow));
        assert!(!narrow.covers(&wide));
        assert!(wide.covers(&LockScope::new()));
    }

    #[test]
    fn email_and_phone_keys_are_distinct() {
        let locks = KeyLocks::new();
        let _email = locks.acquire(&scope(&[email("111")]));
        assert!(locks.try_acquire(&scope(&[phone("111")])).is_some());
    }

    #[test]
    fn overlapping_scope_waits_for_release() {
        let locks = KeyLocks::new();
        let guard = locks.acquire(&scope(&[email("a@x.com")]));
        assert!(locks
            .try_acquire(&scope(&[email("a@x.com"), phone("222")]))
            .is_none());

        let (tx, rx) = mpsc::channel();
        let waiter_locks = locks.clone();
        let waiter = thread::spawn(move || {
            let _guard = waiter_locks.acquire(&scope(&[email("a@x.com"), phone("222")]));
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
        assert_eq!(locks.held_count(), 0);
    }

    #[test]
    fn disjoint_scopes_do_not_block() {
        let locks = KeyLocks::new();
        let _first = locks.acquire(&scope(&[email("a@x.com")]));
        let second = locks.try_acquire(&scope(&[email("b@x.com"), phone("222")]));
        assert!(second.is_some());
        assert_eq!(locks.held_count(), 3);
    }
}
