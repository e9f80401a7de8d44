//! # Store Module
//!
//! The record-store interface the reconciliation core depends on, plus the
//! in-memory implementation.
//!
//! Every read and write happens inside a [`ContactTxn`] opened for a
//! [`LockScope`]. Writes are staged in the transaction and become visible to
//! other transactions only on [`ContactTxn::commit`]; dropping an uncommitted
//! transaction discards them.

use crate::error::{StoreError, StoreResult};
use crate::lock::{KeyLocks, LockScope, ScopeGuard};
use crate::model::{sort_by_creation, Contact, ContactId, ContactLink, NewContact};
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Counters describing committed store activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreMetrics {
    pub contacts: usize,
    pub creates: u64,
    pub updates: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

impl StoreMetrics {
    /// Committed row writes (creates plus updates).
    pub fn writes(&self) -> u64 {
        self.creates + self.updates
    }
}

/// Durable keyed storage of contacts.
pub trait ContactStore: Send + Sync {
    /// Open a transaction holding every key in `scope`. Blocks while another
    /// transaction holds any of them.
    fn begin(&self, scope: &LockScope) -> StoreResult<Box<dyn ContactTxn + '_>>;

    /// Committed state of a single contact.
    fn get_contact(&self, id: ContactId) -> StoreResult<Option<Contact>>;

    /// Every committed contact in creation order.
    fn all_contacts(&self) -> StoreResult<Vec<Contact>>;

    fn metrics(&self) -> StoreMetrics;
}

/// A scoped, atomic unit of reads and writes.
pub trait ContactTxn {
    /// Contacts sharing the email or the phone number, in creation order.
    fn find_matching(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> StoreResult<Vec<Contact>>;

    /// The primary and every contact linked to it, in creation order.
    fn find_cluster(&self, primary_id: ContactId) -> StoreResult<Vec<Contact>>;

    /// Stage a new contact. The store assigns its id and creation time.
    fn create(&mut self, contact: NewContact) -> StoreResult<Contact>;

    /// Stage a rewrite of a contact's link.
    fn update(&mut self, id: ContactId, link: ContactLink) -> StoreResult<Contact>;

    /// Make every staged write visible at once.
    fn commit(self: Box<Self>) -> StoreResult<()>;
}

/// Writes staged by an open transaction, keyed by contact id.
#[derive(Debug, Default)]
pub(crate) struct StagedWrites {
    contacts: BTreeMap<ContactId, Contact>,
    creates: u64,
    updates: u64,
}

impl StagedWrites {
    pub(crate) fn get(&self, id: ContactId) -> Option<&Contact> {
        self.contacts.get(&id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub(crate) fn counts(&self) -> (u64, u64) {
        (self.creates, self.updates)
    }

    pub(crate) fn stage_create(&mut self, contact: Contact) {
        self.creates += 1;
        self.contacts.insert(contact.id, contact);
    }

    pub(crate) fn stage_update(&mut self, contact: Contact) {
        self.updates += 1;
        self.contacts.insert(contact.id, contact);
    }

    /// Lay staged rows over committed ones and keep those matching `keep`.
    pub(crate) fn overlay<F>(&self, committed: Vec<Contact>, keep: F) -> Vec<Contact>
    where
        F: Fn(&Contact) -> bool,
    {
        let mut merged: BTreeMap<ContactId, Contact> = committed
            .into_iter()
            .map(|contact| (contact.id, contact))
            .collect();
        for (id, contact) in &self.contacts {
            merged.insert(*id, contact.clone());
        }
        let mut contacts: Vec<Contact> =
            merged.into_values().filter(|contact| keep(contact)).collect();
        sort_by_creation(&mut contacts);
        contacts
    }

    pub(crate) fn into_contacts(self) -> impl Iterator<Item = Contact> {
        self.contacts.into_values()
    }
}

/// Hands out strictly increasing creation timestamps in unix microseconds.
#[derive(Debug, Default)]
pub struct CreationClock {
    last: AtomicI64,
}

impl CreationClock {
    pub fn starting_after(last: i64) -> Self {
        Self {
            last: AtomicI64::new(last),
        }
    }

    pub fn tick(&self) -> i64 {
        let now = now_micros();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }

    pub fn last(&self) -> i64 {
        self.last.load(Ordering::SeqCst)
    }
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Hands out contact ids. Ids of rolled-back creates are not reused.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU32,
}

impl IdAllocator {
    pub fn starting_at(next: u32) -> Self {
        Self {
            next: AtomicU32::new(next.max(1)),
        }
    }

    pub fn allocate(&self) -> ContactId {
        ContactId(self.next.fetch_add(1, Ordering::SeqCst))
    }

    pub fn peek(&self) -> u32 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    contacts: HashMap<ContactId, Contact>,
    by_email: HashMap<String, Vec<ContactId>>,
    by_phone: HashMap<String, Vec<ContactId>>,
    by_primary: HashMap<ContactId, Vec<ContactId>>,
}

impl StoreState {
    fn upsert(&mut self, contact: Contact) {
        match self.contacts.get(&contact.id) {
            Some(previous) => {
                if let Some(old_primary) = previous.linked_id {
                    if let Some(members) = self.by_primary.get_mut(&old_primary) {
                        members.retain(|id| *id != contact.id);
                    }
                }
            }
            None => {
                if let Some(email) = &contact.email {
                    self.by_email.entry(email.clone()).or_default().push(contact.id);
                }
                if let Some(phone) = &contact.phone_number {
                    self.by_phone.entry(phone.clone()).or_default().push(contact.id);
                }
            }
        }
        if let Some(primary) = contact.linked_id {
            self.by_primary.entry(primary).or_default().push(contact.id);
        }
        self.contacts.insert(contact.id, contact);
    }

    fn collect(&self, ids: impl IntoIterator<Item = ContactId>) -> Vec<Contact> {
        ids.into_iter()
            .filter_map(|id| self.contacts.get(&id).cloned())
            .collect()
    }
}

/// In-memory contact store.
#[derive(Debug, Default)]
pub struct Store {
    state: RwLock<StoreState>,
    locks: KeyLocks,
    ids: IdAllocator,
    clock: CreationClock,
    creates: AtomicU64,
    updates: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.read().contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().contacts.is_empty()
    }

    fn apply(&self, staged: StagedWrites) {
        let (creates, updates) = staged.counts();
        let mut state = self.state.write();
        for contact in staged.into_contacts() {
            state.upsert(contact);
        }
        drop(state);
        self.creates.fetch_add(creates, Ordering::Relaxed);
        self.updates.fetch_add(updates, Ordering::Relaxed);
        self.commits.fetch_add(1, Ordering::Relaxed);
    }
}

impl ContactStore for Store {
    fn begin(&self, scope: &LockScope) -> StoreResult<Box<dyn ContactTxn + '_>> {
        let guard = self.locks.acquire(scope);
        Ok(Box::new(StoreTxn {
            store: self,
            staged: StagedWrites::default(),
            _guard: guard,
        }))
    }

    fn get_contact(&self, id: ContactId) -> StoreResult<Option<Contact>> {
        Ok(self.state.read().contacts.get(&id).cloned())
    }

    fn all_contacts(&self) -> StoreResult<Vec<Contact>> {
        let mut contacts: Vec<Contact> = self.state.read().contacts.values().cloned().collect();
        sort_by_creation(&mut contacts);
        Ok(contacts)
    }

    fn metrics(&self) -> StoreMetrics {
        StoreMetrics {
            contacts: self.len(),
            creates: self.creates.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }
}

struct StoreTxn<'a> {
    store: &'a Store,
    staged: StagedWrites,
    _guard: ScopeGuard,
}

impl StoreTxn<'_> {
    fn current(&self, id: ContactId) -> Option<Contact> {
        self.staged
            .get(id)
            .cloned()
            .or_else(|| self.store.state.read().contacts.get(&id).cloned())
    }
}

impl ContactTxn for StoreTxn<'_> {
    fn find_matching(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> StoreResult<Vec<Contact>> {
        let committed = {
            let state = self.store.state.read();
            let by_email = email
                .and_then(|email| state.by_email.get(email))
                .into_iter()
                .flatten();
            let by_phone = phone_number
                .and_then(|phone| state.by_phone.get(phone))
                .into_iter()
                .flatten();
            state.collect(by_email.chain(by_phone).copied())
        };
        Ok(self
            .staged
            .overlay(committed, |contact| contact.matches(email, phone_number)))
    }

    fn find_cluster(&self, primary_id: ContactId) -> StoreResult<Vec<Contact>> {
        let committed = {
            let state = self.store.state.read();
            let members = state.by_primary.get(&primary_id).into_iter().flatten();
            state.collect(std::iter::once(primary_id).chain(members.copied()))
        };
        Ok(self.staged.overlay(committed, |contact| {
            contact.id == primary_id || contact.linked_id == Some(primary_id)
        }))
    }

    fn create(&mut self, contact: NewContact) -> StoreResult<Contact> {
        let id = self.store.ids.allocate();
        let created = contact.into_contact(id, self.store.clock.tick());
        self.staged.stage_create(created.clone());
        Ok(created)
    }

    fn update(&mut self, id: ContactId, link: ContactLink) -> StoreResult<Contact> {
        let updated = self
            .current(id)
            .ok_or(StoreError::UnknownContact(id))?
            .with_link(link);
        self.staged.stage_update(updated.clone());
        Ok(updated)
    }

    fn commit(mut self: Box<Self>) -> StoreResult<()> {
        let staged = std::mem::take(&mut self.staged);
        self.store.apply(staged);
        Ok(())
    }
}

impl Drop for StoreTxn<'_> {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            self.store.rollbacks.fetch_add(1, Ordering::Relaxed);
        }
    }
}
