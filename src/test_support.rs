use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{StoreError, StoreResult};
use crate::lock::LockScope;
use crate::model::{
    Contact, ContactId, ContactLink, IdentifyRequest, LinkPrecedence, NewContact,
};
use crate::store::{ContactStore, ContactTxn, StoreMetrics};

/// Build a contact without a store, for planner and view fixtures.
pub fn fixture_contact(
    id: u32,
    created_at: i64,
    email: Option<&str>,
    phone_number: Option<&str>,
    link: ContactLink,
) -> Contact {
    NewContact {
        email: email.map(str::to_string),
        phone_number: phone_number.map(str::to_string),
        link,
    }
    .into_contact(ContactId(id), created_at)
}

/// Write a contact directly, bypassing reconciliation. Lets tests set up
/// clusters the engine would never produce on its own.
pub fn seed_contact(
    store: &dyn ContactStore,
    email: Option<&str>,
    phone_number: Option<&str>,
    link: ContactLink,
) -> StoreResult<Contact> {
    let mut txn = store.begin(&LockScope::new())?;
    let contact = txn.create(NewContact {
        email: email.map(str::to_string),
        phone_number: phone_number.map(str::to_string),
        link,
    })?;
    txn.commit()?;
    Ok(contact)
}

/// Check every cluster invariant over the committed contents of `store`.
pub fn check_cluster_invariants(store: &dyn ContactStore) -> Result<(), String> {
    let contacts = store.all_contacts().map_err(|err| err.to_string())?;
    let by_id: HashMap<ContactId, &Contact> =
        contacts.iter().map(|contact| (contact.id, contact)).collect();

    for contact in &contacts {
        match (contact.link_precedence, contact.linked_id) {
            (LinkPrecedence::Primary, None) => {}
            (LinkPrecedence::Primary, Some(linked)) => {
                return Err(format!("primary {} links to {linked}", contact.id));
            }
            (LinkPrecedence::Secondary, None) => {
                return Err(format!("secondary {} has no primary", contact.id));
            }
            (LinkPrecedence::Secondary, Some(primary_id)) => {
                let primary = by_id.get(&primary_id).ok_or_else(|| {
                    format!("{} links to missing contact {primary_id}", contact.id)
                })?;
                if !primary.is_primary() {
                    return Err(format!(
                        "{} links to {primary_id}, which is not a primary",
                        contact.id
                    ));
                }
                if primary.creation_key() > contact.creation_key() {
                    return Err(format!(
                        "{} is older than its primary {primary_id}",
                        contact.id
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Email and phone values shared by more than one cluster. Reconciliation
/// never leaves any behind.
pub fn values_split_across_clusters(store: &dyn ContactStore) -> StoreResult<Vec<String>> {
    let contacts = store.all_contacts()?;
    let mut owner: HashMap<String, ContactId> = HashMap::new();
    let mut split = Vec::new();
    for contact in &contacts {
        for key in contact.identity_keys() {
            let key = key.to_string();
            match owner.get(&key) {
                Some(primary) if *primary != contact.primary_id() => split.push(key),
                Some(_) => {}
                None => {
                    owner.insert(key, contact.primary_id());
                }
            }
        }
    }
    Ok(split)
}

/// Store wrapper that fails the `n`th staged write (counting from one)
/// across all of its transactions, or every commit.
pub struct FlakyStore<S> {
    inner: S,
    fail_at: usize,
    fail_commit: bool,
    writes: AtomicUsize,
}

impl<S: ContactStore> FlakyStore<S> {
    pub fn new(inner: S, fail_at: usize) -> Self {
        Self {
            inner,
            fail_at,
            fail_commit: false,
            writes: AtomicUsize::new(0),
        }
    }

    /// Accept every write and refuse every commit instead.
    pub fn fail_on_commit(inner: S) -> Self {
        Self {
            fail_commit: true,
            ..Self::new(inner, 0)
        }
    }

    /// Writes attempted so far, the refused one included.
    pub fn writes_seen(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: ContactStore> ContactStore for FlakyStore<S> {
    fn begin(&self, scope: &LockScope) -> StoreResult<Box<dyn ContactTxn + '_>> {
        Ok(Box::new(FlakyTxn {
            inner: self.inner.begin(scope)?,
            fail_at: self.fail_at,
            fail_commit: self.fail_commit,
            writes: &self.writes,
        }))
    }

    fn get_contact(&self, id: ContactId) -> StoreResult<Option<Contact>> {
        self.inner.get_contact(id)
    }

    fn all_contacts(&self) -> StoreResult<Vec<Contact>> {
        self.inner.all_contacts()
    }

    fn metrics(&self) -> StoreMetrics {
        self.inner.metrics()
    }
}

struct FlakyTxn<'a> {
    inner: Box<dyn ContactTxn + 'a>,
    fail_at: usize,
    fail_commit: bool,
    writes: &'a AtomicUsize,
}

impl FlakyTxn<'_> {
    fn count_write(&self) -> StoreResult<()> {
        let write = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if write == self.fail_at {
            return Err(StoreError::Injected(format!("write {write} refused")));
        }
        Ok(())
    }
}

impl ContactTxn for FlakyTxn<'_> {
    fn find_matching(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> StoreResult<Vec<Contact>> {
        self.inner.find_matching(email, phone_number)
    }

    fn find_cluster(&self, primary_id: ContactId) -> StoreResult<Vec<Contact>> {
        self.inner.find_cluster(primary_id)
    }

    fn create(&mut self, contact: NewContact) -> StoreResult<Contact> {
        self.count_write()?;
        self.inner.create(contact)
    }

    fn update(&mut self, id: ContactId, link: ContactLink) -> StoreResult<Contact> {
        self.count_write()?;
        self.inner.update(id, link)
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        if self.fail_commit {
            return Err(StoreError::Injected("commit refused".to_string()));
        }
        self.inner.commit()
    }
}

/// Generate identify requests drawn from small email and phone pools so that
/// matches, extensions and bridges all occur.
pub fn generate_requests(count: usize, pool: usize, seed: u64) -> Vec<IdentifyRequest> {
    let mut rng = StdRng::seed_from_u64(seed);
    let pool = pool.max(1);
    let mut requests = Vec::with_capacity(count);

    for _ in 0..count {
        let email = format!("person_{:04}@example.com", rng.random_range(0..pool));
        let phone = format!("555-{:04}", rng.random_range(0..pool));
        let request = match rng.random_range(0..4) {
            0 => IdentifyRequest::new(Some(&email), None),
            1 => IdentifyRequest::new(None, Some(&phone)),
            _ => IdentifyRequest::new(Some(&email), Some(&phone)),
        };
        requests.push(request);
    }

    requests
}
