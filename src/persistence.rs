//! # Persistent Store
//!
//! RocksDB-backed [`ContactStore`]. Contacts live in their own column family
//! keyed by id; secondary indexes keyed by email, phone and linked primary
//! keep creation order inside each prefix so lookups are ordered prefix scans.
//! A transaction commits as a single `WriteBatch`.

use crate::error::{StoreError, StoreResult};
use crate::lock::{KeyLocks, LockScope, ScopeGuard};
use crate::model::{sort_by_creation, Contact, ContactId, ContactLink, NewContact};
use crate::store::{
    ContactStore, ContactTxn, CreationClock, IdAllocator, StagedWrites, StoreMetrics,
};
use lru::LruCache;
use parking_lot::Mutex;
use rocksdb::{
    checkpoint::Checkpoint, ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode,
    Options, WriteBatch, DB,
};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, info};

const CF_CONTACTS: &str = "contacts";
const CF_METADATA: &str = "metadata";
const CF_INDEX_EMAIL: &str = "index_email";
const CF_INDEX_PHONE: &str = "index_phone";
const CF_INDEX_LINKED: &str = "index_linked";

const KEY_MANIFEST: &[u8] = b"manifest";
const KEY_NEXT_CONTACT_ID: &[u8] = b"next_contact_id";
const KEY_LAST_CREATED_AT: &[u8] = b"last_created_at";

const STORAGE_FORMAT_VERSION: u32 = 1;
const DEFAULT_CACHE_CAPACITY: usize = 100_000;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

#[derive(Debug, Clone, Copy)]
pub struct PersistentOpenOptions {
    pub repair: bool,
    pub cache_capacity: usize,
}

impl Default for PersistentOpenOptions {
    fn default() -> Self {
        Self {
            repair: false,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

pub struct PersistentStore {
    db: DB,
    locks: KeyLocks,
    ids: IdAllocator,
    clock: CreationClock,
    cache: Mutex<LruCache<ContactId, Contact>>,
    /// Serializes batch writes so the persisted id and clock high-water marks
    /// never move backwards.
    commit_lock: Mutex<()>,
    contacts: AtomicUsize,
    creates: AtomicU64,
    updates: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl PersistentStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with_options(path, PersistentOpenOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: PersistentOpenOptions,
    ) -> StoreResult<Self> {
        if options.repair {
            repair_db(path.as_ref())?;
        }
        let db = open_db(path.as_ref())?;
        validate_or_init_manifest(&db)?;

        let (contact_count, max_id) = scan_contact_ids(&db)?;
        let next_id = load_metadata::<u32>(&db, KEY_NEXT_CONTACT_ID)?
            .unwrap_or(1)
            .max(max_id.map_or(1, |id| id.0 + 1));
        let last_created_at = load_metadata::<i64>(&db, KEY_LAST_CREATED_AT)?.unwrap_or(0);
        let capacity = NonZeroUsize::new(options.cache_capacity)
            .unwrap_or(NonZeroUsize::MIN);

        info!(
            path = %path.as_ref().display(),
            contacts = contact_count,
            next_id,
            "opened persistent contact store"
        );

        Ok(Self {
            db,
            locks: KeyLocks::new(),
            ids: IdAllocator::starting_at(next_id),
            clock: CreationClock::starting_after(last_created_at),
            cache: Mutex::new(LruCache::new(capacity)),
            commit_lock: Mutex::new(()),
            contacts: AtomicUsize::new(contact_count),
            creates: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.contacts.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn checkpoint(&self, path: impl AsRef<Path>) -> StoreResult<()> {
        let checkpoint = Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(path)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> StoreResult<&ColumnFamily> {
        cf_handle(&self.db, name)
    }

    /// Committed row on disk, bypassing the cache.
    fn read_contact(&self, id: ContactId) -> StoreResult<Option<Contact>> {
        let contacts_cf = self.cf(CF_CONTACTS)?;
        let Some(bytes) = self.db.get_cf(contacts_cf, id.0.to_be_bytes())? else {
            return Ok(None);
        };
        Ok(Some(bincode::deserialize(&bytes)?))
    }

    fn cached_contact(&self, id: ContactId) -> Option<Contact> {
        self.cache.lock().get(&id).cloned()
    }

    /// Read-through for transactions. A miss is filled under `commit_lock`
    /// so a row read before a commit can never replace the committed one.
    fn load_contact(&self, id: ContactId) -> StoreResult<Option<Contact>> {
        if let Some(contact) = self.cached_contact(id) {
            return Ok(Some(contact));
        }
        let _commit_guard = self.commit_lock.lock();
        let Some(contact) = self.read_contact(id)? else {
            return Ok(None);
        };
        self.cache.lock().put(id, contact.clone());
        Ok(Some(contact))
    }

    fn load_contacts(&self, ids: impl IntoIterator<Item = ContactId>) -> StoreResult<Vec<Contact>> {
        let mut contacts = Vec::new();
        for id in ids {
            if let Some(contact) = self.load_contact(id)? {
                contacts.push(contact);
            }
        }
        Ok(contacts)
    }

    /// Ids stored under `prefix` in an index column family.
    fn scan_index(&self, cf_name: &str, prefix: &[u8]) -> StoreResult<Vec<ContactId>> {
        let cf = self.cf(cf_name)?;
        let mut ids = Vec::new();
        for entry in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = entry?;
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(id) = decode_index_contact_id(&key) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn write_staged(&self, staged: StagedWrites) -> StoreResult<()> {
        let (creates, updates) = staged.counts();
        let contacts_cf = self.cf(CF_CONTACTS)?;
        let email_cf = self.cf(CF_INDEX_EMAIL)?;
        let phone_cf = self.cf(CF_INDEX_PHONE)?;
        let linked_cf = self.cf(CF_INDEX_LINKED)?;
        let metadata_cf = self.cf(CF_METADATA)?;

        let commit_guard = self.commit_lock.lock();
        let mut batch = WriteBatch::default();
        let mut written = Vec::new();
        let mut inserted = 0usize;
        for contact in staged.into_contacts() {
            match self.read_contact(contact.id)? {
                Some(previous) => {
                    if let Some(old_primary) = previous.linked_id {
                        batch.delete_cf(linked_cf, encode_linked_index(old_primary, &previous));
                    }
                }
                None => {
                    inserted += 1;
                    if let Some(email) = &contact.email {
                        batch.put_cf(email_cf, encode_value_index(email, &contact), []);
                    }
                    if let Some(phone) = &contact.phone_number {
                        batch.put_cf(phone_cf, encode_value_index(phone, &contact), []);
                    }
                }
            }
            if let Some(primary) = contact.linked_id {
                batch.put_cf(linked_cf, encode_linked_index(primary, &contact), []);
            }
            batch.put_cf(contacts_cf, contact.id.0.to_be_bytes(), bincode::serialize(&contact)?);
            written.push(contact);
        }
        batch.put_cf(
            metadata_cf,
            KEY_NEXT_CONTACT_ID,
            bincode::serialize(&self.ids.peek())?,
        );
        batch.put_cf(
            metadata_cf,
            KEY_LAST_CREATED_AT,
            bincode::serialize(&self.clock.last())?,
        );
        self.db.write(batch)?;

        let mut cache = self.cache.lock();
        for contact in written {
            cache.put(contact.id, contact);
        }
        drop(cache);
        drop(commit_guard);

        self.contacts.fetch_add(inserted, Ordering::Relaxed);
        self.creates.fetch_add(creates, Ordering::Relaxed);
        self.updates.fetch_add(updates, Ordering::Relaxed);
        self.commits.fetch_add(1, Ordering::Relaxed);
        debug!(creates, updates, "committed contact batch");
        Ok(())
    }
}

impl ContactStore for PersistentStore {
    fn begin(&self, scope: &LockScope) -> StoreResult<Box<dyn ContactTxn + '_>> {
        let guard = self.locks.acquire(scope);
        Ok(Box::new(PersistentTxn {
            store: self,
            staged: StagedWrites::default(),
            _guard: guard,
        }))
    }

    fn get_contact(&self, id: ContactId) -> StoreResult<Option<Contact>> {
        match self.cached_contact(id) {
            Some(contact) => Ok(Some(contact)),
            None => self.read_contact(id),
        }
    }

    fn all_contacts(&self) -> StoreResult<Vec<Contact>> {
        let contacts_cf = self.cf(CF_CONTACTS)?;
        let mut contacts = Vec::new();
        for entry in self.db.iterator_cf(contacts_cf, IteratorMode::Start) {
            let (_key, value) = entry?;
            contacts.push(bincode::deserialize::<Contact>(&value)?);
        }
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

impl Drop for PersistentStore {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

struct PersistentTxn<'a> {
    store: &'a PersistentStore,
    staged: StagedWrites,
    _guard: ScopeGuard,
}

impl ContactTxn for PersistentTxn<'_> {
    fn find_matching(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> StoreResult<Vec<Contact>> {
        let mut ids = Vec::new();
        if let Some(email) = email {
            ids.extend(self.store.scan_index(CF_INDEX_EMAIL, &encode_string_prefix(email))?);
        }
        if let Some(phone) = phone_number {
            ids.extend(self.store.scan_index(CF_INDEX_PHONE, &encode_string_prefix(phone))?);
        }
        let committed = self.store.load_contacts(ids)?;
        Ok(self
            .staged
            .overlay(committed, |contact| contact.matches(email, phone_number)))
    }

    fn find_cluster(&self, primary_id: ContactId) -> StoreResult<Vec<Contact>> {
        let members = self
            .store
            .scan_index(CF_INDEX_LINKED, &primary_id.0.to_be_bytes())?;
        let committed = self
            .store
            .load_contacts(std::iter::once(primary_id).chain(members))?;
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
        let current = match self.staged.get(id) {
            Some(contact) => contact.clone(),
            None => self
                .store
                .load_contact(id)?
                .ok_or(StoreError::UnknownContact(id))?,
        };
        let updated = current.with_link(link);
        self.staged.stage_update(updated.clone());
        Ok(updated)
    }

    fn commit(mut self: Box<Self>) -> StoreResult<()> {
        let staged = std::mem::take(&mut self.staged);
        if staged.is_empty() {
            return Ok(());
        }
        self.store.write_staged(staged).map_err(|err| {
            self.store.rollbacks.fetch_add(1, Ordering::Relaxed);
            err
        })
    }
}

impl Drop for PersistentTxn<'_> {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            self.store.rollbacks.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn open_db(path: &Path) -> StoreResult<DB> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options.set_paranoid_checks(true);
    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_CONTACTS, Options::default()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
        ColumnFamilyDescriptor::new(CF_INDEX_EMAIL, Options::default()),
        ColumnFamilyDescriptor::new(CF_INDEX_PHONE, Options::default()),
        ColumnFamilyDescriptor::new(CF_INDEX_LINKED, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&options, path, cfs)?)
}

fn repair_db(path: &Path) -> StoreResult<()> {
    let mut options = Options::default();
    options.create_if_missing(true);
    DB::repair(&options, path)?;
    Ok(())
}

fn cf_handle<'a>(db: &'a DB, name: &str) -> StoreResult<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| StoreError::Corrupt(format!("missing column family {name}")))
}

/// Number of stored contacts and the highest id among them.
fn scan_contact_ids(db: &DB) -> StoreResult<(usize, Option<ContactId>)> {
    let contacts_cf = cf_handle(db, CF_CONTACTS)?;
    let mut count = 0;
    let mut max_id = None;
    for entry in db.iterator_cf(contacts_cf, IteratorMode::Start) {
        let (key, _) = entry?;
        count += 1;
        max_id = decode_contact_key(&key).or(max_id);
    }
    Ok((count, max_id))
}

fn validate_or_init_manifest(db: &DB) -> StoreResult<()> {
    if let Some(manifest) = load_metadata::<StorageManifest>(db, KEY_MANIFEST)? {
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION, manifest.format_version
            )));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let metadata_cf = cf_handle(db, CF_METADATA)?;
    db.put_cf(metadata_cf, KEY_MANIFEST, bincode::serialize(&manifest)?)?;
    Ok(())
}

fn load_metadata<T: serde::de::DeserializeOwned>(db: &DB, key: &[u8]) -> StoreResult<Option<T>> {
    let metadata_cf = cf_handle(db, CF_METADATA)?;
    match db.get_cf(metadata_cf, key)? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

/// Maps signed timestamps onto byte strings that sort in numeric order.
fn encode_timestamp(created_at: i64) -> [u8; 8] {
    ((created_at as u64) ^ (1 << 63)).to_be_bytes()
}

fn encode_string_prefix(value: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(value.len() + 1);
    key.extend_from_slice(value.as_bytes());
    key.push(0);
    key
}

fn encode_value_index(value: &str, contact: &Contact) -> Vec<u8> {
    let mut key = encode_string_prefix(value);
    key.extend_from_slice(&encode_timestamp(contact.created_at));
    key.extend_from_slice(&contact.id.0.to_be_bytes());
    key
}

fn encode_linked_index(primary: ContactId, contact: &Contact) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + 8 + 4);
    key.extend_from_slice(&primary.0.to_be_bytes());
    key.extend_from_slice(&encode_timestamp(contact.created_at));
    key.extend_from_slice(&contact.id.0.to_be_bytes());
    key
}

/// Every index key ends with the contact id.
fn decode_index_contact_id(key: &[u8]) -> Option<ContactId> {
    let start = key.len().checked_sub(4)?;
    Some(ContactId(u32::from_be_bytes(key[start..].try_into().ok()?)))
}

fn decode_contact_key(key: &[u8]) -> Option<ContactId> {
    Some(ContactId(u32::from_be_bytes(key.try_into().ok()?)))
}
