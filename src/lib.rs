//! # Unicontact
//!
//! Contact identity reconciliation.
//!
//! Partial contact observations (an email, a phone number, or both) are folded
//! into clusters of contacts that denote the same person. Each cluster has one
//! primary, its earliest contact, and every other member links directly to it.
//! An observation either creates a new identity, matches a known one, adds a
//! new fact to a known one, or bridges several known identities into one.

pub mod config;
pub mod error;
pub mod http;
pub mod lock;
pub mod model;
pub mod persistence;
pub mod reconcile;
pub mod store;
pub mod test_support;
pub mod view;

// Re-export main types for convenience
pub use config::{ReconcileConfig, UniContactConfig};
pub use error::{ReconcileError, StoreError, ValidationError};
pub use model::{
    Contact, ContactId, ContactLink, ContactView, IdentifyRequest, IdentifyResponse,
    LinkPrecedence, Observation,
};
pub use persistence::{PersistentOpenOptions, PersistentStore};
pub use reconcile::{Classification, Outcome, Reconciler};
pub use store::{ContactStore, ContactTxn, Store, StoreMetrics};

use lock::LockScope;
use tracing::{debug, info, instrument};

/// Main API for contact reconciliation
pub struct Unicontact {
    store: Box<dyn ContactStore>,
    config: ReconcileConfig,
}

impl Unicontact {
    /// Create an instance backed by an in-memory store
    pub fn new() -> Self {
        Self::with_store(Store::new())
    }

    /// Create an instance with a custom store implementation.
    pub fn with_store<S>(store: S) -> Self
    where
        S: ContactStore + 'static,
    {
        Self::with_store_and_config(store, ReconcileConfig::default())
    }

    pub fn with_store_and_config<S>(store: S, config: ReconcileConfig) -> Self
    where
        S: ContactStore + 'static,
    {
        Self {
            store: Box::new(store),
            config,
        }
    }

    /// Open the store described by `config`: persistent when a data
    /// directory is set, in-memory otherwise.
    pub fn from_config(config: &UniContactConfig) -> anyhow::Result<Self> {
        match &config.storage.data_dir {
            Some(data_dir) => {
                std::fs::create_dir_all(data_dir)?;
                let store = PersistentStore::open_with_options(
                    data_dir,
                    PersistentOpenOptions {
                        repair: config.storage.repair,
                        cache_capacity: config.storage.cache_capacity,
                    },
                )?;
                Ok(Self::with_store_and_config(store, config.reconcile))
            }
            None => {
                info!("no data directory configured, contacts are kept in memory");
                Ok(Self::with_store_and_config(Store::new(), config.reconcile))
            }
        }
    }

    pub fn store(&self) -> &dyn ContactStore {
        self.store.as_ref()
    }

    pub fn metrics(&self) -> StoreMetrics {
        self.store.metrics()
    }

    /// Validate a request and reconcile it into the stored clusters.
    #[instrument(skip_all)]
    pub fn identify(&self, request: IdentifyRequest) -> Result<IdentifyResponse, ReconcileError> {
        let observation = Observation::try_from(request)?;
        let outcome = self.reconcile(&observation)?;
        Ok(IdentifyResponse {
            contact: outcome.view,
        })
    }

    /// Reconcile an already validated observation.
    pub fn reconcile(&self, observation: &Observation) -> Result<Outcome, StoreError> {
        let outcome = Reconciler::new(self.store.as_ref(), self.config).reconcile(observation)?;
        debug!(
            classification = ?outcome.classification,
            primary = %outcome.view.primary_contact_id,
            members = outcome.cluster.len(),
            "reconciled observation"
        );
        Ok(outcome)
    }

    /// View of the cluster containing `id`, without writing anything.
    pub fn cluster_of(&self, id: ContactId) -> Result<Option<ContactView>, StoreError> {
        let Some(contact) = self.store.get_contact(id)? else {
            return Ok(None);
        };
        let txn = self.store.begin(&LockScope::for_contact(&contact))?;
        let Some(current) = txn
            .find_cluster(id)?
            .into_iter()
            .find(|member| member.id == id)
        else {
            return Err(StoreError::UnknownContact(id));
        };
        let cluster = reconcile::materialize(txn.as_ref(), current.primary_id())?;
        view::assemble(&cluster).map(Some)
    }
}

impl Default for Unicontact {
    fn default() -> Self {
        Self::new()
    }
}
