//! # Reconciliation Engine
//!
//! Folds an observation into the contact clusters it touches.
//!
//! The work is split in three steps:
//!
//! 1. [`Snapshot::read`] runs the candidate lookup and materializes every
//!    cluster the candidates belong to.
//! 2. [`plan`] classifies the observation and decides which rows to create
//!    and relink. It is pure and never touches the store.
//! 3. [`apply`] stages the plan in the open transaction and re-materializes
//!    the resulting cluster.
//!
//! [`Reconciler`] drives the three steps inside one lock scope and commits
//! only once the projected view has been assembled.

use crate::config::ReconcileConfig;
use crate::error::{StoreError, StoreResult};
use crate::lock::LockScope;
use crate::model::{Contact, ContactId, ContactLink, ContactView, NewContact, Observation};
use crate::store::{ContactStore, ContactTxn};
use crate::view;
use std::collections::HashSet;
use tracing::{debug, warn};

/// How an observation relates to the stored clusters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Nothing shares the email or phone: a new identity.
    NoMatch,
    /// Every supplied field is already known to the cluster.
    FullMatch { primary: ContactId },
    /// A new fact about a single known identity.
    PartialMatch { primary: ContactId },
    /// The observation ties several clusters together. `absorbed` lists the
    /// primaries that lose their rank to `survivor`.
    Bridge {
        survivor: ContactId,
        absorbed: Vec<ContactId>,
    },
}

/// Mutations decided for one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub classification: Classification,
    pub create: Option<NewContact>,
    /// Link rewrites in creation order of the rewritten contacts.
    pub relinks: Vec<(ContactId, ContactLink)>,
    /// Primary of the resulting cluster. `None` when the primary is the
    /// contact this plan creates.
    pub root: Option<ContactId>,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.create.is_none() && self.relinks.is_empty()
    }
}

/// Candidates and the clusters they reach, read under one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Contacts sharing the observation's email or phone, in creation order.
    pub candidates: Vec<Contact>,
    /// Distinct primaries reached by the candidates, reference cluster first.
    pub roots: Vec<ContactId>,
    /// Materialized cluster for each entry of `roots`.
    pub clusters: Vec<Vec<Contact>>,
}

impl Snapshot {
    pub fn read(txn: &dyn ContactTxn, observation: &Observation) -> StoreResult<Self> {
        let candidates = txn.find_matching(observation.email(), observation.phone_number())?;
        let mut roots = Vec::new();
        for candidate in &candidates {
            let root = candidate.primary_id();
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        let clusters = roots
            .iter()
            .map(|root| materialize(txn, *root))
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(Self {
            candidates,
            roots,
            clusters,
        })
    }

    /// Every identifying key of every contact this snapshot depends on.
    pub fn scope(&self) -> LockScope {
        let mut scope = LockScope::new();
        for contact in self.candidates.iter().chain(self.clusters.iter().flatten()) {
            scope.add_contact(contact);
        }
        scope
    }
}

/// Expand a primary id into its cluster, in creation order.
pub fn materialize(txn: &dyn ContactTxn, primary: ContactId) -> StoreResult<Vec<Contact>> {
    let cluster = txn.find_cluster(primary)?;
    if !cluster.iter().any(|contact| contact.id == primary) {
        return Err(StoreError::Corrupt(format!(
            "contacts reference missing primary {primary}"
        )));
    }
    Ok(cluster)
}

/// Decide how `observation` changes the clusters in `snapshot`.
pub fn plan(observation: &Observation, snapshot: &Snapshot) -> ReconcilePlan {
    let (Some(&reference_root), Some(reference)) =
        (snapshot.roots.first(), snapshot.clusters.first())
    else {
        return ReconcilePlan {
            classification: Classification::NoMatch,
            create: Some(NewContact::primary(observation)),
            relinks: Vec::new(),
            root: None,
        };
    };

    let known_emails: HashSet<&str> = reference
        .iter()
        .filter_map(|contact| contact.email.as_deref())
        .collect();
    let known_phones: HashSet<&str> = reference
        .iter()
        .filter_map(|contact| contact.phone_number.as_deref())
        .collect();
    let novel = observation
        .email()
        .is_some_and(|email| !known_emails.contains(email))
        || observation
            .phone_number()
            .is_some_and(|phone| !known_phones.contains(phone));
    let bridged = snapshot.roots.len() > 1;

    if !novel && !bridged {
        return ReconcilePlan {
            classification: Classification::FullMatch {
                primary: reference_root,
            },
            create: None,
            relinks: Vec::new(),
            root: Some(reference_root),
        };
    }

    // The contact created below is newer than anything stored, so it can
    // never be the earliest member.
    let members: Vec<&Contact> = snapshot.clusters.iter().flatten().collect();
    let survivor = members
        .iter()
        .min_by_key(|contact| contact.creation_key())
        .map_or(reference_root, |contact| contact.id);

    let mut seen = HashSet::new();
    let mut relinks = Vec::new();
    for member in &members {
        if !seen.insert(member.id) {
            continue;
        }
        let target = if member.id == survivor {
            ContactLink::Primary
        } else {
            ContactLink::Secondary(survivor)
        };
        if member.link() != target {
            relinks.push((member.id, target));
        }
    }

    let classification = if bridged || survivor != reference_root {
        Classification::Bridge {
            survivor,
            absorbed: snapshot
                .roots
                .iter()
                .copied()
                .filter(|root| *root != survivor)
                .collect(),
        }
    } else {
        Classification::PartialMatch {
            primary: reference_root,
        }
    };

    ReconcilePlan {
        classification,
        create: novel.then(|| NewContact::secondary(observation, survivor)),
        relinks,
        root: Some(survivor),
    }
}

/// Stage `plan` in `txn` and return the resulting cluster.
pub fn apply(txn: &mut dyn ContactTxn, plan: &ReconcilePlan) -> StoreResult<Vec<Contact>> {
    let created = match &plan.create {
        Some(contact) => Some(txn.create(contact.clone())?),
        None => None,
    };
    for (id, link) in &plan.relinks {
        txn.update(*id, *link)?;
    }
    let root = plan
        .root
        .or_else(|| created.as_ref().map(|contact| contact.id))
        .ok_or_else(|| StoreError::Corrupt("plan has neither a root nor a new contact".into()))?;
    materialize(txn, root)
}

/// Result of reconciling one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub classification: Classification,
    /// The resulting cluster, in creation order.
    pub cluster: Vec<Contact>,
    pub view: ContactView,
}

/// Runs observations against a store, one transaction each.
pub struct Reconciler<'s> {
    store: &'s dyn ContactStore,
    config: ReconcileConfig,
}

impl<'s> Reconciler<'s> {
    pub fn new(store: &'s dyn ContactStore, config: ReconcileConfig) -> Self {
        Self { store, config }
    }

    /// Reconcile one observation atomically.
    ///
    /// The transaction starts with the observation's own keys. When the
    /// clusters it reaches carry keys outside that scope the transaction is
    /// abandoned before any write and restarted with the wider scope.
    pub fn reconcile(&self, observation: &Observation) -> StoreResult<Outcome> {
        let attempts = self.config.max_scope_attempts.max(1);
        let mut scope = LockScope::for_observation(observation);
        for attempt in 1..=attempts {
            let mut txn = self.store.begin(&scope)?;
            let snapshot = Snapshot::read(txn.as_ref(), observation)?;
            let required = snapshot.scope();
            if !scope.covers(&required) {
                warn!(
                    attempt,
                    held = scope.len(),
                    required = required.len(),
                    "lock scope too narrow, restarting"
                );
                scope.extend(&required);
                continue;
            }

            let plan = plan(observation, &snapshot);
            debug!(
                classification = ?plan.classification,
                creates = plan.create.is_some(),
                relinks = plan.relinks.len(),
                "planned reconciliation"
            );
            let (cluster, view) = match apply(txn.as_mut(), &plan)
                .and_then(|cluster| view::assemble(&cluster).map(|view| (cluster, view)))
            {
                Ok(applied) => applied,
                Err(err) => {
                    warn!(error = %err, "reconciliation failed, discarding staged writes");
                    return Err(err);
                }
            };
            if !plan.is_noop() {
                if let Err(err) = txn.commit() {
                    warn!(error = %err, "commit failed, reconciliation rolled back");
                    return Err(err);
                }
            }
            return Ok(Outcome {
                classification: plan.classification,
                cluster,
                view,
            });
        }
        Err(StoreError::ScopeUnstable { attempts })
    }
}
