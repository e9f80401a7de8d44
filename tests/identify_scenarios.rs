//! End-to-end identify scenarios against the in-memory store.

use unicontact_rs::test_support::{check_cluster_invariants, seed_contact};
use unicontact_rs::{
    Classification, ContactId, ContactLink, ContactStore, ContactTxn, IdentifyRequest,
    LinkPrecedence, Observation, ReconcileError, Store, StoreMetrics, Unicontact,
    ValidationError,
};

fn request(email: Option<&str>, phone: Option<&str>) -> IdentifyRequest {
    IdentifyRequest::new(email, phone)
}

#[test]
fn new_identity_creates_single_primary() -> anyhow::Result<()> {
    let service = Unicontact::new();
    let response = service.identify(request(Some("a@x.com"), None))?;

    assert_eq!(response.contact.emails, vec!["a@x.com"]);
    assert!(response.contact.phone_numbers.is_empty());
    assert!(response.contact.secondary_contact_ids.is_empty());

    let contacts = service.store().all_contacts()?;
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].id, response.contact.primary_contact_id);
    assert_eq!(contacts[0].link_precedence, LinkPrecedence::Primary);
    assert_eq!(contacts[0].linked_id, None);
    Ok(())
}

#[test]
fn repeated_observation_is_idempotent() -> anyhow::Result<()> {
    let service = Unicontact::new();
    let first = service.identify(request(Some("a@x.com"), Some("111")))?;
    let writes_before = service.metrics().writes();

    let second = service.identify(request(Some("a@x.com"), Some("111")))?;
    assert_eq!(first, second);
    assert_eq!(service.metrics().writes(), writes_before);

    let outcome = service.reconcile(&Observation::new(
        Some("a@x.com".to_string()),
        Some("111".to_string()),
    )?)?;
    assert_eq!(
        outcome.classification,
        Classification::FullMatch {
            primary: first.contact.primary_contact_id
        }
    );
    Ok(())
}

#[test]
fn partial_extension_adds_secondary() -> anyhow::Result<()> {
    let service = Unicontact::new();
    let primary = service.identify(request(Some("a@x.com"), Some("111")))?;
    let primary_id = primary.contact.primary_contact_id;

    let response = service.identify(request(Some("a@x.com"), Some("222")))?;
    assert_eq!(response.contact.primary_contact_id, primary_id);
    assert_eq!(response.contact.emails, vec!["a@x.com"]);
    assert_eq!(response.contact.phone_numbers, vec!["111", "222"]);
    assert_eq!(response.contact.secondary_contact_ids.len(), 1);

    let secondary_id = response.contact.secondary_contact_ids[0];
    let secondary = service
        .store()
        .get_contact(secondary_id)?
        .expect("secondary stored");
    assert_eq!(secondary.linked_id, Some(primary_id));
    assert_eq!(secondary.link_precedence, LinkPrecedence::Secondary);
    Ok(())
}

#[test]
fn subset_observation_is_a_no_op() -> anyhow::Result<()> {
    let service = Unicontact::new();
    service.identify(request(Some("a@x.com"), Some("111")))?;
    let full = service.identify(request(Some("b@x.com"), Some("111")))?;
    let before = service.metrics();

    for probe in [
        request(Some("b@x.com"), None),
        request(None, Some("111")),
        request(Some("a@x.com"), Some("111")),
    ] {
        assert_eq!(service.identify(probe)?, full);
    }
    let after = service.metrics();
    assert_eq!(after.writes(), before.writes());
    assert_eq!(after.commits, before.commits);
    assert_eq!(after.contacts, 2);
    Ok(())
}

#[test]
fn bridge_demotes_later_primary() -> anyhow::Result<()> {
    let service = Unicontact::new();
    let p1 = service
        .identify(request(Some("a@x.com"), None))?
        .contact
        .primary_contact_id;
    let p2 = service
        .identify(request(None, Some("222")))?
        .contact
        .primary_contact_id;
    assert_ne!(p1, p2);

    let response = service.identify(request(Some("a@x.com"), Some("222")))?;
    assert_eq!(response.contact.primary_contact_id, p1);
    assert_eq!(response.contact.emails, vec!["a@x.com"]);
    assert_eq!(response.contact.phone_numbers, vec!["222"]);

    let ids = &response.contact.secondary_contact_ids;
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[0], p2);

    let store = service.store();
    let demoted = store.get_contact(p2)?.expect("p2 stored");
    assert_eq!(demoted.link_precedence, LinkPrecedence::Secondary);
    assert_eq!(demoted.linked_id, Some(p1));
    let synthesized = store.get_contact(ids[1])?.expect("new row stored");
    assert_eq!(synthesized.linked_id, Some(p1));
    assert!(store.get_contact(p1)?.expect("p1 stored").is_primary());

    check_cluster_invariants(store).map_err(anyhow::Error::msg)?;
    Ok(())
}

#[test]
fn bridge_repoints_secondaries_of_demoted_primary() -> anyhow::Result<()> {
    let service = Unicontact::new();
    let p1 = service
        .identify(request(Some("a@x.com"), Some("111")))?
        .contact
        .primary_contact_id;
    let p2 = service
        .identify(request(Some("b@x.com"), Some("222")))?
        .contact
        .primary_contact_id;
    let s2 = service
        .identify(request(Some("c@x.com"), Some("222")))?
        .contact
        .secondary_contact_ids[0];
    assert_eq!(
        service.store().get_contact(s2)?.expect("s2 stored").linked_id,
        Some(p2)
    );

    // Enters through the newer cluster's secondary.
    let response = service.identify(request(Some("c@x.com"), Some("111")))?;
    assert_eq!(response.contact.primary_contact_id, p1);
    assert_eq!(response.contact.emails, vec!["a@x.com", "b@x.com", "c@x.com"]);
    assert_eq!(response.contact.phone_numbers, vec!["111", "222"]);
    let ids = &response.contact.secondary_contact_ids;
    assert_eq!(ids.len(), 3);
    assert_eq!(ids[..2], [p2, s2]);

    for id in [p2, s2] {
        let contact = service.store().get_contact(id)?.expect("member stored");
        assert_eq!(contact.linked_id, Some(p1), "{id} must link to the survivor");
    }
    check_cluster_invariants(service.store()).map_err(anyhow::Error::msg)?;
    Ok(())
}

#[test]
fn bridge_of_three_clusters_keeps_depth_one() -> anyhow::Result<()> {
    let service = Unicontact::new();
    let first = service.identify(request(Some("a@x.com"), None))?;
    service.identify(request(None, Some("222")))?;
    service.identify(request(Some("c@x.com"), Some("333")))?;
    service.identify(request(Some("a@x.com"), Some("222")))?;

    let response = service.identify(request(Some("c@x.com"), Some("222")))?;
    assert_eq!(
        response.contact.primary_contact_id,
        first.contact.primary_contact_id
    );
    assert_eq!(response.contact.emails, vec!["a@x.com", "c@x.com"]);
    assert_eq!(response.contact.phone_numbers, vec!["222", "333"]);

    let contacts = service.store().all_contacts()?;
    let primaries = contacts.iter().filter(|contact| contact.is_primary()).count();
    assert_eq!(primaries, 1);
    for contact in &contacts {
        if let Some(linked) = contact.linked_id {
            let target = service.store().get_contact(linked)?.expect("target stored");
            assert!(target.is_primary(), "{} links to secondary {linked}", contact.id);
        }
    }
    Ok(())
}

#[test]
fn misranked_cluster_is_repaired() -> anyhow::Result<()> {
    // A secondary older than its primary is never produced by identify,
    // but a reconciling observation still restores the ordering.
    let store = Store::new();
    let older = seed_contact(&store, Some("old@x.com"), Some("111"), ContactLink::Primary)?;
    let newer = seed_contact(&store, Some("new@x.com"), Some("222"), ContactLink::Primary)?;
    {
        let mut txn = store.begin(&Default::default())?;
        txn.update(older.id, ContactLink::Secondary(newer.id))?;
        txn.commit()?;
    }

    let service = Unicontact::with_store(store);
    let response = service.identify(request(Some("new@x.com"), Some("333")))?;
    assert_eq!(response.contact.primary_contact_id, older.id);
    assert_eq!(response.contact.secondary_contact_ids[0], newer.id);
    check_cluster_invariants(service.store()).map_err(anyhow::Error::msg)?;
    Ok(())
}

#[test]
fn empty_strings_count_as_absent() -> anyhow::Result<()> {
    let service = Unicontact::new();
    let response = service.identify(request(Some(""), Some("111")))?;
    assert!(response.contact.emails.is_empty());
    assert_eq!(response.contact.phone_numbers, vec!["111"]);

    let err = service
        .identify(request(Some(""), Some("")))
        .expect_err("nothing identifying");
    assert!(matches!(
        err,
        ReconcileError::Validation(ValidationError::MissingIdentifier)
    ));
    Ok(())
}

/// Store that fails the test if it is touched at all.
struct UntouchableStore;

impl ContactStore for UntouchableStore {
    fn begin(
        &self,
        _scope: &unicontact_rs::lock::LockScope,
    ) -> unicontact_rs::error::StoreResult<Box<dyn ContactTxn + '_>> {
        panic!("store accessed during validation failure");
    }

    fn get_contact(
        &self,
        _id: ContactId,
    ) -> unicontact_rs::error::StoreResult<Option<unicontact_rs::Contact>> {
        panic!("store accessed during validation failure");
    }

    fn all_contacts(&self) -> unicontact_rs::error::StoreResult<Vec<unicontact_rs::Contact>> {
        panic!("store accessed during validation failure");
    }

    fn metrics(&self) -> StoreMetrics {
        StoreMetrics::default()
    }
}

#[test]
fn validation_fails_before_store_access() {
    let service = Unicontact::with_store(UntouchableStore);
    let err = service
        .identify(IdentifyRequest::default())
        .expect_err("empty request must be rejected");
    assert!(matches!(
        err,
        ReconcileError::Validation(ValidationError::MissingIdentifier)
    ));
}

#[test]
fn cluster_of_resolves_any_member() -> anyhow::Result<()> {
    let service = Unicontact::new();
    let first = service.identify(request(Some("a@x.com"), Some("111")))?;
    let second = service.identify(request(Some("b@x.com"), Some("111")))?;
    let secondary = second.contact.secondary_contact_ids[0];

    let view = service.cluster_of(secondary)?.expect("cluster exists");
    assert_eq!(view, second.contact);
    assert_eq!(
        service.cluster_of(first.contact.primary_contact_id)?,
        Some(second.contact)
    );
    assert_eq!(service.cluster_of(ContactId(999))?, None);
    Ok(())
}
