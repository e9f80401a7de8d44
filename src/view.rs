//! Projection of a materialized cluster into the consolidated contact view.

use crate::error::{StoreError, StoreResult};
use crate::model::{sort_by_creation, Contact, ContactView};
use std::collections::HashSet;

/// Distinct values in first-seen order.
#[derive(Debug, Default)]
struct FirstSeen {
    values: Vec<String>,
    seen: HashSet<String>,
}

impl FirstSeen {
    fn push(&mut self, value: Option<&str>) {
        if let Some(value) = value {
            if self.seen.insert(value.to_string()) {
                self.values.push(value.to_string());
            }
        }
    }
}

/// Build the view of `cluster`: the primary's values first, then each
/// secondary's in creation order, every value at most once.
pub fn assemble(cluster: &[Contact]) -> StoreResult<ContactView> {
    let primary = cluster
        .iter()
        .find(|contact| contact.is_primary())
        .ok_or_else(|| StoreError::Corrupt("cluster has no primary contact".to_string()))?;

    let mut secondaries: Vec<Contact> = cluster
        .iter()
        .filter(|contact| contact.id != primary.id)
        .cloned()
        .collect();
    sort_by_creation(&mut secondaries);

    let mut emails = FirstSeen::default();
    let mut phone_numbers = FirstSeen::default();
    for contact in std::iter::once(primary).chain(secondaries.iter()) {
        emails.push(contact.email.as_deref());
        phone_numbers.push(contact.phone_number.as_deref());
    }

    Ok(ContactView {
        primary_contact_id: primary.id,
        emails: emails.values,
        phone_numbers: phone_numbers.values,
        secondary_contact_ids: secondaries.iter().map(|contact| contact.id).collect(),
    })
}
