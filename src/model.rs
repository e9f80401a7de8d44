//! # Data Model
//!
//! Contacts, their link state, validated observations, and the wire shapes of
//! the identify exchange.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Store-assigned identifier for contacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(pub u32);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Role of a contact inside its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

/// The rewritable part of a contact.
///
/// Carrying the primary id inside `Secondary` keeps "linked id present iff
/// secondary" true for every value a caller can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContactLink {
    Primary,
    Secondary(ContactId),
}

impl ContactLink {
    pub fn precedence(&self) -> LinkPrecedence {
        match self {
            ContactLink::Primary => LinkPrecedence::Primary,
            ContactLink::Secondary(_) => LinkPrecedence::Secondary,
        }
    }

    pub fn linked_id(&self) -> Option<ContactId> {
        match self {
            ContactLink::Primary => None,
            ContactLink::Secondary(primary) => Some(*primary),
        }
    }
}

/// A stored contact record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
    /// Creation time in unix microseconds, strictly increasing per store.
    pub created_at: i64,
}

impl Contact {
    pub fn link(&self) -> ContactLink {
        match (self.link_precedence, self.linked_id) {
            (LinkPrecedence::Secondary, Some(primary)) => ContactLink::Secondary(primary),
            _ => ContactLink::Primary,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.link() == ContactLink::Primary
    }

    /// Id of the primary this contact hangs off (itself when primary).
    pub fn primary_id(&self) -> ContactId {
        self.link().linked_id().unwrap_or(self.id)
    }

    pub fn with_link(mut self, link: ContactLink) -> Self {
        self.link_precedence = link.precedence();
        self.linked_id = link.linked_id();
        self
    }

    /// Creation order. Ids only break ties on hand-seeded data.
    pub fn creation_key(&self) -> (i64, ContactId) {
        (self.created_at, self.id)
    }

    /// True when the contact shares the given email or phone number.
    pub fn matches(&self, email: Option<&str>, phone_number: Option<&str>) -> bool {
        let email_hit = email.is_some_and(|email| self.email.as_deref() == Some(email));
        let phone_hit =
            phone_number.is_some_and(|phone| self.phone_number.as_deref() == Some(phone));
        email_hit || phone_hit
    }

    pub fn identity_keys(&self) -> impl Iterator<Item = IdentityKey> + '_ {
        let email = self.email.iter().map(|email| IdentityKey::Email(email.clone()));
        let phone = self
            .phone_number
            .iter()
            .map(|phone| IdentityKey::Phone(phone.clone()));
        email.chain(phone)
    }
}

/// Sort contacts into creation order.
pub fn sort_by_creation(contacts: &mut [Contact]) {
    contacts.sort_by_key(Contact::creation_key);
}

/// Payload for a contact the store has not assigned an id to yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub link: ContactLink,
}

impl NewContact {
    pub fn primary(observation: &Observation) -> Self {
        Self {
            email: observation.email.clone(),
            phone_number: observation.phone_number.clone(),
            link: ContactLink::Primary,
        }
    }

    pub fn secondary(observation: &Observation, primary: ContactId) -> Self {
        Self {
            email: observation.email.clone(),
            phone_number: observation.phone_number.clone(),
            link: ContactLink::Secondary(primary),
        }
    }

    pub fn into_contact(self, id: ContactId, created_at: i64) -> Contact {
        Contact {
            id,
            email: self.email,
            phone_number: self.phone_number,
            linked_id: self.link.linked_id(),
            link_precedence: self.link.precedence(),
            created_at,
        }
    }
}

/// An exact-match identifying value. Lock scopes are sets of these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdentityKey {
    Email(String),
    Phone(String),
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::Email(email) => write!(f, "email:{email}"),
            IdentityKey::Phone(phone) => write!(f, "phone:{phone}"),
        }
    }
}

/// A validated (email, phone) observation. At least one field is present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Observation {
    email: Option<String>,
    phone_number: Option<String>,
}

impl Observation {
    /// Empty strings count as absent.
    pub fn new(
        email: Option<String>,
        phone_number: Option<String>,
    ) -> Result<Self, ValidationError> {
        let email = email.filter(|email| !email.is_empty());
        let phone_number = phone_number.filter(|phone| !phone.is_empty());
        if email.is_none() && phone_number.is_none() {
            return Err(ValidationError::MissingIdentifier);
        }
        Ok(Self {
            email,
            phone_number,
        })
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }

    pub fn identity_keys(&self) -> impl Iterator<Item = IdentityKey> + '_ {
        let email = self.email.iter().map(|email| IdentityKey::Email(email.clone()));
        let phone = self
            .phone_number
            .iter()
            .map(|phone| IdentityKey::Phone(phone.clone()));
        email.chain(phone)
    }
}

impl TryFrom<IdentifyRequest> for Observation {
    type Error = ValidationError;

    fn try_from(request: IdentifyRequest) -> Result<Self, Self::Error> {
        Observation::new(request.email, request.phone_number)
    }
}

/// Inbound identify body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

impl IdentifyRequest {
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Self {
        Self {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
        }
    }
}

/// Consolidated projection of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactView {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

/// Outbound identify body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub contact: ContactView,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(id: u32, link: ContactLink) -> Contact {
        NewContact {
            email: Some("a@x.com".to_string()),
            phone_number: None,
            link,
        }
        .into_contact(ContactId(id), i64::from(id))
    }

    #[test]
    fn observation_requires_an_identifier() {
        assert_eq!(
            Observation::new(None, None),
            Err(ValidationError::MissingIdentifier)
        );
        assert_eq!(
            Observation::new(Some(String::new()), Some(String::new())),
            Err(ValidationError::MissingIdentifier)
        );
    }

    #[test]
    fn empty_field_is_dropped() {
        let observation = Observation::new(Some(String::new()), Some("111".to_string())).unwrap();
        assert_eq!(observation.email(), None);
        assert_eq!(observation.phone_number(), Some("111"));
    }

    #[test]
    fn secondary_resolves_to_its_primary() {
        let primary = contact(1, ContactLink::Primary);
        let secondary = contact(2, ContactLink::Secondary(ContactId(1)));
        assert_eq!(primary.primary_id(), ContactId(1));
        assert_eq!(secondary.primary_id(), ContactId(1));
        assert_eq!(secondary.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(secondary.linked_id, Some(ContactId(1)));
    }

    #[test]
    fn with_link_rewrites_both_fields() {
        let demoted = contact(3, ContactLink::Primary).with_link(ContactLink::Secondary(ContactId(1)));
        assert_eq!(demoted.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(demoted.linked_id, Some(ContactId(1)));

        let promoted = demoted.with_link(ContactLink::Primary);
        assert!(promoted.is_primary());
        assert_eq!(promoted.linked_id, None);
    }

    #[test]
    fn absent_fields_never_match() {
        let record = NewContact {
            email: None,
            phone_number: Some("222".to_string()),
            link: ContactLink::Primary,
        }
        .into_contact(ContactId(1), 1);
        assert!(!record.matches(None, None));
        assert!(!record.matches(Some("a@x.com"), None));
        assert!(record.matches(Some("a@x.com"), Some("222")));
    }

    #[test]
    fn request_uses_camel_case_wire_names() {
        let request: IdentifyRequest =
            serde_json::from_str(r#"{"email":null,"phoneNumber":"123"}"#).unwrap();
        assert_eq!(request, IdentifyRequest::new(None, Some("123")));

        let view = ContactView {
            primary_contact_id: ContactId(1),
            emails: vec!["a@x.com".to_string()],
            phone_numbers: Vec::new(),
            secondary_contact_ids: vec![ContactId(2)],
        };
        let json = serde_json::to_value(IdentifyResponse { contact: view }).unwrap();
        assert_eq!(json["contact"]["primaryContactId"], 1);
        assert_eq!(json["contact"]["secondaryContactIds"][0], 2);
        assert!(json["contact"]["phoneNumbers"].as_array().unwrap().is_empty());
    }

    #[test]
    fn precedence_serializes_lowercase() {
        let json = serde_json::to_string(&LinkPrecedence::Secondary).unwrap();
        assert_eq!(json, "\"secondary\"");
    }
}
