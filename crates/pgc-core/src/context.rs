//! Request contexts and their conversion into ground facts
//!
//! A context carries four attribute groups. Each non-empty group yields one
//! identity fact `<group>(<identifier>)` and one attribute fact per
//! attribute, the identifier attribute included. Subject attributes use
//! `has<Attribute>`; the other groups prefix the predicate with the group
//! name, so an attribute can only ever satisfy conditions on its own group:
//!
//! ```text
//! {"user": {"id": "alice", "role": "admin"}, "resource": {"id": "doc1", "owner": "alice"}}
//!   => user("alice").  hasId("alice", "alice").  hasRole("alice", "admin").
//!      resource("doc1").  resourceHasId("doc1", "doc1").  resourceHasOwner("doc1", "alice").
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::term::{Atom, Term, Value};

/// A flat mapping of attribute name to scalar value
pub type AttributeGroup = BTreeMap<String, serde_json::Value>;

/// Attribute keys that name the group's identifier, in priority order
const IDENTIFIER_KEYS: [&str; 3] = ["id", "type", "name"];

/// Errors raised while turning a context into facts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("attribute '{group}.{attribute}' is not a scalar value")]
    NonScalar { group: String, attribute: String },

    #[error("attribute name in group '{group}' is empty or not alphanumeric: '{attribute}'")]
    InvalidAttribute { group: String, attribute: String },

    #[error("group '{0}' has no identifier (expected one of id, type, name)")]
    MissingIdentifier(String),
}

/// Caller-supplied attributes describing one authorization request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    /// Caller-assigned request id (excluded from fingerprints)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Subject attributes
    #[serde(default, alias = "subject")]
    pub user: AttributeGroup,

    /// Resource attributes
    #[serde(default)]
    pub resource: AttributeGroup,

    /// Action attributes
    #[serde(default)]
    pub action: AttributeGroup,

    /// Environment attributes
    #[serde(default)]
    pub environment: AttributeGroup,
}

/// Attribute groups only, serialized for fingerprinting
#[derive(Serialize)]
struct FingerprintView<'a> {
    user: &'a AttributeGroup,
    resource: &'a AttributeGroup,
    action: &'a AttributeGroup,
    environment: &'a AttributeGroup,
}

impl RequestContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request id
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Set a user attribute
    pub fn with_user(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.user.insert(key.into(), value.into());
        self
    }

    /// Set a resource attribute
    pub fn with_resource(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.resource.insert(key.into(), value.into());
        self
    }

    /// Set an action attribute
    pub fn with_action(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.action.insert(key.into(), value.into());
        self
    }

    /// Set an environment attribute
    pub fn with_environment(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Attribute groups paired with their fact predicate names
    pub fn groups(&self) -> [(&'static str, &AttributeGroup); 4] {
        [
            ("user", &self.user),
            ("resource", &self.resource),
            ("action", &self.action),
            ("environment", &self.environment),
        ]
    }

    /// Deterministically convert the context into ground facts
    pub fn to_facts(&self) -> Result<Vec<Atom>, ContextError> {
        let mut facts = Vec::new();

        for (group_name, group) in self.groups() {
            if group.is_empty() {
                continue;
            }

            let identifier = group_identifier(group_name, group)?
                .map(|(_, value)| value)
                .unwrap_or_else(|| Value::string(group_name));

            facts.push(Atom::fact(group_name, vec![identifier.clone()]));

            for (attribute, raw) in group {
                let value = scalar(group_name, attribute, raw)?;
                facts.push(Atom::new(
                    attribute_predicate(group_name, attribute)?,
                    vec![Term::Const(identifier.clone()), Term::Const(value)],
                ));
            }
        }

        Ok(facts)
    }

    /// Identifiers of the subject, action and resource, in that order
    pub fn target_triple(&self) -> Result<[Value; 3], ContextError> {
        let require = |name: &str, group: &AttributeGroup| {
            group_identifier(name, group)?
                .map(|(_, value)| value)
                .ok_or_else(|| ContextError::MissingIdentifier(name.to_string()))
        };

        Ok([
            require("user", &self.user)?,
            require("action", &self.action)?,
            require("resource", &self.resource)?,
        ])
    }

    /// Check that every attribute converts into a fact
    pub fn validate(&self) -> Result<(), ContextError> {
        self.to_facts().map(|_| ())
    }

    /// Canonical JSON of the attribute groups, excluding the request id
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&FingerprintView {
            user: &self.user,
            resource: &self.resource,
            action: &self.action,
            environment: &self.environment,
        })
    }
}

fn group_identifier<'a>(
    group_name: &str,
    group: &'a AttributeGroup,
) -> Result<Option<(&'a str, Value)>, ContextError> {
    for key in IDENTIFIER_KEYS {
        if let Some((k, raw)) = group.get_key_value(key) {
            return Ok(Some((k.as_str(), scalar(group_name, key, raw)?)));
        }
    }
    Ok(None)
}

fn scalar(group: &str, attribute: &str, raw: &serde_json::Value) -> Result<Value, ContextError> {
    Value::from_json(raw).ok_or_else(|| ContextError::NonScalar {
        group: group.to_string(),
        attribute: attribute.to_string(),
    })
}

/// Predicate carrying `attribute` of `group`
///
/// `("user", "clearance_level")` => `hasClearanceLevel`,
/// `("resource", "owner")` => `resourceHasOwner`
pub fn attribute_predicate(group: &str, attribute: &str) -> Result<String, ContextError> {
    let mut predicate = match group {
        "user" => String::from("has"),
        other => format!("{}Has", other),
    };
    let mut any = false;

    for part in attribute.split(|c: char| c == '_' || c == '-' || c == '.' || c == ' ') {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            if !part.chars().all(|c| c.is_ascii_alphanumeric()) {
                break;
            }
            predicate.extend(first.to_uppercase());
            predicate.push_str(chars.as_str());
            any = true;
        }
    }

    let valid = any
        && attribute
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ' '));
    if !valid {
        return Err(ContextError::InvalidAttribute {
            group: group.to_string(),
            attribute: attribute.to_string(),
        });
    }

    Ok(predicate)
}
