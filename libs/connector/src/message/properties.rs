//! Scoped message properties

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Property name carrying the remote-sync marker on inbound messages
pub const REMOTE_SYNC_PROPERTY: &str = "remote_sync";
pub const CORRELATION_ID_PROPERTY: &str = "correlation_id";
pub const CORRELATION_SEQUENCE_PROPERTY: &str = "correlation_sequence";
pub const CORRELATION_GROUP_SIZE_PROPERTY: &str = "correlation_group_size";
pub const REPLY_TO_PROPERTY: &str = "reply_to";

/// Visibility of a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyScope {
    /// Lives only for the current invocation
    Invocation,
    /// Set by the transport on arrival, read-only afterwards
    Inbound,
    /// Travels with the message when it leaves
    Outbound,
    /// Shared across the session
    Session,
}

impl PropertyScope {
    /// Lookup order used by unscoped reads
    pub const SEARCH_ORDER: [PropertyScope; 4] = [
        PropertyScope::Invocation,
        PropertyScope::Outbound,
        PropertyScope::Inbound,
        PropertyScope::Session,
    ];
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct ScopedProperties {
    invocation: HashMap<String, Value>,
    inbound: HashMap<String, Value>,
    outbound: HashMap<String, Value>,
    session: HashMap<String, Value>,
}

impl ScopedProperties {
    fn scope(&self, scope: PropertyScope) -> &HashMap<String, Value> {
        match scope {
            PropertyScope::Invocation => &self.invocation,
            PropertyScope::Inbound => &self.inbound,
            PropertyScope::Outbound => &self.outbound,
            PropertyScope::Session => &self.session,
        }
    }

    fn scope_mut(&mut self, scope: PropertyScope) -> &mut HashMap<String, Value> {
        match scope {
            PropertyScope::Invocation => &mut self.invocation,
            PropertyScope::Inbound => &mut self.inbound,
            PropertyScope::Outbound => &mut self.outbound,
            PropertyScope::Session => &mut self.session,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        PropertyScope::SEARCH_ORDER
            .iter()
            .find_map(|scope| self.scope(*scope).get(name))
    }

    pub fn get_in(&self, scope: PropertyScope, name: &str) -> Option<&Value> {
        self.scope(scope).get(name)
    }

    pub fn insert(&mut self, scope: PropertyScope, name: String, value: Value) -> Option<Value> {
        self.scope_mut(scope).insert(name, value)
    }

    /// Remove from every writable scope, returning the first value found
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let mut removed = None;
        for scope in [
            PropertyScope::Invocation,
            PropertyScope::Outbound,
            PropertyScope::Session,
        ] {
            if let Some(value) = self.scope_mut(scope).remove(name) {
                removed.get_or_insert(value);
            }
        }
        removed
    }

    pub fn names(&self, scope: PropertyScope) -> Vec<String> {
        let mut names: Vec<String> = self.scope(scope).keys().cloned().collect();
        names.sort();
        names
    }
}
