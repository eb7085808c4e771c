//! External Collaborator Seams
//!
//! The relay core authorizes tokens, reads quota limits, and resolves
//! subscription edges through these traits. Production deployments back
//! them with a real store; the in-memory implementations here serve tests
//! and single-process deployments seeded from a JSON file.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use serde::Deserialize;
use uuid::Uuid;

use crate::quota::QuotaConfig;

/// Resolves tokens to identities and identities to quota limits.
///
/// The relay never mints tokens; it only authorizes connections that
/// present one.
pub trait CredentialStore: Send + Sync {
    /// Resolve a token string to the identity it was issued for.
    fn resolve_token(&self, token: &str) -> Option<Uuid>;

    /// Quota limits for an identity. Identities without an explicit
    /// configuration get the store's defaults.
    fn quota_config(&self, identity: Uuid) -> QuotaConfig;
}

/// Persists subscription edges (subscriber, target) and answers fanout
/// queries.
pub trait SubscriptionStore: Send + Sync {
    /// Insert an edge; inserting an existing edge is a no-op.
    fn add_edge(&self, subscriber: Uuid, target: Uuid);

    /// Remove an edge; removing a missing edge is a no-op.
    fn remove_edge(&self, subscriber: Uuid, target: Uuid);

    /// All identities subscribed to `target`, in stable order.
    fn subscribers_of(&self, target: Uuid) -> Vec<Uuid>;
}

// =============================================================================
// IN-MEMORY IMPLEMENTATIONS
// =============================================================================

/// Seed file layout for [`MemoryCredentialStore::from_json`].
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CredentialFile {
    /// Limits applied to identities without an override.
    default_quota: Option<QuotaConfig>,
    /// Token string -> identity.
    tokens: BTreeMap<String, Uuid>,
    /// Per-identity quota overrides.
    quotas: BTreeMap<Uuid, QuotaConfig>,
}

/// Credential store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    default_quota: QuotaConfig,
    tokens: RwLock<BTreeMap<String, Uuid>>,
    quotas: RwLock<BTreeMap<Uuid, QuotaConfig>>,
}

impl MemoryCredentialStore {
    /// Create an empty store with the given default limits.
    pub fn new(default_quota: QuotaConfig) -> Self {
        Self {
            default_quota,
            ..Self::default()
        }
    }

    /// Load tokens and quota overrides from a JSON document:
    ///
    /// ```json
    /// {
    ///   "defaultQuota": { "pingRate": 32, "pingSize": 1024 },
    ///   "tokens": { "tok-123": "9f61f06b-..." },
    ///   "quotas": { "9f61f06b-...": { "pingRate": 64, "pingSize": 4096 } }
    /// }
    /// ```
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let file: CredentialFile = serde_json::from_str(json)?;
        let store = Self::new(file.default_quota.unwrap_or_default());
        {
            let mut tokens = store.tokens.write().unwrap_or_else(|e| e.into_inner());
            *tokens = file.tokens;
            let mut quotas = store.quotas.write().unwrap_or_else(|e| e.into_inner());
            *quotas = file.quotas;
        }
        Ok(store)
    }

    /// Register a token for an identity, replacing any prior binding of the
    /// same token string.
    pub fn insert_token(&self, token: impl Into<String>, identity: Uuid) {
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        tokens.insert(token.into(), identity);
    }

    /// Remove a token.
    pub fn revoke_token(&self, token: &str) {
        let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
        tokens.remove(token);
    }

    /// Override quota limits for one identity.
    pub fn set_quota(&self, identity: Uuid, quota: QuotaConfig) {
        let mut quotas = self.quotas.write().unwrap_or_else(|e| e.into_inner());
        quotas.insert(identity, quota);
    }

    /// Number of registered tokens.
    pub fn token_count(&self) -> usize {
        let tokens = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        tokens.len()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn resolve_token(&self, token: &str) -> Option<Uuid> {
        let tokens = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        tokens.get(token).copied()
    }

    fn quota_config(&self, identity: Uuid) -> QuotaConfig {
        let quotas = self.quotas.read().unwrap_or_else(|e| e.into_inner());
        quotas.get(&identity).copied().unwrap_or(self.default_quota)
    }
}

/// Subscription store backed by process memory: target -> ordered set of
/// subscribers.
#[derive(Debug, Default)]
pub struct MemorySubscriptionStore {
    edges: RwLock<BTreeMap<Uuid, BTreeSet<Uuid>>>,
}

impl MemorySubscriptionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of edges across all targets.
    pub fn edge_count(&self) -> usize {
        let edges = self.edges.read().unwrap_or_else(|e| e.into_inner());
        edges.values().map(BTreeSet::len).sum()
    }
}

impl SubscriptionStore for MemorySubscriptionStore {
    fn add_edge(&self, subscriber: Uuid, target: Uuid) {
        let mut edges = self.edges.write().unwrap_or_else(|e| e.into_inner());
        edges.entry(target).or_default().insert(subscriber);
    }

    fn remove_edge(&self, subscriber: Uuid, target: Uuid) {
        let mut edges = self.edges.write().unwrap_or_else(|e| e.into_inner());
        if let Some(subscribers) = edges.get_mut(&target) {
            subscribers.remove(&subscriber);
            if subscribers.is_empty() {
                edges.remove(&target);
            }
        }
    }

    fn subscribers_of(&self, target: Uuid) -> Vec<Uuid> {
        let edges = self.edges.read().unwrap_or_else(|e| e.into_inner());
        edges
            .get(&target)
            .map(|subscribers| subscribers.iter().copied().collect())
            .unwrap_or_default()
    }
}
