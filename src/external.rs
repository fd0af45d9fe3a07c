//! Interfaces to collaborators that live outside the orchestration engine:
//! identity resolution and object storage. The engine only depends on these
//! traits; deployments wire concrete backends.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
    Service,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
    pub active: bool,
}

impl Identity {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::User,
            active: true,
        }
    }

    pub fn service() -> Self {
        Self {
            user_id: "service".to_string(),
            role: Role::Service,
            active: true,
        }
    }

    /// Whether this identity may read records owned by `owner`.
    /// An inactive identity can see nothing, same as an unknown one.
    pub fn can_view(&self, owner: &str) -> bool {
        if !self.active {
            return false;
        }
        matches!(self.role, Role::Admin | Role::Service) || self.user_id == owner
    }
}

/// Resolves a bearer credential to an identity.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn resolve(&self, bearer: &str) -> Option<Identity>;
}

/// Token-table authenticator for tests and single-tenant deployments.
#[derive(Default)]
pub struct StaticAuthenticator {
    tokens: HashMap<String, Identity>,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn resolve(&self, bearer: &str) -> Option<Identity> {
        // Inactive identities are indistinguishable from unknown tokens.
        self.tokens.get(bearer).filter(|i| i.active).cloned()
    }
}

/// A stored binary asset addressable by a stable URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAsset {
    pub url: String,
    pub object_key: String,
}

/// Persists provider-returned binary assets as stable URLs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, content_type: &str) -> Result<StoredAsset>;
}

/// In-memory object store; used by tests and as a placeholder backend.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn upload(&self, bytes: Vec<u8>, content_type: &str) -> Result<StoredAsset> {
        let ext = content_type.rsplit('/').next().unwrap_or("bin");
        let object_key = format!("{}.{}", Uuid::new_v4(), ext);
        self.objects.lock().insert(object_key.clone(), bytes);
        Ok(StoredAsset {
            url: format!("mem://{object_key}"),
            object_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inactive_identity_resolves_to_none() {
        let auth = StaticAuthenticator::new().with_token(
            "tok",
            Identity {
                user_id: "u1".to_string(),
                role: Role::User,
                active: false,
            },
        );
        assert!(auth.resolve("tok").await.is_none());
    }

    #[test]
    fn test_admin_sees_foreign_records() {
        let admin = Identity {
            user_id: "a".to_string(),
            role: Role::Admin,
            active: true,
        };
        assert!(admin.can_view("someone-else"));
        assert!(!Identity::user("u1").can_view("u2"));
    }
}
