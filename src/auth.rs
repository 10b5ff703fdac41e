//! Authorization port
//!
//! The identity provider lives outside this crate; callers arrive with a
//! verified actor id. Roles are plain data on the user profile, and role
//! mutation is a privileged, audited operation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::model::{paths, AuditEntry, Role, UserProfile};
use crate::store::{get_doc, DocumentStore, Precondition, Snapshot, Write};

#[async_trait]
pub trait AuthPort: Send + Sync {
    async fn roles_of(&self, actor_id: &str) -> EngineResult<Vec<Role>>;
}

/// Load the acting user's profile, mapping an empty id to Unauthenticated
/// and a missing profile to NotFound.
pub async fn require_user(
    store: &dyn DocumentStore,
    actor_id: &str,
) -> EngineResult<Snapshot<UserProfile>> {
    if actor_id.is_empty() {
        return Err(EngineError::Unauthenticated);
    }
    get_doc::<UserProfile>(store, &paths::user(actor_id))
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("user {}", actor_id)))
}

/// Role source backed by the user profile documents.
pub struct StoreAuth {
    store: Arc<dyn DocumentStore>,
}

impl StoreAuth {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Privileged role mutation, audited in the same commit.
    pub async fn grant_role(
        &self,
        granter: &UserProfile,
        target_id: &str,
        role: Role,
    ) -> EngineResult<()> {
        if !granter.has_role(Role::Admin) {
            return Err(EngineError::PermissionDenied(
                "role grants require an admin role".into(),
            ));
        }

        let snap = require_user(self.store.as_ref(), target_id).await?;
        let mut profile = snap.doc;
        if profile.roles.contains(&role) {
            return Ok(());
        }
        profile.roles.push(role);

        let audit = AuditEntry::new(
            &granter.id,
            "grant_role",
            &paths::user(target_id),
            format!("{:?}", role),
        );
        self.store
            .commit(vec![
                Write::put(
                    paths::user(target_id),
                    Precondition::Revision(snap.revision),
                    &profile,
                )?,
                Write::put(paths::audit(&audit.id), Precondition::NotExists, &audit)?,
            ])
            .await?;

        info!("granted {:?} to {}", role, target_id);
        Ok(())
    }
}

#[async_trait]
impl AuthPort for StoreAuth {
    async fn roles_of(&self, actor_id: &str) -> EngineResult<Vec<Role>> {
        Ok(require_user(self.store.as_ref(), actor_id).await?.doc.roles)
    }
}
