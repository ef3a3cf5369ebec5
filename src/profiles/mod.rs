//! User/profile lookups against the portal's profile records.
//!
//! The messaging core only ever needs a display name and a role. Identities
//! from verified tokens are remembered in-process; anything else is asked of
//! the profile REST service when one is configured.

mod http;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub use http::HttpProfiles;

use crate::{
    auth::Identity,
    db::Role,
    error::{ChatError, ChatResult},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub display_name: String,
    pub role: Role,
}

#[async_trait]
pub trait ProfileLookup: Send + Sync {
    /// Fails with `RecipientLookupFailed`; callers degrade to the raw id.
    async fn get_user_by_id(&self, user_id: &str) -> ChatResult<Profile>;
}

#[derive(Clone, Default)]
pub struct ProfileDirectory {
    known: Arc<DashMap<String, Profile>>,
    remote: Option<HttpProfiles>,
}

impl ProfileDirectory {
    pub fn new(remote: Option<HttpProfiles>) -> Self {
        Self {
            known: Arc::new(DashMap::new()),
            remote,
        }
    }

    pub fn remember(&self, identity: &Identity) {
        self.known.insert(
            identity.user_id.clone(),
            Profile {
                display_name: identity.display_name.clone(),
                role: identity.role,
            },
        );
    }
}

#[async_trait]
impl ProfileLookup for ProfileDirectory {
    async fn get_user_by_id(&self, user_id: &str) -> ChatResult<Profile> {
        if let Some(profile) = self.known.get(user_id) {
            return Ok(profile.clone());
        }

        let Some(remote) = &self.remote else {
            return Err(ChatError::RecipientLookupFailed {
                user_id: user_id.to_owned(),
                reason: "no profile source".to_owned(),
            });
        };

        let profile = remote.fetch(user_id).await?;
        debug!(user_id, "profile fetched");
        self.known.insert(user_id.to_owned(), profile.clone());
        Ok(profile)
    }
}

/// Display name for `user_id`, or the id itself when the lookup fails.
pub async fn display_name_or_id(profiles: &dyn ProfileLookup, user_id: &str) -> String {
    match profiles.get_user_by_id(user_id).await {
        Ok(profile) => profile.display_name,
        Err(e) => {
            debug!(user_id, error = %e, "falling back to raw id");
            user_id.to_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remembers_verified_identities() {
        let profiles = ProfileDirectory::new(None);
        profiles.remember(&Identity {
            user_id: "d1".to_owned(),
            display_name: "Dr. Grey".to_owned(),
            role: Role::Doctor,
        });

        let profile = profiles.get_user_by_id("d1").await.unwrap();
        assert_eq!(profile.display_name, "Dr. Grey");
        assert_eq!(profile.role, Role::Doctor);
    }

    #[tokio::test]
    async fn unknown_user_without_remote_fails_softly() {
        let profiles = ProfileDirectory::new(None);
        assert!(matches!(
            profiles.get_user_by_id("ghost").await,
            Err(ChatError::RecipientLookupFailed { .. })
        ));
        assert_eq!(display_name_or_id(&profiles, "ghost").await, "ghost");
    }
}
