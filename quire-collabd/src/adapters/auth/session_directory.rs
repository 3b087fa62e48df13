use crate::domain::session::{ProjectId, SocketId, Uid, UserId};
use crate::ports::auth::{AuthRequest, Authenticator};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::debug;

/// Session hash issued by the web tier, bound to a user and project.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrant {
    pub session_hash: String,
    pub user_id: UserId,
    pub project_id: ProjectId,
}

#[derive(Default)]
pub struct SessionDirectory {
    grants: RwLock<HashMap<String, SessionGrant>>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_grants(grants: impl IntoIterator<Item = SessionGrant>) -> Self {
        let grants = grants
            .into_iter()
            .map(|grant| (grant.session_hash.clone(), grant))
            .collect();
        Self {
            grants: RwLock::new(grants),
        }
    }

    /// Loads a JSON array of grants; a missing or empty file yields an empty directory.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = std::fs::read(path)
            .with_context(|| format!("reading session directory {}", path.display()))?;
        if data.is_empty() {
            return Ok(Self::new());
        }
        let grants: Vec<SessionGrant> = serde_json::from_slice(&data)
            .with_context(|| format!("parsing session directory {}", path.display()))?;
        Ok(Self::from_grants(grants))
    }

    pub async fn insert(&self, grant: SessionGrant) {
        self.grants
            .write()
            .await
            .insert(grant.session_hash.clone(), grant);
    }

    pub async fn revoke(&self, session_hash: &str) -> bool {
        self.grants.write().await.remove(session_hash).is_some()
    }

    pub async fn grant_count(&self) -> usize {
        self.grants.read().await.len()
    }
}

#[async_trait]
impl Authenticator for SessionDirectory {
    async fn authorize(
        &self,
        request: &AuthRequest,
        socket_id: &SocketId,
    ) -> anyhow::Result<Option<Uid>> {
        let grants = self.grants.read().await;
        let Some(grant) = grants.get(&request.session_hash) else {
            debug!(socket = %socket_id, "unknown session hash");
            return Ok(None);
        };
        Ok(Some(Uid::new(
            grant.user_id.clone(),
            grant.project_id.clone(),
            Some(socket_id.clone()),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn request(hash: &str) -> AuthRequest {
        AuthRequest {
            session_hash: hash.to_string(),
            ..AuthRequest::default()
        }
    }

    #[tokio::test]
    async fn known_hash_resolves_to_socket_scoped_uid() {
        let directory = SessionDirectory::from_grants([SessionGrant {
            session_hash: "abc".into(),
            user_id: UserId::new("u1").unwrap(),
            project_id: ProjectId::new("p1").unwrap(),
        }]);
        let socket = SocketId::new("s1").unwrap();
        let uid = directory
            .authorize(&request("abc"), &socket)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(uid.to_string(), "u1_p1_s1");
        assert!(directory
            .authorize(&request("nope"), &socket)
            .await
            .unwrap()
            .is_none());

        assert!(directory.revoke("abc").await);
        assert!(directory
            .authorize(&request("abc"), &socket)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn loads_grants_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"sessionHash": "abc", "userId": "u1", "projectId": "p1"}}]"#
        )
        .unwrap();
        file.flush().unwrap();
        let directory = SessionDirectory::from_file(file.path()).unwrap();
        assert_eq!(directory.grant_count().await, 1);
    }

    #[test]
    fn rejects_invalid_grants() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"sessionHash": "abc", "userId": "bad_user", "projectId": "p1"}}]"#
        )
        .unwrap();
        file.flush().unwrap();
        assert!(SessionDirectory::from_file(file.path()).is_err());
    }

    #[test]
    fn missing_file_is_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SessionDirectory::from_file(&dir.path().join("absent.json")).is_ok());
    }
}
