use crate::client::{OAuth2Token, TokenProvider};
use crate::error::{IngestError, Result};
use async_trait::async_trait;
use std::fs;
use std::path::PathBuf;

const OAUTH2_FILENAME: &str = "oauth2_token.json";
const DEFAULT_PROFILE: &str = "default";

/// Reads OAuth2 tokens from per-profile directories.
///
/// In single-user mode the configured profile (or `default`) is used; in
/// multi-user mode each identity is its own profile directory.
pub struct FileTokenStore {
    base_dir: PathBuf,
    default_profile: String,
}

impl FileTokenStore {
    /// Token store under the platform data directory
    pub fn new(profile: Option<String>) -> Result<Self> {
        Ok(Self::with_dir(super::data_dir()?, profile))
    }

    /// Token store with a custom base directory (for testing)
    pub fn with_dir(base_dir: PathBuf, profile: Option<String>) -> Self {
        Self {
            base_dir,
            default_profile: profile.unwrap_or_else(|| DEFAULT_PROFILE.to_string()),
        }
    }

    fn token_path(&self, owner: Option<&str>) -> PathBuf {
        let profile = owner.unwrap_or(&self.default_profile);
        self.base_dir.join(profile).join(OAUTH2_FILENAME)
    }

    /// Save an OAuth2 token for a profile
    pub fn save(&self, owner: Option<&str>, token: &OAuth2Token) -> Result<()> {
        let path = self.token_path(owner);
        if let Some(parent) = path.parent() {
            super::ensure_dir(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(token)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Load the OAuth2 token for a profile, if present
    pub fn load(&self, owner: Option<&str>) -> Result<Option<OAuth2Token>> {
        let path = self.token_path(owner);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)?;
        let token = serde_json::from_str(&json)
            .map_err(|e| IngestError::auth(format!("unreadable token file {}: {}", path.display(), e)))?;
        Ok(Some(token))
    }
}

#[async_trait]
impl TokenProvider for FileTokenStore {
    async fn token(&self, owner: Option<&str>) -> Result<OAuth2Token> {
        let profile = owner.unwrap_or(&self.default_profile).to_string();
        let token = self
            .load(owner)?
            .ok_or_else(|| IngestError::auth(format!("no stored token for profile {}", profile)))?;
        if token.is_expired() {
            return Err(IngestError::auth(format!("token for profile {} has expired", profile)));
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn valid_token(access: &str) -> OAuth2Token {
        OAuth2Token {
            expires_at: Utc::now().timestamp() + 3600,
            ..OAuth2Token::bearer(access)
        }
    }

    #[tokio::test]
    async fn test_save_and_load_per_profile() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileTokenStore::with_dir(temp_dir.path().to_path_buf(), None);

        store.save(None, &valid_token("mine")).unwrap();
        store.save(Some("alice"), &valid_token("hers")).unwrap();

        assert_eq!(store.token(None).await.unwrap().access_token, "mine");
        assert_eq!(store.token(Some("alice")).await.unwrap().access_token, "hers");
        assert!(temp_dir.path().join("default").join(OAUTH2_FILENAME).exists());
    }

    #[tokio::test]
    async fn test_missing_token_is_auth_failure() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileTokenStore::with_dir(temp_dir.path().to_path_buf(), Some("work".into()));
        assert!(store.load(None).unwrap().is_none());
        let err = store.token(None).await.unwrap_err();
        assert!(matches!(err, IngestError::AuthFailure(_)));
        assert!(err.to_string().contains("work"));
    }

    #[tokio::test]
    async fn test_expired_token_is_auth_failure() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileTokenStore::with_dir(temp_dir.path().to_path_buf(), None);
        let expired = OAuth2Token {
            expires_at: 1,
            ..OAuth2Token::bearer("old")
        };
        store.save(None, &expired).unwrap();
        assert!(matches!(store.token(None).await, Err(IngestError::AuthFailure(_))));
    }
}
