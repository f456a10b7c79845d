//! On-disk token storage: one JSON file per profile and client id under
//! `~/.octofhir/tokens/`.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use octofhir_smart_client::{
    HttpClient, SmartClientConfig, SmartError, Token, TokenPersistence, TokenStore,
};

/// Opens the token store for a profile's client, backed by the token files.
///
/// Returns `None` when the profile has no `auth.client_id`.
pub fn open_token_store(
    http: Arc<dyn HttpClient>,
    auth: &SmartClientConfig,
    profile: &str,
) -> Result<Option<TokenStore>> {
    if auth.client_id.trim().is_empty() {
        return Ok(None);
    }
    let persistence = Arc::new(FileTokenPersistence::for_profile(profile)?);
    let store = TokenStore::builder(auth.client_id.clone(), http)
        .client_secret(auth.client_secret.clone())
        .context_field(auth.context_field.clone())
        .leeway(auth.token_expiry_leeway)
        .persistence(persistence)
        .build();
    Ok(Some(store))
}

pub struct FileTokenPersistence {
    dir: PathBuf,
    profile: String,
}

impl FileTokenPersistence {
    pub fn new(dir: PathBuf, profile: &str) -> Self {
        Self {
            dir,
            profile: profile.to_string(),
        }
    }

    /// Storage under `~/.octofhir/tokens`.
    pub fn for_profile(profile: &str) -> Result<Self> {
        Ok(Self::new(crate::config::config_dir()?.join("tokens"), profile))
    }

    fn path(&self, client_id: &str) -> PathBuf {
        let safe_id: String = client_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.{safe_id}.json", self.profile))
    }
}

#[async_trait]
impl TokenPersistence for FileTokenPersistence {
    async fn load(&self, client_id: &str) -> Result<Option<Token>, SmartError> {
        let path = self.path(client_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SmartError::persistence(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| {
                SmartError::persistence(format!("Invalid token file {}: {e}", path.display()))
            })
    }

    async fn save(&self, client_id: &str, token: &Token) -> Result<(), SmartError> {
        let path = self.path(client_id);
        let content = serde_json::to_string_pretty(token)
            .map_err(|e| SmartError::persistence(e.to_string()))?;

        let write_error = |e: std::io::Error| {
            SmartError::persistence(format!("Failed to write {}: {e}", path.display()))
        };
        tokio::fs::create_dir_all(&self.dir).await.map_err(write_error)?;
        tokio::fs::write(&path, content).await.map_err(write_error)?;
        tracing::debug!("Saved token to {}", path.display());
        Ok(())
    }

    async fn remove(&self, client_id: &str) -> Result<(), SmartError> {
        let path = self.path(client_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SmartError::persistence(format!(
                "Failed to remove {}: {e}",
                path.display()
            ))),
        }
    }
}
