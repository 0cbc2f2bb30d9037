//! Mapping profile persistence
//!
//! The engine treats the profile as an injected value. `ProfileStore` is the
//! boundary to wherever administrators keep it; `JsonFileProfileStore` keeps
//! one `<partner_id>.json` document per partner in a directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::types::MappingProfile;

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// `None` when no profile was saved for the partner yet
    async fn load(&self, partner_id: &str) -> Result<Option<MappingProfile>>;

    /// Validates before writing; an invalid profile is never persisted
    async fn save(&self, profile: &MappingProfile) -> Result<()>;
}

pub struct JsonFileProfileStore {
    dir: PathBuf,
}

impl JsonFileProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, partner_id: &str) -> PathBuf {
        let file_name: String = partner_id
            .trim()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }

    /// Read a profile document from an explicit path
    pub async fn read_file(path: &Path) -> Result<MappingProfile> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read mapping profile {}", path.display()))?;
        let profile = serde_json::from_str(&content)
            .with_context(|| format!("Invalid mapping profile {}", path.display()))?;
        Ok(profile)
    }

    /// Validate and write a profile document to an explicit path
    pub async fn write_file(path: &Path, profile: &MappingProfile) -> Result<()> {
        profile.validate_for_save()?;
        let json = serde_json::to_string_pretty(profile)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write mapping profile {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for JsonFileProfileStore {
    async fn load(&self, partner_id: &str) -> Result<Option<MappingProfile>> {
        let path = self.path_for(partner_id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        Self::read_file(&path).await.map(Some)
    }

    async fn save(&self, profile: &MappingProfile) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create profile directory {}", self.dir.display()))?;
        let path = self.path_for(&profile.partner_id);
        Self::write_file(&path, profile).await?;
        info!("Saved mapping profile for partner {} to {}", profile.partner_id, path.display());
        Ok(())
    }
}
