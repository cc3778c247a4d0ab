//! Command implementations

pub mod declarative;
pub mod state;

use anyhow::{Context as AnyhowContext, Result};
use apikit::{Client, Credentials, RetryConfig, UreqTransport};
use converge::{Registry, SnapshotStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::Context;
use crate::config::{Manifest, Settings};
use crate::resource::{self, Platform};

/// Settings of the manifest, or the defaults when there is no manifest
pub fn load_settings(path: &Path) -> Result<Settings> {
    if path.exists() {
        Ok(Manifest::load(path)?.settings)
    } else {
        log::debug!("No manifest at {}, using default settings", path.display());
        Ok(Settings::default())
    }
}

/// Everything a pass needs: the registry of controllers and the snapshot
pub struct Session {
    pub settings: Settings,
    pub registry: Registry,
    pub store: SnapshotStore,
    pub state_path: PathBuf,
}

impl Session {
    /// Connect to the platform with the settings and keys of `ctx`
    pub fn open(ctx: &Context, settings: Settings) -> Result<Self> {
        let transport = UreqTransport::new(settings.api_base.as_str(), settings.timeout());
        let client = Client::new(
            Arc::new(transport),
            Credentials {
                project_key: ctx.api_key.clone(),
                admin_key: ctx.admin_key.clone(),
                organization: settings.organization.clone(),
            },
        )
        .with_retry(RetryConfig::from(&settings.retry));
        if ctx.api_key.is_none() && ctx.admin_key.is_none() {
            log::warn!("Neither OPENAI_API_KEY nor OPENAI_ADMIN_KEY is set");
        }

        let platform = Arc::new(Platform::new(client, &settings));
        let registry = resource::registry(&platform);

        let state_path = settings.state_path()?;
        // Every commit reaches the disk before the pass moves on
        let store = SnapshotStore::load(&state_path)
            .with_context(|| format!("Could not load state from {}", state_path.display()))?
            .persist_to(&state_path);

        Ok(Self {
            settings,
            registry,
            store,
            state_path,
        })
    }

    /// Persist the snapshot
    pub fn save(&self) -> Result<()> {
        self.store
            .save(&self.state_path)
            .with_context(|| format!("Could not save state to {}", self.state_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_manifest_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = load_settings(&dir.path().join("orgform.toml")).unwrap();
        assert_eq!(settings.jobs, Settings::default().jobs);
    }

    #[test]
    fn test_invalid_manifest_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("orgform.toml");
        fs::write(&path, "[settings]\njobs = 0\n").unwrap();
        assert!(load_settings(&path).is_err());
    }

    #[test]
    fn test_session_opens_empty_state() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            state_path: Some(dir.path().join("state.json").display().to_string()),
            ..Settings::default()
        };
        let ctx = Context {
            verbose: 0,
            quiet: true,
            manifest: dir.path().join("orgform.toml"),
            api_key: Some("sk-proj".into()),
            admin_key: None,
        };
        let session = Session::open(&ctx, settings).unwrap();
        assert!(session.store.is_empty());
        assert!(session.registry.get("project").is_ok());

        session.save().unwrap();
        assert!(dir.path().join("state.json").exists());
    }

    #[test]
    fn test_session_store_writes_through() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let settings = Settings {
            state_path: Some(path.display().to_string()),
            ..Settings::default()
        };
        let ctx = Context {
            verbose: 0,
            quiet: true,
            manifest: dir.path().join("orgform.toml"),
            api_key: Some("sk-proj".into()),
            admin_key: None,
        };
        let session = Session::open(&ctx, settings).unwrap();
        session.store.commit(
            "demo",
            converge::Entry {
                kind: "project".into(),
                identity: "proj_1".into(),
                ..converge::Entry::default()
            },
        );

        let reloaded = SnapshotStore::load(&path).unwrap();
        assert_eq!(reloaded.identity("demo").as_deref(), Some("proj_1"));
    }
}
