use anyhow::{Context, Result, bail};
use apikit::RetryConfig;
use converge::{Instance, reference};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

/// Default manifest file name
pub const MANIFEST_FILE: &str = "orgform.toml";

/// Default platform endpoint
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Text stored for inputs the platform cannot return on import
pub const DEFAULT_IMPORT_PLACEHOLDER: &str = "(imported; original input unavailable)";

static NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("valid name regex"));

static INTERPOLATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$\{([A-Za-z_][A-Za-z0-9_-]*)((?:\.[A-Za-z0-9_]+)*)\}$")
        .expect("valid interpolation regex")
});

/// Get the default state file path
pub fn default_state_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home
        .join(".local")
        .join("state")
        .join("orgform")
        .join("state.json"))
}

// ============================================================================
// Manifest
// ============================================================================

/// Top-level manifest
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default, rename = "resource")]
    pub resources: Vec<ResourceDecl>,
}

/// `[settings]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub api_base: String,
    pub organization: Option<String>,
    pub state_path: Option<String>,
    /// Parallelism bound for independent instances
    pub jobs: usize,
    /// Per-call timeout
    pub timeout_secs: u64,
    pub retry: RetrySettings,
    /// Platform defaults restored when a rate limit override is removed,
    /// keyed by model (`"*"` for every model), then field
    pub rate_limit_defaults: BTreeMap<String, BTreeMap<String, u64>>,
    pub import_placeholder: String,
    pub poll_interval_secs: u64,
    pub poll_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            organization: None,
            state_path: None,
            jobs: 4,
            timeout_secs: 60,
            retry: RetrySettings::default(),
            rate_limit_defaults: BTreeMap::new(),
            import_placeholder: DEFAULT_IMPORT_PLACEHOLDER.to_string(),
            poll_interval_secs: 5,
            poll_timeout_secs: 600,
        }
    }
}

impl Settings {
    /// Get the expanded state file path
    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.state_path {
            Some(path) => Ok(PathBuf::from(shellexpand::tilde(path).as_ref())),
            None => default_state_path(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

/// `[settings.retry]`
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let config = RetryConfig::default();
        Self {
            max_attempts: config.max_attempts,
            base_delay_ms: config.base_delay.as_millis() as u64,
            backoff_factor: config.backoff_factor,
            max_delay_ms: config.max_delay.as_millis() as u64,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            backoff_factor: settings.backoff_factor,
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

/// `[[resource]]`
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Remote identity to bind instead of creating
    #[serde(default)]
    pub import: Option<String>,
    #[serde(default)]
    pub attributes: toml::Table,
}

impl Manifest {
    /// Load a manifest file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid manifest {}", path.display()))
    }

    /// Parse manifest text
    pub fn parse(content: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for resource in &self.resources {
            if !NAME.is_match(&resource.name) {
                bail!(
                    "Invalid resource name '{}': use letters, digits, '_' and '-'",
                    resource.name
                );
            }
            if !seen.insert(resource.name.as_str()) {
                bail!("Duplicate resource name '{}'", resource.name);
            }
        }
        if self.settings.jobs == 0 {
            bail!("settings.jobs must be at least 1");
        }
        Ok(())
    }

    /// Declared instances, with `${name}` interpolations turned into references
    pub fn instances(&self) -> Result<Vec<Instance>> {
        self.resources
            .iter()
            .map(|resource| {
                let value = serde_json::to_value(&resource.attributes)
                    .with_context(|| format!("Invalid attributes for '{}'", resource.name))?;
                let Value::Object(declared) = expand(value) else {
                    bail!("Attributes of '{}' must be a table", resource.name);
                };
                Ok(Instance {
                    name: resource.name.clone(),
                    kind: resource.kind.clone(),
                    declared,
                    depends_on: resource.depends_on.clone(),
                    import: resource.import.clone(),
                })
            })
            .collect()
    }
}

/// Replace whole-string `${name}` / `${name.field.path}` values with references
fn expand(value: Value) -> Value {
    match value {
        Value::String(s) => {
            let linked = INTERPOLATION.captures(&s).map(|caps| {
                let field = caps.get(2).map(|m| m.as_str().trim_start_matches('.'));
                reference::make(&caps[1], field.filter(|f| !f.is_empty()))
            });
            linked.unwrap_or(Value::String(s))
        }
        Value::Array(items) => Value::Array(items.into_iter().map(expand).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, expand(v))).collect()),
        other => other,
    }
}

// ============================================================================
// Tests
// ============================================================================
