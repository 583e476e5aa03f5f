use anyhow::{bail, Context, Result};
use reconcile::{FieldMappingDomain, ReconcileConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Top-level configuration file for the `reconcile` binary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: ReconcileConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub domains: Vec<DomainJob>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter level when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Daily rolling log file in addition to stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

/// One reconciled domain and the files backing it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainJob {
    #[serde(flatten)]
    pub domain: FieldMappingDomain,
    /// JSON array of external records
    pub source: PathBuf,
    /// JSON array of local records, created on first write
    pub store: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: None,
        }
    }
}

impl AppConfig {
    /// Load from TOML, or YAML for `.yaml`/`.yml` files.
    ///
    /// Relative `source` and `store` paths are resolved against the
    /// directory holding the config file.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;

        let mut config: AppConfig = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("parsing YAML config {}", path.display()))?,
            _ => toml::from_str(&content)
                .with_context(|| format!("parsing TOML config {}", path.display()))?,
        };

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;

        let mut names = HashSet::new();
        for job in &self.domains {
            if job.domain.name.trim().is_empty() {
                bail!("Domain name cannot be empty");
            }
            if job.domain.key_field.trim().is_empty() {
                bail!("Domain '{}' has no key_field", job.domain.name);
            }
            if !names.insert(job.domain.name.as_str()) {
                bail!("Domain '{}' is configured twice", job.domain.name);
            }
            if !job.domain.fields.is_empty() && !job.domain.fields.contains_key(&job.domain.key_field) {
                bail!(
                    "Domain '{}' maps fields but not its key field '{}'",
                    job.domain.name,
                    job.domain.key_field
                );
            }
        }
        Ok(())
    }

    pub fn domain(&self, name: &str) -> Option<&DomainJob> {
        self.domains.iter().find(|job| job.domain.name == name)
    }

    /// Example configuration with the lawyer directory sync
    pub fn sample() -> Self {
        let lawyers = FieldMappingDomain::passthrough("lawyers", "email")
            .map_field("email", "email")
            .map_field("firstName", "first_name")
            .map_field("lastName", "last_name")
            .map_field("firm", "law_firm")
            .case_insensitive("email");

        Self {
            engine: ReconcileConfig::default(),
            logging: LoggingConfig::default(),
            domains: vec![DomainJob {
                domain: lawyers,
                source: PathBuf::from("data/lawyers.external.json"),
                store: PathBuf::from("data/lawyers.local.json"),
            }],
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        for job in &mut self.domains {
            if job.source.is_relative() {
                job.source = base.join(&job.source);
            }
            if job.store.is_relative() {
                job.store = base.join(&job.store);
            }
        }
        if let Some(file) = &self.logging.file {
            if file.is_relative() {
                self.logging.file = Some(base.join(file));
            }
        }
    }
}

/// `reconcile/reconcile.toml` under the platform config directory
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("reconcile").join("reconcile.toml"))
        .unwrap_or_else(|| PathBuf::from("reconcile.toml"))
}

fn default_log_level() -> String { "info".to_string() }

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TOML: &str = r#"
[engine]
max_retries = 5
apply_concurrency = 4

[logging]
level = "debug"

[[domains]]
name = "lawyers"
key_field = "email"
case_insensitive_fields = ["email"]
source = "lawyers.json"
store = "/var/lib/reconcile/lawyers.json"

[domains.fields]
email = "email"
firstName = "first_name"
"#;

    #[tokio::test]
    async fn test_load_toml_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reconcile.toml");
        tokio::fs::write(&path, TOML).await.unwrap();

        let config = AppConfig::load(&path).await.unwrap();

        assert_eq!(config.engine.max_retries, 5);
        assert_eq!(config.engine.apply_concurrency, 4);
        assert_eq!(config.engine.backoff_base_ms, 500);
        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.json);

        let job = config.domain("lawyers").unwrap();
        assert_eq!(job.domain.fields.get("firstName").map(String::as_str), Some("first_name"));
        assert_eq!(job.source, dir.path().join("lawyers.json"));
        assert_eq!(job.store, PathBuf::from("/var/lib/reconcile/lawyers.json"));
        config.validate().unwrap();
    }

    #[tokio::test]
    async fn test_load_yaml_by_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reconcile.yaml");
        let yaml = "domains:\n  - name: deadlines\n    key_field: id\n    source: deadlines.json\n    store: calendar.json\n";
        tokio::fs::write(&path, yaml).await.unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.engine, ReconcileConfig::default());
        assert_eq!(config.domains[0].domain.key_field, "id");
        assert!(config.domains[0].domain.fields.is_empty());
    }

    #[test]
    fn test_duplicate_domain_rejected() {
        let mut config = AppConfig::sample();
        config.domains.push(config.domains[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unmapped_key_field_rejected() {
        let mut config = AppConfig::sample();
        config.domains[0].domain.fields.remove("email");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("key field"));
    }

    #[test]
    fn test_invalid_engine_settings_rejected() {
        let mut config = AppConfig::sample();
        config.engine.apply_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_sample_survives_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reconcile.toml");

        AppConfig::sample().save(&path).await.unwrap();
        let loaded = AppConfig::load(&path).await.unwrap();

        assert_eq!(loaded.domains.len(), 1);
        assert_eq!(loaded.domains[0].domain, AppConfig::sample().domains[0].domain);
        loaded.validate().unwrap();
    }
}
