//! Upstream rule sources

use async_trait::async_trait;
use parking_lot::RwLock;
use pgc_core::RawRule;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Failure to fetch rules, distinct from an empty rule list
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("rule store unavailable: {0}")]
    Unavailable(String),

    #[error("rule store rejected the credential")]
    Unauthorized,

    #[error("rule store timed out")]
    Timeout,

    #[error("failed to decode rules: {0}")]
    Decode(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where verified governance rules come from
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Fetch every currently published rule
    async fn fetch_verified_rules(&self, auth_token: &str) -> Result<Vec<RawRule>, SourceError>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// In-memory source for embedding and tests
#[derive(Debug, Default)]
pub struct StaticRuleSource {
    rules: RwLock<Vec<RawRule>>,
    failure: RwLock<Option<String>>,
    delay: Option<Duration>,
    fetches: AtomicUsize,
}

impl StaticRuleSource {
    /// Create a source serving `rules`
    pub fn new(rules: Vec<RawRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
            ..Self::default()
        }
    }

    /// Delay every fetch
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Replace the served rules
    pub fn set_rules(&self, rules: Vec<RawRule>) {
        *self.rules.write() = rules;
    }

    /// Make subsequent fetches fail with `reason`
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.write() = Some(reason.into());
    }

    /// Make subsequent fetches succeed again
    pub fn recover(&self) {
        *self.failure.write() = None;
    }

    /// Number of fetches served so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RuleSource for StaticRuleSource {
    async fn fetch_verified_rules(&self, _auth_token: &str) -> Result<Vec<RawRule>, SourceError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(reason) = self.failure.read().clone() {
            return Err(SourceError::Unavailable(reason));
        }
        Ok(self.rules.read().clone())
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

/// Rules read from YAML or JSON files, each holding a list of rules
#[derive(Debug, Clone)]
pub struct FileRuleSource {
    path: PathBuf,
}

impl FileRuleSource {
    /// Read rules from a file or from every rule file in a directory
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load_file(path: &Path) -> Result<Vec<RawRule>, SourceError> {
        let content = tokio::fs::read_to_string(path).await?;
        let is_json = path.extension().is_some_and(|ext| ext == "json");

        if is_json {
            serde_json::from_str(&content).map_err(|e| SourceError::Decode(format!("{}: {}", path.display(), e)))
        } else {
            serde_yaml::from_str(&content).map_err(|e| SourceError::Decode(format!("{}: {}", path.display(), e)))
        }
    }
}

fn is_rule_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json")
}

#[async_trait]
impl RuleSource for FileRuleSource {
    async fn fetch_verified_rules(&self, _auth_token: &str) -> Result<Vec<RawRule>, SourceError> {
        let metadata = tokio::fs::metadata(&self.path).await.map_err(|e| {
            SourceError::Unavailable(format!("{}: {}", self.path.display(), e))
        })?;

        if metadata.is_file() {
            return Self::load_file(&self.path).await;
        }

        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_rule_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut rules = Vec::new();
        for path in paths {
            match Self::load_file(&path).await {
                Ok(mut loaded) => {
                    debug!(path = %path.display(), count = loaded.len(), "Loaded rule file");
                    rules.append(&mut loaded);
                }
                Err(e) => warn!("Failed to load rule file {:?}: {}", path, e),
            }
        }

        Ok(rules)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}
