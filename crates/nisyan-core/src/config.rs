use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};

/// Top-level configuration. Every field has a built-in default; loading
/// never fails; malformed files and out-of-range values fall back
/// per-field with a logged warning.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NisyanConfig {
    #[serde(default)]
    pub decay: DecaySettings,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecaySettings {
    /// Half-life in days for a node with stability 3.
    #[serde(default = "default_half_life")]
    pub base_half_life_days: f64,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub search_weights: SearchWeights,
}

impl Default for DecaySettings {
    fn default() -> Self {
        Self {
            base_half_life_days: default_half_life(),
            thresholds: Thresholds::default(),
            retention: RetentionConfig::default(),
            search_weights: SearchWeights::default(),
        }
    }
}

/// Per-target-state transition gate: minimum days since access and minimum
/// decay score, with an optional importance ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub days: f64,
    pub decay_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_importance: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_dormant")]
    pub dormant: Threshold,
    #[serde(default = "default_archived")]
    pub archived: Threshold,
    #[serde(default = "default_expired")]
    pub expired: Threshold,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            dormant: default_dormant(),
            archived: default_archived(),
            expired: default_expired(),
        }
    }
}

impl Thresholds {
    /// Gates must come strictly later (days) and strictly higher (decay
    /// score) along the forward path.
    fn is_monotonic(&self) -> bool {
        self.dormant.days < self.archived.days
            && self.archived.days < self.expired.days
            && self.dormant.decay_score < self.archived.decay_score
            && self.archived.decay_score < self.expired.decay_score
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Days a soft-deleted node remains recoverable before purging.
    #[serde(default = "default_retention_days")]
    pub soft_delete_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            soft_delete_days: default_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchWeights {
    #[serde(default = "default_w_semantic")]
    pub semantic: f64,
    #[serde(default = "default_w_recency")]
    pub recency: f64,
    #[serde(default = "default_w_importance")]
    pub importance: f64,
    /// Time constant (days) for the recency exponential.
    #[serde(default = "default_recency_tau")]
    pub recency_tau_days: f64,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            semantic: default_w_semantic(),
            recency: default_w_recency(),
            importance: default_w_importance(),
            recency_tau_days: default_recency_tau(),
        }
    }
}

impl SearchWeights {
    pub fn sum(&self) -> f64 {
        self.semantic + self.recency + self.importance
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Hard deadline for a single maintenance cycle.
    #[serde(default = "default_max_duration")]
    pub max_duration_seconds: u64,
    /// Chunk size for the classifier catch-up pass.
    #[serde(default = "default_classify_chunk")]
    pub classify_chunk_size: usize,
    /// Cadence of the periodic scheduler.
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_duration_seconds: default_max_duration(),
            classify_chunk_size: default_classify_chunk(),
            interval_seconds: default_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// "memory" for the embedded store, "http" for a remote graph engine.
    #[serde(default = "default_graph_backend")]
    pub backend: String,
    #[serde(default = "default_graph_url")]
    pub url: String,
    #[serde(default = "default_graph_port")]
    pub port: u16,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            backend: default_graph_backend(),
            url: default_graph_url(),
            port: default_graph_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub env_var: Option<String>,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_llm_provider(),
            model: default_llm_model(),
            api_key: None,
            base_url: None,
            env_var: None,
            max_tokens: default_llm_max_tokens(),
        }
    }
}

/// Valid graph backend names.
pub const VALID_GRAPH_BACKENDS: &[&str] = &["memory", "http"];

/// Valid LLM provider names.
pub const VALID_LLM_PROVIDERS: &[&str] = &["ollama", "openai", "anthropic"];

// -- Defaults --

fn default_half_life() -> f64 {
    180.0
}
fn default_dormant() -> Threshold {
    Threshold {
        days: 30.0,
        decay_score: 0.3,
        max_importance: None,
    }
}
fn default_archived() -> Threshold {
    Threshold {
        days: 90.0,
        decay_score: 0.5,
        max_importance: None,
    }
}
fn default_expired() -> Threshold {
    Threshold {
        days: 180.0,
        decay_score: 0.7,
        max_importance: Some(2),
    }
}
fn default_retention_days() -> u32 {
    90
}
fn default_w_semantic() -> f64 {
    0.6
}
fn default_w_recency() -> f64 {
    0.2
}
fn default_w_importance() -> f64 {
    0.2
}
fn default_recency_tau() -> f64 {
    30.0
}
fn default_batch_size() -> usize {
    500
}
fn default_max_duration() -> u64 {
    600
}
fn default_classify_chunk() -> usize {
    100
}
fn default_interval() -> u64 {
    3600
}
fn default_graph_backend() -> String {
    "memory".to_string()
}
fn default_graph_url() -> String {
    "http://localhost".to_string()
}
fn default_graph_port() -> u16 {
    7687
}
fn default_llm_provider() -> String {
    "ollama".to_string()
}
fn default_llm_model() -> String {
    "llama3.2".to_string()
}
fn default_llm_max_tokens() -> usize {
    64
}

impl NisyanConfig {
    /// Load configuration from a YAML file.
    ///
    /// Resolution order: explicit `path` → `$NISYAN_CONFIG` → the default
    /// path under the user config directory. A missing or malformed file
    /// yields built-in defaults with a warning; it never raises.
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path
            .map(|p| p.to_path_buf())
            .or_else(|| std::env::var("NISYAN_CONFIG").ok().map(PathBuf::from))
            .or_else(default_config_path);

        let Some(resolved) = resolved else {
            tracing::warn!("cannot determine config directory, using built-in defaults");
            return Self::with_defaults();
        };

        if !resolved.exists() {
            tracing::warn!(path = %resolved.display(), "decay config not found, using built-in defaults");
            return Self::with_defaults();
        }

        let built = Config::builder()
            .add_source(File::from(resolved.clone()).format(FileFormat::Yaml))
            .build();

        let mut cfg: Self = match built.and_then(|c| c.try_deserialize()) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(path = %resolved.display(), error = %e, "malformed decay config, using built-in defaults");
                return Self::with_defaults();
            }
        };

        cfg.validate();
        cfg
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Self {
        let built = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build();
        let mut cfg: Self = match built.and_then(|c| c.try_deserialize()) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(error = %e, "malformed decay config, using built-in defaults");
                return Self::with_defaults();
            }
        };
        cfg.validate();
        cfg
    }

    /// Built-in defaults only (no file).
    pub fn with_defaults() -> Self {
        Self::default()
    }

    /// Validate config values, repairing individual fields and logging
    /// warnings. This is lenient; it fixes values rather than rejecting
    /// the config.
    pub fn validate(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.decay.base_half_life_days <= 0.0 || !self.decay.base_half_life_days.is_finite() {
            warnings.push(format!(
                "decay.base_half_life_days = {} must be positive, restoring {}",
                self.decay.base_half_life_days,
                default_half_life()
            ));
            self.decay.base_half_life_days = default_half_life();
        }

        if !self.decay.thresholds.is_monotonic() {
            warnings.push(
                "decay.thresholds must have strictly increasing days and decay_score \
                 (dormant < archived < expired), restoring defaults"
                    .to_string(),
            );
            self.decay.thresholds = Thresholds::default();
        }

        // Weights must sum to 1.0; normalize rather than reject.
        let w = &mut self.decay.search_weights;
        let sum = w.sum();
        if !sum.is_finite() || sum <= 0.0 || w.semantic < 0.0 || w.recency < 0.0 || w.importance < 0.0
        {
            warnings.push(format!(
                "decay.search_weights invalid (sum = {sum}), restoring defaults"
            ));
            *w = SearchWeights::default();
        } else if (sum - 1.0).abs() > 1e-6 {
            warnings.push(format!(
                "decay.search_weights sum to {sum:.4}, normalizing to 1.0"
            ));
            w.semantic /= sum;
            w.recency /= sum;
            w.importance /= sum;
        }
        if w.recency_tau_days <= 0.0 || !w.recency_tau_days.is_finite() {
            warnings.push(format!(
                "decay.search_weights.recency_tau_days = {} must be positive, restoring {}",
                w.recency_tau_days,
                default_recency_tau()
            ));
            w.recency_tau_days = default_recency_tau();
        }

        if self.decay.retention.soft_delete_days == 0 {
            warnings.push(format!(
                "decay.retention.soft_delete_days = 0, restoring {}",
                default_retention_days()
            ));
            self.decay.retention.soft_delete_days = default_retention_days();
        }

        if self.maintenance.batch_size == 0 {
            warnings.push(format!(
                "maintenance.batch_size = 0, restoring {}",
                default_batch_size()
            ));
            self.maintenance.batch_size = default_batch_size();
        }
        if self.maintenance.max_duration_seconds == 0 {
            warnings.push(format!(
                "maintenance.max_duration_seconds = 0, restoring {}",
                default_max_duration()
            ));
            self.maintenance.max_duration_seconds = default_max_duration();
        }
        if self.maintenance.classify_chunk_size == 0 {
            warnings.push(format!(
                "maintenance.classify_chunk_size = 0, restoring {}",
                default_classify_chunk()
            ));
            self.maintenance.classify_chunk_size = default_classify_chunk();
        }
        if self.maintenance.interval_seconds == 0 {
            warnings.push(format!(
                "maintenance.interval_seconds = 0, restoring {}",
                default_interval()
            ));
            self.maintenance.interval_seconds = default_interval();
        }

        if !VALID_GRAPH_BACKENDS.contains(&self.graph.backend.as_str()) {
            warnings.push(format!(
                "unknown graph backend '{}', valid: {}; using 'memory'",
                self.graph.backend,
                VALID_GRAPH_BACKENDS.join(", ")
            ));
            self.graph.backend = default_graph_backend();
        }

        if self.llm.enabled && !VALID_LLM_PROVIDERS.contains(&self.llm.provider.as_str()) {
            warnings.push(format!(
                "unknown LLM provider '{}', valid: {}",
                self.llm.provider,
                VALID_LLM_PROVIDERS.join(", ")
            ));
        }
        if self.llm.max_tokens == 0 {
            warnings.push(format!(
                "llm.max_tokens = 0, restoring {}",
                default_llm_max_tokens()
            ));
            self.llm.max_tokens = default_llm_max_tokens();
        }

        for w in &warnings {
            tracing::warn!("config: {}", w);
        }

        warnings
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("nisyan").join("decay.yaml"))
}

/// Shared handle to the live configuration.
///
/// `snapshot()` is cheap; `reload()` swaps the whole config atomically.
/// A maintenance cycle takes one snapshot at start and keeps it, so a
/// reload never changes parameters mid-batch.
#[derive(Clone)]
pub struct ConfigHandle {
    path: Option<PathBuf>,
    current: Arc<RwLock<Arc<NisyanConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: NisyanConfig, path: Option<PathBuf>) -> Self {
        Self {
            path,
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<NisyanConfig> {
        self.current
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_else(|poisoned| Arc::clone(&poisoned.into_inner()))
    }

    /// Re-read the config file and replace the live config atomically.
    /// Warnings for repaired fields are logged during the load. An
    /// in-flight maintenance cycle keeps the snapshot it started with.
    pub fn reload(&self) {
        let next = Arc::new(NisyanConfig::load(self.path.as_deref()));
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = NisyanConfig::with_defaults();
        assert_eq!(cfg.decay.base_half_life_days, 180.0);
        assert_eq!(cfg.decay.thresholds.dormant.days, 30.0);
        assert_eq!(cfg.decay.thresholds.archived.days, 90.0);
        assert_eq!(cfg.decay.thresholds.expired.days, 180.0);
        assert_eq!(cfg.decay.thresholds.expired.max_importance, Some(2));
        assert_eq!(cfg.decay.retention.soft_delete_days, 90);
        assert_eq!(cfg.decay.search_weights.semantic, 0.6);
        assert_eq!(cfg.decay.search_weights.recency, 0.2);
        assert_eq!(cfg.decay.search_weights.importance, 0.2);
        assert_eq!(cfg.maintenance.batch_size, 500);
        assert_eq!(cfg.maintenance.max_duration_seconds, 600);
        assert_eq!(cfg.graph.backend, "memory");
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let cfg = NisyanConfig::load(Some(Path::new("/nonexistent/decay.yaml")));
        assert_eq!(cfg.decay.base_half_life_days, 180.0);
        assert_eq!(cfg.maintenance.batch_size, 500);
    }

    #[test]
    fn test_yaml_parsing() {
        let cfg = NisyanConfig::from_yaml(
            r#"
decay:
  base_half_life_days: 90
  retention:
    soft_delete_days: 30
maintenance:
  batch_size: 100
"#,
        );
        assert_eq!(cfg.decay.base_half_life_days, 90.0);
        assert_eq!(cfg.decay.retention.soft_delete_days, 30);
        assert_eq!(cfg.maintenance.batch_size, 100);
        // Untouched sections keep defaults
        assert_eq!(cfg.decay.thresholds.dormant.days, 30.0);
        assert_eq!(cfg.decay.search_weights.semantic, 0.6);
    }

    #[test]
    fn test_malformed_yaml_gives_defaults() {
        let cfg = NisyanConfig::from_yaml("decay: [not, a, map");
        assert_eq!(cfg.decay.base_half_life_days, 180.0);
    }

    #[test]
    fn test_validate_default_config_no_warnings() {
        let mut cfg = NisyanConfig::with_defaults();
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn test_validate_negative_half_life() {
        let mut cfg = NisyanConfig::with_defaults();
        cfg.decay.base_half_life_days = -1.0;
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 1);
        assert_eq!(cfg.decay.base_half_life_days, 180.0);
    }

    #[test]
    fn test_validate_non_monotonic_thresholds_restored() {
        let mut cfg = NisyanConfig::with_defaults();
        cfg.decay.thresholds.archived.days = 10.0; // dormant is 30, out of order
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.contains("thresholds")));
        assert_eq!(cfg.decay.thresholds, Thresholds::default());
    }

    #[test]
    fn test_validate_non_increasing_decay_score_restored() {
        let mut cfg = NisyanConfig::with_defaults();
        cfg.decay.thresholds.expired.decay_score = 0.4; // archived is 0.5
        cfg.validate();
        assert_eq!(cfg.decay.thresholds, Thresholds::default());
    }

    #[test]
    fn test_validate_normalizes_weights() {
        let mut cfg = NisyanConfig::with_defaults();
        cfg.decay.search_weights.semantic = 0.6;
        cfg.decay.search_weights.recency = 0.6;
        cfg.decay.search_weights.importance = 0.8;
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.contains("normalizing")));
        assert!((cfg.decay.search_weights.sum() - 1.0).abs() < 1e-9);
        assert!((cfg.decay.search_weights.semantic - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_validate_zero_weight_sum_restored() {
        let mut cfg = NisyanConfig::with_defaults();
        cfg.decay.search_weights.semantic = 0.0;
        cfg.decay.search_weights.recency = 0.0;
        cfg.decay.search_weights.importance = 0.0;
        cfg.validate();
        assert_eq!(cfg.decay.search_weights.semantic, 0.6);
    }

    #[test]
    fn test_validate_zero_integers_restored() {
        let mut cfg = NisyanConfig::with_defaults();
        cfg.decay.retention.soft_delete_days = 0;
        cfg.maintenance.batch_size = 0;
        cfg.maintenance.max_duration_seconds = 0;
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 3);
        assert_eq!(cfg.decay.retention.soft_delete_days, 90);
        assert_eq!(cfg.maintenance.batch_size, 500);
        assert_eq!(cfg.maintenance.max_duration_seconds, 600);
    }

    #[test]
    fn test_validate_unknown_backend() {
        let mut cfg = NisyanConfig::with_defaults();
        cfg.graph.backend = "banana".to_string();
        let warnings = cfg.validate();
        assert!(warnings.iter().any(|w| w.contains("unknown graph backend")));
        assert_eq!(cfg.graph.backend, "memory");
    }

    #[test]
    fn test_validate_repairs_only_offending_field() {
        let mut cfg = NisyanConfig::from_yaml(
            r#"
decay:
  base_half_life_days: -5
  retention:
    soft_delete_days: 14
"#,
        );
        // from_yaml already validated; half-life repaired, retention kept
        assert_eq!(cfg.decay.base_half_life_days, 180.0);
        assert_eq!(cfg.decay.retention.soft_delete_days, 14);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn test_config_handle_snapshot_and_reload() {
        let handle = ConfigHandle::new(NisyanConfig::with_defaults(), None);
        let snap = handle.snapshot();
        assert_eq!(snap.decay.base_half_life_days, 180.0);
        // Reload with no file falls back to defaults; the old snapshot is
        // untouched by the swap.
        handle.reload();
        assert_eq!(snap.decay.base_half_life_days, 180.0);
        assert_eq!(handle.snapshot().maintenance.batch_size, 500);
    }

    #[test]
    fn test_thresholds_yaml_with_max_importance() {
        let cfg = NisyanConfig::from_yaml(
            r#"
decay:
  thresholds:
    dormant:  { days: 10, decay_score: 0.2 }
    archived: { days: 20, decay_score: 0.4 }
    expired:  { days: 40, decay_score: 0.6, max_importance: 3 }
"#,
        );
        assert_eq!(cfg.decay.thresholds.dormant.days, 10.0);
        assert_eq!(cfg.decay.thresholds.expired.max_importance, Some(3));
    }
}
