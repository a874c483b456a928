use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::store::models::EngagementKind;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid config: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Application configuration loaded from TOML config file.
/// All fields have sensible defaults — the config file is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Custom database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Number of parallel workers for user-depth fetches.
    /// 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    /// Platform read-API settings.
    pub api: ApiConfig,
    /// Harvest phase limits and toggles.
    pub harvest: HarvestConfig,
    /// Relationship derivation thresholds.
    pub process: ProcessConfig,
    /// Graph-view bounds.
    pub graph: GraphConfig,
}

/// Platform read-API configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Minimum interval between any two requests, shared process-wide.
    pub request_delay_ms: u64,
    /// Attempts per request before a transient failure is surfaced.
    pub max_retries: u32,
    /// Exponential backoff base; doubles per retry up to the cap.
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Page size for offset pagination.
    pub page_size: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.soundcloud.com".to_string(),
            request_delay_ms: 300,
            max_retries: 4,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            page_size: 50,
        }
    }
}

/// Per-phase enable flags and numeric limits for the harvest engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Hours before a fetched entity must be re-fetched.
    pub fresh_ttl_hours: i64,

    pub social_spill: bool,
    pub user_depth: bool,
    pub playlist_depth: bool,
    pub artist_depth: bool,
    pub semantic_depth: bool,
    pub contextual_depth: bool,

    /// Max likers/reposters harvested per track.
    pub max_users_per_track: usize,
    /// Max liked tracks harvested per user.
    pub max_tracks_per_user: usize,
    /// Max playlists harvested per seed.
    pub max_playlists: usize,
    /// Max tracks harvested from the seed artist's catalog.
    pub max_artist_tracks: usize,

    /// Max search results scanned per key term in the semantic phase.
    pub fuzzy_search_limit: usize,
    /// Normalized title-similarity threshold for semantic matches.
    pub name_similarity_threshold: f64,
    /// Number of key terms from the seed title to search.
    pub search_terms: usize,

    /// Max secondary seeds taken from mentions/credits/labels.
    pub contextual_max_entities: usize,
    /// Social-spill cap for a secondary seed.
    pub contextual_users: usize,
    /// Artist-depth cap for a secondary seed.
    pub contextual_tracks: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            fresh_ttl_hours: 24,
            social_spill: true,
            user_depth: true,
            playlist_depth: true,
            artist_depth: true,
            semantic_depth: true,
            contextual_depth: true,
            max_users_per_track: 500,
            max_tracks_per_user: 500,
            max_playlists: 200,
            max_artist_tracks: 1000,
            fuzzy_search_limit: 100,
            name_similarity_threshold: 0.6,
            search_terms: 3,
            contextual_max_entities: 10,
            contextual_users: 50,
            contextual_tracks: 50,
        }
    }
}

/// Relationship-processor thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Minimum shared tracks before a user pair is scored.
    pub min_common_tracks: usize,
    /// Minimum Jaccard score before a user pair is stored.
    pub min_similarity_score: f64,
    /// Minimum evidence before an artist pair is materialized.
    pub min_artist_evidence: i64,
    /// Engagement kinds counted by the similarity metric.
    /// The metric name is derived from this list (e.g. "jaccard_likes").
    pub engagement_kinds: Vec<String>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            min_common_tracks: 3,
            min_similarity_score: 0.1,
            min_artist_evidence: 2,
            engagement_kinds: vec!["like".to_string()],
        }
    }
}

impl ProcessConfig {
    /// Parsed engagement kinds, in config order.
    pub fn kinds(&self) -> Vec<EngagementKind> {
        self.engagement_kinds
            .iter()
            .filter_map(|s| EngagementKind::parse(s))
            .collect()
    }

    /// Metric name recorded on similarity rows, e.g. "jaccard_likes" or
    /// "jaccard_likes_reposts".
    pub fn metric_name(&self) -> String {
        let mut name = String::from("jaccard");
        for kind in self.kinds() {
            name.push('_');
            name.push_str(kind.as_str());
            name.push('s');
        }
        name
    }
}

/// Graph-view bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// BFS expansion depth from the seed node.
    pub max_depth: usize,
    /// Hard cap on nodes loaded into memory.
    pub max_nodes: usize,
    /// Neighbors pulled from the store per node and layer during the build.
    pub neighbors_per_node: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_nodes: 5000,
            neighbors_per_node: 50,
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/soundgraph/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        match config_path {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<AppConfig>(&contents) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", path.display());
                        config
                    }
                    Err(e) => {
                        log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    /// Fail fast on impossible settings, before any network activity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let api = &self.api;
        if api.base_url.is_empty() {
            return Err(ConfigError::Invalid {
                field: "api.base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if api.max_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "api.max_retries",
                reason: "must be at least 1".to_string(),
            });
        }
        if api.page_size == 0 {
            return Err(ConfigError::Invalid {
                field: "api.page_size",
                reason: "must be positive".to_string(),
            });
        }
        if api.backoff_max_ms < api.backoff_base_ms {
            return Err(ConfigError::Invalid {
                field: "api.backoff_max_ms",
                reason: "must be >= backoff_base_ms".to_string(),
            });
        }

        let h = &self.harvest;
        if h.fresh_ttl_hours < 0 {
            return Err(ConfigError::Invalid {
                field: "harvest.fresh_ttl_hours",
                reason: "must not be negative".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&h.name_similarity_threshold) {
            return Err(ConfigError::Invalid {
                field: "harvest.name_similarity_threshold",
                reason: format!("{} is outside [0, 1]", h.name_similarity_threshold),
            });
        }

        let p = &self.process;
        if !(0.0..=1.0).contains(&p.min_similarity_score) {
            return Err(ConfigError::Invalid {
                field: "process.min_similarity_score",
                reason: format!("{} is outside [0, 1]", p.min_similarity_score),
            });
        }
        if p.min_common_tracks == 0 {
            return Err(ConfigError::Invalid {
                field: "process.min_common_tracks",
                reason: "must be at least 1".to_string(),
            });
        }
        if p.min_artist_evidence < 1 {
            return Err(ConfigError::Invalid {
                field: "process.min_artist_evidence",
                reason: "must be at least 1".to_string(),
            });
        }
        if p.kinds().is_empty() {
            return Err(ConfigError::Invalid {
                field: "process.engagement_kinds",
                reason: format!(
                    "no valid kinds in {:?} (expected like/repost/play)",
                    p.engagement_kinds
                ),
            });
        }

        let g = &self.graph;
        if g.max_nodes == 0 {
            return Err(ConfigError::Invalid {
                field: "graph.max_nodes",
                reason: "must be positive".to_string(),
            });
        }

        Ok(())
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default database path using XDG data directory.
pub fn default_db_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join("soundgraph.db")
    } else {
        // Fallback: current directory
        PathBuf::from("soundgraph.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_threshold_out_of_range_fails() {
        let mut config = AppConfig::default();
        config.harvest.name_similarity_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_retries_fails() {
        let mut config = AppConfig::default();
        config.api.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_engagement_kinds_fail() {
        let mut config = AppConfig::default();
        config.process.engagement_kinds = vec!["dislike".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_metric_name_reflects_kinds() {
        let mut p = ProcessConfig::default();
        assert_eq!(p.metric_name(), "jaccard_likes");
        p.engagement_kinds = vec!["like".to_string(), "repost".to_string()];
        assert_eq!(p.metric_name(), "jaccard_likes_reposts");
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: AppConfig = toml::from_str(
            "
            workers = 4

            [harvest]
            max_users_per_track = 100
            semantic_depth = false

            [process]
            min_common_tracks = 2
            ",
        )
        .unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.harvest.max_users_per_track, 100);
        assert!(!config.harvest.semantic_depth);
        // Unset fields keep defaults
        assert_eq!(config.harvest.max_tracks_per_user, 500);
        assert_eq!(config.process.min_common_tracks, 2);
        assert_eq!(config.api.request_delay_ms, 300);
    }
}
