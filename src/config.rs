//! Top-level configuration for the retrieval core, with nested sections for
//! every tunable component: search fanout, reranking, caching, the answer
//! assembler and the query planner.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub data_dir: PathBuf,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    pub rerank: RerankConfig,
    pub cache: CacheConfig,
    pub assembler: AssemblerConfig,
    pub planner: PlannerConfig,
    pub features: FeatureFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model_dir: PathBuf,
    pub dimension: usize,
    pub use_e5: bool,
}

/// C2/C3 tunables: candidate fan-out, HNSW breadth, the lexical boost
/// schedule, and RRF fusion weighting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub default_k: usize,
    /// `fetch_k = default_k * candidate_multiplier` per shard.
    pub candidate_multiplier: usize,
    pub min_score_threshold: f32,
    pub hybrid_alpha: f32,
    /// Reciprocal rank fusion constant (spec default 60).
    pub rrf_k: usize,
    /// Weight for original similarity scores in RRF fusion (0.0 = pure RRF).
    pub score_weight: f32,
    /// HNSW search breadth passed to the vector backend.
    pub ef_search: usize,
    /// Exact phrase, slop 1.
    pub boost_phrase_slop1: f32,
    /// Phrase, slop 3.
    pub boost_phrase_slop3: f32,
    /// Multi-field match with fuzziness.
    pub boost_fuzzy_multi_match: f32,
    /// Cross-language phrase, slop 2.
    pub boost_alt_phrase_slop2: f32,
    /// Cross-language multi-field match.
    pub boost_alt_multi_match: f32,
    /// Max concurrent per-shard workers in the fanout (capped at 10).
    pub max_fanout_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    pub enabled: bool,
    /// C3 is asked for `expansion_multiplier * top_k` candidates when
    /// reranking is enabled (spec default 4).
    pub expansion_multiplier: usize,
    pub model_dir: PathBuf,
    pub max_sequence_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    pub capacity: usize,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// C7 tunables: token budget and LLM invocation contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblerConfig {
    pub total_token_budget: usize,
    pub reserved_tokens: usize,
    pub temperature: f32,
    pub max_tokens: usize,
    /// Model identifier sent on every chat-completion call; overridable
    /// per-query through `QueryOptions::model`.
    pub default_model: String,
}

impl AssemblerConfig {
    /// Usable context after reserving room for prompt scaffolding, the
    /// question, and the model's response (spec: ~100k of a 128k budget).
    pub fn usable_context_tokens(&self) -> usize {
        self.total_token_budget.saturating_sub(self.reserved_tokens)
    }
}

/// C6 tunables: agentic decomposition limits and occurrence-query caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub max_sub_queries: usize,
    pub chunks_per_subquery: usize,
    pub max_total_chunks: usize,
    pub max_occurrence_results: usize,
    pub occurrence_context_chars: usize,
    /// `k` is multiplied by this for detected summary/overview queries.
    pub summary_k_multiplier: f32,
    /// Floor applied after `summary_k_multiplier`, regardless of the caller's `k`.
    pub summary_min_k: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub enable_reranking: bool,
    pub enable_cross_encoder: bool,
    pub enable_agentic_rag: bool,
}

impl RetrievalConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }
        if self.search.default_k == 0 {
            return Err("search.default_k must be > 0".into());
        }
        if self.search.candidate_multiplier == 0 {
            return Err("search.candidate_multiplier must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.search.min_score_threshold) {
            return Err("search.min_score_threshold must be in [0.0, 1.0]".into());
        }
        if self.search.max_fanout_workers == 0 {
            return Err("search.max_fanout_workers must be > 0".into());
        }
        if self.rerank.expansion_multiplier == 0 {
            return Err("rerank.expansion_multiplier must be > 0".into());
        }
        if self.assembler.reserved_tokens >= self.assembler.total_token_budget {
            return Err("assembler.reserved_tokens must be < total_token_budget".into());
        }
        if self.planner.max_sub_queries == 0 {
            return Err("planner.max_sub_queries must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("retrieval-core");

        let model_dir = if Path::new("models").exists() {
            PathBuf::from("models")
        } else if let Ok(env_path) = std::env::var("MODEL_PATH") {
            PathBuf::from(env_path)
        } else {
            data_dir.join("models")
        };

        let e5_available = model_dir.join("multilingual-e5-base").exists();
        let dimension = if e5_available { 768 } else { 384 };

        Self {
            data_dir,
            embedding: EmbeddingConfig {
                model_dir: model_dir.clone(),
                dimension,
                use_e5: e5_available,
            },
            search: SearchConfig {
                default_k: 10,
                candidate_multiplier: 4,
                min_score_threshold: 0.1,
                hybrid_alpha: 0.7,
                rrf_k: 60,
                score_weight: 0.3,
                ef_search: 512,
                boost_phrase_slop1: 10.0,
                boost_phrase_slop3: 5.0,
                boost_fuzzy_multi_match: 1.5,
                boost_alt_phrase_slop2: 4.0,
                boost_alt_multi_match: 2.0,
                max_fanout_workers: 10,
            },
            rerank: RerankConfig {
                enabled: true,
                expansion_multiplier: 4,
                model_dir,
                max_sequence_length: 512,
            },
            cache: CacheConfig {
                ttl_seconds: 300,
                capacity: 100,
            },
            assembler: AssemblerConfig {
                total_token_budget: 128_000,
                reserved_tokens: 28_000,
                temperature: 0.1,
                max_tokens: 2500,
                default_model: "gpt-4o-mini".to_string(),
            },
            planner: PlannerConfig {
                max_sub_queries: 3,
                chunks_per_subquery: 10,
                max_total_chunks: 30,
                max_occurrence_results: 200,
                occurrence_context_chars: 80,
                summary_k_multiplier: 2.0,
                summary_min_k: 20,
            },
            features: FeatureFlags {
                enable_reranking: true,
                enable_cross_encoder: true,
                enable_agentic_rag: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(RetrievalConfig::default().validate().is_ok());
    }

    #[test]
    fn usable_context_subtracts_reserve() {
        let cfg = RetrievalConfig::default();
        assert_eq!(cfg.assembler.usable_context_tokens(), 100_000);
    }

    #[test]
    fn zero_candidate_multiplier_is_rejected() {
        let mut cfg = RetrievalConfig::default();
        cfg.search.candidate_multiplier = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn reserved_tokens_must_be_smaller_than_budget() {
        let mut cfg = RetrievalConfig::default();
        cfg.assembler.reserved_tokens = cfg.assembler.total_token_budget;
        assert!(cfg.validate().is_err());
    }
}
