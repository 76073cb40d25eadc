//! 설정 모듈
//!
//! 파이프라인이 소비하는 설정 표면입니다.
//! 우선순위: 환경변수(RAGPIPE_*) > config.toml > 기본값
//!
//! 설정은 파이프라인/수집기 생성 시점에 검증되며,
//! 잘못된 값은 첫 사용이 아니라 생성 시점에 `InvalidConfig`로 실패합니다.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::retry::RetryPolicy;

/// 설정 파일 이름
pub const CONFIG_FILE_NAME: &str = "config.toml";

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.ragpipe/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ragpipe")
}

// ============================================================================
// Enums
// ============================================================================

/// 유사도 메트릭 (코사인만 지원, 저장 시 벡터 정규화)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
}

impl SimilarityMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            other => Err(RagError::InvalidConfig(format!(
                "unsupported similarity metric: {} (only 'cosine' is supported)",
                other
            ))),
        }
    }
}

/// 외부 모델 프로바이더 선택
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Google Gemini API
    Gemini,
    /// 오프라인 결정적 구현 (해시 임베딩 / 추출형 답변)
    Local,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "local" => Ok(Self::Local),
            other => Err(RagError::InvalidConfig(format!("unknown provider: {}", other))),
        }
    }
}

/// 쿼리 재작성 전략
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewriteStrategy {
    None,
    Abbreviations,
    Llm,
}

/// 검색 결과 재정렬 전략
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerankStrategy {
    /// 유사도 순서 그대로 (상위 N 제한 없음)
    None,
    /// 유사도 + 쿼리 단어 포함률
    Lexical,
}

impl RerankStrategy {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "lexical" => Ok(Self::Lexical),
            other => Err(RagError::InvalidConfig(format!("unknown rerank strategy: {}", other))),
        }
    }
}

// ============================================================================
// RetryConfig
// ============================================================================

/// 외부 호출 재시도 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 총 시도 횟수 (최초 호출 포함)
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
        }
    }
}

// ============================================================================
// RagConfig
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub collection: String,
    pub chunk_max_tokens: usize,
    pub chunk_overlap_tokens: usize,
    pub retrieval_k: usize,
    pub min_similarity: Option<f32>,
    pub embedding_provider: ProviderKind,
    pub embedding_model_id: String,
    pub embedding_dimension: usize,
    pub embedding_batch_size: usize,
    pub generation_provider: ProviderKind,
    pub generation_model: String,
    pub similarity_metric: SimilarityMetric,
    pub retry: RetryConfig,
    pub request_timeout_secs: u64,
    pub ingest_concurrency: usize,
    pub query_rewrite: RewriteStrategy,
    pub abbreviations: BTreeMap<String, String>,
    pub rerank: RerankStrategy,
    /// 재정렬 후 답변 생성에 넘길 청크 수
    pub rerank_top_n: usize,
    pub data_dir: Option<PathBuf>,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            collection: "default".to_string(),
            chunk_max_tokens: 256,
            chunk_overlap_tokens: 32,
            retrieval_k: 5,
            min_similarity: None,
            embedding_provider: ProviderKind::Gemini,
            embedding_model_id: "gemini-embedding-001".to_string(),
            embedding_dimension: 768,
            embedding_batch_size: 32,
            generation_provider: ProviderKind::Gemini,
            generation_model: "gemini-2.0-flash".to_string(),
            similarity_metric: SimilarityMetric::Cosine,
            retry: RetryConfig::default(),
            request_timeout_secs: 30,
            ingest_concurrency: 4,
            query_rewrite: RewriteStrategy::Abbreviations,
            abbreviations: BTreeMap::new(),
            rerank: RerankStrategy::Lexical,
            rerank_top_n: 3,
            data_dir: None,
        }
    }
}

impl RagConfig {
    /// 오프라인 로컬 프로바이더 설정 (테스트, API 키 없는 환경)
    pub fn local() -> Self {
        Self {
            embedding_provider: ProviderKind::Local,
            embedding_model_id: crate::embedding::LOCAL_MODEL_ID.to_string(),
            embedding_dimension: crate::embedding::LOCAL_DEFAULT_DIMENSION,
            generation_provider: ProviderKind::Local,
            ..Default::default()
        }
    }

    /// 설정 로드
    ///
    /// `path`가 없으면 `<data_dir>/config.toml`을 찾고, 파일이 없으면 기본값을 사용합니다.
    /// 마지막으로 RAGPIPE_* 환경변수를 적용합니다.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default_path = get_data_dir().join(CONFIG_FILE_NAME);
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// TOML 파일에서 로드
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RagError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| RagError::InvalidConfig(e.to_string()))
    }

    /// 환경변수 오버라이드 적용
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_value("RAGPIPE_COLLECTION") {
            self.collection = v;
        }
        if let Some(v) = env_value("RAGPIPE_RETRIEVAL_K") {
            self.retrieval_k = parse_number("RAGPIPE_RETRIEVAL_K", &v)?;
        }
        if let Some(v) = env_value("RAGPIPE_CHUNK_MAX_TOKENS") {
            self.chunk_max_tokens = parse_number("RAGPIPE_CHUNK_MAX_TOKENS", &v)?;
        }
        if let Some(v) = env_value("RAGPIPE_CHUNK_OVERLAP_TOKENS") {
            self.chunk_overlap_tokens = parse_number("RAGPIPE_CHUNK_OVERLAP_TOKENS", &v)?;
        }
        if let Some(v) = env_value("RAGPIPE_EMBEDDING_PROVIDER") {
            self.embedding_provider = ProviderKind::parse(&v)?;
            if self.embedding_provider == ProviderKind::Local {
                self.embedding_model_id = crate::embedding::LOCAL_MODEL_ID.to_string();
            }
        }
        if let Some(v) = env_value("RAGPIPE_GENERATION_PROVIDER") {
            self.generation_provider = ProviderKind::parse(&v)?;
        }
        if let Some(v) = env_value("RAGPIPE_RERANK") {
            self.rerank = RerankStrategy::parse(&v)?;
        }
        if let Some(v) = env_value("RAGPIPE_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// 설정 검증 (생성 시점에 호출)
    pub fn validate(&self) -> Result<()> {
        if self.collection.trim().is_empty()
            || !self
                .collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(RagError::InvalidConfig(format!(
                "collection name must be non-empty [A-Za-z0-9_-]: {:?}",
                self.collection
            )));
        }
        if self.chunk_max_tokens == 0 {
            return Err(RagError::InvalidConfig(
                "chunk_max_tokens must be greater than 0".into(),
            ));
        }
        if self.chunk_overlap_tokens >= self.chunk_max_tokens {
            return Err(RagError::InvalidConfig(format!(
                "chunk_overlap_tokens ({}) must be less than chunk_max_tokens ({})",
                self.chunk_overlap_tokens, self.chunk_max_tokens
            )));
        }
        if self.retrieval_k == 0 {
            return Err(RagError::InvalidConfig("retrieval_k must be at least 1".into()));
        }
        if let Some(floor) = self.min_similarity {
            if !(-1.0..=1.0).contains(&floor) {
                return Err(RagError::InvalidConfig(format!(
                    "min_similarity must be within [-1, 1]: {}",
                    floor
                )));
            }
        }
        if self.embedding_model_id.trim().is_empty() {
            return Err(RagError::InvalidConfig("embedding_model_id is empty".into()));
        }
        if self.embedding_dimension == 0 {
            return Err(RagError::InvalidConfig(
                "embedding_dimension must be greater than 0".into(),
            ));
        }
        if self.embedding_batch_size == 0 {
            return Err(RagError::InvalidConfig(
                "embedding_batch_size must be greater than 0".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(RagError::InvalidConfig(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(RagError::InvalidConfig(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.rerank_top_n == 0 {
            return Err(RagError::InvalidConfig("rerank_top_n must be at least 1".into()));
        }
        if self.ingest_concurrency == 0 {
            return Err(RagError::InvalidConfig(
                "ingest_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// 데이터 디렉토리 (설정값 또는 기본 위치)
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(get_data_dir)
    }

    /// 컬렉션 DB 파일 경로
    pub fn collection_path(&self) -> PathBuf {
        self.data_dir()
            .join("collections")
            .join(format!("{}.db", self.collection))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| RagError::InvalidConfig(format!("{} is not a number: {}", key, value)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RagConfig::default().validate().is_ok());
        assert!(RagConfig::local().validate().is_ok());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_window() {
        let config = RagConfig {
            chunk_max_tokens: 10,
            chunk_overlap_tokens: 10,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, RagError::InvalidConfig(_)));
    }

    #[test]
    fn test_zero_k_rejected() {
        let config = RagConfig {
            retrieval_k: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RagError::InvalidConfig(_))));
    }

    #[test]
    fn test_rerank_settings() {
        let config = RagConfig {
            rerank_top_n: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RagError::InvalidConfig(_))));
        assert_eq!(RerankStrategy::parse(" Lexical ").unwrap(), RerankStrategy::Lexical);
        assert!(RerankStrategy::parse("cross-encoder").is_err());
    }

    #[test]
    fn test_collection_name_rejected() {
        let config = RagConfig {
            collection: "../escape".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RagError::InvalidConfig(_))));
    }

    #[test]
    fn test_from_toml() {
        let raw = r#"
            collection = "handbook"
            chunk_max_tokens = 120
            chunk_overlap_tokens = 20
            retrieval_k = 3
            embedding_provider = "local"
            similarity_metric = "cosine"
            rerank = "none"

            [retry]
            max_attempts = 2

            [abbreviations]
            KYC = "know your customer"
        "#;
        let config = RagConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.collection, "handbook");
        assert_eq!(config.chunk_max_tokens, 120);
        assert_eq!(config.retrieval_k, 3);
        assert_eq!(config.embedding_provider, ProviderKind::Local);
        assert_eq!(config.rerank, RerankStrategy::None);
        assert_eq!(config.rerank_top_n, 3);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_backoff_ms, 500);
        assert_eq!(
            config.abbreviations.get("KYC").map(String::as_str),
            Some("know your customer")
        );
    }

    #[test]
    fn test_unknown_metric_is_invalid_config() {
        let err = RagConfig::from_toml_str("similarity_metric = \"l2\"").unwrap_err();
        assert!(matches!(err, RagError::InvalidConfig(_)));
        assert!(SimilarityMetric::parse("dot").is_err());
        assert_eq!(SimilarityMetric::parse("Cosine").unwrap(), SimilarityMetric::Cosine);
    }

    #[test]
    fn test_collection_path() {
        let config = RagConfig {
            data_dir: Some(PathBuf::from("/tmp/rag")),
            collection: "docs".into(),
            ..Default::default()
        };
        assert_eq!(
            config.collection_path(),
            PathBuf::from("/tmp/rag/collections/docs.db")
        );
    }
}
