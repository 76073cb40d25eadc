//! 임베딩 모듈 - 텍스트 벡터화
//!
//! - `EmbeddingProvider`: 외부 임베딩 모델 인터페이스 (배치 단위)
//! - `EmbeddingGateway`: 배치 분할 + 재시도/타임아웃 + 응답 검증
//!
//! ## 사용법
//! ```rust,ignore
//! let gateway = EmbeddingGateway::from_config(create_provider(&config)?, &config);
//! let vectors = gateway.embed(&["Hello, world!".to_string()]).await?;
//! ```

mod gemini;
mod local;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ProviderKind, RagConfig};
use crate::error::{RagError, Result};
use crate::gemini::GeminiClient;
use crate::retry::RetryPolicy;

pub use gemini::{GeminiEmbedding, DEFAULT_DIMENSION, DEFAULT_MODEL};
pub use local::{LocalHashEmbedding, LOCAL_DEFAULT_DIMENSION, LOCAL_MODEL_ID};
pub(crate) use local::terms;

/// 기본 배치 크기
pub const DEFAULT_BATCH_SIZE: usize = 32;

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 같은 모델 버전에서 같은 텍스트는 같은 벡터를 반환해야 합니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 배치 임베딩 (입력과 같은 길이/순서)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 모델 식별자 (컬렉션 키)
    fn model_id(&self) -> &str;
}

// ============================================================================
// EmbeddingGateway
// ============================================================================

/// 임베딩 게이트웨이
///
/// 입력을 `batch_size` 단위로 나눠 호출하고, 배치마다 재시도 정책과 타임아웃을 적용합니다.
/// 타임아웃은 `ModelUnavailable`로 노출됩니다.
#[derive(Clone)]
pub struct EmbeddingGateway {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    retry: RetryPolicy,
    timeout: Duration,
}

impl EmbeddingGateway {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(provider: Arc<dyn EmbeddingProvider>, config: &RagConfig) -> Self {
        Self::new(provider)
            .with_batch_size(config.embedding_batch_size)
            .with_retry(config.retry_policy())
            .with_timeout(config.request_timeout())
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    pub fn model_id(&self) -> &str {
        self.provider.model_id()
    }

    /// 텍스트 목록 임베딩 (입력과 같은 길이/순서)
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        let batches = texts.len().div_ceil(self.batch_size);

        for (i, batch) in texts.chunks(self.batch_size).enumerate() {
            tracing::debug!("Embedding batch {}/{} ({} texts)", i + 1, batches, batch.len());

            let batch_vectors = self
                .retry
                .run(
                    "embedding request",
                    self.timeout,
                    |d| RagError::ModelUnavailable(format!("embedding request timed out after {:?}", d)),
                    || self.provider.embed_batch(batch),
                )
                .await?;

            self.check_batch(batch.len(), &batch_vectors)?;
            vectors.extend(batch_vectors);
        }

        Ok(vectors)
    }

    /// 단일 텍스트 임베딩 (1개짜리 배치)
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| RagError::ModelUnavailable("provider returned no vector".into()))
    }

    fn check_batch(&self, expected: usize, vectors: &[Vec<f32>]) -> Result<()> {
        if vectors.len() != expected {
            return Err(RagError::ModelUnavailable(format!(
                "{} returned {} vectors for {} texts",
                self.model_id(),
                vectors.len(),
                expected
            )));
        }
        let dimension = self.dimension();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
            return Err(RagError::ModelUnavailable(format!(
                "{} returned a {}-dimension vector, expected {}",
                self.model_id(),
                bad.len(),
                dimension
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for EmbeddingGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingGateway")
            .field("model_id", &self.model_id())
            .field("dimension", &self.dimension())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

// ============================================================================
// Factory Function
// ============================================================================

/// 설정에 맞는 임베딩 프로바이더 생성
pub fn create_provider(config: &RagConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.embedding_provider {
        ProviderKind::Gemini => {
            let client = GeminiClient::from_env(config.request_timeout())?;
            let embedder = GeminiEmbedding::new(
                client,
                config.embedding_model_id.clone(),
                config.embedding_dimension,
            )?;
            tracing::info!(
                "Using Gemini API embedding ({}, dimension: {})",
                config.embedding_model_id,
                config.embedding_dimension
            );
            Ok(Arc::new(embedder))
        }
        ProviderKind::Local => {
            let embedder = LocalHashEmbedding::new(config.embedding_dimension)?;
            tracing::info!(
                "Using local hash embedding (dimension: {})",
                config.embedding_dimension
            );
            Ok(Arc::new(embedder))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
