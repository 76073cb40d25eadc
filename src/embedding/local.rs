//! 로컬 해시 임베딩 - 오프라인 결정적 프로바이더
//!
//! 소문자 단어(영숫자 연속)를 SHA-256으로 해싱해 차원 버킷에 누적하는
//! feature hashing 방식입니다. 모든 성분이 0 이상이므로 코사인 유사도도 0 이상입니다.
//! 같은 텍스트는 항상 같은 벡터가 됩니다.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::EmbeddingProvider;
use crate::error::{RagError, Result};

/// 로컬 임베딩 모델 식별자
pub const LOCAL_MODEL_ID: &str = "local-hash-v1";

/// 로컬 임베딩 기본 차원
pub const LOCAL_DEFAULT_DIMENSION: usize = 384;

/// Feature hashing 임베딩
#[derive(Debug, Clone)]
pub struct LocalHashEmbedding {
    dimension: usize,
}

impl LocalHashEmbedding {
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(RagError::InvalidConfig(
                "embedding dimension must be greater than 0".into(),
            ));
        }
        Ok(Self { dimension })
    }

    /// 단일 텍스트 임베딩 (동기)
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for term in terms(text) {
            let digest = Sha256::digest(term.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
            vector[index] += 1.0;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

impl Default for LocalHashEmbedding {
    fn default() -> Self {
        Self {
            dimension: LOCAL_DEFAULT_DIMENSION,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for LocalHashEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        LOCAL_MODEL_ID
    }
}

/// 소문자 영숫자 단어 목록
pub(crate) fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

// ============================================================================
// Tests
// ============================================================================
