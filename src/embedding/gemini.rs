//! Google Gemini 임베딩 (batchEmbedContents)
//!
//! source: https://ai.google.dev/gemini-api/docs/embeddings

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::gemini::GeminiClient;

/// 기본 임베딩 모델
pub const DEFAULT_MODEL: &str = "gemini-embedding-001";

/// 기본 임베딩 차원
pub const DEFAULT_DIMENSION: usize = 768;

/// MRL 권장 차원
const SUPPORTED_DIMENSIONS: [usize; 3] = [768, 1536, 3072];

/// Google Gemini 임베딩 구현체
#[derive(Debug, Clone)]
pub struct GeminiEmbedding {
    client: GeminiClient,
    model: String,
    dimension: usize,
}

impl GeminiEmbedding {
    /// 새 Gemini 임베딩 인스턴스 생성
    ///
    /// # Arguments
    /// * `client` - Gemini HTTP 클라이언트
    /// * `model` - 임베딩 모델 이름 (예: gemini-embedding-001)
    /// * `dimension` - 임베딩 차원 (768, 1536, 3072 중 선택)
    pub fn new(client: GeminiClient, model: impl Into<String>, dimension: usize) -> Result<Self> {
        if !SUPPORTED_DIMENSIONS.contains(&dimension) {
            return Err(RagError::InvalidConfig(format!(
                "Invalid dimension: {}. Must be 768, 1536, or 3072",
                dimension
            )));
        }

        let model = model.into();
        if model.trim().is_empty() {
            return Err(RagError::InvalidConfig("embedding model is empty".into()));
        }

        Ok(Self {
            client,
            model,
            dimension,
        })
    }

    fn build_request(&self, texts: &[String]) -> BatchEmbedRequest {
        let model = format!("models/{}", self.model);
        BatchEmbedRequest {
            requests: texts
                .iter()
                .map(|text| EmbedRequest {
                    model: model.clone(),
                    content: EmbedContent {
                        parts: vec![EmbedPart { text: text.clone() }],
                    },
                    task_type: "RETRIEVAL_DOCUMENT",
                    output_dimensionality: Some(self.dimension),
                })
                .collect(),
        }
    }
}

/// Gemini API 요청 본문
#[derive(Debug, Serialize)]
struct BatchEmbedRequest {
    requests: Vec<EmbedRequest>,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    content: EmbedContent,
    #[serde(rename = "taskType")]
    task_type: &'static str,
    #[serde(rename = "outputDimensionality", skip_serializing_if = "Option::is_none")]
    output_dimensionality: Option<usize>,
}

#[derive(Debug, Serialize)]
struct EmbedContent {
    parts: Vec<EmbedPart>,
}

#[derive(Debug, Serialize)]
struct EmbedPart {
    text: String,
}

/// Gemini API 응답
#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedding {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        // 빈 텍스트는 API가 거부하므로 영벡터로 대체
        let (blank, non_blank): (Vec<usize>, Vec<usize>) =
            (0..texts.len()).partition(|&i| texts[i].trim().is_empty());
        if non_blank.is_empty() {
            return Ok(vec![vec![0.0; self.dimension]; texts.len()]);
        }

        let request_texts: Vec<String> = non_blank.iter().map(|&i| texts[i].clone()).collect();
        let url = GeminiClient::model_url(&self.model, "batchEmbedContents");
        tracing::debug!("Embedding {} texts with {}", request_texts.len(), self.model);

        let response: BatchEmbedResponse = self
            .client
            .post_json(&url, &self.build_request(&request_texts), RagError::ModelUnavailable)
            .await?;

        if response.embeddings.len() != request_texts.len() {
            return Err(RagError::ModelUnavailable(format!(
                "Gemini returned {} embeddings for {} texts",
                response.embeddings.len(),
                request_texts.len()
            )));
        }

        let mut vectors = vec![Vec::new(); texts.len()];
        for i in blank {
            vectors[i] = vec![0.0; self.dimension];
        }
        for (i, values) in non_blank.into_iter().zip(response.embeddings) {
            vectors[i] = values.values;
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Tests
// ============================================================================
