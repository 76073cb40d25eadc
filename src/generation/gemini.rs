//! Google Gemini 텍스트 생성 (generateContent)
//!
//! 답변 생성기와 LLM 쿼리 재작성기가 공유합니다.
//!
//! source: https://ai.google.dev/api/generate-content

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{format_context, parse_citations, AnswerSynthesizer, SynthesizedAnswer};
use crate::error::{RagError, Result};
use crate::gemini::GeminiClient;
use crate::knowledge::RetrievedChunk;

/// 기본 생성 모델
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

// ============================================================================
// GeminiGenerator
// ============================================================================

/// 단일 프롬프트 → 텍스트 생성
#[derive(Debug, Clone)]
pub struct GeminiGenerator {
    client: GeminiClient,
    model: String,
}

impl GeminiGenerator {
    pub fn new(client: GeminiClient, model: impl Into<String>) -> Result<Self> {
        let model = model.into();
        if model.trim().is_empty() {
            return Err(RagError::InvalidConfig("generation model is empty".into()));
        }
        Ok(Self { client, model })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// 프롬프트 생성 호출
    ///
    /// 4xx 거부와 빈 응답은 `GenerationError`로 노출됩니다.
    pub async fn generate(&self, prompt: &str, temperature: f32, max_output_tokens: u32) -> Result<String> {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature,
                max_output_tokens,
            },
        };

        let url = GeminiClient::model_url(&self.model, "generateContent");
        let response: GenerateResponse = self
            .client
            .post_json(&url, &request, RagError::GenerationError)
            .await?;

        let text: String = response
            .candidates
            .into_iter()
            .next()
            .map(|c| c.content.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(RagError::GenerationError(format!(
                "{} returned an empty response",
                self.model
            )));
        }

        Ok(text)
    }
}

// ============================================================================
// GeminiSynthesizer
// ============================================================================

/// Gemini 기반 답변 생성기
#[derive(Debug, Clone)]
pub struct GeminiSynthesizer {
    generator: GeminiGenerator,
}

impl GeminiSynthesizer {
    pub fn new(generator: GeminiGenerator) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl AnswerSynthesizer for GeminiSynthesizer {
    async fn synthesize(&self, query: &str, context: &[RetrievedChunk]) -> Result<SynthesizedAnswer> {
        let prompt = build_answer_prompt(query, context);
        tracing::debug!("Synthesizing with {} ({} context chunks)", self.generator.model(), context.len());

        let answer_text = self.generator.generate(&prompt, 0.2, 2048).await?;
        let citations = parse_citations(&answer_text);

        Ok(SynthesizedAnswer {
            answer_text: answer_text.trim().to_string(),
            citations,
        })
    }

    fn name(&self) -> &str {
        self.generator.model()
    }
}

/// 답변 생성 프롬프트
fn build_answer_prompt(query: &str, context: &[RetrievedChunk]) -> String {
    format!(
        r#"You are a final answer synthesizer. Answer the user's question using ONLY the context documents below.

QUESTION: {query}

CONTEXT DOCUMENTS:
{context}

INSTRUCTIONS:
1. Use only facts stated in the context documents.
2. After every statement, cite the supporting document with its exact marker, e.g. [source:abc#0].
3. Never invent a marker that does not appear above.
4. If the context does not answer the question, say so plainly.

FINAL ANSWER:"#,
        query = query,
        context = format_context(context),
    )
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

// ============================================================================
// Tests
// ============================================================================
