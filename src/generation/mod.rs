//! 생성 모듈 - 답변 합성 + 쿼리 재작성
//!
//! - `AnswerSynthesizer`: 검색된 컨텍스트로 답변 + 인용 생성
//! - `SynthesisGateway`: 재시도/타임아웃 적용, 모든 실패를 `GenerationError`로 노출
//! - `QueryRewriter`: 검색 전 쿼리 재작성 (실패는 호출자가 원문으로 폴백)
//! - `Reranker`: 검색 결과를 다시 정렬해 상위 N개만 남김
//! - `ClaimVerifier`: 답변 문장마다 인용 청크의 뒷받침 여부 확인
//!
//! 인용 표기는 `[source:<chunk_id>]`입니다. 컨텍스트 블록도 같은 표기로 제시합니다.

mod extractive;
mod gemini;
mod rerank;
mod rewrite;
mod verify;

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::config::{ProviderKind, RagConfig, RerankStrategy, RewriteStrategy};
use crate::embedding::terms;
use crate::error::{RagError, Result};
use crate::gemini::GeminiClient;
use crate::knowledge::RetrievedChunk;
use crate::retry::RetryPolicy;

pub use extractive::ExtractiveSynthesizer;
pub use gemini::{GeminiGenerator, GeminiSynthesizer, DEFAULT_MODEL};
pub use rerank::{LexicalReranker, Reranker};
pub use rewrite::{AbbreviationRewriter, LlmQueryRewriter, NoopRewriter, QueryRewriter};
pub use verify::{ClaimCheck, ClaimVerifier, SupportLevel, Verification};

// ============================================================================
// AnswerSynthesizer Trait
// ============================================================================

/// 합성된 답변
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAnswer {
    pub answer_text: String,
    /// 인용한 chunk_id 집합
    pub citations: BTreeSet<String>,
}

/// 답변 생성기 트레이트
///
/// `context`에 있는 chunk_id만 인용해야 합니다. 검증은 오케스트레이터가 다시 합니다.
#[async_trait]
pub trait AnswerSynthesizer: Send + Sync {
    async fn synthesize(&self, query: &str, context: &[RetrievedChunk]) -> Result<SynthesizedAnswer>;

    /// 로그용 이름
    fn name(&self) -> &str;
}

// ============================================================================
// SynthesisGateway
// ============================================================================

/// 답변 생성 게이트웨이
#[derive(Clone)]
pub struct SynthesisGateway {
    synthesizer: Arc<dyn AnswerSynthesizer>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl SynthesisGateway {
    pub fn new(synthesizer: Arc<dyn AnswerSynthesizer>) -> Self {
        Self {
            synthesizer,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn from_config(synthesizer: Arc<dyn AnswerSynthesizer>, config: &RagConfig) -> Self {
        Self::new(synthesizer)
            .with_retry(config.retry_policy())
            .with_timeout(config.request_timeout())
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        self.synthesizer.name()
    }

    /// 답변 합성 (재시도 소진, 타임아웃 포함 모든 실패 → `GenerationError`)
    pub async fn synthesize(&self, query: &str, context: &[RetrievedChunk]) -> Result<SynthesizedAnswer> {
        self.retry
            .run(
                "answer synthesis",
                self.timeout,
                |d| RagError::GenerationError(format!("answer synthesis timed out after {:?}", d)),
                || self.synthesizer.synthesize(query, context),
            )
            .await
            .map_err(|e| match e {
                RagError::GenerationError(_) => e,
                other => RagError::GenerationError(other.to_string()),
            })
    }
}

impl std::fmt::Debug for SynthesisGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisGateway")
            .field("synthesizer", &self.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ============================================================================
// Citation Markers
// ============================================================================

/// 인용 표기
pub fn citation_marker(chunk_id: &str) -> String {
    format!("[source:{}]", chunk_id)
}

/// 텍스트에서 인용 chunk_id 추출
pub fn parse_citations(text: &str) -> BTreeSet<String> {
    citation_re()
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect()
}

/// `keep`이 거부한 인용 표기를 본문에서 제거
///
/// 제거한 표기 바로 앞의 공백 하나만 함께 지우고, 나머지 공백과 줄 구성은 그대로 둡니다.
pub fn strip_citations(text: &str, keep: impl Fn(&str) -> bool) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut removed = false;

    for caps in citation_re().captures_iter(text) {
        let (Some(whole), Some(id)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if keep(id.as_str()) {
            continue;
        }
        removed = true;

        let mut start = whole.start();
        let mut end = whole.end();
        if start > last && text[..start].ends_with(' ') {
            start -= 1;
        } else if text[end..].starts_with(' ') && (start == 0 || text[..start].ends_with('\n')) {
            end += 1;
        }

        out.push_str(&text[last..start]);
        last = end;
    }

    if !removed {
        return text.to_string();
    }
    out.push_str(&text[last..]);
    out
}

/// 컨텍스트 블록 (순위 순서, 블록마다 인용 표기)
pub fn format_context(context: &[RetrievedChunk]) -> String {
    context
        .iter()
        .map(|item| {
            let mut header = citation_marker(&item.chunk.id);
            header.push_str(&format!(" ({}", item.metadata.source_uri));
            if let Some(section) = &item.metadata.section {
                header.push_str(&format!(", {}", section));
            }
            header.push(')');
            format!("{}\n{}", header, item.chunk.text.trim())
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn citation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[source:\s*([^\]\s]+)\s*\]").expect("valid regex"))
}

// ============================================================================
// Text Helpers
// ============================================================================

/// 단어 비교에서 제외할 단어
const STOPWORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "at", "be", "by", "can", "did", "do", "does", "for", "from",
    "how", "i", "in", "is", "it", "its", "me", "my", "of", "on", "or", "our", "that", "the",
    "there", "this", "to", "was", "we", "were", "what", "when", "where", "which", "who", "why",
    "with", "you",
];

/// 불용어를 뺀 내용어 집합 (복수형 `s`는 떼어 비교)
pub(crate) fn content_terms(text: &str) -> BTreeSet<String> {
    terms(text)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .map(|t| match t.strip_suffix('s') {
            Some(stem) if stem.chars().count() >= 3 && !stem.ends_with('s') => stem.to_string(),
            _ => t,
        })
        .collect()
}

/// 문장 분리 (문장 부호 + 공백, 줄바꿈)
pub(crate) fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let boundary = match c {
            '\n' => true,
            '.' | '!' | '?' => chars.peek().map_or(true, |(_, next)| next.is_whitespace()),
            _ => false,
        };
        if boundary {
            let end = i + c.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

// ============================================================================
// Factory Functions
// ============================================================================

/// 설정에 맞는 답변 생성기
pub fn create_synthesizer(config: &RagConfig) -> Result<Arc<dyn AnswerSynthesizer>> {
    match config.generation_provider {
        ProviderKind::Gemini => {
            let generator = gemini_generator(config)?;
            tracing::info!("Using Gemini answer synthesis ({})", generator.model());
            Ok(Arc::new(GeminiSynthesizer::new(generator)))
        }
        ProviderKind::Local => {
            tracing::info!("Using local extractive answer synthesis");
            Ok(Arc::new(ExtractiveSynthesizer::default()))
        }
    }
}

/// 설정에 맞는 재정렬기 (`none`이면 None)
pub fn create_reranker(config: &RagConfig) -> Option<Arc<dyn Reranker>> {
    match config.rerank {
        RerankStrategy::None => None,
        RerankStrategy::Lexical => Some(Arc::new(LexicalReranker::new(config.rerank_top_n))),
    }
}

/// 설정에 맞는 쿼리 재작성기
pub fn create_rewriter(config: &RagConfig) -> Result<Arc<dyn QueryRewriter>> {
    match config.query_rewrite {
        RewriteStrategy::None => Ok(Arc::new(NoopRewriter)),
        RewriteStrategy::Abbreviations => Ok(Arc::new(AbbreviationRewriter::new(&config.abbreviations))),
        RewriteStrategy::Llm => {
            if config.generation_provider != ProviderKind::Gemini {
                return Err(RagError::InvalidConfig(
                    "query_rewrite = \"llm\" requires the gemini generation provider".into(),
                ));
            }
            Ok(Arc::new(
                LlmQueryRewriter::new(gemini_generator(config)?)
                    .with_retry(config.retry_policy())
                    .with_timeout(config.request_timeout()),
            ))
        }
    }
}

fn gemini_generator(config: &RagConfig) -> Result<GeminiGenerator> {
    let client = GeminiClient::from_env(config.request_timeout())?;
    GeminiGenerator::new(client, config.generation_model.clone())
}

// ============================================================================
// Tests
// ============================================================================
