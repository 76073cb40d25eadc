//! 쿼리 재작성 - 검색 정확도를 위한 쿼리 정리
//!
//! 재작성 실패는 치명적이지 않습니다. 오케스트레이터가 원문 쿼리로 계속 진행합니다.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use super::GeminiGenerator;
use crate::error::{RagError, Result};
use crate::retry::RetryPolicy;

/// 쿼리 재작성기 트레이트
#[async_trait]
pub trait QueryRewriter: Send + Sync {
    async fn rewrite(&self, query: &str) -> Result<String>;
}

// ============================================================================
// NoopRewriter
// ============================================================================

/// 원문 그대로 반환
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRewriter;

#[async_trait]
impl QueryRewriter for NoopRewriter {
    async fn rewrite(&self, query: &str) -> Result<String> {
        Ok(query.to_string())
    }
}

// ============================================================================
// AbbreviationRewriter
// ============================================================================

/// 약어 확장 (단어 단위, 대소문자 무시)
///
/// `KYC` → `know your customer (KYC)`
#[derive(Debug, Clone)]
pub struct AbbreviationRewriter {
    table: Vec<(Regex, String)>,
}

impl AbbreviationRewriter {
    pub fn new(abbreviations: &BTreeMap<String, String>) -> Self {
        let table = abbreviations
            .iter()
            .filter(|(abbr, expansion)| !abbr.trim().is_empty() && !expansion.trim().is_empty())
            .filter_map(|(abbr, expansion)| {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(abbr.trim()));
                Regex::new(&pattern)
                    .ok()
                    .map(|re| (re, expansion.trim().to_string()))
            })
            .collect();
        Self { table }
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// 동기 확장
    pub fn expand(&self, query: &str) -> String {
        let mut expanded = query.to_string();
        for (re, expansion) in &self.table {
            expanded = re
                .replace_all(&expanded, |caps: &regex::Captures<'_>| {
                    format!("{} ({})", expansion, &caps[0])
                })
                .into_owned();
        }
        expanded
    }
}

#[async_trait]
impl QueryRewriter for AbbreviationRewriter {
    async fn rewrite(&self, query: &str) -> Result<String> {
        Ok(self.expand(query))
    }
}

// ============================================================================
// LlmQueryRewriter
// ============================================================================

/// LLM 쿼리 재구성 (모호한 쿼리 → 명확한 검색 질문)
#[derive(Debug, Clone)]
pub struct LlmQueryRewriter {
    generator: GeminiGenerator,
    retry: RetryPolicy,
    timeout: Duration,
}

impl LlmQueryRewriter {
    pub fn new(generator: GeminiGenerator) -> Self {
        Self {
            generator,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl QueryRewriter for LlmQueryRewriter {
    async fn rewrite(&self, query: &str) -> Result<String> {
        let prompt = REFORMULATE_PROMPT.replace("{query}", query);
        let output = self
            .retry
            .run(
                "query rewrite",
                self.timeout,
                |d| RagError::GenerationError(format!("query rewrite timed out after {:?}", d)),
                || self.generator.generate(&prompt, 0.0, 128),
            )
            .await?;

        clean_rewrite(&output)
            .ok_or_else(|| RagError::GenerationError("query rewrite returned no text".into()))
    }
}

/// 재구성 프롬프트
const REFORMULATE_PROMPT: &str = r#"You are a query understanding agent.
Your job is to reformulate vague or incomplete user queries into a clear, specific, and well-structured search question.
Reply with the reformulated question only.

Examples:
- Input: "workflow script bots"
  Output: "Show me diagnostic chatbot scripts that handle workflow status issues."

- Input: "approval delay issue"
  Output: "Explain possible causes and troubleshooting steps for delayed workflow approvals."

Now reformulate this query clearly:
"{query}"
"#;

/// 모델 출력 정리 (첫 줄, "Output:" 접두어와 따옴표 제거)
fn clean_rewrite(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line
        .strip_prefix("Output:")
        .map(str::trim)
        .unwrap_or(line);
    let line = line.trim_matches(|c| matches!(c, '"' | '\'' | '`')).trim();
    (!line.is_empty()).then(|| line.to_string())
}

// ============================================================================
// Tests
// ============================================================================
