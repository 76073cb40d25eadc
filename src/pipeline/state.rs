//! 파이프라인 단계 + 실행 상태 + 결과 타입

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::generation::{ClaimCheck, Verification};
use crate::knowledge::{RetrievalResult, RetrievedChunk};

/// 인용 발췌 최대 길이 (문자)
pub const EXCERPT_MAX_CHARS: usize = 240;

// ============================================================================
// Stage
// ============================================================================

/// 오케스트레이터 단계
///
/// `START → REWRITE_QUERY → RETRIEVE → {EMPTY_RESULT_BRANCH | SYNTHESIZE → CITE} → END`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Start,
    RewriteQuery,
    Retrieve,
    EmptyResultBranch,
    Synthesize,
    Cite,
    End,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::RewriteQuery => "REWRITE_QUERY",
            Self::Retrieve => "RETRIEVE",
            Self::EmptyResultBranch => "EMPTY_RESULT_BRANCH",
            Self::Synthesize => "SYNTHESIZE",
            Self::Cite => "CITE",
            Self::End => "END",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// PipelineState
// ============================================================================

/// 한 번의 실행 동안만 존재하는 상태
///
/// `stage_history`는 추가만 됩니다. `citations`는 CITE 이후 `filtered_context`의 부분집합입니다.
#[derive(Debug)]
pub struct PipelineState {
    pub run_id: Uuid,
    pub query: String,
    pub rewritten_query: Option<String>,
    pub retrieved: RetrievalResult,
    pub filtered_context: Vec<RetrievedChunk>,
    pub draft_answer: Option<String>,
    pub citations: BTreeSet<String>,
    /// CITE 단계의 주장 검증 결과
    pub verification: Option<Verification>,
    /// 실행 중 기록된 한계 (빈 검색 결과, 제거된 인용)
    pub limitations: Vec<String>,
    stage_history: Vec<Stage>,
}

impl PipelineState {
    pub fn new(query: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            query: query.to_string(),
            rewritten_query: None,
            retrieved: RetrievalResult::default(),
            filtered_context: Vec::new(),
            draft_answer: None,
            citations: BTreeSet::new(),
            verification: None,
            limitations: Vec::new(),
            stage_history: Vec::new(),
        }
    }

    /// 단계 진입 기록
    pub fn enter(&mut self, stage: Stage) {
        tracing::debug!("→ {}", stage);
        self.stage_history.push(stage);
    }

    pub fn stage_history(&self) -> &[Stage] {
        &self.stage_history
    }

    /// 검색에 사용할 쿼리 (재작성본 우선)
    pub fn effective_query(&self) -> &str {
        self.rewritten_query.as_deref().unwrap_or(&self.query)
    }

    /// 최종 결과로 변환 (인용은 검색 순위 순서)
    pub fn into_answer(self) -> QueryAnswer {
        let citations: Vec<Citation> = self
            .filtered_context
            .iter()
            .filter(|item| self.citations.contains(&item.chunk.id))
            .map(Citation::from_retrieved)
            .collect();

        let verification = self.verification.unwrap_or_default();
        let mut limitations = self.limitations;
        limitations.extend(verification.limitations);

        QueryAnswer {
            run_id: self.run_id,
            query: self.query,
            rewritten_query: self.rewritten_query,
            answer: self.draft_answer.unwrap_or_default(),
            grounded: !citations.is_empty(),
            confidence: verification.confidence,
            claims: verification.claims,
            limitations,
            citations,
            retrieved: self
                .retrieved
                .items
                .iter()
                .map(|item| RetrievalHit {
                    chunk_id: item.chunk.id.clone(),
                    score: item.score,
                })
                .collect(),
            stage_history: self.stage_history,
        }
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// 답변 인용
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub chunk_id: String,
    pub document_id: String,
    pub source_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub score: f32,
    pub excerpt: String,
}

impl Citation {
    fn from_retrieved(item: &RetrievedChunk) -> Self {
        Self {
            chunk_id: item.chunk.id.clone(),
            document_id: item.chunk.document_id.clone(),
            source_uri: item.metadata.source_uri.clone(),
            section: item.chunk.section.clone(),
            score: item.score,
            excerpt: excerpt(&item.chunk.text, EXCERPT_MAX_CHARS),
        }
    }
}

/// 검색 단계 결과 요약
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalHit {
    pub chunk_id: String,
    pub score: f32,
}

/// `run_query` 결과
#[derive(Debug, Clone, Serialize)]
pub struct QueryAnswer {
    pub run_id: Uuid,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewritten_query: Option<String>,
    pub answer: String,
    pub citations: Vec<Citation>,
    /// RETRIEVE 단계 결과 (점수 내림차순)
    pub retrieved: Vec<RetrievalHit>,
    pub stage_history: Vec<Stage>,
    /// 인용이 하나 이상 있는지
    pub grounded: bool,
    /// 주장 검증 기반 신뢰도 (0~1, 검증할 주장이 없으면 0)
    pub confidence: f32,
    /// 답변 문장별 검증 결과
    pub claims: Vec<ClaimCheck>,
    /// 답변의 한계 (근거 부족, 인용 없는 주장, 제거된 인용)
    pub limitations: Vec<String>,
}

/// 공백을 정리한 발췌 (문자 단위로 자르고 "..." 추가)
fn excerpt(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", collapsed[..idx].trim_end()),
        None => collapsed,
    }
}

// ============================================================================
// Tests
// ============================================================================
