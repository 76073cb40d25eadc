//! 에러 타입 정의
//!
//! 라이브러리 전체에서 사용하는 에러 분류입니다.
//! - 수집 단계: UnsupportedFormat, ExtractionError (문서 단위로 복구 가능)
//! - 생성 시점: InvalidConfig, StoreIncompatible (치명적)
//! - 외부 모델 호출: ModelUnavailable, RateLimited (일시적, 재시도 후 노출)
//! - 질의 단계: GenerationError, PipelineError (실행 단위로 치명적)

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::pipeline::Stage;

/// 라이브러리 Result 별칭
pub type Result<T> = std::result::Result<T, RagError>;

// ============================================================================
// RagError
// ============================================================================

#[derive(Debug, Error)]
pub enum RagError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to extract text from {source_name}: {reason}")]
    ExtractionError { source_name: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("incompatible vector store: {0}")]
    StoreIncompatible(String),

    #[error("generation failed: {0}")]
    GenerationError(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("run cancelled")]
    Cancelled,
}

impl RagError {
    /// 추출 에러 생성 헬퍼
    pub fn extraction(source_name: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::ExtractionError {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    /// 기계 판독용 에러 종류
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedFormat(_) => "UnsupportedFormat",
            Self::ExtractionError { .. } => "ExtractionError",
            Self::InvalidConfig(_) => "InvalidConfig",
            Self::ModelUnavailable(_) => "ModelUnavailable",
            Self::RateLimited(_) => "RateLimited",
            Self::StoreIncompatible(_) => "StoreIncompatible",
            Self::GenerationError(_) => "GenerationError",
            Self::Storage(_) => "Storage",
            Self::Cancelled => "Cancelled",
        }
    }

    /// 재시도 대상 여부 (외부 모델의 일시적 실패)
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ModelUnavailable(_) | Self::RateLimited(_))
    }
}

impl From<rusqlite::Error> for RagError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<std::io::Error> for RagError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for RagError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(format!("metadata serialization: {}", e))
    }
}

// ============================================================================
// PipelineError
// ============================================================================

/// 질의 파이프라인의 치명적 실패 (실패한 단계 + 원인)
#[derive(Debug, Error)]
#[error("pipeline failed at {stage}: {cause}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub cause: RagError,
}

impl PipelineError {
    pub fn new(stage: Stage, cause: RagError) -> Self {
        Self { stage, cause }
    }

    /// 사용자에게 보여줄 구조화된 에러
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.cause.kind(),
            stage: Some(self.stage),
            message: self.cause.to_string(),
        }
    }
}

/// 구조화된 에러 보고 (종류 + 메시지, 스택 트레이스 없음)
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub message: String,
}

impl From<&RagError> for ErrorReport {
    fn from(e: &RagError) -> Self {
        Self {
            kind: e.kind(),
            stage: None,
            message: e.to_string(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
