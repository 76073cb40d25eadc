//! Vector Store - 벡터 저장소 트레이트 및 유틸리티
//!
//! 유사도 메트릭은 정규화 벡터의 코사인 유사도로 고정합니다.
//! 검색 결과는 점수 내림차순, 동점이면 먼저 삽입된 청크가 앞에 옵니다.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::chunker::Chunk;
use crate::config::SimilarityMetric;
use crate::error::Result;
use crate::extractor::{Document, DocumentFormat, ExtractionMetadata};

// ============================================================================
// Types
// ============================================================================

/// 엔트리 메타데이터 (검색 결과와 인용에 사용)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub source_uri: String,
    pub format: DocumentFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

impl EntryMetadata {
    pub fn for_chunk(document: &Document, chunk: &Chunk) -> Self {
        Self {
            source_uri: document.source_uri.clone(),
            format: document.raw_format,
            title: document.metadata.title.clone(),
            section: chunk.section.clone(),
        }
    }
}

/// 벡터 엔트리 (저장용)
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub chunk: Chunk,
    /// 임베딩 벡터 (저장 시 정규화)
    pub vector: Vec<f32>,
    pub metadata: EntryMetadata,
    /// 벡터를 만든 임베딩 모델
    pub model_id: String,
}

/// 검색된 청크
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    /// 코사인 유사도 (-1.0 ~ 1.0)
    pub score: f32,
    pub metadata: EntryMetadata,
    /// 삽입 순서 (동점 정렬 키)
    #[serde(skip)]
    pub seq: i64,
}

/// 검색 결과 (점수 내림차순, 길이 ≤ k)
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalResult {
    pub items: Vec<RetrievedChunk>,
}

impl RetrievalResult {
    /// 점수 내림차순 → 삽입 순서 오름차순으로 정렬 후 k개로 자르기
    pub fn ranked(mut items: Vec<RetrievedChunk>, k: usize) -> Self {
        items.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.seq.cmp(&b.seq)));
        items.truncate(k);
        Self { items }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RetrievedChunk> {
        self.items.iter()
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.items.iter().any(|item| item.chunk.id == chunk_id)
    }

    pub fn chunk_ids(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.chunk.id.as_str()).collect()
    }
}

/// 검색 필터 (비어 있는 조건은 무시)
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub document_ids: Vec<String>,
    pub formats: Vec<DocumentFormat>,
}

impl SearchFilter {
    pub fn matches(&self, document_id: &str, format: DocumentFormat) -> bool {
        (self.document_ids.is_empty() || self.document_ids.iter().any(|id| id == document_id))
            && (self.formats.is_empty() || self.formats.contains(&format))
    }
}

/// 저장된 문서 정보
#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub id: String,
    pub source_uri: String,
    pub raw_format: DocumentFormat,
    pub content_hash: String,
    pub metadata: ExtractionMetadata,
    pub created_at: DateTime<Utc>,
    pub chunk_count: usize,
}

/// 컬렉션 식별 정보 (모델 + 차원 + 메트릭)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionSpec {
    pub model_id: String,
    pub dimension: usize,
    pub metric: SimilarityMetric,
}

// ============================================================================
// VectorStore Trait
// ============================================================================

/// VectorStore 트레이트
///
/// 벡터 저장소의 공통 인터페이스입니다. 모든 쓰기는 원자적입니다.
pub trait VectorStore: Send + Sync {
    /// 컬렉션 정보
    fn spec(&self) -> &CollectionSpec;

    /// 엔트리 배치 저장 (같은 chunk_id는 덮어씀), 저장 개수 반환
    fn upsert(&self, entries: &[VectorEntry]) -> Result<usize>;

    /// 벡터 검색
    fn search(&self, query_vector: &[f32], k: usize, filter: Option<&SearchFilter>) -> Result<RetrievalResult>;

    /// 문서의 모든 엔트리 삭제, 삭제 개수 반환
    fn delete(&self, document_id: &str) -> Result<usize>;

    /// 문서 기록 + 엔트리 저장 + 이전 버전의 남은 엔트리 삭제 (단일 트랜잭션)
    fn replace_document(&self, document: &Document, entries: &[VectorEntry]) -> Result<usize>;

    /// 엔트리 개수
    fn count(&self) -> Result<usize>;

    /// 문서의 엔트리 개수
    fn document_entry_count(&self, document_id: &str) -> Result<usize>;

    fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>>;

    fn find_document_by_source(&self, source_uri: &str) -> Result<Option<DocumentRecord>>;

    /// 최근 문서 목록
    fn list_documents(&self, limit: usize) -> Result<Vec<DocumentRecord>>;
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 코사인 유사도 계산
///
/// 결과는 -1.0 ~ 1.0 범위이며, 길이가 다르거나 영벡터면 0.0입니다.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// L2 정규화 (영벡터는 그대로)
pub fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|x| x / norm).collect()
}

/// 정규화된 벡터 간 내적 (= 코사인 유사도)
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

// ============================================================================
// Tests
// ============================================================================
