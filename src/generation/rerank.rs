//! 검색 결과 재정렬 - 답변 생성 전 컨텍스트를 상위 N개로 압축
//!
//! 벡터 유사도만으로 뽑힌 후보를 쿼리 단어 포함률과 섞어 다시 정렬합니다.
//! 재정렬은 순서와 개수만 바꾸며, 각 청크의 유사도 점수는 그대로 둡니다.

use std::collections::BTreeSet;

use async_trait::async_trait;

use super::content_terms;
use crate::error::Result;
use crate::knowledge::RetrievedChunk;

/// 결합 점수에서 벡터 유사도의 비중 (나머지는 단어 포함률)
const SIMILARITY_WEIGHT: f32 = 0.5;

/// 재정렬기 트레이트
///
/// 반환값은 `candidates`의 부분집합이어야 합니다.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, candidates: &[RetrievedChunk]) -> Result<Vec<RetrievedChunk>>;

    /// 로그용 이름
    fn name(&self) -> &str;
}

// ============================================================================
// LexicalReranker
// ============================================================================

/// 유사도 + 쿼리 내용어 포함률로 재정렬하는 로컬 구현
#[derive(Debug, Clone)]
pub struct LexicalReranker {
    top_n: usize,
}

impl LexicalReranker {
    pub fn new(top_n: usize) -> Self {
        Self { top_n: top_n.max(1) }
    }

    pub fn top_n(&self) -> usize {
        self.top_n
    }

    /// 쿼리 내용어 중 청크에 나오는 비율
    fn coverage(query_terms: &BTreeSet<String>, text: &str) -> f32 {
        if query_terms.is_empty() {
            return 0.0;
        }
        let chunk_terms = content_terms(text);
        query_terms.intersection(&chunk_terms).count() as f32 / query_terms.len() as f32
    }
}

#[async_trait]
impl Reranker for LexicalReranker {
    async fn rerank(&self, query: &str, candidates: &[RetrievedChunk]) -> Result<Vec<RetrievedChunk>> {
        let query_terms = content_terms(query);

        let mut scored: Vec<(f32, usize, &RetrievedChunk)> = candidates
            .iter()
            .enumerate()
            .map(|(rank, item)| {
                let coverage = Self::coverage(&query_terms, &item.chunk.text);
                let combined = SIMILARITY_WEIGHT * item.score + (1.0 - SIMILARITY_WEIGHT) * coverage;
                (combined, rank, item)
            })
            .collect();

        // 결합 점수 내림차순, 동점은 원래 순위
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.truncate(self.top_n);

        tracing::debug!(
            "Reranked {} candidates → {}",
            candidates.len(),
            scored.iter().map(|(_, _, item)| item.chunk.id.as_str()).collect::<Vec<_>>().join(", ")
        );

        Ok(scored.into_iter().map(|(_, _, item)| item.clone()).collect())
    }

    fn name(&self) -> &str {
        "lexical"
    }
}

// ============================================================================
// Tests
// ============================================================================
