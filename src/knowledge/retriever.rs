//! Retriever - 쿼리 임베딩 + 벡터 검색
//!
//! 임베딩 실패는 그대로 전파합니다. 폴백 여부는 호출자(오케스트레이터)가 결정합니다.

use std::sync::Arc;

use super::vector::{RetrievalResult, SearchFilter, VectorStore};
use crate::embedding::EmbeddingGateway;
use crate::error::Result;

/// 검색기
#[derive(Clone)]
pub struct Retriever {
    gateway: EmbeddingGateway,
    store: Arc<dyn VectorStore>,
}

impl Retriever {
    pub fn new(gateway: EmbeddingGateway, store: Arc<dyn VectorStore>) -> Self {
        Self { gateway, store }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn gateway(&self) -> &EmbeddingGateway {
        &self.gateway
    }

    /// 상위 k개 청크 검색
    pub async fn retrieve(&self, query_text: &str, k: usize) -> Result<RetrievalResult> {
        self.retrieve_filtered(query_text, k, None).await
    }

    /// 필터를 적용한 검색
    pub async fn retrieve_filtered(
        &self,
        query_text: &str,
        k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<RetrievalResult> {
        let query_vector = self.gateway.embed_one(query_text).await?;
        let result = self.store.search(&query_vector, k, filter)?;

        tracing::debug!(
            "Retrieved {} chunks for query (k={}, top score={:?})",
            result.len(),
            k,
            result.items.first().map(|r| r.score)
        );
        Ok(result)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::tests::{fast_retry, FlakyEmbedding};
    use crate::embedding::LocalHashEmbedding;
    use crate::error::RagError;
    use crate::knowledge::store::tests::spec;
    use crate::knowledge::SqliteVectorStore;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir, dimension: usize, model: &str) -> Arc<dyn VectorStore> {
        let mut collection = spec(dimension);
        collection.model_id = model.to_string();
        Arc::new(SqliteVectorStore::open(&dir.path().join("r.db"), collection).unwrap())
    }

    #[tokio::test]
    async fn test_empty_store_returns_empty_result() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(LocalHashEmbedding::new(32).unwrap());
        let retriever = Retriever::new(
            EmbeddingGateway::new(provider),
            open_store(&dir, 32, crate::embedding::LOCAL_MODEL_ID),
        );

        let result = retriever.retrieve("anything at all", 5).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_embedding_failure_propagates() {
        let dir = TempDir::new().unwrap();
        let retriever = Retriever::new(
            EmbeddingGateway::new(Arc::new(FlakyEmbedding::new(10))).with_retry(fast_retry(2)),
            open_store(&dir, 16, "flaky"),
        );

        let err = retriever.retrieve("query", 3).await.unwrap_err();
        assert!(matches!(err, RagError::RateLimited(_)));
    }
}
