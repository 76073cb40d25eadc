//! Knowledge 모듈 - 청킹 + 벡터 저장 + 수집/검색
//!
//! - Chunker: 토큰 윈도우 슬라이딩 분할 (문단/문장 경계 선호)
//! - Store: SQLite 기반 벡터 컬렉션 (컬렉션 = 모델 + 차원 + 메트릭)
//! - Ingest: 문서 → 청크 → 임베딩 → 저장
//! - Retriever: 쿼리 임베딩 + 상위 k개 검색

mod chunker;
mod ingest;
mod retriever;
pub(crate) mod store;
mod vector;

// Re-exports
pub use chunker::{chunk, chunk_id, Chunk, ChunkConfig, SlidingWindowChunker};
pub(crate) use ingest::check_compatible;
pub use ingest::{IngestFailure, IngestItem, IngestedDocument, IngestionSummary, Ingestor};
pub use retriever::Retriever;
pub use store::{SqliteVectorStore, StoreStats};
pub use vector::{
    cosine_similarity, normalize, CollectionSpec, DocumentRecord, EntryMetadata, RetrievalResult,
    RetrievedChunk, SearchFilter, VectorEntry, VectorStore,
};

#[cfg(test)]
pub(crate) use ingest::tests as ingest_tests;
