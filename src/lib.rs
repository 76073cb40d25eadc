//! ragpipe - 문서 기반 질의응답 RAG 파이프라인
//!
//! 문서(PDF, Word, 스프레드시트, CSV, 텍스트, HTML)를 청크로 나눠 임베딩하고
//! SQLite 벡터 컬렉션에 저장한 뒤, 다단계 오케스트레이터로
//! 출처가 인용된 답변을 생성합니다.
//!
//! - 수집: Loader → Chunker → Embedding Gateway → Vector Store
//! - 질의: REWRITE_QUERY → RETRIEVE(재정렬) → SYNTHESIZE → CITE(주장 검증)

pub mod cli;
pub mod collector;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extractor;
pub mod gemini;
pub mod generation;
pub mod knowledge;
pub mod pipeline;
pub mod retry;

// Re-exports
pub use config::RagConfig;
pub use embedding::{EmbeddingGateway, EmbeddingProvider, GeminiEmbedding, LocalHashEmbedding};
pub use error::{ErrorReport, PipelineError, RagError, Result};
pub use extractor::{Document, DocumentFormat, DocumentLoader};
pub use gemini::{get_api_key, has_api_key};
pub use generation::{
    AnswerSynthesizer, ClaimVerifier, QueryRewriter, Reranker, SynthesisGateway, SynthesizedAnswer, Verification,
};
pub use knowledge::{
    chunk, Chunk, ChunkConfig, IngestionSummary, Ingestor, RetrievalResult, RetrievedChunk, Retriever,
    SqliteVectorStore, VectorEntry, VectorStore,
};
pub use pipeline::{Citation, Pipeline, QueryAnswer, Stage, INSUFFICIENT_CONTEXT_ANSWER};
