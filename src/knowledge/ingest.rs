//! Ingestion - 문서 → 청크 → 임베딩 → 벡터 저장
//!
//! 문서 하나의 로드/청킹은 블로킹 스레드에서, 임베딩은 게이트웨이에서 수행하고,
//! 저장은 `replace_document` 한 번으로 원자적으로 반영합니다 (부분 문서 노출 없음).
//! 배치 수집은 문서 단위로 독립적이며, 한 문서의 실패가 다른 문서를 중단시키지 않습니다.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;

use super::chunker::{ChunkConfig, SlidingWindowChunker};
use super::vector::{EntryMetadata, VectorEntry, VectorStore};
use crate::config::RagConfig;
use crate::embedding::EmbeddingGateway;
use crate::error::{ErrorReport, RagError, Result};
use crate::extractor::{DocumentLoader, DEFAULT_MAX_ROWS};

// ============================================================================
// Types
// ============================================================================

/// 수집 입력 (파일 바이트 + 이름 + 소스 URI)
#[derive(Debug, Clone)]
pub struct IngestItem {
    pub filename: String,
    pub source_uri: String,
    pub bytes: Vec<u8>,
}

impl IngestItem {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        let filename = filename.into();
        Self {
            source_uri: filename.clone(),
            filename,
            bytes,
        }
    }

    /// 파일에서 읽기 (소스 URI는 file:// URL)
    pub fn from_path(path: &Path) -> Result<Self> {
        let display = path.display().to_string();
        let bytes = std::fs::read(path).map_err(|e| RagError::extraction(&display, e))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| display.clone());
        let source_uri = std::fs::canonicalize(path)
            .ok()
            .and_then(|p| url::Url::from_file_path(p).ok())
            .map(|u| u.to_string())
            .unwrap_or(display);

        Ok(Self {
            filename,
            source_uri,
            bytes,
        })
    }
}

/// 문서 하나의 수집 결과
#[derive(Debug, Clone, Serialize)]
pub struct IngestedDocument {
    pub document_id: String,
    pub source_uri: String,
    pub chunk_count: usize,
    /// 내용이 같아 건너뛰었는지
    pub unchanged: bool,
}

/// 실패한 문서
#[derive(Debug, Clone, Serialize)]
pub struct IngestFailure {
    pub source_uri: String,
    pub error: ErrorReport,
}

/// 배치 수집 요약
#[derive(Debug, Default, Serialize)]
pub struct IngestionSummary {
    pub succeeded: Vec<IngestedDocument>,
    pub skipped: Vec<IngestedDocument>,
    pub failed: Vec<IngestFailure>,
}

impl IngestionSummary {
    pub fn chunks_created(&self) -> usize {
        self.succeeded.iter().map(|d| d.chunk_count).sum()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.skipped.len() + self.failed.len()
    }
}

impl fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} documents: {} ingested ({} chunks), {} unchanged, {} failed",
            self.total(),
            self.succeeded.len(),
            self.chunks_created(),
            self.skipped.len(),
            self.failed.len()
        )
    }
}

// ============================================================================
// Ingestor
// ============================================================================

/// 수집기
#[derive(Clone)]
pub struct Ingestor {
    loader: DocumentLoader,
    chunker: SlidingWindowChunker,
    gateway: EmbeddingGateway,
    store: Arc<dyn VectorStore>,
    concurrency: usize,
    force: bool,
}

impl Ingestor {
    /// 설정 검증 후 생성
    ///
    /// 게이트웨이의 모델/차원이 컬렉션과 다르면 `StoreIncompatible`.
    pub fn new(config: &RagConfig, gateway: EmbeddingGateway, store: Arc<dyn VectorStore>) -> Result<Self> {
        config.validate()?;
        check_compatible(&gateway, store.as_ref())?;

        Ok(Self {
            loader: DocumentLoader::new(DEFAULT_MAX_ROWS),
            chunker: SlidingWindowChunker::new(ChunkConfig::from_rag_config(config)?),
            gateway,
            store,
            concurrency: config.ingest_concurrency,
            force: false,
        })
    }

    /// 내용이 같아도 다시 수집
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// 문서 수집 (파일 이름을 소스 URI로 사용), 문서 ID 반환
    pub async fn ingest_document(&self, bytes: &[u8], filename: &str) -> Result<String> {
        let item = IngestItem::new(filename, bytes.to_vec());
        Ok(self.ingest_item(item).await?.document_id)
    }

    /// 수집 항목 처리
    pub async fn ingest_item(&self, item: IngestItem) -> Result<IngestedDocument> {
        let IngestItem {
            filename,
            source_uri,
            bytes,
        } = item;

        // 1. 로드 + 청킹 (CPU 작업)
        let loader = self.loader.clone();
        let chunker = self.chunker.clone();
        let task_name = filename.clone();
        let (document, chunks) = tokio::task::spawn_blocking(move || {
            let mut document = loader.load_with_source(&bytes, &filename, &source_uri)?;
            let chunks = chunker.chunk_document(&document);
            document.metadata.chunking = Some(chunker.config().fingerprint());
            Ok::<_, RagError>((document, chunks))
        })
        .await
        .map_err(|e| RagError::extraction(&task_name, format!("extraction task failed: {}", e)))??;

        // 2. 내용과 청크 설정이 같으면 건너뛰기
        if !self.force {
            if let Some(existing) = self.store.get_document(&document.id)? {
                if existing.content_hash == document.content_hash
                    && existing.metadata.chunking == document.metadata.chunking
                {
                    tracing::info!("Unchanged, skipping: {}", document.source_uri);
                    return Ok(IngestedDocument {
                        document_id: document.id,
                        source_uri: document.source_uri,
                        chunk_count: existing.chunk_count,
                        unchanged: true,
                    });
                }
            }
        }

        if chunks.is_empty() {
            tracing::warn!("No text to index in {} (stored with 0 chunks)", document.source_uri);
        }

        // 3. 임베딩
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.gateway.embed(&texts).await?;

        // 4. 원자적 저장
        let model_id = self.gateway.model_id().to_string();
        let entries: Vec<VectorEntry> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorEntry {
                metadata: EntryMetadata::for_chunk(&document, &chunk),
                chunk,
                vector,
                model_id: model_id.clone(),
            })
            .collect();

        let written = self.store.replace_document(&document, &entries)?;
        tracing::info!(
            "Ingested {} as {} ({} chunks)",
            document.source_uri,
            document.raw_format,
            written
        );

        Ok(IngestedDocument {
            document_id: document.id,
            source_uri: document.source_uri,
            chunk_count: written,
            unchanged: false,
        })
    }

    /// 배치 수집 (최대 `ingest_concurrency`개 동시 처리)
    ///
    /// 결과는 입력 순서대로 요약에 기록됩니다.
    pub async fn ingest_batch(&self, items: Vec<IngestItem>) -> IngestionSummary {
        let total = items.len();
        let mut results: Vec<(usize, String, Result<IngestedDocument>)> = stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| async move {
                let source_uri = item.source_uri.clone();
                tracing::debug!("[{}/{}] Processing {}", index + 1, total, source_uri);
                (index, source_uri, self.ingest_item(item).await)
            })
            .buffer_unordered(self.concurrency.max(1))
            .collect()
            .await;

        results.sort_by_key(|(index, _, _)| *index);

        let mut summary = IngestionSummary::default();
        for (_, source_uri, result) in results {
            match result {
                Ok(doc) if doc.unchanged => summary.skipped.push(doc),
                Ok(doc) => summary.succeeded.push(doc),
                Err(e) => {
                    tracing::warn!("Failed to ingest {}: {}", source_uri, e);
                    summary.failed.push(IngestFailure {
                        source_uri,
                        error: ErrorReport::from(&e),
                    });
                }
            }
        }

        tracing::info!("{}", summary);
        summary
    }

    /// 문서 삭제, 삭제된 엔트리 수 반환
    pub fn remove_document(&self, document_id: &str) -> Result<usize> {
        self.store.delete(document_id)
    }

    /// 소스 URI로 문서 삭제 (없으면 None)
    pub fn remove_source(&self, source_uri: &str) -> Result<Option<usize>> {
        match self.store.find_document_by_source(source_uri)? {
            Some(doc) => self.store.delete(&doc.id).map(Some),
            None => Ok(None),
        }
    }
}

/// 게이트웨이와 컬렉션의 모델/차원 일치 확인
pub(crate) fn check_compatible(gateway: &EmbeddingGateway, store: &dyn VectorStore) -> Result<()> {
    let spec = store.spec();
    if spec.dimension != gateway.dimension() {
        return Err(RagError::StoreIncompatible(format!(
            "collection stores {}-dimension vectors, embedding gateway produces {}",
            spec.dimension,
            gateway.dimension()
        )));
    }
    if spec.model_id != gateway.model_id() {
        return Err(RagError::StoreIncompatible(format!(
            "collection was built with {}, embedding gateway uses {}",
            spec.model_id,
            gateway.model_id()
        )));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
