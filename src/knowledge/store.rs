//! SQLite Vector Store - rusqlite 기반 영속 벡터 컬렉션
//!
//! 컬렉션마다 DB 파일 하나 (`<data_dir>/collections/<name>.db`).
//! - `collection_meta`: model_id / dimension / metric (열 때 검증)
//! - `documents`: 문서 기록
//! - `entries`: 청크 + 정규화 벡터 (little-endian f32 BLOB)
//!
//! 쓰기 연결과 읽기 연결을 분리하고 WAL 모드를 사용하므로,
//! 검색은 마지막으로 커밋된 스냅샷만 봅니다.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use serde::Serialize;

use super::chunker::Chunk;
use super::vector::{
    dot, normalize, CollectionSpec, DocumentRecord, EntryMetadata, RetrievalResult,
    RetrievedChunk, SearchFilter, VectorEntry, VectorStore,
};
use crate::config::{RagConfig, SimilarityMetric};
use crate::error::{RagError, Result};
use crate::extractor::{Document, DocumentFormat};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// 저장소 통계
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub document_count: usize,
    pub entry_count: usize,
    pub model_id: String,
    pub dimension: usize,
    pub metric: SimilarityMetric,
    pub db_path: PathBuf,
}

// ============================================================================
// SqliteVectorStore
// ============================================================================

/// SQLite 벡터 컬렉션
pub struct SqliteVectorStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    spec: CollectionSpec,
    db_path: PathBuf,
}

impl SqliteVectorStore {
    /// 컬렉션 열기 (없으면 생성)
    ///
    /// 기존 컬렉션의 차원/모델이 다르면 `StoreIncompatible`,
    /// 메트릭이 다르면 `InvalidConfig`로 즉시 실패합니다.
    pub fn open(path: &Path, spec: CollectionSpec) -> Result<Self> {
        if spec.dimension == 0 {
            return Err(RagError::InvalidConfig("vector dimension must be greater than 0".into()));
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let writer = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        writer.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String = writer.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            tracing::warn!("WAL journal not available for {:?} (mode={})", path, mode);
        }

        initialize_schema(&writer)?;
        check_collection_meta(&writer, &spec)?;

        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(BUSY_TIMEOUT)?;

        tracing::debug!(
            "Vector collection opened at {:?} ({}, dim={})",
            path,
            spec.model_id,
            spec.dimension
        );

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            spec,
            db_path: path.to_path_buf(),
        })
    }

    /// 설정의 컬렉션 열기
    pub fn open_collection(config: &RagConfig, model_id: &str, dimension: usize) -> Result<Self> {
        Self::open(
            &config.collection_path(),
            CollectionSpec {
                model_id: model_id.to_string(),
                dimension,
                metric: config.similarity_metric,
            },
        )
    }

    /// 저장된 컬렉션 정보 읽기 (임베딩 모델 없이 조회할 때)
    pub fn read_spec(path: &Path) -> Result<Option<CollectionSpec>> {
        if !path.exists() {
            return Ok(None);
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        let has_meta: bool = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'collection_meta'",
                [],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !has_meta {
            return Ok(None);
        }
        read_meta(&conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// 저장소 통계
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.reader()?;
        let document_count: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        let entry_count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;

        Ok(StoreStats {
            document_count: document_count as usize,
            entry_count: entry_count as usize,
            model_id: self.spec.model_id.clone(),
            dimension: self.spec.dimension,
            metric: self.spec.metric,
            db_path: self.db_path.clone(),
        })
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|e| RagError::Storage(format!("Lock error: {}", e)))
    }

    fn reader(&self) -> Result<MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|e| RagError::Storage(format!("Lock error: {}", e)))
    }

    /// 엔트리 검증 (차원, 모델)
    fn validate_entry(&self, entry: &VectorEntry) -> Result<()> {
        if entry.vector.len() != self.spec.dimension {
            return Err(RagError::StoreIncompatible(format!(
                "entry {} has {} dimensions, collection expects {}",
                entry.chunk.id,
                entry.vector.len(),
                self.spec.dimension
            )));
        }
        if entry.model_id != self.spec.model_id {
            return Err(RagError::StoreIncompatible(format!(
                "entry {} was embedded with {}, collection uses {}",
                entry.chunk.id, entry.model_id, self.spec.model_id
            )));
        }
        Ok(())
    }
}

impl VectorStore for SqliteVectorStore {
    fn spec(&self) -> &CollectionSpec {
        &self.spec
    }

    fn upsert(&self, entries: &[VectorEntry]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        for entry in entries {
            self.validate_entry(entry)?;
        }

        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        let owners: BTreeSet<&str> = entries.iter().map(|e| e.chunk.document_id.as_str()).collect();
        for document_id in owners {
            let exists = tx
                .query_row("SELECT 1 FROM documents WHERE id = ?1", params![document_id], |_| Ok(()))
                .optional()?
                .is_some();
            if !exists {
                return Err(RagError::Storage(format!(
                    "entries reference unknown document {}",
                    document_id
                )));
            }
        }

        let written = write_entries(&tx, entries)?;
        tx.commit()?;

        tracing::debug!("Upserted {} entries", written);
        Ok(written)
    }

    fn search(&self, query_vector: &[f32], k: usize, filter: Option<&SearchFilter>) -> Result<RetrievalResult> {
        if query_vector.len() != self.spec.dimension {
            return Err(RagError::StoreIncompatible(format!(
                "query vector has {} dimensions, collection expects {}",
                query_vector.len(),
                self.spec.dimension
            )));
        }
        if k == 0 {
            return Ok(RetrievalResult::default());
        }

        let query = normalize(query_vector);
        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(
            "SELECT e.seq, e.chunk_id, e.document_id, e.position, e.span_start, e.span_end,
                    e.overlap_bytes, e.overlap_tokens, e.text, e.metadata, e.vector
             FROM entries e",
        )?;

        let mut rows = stmt.query([])?;
        let mut scored = Vec::new();

        while let Some(row) = rows.next()? {
            let document_id: String = row.get(2)?;
            let metadata: EntryMetadata = serde_json::from_str(&row.get::<_, String>(9)?)?;
            if let Some(f) = filter {
                if !f.matches(&document_id, metadata.format) {
                    continue;
                }
            }

            let blob: Vec<u8> = row.get(10)?;
            let vector = decode_vector(&blob);
            if vector.len() != self.spec.dimension {
                return Err(RagError::Storage(format!(
                    "corrupt vector for {}",
                    row.get::<_, String>(1)?
                )));
            }

            let chunk = Chunk {
                id: row.get(1)?,
                document_id,
                position_index: row.get::<_, i64>(3)? as usize,
                char_span: row.get::<_, i64>(4)? as usize..row.get::<_, i64>(5)? as usize,
                overlap_with_predecessor: row.get::<_, i64>(6)? as usize,
                overlap_tokens: row.get::<_, i64>(7)? as usize,
                text: row.get(8)?,
                section: metadata.section.clone(),
            };

            scored.push(RetrievedChunk {
                score: dot(&query, &vector),
                chunk,
                metadata,
                seq: row.get(0)?,
            });
        }

        Ok(RetrievalResult::ranked(scored, k))
    }

    fn delete(&self, document_id: &str) -> Result<usize> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM entries WHERE document_id = ?1", params![document_id])?;
        tx.execute("DELETE FROM documents WHERE id = ?1", params![document_id])?;
        tx.commit()?;

        tracing::info!("Deleted document {} ({} entries)", document_id, removed);
        Ok(removed)
    }

    fn replace_document(&self, document: &Document, entries: &[VectorEntry]) -> Result<usize> {
        for entry in entries {
            self.validate_entry(entry)?;
            if entry.chunk.document_id != document.id {
                return Err(RagError::Storage(format!(
                    "entry {} does not belong to document {}",
                    entry.chunk.id, document.id
                )));
            }
        }

        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO documents (id, source_uri, raw_format, content_hash, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                source_uri = excluded.source_uri,
                raw_format = excluded.raw_format,
                content_hash = excluded.content_hash,
                metadata = excluded.metadata,
                created_at = excluded.created_at",
            params![
                document.id,
                document.source_uri,
                document.raw_format.as_str(),
                document.content_hash,
                serde_json::to_string(&document.metadata)?,
                document.created_at.to_rfc3339(),
            ],
        )?;

        let written = write_entries(&tx, entries)?;

        let keep: BTreeSet<&str> = entries.iter().map(|e| e.chunk.id.as_str()).collect();
        let existing: Vec<String> = {
            let mut stmt = tx.prepare("SELECT chunk_id FROM entries WHERE document_id = ?1")?;
            let ids = stmt
                .query_map(params![document.id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            ids
        };
        let mut stale = 0;
        for chunk_id in existing.iter().filter(|id| !keep.contains(id.as_str())) {
            stale += tx.execute("DELETE FROM entries WHERE chunk_id = ?1", params![chunk_id])?;
        }

        tx.commit()?;

        tracing::debug!(
            "Stored document {} ({} entries, {} stale removed)",
            document.id,
            written,
            stale
        );
        Ok(written)
    }

    fn count(&self) -> Result<usize> {
        let conn = self.reader()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn document_entry_count(&self, document_id: &str) -> Result<usize> {
        let conn = self.reader()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE document_id = ?1",
            params![document_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
        let conn = self.reader()?;
        query_documents(&conn, "WHERE d.id = ?1", params![document_id])
            .map(|mut docs| docs.pop())
    }

    fn find_document_by_source(&self, source_uri: &str) -> Result<Option<DocumentRecord>> {
        let conn = self.reader()?;
        query_documents(&conn, "WHERE d.source_uri = ?1", params![source_uri])
            .map(|mut docs| docs.pop())
    }

    fn list_documents(&self, limit: usize) -> Result<Vec<DocumentRecord>> {
        let conn = self.reader()?;
        query_documents(
            &conn,
            "ORDER BY d.created_at DESC LIMIT ?1",
            params![limit as i64],
        )
    }
}

// ============================================================================
// Schema
// ============================================================================

fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS collection_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            source_uri TEXT NOT NULL,
            raw_format TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            metadata TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_documents_source ON documents(source_uri);

        CREATE TABLE IF NOT EXISTS entries (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            chunk_id TEXT NOT NULL UNIQUE,
            document_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            span_start INTEGER NOT NULL,
            span_end INTEGER NOT NULL,
            overlap_bytes INTEGER NOT NULL,
            overlap_tokens INTEGER NOT NULL,
            text TEXT NOT NULL,
            metadata TEXT NOT NULL,
            vector BLOB NOT NULL,
            model_id TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_entries_document ON entries(document_id);
        "#,
    )?;
    Ok(())
}

fn read_meta(conn: &Connection) -> Result<Option<CollectionSpec>> {
    let get = |key: &str| -> Result<Option<String>> {
        Ok(conn
            .query_row(
                "SELECT value FROM collection_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    };

    let (Some(model_id), Some(dimension), Some(metric)) = (get("model_id")?, get("dimension")?, get("metric")?)
    else {
        return Ok(None);
    };

    let dimension = dimension
        .parse()
        .map_err(|_| RagError::Storage(format!("corrupt collection dimension: {}", dimension)))?;

    Ok(Some(CollectionSpec {
        model_id,
        dimension,
        metric: SimilarityMetric::parse(&metric)?,
    }))
}

/// 컬렉션 메타 검증 (새 컬렉션이면 기록)
fn check_collection_meta(conn: &Connection, spec: &CollectionSpec) -> Result<()> {
    match read_meta(conn)? {
        None => {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            let result = (|| -> Result<()> {
                for (key, value) in [
                    ("model_id", spec.model_id.clone()),
                    ("dimension", spec.dimension.to_string()),
                    ("metric", spec.metric.as_str().to_string()),
                ] {
                    conn.execute(
                        "INSERT OR REPLACE INTO collection_meta (key, value) VALUES (?1, ?2)",
                        params![key, value],
                    )?;
                }
                Ok(())
            })();
            match result {
                Ok(()) => conn.execute_batch("COMMIT")?,
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e);
                }
            }
            Ok(())
        }
        Some(stored) => {
            if stored.dimension != spec.dimension {
                return Err(RagError::StoreIncompatible(format!(
                    "collection was built with {}-dimension vectors ({}), embedding gateway produces {}",
                    stored.dimension, stored.model_id, spec.dimension
                )));
            }
            if stored.model_id != spec.model_id {
                return Err(RagError::StoreIncompatible(format!(
                    "collection was built with model {}, embedding gateway uses {}",
                    stored.model_id, spec.model_id
                )));
            }
            if stored.metric != spec.metric {
                return Err(RagError::InvalidConfig(format!(
                    "collection uses {} similarity, configuration requests {}",
                    stored.metric.as_str(),
                    spec.metric.as_str()
                )));
            }
            Ok(())
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 엔트리 쓰기 (기존 chunk_id는 seq를 유지한 채 갱신)
fn write_entries(tx: &Transaction<'_>, entries: &[VectorEntry]) -> Result<usize> {
    let now = Utc::now().to_rfc3339();
    let mut stmt = tx.prepare_cached(
        "INSERT INTO entries (chunk_id, document_id, position, span_start, span_end,
                              overlap_bytes, overlap_tokens, text, metadata, vector, model_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(chunk_id) DO UPDATE SET
            document_id = excluded.document_id,
            position = excluded.position,
            span_start = excluded.span_start,
            span_end = excluded.span_end,
            overlap_bytes = excluded.overlap_bytes,
            overlap_tokens = excluded.overlap_tokens,
            text = excluded.text,
            metadata = excluded.metadata,
            vector = excluded.vector,
            model_id = excluded.model_id,
            created_at = excluded.created_at",
    )?;

    let mut written = 0;
    for entry in entries {
        let chunk = &entry.chunk;
        written += stmt.execute(params![
            chunk.id,
            chunk.document_id,
            chunk.position_index as i64,
            chunk.char_span.start as i64,
            chunk.char_span.end as i64,
            chunk.overlap_with_predecessor as i64,
            chunk.overlap_tokens as i64,
            chunk.text,
            serde_json::to_string(&entry.metadata)?,
            encode_vector(&normalize(&entry.vector)),
            entry.model_id,
            now,
        ])?;
    }
    Ok(written)
}

fn query_documents(
    conn: &Connection,
    clause: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<DocumentRecord>> {
    let sql = format!(
        "SELECT d.id, d.source_uri, d.raw_format, d.content_hash, d.metadata, d.created_at,
                (SELECT COUNT(*) FROM entries e WHERE e.document_id = d.id)
         FROM documents d {}",
        clause
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, i64>(6)?,
        ))
    })?;

    let mut docs = Vec::new();
    for row in rows {
        let (id, source_uri, raw_format, content_hash, metadata, created_at, chunk_count) = row?;
        let raw_format = DocumentFormat::parse(&raw_format)
            .ok_or_else(|| RagError::Storage(format!("unknown stored format: {}", raw_format)))?;
        docs.push(DocumentRecord {
            id,
            source_uri,
            raw_format,
            content_hash,
            metadata: serde_json::from_str(&metadata)?,
            created_at: parse_datetime(&created_at),
            chunk_count: chunk_count as usize,
        });
    }
    Ok(docs)
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// RFC3339 문자열을 DateTime<Utc>로 파싱
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ============================================================================
// Tests
// ============================================================================
