use crate::citation::Citation;
use crate::error::IngestError;
use crate::models::{
    ChunkRecord, CitationKind, DocumentRecord, FigureEnrichment, FigureRecord, PageRecord,
    ResolvedCitation,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Single source of truth for identifier assignment and citation validity.
///
/// Identifier ownership: this store is the only writer of `doc_id`, page
/// numbers and chunk/figure ids. The text and visual indices reference these
/// by value only; a failed join against this store means "not yet available",
/// never corruption.
pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    /// Opens (or creates) the store. WAL journaling keeps `resolve` servable
    /// under concurrent query load while an ingestion writer is active.
    pub fn open(path: &Path) -> Result<Self, IngestError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        // journal_mode returns the resulting mode as a row, so query it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, IngestError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("metadata store lock poisoned")
    }

    fn ensure_schema(&self) -> Result<(), rusqlite::Error> {
        self.lock().execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
               doc_id INTEGER PRIMARY KEY AUTOINCREMENT,
               file_path TEXT NOT NULL UNIQUE,
               file_name TEXT NOT NULL,
               file_hash TEXT NOT NULL,
               num_pages INTEGER NOT NULL,
               ingested_at TEXT,
               text_indexed_at TEXT,
               text_indexed_hash TEXT,
               visual_indexed_at TEXT,
               visual_indexed_hash TEXT,
               created_at TEXT NOT NULL,
               updated_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS pages (
               page_pk INTEGER PRIMARY KEY AUTOINCREMENT,
               doc_id INTEGER NOT NULL,
               page_num INTEGER NOT NULL,
               extracted_text TEXT,
               rendered_image_path TEXT,
               created_at TEXT NOT NULL,
               updated_at TEXT NOT NULL,
               UNIQUE(doc_id, page_num),
               FOREIGN KEY (doc_id) REFERENCES documents(doc_id) ON DELETE CASCADE
             );

             CREATE TABLE IF NOT EXISTS text_chunks (
               chunk_pk INTEGER PRIMARY KEY AUTOINCREMENT,
               doc_id INTEGER NOT NULL,
               page_num INTEGER NOT NULL,
               chunk_id INTEGER NOT NULL,
               section_name TEXT,
               text TEXT NOT NULL,
               offset_start INTEGER NOT NULL,
               offset_end INTEGER NOT NULL,
               created_at TEXT NOT NULL,
               updated_at TEXT NOT NULL,
               UNIQUE(doc_id, page_num, chunk_id),
               FOREIGN KEY (doc_id) REFERENCES documents(doc_id) ON DELETE CASCADE
             );

             CREATE TABLE IF NOT EXISTS figures (
               figure_pk INTEGER PRIMARY KEY AUTOINCREMENT,
               doc_id INTEGER NOT NULL,
               page_num INTEGER NOT NULL,
               figure_id INTEGER NOT NULL,
               image_path TEXT NOT NULL,
               ocr_text TEXT,
               vlm_caption TEXT,
               vlm_entities_json TEXT,
               vlm_bullets_json TEXT,
               created_at TEXT NOT NULL,
               updated_at TEXT NOT NULL,
               UNIQUE(doc_id, page_num, figure_id),
               FOREIGN KEY (doc_id) REFERENCES documents(doc_id) ON DELETE CASCADE
             );

             CREATE INDEX IF NOT EXISTS idx_chunks_doc_page ON text_chunks(doc_id, page_num);
             CREATE INDEX IF NOT EXISTS idx_figures_doc_page ON figures(doc_id, page_num);",
        )
    }

    /// Idempotent on `file_path`: an unchanged file keeps its `doc_id` across
    /// re-ingestion. Changed content is re-ingested under the same `doc_id`
    /// with per-page chunk replacement (the explicit reset contract).
    pub fn upsert_document(
        &self,
        file_path: &str,
        file_name: &str,
        file_hash: &str,
        num_pages: u32,
    ) -> Result<DocumentRecord, rusqlite::Error> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO documents(file_path, file_name, file_hash, num_pages, created_at, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(file_path) DO UPDATE SET
               file_name = excluded.file_name,
               file_hash = excluded.file_hash,
               num_pages = excluded.num_pages,
               updated_at = excluded.updated_at",
            params![file_path, file_name, file_hash, num_pages, now],
        )?;
        document_by_path(&conn, file_path)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
    }

    pub fn documents(&self) -> Result<Vec<DocumentRecord>, rusqlite::Error> {
        let conn = self.lock();
        let mut statement = conn.prepare(
            "SELECT doc_id, file_path, file_name, file_hash, num_pages, ingested_at
             FROM documents ORDER BY doc_id ASC",
        )?;
        let rows = statement.query_map([], document_from_row)?;
        rows.collect()
    }

    pub fn get_document_by_path(
        &self,
        file_path: &str,
    ) -> Result<Option<DocumentRecord>, rusqlite::Error> {
        document_by_path(&self.lock(), file_path)
    }

    pub fn mark_ingested(&self, doc_id: i64) -> Result<(), rusqlite::Error> {
        let now = Utc::now().to_rfc3339();
        self.lock().execute(
            "UPDATE documents SET ingested_at = ?1, updated_at = ?1 WHERE doc_id = ?2",
            params![now, doc_id],
        )?;
        Ok(())
    }

    pub fn mark_text_indexed(&self, doc_id: i64) -> Result<(), rusqlite::Error> {
        let now = Utc::now().to_rfc3339();
        self.lock().execute(
            "UPDATE documents
             SET text_indexed_at = ?1, text_indexed_hash = file_hash, updated_at = ?1
             WHERE doc_id = ?2",
            params![now, doc_id],
        )?;
        Ok(())
    }

    pub fn mark_visual_indexed(&self, doc_id: i64) -> Result<(), rusqlite::Error> {
        let now = Utc::now().to_rfc3339();
        self.lock().execute(
            "UPDATE documents
             SET visual_indexed_at = ?1, visual_indexed_hash = file_hash, updated_at = ?1
             WHERE doc_id = ?2",
            params![now, doc_id],
        )?;
        Ok(())
    }

    /// True when the current file hash has already been indexed for the
    /// given stage ("text" or "visual"); used for incremental re-indexing.
    pub fn is_indexed(&self, doc_id: i64, stage: IndexStage) -> Result<bool, rusqlite::Error> {
        let (at_col, hash_col) = match stage {
            IndexStage::Text => ("text_indexed_at", "text_indexed_hash"),
            IndexStage::Visual => ("visual_indexed_at", "visual_indexed_hash"),
        };
        let query = format!(
            "SELECT {at_col} IS NOT NULL AND {hash_col} = file_hash FROM documents WHERE doc_id = ?1"
        );
        self.lock()
            .query_row(&query, params![doc_id], |row| row.get::<_, bool>(0))
            .optional()
            .map(|found| found.unwrap_or(false))
    }

    pub fn upsert_page(&self, page: &PageRecord) -> Result<(), rusqlite::Error> {
        let now = Utc::now().to_rfc3339();
        self.lock().execute(
            "INSERT INTO pages(doc_id, page_num, extracted_text, rendered_image_path, created_at, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(doc_id, page_num) DO UPDATE SET
               extracted_text = excluded.extracted_text,
               rendered_image_path = excluded.rendered_image_path,
               updated_at = excluded.updated_at",
            params![
                page.doc_id,
                page.page_num,
                page.extracted_text,
                page.rendered_image_path,
                now
            ],
        )?;
        Ok(())
    }

    pub fn pages(&self, doc_id: i64) -> Result<Vec<PageRecord>, rusqlite::Error> {
        let conn = self.lock();
        let mut statement = conn.prepare(
            "SELECT doc_id, page_num, extracted_text, rendered_image_path
             FROM pages WHERE doc_id = ?1 ORDER BY page_num ASC",
        )?;
        let rows = statement.query_map(params![doc_id], |row| {
            Ok(PageRecord {
                doc_id: row.get(0)?,
                page_num: row.get(1)?,
                extracted_text: row.get(2)?,
                rendered_image_path: row.get(3)?,
            })
        })?;
        rows.collect()
    }

    /// Replaces all chunks of one page atomically (per-page reset on
    /// re-indexing). Chunk id assignment stays with the caller's per-page
    /// index so re-ingesting unchanged content reproduces the same ids.
    pub fn replace_chunks(
        &self,
        doc_id: i64,
        page_num: u32,
        chunks: &[ChunkRecord],
    ) -> Result<(), rusqlite::Error> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM text_chunks WHERE doc_id = ?1 AND page_num = ?2",
            params![doc_id, page_num],
        )?;
        {
            let mut statement = tx.prepare(
                "INSERT INTO text_chunks(
                   doc_id, page_num, chunk_id, section_name, text,
                   offset_start, offset_end, created_at, updated_at
                 ) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            )?;
            for chunk in chunks {
                statement.execute(params![
                    chunk.doc_id,
                    chunk.page_num,
                    chunk.chunk_id,
                    chunk.section_name,
                    chunk.text,
                    chunk.offset_start,
                    chunk.offset_end,
                    now
                ])?;
            }
        }
        tx.commit()
    }

    pub fn chunk(&self, citation: &Citation) -> Result<Option<ChunkRecord>, rusqlite::Error> {
        let conn = self.lock();
        conn.query_row(
            "SELECT doc_id, page_num, chunk_id, section_name, text, offset_start, offset_end
             FROM text_chunks WHERE doc_id = ?1 AND page_num = ?2 AND chunk_id = ?3",
            params![citation.doc_id, citation.page_num, citation.unit_id],
            chunk_from_row,
        )
        .optional()
    }

    /// Fetches chunks preserving the caller's ordering; missing citations are
    /// skipped (the index may lag the metadata store).
    pub fn chunks_by_citations(
        &self,
        citations: &[Citation],
    ) -> Result<Vec<ChunkRecord>, rusqlite::Error> {
        let mut out = Vec::with_capacity(citations.len());
        for citation in citations {
            if let Some(chunk) = self.chunk(citation)? {
                out.push(chunk);
            }
        }
        Ok(out)
    }

    pub fn chunks_for_document(&self, doc_id: i64) -> Result<Vec<ChunkRecord>, rusqlite::Error> {
        let conn = self.lock();
        let mut statement = conn.prepare(
            "SELECT doc_id, page_num, chunk_id, section_name, text, offset_start, offset_end
             FROM text_chunks WHERE doc_id = ?1 ORDER BY page_num ASC, chunk_id ASC",
        )?;
        let rows = statement.query_map(params![doc_id], chunk_from_row)?;
        rows.collect()
    }

    pub fn upsert_figure(&self, figure: &FigureRecord) -> Result<(), rusqlite::Error> {
        let now = Utc::now().to_rfc3339();
        let (caption, entities_json, bullets_json) = match &figure.enrichment {
            Some(enrichment) => (
                Some(enrichment.caption.clone()),
                serde_json::to_string(&enrichment.entities).ok(),
                serde_json::to_string(&enrichment.bullets).ok(),
            ),
            None => (None, None, None),
        };
        self.lock().execute(
            "INSERT INTO figures(
               doc_id, page_num, figure_id, image_path, ocr_text,
               vlm_caption, vlm_entities_json, vlm_bullets_json, created_at, updated_at
             ) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(doc_id, page_num, figure_id) DO UPDATE SET
               image_path = excluded.image_path,
               ocr_text = excluded.ocr_text,
               vlm_caption = excluded.vlm_caption,
               vlm_entities_json = excluded.vlm_entities_json,
               vlm_bullets_json = excluded.vlm_bullets_json,
               updated_at = excluded.updated_at",
            params![
                figure.doc_id,
                figure.page_num,
                figure.figure_id,
                figure.image_path,
                figure.ocr_text,
                caption,
                entities_json,
                bullets_json,
                now
            ],
        )?;
        Ok(())
    }

    pub fn figure(&self, citation: &Citation) -> Result<Option<FigureRecord>, rusqlite::Error> {
        let conn = self.lock();
        conn.query_row(
            "SELECT doc_id, page_num, figure_id, image_path, ocr_text,
                    vlm_caption, vlm_entities_json, vlm_bullets_json
             FROM figures WHERE doc_id = ?1 AND page_num = ?2 AND figure_id = ?3",
            params![citation.doc_id, citation.page_num, citation.unit_id],
            figure_from_row,
        )
        .optional()
    }

    pub fn figures_for_page(
        &self,
        doc_id: i64,
        page_num: u32,
    ) -> Result<Vec<FigureRecord>, rusqlite::Error> {
        let conn = self.lock();
        let mut statement = conn.prepare(
            "SELECT doc_id, page_num, figure_id, image_path, ocr_text,
                    vlm_caption, vlm_entities_json, vlm_bullets_json
             FROM figures WHERE doc_id = ?1 AND page_num = ?2 ORDER BY figure_id ASC",
        )?;
        let rows = statement.query_map(params![doc_id, page_num], figure_from_row)?;
        rows.collect()
    }

    /// Resolves a citation token to the unit it names. Chunks are tried first;
    /// chunk and figure tokens share one wire syntax, so the chunk table wins
    /// when both units exist under the same triple.
    pub fn resolve(&self, citation: &Citation) -> Result<Option<ResolvedCitation>, rusqlite::Error> {
        if self.chunk(citation)?.is_some() {
            return Ok(Some(ResolvedCitation {
                kind: CitationKind::Chunk,
                doc_id: citation.doc_id,
                page_num: citation.page_num,
                unit_id: citation.unit_id,
            }));
        }
        if self.figure(citation)?.is_some() {
            return Ok(Some(ResolvedCitation {
                kind: CitationKind::Figure,
                doc_id: citation.doc_id,
                page_num: citation.page_num,
                unit_id: citation.unit_id,
            }));
        }
        Ok(None)
    }

    /// Deletes a document and cascades to its pages, chunks and figures.
    /// Index vectors referencing the ids become dangling and resolve as
    /// "not found" on the next query.
    pub fn delete_document(&self, doc_id: i64) -> Result<(), rusqlite::Error> {
        self.lock()
            .execute("DELETE FROM documents WHERE doc_id = ?1", params![doc_id])?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStage {
    Text,
    Visual,
}

fn document_by_path(
    conn: &Connection,
    file_path: &str,
) -> Result<Option<DocumentRecord>, rusqlite::Error> {
    conn.query_row(
        "SELECT doc_id, file_path, file_name, file_hash, num_pages, ingested_at
         FROM documents WHERE file_path = ?1",
        params![file_path],
        document_from_row,
    )
    .optional()
}

fn document_from_row(row: &rusqlite::Row<'_>) -> Result<DocumentRecord, rusqlite::Error> {
    let ingested_at: Option<String> = row.get(5)?;
    Ok(DocumentRecord {
        doc_id: row.get(0)?,
        file_path: row.get(1)?,
        file_name: row.get(2)?,
        file_hash: row.get(3)?,
        num_pages: row.get(4)?,
        ingested_at: ingested_at
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc)),
    })
}

fn chunk_from_row(row: &rusqlite::Row<'_>) -> Result<ChunkRecord, rusqlite::Error> {
    Ok(ChunkRecord {
        doc_id: row.get(0)?,
        page_num: row.get(1)?,
        chunk_id: row.get(2)?,
        section_name: row.get(3)?,
        text: row.get(4)?,
        offset_start: row.get(5)?,
        offset_end: row.get(6)?,
    })
}

fn figure_from_row(row: &rusqlite::Row<'_>) -> Result<FigureRecord, rusqlite::Error> {
    let caption: Option<String> = row.get(5)?;
    let entities_json: Option<String> = row.get(6)?;
    let bullets_json: Option<String> = row.get(7)?;
    let enrichment = caption.map(|caption| FigureEnrichment {
        caption,
        entities: entities_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default(),
        bullets: bullets_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default(),
    });
    Ok(FigureRecord {
        doc_id: row.get(0)?,
        page_num: row.get(1)?,
        figure_id: row.get(2)?,
        image_path: row.get(3)?,
        ocr_text: row.get(4)?,
        enrichment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk(doc_id: i64, page_num: u32, chunk_id: u32, text: &str) -> ChunkRecord {
        ChunkRecord {
            doc_id,
            page_num,
            chunk_id,
            section_name: Some("Results".to_string()),
            text: text.to_string(),
            offset_start: 0,
            offset_end: text.len() as u32,
        }
    }

    #[test]
    fn reingesting_unchanged_file_keeps_doc_id() -> Result<(), Box<dyn std::error::Error>> {
        let store = MetadataStore::open_in_memory()?;
        let first = store.upsert_document("/corpus/a.pdf", "a.pdf", "hash-1", 4)?;
        let second = store.upsert_document("/corpus/a.pdf", "a.pdf", "hash-1", 4)?;
        assert_eq!(first.doc_id, second.doc_id);
        Ok(())
    }

    #[test]
    fn resolve_finds_chunk_then_figure() -> Result<(), Box<dyn std::error::Error>> {
        let store = MetadataStore::open_in_memory()?;
        let doc = store.upsert_document("/corpus/b.pdf", "b.pdf", "hash-2", 2)?;
        store.replace_chunks(
            doc.doc_id,
            2,
            &[sample_chunk(doc.doc_id, 2, 5, "temperature inversion observed")],
        )?;
        store.upsert_figure(&FigureRecord {
            doc_id: doc.doc_id,
            page_num: 2,
            figure_id: 0,
            image_path: "figures/p2_f0.png".to_string(),
            ocr_text: Some("flux density".to_string()),
            enrichment: None,
        })?;

        let chunk_hit = store
            .resolve(&Citation::new(doc.doc_id, 2, 5))?
            .expect("chunk resolves");
        assert_eq!(chunk_hit.kind, CitationKind::Chunk);

        let figure_hit = store
            .resolve(&Citation::new(doc.doc_id, 2, 0))?
            .expect("figure resolves");
        assert_eq!(figure_hit.kind, CitationKind::Figure);

        assert!(store.resolve(&Citation::new(99, 1, 1))?.is_none());
        Ok(())
    }

    #[test]
    fn replace_chunks_resets_the_page() -> Result<(), Box<dyn std::error::Error>> {
        let store = MetadataStore::open_in_memory()?;
        let doc = store.upsert_document("/corpus/c.pdf", "c.pdf", "hash-3", 1)?;
        store.replace_chunks(
            doc.doc_id,
            1,
            &[
                sample_chunk(doc.doc_id, 1, 0, "first"),
                sample_chunk(doc.doc_id, 1, 1, "second"),
            ],
        )?;
        store.replace_chunks(doc.doc_id, 1, &[sample_chunk(doc.doc_id, 1, 0, "rewritten")])?;

        let chunks = store.chunks_for_document(doc.doc_id)?;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "rewritten");
        Ok(())
    }

    #[test]
    fn figure_enrichment_round_trips() -> Result<(), Box<dyn std::error::Error>> {
        let store = MetadataStore::open_in_memory()?;
        let doc = store.upsert_document("/corpus/d.pdf", "d.pdf", "hash-4", 1)?;
        store.upsert_figure(&FigureRecord {
            doc_id: doc.doc_id,
            page_num: 1,
            figure_id: 2,
            image_path: "figures/p1_f2.png".to_string(),
            ocr_text: Some("axis labels".to_string()),
            enrichment: Some(FigureEnrichment {
                caption: "Spectral energy distribution.".to_string(),
                entities: vec!["SED".to_string(), "flux".to_string()],
                bullets: vec!["Peak shifts with redshift.".to_string()],
            }),
        })?;

        let figures = store.figures_for_page(doc.doc_id, 1)?;
        assert_eq!(figures.len(), 1);
        let enrichment = figures[0].enrichment.as_ref().expect("enrichment kept");
        assert_eq!(enrichment.entities.len(), 2);
        Ok(())
    }

    #[test]
    fn delete_document_cascades() -> Result<(), Box<dyn std::error::Error>> {
        let store = MetadataStore::open_in_memory()?;
        let doc = store.upsert_document("/corpus/e.pdf", "e.pdf", "hash-5", 1)?;
        store.replace_chunks(doc.doc_id, 1, &[sample_chunk(doc.doc_id, 1, 0, "body")])?;
        store.delete_document(doc.doc_id)?;
        assert!(store.resolve(&Citation::new(doc.doc_id, 1, 0))?.is_none());
        Ok(())
    }
}
