//! Tracked item storage on a tantivy index.
//!
//! Each record is one tantivy document keyed by `id`, with its revision and
//! JSON body stored alongside. Writes go through a single writer lock: the
//! revision check, replace, commit and reader reload happen while it is held,
//! so a write against a stale revision is reported as a conflict instead of
//! silently overwriting a concurrent update.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::{IndexRecordOption, Value};
use tantivy::{
    Index, IndexReader, IndexSettings, IndexWriter, ReloadPolicy, Searcher,
    TantivyDocument as Document, Term,
};

use super::error::{LedgerError, LedgerResult};
use super::item::{ItemFilter, Revision, TrackedMediaItem};
use super::schema::LedgerSchema;

/// Default writer memory budget (tantivy needs at least 15MB per thread).
pub const DEFAULT_WRITER_HEAP_BYTES: usize = 20_000_000;

/// Upper bound of the randomized delay before an upsert retry.
const MAX_UPSERT_BACKOFF_MS: u64 = 100;

/// Persistent store of [`TrackedMediaItem`] records.
///
/// Cheap to clone; clones share the same index and writer.
#[derive(Clone)]
pub struct TrackedItems {
    inner: Arc<LedgerIndex>,
}

struct LedgerIndex {
    path: PathBuf,
    index: Index,
    reader: IndexReader,
    schema: LedgerSchema,
    writer: Mutex<IndexWriter<Document>>,
}

impl std::fmt::Debug for TrackedItems {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedItems")
            .field("path", &self.inner.path)
            .field("num_docs", &self.inner.reader.searcher().num_docs())
            .finish()
    }
}

impl TrackedItems {
    /// Open the ledger at `path`, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        Self::open_with_heap(path, DEFAULT_WRITER_HEAP_BYTES)
    }

    /// Open the ledger with an explicit writer memory budget.
    pub fn open_with_heap(path: impl AsRef<Path>, heap_bytes: usize) -> LedgerResult<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let (tantivy_schema, schema) = LedgerSchema::build();

        let existing = path.join("meta.json").exists();
        let index = if existing {
            Index::open_in_dir(&path)?
        } else {
            let dir = MmapDirectory::open(&path)?;
            Index::create(dir, tantivy_schema, IndexSettings::default())?
        };

        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        if existing {
            reader.reload()?;
        }

        let writer: IndexWriter<Document> = index.writer_with_num_threads(1, heap_bytes)?;

        crate::debug_event!(
            "ledger",
            "opened",
            "{} ({} records)",
            path.display(),
            reader.searcher().num_docs()
        );

        Ok(Self {
            inner: Arc::new(LedgerIndex {
                path,
                index,
                reader,
                schema,
                writer: Mutex::new(writer),
            }),
        })
    }

    /// Directory holding the index.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Read-modify-write a record, retrying on revision conflicts.
    ///
    /// `delta` receives the current record (`None` if absent) and returns the
    /// desired one. Identity and revision are taken from the record read, so
    /// a concurrent writer in between makes the write conflict; the whole
    /// read-modify-write is then retried after a random delay of up to 100ms.
    /// Retries are unbounded. Any other failure is returned.
    pub async fn upsert<F>(&self, id: &str, delta: F) -> LedgerResult<String>
    where
        F: Fn(Option<TrackedMediaItem>) -> TrackedMediaItem + Send,
    {
        loop {
            let original = match self.get_by_id(id).await {
                Ok(item) => Some(item),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            };
            let revision = original.as_ref().and_then(|item| item.revision);

            let mut modified = delta(original);
            modified.id = id.to_string();
            modified.revision = revision;

            match self.put(modified).await {
                Ok(_) => return Ok(id.to_string()),
                Err(e) if e.is_conflict() => {
                    let backoff = Duration::from_millis(rand::random::<u64>() % MAX_UPSERT_BACKOFF_MS);
                    crate::debug_event!("ledger", "conflict", "{id}, retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write a record.
    ///
    /// The item's revision must match the stored one (`None` for a new
    /// record); otherwise the write fails with `Conflict`. Not retried.
    pub async fn put(&self, item: TrackedMediaItem) -> LedgerResult<Revision> {
        self.run(move |ledger| ledger.write(&item)).await
    }

    /// Look up a record. Fails with `NotFound` if absent.
    pub async fn get_by_id(&self, id: &str) -> LedgerResult<TrackedMediaItem> {
        let id = id.to_string();
        self.run(move |ledger| {
            ledger
                .find(&ledger.reader.searcher(), &id)?
                .ok_or(LedgerError::NotFound { id })
        })
        .await
    }

    /// Every record sourced from `storage_id`, narrowed by `filter`.
    pub async fn get_all_from_storage(
        &self,
        storage_id: &str,
        filter: Option<ItemFilter>,
    ) -> LedgerResult<Vec<TrackedMediaItem>> {
        let storage_id = storage_id.to_string();
        let filter = filter.unwrap_or_default();
        self.run(move |ledger| ledger.scan_storage(&storage_id, &filter))
            .await
    }

    /// Delete a record at the item's revision.
    ///
    /// Fails with `NotFound` if absent and `Conflict` if the revision is stale.
    pub async fn remove(&self, item: &TrackedMediaItem) -> LedgerResult<()> {
        let item = item.clone();
        self.run(move |ledger| ledger.delete(&item)).await
    }

    /// Best-effort batch write, committed once.
    ///
    /// Returns one result per item; a failing item does not affect the others.
    pub async fn bulk_change(
        &self,
        items: Vec<TrackedMediaItem>,
    ) -> LedgerResult<Vec<LedgerResult<Revision>>> {
        self.run(move |ledger| ledger.write_batch(&items)).await
    }

    /// Every record in the ledger.
    pub async fn all(&self) -> LedgerResult<Vec<TrackedMediaItem>> {
        self.run(|ledger| {
            let searcher = ledger.reader.searcher();
            ledger.collect(&searcher, &AllQuery)
        })
        .await
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.inner.reader.searcher().num_docs() as usize
    }

    /// Whether the ledger holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run blocking index work off the async executor.
    async fn run<T, F>(&self, op: F) -> LedgerResult<T>
    where
        F: FnOnce(&LedgerIndex) -> LedgerResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| LedgerError::Task(e.to_string()))?
    }
}

impl LedgerIndex {
    fn id_term(&self, id: &str) -> Term {
        Term::from_field_text(self.schema.id, id)
    }

    fn find(&self, searcher: &Searcher, id: &str) -> LedgerResult<Option<TrackedMediaItem>> {
        let query = TermQuery::new(self.id_term(id), IndexRecordOption::Basic);
        let top_docs = searcher.search(&query, &TopDocs::with_limit(1))?;

        match top_docs.first() {
            Some((_score, address)) => {
                let doc: Document = searcher.doc(*address)?;
                self.decode(&doc).map(Some)
            }
            None => Ok(None),
        }
    }

    fn collect(&self, searcher: &Searcher, query: &dyn Query) -> LedgerResult<Vec<TrackedMediaItem>> {
        let limit = searcher.num_docs().max(1) as usize;
        let top_docs = searcher.search(query, &TopDocs::with_limit(limit))?;

        let mut items = Vec::with_capacity(top_docs.len());
        for (_score, address) in top_docs {
            let doc: Document = searcher.doc(address)?;
            items.push(self.decode(&doc)?);
        }
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }

    fn scan_storage(
        &self,
        storage_id: &str,
        filter: &ItemFilter,
    ) -> LedgerResult<Vec<TrackedMediaItem>> {
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![(
            Occur::Must,
            Box::new(TermQuery::new(
                Term::from_field_text(self.schema.source_storage_id, storage_id),
                IndexRecordOption::Basic,
            )),
        )];
        if let Some(flow) = &filter.media_flow_id {
            clauses.push((
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(self.schema.media_flow_id, flow),
                    IndexRecordOption::Basic,
                )),
            ));
        }

        let searcher = self.reader.searcher();
        let items = self.collect(&searcher, &BooleanQuery::new(clauses))?;
        Ok(items.into_iter().filter(|item| filter.matches(item)).collect())
    }

    fn decode(&self, doc: &Document) -> LedgerResult<TrackedMediaItem> {
        let id = doc
            .get_first(self.schema.id)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let body = doc
            .get_first(self.schema.body)
            .and_then(|v| v.as_str())
            .ok_or_else(|| LedgerError::Corrupt {
                id: id.clone(),
                reason: "missing body".to_string(),
            })?;

        let revision = doc
            .get_first(self.schema.rev)
            .and_then(|v| v.as_u64())
            .and_then(Revision::from_u64)
            .ok_or_else(|| LedgerError::Corrupt {
                id: id.clone(),
                reason: "missing revision".to_string(),
            })?;

        let mut item: TrackedMediaItem = serde_json::from_str(body)?;
        item.revision = Some(revision);
        Ok(item)
    }

    fn encode(&self, item: &TrackedMediaItem, revision: Revision) -> LedgerResult<Document> {
        let mut doc = Document::new();
        doc.add_text(self.schema.id, &item.id);
        if let Some(source) = &item.source_storage_id {
            doc.add_text(self.schema.source_storage_id, source);
        }
        if let Some(flow) = &item.media_flow_id {
            doc.add_text(self.schema.media_flow_id, flow);
        }
        doc.add_u64(self.schema.rev, revision.value());
        doc.add_text(self.schema.body, serde_json::to_string(item)?);
        Ok(doc)
    }

    /// Revision to store, given what the caller read and what is stored.
    fn next_revision(item: &TrackedMediaItem, current: Option<Revision>) -> LedgerResult<Revision> {
        match (current, item.revision) {
            (None, None) => Ok(Revision::first()),
            (Some(stored), Some(read)) if stored == read => Ok(stored.next()),
            _ => Err(LedgerError::Conflict {
                id: item.id.clone(),
            }),
        }
    }

    fn current_revision(&self, id: &str) -> LedgerResult<Option<Revision>> {
        Ok(self
            .find(&self.reader.searcher(), id)?
            .and_then(|item| item.revision))
    }

    fn write(&self, item: &TrackedMediaItem) -> LedgerResult<Revision> {
        let mut writer = self.writer.lock().map_err(|_| LedgerError::LockPoisoned)?;

        let revision = Self::next_revision(item, self.current_revision(&item.id)?)?;
        let doc = self.encode(item, revision)?;

        writer.delete_term(self.id_term(&item.id));
        writer.add_document(doc)?;
        self.commit(&mut writer)?;

        Ok(revision)
    }

    fn delete(&self, item: &TrackedMediaItem) -> LedgerResult<()> {
        let mut writer = self.writer.lock().map_err(|_| LedgerError::LockPoisoned)?;

        let Some(current) = self.current_revision(&item.id)? else {
            return Err(LedgerError::NotFound {
                id: item.id.clone(),
            });
        };
        if item.revision != Some(current) {
            return Err(LedgerError::Conflict {
                id: item.id.clone(),
            });
        }

        writer.delete_term(self.id_term(&item.id));
        self.commit(&mut writer)
    }

    fn write_batch(&self, items: &[TrackedMediaItem]) -> LedgerResult<Vec<LedgerResult<Revision>>> {
        let mut writer = self.writer.lock().map_err(|_| LedgerError::LockPoisoned)?;

        // Revisions as they will be after this batch commits
        let mut staged: HashMap<String, Revision> = HashMap::new();
        let mut results = Vec::with_capacity(items.len());

        for item in items {
            let current = match staged.get(&item.id) {
                Some(revision) => Some(*revision),
                None => match self.current_revision(&item.id) {
                    Ok(revision) => revision,
                    Err(e) => {
                        results.push(Err(e));
                        continue;
                    }
                },
            };

            let outcome = Self::next_revision(item, current).and_then(|revision| {
                let doc = self.encode(item, revision)?;
                writer.delete_term(self.id_term(&item.id));
                writer.add_document(doc)?;
                Ok(revision)
            });
            if let Ok(revision) = &outcome {
                staged.insert(item.id.clone(), *revision);
            }
            results.push(outcome);
        }

        self.commit(&mut writer)?;
        Ok(results)
    }

    fn commit(&self, writer: &mut IndexWriter<Document>) -> LedgerResult<()> {
        if let Err(e) = writer.commit() {
            let _ = writer.rollback();
            return Err(e.into());
        }
        self.reader.reload()?;
        Ok(())
    }
}
