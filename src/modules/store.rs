use thiserror::Error;

use crate::modules::blob::{BlobSink, PersistError};
use crate::modules::serialize::{SnapshotShape, snapshot_value};
use crate::modules::types::{RecordDraft, RecordPatch, UrlRecord, UrlTable};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("no table at index {0}")]
    UnknownTable(usize),

    #[error("no record with id {id} in \"{table}\"")]
    NotFound { table: String, id: u64 },

    #[error("single-table store holds exactly one table")]
    ShapeMismatch,

    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// The in-memory collection of URL tables, mirrored to one remote JSON blob.
///
/// Every mutation is staged on a copy, the full document is sent to the
/// sink, and only a confirmed overwrite commits the copy. A failed persist
/// therefore leaves the visible collection exactly as it was. Mutations take
/// `&mut self`, so at most one persist is ever in flight per store.
pub struct UrlStore<S> {
    tables: Vec<UrlTable>,
    shape: SnapshotShape,
    sink: S,
    container: String,
    blob: String,
}

impl<S: BlobSink> UrlStore<S> {
    pub fn new(
        tables: Vec<UrlTable>,
        shape: SnapshotShape,
        sink: S,
        container: impl Into<String>,
        blob: impl Into<String>,
    ) -> Self {
        Self {
            tables,
            shape,
            sink,
            container: container.into(),
            blob: blob.into(),
        }
    }

    pub fn tables(&self) -> &[UrlTable] {
        &self.tables
    }

    /// Validates the draft, assigns the next id for the table, appends the
    /// record, and persists. Ids grow monotonically and are never reused:
    /// the next id is max(existing) + 1, or 1 for an empty table.
    pub fn add_record(&mut self, table: usize, draft: RecordDraft) -> Result<UrlRecord, StoreError> {
        let index = self.table_index(table)?;
        let source = non_empty("source", draft.source)?;
        let url = non_empty("url", draft.url)?;

        let mut staged = self.tables.clone();
        let record = UrlRecord {
            id: next_id(&staged[index]),
            active: draft.active,
            source,
            url,
        };
        staged[index].records.push(record.clone());

        self.persist(&staged)?;
        self.tables = staged;
        Ok(record)
    }

    /// Merges the patch onto the record with the given id, preserving the
    /// id, then persists.
    pub fn update_record(
        &mut self,
        table: usize,
        id: u64,
        patch: RecordPatch,
    ) -> Result<UrlRecord, StoreError> {
        let index = self.table_index(table)?;
        let position = self.record_position(index, id)?;

        let mut next = self.tables[index].records[position].clone();
        if let Some(active) = patch.active {
            next.active = active;
        }
        if let Some(source) = patch.source {
            next.source = non_empty("source", source)?;
        }
        if let Some(url) = patch.url {
            next.url = non_empty("url", url)?;
        }

        let mut staged = self.tables.clone();
        staged[index].records[position] = next.clone();

        self.persist(&staged)?;
        self.tables = staged;
        Ok(next)
    }

    /// Removes the record with the given id and persists. Matching is by id
    /// only; records that share a URL are unaffected by each other's
    /// deletion.
    pub fn delete_record(&mut self, table: usize, id: u64) -> Result<(), StoreError> {
        let index = self.table_index(table)?;
        let position = self.record_position(index, id)?;

        let mut staged = self.tables.clone();
        staged[index].records.remove(position);

        self.persist(&staged)?;
        self.tables = staged;
        Ok(())
    }

    /// Replaces the whole collection and persists it. The wire shape is
    /// kept, so a single-table store only accepts a single table.
    pub fn replace_all(&mut self, tables: Vec<UrlTable>) -> Result<(), StoreError> {
        if self.shape == SnapshotShape::Records && tables.len() > 1 {
            return Err(StoreError::ShapeMismatch);
        }
        self.persist(&tables)?;
        self.tables = tables;
        Ok(())
    }

    /// Adopts a freshly loaded snapshot without persisting. Used to recover
    /// after a failed persist by reloading the remote state.
    pub fn reset(&mut self, tables: Vec<UrlTable>, shape: SnapshotShape) {
        self.tables = tables;
        self.shape = shape;
    }

    fn persist(&self, staged: &[UrlTable]) -> Result<(), PersistError> {
        let document = snapshot_value(staged, self.shape)?;
        self.sink.overwrite(&self.container, &self.blob, &document)
    }

    fn table_index(&self, table: usize) -> Result<usize, StoreError> {
        if table >= self.tables.len() {
            return Err(StoreError::UnknownTable(table));
        }
        Ok(table)
    }

    fn record_position(&self, table: usize, id: u64) -> Result<usize, StoreError> {
        self.tables[table]
            .records
            .iter()
            .position(|record| record.id == id)
            .ok_or_else(|| StoreError::NotFound {
                table: self.tables[table].title.clone(),
                id,
            })
    }
}

fn next_id(table: &UrlTable) -> u64 {
    table.records.iter().map(|record| record.id).max().unwrap_or(0) + 1
}

fn non_empty(field: &'static str, value: String) -> Result<String, StoreError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(StoreError::EmptyField(field));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// Records every overwritten document; can be told to reject writes.
    #[derive(Clone, Default)]
    struct MemorySink {
        state: Rc<SinkState>,
    }

    #[derive(Default)]
    struct SinkState {
        writes: RefCell<Vec<Value>>,
        fail_status: Cell<Option<u16>>,
    }

    impl BlobSink for MemorySink {
        fn overwrite(
            &self,
            _container: &str,
            _blob: &str,
            document: &Value,
        ) -> Result<(), PersistError> {
            if let Some(status) = self.state.fail_status.get() {
                return Err(PersistError::Rejected {
                    status,
                    body: "backend unavailable".to_string(),
                });
            }
            self.state.writes.borrow_mut().push(document.clone());
            Ok(())
        }
    }

    fn record(id: u64, source: &str, url: &str) -> UrlRecord {
        UrlRecord {
            id,
            active: true,
            source: source.to_string(),
            url: url.to_string(),
        }
    }

    fn draft(source: &str, url: &str) -> RecordDraft {
        RecordDraft {
            active: true,
            source: source.to_string(),
            url: url.to_string(),
        }
    }

    fn store_with(tables: Vec<UrlTable>, shape: SnapshotShape) -> (UrlStore<MemorySink>, MemorySink) {
        let sink = MemorySink::default();
        let probe = sink.clone();
        (UrlStore::new(tables, shape, sink, "data", "urls.json"), probe)
    }

    #[test]
    fn first_record_gets_id_one() {
        let (mut store, _) = store_with(
            vec![UrlTable::new("News", Vec::new())],
            SnapshotShape::Tables,
        );
        let added = store.add_record(0, draft("feedA", "http://x/1")).unwrap();
        assert_eq!(added.id, 1);
        assert!(added.active);
        assert_eq!(added.source, "feedA");
        assert_eq!(store.tables()[0].records.len(), 1);
    }

    #[test]
    fn ids_grow_past_deletion_gaps() {
        let (mut store, _) = store_with(
            vec![UrlTable::new(
                "News",
                vec![record(1, "a", "http://x/1"), record(3, "b", "http://x/3")],
            )],
            SnapshotShape::Tables,
        );
        let added = store.add_record(0, draft("c", "http://x/4")).unwrap();
        assert_eq!(added.id, 4);
    }

    #[test]
    fn blank_fields_are_rejected_without_mutation() {
        let (mut store, probe) = store_with(
            vec![UrlTable::new("News", Vec::new())],
            SnapshotShape::Tables,
        );
        assert!(matches!(
            store.add_record(0, draft("   ", "http://x/1")),
            Err(StoreError::EmptyField("source"))
        ));
        assert!(matches!(
            store.add_record(0, draft("feedA", "")),
            Err(StoreError::EmptyField("url"))
        ));
        assert!(store.tables()[0].records.is_empty());
        assert!(probe.state.writes.borrow().is_empty());
    }

    #[test]
    fn fields_are_trimmed_on_add() {
        let (mut store, _) = store_with(
            vec![UrlTable::new("News", Vec::new())],
            SnapshotShape::Tables,
        );
        let added = store
            .add_record(0, draft("  feedA  ", "  http://x/1 "))
            .unwrap();
        assert_eq!(added.source, "feedA");
        assert_eq!(added.url, "http://x/1");
    }

    #[test]
    fn update_merges_patch_and_preserves_id() {
        let (mut store, _) = store_with(
            vec![UrlTable::new("News", vec![record(5, "a", "http://x/1")])],
            SnapshotShape::Tables,
        );
        let patch = RecordPatch {
            active: Some(false),
            url: Some("http://x/2".to_string()),
            ..RecordPatch::default()
        };
        let updated = store.update_record(0, 5, patch).unwrap();
        assert_eq!(updated.id, 5);
        assert!(!updated.active);
        assert_eq!(updated.source, "a");
        assert_eq!(updated.url, "http://x/2");
    }

    #[test]
    fn update_rejects_blank_patch_fields() {
        let (mut store, probe) = store_with(
            vec![UrlTable::new("News", vec![record(1, "a", "http://x/1")])],
            SnapshotShape::Tables,
        );
        let patch = RecordPatch {
            source: Some("  ".to_string()),
            ..RecordPatch::default()
        };
        assert!(matches!(
            store.update_record(0, 1, patch),
            Err(StoreError::EmptyField("source"))
        ));
        assert_eq!(store.tables()[0].records[0].source, "a");
        assert!(probe.state.writes.borrow().is_empty());
    }

    #[test]
    fn update_after_delete_is_not_found() {
        let (mut store, _) = store_with(
            vec![UrlTable::new("News", vec![record(1, "a", "http://x/1")])],
            SnapshotShape::Tables,
        );
        store.delete_record(0, 1).unwrap();
        assert!(matches!(
            store.update_record(0, 1, RecordPatch::default()),
            Err(StoreError::NotFound { id: 1, .. })
        ));
    }

    #[test]
    fn delete_matches_by_id_even_when_urls_repeat() {
        let shared = "http://x/same";
        let (mut store, _) = store_with(
            vec![UrlTable::new(
                "News",
                vec![record(1, "a", shared), record(2, "b", shared)],
            )],
            SnapshotShape::Tables,
        );
        store.delete_record(0, 1).unwrap();
        let records = &store.tables()[0].records;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 2);
        assert_eq!(records[0].url, shared);
    }

    #[test]
    fn unknown_table_triggers_no_persist() {
        let (mut store, probe) = store_with(
            vec![UrlTable::new("News", Vec::new())],
            SnapshotShape::Tables,
        );
        assert!(matches!(
            store.add_record(3, draft("a", "http://x/1")),
            Err(StoreError::UnknownTable(3))
        ));
        assert!(matches!(
            store.delete_record(3, 1),
            Err(StoreError::UnknownTable(3))
        ));
        assert!(probe.state.writes.borrow().is_empty());
    }

    #[test]
    fn failed_persist_leaves_collection_unchanged() {
        let (mut store, probe) = store_with(
            vec![UrlTable::new("News", vec![record(1, "a", "http://x/1")])],
            SnapshotShape::Tables,
        );
        probe.state.fail_status.set(Some(500));

        let err = store.add_record(0, draft("b", "http://x/2")).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Persist(PersistError::Rejected { status: 500, .. })
        ));
        assert_eq!(store.tables()[0].records.len(), 1);

        assert!(store.delete_record(0, 1).is_err());
        assert_eq!(store.tables()[0].records.len(), 1);

        // Once the backend recovers, the same mutation commits and the
        // rolled-back id is assigned again since it was never committed.
        probe.state.fail_status.set(None);
        let added = store.add_record(0, draft("b", "http://x/2")).unwrap();
        assert_eq!(added.id, 2);
        assert_eq!(store.tables()[0].records.len(), 2);
    }

    #[test]
    fn replace_all_is_idempotent_on_the_wire() {
        let (mut store, probe) = store_with(
            vec![UrlTable::new("News", vec![record(1, "a", "http://x/1")])],
            SnapshotShape::Tables,
        );
        let next = vec![UrlTable::new("News", vec![record(1, "a", "http://x/9")])];
        store.replace_all(next.clone()).unwrap();
        store.replace_all(next.clone()).unwrap();

        let writes = probe.state.writes.borrow();
        assert_eq!(writes.len(), 2);
        assert_eq!(
            serde_json::to_string(&writes[0]).unwrap(),
            serde_json::to_string(&writes[1]).unwrap()
        );
        assert_eq!(store.tables(), next.as_slice());
    }

    #[test]
    fn replace_all_rejects_extra_tables_in_single_shape() {
        let (mut store, probe) = store_with(
            vec![UrlTable::new("URLs", Vec::new())],
            SnapshotShape::Records,
        );
        let result = store.replace_all(vec![
            UrlTable::new("a", Vec::new()),
            UrlTable::new("b", Vec::new()),
        ]);
        assert!(matches!(result, Err(StoreError::ShapeMismatch)));
        assert!(probe.state.writes.borrow().is_empty());
    }

    #[test]
    fn single_table_shape_persists_bare_records() {
        let (mut store, probe) = store_with(
            vec![UrlTable::new("URLs", Vec::new())],
            SnapshotShape::Records,
        );
        store.add_record(0, draft("feedA", "http://x/1")).unwrap();

        let writes = probe.state.writes.borrow();
        let document = &writes[0];
        assert!(document.is_array());
        assert_eq!(document[0]["id"], 1);
        assert!(document[0].get("data").is_none());
    }

    #[test]
    fn multi_table_shape_persists_titled_tables() {
        let (mut store, probe) = store_with(
            vec![
                UrlTable::new("News", Vec::new()),
                UrlTable::new("Tech", Vec::new()),
            ],
            SnapshotShape::Tables,
        );
        store.add_record(1, draft("feedB", "http://x/1")).unwrap();

        let writes = probe.state.writes.borrow();
        let document = &writes[0];
        assert_eq!(document[0]["title"], "News");
        assert_eq!(document[1]["data"][0]["id"], 1);
    }

    #[test]
    fn ids_are_scoped_per_table() {
        let (mut store, _) = store_with(
            vec![
                UrlTable::new("News", vec![record(7, "a", "http://x/1")]),
                UrlTable::new("Tech", Vec::new()),
            ],
            SnapshotShape::Tables,
        );
        let added = store.add_record(1, draft("b", "http://x/2")).unwrap();
        assert_eq!(added.id, 1);
    }
}
