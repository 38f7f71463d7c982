//! Document store boundary.
//!
//! The engine treats every entry, settlement, card, account, budget and goal
//! as a JSON document in a per-user collection. `MemoryStore` is the
//! in-process implementation used by tests and offline tooling.

use crate::error::{LedgerError, Result};
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

pub type Document = Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub collection: String,
    pub documents: Vec<(String, Document)>,
}

pub type SnapshotStream = BoxStream<'static, Snapshot>;

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put {
        collection: String,
        id: String,
        document: Document,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl WriteOp {
    pub fn put<T: Serialize>(collection: &str, id: &str, value: &T) -> Result<Self> {
        Ok(WriteOp::Put {
            collection: collection.to_string(),
            id: id.to_string(),
            document: serde_json::to_value(value)?,
        })
    }

    pub fn delete(collection: &str, id: &str) -> Self {
        WriteOp::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    fn target(&self) -> (&str, &str) {
        match self {
            WriteOp::Put { collection, id, .. } | WriteOp::Delete { collection, id } => {
                (collection, id)
            }
        }
    }
}

pub trait DocumentStore: Send + Sync {
    /// Every document in `collection`, ordered by id.
    fn get(&self, collection: &str) -> Result<Vec<(String, Document)>>;

    fn get_document(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    fn put(&self, collection: &str, id: &str, document: Document) -> Result<()>;

    /// Returns false when the document did not exist.
    fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    /// Live snapshots of `collection`: the current state first, then one per change.
    fn subscribe(&self, collection: &str) -> Result<SnapshotStream>;

    fn supports_atomic_batch(&self) -> bool {
        false
    }

    fn commit_batch(&self, _ops: &[WriteOp]) -> Result<()> {
        Err(LedgerError::Store(
            "atomic batch writes are not supported by this store".to_string(),
        ))
    }
}

/// Collection paths of one user's namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCollections {
    root: String,
}

impl UserCollections {
    pub fn new(user_id: &str) -> Self {
        Self {
            root: format!("users/{}", user_id),
        }
    }

    pub fn transactions(&self) -> String {
        format!("{}/transactions", self.root)
    }

    pub fn card_expenses(&self) -> String {
        format!("{}/cardExpenses", self.root)
    }

    pub fn bill_payments(&self) -> String {
        format!("{}/billPayments", self.root)
    }

    pub fn cards(&self) -> String {
        format!("{}/cards", self.root)
    }

    pub fn accounts(&self) -> String {
        format!("{}/accounts", self.root)
    }

    pub fn budgets(&self) -> String {
        format!("{}/budgets", self.root)
    }

    pub fn goals(&self) -> String {
        format!("{}/goals", self.root)
    }
}

pub fn load_collection<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
) -> Result<Vec<T>> {
    store
        .get(collection)?
        .into_iter()
        .map(|(_, doc)| serde_json::from_value(doc).map_err(LedgerError::from))
        .collect()
}

pub fn load_document<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    collection: &str,
    id: &str,
) -> Result<Option<T>> {
    store
        .get_document(collection, id)?
        .map(|doc| serde_json::from_value(doc).map_err(LedgerError::from))
        .transpose()
}

/// Applies `ops` as one logical write. Uses the store's atomic batch when it
/// has one; otherwise writes in order and, if an op fails, undoes the ones
/// already applied (in reverse) before reporting `PartialGroupWrite`.
pub fn write_all_or_nothing(store: &dyn DocumentStore, label: &str, ops: &[WriteOp]) -> Result<()> {
    if ops.is_empty() {
        return Ok(());
    }

    if store.supports_atomic_batch() {
        store.commit_batch(ops)?;
        info!("Committed {} writes for {} atomically", ops.len(), label);
        return Ok(());
    }

    // (op index, previous document) for each applied op
    let mut applied: Vec<(usize, Option<Document>)> = Vec::with_capacity(ops.len());

    for (index, op) in ops.iter().enumerate() {
        let (collection, id) = op.target();
        let previous = store.get_document(collection, id);
        let outcome = previous.and_then(|previous| {
            match op {
                WriteOp::Put { document, .. } => store.put(collection, id, document.clone())?,
                WriteOp::Delete { .. } => {
                    if !store.delete(collection, id)? {
                        return Err(LedgerError::NotFound {
                            collection: collection.to_string(),
                            id: id.to_string(),
                        });
                    }
                }
            }
            Ok(previous)
        });

        match outcome {
            Ok(previous) => applied.push((index, previous)),
            Err(err) if applied.is_empty() => return Err(err),
            Err(err) => {
                warn!(
                    "Write {} of {} for {} failed ({}); rolling back {} applied writes",
                    index + 1,
                    ops.len(),
                    label,
                    err,
                    applied.len()
                );
                let rolled_back = roll_back(store, ops, &applied);
                return Err(LedgerError::PartialGroupWrite {
                    group_id: label.to_string(),
                    succeeded: applied.iter().map(|(i, _)| *i).collect(),
                    failed_index: index,
                    rolled_back,
                });
            }
        }
    }

    info!("Wrote {} documents for {}", ops.len(), label);
    Ok(())
}

fn roll_back(store: &dyn DocumentStore, ops: &[WriteOp], applied: &[(usize, Option<Document>)]) -> bool {
    let mut clean = true;

    for (index, previous) in applied.iter().rev() {
        let (collection, id) = ops[*index].target();
        let undo = match previous {
            Some(document) => store.put(collection, id, document.clone()),
            None => store.delete(collection, id).map(|_| ()),
        };
        if let Err(err) = undo {
            warn!("Rollback of {}/{} failed: {}", collection, id, err);
            clean = false;
        }
    }

    clean
}

#[derive(Default)]
struct MemoryState {
    collections: BTreeMap<String, BTreeMap<String, Document>>,
    subscribers: HashMap<String, Vec<UnboundedSender<Snapshot>>>,
    fail_on_write: Option<usize>,
    writes_seen: usize,
    failing_ids: HashSet<String>,
}

impl MemoryState {
    fn snapshot(&self, collection: &str) -> Snapshot {
        Snapshot {
            collection: collection.to_string(),
            documents: self
                .collections
                .get(collection)
                .map(|docs| docs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
        }
    }

    fn check_write(&mut self, id: &str) -> Result<()> {
        if self.failing_ids.contains(id) {
            return Err(LedgerError::Store(format!("injected failure writing {}", id)));
        }
        let seen = self.writes_seen;
        self.writes_seen += 1;
        if self.fail_on_write == Some(seen) {
            self.fail_on_write = None;
            return Err(LedgerError::Store(format!("injected failure on write #{}", seen)));
        }
        Ok(())
    }

    fn apply(&mut self, op: &WriteOp) -> bool {
        match op {
            WriteOp::Put {
                collection,
                id,
                document,
            } => {
                self.collections
                    .entry(collection.clone())
                    .or_default()
                    .insert(id.clone(), document.clone());
                true
            }
            WriteOp::Delete { collection, id } => self
                .collections
                .get_mut(collection)
                .and_then(|docs| docs.remove(id))
                .is_some(),
        }
    }

    fn notify(&mut self, collection: &str) {
        let snapshot = self.snapshot(collection);
        if let Some(senders) = self.subscribers.get_mut(collection) {
            senders.retain(|tx| tx.unbounded_send(snapshot.clone()).is_ok());
        }
    }
}

/// In-memory store with optional atomic batches and failure injection.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    atomic_batches: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_atomic_batches() -> Self {
        Self {
            state: Mutex::default(),
            atomic_batches: true,
        }
    }

    /// Makes the `n`-th mutation from now (0-based) fail once.
    pub fn fail_nth_write(&self, n: usize) -> Result<()> {
        let mut state = self.lock()?;
        state.fail_on_write = Some(state.writes_seen + n);
        Ok(())
    }

    /// Makes every mutation of document `id` fail until cleared.
    pub fn fail_writes_to(&self, id: &str) -> Result<()> {
        self.lock()?.failing_ids.insert(id.to_string());
        Ok(())
    }

    pub fn clear_failures(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.fail_on_write = None;
        state.failing_ids.clear();
        Ok(())
    }

    pub fn len(&self, collection: &str) -> Result<usize> {
        Ok(self
            .lock()?
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len))
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| LedgerError::Store("memory store lock poisoned".to_string()))
    }
}

impl DocumentStore for MemoryStore {
    fn get(&self, collection: &str) -> Result<Vec<(String, Document)>> {
        Ok(self.lock()?.snapshot(collection).documents)
    }

    fn get_document(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        Ok(self
            .lock()?
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    fn put(&self, collection: &str, id: &str, document: Document) -> Result<()> {
        let mut state = self.lock()?;
        state.check_write(id)?;
        state.apply(&WriteOp::Put {
            collection: collection.to_string(),
            id: id.to_string(),
            document,
        });
        state.notify(collection);
        debug!("put {}/{}", collection, id);
        Ok(())
    }

    fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let mut state = self.lock()?;
        state.check_write(id)?;
        let existed = state.apply(&WriteOp::delete(collection, id));
        if existed {
            state.notify(collection);
        }
        debug!("delete {}/{} (existed: {})", collection, id, existed);
        Ok(existed)
    }

    fn subscribe(&self, collection: &str) -> Result<SnapshotStream> {
        let mut state = self.lock()?;
        let (tx, rx) = unbounded();
        tx.unbounded_send(state.snapshot(collection))
            .map_err(|e| LedgerError::Store(e.to_string()))?;
        state
            .subscribers
            .entry(collection.to_string())
            .or_default()
            .push(tx);
        Ok(rx.boxed())
    }

    fn supports_atomic_batch(&self) -> bool {
        self.atomic_batches
    }

    fn commit_batch(&self, ops: &[WriteOp]) -> Result<()> {
        if !self.atomic_batches {
            return Err(LedgerError::Store(
                "atomic batch writes are not enabled on this store".to_string(),
            ));
        }

        let mut state = self.lock()?;
        for op in ops {
            state.check_write(op.target().1)?;
        }

        let mut touched: Vec<String> = Vec::new();
        for op in ops {
            state.apply(op);
            let collection = op.target().0.to_string();
            if !touched.contains(&collection) {
                touched.push(collection);
            }
        }
        for collection in &touched {
            state.notify(collection);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use serde_json::json;

    fn puts(n: usize) -> Vec<WriteOp> {
        (0..n)
            .map(|i| WriteOp::Put {
                collection: "users/u/transactions".to_string(),
                id: format!("e{}", i),
                document: json!({ "n": i }),
            })
            .collect()
    }

    #[test]
    fn test_sequential_group_write() {
        let store = MemoryStore::new();
        write_all_or_nothing(&store, "g1", &puts(5)).unwrap();
        assert_eq!(store.len("users/u/transactions").unwrap(), 5);
    }

    #[test]
    fn test_partial_write_is_rolled_back() {
        let store = MemoryStore::new();
        store.fail_nth_write(3).unwrap();

        let err = write_all_or_nothing(&store, "g1", &puts(6)).unwrap_err();
        match err {
            LedgerError::PartialGroupWrite {
                group_id,
                succeeded,
                failed_index,
                rolled_back,
            } => {
                assert_eq!(group_id, "g1");
                assert_eq!(succeeded, vec![0, 1, 2]);
                assert_eq!(failed_index, 3);
                assert!(rolled_back);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(store.len("users/u/transactions").unwrap(), 0);
    }

    #[test]
    fn test_rollback_restores_overwritten_document() {
        let store = MemoryStore::new();
        write_all_or_nothing(&store, "seed", &puts(1)).unwrap();
        store.fail_writes_to("e1").unwrap();

        let ops = vec![
            WriteOp::Put {
                collection: "users/u/transactions".to_string(),
                id: "e0".to_string(),
                document: json!({ "n": 99 }),
            },
            puts(2).remove(1),
        ];
        let err = write_all_or_nothing(&store, "g2", &ops).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::PartialGroupWrite { rolled_back: true, failed_index: 1, .. }
        ));
        assert_eq!(
            store.get_document("users/u/transactions", "e0").unwrap(),
            Some(json!({ "n": 0 }))
        );
    }

    #[test]
    fn test_failed_rollback_is_reported() {
        let store = MemoryStore::new();
        store.fail_writes_to("e1").unwrap();
        // write #0 is the put of e0, write #1 is its compensating delete
        store.fail_nth_write(1).unwrap();

        let err = write_all_or_nothing(&store, "g3", &puts(2)).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::PartialGroupWrite { rolled_back: false, .. }
        ));
        assert_eq!(store.len("users/u/transactions").unwrap(), 1);
    }

    #[test]
    fn test_first_write_failure_returns_store_error() {
        let store = MemoryStore::new();
        store.fail_nth_write(0).unwrap();
        let err = write_all_or_nothing(&store, "g1", &puts(2)).unwrap_err();
        assert!(matches!(err, LedgerError::Store(_)));
        assert_eq!(store.len("users/u/transactions").unwrap(), 0);
    }

    #[test]
    fn test_atomic_batch_is_all_or_nothing() {
        let store = MemoryStore::with_atomic_batches();
        store.fail_writes_to("e4").unwrap();
        assert!(write_all_or_nothing(&store, "g1", &puts(6)).is_err());
        assert_eq!(store.len("users/u/transactions").unwrap(), 0);

        store.clear_failures().unwrap();
        write_all_or_nothing(&store, "g1", &puts(6)).unwrap();
        assert_eq!(store.len("users/u/transactions").unwrap(), 6);
    }

    #[test]
    fn test_subscription_streams_snapshots() {
        let store = MemoryStore::new();
        let mut stream = store.subscribe("users/u/transactions").unwrap();

        store
            .put("users/u/transactions", "a", json!({ "v": 1 }))
            .unwrap();
        store.delete("users/u/transactions", "a").unwrap();

        block_on(async {
            let initial = stream.next().await.unwrap();
            assert!(initial.documents.is_empty());
            let after_put = stream.next().await.unwrap();
            assert_eq!(after_put.documents.len(), 1);
            let after_delete = stream.next().await.unwrap();
            assert!(after_delete.documents.is_empty());
        });
    }

    #[test]
    fn test_user_collections() {
        let paths = UserCollections::new("abc");
        assert_eq!(paths.card_expenses(), "users/abc/cardExpenses");
        assert_eq!(paths.bill_payments(), "users/abc/billPayments");
    }
}
