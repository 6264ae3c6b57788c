//! In-process storage backend. Used by default and in tests.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::{Condition, Order, Row, Select, Storage, StorageError, Value};

#[derive(Debug, Default)]
struct Table {
    rows: Vec<Row>,
    next_id: i64,
}

impl Table {
    fn assign_id(&mut self, row: &mut Row) -> i64 {
        match row.get("id") {
            Some(Value::Int(id)) => {
                let id = *id;
                self.next_id = self.next_id.max(id);
                id
            }
            _ => {
                self.next_id += 1;
                row.set("id", self.next_id);
                self.next_id
            }
        }
    }
}

/// Tables kept in memory, keyed by name. Ids auto-increment per table.
pub struct MemoryStorage {
    schema: &'static str,
    tables: RwLock<HashMap<String, Table>>,
    closed: AtomicBool,
}

impl MemoryStorage {
    pub fn new(schema: &'static str) -> Self {
        Self {
            schema,
            tables: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn schema(&self) -> &'static str {
        self.schema
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    /// Number of rows currently held in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, |t| t.rows.len())
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

fn matches_all(row: &Row, conditions: &[Condition]) -> bool {
    conditions.iter().all(|c| c.matches(row))
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn insert(&self, table: &str, mut row: Row) -> Result<i64, StorageError> {
        self.ensure_open()?;
        let mut tables = self.tables.write();
        let entry = tables.entry(table.to_string()).or_default();
        let id = entry.assign_id(&mut row);
        entry.rows.push(row);
        debug!(schema = self.schema, table, id, "inserted row");
        Ok(id)
    }

    async fn insert_or_update(
        &self,
        table: &str,
        mut row: Row,
        conflict_keys: &[&str],
    ) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut tables = self.tables.write();
        let entry = tables.entry(table.to_string()).or_default();

        let keys: Option<Vec<Condition>> = conflict_keys
            .iter()
            .map(|k| row.get(k).map(|v| Condition::eq(k, v.clone())))
            .collect();

        if let Some(keys) = keys.filter(|k| !k.is_empty()) {
            if let Some(existing) = entry.rows.iter_mut().find(|r| matches_all(r, &keys)) {
                for (column, value) in row.iter() {
                    existing.set(column, value.clone());
                }
                return Ok(());
            }
        }

        entry.assign_id(&mut row);
        entry.rows.push(row);
        Ok(())
    }

    async fn select(&self, table: &str, query: &Select) -> Result<Vec<Row>, StorageError> {
        self.ensure_open()?;
        let tables = self.tables.read();
        let Some(entry) = tables.get(table) else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<&Row> = entry
            .rows
            .iter()
            .filter(|r| matches_all(r, &query.conditions))
            .collect();

        if let Some((column, order)) = &query.order_by {
            rows.sort_by(|a, b| {
                let ord = match (a.get(column), b.get(column)) {
                    (Some(x), Some(y)) => x.compare(y).unwrap_or(Ordering::Equal),
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                match order {
                    Order::Asc => ord,
                    Order::Desc => ord.reverse(),
                }
            });
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|r| r.project(&query.columns))
            .collect())
    }

    async fn remove(&self, table: &str, conditions: &[Condition]) -> Result<u64, StorageError> {
        self.ensure_open()?;
        let mut tables = self.tables.write();
        let Some(entry) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = entry.rows.len();
        entry.rows.retain(|r| !matches_all(r, conditions));
        Ok((before - entry.rows.len()) as u64)
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, AtomicOrdering::SeqCst);
        debug!(schema = self.schema, "memory storage closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn house(owner: i64, ratio: f64) -> Row {
        Row::new().with("owner", owner).with("charge_ratio", ratio)
    }

    #[tokio::test]
    async fn test_insert_assigns_incrementing_ids() {
        let storage = MemoryStorage::new("grid");
        let a = storage.insert("house", house(1, 0.5)).await.unwrap();
        let b = storage.insert("house", house(2, 0.5)).await.unwrap();
        assert_eq!((a, b), (1, 2));

        let explicit = storage
            .insert("house", house(3, 0.5).with("id", 10i64))
            .await
            .unwrap();
        assert_eq!(explicit, 10);
        let next = storage.insert("house", house(4, 0.5)).await.unwrap();
        assert_eq!(next, 11);
    }

    #[tokio::test]
    async fn test_insert_or_update_merges_on_conflict() {
        let storage = MemoryStorage::new("grid");
        let id = storage.insert("house", house(1, 0.5)).await.unwrap();

        storage
            .insert_or_update("house", house(1, 0.9).with("id", id), &["id"])
            .await
            .unwrap();
        storage
            .insert_or_update("house", house(2, 0.1), &["owner"])
            .await
            .unwrap();

        assert_eq!(storage.row_count("house"), 2);
        let rows = storage
            .select("house", &Select::all().filter(Condition::eq("owner", 1i64)))
            .await
            .unwrap();
        assert_eq!(rows[0].f64("charge_ratio").unwrap(), 0.9);
    }

    #[tokio::test]
    async fn test_select_orders_limits_and_projects() {
        let storage = MemoryStorage::new("grid");
        for owner in [3, 1, 2] {
            storage.insert("house", house(owner, 0.5)).await.unwrap();
        }

        let rows = storage
            .select(
                "house",
                &Select::all()
                    .columns(&["owner"])
                    .filter(Condition::gt("owner", 1i64))
                    .order_by("owner", Order::Desc)
                    .limit(1),
            )
            .await
            .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].i64("owner").unwrap(), 3);
        assert!(rows[0].get("charge_ratio").is_none());
    }

    #[tokio::test]
    async fn test_remove_and_unknown_table() {
        let storage = MemoryStorage::new("grid");
        storage.insert("house", house(1, 0.5)).await.unwrap();
        storage.insert("house", house(2, 0.5)).await.unwrap();

        let removed = storage
            .remove("house", &[Condition::eq("owner", 1i64)])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(storage.select("nothing", &Select::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_storage_rejects_operations() {
        let storage = MemoryStorage::new("climate");
        storage.close().await.unwrap();
        assert!(storage.is_closed());
        assert!(matches!(
            storage.insert("wind", Row::new()).await,
            Err(StorageError::Closed)
        ));
        assert!(matches!(
            storage.select("wind", &Select::all()).await,
            Err(StorageError::Closed)
        ));
    }
}
