//! The plain entity/edge graph the bi-temporal store sits beside.
//!
//! The store consumes this through [`GraphStore`]: it mirrors every new
//! temporal edge as a plain [`GraphEdge`], resolves file paths to entities
//! when files change, and lowers the confidence of entities whose files are
//! deleted. [`RedbGraphStore`] is the bundled implementation.

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ulid::Ulid;

use crate::{validate_confidence, ChronoError, Result};

/// A code entity (file, module, function, class, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    /// Entity kind, e.g. `file`, `function`, `class`.
    pub kind: String,
    /// Source file the entity lives in, if any.
    pub path: Option<String>,
    pub confidence: f32,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Node {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
            path: None,
            confidence: 1.0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// A non-temporal relationship as the plain graph stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub relation: String,
    pub confidence: f32,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Everything in the plain graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<Node>,
    pub edges: Vec<GraphEdge>,
}

/// Entity/edge storage the bi-temporal store delegates to.
///
/// Calls are synchronous and never retried by the store; an `Err` surfaces
/// to whoever called the store.
pub trait GraphStore: Send + Sync {
    fn get_node(&self, id: &str) -> Result<Option<Node>>;
    fn find_nodes(&self, predicate: &dyn Fn(&Node) -> bool) -> Result<Vec<Node>>;
    fn add_edge(&self, edge: GraphEdge) -> Result<()>;
    fn update_node_confidence(&self, id: &str, value: f32) -> Result<()>;
    fn get_graph(&self) -> Result<GraphSnapshot>;
    fn save(&self) -> Result<()>;
}

/// Node rows keyed by node id.
const NODES: TableDefinition<&str, &str> = TableDefinition::new("nodes");

/// Edge rows keyed by `"{source}:{relation}:{target}:{ulid}"`.
///
/// The ULID suffix keeps repeated mirrors of the same relationship apart
/// and orders them by insertion.
const EDGES: TableDefinition<&str, &str> = TableDefinition::new("edges");

/// [`GraphStore`] persisted in a `redb` database.
///
/// Every write commits its own transaction; [`save`](GraphStore::save) is a
/// durability barrier that commits an empty transaction.
pub struct RedbGraphStore {
    db: Database,
}

impl RedbGraphStore {
    /// Open or create a graph database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// A graph that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(NODES)?;
            write_txn.open_table(EDGES)?;
            write_txn.commit()?;
        }
        Ok(Self { db })
    }

    /// Insert or replace a node.
    pub fn upsert_node(&self, node: &Node) -> Result<()> {
        let value = serde_json::to_string(node)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(NODES)?;
            table.insert(node.id.as_str(), value.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn scan_nodes(&self, predicate: &dyn Fn(&Node) -> bool) -> Result<Vec<Node>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(NODES)?;
        let mut results = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            let node: Node = serde_json::from_str(v.value())?;
            if predicate(&node) {
                results.push(node);
            }
        }
        Ok(results)
    }

    fn scan_edges(&self) -> Result<Vec<GraphEdge>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(EDGES)?;
        let mut results: Vec<GraphEdge> = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            results.push(serde_json::from_str(v.value())?);
        }
        Ok(results)
    }
}

impl GraphStore for RedbGraphStore {
    fn get_node(&self, id: &str) -> Result<Option<Node>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(NODES)?;
        let raw: Option<String> = table.get(id)?.map(|guard| guard.value().to_string());
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn find_nodes(&self, predicate: &dyn Fn(&Node) -> bool) -> Result<Vec<Node>> {
        self.scan_nodes(predicate)
    }

    fn add_edge(&self, edge: GraphEdge) -> Result<()> {
        let key = format!(
            "{}:{}:{}:{}",
            edge.source,
            edge.relation,
            edge.target,
            Ulid::new()
        );
        let value = serde_json::to_string(&edge)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(EDGES)?;
            table.insert(key.as_str(), value.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn update_node_confidence(&self, id: &str, value: f32) -> Result<()> {
        validate_confidence(value)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(NODES)?;
            let raw: Option<String> = table.get(id)?.map(|guard| guard.value().to_string());
            let Some(raw) = raw else {
                // Dropping write_txn rolls back.
                return Err(ChronoError::GraphStore(format!("node not found: {id}")));
            };
            let mut node: Node = serde_json::from_str(&raw)?;
            node.confidence = value;
            let updated = serde_json::to_string(&node)?;
            table.insert(id, updated.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_graph(&self) -> Result<GraphSnapshot> {
        Ok(GraphSnapshot {
            nodes: self.scan_nodes(&|_| true)?,
            edges: self.scan_edges()?,
        })
    }

    fn save(&self) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        write_txn.commit()?;
        Ok(())
    }
}
