//! Storage layer for the knowledge-graph RAG engine
//!
//! Defines the key-value, vector and graph store interfaces and provides two
//! backends: in-memory stores with JSON snapshots, and embedded SurrealDB.

pub mod error;
pub mod memory;
pub mod schema;
pub mod storage;
pub mod surreal;
pub mod workspace;

pub use error::{DbError, Result};
pub use memory::{JsonGraphStore, JsonKvStore, JsonVectorStore};
pub use storage::{GraphStore, KvStore, KvStoreExt, VectorHit, VectorRecord, VectorStore};
pub use surreal::{SurrealGraphStore, SurrealKvStore, SurrealVectorStore};
pub use workspace::{Workspace, WorkspaceStats};

use surrealdb::engine::local::{Db, Mem};
use surrealdb::Surreal;

/// Database connection type
pub type DbConnection = Surreal<Db>;

/// Initialize database with RocksDB (persistent)
#[cfg(feature = "rocksdb")]
pub async fn init_persistent(path: impl AsRef<std::path::Path>) -> Result<DbConnection> {
    use surrealdb::engine::local::RocksDb;

    let db = Surreal::new::<RocksDb>(path.as_ref()).await?;
    setup_database(&db).await?;
    Ok(db)
}

/// Initialize database in-memory (for testing)
pub async fn init_memory() -> Result<DbConnection> {
    let db = Surreal::new::<Mem>(()).await?;
    setup_database(&db).await?;
    Ok(db)
}

/// Setup database namespace, database, and schema
async fn setup_database(db: &DbConnection) -> Result<()> {
    db.use_ns("kgrag").use_db("graph").await?;
    schema::initialize_schema(db).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_memory() {
        let db = init_memory().await.expect("Failed to init memory db");
        let _: Vec<serde_json::Value> = db.select("graph_edge").await.unwrap();
    }
}
