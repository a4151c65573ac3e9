//! SurrealDB schema definitions

use crate::{DbConnection, Result};
use tracing::info;

/// Initialize the database schema
pub async fn initialize_schema(db: &DbConnection) -> Result<()> {
    info!("Initializing database schema...");

    db.query(SCHEMA_DEFINITION).await?.check()?;

    info!("Schema initialized successfully");
    Ok(())
}

/// Key-value namespaces live in dynamic `kv_{namespace}` and `vdb_{namespace}`
/// tables; only the graph tables have a fixed shape.
const SCHEMA_DEFINITION: &str = r#"
-- ============================================
-- GRAPH TABLES
-- ============================================

DEFINE TABLE IF NOT EXISTS graph_node SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS key ON graph_node TYPE string;
DEFINE FIELD IF NOT EXISTS value ON graph_node TYPE string;

DEFINE TABLE IF NOT EXISTS graph_edge SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS key ON graph_edge TYPE string;
DEFINE FIELD IF NOT EXISTS src ON graph_edge TYPE string;
DEFINE FIELD IF NOT EXISTS tgt ON graph_edge TYPE string;
DEFINE FIELD IF NOT EXISTS value ON graph_edge TYPE string;

DEFINE TABLE IF NOT EXISTS community SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS key ON community TYPE string;
DEFINE FIELD IF NOT EXISTS level ON community TYPE int;
DEFINE FIELD IF NOT EXISTS value ON community TYPE string;

-- ============================================
-- INDEXES
-- ============================================

DEFINE INDEX IF NOT EXISTS idx_edge_src ON graph_edge FIELDS src;
DEFINE INDEX IF NOT EXISTS idx_edge_tgt ON graph_edge FIELDS tgt;
DEFINE INDEX IF NOT EXISTS idx_community_level ON community FIELDS level;
"#;

#[cfg(test)]
mod tests {
    use crate::init_memory;

    #[tokio::test]
    async fn test_schema_initialization() {
        let db = init_memory().await.expect("Failed to init db");

        let nodes: Vec<serde_json::Value> = db.select("graph_node").await.unwrap();
        assert!(nodes.is_empty());

        let communities: Vec<serde_json::Value> = db.select("community").await.unwrap();
        assert!(communities.is_empty());
    }
}
