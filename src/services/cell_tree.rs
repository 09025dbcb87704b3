//! Cell ancestry store.
//!
//! Maintains the forest invariants the recursion validator depends on:
//! depth and materialized path derived from the parent at registration,
//! exact transitive descendant counts on every ancestor, and atomic
//! subtree removal.

use sqlx::{Row, SqlitePool};

use crate::domain::errors::TreeError;
use crate::domain::models::CellNode;

#[derive(Clone)]
pub struct CellTreeStore {
    pool: SqlitePool,
}

impl CellTreeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Register a new root cell.
    pub async fn register_root(&self, cell_id: &str, namespace: &str) -> Result<CellNode, TreeError> {
        if self.get(cell_id).await?.is_some() {
            return Err(TreeError::AlreadyExists(cell_id.to_string()));
        }

        sqlx::query(
            "INSERT INTO cell_tree (cell_id, parent_id, root_id, depth, path, descendant_count, namespace)
             VALUES (?, NULL, ?, 0, ?, 0, ?)",
        )
        .bind(cell_id)
        .bind(cell_id)
        .bind(cell_id)
        .bind(namespace)
        .execute(&self.pool)
        .await?;

        Ok(CellNode {
            cell_id: cell_id.to_string(),
            parent_id: None,
            root_id: cell_id.to_string(),
            depth: 0,
            path: cell_id.to_string(),
            descendant_count: 0,
            namespace: namespace.to_string(),
        })
    }

    /// Register a child under an existing parent. Updates every ancestor's
    /// descendant count in the same transaction.
    pub async fn register_child(&self, parent_id: &str, cell_id: &str) -> Result<CellNode, TreeError> {
        let mut tx = self.pool.begin().await?;

        let parent_row = sqlx::query(
            "SELECT cell_id, parent_id, root_id, depth, path, descendant_count, namespace
             FROM cell_tree WHERE cell_id = ?",
        )
        .bind(parent_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(parent_row) = parent_row else {
            return Err(TreeError::ParentNotFound(parent_id.to_string()));
        };
        let parent = Self::row_to_node(&parent_row);

        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM cell_tree WHERE cell_id = ?")
            .bind(cell_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_some() {
            return Err(TreeError::AlreadyExists(cell_id.to_string()));
        }

        let depth = parent.depth + 1;
        let path = format!("{}/{}", parent.path, cell_id);

        sqlx::query(
            "INSERT INTO cell_tree (cell_id, parent_id, root_id, depth, path, descendant_count, namespace)
             VALUES (?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(cell_id)
        .bind(parent_id)
        .bind(&parent.root_id)
        .bind(depth)
        .bind(&path)
        .bind(&parent.namespace)
        .execute(&mut *tx)
        .await?;

        // Every ancestor gains one descendant. Ancestor ids are exactly the
        // path components above the new node.
        for ancestor in parent.path.split('/') {
            sqlx::query("UPDATE cell_tree SET descendant_count = descendant_count + 1 WHERE cell_id = ?")
                .bind(ancestor)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(CellNode {
            cell_id: cell_id.to_string(),
            parent_id: Some(parent_id.to_string()),
            root_id: parent.root_id,
            depth,
            path,
            descendant_count: 0,
            namespace: parent.namespace,
        })
    }

    pub async fn get(&self, cell_id: &str) -> Result<Option<CellNode>, TreeError> {
        let row = sqlx::query(
            "SELECT cell_id, parent_id, root_id, depth, path, descendant_count, namespace
             FROM cell_tree WHERE cell_id = ?",
        )
        .bind(cell_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::row_to_node))
    }

    pub async fn children(&self, cell_id: &str) -> Result<Vec<CellNode>, TreeError> {
        let rows = sqlx::query(
            "SELECT cell_id, parent_id, root_id, depth, path, descendant_count, namespace
             FROM cell_tree WHERE parent_id = ? ORDER BY cell_id",
        )
        .bind(cell_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::row_to_node).collect())
    }

    /// Every node under (and including) `cell_id`, ordered by path.
    pub async fn subtree(&self, cell_id: &str) -> Result<Vec<CellNode>, TreeError> {
        let Some(node) = self.get(cell_id).await? else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            "SELECT cell_id, parent_id, root_id, depth, path, descendant_count, namespace
             FROM cell_tree WHERE path = ? OR path LIKE ? ORDER BY path",
        )
        .bind(&node.path)
        .bind(format!("{}/%", node.path))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::row_to_node).collect())
    }

    /// Delete a node and its whole subtree atomically. Ancestors' descendant
    /// counts shrink by the number of removed nodes. Returns how many nodes
    /// were removed.
    pub async fn remove_subtree(&self, cell_id: &str) -> Result<u32, TreeError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT path, descendant_count FROM cell_tree WHERE cell_id = ?")
            .bind(cell_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(0);
        };
        let path: String = row.get("path");
        let descendant_count: u32 = row.get::<i64, _>("descendant_count").try_into().unwrap_or(0);
        let removed = descendant_count + 1;

        sqlx::query("DELETE FROM cell_tree WHERE path = ? OR path LIKE ?")
            .bind(&path)
            .bind(format!("{path}/%"))
            .execute(&mut *tx)
            .await?;

        for ancestor in path.split('/').filter(|id| *id != cell_id) {
            sqlx::query("UPDATE cell_tree SET descendant_count = descendant_count - ? WHERE cell_id = ?")
                .bind(i64::from(removed))
                .bind(ancestor)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(removed)
    }

    /// Total registered cells, the platform-cap input.
    pub async fn count_all(&self) -> Result<u64, TreeError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cell_tree")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.try_into().unwrap_or(0))
    }

    fn row_to_node(row: &sqlx::sqlite::SqliteRow) -> CellNode {
        CellNode {
            cell_id: row.get("cell_id"),
            parent_id: row.get("parent_id"),
            root_id: row.get("root_id"),
            depth: row.get::<i64, _>("depth").try_into().unwrap_or(0),
            path: row.get("path"),
            descendant_count: row.get::<i64, _>("descendant_count").try_into().unwrap_or(0),
            namespace: row.get("namespace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::create_test_pool;
    use crate::adapters::sqlite::migrations::Migrator;

    async fn store() -> CellTreeStore {
        let pool = create_test_pool().await.unwrap();
        Migrator::new(pool.clone()).run().await.unwrap();
        CellTreeStore::new(pool)
    }

    #[tokio::test]
    async fn test_depth_and_path_invariants() {
        let store = store().await;
        store.register_root("root", "default").await.unwrap();
        let team = store.register_child("root", "team").await.unwrap();
        let dev = store.register_child("team", "dev").await.unwrap();

        assert_eq!(team.depth, 1);
        assert_eq!(team.path, "root/team");
        assert_eq!(dev.depth, 2);
        assert_eq!(dev.path, "root/team/dev");
        assert_eq!(dev.root_id, "root");
        assert!(dev.path.ends_with("dev"));
        assert_eq!(dev.path_depth(), dev.depth);
    }

    #[tokio::test]
    async fn test_descendant_counts_are_transitive() {
        let store = store().await;
        store.register_root("root", "default").await.unwrap();
        store.register_child("root", "a").await.unwrap();
        store.register_child("root", "b").await.unwrap();
        store.register_child("a", "a1").await.unwrap();
        store.register_child("a1", "a2").await.unwrap();

        assert_eq!(store.get("root").await.unwrap().unwrap().descendant_count, 4);
        assert_eq!(store.get("a").await.unwrap().unwrap().descendant_count, 2);
        assert_eq!(store.get("b").await.unwrap().unwrap().descendant_count, 0);
    }

    #[tokio::test]
    async fn test_remove_subtree_is_atomic_and_updates_ancestors() {
        let store = store().await;
        store.register_root("root", "default").await.unwrap();
        store.register_child("root", "a").await.unwrap();
        store.register_child("a", "a1").await.unwrap();
        store.register_child("a", "a2").await.unwrap();

        let removed = store.remove_subtree("a").await.unwrap();
        assert_eq!(removed, 3);

        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("a1").await.unwrap().is_none());
        assert_eq!(store.get("root").await.unwrap().unwrap().descendant_count, 0);
        assert_eq!(store.count_all().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_orphan_registration() {
        let store = store().await;
        store.register_root("root", "default").await.unwrap();
        assert!(matches!(
            store.register_root("root", "default").await,
            Err(TreeError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.register_child("ghost", "child").await,
            Err(TreeError::ParentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_subtree_listing() {
        let store = store().await;
        store.register_root("root", "default").await.unwrap();
        store.register_child("root", "a").await.unwrap();
        store.register_child("a", "a1").await.unwrap();

        let subtree = store.subtree("a").await.unwrap();
        let ids: Vec<_> = subtree.iter().map(|n| n.cell_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "a1"]);
    }
}
