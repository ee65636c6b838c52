//! Relational storage backend over SQLite.
//!
//! Tables: `branch`, `resource_group`, `resource`, `link`,
//! `inferred_dirtiness`, every row scoped by a `branch` column. Tags are
//! branch rows flagged `is_tag` whose stored name carries the
//! `name|version` suffix convention; any write against one is rejected.
//!
//! Simple CRUD and queries run as direct SQL. The complex transitions
//! (change processing, cleaning) materialize the branch's links plus the
//! affected groups into the shared [`BranchState`], apply the identical
//! logic the snapshot backend uses, and persist the row-level diff inside a
//! single transaction: commit on success, roll back on error.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use super::error::{StorageError, StorageResult};
use super::propagate;
use super::state::BranchState;
use super::traits::{Branch, DepiDatabase};
use crate::config::DepiConfig;
use crate::model::{
    InferredDirtiness, InferredDirtinessView, Link, LinkRef, LinkView, Resource, ResourceGroup,
    ResourceGroupChange, ResourceLinkPattern, ResourceRef, ResourceRefPattern, ResourceView,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS branch (
        name TEXT PRIMARY KEY,
        parent_name TEXT NOT NULL DEFAULT '',
        parent_version INTEGER NOT NULL DEFAULT 0,
        last_version INTEGER NOT NULL DEFAULT 0,
        is_tag INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resource_group (
        branch TEXT NOT NULL,
        tool_id TEXT NOT NULL,
        url TEXT NOT NULL,
        name TEXT NOT NULL DEFAULT '',
        version TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (branch, tool_id, url)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resource (
        branch TEXT NOT NULL,
        tool_id TEXT NOT NULL,
        group_url TEXT NOT NULL,
        url TEXT NOT NULL,
        name TEXT NOT NULL DEFAULT '',
        id TEXT NOT NULL DEFAULT '',
        deleted INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (branch, tool_id, group_url, url)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS link (
        branch TEXT NOT NULL,
        from_tool_id TEXT NOT NULL,
        from_group_url TEXT NOT NULL,
        from_url TEXT NOT NULL,
        to_tool_id TEXT NOT NULL,
        to_group_url TEXT NOT NULL,
        to_url TEXT NOT NULL,
        dirty INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0,
        last_clean_version TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (branch, from_tool_id, from_group_url, from_url,
                     to_tool_id, to_group_url, to_url)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS inferred_dirtiness (
        branch TEXT NOT NULL,
        from_tool_id TEXT NOT NULL,
        from_group_url TEXT NOT NULL,
        from_url TEXT NOT NULL,
        to_tool_id TEXT NOT NULL,
        to_group_url TEXT NOT NULL,
        to_url TEXT NOT NULL,
        source_tool_id TEXT NOT NULL,
        source_group_url TEXT NOT NULL,
        source_url TEXT NOT NULL,
        last_clean_version TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (branch, from_tool_id, from_group_url, from_url,
                     to_tool_id, to_group_url, to_url,
                     source_tool_id, source_group_url, source_url)
    )
    "#,
];

/// The relational database: branch rows play the role backend-native
/// branches play in the original store.
pub struct SqlDatabase {
    pool: SqlitePool,
    config: Arc<DepiConfig>,
}

impl SqlDatabase {
    pub async fn new(config: Arc<DepiConfig>) -> StorageResult<Self> {
        info!("initializing relational backend at {}", config.db.url);
        let options = SqliteConnectOptions::from_str(&config.db.url)
            .map_err(|e| StorageError::configuration(format!("invalid db url: {e}")))?
            .create_if_missing(true);

        // An in-memory SQLite database exists per connection; the pool must
        // not hand out a second one.
        let max_connections = if config.db.url.contains(":memory:") {
            1
        } else {
            config.db.pool_size.max(1)
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool, config };
        db.initialize_schema().await?;
        db.ensure_main().await?;
        Ok(db)
    }

    async fn initialize_schema(&self) -> StorageResult<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn ensure_main(&self) -> StorageResult<()> {
        sqlx::query("INSERT OR IGNORE INTO branch (name, last_version) VALUES ('main', 1)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Resolve the stored name of a tag (`name|version`).
    async fn tag_storage_name(&self, name: &str) -> StorageResult<Option<String>> {
        let row = sqlx::query("SELECT name FROM branch WHERE is_tag = 1 AND name LIKE ?")
            .bind(format!("{name}|%"))
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get::<String, _>("name")?),
            None => None,
        })
    }

    async fn copy_branch_rows(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        from: &str,
        to: &str,
    ) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO resource_group (branch, tool_id, url, name, version)
             SELECT ?, tool_id, url, name, version FROM resource_group WHERE branch = ?",
        )
        .bind(to)
        .bind(from)
        .execute(&mut **tx)
        .await?;
        sqlx::query(
            "INSERT INTO resource (branch, tool_id, group_url, url, name, id, deleted)
             SELECT ?, tool_id, group_url, url, name, id, deleted FROM resource WHERE branch = ?",
        )
        .bind(to)
        .bind(from)
        .execute(&mut **tx)
        .await?;
        sqlx::query(
            "INSERT INTO link (branch, from_tool_id, from_group_url, from_url,
                               to_tool_id, to_group_url, to_url, dirty, deleted, last_clean_version)
             SELECT ?, from_tool_id, from_group_url, from_url,
                    to_tool_id, to_group_url, to_url, dirty, deleted, last_clean_version
             FROM link WHERE branch = ?",
        )
        .bind(to)
        .bind(from)
        .execute(&mut **tx)
        .await?;
        sqlx::query(
            "INSERT INTO inferred_dirtiness (branch, from_tool_id, from_group_url, from_url,
                                             to_tool_id, to_group_url, to_url,
                                             source_tool_id, source_group_url, source_url,
                                             last_clean_version)
             SELECT ?, from_tool_id, from_group_url, from_url,
                    to_tool_id, to_group_url, to_url,
                    source_tool_id, source_group_url, source_url, last_clean_version
             FROM inferred_dirtiness WHERE branch = ?",
        )
        .bind(to)
        .bind(from)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn branch_last_version(&self, storage_name: &str) -> StorageResult<u64> {
        let row = sqlx::query("SELECT last_version FROM branch WHERE name = ?")
            .bind(storage_name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found(format!("branch {storage_name}")))?;
        Ok(row.try_get::<i64, _>("last_version")? as u64)
    }
}

#[async_trait]
impl DepiDatabase for SqlDatabase {
    async fn branch(&self, name: &str) -> StorageResult<Arc<dyn Branch>> {
        if self.tag_storage_name(name).await?.is_some() {
            return Err(StorageError::conflict(format!(
                "cannot check out tag {name} as a branch"
            )));
        }
        let exists = sqlx::query("SELECT name FROM branch WHERE name = ? AND is_tag = 0")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if !exists {
            return Err(StorageError::not_found(format!("branch {name}")));
        }
        Ok(Arc::new(SqlBranch {
            pool: self.pool.clone(),
            config: Arc::clone(&self.config),
            name: name.to_string(),
            storage_name: name.to_string(),
            is_tag: false,
        }))
    }

    async fn tag(&self, name: &str) -> StorageResult<Arc<dyn Branch>> {
        let storage_name = self
            .tag_storage_name(name)
            .await?
            .ok_or_else(|| StorageError::not_found(format!("tag {name}")))?;
        Ok(Arc::new(SqlBranch {
            pool: self.pool.clone(),
            config: Arc::clone(&self.config),
            name: name.to_string(),
            storage_name,
            is_tag: true,
        }))
    }

    async fn branch_exists(&self, name: &str) -> StorageResult<bool> {
        Ok(
            sqlx::query("SELECT name FROM branch WHERE name = ? AND is_tag = 0")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?
                .is_some(),
        )
    }

    async fn tag_exists(&self, name: &str) -> StorageResult<bool> {
        Ok(self.tag_storage_name(name).await?.is_some())
    }

    async fn create_branch(&self, name: &str, from_branch: &str) -> StorageResult<()> {
        if self.branch_exists(name).await? {
            return Err(StorageError::conflict(format!(
                "branch {name} already exists"
            )));
        }
        if !self.branch_exists(from_branch).await? {
            return Err(StorageError::not_found(format!("branch {from_branch}")));
        }
        let parent_version = self.branch_last_version(from_branch).await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO branch (name, parent_name, parent_version, last_version, is_tag)
             VALUES (?, ?, ?, 1, 0)",
        )
        .bind(name)
        .bind(from_branch)
        .bind(parent_version as i64)
        .execute(&mut *tx)
        .await?;
        self.copy_branch_rows(&mut tx, from_branch, name).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_branch_from_tag(&self, name: &str, from_tag: &str) -> StorageResult<()> {
        if self.branch_exists(name).await? {
            return Err(StorageError::conflict(format!(
                "branch {name} already exists"
            )));
        }
        let storage_name = self
            .tag_storage_name(from_tag)
            .await?
            .ok_or_else(|| StorageError::not_found(format!("tag {from_tag}")))?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO branch (name, parent_name, parent_version, last_version, is_tag)
             VALUES (?, ?, 0, 1, 0)",
        )
        .bind(name)
        .bind(&storage_name)
        .execute(&mut *tx)
        .await?;
        self.copy_branch_rows(&mut tx, &storage_name, name).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_tag(&self, name: &str, from_branch: &str) -> StorageResult<()> {
        if self.tag_exists(name).await? {
            return Err(StorageError::conflict(format!("tag {name} already exists")));
        }
        if !self.branch_exists(from_branch).await? {
            return Err(StorageError::not_found(format!("branch {from_branch}")));
        }
        let version = self.branch_last_version(from_branch).await?;
        let storage_name = format!("{name}|{version}");
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO branch (name, parent_name, parent_version, last_version, is_tag)
             VALUES (?, ?, ?, ?, 1)",
        )
        .bind(&storage_name)
        .bind(from_branch)
        .bind(version as i64)
        .bind(version as i64)
        .execute(&mut *tx)
        .await?;
        self.copy_branch_rows(&mut tx, from_branch, &storage_name)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn branch_list(&self) -> StorageResult<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM branch WHERE is_tag = 0 ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| r.try_get::<String, _>("name").map_err(StorageError::from))
            .collect()
    }

    async fn tag_list(&self) -> StorageResult<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM branch WHERE is_tag = 1 ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                let stored = r.try_get::<String, _>("name")?;
                Ok(stored
                    .split_once('|')
                    .map(|(base, _)| base.to_string())
                    .unwrap_or(stored))
            })
            .collect()
    }
}

/// One branch of the relational backend; a cheap handle over the pool.
pub struct SqlBranch {
    pool: SqlitePool,
    config: Arc<DepiConfig>,
    name: String,
    storage_name: String,
    is_tag: bool,
}

impl SqlBranch {
    fn guard_writable(&self) -> StorageResult<()> {
        if self.is_tag {
            return Err(StorageError::conflict("cannot modify a tag"));
        }
        Ok(())
    }

    fn link_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<Link> {
        let mut link = Link::new(
            ResourceRef::new(
                row.try_get::<String, _>("from_tool_id")?,
                row.try_get::<String, _>("from_group_url")?,
                row.try_get::<String, _>("from_url")?,
            ),
            ResourceRef::new(
                row.try_get::<String, _>("to_tool_id")?,
                row.try_get::<String, _>("to_group_url")?,
                row.try_get::<String, _>("to_url")?,
            ),
        );
        link.dirty = row.try_get::<bool, _>("dirty")?;
        link.deleted = row.try_get::<bool, _>("deleted")?;
        link.last_clean_version = row.try_get::<String, _>("last_clean_version")?;
        Ok(link)
    }

    /// Load every link of the branch, inferred entries attached.
    async fn load_links(&self) -> StorageResult<Vec<Link>> {
        let rows = sqlx::query(
            "SELECT from_tool_id, from_group_url, from_url, to_tool_id, to_group_url, to_url,
                    dirty, deleted, last_clean_version
             FROM link WHERE branch = ?",
        )
        .bind(&self.storage_name)
        .fetch_all(&self.pool)
        .await?;

        let mut links = Vec::with_capacity(rows.len());
        let mut by_ref: HashMap<LinkRef, usize> = HashMap::new();
        for row in &rows {
            let link = Self::link_from_row(row)?;
            by_ref.insert(link.link_ref(), links.len());
            links.push(link);
        }

        let inf_rows = sqlx::query(
            "SELECT from_tool_id, from_group_url, from_url, to_tool_id, to_group_url, to_url,
                    source_tool_id, source_group_url, source_url, last_clean_version
             FROM inferred_dirtiness WHERE branch = ?
             ORDER BY source_tool_id, source_group_url, source_url",
        )
        .bind(&self.storage_name)
        .fetch_all(&self.pool)
        .await?;
        for row in &inf_rows {
            let lref = LinkRef::new(
                ResourceRef::new(
                    row.try_get::<String, _>("from_tool_id")?,
                    row.try_get::<String, _>("from_group_url")?,
                    row.try_get::<String, _>("from_url")?,
                ),
                ResourceRef::new(
                    row.try_get::<String, _>("to_tool_id")?,
                    row.try_get::<String, _>("to_group_url")?,
                    row.try_get::<String, _>("to_url")?,
                ),
            );
            if let Some(&i) = by_ref.get(&lref) {
                links[i].inferred_dirtiness.push(InferredDirtiness {
                    source: ResourceRef::new(
                        row.try_get::<String, _>("source_tool_id")?,
                        row.try_get::<String, _>("source_group_url")?,
                        row.try_get::<String, _>("source_url")?,
                    ),
                    last_clean_version: row.try_get::<String, _>("last_clean_version")?,
                });
            }
        }
        Ok(links)
    }

    async fn fetch_group(&self, tool_id: &str, url: &str) -> StorageResult<Option<ResourceGroup>> {
        let row = sqlx::query(
            "SELECT name, version FROM resource_group WHERE branch = ? AND tool_id = ? AND url = ?",
        )
        .bind(&self.storage_name)
        .bind(tool_id)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ResourceGroup::new(
            row.try_get::<String, _>("name")?,
            tool_id,
            url,
            row.try_get::<String, _>("version")?,
        )))
    }

    async fn fetch_group_with_resources(
        &self,
        tool_id: &str,
        url: &str,
    ) -> StorageResult<Option<ResourceGroup>> {
        let Some(mut group) = self.fetch_group(tool_id, url).await? else {
            return Ok(None);
        };
        let rows = sqlx::query(
            "SELECT url, name, id, deleted FROM resource
             WHERE branch = ? AND tool_id = ? AND group_url = ?",
        )
        .bind(&self.storage_name)
        .bind(tool_id)
        .bind(url)
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let mut res = Resource::new(
                row.try_get::<String, _>("name")?,
                row.try_get::<String, _>("id")?,
                row.try_get::<String, _>("url")?,
            );
            res.deleted = row.try_get::<bool, _>("deleted")?;
            group.resources.insert(res.url.clone(), res);
        }
        Ok(Some(group))
    }

    /// Materialize the branch's links plus the named groups into the shared
    /// state type, so the snapshot backend's transition logic can run on it.
    async fn load_partial_state(&self, groups: &[(String, String)]) -> StorageResult<BranchState> {
        let mut state = BranchState::new(self.name.clone());
        state.links = self.load_links().await?;
        for (tool_id, url) in groups {
            if let Some(group) = self.fetch_group_with_resources(tool_id, url).await? {
                state.insert_group(group);
            }
        }
        Ok(state)
    }

    async fn insert_link_rows(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        link: &Link,
    ) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO link (branch, from_tool_id, from_group_url, from_url,
                               to_tool_id, to_group_url, to_url, dirty, deleted, last_clean_version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.storage_name)
        .bind(&link.from_res.tool_id)
        .bind(&link.from_res.resource_group_url)
        .bind(&link.from_res.url)
        .bind(&link.to_res.tool_id)
        .bind(&link.to_res.resource_group_url)
        .bind(&link.to_res.url)
        .bind(link.dirty)
        .bind(link.deleted)
        .bind(&link.last_clean_version)
        .execute(&mut **tx)
        .await?;
        for inf in &link.inferred_dirtiness {
            sqlx::query(
                "INSERT INTO inferred_dirtiness (branch, from_tool_id, from_group_url, from_url,
                                                 to_tool_id, to_group_url, to_url,
                                                 source_tool_id, source_group_url, source_url,
                                                 last_clean_version)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&self.storage_name)
            .bind(&link.from_res.tool_id)
            .bind(&link.from_res.resource_group_url)
            .bind(&link.from_res.url)
            .bind(&link.to_res.tool_id)
            .bind(&link.to_res.resource_group_url)
            .bind(&link.to_res.url)
            .bind(&inf.source.tool_id)
            .bind(&inf.source.resource_group_url)
            .bind(&inf.source.url)
            .bind(&inf.last_clean_version)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn delete_link_rows(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        lref: &LinkRef,
    ) -> StorageResult<()> {
        for table in ["link", "inferred_dirtiness"] {
            sqlx::query(&format!(
                "DELETE FROM {table}
                 WHERE branch = ? AND from_tool_id = ? AND from_group_url = ? AND from_url = ?
                   AND to_tool_id = ? AND to_group_url = ? AND to_url = ?"
            ))
            .bind(&self.storage_name)
            .bind(&lref.from_res.tool_id)
            .bind(&lref.from_res.resource_group_url)
            .bind(&lref.from_res.url)
            .bind(&lref.to_res.tool_id)
            .bind(&lref.to_res.resource_group_url)
            .bind(&lref.to_res.url)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    /// Write back the links that changed between `old` and the state's
    /// current link set: removed rows are deleted, changed and new links are
    /// rewritten together with their inferred entries.
    async fn persist_link_diff(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        old: &HashMap<LinkRef, Link>,
        new: &[Link],
    ) -> StorageResult<()> {
        for link in new {
            let lref = link.link_ref();
            let unchanged = old
                .get(&lref)
                .map(|prev| links_deep_equal(prev, link))
                .unwrap_or(false);
            if !unchanged {
                self.delete_link_rows(tx, &lref).await?;
                self.insert_link_rows(tx, link).await?;
            }
        }
        for lref in old.keys() {
            if !new.iter().any(|l| l.same_endpoints(lref)) {
                self.delete_link_rows(tx, lref).await?;
            }
        }
        Ok(())
    }

    /// Write back one group's header and resources after a state transition.
    async fn persist_group_diff(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        old: Option<&ResourceGroup>,
        new: Option<&ResourceGroup>,
    ) -> StorageResult<()> {
        let Some(new) = new else {
            return Ok(());
        };
        match old {
            None => {
                sqlx::query(
                    "INSERT OR REPLACE INTO resource_group (branch, tool_id, url, name, version)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&self.storage_name)
                .bind(&new.tool_id)
                .bind(&new.url)
                .bind(&new.name)
                .bind(&new.version)
                .execute(&mut **tx)
                .await?;
            }
            Some(old) if old.name != new.name || old.version != new.version => {
                sqlx::query(
                    "UPDATE resource_group SET name = ?, version = ?
                     WHERE branch = ? AND tool_id = ? AND url = ?",
                )
                .bind(&new.name)
                .bind(&new.version)
                .bind(&self.storage_name)
                .bind(&new.tool_id)
                .bind(&new.url)
                .execute(&mut **tx)
                .await?;
            }
            Some(_) => {}
        }

        // Resource rows: upsert changed, delete removed.
        for res in new.resources.values() {
            let unchanged = old
                .and_then(|o| o.resources.get(&res.url))
                .map(|prev| prev == res && prev.name == res.name && prev.deleted == res.deleted)
                .unwrap_or(false);
            if !unchanged {
                sqlx::query(
                    "INSERT OR REPLACE INTO resource (branch, tool_id, group_url, url, name, id, deleted)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&self.storage_name)
                .bind(&new.tool_id)
                .bind(&new.url)
                .bind(&res.url)
                .bind(&res.name)
                .bind(&res.id)
                .bind(res.deleted)
                .execute(&mut **tx)
                .await?;
            }
        }
        if let Some(old) = old {
            for res in old.resources.values() {
                if !new.resources.contains_key(&res.url) {
                    sqlx::query(
                        "DELETE FROM resource
                         WHERE branch = ? AND tool_id = ? AND group_url = ? AND url = ?",
                    )
                    .bind(&self.storage_name)
                    .bind(&old.tool_id)
                    .bind(&old.url)
                    .bind(&res.url)
                    .execute(&mut **tx)
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn view_for_ref(&self, rr: &ResourceRef) -> StorageResult<ResourceView> {
        let row = sqlx::query(
            "SELECT r.name AS res_name, r.id AS res_id, r.deleted AS res_deleted,
                    rg.name AS rg_name, rg.version AS rg_version
             FROM resource r
             JOIN resource_group rg
               ON rg.branch = r.branch AND rg.tool_id = r.tool_id AND rg.url = r.group_url
             WHERE r.branch = ? AND r.tool_id = ? AND r.group_url = ? AND r.url = ?",
        )
        .bind(&self.storage_name)
        .bind(&rr.tool_id)
        .bind(&rr.resource_group_url)
        .bind(&rr.url)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Ok(ResourceView {
                tool_id: rr.tool_id.clone(),
                resource_group_url: rr.resource_group_url.clone(),
                resource_group_name: row.try_get::<String, _>("rg_name")?,
                resource_group_version: row.try_get::<String, _>("rg_version")?,
                name: row.try_get::<String, _>("res_name")?,
                url: rr.url.clone(),
                id: row.try_get::<String, _>("res_id")?,
                deleted: row.try_get::<bool, _>("res_deleted")?,
            });
        }

        let group = self.fetch_group(&rr.tool_id, &rr.resource_group_url).await?;
        let (group_name, group_version) = group
            .map(|g| (g.name, g.version))
            .unwrap_or_default();
        Ok(ResourceView {
            tool_id: rr.tool_id.clone(),
            resource_group_url: rr.resource_group_url.clone(),
            resource_group_name: group_name,
            resource_group_version: group_version,
            name: String::new(),
            url: rr.url.clone(),
            id: String::new(),
            deleted: true,
        })
    }

    async fn materialize(&self, link: &Link) -> StorageResult<LinkView> {
        let mut inferred = Vec::with_capacity(link.inferred_dirtiness.len());
        for inf in &link.inferred_dirtiness {
            inferred.push(InferredDirtinessView {
                resource: self.view_for_ref(&inf.source).await?,
                last_clean_version: inf.last_clean_version.clone(),
            });
        }
        Ok(LinkView {
            from_res: self.view_for_ref(&link.from_res).await?,
            to_res: self.view_for_ref(&link.to_res).await?,
            dirty: link.dirty,
            deleted: link.deleted,
            last_clean_version: link.last_clean_version.clone(),
            inferred_dirtiness: inferred,
        })
    }

    async fn materialize_all(&self, links: Vec<Link>) -> StorageResult<Vec<LinkView>> {
        let mut out = Vec::with_capacity(links.len());
        for link in &links {
            out.push(self.materialize(link).await?);
        }
        Ok(out)
    }

    async fn add_resource_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        rg: &ResourceGroup,
        res: Option<&Resource>,
    ) -> StorageResult<bool> {
        sqlx::query(
            "INSERT OR IGNORE INTO resource_group (branch, tool_id, url, name, version)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&self.storage_name)
        .bind(&rg.tool_id)
        .bind(&rg.url)
        .bind(&rg.name)
        .bind(&rg.version)
        .execute(&mut **tx)
        .await?;

        let Some(res) = res else {
            return Ok(false);
        };
        let existing = sqlx::query(
            "SELECT deleted FROM resource
             WHERE branch = ? AND tool_id = ? AND group_url = ? AND url = ?",
        )
        .bind(&self.storage_name)
        .bind(&rg.tool_id)
        .bind(&rg.url)
        .bind(&res.url)
        .fetch_optional(&mut **tx)
        .await?;

        match existing {
            None => {
                sqlx::query(
                    "INSERT INTO resource (branch, tool_id, group_url, url, name, id, deleted)
                     VALUES (?, ?, ?, ?, ?, ?, 0)",
                )
                .bind(&self.storage_name)
                .bind(&rg.tool_id)
                .bind(&rg.url)
                .bind(&res.url)
                .bind(&res.name)
                .bind(&res.id)
                .execute(&mut **tx)
                .await?;
                Ok(true)
            }
            Some(row) if row.try_get::<bool, _>("deleted")? => {
                sqlx::query(
                    "UPDATE resource SET deleted = 0
                     WHERE branch = ? AND tool_id = ? AND group_url = ? AND url = ?",
                )
                .bind(&self.storage_name)
                .bind(&rg.tool_id)
                .bind(&rg.url)
                .bind(&res.url)
                .execute(&mut **tx)
                .await?;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }
}

/// Full structural equality, unlike `Link`'s endpoint-only identity.
fn links_deep_equal(a: &Link, b: &Link) -> bool {
    a.from_res == b.from_res
        && a.to_res == b.to_res
        && a.dirty == b.dirty
        && a.deleted == b.deleted
        && a.last_clean_version == b.last_clean_version
        && a.inferred_dirtiness == b.inferred_dirtiness
}

#[async_trait]
impl Branch for SqlBranch {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn is_tag(&self) -> bool {
        self.is_tag
    }

    async fn add_resource(
        &self,
        rg: &ResourceGroup,
        res: Option<&Resource>,
    ) -> StorageResult<bool> {
        self.guard_writable()?;
        let mut tx = self.pool.begin().await?;
        let added = self.add_resource_tx(&mut tx, rg, res).await?;
        tx.commit().await?;
        Ok(added)
    }

    async fn add_resources(&self, resources: &[(ResourceGroup, Resource)]) -> StorageResult<()> {
        self.guard_writable()?;
        let mut tx = self.pool.begin().await?;
        for (rg, res) in resources {
            self.add_resource_tx(&mut tx, rg, Some(res)).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn add_link(&self, view: &LinkView) -> StorageResult<bool> {
        self.guard_writable()?;
        let mut tx = self.pool.begin().await?;
        self.add_resource_tx(&mut tx, &view.from_res.group_header(), Some(&view.from_res.resource()))
            .await?;
        self.add_resource_tx(&mut tx, &view.to_res.group_header(), Some(&view.to_res.resource()))
            .await?;

        let mut link = view.to_link();
        link.deleted = false;
        if !link.dirty {
            link.last_clean_version.clear();
        }
        let lref = link.link_ref();
        let existing = sqlx::query(
            "SELECT deleted FROM link
             WHERE branch = ? AND from_tool_id = ? AND from_group_url = ? AND from_url = ?
               AND to_tool_id = ? AND to_group_url = ? AND to_url = ?",
        )
        .bind(&self.storage_name)
        .bind(&lref.from_res.tool_id)
        .bind(&lref.from_res.resource_group_url)
        .bind(&lref.from_res.url)
        .bind(&lref.to_res.tool_id)
        .bind(&lref.to_res.resource_group_url)
        .bind(&lref.to_res.url)
        .fetch_optional(&mut *tx)
        .await?;

        let added = match existing {
            None => {
                self.insert_link_rows(&mut tx, &link).await?;
                true
            }
            Some(row) if row.try_get::<bool, _>("deleted")? => {
                sqlx::query(
                    "UPDATE link SET deleted = 0
                     WHERE branch = ? AND from_tool_id = ? AND from_group_url = ? AND from_url = ?
                       AND to_tool_id = ? AND to_group_url = ? AND to_url = ?",
                )
                .bind(&self.storage_name)
                .bind(&lref.from_res.tool_id)
                .bind(&lref.from_res.resource_group_url)
                .bind(&lref.from_res.url)
                .bind(&lref.to_res.tool_id)
                .bind(&lref.to_res.resource_group_url)
                .bind(&lref.to_res.url)
                .execute(&mut *tx)
                .await?;
                true
            }
            Some(_) => false,
        };
        tx.commit().await?;
        Ok(added)
    }

    async fn add_links(&self, links: &[LinkView]) -> StorageResult<()> {
        for link in links {
            self.add_link(link).await?;
        }
        Ok(())
    }

    async fn remove_resource(&self, rr: &ResourceRef) -> StorageResult<bool> {
        self.guard_writable()?;
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query(
            "SELECT deleted FROM resource
             WHERE branch = ? AND tool_id = ? AND group_url = ? AND url = ?",
        )
        .bind(&self.storage_name)
        .bind(&rr.tool_id)
        .bind(&rr.resource_group_url)
        .bind(&rr.url)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = existing else {
            return Ok(false);
        };
        if row.try_get::<bool, _>("deleted")? {
            return Ok(false);
        }
        sqlx::query(
            "UPDATE resource SET deleted = 1
             WHERE branch = ? AND tool_id = ? AND group_url = ? AND url = ?",
        )
        .bind(&self.storage_name)
        .bind(&rr.tool_id)
        .bind(&rr.resource_group_url)
        .bind(&rr.url)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE link SET deleted = 1
             WHERE branch = ?
               AND ((from_tool_id = ? AND from_group_url = ? AND from_url = ?)
                 OR (to_tool_id = ? AND to_group_url = ? AND to_url = ?))",
        )
        .bind(&self.storage_name)
        .bind(&rr.tool_id)
        .bind(&rr.resource_group_url)
        .bind(&rr.url)
        .bind(&rr.tool_id)
        .bind(&rr.resource_group_url)
        .bind(&rr.url)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn remove_link(&self, lref: &LinkRef) -> StorageResult<bool> {
        self.guard_writable()?;
        let mut tx = self.pool.begin().await?;
        let affected = sqlx::query(
            "DELETE FROM link
             WHERE branch = ? AND from_tool_id = ? AND from_group_url = ? AND from_url = ?
               AND to_tool_id = ? AND to_group_url = ? AND to_url = ?",
        )
        .bind(&self.storage_name)
        .bind(&lref.from_res.tool_id)
        .bind(&lref.from_res.resource_group_url)
        .bind(&lref.from_res.url)
        .bind(&lref.to_res.tool_id)
        .bind(&lref.to_res.resource_group_url)
        .bind(&lref.to_res.url)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query(
            "DELETE FROM inferred_dirtiness
             WHERE branch = ? AND from_tool_id = ? AND from_group_url = ? AND from_url = ?
               AND to_tool_id = ? AND to_group_url = ? AND to_url = ?",
        )
        .bind(&self.storage_name)
        .bind(&lref.from_res.tool_id)
        .bind(&lref.from_res.resource_group_url)
        .bind(&lref.from_res.url)
        .bind(&lref.to_res.tool_id)
        .bind(&lref.to_res.resource_group_url)
        .bind(&lref.to_res.url)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(affected > 0)
    }

    async fn get_resource(
        &self,
        rr: &ResourceRef,
        include_deleted: bool,
    ) -> StorageResult<Option<ResourceView>> {
        let row = sqlx::query(
            "SELECT r.name AS res_name, r.id AS res_id, r.deleted AS res_deleted,
                    rg.name AS rg_name, rg.version AS rg_version
             FROM resource r
             JOIN resource_group rg
               ON rg.branch = r.branch AND rg.tool_id = r.tool_id AND rg.url = r.group_url
             WHERE r.branch = ? AND r.tool_id = ? AND r.group_url = ? AND r.url = ?",
        )
        .bind(&self.storage_name)
        .bind(&rr.tool_id)
        .bind(&rr.resource_group_url)
        .bind(&rr.url)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let deleted = row.try_get::<bool, _>("res_deleted")?;
        if deleted && !include_deleted {
            return Ok(None);
        }
        Ok(Some(ResourceView {
            tool_id: rr.tool_id.clone(),
            resource_group_url: rr.resource_group_url.clone(),
            resource_group_name: row.try_get::<String, _>("rg_name")?,
            resource_group_version: row.try_get::<String, _>("rg_version")?,
            name: row.try_get::<String, _>("res_name")?,
            url: rr.url.clone(),
            id: row.try_get::<String, _>("res_id")?,
            deleted,
        }))
    }

    async fn get_resource_by_id(
        &self,
        tool_id: &str,
        group_url: &str,
        res_id: &str,
    ) -> StorageResult<Option<ResourceView>> {
        let row = sqlx::query(
            "SELECT r.url, r.name AS res_name, r.deleted AS res_deleted,
                    rg.name AS rg_name, rg.version AS rg_version
             FROM resource r
             JOIN resource_group rg
               ON rg.branch = r.branch AND rg.tool_id = r.tool_id AND rg.url = r.group_url
             WHERE r.branch = ? AND r.tool_id = ? AND r.group_url = ? AND r.id = ?",
        )
        .bind(&self.storage_name)
        .bind(tool_id)
        .bind(group_url)
        .bind(res_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Some(ResourceView {
                tool_id: tool_id.to_string(),
                resource_group_url: group_url.to_string(),
                resource_group_name: row.try_get::<String, _>("rg_name")?,
                resource_group_version: row.try_get::<String, _>("rg_version")?,
                name: row.try_get::<String, _>("res_name")?,
                url: row.try_get::<String, _>("url")?,
                id: res_id.to_string(),
                deleted: row.try_get::<bool, _>("res_deleted")?,
            }),
            None => None,
        })
    }

    async fn get_resource_group(
        &self,
        tool_id: &str,
        url: &str,
    ) -> StorageResult<Option<ResourceGroup>> {
        self.fetch_group_with_resources(tool_id, url).await
    }

    async fn get_resource_group_version(&self, tool_id: &str, url: &str) -> StorageResult<String> {
        Ok(self
            .fetch_group(tool_id, url)
            .await?
            .map(|rg| rg.version)
            .unwrap_or_default())
    }

    async fn get_resource_groups(&self) -> StorageResult<Vec<ResourceGroup>> {
        let rows =
            sqlx::query("SELECT tool_id, url, name, version FROM resource_group WHERE branch = ?")
                .bind(&self.storage_name)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|row| {
                Ok(ResourceGroup::new(
                    row.try_get::<String, _>("name")?,
                    row.try_get::<String, _>("tool_id")?,
                    row.try_get::<String, _>("url")?,
                    row.try_get::<String, _>("version")?,
                ))
            })
            .collect()
    }

    async fn get_resources(
        &self,
        patterns: &[ResourceRefPattern],
        include_deleted: bool,
    ) -> StorageResult<Vec<ResourceView>> {
        let mut out = Vec::new();
        let mut seen: std::collections::HashSet<(String, String, String)> =
            std::collections::HashSet::new();
        for pattern in patterns {
            let re = pattern.compile()?;
            let Some(group) = self
                .fetch_group_with_resources(&pattern.tool_id, &pattern.resource_group_url)
                .await?
            else {
                continue;
            };
            for res in group.resources.values() {
                if res.deleted && !include_deleted {
                    continue;
                }
                if re.is_match(&res.url)
                    && seen.insert((
                        pattern.tool_id.clone(),
                        pattern.resource_group_url.clone(),
                        res.url.clone(),
                    ))
                {
                    out.push(ResourceView::new(&group, res));
                }
            }
        }
        Ok(out)
    }

    async fn get_links(&self, patterns: &[ResourceLinkPattern]) -> StorageResult<Vec<LinkView>> {
        let links = self.load_links().await?;
        let mut matched = Vec::new();
        let mut seen: std::collections::HashSet<LinkRef> = std::collections::HashSet::new();
        for pattern in patterns {
            let from_re = pattern.from_res.compile()?;
            let to_re = pattern.to_res.compile()?;
            for link in &links {
                if link.deleted {
                    continue;
                }
                if link.from_res.tool_id == pattern.from_res.tool_id
                    && link.from_res.resource_group_url == pattern.from_res.resource_group_url
                    && link.to_res.tool_id == pattern.to_res.tool_id
                    && link.to_res.resource_group_url == pattern.to_res.resource_group_url
                    && from_re.is_match(&link.from_res.url)
                    && to_re.is_match(&link.to_res.url)
                    && seen.insert(link.link_ref())
                {
                    matched.push(link.clone());
                }
            }
        }
        self.materialize_all(matched).await
    }

    async fn get_all_links(&self, include_deleted: bool) -> StorageResult<Vec<LinkView>> {
        let links = self
            .load_links()
            .await?
            .into_iter()
            .filter(|l| include_deleted || !l.deleted)
            .collect();
        self.materialize_all(links).await
    }

    async fn get_dirty_links(
        &self,
        group: &ResourceGroup,
        with_inferred: bool,
    ) -> StorageResult<Vec<LinkView>> {
        let links = self
            .load_links()
            .await?
            .into_iter()
            .filter(|l| {
                !l.deleted
                    && l.to_res.in_group(&group.tool_id, &group.url)
                    && (l.dirty || (with_inferred && !l.inferred_dirtiness.is_empty()))
            })
            .collect();
        self.materialize_all(links).await
    }

    async fn expand_links(&self, refs: &[LinkRef]) -> StorageResult<Vec<LinkView>> {
        let links = self.load_links().await?;
        let mut out = Vec::with_capacity(refs.len());
        for lref in refs {
            let link = links
                .iter()
                .find(|l| l.same_endpoints(lref))
                .cloned()
                .unwrap_or_else(|| lref.to_link());
            out.push(self.materialize(&link).await?);
        }
        Ok(out)
    }

    async fn get_dependency_graph(
        &self,
        rr: &ResourceRef,
        upstream: bool,
        max_depth: i32,
    ) -> StorageResult<Vec<LinkView>> {
        let links = self.load_links().await?;
        let indices = propagate::dependency_graph(&links, rr, upstream, max_depth);
        let selected: Vec<Link> = indices.into_iter().map(|i| links[i].clone()).collect();
        self.materialize_all(selected).await
    }

    async fn update_resource_group(
        &self,
        change: &ResourceGroupChange,
    ) -> StorageResult<Vec<Link>> {
        self.guard_writable()?;
        let sep = self.config.path_separator(&change.tool_id).to_string();
        let groups = vec![(change.tool_id.clone(), change.url.clone())];
        let mut state = self.load_partial_state(&groups).await?;

        let old_links: HashMap<LinkRef, Link> =
            state.links.iter().map(|l| (l.link_ref(), l.clone())).collect();
        let old_group = state.group(&change.tool_id, &change.url).cloned();

        let dirtied = state.update_resource_group(change, &sep);
        let new_group = state.group(&change.tool_id, &change.url).cloned();

        let mut tx = self.pool.begin().await?;
        self.persist_link_diff(&mut tx, &old_links, &state.links)
            .await?;
        self.persist_group_diff(&mut tx, old_group.as_ref(), new_group.as_ref())
            .await?;
        tx.commit().await?;
        Ok(dirtied)
    }

    async fn edit_resource_group(
        &self,
        old: &ResourceGroup,
        new: &ResourceGroup,
    ) -> StorageResult<()> {
        self.guard_writable()?;
        let mut tx = self.pool.begin().await?;
        if !new.version.is_empty() {
            sqlx::query(
                "UPDATE resource_group SET version = ? WHERE branch = ? AND tool_id = ? AND url = ?",
            )
            .bind(&new.version)
            .bind(&self.storage_name)
            .bind(&old.tool_id)
            .bind(&old.url)
            .execute(&mut *tx)
            .await?;
        }
        if !new.name.is_empty() {
            sqlx::query(
                "UPDATE resource_group SET name = ? WHERE branch = ? AND tool_id = ? AND url = ?",
            )
            .bind(&new.name)
            .bind(&self.storage_name)
            .bind(&old.tool_id)
            .bind(&old.url)
            .execute(&mut *tx)
            .await?;
        }
        let moves = (!new.tool_id.is_empty() && new.tool_id != old.tool_id)
            || (!new.url.is_empty() && new.url != old.url);
        if moves {
            sqlx::query(
                "UPDATE resource_group SET tool_id = ?, url = ?
                 WHERE branch = ? AND tool_id = ? AND url = ?",
            )
            .bind(&new.tool_id)
            .bind(&new.url)
            .bind(&self.storage_name)
            .bind(&old.tool_id)
            .bind(&old.url)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "UPDATE resource SET tool_id = ?, group_url = ?
                 WHERE branch = ? AND tool_id = ? AND group_url = ?",
            )
            .bind(&new.tool_id)
            .bind(&new.url)
            .bind(&self.storage_name)
            .bind(&old.tool_id)
            .bind(&old.url)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn remove_resource_group(&self, tool_id: &str, url: &str) -> StorageResult<()> {
        self.guard_writable()?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM link
             WHERE branch = ?
               AND ((from_tool_id = ? AND from_group_url = ?)
                 OR (to_tool_id = ? AND to_group_url = ?))",
        )
        .bind(&self.storage_name)
        .bind(tool_id)
        .bind(url)
        .bind(tool_id)
        .bind(url)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM inferred_dirtiness
             WHERE branch = ?
               AND ((from_tool_id = ? AND from_group_url = ?)
                 OR (to_tool_id = ? AND to_group_url = ?)
                 OR (source_tool_id = ? AND source_group_url = ?))",
        )
        .bind(&self.storage_name)
        .bind(tool_id)
        .bind(url)
        .bind(tool_id)
        .bind(url)
        .bind(tool_id)
        .bind(url)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM resource WHERE branch = ? AND tool_id = ? AND group_url = ?")
            .bind(&self.storage_name)
            .bind(tool_id)
            .bind(url)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM resource_group WHERE branch = ? AND tool_id = ? AND url = ?")
            .bind(&self.storage_name)
            .bind(tool_id)
            .bind(url)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mark_links_clean(&self, links: &[LinkRef], propagate: bool) -> StorageResult<()> {
        self.guard_writable()?;
        let mut groups: Vec<(String, String)> = Vec::new();
        for lref in links {
            let key = (
                lref.from_res.tool_id.clone(),
                lref.from_res.resource_group_url.clone(),
            );
            if !groups.contains(&key) {
                groups.push(key);
            }
        }
        let mut state = self.load_partial_state(&groups).await?;
        let old_links: HashMap<LinkRef, Link> =
            state.links.iter().map(|l| (l.link_ref(), l.clone())).collect();
        let old_groups: Vec<ResourceGroup> = groups
            .iter()
            .filter_map(|(t, u)| state.group(t, u).cloned())
            .collect();

        state.mark_links_clean(links, propagate);

        let mut tx = self.pool.begin().await?;
        self.persist_link_diff(&mut tx, &old_links, &state.links)
            .await?;
        for old_group in &old_groups {
            let new_group = state.group(&old_group.tool_id, &old_group.url).cloned();
            self.persist_group_diff(&mut tx, Some(old_group), new_group.as_ref())
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn mark_inferred_dirtiness_clean(
        &self,
        link: &LinkRef,
        source: &ResourceRef,
        propagate_clean: bool,
    ) -> StorageResult<Vec<(LinkRef, ResourceRef)>> {
        self.guard_writable()?;
        let mut state = self.load_partial_state(&[]).await?;
        let old_links: HashMap<LinkRef, Link> =
            state.links.iter().map(|l| (l.link_ref(), l.clone())).collect();
        let cleaned = state.mark_inferred_dirtiness_clean(link, source, propagate_clean);
        let mut tx = self.pool.begin().await?;
        self.persist_link_diff(&mut tx, &old_links, &state.links)
            .await?;
        tx.commit().await?;
        Ok(cleaned)
    }

    async fn save_branch_state(&self) -> StorageResult<()> {
        self.guard_writable()?;
        sqlx::query("UPDATE branch SET last_version = last_version + 1 WHERE name = ?")
            .bind(&self.storage_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeType, ResourceChange};

    fn test_config() -> Arc<DepiConfig> {
        let mut config = DepiConfig::default();
        config.db.url = "sqlite::memory:".to_string();
        config
            .tools
            .insert("git".to_string(), crate::config::ToolConfig::default());
        Arc::new(config)
    }

    fn group() -> ResourceGroup {
        ResourceGroup::new("testrepo", "git", "rg1", "v0")
    }

    fn res(url: &str) -> Resource {
        Resource::new(url.trim_start_matches('/'), url.trim_start_matches('/'), url)
    }

    fn link_view(from: &str, to: &str) -> LinkView {
        LinkView::new(
            ResourceView::new(&group(), &res(from)),
            ResourceView::new(&group(), &res(to)),
        )
    }

    #[tokio::test]
    async fn resources_round_trip() {
        let db = SqlDatabase::new(test_config()).await.unwrap();
        let main = db.branch("main").await.unwrap();
        assert!(main.add_resource(&group(), Some(&res("/r1"))).await.unwrap());
        assert!(!main.add_resource(&group(), Some(&res("/r1"))).await.unwrap());

        let view = main
            .get_resource(&ResourceRef::new("git", "rg1", "/r1"), false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(view.resource_group_version, "v0");
        assert_eq!(view.name, "r1");
    }

    #[tokio::test]
    async fn change_processing_matches_snapshot_semantics() {
        let db = SqlDatabase::new(test_config()).await.unwrap();
        let main = db.branch("main").await.unwrap();
        main.add_link(&link_view("/r1", "/r2")).await.unwrap();
        main.add_link(&link_view("/r2", "/r3")).await.unwrap();
        main.add_link(&link_view("/r3", "/r4")).await.unwrap();

        let change = ResourceGroupChange::new("testrepo", "git", "rg1", "v1")
            .with_change(ResourceChange::new("r2", "r2", "/r2", ChangeType::Modified));
        let dirtied = main.update_resource_group(&change).await.unwrap();
        assert_eq!(dirtied.len(), 1);

        let links = main.get_all_links(false).await.unwrap();
        let r2_link = links.iter().find(|l| l.from_res.url == "/r2").unwrap();
        assert!(r2_link.dirty);
        assert_eq!(r2_link.last_clean_version, "v0");
        let r3_link = links.iter().find(|l| l.from_res.url == "/r3").unwrap();
        assert!(!r3_link.dirty);
        assert_eq!(r3_link.inferred_dirtiness.len(), 1);
        assert_eq!(r3_link.inferred_dirtiness[0].resource.url, "/r2");

        main.mark_links_clean(&[r2_link.link_ref()], true)
            .await
            .unwrap();
        let links = main.get_all_links(false).await.unwrap();
        assert!(links.iter().all(|l| !l.dirty));
        assert!(links.iter().all(|l| l.inferred_dirtiness.is_empty()));
    }

    #[tokio::test]
    async fn tags_reject_writes() {
        let db = SqlDatabase::new(test_config()).await.unwrap();
        let main = db.branch("main").await.unwrap();
        main.add_resource(&group(), Some(&res("/r1"))).await.unwrap();
        main.save_branch_state().await.unwrap();

        db.create_tag("rel", "main").await.unwrap();
        let tag = db.tag("rel").await.unwrap();
        assert!(tag.add_resource(&group(), Some(&res("/r2"))).await.is_err());
        assert!(tag.save_branch_state().await.is_err());
        assert!(db.branch("rel").await.is_err());

        db.create_branch_from_tag("feature", "rel").await.unwrap();
        let feature = db.branch("feature").await.unwrap();
        assert!(feature
            .get_resource(&ResourceRef::new("git", "rg1", "/r1"), false)
            .await
            .unwrap()
            .is_some());
    }
}
