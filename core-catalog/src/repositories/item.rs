//! Canonical item repository trait and implementation

use crate::error::{CatalogError, Result};
use crate::models::{
    CanonicalItem, ClientId, ExternalIds, IdentifierSource, ItemId, MediaKind, MediaPayload,
    SourceLinks,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};
use tracing::warn;

/// Canonical item repository interface
///
/// Lookups used by identity resolution are scoped by kind. Writes are atomic
/// per item: the envelope row and its identity rows commit together.
#[async_trait]
pub trait CanonicalItemRepository: Send + Sync {
    /// Item linked to `(kind, client_id, external_item_id)`, if any.
    async fn find_by_source_link(
        &self,
        kind: MediaKind,
        client_id: ClientId,
        external_item_id: &str,
    ) -> Result<Option<CanonicalItem>>;

    /// Every item of `kind` carrying `source = value`, oldest first.
    async fn find_all_by_external_identifier(
        &self,
        kind: MediaKind,
        source: IdentifierSource,
        value: &str,
    ) -> Result<Vec<CanonicalItem>>;

    /// Oldest item of `kind` carrying `source = value`.
    async fn find_by_external_identifier(
        &self,
        kind: MediaKind,
        source: IdentifierSource,
        value: &str,
    ) -> Result<Option<CanonicalItem>> {
        Ok(self
            .find_all_by_external_identifier(kind, source, value)
            .await?
            .into_iter()
            .next())
    }

    /// Items of `kind` already linked to `client_id` with exactly this title
    /// and year, oldest first. A missing year only matches a missing year.
    async fn find_by_title_year(
        &self,
        kind: MediaKind,
        client_id: ClientId,
        title: &str,
        year: Option<i32>,
    ) -> Result<Vec<CanonicalItem>>;

    /// Insert a new item with its source links and external identifiers.
    ///
    /// # Errors
    /// Returns [`CatalogError::Conflict`] if one of its source links already
    /// belongs to another item.
    async fn create(&self, item: &CanonicalItem) -> Result<()>;

    /// Overwrite descriptive fields and upsert identity rows.
    ///
    /// Identity rows absent from `item` are left in place.
    async fn update(&self, item: &CanonicalItem) -> Result<()>;

    async fn get_by_id(&self, id: ItemId) -> Result<Option<CanonicalItem>>;

    /// All items of `kind`, oldest first.
    async fn list_by_kind(&self, kind: MediaKind) -> Result<Vec<CanonicalItem>>;

    async fn count_by_kind(&self, kind: MediaKind) -> Result<i64>;
}

#[derive(Debug, FromRow)]
struct ItemRow {
    id: String,
    kind: String,
    title: String,
    release_year: Option<i32>,
    release_date: Option<String>,
    payload: String,
    created_at: i64,
    updated_at: i64,
}

/// SQLite implementation of CanonicalItemRepository
#[derive(Clone)]
pub struct SqliteCanonicalItemRepository {
    pool: SqlitePool,
}

impl SqliteCanonicalItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn hydrate(&self, row: ItemRow) -> Result<CanonicalItem> {
        let payload: MediaPayload = serde_json::from_str(&row.payload)?;
        if payload.kind().as_str() != row.kind {
            return Err(CatalogError::InvalidInput {
                field: "payload".to_string(),
                message: format!(
                    "item {} stored as {} but payload is {}",
                    row.id,
                    row.kind,
                    payload.kind()
                ),
            });
        }

        let release_date = match row.release_date.as_deref() {
            Some(raw) => Some(raw.parse::<NaiveDate>().map_err(|e| {
                CatalogError::InvalidInput {
                    field: "release_date".to_string(),
                    message: e.to_string(),
                }
            })?),
            None => None,
        };

        let links: Vec<(i64, String)> = sqlx::query_as(
            "SELECT client_id, external_item_id FROM item_source_links WHERE item_id = ?",
        )
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await?;

        let mut source_links = SourceLinks::new();
        for (client_id, external_item_id) in links {
            source_links.upsert(ClientId(client_id), external_item_id);
        }

        let identifiers: Vec<(String, String)> =
            sqlx::query_as("SELECT source, value FROM item_external_ids WHERE item_id = ?")
                .bind(&row.id)
                .fetch_all(&self.pool)
                .await?;

        let mut external_ids = ExternalIds::new();
        for (source, value) in identifiers {
            match source.parse::<IdentifierSource>() {
                Ok(source) => {
                    external_ids.upsert(source, value);
                }
                Err(_) => warn!(item_id = %row.id, source = %source, "Ignoring unknown identifier source"),
            }
        }

        Ok(CanonicalItem {
            id: ItemId::from_string(&row.id)?,
            title: row.title,
            release_year: row.release_year,
            release_date,
            source_links,
            external_ids,
            payload,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    async fn hydrate_all(&self, rows: Vec<ItemRow>) -> Result<Vec<CanonicalItem>> {
        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(self.hydrate(row).await?);
        }
        Ok(items)
    }

    fn check(item: &CanonicalItem) -> Result<()> {
        item.validate().map_err(|message| CatalogError::InvalidInput {
            field: "item".to_string(),
            message,
        })
    }

    async fn write_identity(tx: &mut Transaction<'_, Sqlite>, item: &CanonicalItem) -> Result<()> {
        let item_id = item.id.as_str();
        let kind = item.kind().as_str();

        for (client_id, external_item_id) in item.source_links.iter() {
            sqlx::query(
                r#"
                INSERT INTO item_source_links (item_id, kind, client_id, external_item_id)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(item_id, client_id) DO UPDATE SET
                    external_item_id = excluded.external_item_id
                "#,
            )
            .bind(&item_id)
            .bind(kind)
            .bind(client_id.0)
            .bind(external_item_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    CatalogError::Conflict(format!(
                        "{} ({}, {}) is already linked to another item",
                        kind, client_id, external_item_id
                    ))
                }
                other => CatalogError::Database(other),
            })?;
        }

        for (source, value) in item.external_ids.iter_preferred() {
            sqlx::query(
                r#"
                INSERT INTO item_external_ids (item_id, kind, source, value)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(item_id, source) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(&item_id)
            .bind(kind)
            .bind(source.as_str())
            .bind(value)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl CanonicalItemRepository for SqliteCanonicalItemRepository {
    async fn find_by_source_link(
        &self,
        kind: MediaKind,
        client_id: ClientId,
        external_item_id: &str,
    ) -> Result<Option<CanonicalItem>> {
        let row = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT i.* FROM canonical_items i
            JOIN item_source_links l ON l.item_id = i.id
            WHERE l.kind = ? AND l.client_id = ? AND l.external_item_id = ?
            "#,
        )
        .bind(kind.as_str())
        .bind(client_id.0)
        .bind(external_item_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn find_all_by_external_identifier(
        &self,
        kind: MediaKind,
        source: IdentifierSource,
        value: &str,
    ) -> Result<Vec<CanonicalItem>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT i.* FROM canonical_items i
            JOIN item_external_ids e ON e.item_id = i.id
            WHERE e.kind = ? AND e.source = ? AND e.value = ?
            ORDER BY i.created_at, i.rowid
            "#,
        )
        .bind(kind.as_str())
        .bind(source.as_str())
        .bind(value)
        .fetch_all(&self.pool)
        .await?;

        self.hydrate_all(rows).await
    }

    async fn find_by_title_year(
        &self,
        kind: MediaKind,
        client_id: ClientId,
        title: &str,
        year: Option<i32>,
    ) -> Result<Vec<CanonicalItem>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT i.* FROM canonical_items i
            JOIN item_source_links l ON l.item_id = i.id
            WHERE i.kind = ? AND l.client_id = ? AND i.title = ? AND i.release_year IS ?
            ORDER BY i.created_at, i.rowid
            "#,
        )
        .bind(kind.as_str())
        .bind(client_id.0)
        .bind(title)
        .bind(year)
        .fetch_all(&self.pool)
        .await?;

        self.hydrate_all(rows).await
    }

    async fn create(&self, item: &CanonicalItem) -> Result<()> {
        Self::check(item)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO canonical_items (
                id, kind, title, release_year, release_date, payload, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item.id.as_str())
        .bind(item.kind().as_str())
        .bind(&item.title)
        .bind(item.release_year)
        .bind(item.release_date.map(|date| date.to_string()))
        .bind(serde_json::to_string(&item.payload)?)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&mut *tx)
        .await?;

        Self::write_identity(&mut tx, item).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update(&self, item: &CanonicalItem) -> Result<()> {
        Self::check(item)?;

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE canonical_items SET
                title = ?, release_year = ?, release_date = ?, payload = ?, updated_at = ?
            WHERE id = ? AND kind = ?
            "#,
        )
        .bind(&item.title)
        .bind(item.release_year)
        .bind(item.release_date.map(|date| date.to_string()))
        .bind(serde_json::to_string(&item.payload)?)
        .bind(item.updated_at)
        .bind(item.id.as_str())
        .bind(item.kind().as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound {
                entity_type: item.kind().to_string(),
                id: item.id.as_str(),
            });
        }

        Self::write_identity(&mut tx, item).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_by_id(&self, id: ItemId) -> Result<Option<CanonicalItem>> {
        let row = sqlx::query_as::<_, ItemRow>("SELECT * FROM canonical_items WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn list_by_kind(&self, kind: MediaKind) -> Result<Vec<CanonicalItem>> {
        let rows = sqlx::query_as::<_, ItemRow>(
            "SELECT * FROM canonical_items WHERE kind = ? ORDER BY created_at, rowid",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        self.hydrate_all(rows).await
    }

    async fn count_by_kind(&self, kind: MediaKind) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM canonical_items WHERE kind = ?")
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}
