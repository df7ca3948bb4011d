//! Transactional repository over the six-table ranking schema (SQLite via sqlx).

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bookrank_core::{
    BookCandidate, BookDetail, BookId, BookSiteMappingId, CategoryId, CategorySummary,
    PeriodType, RankedBook, RankingFact, RankingPage, SiteCategoryMappingId, SiteId, SiteProfile,
    TableCounts,
};
use chrono::NaiveDate;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bookrank-storage";

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Message(String),
}

/// Pool-level repository operations. The three reference lookups run outside any
/// ingestion transaction; `begin` hands out the per-run write transaction.
#[async_trait]
pub trait RankingStore: Send + Sync {
    async fn find_or_create_site(&self, site: &SiteProfile) -> Result<SiteId, StoreError>;

    async fn find_or_create_category(
        &self,
        name: &str,
        parent_id: Option<CategoryId>,
    ) -> Result<CategoryId, StoreError>;

    async fn find_or_create_site_category_mapping(
        &self,
        category_id: CategoryId,
        site_id: SiteId,
        site_category_id: &str,
    ) -> Result<SiteCategoryMappingId, StoreError>;

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;
}

/// Writes that must be atomic with their siblings in one ingestion run.
///
/// Dropping a `StoreTx` without calling `commit` rolls the transaction back.
#[async_trait]
pub trait StoreTx: Send {
    async fn find_or_create_book(&mut self, candidate: &BookCandidate) -> Result<BookId, StoreError>;

    async fn upsert_book_site_mapping(
        &mut self,
        book_id: BookId,
        site_id: SiteId,
        item_code: &str,
        price: f64,
        url: &str,
    ) -> Result<BookSiteMappingId, StoreError>;

    async fn upsert_ranking(&mut self, fact: &RankingFact) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

impl SqliteRepository {
    /// Connect using a `sqlite://` URL, creating the database file when missing.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?;
        Self::connect_with(options).await
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::connect_with(SqliteConnectOptions::new().filename(path.as_ref())).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        info!("ranking schema migrations applied");
        Ok(())
    }

    async fn site_id_by_name(&self, name: &str) -> Result<Option<SiteId>, StoreError> {
        Ok(sqlx::query_scalar::<_, Uuid>("SELECT id FROM sites WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn find_category(
        &self,
        name: &str,
        parent_id: Option<CategoryId>,
    ) -> Result<Option<CategoryId>, StoreError> {
        // `IS` matches NULL parents as well as concrete ones.
        Ok(
            sqlx::query_scalar::<_, Uuid>("SELECT id FROM categories WHERE name = ?1 AND parent_id IS ?2")
                .bind(name)
                .bind(parent_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn site_category_mapping_id(
        &self,
        category_id: CategoryId,
        site_id: SiteId,
        site_category_id: &str,
    ) -> Result<Option<SiteCategoryMappingId>, StoreError> {
        Ok(sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM site_category_mappings WHERE category_id = ?1 AND site_id = ?2 AND site_category_id = ?3",
        )
        .bind(category_id)
        .bind(site_id)
        .bind(site_category_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Latest stored window for a category/period, ordered by rank.
    pub async fn top_rankings(
        &self,
        category_id: CategoryId,
        period: PeriodType,
        limit: u32,
    ) -> Result<Option<RankingPage>, StoreError> {
        let Some(category_name) =
            sqlx::query_scalar::<_, String>("SELECT name FROM categories WHERE id = ?1")
                .bind(category_id)
                .fetch_optional(&self.pool)
                .await?
        else {
            return Ok(None);
        };

        let window = sqlx::query(
            "SELECT date_from, date_to FROM rankings \
             WHERE category_id = ?1 AND period_type = ?2 \
             ORDER BY date_to DESC, date_from DESC LIMIT 1",
        )
        .bind(category_id)
        .bind(period.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let mut page = RankingPage {
            category_id,
            category_name,
            period_type: period,
            date_from: None,
            date_to: None,
            books: Vec::new(),
        };
        let Some(window) = window else {
            return Ok(Some(page));
        };
        let date_from: NaiveDate = window.try_get("date_from")?;
        let date_to: NaiveDate = window.try_get("date_to")?;

        let rows = sqlx::query(
            "SELECT r.rank, b.id, b.title, b.author, b.publisher, b.isbn, b.publication_date, \
                    b.image_url, bsm.price, bsm.url \
             FROM rankings r \
             JOIN book_site_mappings bsm ON r.book_site_mapping_id = bsm.id \
             JOIN books b ON bsm.book_id = b.id \
             WHERE r.category_id = ?1 AND r.period_type = ?2 AND r.date_from = ?3 AND r.date_to = ?4 \
             ORDER BY r.rank \
             LIMIT ?5",
        )
        .bind(category_id)
        .bind(period.as_str())
        .bind(date_from)
        .bind(date_to)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        page.date_from = Some(date_from);
        page.date_to = Some(date_to);
        for row in rows {
            page.books.push(RankedBook {
                id: row.try_get("id")?,
                rank: row.try_get("rank")?,
                title: row.try_get("title")?,
                author: row.try_get("author")?,
                publisher: row.try_get("publisher")?,
                isbn: row.try_get("isbn")?,
                publication_date: row.try_get("publication_date")?,
                image_url: row.try_get("image_url")?,
                price: row.try_get("price")?,
                url: row.try_get("url")?,
            });
        }
        Ok(Some(page))
    }

    pub async fn book(&self, book_id: BookId) -> Result<Option<BookDetail>, StoreError> {
        let row = sqlx::query(
            "SELECT id, title, author, publisher, isbn, publication_date, image_url FROM books WHERE id = ?1",
        )
        .bind(book_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(BookDetail {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            author: row.try_get("author")?,
            publisher: row.try_get("publisher")?,
            isbn: row.try_get("isbn")?,
            publication_date: row.try_get("publication_date")?,
            image_url: row.try_get("image_url")?,
        }))
    }

    pub async fn categories(&self) -> Result<Vec<CategorySummary>, StoreError> {
        let rows = sqlx::query("SELECT id, name, parent_id FROM categories ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| -> Result<CategorySummary, StoreError> {
                Ok(CategorySummary {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    parent_id: row.try_get("parent_id")?,
                })
            })
            .collect()
    }

    pub async fn table_counts(&self) -> Result<TableCounts, StoreError> {
        let row = sqlx::query(
            "SELECT \
                (SELECT COUNT(*) FROM sites) AS sites, \
                (SELECT COUNT(*) FROM categories) AS categories, \
                (SELECT COUNT(*) FROM site_category_mappings) AS site_category_mappings, \
                (SELECT COUNT(*) FROM books) AS books, \
                (SELECT COUNT(*) FROM book_site_mappings) AS book_site_mappings, \
                (SELECT COUNT(*) FROM rankings) AS rankings",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(TableCounts {
            sites: row.try_get("sites")?,
            categories: row.try_get("categories")?,
            site_category_mappings: row.try_get("site_category_mappings")?,
            books: row.try_get("books")?,
            book_site_mappings: row.try_get("book_site_mappings")?,
            rankings: row.try_get("rankings")?,
        })
    }
}

#[async_trait]
impl RankingStore for SqliteRepository {
    async fn find_or_create_site(&self, site: &SiteProfile) -> Result<SiteId, StoreError> {
        if let Some(id) = self.site_id_by_name(&site.name).await? {
            return Ok(id);
        }

        let id = Uuid::new_v4();
        let inserted = sqlx::query(
            "INSERT INTO sites (id, name, base_url, affiliate_id) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(id)
        .bind(&site.name)
        .bind(&site.base_url)
        .bind(&site.affiliate_id)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {
                info!(site = %site.name, %id, "created site");
                Ok(id)
            }
            Err(err) if is_unique_violation(&err) => {
                debug!(site = %site.name, "site inserted concurrently; re-reading");
                self.site_id_by_name(&site.name).await?.ok_or_else(|| {
                    StoreError::Message(format!("site {} missing after unique violation", site.name))
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn find_or_create_category(
        &self,
        name: &str,
        parent_id: Option<CategoryId>,
    ) -> Result<CategoryId, StoreError> {
        if let Some(id) = self.find_category(name, parent_id).await? {
            return Ok(id);
        }

        let id = Uuid::new_v4();
        let inserted = sqlx::query("INSERT INTO categories (id, name, parent_id) VALUES (?1, ?2, ?3)")
            .bind(id)
            .bind(name)
            .bind(parent_id)
            .execute(&self.pool)
            .await;

        match inserted {
            Ok(_) => {
                info!(category = name, %id, "created category");
                Ok(id)
            }
            Err(err) if is_unique_violation(&err) => {
                debug!(category = name, "category inserted concurrently; re-reading");
                self.find_category(name, parent_id).await?.ok_or_else(|| {
                    StoreError::Message(format!("category {name} missing after unique violation"))
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn find_or_create_site_category_mapping(
        &self,
        category_id: CategoryId,
        site_id: SiteId,
        site_category_id: &str,
    ) -> Result<SiteCategoryMappingId, StoreError> {
        if let Some(id) = self
            .site_category_mapping_id(category_id, site_id, site_category_id)
            .await?
        {
            return Ok(id);
        }

        let id = Uuid::new_v4();
        let inserted = sqlx::query(
            "INSERT INTO site_category_mappings (id, category_id, site_id, site_category_id) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(id)
        .bind(category_id)
        .bind(site_id)
        .bind(site_category_id)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {
                info!(%category_id, %site_id, site_category_id, "created site category mapping");
                Ok(id)
            }
            Err(err) if is_unique_violation(&err) => self
                .site_category_mapping_id(category_id, site_id, site_category_id)
                .await?
                .ok_or_else(|| {
                    StoreError::Message(format!(
                        "site category mapping {site_category_id} missing after unique violation"
                    ))
                }),
            Err(err) => Err(err.into()),
        }
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        // Take the write lock up front; a deferred transaction could fail on lock upgrade
        // when another run commits between our first read and first write.
        let tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Ok(Box::new(SqliteTx { tx }))
    }
}

pub struct SqliteTx {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreTx for SqliteTx {
    async fn find_or_create_book(&mut self, candidate: &BookCandidate) -> Result<BookId, StoreError> {
        if !candidate.isbn.is_empty() {
            if let Some(id) = sqlx::query_scalar::<_, Uuid>("SELECT id FROM books WHERE isbn = ?1")
                .bind(&candidate.isbn)
                .fetch_optional(&mut *self.tx)
                .await?
            {
                return Ok(id);
            }
        }

        // An empty author still matches: Ichiba ranking items often carry no author or ISBN.
        if !candidate.title.is_empty() {
            if let Some(id) = sqlx::query_scalar::<_, Uuid>(
                "SELECT id FROM books WHERE title = ?1 AND author = ?2 ORDER BY created_at, id LIMIT 1",
            )
            .bind(&candidate.title)
            .bind(&candidate.author)
            .fetch_optional(&mut *self.tx)
            .await?
            {
                return Ok(id);
            }
        }

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO books (id, title, author, publisher, isbn, publication_date, image_url) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(id)
        .bind(&candidate.title)
        .bind(&candidate.author)
        .bind(&candidate.publisher)
        .bind(&candidate.isbn)
        .bind(candidate.publication_date.as_deref())
        .bind(&candidate.image_url)
        .execute(&mut *self.tx)
        .await?;
        debug!(%id, title = %candidate.title, "created book");
        Ok(id)
    }

    async fn upsert_book_site_mapping(
        &mut self,
        book_id: BookId,
        site_id: SiteId,
        item_code: &str,
        price: f64,
        url: &str,
    ) -> Result<BookSiteMappingId, StoreError> {
        // RETURNING yields the surviving row's id on both the insert and the update path.
        let id = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO book_site_mappings (id, book_id, site_id, site_item_code, price, url) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT (book_id, site_id, site_item_code) \
             DO UPDATE SET price = excluded.price, url = excluded.url, updated_at = CURRENT_TIMESTAMP \
             RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(book_id)
        .bind(site_id)
        .bind(item_code)
        .bind(price)
        .bind(url)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(id)
    }

    async fn upsert_ranking(&mut self, fact: &RankingFact) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO rankings (id, book_site_mapping_id, category_id, rank, period_type, date_from, date_to) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT (book_site_mapping_id, category_id, period_type, date_from, date_to) \
             DO UPDATE SET rank = excluded.rank, updated_at = CURRENT_TIMESTAMP",
        )
        .bind(Uuid::new_v4())
        .bind(fact.book_site_mapping_id)
        .bind(fact.category_id)
        .bind(i64::from(fact.rank))
        .bind(fact.period.as_str())
        .bind(fact.window.date_from)
        .bind(fact.window.date_to)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
