use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::schema::{graph_schemas, TableSchema};
use crate::config::Config;
use crate::graph::{GraphStore, Pair, Title, PAIRS_TABLE, TITLES_TABLE};
use crate::{Error, Result};

/// Table-oriented client for the graph database. The background
/// connection task ends when the store is dropped.
pub struct PgStore {
    client: Client,
}

impl PgStore {
    pub async fn connect(config: &Config) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(&config.postgres_url(), NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        info!(
            host = %config.postgres.host,
            database = %config.postgres.database,
            "Connected to PostgreSQL"
        );
        Ok(Self { client })
    }

    pub async fn table_exists(&self, name: &str) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = current_schema() AND table_name = $1)",
                &[&name],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    pub async fn create_table_if_absent(&self, schema: &TableSchema) -> Result<()> {
        self.client.batch_execute(&schema.create_sql()).await?;
        Ok(())
    }

    /// Creates any graph table that does not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        for schema in graph_schemas() {
            if self.table_exists(schema.name).await? {
                debug!(table = schema.name, "Table exists");
                continue;
            }
            self.create_table_if_absent(&schema).await?;
            info!(table = schema.name, "Created table");
        }
        Ok(())
    }

    /// Inserts one row. A unique-constraint rejection becomes
    /// [`Error::Duplicate`] and a foreign-key rejection
    /// [`Error::MissingReference`].
    pub async fn insert(&self, table: &str, fields: &[(&str, &(dyn ToSql + Sync))]) -> Result<u64> {
        let columns: Vec<&str> = fields.iter().map(|(name, _)| *name).collect();
        let values: Vec<&(dyn ToSql + Sync)> = fields.iter().map(|(_, value)| *value).collect();

        self.client
            .execute(&insert_sql(table, &columns), &values)
            .await
            .map_err(|e| classify_insert_error(table, e))
    }

    pub async fn select_by_key(
        &self,
        table: &str,
        column: &str,
        value: &(dyn ToSql + Sync),
    ) -> Result<Option<Row>> {
        let sql = format!("SELECT * FROM {} WHERE {} = $1 LIMIT 1", table, column);
        Ok(self.client.query_opt(&sql, &[value]).await?)
    }

}

fn insert_sql(table: &str, columns: &[&str]) -> String {
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn classify_insert_error(table: &str, e: tokio_postgres::Error) -> Error {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        let detail = e
            .as_db_error()
            .and_then(|db| db.detail())
            .unwrap_or("unique violation")
            .to_string();
        return Error::Duplicate {
            table: table.to_string(),
            detail,
        };
    }
    if e.code() == Some(&SqlState::FOREIGN_KEY_VIOLATION) {
        let detail = e
            .as_db_error()
            .and_then(|db| db.detail())
            .unwrap_or("foreign key violation")
            .to_string();
        return Error::MissingReference {
            table: table.to_string(),
            detail,
        };
    }
    Error::Postgres(e)
}

fn title_from_row(row: &Row) -> Result<Title> {
    Ok(Title {
        id: row.try_get("title_id")?,
        name: row.try_get("name")?,
        created_at: row.try_get::<_, DateTime<Utc>>("created_at")?,
        updated_at: row.try_get::<_, DateTime<Utc>>("updated_at")?,
    })
}

fn pair_from_row(row: &Row) -> Result<Pair> {
    Ok(Pair {
        id: row.try_get("pair_id")?,
        source: row.try_get("title_src")?,
        dest: row.try_get("title_dst")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl GraphStore for PgStore {
    async fn insert_title(&self, title: &Title) -> Result<()> {
        self.insert(
            TITLES_TABLE,
            &[
                ("title_id", &title.id),
                ("name", &title.name),
                ("created_at", &title.created_at),
                ("updated_at", &title.updated_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn insert_pair(&self, pair: &Pair) -> Result<()> {
        self.insert(
            PAIRS_TABLE,
            &[
                ("pair_id", &pair.id),
                ("title_src", &pair.source),
                ("title_dst", &pair.dest),
                ("created_at", &pair.created_at),
                ("updated_at", &pair.updated_at),
            ],
        )
        .await?;
        Ok(())
    }

    async fn find_title(&self, name: &str) -> Result<Option<Title>> {
        match self.select_by_key(TITLES_TABLE, "name", &name).await? {
            Some(row) => Ok(Some(title_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_pair(&self, source: Uuid, dest: Uuid) -> Result<Option<Pair>> {
        let row = self
            .client
            .query_opt(
                "SELECT * FROM pairs WHERE title_src = $1 AND title_dst = $2",
                &[&source, &dest],
            )
            .await?;
        row.as_ref().map(pair_from_row).transpose()
    }
}
