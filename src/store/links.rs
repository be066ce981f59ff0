use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};

use super::{LinkRecord, LinkStore, SqliteLinkStore};
use crate::message::{PlatformId, Endpoint};

impl ToSql for PlatformId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            PlatformId::Int(id) => ToSqlOutput::Owned(Value::Integer(*id)),
            PlatformId::Str(name) => ToSqlOutput::Borrowed(ValueRef::Text(name.as_bytes())),
        })
    }
}

impl FromSql for PlatformId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Integer(id) => Ok(PlatformId::Int(id)),
            ValueRef::Text(_) => String::column_result(value).map(PlatformId::Str),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

fn parse_link_row(row: &rusqlite::Row) -> rusqlite::Result<LinkRecord> {
    Ok(LinkRecord {
        from: Endpoint {
            platform: row.get(0)?,
            channel: row.get(1)?,
        },
        to: Endpoint {
            platform: row.get(2)?,
            channel: row.get(3)?,
        },
        established_at: row.get(4)?,
        cause: row.get(5)?,
    })
}

#[async_trait]
impl LinkStore for SqliteLinkStore {
    async fn list_links(&self) -> Result<Vec<LinkRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT from_type, from_id, to_type, to_id, established_at, cause
             FROM links
             ORDER BY established_at ASC",
        )?;

        let links = stmt
            .query_map([], parse_link_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load links")?;

        Ok(links)
    }

    async fn upsert_link(&self, record: &LinkRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO links (from_type, from_id, to_type, to_id, established_at, cause)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT DO NOTHING",
            rusqlite::params![
                record.from.platform,
                record.from.channel,
                record.to.platform,
                record.to.channel,
                record.established_at,
                record.cause,
            ],
        )
        .with_context(|| format!("Failed to save link {} -> {}", record.from, record.to))?;
        Ok(())
    }

    async fn delete_link(&self, from: &Endpoint, to: &Endpoint) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM links
             WHERE from_type = ?1 AND from_id = ?2 AND to_type = ?3 AND to_id = ?4",
            rusqlite::params![from.platform, from.channel, to.platform, to.channel],
        )
        .with_context(|| format!("Failed to delete link {} -> {}", from, to))?;
        Ok(())
    }
}
