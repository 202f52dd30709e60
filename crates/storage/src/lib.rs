use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    cache::{MessageCache, MessageRecord, SessionCache, SessionRecord},
    domain::{ClientMessageId, SessionId, SessionKind, UserId},
    protocol::{MessageKind, MessageStatus},
};

/// Sqlite-backed durable mirror for one signed-in identity.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }
}

/// Database url for one identity's store. Each signed-in identity keeps its
/// own database file so sign-out never has to filter shared tables.
pub fn database_url_for_identity(data_dir: &Path, uid: &UserId) -> String {
    let safe: String = uid
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let path = data_dir.join(format!("im-{safe}.db"));
    format!("sqlite://{}", path.to_string_lossy().replace('\\', "/"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

fn session_from_row(row: &SqliteRow) -> Result<SessionRecord> {
    let kind = SessionKind::try_from(row.get::<i32, _>(1)).map_err(|e| anyhow!(e))?;
    Ok(SessionRecord {
        session_id: SessionId(row.get::<String, _>(0)),
        kind,
        peer: UserId(row.get::<String, _>(2)),
        title: row.get::<String, _>(3),
        avatar: row.get::<String, _>(4),
        unread_count: row.get::<i64, _>(5).max(0) as u32,
        last_message: row.get::<String, _>(6),
        last_message_sender: row.get::<String, _>(7),
        update_at: row.get::<i64, _>(8),
    })
}

fn message_from_row(row: &SqliteRow) -> Result<MessageRecord> {
    let kind = MessageKind::try_from(row.get::<i32, _>(4)).map_err(|e| anyhow!(e))?;
    let status = MessageStatus::try_from(row.get::<i32, _>(5)).map_err(|e| anyhow!(e))?;
    Ok(MessageRecord {
        client_id: ClientMessageId(row.get::<String, _>(0)),
        server_id: row.get::<i64, _>(1),
        session_id: SessionId(row.get::<String, _>(2)),
        sequence: row.get::<i64, _>(3),
        kind,
        status,
        body: row.get::<String, _>(6),
        sender: UserId(row.get::<String, _>(7)),
        recipient: UserId(row.get::<String, _>(8)),
        send_at: row.get::<i64, _>(9),
        receive_at: row.get::<i64, _>(10),
    })
}

const MESSAGE_COLUMNS: &str = "client_id, server_id, session_id, seq, kind, status, body, sender, recipient, send_at, receive_at";

#[async_trait]
impl SessionCache for Storage {
    async fn upsert_session(&self, record: &SessionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (session_id, kind, peer, title, avatar, unread_count, last_message, last_message_sender, update_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                kind = excluded.kind,
                peer = excluded.peer,
                title = excluded.title,
                avatar = excluded.avatar,
                unread_count = excluded.unread_count,
                last_message = excluded.last_message,
                last_message_sender = excluded.last_message_sender,
                update_at = excluded.update_at",
        )
        .bind(record.session_id.as_str())
        .bind(i32::from(record.kind))
        .bind(record.peer.as_str())
        .bind(&record.title)
        .bind(&record.avatar)
        .bind(record.unread_count as i64)
        .bind(&record.last_message)
        .bind(&record.last_message_sender)
        .bind(record.update_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_session(&self, session_id: &SessionId) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(session_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionRecord>> {
        let row = sqlx::query(
            "SELECT session_id, kind, peer, title, avatar, unread_count, last_message, last_message_sender, update_at
             FROM sessions WHERE session_id = ?",
        )
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn get_all_sessions(&self) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query(
            "SELECT session_id, kind, peer, title, avatar, unread_count, last_message, last_message_sender, update_at
             FROM sessions ORDER BY update_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn session_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn clear_all_sessions(&self) -> Result<()> {
        sqlx::query("DELETE FROM sessions").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageCache for Storage {
    async fn add_message(&self, record: &MessageRecord) -> Result<()> {
        bind_message_insert(sqlx::query(
            "INSERT INTO messages (client_id, server_id, session_id, seq, kind, status, body, sender, recipient, send_at, receive_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(client_id) DO UPDATE SET
                server_id = excluded.server_id,
                seq = excluded.seq,
                status = excluded.status,
                body = excluded.body,
                send_at = excluded.send_at,
                receive_at = excluded.receive_at",
        ), record)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_messages(&self, records: &[MessageRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            bind_message_insert(sqlx::query(
                "INSERT INTO messages (client_id, server_id, session_id, seq, kind, status, body, sender, recipient, send_at, receive_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(client_id) DO UPDATE SET
                    server_id = excluded.server_id,
                    seq = excluded.seq,
                    status = excluded.status,
                    body = excluded.body,
                    send_at = excluded.send_at,
                    receive_at = excluded.receive_at",
            ), record)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_message(&self, record: &MessageRecord) -> Result<()> {
        sqlx::query(
            "UPDATE messages SET server_id = ?, seq = ?, status = ?, body = ?, send_at = ?, receive_at = ?
             WHERE client_id = ?",
        )
        .bind(record.server_id)
        .bind(record.sequence)
        .bind(i32::from(record.status))
        .bind(&record.body)
        .bind(record.send_at)
        .bind(record.receive_at)
        .bind(record.client_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_status_by_client_id(
        &self,
        client_id: &ClientMessageId,
        status: MessageStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE messages SET status = ? WHERE client_id = ?")
            .bind(i32::from(status))
            .bind(client_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_message_by_client_id(&self, client_id: &ClientMessageId) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE client_id = ?")
            .bind(client_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_messages_for_session(&self, session_id: &SessionId) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(session_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_message_by_client_id(
        &self,
        client_id: &ClientMessageId,
    ) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE client_id = ?"
        ))
        .bind(client_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn get_message_by_server_id(&self, server_id: i64) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE server_id = ? LIMIT 1"
        ))
        .bind(server_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn latest_message_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE session_id = ?
             ORDER BY send_at DESC
             LIMIT 1"
        ))
        .bind(session_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn messages_before_sequence(
        &self,
        session_id: &SessionId,
        before_seq: i64,
        limit: u32,
    ) -> Result<Vec<MessageRecord>> {
        let mut rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE session_id = ? AND seq > 0 AND seq < ?
             ORDER BY seq DESC
             LIMIT ?"
        ))
        .bind(session_id.as_str())
        .bind(before_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.reverse();
        rows.iter().map(message_from_row).collect()
    }

    async fn messages_before_time(
        &self,
        session_id: &SessionId,
        before: i64,
        limit: u32,
    ) -> Result<Vec<MessageRecord>> {
        let mut rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE session_id = ? AND send_at < ?
             ORDER BY send_at DESC
             LIMIT ?"
        ))
        .bind(session_id.as_str())
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.reverse();
        rows.iter().map(message_from_row).collect()
    }
}

fn bind_message_insert<'q>(
    query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    record: &'q MessageRecord,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(record.client_id.as_str())
        .bind(record.server_id)
        .bind(record.session_id.as_str())
        .bind(record.sequence)
        .bind(i32::from(record.kind))
        .bind(i32::from(record.status))
        .bind(&record.body)
        .bind(&record.sender.0)
        .bind(&record.recipient.0)
        .bind(record.send_at)
        .bind(record.receive_at)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
