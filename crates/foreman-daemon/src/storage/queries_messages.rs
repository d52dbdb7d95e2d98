//! Database queries for thread messages.

use foreman_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{Sender, ThreadMessage};

impl Database {
    // =========================================================================
    // Message queries
    // =========================================================================

    /// Append a message; the sequence is assigned in the same statement so
    /// concurrent appends to one thread stay totally ordered.
    pub async fn append_message(
        &self,
        thread_id: &str,
        sender: Sender,
        role: Option<&str>,
        content: &str,
        payload: Option<&str>,
    ) -> Result<ThreadMessage, DatabaseError> {
        let message = sqlx::query_as::<_, ThreadMessage>(
            r"
            INSERT INTO messages (thread_id, sequence, sender, role, content, payload, created_at)
            VALUES (
                ?1,
                (SELECT COALESCE(MAX(sequence), 0) + 1 FROM messages WHERE thread_id = ?1),
                ?2, ?3, ?4, ?5, ?6
            )
            RETURNING *
            ",
        )
        .bind(thread_id)
        .bind(sender.as_str())
        .bind(role)
        .bind(content)
        .bind(payload)
        .bind(unix_timestamp())
        .fetch_one(self.pool())
        .await?;
        Ok(message)
    }

    /// Messages of a thread with sequence greater than `after`, in order.
    pub async fn list_messages(
        &self,
        thread_id: &str,
        after: i64,
    ) -> Result<Vec<ThreadMessage>, DatabaseError> {
        let messages = sqlx::query_as::<_, ThreadMessage>(
            "SELECT * FROM messages WHERE thread_id = ? AND sequence > ? ORDER BY sequence",
        )
        .bind(thread_id)
        .bind(after)
        .fetch_all(self.pool())
        .await?;
        Ok(messages)
    }
}
