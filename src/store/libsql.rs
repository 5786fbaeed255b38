//! libSQL backend — async `MessageStore` over a local database file.
//!
//! The compare-and-set transition is a single `UPDATE ... WHERE id = ?
//! AND status = ?`; the affected-row count decides who won a race.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::message::{Envelope, Message, MessageKind, MessageStatus, ParsedFields};
use crate::store::migrations;
use crate::store::traits::MessageStore;

/// libSQL message store.
///
/// Holds a single connection reused for all operations;
/// `libsql::Connection` is `Send + Sync` and safe for concurrent
/// async use.
pub struct LibSqlMessageStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlMessageStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Backend(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Message database opened");
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to create in-memory db: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Backend(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn query_one(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<Message>, StoreError> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .map_err(|e| StoreError::Backend(format!("Query failed: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| StoreError::Backend(format!("Row read failed: {e}")))?
        {
            Some(row) => Ok(Some(row_to_message(&row)?)),
            None => Ok(None),
        }
    }

    async fn query_many(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Message>, StoreError> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .map_err(|e| StoreError::Backend(format!("Query failed: {e}")))?;
        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Backend(format!("Row read failed: {e}")))?
        {
            out.push(row_to_message(&row)?);
        }
        Ok(out)
    }

    async fn require(&self, id: Uuid) -> Result<Message, StoreError> {
        self.get(id).await?.ok_or(StoreError::NotFound { id })
    }
}

// ── Row mapping helpers ─────────────────────────────────────────────

const MESSAGE_COLUMNS: &str = "id, reference, kind, status, raw, fields, sender, receiver, \
     sender_reference, transaction_reference, sequence, priority, retry_count, max_retries, \
     next_retry_at, received_at, processing_started_at, processing_ended_at, error, \
     parent_id, response_id, guarantee_id, amendment_id, notes, updated_at";

fn status_to_str(status: MessageStatus) -> String {
    status.to_string()
}

fn str_to_status(s: &str) -> Result<MessageStatus, StoreError> {
    use MessageStatus::*;
    let status = match s {
        "received" => Received,
        "processing" => Processing,
        "parsed" => Parsed,
        "validated" => Validated,
        "processed" => Processed,
        "responded" => Responded,
        "parse_error" => ParseError,
        "validation_error" => ValidationError,
        "processing_error" => ProcessingError,
        "rejected" => Rejected,
        "archived" => Archived,
        other => {
            return Err(StoreError::Serialization(format!(
                "Unknown message status in database: {other:?}"
            )));
        }
    };
    Ok(status)
}

fn str_to_kind(s: &str) -> Result<MessageKind, StoreError> {
    MessageKind::from_code(s)
        .ok_or_else(|| StoreError::Serialization(format!("Unknown message kind code: {s:?}")))
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Serialization(format!("Bad UUID {s:?}: {e}")))
}

fn parse_optional_uuid(s: &Option<String>) -> Result<Option<Uuid>, StoreError> {
    s.as_ref().map(|s| parse_uuid(s)).transpose()
}

/// Convert `Option<String>` to a libsql value.
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    opt_text(dt.map(|dt| dt.to_rfc3339()))
}

fn opt_uuid(id: Option<Uuid>) -> libsql::Value {
    opt_text(id.map(|id| id.to_string()))
}

/// Map a libsql row to a `Message`. Column order matches `MESSAGE_COLUMNS`.
fn row_to_message(row: &libsql::Row) -> Result<Message, StoreError> {
    let backend = |e: libsql::Error| StoreError::Backend(format!("Column read failed: {e}"));

    let id_str: String = row.get(0).map_err(backend)?;
    let kind_str: String = row.get(2).map_err(backend)?;
    let status_str: String = row.get(3).map_err(backend)?;
    let fields_str: Option<String> = row.get::<String>(5).ok();
    let next_retry_str: Option<String> = row.get::<String>(14).ok();
    let received_str: String = row.get(15).map_err(backend)?;
    let started_str: Option<String> = row.get::<String>(16).ok();
    let ended_str: Option<String> = row.get::<String>(17).ok();
    let parent_str: Option<String> = row.get::<String>(19).ok();
    let response_str: Option<String> = row.get::<String>(20).ok();
    let guarantee_str: Option<String> = row.get::<String>(21).ok();
    let amendment_str: Option<String> = row.get::<String>(22).ok();
    let notes_str: String = row.get(23).map_err(backend)?;
    let updated_str: String = row.get(24).map_err(backend)?;

    let fields: Option<ParsedFields> = fields_str
        .map(|s| {
            serde_json::from_str(&s)
                .map_err(|e| StoreError::Serialization(format!("Bad fields column: {e}")))
        })
        .transpose()?;
    let notes: Vec<String> = serde_json::from_str(&notes_str)
        .map_err(|e| StoreError::Serialization(format!("Bad notes column: {e}")))?;

    Ok(Message {
        id: parse_uuid(&id_str)?,
        reference: row.get(1).map_err(backend)?,
        kind: str_to_kind(&kind_str)?,
        status: str_to_status(&status_str)?,
        raw: row.get(4).map_err(backend)?,
        fields,
        sender: row.get::<String>(6).ok(),
        receiver: row.get::<String>(7).ok(),
        sender_reference: row.get::<String>(8).ok(),
        transaction_reference: row.get::<String>(9).ok(),
        sequence: row.get::<i64>(10).map_err(backend)? as u32,
        priority: row.get::<i64>(11).map_err(backend)? as u8,
        retry_count: row.get::<i64>(12).map_err(backend)? as u32,
        max_retries: row.get::<i64>(13).map_err(backend)? as u32,
        next_retry_at: parse_optional_datetime(&next_retry_str),
        received_at: parse_datetime(&received_str),
        processing_started_at: parse_optional_datetime(&started_str),
        processing_ended_at: parse_optional_datetime(&ended_str),
        error: row.get::<String>(18).ok(),
        parent_id: parse_optional_uuid(&parent_str)?,
        response_id: parse_optional_uuid(&response_str)?,
        guarantee_id: parse_optional_uuid(&guarantee_str)?,
        amendment_id: parse_optional_uuid(&amendment_str)?,
        notes,
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl MessageStore for LibSqlMessageStore {
    async fn insert(&self, message: Message) -> Result<(), StoreError> {
        let fields_json = message
            .fields
            .as_ref()
            .map(|f| {
                serde_json::to_string(f)
                    .map_err(|e| StoreError::Serialization(format!("Fields encode failed: {e}")))
            })
            .transpose()?;
        let notes_json = serde_json::to_string(&message.notes)
            .map_err(|e| StoreError::Serialization(format!("Notes encode failed: {e}")))?;

        let result = self
            .conn
            .execute(
                "INSERT INTO messages (id, reference, kind, status, raw, fields, sender, receiver, \
                     sender_reference, transaction_reference, sequence, priority, retry_count, \
                     max_retries, next_retry_at, received_at, processing_started_at, \
                     processing_ended_at, error, parent_id, response_id, guarantee_id, \
                     amendment_id, notes, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
                params![
                    message.id.to_string(),
                    message.reference.clone(),
                    message.kind.code(),
                    status_to_str(message.status),
                    message.raw.clone(),
                    opt_text(fields_json),
                    opt_text(message.sender.clone()),
                    opt_text(message.receiver.clone()),
                    opt_text(message.sender_reference.clone()),
                    opt_text(message.transaction_reference.clone()),
                    message.sequence as i64,
                    message.priority as i64,
                    message.retry_count as i64,
                    message.max_retries as i64,
                    opt_datetime(message.next_retry_at),
                    message.received_at.to_rfc3339(),
                    opt_datetime(message.processing_started_at),
                    opt_datetime(message.processing_ended_at),
                    opt_text(message.error.clone()),
                    opt_uuid(message.parent_id),
                    opt_uuid(message.response_id),
                    opt_uuid(message.guarantee_id),
                    opt_uuid(message.amendment_id),
                    notes_json,
                    message.updated_at.to_rfc3339(),
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("idx_messages_parent") => {
                Err(StoreError::ResponseExists {
                    id: message.parent_id.unwrap_or(message.id),
                })
            }
            Err(e) if e.to_string().contains("UNIQUE") => Err(StoreError::DuplicateReference {
                reference: message.reference,
            }),
            Err(e) => Err(StoreError::Backend(format!("Insert failed: {e}"))),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        self.query_one(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
    }

    async fn get_by_reference(&self, reference: &str) -> Result<Option<Message>, StoreError> {
        self.query_one(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE reference = ?1"),
            params![reference],
        )
        .await
    }

    async fn transition(
        &self,
        id: Uuid,
        from: MessageStatus,
        to: MessageStatus,
        now: DateTime<Utc>,
    ) -> Result<Message, StoreError> {
        let mut msg = self.require(id).await?;
        if msg.status != from {
            return Err(StoreError::StatusConflict {
                id,
                expected: from,
                actual: msg.status,
            });
        }
        if !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition { id, from, to });
        }
        msg.apply_status(to, now);

        // The row count of the guarded UPDATE decides who won a race.
        let changed = self
            .conn
            .execute(
                "UPDATE messages SET status = ?1, next_retry_at = ?2, \
                     processing_started_at = ?3, processing_ended_at = ?4, updated_at = ?5 \
                 WHERE id = ?6 AND status = ?7",
                params![
                    status_to_str(to),
                    opt_datetime(msg.next_retry_at),
                    opt_datetime(msg.processing_started_at),
                    opt_datetime(msg.processing_ended_at),
                    now.to_rfc3339(),
                    id.to_string(),
                    status_to_str(from),
                ],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("Transition failed: {e}")))?;

        if changed == 0 {
            let actual = self.require(id).await?.status;
            return Err(StoreError::StatusConflict {
                id,
                expected: from,
                actual,
            });
        }
        Ok(msg)
    }

    async fn set_parsed(
        &self,
        id: Uuid,
        fields: &ParsedFields,
        envelope: &Envelope,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let fields_json = serde_json::to_string(fields)
            .map_err(|e| StoreError::Serialization(format!("Fields encode failed: {e}")))?;
        self.conn
            .execute(
                "UPDATE messages SET fields = ?1, sender = ?2, receiver = ?3, \
                     sender_reference = ?4, transaction_reference = ?5, sequence = ?6, \
                     updated_at = ?7 \
                 WHERE id = ?8",
                params![
                    fields_json,
                    envelope.sender.clone(),
                    envelope.receiver.clone(),
                    envelope.sender_reference.clone(),
                    opt_text(envelope.related_reference.clone()),
                    envelope.sequence as i64,
                    now.to_rfc3339(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("Update failed: {e}")))?;
        Ok(())
    }

    async fn set_error(
        &self,
        id: Uuid,
        diagnostic: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE messages SET error = ?1, updated_at = ?2 WHERE id = ?3",
                params![diagnostic, now.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("Update failed: {e}")))?;
        Ok(())
    }

    async fn set_retry_state(
        &self,
        id: Uuid,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE messages SET retry_count = ?1, next_retry_at = ?2, updated_at = ?3 \
                 WHERE id = ?4",
                params![
                    retry_count as i64,
                    opt_datetime(next_retry_at),
                    now.to_rfc3339(),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("Update failed: {e}")))?;
        Ok(())
    }

    async fn link_guarantee(
        &self,
        id: Uuid,
        guarantee_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE messages SET guarantee_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![guarantee_id.to_string(), now.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("Update failed: {e}")))?;
        Ok(())
    }

    async fn link_amendment(
        &self,
        id: Uuid,
        amendment_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "UPDATE messages SET amendment_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![amendment_id.to_string(), now.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("Update failed: {e}")))?;
        Ok(())
    }

    async fn set_response(
        &self,
        id: Uuid,
        response_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE messages SET response_id = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND response_id IS NULL",
                params![response_id.to_string(), now.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("Update failed: {e}")))?;
        if changed == 0 {
            // Either missing or already responded
            self.require(id).await?;
            return Err(StoreError::ResponseExists { id });
        }
        Ok(())
    }

    async fn append_note(
        &self,
        id: Uuid,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut msg = self.require(id).await?;
        msg.notes.push(note.to_string());
        let notes_json = serde_json::to_string(&msg.notes)
            .map_err(|e| StoreError::Serialization(format!("Notes encode failed: {e}")))?;
        self.conn
            .execute(
                "UPDATE messages SET notes = ?1, updated_at = ?2 WHERE id = ?3",
                params![notes_json, now.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("Update failed: {e}")))?;
        Ok(())
    }

    async fn response_of(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        self.query_one(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE parent_id = ?1"),
            params![id.to_string()],
        )
        .await
    }

    async fn due_for_processing(&self, now: DateTime<Utc>) -> Result<Vec<Message>, StoreError> {
        self.query_many(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE status = 'received' \
                    OR (status IN ('parse_error', 'validation_error', 'processing_error') \
                        AND retry_count < max_retries \
                        AND next_retry_at IS NOT NULL AND next_retry_at <= ?1) \
                 ORDER BY priority ASC, received_at ASC"
            ),
            params![now.to_rfc3339()],
        )
        .await
    }

    async fn stuck_in_processing(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Message>, StoreError> {
        self.query_many(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE status = 'processing' \
                   AND processing_started_at IS NOT NULL AND processing_started_at <= ?1"
            ),
            params![cutoff.to_rfc3339()],
        )
        .await
    }

    async fn count_by_status(&self, status: MessageStatus) -> Result<usize, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM messages WHERE status = ?1",
                params![status_to_str(status)],
            )
            .await
            .map_err(|e| StoreError::Backend(format!("Query failed: {e}")))?;
        match rows
            .next()
            .await
            .map_err(|e| StoreError::Backend(format!("Row read failed: {e}")))?
        {
            Some(row) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| StoreError::Backend(format!("Column read failed: {e}")))?;
                Ok(count as usize)
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AckFields, MessageKind};
    use std::collections::BTreeMap;

    async fn test_store() -> LibSqlMessageStore {
        LibSqlMessageStore::new_memory().await.unwrap()
    }

    #[tokio::test]
    async fn insert_and_roundtrip_with_fields() {
        let store = test_store().await;
        let now = Utc::now();
        let mut msg = Message::inbound("GTE-100", MessageKind::Acknowledgement, "raw", 3, now);
        msg.fields = Some(ParsedFields::Acknowledgement(AckFields {
            narrative: Some("OK".into()),
            extras: BTreeMap::new(),
        }));
        msg.notes.push("ingested".into());
        let id = msg.id;
        store.insert(msg).await.unwrap();

        let loaded = store.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.reference, "GTE-100");
        assert_eq!(loaded.kind, MessageKind::Acknowledgement);
        assert_eq!(loaded.status, MessageStatus::Received);
        assert_eq!(loaded.notes, vec!["ingested".to_string()]);
        assert!(matches!(
            loaded.fields,
            Some(ParsedFields::Acknowledgement(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_reference_maps_to_store_error() {
        let store = test_store().await;
        let now = Utc::now();
        store
            .insert(Message::inbound("GTE-101", MessageKind::FreeFormat, "a", 3, now))
            .await
            .unwrap();
        let err = store
            .insert(Message::inbound("GTE-101", MessageKind::FreeFormat, "b", 3, now))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateReference { .. }));
    }

    #[tokio::test]
    async fn cas_transition_row_count_guard() {
        let store = test_store().await;
        let now = Utc::now();
        let msg = Message::inbound("GTE-102", MessageKind::ReceivedGuarantee, "raw", 3, now);
        let id = msg.id;
        store.insert(msg).await.unwrap();

        let updated = store
            .transition(id, MessageStatus::Received, MessageStatus::Processing, now)
            .await
            .unwrap();
        assert_eq!(updated.status, MessageStatus::Processing);
        assert!(updated.processing_started_at.is_some());

        let err = store
            .transition(id, MessageStatus::Received, MessageStatus::Processing, now)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StatusConflict { .. }));
    }

    #[tokio::test]
    async fn set_response_enforces_at_most_one() {
        let store = test_store().await;
        let now = Utc::now();
        let msg = Message::inbound("GTE-103", MessageKind::ReceivedGuarantee, "raw", 3, now);
        let id = msg.id;
        store.insert(msg).await.unwrap();

        store.set_response(id, Uuid::new_v4(), now).await.unwrap();
        let err = store.set_response(id, Uuid::new_v4(), now).await.unwrap_err();
        assert!(matches!(err, StoreError::ResponseExists { .. }));
    }

    #[tokio::test]
    async fn due_scan_orders_and_excludes_exhausted() {
        let store = test_store().await;
        let now = Utc::now();

        let low = Message::inbound("GTE-104", MessageKind::FreeFormat, "raw", 3, now);
        let urgent = Message::inbound("GTE-105", MessageKind::ReceivedGuarantee, "raw", 3, now);
        let mut exhausted = Message::inbound("GTE-106", MessageKind::Amendment, "raw", 3, now);
        exhausted.status = MessageStatus::ProcessingError;
        exhausted.retry_count = 3;
        exhausted.next_retry_at = Some(now - chrono::Duration::minutes(1));

        store.insert(low).await.unwrap();
        store.insert(urgent).await.unwrap();
        store.insert(exhausted).await.unwrap();

        let due = store.due_for_processing(now).await.unwrap();
        let refs: Vec<&str> = due.iter().map(|m| m.reference.as_str()).collect();
        assert_eq!(refs, vec!["GTE-105", "GTE-104"]);
    }

    #[tokio::test]
    async fn response_of_finds_child() {
        let store = test_store().await;
        let now = Utc::now();
        let mut original =
            Message::inbound("GTE-107", MessageKind::ReceivedGuarantee, "raw", 3, now);
        original.sender = Some("BANKBEBB".into());
        original.receiver = Some("BANKUS33".into());
        let parent_id = original.id;
        store.insert(original.clone()).await.unwrap();

        let resp = Message::response(
            "GTE-108",
            MessageKind::Acknowledgement,
            "ack-raw",
            &original,
            now,
        );
        store.insert(resp.clone()).await.unwrap();

        let found = store.response_of(parent_id).await.unwrap().unwrap();
        assert_eq!(found.id, resp.id);
        assert_eq!(found.parent_id, Some(parent_id));
    }
}
