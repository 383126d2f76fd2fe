//! Append-only event journal.
//!
//! Per session, `seq` is dense from 1 with no gaps or duplicates. That is
//! the invariant the whole replay design rests on. `append_event` allocates
//! MAX+1 and inserts in one transaction; a racing appender hits the primary
//! key and gets `Conflict`, which the hub retries once. Events are never
//! mutated; retention pruning is the only deletion path besides session
//! delete.

use chrono::{DateTime, Utc};
use serde_json::Value;

use ar_domain::error::{Error, Result};

use crate::{map_db_err, now, parse_ts, Store};

#[derive(Debug, Clone)]
pub struct EventRow {
    pub session_id: String,
    pub seq: i64,
    pub event_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Append one event, returning its assigned seq.
    pub fn append_event(&self, session_id: &str, event_type: &str, payload: &Value) -> Result<i64> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction().map_err(map_db_err)?;

        let next: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .map_err(map_db_err)?;

        tx.execute(
            "INSERT INTO events (session_id, seq, type, payload, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                session_id,
                next,
                event_type,
                payload.to_string(),
                now()
            ],
        )
        .map_err(map_insert_err)?;

        tx.commit().map_err(map_db_err)?;
        Ok(next)
    }

    /// Events with `seq > after_seq`, ascending, at most `limit`, plus the
    /// session's current max seq.
    pub fn events_after(
        &self,
        session_id: &str,
        after_seq: i64,
        limit: usize,
    ) -> Result<(Vec<EventRow>, i64)> {
        let conn = self.conn.lock();

        let last_seq: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM events WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .map_err(map_db_err)?;

        let mut stmt = conn
            .prepare(
                "SELECT session_id, seq, type, payload, created_at FROM events \
                 WHERE session_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3",
            )
            .map_err(map_db_err)?;
        let rows = stmt
            .query_map(
                rusqlite::params![session_id, after_seq, limit as i64],
                |row| {
                    let payload: String = row.get(3)?;
                    let created: String = row.get(4)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        payload,
                        created,
                    ))
                },
            )
            .map_err(map_db_err)?;

        let mut events = Vec::new();
        for row in rows {
            let (session_id, seq, event_type, payload, created) = row.map_err(map_db_err)?;
            events.push(EventRow {
                session_id,
                seq,
                event_type,
                payload: serde_json::from_str(&payload)
                    .map_err(|e| Error::Journal(format!("corrupt payload at seq {seq}: {e}")))?,
                created_at: parse_ts(&created)?,
            });
        }
        Ok((events, last_seq))
    }

    /// The session's current max seq (0 when empty).
    pub fn last_seq(&self, session_id: &str) -> Result<i64> {
        self.conn
            .lock()
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM events WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .map_err(map_db_err)
    }

    /// Retention sweep; returns the number of rows removed.
    pub fn prune_events_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM events WHERE created_at < ?1",
                [cutoff.to_rfc3339()],
            )
            .map_err(map_db_err)
    }
}

/// A primary-key collision here means a concurrent appender won the seq.
fn map_insert_err(e: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(code, _) = &e {
        if code.code == rusqlite::ErrorCode::ConstraintViolation {
            return Error::Conflict("event seq already allocated".into());
        }
    }
    map_db_err(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seq_is_dense_from_one() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..5 {
            let seq = store
                .append_event("s1", "agent_message", &json!({"i": i}))
                .unwrap();
            assert_eq!(seq, i + 1);
        }
        let (events, last) = store.events_after("s1", 0, 100).unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(last, 5);
    }

    #[test]
    fn sessions_do_not_share_counters() {
        let store = Store::open_in_memory().unwrap();
        store.append_event("a", "e", &json!({})).unwrap();
        store.append_event("a", "e", &json!({})).unwrap();
        let seq = store.append_event("b", "e", &json!({})).unwrap();
        assert_eq!(seq, 1);
    }

    #[test]
    fn range_query_is_exclusive_and_bounded() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..10 {
            store
                .append_event("s1", "agent_message", &json!({"i": i}))
                .unwrap();
        }

        let (events, last) = store.events_after("s1", 2, 3).unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(last, 10);

        // Past the tail: empty, but last_seq still reported.
        let (events, last) = store.events_after("s1", 10, 3).unwrap();
        assert!(events.is_empty());
        assert_eq!(last, 10);
    }

    #[test]
    fn payload_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let payload = json!({"type": "tool_call", "nested": {"argv": ["ls", "-la"]}});
        store.append_event("s1", "tool_call", &payload).unwrap();
        let (events, _) = store.events_after("s1", 0, 1).unwrap();
        assert_eq!(events[0].payload, payload);
        assert_eq!(events[0].event_type, "tool_call");
    }

    #[test]
    fn visible_immediately_after_append() {
        let store = Store::open_in_memory().unwrap();
        let seq = store.append_event("s1", "e", &json!({"x": 1})).unwrap();
        let (events, last) = store.events_after("s1", seq - 1, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(last, seq);
    }

    #[test]
    fn prune_removes_old_rows_only() {
        let store = Store::open_in_memory().unwrap();
        store.append_event("s1", "e", &json!({})).unwrap();
        // Cutoff in the past removes nothing.
        let removed = store
            .prune_events_older_than(Utc::now() - chrono::Duration::days(1))
            .unwrap();
        assert_eq!(removed, 0);
        // Cutoff in the future removes the row.
        let removed = store
            .prune_events_older_than(Utc::now() + chrono::Duration::days(1))
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.last_seq("s1").unwrap(), 0);
    }
}
