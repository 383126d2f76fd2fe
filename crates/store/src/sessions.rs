//! Session rows: creation, lookup, status transitions, activity touches.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use ar_domain::error::{Error, Result};
use ar_domain::session::{SandboxType, Session, SessionMode, SessionStatus};

use crate::{map_db_err, now, parse_ts, Store};

const SESSION_COLS: &str = "id, mode, status, repository_url, repository_branch, workspace_path, \
     last_activity_at, sandbox_type, sandbox_id, data_dir, environment_id, created_at, updated_at";

impl Store {
    /// Mode/status/timestamps come back as text; parse after the rusqlite
    /// layer so errors carry our own types.
    fn read_session(row: &Row<'_>) -> Result<Session> {
        let mode: String = row.get(1).map_err(map_db_err)?;
        let status: String = row.get(2).map_err(map_db_err)?;
        let last_activity: String = row.get(6).map_err(map_db_err)?;
        let sandbox_type: Option<String> = row.get(7).map_err(map_db_err)?;
        let created: String = row.get(11).map_err(map_db_err)?;
        let updated: String = row.get(12).map_err(map_db_err)?;

        Ok(Session {
            id: row.get(0).map_err(map_db_err)?,
            mode: SessionMode::parse(&mode)?,
            status: SessionStatus::parse(&status)?,
            repository_url: row.get(3).map_err(map_db_err)?,
            repository_branch: row.get(4).map_err(map_db_err)?,
            workspace_path: row.get(5).map_err(map_db_err)?,
            last_activity_at: parse_ts(&last_activity)?,
            sandbox_type: sandbox_type
                .as_deref()
                .map(SandboxType::parse)
                .transpose()?,
            sandbox_id: row.get(8).map_err(map_db_err)?,
            data_dir: row.get(9).map_err(map_db_err)?,
            environment_id: row.get(10).map_err(map_db_err)?,
            created_at: parse_ts(&created)?,
            updated_at: parse_ts(&updated)?,
        })
    }

    pub fn create_session(&self, session: &Session) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO sessions (id, mode, status, repository_url, repository_branch, \
                 workspace_path, last_activity_at, sandbox_type, sandbox_id, data_dir, \
                 environment_id, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    session.id,
                    session.mode.as_str(),
                    session.status.as_str(),
                    session.repository_url,
                    session.repository_branch,
                    session.workspace_path,
                    session.last_activity_at.to_rfc3339(),
                    session.sandbox_type.map(|t| t.as_str()),
                    session.sandbox_id,
                    session.data_dir,
                    session.environment_id,
                    session.created_at.to_rfc3339(),
                    session.updated_at.to_rfc3339(),
                ],
            )
            .map_err(map_db_err)?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Session> {
        let conn = self.conn.lock();
        let session = conn
            .query_row(
                &format!("SELECT {SESSION_COLS} FROM sessions WHERE id = ?1"),
                [id],
                |row| Ok(Self::read_session(row)),
            )
            .optional()
            .map_err(map_db_err)?;
        match session {
            Some(result) => result,
            None => Err(Error::NotFound(format!("session {id}"))),
        }
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLS} FROM sessions ORDER BY created_at DESC"
            ))
            .map_err(map_db_err)?;
        let rows = stmt
            .query_map([], |row| Ok(Self::read_session(row)))
            .map_err(map_db_err)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row.map_err(map_db_err)??);
        }
        Ok(sessions)
    }

    pub fn list_sessions_by_status(&self, status: SessionStatus) -> Result<Vec<Session>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SESSION_COLS} FROM sessions WHERE status = ?1 ORDER BY created_at"
            ))
            .map_err(map_db_err)?;
        let rows = stmt
            .query_map([status.as_str()], |row| Ok(Self::read_session(row)))
            .map_err(map_db_err)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row.map_err(map_db_err)??);
        }
        Ok(sessions)
    }

    /// Transition a session's status, enforcing the state machine.
    /// Returns the updated session; `Conflict` on an illegal transition.
    pub fn update_session_status(&self, id: &str, to: SessionStatus) -> Result<Session> {
        let mut session = self.get_session(id)?;
        if !session.status.can_transition(to) {
            return Err(Error::Conflict(format!(
                "session {id} is {}, cannot become {}",
                session.status.as_str(),
                to.as_str()
            )));
        }
        let ts = now();
        self.conn
            .lock()
            .execute(
                "UPDATE sessions SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, to.as_str(), ts],
            )
            .map_err(map_db_err)?;
        session.status = to;
        session.updated_at = parse_ts(&ts)?;
        Ok(session)
    }

    /// Record the sandbox binding. `None` clears it (after terminate).
    pub fn set_session_sandbox(
        &self,
        id: &str,
        sandbox_type: Option<SandboxType>,
        sandbox_id: Option<&str>,
    ) -> Result<()> {
        let changed = self
            .conn
            .lock()
            .execute(
                "UPDATE sessions SET sandbox_type = ?2, sandbox_id = ?3, updated_at = ?4 \
                 WHERE id = ?1",
                params![id, sandbox_type.map(|t| t.as_str()), sandbox_id, now()],
            )
            .map_err(map_db_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    /// Best-effort activity touch; callers debounce.
    pub fn touch_session_activity(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE sessions SET last_activity_at = ?2 WHERE id = ?1",
                params![id, at.to_rfc3339()],
            )
            .map_err(map_db_err)?;
        Ok(())
    }

    /// Delete the row and its journal.
    pub fn delete_session(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM events WHERE session_id = ?1", [id])
            .map_err(map_db_err)?;
        let changed = conn
            .execute("DELETE FROM sessions WHERE id = ?1", [id])
            .map_err(map_db_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("session {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn make_session(id: &str, mode: SessionMode) -> Session {
        let now = Utc::now();
        Session {
            id: id.into(),
            mode,
            status: SessionStatus::Creating,
            repository_url: None,
            repository_branch: None,
            workspace_path: None,
            last_activity_at: now,
            sandbox_type: None,
            sandbox_id: None,
            data_dir: format!("/tmp/state/sessions/{id}"),
            environment_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn create_and_get_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let mut session = make_session("s1", SessionMode::Code);
        session.repository_url = Some("https://example.com/repo.git".into());
        session.repository_branch = Some("main".into());
        store.create_session(&session).unwrap();

        let loaded = store.get_session("s1").unwrap();
        assert_eq!(loaded.mode, SessionMode::Code);
        assert_eq!(loaded.status, SessionStatus::Creating);
        assert_eq!(
            loaded.repository_url.as_deref(),
            Some("https://example.com/repo.git")
        );
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.get_session("nope"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn status_machine_enforced() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_session(&make_session("s1", SessionMode::Chat))
            .unwrap();

        store
            .update_session_status("s1", SessionStatus::Active)
            .unwrap();
        store
            .update_session_status("s1", SessionStatus::Archived)
            .unwrap();

        // Archived is terminal.
        let err = store
            .update_session_status("s1", SessionStatus::Active)
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn sandbox_binding_and_clear() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_session(&make_session("s1", SessionMode::Code))
            .unwrap();

        store
            .set_session_sandbox("s1", Some(SandboxType::Container), Some("ctr-9"))
            .unwrap();
        let s = store.get_session("s1").unwrap();
        assert_eq!(s.sandbox_type, Some(SandboxType::Container));
        assert_eq!(s.sandbox_id.as_deref(), Some("ctr-9"));

        store.set_session_sandbox("s1", None, None).unwrap();
        let s = store.get_session("s1").unwrap();
        assert!(s.sandbox_type.is_none());
        assert!(s.sandbox_id.is_none());
    }

    #[test]
    fn list_by_status_filters() {
        let store = Store::open_in_memory().unwrap();
        for id in ["a", "b", "c"] {
            store
                .create_session(&make_session(id, SessionMode::Chat))
                .unwrap();
        }
        store
            .update_session_status("b", SessionStatus::Active)
            .unwrap();

        let active = store
            .list_sessions_by_status(SessionStatus::Active)
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "b");
        assert_eq!(
            store
                .list_sessions_by_status(SessionStatus::Creating)
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn delete_removes_session_and_journal() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_session(&make_session("s1", SessionMode::Chat))
            .unwrap();
        store
            .append_event("s1", "agent_message", &serde_json::json!({"n": 1}))
            .unwrap();

        store.delete_session("s1").unwrap();
        assert!(store.get_session("s1").is_err());
        let (events, last) = store.events_after("s1", 0, 10).unwrap();
        assert!(events.is_empty());
        assert_eq!(last, 0);
    }
}
