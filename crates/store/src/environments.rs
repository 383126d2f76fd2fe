//! Environment config rows.
//!
//! The provider-specific parts live in a JSON `config` column; id, name,
//! sandbox type and the default flag are columns so lookups stay SQL.

use rusqlite::{params, OptionalExtension};

use ar_domain::error::{Error, Result};
use ar_domain::session::EnvironmentConfig;

use crate::{map_db_err, now, Store};

impl Store {
    pub fn upsert_environment(&self, env: &EnvironmentConfig) -> Result<()> {
        if env.name.trim().is_empty() {
            return Err(Error::Validation("environment name must not be empty".into()));
        }
        // The default flag lives in its own column (it is cleared on other
        // rows when a new default arrives); keep the JSON copy neutral.
        let mut stored = env.clone();
        stored.is_default = false;
        let config = serde_json::to_string(&stored)?;
        let ts = now();
        let conn = self.conn.lock();
        if env.is_default {
            // Only one default at a time.
            conn.execute("UPDATE environments SET is_default = 0", [])
                .map_err(map_db_err)?;
        }
        conn.execute(
            "INSERT INTO environments (id, name, sandbox_type, config, is_default, \
             created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
             ON CONFLICT(id) DO UPDATE SET \
             name = ?2, sandbox_type = ?3, config = ?4, is_default = ?5, updated_at = ?6",
            params![
                env.id,
                env.name,
                env.sandbox_type.as_str(),
                config,
                env.is_default,
                ts,
            ],
        )
        .map_err(map_db_err)?;
        Ok(())
    }

    pub fn get_environment(&self, id: &str) -> Result<EnvironmentConfig> {
        let raw: Option<(String, bool)> = self
            .conn
            .lock()
            .query_row(
                "SELECT config, is_default FROM environments WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(map_db_err)?;
        match raw {
            Some((json, is_default)) => parse_env(&json, is_default),
            None => Err(Error::NotFound(format!("environment {id}"))),
        }
    }

    pub fn get_default_environment(&self) -> Result<Option<EnvironmentConfig>> {
        let raw: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT config FROM environments WHERE is_default = 1 LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_db_err)?;
        match raw {
            Some(json) => Ok(Some(parse_env(&json, true)?)),
            None => Ok(None),
        }
    }

    pub fn list_environments(&self) -> Result<Vec<EnvironmentConfig>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT config, is_default FROM environments ORDER BY name")
            .map_err(map_db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?))
            })
            .map_err(map_db_err)?;
        let mut envs = Vec::new();
        for row in rows {
            let (json, is_default) = row.map_err(map_db_err)?;
            envs.push(parse_env(&json, is_default)?);
        }
        Ok(envs)
    }

    pub fn delete_environment(&self, id: &str) -> Result<()> {
        let changed = self
            .conn
            .lock()
            .execute("DELETE FROM environments WHERE id = ?1", [id])
            .map_err(map_db_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("environment {id}")));
        }
        Ok(())
    }
}

fn parse_env(json: &str, is_default: bool) -> Result<EnvironmentConfig> {
    let mut env: EnvironmentConfig = serde_json::from_str(json)?;
    env.is_default = is_default;
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ar_domain::session::SandboxType;

    fn make_env(id: &str, is_default: bool) -> EnvironmentConfig {
        EnvironmentConfig {
            id: id.into(),
            name: format!("env {id}"),
            sandbox_type: SandboxType::Container,
            image: Some("sandbox:latest".into()),
            resource_tier: None,
            remote_endpoint: None,
            secret_id: None,
            env: Default::default(),
            packages: vec!["ripgrep".into()],
            extensions: vec![],
            idle_minutes: Some(15),
            terminate_minutes: Some(120),
            is_default,
        }
    }

    #[test]
    fn round_trip() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_environment(&make_env("e1", false)).unwrap();
        let loaded = store.get_environment("e1").unwrap();
        assert_eq!(loaded.image.as_deref(), Some("sandbox:latest"));
        assert_eq!(loaded.idle_minutes, Some(15));
        assert_eq!(loaded.packages, vec!["ripgrep".to_string()]);
    }

    #[test]
    fn single_default_enforced() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_environment(&make_env("e1", true)).unwrap();
        store.upsert_environment(&make_env("e2", true)).unwrap();

        let default = store.get_default_environment().unwrap().unwrap();
        assert_eq!(default.id, "e2");
        // e1 lost its default flag.
        assert_eq!(
            store
                .list_environments()
                .unwrap()
                .iter()
                .filter(|e| e.is_default)
                .count(),
            1
        );
    }

    #[test]
    fn missing_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.get_environment("nope"),
            Err(Error::NotFound(_))
        ));
        assert!(store.get_default_environment().unwrap().is_none());
    }
}
