//! Encrypted secrets rows.
//!
//! Plaintext exists in exactly two places: the caller's upsert argument and
//! the map returned by `secrets_as_env` at sandbox construction. Everything
//! persisted is ciphertext + nonce + tag + key version.

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};

use ar_crypto::{CryptoService, EncryptedRecord};
use ar_domain::error::{Error, Result};
use ar_domain::session::{SecretKind, SecretSummary};

use crate::{map_db_err, now, parse_ts, Store};

impl Store {
    /// Insert or replace a secret, encrypting with the current key.
    pub fn upsert_secret(
        &self,
        crypto: &CryptoService,
        kind: SecretKind,
        id: &str,
        plaintext: &str,
        enabled: bool,
    ) -> Result<()> {
        if id.trim().is_empty() {
            return Err(Error::Validation("secret id must not be empty".into()));
        }
        let record = crypto.encrypt(plaintext.as_bytes())?;
        let ts = now();
        self.conn
            .lock()
            .execute(
                "INSERT INTO secrets (id, kind, enabled, ciphertext, nonce, tag, key_version, \
                 created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8) \
                 ON CONFLICT(id) DO UPDATE SET \
                 kind = ?2, enabled = ?3, ciphertext = ?4, nonce = ?5, tag = ?6, \
                 key_version = ?7, updated_at = ?8",
                params![
                    id,
                    kind.as_str(),
                    enabled,
                    record.ciphertext,
                    record.nonce,
                    record.tag,
                    record.key_version,
                    ts,
                ],
            )
            .map_err(map_db_err)?;
        Ok(())
    }

    /// Non-sensitive metadata for every secret.
    pub fn list_secrets(&self) -> Result<Vec<SecretSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, kind, enabled, key_version, created_at, updated_at \
                 FROM secrets ORDER BY id",
            )
            .map_err(map_db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(map_db_err)?;

        let mut summaries = Vec::new();
        for row in rows {
            let (id, kind, enabled, key_version, created, updated) = row.map_err(map_db_err)?;
            summaries.push(SecretSummary {
                id,
                kind: SecretKind::parse(&kind)?,
                enabled,
                key_version,
                created_at: parse_ts(&created)?,
                updated_at: parse_ts(&updated)?,
            });
        }
        Ok(summaries)
    }

    pub fn delete_secret(&self, id: &str) -> Result<()> {
        let changed = self
            .conn
            .lock()
            .execute("DELETE FROM secrets WHERE id = ?1", [id])
            .map_err(map_db_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("secret {id}")));
        }
        Ok(())
    }

    /// Decrypt every enabled secret into an env-var map.
    ///
    /// This is the only call that materializes plaintext; callers must not
    /// retain the map beyond sandbox construction. A row that fails to
    /// decrypt is skipped and logged, never fails the batch.
    pub fn secrets_as_env(&self, crypto: &CryptoService) -> Result<HashMap<String, String>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT id, kind, ciphertext, nonce, tag, key_version FROM secrets \
                     WHERE enabled = 1 ORDER BY id",
                )
                .map_err(map_db_err)?;
            let mapped = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        EncryptedRecord {
                            ciphertext: row.get(2)?,
                            nonce: row.get(3)?,
                            tag: row.get(4)?,
                            key_version: row.get(5)?,
                        },
                    ))
                })
                .map_err(map_db_err)?;
            mapped
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(map_db_err)?
        };

        let mut env = HashMap::new();
        for (id, kind, record) in rows {
            let kind = SecretKind::parse(&kind)?;
            match crypto.decrypt(&record) {
                Ok(plaintext) => match String::from_utf8(plaintext) {
                    Ok(value) => {
                        let name = kind.env_var_name(&id);
                        if env.insert(name.clone(), value).is_some() {
                            tracing::warn!(
                                secret_id = %id,
                                env_var = %name,
                                "secret env name collision, last write wins"
                            );
                        }
                    }
                    Err(_) => {
                        tracing::warn!(secret_id = %id, "secret is not valid UTF-8, skipping");
                    }
                },
                Err(e) => {
                    tracing::warn!(secret_id = %id, error = %e, "secret decrypt failed, skipping");
                }
            }
        }
        Ok(env)
    }

    /// Whether a secret row exists (used to validate environment bindings).
    pub fn secret_exists(&self, id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .lock()
            .query_row("SELECT 1 FROM secrets WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(map_db_err)?;
        Ok(found.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ar_domain::config::CryptoConfig;

    fn crypto() -> CryptoService {
        CryptoService::from_config(&CryptoConfig {
            master_key: CryptoService::generate_key(),
            key_version: 1,
            retired_keys: HashMap::new(),
        })
        .unwrap()
    }

    #[test]
    fn upsert_list_delete() {
        let store = Store::open_in_memory().unwrap();
        let crypto = crypto();

        store
            .upsert_secret(&crypto, SecretKind::AiProvider, "anthropic", "sk-1", true)
            .unwrap();
        store
            .upsert_secret(&crypto, SecretKind::EnvVar, "DATABASE_URL", "pg://", false)
            .unwrap();

        let listed = store.list_secrets().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "DATABASE_URL");
        assert!(!listed[0].enabled);
        assert_eq!(listed[1].kind, SecretKind::AiProvider);

        store.delete_secret("DATABASE_URL").unwrap();
        assert_eq!(store.list_secrets().unwrap().len(), 1);
        assert!(matches!(
            store.delete_secret("DATABASE_URL"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn env_projection_skips_disabled() {
        let store = Store::open_in_memory().unwrap();
        let crypto = crypto();

        store
            .upsert_secret(&crypto, SecretKind::AiProvider, "anthropic", "sk-1", true)
            .unwrap();
        store
            .upsert_secret(&crypto, SecretKind::EnvVar, "FEATURE_FLAG", "on", true)
            .unwrap();
        store
            .upsert_secret(&crypto, SecretKind::EnvVar, "DISABLED_ONE", "x", false)
            .unwrap();

        let env = store.secrets_as_env(&crypto).unwrap();
        assert_eq!(env.get("ANTHROPIC_API_KEY").map(String::as_str), Some("sk-1"));
        assert_eq!(env.get("FEATURE_FLAG").map(String::as_str), Some("on"));
        assert!(!env.contains_key("DISABLED_ONE"));
    }

    #[test]
    fn undecryptable_row_is_skipped_not_fatal() {
        let store = Store::open_in_memory().unwrap();
        let writer = crypto();
        store
            .upsert_secret(&writer, SecretKind::EnvVar, "GOOD", "ok", true)
            .unwrap();
        store
            .upsert_secret(&writer, SecretKind::EnvVar, "BAD", "lost", true)
            .unwrap();

        // Corrupt one row's tag directly.
        store
            .conn
            .lock()
            .execute(
                "UPDATE secrets SET tag = x'00000000000000000000000000000000' WHERE id = 'BAD'",
                [],
            )
            .unwrap();

        let env = store.secrets_as_env(&writer).unwrap();
        assert_eq!(env.get("GOOD").map(String::as_str), Some("ok"));
        assert!(!env.contains_key("BAD"));
    }

    #[test]
    fn upsert_replaces_value() {
        let store = Store::open_in_memory().unwrap();
        let crypto = crypto();
        store
            .upsert_secret(&crypto, SecretKind::EnvVar, "K", "v1", true)
            .unwrap();
        store
            .upsert_secret(&crypto, SecretKind::EnvVar, "K", "v2", true)
            .unwrap();
        let env = store.secrets_as_env(&crypto).unwrap();
        assert_eq!(env.get("K").map(String::as_str), Some("v2"));
    }
}
