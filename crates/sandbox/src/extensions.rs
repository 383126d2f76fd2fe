//! Host-side extension pre-installation for microVM sandboxes.
//!
//! The microVM's RAM budget is too small to run the general package
//! installer (it pulls in native-compile dependencies), so extensions are
//! cloned and installed on the host into the session's agent directory
//! before the VM starts, and the agent settings file references them as
//! local directory paths. Every other provider leaves installation to the
//! agent itself and gets a `packages` settings file instead.

use std::path::{Path, PathBuf};

use serde::Serialize;

use ar_domain::error::{Error, Result};
use ar_domain::session::ExtensionRef;

use crate::providers::run_cli;

/// `agent/settings.json` contents. MicroVM sandboxes list pre-installed
/// extension directories; everyone else lists package refs the agent
/// installs at startup.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum AgentSettings {
    Extensions { extensions: Vec<String> },
    Packages { packages: Vec<String> },
}

/// Clone-or-pull each extension into `<agent_dir>/extensions/<name>` and
/// install its dependencies in no-peer mode. Returns the absolute paths in
/// input order.
pub async fn preinstall_extensions(
    extensions: &[ExtensionRef],
    agent_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let root = agent_dir.join("extensions");
    std::fs::create_dir_all(&root)?;

    let mut installed = Vec::with_capacity(extensions.len());
    for ext in extensions {
        validate_name(&ext.name)?;
        let dest = root.join(&ext.name);
        let dest_str = dest.to_string_lossy().into_owned();

        if dest.join(".git").exists() {
            tracing::debug!(extension = %ext.name, "pulling existing extension");
            run_cli("git", ["-C", dest_str.as_str(), "pull", "--ff-only"])
                .await
                .map_err(|e| provisioning(&ext.name, "pull", e))?;
        } else {
            tracing::debug!(extension = %ext.name, url = %ext.git_url, "cloning extension");
            run_cli(
                "git",
                [
                    "clone",
                    "--depth",
                    "1",
                    ext.git_url.as_str(),
                    dest_str.as_str(),
                ],
            )
            .await
            .map_err(|e| provisioning(&ext.name, "clone", e))?;
        }

        run_cli(
            "npm",
            [
                "--prefix",
                dest_str.as_str(),
                "install",
                "--legacy-peer-deps",
                "--no-audit",
                "--no-fund",
            ],
        )
        .await
        .map_err(|e| provisioning(&ext.name, "install", e))?;

        installed.push(std::fs::canonicalize(&dest).unwrap_or(dest));
    }
    Ok(installed)
}

/// Write `<agent_dir>/settings.json`.
pub fn write_settings(agent_dir: &Path, settings: &AgentSettings) -> Result<()> {
    std::fs::create_dir_all(agent_dir)?;
    let path = agent_dir.join("settings.json");
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(&path, json)?;
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name != "."
        && name != "..";
    if ok {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "extension name {name:?} is not a safe directory name"
        )))
    }
}

fn provisioning(name: &str, step: &str, e: Error) -> Error {
    Error::Provisioning(format!("extension {name} {step}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_shapes() {
        let ext = AgentSettings::Extensions {
            extensions: vec!["/state/agent/extensions/notes".into()],
        };
        assert_eq!(
            serde_json::to_value(&ext).unwrap(),
            serde_json::json!({"extensions": ["/state/agent/extensions/notes"]})
        );

        let pkgs = AgentSettings::Packages {
            packages: vec!["@agent/notes@1.2.0".into()],
        };
        assert_eq!(
            serde_json::to_value(&pkgs).unwrap(),
            serde_json::json!({"packages": ["@agent/notes@1.2.0"]})
        );
    }

    #[test]
    fn write_settings_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let agent_dir = dir.path().join("agent");
        write_settings(
            &agent_dir,
            &AgentSettings::Packages {
                packages: vec!["ripgrep".into()],
            },
        )
        .unwrap();
        let raw = std::fs::read_to_string(agent_dir.join("settings.json")).unwrap();
        assert!(raw.contains("ripgrep"));
    }

    #[test]
    fn hostile_extension_names_rejected() {
        for bad in ["", "..", "../evil", "a/b", "a\\b"] {
            assert!(validate_name(bad).is_err(), "{bad:?} should be rejected");
        }
        for good in ["notes", "my-ext", "ext_2", "v1.2"] {
            assert!(validate_name(good).is_ok(), "{good:?} should be accepted");
        }
    }
}
