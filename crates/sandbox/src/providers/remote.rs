//! Remote-container provider.
//!
//! Allocates a container on a remote host over HTTP, seeds its agent
//! settings by HTTP exec, and opens the RPC channel over a bidirectional
//! WebSocket to the exec endpoint. Pause/resume/terminate are remote API
//! calls.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;

use ar_domain::config::SandboxConfig;
use ar_domain::error::{Error, Result};
use ar_domain::session::EnvironmentConfig;

use crate::channel::SandboxChannel;
use crate::extensions::AgentSettings;
use crate::log_ring::LogRing;
use crate::providers::{CreateSandboxOptions, SandboxDescription, SandboxStatus};

#[derive(Debug, Deserialize)]
struct AllocatedContainer {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RemoteState {
    status: String,
    #[serde(default)]
    resource_tier: Option<String>,
}

pub struct RemoteSandbox {
    client: reqwest::Client,
    /// Base URL of the remote container API.
    endpoint: String,
    remote_id: String,
    token: Option<String>,
    agent_command: String,
    ring: LogRing,
    channel: Mutex<Option<SandboxChannel>>,
}

impl RemoteSandbox {
    pub async fn create(
        config: &SandboxConfig,
        env_cfg: &EnvironmentConfig,
        opts: &CreateSandboxOptions,
        token: Option<String>,
        ring: LogRing,
    ) -> Result<Self> {
        let endpoint = env_cfg
            .remote_endpoint
            .clone()
            .ok_or_else(|| Error::Validation("remote environment has no endpoint".into()))?;
        let endpoint = endpoint.trim_end_matches('/').to_string();

        let image = env_cfg
            .image
            .clone()
            .unwrap_or_else(|| config.default_image.clone());
        let mut env: HashMap<&String, &String> = HashMap::new();
        env.extend(opts.env.iter());
        env.extend(opts.secrets.iter());

        let client = reqwest::Client::new();
        let mut req = client.post(format!("{endpoint}/api/containers")).json(&json!({
            "image": image,
            "env": env,
            "cpu": opts.cpu_limit,
            "memory_mb": opts.memory_mb,
            "resource_tier": env_cfg.resource_tier,
            "label": format!("ar-{}", opts.session_id),
        }));
        if let Some(token) = &token {
            req = req.bearer_auth(token);
        }
        let allocated: AllocatedContainer = req
            .send()
            .await
            .map_err(|e| Error::Provisioning(format!("allocating remote container: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Provisioning(format!("remote allocation rejected: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Provisioning(format!("remote allocation response: {e}")))?;

        let sandbox = Self {
            client,
            endpoint,
            remote_id: allocated.id,
            token,
            agent_command: config.agent_command.clone(),
            ring,
            channel: Mutex::new(None),
        };

        // Seed the agent settings file through HTTP exec.
        let settings = AgentSettings::Packages {
            packages: env_cfg.packages.clone(),
        };
        sandbox
            .exec_http(
                &["sh", "-c", "mkdir -p /agent && cat > /agent/settings.json"],
                Some(&serde_json::to_string(&settings)?),
            )
            .await?;

        Ok(sandbox)
    }

    pub fn from_id(
        config: &SandboxConfig,
        provider_id: &str,
        env_cfg: Option<&EnvironmentConfig>,
        token: Option<String>,
        ring: LogRing,
    ) -> Result<Self> {
        let endpoint = env_cfg
            .and_then(|e| e.remote_endpoint.clone())
            .ok_or_else(|| Error::Validation("remote environment has no endpoint".into()))?;
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            remote_id: provider_id.to_string(),
            token,
            agent_command: config.agent_command.clone(),
            ring: ring.clone(),
            channel: Mutex::new(None),
        })
    }

    pub fn provider_id(&self) -> &str {
        &self.remote_id
    }

    /// One-shot command inside the remote container, stdin optional.
    async fn exec_http(&self, argv: &[&str], stdin: Option<&str>) -> Result<()> {
        let url = format!("{}/api/containers/{}/exec", self.endpoint, self.remote_id);
        let mut req = self.client.post(&url).json(&json!({
            "argv": argv,
            "stdin": stdin,
        }));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req.send()
            .await
            .map_err(|e| Error::Provisioning(format!("remote exec: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Provisioning(format!("remote exec rejected: {e}")))?;
        Ok(())
    }

    async fn control(&self, action: &str) -> Result<reqwest::StatusCode> {
        let url = format!(
            "{}/api/containers/{}/{action}",
            self.endpoint, self.remote_id
        );
        let mut req = self.client.post(&url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Provisioning(format!("remote {action}: {e}")))?;
        Ok(resp.status())
    }

    pub async fn attach(&self) -> Result<SandboxChannel> {
        let ws_base = if let Some(rest) = self.endpoint.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.endpoint.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(Error::Validation(format!(
                "remote endpoint {} has no scheme",
                self.endpoint
            )));
        };
        let url = format!(
            "{ws_base}/api/containers/{}/exec?cmd={}",
            self.remote_id,
            urlencode(&self.agent_command)
        );

        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| Error::Channel(format!("remote exec websocket: {e}")))?;

        self.ring.push("remote exec channel opened".to_string());
        let channel = SandboxChannel::from_websocket(ws);
        *self.channel.lock() = Some(channel.clone());
        Ok(channel)
    }

    pub fn detach(&self) {
        if let Some(channel) = self.channel.lock().take() {
            channel.close();
        }
    }

    pub async fn pause(&self) -> Result<()> {
        self.detach();
        let status = self.control("stop").await?;
        // Already stopped or already gone both satisfy "paused".
        if status.is_success() || status == reqwest::StatusCode::CONFLICT {
            Ok(())
        } else {
            Err(Error::Provisioning(format!("remote stop returned {status}")))
        }
    }

    pub async fn resume(&self) -> Result<()> {
        let status = self.control("start").await?;
        if status.is_success() || status == reqwest::StatusCode::CONFLICT {
            Ok(())
        } else {
            Err(Error::Provisioning(format!("remote start returned {status}")))
        }
    }

    pub async fn terminate(&self) -> Result<()> {
        self.detach();
        let url = format!("{}/api/containers/{}", self.endpoint, self.remote_id);
        let mut req = self.client.delete(&url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Provisioning(format!("remote delete: {e}")))?;
        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Error::Provisioning(format!(
                "remote delete returned {}",
                resp.status()
            )))
        }
    }

    pub async fn describe(&self) -> Result<SandboxDescription> {
        let url = format!("{}/api/containers/{}", self.endpoint, self.remote_id);
        let mut req = self.client.get(&url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| Error::Provisioning(format!("remote describe: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(SandboxDescription {
                status: SandboxStatus::Terminated,
                resource_tier: None,
                capabilities: vec![],
            });
        }
        let state: RemoteState = resp
            .error_for_status()
            .map_err(|e| Error::Provisioning(format!("remote describe rejected: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Provisioning(format!("remote describe response: {e}")))?;

        let status = match state.status.as_str() {
            "running" => SandboxStatus::Running,
            "stopped" => SandboxStatus::Paused,
            "creating" | "pending" => SandboxStatus::Provisioning,
            _ => SandboxStatus::Terminated,
        };
        Ok(SandboxDescription {
            status,
            resource_tier: state.resource_tier,
            capabilities: vec!["exec".into(), "pause".into(), "resume".into()],
        })
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencode_escapes_spaces_and_slashes() {
        assert_eq!(urlencode("agent-shell --stdio"), "agent-shell%20--stdio");
        assert_eq!(urlencode("a/b"), "a%2Fb");
    }
}
