//! OS-container provider, driven through a docker-compatible engine CLI.
//!
//! The container is created from the environment's image with the session's
//! three host directories bind-mounted and the env + secrets snapshot
//! injected. The RPC channel is an `exec` into the running container with
//! piped stdio. Pause stops the container (state survives in the volumes);
//! resume starts it again.

use parking_lot::Mutex;

use ar_domain::config::SandboxConfig;
use ar_domain::error::{Error, Result};
use ar_domain::session::EnvironmentConfig;

use crate::channel::SandboxChannel;
use crate::log_ring::LogRing;
use crate::manager::SessionDirs;
use crate::providers::{
    run_cli, split_command, CreateSandboxOptions, SandboxDescription, SandboxStatus,
};

pub struct ContainerSandbox {
    engine: String,
    /// Container name; doubles as the provider id.
    name: String,
    agent_command: Vec<String>,
    resource_tier: Option<String>,
    ring: LogRing,
    channel: Mutex<Option<SandboxChannel>>,
}

impl ContainerSandbox {
    pub async fn create(
        config: &SandboxConfig,
        env_cfg: Option<&EnvironmentConfig>,
        opts: &CreateSandboxOptions,
        dirs: &SessionDirs,
        ring: LogRing,
    ) -> Result<Self> {
        let image = env_cfg
            .and_then(|e| e.image.clone())
            .unwrap_or_else(|| config.default_image.clone());
        let name = format!("ar-{}", opts.session_id);

        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            name.clone(),
            "--label".into(),
            "app=agentrelay".into(),
        ];
        for (host, guest) in [
            (&dirs.workspace, "/workspace"),
            (&dirs.agent, "/agent"),
            (&dirs.git, "/git"),
        ] {
            args.push("-v".into());
            args.push(format!("{}:{guest}", host.display()));
        }
        for (key, value) in opts.env.iter().chain(opts.secrets.iter()) {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        if let Some(cpus) = opts.cpu_limit {
            args.push("--cpus".into());
            args.push(cpus.to_string());
        }
        if let Some(mb) = opts.memory_mb {
            args.push("--memory".into());
            args.push(format!("{mb}m"));
        }
        args.push(image);

        run_cli(&config.container_engine, &args).await?;
        run_cli(&config.container_engine, ["start", name.as_str()]).await?;

        Ok(Self {
            engine: config.container_engine.clone(),
            name,
            agent_command: split_command(&config.agent_command),
            resource_tier: env_cfg.and_then(|e| e.resource_tier.clone()),
            ring,
            channel: Mutex::new(None),
        })
    }

    /// Rebuild a handle from a persisted container name (relay restart or
    /// post-idle resume). Performs no engine calls.
    pub fn from_id(
        config: &SandboxConfig,
        provider_id: &str,
        env_cfg: Option<&EnvironmentConfig>,
        ring: LogRing,
    ) -> Self {
        Self {
            engine: config.container_engine.clone(),
            name: provider_id.to_string(),
            agent_command: split_command(&config.agent_command),
            resource_tier: env_cfg.and_then(|e| e.resource_tier.clone()),
            ring,
            channel: Mutex::new(None),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.name
    }

    pub async fn attach(&self) -> Result<SandboxChannel> {
        let mut cmd = tokio::process::Command::new(&self.engine);
        cmd.arg("exec")
            .arg("-i")
            .arg(&self.name)
            .args(&self.agent_command)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let child = cmd
            .spawn()
            .map_err(|e| Error::Channel(format!("exec into {}: {e}", self.name)))?;

        let channel = SandboxChannel::from_child(child, self.ring.clone())?;
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
        // `stop` on an already-stopped container exits 0.
        run_cli(&self.engine, ["stop", self.name.as_str()]).await?;
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        run_cli(&self.engine, ["start", self.name.as_str()]).await?;
        Ok(())
    }

    pub async fn terminate(&self) -> Result<()> {
        self.detach();
        match run_cli(&self.engine, ["rm", "-f", self.name.as_str()]).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn describe(&self) -> Result<SandboxDescription> {
        let status = match run_cli(
            &self.engine,
            ["inspect", "-f", "{{.State.Status}}", self.name.as_str()],
        )
        .await
        {
            Ok(raw) => match raw.as_str() {
                "running" => SandboxStatus::Running,
                "created" => SandboxStatus::Provisioning,
                "paused" | "exited" => SandboxStatus::Paused,
                "dead" | "removing" => SandboxStatus::Terminated,
                other => {
                    tracing::debug!(container = %self.name, state = %other, "unmapped container state");
                    SandboxStatus::Paused
                }
            },
            Err(e) if is_missing(&e) => SandboxStatus::Terminated,
            Err(e) => return Err(e),
        };

        Ok(SandboxDescription {
            status,
            resource_tier: self.resource_tier.clone(),
            capabilities: vec!["exec".into(), "pause".into(), "resume".into()],
        })
    }
}

fn is_missing(e: &Error) -> bool {
    matches!(e, Error::Provisioning(msg) if msg.to_ascii_lowercase().contains("no such"))
}
