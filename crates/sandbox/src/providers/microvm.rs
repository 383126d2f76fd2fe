//! MicroVM provider, driven through the host's VM launcher CLI.
//!
//! Same three directory mounts as the container provider, but the VM's
//! memory budget is small, so extensions are pre-installed on the host
//! (see [`crate::extensions`]) and `settings.json` references them as
//! local directory paths before the VM boots.

use parking_lot::Mutex;

use ar_domain::config::SandboxConfig;
use ar_domain::error::{Error, Result};
use ar_domain::session::EnvironmentConfig;

use crate::channel::SandboxChannel;
use crate::extensions::{preinstall_extensions, write_settings, AgentSettings};
use crate::log_ring::LogRing;
use crate::manager::SessionDirs;
use crate::providers::{
    run_cli, split_command, CreateSandboxOptions, SandboxDescription, SandboxStatus,
};

/// Default VM memory when the caller gives no hint, in MiB. Deliberately
/// small; that constraint is why extensions are installed host-side.
const DEFAULT_MEMORY_MB: u64 = 1024;

pub struct MicroVmSandbox {
    launcher: String,
    /// VM name; doubles as the provider id.
    name: String,
    agent_command: Vec<String>,
    resource_tier: Option<String>,
    ring: LogRing,
    channel: Mutex<Option<SandboxChannel>>,
}

impl MicroVmSandbox {
    pub async fn create(
        config: &SandboxConfig,
        env_cfg: Option<&EnvironmentConfig>,
        opts: &CreateSandboxOptions,
        dirs: &SessionDirs,
        ring: LogRing,
    ) -> Result<Self> {
        // Extensions go in before the VM starts; inside, npm would OOM.
        let extension_refs = env_cfg.map(|e| e.extensions.as_slice()).unwrap_or(&[]);
        let installed = preinstall_extensions(extension_refs, &dirs.agent).await?;
        write_settings(
            &dirs.agent,
            &AgentSettings::Extensions {
                extensions: installed
                    .iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect(),
            },
        )?;

        let image = env_cfg
            .and_then(|e| e.image.clone())
            .unwrap_or_else(|| config.default_image.clone());
        let name = format!("ar-{}", opts.session_id);
        let memory = opts.memory_mb.unwrap_or(DEFAULT_MEMORY_MB);

        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            name.clone(),
            "--memory".into(),
            format!("{memory}M"),
        ];
        if let Some(cpus) = opts.cpu_limit {
            args.push("--cpus".into());
            args.push(format!("{}", cpus.ceil() as u64));
        }
        for (host, guest) in [
            (&dirs.workspace, "/workspace"),
            (&dirs.agent, "/agent"),
            (&dirs.git, "/git"),
        ] {
            args.push("--volume".into());
            args.push(format!("{}:{guest}", host.display()));
        }
        for (key, value) in opts.env.iter().chain(opts.secrets.iter()) {
            args.push("--env".into());
            args.push(format!("{key}={value}"));
        }
        args.push(image);

        run_cli(&config.vm_launcher, &args).await?;
        run_cli(&config.vm_launcher, ["start", name.as_str()]).await?;

        Ok(Self {
            launcher: config.vm_launcher.clone(),
            name,
            agent_command: split_command(&config.agent_command),
            resource_tier: env_cfg.and_then(|e| e.resource_tier.clone()),
            ring,
            channel: Mutex::new(None),
        })
    }

    pub fn from_id(
        config: &SandboxConfig,
        provider_id: &str,
        env_cfg: Option<&EnvironmentConfig>,
        ring: LogRing,
    ) -> Self {
        Self {
            launcher: config.vm_launcher.clone(),
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
        let mut cmd = tokio::process::Command::new(&self.launcher);
        cmd.arg("exec")
            .arg("-i")
            .arg(&self.name)
            .arg("--")
            .args(&self.agent_command)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        let child = cmd
            .spawn()
            .map_err(|e| Error::Channel(format!("exec into vm {}: {e}", self.name)))?;

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
        match run_cli(&self.launcher, ["stop", self.name.as_str()]).await {
            Ok(_) => Ok(()),
            Err(e) if is_already(&e, "not running") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn resume(&self) -> Result<()> {
        match run_cli(&self.launcher, ["start", self.name.as_str()]).await {
            Ok(_) => Ok(()),
            Err(e) if is_already(&e, "already running") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn terminate(&self) -> Result<()> {
        self.detach();
        match run_cli(&self.launcher, ["rm", "--force", self.name.as_str()]).await {
            Ok(_) => Ok(()),
            Err(e) if is_already(&e, "no such") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn describe(&self) -> Result<SandboxDescription> {
        let status = match run_cli(&self.launcher, ["status", self.name.as_str()]).await {
            Ok(raw) => match raw.to_ascii_lowercase().as_str() {
                "running" => SandboxStatus::Running,
                "stopped" => SandboxStatus::Paused,
                "creating" => SandboxStatus::Provisioning,
                _ => SandboxStatus::Paused,
            },
            Err(e) if is_already(&e, "no such") => SandboxStatus::Terminated,
            Err(e) => return Err(e),
        };
        Ok(SandboxDescription {
            status,
            resource_tier: self.resource_tier.clone(),
            capabilities: vec!["exec".into(), "pause".into(), "resume".into()],
        })
    }
}

fn is_already(e: &Error, needle: &str) -> bool {
    matches!(e, Error::Provisioning(msg) if msg.to_ascii_lowercase().contains(needle))
}
