//! In-process mock provider.
//!
//! Used for chat sessions and tests. Lifecycle operations are instant and
//! the channel is an in-memory queue pair driven by a small echo agent:
//! prompts produce an `agent_message` + `agent_end`, correlated commands
//! get a `response` with the same tag.

use parking_lot::Mutex;
use serde_json::json;

use ar_domain::error::Result;

use crate::channel::{AgentEnd, Inbound, SandboxChannel};
use crate::providers::{SandboxDescription, SandboxStatus};

pub struct MockSandbox {
    id: String,
    status: Mutex<SandboxStatus>,
    channel: Mutex<Option<SandboxChannel>>,
}

impl MockSandbox {
    pub fn create(session_id: &str) -> Self {
        Self {
            id: format!("mock-{session_id}"),
            status: Mutex::new(SandboxStatus::Running),
            channel: Mutex::new(None),
        }
    }

    /// Rebuild from a persisted provider id (relay restart). Mock sandboxes
    /// hold no external state, so this is just a fresh running instance.
    pub fn from_id(provider_id: &str) -> Self {
        Self {
            id: provider_id.to_string(),
            status: Mutex::new(SandboxStatus::Running),
            channel: Mutex::new(None),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.id
    }

    pub async fn attach(&self) -> Result<SandboxChannel> {
        let (channel, agent) = SandboxChannel::pair();
        tokio::spawn(run_echo_agent(agent));
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
        *self.status.lock() = SandboxStatus::Paused;
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        *self.status.lock() = SandboxStatus::Running;
        Ok(())
    }

    pub async fn terminate(&self) -> Result<()> {
        self.detach();
        *self.status.lock() = SandboxStatus::Terminated;
        Ok(())
    }

    pub async fn describe(&self) -> Result<SandboxDescription> {
        Ok(SandboxDescription {
            status: *self.status.lock(),
            resource_tier: None,
            capabilities: vec!["echo".into()],
        })
    }
}

/// Minimal agent: echoes prompts, acknowledges correlated commands.
async fn run_echo_agent(mut agent: AgentEnd) {
    while let Some(cmd) = agent.commands.recv().await {
        if let Some(tag) = ar_protocol::command_tag(&cmd) {
            let reply = json!({
                "type": "response",
                "command": tag,
                "ok": true,
            });
            if agent.events.send(Inbound::Message(reply)).await.is_err() {
                return;
            }
            continue;
        }

        if ar_protocol::message_type(&cmd) == Some("prompt") {
            let text = cmd
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or_default();
            let events = [
                json!({"type": "agent_message", "message": format!("echo: {text}")}),
                json!({"type": "agent_end"}),
            ];
            for event in events {
                if agent.events.send(Inbound::Message(event)).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prompt_produces_message_then_end() {
        let sandbox = MockSandbox::create("s1");
        let channel = sandbox.attach().await.unwrap();

        channel
            .send(&json!({"type": "prompt", "message": "hello"}))
            .await
            .unwrap();

        let first = channel.receive().await.unwrap();
        let second = channel.receive().await.unwrap();
        match (first, second) {
            (Inbound::Message(a), Inbound::Message(b)) => {
                assert_eq!(a["type"], "agent_message");
                assert_eq!(a["message"], "echo: hello");
                assert_eq!(b["type"], "agent_end");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn correlated_command_gets_response_only() {
        let sandbox = MockSandbox::create("s1");
        let channel = sandbox.attach().await.unwrap();

        channel
            .send(&json!({"type": "set_model", "command": "c-1", "model": "opus"}))
            .await
            .unwrap();

        match channel.receive().await.unwrap() {
            Inbound::Message(v) => {
                assert_eq!(v["type"], "response");
                assert_eq!(v["command"], "c-1");
                assert_eq!(v["ok"], true);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pause_is_idempotent() {
        let sandbox = MockSandbox::create("s1");
        sandbox.pause().await.unwrap();
        sandbox.pause().await.unwrap();
        assert_eq!(
            sandbox.describe().await.unwrap().status,
            SandboxStatus::Paused
        );
        sandbox.resume().await.unwrap();
        assert_eq!(
            sandbox.describe().await.unwrap().status,
            SandboxStatus::Running
        );
    }

    #[tokio::test]
    async fn terminate_closes_channel() {
        let sandbox = MockSandbox::create("s1");
        let channel = sandbox.attach().await.unwrap();
        sandbox.terminate().await.unwrap();
        assert!(channel.is_closed());
        assert_eq!(
            sandbox.describe().await.unwrap().status,
            SandboxStatus::Terminated
        );
    }
}
