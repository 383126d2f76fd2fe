//! The session hub: owns exactly one sandbox channel (absent while idle or
//! detached) and fans events out to every connected client.
//!
//! Contracts, in order of importance:
//! - every ordinary agent event is journaled *before* fan-out, so anything a
//!   client has seen is also queryable through the replay endpoint;
//! - each client observes strictly ascending seq values with no gaps;
//! - correlated replies (carrying a `command` tag) go only to the client
//!   that issued the command, and are not journaled;
//! - a slow client is disconnected when its bounded queue overflows; other
//!   clients are unaffected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ar_domain::config::Config;
use ar_domain::error::{Error, Result};
use ar_domain::session::{EnvironmentConfig, Session, SessionStatus};
use ar_protocol::ServerFrame;
use ar_sandbox::providers::SandboxStatus;
use ar_sandbox::{CreateSandboxOptions, Inbound, SandboxChannel, SandboxManager};
use ar_store::Store;

/// Outbound frames buffered per client before overflow disconnects it.
const CLIENT_QUEUE_CAPACITY: usize = 256;
/// Commands buffered in the writer FIFO.
const WRITER_QUEUE_CAPACITY: usize = 256;
/// Activity writes are coalesced within this window.
const ACTIVITY_DEBOUNCE: Duration = Duration::from_secs(5);

pub struct ActivateInfo {
    pub session_id: String,
    pub status: SessionStatus,
    pub last_seq: i64,
    pub sandbox_status: Option<SandboxStatus>,
}

/// What a freshly attached client needs to replay: events in
/// `(after, upto]`, then live frames from its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayPlan {
    pub after: i64,
    pub upto: i64,
}

impl ReplayPlan {
    pub fn is_needed(&self) -> bool {
        self.after < self.upto
    }
}

struct ClientHandle {
    tx: mpsc::Sender<Value>,
    /// Highest event seq already queued; fan-out skips anything at or
    /// below this, which is what makes replay handoff gapless and
    /// duplicate-free.
    last_event_seq: i64,
}

struct Attachment {
    channel: SandboxChannel,
    token: CancellationToken,
    writer: Option<JoinHandle<()>>,
}

pub struct SessionHub {
    session_id: String,
    store: Arc<Store>,
    manager: Arc<SandboxManager>,
    config: Arc<Config>,

    /// Serializes attach/detach; held across provider awaits.
    attachment: tokio::sync::Mutex<Option<Attachment>>,
    writer_tx: Mutex<Option<mpsc::Sender<Value>>>,
    clients: Mutex<HashMap<u64, ClientHandle>>,
    next_client_id: AtomicU64,
    /// Correlation map: command tag → originating client.
    pending: Mutex<HashMap<String, u64>>,
    last_client_gone: Mutex<Option<DateTime<Utc>>>,
    last_activity_flush: Mutex<Option<Instant>>,
}

impl SessionHub {
    pub fn new(
        session_id: String,
        store: Arc<Store>,
        manager: Arc<SandboxManager>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            session_id,
            store,
            manager,
            config,
            attachment: tokio::sync::Mutex::new(None),
            writer_tx: Mutex::new(None),
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            last_client_gone: Mutex::new(None),
            last_activity_flush: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// When the last client disconnected, if none are connected now.
    pub fn last_client_gone_at(&self) -> Option<DateTime<Utc>> {
        *self.last_client_gone.lock()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Activation / sandbox lifecycle
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Ensure the session has a running, attached sandbox. Idempotent:
    /// an already-attached hub just reports its current position.
    pub async fn activate(self: &Arc<Self>) -> Result<ActivateInfo> {
        let session = self.store.get_session(&self.session_id)?;
        if session.status == SessionStatus::Archived {
            return Err(Error::Conflict(format!(
                "session {} is archived",
                self.session_id
            )));
        }

        let mut attachment = self.attachment.lock().await;

        if let Some(att) = attachment.as_ref() {
            if !att.channel.is_closed() {
                return self.activate_info(SessionStatus::Active, None).await;
            }
            // Stale attachment from a dead channel.
            att.token.cancel();
            *attachment = None;
            *self.writer_tx.lock() = None;
        }

        let env_cfg = session
            .environment_id
            .as_deref()
            .and_then(|id| self.store.get_environment(id).ok());

        let handle = match self.ensure_sandbox(&session, env_cfg.as_ref()).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(session_id = %self.session_id, error = %e, "sandbox provisioning failed");
                let _ = self
                    .store
                    .update_session_status(&self.session_id, SessionStatus::Error);
                return Err(e);
            }
        };
        self.store.set_session_sandbox(
            &self.session_id,
            Some(handle.provider_type()),
            Some(handle.provider_id()),
        )?;

        let channel = match handle.attach().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = self
                    .store
                    .update_session_status(&self.session_id, SessionStatus::Error);
                return Err(e);
            }
        };

        let token = CancellationToken::new();
        let (writer_tx, writer_rx) = mpsc::channel::<Value>(WRITER_QUEUE_CAPACITY);
        *self.writer_tx.lock() = Some(writer_tx);

        let writer = tokio::spawn(writer_task(
            self.clone(),
            channel.clone(),
            writer_rx,
            token.clone(),
        ));
        tokio::spawn(reader_task(self.clone(), channel.clone(), token.clone()));

        *attachment = Some(Attachment {
            channel,
            token,
            writer: Some(writer),
        });
        drop(attachment);

        self.store
            .update_session_status(&self.session_id, SessionStatus::Active)?;
        tracing::info!(session_id = %self.session_id, "session active");

        let sandbox_status = handle.describe().await.ok().map(|d| d.status);
        self.activate_info(SessionStatus::Active, sandbox_status)
            .await
    }

    async fn activate_info(
        &self,
        status: SessionStatus,
        sandbox_status: Option<SandboxStatus>,
    ) -> Result<ActivateInfo> {
        Ok(ActivateInfo {
            session_id: self.session_id.clone(),
            status,
            last_seq: self.store.last_seq(&self.session_id)?,
            sandbox_status,
        })
    }

    /// Reuse a live handle, resume a persisted sandbox, or create afresh.
    async fn ensure_sandbox(
        &self,
        session: &Session,
        env_cfg: Option<&EnvironmentConfig>,
    ) -> Result<Arc<ar_sandbox::SandboxHandle>> {
        if let Some(handle) = self.manager.handle_for(&self.session_id) {
            if let Ok(desc) = handle.describe().await {
                match desc.status {
                    SandboxStatus::Running => return Ok(handle),
                    SandboxStatus::Paused => {
                        handle.resume().await?;
                        return Ok(handle);
                    }
                    _ => {}
                }
            }
        }

        if session.sandbox_id.is_some() {
            match self.manager.resume_session(session, env_cfg).await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        error = %e,
                        "resume failed, creating a fresh sandbox"
                    );
                }
            }
        }

        let opts = CreateSandboxOptions {
            session_id: self.session_id.clone(),
            repository_url: session.repository_url.clone(),
            repository_branch: session.repository_branch.clone(),
            startup_timeout: Some(Duration::from_secs(
                self.config.sandbox.startup_timeout_sec,
            )),
            ..Default::default()
        };
        self.manager
            .create_for_session(session, env_cfg, opts)
            .await
    }

    /// Quiet detach: close the channel without marking the session failed.
    /// Used by the reaper before pausing and by archive/shutdown.
    pub async fn detach_channel(&self) {
        let mut attachment = self.attachment.lock().await;
        if let Some(att) = attachment.take() {
            att.token.cancel();
            att.channel.close();
        }
        *self.writer_tx.lock() = None;
    }

    /// Archive/delete path: detach and drop every client.
    pub async fn shutdown(&self) {
        self.detach_channel().await;
        self.clients.lock().clear();
        self.pending.lock().clear();
    }

    /// Relay shutdown: stop accepting commands, give the writer a moment to
    /// drain, then close everything.
    pub async fn graceful_shutdown(&self, drain: Duration) {
        *self.writer_tx.lock() = None;
        let writer = self
            .attachment
            .lock()
            .await
            .as_mut()
            .and_then(|att| att.writer.take());
        if let Some(writer) = writer {
            let _ = tokio::time::timeout(drain, writer).await;
        }
        self.shutdown().await;
    }

    /// Channel died or the journal failed: mark the session, tell every
    /// client once, detach. Clients stay connected and may re-activate.
    async fn fail_attachment(&self, message: String) {
        let mut attachment = self.attachment.lock().await;
        let Some(att) = attachment.take() else {
            return; // already detached; failure was handled
        };
        att.token.cancel();
        att.channel.close();
        *self.writer_tx.lock() = None;
        drop(attachment);

        tracing::error!(session_id = %self.session_id, %message, "sandbox attachment failed");
        if let Err(e) = self
            .store
            .update_session_status(&self.session_id, SessionStatus::Error)
        {
            tracing::warn!(session_id = %self.session_id, error = %e, "failed to mark session error");
        }
        self.broadcast_control(&ServerFrame::Error { message });
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Clients
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Register a client. Returns its id, its outbound queue, and the
    /// replay window it must fetch from the journal. Live events with
    /// `seq > plan.upto` start accumulating in the queue immediately, so
    /// replay followed by the queue is gapless and duplicate-free.
    pub fn attach_client(&self, client_last_seq: i64) -> Result<(u64, mpsc::Receiver<Value>, ReplayPlan)> {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);

        let mut clients = self.clients.lock();
        // Reading the journal position under the clients lock pins it
        // against concurrent fan-out: nothing can be fanned out between
        // this read and the registration below.
        let current = self.store.last_seq(&self.session_id)?;
        clients.insert(
            client_id,
            ClientHandle {
                tx,
                last_event_seq: current,
            },
        );
        drop(clients);

        tracing::debug!(session_id = %self.session_id, client_id, last_seq = current, "client attached");
        Ok((
            client_id,
            rx,
            ReplayPlan {
                after: client_last_seq.min(current),
                upto: current,
            },
        ))
    }

    pub fn detach_client(&self, client_id: u64) {
        let mut clients = self.clients.lock();
        if clients.remove(&client_id).is_some() && clients.is_empty() {
            *self.last_client_gone.lock() = Some(Utc::now());
        }
        drop(clients);
        self.pending.lock().retain(|_, owner| *owner != client_id);
        tracing::debug!(session_id = %self.session_id, client_id, "client detached");
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Forward a client command to the agent, in FIFO order. Correlated
    /// commands are remembered so the reply can be steered back.
    pub async fn submit_command(&self, client_id: u64, command: Value) -> Result<()> {
        let tx = self
            .writer_tx
            .lock()
            .clone()
            .ok_or(Error::ChannelClosed)?;

        let tag = ar_protocol::command_tag(&command).map(str::to_string);
        if let Some(tag) = &tag {
            self.pending.lock().insert(tag.clone(), client_id);
        }

        if tx.send(command).await.is_err() {
            if let Some(tag) = &tag {
                self.pending.lock().remove(tag);
            }
            return Err(Error::ChannelClosed);
        }
        self.touch_activity();
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Agent messages
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn handle_agent_message(&self, msg: Value) {
        // Correlated reply: steer to the originating client, skip journal.
        if let Some(tag) = ar_protocol::command_tag(&msg) {
            let target = self.pending.lock().remove(tag);
            match target {
                Some(client_id) => {
                    self.send_to_client(client_id, ar_protocol::response_frame(&msg));
                }
                None => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        command = %tag,
                        "reply for unknown command, dropping"
                    );
                }
            }
            return;
        }

        let event_type = ar_protocol::message_type(&msg).unwrap_or("event").to_string();
        let seq = match self.append_with_retry(&event_type, &msg) {
            Ok(seq) => seq,
            Err(e) => {
                // Data-integrity failure: never hide it.
                self.fail_attachment(format!("journal append failed: {e}"))
                    .await;
                return;
            }
        };
        self.touch_activity();
        self.fan_out(seq, ar_protocol::event_frame(&msg, seq));
    }

    /// One retry on a seq race, per the journal's conflict contract.
    fn append_with_retry(&self, event_type: &str, msg: &Value) -> Result<i64> {
        match self.store.append_event(&self.session_id, event_type, msg) {
            Err(Error::Conflict(_)) => {
                tracing::warn!(session_id = %self.session_id, "journal seq conflict, retrying");
                self.store.append_event(&self.session_id, event_type, msg)
            }
            other => other,
        }
        .map_err(|e| Error::Journal(e.to_string()))
    }

    /// Deliver an event frame to every connected client. A client whose
    /// queue is full is disconnected; the rest are unaffected.
    fn fan_out(&self, seq: i64, frame: Value) {
        let mut dropped = Vec::new();
        {
            let mut clients = self.clients.lock();
            for (id, client) in clients.iter_mut() {
                if seq <= client.last_event_seq {
                    continue;
                }
                match client.tx.try_send(frame.clone()) {
                    Ok(()) => client.last_event_seq = seq,
                    Err(_) => dropped.push(*id),
                }
            }
            for id in &dropped {
                clients.remove(id);
            }
            if !dropped.is_empty() && clients.is_empty() {
                *self.last_client_gone.lock() = Some(Utc::now());
            }
        }
        for id in dropped {
            tracing::warn!(
                session_id = %self.session_id,
                client_id = id,
                "client dropped (queue overflow or socket gone)"
            );
        }
    }

    fn send_to_client(&self, client_id: u64, frame: Value) {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&client_id) {
            if client.tx.try_send(frame).is_err() {
                clients.remove(&client_id);
                tracing::warn!(
                    session_id = %self.session_id,
                    client_id,
                    "client dropped while routing response"
                );
            }
        }
    }

    fn broadcast_control(&self, frame: &ServerFrame) {
        let value = frame.to_value();
        let mut clients = self.clients.lock();
        clients.retain(|_, client| client.tx.try_send(value.clone()).is_ok());
    }

    /// Best-effort, debounced `last_activity_at` write.
    fn touch_activity(&self) {
        {
            let mut last = self.last_activity_flush.lock();
            if let Some(prev) = *last {
                if prev.elapsed() < ACTIVITY_DEBOUNCE {
                    return;
                }
            }
            *last = Some(Instant::now());
        }
        if let Err(e) = self
            .store
            .touch_session_activity(&self.session_id, Utc::now())
        {
            tracing::warn!(session_id = %self.session_id, error = %e, "activity touch failed");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reader / writer tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn reader_task(hub: Arc<SessionHub>, channel: SandboxChannel, token: CancellationToken) {
    loop {
        let item = tokio::select! {
            _ = token.cancelled() => break,
            item = channel.receive() => item,
        };
        match item {
            Some(Inbound::Message(msg)) => hub.handle_agent_message(msg).await,
            Some(Inbound::ParseError { line }) => {
                tracing::warn!(
                    session_id = %hub.session_id,
                    line_len = line.len(),
                    "agent emitted an unparseable line, channel stays open"
                );
            }
            None => {
                if !token.is_cancelled() {
                    hub.fail_attachment("sandbox channel closed unexpectedly".into())
                        .await;
                }
                break;
            }
        }
    }
}

async fn writer_task(
    hub: Arc<SessionHub>,
    channel: SandboxChannel,
    mut rx: mpsc::Receiver<Value>,
    token: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = token.cancelled() => break,
            command = rx.recv() => match command {
                Some(c) => c,
                None => break,
            },
        };
        if channel.send(&command).await.is_err() {
            if !token.is_cancelled() {
                hub.fail_attachment("sandbox channel rejected a command".into())
                    .await;
            }
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ar_domain::session::SessionMode;
    use serde_json::json;

    fn make_state() -> (Arc<Store>, Arc<SandboxManager>, Arc<Config>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let manager = Arc::new(SandboxManager::new(
            ar_domain::config::SandboxConfig::default(),
            dir.path().to_path_buf(),
        ));
        let config = Arc::new(Config::default());
        (store, manager, config, dir)
    }

    fn seed_session(store: &Store, id: &str) {
        let now = Utc::now();
        store
            .create_session(&Session {
                id: id.into(),
                mode: SessionMode::Chat,
                status: SessionStatus::Creating,
                repository_url: None,
                repository_branch: None,
                workspace_path: None,
                last_activity_at: now,
                sandbox_type: None,
                sandbox_id: None,
                data_dir: format!("/tmp/{id}"),
                environment_id: None,
                created_at: now,
                updated_at: now,
            })
            .unwrap();
    }

    fn make_hub(id: &str) -> (Arc<SessionHub>, Arc<Store>, tempfile::TempDir) {
        let (store, manager, config, dir) = make_state();
        seed_session(&store, id);
        let hub = Arc::new(SessionHub::new(
            id.to_string(),
            store.clone(),
            manager,
            config,
        ));
        (hub, store, dir)
    }

    async fn recv_event(rx: &mut mpsc::Receiver<Value>) -> Value {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("queue closed")
    }

    #[tokio::test]
    async fn activate_then_prompt_journals_and_fans_out() {
        let (hub, store, _dir) = make_hub("s1");
        let info = hub.activate().await.unwrap();
        assert_eq!(info.status, SessionStatus::Active);
        assert_eq!(info.last_seq, 0);
        assert_eq!(store.get_session("s1").unwrap().status, SessionStatus::Active);

        let (client_id, mut rx, plan) = hub.attach_client(0).unwrap();
        assert!(!plan.is_needed());

        hub.submit_command(client_id, json!({"type": "prompt", "message": "hi"}))
            .await
            .unwrap();

        let first = recv_event(&mut rx).await;
        let second = recv_event(&mut rx).await;
        assert_eq!(first["type"], "agent_message");
        assert_eq!(first["seq"], 1);
        assert_eq!(second["type"], "agent_end");
        assert_eq!(second["seq"], 2);

        // Journal-before-fan-out: both events are already queryable.
        let (events, last) = store.events_after("s1", 0, 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(last, 2);
    }

    #[tokio::test]
    async fn activate_is_idempotent() {
        let (hub, _store, _dir) = make_hub("s1");
        hub.activate().await.unwrap();
        let info = hub.activate().await.unwrap();
        assert_eq!(info.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn archived_session_cannot_activate() {
        let (hub, store, _dir) = make_hub("s1");
        store
            .update_session_status("s1", SessionStatus::Archived)
            .unwrap();
        assert!(matches!(
            hub.activate().await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn correlated_reply_reaches_only_the_origin_client() {
        let (hub, _store, _dir) = make_hub("s1");
        hub.activate().await.unwrap();

        let (origin, mut origin_rx, _) = hub.attach_client(0).unwrap();
        let (_other, mut other_rx, _) = hub.attach_client(0).unwrap();

        hub.submit_command(origin, json!({"type": "set_model", "command": "c-1"}))
            .await
            .unwrap();

        let reply = recv_event(&mut origin_rx).await;
        assert_eq!(reply["type"], "response");
        assert_eq!(reply["command"], "c-1");

        // The other client sees nothing, and nothing was journaled.
        assert!(
            tokio::time::timeout(Duration::from_millis(200), other_rx.recv())
                .await
                .is_err()
        );
        assert_eq!(hub.store.last_seq("s1").unwrap(), 0);
    }

    #[tokio::test]
    async fn late_client_gets_replay_plan_and_live_events() {
        let (hub, store, _dir) = make_hub("s1");
        hub.activate().await.unwrap();

        let (first, mut first_rx, _) = hub.attach_client(0).unwrap();
        hub.submit_command(first, json!({"type": "prompt", "message": "one"}))
            .await
            .unwrap();
        recv_event(&mut first_rx).await;
        recv_event(&mut first_rx).await;

        // Late joiner with lastSeq=0: replay covers (0, 2].
        let (_late, mut late_rx, plan) = hub.attach_client(0).unwrap();
        assert_eq!(plan, ReplayPlan { after: 0, upto: 2 });
        assert!(plan.is_needed());
        let (replayed, _) = store.events_after("s1", plan.after, 100).unwrap();
        assert_eq!(replayed.len(), 2);

        // Live events continue after the replay tail.
        hub.submit_command(first, json!({"type": "prompt", "message": "two"}))
            .await
            .unwrap();
        let live = recv_event(&mut late_rx).await;
        assert_eq!(live["seq"], 3);
    }

    #[tokio::test]
    async fn channel_failure_marks_error_and_notifies_clients() {
        let (hub, store, _dir) = make_hub("s1");
        hub.activate().await.unwrap();
        let (_client, mut rx, _) = hub.attach_client(0).unwrap();

        // Kill the sandbox out from under the hub.
        hub.manager
            .handle_for("s1")
            .unwrap()
            .terminate()
            .await
            .unwrap();

        let frame = recv_event(&mut rx).await;
        assert_eq!(frame["type"], "error");
        assert_eq!(
            store.get_session("s1").unwrap().status,
            SessionStatus::Error
        );

        // Activation rebuilds the sandbox; journal position is preserved.
        let info = hub.activate().await.unwrap();
        assert_eq!(info.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn slow_client_is_dropped_others_survive() {
        let (hub, _store, _dir) = make_hub("s1");
        hub.activate().await.unwrap();

        let (_slow, slow_rx, _) = hub.attach_client(0).unwrap();
        let (_ok, mut ok_rx, _) = hub.attach_client(0).unwrap();

        // The healthy client keeps draining; the slow one never does and
        // overflows its bounded queue.
        let mut prev = 0;
        for i in 0..(CLIENT_QUEUE_CAPACITY as i64 + 8) {
            hub.fan_out(i + 1, json!({"type": "agent_message", "seq": i + 1}));
            if let Ok(Some(frame)) =
                tokio::time::timeout(Duration::from_millis(100), ok_rx.recv()).await
            {
                let seq = frame["seq"].as_i64().unwrap();
                assert!(seq > prev);
                prev = seq;
            }
        }
        assert_eq!(hub.client_count(), 1);
        assert!(prev > 0);
        drop(slow_rx);
    }

    #[tokio::test]
    async fn detach_channel_is_quiet() {
        let (hub, store, _dir) = make_hub("s1");
        hub.activate().await.unwrap();
        let (_client, mut rx, _) = hub.attach_client(0).unwrap();

        hub.detach_channel().await;
        // No error frame, no error status.
        assert!(
            tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .is_err()
        );
        assert_eq!(
            store.get_session("s1").unwrap().status,
            SessionStatus::Active
        );
        // Commands now fail until re-activation.
        let err = hub
            .submit_command(1, json!({"type": "prompt"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelClosed));
    }

    #[tokio::test]
    async fn detach_client_records_last_gone() {
        let (hub, _store, _dir) = make_hub("s1");
        let (a, _rx_a, _) = hub.attach_client(0).unwrap();
        let (b, _rx_b, _) = hub.attach_client(0).unwrap();
        hub.detach_client(a);
        assert!(hub.last_client_gone_at().is_none());
        hub.detach_client(b);
        assert!(hub.last_client_gone_at().is_some());
    }
}
