// ABOUTME: Subprocess line-protocol client — spawns the assistant binary in stream-json mode.
// ABOUTME: Correlates one in-flight query with its terminal result while broadcasting every event.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, Notify, broadcast, oneshot, watch};

use crate::channel::events::{QueryResponse, StreamEvent, UserEnvelope};
use crate::framing::LineFramer;

/// Options controlling how the external binary is spawned.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Binary to invoke. Overridable mostly for tests and non-standard installs.
    pub binary: String,
    /// Working directory; defaults to this process's own.
    pub working_dir: Option<PathBuf>,
    pub model: Option<String>,
    pub allowed_tools: Vec<String>,
    pub system_prompt: Option<String>,
    pub bypass_permissions: bool,
    /// Explicit session identifier to start (or resume) under.
    pub session_id: Option<String>,
    /// Resume the session named by `session_id` instead of starting it fresh.
    pub resume: bool,
    /// Raw arguments appended after all recognized flags.
    pub extra_args: Vec<String>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            working_dir: None,
            model: None,
            allowed_tools: Vec::new(),
            system_prompt: None,
            bypass_permissions: false,
            session_id: None,
            resume: false,
            extra_args: Vec::new(),
        }
    }
}

impl ChannelOptions {
    /// Command-line arguments selecting line-delimited JSON on both streams,
    /// plus whatever optional flags are configured.
    fn to_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--print".into(),
            "--input-format".into(),
            "stream-json".into(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
        ];
        if let Some(model) = &self.model {
            args.push("--model".into());
            args.push(model.clone());
        }
        if !self.allowed_tools.is_empty() {
            args.push("--allowedTools".into());
            args.push(self.allowed_tools.join(","));
        }
        if let Some(prompt) = &self.system_prompt {
            args.push("--append-system-prompt".into());
            args.push(prompt.clone());
        }
        if self.bypass_permissions {
            args.push("--dangerously-skip-permissions".into());
        }
        if let Some(id) = &self.session_id {
            args.push(if self.resume { "--resume" } else { "--session-id" }.into());
            args.push(id.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Lifecycle of a channel. `Exited` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Spawned, no output observed yet.
    Starting,
    /// Output observed, no query in flight.
    Idle,
    /// Exactly one query awaiting its terminal event.
    Busy,
    /// Process terminated; the code is `None` when killed by a signal.
    Exited(Option<i32>),
}

/// Notifications broadcast to every subscriber of a channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A valid event observed on stdout, pending request or not.
    Message(StreamEvent),
    /// A pending request resolved; the same bundle the query call returns.
    Response(QueryResponse),
    /// A line observed on stderr. Non-fatal: the process is not assumed dead.
    Stderr(String),
    Exited(Option<i32>),
}

struct PendingRequest {
    events: Vec<StreamEvent>,
    text: String,
    responder: oneshot::Sender<anyhow::Result<QueryResponse>>,
}

struct Inner {
    session_id: Option<String>,
    pending: Option<PendingRequest>,
}

/// A live request/response channel to one external assistant process.
///
/// Accepts exactly one outstanding query at a time; a second query while one
/// is pending is rejected, never queued. Callers needing concurrency run
/// multiple channels.
pub struct ProcessChannel {
    inner: Arc<Mutex<Inner>>,
    // Kept apart from `inner`: the stdout task holds `inner` per line, and a
    // stdin write must never wait on that or block it.
    stdin: Arc<Mutex<Option<tokio::process::ChildStdin>>>,
    state: watch::Sender<ChannelState>,
    events: broadcast::Sender<ChannelEvent>,
    kill: Arc<Notify>,
}

impl ProcessChannel {
    /// Spawn the external binary in streaming mode. Spawn failure surfaces
    /// here, before the channel ever reaches `Ready`.
    pub fn spawn(options: ChannelOptions) -> anyhow::Result<Self> {
        let mut cmd = Command::new(&options.binary);
        cmd.args(options.to_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", options.binary))?;
        let stdin = child.stdin.take().context("child stdin was not captured")?;
        let stdout = child.stdout.take().context("child stdout was not captured")?;
        let stderr = child.stderr.take().context("child stderr was not captured")?;

        // The session id is learned from the event stream, never assumed
        // from the flags the process was started with.
        let inner = Arc::new(Mutex::new(Inner {
            session_id: None,
            pending: None,
        }));
        let stdin = Arc::new(Mutex::new(Some(stdin)));
        let (state, _) = watch::channel(ChannelState::Starting);
        let (events, _) = broadcast::channel(256);
        let kill = Arc::new(Notify::new());

        // Stdout: frame bytes into lines, decode, correlate.
        {
            let inner = Arc::clone(&inner);
            let state = state.clone();
            let events = events.clone();
            let mut stdout = stdout;
            tokio::spawn(async move {
                let mut framer = LineFramer::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let n = match stdout.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    // First byte of output is the liveness heuristic.
                    state.send_if_modified(|s| {
                        if *s == ChannelState::Starting {
                            *s = ChannelState::Idle;
                            true
                        } else {
                            false
                        }
                    });
                    for line in framer.push(&chunk[..n]) {
                        handle_line(&inner, &state, &events, &line).await;
                    }
                }
                if let Some(last) = framer.finish() {
                    handle_line(&inner, &state, &events, &last).await;
                }
            });
        }

        // Stderr: surfaced line by line as non-fatal notifications.
        {
            let events = events.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = events.send(ChannelEvent::Stderr(line));
                }
            });
        }

        // Exit watcher: owns the child, honors kill requests, finalizes state.
        {
            let inner = Arc::clone(&inner);
            let stdin = Arc::clone(&stdin);
            let state = state.clone();
            let events = events.clone();
            let kill = Arc::clone(&kill);
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = kill.notified() => {
                        let _ = child.start_kill();
                        child.wait().await
                    }
                };
                let code = status.ok().and_then(|s| s.code());

                stdin.lock().await.take();
                let mut inner = inner.lock().await;
                // State must read Exited before the pending rejection fires.
                state.send_replace(ChannelState::Exited(code));
                if let Some(pending) = inner.pending.take() {
                    let _ = pending.responder.send(Err(exit_error(code)));
                }
                let _ = events.send(ChannelEvent::Exited(code));
            });
        }

        Ok(Self {
            inner,
            stdin,
            state,
            events,
            kill,
        })
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Session identifier learned from the event stream, updated on every
    /// event that carries one. `None` until an event names it, even when the
    /// process was started with an explicit session flag.
    pub async fn session_id(&self) -> Option<String> {
        self.inner.lock().await.session_id.clone()
    }

    /// Receive every event this channel observes from here on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Suspend until the channel has seen output (left `Starting`). Fails if
    /// the process exits first.
    pub async fn wait_ready(&self) -> anyhow::Result<()> {
        let mut rx = self.state.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ChannelState::Idle | ChannelState::Busy => return Ok(()),
                ChannelState::Exited(code) => {
                    anyhow::bail!("process exited before becoming ready ({})", code_label(code))
                }
                ChannelState::Starting => {}
            }
            rx.changed()
                .await
                .context("channel dropped before becoming ready")?;
        }
    }

    /// Issue one query and await its terminal event.
    ///
    /// Rejected synchronously, before any I/O, when the channel is not idle
    /// or the process is not running. The resolved bundle carries the latched
    /// session id, every event observed since the request was issued (in
    /// arrival order), the accumulated assistant text, and the result event.
    pub async fn query(&self, text: &str) -> anyhow::Result<QueryResponse> {
        let line = serde_json::to_string(&UserEnvelope::new(text))?;
        let rx = {
            let mut inner = self.inner.lock().await;
            match *self.state.borrow() {
                ChannelState::Busy => {
                    anyhow::bail!("a query is already pending on this channel")
                }
                ChannelState::Starting => {
                    anyhow::bail!("channel is not ready yet; no output observed")
                }
                ChannelState::Exited(code) => {
                    anyhow::bail!("process is not running ({})", code_label(code))
                }
                ChannelState::Idle => {}
            }
            let (tx, rx) = oneshot::channel();
            inner.pending = Some(PendingRequest {
                events: Vec::new(),
                text: String::new(),
                responder: tx,
            });
            self.state.send_replace(ChannelState::Busy);
            rx
        };

        // The write happens with `inner` released: the stdout task needs
        // that lock per line, and a prompt larger than the pipe buffer only
        // drains while the child's output keeps flowing.
        let written = {
            let mut stdin = self.stdin.lock().await;
            match stdin.as_mut() {
                Some(stdin) => write_request(stdin, &line).await,
                None => Err(anyhow::anyhow!("process is not running: stdin already closed")),
            }
        };
        if let Err(e) = written {
            let mut inner = self.inner.lock().await;
            // Unwind the reservation unless the exit watcher already did.
            if inner.pending.take().is_some()
                && !matches!(*self.state.borrow(), ChannelState::Exited(_))
            {
                self.state.send_replace(ChannelState::Idle);
            }
            return Err(e);
        }

        rx.await
            .context("channel closed before the response arrived")?
    }

    /// Graceful shutdown: end the input stream and wait for the process to
    /// exit on its own. Never times out by itself; callers wanting a bound
    /// impose one externally. Returns the exit code.
    pub async fn close(&self) -> anyhow::Result<Option<i32>> {
        self.stdin.lock().await.take();
        self.wait_exit().await
    }

    /// Wait for the exit transition without initiating shutdown.
    pub async fn wait_exit(&self) -> anyhow::Result<Option<i32>> {
        let mut rx = self.state.subscribe();
        loop {
            if let ChannelState::Exited(code) = *rx.borrow_and_update() {
                return Ok(code);
            }
            rx.changed().await.context("channel dropped before exit")?;
        }
    }

    /// Signal immediate termination. Does not wait for exit confirmation.
    pub fn kill(&self) {
        self.kill.notify_one();
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        self.kill.notify_one();
    }
}

/// Decode one stdout line and feed the correlation state machine. A line
/// that is not valid JSON or fails the event shape is dropped silently —
/// stdout noise is never an error here.
async fn handle_line(
    inner: &Mutex<Inner>,
    state: &watch::Sender<ChannelState>,
    events: &broadcast::Sender<ChannelEvent>,
    line: &str,
) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    let Ok(event) = serde_json::from_str::<StreamEvent>(trimmed) else {
        return;
    };

    let mut inner = inner.lock().await;
    if let Some(sid) = &event.session_id {
        inner.session_id = Some(sid.clone());
    }
    let _ = events.send(ChannelEvent::Message(event.clone()));

    if let Some(pending) = inner.pending.as_mut() {
        pending.events.push(event.clone());
        if let Some(text) = event.assistant_text() {
            pending.text.push_str(&text);
        }
    }
    if event.is_result() {
        if let Some(pending) = inner.pending.take() {
            let response = QueryResponse {
                session_id: inner.session_id.clone(),
                events: pending.events,
                text: pending.text,
                result: event,
            };
            state.send_replace(ChannelState::Idle);
            let _ = pending.responder.send(Ok(response.clone()));
            let _ = events.send(ChannelEvent::Response(response));
        }
    }
}

async fn write_request(
    stdin: &mut tokio::process::ChildStdin,
    line: &str,
) -> anyhow::Result<()> {
    stdin
        .write_all(line.as_bytes())
        .await
        .context("failed to write request to process stdin")?;
    stdin
        .write_all(b"\n")
        .await
        .context("failed to write request to process stdin")?;
    stdin.flush().await.context("failed to flush process stdin")?;
    Ok(())
}

fn exit_error(code: Option<i32>) -> anyhow::Error {
    anyhow::anyhow!("process exited ({}) while a request was pending", code_label(code))
}

fn code_label(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "terminated by signal".to_string(),
    }
}
