//! UDP session with one X32 console.
//!
//! Architecture: reactor pattern to avoid lock contention.
//! - The socket is owned by a dedicated reactor task
//! - Requests flow through an mpsc channel
//! - Replies are routed via oneshot channels keyed by OSC address
//!
//! The console carries no correlation id on the wire; a reply echoes the
//! address it answers. The reactor therefore keeps one FIFO queue per
//! address: the front entry is on the wire, successors are sent only when
//! the front resolves. Two concurrent requests for one address are never
//! in flight together.
//!
//! Liveness follows the console's chatty nature: any received datagram
//! proves the peer is alive. Silence past the idle window drops the state
//! back to `connecting` and re-sends the `/xinfo` probe; too many
//! unanswered probes mark the session `failed`.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::broadcast::{Broadcast, SceneLoadSource};
use crate::osc::{self, OscValue};

/// Identity probe address; the console answers with four strings.
pub const IDENTITY_ADDRESS: &str = "/xinfo";

/// Current-scene pointer; also emitted spontaneously on recall.
pub const CURRENT_SCENE_ADDRESS: &str = "/-show/prepos/current";

/// Scene recall command; one i32 slot index argument.
pub const RECALL_ADDRESS: &str = "/-action/goscene";

/// The console's fixed OSC port.
pub const DEFAULT_CONSOLE_PORT: u16 = 10023;

/// Hard bound on queued requests per address; a flood backstop, not a
/// scheduling mechanism (the sweep engine paces itself well below this).
const MAX_QUEUE_DEPTH: usize = 64;

/// Connection state as observed by the event bus.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Failed = 3,
    /// Session is talking to the in-process emulator.
    Mock = 4,
}

impl ConnectionState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Failed,
            4 => ConnectionState::Mock,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Mock => "mock",
        }
    }

    /// True when the peer is answering (real or emulated).
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Mock)
    }
}

/// Shared state machine handle; readable from any worker without locking.
#[derive(Debug)]
pub struct StateTracker {
    state: AtomicU8,
    probe_failures: AtomicU32,
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            probe_failures: AtomicU32::new(0),
        }
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn set(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn record_probe_failure(&self) -> u32 {
        self.probe_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_failures(&self) {
        self.probe_failures.store(0, Ordering::Relaxed);
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// The `/xinfo` reply: `(ip, name, model, firmware)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleIdentity {
    pub ip: String,
    pub name: String,
    pub model: String,
    pub firmware: String,
}

impl ConsoleIdentity {
    pub fn from_args(args: &[OscValue]) -> Option<Self> {
        let mut strings = args.iter().filter_map(OscValue::as_str);
        Some(Self {
            ip: strings.next()?.to_string(),
            name: strings.next()?.to_string(),
            model: strings.next()?.to_string(),
            firmware: strings.next()?.to_string(),
        })
    }

    /// Leading component of the firmware string, e.g. `4` for `"4.08"`.
    pub fn firmware_major(&self) -> Option<u32> {
        self.firmware.split('.').next()?.parse().ok()
    }
}

/// Configuration for one console session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name prefix for logging.
    pub name: String,
    pub console_ip: String,
    pub console_port: u16,
    /// Local bind port; 0 picks an ephemeral port.
    pub local_port: u16,
    /// Silence longer than this drops back to `connecting`.
    pub idle_window: Duration,
    /// Window for one `/xinfo` probe to be answered.
    pub probe_timeout: Duration,
    /// Consecutive unanswered probes before `failed`.
    pub max_probe_failures: u32,
    /// Report `mock` instead of `connected` once the peer answers.
    pub mock: bool,
}

impl SessionConfig {
    pub fn new(name: &str, console_ip: &str) -> Self {
        Self {
            name: name.to_string(),
            console_ip: console_ip.to_string(),
            console_port: DEFAULT_CONSOLE_PORT,
            local_port: 0,
            idle_window: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            max_probe_failures: 5,
            mock: false,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.console_port = port;
        self
    }

    pub fn with_idle_window(mut self, window: Duration) -> Self {
        self.idle_window = window;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_mock(mut self, mock: bool) -> Self {
        self.mock = mock;
        self
    }
}

/// Session-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to bind UDP socket: {0}")]
    Bind(#[source] std::io::Error),
    #[error("invalid console address: {0}")]
    Address(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("too many queued requests for {0}")]
    Busy(String),
}

impl SessionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout(_))
    }
}

/// Command sent to the reactor task.
enum ReactorCommand {
    /// Query expecting a reply on the same address.
    Request {
        address: String,
        args: Vec<OscValue>,
        timeout: Duration,
        reply_tx: oneshot::Sender<Result<Vec<OscValue>, SessionError>>,
    },
    /// Fire-and-forget set; ack reports only the local send result.
    Command {
        address: String,
        args: Vec<OscValue>,
        ack_tx: oneshot::Sender<Result<(), SessionError>>,
    },
    Shutdown,
}

/// A request waiting for its reply. Only the queue front is on the wire;
/// `deadline` is armed at send time.
struct Waiter {
    payload: Bytes,
    timeout: Duration,
    deadline: Option<Instant>,
    reply_tx: oneshot::Sender<Result<Vec<OscValue>, SessionError>>,
}

type PendingTable = HashMap<String, VecDeque<Waiter>>;

/// Live session handle. Cheap to clone via `Arc`; dropping the last handle
/// does not stop the reactor — call [`X32Session::close`] for that.
pub struct X32Session {
    config: SessionConfig,
    cmd_tx: mpsc::Sender<ReactorCommand>,
    state: Arc<StateTracker>,
    identity: Arc<RwLock<Option<ConsoleIdentity>>>,
    events: broadcast::Sender<Broadcast>,
}

impl X32Session {
    /// Bind the local socket and spawn the reactor.
    ///
    /// The console does not need to be reachable yet; the state machine
    /// starts in `connecting` and keeps probing.
    pub async fn connect(
        config: SessionConfig,
        events: broadcast::Sender<Broadcast>,
    ) -> Result<Arc<Self>, SessionError> {
        let target: SocketAddr = format!("{}:{}", config.console_ip, config.console_port)
            .parse()
            .map_err(|_| {
                SessionError::Address(format!(
                    "{}:{}",
                    config.console_ip, config.console_port
                ))
            })?;

        let socket = UdpSocket::bind(("0.0.0.0", config.local_port))
            .await
            .map_err(SessionError::Bind)?;
        socket.connect(target).await.map_err(SessionError::Bind)?;

        info!(
            "{}: session socket bound, console at {}",
            config.name, target
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let state = Arc::new(StateTracker::new());
        let identity = Arc::new(RwLock::new(None));

        tokio::spawn(reactor_task(
            socket,
            cmd_rx,
            state.clone(),
            identity.clone(),
            events.clone(),
            config.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            cmd_tx,
            state,
            identity,
            events,
        }))
    }

    /// Send a query and wait for the matching reply.
    ///
    /// Queue policy: a second request for an address with one outstanding
    /// serializes behind it. [`SessionError::Busy`] is returned only when
    /// the per-address queue is full.
    pub async fn request(
        &self,
        address: &str,
        args: Vec<OscValue>,
        timeout: Duration,
    ) -> Result<Vec<OscValue>, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ReactorCommand::Request {
                address: address.to_string(),
                args,
                timeout,
                reply_tx,
            })
            .await
            .map_err(|_| SessionError::Transport("session closed".into()))?;
        reply_rx
            .await
            .map_err(|_| SessionError::Transport("session closed".into()))?
    }

    /// Send a set command. No console reply is expected; the result covers
    /// only the local send.
    pub async fn command(&self, address: &str, args: Vec<OscValue>) -> Result<(), SessionError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(ReactorCommand::Command {
                address: address.to_string(),
                args,
                ack_tx,
            })
            .await
            .map_err(|_| SessionError::Transport("session closed".into()))?;
        ack_rx
            .await
            .map_err(|_| SessionError::Transport("session closed".into()))?
    }

    /// Fresh `/xinfo` round trip.
    pub async fn identity_query(
        &self,
        timeout: Duration,
    ) -> Result<ConsoleIdentity, SessionError> {
        let args = self.request(IDENTITY_ADDRESS, Vec::new(), timeout).await?;
        ConsoleIdentity::from_args(&args)
            .ok_or_else(|| SessionError::Transport("malformed /xinfo reply".into()))
    }

    /// Last identity seen on the wire, if any.
    pub async fn identity(&self) -> Option<ConsoleIdentity> {
        self.identity.read().await.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn events(&self) -> broadcast::Sender<Broadcast> {
        self.events.clone()
    }

    /// Stop the reactor; all pending requests fail with a transport error.
    /// Idempotent.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(ReactorCommand::Shutdown).await;
    }
}

/// The reactor task: owns the socket, handles all I/O.
async fn reactor_task(
    socket: UdpSocket,
    mut cmd_rx: mpsc::Receiver<ReactorCommand>,
    state: Arc<StateTracker>,
    identity: Arc<RwLock<Option<ConsoleIdentity>>>,
    events: broadcast::Sender<Broadcast>,
    cfg: SessionConfig,
) {
    let name = cfg.name.clone();
    let probe = osc::encode(IDENTITY_ADDRESS, &[]);
    let mut pending: PendingTable = HashMap::new();
    let mut last_rx: Option<Instant> = None;
    let mut probe_deadline: Option<Instant> = None;
    let mut buf = vec![0u8; 65536];

    debug!("{}: reactor task started", name);

    set_state(&state, &events, ConnectionState::Connecting, &name);
    if let Err(e) = socket.send(&probe).await {
        debug!("{}: initial probe send failed: {}", name, e);
    }
    probe_deadline = Some(Instant::now() + cfg.probe_timeout);

    loop {
        let wakeup = next_wakeup(&pending, probe_deadline, last_rx, &cfg, state.get());

        tokio::select! {
            // Bias towards caller commands to avoid starvation under
            // heavy reply traffic.
            biased;

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ReactorCommand::Request { address, args, timeout, reply_tx }) => {
                        handle_request(&socket, &name, &mut pending, address, args, timeout, reply_tx).await;
                    }
                    Some(ReactorCommand::Command { address, args, ack_tx }) => {
                        let payload = osc::encode(&address, &args);
                        let result = socket
                            .send(&payload)
                            .await
                            .map(|_| ())
                            .map_err(|e| SessionError::Transport(e.to_string()));
                        if let Err(ref e) = result {
                            warn!("{}: send failed for {}: {}", name, address, e);
                        }
                        let _ = ack_tx.send(result);
                    }
                    Some(ReactorCommand::Shutdown) | None => {
                        info!(
                            "{}: reactor shutting down, failing {} pending requests",
                            name,
                            pending.values().map(VecDeque::len).sum::<usize>()
                        );
                        for (_, queue) in pending.drain() {
                            for waiter in queue {
                                let _ = waiter
                                    .reply_tx
                                    .send(Err(SessionError::Transport("session closed".into())));
                            }
                        }
                        set_state(&state, &events, ConnectionState::Disconnected, &name);
                        break;
                    }
                }
            }

            recv = socket.recv(&mut buf) => {
                match recv {
                    Ok(n) => {
                        match osc::decode_packet(&buf[..n]) {
                            Ok(messages) => {
                                last_rx = Some(Instant::now());
                                on_alive(&state, &events, &cfg, &name, &mut probe_deadline);
                                for msg in messages {
                                    deliver(&socket, &name, &mut pending, &identity, &events, msg).await;
                                }
                            }
                            Err(e) => {
                                debug!("{}: dropping undecodable datagram: {}", name, e);
                            }
                        }
                    }
                    Err(e) => {
                        // Connected UDP sockets surface ICMP errors here;
                        // treat them as transient noise.
                        debug!("{}: socket receive error: {}", name, e);
                    }
                }
            }

            _ = tokio::time::sleep_until(wakeup) => {}
        }

        expire_timeouts(&socket, &name, &mut pending).await;
        drive_liveness(&socket, &probe, &state, &events, &cfg, &name, last_rx, &mut probe_deadline).await;
    }

    debug!("{}: reactor task exiting", name);
}

/// Register a waiter and send it if it is the queue front.
async fn handle_request(
    socket: &UdpSocket,
    name: &str,
    pending: &mut PendingTable,
    address: String,
    args: Vec<OscValue>,
    timeout: Duration,
    reply_tx: oneshot::Sender<Result<Vec<OscValue>, SessionError>>,
) {
    let queue = pending.entry(address.clone()).or_default();
    if queue.len() >= MAX_QUEUE_DEPTH {
        warn!("{}: request queue full for {}", name, address);
        let _ = reply_tx.send(Err(SessionError::Busy(address)));
        return;
    }

    let payload = osc::encode(&address, &args);
    let was_idle = queue.is_empty();
    queue.push_back(Waiter {
        payload,
        timeout,
        deadline: None,
        reply_tx,
    });

    if was_idle {
        send_front(socket, name, &address, queue).await;
        if queue.is_empty() {
            pending.remove(&address);
        }
    } else {
        trace!(
            "{}: queued request for {} behind {} outstanding",
            name,
            address,
            queue.len() - 1
        );
    }
}

/// Put the queue front on the wire and arm its deadline. Entries whose
/// send fails are resolved with a transport error and dropped until one
/// send succeeds or the queue empties.
async fn send_front(socket: &UdpSocket, name: &str, address: &str, queue: &mut VecDeque<Waiter>) {
    while let Some(front) = queue.front_mut() {
        match socket.send(&front.payload).await {
            Ok(_) => {
                front.deadline = Some(Instant::now() + front.timeout);
                trace!("{}: request for {} on the wire", name, address);
                return;
            }
            Err(e) => {
                warn!("{}: send failed for {}: {}", name, address, e);
                if let Some(waiter) = queue.pop_front() {
                    let _ = waiter
                        .reply_tx
                        .send(Err(SessionError::Transport(e.to_string())));
                }
            }
        }
    }
}

/// Route one decoded message: resolve its waiter, or treat it as a
/// spontaneous event, or drop it.
async fn deliver(
    socket: &UdpSocket,
    name: &str,
    pending: &mut PendingTable,
    identity: &Arc<RwLock<Option<ConsoleIdentity>>>,
    events: &broadcast::Sender<Broadcast>,
    msg: osc::OscMessage,
) {
    if msg.address == IDENTITY_ADDRESS {
        if let Some(id) = ConsoleIdentity::from_args(&msg.args) {
            *identity.write().await = Some(id);
        }
    }

    if let Some(queue) = pending.get_mut(&msg.address) {
        if let Some(waiter) = queue.pop_front() {
            trace!("{}: resolved reply for {}", name, msg.address);
            let _ = waiter.reply_tx.send(Ok(msg.args));
        }
        send_front(socket, name, &msg.address, queue).await;
        if queue.is_empty() {
            pending.remove(&msg.address);
        }
    } else if msg.address == CURRENT_SCENE_ADDRESS {
        let slot = msg.args.first().and_then(OscValue::as_int);
        debug!("{}: console recalled scene {:?}", name, slot);
        let _ = events.send(Broadcast::SceneLoaded {
            slot,
            source: SceneLoadSource::Console,
        });
    } else if msg.address != IDENTITY_ADDRESS {
        debug!("{}: discarding orphan reply for {}", name, msg.address);
    }
}

/// Fail queue fronts whose deadline has passed and advance their queues.
async fn expire_timeouts(socket: &UdpSocket, name: &str, pending: &mut PendingTable) {
    let now = Instant::now();
    let expired: Vec<String> = pending
        .iter()
        .filter(|(_, q)| {
            q.front()
                .and_then(|w| w.deadline)
                .is_some_and(|d| now >= d)
        })
        .map(|(a, _)| a.clone())
        .collect();

    for address in expired {
        if let Some(queue) = pending.get_mut(&address) {
            if let Some(waiter) = queue.pop_front() {
                debug!("{}: request for {} timed out", name, address);
                let _ = waiter
                    .reply_tx
                    .send(Err(SessionError::Timeout(waiter.timeout)));
            }
            send_front(socket, name, &address, queue).await;
            if queue.is_empty() {
                pending.remove(&address);
            }
        }
    }
}

/// Any datagram proves liveness.
fn on_alive(
    state: &StateTracker,
    events: &broadcast::Sender<Broadcast>,
    cfg: &SessionConfig,
    name: &str,
    probe_deadline: &mut Option<Instant>,
) {
    if !state.get().is_live() {
        let target = if cfg.mock {
            ConnectionState::Mock
        } else {
            ConnectionState::Connected
        };
        set_state(state, events, target, name);
        state.reset_failures();
        *probe_deadline = None;
    }
}

/// Idle detection and probe retry.
#[allow(clippy::too_many_arguments)]
async fn drive_liveness(
    socket: &UdpSocket,
    probe: &Bytes,
    state: &StateTracker,
    events: &broadcast::Sender<Broadcast>,
    cfg: &SessionConfig,
    name: &str,
    last_rx: Option<Instant>,
    probe_deadline: &mut Option<Instant>,
) {
    let now = Instant::now();
    match state.get() {
        s if s.is_live() => {
            if let Some(rx) = last_rx {
                if now.duration_since(rx) >= cfg.idle_window {
                    info!(
                        "{}: no traffic for {:?}, probing console",
                        name, cfg.idle_window
                    );
                    set_state(state, events, ConnectionState::Connecting, name);
                    state.reset_failures();
                    let _ = socket.send(probe).await;
                    *probe_deadline = Some(now + cfg.probe_timeout);
                }
            }
        }
        ConnectionState::Connecting => {
            if probe_deadline.is_some_and(|d| now >= d) {
                let failures = state.record_probe_failure();
                if failures >= cfg.max_probe_failures {
                    warn!(
                        "{}: console not responding after {} probes",
                        name, failures
                    );
                    set_state(state, events, ConnectionState::Failed, name);
                    *probe_deadline = None;
                } else {
                    debug!("{}: probe {} unanswered, retrying", name, failures);
                    let _ = socket.send(probe).await;
                    *probe_deadline = Some(now + cfg.probe_timeout);
                }
            }
        }
        _ => {}
    }
}

fn set_state(
    state: &StateTracker,
    events: &broadcast::Sender<Broadcast>,
    next: ConnectionState,
    name: &str,
) {
    if state.get() != next {
        info!("{}: connection state -> {}", name, next.as_str());
        state.set(next);
        let _ = events.send(Broadcast::StateChange { state: next });
    }
}

/// Earliest instant the reactor must wake at; capped at one second so the
/// loop never sleeps stale.
fn next_wakeup(
    pending: &PendingTable,
    probe_deadline: Option<Instant>,
    last_rx: Option<Instant>,
    cfg: &SessionConfig,
    state: ConnectionState,
) -> Instant {
    let mut wake = Instant::now() + Duration::from_secs(1);
    for queue in pending.values() {
        if let Some(deadline) = queue.front().and_then(|w| w.deadline) {
            wake = wake.min(deadline);
        }
    }
    if let Some(deadline) = probe_deadline {
        wake = wake.min(deadline);
    }
    if state.is_live() {
        if let Some(rx) = last_rx {
            wake = wake.min(rx + cfg.idle_window);
        }
    }
    wake
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_roundtrip() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Failed,
            ConnectionState::Mock,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
        assert_eq!(ConnectionState::from_u8(200), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::Mock.as_str(), "mock");
        assert!(ConnectionState::Mock.is_live());
        assert!(!ConnectionState::Failed.is_live());
    }

    #[test]
    fn identity_from_args() {
        let args = vec![
            OscValue::Str("10.0.0.2".into()),
            OscValue::Str("FOH-Main".into()),
            OscValue::Str("X32".into()),
            OscValue::Str("4.08".into()),
        ];
        let id = ConsoleIdentity::from_args(&args).unwrap();
        assert_eq!(id.name, "FOH-Main");
        assert_eq!(id.firmware_major(), Some(4));

        assert!(ConsoleIdentity::from_args(&[OscValue::Int(1)]).is_none());
    }

    #[test]
    fn config_defaults() {
        let cfg = SessionConfig::new("x32", "192.168.1.64");
        assert_eq!(cfg.console_port, DEFAULT_CONSOLE_PORT);
        assert_eq!(cfg.idle_window, Duration::from_secs(10));
        assert_eq!(cfg.max_probe_failures, 5);
        assert!(!cfg.mock);
    }
}
