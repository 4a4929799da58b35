//! In-process console emulator.
//!
//! Binds a loopback UDP socket and answers like an X32: queries (empty arg
//! lists) return the stored value for the address, sets are absorbed into a
//! parameter map, `/xinfo` returns the configured identity, and a scene
//! recall emits the spontaneous current-scene update. Unknown queried
//! addresses synthesize a plausible default so development against the
//! emulator behaves like a factory-reset console.
//!
//! Fault knobs (reply delay, modulus drop, per-address drop counters, total
//! silence) exist for exercising timeout and retry paths in tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::osc::{self, OscMessage, OscValue};
use crate::session::{CURRENT_SCENE_ADDRESS, IDENTITY_ADDRESS, RECALL_ADDRESS};

/// Emulated console state plus fault-injection knobs.
pub struct MockConsole {
    identity: [String; 4],
    state: HashMap<String, Vec<OscValue>>,
    current_scene: i32,
    reply_delay: Duration,
    /// Drop every Nth reply when nonzero.
    drop_modulus: u32,
    reply_count: u64,
    /// Drop the first K replies for specific addresses.
    drop_first: HashMap<String, u32>,
    /// Total silence; nothing is answered.
    drop_all: bool,
    captured: Vec<OscMessage>,
}

impl MockConsole {
    pub fn new() -> Self {
        Self {
            identity: [
                "127.0.0.1".to_string(),
                "X32 Emulator".to_string(),
                "X32".to_string(),
                "4.08".to_string(),
            ],
            state: HashMap::new(),
            current_scene: 0,
            reply_delay: Duration::ZERO,
            drop_modulus: 0,
            reply_count: 0,
            drop_first: HashMap::new(),
            drop_all: false,
            captured: Vec::new(),
        }
    }

    pub fn with_identity(mut self, ip: &str, name: &str, model: &str, firmware: &str) -> Self {
        self.identity = [
            ip.to_string(),
            name.to_string(),
            model.to_string(),
            firmware.to_string(),
        ];
        self
    }

    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    /// Drop every Nth reply (3% loss ~= modulus 33).
    pub fn with_drop_modulus(mut self, modulus: u32) -> Self {
        self.drop_modulus = modulus;
        self
    }

    /// Seed one parameter.
    pub fn seed(&mut self, address: &str, values: Vec<OscValue>) {
        self.state.insert(address.to_string(), values);
    }

    /// Seed a scene slot header (name + notes).
    pub fn seed_scene_slot(&mut self, slot: u32, name: &str, notes: &str) {
        self.seed(
            &format!("/-show/showfile/scene/{:03}/name", slot),
            vec![OscValue::Str(name.to_string())],
        );
        self.seed(
            &format!("/-show/showfile/scene/{:03}/notes", slot),
            vec![OscValue::Str(notes.to_string())],
        );
    }

    /// Drop the first `count` replies for one address.
    pub fn drop_first_replies(&mut self, address: &str, count: u32) {
        self.drop_first.insert(address.to_string(), count);
    }

    pub fn set_drop_all(&mut self, drop_all: bool) {
        self.drop_all = drop_all;
    }

    pub fn set_reply_delay(&mut self, delay: Duration) {
        self.reply_delay = delay;
    }

    /// Set commands received so far, in arrival order.
    pub fn captured(&self) -> &[OscMessage] {
        &self.captured
    }

    pub fn current_scene(&self) -> i32 {
        self.current_scene
    }

    pub fn get(&self, address: &str) -> Option<&Vec<OscValue>> {
        self.state.get(address)
    }

    /// Process one incoming message, returning the replies to send.
    pub fn dispatch(&mut self, msg: &OscMessage) -> Vec<OscMessage> {
        if msg.address == IDENTITY_ADDRESS {
            let args = self.identity.iter().cloned().map(OscValue::Str).collect();
            return vec![OscMessage::new(IDENTITY_ADDRESS, args)];
        }

        if msg.address == RECALL_ADDRESS {
            if let Some(slot) = msg.args.first().and_then(OscValue::as_int) {
                self.current_scene = slot;
                self.captured.push(msg.clone());
                return vec![OscMessage::new(
                    CURRENT_SCENE_ADDRESS,
                    vec![OscValue::Int(slot)],
                )];
            }
            return Vec::new();
        }

        if msg.args.is_empty() {
            if msg.address == CURRENT_SCENE_ADDRESS {
                return vec![OscMessage::new(
                    CURRENT_SCENE_ADDRESS,
                    vec![OscValue::Int(self.current_scene)],
                )];
            }
            let values = match self.state.get(&msg.address) {
                Some(values) => values.clone(),
                None => {
                    let synthesized = synthesize_default(&msg.address);
                    self.state
                        .insert(msg.address.clone(), synthesized.clone());
                    synthesized
                }
            };
            return vec![OscMessage::new(msg.address.clone(), values)];
        }

        // A set: absorb it. The real console stays silent.
        self.state.insert(msg.address.clone(), msg.args.clone());
        self.captured.push(msg.clone());
        Vec::new()
    }

    /// Fault-injection gate, evaluated once per outgoing reply.
    fn should_drop(&mut self, address: &str) -> bool {
        if self.drop_all {
            return true;
        }
        if let Some(remaining) = self.drop_first.get_mut(address) {
            if *remaining > 0 {
                *remaining -= 1;
                return true;
            }
        }
        if self.drop_modulus > 0 {
            self.reply_count += 1;
            if self.reply_count % u64::from(self.drop_modulus) == 0 {
                return true;
            }
        }
        false
    }
}

impl Default for MockConsole {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a spawned emulator.
pub struct MockHandle {
    /// Loopback address the emulator listens on.
    pub addr: SocketAddr,
    console: Arc<Mutex<MockConsole>>,
    cancel: CancellationToken,
}

impl MockHandle {
    pub async fn seed(&self, address: &str, values: Vec<OscValue>) {
        self.console.lock().await.seed(address, values);
    }

    pub async fn seed_scene_slot(&self, slot: u32, name: &str, notes: &str) {
        self.console.lock().await.seed_scene_slot(slot, name, notes);
    }

    pub async fn captured(&self) -> Vec<OscMessage> {
        self.console.lock().await.captured().to_vec()
    }

    pub async fn current_scene(&self) -> i32 {
        self.console.lock().await.current_scene()
    }

    pub async fn set_drop_all(&self, drop_all: bool) {
        self.console.lock().await.set_drop_all(drop_all);
    }

    pub async fn set_reply_delay(&self, delay: Duration) {
        self.console.lock().await.set_reply_delay(delay);
    }

    pub async fn drop_first_replies(&self, address: &str, count: u32) {
        self.console.lock().await.drop_first_replies(address, count);
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Bind the emulator on an ephemeral loopback port and serve until the
/// handle is dropped.
pub async fn spawn(console: MockConsole) -> std::io::Result<MockHandle> {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await?);
    let addr = socket.local_addr()?;
    let console = Arc::new(Mutex::new(console));
    let cancel = CancellationToken::new();

    let task_socket = socket.clone();
    let task_console = console.clone();
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        serve(task_socket, task_console, task_cancel).await;
    });

    debug!("mock console listening on {}", addr);
    Ok(MockHandle {
        addr,
        console,
        cancel,
    })
}

async fn serve(
    socket: Arc<UdpSocket>,
    console: Arc<Mutex<MockConsole>>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            recv = socket.recv_from(&mut buf) => {
                let (n, peer) = match recv {
                    Ok(ok) => ok,
                    Err(e) => {
                        debug!("mock console receive error: {}", e);
                        continue;
                    }
                };
                let messages = match osc::decode_packet(&buf[..n]) {
                    Ok(messages) => messages,
                    Err(e) => {
                        trace!("mock console ignoring undecodable datagram: {}", e);
                        continue;
                    }
                };
                for msg in messages {
                    let (replies, delay) = {
                        let mut console = console.lock().await;
                        let replies: Vec<OscMessage> = console
                            .dispatch(&msg)
                            .into_iter()
                            .filter(|reply| !console.should_drop(&reply.address))
                            .collect();
                        (replies, console.reply_delay)
                    };
                    for reply in replies {
                        let payload = osc::encode_message(&reply);
                        if delay.is_zero() {
                            let _ = socket.send_to(&payload, peer).await;
                        } else {
                            let socket = socket.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                let _ = socket.send_to(&payload, peer).await;
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Default value for a never-written parameter, guessed from the address
/// shape the way a factory-reset console presents it.
fn synthesize_default(address: &str) -> Vec<OscValue> {
    if address.ends_with("/name") || address.ends_with("/notes") {
        return vec![OscValue::Str(String::new())];
    }
    let leaf = address.rsplit('/').next().unwrap_or_default();
    match leaf {
        "fader" | "level" | "pan" | "trim" | "thr" | "f" | "g" | "q" => {
            vec![OscValue::Float(0.0)]
        }
        _ => vec![OscValue::Int(0)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_returns_seeded_value() {
        let mut console = MockConsole::new();
        console.seed("/ch/01/mix/fader", vec![OscValue::Float(0.75)]);
        let replies = console.dispatch(&OscMessage::query("/ch/01/mix/fader"));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].args, vec![OscValue::Float(0.75)]);
    }

    #[test]
    fn set_is_absorbed_and_captured() {
        let mut console = MockConsole::new();
        let set = OscMessage::new("/ch/01/mix/on", vec![OscValue::Int(1)]);
        assert!(console.dispatch(&set).is_empty());
        assert_eq!(console.get("/ch/01/mix/on"), Some(&vec![OscValue::Int(1)]));
        assert_eq!(console.captured().to_vec(), vec![set]);
    }

    #[test]
    fn identity_reply() {
        let mut console =
            MockConsole::new().with_identity("10.0.0.2", "FOH-Main", "X32", "4.08");
        let replies = console.dispatch(&OscMessage::query(IDENTITY_ADDRESS));
        assert_eq!(
            replies[0].args[1],
            OscValue::Str("FOH-Main".to_string())
        );
    }

    #[test]
    fn recall_emits_current_scene() {
        let mut console = MockConsole::new();
        let replies =
            console.dispatch(&OscMessage::new(RECALL_ADDRESS, vec![OscValue::Int(17)]));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].address, CURRENT_SCENE_ADDRESS);
        assert_eq!(replies[0].args, vec![OscValue::Int(17)]);
        assert_eq!(console.current_scene(), 17);
    }

    #[test]
    fn unknown_query_synthesizes_default() {
        let mut console = MockConsole::new();
        let replies = console.dispatch(&OscMessage::query("/ch/05/config/name"));
        assert_eq!(replies[0].args, vec![OscValue::Str(String::new())]);
        let replies = console.dispatch(&OscMessage::query("/bus/03/mix/fader"));
        assert_eq!(replies[0].args, vec![OscValue::Float(0.0)]);
    }

    #[test]
    fn drop_first_counts_down() {
        let mut console = MockConsole::new();
        console.drop_first_replies("/a", 2);
        assert!(console.should_drop("/a"));
        assert!(console.should_drop("/a"));
        assert!(!console.should_drop("/a"));
    }
}
