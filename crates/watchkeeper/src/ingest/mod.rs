//! Doorbell ingest gate.
//!
//! A UDP socket whose bind lifecycle is strictly tied to the gating state
//! key: no bridge running means no socket bound means no ingest. Packets are
//! parsed doorbell tokens; malformed ones are dropped silently, chat bursts
//! are debounced per category with last-marker-wins.

pub mod twitch;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use watchkeeper_protocol::defaults::DOORBELL_GATE_KEY;
use watchkeeper_protocol::doorbell::{DoorbellToken, TwitchCategory};

use self::twitch::TwitchIngest;
use crate::runtime::Runtime;
use crate::supervisor::{shutdown_requested, Shutdown};

struct PendingDoorbell {
    marker: String,
    seq: u32,
    due: Instant,
}

pub struct DoorbellGate {
    rt: Arc<Runtime>,
    ingest: Arc<TwitchIngest>,
    socket: Option<UdpSocket>,
    debounce: HashMap<TwitchCategory, PendingDoorbell>,
}

impl DoorbellGate {
    pub fn new(rt: Arc<Runtime>, ingest: Arc<TwitchIngest>) -> Self {
        Self {
            rt,
            ingest,
            socket: None,
            debounce: HashMap::new(),
        }
    }

    async fn should_listen(&self) -> bool {
        if !self.rt.config.twitch_udp_enabled {
            return false;
        }
        self.rt
            .db
            .get_state_bool(DOORBELL_GATE_KEY)
            .await
            .unwrap_or(false)
    }

    async fn sync_gate(&mut self) {
        let wanted = self.should_listen().await;
        match (&self.socket, wanted) {
            (None, true) => match UdpSocket::bind(self.rt.config.doorbell_bind.as_str()).await {
                Ok(socket) => {
                    info!(addr = %self.rt.config.doorbell_bind, "doorbell socket bound");
                    self.socket = Some(socket);
                }
                Err(err) => {
                    warn!(addr = %self.rt.config.doorbell_bind, error = %err, "doorbell bind failed");
                }
            },
            (Some(_), false) => {
                info!("doorbell socket unbound (gate closed)");
                self.socket = None;
                self.debounce.clear();
            }
            _ => {}
        }
    }

    fn debounce_for(&self, category: TwitchCategory) -> Duration {
        match category {
            TwitchCategory::Chat => self.rt.config.chat_debounce,
            _ => Duration::ZERO,
        }
    }

    async fn handle_packet(&mut self, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        let Some(token) = DoorbellToken::parse(&text) else {
            // Malformed tokens are dropped silently; logged for diagnosis only.
            debug!(raw = %text.escape_debug(), "malformed doorbell dropped");
            return;
        };

        let wait = self.debounce_for(token.category);
        if wait.is_zero() {
            self.ingest_now(token).await;
            return;
        }

        // Debounced: last marker wins, the timer is not extended by repeats.
        let due = self
            .debounce
            .get(&token.category)
            .map(|pending| pending.due)
            .unwrap_or_else(|| Instant::now() + wait);
        self.debounce.insert(
            token.category,
            PendingDoorbell {
                marker: token.marker,
                seq: token.seq,
                due,
            },
        );
    }

    async fn flush_due(&mut self) {
        let now = Instant::now();
        let due: Vec<TwitchCategory> = self
            .debounce
            .iter()
            .filter(|(_, pending)| pending.due <= now)
            .map(|(category, _)| *category)
            .collect();
        for category in due {
            if let Some(pending) = self.debounce.remove(&category) {
                self.ingest_now(DoorbellToken {
                    category,
                    marker: pending.marker,
                    seq: pending.seq,
                })
                .await;
            }
        }
    }

    async fn ingest_now(&self, token: DoorbellToken) {
        if let Err(err) = self.ingest.handle_token(token).await {
            warn!(error = %err, "doorbell ingest failed");
        }
    }

    /// Run until shutdown. The gate key is re-checked every poll interval;
    /// while unbound no packet is consumed.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        let poll = self.rt.config.gate_poll;
        let mut buf = vec![0u8; 2048];
        loop {
            if shutdown_requested(&shutdown) {
                break;
            }
            self.sync_gate().await;
            self.flush_due().await;

            let wake = if let Some(socket) = &self.socket {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, _addr)) => GateWake::Packet(buf[..len].to_vec()),
                        Err(err) => GateWake::RecvError(err),
                    },
                    _ = tokio::time::sleep(poll) => GateWake::Tick,
                    _ = shutdown.changed() => GateWake::Tick,
                }
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(poll) => GateWake::Tick,
                    _ = shutdown.changed() => GateWake::Tick,
                }
            };

            match wake {
                GateWake::Packet(datagram) => self.handle_packet(&datagram).await,
                GateWake::RecvError(err) => {
                    warn!(error = %err, "doorbell recv failed");
                    self.socket = None;
                }
                GateWake::Tick => {}
            }
        }
        if self.socket.take().is_some() {
            info!("doorbell socket closed on shutdown");
        }
    }
}

enum GateWake {
    Packet(Vec<u8>),
    RecvError(std::io::Error),
    Tick,
}
