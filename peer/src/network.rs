use crate::bus::Outgoing;
use crate::peer::Peer;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{CoreError, Packet, HEARTBEAT_INTERVAL_MS, MAX_DATAGRAM_SIZE, PEER_TIMEOUT_SECS, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::interval;

/// What the join loop should do at a given moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStep {
    SendJoin { attempt: u32 },
    Wait,
    GiveUp,
}

/// Bounded join attempts with a fixed backoff.
#[derive(Debug, Clone)]
pub struct JoinRetry {
    max_attempts: u32,
    backoff: Duration,
    attempts: u32,
    last_attempt: Option<Duration>,
}

impl JoinRetry {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            attempts: 0,
            last_attempt: None,
        }
    }

    pub fn poll(&mut self, now: Duration) -> JoinStep {
        if let Some(last) = self.last_attempt {
            if now.saturating_sub(last) < self.backoff {
                return JoinStep::Wait;
            }
        }
        if self.attempts >= self.max_attempts {
            return JoinStep::GiveUp;
        }
        self.attempts += 1;
        self.last_attempt = Some(now);
        JoinStep::SendJoin {
            attempt: self.attempts,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[derive(Debug)]
pub enum LinkState {
    Joining(JoinRetry),
    Connected { last_heard: Duration },
    /// Playing alone. `retry_at` is when to try the relay again, if ever.
    Offline { retry_at: Option<Duration> },
}

/// Wraps an outgoing message for the relay.
pub fn to_packet(outgoing: Outgoing) -> Packet {
    Packet::Send {
        route: outgoing.route,
        rpc: outgoing.rpc,
    }
}

pub struct Client {
    socket: UdpSocket,
    relay_addr: SocketAddr,
    peer: Peer,
    state: LinkState,
    started: Instant,
    tick_interval: Duration,
    silence_timeout: Duration,
    reconnect: bool,
}

impl Client {
    pub async fn new(
        relay_addr: &str,
        peer: Peer,
        tick_rate: u32,
        reconnect: bool,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let relay_addr = relay_addr.parse()?;
        let state = LinkState::Joining(Self::join_retry(&peer));

        Ok(Client {
            socket,
            relay_addr,
            peer,
            state,
            started: Instant::now(),
            tick_interval: Duration::from_secs_f64(1.0 / tick_rate.max(1) as f64),
            silence_timeout: Duration::from_secs(PEER_TIMEOUT_SECS),
            reconnect,
        })
    }

    fn join_retry(peer: &Peer) -> JoinRetry {
        JoinRetry::new(peer.config().join_attempts, peer.config().join_backoff())
    }

    /// Starts without contacting the relay.
    pub fn start_offline(&mut self) {
        self.peer.go_offline(CoreError::NetworkPartition {
            reason: "started offline".to_string(),
        });
        self.state = LinkState::Offline { retry_at: None };
        if let Err(e) = self.peer.spawn_avatar() {
            warn!("Failed to spawn avatar: {}", e);
        }
    }

    fn room_time(&self) -> Duration {
        self.started.elapsed()
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        self.socket.send_to(&data, self.relay_addr).await?;
        Ok(())
    }

    async fn flush_outbox(&mut self) {
        let outgoing = self.peer.take_outbox();
        if !matches!(self.state, LinkState::Connected { .. }) {
            return;
        }
        for message in outgoing {
            if let Err(e) = self.send_packet(&to_packet(message)).await {
                error!("Error sending packet: {}", e);
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) {
        let now = self.room_time();
        let welcomed = matches!(packet, Packet::Welcome { .. });
        let rejected = matches!(packet, Packet::Rejected { .. });

        match &mut self.state {
            LinkState::Connected { last_heard } => *last_heard = now,
            LinkState::Joining(_) if welcomed || rejected => {}
            _ => {
                debug!("Ignoring packet while not connected");
                return;
            }
        }

        if let Err(e) = self.peer.handle_relay_packet(packet) {
            warn!("Relay refused us: {}", e);
            self.enter_offline(e, now);
            return;
        }

        if welcomed {
            info!("Connected as {}", self.peer.local());
            self.state = LinkState::Connected { last_heard: now };
            if let Err(e) = self.peer.spawn_avatar() {
                warn!("Failed to spawn avatar: {}", e);
            }
        }
    }

    fn enter_offline(&mut self, reason: CoreError, now: Duration) {
        self.peer.go_offline(reason);
        let config = self.peer.config();
        let retry_at = self
            .reconnect
            .then(|| now + config.join_backoff() * config.join_attempts.max(1));
        self.state = LinkState::Offline { retry_at };
        if self.peer.avatar().is_none() {
            if let Err(e) = self.peer.spawn_avatar() {
                warn!("Failed to spawn avatar: {}", e);
            }
        }
    }

    async fn update_link(&mut self, now: Duration) {
        match &mut self.state {
            LinkState::Joining(retry) => match retry.poll(now) {
                JoinStep::SendJoin { attempt } => {
                    info!("Joining relay {} (attempt {})", self.relay_addr, attempt);
                    let packet = Packet::Join {
                        client_version: PROTOCOL_VERSION,
                        name: self.peer.name().to_string(),
                    };
                    if let Err(e) = self.send_packet(&packet).await {
                        error!("Error sending join: {}", e);
                    }
                }
                JoinStep::Wait => {}
                JoinStep::GiveUp => {
                    let reason = CoreError::NetworkPartition {
                        reason: format!("no answer from {}", self.relay_addr),
                    };
                    self.enter_offline(reason, now);
                }
            },
            LinkState::Connected { last_heard } => {
                if now.saturating_sub(*last_heard) > self.silence_timeout {
                    let reason = CoreError::NetworkPartition {
                        reason: "relay went silent".to_string(),
                    };
                    self.enter_offline(reason, now);
                }
            }
            LinkState::Offline { retry_at } => {
                if retry_at.is_some_and(|at| now >= at) {
                    info!("Trying to reconnect");
                    self.state = LinkState::Joining(Self::join_retry(&self.peer));
                }
            }
        }
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let mut tick_interval = interval(self.tick_interval);
        let mut heartbeat_interval = interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
        let mut buffer = [0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, addr)) if addr == self.relay_addr => {
                            match deserialize::<Packet>(&buffer[0..len]) {
                                Ok(packet) => self.handle_packet(packet).await,
                                Err(e) => warn!("Failed to deserialize packet: {}", e),
                            }
                        }
                        Ok((_, addr)) => debug!("Ignoring datagram from {}", addr),
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = tick_interval.tick() => {
                    let now = self.room_time();
                    self.update_link(now).await;
                    self.peer.tick(now);
                    self.flush_outbox().await;
                },

                _ = heartbeat_interval.tick() => {
                    if matches!(self.state, LinkState::Connected { .. }) {
                        if let Err(e) = self.send_packet(&Packet::Heartbeat).await {
                            error!("Error sending heartbeat: {}", e);
                        }
                    }
                },
            }
        }
    }

    /// Tells the relay we are leaving, if connected.
    pub async fn leave(&mut self) {
        if matches!(self.state, LinkState::Connected { .. }) {
            if let Err(e) = self.send_packet(&Packet::Leave).await {
                error!("Error sending leave: {}", e);
            }
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }
}
