//! Relay network layer handling UDP communications for one room

use crate::room::{JoinOutcome, Outbound, Room};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Packet, PeerId, MAX_DATAGRAM_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};

/// Messages sent from network tasks to the main relay loop
#[derive(Debug)]
pub enum RelayMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    PeerTimeout { peer: PeerId },
    #[allow(dead_code)]
    Shutdown,
}

/// Messages sent from the relay loop to the sender task
#[derive(Debug)]
pub enum SendMessage {
    SendPacket { packet: Packet, addr: SocketAddr },
}

/// UDP relay for a single room
pub struct Relay {
    socket: Arc<UdpSocket>,
    room: Arc<RwLock<Room>>,
    peer_timeout: Duration,

    relay_tx: mpsc::UnboundedSender<RelayMessage>,
    relay_rx: mpsc::UnboundedReceiver<RelayMessage>,
    send_tx: mpsc::UnboundedSender<SendMessage>,
    send_rx: mpsc::UnboundedReceiver<SendMessage>,
}

impl Relay {
    pub async fn new(
        addr: &str,
        capacity: usize,
        peer_timeout: Duration,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Relay listening on {}", socket.local_addr()?);

        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (send_tx, send_rx) = mpsc::unbounded_channel();

        Ok(Relay {
            socket,
            room: Arc::new(RwLock::new(Room::new(capacity))),
            peer_timeout,
            relay_tx,
            relay_rx,
            send_tx,
            send_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawns task that continuously listens for incoming packets
    async fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let relay_tx = self.relay_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_DATAGRAM_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                relay_tx.send(RelayMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to relay loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes the outgoing packet queue
    async fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let mut send_rx = std::mem::replace(&mut self.send_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(SendMessage::SendPacket { packet, addr }) = send_rx.recv().await {
                if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                    error!("Failed to send packet to {}: {}", addr, e);
                }
            }
        });
    }

    /// Spawns task that monitors member timeouts
    async fn spawn_timeout_checker(&self) {
        let room = Arc::clone(&self.room);
        let relay_tx = self.relay_tx.clone();
        let timeout = self.peer_timeout;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let room_guard = room.read().await;
                    room_guard.timed_out(timeout)
                };

                for peer in timed_out {
                    if let Err(e) = relay_tx.send(RelayMessage::PeerTimeout { peer }) {
                        error!("Failed to send timeout message: {}", e);
                        break;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn queue_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.send_tx.send(SendMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    /// Resolves member ids to addresses and queues the packets
    async fn dispatch(&self, outbound: Vec<Outbound>) {
        let room = self.room.read().await;
        for Outbound { to, packet } in outbound {
            match room.addr_of(to) {
                Some(addr) => self.queue_packet(packet, addr),
                None => debug!("Dropping packet for departed {}", to),
            }
        }
    }

    /// Applies one inbound packet to the room
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Join {
                client_version,
                name,
            } => {
                info!("Join request from {} ({}), version {}", addr, name, client_version);
                let outcome = {
                    let mut room = self.room.write().await;
                    room.join(addr, &name, client_version)
                };

                match outcome {
                    JoinOutcome::Accepted { outbound, .. } => self.dispatch(outbound).await,
                    JoinOutcome::Rejected { reason } => {
                        warn!("Rejected {}: {}", addr, reason);
                        self.queue_packet(Packet::Rejected { reason }, addr);
                    }
                }
            }

            Packet::Send { route, rpc } => {
                let outbound = {
                    let mut room = self.room.write().await;
                    match room.find_by_addr(addr) {
                        Some(sender) => {
                            room.touch(sender);
                            room.route(sender, route, rpc)
                        }
                        None => {
                            debug!("Ignoring {:?} from unjoined {}", rpc.kind(), addr);
                            Vec::new()
                        }
                    }
                };
                self.dispatch(outbound).await;
            }

            Packet::Heartbeat => {
                let mut room = self.room.write().await;
                if let Some(peer) = room.find_by_addr(addr) {
                    room.touch(peer);
                    // Echo so the peer can tell a quiet room from a dead relay
                    self.queue_packet(Packet::Heartbeat, addr);
                }
            }

            Packet::Leave => {
                let outbound = {
                    let mut room = self.room.write().await;
                    match room.find_by_addr(addr) {
                        Some(peer) => room.leave(peer),
                        None => Vec::new(),
                    }
                };
                self.dispatch(outbound).await;
            }

            _ => {
                warn!("Unexpected packet type from {}", addr);
            }
        }
    }

    async fn handle_timeout(&mut self, peer: PeerId) {
        info!("{} timed out", peer);
        let outbound = {
            let mut room = self.room.write().await;
            room.leave(peer)
        };
        self.dispatch(outbound).await;
    }

    /// Main relay loop
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver().await;
        self.spawn_network_sender().await;
        self.spawn_timeout_checker().await;

        info!("Relay started successfully");

        loop {
            match self.relay_rx.recv().await {
                Some(RelayMessage::PacketReceived { packet, addr }) => {
                    self.handle_packet(packet, addr).await;
                }
                Some(RelayMessage::PeerTimeout { peer }) => {
                    self.handle_timeout(peer).await;
                }
                Some(RelayMessage::Shutdown) | None => {
                    info!("Relay shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}
