//! Peers facade: owns the coordinator and the three services, and exposes the
//! calls the rest of the controller uses.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use keypad_core::protocol::ImageQuery;
use keypad_core::{
    Action, Capabilities, Collaborators, ControlMessage, Coordinator, Event, Image, ImageTicket,
    Peer,
};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::transfer::ImageSlot;
use crate::{discovery, messaging, transfer};

/// Coordinator shared between the tick loop and the listener tasks.
pub type SharedCore = Arc<Mutex<Coordinator>>;

/// Timing knobs copied out of the config.
#[derive(Debug, Clone, Copy)]
struct Timeouts {
    call: Duration,
    announce_gap: Duration,
    image_stall: Duration,
    image_max_stalls: u32,
}

pub struct Peers {
    core: SharedCore,
    collaborators: Collaborators,
    discovery: Arc<UdpSocket>,
    announce_to: SocketAddr,
    message_port: u16,
    image_port: u16,
    advertise_host: String,
    image: ImageSlot,
    timeouts: Timeouts,
    tasks: Vec<JoinHandle<()>>,
}

impl Peers {
    /// Open the listeners, start their tasks, and announce twice.
    /// The roster starts empty.
    pub async fn start(config: &Config, collaborators: Collaborators) -> Result<Self> {
        let mut core = Coordinator::new(config.identity(), collaborators.clone());
        core.set_peer_ttl(config.peer_ttl());
        tracing::info!(
            name = %core.identity().name,
            capabilities = ?core.identity().capabilities,
            "peers starting"
        );
        let core: SharedCore = Arc::new(Mutex::new(core));

        // TCP first so port 0 resolves to one number shared with UDP.
        let message_listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port))
            .await
            .with_context(|| format!("bind message port {}", config.port))?;
        let message_port = message_listener.local_addr()?.port();

        let group: Ipv4Addr = config
            .multicast_group
            .parse()
            .with_context(|| format!("invalid multicast group {}", config.multicast_group))?;
        let discovery = Arc::new(discovery::make_multicast_socket(group, message_port)?);

        let image_listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.image_port))
            .await
            .with_context(|| format!("bind image port {}", config.image_port))?;
        let image_port = image_listener.local_addr()?.port();

        let (image, image_rx) = transfer::image_slot();
        let timeouts = Timeouts {
            call: config.call_timeout(),
            announce_gap: config.announce_gap(),
            image_stall: config.image_stall(),
            image_max_stalls: config.image_max_stalls,
        };

        let tasks = vec![
            tokio::spawn(messaging::run_server(message_listener, core.clone(), timeouts.call)),
            tokio::spawn(discovery::run_listener(discovery.clone(), core.clone())),
            tokio::spawn(transfer::run_image_server(image_listener, image_rx)),
        ];

        let announce_to = SocketAddr::new(IpAddr::V4(group), message_port);
        let advertise_host = if config.advertise_host.is_empty() {
            local_address().to_string()
        } else {
            config.advertise_host.clone()
        };

        let peers = Self {
            core,
            collaborators,
            discovery,
            announce_to,
            message_port,
            image_port,
            advertise_host,
            image,
            timeouts,
            tasks,
        };
        peers.reannounce().await;
        Ok(peers)
    }

    pub fn core(&self) -> &SharedCore {
        &self.core
    }

    pub fn message_port(&self) -> u16 {
        self.message_port
    }

    pub fn image_port(&self) -> u16 {
        self.image_port
    }

    /// Send the double announce again, e.g. after a capability change.
    pub async fn reannounce(&self) {
        discovery::announce(
            &self.discovery,
            &self.core,
            self.announce_to,
            self.timeouts.announce_gap,
        )
        .await;
    }

    pub async fn set_capabilities(&self, capabilities: Capabilities) {
        self.core.lock().await.set_capabilities(capabilities);
        self.reannounce().await;
    }

    /// One scheduling tick: run pulls queued by ImageReady, report expiries.
    pub async fn tick(&self) {
        let actions = self.core.lock().await.tick(Instant::now());
        for action in actions {
            match action {
                Action::PullImage(ticket) => self.pull(&ticket).await,
                Action::PeerExpired(peer) => {
                    tracing::debug!(name = %peer.name, "peer dropped from roster")
                }
            }
        }
    }

    async fn pull(&self, ticket: &ImageTicket) {
        let stall = self.timeouts.image_stall;
        match transfer::pull_image(ticket, stall, self.timeouts.image_max_stalls).await {
            Ok(pixels) => {
                tracing::debug!(host = %ticket.host, bytes = pixels.len(), "image pulled");
                self.collaborators.display.show_image(&pixels, ticket.width, ticket.height);
            }
            Err(e) => tracing::warn!(
                host = %ticket.host,
                port = ticket.port,
                error = %e,
                "image pull failed"
            ),
        }
    }

    /// Send `event` to every known peer. Returns how many answered.
    pub async fn broadcast(&self, event: Event) -> usize {
        let fanout = match self.core.lock().await.broadcast(event) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "cannot encode broadcast");
                return 0;
            }
        };
        // Lock released: calls may block up to the timeout per peer.
        tracing::debug!(kind = fanout.message.kind(), peers = fanout.targets.len(), "broadcast");
        messaging::call_peers(
            &fanout.targets,
            self.message_port,
            &fanout.payload,
            self.timeouts.call,
        )
        .await
        .len()
    }

    /// First known peer whose capabilities satisfy `pred`.
    pub async fn query_peer_for<F>(&self, pred: F) -> Option<Peer>
    where
        F: Fn(&Capabilities) -> bool,
    {
        self.core.lock().await.query_peer_for(pred)
    }

    /// Queue a pull of `peer`'s current image for the next tick.
    pub async fn pull_image_from(&self, peer: &Peer, width: u16, height: u16) -> bool {
        let ticket = ImageTicket {
            host: peer.addr.to_string(),
            port: self.image_port,
            width,
            height,
        };
        self.core.lock().await.request_image(ticket)
    }

    /// Replace the served image and tell every peer it can be pulled.
    pub async fn publish_image(&self, image: Image) -> usize {
        let (width, height) = (image.width(), image.height());
        self.image.send_replace(Some(image));
        self.broadcast(Event::ImageReady {
            width,
            height,
            host: self.advertise_host.clone(),
            port: self.image_port,
        })
        .await
    }

    /// Ask the first weather-capable peer for its status blob and apply it.
    pub async fn fetch_weather(&self) -> bool {
        let Some(peer) = self.query_peer_for(|c| c.weather_feed).await else {
            return false;
        };
        let msg = ControlMessage::ImageQuery(ImageQuery::default());
        let Ok(payload) = keypad_core::encode_message(&msg) else {
            return false;
        };
        let addr = SocketAddr::new(peer.addr, self.message_port);
        let Some(reply) = messaging::call_peer(addr, &payload, self.timeouts.call).await else {
            return false;
        };
        match serde_json::from_slice::<serde_json::Value>(&reply) {
            Ok(serde_json::Value::Object(blob)) => {
                self.collaborators.weather.apply_status_blob(&blob);
                true
            }
            Ok(_) | Err(_) => {
                tracing::warn!(peer = %peer.name, "weather reply is not an object");
                false
            }
        }
    }

    /// Stop the listener tasks. Open sockets close with them.
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Address other nodes can reach us on. Loopback when no interface is up.
fn local_address() -> IpAddr {
    match local_ip_address::local_ip() {
        Ok(ip) => ip,
        Err(e) => {
            tracing::warn!(error = %e, "no local address, advertising loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}
