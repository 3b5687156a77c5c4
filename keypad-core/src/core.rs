//! Host-driven API: Coordinator receives decoded traffic from the host, calls
//! collaborators, and returns what the host should send or pull.
//!
//! The coordinator never performs I/O and never fans messages out by itself.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};

use crate::host::{ArmState, Collaborators};
use crate::image::ImageTicket;
use crate::protocol::{
    Acknowledge, Announce, Capabilities, ControlMessage, ImageReady, Reply, Status, StatusKind,
};
use crate::roster::{Peer, Roster};
use crate::wire::{self, EncodeError};

/// This node's identity as advertised in discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub capabilities: Capabilities,
}

/// Per-node lifecycle. Peers have no state of their own beyond `last_seen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Starting,
    /// Initial announces sent, listeners up.
    Discovering,
    /// Periodic tick running.
    Steady,
}

/// Locally originated events to propagate to every peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Armed(ArmState),
    Alarm { sensor: String },
    Reset { user: String },
    Weather(Map<String, Value>),
    ImageReady {
        width: u16,
        height: u16,
        host: String,
        port: u16,
    },
}

/// Answer to an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// A typed control message (Acknowledge).
    Message(ControlMessage),
    /// Weather collaborator blob, returned verbatim.
    Blob(Value),
    /// Generic success/error object.
    Reply(Reply),
}

impl Response {
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        match self {
            Response::Message(m) => wire::encode_message(m),
            Response::Reply(r) => wire::encode_reply(r),
            Response::Blob(v) => {
                let out = serde_json::to_vec(v)?;
                if out.len() > wire::MAX_MESSAGE_LEN {
                    return Err(EncodeError::TooLarge(out.len()));
                }
                Ok(out)
            }
        }
    }

    /// Generic replies are only meaningful on the request/response channel.
    fn is_generic(&self) -> bool {
        matches!(self, Response::Reply(_))
    }
}

/// One message to deliver to a set of peers, already encoded.
#[derive(Debug, Clone)]
pub struct Fanout {
    pub message: ControlMessage,
    pub payload: Vec<u8>,
    pub targets: Vec<Peer>,
}

/// Action for host to perform after a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    PullImage(ImageTicket),
    PeerExpired(Peer),
}

/// Owns the roster and translates between wire messages and collaborators.
pub struct Coordinator {
    identity: Identity,
    collaborators: Collaborators,
    roster: Roster,
    state: NodeState,
    pending_image: Option<ImageTicket>,
    image_frame: u32,
    peer_ttl: Option<Duration>,
}

impl Coordinator {
    pub fn new(identity: Identity, collaborators: Collaborators) -> Self {
        Self {
            identity,
            collaborators,
            roster: Roster::new(),
            state: NodeState::Starting,
            pending_image: None,
            image_frame: 0,
            peer_ttl: None,
        }
    }

    /// Evict peers silent for `ttl`. `None` keeps them forever.
    pub fn set_peer_ttl(&mut self, ttl: Option<Duration>) {
        self.peer_ttl = ttl;
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Change advertised capabilities; the host should re-announce afterwards.
    pub fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.identity.capabilities = capabilities;
    }

    /// Discovery probe for this node. Moves Starting to Discovering.
    pub fn announce(&mut self) -> ControlMessage {
        if self.state == NodeState::Starting {
            self.state = NodeState::Discovering;
        }
        ControlMessage::Announce(Announce {
            name: self.identity.name.clone(),
            capabilities: self.identity.capabilities,
        })
    }

    pub fn acknowledge(&self) -> ControlMessage {
        ControlMessage::Acknowledge(Acknowledge {
            name: self.identity.name.clone(),
            capabilities: self.identity.capabilities,
        })
    }

    /// Multicast/unicast datagram. Malformed input is dropped; generic replies
    /// are suppressed since nobody waits for them on this channel.
    pub fn on_datagram(&mut self, from: IpAddr, bytes: &[u8], now: Instant) -> Option<Response> {
        let msg = match wire::decode_message(bytes) {
            Ok(m) => m,
            Err(e) => {
                tracing::trace!(%from, error = %e, "dropping malformed datagram");
                return None;
            }
        };
        self.dispatch(from, msg, now).filter(|r| !r.is_generic())
    }

    /// Request read from a TCP connection. Unparseable input gets an error reply.
    pub fn on_request(&mut self, from: IpAddr, bytes: &[u8], now: Instant) -> Option<Response> {
        match wire::decode_message(bytes) {
            Ok(msg) => self.dispatch(from, msg, now),
            Err(e) => {
                tracing::debug!(%from, error = %e, "unparseable request");
                Some(Response::Reply(Reply::error(format!("Could not parse JSON: {e}"))))
            }
        }
    }

    /// Apply one inbound message. Never produces outbound fan-out.
    pub fn dispatch(
        &mut self,
        from: IpAddr,
        msg: ControlMessage,
        now: Instant,
    ) -> Option<Response> {
        tracing::debug!(%from, kind = msg.kind(), "dispatching message");
        self.roster.touch(from, now);

        match msg {
            ControlMessage::Status(status) => {
                self.learn_from_status(&status.name, from, now);
                self.on_status(status);
                Some(Response::Reply(Reply::ok()))
            }
            ControlMessage::Announce(a) => {
                if a.name == self.identity.name {
                    return None;
                }
                self.roster.upsert(Peer::new(a.name, from, a.capabilities, now));
                Some(Response::Message(self.acknowledge()))
            }
            ControlMessage::Acknowledge(a) => {
                if a.name != self.identity.name {
                    self.roster.upsert(Peer::new(a.name, from, a.capabilities, now));
                }
                None
            }
            ControlMessage::ImageReady(img) => {
                let ticket = ImageTicket {
                    host: img.host,
                    port: img.port,
                    width: img.width,
                    height: img.height,
                };
                if ticket.is_pullable() {
                    self.pending_image = Some(ticket);
                } else {
                    tracing::warn!(?ticket, "ignoring empty image announcement");
                }
                Some(Response::Reply(Reply::ok()))
            }
            ControlMessage::ImageQuery(_) => {
                Some(Response::Blob(self.collaborators.weather.build_status_blob()))
            }
            ControlMessage::WeatherShare(blob) => {
                self.collaborators.weather.apply_status_blob(&blob);
                Some(Response::Reply(Reply::ok()))
            }
            ControlMessage::PinSet(p) => {
                self.collaborators.pins.set_pin(p.pin, p.state != 0);
                None
            }
        }
    }

    /// A status from an unknown (name, address) pair adds the sender with no
    /// capabilities; its announce fills them in later.
    fn learn_from_status(&mut self, name: &str, from: IpAddr, now: Instant) {
        if name == self.identity.name
            || self.roster.get(name).is_some()
            || self.roster.get_by_addr(from).is_some()
        {
            return;
        }
        self.roster.upsert(Peer::new(name, from, Capabilities::default(), now));
    }

    fn on_status(&self, status: Status) {
        let alarm = &self.collaborators.alarm;
        match status.status {
            StatusKind::Alarm => {
                // Without a sensor, report the sending node.
                let sensor = status.sensor.as_deref().unwrap_or(&status.name);
                alarm.signal_from_peer(sensor);
            }
            StatusKind::Armed => alarm.set_armed_from_peer(ArmState::Armed),
            StatusKind::Night => alarm.set_armed_from_peer(ArmState::Night),
            StatusKind::Disarmed | StatusKind::Reset => {
                alarm.set_armed_from_peer(ArmState::Disarmed);
                alarm.reset_from_peer(&status.name);
            }
        }
    }

    /// Encode `event` for every peer currently in the roster.
    pub fn broadcast(&mut self, event: Event) -> Result<Fanout, EncodeError> {
        let name = self.identity.name.clone();
        let message = match event {
            Event::Armed(state) => ControlMessage::Status(Status {
                status: match state {
                    ArmState::Armed => StatusKind::Armed,
                    ArmState::Disarmed => StatusKind::Disarmed,
                    ArmState::Night => StatusKind::Night,
                },
                name,
                sensor: None,
            }),
            Event::Alarm { sensor } => ControlMessage::Status(Status {
                status: StatusKind::Alarm,
                name,
                sensor: Some(sensor),
            }),
            Event::Reset { user } => ControlMessage::Status(Status {
                status: StatusKind::Reset,
                name: user,
                sensor: None,
            }),
            Event::Weather(blob) => ControlMessage::WeatherShare(blob),
            Event::ImageReady {
                width,
                height,
                host,
                port,
            } => {
                self.image_frame = self.image_frame.wrapping_add(1);
                ControlMessage::ImageReady(ImageReady {
                    frame: self.image_frame,
                    width,
                    height,
                    host,
                    port,
                })
            }
        };
        let payload = wire::encode_message(&message)?;
        Ok(Fanout {
            message,
            payload,
            targets: self.roster.all().to_vec(),
        })
    }

    /// First peer whose capabilities satisfy `pred`.
    pub fn query_peer_for<F>(&self, pred: F) -> Option<Peer>
    where
        F: Fn(&Capabilities) -> bool,
    {
        self.roster.find_by_capability(pred).cloned()
    }

    /// Queue a pull for the next tick. Replaces any pull not yet started.
    pub fn request_image(&mut self, ticket: ImageTicket) -> bool {
        if !ticket.is_pullable() {
            return false;
        }
        self.pending_image = Some(ticket);
        true
    }

    /// Periodic tick: enter Steady, hand over a pending pull, expire stale peers.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        if self.state == NodeState::Discovering {
            self.state = NodeState::Steady;
        }
        let mut actions = Vec::new();
        if let Some(ticket) = self.pending_image.take() {
            actions.push(Action::PullImage(ticket));
        }
        if let Some(ttl) = self.peer_ttl {
            for peer in self.roster.evict_stale(now, ttl) {
                tracing::info!(name = %peer.name, addr = %peer.addr, "peer expired");
                actions.push(Action::PeerExpired(peer));
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::host::testing::{recorder, Call, Recorder};
    use crate::protocol::{ImageQuery, PinSet, ReplyKind};

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    fn node(name: &str, weather: bool) -> (Arc<Recorder>, Coordinator) {
        let (rec, collab) = recorder();
        let identity = Identity {
            name: name.to_string(),
            capabilities: Capabilities {
                weather_feed: weather,
                ..Default::default()
            },
        };
        (rec, Coordinator::new(identity, collab))
    }

    #[test]
    fn alarm_status_signals_once_without_fanout() {
        let (rec, mut core) = node("A", false);
        core.dispatch(
            ip(2),
            ControlMessage::Announce(Announce {
                name: "B".into(),
                capabilities: Capabilities::default(),
            }),
            Instant::now(),
        );

        let resp = core.on_request(
            ip(2),
            br#"{"status":"alarm","name":"B","sensor":"X"}"#,
            Instant::now(),
        );
        assert_eq!(resp, Some(Response::Reply(Reply::ok())));
        assert_eq!(rec.calls(), vec![Call::Signal("X".into())]);
        // Nothing queued for the host beyond the tick's own work.
        assert!(core.tick(Instant::now()).is_empty());
    }

    #[test]
    fn alarm_without_sensor_signals_sender() {
        let (rec, mut core) = node("A", false);
        let resp = core.on_request(ip(2), br#"{"status":"alarm","name":"B"}"#, Instant::now());
        assert_eq!(resp, Some(Response::Reply(Reply::ok())));
        assert_eq!(rec.calls(), vec![Call::Signal("B".into())]);
    }

    #[test]
    fn status_from_unknown_sender_adds_peer() {
        let (_rec, mut core) = node("A", false);
        core.on_request(ip(9), br#"{"status":"armed","name":"C"}"#, Instant::now());
        let peer = core.roster().get("C").unwrap();
        assert_eq!(peer.addr, ip(9));
        assert_eq!(peer.capabilities, Capabilities::default());

        // Known name or known address: no new entry, capabilities kept.
        core.on_datagram(ip(2), br#"{"acknowledge":"B","weather":true}"#, Instant::now());
        core.on_request(ip(2), br#"{"status":"reset","name":"alice"}"#, Instant::now());
        core.on_request(ip(7), br#"{"status":"armed","name":"C"}"#, Instant::now());
        assert_eq!(core.roster().len(), 2);
        assert!(core.roster().get("B").unwrap().capabilities.weather_feed);
        assert_eq!(core.roster().get("C").unwrap().addr, ip(9));
    }

    #[test]
    fn armed_and_disarmed_status() {
        let (rec, mut core) = node("A", false);
        core.on_request(ip(2), br#"{"status":"armed","name":"B"}"#, Instant::now());
        core.on_request(ip(2), br#"{"status":"disarmed","name":"B"}"#, Instant::now());
        core.on_request(ip(2), br#"{"status":"night","name":"B"}"#, Instant::now());
        assert_eq!(
            rec.calls(),
            vec![
                Call::SetArmed(ArmState::Armed),
                Call::SetArmed(ArmState::Disarmed),
                Call::Reset("B".into()),
                Call::SetArmed(ArmState::Night),
            ]
        );
    }

    #[test]
    fn announce_upserts_and_acknowledges() {
        let (_rec, mut core) = node("B", true);
        let resp = core
            .on_datagram(ip(1), br#"{"announce":"A","siren":true}"#, Instant::now())
            .unwrap();
        match resp {
            Response::Message(ControlMessage::Acknowledge(ack)) => {
                assert_eq!(ack.name, "B");
                assert!(ack.capabilities.weather_feed);
            }
            other => panic!("expected Acknowledge, got {other:?}"),
        }
        let peer = core.roster().get("A").unwrap();
        assert_eq!(peer.addr, ip(1));
        assert!(peer.capabilities.siren);
    }

    #[test]
    fn acknowledge_upserts_without_reply() {
        let (_rec, mut core) = node("A", false);
        let resp = core.on_datagram(
            ip(2),
            br#"{"acknowledge":"B","weather":true}"#,
            Instant::now(),
        );
        assert!(resp.is_none());
        assert_eq!(core.roster().len(), 1);
        assert!(core.roster().get("B").unwrap().capabilities.weather_feed);
    }

    #[test]
    fn own_announce_ignored() {
        let (_rec, mut core) = node("A", false);
        let announce = wire::encode_message(&core.announce()).unwrap();
        assert!(core.on_datagram(ip(1), &announce, Instant::now()).is_none());
        assert!(core.roster().is_empty());
    }

    #[test]
    fn malformed_datagram_dropped_but_request_gets_error() {
        let (rec, mut core) = node("A", false);
        assert!(core.on_datagram(ip(2), b"{oops", Instant::now()).is_none());
        match core.on_request(ip(2), b"{oops", Instant::now()) {
            Some(Response::Reply(r)) => assert_eq!(r.reply, ReplyKind::Error),
            other => panic!("expected error reply, got {other:?}"),
        }
        assert!(rec.calls().is_empty());
    }

    #[test]
    fn generic_reply_suppressed_on_datagram() {
        let (rec, mut core) = node("A", false);
        let resp = core.on_datagram(ip(2), br#"{"status":"armed","name":"B"}"#, Instant::now());
        assert!(resp.is_none());
        assert_eq!(rec.calls(), vec![Call::SetArmed(ArmState::Armed)]);
    }

    #[test]
    fn query_returns_weather_blob() {
        let (_rec, mut core) = node("A", true);
        let query = ControlMessage::ImageQuery(ImageQuery::default());
        let resp = core.dispatch(ip(2), query, Instant::now());
        assert_eq!(
            resp,
            Some(Response::Blob(serde_json::json!({"weather": "Clear", "temp": 12})))
        );
    }

    #[test]
    fn weather_share_forwarded() {
        let (rec, mut core) = node("A", false);
        core.on_request(ip(2), br#"{"weather":"Rain","temp":7}"#, Instant::now());
        match &rec.calls()[..] {
            [Call::ApplyWeather(m)] => assert_eq!(m["weather"], "Rain"),
            other => panic!("unexpected calls {other:?}"),
        }
    }

    #[test]
    fn pin_set_has_no_reply() {
        let (rec, mut core) = node("A", false);
        let pin = ControlMessage::PinSet(PinSet { pin: 17, state: 1 });
        let resp = core.dispatch(ip(2), pin, Instant::now());
        assert!(resp.is_none());
        assert_eq!(rec.calls(), vec![Call::SetPin(17, true)]);
    }

    #[test]
    fn image_ready_pulled_on_next_tick() {
        let (_rec, mut core) = node("A", false);
        core.on_request(
            ip(2),
            br#"{"image":1,"w":64,"h":64,"host":"10.0.0.2","port":23457}"#,
            Instant::now(),
        );
        let actions = core.tick(Instant::now());
        assert_eq!(
            actions,
            vec![Action::PullImage(ImageTicket {
                host: "10.0.0.2".into(),
                port: 23457,
                width: 64,
                height: 64,
            })]
        );
        assert!(core.tick(Instant::now()).is_empty());
    }

    #[test]
    fn zero_sized_image_abandoned() {
        let (_rec, mut core) = node("A", false);
        core.on_request(
            ip(2),
            br#"{"image":1,"w":0,"h":64,"host":"10.0.0.2","port":23457}"#,
            Instant::now(),
        );
        assert!(core.tick(Instant::now()).is_empty());
    }

    #[test]
    fn broadcast_targets_roster() {
        let (_rec, mut core) = node("A", false);
        core.on_datagram(ip(2), br#"{"acknowledge":"B"}"#, Instant::now());
        core.on_datagram(ip(3), br#"{"acknowledge":"C"}"#, Instant::now());
        let fanout = core.broadcast(Event::Armed(ArmState::Armed)).unwrap();
        assert_eq!(fanout.targets.len(), 2);
        let decoded = wire::decode_message(&fanout.payload).unwrap();
        assert_eq!(
            decoded,
            ControlMessage::Status(Status {
                status: StatusKind::Armed,
                name: "A".into(),
                sensor: None,
            })
        );
    }

    #[test]
    fn broadcast_weather_requires_key() {
        let (_rec, mut core) = node("A", false);
        let err = core.broadcast(Event::Weather(Map::new())).unwrap_err();
        assert!(matches!(err, EncodeError::NotWeather));
    }

    #[test]
    fn broadcast_weather_with_outranking_key_rejected() {
        let (_rec, mut core) = node("A", false);
        let mut blob = Map::new();
        blob.insert("weather".into(), Value::from("Rain"));
        blob.insert("query".into(), Value::from("x"));
        let err = core.broadcast(Event::Weather(blob)).unwrap_err();
        assert!(matches!(err, EncodeError::WeatherShadowed("query")));
    }

    #[test]
    fn image_frames_increase() {
        let (_rec, mut core) = node("A", false);
        let ev = Event::ImageReady {
            width: 8,
            height: 8,
            host: "10.0.0.1".into(),
            port: 23457,
        };
        let first = core.broadcast(ev.clone()).unwrap();
        let second = core.broadcast(ev).unwrap();
        match (first.message, second.message) {
            (ControlMessage::ImageReady(a), ControlMessage::ImageReady(b)) => {
                assert_eq!(b.frame, a.frame + 1)
            }
            _ => panic!("expected ImageReady"),
        }
    }

    #[test]
    fn state_machine_and_expiry() {
        let (_rec, mut core) = node("A", false);
        assert_eq!(core.state(), NodeState::Starting);
        core.announce();
        assert_eq!(core.state(), NodeState::Discovering);

        let start = Instant::now();
        core.on_datagram(ip(2), br#"{"acknowledge":"B"}"#, start);
        core.tick(start);
        assert_eq!(core.state(), NodeState::Steady);

        // No TTL: never evicted.
        assert!(core.tick(start + Duration::from_secs(3600)).is_empty());
        assert_eq!(core.roster().len(), 1);

        core.set_peer_ttl(Some(Duration::from_secs(60)));
        let actions = core.tick(start + Duration::from_secs(61));
        assert!(matches!(&actions[..], [Action::PeerExpired(p)] if p.name == "B"));
        assert!(core.roster().is_empty());
    }

    #[test]
    fn query_peer_for_capability() {
        let (_rec, mut core) = node("A", false);
        core.on_datagram(ip(2), br#"{"acknowledge":"B"}"#, Instant::now());
        core.on_datagram(ip(3), br#"{"acknowledge":"C","weather":true}"#, Instant::now());
        assert_eq!(core.query_peer_for(|c| c.weather_feed).unwrap().name, "C");
        assert!(core.query_peer_for(|c| c.rfid).is_none());
    }
}
