//! Per-connection packet routing
//!
//! Each connection owns a [`ConnectionContext`] holding its device id, its
//! open session and any pre-roll records. Nothing here is shared between
//! connections.

use std::collections::VecDeque;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::IngestEvent;
use crate::config::PreSessionPolicy;
use crate::error::{BridgeError, Result};
use crate::protocol::{FrameData, Packet, PacketBody, SessionInfo, SnapshotData};
use crate::store::{FrameRecord, Session, SessionStore, SnapshotRecord};

/// Label of sessions that start without one
pub const DEFAULT_LABEL: &str = "unknown";

/// Record that arrived before any session was open
#[derive(Debug, Clone, PartialEq)]
enum PreRoll {
    Frame { timestamp: i64, frame: FrameData },
    Snapshot { timestamp: i64, snapshot: SnapshotData },
}

/// What handling one packet produced
#[derive(Debug, Default, PartialEq)]
pub struct Handled {
    /// Every record the packet carried is now in the store
    pub stored: bool,
    pub events: Vec<IngestEvent>,
}

#[derive(Debug)]
pub struct ConnectionContext {
    connection_id: String,
    device_id: Option<String>,
    session_id: Option<String>,
    policy: PreSessionPolicy,
    pre_roll_limit: usize,
    pre_roll: VecDeque<PreRoll>,
}

impl ConnectionContext {
    pub fn new(connection_id: impl Into<String>, policy: PreSessionPolicy, pre_roll_limit: usize) -> Self {
        Self {
            connection_id: connection_id.into(),
            device_id: None,
            session_id: None,
            policy,
            pre_roll_limit,
            pre_roll: VecDeque::new(),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Device bound to this connection by its first packet
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn pre_roll_len(&self) -> usize {
        self.pre_roll.len()
    }

    /// Route one packet into the store
    ///
    /// The first packet binds the connection to its device id and adopts the
    /// device's open session, if it has one. Packets from another device on
    /// the same connection are rejected.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Protocol` for a foreign device id and
    /// `BridgeError::Storage` if the store fails
    pub fn handle(&mut self, store: &SessionStore, packet: Packet) -> Result<Handled> {
        let mut handled = Handled::default();

        match self.device_id.clone() {
            None => self.bind_device(store, &packet.device_id, &mut handled.events)?,
            Some(bound) if bound != packet.device_id => {
                return Err(BridgeError::Protocol(format!(
                    "connection bound to device {} received a packet from {}",
                    bound, packet.device_id
                )));
            }
            Some(_) => {}
        }

        handled.stored = self.dispatch(store, packet, &mut handled.events)?;
        Ok(handled)
    }

    fn bind_device(&mut self, store: &SessionStore, device_id: &str, events: &mut Vec<IngestEvent>) -> Result<()> {
        if device_id.is_empty() {
            return Err(BridgeError::Protocol("packet without deviceId".to_string()));
        }
        self.device_id = Some(device_id.to_string());
        events.push(IngestEvent::DeviceConnected {
            connection_id: self.connection_id.clone(),
            device_id: device_id.to_string(),
        });

        if let Some(session) = store.latest_open_session(device_id)? {
            info!("Device {} resumed open session {}", device_id, session.id);
            self.session_id = Some(session.id.clone());
            events.push(IngestEvent::SessionStarted {
                device_id: device_id.to_string(),
                session_id: session.id,
                resumed: true,
            });
        }
        Ok(())
    }

    fn dispatch(&mut self, store: &SessionStore, packet: Packet, events: &mut Vec<IngestEvent>) -> Result<bool> {
        let Packet { timestamp, device_id, body } = packet;

        match body {
            PacketBody::SessionStart(info) => self.start_session(store, &device_id, timestamp, info, events),
            PacketBody::SessionEnd(info) => self.end_session(store, &device_id, timestamp, info, events),
            PacketBody::Frame(frame) => self.record(store, PreRoll::Frame { timestamp, frame }),
            PacketBody::Snapshot(snapshot) => self.record(store, PreRoll::Snapshot { timestamp, snapshot }),
            PacketBody::BatchUpload { items, rejected } => {
                let mut all_stored = !items.is_empty() && rejected == 0;
                for item in items {
                    if item.device_id != device_id {
                        warn!("Skipping batch item from foreign device {}", item.device_id);
                        all_stored = false;
                        continue;
                    }
                    match self.dispatch(store, item, events) {
                        Ok(stored) => all_stored &= stored,
                        Err(e) => {
                            warn!("Failed to store batch item: {}", e);
                            all_stored = false;
                        }
                    }
                }
                Ok(all_stored)
            }
        }
    }

    fn start_session(
        &mut self,
        store: &SessionStore,
        device_id: &str,
        timestamp: i64,
        info: SessionInfo,
        events: &mut Vec<IngestEvent>,
    ) -> Result<bool> {
        let requested = info.session_id.clone().filter(|id| !id.is_empty());

        if let (Some(current), Some(requested)) = (&self.session_id, &requested) {
            if current == requested {
                debug!("Session {} already open on this connection", current);
                return Ok(true);
            }
        }
        if let Some(previous) = self.session_id.take() {
            store.end_session(&previous, timestamp)?;
            info!("Closed session {} superseded by a new session_start", previous);
            events.push(IngestEvent::SessionEnded { device_id: device_id.to_string(), session_id: previous });
        }

        let mut session_id = requested.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut resumed = false;

        if let Some(existing) = store.get_session(&session_id)? {
            if existing.device_id == device_id && existing.end_time.is_none() {
                resumed = true;
            } else {
                let fresh = Uuid::new_v4().to_string();
                warn!("Session id {} is not resumable, using {}", session_id, fresh);
                session_id = fresh;
            }
        }

        if !resumed {
            store.create_session(&Session {
                id: session_id.clone(),
                device_id: device_id.to_string(),
                label: info.label.unwrap_or_else(|| DEFAULT_LABEL.to_string()),
                start_time: info.start_time.unwrap_or(timestamp),
                end_time: None,
            })?;
        }

        info!(
            "{} session {} for device {}",
            if resumed { "Resumed" } else { "Started" },
            session_id,
            device_id
        );
        self.session_id = Some(session_id.clone());
        events.push(IngestEvent::SessionStarted { device_id: device_id.to_string(), session_id, resumed });

        self.attach_pre_roll(store)?;
        Ok(true)
    }

    fn end_session(
        &mut self,
        store: &SessionStore,
        device_id: &str,
        timestamp: i64,
        info: SessionInfo,
        events: &mut Vec<IngestEvent>,
    ) -> Result<bool> {
        let target = match self.session_id.take() {
            Some(current) => Some(current),
            None => match info.session_id.as_deref() {
                Some(id) => store
                    .get_session(id)?
                    .filter(|s| s.device_id == device_id && s.end_time.is_none())
                    .map(|s| s.id),
                None => None,
            },
        };

        let Some(session_id) = target else {
            debug!("session_end without an open session from {}", device_id);
            return Ok(false);
        };

        store.end_session(&session_id, info.end_time.unwrap_or(timestamp))?;
        info!("Ended session {} for device {}", session_id, device_id);
        events.push(IngestEvent::SessionEnded { device_id: device_id.to_string(), session_id });
        Ok(true)
    }

    fn record(&mut self, store: &SessionStore, record: PreRoll) -> Result<bool> {
        if let Some(session_id) = &self.session_id {
            insert(store, session_id, record)?;
            return Ok(true);
        }

        match self.policy {
            PreSessionPolicy::Drop => {
                debug!("Dropping record received before any session");
            }
            PreSessionPolicy::Buffer => {
                if self.pre_roll_limit == 0 {
                    return Ok(false);
                }
                if self.pre_roll.len() >= self.pre_roll_limit {
                    self.pre_roll.pop_front();
                    debug!("Pre-roll full, discarded the oldest record");
                }
                self.pre_roll.push_back(record);
            }
        }
        Ok(false)
    }

    fn attach_pre_roll(&mut self, store: &SessionStore) -> Result<()> {
        let Some(session_id) = self.session_id.clone() else {
            return Ok(());
        };
        if self.pre_roll.is_empty() {
            return Ok(());
        }

        let count = self.pre_roll.len();
        while let Some(record) = self.pre_roll.pop_front() {
            insert(store, &session_id, record)?;
        }
        info!("Attached {} pre-roll record(s) to session {}", count, session_id);
        Ok(())
    }
}

fn insert(store: &SessionStore, session_id: &str, record: PreRoll) -> Result<()> {
    match record {
        PreRoll::Frame { timestamp, frame } => store.add_frame(&FrameRecord {
            session_id: session_id.to_string(),
            timestamp,
            fps: frame.fps,
            frame_time: frame.frame_time,
            jank: frame.jank,
        }),
        PreRoll::Snapshot { timestamp, snapshot } => store.add_snapshot(&SnapshotRecord {
            session_id: session_id.to_string(),
            timestamp,
            snapshot,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(device: &str, timestamp: i64, body: PacketBody) -> Packet {
        Packet { timestamp, device_id: device.to_string(), body }
    }

    fn start(id: Option<&str>) -> PacketBody {
        PacketBody::SessionStart(SessionInfo {
            session_id: id.map(str::to_string),
            label: Some("Racer".to_string()),
            ..Default::default()
        })
    }

    fn end() -> PacketBody {
        PacketBody::SessionEnd(SessionInfo::default())
    }

    fn frame(fps: f64) -> PacketBody {
        PacketBody::Frame(FrameData { fps, frame_time: 1000.0 / fps, jank: false })
    }

    fn context(policy: PreSessionPolicy) -> ConnectionContext {
        ConnectionContext::new("conn-1", policy, 2)
    }

    #[test]
    fn test_session_lifecycle() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut ctx = context(PreSessionPolicy::Drop);

        let handled = ctx.handle(&store, packet("dev-1", 100, start(Some("S1")))).unwrap();
        assert!(handled.stored);
        assert_eq!(
            handled.events,
            vec![
                IngestEvent::DeviceConnected { connection_id: "conn-1".into(), device_id: "dev-1".into() },
                IngestEvent::SessionStarted { device_id: "dev-1".into(), session_id: "S1".into(), resumed: false },
            ]
        );

        for (i, fps) in [60.0, 58.0, 30.0].into_iter().enumerate() {
            assert!(ctx.handle(&store, packet("dev-1", 200 + i as i64, frame(fps))).unwrap().stored);
        }
        let handled = ctx.handle(&store, packet("dev-1", 900, end())).unwrap();
        assert_eq!(handled.events, vec![IngestEvent::SessionEnded { device_id: "dev-1".into(), session_id: "S1".into() }]);

        let session = store.get_session("S1").unwrap().unwrap();
        assert_eq!(session.label, "Racer");
        assert_eq!(session.start_time, 100);
        assert_eq!(session.end_time, Some(900));
        assert_eq!(store.session_frames("S1").unwrap().len(), 3);
        assert_eq!(ctx.session_id(), None);
    }

    #[test]
    fn test_session_without_id_gets_uuid() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut ctx = context(PreSessionPolicy::Drop);

        ctx.handle(&store, packet("dev-1", 100, start(None))).unwrap();
        let id = ctx.session_id().unwrap().to_string();
        assert!(Uuid::parse_str(&id).is_ok());
        assert_eq!(store.get_session(&id).unwrap().unwrap().label, "Racer");
    }

    #[test]
    fn test_frames_before_session_dropped() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut ctx = context(PreSessionPolicy::Drop);

        assert!(!ctx.handle(&store, packet("dev-1", 50, frame(60.0))).unwrap().stored);
        ctx.handle(&store, packet("dev-1", 100, start(Some("S1")))).unwrap();

        assert!(store.session_frames("S1").unwrap().is_empty());
        assert_eq!(ctx.pre_roll_len(), 0);
    }

    #[test]
    fn test_pre_roll_buffered_and_attached() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut ctx = context(PreSessionPolicy::Buffer);

        for ts in [10, 20, 30] {
            assert!(!ctx.handle(&store, packet("dev-1", ts, frame(60.0))).unwrap().stored);
        }
        assert_eq!(ctx.pre_roll_len(), 2);

        ctx.handle(&store, packet("dev-1", 100, start(Some("S1")))).unwrap();
        let frames = store.session_frames("S1").unwrap();
        assert_eq!(frames.iter().map(|f| f.timestamp).collect::<Vec<_>>(), vec![20, 30]);
        assert_eq!(ctx.pre_roll_len(), 0);
    }

    #[test]
    fn test_repeated_start_resumes_open_session() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut first = context(PreSessionPolicy::Drop);
        first.handle(&store, packet("dev-1", 100, start(Some("S1")))).unwrap();
        first.handle(&store, packet("dev-1", 110, frame(60.0))).unwrap();

        // same connection
        let handled = first.handle(&store, packet("dev-1", 120, start(Some("S1")))).unwrap();
        assert!(handled.events.is_empty());

        // new connection after a reconnect
        let mut second = ConnectionContext::new("conn-2", PreSessionPolicy::Drop, 0);
        let handled = second.handle(&store, packet("dev-1", 130, frame(59.0))).unwrap();
        assert!(handled.stored);
        assert!(handled.events.contains(&IngestEvent::SessionStarted {
            device_id: "dev-1".into(),
            session_id: "S1".into(),
            resumed: true,
        }));
        assert_eq!(store.session_frames("S1").unwrap().len(), 2);
        assert_eq!(store.list_sessions(10).unwrap().len(), 1);
    }

    #[test]
    fn test_closed_session_id_is_not_reused() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut ctx = context(PreSessionPolicy::Drop);
        ctx.handle(&store, packet("dev-1", 100, start(Some("S1")))).unwrap();
        ctx.handle(&store, packet("dev-1", 200, end())).unwrap();

        ctx.handle(&store, packet("dev-1", 300, start(Some("S1")))).unwrap();
        let new_id = ctx.session_id().unwrap();
        assert_ne!(new_id, "S1");
        assert_eq!(store.get_session("S1").unwrap().unwrap().end_time, Some(200));
    }

    #[test]
    fn test_new_start_closes_previous_session() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut ctx = context(PreSessionPolicy::Drop);
        ctx.handle(&store, packet("dev-1", 100, start(Some("S1")))).unwrap();

        let handled = ctx.handle(&store, packet("dev-1", 500, start(Some("S2")))).unwrap();
        assert_eq!(handled.events[0], IngestEvent::SessionEnded { device_id: "dev-1".into(), session_id: "S1".into() });
        assert_eq!(store.get_session("S1").unwrap().unwrap().end_time, Some(500));
        assert_eq!(ctx.session_id(), Some("S2"));
    }

    #[test]
    fn test_end_without_session_not_stored() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut ctx = context(PreSessionPolicy::Drop);
        let handled = ctx.handle(&store, packet("dev-1", 100, end())).unwrap();
        assert!(!handled.stored);
    }

    #[test]
    fn test_batch_dispatches_in_order() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut ctx = context(PreSessionPolicy::Drop);

        let items = vec![
            packet("dev-1", 100, start(Some("S1"))),
            packet("dev-1", 110, frame(60.0)),
            packet("dev-1", 120, frame(55.0)),
            packet("dev-1", 130, end()),
        ];
        let handled = ctx.handle(&store, packet("dev-1", 140, PacketBody::BatchUpload { items, rejected: 0 })).unwrap();

        assert!(handled.stored);
        assert_eq!(store.session_frames("S1").unwrap().len(), 2);
        assert_eq!(store.get_session("S1").unwrap().unwrap().end_time, Some(130));
    }

    #[test]
    fn test_foreign_device_rejected() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut ctx = context(PreSessionPolicy::Drop);
        ctx.handle(&store, packet("dev-1", 100, start(Some("S1")))).unwrap();

        let result = ctx.handle(&store, packet("dev-2", 110, frame(60.0)));
        assert!(matches!(result, Err(BridgeError::Protocol(_))));
        assert!(store.session_frames("S1").unwrap().is_empty());
    }

    #[test]
    fn test_empty_device_id_rejected() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut ctx = context(PreSessionPolicy::Drop);
        assert!(ctx.handle(&store, packet("", 100, frame(60.0))).is_err());
        assert_eq!(ctx.device_id(), None);
    }
}
