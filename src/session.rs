//! Connection session and its state machine.
//!
//! One [`ControllerSession`] owns one logical link to a controller: it walks
//! scan → connect → subscribe → stream, folds telemetry frames while
//! streaming, and applies the configured retry policy when the link fails.
//! All state and telemetry mutation happens on the session's own event-loop
//! task; transport callbacks only cross into it through the transport's
//! event channel, so there is a single writer per session by construction.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{
    CentralTransport, CharacteristicHandle, ConnectionHandle, TargetId, TransportEvent,
};
use crate::ble::uuids::{FARDRIVER_CHARACTERISTIC_UUID, FARDRIVER_SERVICE_UUID};
use crate::data::telemetry::Telemetry;
use crate::protocol::frame::{Frame, FRAME_LEN, KEEP_ALIVE_COMMAND};

/// States of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// No scan in progress; initial and terminal state.
    #[default]
    Idle,
    /// Looking for an advertiser exposing the expected service.
    Scanning,
    /// A matching advertiser was observed; scan halted, target recorded.
    Found,
    /// Transport connection attempt in flight.
    Connecting,
    /// Looking up the service/characteristic and registering for
    /// notifications.
    Subscribing,
    /// Subscribed; inbound frames are folded into telemetry.
    Streaming,
    /// The current attempt ended; retry policy decides what happens next.
    Disconnected,
}

impl SessionState {
    /// Check if the session is streaming telemetry.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming)
    }

    /// Check if the session holds or is establishing a link.
    pub fn has_link(&self) -> bool {
        matches!(self, Self::Connecting | Self::Subscribing | Self::Streaming)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Found => write!(f, "Found"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Subscribing => write!(f, "Subscribing"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Disconnected => write!(f, "Disconnected"),
        }
    }
}

/// What to do after a connection attempt fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Keep rescanning until explicitly stopped; the reference firmware's
    /// behavior.
    Indefinite,
    /// Give up after this many consecutive failed attempts.
    Bounded {
        /// Maximum consecutive failed attempts before giving up.
        max_attempts: u32,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Indefinite
    }
}

/// Configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Service the target advertises.
    pub service_uuid: Uuid,
    /// Characteristic carrying telemetry notifications.
    pub characteristic_uuid: Uuid,
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// What to do after a failed attempt.
    pub retry: RetryPolicy,
    /// Delay between a failure and the next scan.
    pub retry_backoff: Duration,
    /// Interval for the keep-alive command while streaming, or `None` to
    /// disable it (the real controller stops notifying without it).
    pub keep_alive_interval: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_uuid: FARDRIVER_SERVICE_UUID,
            characteristic_uuid: FARDRIVER_CHARACTERISTIC_UUID,
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::Indefinite,
            retry_backoff: Duration::from_secs(1),
            keep_alive_interval: Some(Duration::from_secs(2)),
        }
    }
}

/// Event for session state changes.
#[derive(Debug, Clone)]
pub struct StateChange {
    /// The target the session is locked onto, if any.
    pub target: Option<TargetId>,
    /// The new state.
    pub state: SessionState,
}

/// State shared between the session handle and its event-loop task.
struct Shared {
    config: SessionConfig,
    state: RwLock<SessionState>,
    target: RwLock<Option<TargetId>>,
    /// Peer we have connected to before; reconnects to it skip the
    /// service-directory refresh.
    known_peer: RwLock<Option<TargetId>>,
    conn: RwLock<Option<ConnectionHandle>>,
    characteristic: RwLock<Option<CharacteristicHandle>>,
    telemetry: RwLock<Telemetry>,
    /// Consecutive failed connection attempts.
    attempts: AtomicU32,
    /// Frames dropped by the decoder, for observability.
    dropped_frames: AtomicU64,
    is_running: AtomicBool,
    shutdown: Notify,
    state_tx: broadcast::Sender<StateChange>,
    telemetry_tx: broadcast::Sender<Telemetry>,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// The single place session state changes.
    fn transition(&self, new_state: SessionState) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };

        if old_state != new_state {
            debug!("Session state changed: {} -> {}", old_state, new_state);

            let _ = self.state_tx.send(StateChange {
                target: self.target.read().clone(),
                state: new_state,
            });
        }
    }
}

/// A session's event-loop half; consumed by the spawned task.
struct Driver {
    transport: Arc<dyn CentralTransport>,
    shared: Arc<Shared>,
}

impl Driver {
    async fn run(self) {
        let mut events = self.transport.events();

        let keep_alive_enabled = self.shared.config.keep_alive_interval.is_some();
        let mut keep_alive = tokio::time::interval(
            self.shared
                .config
                .keep_alive_interval
                .unwrap_or(Duration::from_secs(3600)),
        );
        keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        self.shared.transition(SessionState::Scanning);
        if let Err(e) = self
            .transport
            .start_scan(self.shared.config.service_uuid)
            .await
        {
            warn!("Failed to start scan: {}", e);
            if !self.enter_disconnected().await {
                self.finish().await;
                return;
            }
        }

        loop {
            if !self.shared.is_running() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.shared.shutdown.notified() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        if !self.handle_event(event).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Session lagged {} transport events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Transport event channel closed");
                        break;
                    }
                },
                _ = keep_alive.tick(), if keep_alive_enabled && self.shared.state().is_streaming() => {
                    if !self.send_keep_alive().await {
                        break;
                    }
                }
            }
        }

        self.finish().await;
    }

    /// Dispatch one transport event. Returns `false` when the session is
    /// done (gave up or was stopped).
    async fn handle_event(&self, event: TransportEvent) -> bool {
        match event {
            TransportEvent::AdvertiserFound { target, rssi } => {
                self.on_advertiser(target, rssi).await
            }
            TransportEvent::Notification { target, data } => {
                self.on_notification(&target, &data);
                true
            }
            TransportEvent::Disconnected { target } => self.on_link_down(&target).await,
        }
    }

    async fn on_advertiser(&self, target: TargetId, rssi: Option<i16>) -> bool {
        if self.shared.state() != SessionState::Scanning {
            // At most one attempt in flight; repeat sightings of the target
            // while connecting or streaming are not interesting.
            trace!(
                "Ignoring advertiser {} while {}",
                target,
                self.shared.state()
            );
            return true;
        }

        info!("Found controller {} (rssi {:?})", target, rssi);

        // Halt the scan before connecting to save radio time.
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        *self.shared.target.write() = Some(target.clone());
        self.shared.transition(SessionState::Found);

        self.try_connect(target).await
    }

    async fn try_connect(&self, target: TargetId) -> bool {
        self.shared.transition(SessionState::Connecting);

        // A previously-connected peer keeps its service directory; skip the
        // refresh and reconnect cheaply.
        let known = self.shared.known_peer.read().as_ref() == Some(&target);
        let refresh_services = !known;

        let attempt = self.transport.connect(&target, refresh_services);
        match tokio::time::timeout(self.shared.config.connect_timeout, attempt).await {
            Ok(Ok(conn)) => {
                *self.shared.conn.write() = Some(conn);
                *self.shared.known_peer.write() = Some(target);
                self.try_subscribe().await
            }
            Ok(Err(e)) => {
                warn!("Connect to {} failed: {}", target, e);
                self.fail_attempt().await
            }
            Err(_) => {
                warn!(
                    "Connect to {} timed out after {:?}",
                    target, self.shared.config.connect_timeout
                );
                self.fail_attempt().await
            }
        }
    }

    async fn try_subscribe(&self) -> bool {
        self.shared.transition(SessionState::Subscribing);

        let Some(conn) = self.shared.conn.read().clone() else {
            return self.fail_attempt().await;
        };

        let characteristic = self
            .transport
            .characteristic(
                &conn,
                self.shared.config.service_uuid,
                self.shared.config.characteristic_uuid,
            )
            .await;

        let Some(characteristic) = characteristic else {
            // The peripheral advertised our service but does not actually
            // expose it; treat as a connection failure.
            warn!(
                "Service {} / characteristic {} missing on {}",
                self.shared.config.service_uuid,
                self.shared.config.characteristic_uuid,
                conn.target
            );
            self.drop_link().await;
            return self.fail_attempt().await;
        };

        if let Err(e) = self.transport.subscribe(&characteristic).await {
            // Never leave a half-subscribed link open.
            warn!("Subscribe failed on {}: {}", conn.target, e);
            self.drop_link().await;
            return self.fail_attempt().await;
        }

        *self.shared.characteristic.write() = Some(characteristic);
        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.transition(SessionState::Streaming);

        info!("Streaming telemetry from {}", conn.target);

        true
    }

    fn on_notification(&self, target: &TargetId, data: &[u8]) {
        // No folding after cancellation, even for in-flight notifications.
        if !self.shared.is_running() {
            return;
        }

        if !self.shared.state().is_streaming() {
            trace!("Ignoring notification while {}", self.shared.state());
            return;
        }

        if self.shared.target.read().as_ref() != Some(target) {
            return;
        }

        // Anything that is not a whole frame is noise, not a protocol
        // violation; the transport delivers notifications atomically.
        if data.len() != FRAME_LEN {
            trace!("Discarding {}-byte notification", data.len());
            return;
        }

        match Frame::decode(data) {
            Ok(frame) => {
                let snapshot = {
                    let mut telemetry = self.shared.telemetry.write();
                    telemetry.fold(&frame);
                    telemetry.clone()
                };
                let _ = self.shared.telemetry_tx.send(snapshot);
            }
            Err(e) => {
                self.shared.dropped_frames.fetch_add(1, Ordering::Relaxed);
                debug!("Dropping invalid frame: {}", e);
            }
        }
    }

    async fn on_link_down(&self, target: &TargetId) -> bool {
        if self.shared.target.read().as_ref() != Some(target) {
            return true;
        }

        if !self.shared.state().has_link() {
            return true;
        }

        info!("Link to {} lost", target);

        *self.shared.conn.write() = None;
        *self.shared.characteristic.write() = None;

        self.enter_disconnected().await
    }

    /// Send the periodic keep-alive; a failed write means the link is gone.
    async fn send_keep_alive(&self) -> bool {
        let Some(characteristic) = self.shared.characteristic.read().clone() else {
            return true;
        };

        trace!("Writing keep-alive to {}", characteristic.target);

        if let Err(e) = self.transport.write(&characteristic, &KEEP_ALIVE_COMMAND).await {
            warn!("Keep-alive write failed: {}", e);
            self.drop_link().await;
            return self.enter_disconnected().await;
        }

        true
    }

    /// Record a failed attempt, then run the retry policy.
    async fn fail_attempt(&self) -> bool {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        self.enter_disconnected().await
    }

    /// Enter `Disconnected` and apply the retry policy: either back off and
    /// rescan, or give up and settle in `Idle`. Returns `false` when the
    /// session is done.
    async fn enter_disconnected(&self) -> bool {
        loop {
            self.shared.transition(SessionState::Disconnected);
            *self.shared.conn.write() = None;
            *self.shared.characteristic.write() = None;

            let attempts = self.shared.attempts.load(Ordering::SeqCst);
            let give_up = match self.shared.config.retry {
                RetryPolicy::Indefinite => false,
                RetryPolicy::Bounded { max_attempts } => attempts >= max_attempts,
            };

            if give_up || !self.shared.is_running() {
                if give_up {
                    info!("Giving up after {} failed attempts", attempts);
                }
                *self.shared.target.write() = None;
                self.shared.transition(SessionState::Idle);
                return false;
            }

            debug!(
                "Retrying in {:?} (failed attempts: {})",
                self.shared.config.retry_backoff, attempts
            );

            tokio::select! {
                biased;
                _ = self.shared.shutdown.notified() => return false,
                _ = tokio::time::sleep(self.shared.config.retry_backoff) => {}
            }

            if !self.shared.is_running() {
                return false;
            }

            *self.shared.target.write() = None;
            self.shared.transition(SessionState::Scanning);

            match self
                .transport
                .start_scan(self.shared.config.service_uuid)
                .await
            {
                Ok(()) => return true,
                Err(e) => {
                    warn!("Rescan failed: {}", e);
                    self.shared.attempts.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    /// Release whatever the session currently holds, in order.
    async fn drop_link(&self) {
        *self.shared.characteristic.write() = None;

        let conn = self.shared.conn.write().take();
        if let Some(conn) = conn {
            if let Err(e) = self.transport.disconnect(&conn).await {
                warn!("Disconnect from {} failed: {}", conn.target, e);
            }
        }
    }

    /// Ordered teardown when the event loop exits.
    async fn finish(&self) {
        match self.shared.state() {
            SessionState::Scanning | SessionState::Found => {
                if let Err(e) = self.transport.stop_scan().await {
                    warn!("Failed to stop scan during teardown: {}", e);
                }
            }
            state if state.has_link() => {
                self.drop_link().await;
            }
            _ => {}
        }

        *self.shared.target.write() = None;
        self.shared.transition(SessionState::Idle);
        self.shared.is_running.store(false, Ordering::SeqCst);

        debug!("Session event loop ended");
    }
}

/// One logical link to a controller.
///
/// Created in `Idle`; [`start`](Self::start) drives it through the state
/// machine on a background task, and [`stop`](Self::stop) tears it down from
/// any state.
pub struct ControllerSession {
    transport: Arc<dyn CentralTransport>,
    shared: Arc<Shared>,
    task: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl ControllerSession {
    /// Create a new session over the given transport.
    pub fn new(transport: Arc<dyn CentralTransport>, config: SessionConfig) -> Self {
        let (state_tx, _) = broadcast::channel(32);
        let (telemetry_tx, _) = broadcast::channel(64);

        Self {
            transport,
            shared: Arc::new(Shared {
                config,
                state: RwLock::new(SessionState::Idle),
                target: RwLock::new(None),
                known_peer: RwLock::new(None),
                conn: RwLock::new(None),
                characteristic: RwLock::new(None),
                telemetry: RwLock::new(Telemetry::new()),
                attempts: AtomicU32::new(0),
                dropped_frames: AtomicU64::new(0),
                is_running: AtomicBool::new(false),
                shutdown: Notify::new(),
                state_tx,
                telemetry_tx,
            }),
            task: RwLock::new(None),
        }
    }

    /// Start the session; it begins scanning immediately.
    pub fn start(&self) {
        if self.shared.is_running.swap(true, Ordering::SeqCst) {
            debug!("Session already running");
            return;
        }

        let driver = Driver {
            transport: self.transport.clone(),
            shared: self.shared.clone(),
        };

        let handle = tokio::spawn(driver.run());
        *self.task.write() = Some(handle);
    }

    /// Stop the session from any state.
    ///
    /// Scanning is stopped, an in-flight attempt is abandoned and its
    /// connection released, a streaming link is disconnected. Telemetry
    /// accumulated so far is kept.
    pub async fn stop(&self) {
        self.shared.is_running.store(false, Ordering::SeqCst);
        self.shared.shutdown.notify_one();

        let handle = self.task.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Get the current state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Check if the session's event loop is running.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Identity of the controller this session is locked onto, if any.
    pub fn target(&self) -> Option<TargetId> {
        self.shared.target.read().clone()
    }

    /// Snapshot of the accumulated telemetry.
    pub fn telemetry(&self) -> Telemetry {
        self.shared.telemetry.read().clone()
    }

    /// Consecutive failed connection attempts so far.
    pub fn failed_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Frames dropped by the decoder since the session was created.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped_frames.load(Ordering::Relaxed)
    }

    /// Subscribe to state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChange> {
        self.shared.state_tx.subscribe()
    }

    /// Subscribe to telemetry snapshots, one per folded frame.
    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<Telemetry> {
        self.shared.telemetry_tx.subscribe()
    }
}

impl std::fmt::Debug for ControllerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerSession")
            .field("state", &self.state())
            .field("target", &self.target())
            .field("failed_attempts", &self.failed_attempts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::protocol::frame::Gear;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::time::Instant;

    /// Scriptable fake transport driving the state machine without a radio.
    struct FakeCentral {
        event_tx: broadcast::Sender<TransportEvent>,
        scan_starts: AtomicU32,
        scan_stops: AtomicU32,
        connects: Mutex<Vec<(TargetId, bool)>>,
        /// Fail this many connects before succeeding.
        connect_failures: AtomicU32,
        /// Artificial connect latency in milliseconds.
        connect_delay_ms: AtomicU64,
        has_characteristic: AtomicBool,
        subscribe_ok: AtomicBool,
        write_ok: AtomicBool,
        writes: Mutex<Vec<Vec<u8>>>,
        disconnects: AtomicU32,
    }

    impl FakeCentral {
        fn new() -> Arc<Self> {
            let (event_tx, _) = broadcast::channel(64);
            Arc::new(Self {
                event_tx,
                scan_starts: AtomicU32::new(0),
                scan_stops: AtomicU32::new(0),
                connects: Mutex::new(Vec::new()),
                connect_failures: AtomicU32::new(0),
                connect_delay_ms: AtomicU64::new(0),
                has_characteristic: AtomicBool::new(true),
                subscribe_ok: AtomicBool::new(true),
                write_ok: AtomicBool::new(true),
                writes: Mutex::new(Vec::new()),
                disconnects: AtomicU32::new(0),
            })
        }

        fn emit(&self, event: TransportEvent) {
            let _ = self.event_tx.send(event);
        }

        fn emit_advertiser(&self, target: &str) {
            self.emit(TransportEvent::AdvertiserFound {
                target: target.to_string(),
                rssi: Some(-60),
            });
        }

        fn emit_frame(&self, target: &str, frame: &Frame) {
            self.emit(TransportEvent::Notification {
                target: target.to_string(),
                data: Bytes::copy_from_slice(&frame.encode()),
            });
        }
    }

    #[async_trait]
    impl CentralTransport for FakeCentral {
        async fn start_scan(&self, _service: Uuid) -> Result<()> {
            self.scan_starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_scan(&self) -> Result<()> {
            self.scan_stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn connect(
            &self,
            target: &TargetId,
            refresh_services: bool,
        ) -> Result<ConnectionHandle> {
            self.connects.lock().push((target.clone(), refresh_services));

            let delay_ms = self.connect_delay_ms.load(Ordering::SeqCst);
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }

            let failures = self.connect_failures.load(Ordering::SeqCst);
            if failures > 0 {
                self.connect_failures.store(failures - 1, Ordering::SeqCst);
                return Err(Error::ConnectionFailed {
                    reason: "scripted failure".to_string(),
                });
            }

            Ok(ConnectionHandle {
                target: target.clone(),
            })
        }

        async fn characteristic(
            &self,
            conn: &ConnectionHandle,
            _service: Uuid,
            characteristic: Uuid,
        ) -> Option<CharacteristicHandle> {
            if self.has_characteristic.load(Ordering::SeqCst) {
                Some(CharacteristicHandle {
                    target: conn.target.clone(),
                    uuid: characteristic,
                })
            } else {
                None
            }
        }

        async fn subscribe(&self, _characteristic: &CharacteristicHandle) -> Result<()> {
            if self.subscribe_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::NotSupported {
                    operation: "subscribe".to_string(),
                })
            }
        }

        async fn write(&self, _characteristic: &CharacteristicHandle, data: &[u8]) -> Result<()> {
            self.writes.lock().push(data.to_vec());
            if self.write_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::ConnectionLost)
            }
        }

        async fn disconnect(&self, _conn: &ConnectionHandle) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn events(&self) -> broadcast::Receiver<TransportEvent> {
            self.event_tx.subscribe()
        }
    }

    async fn wait_for_state(session: &ControllerSession, want: SessionState) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if session.state() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "session never reached {:?}, stuck in {:?}",
            want,
            session.state()
        );
    }

    /// Settle time for events already queued on the session task.
    async fn drain() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn quick_retry_config() -> SessionConfig {
        SessionConfig {
            retry_backoff: Duration::from_millis(10),
            keep_alive_interval: None,
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_reaches_scanning() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("fardriver_rust_ble=debug")
            .try_init();

        let fake = FakeCentral::new();
        let session = ControllerSession::new(fake.clone(), quick_retry_config());

        assert_eq!(session.state(), SessionState::Idle);
        session.start();

        wait_for_state(&session, SessionState::Scanning).await;
        assert_eq!(fake.scan_starts.load(Ordering::SeqCst), 1);

        session.stop().await;
    }

    #[tokio::test]
    async fn test_advertiser_walks_to_streaming() {
        let fake = FakeCentral::new();
        let session = ControllerSession::new(fake.clone(), quick_retry_config());

        session.start();
        wait_for_state(&session, SessionState::Scanning).await;

        fake.emit_advertiser("ctrl-1");
        wait_for_state(&session, SessionState::Streaming).await;

        // Scan was halted once the target was found.
        assert_eq!(fake.scan_stops.load(Ordering::SeqCst), 1);
        assert_eq!(session.target().as_deref(), Some("ctrl-1"));

        // First contact fetches the service directory.
        let connects = fake.connects.lock().clone();
        assert_eq!(connects, vec![("ctrl-1".to_string(), true)]);

        session.stop().await;
    }

    #[tokio::test]
    async fn test_failed_connect_never_streams() {
        let fake = FakeCentral::new();
        fake.connect_failures.store(1, Ordering::SeqCst);

        let session = ControllerSession::new(
            fake.clone(),
            SessionConfig {
                retry: RetryPolicy::Bounded { max_attempts: 1 },
                ..quick_retry_config()
            },
        );

        let mut states = session.subscribe_state();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_task = {
            let seen = seen.clone();
            tokio::spawn(async move {
                while let Ok(change) = states.recv().await {
                    seen.lock().push(change.state);
                }
            })
        };

        session.start();
        wait_for_state(&session, SessionState::Scanning).await;
        fake.emit_advertiser("ctrl-1");

        wait_for_state(&session, SessionState::Idle).await;
        drain().await;
        seen_task.abort();

        let seen = seen.lock().clone();
        assert!(seen.contains(&SessionState::Disconnected));
        assert!(!seen.contains(&SessionState::Streaming));

        // Target identity cleared on terminal failure.
        assert_eq!(session.target(), None);
        assert_eq!(session.failed_attempts(), 1);
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_duplicate_advertiser_spawns_no_second_connect() {
        let fake = FakeCentral::new();
        // Make connect slow enough that the second sighting lands mid-attempt.
        fake.connect_delay_ms.store(100, Ordering::SeqCst);

        let session = ControllerSession::new(fake.clone(), quick_retry_config());
        session.start();
        wait_for_state(&session, SessionState::Scanning).await;

        fake.emit_advertiser("ctrl-1");
        tokio::time::sleep(Duration::from_millis(20)).await;
        fake.emit_advertiser("ctrl-1");

        wait_for_state(&session, SessionState::Streaming).await;
        drain().await;

        assert_eq!(fake.connects.lock().len(), 1);

        session.stop().await;
    }

    #[tokio::test]
    async fn test_streaming_fidelity() {
        let fake = FakeCentral::new();
        let session = ControllerSession::new(fake.clone(), quick_retry_config());

        session.start();
        wait_for_state(&session, SessionState::Scanning).await;
        fake.emit_advertiser("ctrl-1");
        wait_for_state(&session, SessionState::Streaming).await;

        fake.emit_frame(
            "ctrl-1",
            &Frame::MotorTemp {
                celsius: 50,
                throttle: 2048,
            },
        );
        fake.emit_frame("ctrl-1", &Frame::Voltage { voltage_raw: 900 });
        fake.emit_frame(
            "ctrl-1",
            &Frame::Main {
                gear: Gear::Mid,
                rpm: 1200,
                iq_raw: 500,
                id_raw: 200,
            },
        );
        drain().await;

        let telemetry = session.telemetry();
        assert_eq!(telemetry.voltage, Some(90.0));
        assert_eq!(telemetry.rpm, Some(1200));
        // Unrelated fields untouched by later frames.
        assert_eq!(telemetry.motor_temp, Some(50));
        assert_eq!(telemetry.throttle, Some(2048));

        session.stop().await;
    }

    #[tokio::test]
    async fn test_noise_and_invalid_frames_dropped() {
        let fake = FakeCentral::new();
        let session = ControllerSession::new(fake.clone(), quick_retry_config());

        session.start();
        wait_for_state(&session, SessionState::Scanning).await;
        fake.emit_advertiser("ctrl-1");
        wait_for_state(&session, SessionState::Streaming).await;

        // Wrong length: silently discarded as noise, not even counted.
        fake.emit(TransportEvent::Notification {
            target: "ctrl-1".to_string(),
            data: Bytes::from_static(&[0xAA, 0x01, 0x02]),
        });

        // Right length, bad header: dropped and counted.
        let mut bad = Frame::Voltage { voltage_raw: 900 }.encode();
        bad[0] = 0x55;
        fake.emit(TransportEvent::Notification {
            target: "ctrl-1".to_string(),
            data: Bytes::copy_from_slice(&bad),
        });

        drain().await;

        let telemetry = session.telemetry();
        assert_eq!(telemetry.voltage, None);
        assert_eq!(session.dropped_frames(), 1);
        // Session state unaffected by bad frames.
        assert_eq!(session.state(), SessionState::Streaming);

        session.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_mid_stream_ignores_late_notifications() {
        let fake = FakeCentral::new();
        let session = ControllerSession::new(
            fake.clone(),
            SessionConfig {
                // Long backoff keeps the session in Disconnected for the test.
                retry_backoff: Duration::from_secs(30),
                keep_alive_interval: None,
                ..SessionConfig::default()
            },
        );

        session.start();
        wait_for_state(&session, SessionState::Scanning).await;
        fake.emit_advertiser("ctrl-1");
        wait_for_state(&session, SessionState::Streaming).await;

        fake.emit_frame("ctrl-1", &Frame::Voltage { voltage_raw: 900 });
        drain().await;
        assert_eq!(session.telemetry().voltage, Some(90.0));

        fake.emit(TransportEvent::Disconnected {
            target: "ctrl-1".to_string(),
        });
        wait_for_state(&session, SessionState::Disconnected).await;

        // A notification that was already in flight must not be folded.
        fake.emit_frame("ctrl-1", &Frame::Voltage { voltage_raw: 500 });
        drain().await;
        assert_eq!(session.telemetry().voltage, Some(90.0));

        session.stop().await;
    }

    #[tokio::test]
    async fn test_reconnect_reuses_known_peer() {
        let fake = FakeCentral::new();
        let session = ControllerSession::new(fake.clone(), quick_retry_config());

        session.start();
        wait_for_state(&session, SessionState::Scanning).await;
        fake.emit_advertiser("ctrl-1");
        wait_for_state(&session, SessionState::Streaming).await;

        fake.emit(TransportEvent::Disconnected {
            target: "ctrl-1".to_string(),
        });
        wait_for_state(&session, SessionState::Scanning).await;

        fake.emit_advertiser("ctrl-1");
        wait_for_state(&session, SessionState::Streaming).await;

        let connects = fake.connects.lock().clone();
        assert_eq!(
            connects,
            vec![
                // First contact refreshes the service directory...
                ("ctrl-1".to_string(), true),
                // ...the reconnect reuses it.
                ("ctrl-1".to_string(), false),
            ]
        );

        session.stop().await;
    }

    #[tokio::test]
    async fn test_stop_while_streaming_disconnects_and_stops_folding() {
        let fake = FakeCentral::new();
        let session = ControllerSession::new(fake.clone(), quick_retry_config());

        session.start();
        wait_for_state(&session, SessionState::Scanning).await;
        fake.emit_advertiser("ctrl-1");
        wait_for_state(&session, SessionState::Streaming).await;

        session.stop().await;

        assert_eq!(session.state(), SessionState::Idle);
        assert!(fake.disconnects.load(Ordering::SeqCst) >= 1);

        // No folding after cancellation.
        fake.emit_frame("ctrl-1", &Frame::Voltage { voltage_raw: 900 });
        drain().await;
        assert_eq!(session.telemetry().voltage, None);
    }

    #[tokio::test]
    async fn test_stop_while_scanning_stops_scan() {
        let fake = FakeCentral::new();
        let session = ControllerSession::new(fake.clone(), quick_retry_config());

        session.start();
        wait_for_state(&session, SessionState::Scanning).await;

        session.stop().await;

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(fake.scan_stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_characteristic_is_connection_failure() {
        let fake = FakeCentral::new();
        fake.has_characteristic.store(false, Ordering::SeqCst);

        let session = ControllerSession::new(
            fake.clone(),
            SessionConfig {
                retry: RetryPolicy::Bounded { max_attempts: 1 },
                ..quick_retry_config()
            },
        );

        session.start();
        wait_for_state(&session, SessionState::Scanning).await;
        fake.emit_advertiser("ctrl-1");
        wait_for_state(&session, SessionState::Idle).await;

        // The open link was torn down, never left half-configured.
        assert!(fake.disconnects.load(Ordering::SeqCst) >= 1);
        assert_eq!(session.failed_attempts(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_failure_forces_disconnect() {
        let fake = FakeCentral::new();
        fake.subscribe_ok.store(false, Ordering::SeqCst);

        let session = ControllerSession::new(
            fake.clone(),
            SessionConfig {
                retry: RetryPolicy::Bounded { max_attempts: 1 },
                ..quick_retry_config()
            },
        );

        session.start();
        wait_for_state(&session, SessionState::Scanning).await;
        fake.emit_advertiser("ctrl-1");
        wait_for_state(&session, SessionState::Idle).await;

        assert!(fake.disconnects.load(Ordering::SeqCst) >= 1);
        assert!(!session.state().is_streaming());
    }

    #[tokio::test]
    async fn test_keep_alive_written_while_streaming() {
        let fake = FakeCentral::new();
        let session = ControllerSession::new(
            fake.clone(),
            SessionConfig {
                keep_alive_interval: Some(Duration::from_millis(20)),
                ..SessionConfig::default()
            },
        );

        session.start();
        wait_for_state(&session, SessionState::Scanning).await;
        fake.emit_advertiser("ctrl-1");
        wait_for_state(&session, SessionState::Streaming).await;

        tokio::time::sleep(Duration::from_millis(100)).await;

        let writes = fake.writes.lock().clone();
        assert!(writes.len() >= 2, "expected keep-alives, got {:?}", writes);
        assert!(writes.iter().all(|w| w == &KEEP_ALIVE_COMMAND));

        session.stop().await;
    }

    #[tokio::test]
    async fn test_keep_alive_failure_drops_link() {
        let fake = FakeCentral::new();
        fake.write_ok.store(false, Ordering::SeqCst);

        let session = ControllerSession::new(
            fake.clone(),
            SessionConfig {
                keep_alive_interval: Some(Duration::from_millis(20)),
                retry_backoff: Duration::from_secs(30),
                ..SessionConfig::default()
            },
        );

        session.start();
        wait_for_state(&session, SessionState::Scanning).await;
        fake.emit_advertiser("ctrl-1");

        // Streaming may last only until the first keep-alive write fails, so
        // wait directly for the resulting state.
        wait_for_state(&session, SessionState::Disconnected).await;
        assert!(!fake.writes.lock().is_empty());
        assert!(fake.disconnects.load(Ordering::SeqCst) >= 1);

        session.stop().await;
    }
}
