//! Synthetic controller emulator.
//!
//! Peripheral-role counterpart to the session: advertises the telemetry
//! service, waits for a central to attach, and streams frames through the
//! same codec the real controller uses. Values vary smoothly with a
//! synthetic clock so a consumer can tell live telemetry from a frozen
//! stream. Nothing is buffered for a detached consumer; a frame that cannot
//! be delivered now is simply never generated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::transport::{PeerEvent, PeripheralTransport};
use crate::ble::uuids::FARDRIVER_SERVICE_UUID;
use crate::error::Result;
use crate::protocol::frame::{Frame, Gear};

/// Frame kinds emitted per cycle, in order.
pub const EMIT_CYCLE: [u8; 4] = [
    Frame::KIND_MAIN,
    Frame::KIND_VOLTAGE,
    Frame::KIND_CONTROLLER_TEMP,
    Frame::KIND_MOTOR_TEMP,
];

/// Configuration for the emulator.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Service to advertise.
    pub service_uuid: Uuid,
    /// Time between emitted frames; the real controller updates roughly
    /// every 30 ms.
    pub tick_interval: Duration,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            service_uuid: FARDRIVER_SERVICE_UUID,
            tick_interval: Duration::from_millis(30),
        }
    }
}

/// Deterministic frame generator cycling through the emitted kinds.
///
/// Pure state machine, separable from the transport so tests can drive it
/// directly.
#[derive(Debug)]
pub struct FrameSource {
    /// Position in [`EMIT_CYCLE`].
    cursor: usize,
    /// Synthetic clock in milliseconds, advanced per frame.
    clock_ms: u32,
    /// Clock step per frame.
    step_ms: u32,
}

impl FrameSource {
    /// Create a source advancing its clock by `tick_interval` per frame.
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            cursor: 0,
            clock_ms: 0,
            step_ms: tick_interval.as_millis() as u32,
        }
    }

    /// Synthesize a frame of the given kind at a point on the clock.
    ///
    /// The rpm oscillates around 1200 so consecutive main frames differ;
    /// the remaining values are fixed plausible readings.
    pub fn synthesize(kind: u8, clock_ms: u32) -> Frame {
        match kind {
            Frame::KIND_MAIN => {
                let swing = 200.0 * (f64::from(clock_ms) / 1000.0).sin();
                Frame::Main {
                    gear: Gear::Mid,
                    rpm: (1200.0 + swing) as u16,
                    iq_raw: 500,
                    id_raw: 200,
                }
            }
            Frame::KIND_VOLTAGE => Frame::Voltage { voltage_raw: 900 },
            Frame::KIND_CONTROLLER_TEMP => Frame::ControllerTemp { celsius: 40 },
            Frame::KIND_MOTOR_TEMP => Frame::MotorTemp {
                celsius: 50,
                throttle: 2048,
            },
            other => Frame::no_data(other),
        }
    }

    /// Produce the next frame in round-robin kind order and advance the
    /// clock.
    pub fn next_frame(&mut self) -> Frame {
        let kind = EMIT_CYCLE[self.cursor];
        self.cursor = (self.cursor + 1) % EMIT_CYCLE.len();

        let frame = Self::synthesize(kind, self.clock_ms);
        self.clock_ms = self.clock_ms.wrapping_add(self.step_ms);

        frame
    }
}

/// Synthetic controller streaming frames to an attached central.
pub struct ControllerEmulator {
    transport: Arc<dyn PeripheralTransport>,
    config: EmulatorConfig,
    /// Whether a central is currently attached.
    attached: Arc<AtomicBool>,
    is_running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    task: parking_lot::RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl ControllerEmulator {
    /// Create a new emulator over the given peripheral transport.
    pub fn new(transport: Arc<dyn PeripheralTransport>, config: EmulatorConfig) -> Self {
        Self {
            transport,
            config,
            attached: Arc::new(AtomicBool::new(false)),
            is_running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            task: parking_lot::RwLock::new(None),
        }
    }

    /// Start advertising and emitting.
    ///
    /// # Errors
    ///
    /// Returns an error if advertising cannot be started.
    pub async fn start(&self) -> Result<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            debug!("Emulator already running");
            return Ok(());
        }

        self.transport.advertise(self.config.service_uuid).await?;

        info!(
            "Emulator advertising {} at {:?} per frame",
            self.config.service_uuid, self.config.tick_interval
        );

        let transport = self.transport.clone();
        let attached = self.attached.clone();
        let is_running = self.is_running.clone();
        let shutdown = self.shutdown.clone();
        let tick_interval = self.config.tick_interval;

        let handle = tokio::spawn(async move {
            let mut source = FrameSource::new(tick_interval);
            let mut peers = transport.peer_events();
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            while is_running.load(Ordering::SeqCst) {
                tokio::select! {
                    biased;
                    _ = shutdown.notified() => break,
                    event = peers.recv() => match event {
                        Ok(PeerEvent::Connected) => {
                            debug!("Consumer attached");
                            attached.store(true, Ordering::SeqCst);
                        }
                        Ok(PeerEvent::Disconnected) => {
                            debug!("Consumer detached");
                            attached.store(false, Ordering::SeqCst);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Emulator lagged {} peer events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = ticker.tick() => {
                        // Freshness over completeness: no consumer, no frame.
                        if !attached.load(Ordering::SeqCst) {
                            continue;
                        }

                        let frame = source.next_frame();
                        if let Err(e) = transport.notify(&frame.encode()).await {
                            warn!("Notify failed: {}", e);
                        }
                    }
                }
            }

            debug!("Emulator loop ended");
        });

        *self.task.write() = Some(handle);

        Ok(())
    }

    /// Stop emitting.
    pub async fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();

        let handle = self.task.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Whether a central is currently attached.
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Whether the emission loop is running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

impl Drop for ControllerEmulator {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
    }
}
