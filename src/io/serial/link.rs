// src/io/serial/link.rs
//
// Serial link lifecycle: device discovery, probing, reopen-on-failure and
// the blocking reader thread that feeds byte chunks to the async side.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serialport::SerialPort;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::utils::{to_serialport_data_bits, to_serialport_parity, to_serialport_stop_bits, Parity};
use crate::errors::LinkError;
use crate::settings::SerialSettings;

/// All loops observe the shutdown flag within this interval.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Chunks in flight between the reader thread and the async side.
const READER_QUEUE: usize = 32;

// ============================================================================
// Types
// ============================================================================

/// Link lifecycle state. Closed is entered only on explicit shutdown,
/// never on I/O failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Searching,
    Open,
    Degraded,
    Closed,
}

/// What the link hands the orchestrator.
#[derive(Debug)]
pub enum LinkEvent {
    /// A device was opened (first open or any reconnect). The decoder must
    /// be reset: the new stream starts at an arbitrary frame offset.
    Connected { device: String },
    /// Raw bytes read from the open device.
    Data(Vec<u8>),
}

/// Messages from the blocking reader thread.
enum ReaderMessage {
    Data(Vec<u8>),
    Ended(LinkError),
}

struct ActiveLink {
    device: String,
    rx: mpsc::Receiver<ReaderMessage>,
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Byte source a reader thread drains once a device is open.
type PortReader = Box<dyn Read + Send>;

/// Host serial layer: port listing, probing and reopening. The manager
/// drives its state machine through this seam so tests can script
/// device behavior.
trait PortOpener: Send + Sync {
    fn list_ports(&self) -> Vec<String>;
    fn probe(
        &self,
        settings: &SerialSettings,
        path: &str,
    ) -> Result<(PortReader, Vec<u8>), LinkError>;
    fn reopen(&self, settings: &SerialSettings, path: &str) -> Result<PortReader, LinkError>;
}

// ============================================================================
// Serial Link Manager
// ============================================================================

/// Owns the serial device across its whole lifecycle. `next_event` drives
/// the Searching/Open/Degraded machine and never returns an error: I/O
/// failures are absorbed into reconnection, and `None` means shutdown.
pub struct SerialLinkManager {
    settings: SerialSettings,
    shutdown: Arc<AtomicBool>,
    state: Arc<Mutex<LinkState>>,
    backoff: Duration,
    active: Option<ActiveLink>,
    opener: Arc<dyn PortOpener>,
}

impl SerialLinkManager {
    pub fn new(settings: SerialSettings, shutdown: Arc<AtomicBool>) -> Self {
        Self::with_opener(settings, shutdown, Arc::new(SystemPorts))
    }

    fn with_opener(
        settings: SerialSettings,
        shutdown: Arc<AtomicBool>,
        opener: Arc<dyn PortOpener>,
    ) -> Self {
        let backoff = Duration::from_millis(settings.search_backoff_min_ms);
        SerialLinkManager {
            settings,
            shutdown,
            state: Arc::new(Mutex::new(LinkState::Searching)),
            backoff,
            active: None,
            opener,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state.lock().map(|s| *s).unwrap_or(LinkState::Closed)
    }

    /// Produce the next link event. Blocks (asynchronously) across device
    /// searches and reconnects; returns `None` only once shutdown is
    /// requested, after parking the link in Closed.
    pub async fn next_event(&mut self) -> Option<LinkEvent> {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                self.close().await;
                return None;
            }

            let msg = match self.active.as_mut() {
                Some(active) => tokio::time::timeout(POLL_INTERVAL, active.rx.recv()).await,
                None => {
                    match self.acquire().await {
                        Some(device) => return Some(LinkEvent::Connected { device }),
                        None => continue, // shutdown; caught at the top
                    }
                }
            };

            match msg {
                Ok(Some(ReaderMessage::Data(bytes))) => return Some(LinkEvent::Data(bytes)),
                Ok(Some(ReaderMessage::Ended(err))) => {
                    warn!("serial link lost: {err}");
                    if let Some(event) = self.recover().await {
                        return Some(event);
                    }
                }
                Ok(None) => {
                    warn!("serial reader stopped unexpectedly");
                    if let Some(event) = self.recover().await {
                        return Some(event);
                    }
                }
                Err(_) => {} // poll tick; shutdown flag is re-checked above
            }
        }
    }

    /// Search until a candidate device probes successfully. Exponential
    /// backoff between passes, reset on success. `None` means shutdown.
    async fn acquire(&mut self) -> Option<String> {
        self.set_state(LinkState::Searching);

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return None;
            }

            let candidates = self.candidates();
            if candidates.is_empty() {
                debug!("search pass: {}", LinkError::DeviceNotFound);
            }

            for path in candidates {
                if self.shutdown.load(Ordering::Relaxed) {
                    return None;
                }
                let settings = self.settings.clone();
                let probe_path = path.clone();
                let opener = Arc::clone(&self.opener);
                match tokio::task::spawn_blocking(move || opener.probe(&settings, &probe_path))
                    .await
                {
                    Ok(Ok((port, carryover))) => {
                        self.log_open(&path);
                        self.install_reader(path.clone(), port, carryover);
                        return Some(path);
                    }
                    Ok(Err(err)) => debug!("probe of {path} failed: {err}"),
                    Err(err) => warn!("probe task for {path} failed: {err}"),
                }
            }

            debug!(
                "no telemetry device found, retrying in {} ms",
                self.backoff.as_millis()
            );
            let delay = self.backoff;
            if self.sleep_observing(delay).await {
                return None;
            }
            let max = Duration::from_millis(self.settings.search_backoff_max_ms);
            self.backoff = grow_backoff(self.backoff, max);
        }
    }

    /// The open device failed. Retry the same path a few times over a
    /// short grace window; past the budget fall back to a full search.
    async fn recover(&mut self) -> Option<LinkEvent> {
        let device = match self.drop_active().await {
            Some(device) => device,
            None => return None,
        };
        self.set_state(LinkState::Degraded);

        for attempt in 1..=self.settings.degraded_retries {
            let delay = Duration::from_millis(self.settings.degraded_delay_ms);
            if self.sleep_observing(delay).await {
                return None;
            }
            let settings = self.settings.clone();
            let path = device.clone();
            let opener = Arc::clone(&self.opener);
            match tokio::task::spawn_blocking(move || opener.reopen(&settings, &path)).await {
                Ok(Ok(port)) => {
                    info!("reopened {device} on attempt {attempt}");
                    self.install_reader(device.clone(), port, Vec::new());
                    return Some(LinkEvent::Connected { device });
                }
                Ok(Err(err)) => debug!("reopen attempt {attempt} failed: {err}"),
                Err(err) => warn!("reopen task failed: {err}"),
            }
        }

        info!("{device} did not come back, searching for a device");
        self.set_state(LinkState::Searching);
        None
    }

    /// Candidate device paths in probe order: the explicitly configured
    /// path first, then discovered ports matching a prefix, highest path
    /// first since the most recently attached device usually gets the
    /// highest number.
    fn candidates(&self) -> Vec<String> {
        rank_candidates(
            self.settings.device.as_deref(),
            self.opener.list_ports(),
            &self.settings.device_prefixes,
        )
    }

    fn install_reader(&mut self, device: String, port: PortReader, carryover: Vec<u8>) {
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(READER_QUEUE);
        let handle = spawn_reader(
            device.clone(),
            port,
            carryover,
            tx,
            cancel.clone(),
            self.shutdown.clone(),
        );
        self.active = Some(ActiveLink {
            device,
            rx,
            cancel,
            handle,
        });
        self.backoff = Duration::from_millis(self.settings.search_backoff_min_ms);
        self.set_state(LinkState::Open);
    }

    /// Tear down the reader thread, returning the device path it was on.
    async fn drop_active(&mut self) -> Option<String> {
        let ActiveLink {
            device,
            rx,
            cancel,
            handle,
        } = self.active.take()?;
        cancel.store(true, Ordering::Relaxed);
        drop(rx);
        let _ = handle.await;
        Some(device)
    }

    async fn close(&mut self) {
        let _ = self.drop_active().await;
        self.set_state(LinkState::Closed);
    }

    fn set_state(&self, next: LinkState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != next {
                info!("link state {:?} -> {:?}", *state, next);
                *state = next;
            }
        }
    }

    /// Sleep in short slices so shutdown is observed within the poll
    /// interval. Returns true if shutdown was requested.
    async fn sleep_observing(&self, total: Duration) -> bool {
        let mut remaining = total;
        while !remaining.is_zero() {
            if self.shutdown.load(Ordering::Relaxed) {
                return true;
            }
            let slice = remaining.min(POLL_INTERVAL);
            tokio::time::sleep(slice).await;
            remaining -= slice;
        }
        self.shutdown.load(Ordering::Relaxed)
    }

    fn log_open(&self, device: &str) {
        info!(
            "opened {} at {} baud ({}-{}-{})",
            device,
            self.settings.baud_rate,
            self.settings.data_bits,
            match self.settings.parity {
                Parity::None => 'N',
                Parity::Odd => 'O',
                Parity::Even => 'E',
            },
            self.settings.stop_bits
        );
    }
}

// ============================================================================
// Discovery, Probing and the Reader Thread
// ============================================================================

/// Production opener backed by the `serialport` crate.
struct SystemPorts;

impl PortOpener for SystemPorts {
    fn list_ports(&self) -> Vec<String> {
        match serialport::available_ports() {
            Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
            Err(err) => {
                warn!("failed to enumerate serial ports: {err}");
                Vec::new()
            }
        }
    }

    fn probe(
        &self,
        settings: &SerialSettings,
        path: &str,
    ) -> Result<(PortReader, Vec<u8>), LinkError> {
        let (port, carryover) = probe_device(settings, path)?;
        Ok((Box::new(port), carryover))
    }

    fn reopen(&self, settings: &SerialSettings, path: &str) -> Result<PortReader, LinkError> {
        Ok(Box::new(open_device(settings, path)?))
    }
}

fn rank_candidates(
    explicit: Option<&str>,
    discovered: Vec<String>,
    prefixes: &[String],
) -> Vec<String> {
    let mut paths = Vec::new();
    if let Some(device) = explicit {
        if !device.is_empty() {
            paths.push(device.to_string());
        }
    }

    let mut matching: Vec<String> = discovered
        .into_iter()
        .filter(|name| prefixes.iter().any(|prefix| name.starts_with(prefix)))
        .collect();
    matching.sort_by(|a, b| b.cmp(a));

    for path in matching {
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}

fn grow_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Open a candidate port and demand real bytes before trusting it: a port
/// that opens but stays silent is not the telemetry device. Bytes consumed
/// by the probe are carried over to the reader so none are lost.
fn probe_device(
    settings: &SerialSettings,
    path: &str,
) -> Result<(Box<dyn SerialPort>, Vec<u8>), LinkError> {
    let mut port = open_builder(settings, path, Duration::from_millis(settings.probe_timeout_ms))?;

    let mut carryover = Vec::with_capacity(settings.probe_bytes.max(1));
    let mut buf = [0u8; 256];
    let deadline = Instant::now() + Duration::from_millis(settings.probe_timeout_ms);

    while carryover.len() < settings.probe_bytes {
        if Instant::now() >= deadline {
            return Err(LinkError::ReadTimeout {
                device: path.to_string(),
            });
        }
        match port.read(&mut buf) {
            Ok(0) => {
                return Err(LinkError::UnexpectedClose {
                    device: path.to_string(),
                })
            }
            Ok(n) => carryover.extend_from_slice(&buf[..n]),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(LinkError::ReadTimeout {
                    device: path.to_string(),
                });
            }
            Err(e) => {
                debug!("probe read error on {path}: {e}");
                return Err(LinkError::UnexpectedClose {
                    device: path.to_string(),
                });
            }
        }
    }

    port.set_timeout(Duration::from_millis(settings.read_timeout_ms))
        .map_err(|e| LinkError::OpenFailed {
            device: path.to_string(),
            source: e,
        })?;

    Ok((port, carryover))
}

/// Plain reopen at steady-state settings, used on a path that already
/// probed as the telemetry device.
fn open_device(settings: &SerialSettings, path: &str) -> Result<Box<dyn SerialPort>, LinkError> {
    open_builder(settings, path, Duration::from_millis(settings.read_timeout_ms))
}

fn open_builder(
    settings: &SerialSettings,
    path: &str,
    timeout: Duration,
) -> Result<Box<dyn SerialPort>, LinkError> {
    serialport::new(path, settings.baud_rate)
        .data_bits(to_serialport_data_bits(settings.data_bits))
        .stop_bits(to_serialport_stop_bits(settings.stop_bits))
        .parity(to_serialport_parity(&settings.parity))
        .timeout(timeout)
        .open()
        .map_err(|e| LinkError::OpenFailed {
            device: path.to_string(),
            source: e,
        })
}

/// Reader thread: blocking port reads forwarded over a bounded channel.
/// Exits on device loss, a non-timeout read error, cancellation or
/// shutdown; timeout reads mean "no data yet".
fn spawn_reader(
    device: String,
    mut port: PortReader,
    carryover: Vec<u8>,
    tx: mpsc::Sender<ReaderMessage>,
    cancel: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        if !carryover.is_empty() && tx.blocking_send(ReaderMessage::Data(carryover)).is_err() {
            return;
        }

        let mut buf = [0u8; 256];
        loop {
            if cancel.load(Ordering::Relaxed) || shutdown.load(Ordering::Relaxed) {
                return;
            }
            match port.read(&mut buf) {
                Ok(0) => {
                    let _ = tx.blocking_send(ReaderMessage::Ended(LinkError::UnexpectedClose {
                        device,
                    }));
                    return;
                }
                Ok(n) => {
                    if tx.blocking_send(ReaderMessage::Data(buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    warn!("read error on {device}: {e}");
                    let _ = tx.blocking_send(ReaderMessage::Ended(LinkError::UnexpectedClose {
                        device,
                    }));
                    return;
                }
            }
        }
    })
}

// ============================================================================
// Tests
// ============================================================================
