//! Host-side collectors: attach to the sink's consumer end and persist
//! whatever arrives, in arrival order.
//!
//! A notification stream has no framing. Whatever the device sent before the
//! subscription went live is gone, so a session can start on a Q half; an odd
//! sample count at save time is logged as a hint.

use std::{
    fs::File,
    io::{BufWriter, ErrorKind, Write},
    net::{SocketAddr, UdpSocket},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    buffer::SampleBuffer,
    config::Config,
    decode_sample,
    link::{Advertisement, Central, Connection, CHARACTERISTIC_UUID},
    monitoring::Progress,
    transport::POLL_INTERVAL,
    Error, Result, Sample, INITIATION, SENTINEL,
};

/// How often the receive loop looks at the count and the interrupt flag
pub const RECEIVE_POLL: Duration = Duration::from_millis(100);
const SCAN_BACKOFF: Duration = Duration::from_millis(10);
/// Fits any decimal i32 with room to spare
pub const DATAGRAM_BUFFER: usize = 64;

/// Where the notification collector is in its session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectorState {
    Idle,
    Scanning,
    Subscribed,
    Receiving,
    TargetReached,
    Interrupted,
    Unsubscribed,
    Disconnected,
}

/// Why a session stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    TargetReached,
    Interrupted,
    /// The sentinel arrived
    Finished,
}

/// Samples gathered by the notification handler
#[derive(Debug)]
pub struct Reception {
    buffer: SampleBuffer,
    target: usize,
    received: usize,
    malformed: usize,
    progress: Progress,
}

impl Reception {
    pub fn new(target: usize, capacity: usize) -> Self {
        Self {
            buffer: SampleBuffer::new(capacity),
            target,
            received: 0,
            malformed: 0,
            progress: Progress::new("Received", Some(target)),
        }
    }

    /// Decode and store one notification. Anything past the target is
    /// ignored (`Ok(None)`); a payload that isn't one sample wide is an error
    /// and leaves the count alone.
    pub fn handle_notification(&mut self, payload: &[u8]) -> Result<Option<Sample>> {
        let sample = match decode_sample(payload) {
            Some(sample) => sample,
            None => {
                self.malformed += 1;
                return Err(Error::MalformedPacket(format!(
                    "unexpected data length: {} bytes",
                    payload.len()
                )));
            }
        };
        if self.is_complete() {
            return Ok(None);
        }
        self.buffer.push(sample);
        self.received += 1;
        self.progress.record(sample);
        Ok(Some(sample))
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn malformed(&self) -> usize {
        self.malformed
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn is_complete(&self) -> bool {
        self.received >= self.target
    }

    /// Restart the rate clock, e.g. once discovery is over
    pub fn start(&mut self) {
        self.progress.reset();
    }

    pub fn elapsed(&self) -> Duration {
        self.progress.elapsed()
    }

    /// Whether the held samples split evenly into I/Q pairs
    pub fn is_paired(&self) -> bool {
        self.buffer.len() % 2 == 0
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    pub fn samples(&self) -> Vec<Sample> {
        self.buffer.to_vec()
    }

    /// Forget everything received so far
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.received = 0;
        self.malformed = 0;
        self.progress.reset();
        info!("Data buffer cleared");
    }
}

fn lock(reception: &Mutex<Reception>) -> MutexGuard<'_, Reception> {
    reception
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scan until something advertises exactly `name`, or `timeout` runs out
pub fn discover<C: Central>(central: &mut C, name: &str, timeout: Duration) -> Result<Advertisement> {
    info!("Scanning for device {:?}...", name);
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let found = central.scan(remaining)?;
        if let Some(device) = found
            .into_iter()
            .find(|d| d.name.as_deref() == Some(name))
        {
            info!("Found device {} ({})", name, device.address);
            return Ok(device);
        }
        thread::sleep(SCAN_BACKOFF.min(deadline.saturating_duration_since(Instant::now())));
    }
    warn!("Device {:?} not found", name);
    Err(Error::DeviceNotFound {
        name: name.to_owned(),
        timeout,
    })
}

/// Receives samples pushed over the wireless link
pub struct NotificationCollector {
    name: String,
    discovery_timeout: Duration,
    output: PathBuf,
    reception: Arc<Mutex<Reception>>,
    state: CollectorState,
}

impl NotificationCollector {
    pub fn new(config: &Config) -> Self {
        Self {
            name: config.device_name.clone(),
            discovery_timeout: config.discovery_timeout(),
            output: config.output.clone(),
            reception: Arc::new(Mutex::new(Reception::new(
                config.target(),
                config.buffer_capacity,
            ))),
            state: CollectorState::Idle,
        }
    }

    pub fn state(&self) -> CollectorState {
        self.state
    }

    pub fn reception(&self) -> MutexGuard<'_, Reception> {
        lock(&self.reception)
    }

    pub fn clear(&self) {
        self.reception().clear();
    }

    fn transition(&mut self, next: CollectorState) {
        debug!("Collector {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// One whole session. Every path that gets past connecting unsubscribes
    /// and persists what was collected before returning, errors included.
    pub fn run<C: Central>(&mut self, central: &mut C, interrupted: &AtomicBool) -> Result<SessionEnd> {
        self.transition(CollectorState::Scanning);
        let mut conn = match discover(central, &self.name, self.discovery_timeout)
            .and_then(|device| central.connect(&device))
        {
            Ok(conn) => conn,
            Err(e) => {
                self.transition(CollectorState::Idle);
                return Err(e);
            }
        };
        info!("Connected to {}", self.name);
        info!("Target: {} samples", self.reception().target());
        self.reception().start();

        let handler_side = self.reception.clone();
        let subscribed = conn.subscribe(
            CHARACTERISTIC_UUID,
            Box::new(move |payload| {
                if let Err(e) = lock(&handler_side).handle_notification(payload) {
                    warn!("{}", e);
                }
            }),
        );
        if let Err(e) = subscribed {
            if let Err(e) = conn.disconnect() {
                warn!("Disconnect failed: {}", e);
            }
            self.transition(CollectorState::Idle);
            return Err(e);
        }
        self.transition(CollectorState::Subscribed);
        info!("Subscribed to notifications");

        self.transition(CollectorState::Receiving);
        let outcome = self.receive(&conn, interrupted);
        match outcome {
            Ok(SessionEnd::TargetReached) => {
                info!("Target reached, saving data");
                self.transition(CollectorState::TargetReached);
            }
            Ok(_) => {
                info!("Receiving interrupted");
                self.transition(CollectorState::Interrupted);
            }
            Err(ref e) => warn!("{}", e),
        }

        if let Err(e) = conn.unsubscribe(CHARACTERISTIC_UUID) {
            warn!("Unsubscribe failed: {}", e);
        }
        self.transition(CollectorState::Unsubscribed);
        info!("Stopped notifications");
        let saved = self.persist();
        if let Err(e) = conn.disconnect() {
            warn!("Disconnect failed: {}", e);
        }
        self.transition(CollectorState::Disconnected);
        info!("Disconnected");
        self.transition(CollectorState::Idle);

        let end = outcome?;
        saved?;
        Ok(end)
    }

    fn receive<T: Connection>(&self, conn: &T, interrupted: &AtomicBool) -> Result<SessionEnd> {
        loop {
            {
                let reception = self.reception();
                if reception.is_complete() {
                    reception.progress.finish();
                    return Ok(SessionEnd::TargetReached);
                }
                if !conn.is_connected() {
                    return Err(Error::ConnectionLost(format!(
                        "peer went away after {}/{} samples",
                        reception.received(),
                        reception.target()
                    )));
                }
            }
            if interrupted.load(Ordering::Relaxed) {
                return Ok(SessionEnd::Interrupted);
            }
            thread::sleep(RECEIVE_POLL);
        }
    }

    fn persist(&self) -> Result<()> {
        let reception = self.reception();
        if reception.buffer().is_empty() {
            info!("Nothing received, no file written");
            return Ok(());
        }
        if !reception.is_paired() {
            warn!(
                "Saving an odd number of samples ({}), I/Q pairing may be shifted by one",
                reception.buffer().len()
            );
        }
        reception.buffer().write_to(&self.output)
    }
}

/// Decode a datagram payload as a decimal sample
pub fn parse_datagram(payload: &[u8]) -> Result<Sample> {
    std::str::from_utf8(payload)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| {
            Error::MalformedPacket(format!(
                "not a decimal sample: {:?}",
                String::from_utf8_lossy(payload)
            ))
        })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatagramReport {
    pub end: SessionEnd,
    pub received: usize,
    pub malformed: usize,
}

/// Requests a stream over UDP and persists it line by line as it arrives,
/// until `target` samples are in or the sentinel shows up
pub struct DatagramCollector {
    socket: UdpSocket,
    sampler: SocketAddr,
    target: usize,
    idle_timeout: Option<Duration>,
    output: PathBuf,
}

impl DatagramCollector {
    pub fn connect<P: AsRef<Path>>(
        bind: SocketAddr,
        sampler: SocketAddr,
        target: usize,
        idle_timeout: Option<Duration>,
        output: P,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(bind).map_err(|e| Error::link("binding datagram socket", e))?;
        socket
            .set_read_timeout(Some(POLL_INTERVAL))
            .map_err(|e| Error::link("configuring datagram socket", e))?;
        Ok(Self {
            socket,
            sampler,
            target,
            idle_timeout,
            output: output.as_ref().to_owned(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| Error::link("reading local address", e))
    }

    /// Stream into the configured output file
    pub fn run_to_file(&mut self, interrupted: &AtomicBool) -> Result<DatagramReport> {
        let file = File::create(&self.output).map_err(|e| Error::storage(&self.output, e))?;
        let mut writer = BufWriter::new(file);
        self.run(&mut writer, interrupted)
    }

    pub fn run<W: Write>(&mut self, out: &mut W, interrupted: &AtomicBool) -> Result<DatagramReport> {
        self.socket
            .send_to(INITIATION.as_bytes(), self.sampler)
            .map_err(|e| Error::link("sending initiation", e))?;
        info!("Requested {} samples from {}", self.target, self.sampler);

        let mut buf = [0u8; DATAGRAM_BUFFER];
        let mut progress = Progress::new("Received", Some(self.target));
        let mut malformed = 0usize;
        let mut last_heard = Instant::now();
        let end = loop {
            if progress.count() >= self.target {
                break SessionEnd::TargetReached;
            }
            if interrupted.load(Ordering::Relaxed) {
                info!("Receiving interrupted");
                break SessionEnd::Interrupted;
            }
            match self.socket.recv_from(&mut buf) {
                Ok((len, _)) => {
                    last_heard = Instant::now();
                    let payload = &buf[..len];
                    if payload == SENTINEL.as_bytes() {
                        break SessionEnd::Finished;
                    }
                    match parse_datagram(payload) {
                        Ok(sample) => {
                            writeln!(out, "{}", sample)
                                .and_then(|_| out.flush())
                                .map_err(|e| Error::storage(&self.output, e))?;
                            progress.record(sample);
                        }
                        Err(e) => {
                            malformed += 1;
                            warn!("{}, skipped", e);
                        }
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    if let Some(idle) = self.idle_timeout {
                        if last_heard.elapsed() >= idle {
                            return Err(Error::ConnectionLost(format!(
                                "nothing from {} for {:?}",
                                self.sampler, idle
                            )));
                        }
                    }
                }
                Err(e) => return Err(Error::link("receiving", e)),
            }
        };
        out.flush().map_err(|e| Error::storage(&self.output, e))?;
        progress.finish();
        Ok(DatagramReport {
            end,
            received: progress.count(),
            malformed,
        })
    }
}
