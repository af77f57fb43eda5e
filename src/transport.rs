//! Device-side sinks. A session delivers to exactly one of them.
//!
//! None of them retry: an error is logged, the hardware is stopped and the
//! session is abandoned.
//!
//! Notifications are fire-and-forget and carry one sample each with no I/Q
//! marker. Anything sent while nobody is subscribed is lost, so a collector
//! that attaches mid-session may start on a Q half.

use std::{
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use tracing::{error, info, warn};

use crate::{
    buffer::SampleBuffer,
    config::Credentials,
    encode_sample,
    link::{Peripheral, ADVERTISING_INTERVAL_US, APPEARANCE, SERVICE_UUID},
    monitoring::Progress,
    sampler::Sampler,
    Error, Result, INITIATION, SENTINEL,
};

/// Back-off when the hardware has nothing ready
pub const RETRY_DELAY: Duration = Duration::from_millis(1);
/// How often a blocked receive checks the stop flag
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Buffer the whole session in memory and write it out once at the end.
/// Anything unflushed is lost if the process dies mid-session.
pub struct FileSink {
    path: PathBuf,
    buffer: SampleBuffer,
}

impl FileSink {
    pub fn new<P: AsRef<Path>>(path: P, capacity: usize) -> Self {
        Self {
            path: path.as_ref().to_owned(),
            buffer: SampleBuffer::new(capacity),
        }
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    /// Pull `target` samples, then persist. Returns the number written.
    pub fn run<S: Sampler>(&mut self, sampler: &mut S, target: usize) -> Result<usize> {
        if target > self.buffer.capacity() {
            warn!(
                "Session of {} samples exceeds buffer capacity {}, the oldest will be dropped",
                target,
                self.buffer.capacity()
            );
        }
        let mut progress = Progress::new("Sampled", Some(target));
        sampler.activate();
        for _ in 0..target {
            let sample = sampler.next_sample();
            self.buffer.push(sample);
            progress.record(sample);
        }
        sampler.deactivate();
        progress.finish();
        self.buffer.write_to(&self.path)?;
        Ok(self.buffer.len())
    }
}

/// Push each sample to whoever is subscribed over the wireless link
pub struct NotificationSink<P> {
    peripheral: P,
    name: String,
}

impl<P: Peripheral> NotificationSink<P> {
    pub fn new(peripheral: P, name: &str) -> Self {
        Self {
            peripheral,
            name: name.to_owned(),
        }
    }

    /// Advertise, stream while a central stays connected, and go back to
    /// advertising once it leaves. Returns the number of notifications sent
    /// when `stop` is raised.
    pub fn serve<S: Sampler>(&mut self, sampler: &mut S, stop: &AtomicBool) -> Result<u64> {
        let mut sent = 0u64;
        while !stop.load(Ordering::Relaxed) {
            info!(
                "Advertising {:?} (service {:#06x}, appearance {:#06x}, every {} us)",
                self.name, SERVICE_UUID, APPEARANCE, ADVERTISING_INTERVAL_US
            );
            if !self.peripheral.advertise(&self.name, stop)? {
                break;
            }
            info!("Central connected");
            sampler.activate();
            let mut progress = Progress::new("Notified", None);
            while self.peripheral.is_connected() && !stop.load(Ordering::Relaxed) {
                match sampler.try_sample() {
                    Some(sample) => {
                        self.peripheral.notify(&encode_sample(sample));
                        progress.record(sample);
                    }
                    None => thread::sleep(RETRY_DELAY),
                }
            }
            sampler.deactivate();
            progress.finish();
            sent += progress.count() as u64;
            info!("Central disconnected");
        }
        Ok(sent)
    }

    pub fn peripheral(&self) -> &P {
        &self.peripheral
    }
}

/// Decimal strings over UDP to whoever asked, then the sentinel
pub struct DatagramSink {
    socket: UdpSocket,
}

impl DatagramSink {
    pub fn bind(addr: SocketAddr, credentials: Option<&Credentials>) -> Result<Self> {
        if let Some(creds) = credentials {
            info!("Streaming over network {:?}", creds.ssid);
        }
        let socket = UdpSocket::bind(addr).map_err(|e| Error::link("binding datagram socket", e))?;
        socket
            .set_read_timeout(Some(POLL_INTERVAL))
            .map_err(|e| Error::link("configuring datagram socket", e))?;
        info!(
            "Listening on {}",
            socket
                .local_addr()
                .map_or_else(|_| addr.to_string(), |a| a.to_string())
        );
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| Error::link("reading local address", e))
    }

    /// Block until a peer sends the initiation datagram; `None` if stopped first
    fn await_initiation(&self, stop: &AtomicBool) -> Result<Option<SocketAddr>> {
        let mut request = [0u8; 1024];
        while !stop.load(Ordering::Relaxed) {
            match self.socket.recv_from(&mut request) {
                Ok((len, peer)) => {
                    let text = String::from_utf8_lossy(&request[..len]);
                    if text != INITIATION {
                        warn!("Unexpected initiation {:?}, starting anyway", text);
                    }
                    info!("Client request {:?} from {}", text, peer);
                    return Ok(Some(peer));
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                Err(e) => return Err(Error::link("waiting for initiation", e)),
            }
        }
        Ok(None)
    }

    /// Serve one session of `target` samples. Returns the peer served, or
    /// `None` if `stop` was raised before anyone asked.
    pub fn run<S: Sampler>(
        &mut self,
        sampler: &mut S,
        target: usize,
        stop: &AtomicBool,
    ) -> Result<Option<SocketAddr>> {
        let peer = match self.await_initiation(stop)? {
            Some(peer) => peer,
            None => return Ok(None),
        };
        sampler.activate();
        let result = self.stream(sampler, target, peer);
        sampler.deactivate();
        if let Err(e) = &result {
            error!("Datagram session abandoned: {}", e);
        }
        result.map(|_| Some(peer))
    }

    fn stream<S: Sampler>(&mut self, sampler: &mut S, target: usize, peer: SocketAddr) -> Result<()> {
        let mut progress = Progress::new("Sent", Some(target));
        for _ in 0..target {
            let sample = sampler.next_sample();
            self.socket
                .send_to(sample.to_string().as_bytes(), peer)
                .map_err(|e| Error::link("sending sample", e))?;
            progress.record(sample);
        }
        self.socket
            .send_to(SENTINEL.as_bytes(), peer)
            .map_err(|e| Error::link("sending end of stream", e))?;
        progress.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decode_sample,
        link::{Central, Connection, CHARACTERISTIC_UUID},
        loopback,
        sampler::ReplaySampler,
    };
    use std::{
        net::{Ipv4Addr, SocketAddrV4},
        sync::{Arc, Mutex},
    };

    fn localhost() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
    }

    #[test]
    fn file_sink_persists_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.txt");
        let mut sink = FileSink::new(&path, 16);
        let mut sampler = ReplaySampler::new(vec![5, -3, 100, -100]);
        assert_eq!(sink.run(&mut sampler, 4).unwrap(), 4);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "5\n-3\n100\n-100\n");
    }

    #[test]
    fn file_sink_reports_storage_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope").join("test.txt");
        let mut sink = FileSink::new(&path, 16);
        let mut sampler = ReplaySampler::new(vec![1]);
        assert!(matches!(
            sink.run(&mut sampler, 2),
            Err(Error::Storage { .. })
        ));
        // the session is still in memory
        assert_eq!(sink.buffer().to_vec(), vec![1, 1]);
    }

    #[test]
    fn datagram_sink_streams_then_finishes() {
        let mut sink = DatagramSink::bind(localhost(), None).unwrap();
        let server = sink.local_addr().unwrap();
        let client = UdpSocket::bind(localhost()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.send_to(INITIATION.as_bytes(), server).unwrap();

        let stop = AtomicBool::new(false);
        let mut sampler = ReplaySampler::new(vec![1, 2, 3, 4]);
        let peer = sink.run(&mut sampler, 4, &stop).unwrap();
        assert_eq!(peer, Some(client.local_addr().unwrap()));

        let mut buf = [0u8; 64];
        let got: Vec<String> = (0..5)
            .map(|_| {
                let (len, _) = client.recv_from(&mut buf).unwrap();
                String::from_utf8_lossy(&buf[..len]).into_owned()
            })
            .collect();
        assert_eq!(got, ["1", "2", "3", "4", "FINISHED"]);
    }

    #[test]
    fn datagram_sink_honours_stop_while_waiting() {
        let mut sink = DatagramSink::bind(localhost(), None).unwrap();
        let stop = AtomicBool::new(true);
        let mut sampler = ReplaySampler::new(vec![1]);
        assert_eq!(sink.run(&mut sampler, 1, &stop).unwrap(), None);
    }

    /// Hands out nothing on every other poll
    struct Flaky {
        inner: ReplaySampler,
        ready: bool,
    }

    impl Sampler for Flaky {
        fn next_sample(&mut self) -> i32 {
            self.inner.next_sample()
        }

        fn try_sample(&mut self) -> Option<i32> {
            self.ready = !self.ready;
            if self.ready {
                self.inner.try_sample()
            } else {
                None
            }
        }
    }

    #[test]
    fn notification_sink_skips_unready_samples() {
        let (peripheral, mut central) = loopback::pair("AA:BB");
        let stop = Arc::new(AtomicBool::new(false));
        let device_stop = stop.clone();
        let device = thread::spawn(move || {
            let mut sink = NotificationSink::new(peripheral, "iq_digitizer");
            let mut sampler = Flaky {
                inner: ReplaySampler::new(vec![7, -7]),
                ready: false,
            };
            sink.serve(&mut sampler, &device_stop).unwrap()
        });

        let found = central.scan(Duration::from_secs(5)).unwrap();
        let mut conn = central.connect(&found[0]).unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink_side = received.clone();
        conn.subscribe(
            CHARACTERISTIC_UUID,
            Box::new(move |payload| sink_side.lock().unwrap().push(decode_sample(payload))),
        )
        .unwrap();
        while received.lock().unwrap().len() < 6 {
            thread::sleep(Duration::from_millis(1));
        }
        conn.disconnect().unwrap();
        stop.store(true, Ordering::Relaxed);
        assert!(device.join().unwrap() >= 6);

        // whatever went out before the subscription was dropped, but nothing
        // was skipped or duplicated after it
        let received = received.lock().unwrap();
        assert!(received.iter().all(|v| matches!(v, Some(7) | Some(-7))));
        for pair in received.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }
}
