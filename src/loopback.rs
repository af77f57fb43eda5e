//! In-process wireless link.
//!
//! A [`LoopbackPeripheral`] and a [`LoopbackCentral`] share one simulated air
//! interface. Notifications cross a channel and are handed to the subscriber
//! on a dedicated delivery thread, the way a radio stack calls back from its
//! own context.

use std::{
    sync::{atomic::AtomicBool, atomic::Ordering, Arc, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, Sender};
use tracing::debug;

use crate::{
    link::{
        Advertisement, Central, Connection, NotifyHandler, Peripheral, CHARACTERISTIC_UUID,
        SERVICE_UUID,
    },
    Error, Result,
};

const POLL: Duration = Duration::from_millis(5);

#[derive(Default)]
struct Air {
    advertising: Option<Advertisement>,
    connected: bool,
    subscriber: Option<Sender<Vec<u8>>>,
}

type SharedAir = Arc<Mutex<Air>>;

fn lock(air: &SharedAir) -> MutexGuard<'_, Air> {
    air.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Both ends of a fresh link; the peripheral advertises from `address`
pub fn pair(address: &str) -> (LoopbackPeripheral, LoopbackCentral) {
    let air = SharedAir::default();
    (
        LoopbackPeripheral {
            air: air.clone(),
            address: address.to_owned(),
        },
        LoopbackCentral { air },
    )
}

pub struct LoopbackPeripheral {
    air: SharedAir,
    address: String,
}

impl LoopbackPeripheral {
    /// Sever the link from the device end
    pub fn drop_connection(&self) {
        let mut air = lock(&self.air);
        air.connected = false;
        air.subscriber = None;
    }

    /// Whether a central has notifications turned on
    pub fn is_subscribed(&self) -> bool {
        lock(&self.air).subscriber.is_some()
    }
}

impl Peripheral for LoopbackPeripheral {
    fn advertise(&mut self, name: &str, stop: &AtomicBool) -> Result<bool> {
        lock(&self.air).advertising = Some(Advertisement {
            name: Some(name.to_owned()),
            address: self.address.clone(),
            services: vec![SERVICE_UUID],
        });
        loop {
            {
                let mut air = lock(&self.air);
                if air.connected {
                    air.advertising = None;
                    return Ok(true);
                }
                if stop.load(Ordering::Relaxed) {
                    air.advertising = None;
                    return Ok(false);
                }
            }
            thread::sleep(POLL);
        }
    }

    fn is_connected(&self) -> bool {
        lock(&self.air).connected
    }

    fn notify(&mut self, payload: &[u8]) {
        if let Some(subscriber) = &lock(&self.air).subscriber {
            let _ = subscriber.send(payload.to_vec());
        }
    }
}

pub struct LoopbackCentral {
    air: SharedAir,
}

impl Central for LoopbackCentral {
    type Connection = LoopbackConnection;

    fn scan(&mut self, timeout: Duration) -> Result<Vec<Advertisement>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(adv) = lock(&self.air).advertising.clone() {
                return Ok(vec![adv]);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(vec![]);
            }
            thread::sleep(POLL.min(deadline - now));
        }
    }

    fn connect(&mut self, device: &Advertisement) -> Result<LoopbackConnection> {
        let mut air = lock(&self.air);
        let advertising = air
            .advertising
            .as_ref()
            .map_or(false, |adv| adv.address == device.address);
        if !advertising {
            return Err(Error::ConnectionLost(format!(
                "{} is no longer advertising",
                device.address
            )));
        }
        air.connected = true;
        debug!("Connected to {}", device.address);
        Ok(LoopbackConnection {
            air: self.air.clone(),
            delivery: None,
        })
    }
}

pub struct LoopbackConnection {
    air: SharedAir,
    delivery: Option<JoinHandle<()>>,
}

impl Connection for LoopbackConnection {
    fn subscribe(&mut self, characteristic: u16, mut handler: NotifyHandler) -> Result<()> {
        if characteristic != CHARACTERISTIC_UUID {
            return Err(Error::ConnectionLost(format!(
                "peer has no characteristic {:#06x}",
                characteristic
            )));
        }
        let (tx, rx) = unbounded::<Vec<u8>>();
        {
            let mut air = lock(&self.air);
            if !air.connected {
                return Err(Error::ConnectionLost("not connected".into()));
            }
            air.subscriber = Some(tx);
        }
        self.delivery = Some(thread::spawn(move || {
            for payload in rx {
                handler(&payload);
            }
        }));
        Ok(())
    }

    /// Stops delivery; notifications already in flight are handed over first
    fn unsubscribe(&mut self, _characteristic: u16) -> Result<()> {
        lock(&self.air).subscriber = None;
        if let Some(handle) = self.delivery.take() {
            handle
                .join()
                .map_err(|_| Error::ConnectionLost("notification handler panicked".into()))?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        lock(&self.air).connected
    }

    fn disconnect(&mut self) -> Result<()> {
        self.unsubscribe(CHARACTERISTIC_UUID)?;
        lock(&self.air).connected = false;
        Ok(())
    }
}

impl Drop for LoopbackConnection {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn scan_times_out_empty() {
        let (_peripheral, mut central) = pair("AA:BB");
        let started = Instant::now();
        let found = central.scan(Duration::from_millis(30)).unwrap();
        assert!(found.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn notifications_reach_the_subscriber_in_order() {
        let (mut peripheral, mut central) = pair("AA:BB");
        let stop = Arc::new(AtomicBool::new(false));
        let advertiser = thread::spawn(move || {
            let connected = peripheral.advertise("iq_digitizer", &stop).unwrap();
            (peripheral, connected)
        });
        let found = central.scan(Duration::from_secs(5)).unwrap();
        assert_eq!(found[0].name.as_deref(), Some("iq_digitizer"));
        let mut conn = central.connect(&found[0]).unwrap();
        let (mut peripheral, connected) = advertiser.join().unwrap();
        assert!(connected);

        // before anyone subscribes, payloads vanish
        peripheral.notify(&[9, 9, 9, 9]);

        let (tx, rx) = bounded(16);
        conn.subscribe(
            CHARACTERISTIC_UUID,
            Box::new(move |payload| tx.send(payload.to_vec()).unwrap()),
        )
        .unwrap();
        peripheral.notify(&[1, 0, 0, 0]);
        peripheral.notify(&[2, 0, 0, 0]);
        conn.unsubscribe(CHARACTERISTIC_UUID).unwrap();
        peripheral.notify(&[3, 0, 0, 0]);

        let got: Vec<Vec<u8>> = rx.try_iter().collect();
        assert_eq!(got, vec![vec![1, 0, 0, 0], vec![2, 0, 0, 0]]);

        conn.disconnect().unwrap();
        assert!(!peripheral.is_connected());
    }

    #[test]
    fn advertising_stops_on_request() {
        let (mut peripheral, _central) = pair("AA:BB");
        let stop = AtomicBool::new(true);
        assert!(!peripheral.advertise("iq_digitizer", &stop).unwrap());
    }
}
