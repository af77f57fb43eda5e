//! The short-range wireless notification channel.
//!
//! The radio stack itself is an external collaborator; the session code only
//! talks to it through [`Peripheral`] (device side) and [`Central`] /
//! [`Connection`] (collector side). The rig reuses the environmental sensing
//! service and its temperature characteristic to carry samples.

use std::{sync::atomic::AtomicBool, time::Duration};

use crate::Result;

/// Environmental Sensing service
pub const SERVICE_UUID: u16 = 0x181A;
/// Temperature characteristic, repurposed as the sample stream
pub const CHARACTERISTIC_UUID: u16 = 0x2A6E;
/// Generic thermometer
pub const APPEARANCE: u16 = 0x0300;
pub const ADVERTISING_INTERVAL_US: u32 = 300;

/// Full 128-bit form of a 16-bit SIG identifier
pub fn uuid_string(short: u16) -> String {
    format!("{:08x}-0000-1000-8000-00805f9b34fb", short)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub name: Option<String>,
    pub address: String,
    pub services: Vec<u16>,
}

/// Runs on the stack's own delivery thread, once per notification
pub type NotifyHandler = Box<dyn FnMut(&[u8]) + Send + 'static>;

pub trait Peripheral {
    /// Advertise as `name` until a central connects (`true`) or `stop` is set
    /// (`false`)
    fn advertise(&mut self, name: &str, stop: &AtomicBool) -> Result<bool>;
    fn is_connected(&self) -> bool;
    /// Fire-and-forget; dropped silently when nobody is subscribed
    fn notify(&mut self, payload: &[u8]);
}

pub trait Central {
    type Connection: Connection;

    /// Everything seen advertising within `timeout`
    fn scan(&mut self, timeout: Duration) -> Result<Vec<Advertisement>>;
    fn connect(&mut self, device: &Advertisement) -> Result<Self::Connection>;
}

pub trait Connection {
    fn subscribe(&mut self, characteristic: u16, handler: NotifyHandler) -> Result<()>;
    fn unsubscribe(&mut self, characteristic: u16) -> Result<()>;
    fn is_connected(&self) -> bool;
    fn disconnect(&mut self) -> Result<()>;
}
