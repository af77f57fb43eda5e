//! Sample producers.
//!
//! [`HardwareSampler`] runs the read machines on a capture thread and hands
//! out polarity-corrected samples from the FIFO. [`SimulatedAdc`] stands in
//! for the converters when there is no rig attached, fed by a
//! [`SyntheticTarget`].

use std::{
    f64::consts::PI,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use rtrb::{Consumer, RingBuffer};
use tracing::{debug, error};

use crate::{
    analysis::WAVELENGTH,
    capture::{capture_words, FIFO_DEPTH},
    config::Config,
    correct_polarity,
    sequencer::{AdcBus, MasterClock, Sequencer},
    Sample,
};

/// Anything that yields decimated samples, I and Q alternating
pub trait Sampler {
    /// Block until the next sample is available
    fn next_sample(&mut self) -> Sample;
    /// The next sample if one is ready
    fn try_sample(&mut self) -> Option<Sample>;
    /// Start the hardware
    fn activate(&mut self) {}
    /// Stop the hardware, dropping anything not yet read
    fn deactivate(&mut self) {}
}

struct Worker<A> {
    running: Arc<AtomicBool>,
    handle: JoinHandle<(Sequencer, A)>,
    consumer: Consumer<u32>,
}

pub struct HardwareSampler<A: AdcBus + Send + 'static> {
    idle: Option<(Sequencer, A)>,
    worker: Option<Worker<A>>,
    pace: Option<Duration>,
}

impl<A: AdcBus + Send + 'static> HardwareSampler<A> {
    pub fn new(sequencer: Sequencer, adc: A) -> Self {
        Self {
            idle: Some((sequencer, adc)),
            worker: None,
            pace: None,
        }
    }

    /// Emit one I/Q pair per `period` instead of as fast as possible
    pub fn with_pacing(mut self, period: Duration) -> Self {
        self.pace = Some(period);
        self
    }

    pub fn is_active(&self) -> bool {
        self.worker.is_some()
    }
}

impl HardwareSampler<SimulatedAdc<SyntheticTarget>> {
    /// A sampler wired to a simulated converter pair
    pub fn simulated(config: &Config) -> Self {
        let sequencer = Sequencer::new(config.output_mode, MasterClock::new(1, 1));
        let adc = SimulatedAdc::new(
            SyntheticTarget::new(config.output_rate()),
            config.effective_decimation(),
        );
        let sampler = Self::new(sequencer, adc);
        if config.realtime {
            sampler.with_pacing(Duration::from_secs_f64(1.0 / config.output_rate()))
        } else {
            sampler
        }
    }
}

impl<A: AdcBus + Send + 'static> Sampler for HardwareSampler<A> {
    fn next_sample(&mut self) -> Sample {
        self.activate();
        loop {
            if let Some(sample) = self.try_sample() {
                return sample;
            }
            thread::yield_now();
        }
    }

    fn try_sample(&mut self) -> Option<Sample> {
        let raw = self.worker.as_mut()?.consumer.pop().ok()?;
        Some(correct_polarity(raw))
    }

    fn activate(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let (mut sequencer, mut adc) = match self.idle.take() {
            Some(parts) => parts,
            None => {
                error!("Hardware lost after a capture failure, cannot activate");
                return;
            }
        };
        sequencer.reset();
        let (mut producer, consumer) = RingBuffer::new(FIFO_DEPTH);
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let pace = self.pace;
        let handle = thread::spawn(move || {
            capture_words(&mut sequencer, &mut adc, &mut producer, &flag, pace);
            (sequencer, adc)
        });
        debug!("Read machines active");
        self.worker = Some(Worker {
            running,
            handle,
            consumer,
        });
    }

    fn deactivate(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.running.store(false, Ordering::Relaxed);
            match worker.handle.join() {
                Ok(parts) => self.idle = Some(parts),
                Err(_) => error!("Capture thread panicked"),
            }
            debug!("Read machines stopped");
        }
    }
}

impl<A: AdcBus + Send + 'static> Drop for HardwareSampler<A> {
    fn drop(&mut self) {
        self.deactivate();
    }
}

/// Replays a fixed sequence forever; an empty sequence never yields
#[derive(Debug, Clone)]
pub struct ReplaySampler {
    samples: Vec<Sample>,
    index: usize,
}

impl ReplaySampler {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples, index: 0 }
    }
}

impl Sampler for ReplaySampler {
    fn next_sample(&mut self) -> Sample {
        loop {
            if let Some(sample) = self.try_sample() {
                return sample;
            }
            thread::yield_now();
        }
    }

    fn try_sample(&mut self) -> Option<Sample> {
        let sample = *self.samples.get(self.index)?;
        self.index = (self.index + 1) % self.samples.len();
        Some(sample)
    }
}

/// Compressed clock: leave room for both 32-bit shifts between conversions
const MIN_EDGES_PER_OUTPUT: u32 = 64;

/// Two converters sharing a data line, latching one raw pair per decimation
/// period from `source`
pub struct SimulatedAdc<S> {
    source: S,
    edges_per_output: u32,
    edges: u32,
    last_mclk: bool,
    drl: bool,
    latched: [u32; 2],
    cursor: [u32; 2],
}

impl<S: Iterator<Item = [i32; 2]>> SimulatedAdc<S> {
    pub fn new(source: S, decimation: u32) -> Self {
        Self {
            source,
            edges_per_output: decimation.max(MIN_EDGES_PER_OUTPUT),
            edges: 0,
            last_mclk: false,
            drl: true,
            latched: [0; 2],
            cursor: [0; 2],
        }
    }
}

impl<S: Iterator<Item = [i32; 2]>> AdcBus for SimulatedAdc<S> {
    fn clock(&mut self, mclk: bool) {
        if mclk && !self.last_mclk {
            self.edges += 1;
            self.drl = true;
            if self.edges >= self.edges_per_output {
                self.edges = 0;
                if let Some([i, q]) = self.source.next() {
                    self.latched = [i as u32, q as u32];
                    self.cursor = [0; 2];
                    self.drl = false;
                }
            }
        }
        self.last_mclk = mclk;
    }

    fn data_ready(&self) -> bool {
        self.drl
    }

    fn shift_out(&mut self, read_lines: [bool; 2]) -> bool {
        let ch = match read_lines {
            [false, true] => 0,
            [true, false] => 1,
            // nobody or everybody on the line
            _ => return false,
        };
        let cursor = self.cursor[ch];
        if cursor >= 32 {
            return false;
        }
        self.cursor[ch] += 1;
        (self.latched[ch] >> (31 - cursor)) & 1 == 1
    }
}

/// A chest moving in front of the radar: slow sinusoidal displacement seen as
/// a phase rotation of the I/Q vector, with DC offsets on both channels.
/// Readings come out with the front end's inverted polarity.
#[derive(Debug, Clone)]
pub struct SyntheticTarget {
    rate: f64,
    index: u64,
    pub amplitude: f64,
    pub breath_hz: f64,
    /// Peak displacement in meters
    pub excursion: f64,
    pub offset: [f64; 2],
}

impl SyntheticTarget {
    /// `rate` is the decimated pair rate in Hz
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            index: 0,
            amplitude: 1.0e6,
            breath_hz: 0.25,
            excursion: 2.0e-3,
            offset: [2.0e5, -1.5e5],
        }
    }

    /// Displacement at pair `index`
    pub fn displacement_at(&self, index: u64) -> f64 {
        let t = index as f64 / self.rate;
        self.excursion * (2.0 * PI * self.breath_hz * t).sin()
    }
}

impl Iterator for SyntheticTarget {
    type Item = [i32; 2];

    fn next(&mut self) -> Option<Self::Item> {
        let phase = 4.0 * PI * self.displacement_at(self.index) / WAVELENGTH;
        self.index += 1;
        let i = self.offset[0] + self.amplitude * phase.cos();
        let q = self.offset[1] + self.amplitude * phase.sin();
        Some([-(i.round() as i32), -(q.round() as i32)])
    }
}
