//! This module contains the capture loop

// The capture thread does one thing, as fast as possible: step the read
// machines and push every completed word into an rtrb ring buffer, which
// plays the part of the hardware RX FIFO. The session thread pops from the
// other end.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use rtrb::{Producer, PushError};
use tracing::debug;

use crate::sequencer::{AdcBus, Sequencer};

/// Joined RX FIFO depth in words
pub const FIFO_DEPTH: usize = 8;

/// Run the machines until `running` drops, returning the number of words captured.
///
/// With `pace` set, each I/Q pair is held back until its slot in a
/// `pace`-period schedule comes up.
pub fn capture_words<A: AdcBus>(
    sequencer: &mut Sequencer,
    adc: &mut A,
    producer: &mut Producer<u32>,
    running: &AtomicBool,
    pace: Option<Duration>,
) -> u64 {
    let mut words = 0u64;
    let mut deadline = Instant::now();
    'capture: while running.load(Ordering::Relaxed) {
        let mut pending = match sequencer.step(adc) {
            Some(word) => word,
            None => continue,
        };
        // Autopush stalls the shifter while the FIFO is full
        loop {
            match producer.push(pending) {
                Ok(()) => break,
                Err(PushError::Full(word)) => {
                    if !running.load(Ordering::Relaxed) {
                        break 'capture;
                    }
                    pending = word;
                    thread::yield_now();
                }
            }
        }
        words += 1;
        if let Some(period) = pace {
            if words % 2 == 0 {
                deadline += period;
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                }
            }
        }
    }
    debug!("Capture stopped after {} words", words);
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::OutputMode, sampler::SimulatedAdc, sequencer::MasterClock};
    use rtrb::{Consumer, RingBuffer};
    use std::{sync::Arc, thread::JoinHandle};

    fn spawn_capture(
        pace: Option<Duration>,
    ) -> (Arc<AtomicBool>, JoinHandle<u64>, Consumer<u32>) {
        let (mut producer, consumer) = RingBuffer::new(FIFO_DEPTH);
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::spawn(move || {
            let mut sequencer = Sequencer::new(OutputMode::Filtered, MasterClock::new(1, 1));
            let mut adc = SimulatedAdc::new((1..).map(|v| [v, -v]), 256);
            capture_words(&mut sequencer, &mut adc, &mut producer, &flag, pace)
        });
        (running, handle, consumer)
    }

    #[test]
    fn full_fifo_stalls_the_shifter() {
        let (running, handle, mut consumer) = spawn_capture(None);
        while consumer.slots() < FIFO_DEPTH {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));
        running.store(false, Ordering::Relaxed);
        assert_eq!(handle.join().unwrap(), FIFO_DEPTH as u64);

        let words: Vec<u32> = std::iter::from_fn(|| consumer.pop().ok()).collect();
        let expected: Vec<u32> = (1..=4i32).flat_map(|v| [v as u32, (-v) as u32]).collect();
        assert_eq!(words, expected);
    }

    #[test]
    fn pacing_holds_pairs_back() {
        let started = Instant::now();
        let (running, handle, mut consumer) = spawn_capture(Some(Duration::from_millis(5)));
        let mut got = 0;
        while got < 6 {
            if consumer.pop().is_ok() {
                got += 1;
            } else {
                thread::yield_now();
            }
        }
        // three pairs, at least two full periods apart from the first
        assert!(started.elapsed() >= Duration::from_millis(10));
        running.store(false, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
