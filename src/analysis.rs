//! Offline processing of a persisted session: I/Q vectors, phase, and the
//! chest displacement it encodes.

use std::{
    f64::consts::PI,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use tracing::{info, warn};

use crate::{
    complex::{to_f64, Complex, ComplexSample},
    Error, Result, Sample,
};

/// Carrier wavelength of the 24.150 GHz front end, in meters
pub const WAVELENGTH: f64 = 3.0e8 / 24.150e9;

/// Parse a persisted sample file
pub fn load_samples<P: AsRef<Path>>(path: P) -> Result<Vec<Sample>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| Error::storage(path, e))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            line.trim().parse().map_err(|_| {
                Error::MalformedPacket(format!("{:?} line {}: {:?}", path, n + 1, line))
            })
        })
        .collect()
}

/// Pair up interleaved I, Q samples. A trailing unpaired sample is dropped.
pub fn deinterleave(samples: &[Sample]) -> Vec<ComplexSample> {
    if samples.len() % 2 != 0 {
        warn!("Odd sample count {}, dropping the last one", samples.len());
    }
    samples
        .chunks_exact(2)
        .map(|pair| Complex::new(pair[0], pair[1]))
        .collect()
}

/// Subtract the per-channel mean
pub fn remove_mean(pairs: &[ComplexSample]) -> Vec<Complex<f64>> {
    if pairs.is_empty() {
        return vec![];
    }
    let mean = pairs
        .iter()
        .map(|&p| to_f64(p))
        .sum::<Complex<f64>>()
        .unscale(pairs.len() as f64);
    pairs.iter().map(|&p| to_f64(p) - mean).collect()
}

/// Phase of each vector with jumps larger than pi folded back
pub fn unwrap_phase(pairs: &[Complex<f64>]) -> Vec<f64> {
    let mut out = Vec::with_capacity(pairs.len());
    let mut offset = 0.0;
    let mut last: Option<f64> = None;
    for p in pairs {
        let wrapped = p.arg();
        if let Some(prev) = last {
            let delta = wrapped - prev;
            if delta > PI {
                offset -= 2.0 * PI;
            } else if delta < -PI {
                offset += 2.0 * PI;
            }
        }
        last = Some(wrapped);
        out.push(wrapped + offset);
    }
    out
}

/// Radial displacement in meters; the round trip doubles the path
pub fn displacement(phase: &[f64]) -> Vec<f64> {
    phase.iter().map(|p| p * WAVELENGTH / (4.0 * PI)).collect()
}

pub fn write_displacement<P: AsRef<Path>>(path: P, displacement: &[f64]) -> Result<()> {
    let path = path.as_ref();
    write_rows(path, displacement.iter().map(|d| format!("{}", d)))?;
    info!("Saved {} displacement values to {:?}", displacement.len(), path);
    Ok(())
}

/// One `re,im` row per pair
pub fn write_complex<P: AsRef<Path>>(path: P, pairs: &[Complex<f64>]) -> Result<()> {
    let path = path.as_ref();
    write_rows(path, pairs.iter().map(|p| format!("{},{}", p.re, p.im)))?;
    info!("Saved {} complex samples to {:?}", pairs.len(), path);
    Ok(())
}

fn write_rows(path: &Path, rows: impl Iterator<Item = String>) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::storage(path, e))?;
    let mut writer = BufWriter::new(file);
    for row in rows {
        writeln!(writer, "{}", row).map_err(|e| Error::storage(path, e))?;
    }
    writer.flush().map_err(|e| Error::storage(path, e))
}

/// Everything derived from one session file
#[derive(Debug, Clone)]
pub struct Track {
    pub pairs: Vec<Complex<f64>>,
    pub phase: Vec<f64>,
    pub displacement: Vec<f64>,
}

impl Track {
    pub fn from_samples(samples: &[Sample]) -> Self {
        let pairs = remove_mean(&deinterleave(samples));
        let phase = unwrap_phase(&pairs);
        let displacement = displacement(&phase);
        Self {
            pairs,
            phase,
            displacement,
        }
    }

    /// Peak-to-peak displacement in meters
    pub fn excursion(&self) -> f64 {
        let (min, max) = self
            .displacement
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &d| {
                (lo.min(d), hi.max(d))
            });
        if self.displacement.is_empty() {
            0.0
        } else {
            max - min
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::SyntheticTarget;

    #[test]
    fn odd_tail_dropped() {
        let pairs = deinterleave(&[1, 2, 3, 4, 5]);
        assert_eq!(pairs, vec![Complex::new(1, 2), Complex::new(3, 4)]);
    }

    #[test]
    fn mean_removed_per_channel() {
        let centered = remove_mean(&[Complex::new(1, 10), Complex::new(3, 30)]);
        assert_eq!(centered, vec![Complex::new(-1.0, -10.0), Complex::new(1.0, 10.0)]);
        assert!(remove_mean(&[]).is_empty());
    }

    #[test]
    fn phase_unwraps_across_pi() {
        // a vector spinning counterclockwise past pi, 0.4 rad per step
        let pairs: Vec<Complex<f64>> = (0..20)
            .map(|k| {
                let a = 0.4 * k as f64;
                Complex::new(a.cos(), a.sin())
            })
            .collect();
        let phase = unwrap_phase(&pairs);
        for (k, p) in phase.iter().enumerate() {
            assert!((p - 0.4 * k as f64).abs() < 1e-9, "step {k}: {p}");
        }
    }

    #[test]
    fn half_wavelength_per_turn() {
        let d = displacement(&[0.0, 2.0 * PI]);
        assert!((d[1] - d[0] - WAVELENGTH / 2.0).abs() < 1e-12);
    }

    #[test]
    fn recovers_synthetic_breathing() {
        let rate = 50.0;
        let mut target = SyntheticTarget::new(rate);
        // a swing whose arc has its centroid on the circle's center (first
        // zero of J0), so mean removal leaves the phase untouched
        target.excursion = 2.404_825_557_695_773 * WAVELENGTH / (4.0 * PI);
        let excursion = target.excursion;
        // four whole breaths, negated back the way the sampler does
        let samples: Vec<Sample> = target
            .take((16.0 * rate) as usize)
            .flat_map(|[i, q]| [-i, -q])
            .collect();
        let track = Track::from_samples(&samples);
        assert_eq!(track.pairs.len(), 800);
        assert!((track.excursion() - 2.0 * excursion).abs() < 1e-4);
    }

    #[test]
    fn files_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("iq.txt");
        std::fs::write(&input, "5\n-3\n\n100\n-100\n").unwrap();
        let samples = load_samples(&input).unwrap();
        assert_eq!(samples, vec![5, -3, 100, -100]);

        let track = Track::from_samples(&samples);
        let complex = dir.path().join("complex.txt");
        write_complex(&complex, &track.pairs).unwrap();
        assert_eq!(
            std::fs::read_to_string(&complex).unwrap(),
            "-47.5,48.5\n47.5,-48.5\n"
        );
        let disp = dir.path().join("disp.txt");
        write_displacement(&disp, &track.displacement).unwrap();
        assert_eq!(std::fs::read_to_string(&disp).unwrap().lines().count(), 2);
    }

    #[test]
    fn garbage_line_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("iq.txt");
        std::fs::write(&input, "5\nabc\n").unwrap();
        assert!(matches!(load_samples(&input), Err(Error::MalformedPacket(_))));
    }
}
