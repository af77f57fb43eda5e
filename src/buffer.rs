//! Bounded staging area for samples before they hit the disk

use std::{
    collections::VecDeque,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use tracing::info;

use crate::{Error, Result, Sample};

/// Ordered samples, the oldest evicted once `capacity` is reached
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl SampleBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity.min(1 << 16)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&mut self, sample: Sample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> + '_ {
        self.samples.iter()
    }

    pub fn to_vec(&self) -> Vec<Sample> {
        self.samples.iter().copied().collect()
    }

    pub fn first(&self, n: usize) -> Vec<Sample> {
        self.samples.iter().take(n).copied().collect()
    }

    /// Smallest and largest held sample
    pub fn range(&self) -> Option<(Sample, Sample)> {
        let min = *self.samples.iter().min()?;
        let max = *self.samples.iter().max()?;
        Some((min, max))
    }

    /// Write every held sample as one decimal line, truncating `path`
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| Error::storage(path, e))?;
        let mut writer = BufWriter::new(file);
        write_lines(&mut writer, self.samples.iter().copied()).map_err(|e| Error::storage(path, e))?;
        writer.flush().map_err(|e| Error::storage(path, e))?;
        info!("Saved {} samples to {:?}", self.len(), path);
        Ok(())
    }
}

/// The persisted format: one decimal integer per line, no header
pub fn write_lines<W: Write>(
    writer: &mut W,
    samples: impl IntoIterator<Item = Sample>,
) -> std::io::Result<()> {
    samples
        .into_iter()
        .try_for_each(|sample| writeln!(writer, "{}", sample))
}
