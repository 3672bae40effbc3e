use std::io::{self, BufRead, Read};

use tracing::info;

/// Default progress interval: 64 MiB
pub const DEFAULT_FREQUENCY: u64 = 64 * 1024 * 1024;

/// Reader wrapper that reports how many bytes have passed through it.
///
/// `callback` is invoked each time the running total crosses a multiple of
/// `frequency`, once per multiple crossed, with the total so far.
#[derive(Debug)]
pub struct InstrumentedReader<R, F>
where
    F: FnMut(u64),
{
    inner: R,
    callback: F,
    frequency: u64,
    total_read: u64,
    next_threshold: u64,
}

impl<R, F> InstrumentedReader<R, F>
where
    F: FnMut(u64),
{
    /// A `frequency` of 0 means [`DEFAULT_FREQUENCY`].
    pub fn with_frequency(inner: R, frequency: u64, callback: F) -> Self {
        let frequency = if frequency == 0 { DEFAULT_FREQUENCY } else { frequency };
        Self {
            inner,
            callback,
            frequency,
            total_read: 0,
            next_threshold: frequency,
        }
    }

    #[cfg(test)]
    pub fn total_read(&self) -> u64 {
        self.total_read
    }

    fn advance(&mut self, n: usize) {
        self.total_read = self.total_read.saturating_add(n as u64);
        while self.total_read >= self.next_threshold {
            (self.callback)(self.total_read);
            self.next_threshold = match self.next_threshold.checked_add(self.frequency) {
                Some(next) => next,
                None => u64::MAX,
            };
            if self.next_threshold == u64::MAX {
                break;
            }
        }
    }
}

/// Logs the number of MiB read from `name` every [`DEFAULT_FREQUENCY`] bytes.
pub fn logging<R: Read>(inner: R, name: String) -> InstrumentedReader<R, impl FnMut(u64)> {
    InstrumentedReader::with_frequency(inner, DEFAULT_FREQUENCY, move |total| {
        info!(input = %name, mib = total / (1024 * 1024), "reading");
    })
}

impl<R: Read, F: FnMut(u64)> Read for InstrumentedReader<R, F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.advance(n);
        Ok(n)
    }
}

// Byte counting happens on `consume`, so buffered readers above and below
// the wrapper report the same totals.
impl<R: BufRead, F: FnMut(u64)> BufRead for InstrumentedReader<R, F> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt);
        self.advance(amt);
    }
}
