use std::io;

use serde::Serialize;

/// An [`io::Write`] sink that only counts the bytes written into it.
#[derive(Debug, Default)]
struct ByteCounter(u64);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Estimates the memory footprint of `value` by the length of its JSON serialization.
///
/// This is a rough, allocation-free approximation used for operational visibility only.
/// Values that fail to serialize are reported as `0`.
pub fn estimate_size<T: Serialize + ?Sized>(value: &T) -> u64 {
    let mut counter = ByteCounter::default();
    match serde_json::to_writer(&mut counter, value) {
        Ok(()) => counter.0,
        Err(err) => {
            tracing::warn!(error = &err as &dyn std::error::Error, "Failed to estimate size");
            0
        }
    }
}
