//! Binary record I/O primitives.

use std::fs;
use std::io::{self, prelude::*};
use std::mem;
use std::path::Path;

/// A fixed-width numeric record stored in host byte order.
///
/// The trait is blanket-implemented for every plain-old-data numeric type
/// with a total order (`u32`, `i64`, ...), which lets whole buffers be
/// reinterpreted as raw bytes without a per-record decode step.
pub trait Record: bytemuck::Pod + Ord + Send + Sync + 'static {}

impl<T> Record for T where T: bytemuck::Pod + Ord + Send + Sync + 'static {}

/// Rounds `size` down to a whole number of `N` records.
pub fn round_to_record<N: Record>(size: usize) -> usize {
    size / mem::size_of::<N>() * mem::size_of::<N>()
}

/// Opens a binary file for reading.
pub fn open_input(path: &Path) -> io::Result<fs::File> {
    fs::File::open(path)
}

/// Creates a binary file for writing, truncating an existing one.
pub fn open_output(path: &Path) -> io::Result<fs::File> {
    fs::File::create(path)
}

/// Reads until `buf` is full or the stream hits end of file.
///
/// Returns the number of bytes read: `buf.len()` on a full read, less when
/// the stream ended early. A short count is *not* an error; only a hard I/O
/// failure produces `Err`. Interrupted reads are retried.
pub fn read_exact_or_eof(stream: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    return Ok(filled);
}
