//! `binsort` is an external sort implementation for binary files of
//! fixed-width numeric records.
//!
//! External sorting is a class of sorting algorithms that can handle massive
//! amounts of data. External sorting is required when the data being sorted
//! do not fit into the main memory (RAM) of a computer and instead must be
//! resided in slower external memory, usually a hard disk drive. Sorting is
//! achieved in two passes. During the first pass it sorts chunks of data that
//! each fit in RAM, during the second pass it merges the sorted chunks
//! together. For more information see
//! [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `binsort` supports the following features:
//!
//! * **Raw binary layout:**
//!   the input is a plain concatenation of records in host byte order with
//!   no framing; the output uses the same layout. Any plain-old-data numeric
//!   type with a total order can be sorted.
//! * **Memory limit support:**
//!   the sorter never holds more than its configured budget in sort and
//!   merge buffers, however large the input is.
//! * **Multithreading support:**
//!   chunk sorting, run prefetching and output writeback all run on a shared
//!   worker pool, overlapping computation with disk I/O.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use binsort::{ExternalSorter, ThreadPool};
//!
//! fn main() {
//!     let pool = Arc::new(ThreadPool::new().unwrap());
//!
//!     let mut sorter: ExternalSorter<u32> =
//!         ExternalSorter::new(128 * 1024 * 1024, "input", "./", pool).unwrap();
//!
//!     sorter.sort().unwrap();
//! }
//! ```

pub mod buffer;
pub mod chunk;
pub mod io;
pub mod merger;
pub mod pool;
pub mod sort;

pub use buffer::RunReader;
pub use io::Record;
pub use pool::ThreadPool;
pub use sort::{ExternalSorter, SortError};
