//! Chunking phase: splits the input into sorted runs.

use std::collections::VecDeque;
use std::io::prelude::*;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;

use log;
use parking_lot::Mutex;

use crate::io::{self, Record};
use crate::pool::ThreadPool;
use crate::sort::SortError;

const RUN_FILE_PREFIX: &str = "chunk_";

/// Path of the run file with the given id inside the scratch directory.
pub(crate) fn run_file_path(scratch_dir: &Path, id: u32) -> PathBuf {
    scratch_dir.join(format!("{}{}", RUN_FILE_PREFIX, id))
}

/// Streams the input into memory chunks, sorts each chunk on the pool and
/// writes it to the scratch directory as a run file.
///
/// Exactly one chunk buffer per pool worker is allocated up front and
/// recycled through a free list, which is what bounds the phase's memory:
/// a fast input self-throttles on an empty free list, a slow input leaves
/// workers idle. Returns once every scheduled chunk has been written.
pub(crate) fn create_sorted_runs<N: Record, R: Read>(
    input: &mut R,
    input_path: &Path,
    scratch_dir: &Path,
    useful_memory: usize,
    run_counter: &Arc<AtomicU32>,
    pool: &Arc<ThreadPool>,
) -> Result<(), SortError> {
    let workers = pool.worker_count();
    let records_per_chunk = (useful_memory / mem::size_of::<N>()) / workers;

    let free_list = Arc::new(Mutex::new(VecDeque::with_capacity(workers)));
    {
        let mut list = free_list.lock();
        for _ in 0..workers {
            list.push_back(vec![N::zeroed(); records_per_chunk]);
        }
    }

    loop {
        let mut buf = match free_list.lock().pop_front() {
            Some(buf) => buf,
            None => {
                thread::yield_now();

                pool.check_failure()?;

                continue;
            }
        };

        pool.check_failure()?;

        let bytes = io::read_exact_or_eof(input, bytemuck::cast_slice_mut(buf.as_mut_slice()))
            .map_err(|err| SortError::Read {
                path: input_path.to_owned(),
                source: err,
            })?;

        // A trailing partial record is dropped along with the floor here.
        let records = bytes / mem::size_of::<N>();
        if records == 0 {
            free_list.lock().push_back(buf);

            break;
        }

        let scratch_dir = scratch_dir.to_owned();
        let free_list = Arc::clone(&free_list);
        let run_counter = Arc::clone(run_counter);
        pool.submit(move || {
            let mut chunk = buf;

            // Stable, so equal records keep their input order within a run.
            chunk[..records].sort();

            let id = run_counter.fetch_add(1, Ordering::Relaxed);
            let path = run_file_path(&scratch_dir, id);

            log::debug!("writing run {} ({} records)", id, records);

            let mut file = io::open_output(&path).map_err(|err| SortError::Open {
                path: path.clone(),
                source: err,
            })?;
            file.write_all(bytemuck::cast_slice(&chunk[..records]))
                .map_err(|err| SortError::Write { path, source: err })?;

            free_list.lock().push_back(chunk);

            Ok(())
        });
    }

    // Phase barrier: every in-flight chunk must reach disk before the run
    // counter can be read.
    while pool.has_pending() {
        thread::yield_now();
    }

    return pool.check_failure();
}
