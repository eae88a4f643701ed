//! Double-buffered run reader.

use std::fs;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::io::{self, Record};
use crate::pool::ThreadPool;
use crate::sort::SortError;

/// One half of the double buffer, filled by a pool task.
///
/// `ready` transitions false -> true exactly once per load cycle, with
/// release ordering relative to the buffer contents; the consumer only
/// touches `data` after observing `ready` with acquire ordering.
struct LoadSlot<N> {
    ready: AtomicBool,
    data: Mutex<SlotData<N>>,
}

struct SlotData<N> {
    buf: Vec<N>,
    records: usize,
}

impl<N: Record> LoadSlot<N> {
    fn new(records_per_buffer: usize) -> Self {
        LoadSlot {
            ready: AtomicBool::new(false),
            data: Mutex::new(SlotData {
                buf: vec![N::zeroed(); records_per_buffer],
                records: 0,
            }),
        }
    }
}

/// Reads a single sorted run as a lazy stream of records, prefetching the
/// next buffer on the thread pool while the consumer drains the current one.
///
/// The reader holds exactly two buffers. The consumer owns the front buffer
/// outright; the back buffer lives in a [`LoadSlot`] and belongs to the load
/// task until its `ready` flag is set. At most one load task per reader is
/// in flight at any time.
pub struct RunReader<N: Record> {
    pool: Arc<ThreadPool>,
    file: Arc<Mutex<fs::File>>,
    path: Arc<PathBuf>,

    front: Vec<N>,
    front_records: usize,
    cursor: usize,

    /// Holds the initial front buffer until [`RunReader::wait_first`].
    first: Option<Arc<LoadSlot<N>>>,
    back: Arc<LoadSlot<N>>,
}

impl<N: Record> RunReader<N> {
    /// Opens a run file and schedules the initial loads of both buffers.
    ///
    /// `read_budget` is the total byte budget for this reader; it is halved
    /// into the two buffers, each rounded down to a whole record count.
    /// Non-blocking: call [`RunReader::wait_first`] before the first
    /// [`RunReader::next`].
    pub fn open(pool: Arc<ThreadPool>, path: PathBuf, read_budget: usize) -> Result<Self, SortError> {
        let buffer_bytes = io::round_to_record::<N>(read_budget / 2);
        let records_per_buffer = buffer_bytes / mem::size_of::<N>();

        let file = io::open_input(&path).map_err(|err| SortError::Open {
            path: path.clone(),
            source: err,
        })?;
        let file = Arc::new(Mutex::new(file));
        let path = Arc::new(path);

        let first = Arc::new(LoadSlot::new(records_per_buffer));
        let back = Arc::new(LoadSlot::new(records_per_buffer));

        {
            let file = Arc::clone(&file);
            let path = Arc::clone(&path);
            let first = Arc::clone(&first);
            let back = Arc::clone(&back);

            // A single task fills both buffers back to back, yielding in
            // between so other readers' first buffers are not starved.
            pool.submit(move || {
                load_slot(&file, &path, &first)?;

                thread::yield_now();

                load_slot(&file, &path, &back)
            });
        }

        return Ok(RunReader {
            pool,
            file,
            path,
            front: Vec::new(),
            front_records: 0,
            cursor: 0,
            first: Some(first),
            back,
        });
    }

    /// Blocks until the first buffer is loaded. Must be called once before
    /// the first [`RunReader::next`].
    pub fn wait_first(&mut self) -> Result<(), SortError> {
        let first = self.first.take().expect("wait_first is called once");

        self.pool.wait_ready(&first.ready)?;

        let mut data = first.data.lock();
        mem::swap(&mut self.front, &mut data.buf);
        self.front_records = data.records;
        self.cursor = 0;

        return Ok(());
    }

    /// Yields the next record in run order, or `None` once the run is
    /// exhausted.
    pub fn next(&mut self) -> Result<Option<N>, SortError> {
        debug_assert!(self.first.is_none(), "wait_first must be called before next");

        loop {
            if self.cursor < self.front_records {
                let record = self.front[self.cursor];
                self.cursor += 1;

                return Ok(Some(record));
            }

            // A load of zero records marks the end of the run.
            if self.front_records == 0 {
                return Ok(None);
            }

            self.pool.wait_ready(&self.back.ready)?;

            {
                let mut data = self.back.data.lock();
                mem::swap(&mut self.front, &mut data.buf);
                self.front_records = data.records;
                data.records = 0;
            }
            self.cursor = 0;
            self.back.ready.store(false, Ordering::Release);

            let file = Arc::clone(&self.file);
            let path = Arc::clone(&self.path);
            let back = Arc::clone(&self.back);
            self.pool.submit(move || load_slot(&file, &path, &back));
        }
    }
}

/// Fills a slot from the stream and publishes it via the `ready` flag.
/// End of file is not a failure; it shows up as a short (possibly zero)
/// record count.
fn load_slot<N: Record>(
    file: &Mutex<fs::File>,
    path: &Path,
    slot: &LoadSlot<N>,
) -> Result<(), SortError> {
    let mut data = slot.data.lock();
    let SlotData { buf, records } = &mut *data;

    let bytes = {
        let mut file = file.lock();
        io::read_exact_or_eof(&mut *file, bytemuck::cast_slice_mut(buf.as_mut_slice())).map_err(
            |err| SortError::Read {
                path: path.to_owned(),
                source: err,
            },
        )?
    };

    *records = bytes / mem::size_of::<N>();
    drop(data);

    slot.ready.store(true, Ordering::Release);

    return Ok(());
}
