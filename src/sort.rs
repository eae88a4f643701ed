//! External sorter.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log;
use parking_lot::Mutex;

use crate::chunk::create_sorted_runs;
use crate::io::{open_input, open_output, round_to_record, Record};
use crate::merger::merge_sorted_runs;
use crate::pool::ThreadPool;

const OUTPUT_FILE_NAME: &str = "output";
const INTERMEDIATE_DIR_NAME: &str = "intermediate";

/// Smallest useful memory budget the sorter accepts.
const MIN_USEFUL_MEMORY: usize = 2 * 1024 * 1024;

/// Share of the caller's memory budget available for sort and merge
/// buffers; the rest covers worker stacks and structural overhead.
/// Tuning values, found by profiling.
const USEFUL_MEMORY_NUM: usize = 9;
const USEFUL_MEMORY_DENOM: usize = 16;

/// Sorting error.
#[derive(Debug)]
pub enum SortError {
    /// The memory budget is too small to sort with.
    Config { available_memory: usize },
    /// Input, output or run file opening error.
    Open { path: PathBuf, source: io::Error },
    /// Hard read failure on the input or a run file.
    Read { path: PathBuf, source: io::Error },
    /// Hard write failure on the output or a run file.
    Write { path: PathBuf, source: io::Error },
    /// Intermediate directory creation error.
    Filesystem { path: PathBuf, source: io::Error },
    /// A worker task panicked.
    TaskPanic(String),
    /// A worker task failed and its error was already reported.
    TaskFailed,
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::Open { source, .. } => Some(source),
            SortError::Read { source, .. } => Some(source),
            SortError::Write { source, .. } => Some(source),
            SortError::Filesystem { source, .. } => Some(source),
            SortError::Config { .. } | SortError::TaskPanic(_) | SortError::TaskFailed => None,
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::Config { available_memory } => {
                write!(f, "not enough memory: {} bytes available", available_memory)
            }
            SortError::Open { path, source } => {
                write!(f, "failed to open the file {}: {}", path.display(), source)
            }
            SortError::Read { path, source } => {
                write!(f, "failed to read the file {}: {}", path.display(), source)
            }
            SortError::Write { path, source } => {
                write!(f, "failed to write the file {}: {}", path.display(), source)
            }
            SortError::Filesystem { path, source } => write!(
                f,
                "failed to create the intermediate directory {}: {}",
                path.display(),
                source
            ),
            SortError::TaskPanic(message) => write!(f, "a worker task panicked: {}", message),
            SortError::TaskFailed => write!(f, "a worker task failed"),
        }
    }
}

/// Sorts records stored in a binary file using a limited amount of memory
/// and writes the result to `<output_directory>/output`.
///
/// Sorting happens in two phases: the input is split into sorted runs kept
/// as `chunk_<id>` files inside `<output_directory>/intermediate/`, which
/// are then merged into the output. Neither the intermediate directory nor
/// the run files are removed afterwards; cleanup is the caller's concern.
pub struct ExternalSorter<N: Record> {
    useful_memory: usize,
    input_path: PathBuf,
    output_path: PathBuf,
    intermediate_dir: PathBuf,

    input: fs::File,
    output: Arc<Mutex<fs::File>>,

    pool: Arc<ThreadPool>,
    run_counter: Arc<AtomicU32>,

    record_type: PhantomData<N>,
}

impl<N: Record> ExternalSorter<N> {
    /// Creates a new external sorter instance.
    ///
    /// Both files are opened eagerly, so the output file exists (and is
    /// empty) even if [`ExternalSorter::sort`] is never called.
    ///
    /// # Arguments
    /// * `available_memory` - Memory budget for the whole sort, in bytes.
    /// * `input_file_path` - Path to the binary input file.
    /// * `output_directory_path` - Directory for the output file and the
    ///   intermediate run files. Must exist.
    /// * `pool` - Worker pool executing sort, load and write tasks. Shared
    ///   so that callers can inject a pool with a pinned worker count.
    pub fn new(
        available_memory: usize,
        input_file_path: impl Into<PathBuf>,
        output_directory_path: impl AsRef<Path>,
        pool: Arc<ThreadPool>,
    ) -> Result<Self, SortError> {
        let useful_memory =
            round_to_record::<N>(available_memory * USEFUL_MEMORY_NUM / USEFUL_MEMORY_DENOM);
        if useful_memory < MIN_USEFUL_MEMORY {
            return Err(SortError::Config { available_memory });
        }

        let input_path = input_file_path.into();
        let output_directory_path = output_directory_path.as_ref();
        let output_path = output_directory_path.join(OUTPUT_FILE_NAME);
        let intermediate_dir = output_directory_path.join(INTERMEDIATE_DIR_NAME);

        let input = open_input(&input_path).map_err(|err| SortError::Open {
            path: input_path.clone(),
            source: err,
        })?;
        let output = open_output(&output_path).map_err(|err| SortError::Open {
            path: output_path.clone(),
            source: err,
        })?;

        return Ok(ExternalSorter {
            useful_memory,
            input_path,
            output_path,
            intermediate_dir,
            input,
            output: Arc::new(Mutex::new(output)),
            pool,
            run_counter: Arc::new(AtomicU32::new(0)),
            record_type: PhantomData,
        });
    }

    /// Performs the sort and stores the result in the output file.
    pub fn sort(&mut self) -> Result<(), SortError> {
        self.create_intermediate_directory()?;

        log::info!(
            "sorting {} into {} ({} useful bytes)",
            self.input_path.display(),
            self.output_path.display(),
            self.useful_memory
        );

        create_sorted_runs::<N, _>(
            &mut self.input,
            &self.input_path,
            &self.intermediate_dir,
            self.useful_memory,
            &self.run_counter,
            &self.pool,
        )?;

        let runs = self.run_count();
        log::debug!("chunking phase done ({} runs)", runs);

        merge_sorted_runs::<N>(
            &self.output,
            &self.output_path,
            &self.intermediate_dir,
            self.useful_memory,
            runs,
            &self.pool,
        )?;

        log::debug!("merge phase done");

        return Ok(());
    }

    /// Number of intermediate runs produced so far.
    pub fn run_count(&self) -> u32 {
        self.run_counter.load(Ordering::Acquire)
    }

    fn create_intermediate_directory(&self) -> Result<(), SortError> {
        fs::create_dir_all(&self.intermediate_dir).map_err(|err| SortError::Filesystem {
            path: self.intermediate_dir.clone(),
            source: err,
        })?;

        log::info!(
            "using {} as an intermediate directory",
            self.intermediate_dir.display()
        );

        return Ok(());
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::prelude::*;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use rand::Rng;
    use rstest::*;

    use super::{ExternalSorter, SortError};
    use crate::pool::ThreadPool;

    // Gives a useful budget of ~2.25 MiB, just above the minimum.
    const MEMORY: usize = 4 * 1024 * 1024;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn write_input(dir: &tempfile::TempDir, records: &[u32]) -> PathBuf {
        let path = dir.path().join("input");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(bytemuck::cast_slice(records)).unwrap();

        path
    }

    fn read_records(path: &Path) -> Vec<u32> {
        bytemuck::pod_collect_to_vec(&fs::read(path).unwrap())
    }

    fn sort_file(input: &Path, dir: &tempfile::TempDir, memory: usize) -> (PathBuf, u32) {
        let pool = Arc::new(ThreadPool::with_workers(3).unwrap());
        let mut sorter: ExternalSorter<u32> =
            ExternalSorter::new(memory, input, dir.path(), pool).unwrap();

        sorter.sort().unwrap();

        (dir.path().join("output"), sorter.run_count())
    }

    fn random_records(count: usize, max: u32) -> Vec<u32> {
        let mut rng = rand::thread_rng();

        Vec::from_iter((0..count).map(|_| rng.gen_range(0..=max)))
    }

    #[rstest]
    fn test_sorts_input_larger_than_memory(tmp_dir: tempfile::TempDir) {
        // ~4x the useful budget, forcing several runs.
        let records = random_records(10 * MEMORY / 16, 50000);
        let input = write_input(&tmp_dir, &records);

        let (output, runs) = sort_file(&input, &tmp_dir, MEMORY);

        assert!(runs > 1);

        let mut expected = records;
        expected.sort();
        assert_eq!(read_records(&output), expected);
    }

    #[rstest]
    fn test_single_chunk_input(tmp_dir: tempfile::TempDir) {
        // Fits into one chunk even after the per-worker split.
        let records = random_records(1000, u32::MAX);
        let input = write_input(&tmp_dir, &records);

        let (output, runs) = sort_file(&input, &tmp_dir, MEMORY);

        assert_eq!(runs, 1);

        let mut expected = records;
        expected.sort();
        assert_eq!(read_records(&output), expected);
    }

    #[rstest]
    fn test_small_known_input(tmp_dir: tempfile::TempDir) {
        let input = write_input(&tmp_dir, &[3, 1, 2]);

        let (output, _) = sort_file(&input, &tmp_dir, MEMORY);

        assert_eq!(read_records(&output), vec![1, 2, 3]);
    }

    #[rstest]
    fn test_empty_input(tmp_dir: tempfile::TempDir) {
        let input = write_input(&tmp_dir, &[]);

        let (output, runs) = sort_file(&input, &tmp_dir, MEMORY);

        assert_eq!(runs, 0);
        assert_eq!(fs::metadata(output).unwrap().len(), 0);
    }

    #[rstest]
    fn test_constant_input_is_preserved(tmp_dir: tempfile::TempDir) {
        let records = vec![7u32; MEMORY / 4];
        let input = write_input(&tmp_dir, &records);

        let (output, _) = sort_file(&input, &tmp_dir, MEMORY);

        assert_eq!(read_records(&output), records);
    }

    #[rstest]
    fn test_trailing_partial_record_is_dropped(tmp_dir: tempfile::TempDir) {
        let path = write_input(&tmp_dir, &[9, 4]);
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(&[0x01, 0x02])
            .unwrap();

        let (output, _) = sort_file(&path, &tmp_dir, MEMORY);

        assert_eq!(fs::metadata(&output).unwrap().len(), 8);
        assert_eq!(read_records(&output), vec![4, 9]);
    }

    #[rstest]
    fn test_sorting_is_idempotent(tmp_dir: tempfile::TempDir) {
        let records = random_records(200_000, 1000);
        let input = write_input(&tmp_dir, &records);

        let (first_output, _) = sort_file(&input, &tmp_dir, MEMORY);
        let first_bytes = fs::read(&first_output).unwrap();

        let second_dir = tempfile::tempdir().unwrap();
        let (second_output, _) = sort_file(&first_output, &second_dir, MEMORY);

        assert_eq!(fs::read(second_output).unwrap(), first_bytes);
    }

    #[rstest]
    fn test_too_small_memory_budget(tmp_dir: tempfile::TempDir) {
        let input = write_input(&tmp_dir, &[1, 2, 3]);
        let pool = Arc::new(ThreadPool::with_workers(2).unwrap());

        let result = ExternalSorter::<u32>::new(1024 * 1024, input, tmp_dir.path(), pool);

        assert!(matches!(result, Err(SortError::Config { .. })));
    }

    #[rstest]
    fn test_missing_input_file(tmp_dir: tempfile::TempDir) {
        let pool = Arc::new(ThreadPool::with_workers(2).unwrap());

        let result = ExternalSorter::<u32>::new(
            MEMORY,
            tmp_dir.path().join("missing"),
            tmp_dir.path(),
            pool,
        );

        assert!(matches!(result, Err(SortError::Open { .. })));
    }
}
