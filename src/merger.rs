//! K-way merge of sorted runs.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs;
use std::io::prelude::*;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log;
use parking_lot::Mutex;

use crate::buffer::RunReader;
use crate::chunk::run_file_path;
use crate::io::{self, Record};
use crate::pool::ThreadPool;
use crate::sort::SortError;

/// Share of the useful memory handed to the run readers; the remainder is
/// split into the two writeback buffers. Tuning values, found by profiling.
const READ_BUDGET_NUM: usize = 3;
const READ_BUDGET_DENOM: usize = 4;

/// The writeback buffer not currently filled by the merge loop.
///
/// `ready_to_fill` is true while the merge loop may take the buffer; it is
/// cleared when a write task is scheduled and restored (release ordering)
/// once the task has flushed the buffer to the output file.
struct WriteSlot<N> {
    ready_to_fill: AtomicBool,
    data: Mutex<Vec<N>>,
}

/// Merges `run_count` run files from the scratch directory into the output
/// file using a min-heap over double-buffered run readers.
///
/// Records are appended to an output buffer that is flushed asynchronously:
/// while a pool task writes one buffer, the merge loop keeps filling the
/// other. At most one write task is in flight at any time, so writes retire
/// in submission order.
pub(crate) fn merge_sorted_runs<N: Record>(
    output: &Arc<Mutex<fs::File>>,
    output_path: &Path,
    scratch_dir: &Path,
    useful_memory: usize,
    run_count: u32,
    pool: &Arc<ThreadPool>,
) -> Result<(), SortError> {
    if run_count == 0 {
        return Ok(());
    }

    let read_budget_total = useful_memory * READ_BUDGET_NUM / READ_BUDGET_DENOM;
    let read_budget_per_run = io::round_to_record::<N>(read_budget_total / run_count as usize);

    let mut readers = Vec::with_capacity(run_count as usize);
    for id in 0..run_count {
        readers.push(RunReader::<N>::open(
            Arc::clone(pool),
            run_file_path(scratch_dir, id),
            read_budget_per_run,
        )?);
    }

    let write_bytes = io::round_to_record::<N>((useful_memory - read_budget_total) / 2);
    let records_per_write = write_bytes / mem::size_of::<N>();

    log::debug!(
        "merging {} runs ({} bytes per reader, {} records per write)",
        run_count,
        read_budget_per_run,
        records_per_write
    );

    // One entry per non-exhausted run; `Reverse` turns the max-heap into a
    // min-heap on the record value.
    let mut heap: BinaryHeap<(Reverse<N>, usize)> = BinaryHeap::with_capacity(readers.len());

    for (index, reader) in readers.iter_mut().enumerate() {
        reader.wait_first()?;

        if let Some(record) = reader.next()? {
            heap.push((Reverse(record), index));
        }
    }

    if heap.is_empty() {
        return Ok(());
    }

    let slot = Arc::new(WriteSlot {
        ready_to_fill: AtomicBool::new(true),
        data: Mutex::new(vec![N::zeroed(); records_per_write]),
    });
    let mut fill: Vec<N> = vec![N::zeroed(); records_per_write];
    let mut filled = 0;

    while let Some((Reverse(record), index)) = heap.pop() {
        if filled == records_per_write {
            flush_and_swap(&mut fill, &slot, output, output_path, pool)?;
            filled = 0;
        }

        fill[filled] = record;
        filled += 1;

        let top = heap.peek().map(|&(Reverse(top), _)| top);

        // Keep copying from the popped run as long as its head stays the
        // global minimum; this skips a heap push/pop pair per record.
        while let Some(record) = readers[index].next()? {
            if top.map_or(true, |top| record <= top) {
                if filled == records_per_write {
                    flush_and_swap(&mut fill, &slot, output, output_path, pool)?;
                    filled = 0;
                }

                fill[filled] = record;
                filled += 1;

                continue;
            }

            heap.push((Reverse(record), index));

            break;
        }
    }

    if filled > 0 {
        // The in-flight write must retire first to keep the output in order.
        pool.wait_ready(&slot.ready_to_fill)?;

        let mut file = output.lock();
        file.write_all(bytemuck::cast_slice(&fill[..filled]))
            .map_err(|err| SortError::Write {
                path: output_path.to_owned(),
                source: err,
            })?;
    }

    return pool.check_failure();
}

/// Hands the filled buffer to a write task and takes back the other buffer.
fn flush_and_swap<N: Record>(
    fill: &mut Vec<N>,
    slot: &Arc<WriteSlot<N>>,
    output: &Arc<Mutex<fs::File>>,
    output_path: &Path,
    pool: &Arc<ThreadPool>,
) -> Result<(), SortError> {
    pool.wait_ready(&slot.ready_to_fill)?;

    {
        let mut pending = slot.data.lock();
        mem::swap(fill, &mut *pending);
    }
    slot.ready_to_fill.store(false, Ordering::Release);

    let slot = Arc::clone(slot);
    let output = Arc::clone(output);
    let output_path: PathBuf = output_path.to_owned();
    pool.submit(move || {
        let pending = slot.data.lock();

        {
            let mut file = output.lock();
            file.write_all(bytemuck::cast_slice(pending.as_slice()))
                .map_err(|err| SortError::Write {
                    path: output_path,
                    source: err,
                })?;
        }
        drop(pending);

        slot.ready_to_fill.store(true, Ordering::Release);

        Ok(())
    });

    return Ok(());
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io::prelude::*;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use rstest::*;

    use super::merge_sorted_runs;
    use crate::chunk::run_file_path;
    use crate::pool::ThreadPool;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    fn write_runs(dir: &tempfile::TempDir, runs: &[Vec<u32>]) {
        for (id, run) in runs.iter().enumerate() {
            let mut file = fs::File::create(run_file_path(dir.path(), id as u32)).unwrap();
            file.write_all(bytemuck::cast_slice(run)).unwrap();
        }
    }

    fn merge(dir: &tempfile::TempDir, run_count: u32, useful_memory: usize) -> Vec<u32> {
        let output_path = dir.path().join("output");
        let output = Arc::new(Mutex::new(fs::File::create(&output_path).unwrap()));
        let pool = Arc::new(ThreadPool::with_workers(2).unwrap());

        merge_sorted_runs::<u32>(
            &output,
            &output_path,
            dir.path(),
            useful_memory,
            run_count,
            &pool,
        )
        .unwrap();

        drop(output);
        bytemuck::pod_collect_to_vec(&fs::read(output_path).unwrap())
    }

    #[rstest]
    // tiny budget: single-record reader buffers and 2-record write buffers
    #[case(64)]
    // everything fits in single buffers
    #[case(1 << 20)]
    fn test_merges_runs_in_order(tmp_dir: tempfile::TempDir, #[case] useful_memory: usize) {
        write_runs(
            &tmp_dir,
            &[
                vec![4, 5, 7, 9, 11, 30],
                vec![1, 6, 6, 8],
                vec![3, 3, 3, 3, 3],
                vec![2],
            ],
        );

        let merged = merge(&tmp_dir, 4, useful_memory);

        let mut expected: Vec<u32> = vec![4, 5, 7, 9, 11, 30, 1, 6, 6, 8, 3, 3, 3, 3, 3, 2];
        expected.sort();
        assert_eq!(merged, expected);
    }

    #[rstest]
    fn test_single_run_is_copied(tmp_dir: tempfile::TempDir) {
        let run = Vec::from_iter(0..5000u32);
        write_runs(&tmp_dir, &[run.clone()]);

        assert_eq!(merge(&tmp_dir, 1, 4096), run);
    }

    #[rstest]
    fn test_empty_runs_are_skipped(tmp_dir: tempfile::TempDir) {
        write_runs(&tmp_dir, &[vec![], vec![5, 6], vec![]]);

        assert_eq!(merge(&tmp_dir, 3, 1024), vec![5, 6]);
    }

    #[rstest]
    fn test_no_runs_is_a_noop(tmp_dir: tempfile::TempDir) {
        assert_eq!(merge(&tmp_dir, 0, 1024), Vec::<u32>::new());
    }
}
