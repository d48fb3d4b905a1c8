//! Chunked parallel map-reduce over the sample axis.
//!
//! A [`ChunkPlan`] partitions `[0, total)` into fixed-size chunks. [`parallel_reduce`] runs a
//! chunk function for every chunk on a bounded rayon pool, receives results as workers finish
//! them, and folds each output slot into an [`Accumulator`] according to its [`CombineRule`].
//!
//! Partial results are folded in chunk order even though they arrive in completion order, so a
//! reduction is bit-for-bit reproducible regardless of the worker count. `Append` slots are
//! keyed by the chunk's start offset and concatenated in ascending offset order.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use ndarray::{concatenate, Array1, ArrayView1, Axis, Zip};

use crate::error::{Result, ScanError};

// --- Chunk Partitioning ---

/// One contiguous sample range `[start, start + len)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Chunk {
    /// Position of this chunk in ascending start order.
    pub index: usize,
    pub start: usize,
    pub len: usize,
}

impl Chunk {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPlan {
    total: usize,
    batch_size: usize,
}

impl ChunkPlan {
    pub fn new(total: usize, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(ScanError::Config("batch size must be >= 1".to_string()));
        }
        Ok(Self { total, batch_size })
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of chunks, `ceil(total / batch_size)`.
    pub fn len(&self) -> usize {
        self.total.div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Chunks in ascending start order; the last one may be shorter.
    pub fn chunks(&self) -> impl Iterator<Item = Chunk> + '_ {
        (0..self.len()).map(move |index| {
            let start = index * self.batch_size;
            Chunk {
                index,
                start,
                len: self.batch_size.min(self.total - start),
            }
        })
    }
}

// --- Combination Rules ---

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CombineRule {
    Sum,
    Max,
    Min,
    /// Keep one array per chunk and concatenate them in sample order.
    Append,
}

impl CombineRule {
    fn merge_into(self, existing: &mut Array1<f64>, incoming: ArrayView1<f64>) -> Result<()> {
        match self {
            CombineRule::Sum => *existing += &incoming,
            CombineRule::Max => Zip::from(existing)
                .and(incoming)
                .for_each(|e, &i| *e = e.max(i)),
            CombineRule::Min => Zip::from(existing)
                .and(incoming)
                .for_each(|e, &i| *e = e.min(i)),
            CombineRule::Append => {
                return Err(ScanError::Format(
                    "append partials cannot be merged element-wise".to_string(),
                ))
            }
        }
        Ok(())
    }
}

/// Running state of one output slot.
#[derive(Clone, Debug)]
pub enum Accumulator {
    Reduced {
        rule: CombineRule,
        value: Option<Array1<f64>>,
    },
    Appended(BTreeMap<usize, Array1<f64>>),
}

impl Accumulator {
    pub fn new(rule: CombineRule) -> Self {
        match rule {
            CombineRule::Append => Accumulator::Appended(BTreeMap::new()),
            rule => Accumulator::Reduced { rule, value: None },
        }
    }

    pub fn rule(&self) -> CombineRule {
        match self {
            Accumulator::Reduced { rule, .. } => *rule,
            Accumulator::Appended(_) => CombineRule::Append,
        }
    }

    /// Folds the partial result of `chunk` into this slot. The first partial seeds the value.
    pub fn merge(&mut self, chunk: &Chunk, partial: Array1<f64>) -> Result<()> {
        match self {
            Accumulator::Reduced { rule, value } => match value {
                None => {
                    *value = Some(partial);
                    Ok(())
                }
                Some(existing) => {
                    if existing.len() != partial.len() {
                        return Err(ScanError::Format(format!(
                            "{:?} partial has length {}, accumulator has length {}",
                            rule,
                            partial.len(),
                            existing.len()
                        )));
                    }
                    rule.merge_into(existing, partial.view())
                }
            },
            Accumulator::Appended(parts) => {
                if parts.insert(chunk.start, partial).is_some() {
                    return Err(ScanError::Format(format!(
                        "chunk starting at sample {} was appended twice",
                        chunk.start
                    )));
                }
                Ok(())
            }
        }
    }

    pub fn finish(self) -> Result<Array1<f64>> {
        match self {
            Accumulator::Reduced { value, .. } => Ok(value.unwrap_or_else(|| Array1::zeros(0))),
            Accumulator::Appended(parts) => {
                if parts.is_empty() {
                    return Ok(Array1::zeros(0));
                }
                let views: Vec<ArrayView1<f64>> = parts.values().map(|p| p.view()).collect();
                concatenate(Axis(0), &views)
                    .map_err(|e| ScanError::Format(format!("cannot concatenate partials: {}", e)))
            }
        }
    }
}

// --- Scheduler ---

/// Worker pool settings for [`parallel_reduce`].
#[derive(Clone, Debug)]
pub struct ReduceOptions {
    pub workers: usize,
    /// Label shown next to the progress bar. No bar is drawn when `None`.
    pub progress_label: Option<String>,
}

impl ReduceOptions {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            progress_label: None,
        }
    }

    pub fn with_progress(mut self, label: impl Into<String>) -> Self {
        self.progress_label = Some(label.into());
        self
    }
}

/// `None` when the chunk was skipped after an earlier failure.
type ChunkOutcome = (Chunk, Option<Result<Vec<Array1<f64>>>>);

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn make_progress_bar(len: usize, label: Option<&str>) -> ProgressBar {
    let label = match label {
        Some(label) => label,
        None => return ProgressBar::hidden(),
    };
    let bar = ProgressBar::new(len as u64);
    match ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] {msg} [{bar:40.cyan/blue}] {pos}/{len} chunks ETA: {eta}")
    {
        Ok(style) => bar.set_style(style.progress_chars("=> ")),
        Err(e) => warn!("Failed to create progress bar style: {}", e),
    }
    bar.set_message(label.to_string());
    bar
}

/// Folds results into the accumulators strictly in chunk order, buffering early arrivals.
struct OrderedFold {
    accumulators: Vec<Accumulator>,
    pending: BTreeMap<usize, (Chunk, Vec<Array1<f64>>)>,
    next_index: usize,
}

impl OrderedFold {
    fn new(rules: &[CombineRule]) -> Self {
        Self {
            accumulators: rules.iter().map(|rule| Accumulator::new(*rule)).collect(),
            pending: BTreeMap::new(),
            next_index: 0,
        }
    }

    /// Returns the number of chunks merged by this call.
    fn offer(&mut self, chunk: Chunk, partials: Vec<Array1<f64>>) -> std::result::Result<usize, (Chunk, ScanError)> {
        self.pending.insert(chunk.index, (chunk, partials));
        let mut merged = 0usize;
        while let Some((ready_chunk, ready_partials)) = self.pending.remove(&self.next_index) {
            if ready_partials.len() != self.accumulators.len() {
                return Err((
                    ready_chunk,
                    ScanError::Format(format!(
                        "chunk function returned {} partial results for {} accumulators",
                        ready_partials.len(),
                        self.accumulators.len()
                    )),
                ));
            }
            for (accumulator, partial) in self.accumulators.iter_mut().zip(ready_partials) {
                accumulator
                    .merge(&ready_chunk, partial)
                    .map_err(|e| (ready_chunk, e))?;
            }
            self.next_index += 1;
            merged += 1;
        }
        Ok(merged)
    }
}

fn computation_error(chunk: Chunk, cause: ScanError) -> ScanError {
    ScanError::Computation {
        chunk_index: chunk.index,
        start: chunk.start,
        end: chunk.end(),
        source: Box::new(cause),
    }
}

/// Chunks submitted ahead of the oldest unmerged chunk, per worker.
pub const CHUNKS_AHEAD_PER_WORKER: usize = 4;

fn spawn_chunk<'scope, F>(
    scope: &rayon::Scope<'scope>,
    chunk: Chunk,
    chunk_fn: &'scope F,
    failed: &'scope AtomicBool,
    sender: flume::Sender<ChunkOutcome>,
) where
    F: Fn(&Chunk) -> Result<Vec<Array1<f64>>> + Sync,
{
    scope.spawn(move |_| {
        let outcome = if failed.load(Ordering::Relaxed) {
            None
        } else {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| chunk_fn(&chunk)))
                .unwrap_or_else(|payload| Err(ScanError::Panicked(panic_message(payload))));
            if outcome.is_err() {
                failed.store(true, Ordering::Relaxed);
            }
            Some(outcome)
        };
        // The receiver outlives every task.
        let _ = sender.send((chunk, outcome));
    });
}

/// Runs `chunk_fn` once per chunk of `plan` on a pool of `options.workers` threads and
/// combines the returned partial arrays slot by slot according to `rules`.
///
/// `chunk_fn` must return exactly one array per rule, in rule order. Any failure (error or
/// panic) in any chunk fails the whole reduction; chunks not yet started are then skipped and
/// the failure with the lowest chunk index is reported.
///
/// Chunks are submitted in ascending order, and a chunk is only submitted while its index is
/// less than `oldest unmerged index + workers * CHUNKS_AHEAD_PER_WORKER`. At most that many
/// chunk results are therefore held in memory at once, however slow a single chunk is.
pub fn parallel_reduce<F>(
    plan: &ChunkPlan,
    rules: &[CombineRule],
    options: &ReduceOptions,
    chunk_fn: F,
) -> Result<Vec<Array1<f64>>>
where
    F: Fn(&Chunk) -> Result<Vec<Array1<f64>>> + Sync,
{
    if options.workers == 0 {
        return Err(ScanError::Config("workers must be >= 1".to_string()));
    }
    let num_chunks = plan.len();
    let window = options.workers.saturating_mul(CHUNKS_AHEAD_PER_WORKER);
    debug!(
        "Reducing {} chunks of up to {} samples over {} worker(s) ({} chunks ahead), rules {:?}",
        num_chunks,
        plan.batch_size(),
        options.workers,
        window,
        rules
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.workers)
        .thread_name(|idx| format!("scan-worker-{}", idx))
        .build()
        .map_err(|e| ScanError::Config(format!("cannot build worker pool: {}", e)))?;

    let progress = make_progress_bar(num_chunks, options.progress_label.as_deref());
    let failed = AtomicBool::new(false);
    let mut fold = OrderedFold::new(rules);
    let mut first_failure: Option<(Chunk, ScanError)> = None;
    let (result_sender, result_receiver) = flume::unbounded::<ChunkOutcome>();

    pool.in_place_scope(|scope| {
        let mut upcoming = plan.chunks().peekable();
        let mut in_flight = 0usize;
        while let Some(chunk) = upcoming.next_if(|c| c.index < window) {
            spawn_chunk(scope, chunk, &chunk_fn, &failed, result_sender.clone());
            in_flight += 1;
        }

        while in_flight > 0 {
            let (chunk, outcome) = match result_receiver.recv() {
                Ok(message) => message,
                Err(_) => break,
            };
            in_flight -= 1;
            let failure = match outcome {
                None => None,
                Some(Ok(partials)) if first_failure.is_none() => {
                    match fold.offer(chunk, partials) {
                        Ok(merged) => {
                            progress.inc(merged as u64);
                            None
                        }
                        Err(failure) => Some(failure),
                    }
                }
                Some(Ok(_)) => None,
                Some(Err(cause)) => Some((chunk, cause)),
            };
            if let Some((failed_chunk, cause)) = failure {
                failed.store(true, Ordering::Relaxed);
                debug!("Chunk {} failed: {}", failed_chunk.index, cause);
                let replace = first_failure
                    .as_ref()
                    .map_or(true, |(current, _)| failed_chunk.index < current.index);
                if replace {
                    first_failure = Some((failed_chunk, cause));
                }
            }
            if first_failure.is_none() {
                let horizon = fold.next_index.saturating_add(window);
                while let Some(next) = upcoming.next_if(|c| c.index < horizon) {
                    spawn_chunk(scope, next, &chunk_fn, &failed, result_sender.clone());
                    in_flight += 1;
                }
            }
        }
    });
    drop(result_sender);

    if let Some((chunk, cause)) = first_failure {
        progress.abandon();
        return Err(computation_error(chunk, cause));
    }
    progress.finish_and_clear();
    if fold.next_index != num_chunks {
        return Err(ScanError::Format(format!(
            "reduction finished with {} of {} chunks merged",
            fold.next_index, num_chunks
        )));
    }

    fold.accumulators
        .into_iter()
        .map(Accumulator::finish)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::sync::{Condvar, Mutex};
    use std::thread;
    use std::time::Duration;

    fn synthetic_partials(chunk: &Chunk) -> Vec<Array1<f64>> {
        let values: Array1<f64> = (chunk.start..chunk.end())
            .map(|sample| (sample as f64 * 0.37).sin() * 1e3 + 0.1)
            .collect();
        let mut per_feature = Array1::<f64>::zeros(3);
        for (feature_idx, slot) in per_feature.iter_mut().enumerate() {
            *slot = values.iter().map(|v| v * (feature_idx as f64 + 1.0) / 7.0).sum();
        }
        vec![
            per_feature.clone(),
            per_feature.mapv(|v| v.abs()),
            per_feature.mapv(|v| -v),
            values,
        ]
    }

    const RULES: [CombineRule; 4] = [
        CombineRule::Sum,
        CombineRule::Max,
        CombineRule::Min,
        CombineRule::Append,
    ];

    #[test]
    fn test_chunk_plan_partitions_exactly() {
        let plan = ChunkPlan::new(10, 4).unwrap();
        let chunks: Vec<Chunk> = plan.chunks().collect();
        assert_eq!(plan.len(), 3);
        assert_eq!(
            chunks,
            vec![
                Chunk { index: 0, start: 0, len: 4 },
                Chunk { index: 1, start: 4, len: 4 },
                Chunk { index: 2, start: 8, len: 2 },
            ]
        );
        assert_eq!(ChunkPlan::new(8, 4).unwrap().len(), 2);
        assert_eq!(ChunkPlan::new(0, 4).unwrap().len(), 0);
        assert!(ChunkPlan::new(10, 0).is_err());
    }

    #[test]
    fn test_accumulator_rules() {
        let chunk = Chunk { index: 0, start: 0, len: 1 };
        let mut sum = Accumulator::new(CombineRule::Sum);
        let mut max = Accumulator::new(CombineRule::Max);
        let mut min = Accumulator::new(CombineRule::Min);
        for partial in [array![1.0, 5.0], array![3.0, -2.0]] {
            sum.merge(&chunk, partial.clone()).unwrap();
            max.merge(&chunk, partial.clone()).unwrap();
            min.merge(&chunk, partial).unwrap();
        }
        assert_eq!(sum.finish().unwrap(), array![4.0, 3.0]);
        assert_eq!(max.finish().unwrap(), array![3.0, 5.0]);
        assert_eq!(min.finish().unwrap(), array![1.0, -2.0]);

        let mut mismatched = Accumulator::new(CombineRule::Sum);
        mismatched.merge(&chunk, array![1.0]).unwrap();
        assert!(mismatched.merge(&chunk, array![1.0, 2.0]).is_err());
    }

    #[test]
    fn test_reduced_append_slot_is_an_error() {
        let chunk = Chunk { index: 0, start: 0, len: 1 };
        let mut slot = Accumulator::Reduced {
            rule: CombineRule::Append,
            value: None,
        };
        slot.merge(&chunk, array![1.0]).unwrap();
        assert!(matches!(slot.merge(&chunk, array![2.0]), Err(ScanError::Format(_))));
    }

    #[test]
    fn test_append_orders_by_start_offset() {
        let mut append = Accumulator::new(CombineRule::Append);
        append.merge(&Chunk { index: 1, start: 2, len: 1 }, array![3.0]).unwrap();
        append.merge(&Chunk { index: 0, start: 0, len: 2 }, array![1.0, 2.0]).unwrap();
        assert_eq!(append.rule(), CombineRule::Append);
        assert_eq!(append.finish().unwrap(), array![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_worker_count_does_not_change_results() {
        let plan = ChunkPlan::new(1000, 37).unwrap();
        let sequential =
            parallel_reduce(&plan, &RULES, &ReduceOptions::new(1), |c| Ok(synthetic_partials(c)))
                .unwrap();
        for workers in [2, 4, 8] {
            let parallel = parallel_reduce(&plan, &RULES, &ReduceOptions::new(workers), |c| {
                // stagger completion
                thread::sleep(Duration::from_micros(((c.index * 7919) % 13) as u64 * 50));
                Ok(synthetic_partials(c))
            })
            .unwrap();
            for (seq, par) in sequential.iter().zip(parallel.iter()) {
                let seq_bits: Vec<u64> = seq.iter().map(|v| v.to_bits()).collect();
                let par_bits: Vec<u64> = par.iter().map(|v| v.to_bits()).collect();
                assert_eq!(seq_bits, par_bits, "workers={}", workers);
            }
        }
        assert_eq!(sequential[3].len(), 1000);
    }

    #[test]
    fn test_append_survives_reverse_completion_order() {
        let plan = ChunkPlan::new(10, 3).unwrap();
        let num_chunks = plan.len();
        // Chunk i may only finish after every chunk with a larger index has finished.
        let finished = (Mutex::new(0usize), Condvar::new());
        let completion_order = Mutex::new(Vec::new());

        let reversed = parallel_reduce(
            &plan,
            &[CombineRule::Append, CombineRule::Sum],
            &ReduceOptions::new(num_chunks),
            |chunk| {
                let (lock, cvar) = &finished;
                let mut done = lock.lock().unwrap();
                while *done != num_chunks - 1 - chunk.index {
                    done = cvar.wait(done).unwrap();
                }
                completion_order.lock().unwrap().push(chunk.index);
                *done += 1;
                cvar.notify_all();
                let samples: Array1<f64> = (chunk.start..chunk.end()).map(|s| s as f64).collect();
                let total = array![samples.sum()];
                Ok(vec![samples, total])
            },
        )
        .unwrap();

        assert_eq!(*completion_order.lock().unwrap(), vec![3, 2, 1, 0]);
        let expected: Array1<f64> = (0..10).map(|s| s as f64).collect();
        assert_eq!(reversed[0], expected);
        assert_eq!(reversed[1], array![45.0]);
    }

    #[test]
    fn test_slow_first_chunk_bounds_submitted_chunks() {
        let plan = ChunkPlan::new(200, 2).unwrap();
        let workers = 2;
        let first_done = AtomicBool::new(false);
        let started_early = Mutex::new(Vec::new());
        let result = parallel_reduce(&plan, &[CombineRule::Sum], &ReduceOptions::new(workers), |c| {
            if c.index == 0 {
                thread::sleep(Duration::from_millis(50));
                first_done.store(true, Ordering::SeqCst);
            } else if !first_done.load(Ordering::SeqCst) {
                started_early.lock().unwrap().push(c.index);
            }
            Ok(vec![array![1.0]])
        })
        .unwrap();

        assert_eq!(result[0], array![100.0]);
        let window = workers * CHUNKS_AHEAD_PER_WORKER;
        let early = started_early.lock().unwrap();
        assert!(early.iter().all(|&idx| idx < window), "started before chunk 0 finished: {:?}", early);
    }

    #[test]
    fn test_failure_reports_chunk_index() {
        let plan = ChunkPlan::new(100, 10).unwrap();
        for workers in [1, 3] {
            let result = parallel_reduce(&plan, &[CombineRule::Sum], &ReduceOptions::new(workers), |c| {
                if c.index == 4 {
                    Err(ScanError::Format("bad chunk".to_string()))
                } else {
                    Ok(vec![array![1.0]])
                }
            });
            match result {
                Err(ScanError::Computation { chunk_index, start, end, source }) => {
                    assert_eq!(chunk_index, 4);
                    assert_eq!((start, end), (40, 50));
                    assert!(matches!(*source, ScanError::Format(_)));
                }
                other => panic!("expected computation error, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_panic_becomes_computation_error() {
        let plan = ChunkPlan::new(4, 2).unwrap();
        let result = parallel_reduce(&plan, &[CombineRule::Sum], &ReduceOptions::new(2), |c| {
            if c.index == 1 {
                panic!("worker exploded");
            }
            Ok(vec![array![1.0]])
        });
        let err = result.unwrap_err();
        assert_eq!(err.chunk_index(), Some(1));
        assert!(err.to_string().contains("worker exploded"));
    }

    #[test]
    fn test_arity_mismatch_is_an_error() {
        let plan = ChunkPlan::new(4, 2).unwrap();
        let result = parallel_reduce(
            &plan,
            &[CombineRule::Sum, CombineRule::Max],
            &ReduceOptions::new(1),
            |_| Ok(vec![array![1.0]]),
        );
        assert_eq!(result.unwrap_err().chunk_index(), Some(0));
    }

    #[test]
    fn test_empty_plan_yields_empty_slots() {
        let plan = ChunkPlan::new(0, 16).unwrap();
        let result = parallel_reduce(
            &plan,
            &[CombineRule::Sum, CombineRule::Append],
            &ReduceOptions::new(2),
            |_| Ok(vec![array![1.0], array![1.0]]),
        )
        .unwrap();
        assert_eq!(result.len(), 2);
        assert!(result.iter().all(|slot| slot.is_empty()));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let plan = ChunkPlan::new(4, 2).unwrap();
        let result = parallel_reduce(&plan, &[CombineRule::Sum], &ReduceOptions::new(0), |_| {
            Ok(vec![array![1.0]])
        });
        assert!(matches!(result, Err(ScanError::Config(_))));
    }
}
