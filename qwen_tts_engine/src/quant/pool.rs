//! Bounded worker pool used inside a single kernel call.

use rayon::prelude::*;

/// Rows handed to one worker at a time.
const ROW_CHUNK: usize = 64;

/// Matrices with fewer output rows than this run on the calling thread.
const PARALLEL_MIN_ROWS: usize = 256;

/// Small rayon pool owned by an engine context.
///
/// Parallelism never spans kernel boundaries: each call fans rows out and
/// joins before returning.
pub struct KernelPool {
    pool: Option<rayon::ThreadPool>,
}

impl KernelPool {
    /// Build a pool with `threads` workers. Zero or one thread means inline execution.
    pub fn new(threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        if threads <= 1 {
            return Ok(Self::inline());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("qtts-kernel-{i}"))
            .build()?;
        Ok(Self { pool: Some(pool) })
    }

    /// A pool that runs everything on the calling thread.
    pub fn inline() -> Self {
        Self { pool: None }
    }

    pub fn threads(&self) -> usize {
        self.pool.as_ref().map_or(1, |p| p.current_num_threads())
    }

    /// Run `op` inside the pool so nested rayon iterators use its workers.
    /// Without workers `op` runs on the calling thread.
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    /// Fill `out[r] = row(r)` for every row, splitting rows across workers.
    pub fn map_rows<F>(&self, out: &mut [f32], row: F)
    where
        F: Fn(usize) -> f32 + Sync,
    {
        match &self.pool {
            Some(pool) if out.len() >= PARALLEL_MIN_ROWS => pool.install(|| {
                out.par_chunks_mut(ROW_CHUNK)
                    .enumerate()
                    .for_each(|(chunk_idx, chunk)| {
                        let base = chunk_idx * ROW_CHUNK;
                        for (i, o) in chunk.iter_mut().enumerate() {
                            *o = row(base + i);
                        }
                    })
            }),
            _ => {
                for (r, o) in out.iter_mut().enumerate() {
                    *o = row(r);
                }
            }
        }
    }

    /// Split `out` into `chunk_len`-wide chunks and fill chunk `i` with `fill(i, chunk)`.
    ///
    /// Used for per-channel work such as convolutions, where one output
    /// channel is a contiguous run of samples.
    pub fn map_chunks<F>(&self, out: &mut [f32], chunk_len: usize, fill: F)
    where
        F: Fn(usize, &mut [f32]) + Sync,
    {
        if chunk_len == 0 {
            return;
        }
        match &self.pool {
            Some(pool) if out.len() >= PARALLEL_MIN_ROWS * 4 => pool.install(|| {
                out.par_chunks_mut(chunk_len)
                    .enumerate()
                    .for_each(|(i, chunk)| fill(i, chunk))
            }),
            _ => {
                for (i, chunk) in out.chunks_mut(chunk_len).enumerate() {
                    fill(i, chunk);
                }
            }
        }
    }
}

impl Default for KernelPool {
    fn default() -> Self {
        Self::inline()
    }
}

impl std::fmt::Debug for KernelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelPool")
            .field("threads", &self.threads())
            .finish()
    }
}
