//! Lazy sequence capability.
//!
//! Producers (`range`, `load`, `map`, stored results) expose their elements
//! through [`LazySequence`]; consumers (`stream`, `page`, `save`) dispatch
//! on [`SequenceValue`] without ever relying on partition boundaries for
//! correctness. Iteration is single-pass and restartable: a fresh
//! `iter_from` call may reuse whatever the producer has cached.

use super::{ValueError, ValueResult, VoxValue};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Boxed fallible element iterator.
pub type SeqIter<'a> = Box<dyn Iterator<Item = ValueResult<VoxValue>> + Send + 'a>;

/// Capability implemented by every sequence producer.
pub trait LazySequence: Send + Sync {
    /// Iterate elements starting at `offset`. Skipping must not buffer more
    /// than the producer's partition granularity forces.
    fn iter_from(&self, offset: usize) -> SeqIter<'_>;

    /// Exact length when known without materialisation.
    fn known_len(&self) -> Option<usize> {
        None
    }

    /// Cheap lower bound on the element count.
    fn count_lower_bound(&self) -> usize {
        self.known_len().unwrap_or(0)
    }
}

/// Shared handle to a lazy sequence, with the consumer-side combinators.
#[derive(Clone)]
pub struct SequenceValue(Arc<dyn LazySequence>);

impl SequenceValue {
    pub fn new(producer: Arc<dyn LazySequence>) -> Self {
        SequenceValue(producer)
    }

    pub fn materialized(items: Vec<VoxValue>) -> Self {
        SequenceValue(Arc::new(MaterializedSequence { items }))
    }

    pub fn ptr_eq(&self, other: &SequenceValue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn iter(&self) -> SeqIter<'_> {
        self.0.iter_from(0)
    }

    pub fn iter_from(&self, offset: usize) -> SeqIter<'_> {
        self.0.iter_from(offset)
    }

    pub fn known_len(&self) -> Option<usize> {
        self.0.known_len()
    }

    pub fn count_lower_bound(&self) -> usize {
        self.0.count_lower_bound()
    }

    /// Lazy view skipping the first `n` elements.
    pub fn skip(&self, n: usize) -> SequenceValue {
        SequenceValue(Arc::new(SkipSequence {
            inner: self.clone(),
            skip: n,
        }))
    }

    /// First `n` elements, materialized.
    pub fn take(&self, n: usize) -> ValueResult<Vec<VoxValue>> {
        self.iter().take(n).collect()
    }

    /// Chunked single-pass iteration; every chunk except possibly the last
    /// holds exactly `chunk_size` elements.
    pub fn chunks(&self, chunk_size: usize) -> ChunkIter<'_> {
        ChunkIter {
            iter: self.iter(),
            chunk_size: chunk_size.max(1),
            done: false,
        }
    }

    /// One page of elements plus a has-more flag. Skips `offset` elements
    /// lazily and reads at most `limit + 1` to decide `has_more`.
    pub fn page(&self, offset: usize, limit: usize) -> ValueResult<(Vec<VoxValue>, bool)> {
        let mut iter = self.iter_from(offset);
        let mut items = Vec::with_capacity(limit.min(1024));
        for _ in 0..limit {
            match iter.next() {
                Some(item) => items.push(item?),
                None => return Ok((items, false)),
            }
        }
        let has_more = match iter.next() {
            Some(item) => {
                item?;
                true
            }
            None => false,
        };
        Ok((items, has_more))
    }

    /// Full materialisation. Used by `save` goals and strict fallbacks.
    pub fn materialize(&self) -> ValueResult<Vec<VoxValue>> {
        self.iter().collect()
    }
}

impl std::fmt::Debug for SequenceValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SequenceValue(known_len={:?})", self.known_len())
    }
}

/// Iterator adapter yielding fixed-size chunks.
pub struct ChunkIter<'a> {
    iter: SeqIter<'a>,
    chunk_size: usize,
    done: bool,
}

impl Iterator for ChunkIter<'_> {
    type Item = ValueResult<Vec<VoxValue>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut chunk = Vec::with_capacity(self.chunk_size);
        for _ in 0..self.chunk_size {
            match self.iter.next() {
                Some(Ok(item)) => chunk.push(item),
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if chunk.is_empty() {
            None
        } else {
            Some(Ok(chunk))
        }
    }
}

// ============================================================================
// Producers
// ============================================================================

/// Fully materialized sequence.
pub struct MaterializedSequence {
    pub items: Vec<VoxValue>,
}

impl LazySequence for MaterializedSequence {
    fn iter_from(&self, offset: usize) -> SeqIter<'_> {
        Box::new(self.items.iter().skip(offset).cloned().map(Ok))
    }

    fn known_len(&self) -> Option<usize> {
        Some(self.items.len())
    }
}

/// Half-open integer range `[start, end)`.
pub struct RangeSequence {
    pub start: i64,
    pub end: i64,
}

impl LazySequence for RangeSequence {
    fn iter_from(&self, offset: usize) -> SeqIter<'_> {
        let from = self.start.saturating_add(offset as i64).min(self.end);
        Box::new((from..self.end).map(|i| Ok(VoxValue::Integer(i))))
    }

    fn known_len(&self) -> Option<usize> {
        Some((self.end - self.start).max(0) as usize)
    }
}

/// Line-oriented file producer. Lines stream through a buffered reader, so
/// paging the head of a large file touches only the first buffer's worth of
/// content; `bytes_read` exposes how much was actually pulled.
pub struct LinesFileSequence {
    path: PathBuf,
    bytes_read: Arc<AtomicU64>,
}

impl LinesFileSequence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LinesFileSequence {
            path: path.into(),
            bytes_read: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total bytes pulled from the file across all iterations.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }
}

struct CountingReader<R> {
    inner: R,
    counter: Arc<AtomicU64>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.counter.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

impl LazySequence for LinesFileSequence {
    fn iter_from(&self, offset: usize) -> SeqIter<'_> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) => return Box::new(std::iter::once(Err(ValueError::Io(err)))),
        };
        let reader = BufReader::new(CountingReader {
            inner: file,
            counter: Arc::clone(&self.bytes_read),
        });
        Box::new(
            reader
                .lines()
                .skip(offset)
                .map(|line| line.map(VoxValue::Text).map_err(ValueError::Io)),
        )
    }
}

/// Lazy skip view over another sequence.
struct SkipSequence {
    inner: SequenceValue,
    skip: usize,
}

impl LazySequence for SkipSequence {
    fn iter_from(&self, offset: usize) -> SeqIter<'_> {
        self.inner.iter_from(self.skip + offset)
    }

    fn known_len(&self) -> Option<usize> {
        self.inner
            .known_len()
            .map(|len| len.saturating_sub(self.skip))
    }
}
