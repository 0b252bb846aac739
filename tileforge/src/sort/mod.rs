//! External merge sort of rendered features keyed by tile.
//!
//! Ingest side: every render worker owns a private [`FeatureWriter`] that
//! buffers records up to its byte budget, sorts the buffer in memory, and
//! spills it as a numbered chunk file — no locks on the hot path. Merge
//! side: [`FeatureSorter::sort`] opens all chunks behind small fixed-size
//! read buffers and streams a k-way merge through a min-heap to a single
//! consumer, so merge memory is `k × page`, independent of data size.
//!
//! Total order: `(sort key, feature id, chunk id)`. Only one record per
//! chunk lives in the heap at a time, so equal keys drain in chunk write
//! order, making the sort stable with respect to insertion order.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::feature::SortKey;

/// Read buffer per chunk during the merge.
const MERGE_PAGE_BYTES: usize = 64 * 1024;

/// One record as the sorter sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortRecord {
    pub key: SortKey,
    pub feature_id: u64,
    pub payload: Vec<u8>,
}

struct SorterShared {
    dir: PathBuf,
    next_chunk: AtomicU32,
    chunks: Mutex<Vec<PathBuf>>,
}

impl Drop for SorterShared {
    fn drop(&mut self) {
        // Last handle (sorter, writer, or merged stream) gone: the scratch
        // is worthless, reclaim the disk even on abort paths.
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// The sort as a whole; hands out writers, then merges.
pub struct FeatureSorter {
    shared: Arc<SorterShared>,
    chunk_bytes: usize,
}

impl FeatureSorter {
    /// Creates the sorter's scratch subdirectory under `tmpdir`.
    pub fn new(tmpdir: impl Into<PathBuf>, chunk_bytes: usize) -> Result<Self> {
        let dir = tmpdir.into().join("feature_sort");
        std::fs::create_dir_all(&dir).map_err(|e| PipelineError::from_io(&dir, e))?;
        Ok(Self {
            shared: Arc::new(SorterShared {
                dir,
                next_chunk: AtomicU32::new(0),
                chunks: Mutex::new(Vec::new()),
            }),
            chunk_bytes,
        })
    }

    /// A private writer for one worker thread.
    pub fn writer(&self) -> FeatureWriter {
        FeatureWriter {
            shared: Arc::clone(&self.shared),
            buffer: Vec::new(),
            buffered_bytes: 0,
            budget: self.chunk_bytes,
        }
    }

    /// Merges all spilled chunks into one ordered stream. All writers must
    /// have been finished (dropped) first.
    pub fn sort(self) -> Result<SortedStream> {
        let chunks = std::mem::take(&mut *self.shared.chunks.lock());
        debug!(chunks = chunks.len(), "merging sort chunks");
        let mut readers = Vec::with_capacity(chunks.len());
        for path in &chunks {
            let file = File::open(path).map_err(|e| PipelineError::from_io(path, e))?;
            readers.push(ChunkReader {
                reader: BufReader::with_capacity(MERGE_PAGE_BYTES, file),
                path: path.clone(),
            });
        }
        let mut heap = BinaryHeap::with_capacity(readers.len());
        for (chunk_id, reader) in readers.iter_mut().enumerate() {
            if let Some(record) = reader.next_record()? {
                heap.push(Reverse(HeapEntry { record, chunk_id }));
            }
        }
        Ok(SortedStream {
            _shared: Arc::clone(&self.shared),
            readers,
            heap,
        })
    }

    /// Number of chunk files spilled so far.
    pub fn chunk_count(&self) -> usize {
        self.shared.chunks.lock().len()
    }
}

/// Per-worker buffered writer; see [`FeatureSorter::writer`].
pub struct FeatureWriter {
    shared: Arc<SorterShared>,
    buffer: Vec<SortRecord>,
    buffered_bytes: usize,
    budget: usize,
}

impl FeatureWriter {
    pub fn push(&mut self, key: SortKey, feature_id: u64, payload: Vec<u8>) -> Result<()> {
        self.buffered_bytes += payload.len() + 24;
        self.buffer.push(SortRecord {
            key,
            feature_id,
            payload,
        });
        if self.buffered_bytes >= self.budget {
            self.spill()?;
        }
        Ok(())
    }

    /// Flushes the remaining buffer. Must be called before the merge; a
    /// writer dropped without finishing loses its tail silently only in
    /// unwinding paths, where the run is aborting anyway.
    pub fn finish(mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        self.buffer
            .sort_by(|a, b| (a.key, a.feature_id).cmp(&(b.key, b.feature_id)));
        let chunk_id = self.shared.next_chunk.fetch_add(1, Ordering::Relaxed);
        let path = self.shared.dir.join(format!("chunk_{:05}.dat", chunk_id));
        let file = File::create(&path).map_err(|e| PipelineError::from_io(&path, e))?;
        let mut writer = BufWriter::with_capacity(MERGE_PAGE_BYTES, file);
        for record in self.buffer.drain(..) {
            let mut header = [0u8; 20];
            header[0..8].copy_from_slice(&record.key.0.to_le_bytes());
            header[8..16].copy_from_slice(&record.feature_id.to_le_bytes());
            header[16..20].copy_from_slice(&(record.payload.len() as u32).to_le_bytes());
            writer
                .write_all(&header)
                .and_then(|_| writer.write_all(&record.payload))
                .map_err(|e| PipelineError::from_io(&path, e))?;
        }
        writer.flush().map_err(|e| PipelineError::from_io(&path, e))?;
        self.buffered_bytes = 0;
        self.shared.chunks.lock().push(path);
        Ok(())
    }
}

struct ChunkReader {
    reader: BufReader<File>,
    path: PathBuf,
}

impl ChunkReader {
    fn next_record(&mut self) -> Result<Option<SortRecord>> {
        let mut header = [0u8; 20];
        match self.reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(PipelineError::from_io(&self.path, e)),
        }
        let key = SortKey(u64::from_le_bytes(header[0..8].try_into().unwrap()));
        let feature_id = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let len = u32::from_le_bytes(header[16..20].try_into().unwrap()) as usize;
        let mut payload = vec![0u8; len];
        self.reader
            .read_exact(&mut payload)
            .map_err(|e| PipelineError::from_io(&self.path, e))?;
        Ok(Some(SortRecord {
            key,
            feature_id,
            payload,
        }))
    }
}

struct HeapEntry {
    record: SortRecord,
    chunk_id: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.record.key, self.record.feature_id, self.chunk_id).cmp(&(
            other.record.key,
            other.record.feature_id,
            other.chunk_id,
        ))
    }
}

/// Streaming merged output. Holds the scratch directory alive; when the
/// stream drops, the shared state's `Drop` reclaims it.
pub struct SortedStream {
    _shared: Arc<SorterShared>,
    readers: Vec<ChunkReader>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
}

impl SortedStream {
    pub fn next_record(&mut self) -> Result<Option<SortRecord>> {
        let Some(Reverse(entry)) = self.heap.pop() else {
            return Ok(None);
        };
        let chunk_id = entry.chunk_id;
        if let Some(next) = self.readers[chunk_id].next_record()? {
            self.heap.push(Reverse(HeapEntry {
                record: next,
                chunk_id,
            }));
        }
        Ok(Some(entry.record))
    }
}

impl Iterator for SortedStream {
    type Item = Result<SortRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: u64, id: u64, tag: u8) -> (SortKey, u64, Vec<u8>) {
        (SortKey(key), id, vec![tag])
    }

    #[test]
    fn test_merge_produces_total_order() {
        let dir = tempfile::tempdir().unwrap();
        let sorter = FeatureSorter::new(dir.path(), 64).unwrap();
        let mut w1 = sorter.writer();
        let mut w2 = sorter.writer();
        for i in (0..100u64).rev() {
            let (k, id, p) = record(i, i, 1);
            w1.push(k, id, p).unwrap();
        }
        for i in 0..100u64 {
            let (k, id, p) = record(i, i, 2);
            w2.push(k, id, p).unwrap();
        }
        w1.finish().unwrap();
        w2.finish().unwrap();
        assert!(sorter.chunk_count() >= 2);

        let stream = sorter.sort().unwrap();
        let records: Vec<SortRecord> = stream.map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 200);
        for pair in records.windows(2) {
            assert!(
                (pair[0].key, pair[0].feature_id) <= (pair[1].key, pair[1].feature_id),
                "order violated: {:?} then {:?}",
                pair[0].key,
                pair[1].key
            );
        }
    }

    #[test]
    fn test_ties_break_by_feature_id_then_insertion() {
        let dir = tempfile::tempdir().unwrap();
        let sorter = FeatureSorter::new(dir.path(), usize::MAX).unwrap();
        let mut writer = sorter.writer();
        // Same key, shuffled feature ids, payload marks insertion order.
        for (pos, id) in [5u64, 1, 3, 1, 2].iter().enumerate() {
            writer.push(SortKey(7), *id, vec![pos as u8]).unwrap();
        }
        writer.finish().unwrap();
        let records: Vec<SortRecord> = sorter.sort().unwrap().map(|r| r.unwrap()).collect();
        let ids: Vec<u64> = records.iter().map(|r| r.feature_id).collect();
        assert_eq!(ids, vec![1, 1, 2, 3, 5]);
        // The two id=1 records keep their insertion order (stable sort).
        assert_eq!(records[0].payload, vec![1]);
        assert_eq!(records[1].payload, vec![3]);
    }

    #[test]
    fn test_empty_sorter_yields_empty_stream() {
        let dir = tempfile::tempdir().unwrap();
        let sorter = FeatureSorter::new(dir.path(), 1024).unwrap();
        let writer = sorter.writer();
        writer.finish().unwrap();
        let mut stream = sorter.sort().unwrap();
        assert!(stream.next_record().unwrap().is_none());
    }

    #[test]
    fn test_scratch_removed_after_stream_drops() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("feature_sort");
        let sorter = FeatureSorter::new(dir.path(), 32).unwrap();
        let mut writer = sorter.writer();
        for i in 0..50u64 {
            writer.push(SortKey(i), i, vec![0; 16]).unwrap();
        }
        writer.finish().unwrap();
        assert!(scratch.exists());
        let stream = sorter.sort().unwrap();
        drop(stream);
        assert!(!scratch.exists());
    }

    #[test]
    fn test_many_small_chunks() {
        let dir = tempfile::tempdir().unwrap();
        // A 1-byte budget forces one chunk per record.
        let sorter = FeatureSorter::new(dir.path(), 1).unwrap();
        let mut writer = sorter.writer();
        for i in (0..64u64).rev() {
            writer.push(SortKey(i), i, vec![i as u8]).unwrap();
        }
        writer.finish().unwrap();
        assert_eq!(sorter.chunk_count(), 64);
        let keys: Vec<u64> = sorter
            .sort()
            .unwrap()
            .map(|r| r.unwrap().key.0)
            .collect();
        assert_eq!(keys, (0..64u64).collect::<Vec<_>>());
    }
}
