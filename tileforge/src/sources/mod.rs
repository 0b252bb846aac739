//! Auxiliary source readers and the reader interface.
//!
//! The engine only ever sees [`SourceReader`]: a finite stream of
//! [`SourceFeature`] batches pushed into a bounded channel. The OSM PBF
//! reader lives in [`crate::osm`] because of its two-pass protocol; the
//! single-pass readers here cover the sidecar datasets and tests.

mod natural_earth;
mod shapefile;

pub use natural_earth::NaturalEarthReader;
pub use shapefile::ShapefileReader;

use crossbeam_channel::Sender;

use crate::error::Result;
use crate::feature::SourceFeature;
use crate::pipeline::CancelToken;

/// Features are pushed downstream in batches to amortize channel traffic.
pub const READER_BATCH: usize = 128;

/// A finite stream of source features.
pub trait SourceReader: Send {
    fn name(&self) -> &'static str;

    /// Streams every feature into `sink`, checking `cancel` between
    /// batches. Returns when the source is exhausted.
    fn read(&mut self, sink: &Sender<Vec<SourceFeature>>, cancel: &CancelToken) -> Result<()>;
}

/// Batching helper shared by reader implementations.
pub(crate) struct BatchSender<'a> {
    sink: &'a Sender<Vec<SourceFeature>>,
    cancel: &'a CancelToken,
    batch: Vec<SourceFeature>,
}

impl<'a> BatchSender<'a> {
    pub fn new(sink: &'a Sender<Vec<SourceFeature>>, cancel: &'a CancelToken) -> Self {
        Self {
            sink,
            cancel,
            batch: Vec::with_capacity(READER_BATCH),
        }
    }

    pub fn push(&mut self, feature: SourceFeature) -> Result<()> {
        self.batch.push(feature);
        if self.batch.len() >= READER_BATCH {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.cancel.check()?;
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(READER_BATCH));
        crate::pipeline::send_cancellable(self.sink, batch, self.cancel)
    }
}

/// In-memory reader for tests and embedding.
pub struct VecReader {
    name: &'static str,
    features: Vec<SourceFeature>,
}

impl VecReader {
    pub fn new(name: &'static str, features: Vec<SourceFeature>) -> Self {
        Self { name, features }
    }
}

impl SourceReader for VecReader {
    fn name(&self) -> &'static str {
        self.name
    }

    fn read(&mut self, sink: &Sender<Vec<SourceFeature>>, cancel: &CancelToken) -> Result<()> {
        let mut batch = BatchSender::new(sink, cancel);
        for feature in self.features.drain(..) {
            batch.push(feature)?;
        }
        batch.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::feature::{ElementKind, RawGeometry};
    use std::collections::HashMap;

    fn feature(id: u64) -> SourceFeature {
        SourceFeature::new(
            id,
            ElementKind::Node,
            HashMap::new(),
            RawGeometry::Point { lon: 0.0, lat: 0.0 },
        )
    }

    #[test]
    fn test_vec_reader_streams_all_features() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut reader = VecReader::new("memory", (0..300).map(feature).collect());
        reader.read(&tx, &CancelToken::new()).unwrap();
        drop(tx);
        let total: usize = rx.iter().map(|batch| batch.len()).sum();
        assert_eq!(total, 300);
    }

    #[test]
    fn test_cancel_stops_reader() {
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut reader = VecReader::new("memory", (0..1000).map(feature).collect());
        assert!(matches!(
            reader.read(&tx, &cancel),
            Err(PipelineError::Cancelled)
        ));
    }
}
