//! The staged pipeline engine.
//!
//! # Architecture
//!
//! ```text
//! Pass1:   PBF blocks ─(decode pool)→ reorder → NodeStore + RelationIndex
//! Pass2:   Readers → [channel] → render workers → sort chunk writers
//! Emit:    SortedStream → grouper → [channel] → encode workers
//!                                      → reorder → MBTiles sink
//! ```
//!
//! Stages are OS-thread worker pools joined by bounded crossbeam channels;
//! a full channel blocks the producer, which is the only backpressure
//! mechanism. Every worker polls the shared [`CancelToken`] between
//! records. The first error wins: it is stored in the shared slot, the
//! token is tripped, and the other workers drain out with `Cancelled`,
//! which the collector ignores.
//!
//! State machine per run:
//! `Init → Pass1 → Wikidata? → AuxReaders → Pass2 → DropNodeDb → Sort →
//! Emit → Finalize → Done`, any failure → `Aborted` with partial outputs
//! deleted.

mod cancel;
mod reorder;

pub use cancel::CancelToken;
pub use reorder::ReorderBuffer;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{Bounds, PipelineConfig};
use crate::coord::TileCoord;
use crate::error::{FeatureError, PipelineError, Result};
use crate::feature::{FeatureCollector, LayerRegistry, SourceFeature};
use crate::group::{FeatureGrouper, GroupOptions, TileBatch};
use crate::mbtiles::{MbtilesMetadata, MbtilesOptions, MbtilesWriter};
use crate::mvt::TileEncoder;
use crate::osm::{NodeStoreWriter, OsmReader};
use crate::profile::{Profile, Translations};
use crate::render::FeatureRenderer;
use crate::sort::{FeatureSorter, FeatureWriter};
use crate::sources::{NaturalEarthReader, ShapefileReader, SourceReader};
use crate::stats::{count_and_warn, LayerStats, ProgressLogger, Stats, StatsSnapshot};
use crate::wikidata::{WikidataCache, WikidataFetcher};

/// Sends on a bounded channel while staying responsive to cancellation;
/// used instead of bare `send` wherever the consumer pool might have died
/// with the channel full.
pub(crate) fn send_cancellable<T>(tx: &Sender<T>, mut item: T, cancel: &CancelToken) -> Result<()> {
    loop {
        cancel.check()?;
        match tx.send_timeout(item, Duration::from_millis(100)) {
            Ok(()) => return Ok(()),
            Err(crossbeam_channel::SendTimeoutError::Timeout(back)) => item = back,
            Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => {
                return Err(PipelineError::Cancelled)
            }
        }
    }
}

/// Builds the profile once translations exist; construction is staged
/// because the wikidata cache only materializes between the passes.
/// Fallible so callers surface an unknown or misconfigured profile as a
/// regular pipeline error.
pub type ProfileFactory = Box<dyn FnOnce(Arc<Translations>) -> Result<Box<dyn Profile>>>;

/// What a finished run reports back.
#[derive(Debug)]
pub struct RunSummary {
    pub stats: StatsSnapshot,
    pub tiles_written: u64,
    pub output: std::path::PathBuf,
}

/// First-error slot shared by all workers of a run.
#[derive(Clone, Default)]
struct ErrorSlot {
    slot: Arc<Mutex<Option<PipelineError>>>,
}

impl ErrorSlot {
    /// Records the first non-cancellation error and trips the token.
    fn record(&self, error: PipelineError, cancel: &CancelToken) {
        if !error.is_cancelled() {
            let mut slot = self.slot.lock();
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        cancel.cancel();
    }

    fn take(&self) -> Option<PipelineError> {
        self.slot.lock().take()
    }
}

pub struct PipelineEngine {
    config: PipelineConfig,
    stats: Arc<Stats>,
    cancel: CancelToken,
}

impl PipelineEngine {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            stats: Stats::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Cancel handle for embedding (signal handlers, tests).
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs the full OSM pipeline. On failure the partial MBTiles file and
    /// scratch files are removed before the error surfaces.
    pub fn run(self, profile_factory: ProfileFactory) -> Result<RunSummary> {
        self.config.check_inputs()?;
        let output = self.config.output.clone();
        let node_db = self.config.tmpdir.join("node.db");
        let result = self.run_osm(profile_factory);
        if result.is_err() {
            // Aborted: no partial archive, no leftover node store. Sort
            // scratch cleans itself up when the sorter's last handle drops.
            let _ = crate::mbtiles::remove_partial(&output);
            let _ = std::fs::remove_file(&node_db);
        }
        result
    }

    /// Runs the render/sort/emit tail over caller-provided sources,
    /// skipping the OSM passes. The entry point for embedding and tests.
    pub fn run_with_sources(
        self,
        profile: Box<dyn Profile>,
        readers: Vec<Box<dyn SourceReader>>,
    ) -> Result<RunSummary> {
        let output = self.config.output.clone();
        let result = self.run_sources_inner(profile, readers);
        if result.is_err() {
            let _ = crate::mbtiles::remove_partial(&output);
        }
        result
    }

    fn run_osm(self, profile_factory: ProfileFactory) -> Result<RunSummary> {
        let config = &self.config;
        std::fs::create_dir_all(&config.tmpdir)
            .map_err(|e| PipelineError::from_io(&config.tmpdir, e))?;
        let progress = ProgressLogger::start(Arc::clone(&self.stats), config.log_interval)?;

        let translations = Arc::new(Translations::new(config.name_languages.clone(), None));
        let profile = profile_factory(Arc::clone(&translations))?;

        let osm = OsmReader::new(&config.input);
        let bounds = match config.bounds {
            Some(bounds) => bounds,
            None => osm.header_bounds()?.unwrap_or(Bounds::WORLD),
        };

        // Pass1.
        info!("pass1: indexing nodes and relations");
        let node_db_path = config.tmpdir.join("node.db");
        let (node_writer, relation_index) = {
            let _timer = self.stats.time("pass1");
            let writer = NodeStoreWriter::create(&node_db_path)?;
            let profile_ref = profile.as_ref();
            osm.pass1(
                &|tags| profile_ref.wants_relation(tags),
                writer,
                &self.stats,
                &self.cancel,
            )?
        };
        let node_reader = Arc::new(node_writer.finalize()?);

        // Wikidata (optional fetch scan, then cache load).
        if config.fetch_wikidata || config.use_wikidata {
            let _timer = self.stats.time("wikidata");
            let mut cache = WikidataCache::load(&config.wikidata_cache)?;
            if config.fetch_wikidata {
                info!("collecting wikidata qids");
                let qids = osm.collect_qids(&self.cancel)?;
                let fetcher = WikidataFetcher::new(&config.wikidata_cache)?;
                fetcher.fetch_missing(&mut cache, qids, &config.name_languages)?;
            }
            if config.use_wikidata {
                translations.set_wikidata(Arc::new(cache));
            }
        }

        // AuxReaders + Pass2 share the render stage.
        let profile: Arc<dyn Profile> = Arc::from(profile);
        let sorter = FeatureSorter::new(&config.tmpdir, config.chunk_bytes())?;
        let layer_stats = Arc::new(LayerStats::new());
        {
            let _timer = self.stats.time("pass2");
            info!("pass2: rendering features");
            let mut readers = aux_readers(&self.config);
            let pass2_node_reader = Arc::clone(&node_reader);
            let relation_index = &relation_index;
            let osm = &osm;
            self.render_stage(&sorter, &layer_stats, Arc::clone(&profile), move |tx, cancel, stats| {
                for reader in readers.iter_mut() {
                    info!(source = reader.name(), "reading auxiliary source");
                    reader.read(tx, cancel)?;
                }
                osm.pass2(&pass2_node_reader, relation_index, tx, stats, cancel)
            })?;
        }
        profile.release();

        // DropNodeDb: reclaim scratch before the write-heavy stages.
        info!("dropping node store");
        match Arc::try_unwrap(node_reader) {
            Ok(reader) => reader.delete()?,
            Err(_) => {
                return Err(PipelineError::Internal(
                    "node store still referenced after pass2".to_string(),
                ))
            }
        }

        let summary = self.finish_run(sorter, profile.merge_layers(), &layer_stats, bounds)?;
        progress.stop();
        Ok(summary)
    }

    fn run_sources_inner(
        self,
        profile: Box<dyn Profile>,
        mut readers: Vec<Box<dyn SourceReader>>,
    ) -> Result<RunSummary> {
        std::fs::create_dir_all(&self.config.tmpdir)
            .map_err(|e| PipelineError::from_io(&self.config.tmpdir, e))?;
        let progress = ProgressLogger::start(Arc::clone(&self.stats), self.config.log_interval)?;
        let bounds = self.config.bounds.unwrap_or(Bounds::WORLD);

        let profile: Arc<dyn Profile> = Arc::from(profile);
        let sorter = FeatureSorter::new(&self.config.tmpdir, self.config.chunk_bytes())?;
        let layer_stats = Arc::new(LayerStats::new());
        {
            let _timer = self.stats.time("pass2");
            self.render_stage(&sorter, &layer_stats, Arc::clone(&profile), move |tx, cancel, _| {
                for reader in readers.iter_mut() {
                    reader.read(tx, cancel)?;
                }
                Ok(())
            })?;
        }
        profile.release();

        let summary = self.finish_run(sorter, profile.merge_layers(), &layer_stats, bounds)?;
        progress.stop();
        Ok(summary)
    }

    /// Sort → group → encode → sink → metadata, shared by both entries.
    fn finish_run(
        &self,
        sorter: FeatureSorter,
        merge_layers: std::collections::HashMap<String, crate::group::MergeMode>,
        layer_stats: &LayerStats,
        bounds: Bounds,
    ) -> Result<RunSummary> {
        let stream = {
            let _timer = self.stats.time("sort");
            info!(chunks = sorter.chunk_count(), "merging sorted chunks");
            sorter.sort()?
        };
        let grouper = FeatureGrouper::new(stream, GroupOptions { merge_layers });

        // Producers are done; freeze the layer schema for metadata.
        let layers = layer_stats.freeze();
        let (min_zoom, max_zoom) = if layers.is_empty() {
            (0, 0)
        } else {
            (self.config.min_zoom, self.config.max_zoom)
        };
        let metadata = MbtilesMetadata {
            name: self
                .config
                .output
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "tileforge".to_string()),
            description: "generated by tileforge".to_string(),
            bounds,
            min_zoom,
            max_zoom,
            layers_json: layer_stats.to_metadata_json(),
        };

        let tiles_written = {
            let _timer = self.stats.time("emit");
            info!("emitting tiles");
            self.emit_stage(grouper, &metadata)?
        };

        for (stage, elapsed) in self.stats.timings() {
            debug!(stage, ?elapsed, "stage timing");
        }
        let snapshot = self.stats.snapshot();
        info!(
            tiles = tiles_written,
            features = snapshot.features_rendered,
            missing_node_refs = snapshot.missing_node_refs,
            "done"
        );
        Ok(RunSummary {
            stats: snapshot,
            tiles_written,
            output: self.config.output.clone(),
        })
    }

    /// Render stage: a feed closure streams `SourceFeature` batches into a
    /// pool of workers that classify, render, and spool into the sorter.
    fn render_stage<F>(
        &self,
        sorter: &FeatureSorter,
        layer_stats: &Arc<LayerStats>,
        profile: Arc<dyn Profile>,
        feed: F,
    ) -> Result<()>
    where
        F: FnOnce(&Sender<Vec<SourceFeature>>, &CancelToken, &Arc<Stats>) -> Result<()>,
    {
        let renderer = FeatureRenderer::new(&self.config);
        let layer_registry = Arc::new(LayerRegistry::new());
        let (tx, rx) = bounded::<Vec<SourceFeature>>(self.config.threads * 4);
        let errors = ErrorSlot::default();

        std::thread::scope(|scope| {
            for _ in 0..self.config.threads {
                let rx = rx.clone();
                let writer = sorter.writer();
                let errors = errors.clone();
                let cancel = self.cancel.clone();
                let profile = Arc::clone(&profile);
                let renderer = renderer.clone();
                let layer_registry = Arc::clone(&layer_registry);
                let layer_stats = Arc::clone(layer_stats);
                let stats = Arc::clone(&self.stats);
                scope.spawn(move || {
                    let result = render_worker(
                        rx,
                        writer,
                        &cancel,
                        profile.as_ref(),
                        &renderer,
                        &layer_registry,
                        &layer_stats,
                        &stats,
                    );
                    if let Err(error) = result {
                        errors.record(error, &cancel);
                    }
                });
            }
            drop(rx);

            if let Err(error) = feed(&tx, &self.cancel, &self.stats) {
                errors.record(error, &self.cancel);
            }
            drop(tx);
        });

        match errors.take() {
            Some(error) => Err(error),
            None => self.cancel.check(),
        }
    }

    /// Emit stage: parallel MVT encoding, ordered single-writer sink.
    fn emit_stage(&self, mut grouper: FeatureGrouper, metadata: &MbtilesMetadata) -> Result<u64> {
        let writer = MbtilesWriter::create(
            &self.config.output,
            MbtilesOptions {
                txn_tiles: self.config.txn_tiles,
                defer_index_creation: self.config.defer_mbtiles_index_creation,
                optimize: self.config.optimize_db,
            },
        )?;
        let encoder = TileEncoder::default();
        let workers = self.config.threads.max(1);
        let (batch_tx, batch_rx) = bounded::<(u64, TileBatch)>(workers * 2);
        let (blob_tx, blob_rx) = bounded::<(u64, TileCoord, Option<Vec<u8>>)>(workers * 4);
        let errors = ErrorSlot::default();
        let mut sink_outcome: Result<(MbtilesWriter, u64)> =
            Err(PipelineError::Internal("sink never ran".to_string()));

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let batch_rx = batch_rx.clone();
                let blob_tx = blob_tx.clone();
                let errors = errors.clone();
                let cancel = self.cancel.clone();
                let encoder = encoder.clone();
                scope.spawn(move || {
                    for (seq, batch) in batch_rx {
                        if cancel.is_cancelled() {
                            return;
                        }
                        match encoder.encode(&batch) {
                            Ok(blob) => {
                                if send_cancellable(&blob_tx, (seq, batch.tile, blob), &cancel)
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            Err(error) => {
                                errors.record(error, &cancel);
                                return;
                            }
                        }
                    }
                });
            }
            drop(batch_rx);
            drop(blob_tx);

            let sink_cancel = self.cancel.clone();
            let sink_stats = Arc::clone(&self.stats);
            let sink = scope.spawn(move || -> Result<(MbtilesWriter, u64)> {
                let mut writer = writer;
                let mut reorder = ReorderBuffer::new();
                let mut written = 0u64;
                let mut drain =
                    |reorder: &mut ReorderBuffer<(TileCoord, Option<Vec<u8>>)>,
                     writer: &mut MbtilesWriter|
                     -> Result<()> {
                        while let Some((tile, blob)) = reorder.pop_ready() {
                            if let Some(blob) = blob {
                                writer.put_tile(tile, &blob)?;
                                written += 1;
                                sink_stats.tiles_written.fetch_add(1, Ordering::Relaxed);
                                sink_stats
                                    .tile_bytes_written
                                    .fetch_add(blob.len() as u64, Ordering::Relaxed);
                            }
                        }
                        Ok(())
                    };
                for (seq, tile, blob) in blob_rx {
                    sink_cancel.check()?;
                    reorder.push(seq, (tile, blob));
                    drain(&mut reorder, &mut writer)?;
                }
                drain(&mut reorder, &mut writer)?;
                Ok((writer, written))
            });

            // Feed batches; the grouper iterates tiles in ascending order,
            // so the sink's reorder buffer stays small.
            let mut seq = 0u64;
            loop {
                match grouper.next_batch() {
                    Ok(Some(batch)) => {
                        if send_cancellable(&batch_tx, (seq, batch), &self.cancel).is_err() {
                            break;
                        }
                        seq += 1;
                    }
                    Ok(None) => break,
                    Err(error) => {
                        errors.record(error, &self.cancel);
                        break;
                    }
                }
            }
            drop(batch_tx);

            sink_outcome = match sink.join() {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Internal("mbtiles sink panicked".to_string())),
            };
        });

        if let Some(error) = errors.take() {
            return Err(error);
        }
        let (writer, written) = sink_outcome?;
        self.cancel.check()?;
        writer.finish(metadata)?;
        Ok(written)
    }
}

fn aux_readers(config: &PipelineConfig) -> Vec<Box<dyn SourceReader>> {
    let mut readers: Vec<Box<dyn SourceReader>> = Vec::new();
    if let Some(path) = &config.water_polygons {
        readers.push(Box::new(ShapefileReader::new("water_polygons", path)));
    }
    if let Some(path) = &config.natural_earth {
        readers.push(Box::new(NaturalEarthReader::new(path)));
    }
    if let Some(path) = &config.centerline {
        readers.push(Box::new(ShapefileReader::new("centerline", path)));
    }
    readers
}

/// One render worker: profile classification, rendering, sort spill.
#[allow(clippy::too_many_arguments)]
fn render_worker(
    rx: Receiver<Vec<SourceFeature>>,
    mut writer: FeatureWriter,
    cancel: &CancelToken,
    profile: &dyn Profile,
    renderer: &FeatureRenderer,
    layer_registry: &LayerRegistry,
    layer_stats: &LayerStats,
    stats: &Stats,
) -> Result<()> {
    let mut collector = FeatureCollector::new();
    for batch in rx {
        cancel.check()?;
        stats
            .features_read
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        for source in batch {
            // A panic in profile or renderer code is a per-feature fault,
            // not a run-ender.
            let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<()> {
                profile.process_feature(&source, &mut collector);
                for spec in collector.drain() {
                    match renderer.render(&source, &spec) {
                        Ok(rendered) => {
                            for feature in rendered {
                                layer_stats.accept(
                                    &feature.layer,
                                    feature.tile.z,
                                    feature.attrs.iter().map(|(k, v)| (k.as_str(), v)),
                                );
                                stats.features_rendered.fetch_add(1, Ordering::Relaxed);
                                writer.push(
                                    feature.sort_key(layer_registry),
                                    feature.feature_id,
                                    feature.encode(),
                                )?;
                            }
                        }
                        Err(FeatureError::GeometryInvalid { kind, id, message }) => {
                            count_and_warn(&stats.geometry_invalid, || {
                                format!("invalid geometry for {} {}: {}", kind, id, message)
                            });
                        }
                        Err(FeatureError::ProfileRejected { kind, id }) => {
                            count_and_warn(&stats.profile_rejected, || {
                                format!("profile rejected {} {}", kind, id)
                            });
                        }
                        Err(FeatureError::MissingNodeReference { way, node }) => {
                            count_and_warn(&stats.missing_node_refs, || {
                                format!("way {} references missing node {}", way, node)
                            });
                        }
                    }
                }
                Ok(())
            }));
            match outcome {
                Ok(Ok(())) => {}
                // Sort-spill failures are disk faults; fatal.
                Ok(Err(error)) => return Err(error),
                Err(_) => {
                    count_and_warn(&stats.geometry_invalid, || {
                        "panic while processing feature (recovered)".to_string()
                    });
                    collector.drain();
                }
            }
        }
    }
    writer.finish()
}
