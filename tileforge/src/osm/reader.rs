//! Two-pass streaming over an OSM PBF file.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_channel::{bounded, Sender};
use osmpbf::{BlobDecode, BlobReader, Element, PrimitiveBlock};
use parking_lot::Mutex;
use rayon::iter::{ParallelBridge, ParallelIterator};
use tracing::{info, warn};

use super::node_store::{NodeStoreReader, NodeStoreWriter};
use super::relations::{RelationAssembler, RelationIndex, RelationInfo};
use crate::config::Bounds;
use crate::error::{PipelineError, Result};
use crate::feature::{ElementKind, FieldValue, RawGeometry, SourceFeature};
use crate::pipeline::{CancelToken, ReorderBuffer};
use crate::stats::{count_and_warn, Stats};
use crate::wikidata::parse_qid;

/// Blocks in flight between the decode pool and an ordered consumer.
const BLOCK_CHANNEL_DEPTH: usize = 64;

pub struct OsmReader {
    path: PathBuf,
}

/// Pass-1 payload for one decoded block, replayed in file order.
struct Pass1Block {
    nodes: Vec<(u64, f64, f64)>,
    relations: Vec<RelationInfo>,
}

impl OsmReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Bounds from the PBF header, if it declares any.
    pub fn header_bounds(&self) -> Result<Option<Bounds>> {
        let reader = self.open()?;
        for blob in reader {
            let blob = blob.map_err(|e| self.parse_error(e))?;
            return match blob.decode() {
                Ok(BlobDecode::OsmHeader(header)) => Ok(header.bbox().map(|bbox| Bounds {
                    min_lon: bbox.left,
                    min_lat: bbox.bottom,
                    max_lon: bbox.right,
                    max_lat: bbox.top,
                })),
                Ok(_) => Ok(None),
                Err(e) => Err(self.parse_error(e)),
            };
        }
        Ok(None)
    }

    /// Pass-1: nodes into the store (in file order), relations the profile
    /// wants into the index. Ways are skipped entirely.
    pub fn pass1(
        &self,
        wants_relation: &(dyn Fn(&HashMap<String, FieldValue>) -> bool + Sync),
        mut node_writer: NodeStoreWriter,
        stats: &Arc<Stats>,
        cancel: &CancelToken,
    ) -> Result<(NodeStoreWriter, RelationIndex)> {
        let reader = self.open()?;
        let (tx, rx) = bounded::<(u64, Pass1Block)>(BLOCK_CHANNEL_DEPTH);

        let writer_stats = Arc::clone(stats);
        let writer_cancel = cancel.clone();
        let writer = std::thread::Builder::new()
            .name("pass1-writer".to_string())
            .spawn(move || -> Result<(NodeStoreWriter, RelationIndex)> {
                let mut index = RelationIndex::new();
                let mut reorder = ReorderBuffer::new();
                for (seq, block) in rx {
                    writer_cancel.check()?;
                    reorder.push(seq, block);
                    while let Some(block) = reorder.pop_ready() {
                        apply_pass1_block(block, &mut node_writer, &mut index, &writer_stats)?;
                    }
                }
                while let Some(block) = reorder.pop_ready() {
                    apply_pass1_block(block, &mut node_writer, &mut index, &writer_stats)?;
                }
                Ok((node_writer, index))
            })
            .map_err(|e| PipelineError::Internal(format!("spawn pass1 writer: {}", e)))?;

        let decode_result = reader.enumerate().par_bridge().try_for_each(
            |(seq, blob)| -> Result<()> {
                cancel.check()?;
                let seq = seq as u64;
                let block = match blob.map_err(osmpbf::Error::from) {
                    Ok(blob) => match blob.decode() {
                        Ok(BlobDecode::OsmData(block)) => {
                            decode_pass1_block(&block, wants_relation)
                        }
                        Ok(_) => Pass1Block {
                            nodes: Vec::new(),
                            relations: Vec::new(),
                        },
                        Err(e) => {
                            // A broken first block means the file itself is bad.
                            if seq == 0 {
                                return Err(self.parse_error(e));
                            }
                            warn!(block = seq, error = %e, "skipping undecodable block");
                            stats.blocks_skipped.fetch_add(1, Ordering::Relaxed);
                            Pass1Block {
                                nodes: Vec::new(),
                                relations: Vec::new(),
                            }
                        }
                    },
                    Err(e) => {
                        // A broken first block means the file itself is bad.
                        if seq == 0 {
                            return Err(self.parse_error(e));
                        }
                        warn!(block = seq, error = %e, "skipping undecodable block");
                        stats.blocks_skipped.fetch_add(1, Ordering::Relaxed);
                        Pass1Block {
                            nodes: Vec::new(),
                            relations: Vec::new(),
                        }
                    }
                };
                // Every sequence number must reach the reorderer.
                crate::pipeline::send_cancellable(&tx, (seq, block), cancel)
            },
        );
        drop(tx);

        let joined = writer
            .join()
            .map_err(|_| PipelineError::Internal("pass1 writer panicked".to_string()))?;
        // The writer error is the root cause when the channel collapsed.
        let (node_writer, index) = match joined {
            Ok(result) => {
                decode_result?;
                result
            }
            Err(writer_err) => return Err(writer_err),
        };
        info!(
            nodes = stats.nodes_indexed.load(Ordering::Relaxed),
            relations = index.len(),
            "pass1 complete"
        );
        Ok((node_writer, index))
    }

    /// Standalone scan collecting `wikidata=Q…` tags from every element,
    /// run between the passes when fetching is enabled.
    pub fn collect_qids(&self, cancel: &CancelToken) -> Result<HashSet<String>> {
        let reader = self.open()?;
        let qids = Mutex::new(HashSet::new());
        reader.par_bridge().try_for_each(|blob| -> Result<()> {
            cancel.check()?;
            let Ok(blob) = blob.map_err(osmpbf::Error::from) else {
                return Ok(());
            };
            let Ok(BlobDecode::OsmData(block)) = blob.decode() else {
                return Ok(());
            };
            let mut local = Vec::new();
            for element in block.elements() {
                let found = match &element {
                    Element::Node(n) => find_qid(n.tags()),
                    Element::DenseNode(n) => find_qid(n.tags()),
                    Element::Way(w) => find_qid(w.tags()),
                    Element::Relation(r) => find_qid(r.tags()),
                };
                if let Some(qid) = found {
                    local.push(qid);
                }
            }
            if !local.is_empty() {
                qids.lock().extend(local);
            }
            Ok(())
        })?;
        Ok(qids.into_inner())
    }

    /// Pass-2: streams every element as a [`SourceFeature`], rehydrating way
    /// geometry from the node store and assembling indexed relations after
    /// the scan (relations follow ways in file order, so by then every
    /// member way has been captured).
    pub fn pass2(
        &self,
        node_reader: &NodeStoreReader,
        relation_index: &RelationIndex,
        sink: &Sender<Vec<SourceFeature>>,
        stats: &Arc<Stats>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let reader = self.open()?;
        let assembler = RelationAssembler::new();
        let deferred: Mutex<Vec<(u64, u64)>> = Mutex::new(Vec::new());

        reader
            .enumerate()
            .par_bridge()
            .try_for_each(|(seq, blob)| -> Result<()> {
                cancel.check()?;
                let seq = seq as u64;
                let blob = match blob.map_err(osmpbf::Error::from) {
                    Ok(blob) => blob,
                    Err(e) => {
                        if seq == 0 {
                            return Err(self.parse_error(e));
                        }
                        warn!(block = seq, error = %e, "skipping undecodable block");
                        stats.blocks_skipped.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                };
                let block = match blob.decode() {
                    Ok(BlobDecode::OsmData(block)) => block,
                    Ok(_) => return Ok(()),
                    Err(e) => {
                        if seq == 0 {
                            return Err(self.parse_error(e));
                        }
                        warn!(block = seq, error = %e, "skipping undecodable block");
                        stats.blocks_skipped.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                };
                let batch = decode_pass2_block(
                    &block,
                    seq,
                    node_reader,
                    relation_index,
                    &assembler,
                    &deferred,
                    stats,
                )?;
                if !batch.is_empty() {
                    crate::pipeline::send_cancellable(sink, batch, cancel)?;
                }
                Ok(())
            })?;

        // Assemble relations in file order now that all ways are captured.
        let mut deferred = deferred.into_inner();
        deferred.sort_unstable();
        let mut batch = Vec::new();
        for (_, relation_id) in deferred {
            cancel.check()?;
            let Some(info) = relation_index.get(relation_id) else {
                continue;
            };
            let Some(assembled) = assembler.assemble(info) else {
                count_and_warn(&stats.geometry_invalid, || {
                    format!("relation {} has no usable members", relation_id)
                });
                continue;
            };
            if assembled.dangling_ways > 0 {
                count_and_warn(&stats.geometry_invalid, || {
                    format!(
                        "relation {} left {} ways unclosed",
                        relation_id, assembled.dangling_ways
                    )
                });
            }
            if assembled.rings.is_empty() {
                continue;
            }
            batch.push(SourceFeature::new(
                relation_id,
                ElementKind::Relation,
                info.tags.clone(),
                RawGeometry::MultiPolygon(assembled.rings),
            ));
            if batch.len() >= 64 {
                crate::pipeline::send_cancellable(sink, std::mem::take(&mut batch), cancel)?;
            }
        }
        if !batch.is_empty() {
            crate::pipeline::send_cancellable(sink, batch, cancel)?;
        }
        Ok(())
    }

    fn open(&self) -> Result<BlobReader<std::io::BufReader<std::fs::File>>> {
        BlobReader::from_path(&self.path).map_err(|e| PipelineError::SourceParse {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    fn parse_error(&self, e: osmpbf::Error) -> PipelineError {
        PipelineError::SourceParse {
            path: self.path.clone(),
            message: e.to_string(),
        }
    }
}

fn apply_pass1_block(
    block: Pass1Block,
    node_writer: &mut NodeStoreWriter,
    index: &mut RelationIndex,
    stats: &Stats,
) -> Result<()> {
    for (id, lon, lat) in block.nodes {
        node_writer.put(id, lon, lat)?;
    }
    let count = index.len();
    for info in block.relations {
        index.insert(info);
    }
    stats
        .relations_indexed
        .fetch_add((index.len() - count) as u64, Ordering::Relaxed);
    stats
        .nodes_indexed
        .store(node_writer.count(), Ordering::Relaxed);
    Ok(())
}

fn decode_pass1_block(
    block: &PrimitiveBlock,
    wants_relation: &dyn Fn(&HashMap<String, FieldValue>) -> bool,
) -> Pass1Block {
    let mut nodes = Vec::new();
    let mut relations = Vec::new();
    for element in block.elements() {
        match element {
            Element::Node(node) => {
                nodes.push((node.id() as u64, node.lon(), node.lat()));
            }
            Element::DenseNode(node) => {
                nodes.push((node.id() as u64, node.lon(), node.lat()));
            }
            Element::Way(_) => {}
            Element::Relation(relation) => {
                let tags = tag_map(relation.tags());
                if !wants_relation(&tags) {
                    continue;
                }
                let way_members = relation
                    .members()
                    .filter(|m| m.member_type == osmpbf::RelMemberType::Way)
                    .map(|m| {
                        let role = m.role().unwrap_or_default().to_string();
                        (m.member_id as u64, role)
                    })
                    .collect();
                relations.push(RelationInfo {
                    id: relation.id() as u64,
                    tags,
                    way_members,
                });
            }
        }
    }
    Pass1Block { nodes, relations }
}

#[allow(clippy::too_many_arguments)]
fn decode_pass2_block(
    block: &PrimitiveBlock,
    seq: u64,
    node_reader: &NodeStoreReader,
    relation_index: &RelationIndex,
    assembler: &RelationAssembler,
    deferred: &Mutex<Vec<(u64, u64)>>,
    stats: &Stats,
) -> Result<Vec<SourceFeature>> {
    let mut batch = Vec::new();
    for (offset, element) in block.elements().enumerate() {
        match element {
            Element::Node(node) => {
                let tags = tag_map(node.tags());
                if !tags.is_empty() {
                    batch.push(SourceFeature::new(
                        node.id() as u64,
                        ElementKind::Node,
                        tags,
                        RawGeometry::Point {
                            lon: node.lon(),
                            lat: node.lat(),
                        },
                    ));
                }
            }
            Element::DenseNode(node) => {
                let tags = tag_map(node.tags());
                if !tags.is_empty() {
                    batch.push(SourceFeature::new(
                        node.id() as u64,
                        ElementKind::Node,
                        tags,
                        RawGeometry::Point {
                            lon: node.lon(),
                            lat: node.lat(),
                        },
                    ));
                }
            }
            Element::Way(way) => {
                let way_id = way.id() as u64;
                let mut coords = Vec::new();
                let mut missing = None;
                for node_ref in way.refs() {
                    match node_reader.get(node_ref as u64)? {
                        Some(loc) => coords.push(loc),
                        None => {
                            missing = Some(node_ref as u64);
                            break;
                        }
                    }
                }
                if let Some(node) = missing {
                    count_and_warn(&stats.missing_node_refs, || {
                        format!("way {} references missing node {}", way_id, node)
                    });
                    continue;
                }
                if coords.len() < 2 {
                    continue;
                }
                let roles = relation_index.roles_for_way(way_id);
                for role in &roles {
                    assembler.capture(role.relation_id, way_id, coords.clone());
                }
                let tags = tag_map(way.tags());
                if tags.is_empty() {
                    continue;
                }
                let closed = coords.len() >= 4 && coords[0] == coords[coords.len() - 1];
                let raw = if closed {
                    RawGeometry::ClosedRing(coords)
                } else {
                    RawGeometry::Line(coords)
                };
                batch.push(
                    SourceFeature::new(way_id, ElementKind::Way, tags, raw)
                        .with_relations(roles),
                );
            }
            Element::Relation(relation) => {
                let relation_id = relation.id() as u64;
                if relation_index.get(relation_id).is_some() {
                    deferred
                        .lock()
                        .push((seq * 100_000 + offset as u64, relation_id));
                }
            }
        }
    }
    Ok(batch)
}

fn tag_map<'a>(tags: impl Iterator<Item = (&'a str, &'a str)>) -> HashMap<String, FieldValue> {
    tags.map(|(k, v)| (k.to_string(), FieldValue::from(v)))
        .collect()
}

fn find_qid<'a>(mut tags: impl Iterator<Item = (&'a str, &'a str)>) -> Option<String> {
    tags.find(|(k, _)| *k == "wikidata")
        .and_then(|(_, v)| parse_qid(v))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_qid_filters_non_qids() {
        let tags = vec![("name", "x"), ("wikidata", "Q42")];
        assert_eq!(find_qid(tags.into_iter()), Some("Q42".to_string()));
        let tags = vec![("wikidata", "broken")];
        assert_eq!(find_qid(tags.into_iter()), None);
    }

    #[test]
    fn test_missing_pbf_is_source_parse_error() {
        let reader = OsmReader::new("/nonexistent/file.osm.pbf");
        assert!(matches!(
            reader.header_bounds(),
            Err(PipelineError::SourceParse { .. })
        ));
    }
}
