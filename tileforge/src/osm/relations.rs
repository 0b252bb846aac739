//! Relation index and multipolygon assembly.
//!
//! Pass-1 records which relations the profile wants and which ways belong
//! to them. Pass-2 captures member-way coordinates as ways stream by (the
//! member set is already known), then assembles rings once the whole file
//! has been scanned: member ways are stitched end-to-end into closed rings,
//! outers and inners classified by role.

use std::collections::HashMap;

use dashmap::DashMap;

use crate::feature::{FieldValue, RelationRole};

/// One relation as recorded in pass-1.
#[derive(Debug, Clone)]
pub struct RelationInfo {
    pub id: u64,
    pub tags: HashMap<String, FieldValue>,
    /// Way members only: `(way id, role)`.
    pub way_members: Vec<(u64, String)>,
}

/// Pass-1 product: relations of interest and the reverse member index.
#[derive(Debug, Default)]
pub struct RelationIndex {
    relations: HashMap<u64, RelationInfo>,
    way_to_relations: HashMap<u64, Vec<u64>>,
}

impl RelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: RelationInfo) {
        for (way_id, _) in &info.way_members {
            self.way_to_relations
                .entry(*way_id)
                .or_default()
                .push(info.id);
        }
        self.relations.insert(info.id, info);
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn get(&self, relation_id: u64) -> Option<&RelationInfo> {
        self.relations.get(&relation_id)
    }

    /// Roles a way plays in indexed relations; attached to the way's
    /// SourceFeature so profiles can see membership.
    pub fn roles_for_way(&self, way_id: u64) -> Vec<RelationRole> {
        let Some(relation_ids) = self.way_to_relations.get(&way_id) else {
            return Vec::new();
        };
        let mut roles = Vec::with_capacity(relation_ids.len());
        for &relation_id in relation_ids {
            if let Some(info) = self.relations.get(&relation_id) {
                for (member_id, role) in &info.way_members {
                    if *member_id == way_id {
                        roles.push(RelationRole {
                            relation_id,
                            role: role.clone(),
                        });
                    }
                }
            }
        }
        roles
    }

    pub fn is_member_way(&self, way_id: u64) -> bool {
        self.way_to_relations.contains_key(&way_id)
    }
}

/// Pass-2 coordinate capture, written concurrently by decode workers.
#[derive(Debug, Default)]
pub struct RelationAssembler {
    captured: DashMap<u64, Vec<(u64, Vec<(f64, f64)>)>>,
}

/// Outcome of assembling one relation.
#[derive(Debug)]
pub struct AssembledRelation {
    /// `(ring, is_inner)` pairs, rings open or closed as stitched.
    pub rings: Vec<(Vec<(f64, f64)>, bool)>,
    /// Member ways that could not be stitched into a closed ring.
    pub dangling_ways: usize,
}

impl RelationAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a member way's coordinates for later assembly.
    pub fn capture(&self, relation_id: u64, way_id: u64, coords: Vec<(f64, f64)>) {
        self.captured
            .entry(relation_id)
            .or_default()
            .push((way_id, coords));
    }

    /// Assembles a relation's rings from captured member ways. Returns
    /// `None` when nothing was captured (all members missing).
    pub fn assemble(&self, info: &RelationInfo) -> Option<AssembledRelation> {
        let (_, captured) = self.captured.remove(&info.id)?;
        let mut by_way: HashMap<u64, Vec<(f64, f64)>> = captured.into_iter().collect();

        let mut outers: Vec<Vec<(f64, f64)>> = Vec::new();
        let mut inners: Vec<Vec<(f64, f64)>> = Vec::new();
        for (way_id, role) in &info.way_members {
            if let Some(coords) = by_way.remove(way_id) {
                if coords.len() < 2 {
                    continue;
                }
                // Blank roles default to outer, the de-facto mapping norm.
                if role == "inner" {
                    inners.push(coords);
                } else {
                    outers.push(coords);
                }
            }
        }
        if outers.is_empty() && inners.is_empty() {
            return None;
        }
        let mut rings = Vec::new();
        let mut dangling = 0usize;
        for (segments, is_inner) in [(outers, false), (inners, true)] {
            let (closed, leftover) = stitch_rings(segments);
            dangling += leftover;
            rings.extend(closed.into_iter().map(|ring| (ring, is_inner)));
        }
        Some(AssembledRelation {
            rings,
            dangling_ways: dangling,
        })
    }
}

/// Stitches way segments into closed rings by endpoint matching. Returns
/// the closed rings and the count of segments left dangling.
fn stitch_rings(mut segments: Vec<Vec<(f64, f64)>>) -> (Vec<Vec<(f64, f64)>>, usize) {
    let mut rings = Vec::new();
    let mut dangling = 0usize;
    while let Some(mut ring) = segments.pop() {
        loop {
            if ring.len() >= 4 && points_eq(ring[0], ring[ring.len() - 1]) {
                rings.push(ring);
                break;
            }
            let tail = ring[ring.len() - 1];
            let next = segments.iter().position(|candidate| {
                points_eq(candidate[0], tail)
                    || points_eq(candidate[candidate.len() - 1], tail)
            });
            match next {
                Some(idx) => {
                    let mut segment = segments.swap_remove(idx);
                    if !points_eq(segment[0], tail) {
                        segment.reverse();
                    }
                    ring.extend(segment.into_iter().skip(1));
                }
                None => {
                    dangling += 1;
                    break;
                }
            }
        }
    }
    (rings, dangling)
}

#[inline]
fn points_eq(a: (f64, f64), b: (f64, f64)) -> bool {
    (a.0 - b.0).abs() < 1e-9 && (a.1 - b.1).abs() < 1e-9
}
