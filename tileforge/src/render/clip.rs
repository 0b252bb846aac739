//! Geometry clipping against a buffered tile square.
//!
//! Rings use Sutherland–Hodgman (intersection points are interpolated on
//! each crossed edge, so shared tile borders reconstruct seamlessly); open
//! lines use per-segment Liang–Barsky with contiguous clipped segments
//! stitched back into runs.

/// Clips a ring to the axis-aligned square `[min, max]²`.
///
/// Input and output rings are open (no closing duplicate). May return fewer
/// than three points when the ring misses the square entirely.
pub fn clip_ring(ring: &[(f64, f64)], min: f64, max: f64) -> Vec<(f64, f64)> {
    if ring.is_empty() {
        return Vec::new();
    }
    let mut out = ring.to_vec();
    // Left, right, top, bottom, in sequence.
    out = clip_edge(&out, |p| p.0 >= min, |a, b| {
        let t = (min - a.0) / (b.0 - a.0);
        (min, a.1 + t * (b.1 - a.1))
    });
    out = clip_edge(&out, |p| p.0 <= max, |a, b| {
        let t = (max - a.0) / (b.0 - a.0);
        (max, a.1 + t * (b.1 - a.1))
    });
    out = clip_edge(&out, |p| p.1 >= min, |a, b| {
        let t = (min - a.1) / (b.1 - a.1);
        (a.0 + t * (b.0 - a.0), min)
    });
    out = clip_edge(&out, |p| p.1 <= max, |a, b| {
        let t = (max - a.1) / (b.1 - a.1);
        (a.0 + t * (b.0 - a.0), max)
    });
    out
}

fn clip_edge<F, I>(ring: &[(f64, f64)], inside: F, intersect: I) -> Vec<(f64, f64)>
where
    F: Fn(&(f64, f64)) -> bool,
    I: Fn(&(f64, f64), &(f64, f64)) -> (f64, f64),
{
    if ring.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(ring.len() + 4);
    for i in 0..ring.len() {
        let current = &ring[i];
        let next = &ring[(i + 1) % ring.len()];
        match (inside(current), inside(next)) {
            (true, true) => out.push(*next),
            (true, false) => out.push(intersect(current, next)),
            (false, true) => {
                out.push(intersect(current, next));
                out.push(*next);
            }
            (false, false) => {}
        }
    }
    out
}

/// Clips an open polyline to `[min, max]²`, splitting it into the runs that
/// cross the square.
pub fn clip_line(line: &[(f64, f64)], min: f64, max: f64) -> Vec<Vec<(f64, f64)>> {
    let mut runs: Vec<Vec<(f64, f64)>> = Vec::new();
    let mut current: Vec<(f64, f64)> = Vec::new();
    for window in line.windows(2) {
        let (a, b) = (window[0], window[1]);
        match clip_segment(a, b, min, max) {
            None => {
                if current.len() >= 2 {
                    runs.push(std::mem::take(&mut current));
                } else {
                    current.clear();
                }
            }
            Some((ca, cb)) => {
                let continues = current
                    .last()
                    .is_some_and(|&last| close(last, ca));
                if !continues {
                    if current.len() >= 2 {
                        runs.push(std::mem::take(&mut current));
                    } else {
                        current.clear();
                    }
                    current.push(ca);
                }
                current.push(cb);
            }
        }
    }
    if current.len() >= 2 {
        runs.push(current);
    }
    runs
}

/// Liang–Barsky clip of one segment; `None` when fully outside.
fn clip_segment(
    a: (f64, f64),
    b: (f64, f64),
    min: f64,
    max: f64,
) -> Option<((f64, f64), (f64, f64))> {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let mut t0 = 0.0f64;
    let mut t1 = 1.0f64;
    for (p, q) in [
        (-dx, a.0 - min),
        (dx, max - a.0),
        (-dy, a.1 - min),
        (dy, max - a.1),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
            continue;
        }
        let r = q / p;
        if p < 0.0 {
            if r > t1 {
                return None;
            }
            t0 = t0.max(r);
        } else {
            if r < t0 {
                return None;
            }
            t1 = t1.min(r);
        }
    }
    if t0 > t1 {
        return None;
    }
    Some((
        (a.0 + t0 * dx, a.1 + t0 * dy),
        (a.0 + t1 * dx, a.1 + t1 * dy),
    ))
}

#[inline]
fn close(a: (f64, f64), b: (f64, f64)) -> bool {
    (a.0 - b.0).abs() < 1e-9 && (a.1 - b.1).abs() < 1e-9
}
