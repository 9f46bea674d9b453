use log::{debug, warn};
use ndarray as nd;

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

fn union(parent: &mut [usize], a: usize, b: usize) {
    let (ra, rb) = (find(parent, a), find(parent, b));
    if ra != rb {
        parent[ra.max(rb)] = ra.min(rb);
    }
}

/// Merges detections closer than `eps` into their mean.
///
/// Single linkage: two points end up in one cluster when a chain of points,
/// each less than `eps` from the next, connects them. Clusters are returned
/// in the order of their first point. A single point, or an `eps` that is
/// not positive and finite, leaves the points unchanged.
pub fn collapse_points(points: &nd::Array2<f64>, eps: f64) -> nd::Array2<f64> {
    let n = points.nrows();
    if n < 2 {
        warn!("nothing to collapse, {n} point(s) given");
        return points.clone();
    }
    if !(eps.is_finite() && eps > 0.0) {
        warn!("cannot collapse points with eps = {eps}");
        return points.clone();
    }

    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            let d = (&points.row(i) - &points.row(j)).mapv(|v| v * v).sum().sqrt();
            if d < eps {
                union(&mut parent, i, j);
            }
        }
    }

    // roots in order of first appearance
    let mut roots: Vec<usize> = Vec::new();
    let mut members: Vec<Vec<usize>> = Vec::new();
    for i in 0..n {
        let root = find(&mut parent, i);
        match roots.iter().position(|&r| r == root) {
            Some(k) => members[k].push(i),
            None => {
                roots.push(root);
                members.push(vec![i]);
            }
        }
    }

    let mut collapsed = nd::Array2::zeros((members.len(), points.ncols()));
    for (mut row, cluster) in collapsed.rows_mut().into_iter().zip(&members) {
        let subset = points.select(nd::Axis(0), cluster);
        if let Some(mean) = subset.mean_axis(nd::Axis(0)) {
            row.assign(&mean);
        }
    }
    debug!("collapsed {n} points into {}", members.len());
    collapsed
}
