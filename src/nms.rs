use std::collections::HashMap;

use ndarray as nd;

/// Intersection over union of two `[x_min, y_min, x_max, y_max]` boxes.
///
/// Areas are `(x_max - x_min) * (y_max - y_min)`; degenerate boxes have an
/// IoU of 0 with everything.
pub fn iou(box1: nd::ArrayView1<i32>, box2: nd::ArrayView1<i32>) -> f64 {
    let (b1x, b1y, b1xx, b1yy) = (box1[0], box1[1], box1[2], box1[3]);
    let (b2x, b2y, b2xx, b2yy) = (box2[0], box2[1], box2[2], box2[3]);

    let x = b1x.max(b2x);
    let y = b1y.max(b2y);
    let xx = b1xx.min(b2xx);
    let yy = b1yy.min(b2yy);
    if x > xx || y > yy {
        return 0.0;
    }

    let intersection = ((xx - x) * (yy - y)) as f64;
    let area1 = ((b1xx - b1x) * (b1yy - b1y)) as f64;
    let area2 = ((b2xx - b2x) * (b2yy - b2y)) as f64;
    let union = area1 + area2 - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

/// Greedy non-maximum suppression.
///
/// Boxes are visited by descending score, equal scores in input order. A box
/// is kept unless a previously kept box overlaps it with IoU above
/// `iou_threshold`. Returns the kept indices, best first.
///
/// Kept boxes are bucketed on a grid as large as the largest box, so a
/// candidate is only compared with kept boxes of the neighbouring cells.
pub fn nms(boxes: &nd::Array2<i32>, scores: &nd::Array1<f64>, iou_threshold: f64) -> Vec<usize> {
    assert_eq!(
        boxes.nrows(),
        scores.len(),
        "every box needs exactly one score"
    );

    let mut order: Vec<usize> = (0..scores.len()).collect();
    // stable: ties keep their input order
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    // disjoint boxes have an IoU of 0, which a negative threshold still exceeds
    if iou_threshold < 0.0 {
        order.truncate(1);
        return order;
    }

    let extent = |lo: usize, hi: usize| {
        boxes
            .rows()
            .into_iter()
            .map(|b| b[hi] - b[lo] + 1)
            .max()
            .unwrap_or(1)
            .max(1)
    };
    let (cell_w, cell_h) = (extent(0, 2), extent(1, 3));
    let cell_of = |idx: usize| {
        let b = boxes.row(idx);
        (b[0].div_euclid(cell_w), b[1].div_euclid(cell_h))
    };

    let mut grid: HashMap<(i32, i32), Vec<usize>> = HashMap::new();
    let mut keep: Vec<usize> = Vec::new();

    for idx in order {
        let (cx, cy) = cell_of(idx);
        let candidate = boxes.row(idx);
        let suppressed = (cy - 1..=cy + 1)
            .flat_map(|y| (cx - 1..=cx + 1).map(move |x| (x, y)))
            .filter_map(|cell| grid.get(&cell))
            .flatten()
            .any(|&kept| iou(boxes.row(kept), candidate) > iou_threshold);
        if !suppressed {
            grid.entry((cx, cy)).or_default().push(idx);
            keep.push(idx);
        }
    }

    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxes_from_anchors(anchors: &[(i32, i32)], w: i32, h: i32) -> nd::Array2<i32> {
        let mut boxes = nd::Array2::zeros((anchors.len(), 4));
        for (i, &(x, y)) in anchors.iter().enumerate() {
            boxes
                .row_mut(i)
                .assign(&nd::arr1(&[x, y, x + w - 1, y + h - 1]));
        }
        boxes
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let boxes = nd::arr2(&[[0, 0, 10, 10], [0, 0, 10, 10], [20, 20, 30, 30], [5, 0, 15, 10]]);
        assert_eq!(iou(boxes.row(0), boxes.row(1)), 1.0);
        assert_eq!(iou(boxes.row(0), boxes.row(2)), 0.0);
        assert!((iou(boxes.row(0), boxes.row(3)) - 50.0 / 150.0).abs() < 1e-12);
    }

    #[test]
    fn overlapping_boxes_collapse_to_the_best() {
        let boxes = boxes_from_anchors(&[(10, 10), (11, 10), (40, 40), (10, 11)], 8, 8);
        let scores = nd::arr1(&[0.8, 0.95, 0.7, 0.6]);
        assert_eq!(nms(&boxes, &scores, 0.3), vec![1, 2]);
    }

    #[test]
    fn ties_keep_input_order() {
        let boxes = boxes_from_anchors(&[(0, 0), (1, 0), (2, 0)], 8, 8);
        let scores = nd::arr1(&[0.5, 0.5, 0.5]);
        assert_eq!(nms(&boxes, &scores, 0.3), vec![0]);

        let scores = nd::arr1(&[0.4, 0.5, 0.5]);
        assert_eq!(nms(&boxes, &scores, 0.3), vec![1]);
    }

    #[test]
    fn negative_threshold_keeps_only_the_best() {
        let boxes = boxes_from_anchors(&[(0, 0), (50, 50), (90, 0)], 8, 8);
        let scores = nd::arr1(&[0.2, 0.9, 0.5]);
        assert_eq!(nms(&boxes, &scores, -0.1), vec![1]);
    }

    #[test]
    fn boxes_of_different_sizes_still_suppress() {
        let mut boxes = boxes_from_anchors(&[(0, 0), (20, 0), (3, 3)], 4, 4);
        // a large box covering both small ones at the top
        boxes.row_mut(0).assign(&nd::arr1(&[0, 0, 29, 29]));
        let scores = nd::arr1(&[0.9, 0.8, 0.7]);
        assert_eq!(nms(&boxes, &scores, 0.0), vec![0]);
        assert_eq!(nms(&boxes, &scores, 0.5), vec![0, 1, 2]);
    }

    /// Plain quadratic greedy suppression.
    fn nms_exhaustive(boxes: &nd::Array2<i32>, scores: &nd::Array1<f64>, iou_threshold: f64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| scores[b].partial_cmp(&scores[a]).unwrap());
        let mut keep: Vec<usize> = Vec::new();
        for idx in order {
            if keep
                .iter()
                .all(|&k| iou(boxes.row(k), boxes.row(idx)) <= iou_threshold)
            {
                keep.push(idx);
            }
        }
        keep
    }

    fn dense_anchors(h: i32, w: i32) -> Vec<(i32, i32)> {
        (0..h).flat_map(|y| (0..w).map(move |x| (x, y))).collect()
    }

    #[test]
    fn dense_flat_map_matches_exhaustive_suppression() {
        // every cell of a flat map, as a zero detection threshold yields
        let anchors = dense_anchors(60, 80);
        let boxes = boxes_from_anchors(&anchors, 13, 13);
        let scores = nd::Array1::zeros(anchors.len());
        for iou_threshold in [0.0, 0.3, 0.5] {
            assert_eq!(
                nms(&boxes, &scores, iou_threshold),
                nms_exhaustive(&boxes, &scores, iou_threshold)
            );
        }

        let scores = nd::Array1::from_iter((0..anchors.len()).map(|i| ((i * 7919) % 101) as f64));
        assert_eq!(nms(&boxes, &scores, 0.5), nms_exhaustive(&boxes, &scores, 0.5));
    }

    #[test]
    fn plot_sized_flat_map_is_thinned() {
        let anchors = dense_anchors(300, 400);
        let boxes = boxes_from_anchors(&anchors, 13, 13);
        let scores = nd::Array1::zeros(anchors.len());

        let keep = nms(&boxes, &scores, 0.5);
        assert_eq!(keep[0], 0);
        assert!(keep.len() < anchors.len() / 4);
        assert!(keep.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn kept_and_discarded_boxes_respect_the_threshold() {
        let anchors: Vec<(i32, i32)> = (0..60)
            .map(|i| ((i * 7) % 23, (i * 11) % 19))
            .collect();
        let boxes = boxes_from_anchors(&anchors, 6, 5);
        let scores = nd::Array1::from_iter((0..60).map(|i| ((i * 37) % 17) as f64 / 17.0));

        for iou_threshold in [0.0, 0.2, 0.5, 0.8] {
            let keep = nms(&boxes, &scores, iou_threshold);
            for (a, &i) in keep.iter().enumerate() {
                for &j in &keep[a + 1..] {
                    assert!(iou(boxes.row(i), boxes.row(j)) <= iou_threshold);
                }
            }
            for idx in (0..anchors.len()).filter(|idx| !keep.contains(idx)) {
                assert!(keep.iter().any(|&k| scores[k] >= scores[idx]
                    && iou(boxes.row(k), boxes.row(idx)) > iou_threshold));
            }
        }
    }
}
