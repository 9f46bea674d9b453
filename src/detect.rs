use log::debug;
use ndarray as nd;
use serde::{Deserialize, Serialize};

use crate::correlation::{peaks_above, remove_nan_inf, CorrelationMap};
use crate::nms::nms;

/// `y = a * x + b`.
pub fn linear_parameter_transform(parameter: f64, a: f64, b: f64) -> f64 {
    a * parameter + b
}

/// User facing detection knobs, both in `0..=100`.
///
/// More `points_num` lowers the correlation threshold and lets more peaks
/// through; more `points_density` lowers the IoU threshold of the
/// suppression.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionParams {
    pub points_num: f64,
    pub points_density: f64,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            points_num: 50.0,
            points_density: 50.0,
        }
    }
}

impl DetectionParams {
    pub fn new(points_num: f64, points_density: f64) -> Self {
        Self {
            points_num,
            points_density,
        }
    }

    /// `(correlation threshold, IoU threshold)`.
    pub fn thresholds(&self) -> (f64, f64) {
        (
            linear_parameter_transform(self.points_num, -0.01, 1.0),
            linear_parameter_transform(self.points_density, -0.01, 1.0),
        )
    }
}

/// Box `[x_min, y_min, x_max, y_max]` of `width × height` pixels anchored at
/// its top-left corner, inclusive on both ends.
pub fn bbox_from_point(point: (usize, usize), width: usize, height: usize) -> [i32; 4] {
    let (x, y) = (point.0 as i32, point.1 as i32);
    [x, y, x + width as i32 - 1, y + height as i32 - 1]
}

/// Boxes for each point and their scores, read from `map` at the anchor.
pub fn boxes_from_points(
    points: &[(usize, usize)],
    width: usize,
    height: usize,
    map: &CorrelationMap,
) -> (nd::Array2<i32>, nd::Array1<f64>) {
    let mut boxes = nd::Array2::zeros((points.len(), 4));
    let mut scores = nd::Array1::zeros(points.len());
    for (i, &(x, y)) in points.iter().enumerate() {
        boxes
            .row_mut(i)
            .assign(&nd::aview1(&bbox_from_point((x, y), width, height)));
        scores[i] = map[[y, x]] as f64;
    }
    (boxes, scores)
}

/// Geometric centers `(x, y)` of `[x_min, y_min, x_max, y_max]` boxes.
pub fn bbox_centers(boxes: &nd::Array2<i32>) -> nd::Array2<f64> {
    let mut centers = nd::Array2::zeros((boxes.nrows(), 2));
    for (mut center, b) in centers.rows_mut().into_iter().zip(boxes.rows()) {
        center[0] = b[0] as f64 + (b[2] - b[0]) as f64 / 2.0;
        center[1] = b[1] as f64 + (b[3] - b[1]) as f64 / 2.0;
    }
    centers
}

/// Extracts detections from a correlation map: peaks above the threshold
/// become template-sized boxes, which are non-max suppressed. Returns the
/// `N×2` centers `(x, y)` of the surviving boxes.
///
/// NaN and infinite cells score 0.
pub fn detect_points(
    map: &CorrelationMap,
    params: DetectionParams,
    template_dim: (usize, usize),
) -> nd::Array2<f64> {
    let (corr_threshold, iou_threshold) = params.thresholds();
    let map = remove_nan_inf(map);
    let peaks = peaks_above(&map, corr_threshold as f32);
    debug!(
        "{} peaks above {corr_threshold:.2}, iou threshold {iou_threshold:.2}",
        peaks.len()
    );

    let (height, width) = template_dim;
    let (boxes, scores) = boxes_from_points(&peaks, width, height, &map);
    let keep = nms(&boxes, &scores, iou_threshold);
    let kept = boxes.select(nd::Axis(0), &keep);
    bbox_centers(&kept)
}
