//! Marker and ROI boxes as handed over by a selection front end, and the
//! image preprocessing applied before matching.

use std::collections::BTreeMap;

use log::{debug, warn};
use ndarray as nd;
use serde::{Deserialize, Serialize};

use crate::image::{Bbox, Image};

/// ROI bitmap with values {0, 1}; 1 marks the searched area.
pub type RoiBitmap = nd::Array2<u8>;

/// Rectangle `{x, y, width, height, label}` selected on the plot image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
    #[serde(default)]
    pub label: Option<String>,
}

impl BoundingBox {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Inclusive crop box of a marker selection: `x_max = x + width`, so the
    /// template carries one extra column and row.
    pub fn marker_bbox(&self) -> Bbox {
        Bbox::new(self.x, self.x + self.width, self.y, self.y + self.height)
    }
}

/// First `marker<digits>` substring of a label, e.g. `"ROI for marker1"`
/// gives `"marker1"`.
pub fn marker_label_of(label: &str) -> Option<&str> {
    const PREFIX: &str = "marker";
    label.match_indices(PREFIX).find_map(|(start, _)| {
        let from = start + PREFIX.len();
        let digits = label[from..]
            .bytes()
            .take_while(|b| b.is_ascii_digit())
            .count();
        (digits > 0).then(|| &label[start..from + digits])
    })
}

/// Groups boxes by label. Unlabelled boxes are dropped.
pub fn bboxes_by_label(bboxes: &[BoundingBox]) -> BTreeMap<String, Vec<BoundingBox>> {
    let mut grouped: BTreeMap<String, Vec<BoundingBox>> = BTreeMap::new();
    for bbox in bboxes {
        match &bbox.label {
            Some(label) => grouped.entry(label.clone()).or_default().push(bbox.clone()),
            None => debug!("ignoring unlabelled box {bbox:?}"),
        }
    }
    grouped
}

/// ROI bitmap of shape `dim` covering the union of `[x, x + width)` ×
/// `[y, y + height)` of all boxes, clipped at the border. Without boxes
/// the whole image is searched.
pub fn bboxes_to_roi(dim: (usize, usize), bboxes: &[BoundingBox]) -> RoiBitmap {
    if bboxes.is_empty() {
        return RoiBitmap::ones(dim);
    }
    let (h, w) = dim;
    let mut roi = RoiBitmap::zeros(dim);
    for bbox in bboxes {
        let rows = bbox.y.min(h)..(bbox.y + bbox.height).min(h);
        let cols = bbox.x.min(w)..(bbox.x + bbox.width).min(w);
        roi.slice_mut(nd::s![rows, cols]).fill(1);
    }
    roi
}

/// Whites out (255) every pixel outside the ROI.
pub fn apply_roi(image: &Image, roi: &RoiBitmap) -> Image {
    let mut applied = image.clone();
    applied.fill_where(roi.mapv(|v| v == 0).view(), 255);
    applied
}

/// Replaces pure black pixels (0 in every channel) with `value`.
pub fn replace_black_pixels(image: &Image, value: u8) -> Image {
    let mut replaced = 0usize;
    let image = image.map_pixels(|pixel| {
        if pixel.iter().all(|&v| v == 0) {
            pixel.fill(value);
            replaced += 1;
        }
    });
    debug!("number of black pixels on image: {replaced}");
    image
}

/// Bitwise inversion of every sample.
pub fn invert_image(image: &Image) -> Image {
    if image.mean() > 150.0 {
        warn!("image seems to have a white background");
    }
    image.map_pixels(|pixel| pixel.iter_mut().for_each(|v| *v = !*v))
}
