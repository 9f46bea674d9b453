//! Marker detection over a whole plot image.
//!
//! Every selected marker owns a [`MarkerRecord`] that moves through
//! [`MarkerStage`]s: the template is cut out of the plot, a ROI is attached,
//! template and plot are preprocessed, and finally a correlation map is
//! computed. Matching runs each marker on its own rayon worker.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use ndarray as nd;
use rayon::iter::{IntoParallelRefMutIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::correlation::{match_template, CorrelationMap, MatchMethod};
use crate::detect::{detect_points, DetectionParams};
use crate::error::{Error, Result};
use crate::fusion::{fuse, suppress_background};
use crate::hough::{generalized_hough_with, CANNY_HIGH, CANNY_LOW};
use crate::image::{BinaryMask, Image};
use crate::mask::{center_template, template_mask, threshold};
use crate::roi::{
    apply_roi, bboxes_by_label, bboxes_to_roi, marker_label_of, replace_black_pixels,
    BoundingBox, RoiBitmap,
};

/// Pure black pixels are lifted to this value before matching.
const BLACK_REPLACEMENT: u8 = 10;

/// Values of the binarized images in [`MatchingMode::Binary`].
const BINARY_BACKGROUND: u8 = 255;
const BINARY_OBJECT: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MarkerStage {
    Extracted,
    RoiApplied,
    Preprocessed,
    Matched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchingMode {
    /// Template matching and Hough transform on the preprocessed images.
    #[default]
    Basic,
    /// Both template and plot are binarized with the marker threshold first.
    /// Suits black and white plots with dense, overlapping markers.
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingParams {
    pub mode: MatchingMode,
    /// Weight of the shape score against the appearance score, `>= 0`.
    pub shape_factor: f32,
    pub method: MatchMethod,
    pub canny_low: f64,
    pub canny_high: f64,
    /// White border added around the centered template.
    pub frame_width: usize,
}

impl Default for MatchingParams {
    fn default() -> Self {
        Self {
            mode: MatchingMode::Basic,
            shape_factor: 0.6,
            method: MatchMethod::SqDiffNormed,
            canny_low: CANNY_LOW,
            canny_high: CANNY_HIGH,
            frame_width: 3,
        }
    }
}

impl MatchingParams {
    fn validate(&self) -> Result<()> {
        if !(self.shape_factor.is_finite() && self.shape_factor >= 0.0) {
            return Err(Error::InvalidParameter(
                "shape factor must be finite and non-negative",
            ));
        }
        if self.canny_low > self.canny_high {
            return Err(Error::InvalidParameter(
                "canny low threshold exceeds the high one",
            ));
        }
        Ok(())
    }
}

/// Everything known about one marker.
#[derive(Debug, Clone)]
pub struct MarkerRecord {
    label: String,
    marker: Image,
    roi: RoiBitmap,
    template: Option<Image>,
    mask: Option<BinaryMask>,
    threshold: Option<f64>,
    search_image: Option<Image>,
    correlation_map: Option<CorrelationMap>,
    stage: MarkerStage,
}

impl MarkerRecord {
    fn new(label: String, marker: Image, plot_dim: (usize, usize)) -> Self {
        Self {
            label,
            marker,
            roi: RoiBitmap::ones(plot_dim),
            template: None,
            mask: None,
            threshold: None,
            search_image: None,
            correlation_map: None,
            stage: MarkerStage::Extracted,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The marker as cut out of the plot.
    pub fn marker(&self) -> &Image {
        &self.marker
    }

    pub fn roi(&self) -> &RoiBitmap {
        &self.roi
    }

    /// Centered and framed template, once preprocessed.
    pub fn template(&self) -> Option<&Image> {
        self.template.as_ref()
    }

    pub fn mask(&self) -> Option<&BinaryMask> {
        self.mask.as_ref()
    }

    pub fn threshold(&self) -> Option<f64> {
        self.threshold
    }

    /// Plot image the template is matched against, once preprocessed.
    pub fn search_image(&self) -> Option<&Image> {
        self.search_image.as_ref()
    }

    pub fn correlation_map(&self) -> Option<&CorrelationMap> {
        self.correlation_map.as_ref()
    }

    pub fn stage(&self) -> MarkerStage {
        self.stage
    }

    fn require(&self, expected: MarkerStage) -> Result<()> {
        if self.stage < expected {
            return Err(Error::StageOrder {
                label: self.label.clone(),
                expected,
                actual: self.stage,
            });
        }
        Ok(())
    }

    fn advance(&mut self, stage: MarkerStage) {
        debug!("{}: {:?} -> {:?}", self.label, self.stage, stage);
        self.stage = stage;
    }

    fn set_roi(&mut self, roi: RoiBitmap) {
        self.roi = roi;
        self.template = None;
        self.mask = None;
        self.threshold = None;
        self.search_image = None;
        self.correlation_map = None;
        self.advance(MarkerStage::RoiApplied);
    }

    fn preprocess(&mut self, plot: &Image, params: &MatchingParams) -> Result<()> {
        self.require(MarkerStage::Extracted)?;
        if self.stage == MarkerStage::Extracted {
            debug!("{}: searching the whole plot", self.label);
            self.advance(MarkerStage::RoiApplied);
        }

        let (mask, threshold_value) = template_mask(&self.marker)?;
        let (template, mask) = center_template(&self.marker, &mask, params.frame_width)?;
        let mut template = replace_black_pixels(&template, BLACK_REPLACEMENT);
        let mut search = replace_black_pixels(&apply_roi(plot, &self.roi), BLACK_REPLACEMENT);

        if params.mode == MatchingMode::Binary {
            template = binarize(&template, threshold_value)?;
            search = binarize(&search, threshold_value)?;
        }

        self.template = Some(template);
        self.mask = Some(mask);
        self.threshold = Some(threshold_value);
        self.search_image = Some(search);
        self.correlation_map = None;
        self.advance(MarkerStage::Preprocessed);
        Ok(())
    }

    fn run_match(&mut self, params: &MatchingParams) -> Result<()> {
        self.require(MarkerStage::Preprocessed)?;
        let (Some(template), Some(mask), Some(threshold_value), Some(search)) = (
            &self.template,
            &self.mask,
            self.threshold,
            &self.search_image,
        ) else {
            return Err(Error::StageOrder {
                label: self.label.clone(),
                expected: MarkerStage::Preprocessed,
                actual: MarkerStage::RoiApplied,
            });
        };

        // degenerate cells stay NaN through fusion and are zeroed at detection
        let map = match_template(search, template, Some(mask), params.method, true)?;
        let accumulator = generalized_hough_with(
            search,
            template,
            params.canny_low,
            params.canny_high,
            true,
            true,
        )?;
        let fused = fuse(&map, &accumulator, params.shape_factor);
        let adjusted = suppress_background(&fused, search, mask, threshold_value)?;

        self.correlation_map = Some(adjusted);
        self.advance(MarkerStage::Matched);
        Ok(())
    }
}

fn binarize(image: &Image, threshold_value: f64) -> Result<Image> {
    let (binary, _) = threshold(image, Some(threshold_value), BINARY_BACKGROUND, BINARY_OBJECT)?;
    Ok(Image::Gray(binary))
}

/// A plot image and the markers selected on it.
#[derive(Debug, Clone)]
pub struct Plot {
    image: Image,
    markers: BTreeMap<String, MarkerRecord>,
}

impl Plot {
    pub fn new(image: impl Into<Image>) -> Self {
        Self {
            image: image.into(),
            markers: BTreeMap::new(),
        }
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn markers(&self) -> impl Iterator<Item = &MarkerRecord> {
        self.markers.values()
    }

    pub fn marker(&self, label: &str) -> Result<&MarkerRecord> {
        self.markers
            .get(label)
            .ok_or_else(|| Error::UnknownMarker(label.to_string()))
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.markers.keys().map(String::as_str)
    }

    /// Cuts the marker templates out of the plot, replacing any earlier
    /// selection. Unlabelled boxes are named `marker<n>` by position.
    pub fn extract_markers(&mut self, bboxes: &[BoundingBox]) -> Result<()> {
        if bboxes.is_empty() {
            return Err(Error::NoMarkers);
        }

        let mut markers = BTreeMap::new();
        for (i, bbox) in bboxes.iter().enumerate() {
            let label = bbox
                .label
                .clone()
                .unwrap_or_else(|| format!("marker{}", i + 1));
            let marker = self.image.crop(bbox.marker_bbox());
            if marker.is_empty() {
                return Err(Error::EmptyImage);
            }
            let record = MarkerRecord::new(label.clone(), marker, self.image.dim());
            if markers.insert(label.clone(), record).is_some() {
                warn!("marker `{label}` selected twice, keeping the last one");
            }
        }

        self.markers = markers;
        info!("{} marker templates extracted from plot image", self.markers.len());
        Ok(())
    }

    /// Restricts the search area of markers.
    ///
    /// Boxes are grouped by label and each group is attached to the marker
    /// named by the `marker<digits>` part of its label. Markers without ROI
    /// boxes keep their current ROI.
    pub fn apply_roi(&mut self, roi_bboxes: &[BoundingBox]) -> Result<()> {
        if self.markers.is_empty() {
            return Err(Error::NoMarkers);
        }

        let dim = self.image.dim();
        let mut rois = BTreeMap::new();
        for (roi_label, bboxes) in bboxes_by_label(roi_bboxes) {
            let marker_label = marker_label_of(&roi_label)
                .filter(|label| self.markers.contains_key(*label))
                .ok_or_else(|| Error::UnknownMarker(roi_label.clone()))?;
            rois.insert(marker_label.to_string(), bboxes_to_roi(dim, &bboxes));
        }

        for (label, roi) in rois {
            if let Some(record) = self.markers.get_mut(&label) {
                record.set_roi(roi);
            }
        }
        info!("ROI successfully applied");
        Ok(())
    }

    /// Computes the correlation map of every marker.
    pub fn run_matching(&mut self, params: &MatchingParams) -> Result<BTreeMap<String, CorrelationMap>> {
        if self.markers.is_empty() {
            return Err(Error::NoMarkers);
        }
        params.validate()?;

        let image = &self.image;
        self.markers.par_iter_mut().try_for_each(|(_, record)| {
            record.preprocess(image, params)?;
            record.run_match(params)
        })?;

        info!("correlation maps computed for {} markers", self.markers.len());
        Ok(self.correlation_maps())
    }

    /// Correlation maps of the markers matched so far.
    pub fn correlation_maps(&self) -> BTreeMap<String, CorrelationMap> {
        self.markers
            .iter()
            .filter_map(|(label, record)| {
                record
                    .correlation_map
                    .as_ref()
                    .map(|map| (label.clone(), map.clone()))
            })
            .collect()
    }

    /// Detected `N×2` pixel centers `(x, y)` of one marker.
    pub fn detect_marker(&self, label: &str, params: DetectionParams) -> Result<nd::Array2<f64>> {
        let record = self.marker(label)?;
        record.require(MarkerStage::Matched)?;
        match (&record.correlation_map, &record.template) {
            (Some(map), Some(template)) => Ok(detect_points(map, params, template.dim())),
            _ => Err(Error::StageOrder {
                label: label.to_string(),
                expected: MarkerStage::Matched,
                actual: record.stage,
            }),
        }
    }

    /// Detected pixel centers of every marker.
    pub fn detect(&self, params: DetectionParams) -> Result<BTreeMap<String, nd::Array2<f64>>> {
        if self.markers.is_empty() {
            return Err(Error::NoMarkers);
        }
        self.markers
            .keys()
            .map(|label| Ok((label.clone(), self.detect_marker(label, params)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plot() -> Plot {
        let mut image = nd::Array2::from_elem((40, 50), 255u8);
        image.slice_mut(nd::s![10..17, 12..15]).fill(0);
        image.slice_mut(nd::s![12..15, 10..17]).fill(0);
        Plot::new(image)
    }

    #[test]
    fn extraction_needs_boxes() {
        let mut plot = plot();
        assert!(matches!(plot.extract_markers(&[]), Err(Error::NoMarkers)));
        assert!(matches!(
            plot.run_matching(&MatchingParams::default()),
            Err(Error::NoMarkers)
        ));
        assert!(matches!(
            plot.detect(DetectionParams::default()),
            Err(Error::NoMarkers)
        ));
    }

    #[test]
    fn extracted_markers_are_one_pixel_larger() {
        let mut plot = plot();
        plot.extract_markers(&[
            BoundingBox::new(9, 9, 8, 8).with_label("marker1"),
            BoundingBox::new(0, 0, 4, 3),
        ])
        .unwrap();

        let labels: Vec<&str> = plot.labels().collect();
        assert_eq!(labels, vec!["marker1", "marker2"]);
        let record = plot.marker("marker1").unwrap();
        assert_eq!(record.marker().dim(), (9, 9));
        assert_eq!(record.stage(), MarkerStage::Extracted);
        assert_eq!(record.roi(), &RoiBitmap::ones((40, 50)));
        assert_eq!(plot.marker("marker2").unwrap().marker().dim(), (4, 5));
    }

    #[test]
    fn roi_goes_to_the_named_marker() {
        let mut plot = plot();
        plot.extract_markers(&[BoundingBox::new(9, 9, 8, 8).with_label("marker1")])
            .unwrap();
        plot.apply_roi(&[
            BoundingBox::new(0, 0, 25, 40).with_label("ROI for marker1"),
            BoundingBox::new(30, 0, 5, 5),
        ])
        .unwrap();

        let record = plot.marker("marker1").unwrap();
        assert_eq!(record.stage(), MarkerStage::RoiApplied);
        assert_eq!(record.roi().iter().filter(|&&v| v == 1).count(), 25 * 40);

        let err = plot.apply_roi(&[BoundingBox::new(0, 0, 5, 5).with_label("ROI for marker7")]);
        assert!(matches!(err, Err(Error::UnknownMarker(label)) if label == "ROI for marker7"));
    }

    #[test]
    fn detection_before_matching_is_a_stage_error() {
        let mut plot = plot();
        plot.extract_markers(&[BoundingBox::new(9, 9, 8, 8).with_label("marker1")])
            .unwrap();
        let err = plot.detect(DetectionParams::default());
        assert!(matches!(
            err,
            Err(Error::StageOrder {
                expected: MarkerStage::Matched,
                actual: MarkerStage::Extracted,
                ..
            })
        ));
        assert!(matches!(
            plot.detect_marker("marker9", DetectionParams::default()),
            Err(Error::UnknownMarker(_))
        ));
    }

    #[test]
    fn matching_prepares_every_record() {
        let mut plot = plot();
        plot.extract_markers(&[BoundingBox::new(9, 9, 8, 8).with_label("marker1")])
            .unwrap();
        let maps = plot.run_matching(&MatchingParams::default()).unwrap();

        let record = plot.marker("marker1").unwrap();
        assert_eq!(record.stage(), MarkerStage::Matched);
        // 7×7 cross framed by 3 pixels
        let template = record.template().unwrap();
        assert_eq!(template.dim(), (13, 13));
        assert_eq!(record.mask().unwrap().object_pixels(), 33);
        assert_eq!(maps["marker1"].dim(), (40 - 12, 50 - 12));
        // black pixels were lifted before matching
        let Some(Image::Gray(search)) = record.search_image() else {
            panic!("search image missing");
        };
        assert_eq!(search[[12, 12]], BLACK_REPLACEMENT);
    }

    #[test]
    fn invalid_params_are_rejected() {
        let mut plot = plot();
        plot.extract_markers(&[BoundingBox::new(9, 9, 8, 8).with_label("marker1")])
            .unwrap();
        let params = MatchingParams {
            shape_factor: -1.0,
            ..MatchingParams::default()
        };
        assert!(matches!(
            plot.run_matching(&params),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn params_deserialize_with_defaults() {
        let params: MatchingParams =
            serde_json::from_str(r#"{"mode": "binary", "method": "c_corr_normed"}"#).unwrap();
        assert_eq!(params.mode, MatchingMode::Binary);
        assert_eq!(params.method, MatchMethod::CCorrNormed);
        assert_eq!(params.shape_factor, 0.6);
        assert_eq!(params.frame_width, 3);
    }
}
