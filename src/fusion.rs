use log::debug;
use ndarray as nd;

use crate::correlation::{match_template, normalize_map, CorrelationMap, MatchMethod};
use crate::error::Result;
use crate::hough::Accumulator;
use crate::image::{BinaryMask, Image};
use crate::mask::threshold;

/// Minimum agreement between the plot mask and the marker mask for a cell to
/// stay a detection candidate.
pub const MASK_AGREEMENT_THRESHOLD: f32 = 0.1;

/// Combines appearance and shape scores: `normalize(map + k * accumulator)`.
///
/// # Panics
///
/// Panics if the two maps do not have the same shape.
pub fn fuse(map: &CorrelationMap, accumulator: &Accumulator, shape_factor: f32) -> CorrelationMap {
    assert_eq!(
        map.dim(),
        accumulator.dim(),
        "correlation map and accumulator must be congruent"
    );
    let fused = nd::Zip::from(map)
        .and(accumulator)
        .par_map_collect(|&corr, &votes| corr + shape_factor * votes);
    normalize_map(&fused)
}

/// Zeroes every cell of `map` where the binarized plot never resembles the
/// marker silhouette.
///
/// The plot is thresholded with the value that produced `marker_mask`; the
/// two {0, 1} masks are cross-correlated and cells scoring at most
/// [`MASK_AGREEMENT_THRESHOLD`] are cleared. NaN cells that pass stay NaN.
///
/// # Panics
///
/// Panics if `map` does not have the shape of a correlation map of
/// `marker_mask` over `search_image`.
pub fn suppress_background(
    map: &CorrelationMap,
    search_image: &Image,
    marker_mask: &BinaryMask,
    threshold_value: f64,
) -> Result<CorrelationMap> {
    let (plot_mask, _) = threshold(search_image, Some(threshold_value), 0, 255)?;
    let plot_mask = BinaryMask::new(plot_mask)?.to_unit();
    let marker_mask = marker_mask.to_unit();

    let agreement = match_template(
        &Image::Gray(plot_mask),
        &Image::Gray(marker_mask),
        None,
        MatchMethod::CCorr,
        false,
    )?;
    assert_eq!(
        map.dim(),
        agreement.dim(),
        "correlation map must match the search image and marker mask"
    );

    let mut adjusted = map.clone();
    nd::Zip::from(&mut adjusted)
        .and(&agreement)
        .for_each(|value, &score| {
            if score <= MASK_AGREEMENT_THRESHOLD {
                *value = 0.0;
            }
        });
    debug!(
        "background suppression kept {} of {} cells",
        agreement
            .iter()
            .filter(|&&score| score > MASK_AGREEMENT_THRESHOLD)
            .count(),
        agreement.len()
    );
    Ok(adjusted)
}
