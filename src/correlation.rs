use log::debug;
use ndarray as nd;
use opencv::{self as cv, imgproc};
use serde::{Deserialize, Serialize};

use crate::convert::mat_to_array2;
use crate::error::{Error, Result};
use crate::image::{BinaryMask, Image};

/// Per-pixel match score of a template over an image; larger is better.
pub type CorrelationMap = nd::Array2<f32>;

/// Template matching methods usable with a template mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    SqDiff,
    #[default]
    SqDiffNormed,
    CCorr,
    CCorrNormed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreMode {
    HigherBetter,
    LowerBetter,
}

impl MatchMethod {
    pub fn opencv_code(self) -> i32 {
        match self {
            MatchMethod::SqDiff => imgproc::TM_SQDIFF,
            MatchMethod::SqDiffNormed => imgproc::TM_SQDIFF_NORMED,
            MatchMethod::CCorr => imgproc::TM_CCORR,
            MatchMethod::CCorrNormed => imgproc::TM_CCORR_NORMED,
        }
    }

    pub fn score_mode(self) -> ScoreMode {
        match self {
            MatchMethod::SqDiff | MatchMethod::SqDiffNormed => ScoreMode::LowerBetter,
            MatchMethod::CCorr | MatchMethod::CCorrNormed => ScoreMode::HigherBetter,
        }
    }
}

/// Matches `template` over `image`, summing only over the non-zero support
/// of `mask` when one is given.
///
/// Lower-better methods are inverted so that the best match is always the
/// maximum. Normalized methods yield NaN where the image region under the
/// mask has zero energy. With `normalize`, the map is rescaled so that its
/// maximum is 1.
///
/// The map has shape `(H - h + 1, W - w + 1)`; cell `(y, x)` scores the
/// template placed with its top-left corner at `(x, y)`.
pub fn match_template(
    image: &Image,
    template: &Image,
    mask: Option<&BinaryMask>,
    method: MatchMethod,
    normalize: bool,
) -> Result<CorrelationMap> {
    if image.is_empty() || template.is_empty() {
        return Err(Error::EmptyImage);
    }
    let (h, w) = image.dim();
    let (th, tw) = template.dim();
    if th > h || tw > w {
        return Err(Error::InvalidParameter("template is larger than the image"));
    }
    if let Some(mask) = mask {
        if mask.dim() != template.dim() {
            return Err(Error::InvalidParameter("mask size must match template size"));
        }
    }

    // color matching only when both sides carry color
    let (input, templ) = match (image, template) {
        (Image::Color(_), Image::Color(_)) => (image.to_mat()?, template.to_mat()?),
        _ => (
            Image::Gray(image.to_gray()?).to_mat()?,
            Image::Gray(template.to_gray()?).to_mat()?,
        ),
    };

    let mut res = cv::core::Mat::default();
    match mask {
        Some(mask) => {
            imgproc::match_template(&input, &templ, &mut res, method.opencv_code(), &mask.to_mat()?)?
        }
        None => imgproc::match_template(
            &input,
            &templ,
            &mut res,
            method.opencv_code(),
            &cv::core::no_array(),
        )?,
    }
    let mut map: CorrelationMap = mat_to_array2(&res)?;

    if method.score_mode() == ScoreMode::LowerBetter {
        if let Some((min, max)) = nan_min_max(&map) {
            debug!("correlation map bounds: ({min}, {max})");
        }
        map = invert_correlation_map(&map);
        debug!("correlation map was inverted");
    }

    if normalize {
        map = normalize_map(&map);
    }
    Ok(map)
}

/// Largest non-NaN value of the map.
pub fn nan_max(map: &CorrelationMap) -> Option<f32> {
    nan_min_max(map).map(|(_, max)| max)
}

fn nan_min_max(map: &CorrelationMap) -> Option<(f32, f32)> {
    map.iter()
        .filter(|v| !v.is_nan())
        .fold(None, |acc, &v| match acc {
            None => Some((v, v)),
            Some((min, max)) => Some((min.min(v), max.max(v))),
        })
}

/// `-map + nanmax(map)`: turns a smaller-is-better map into a
/// larger-is-better one. NaN cells stay NaN.
pub fn invert_correlation_map(map: &CorrelationMap) -> CorrelationMap {
    match nan_max(map) {
        Some(max) => map.mapv(|v| max - v),
        None => map.clone(),
    }
}

/// Divides the map by its largest non-NaN value.
///
/// Maps without a positive finite maximum are returned unchanged.
pub fn normalize_map(map: &CorrelationMap) -> CorrelationMap {
    match nan_max(map) {
        Some(max) if max > 0.0 && max.is_finite() => map.mapv(|v| v / max),
        max => {
            debug!("map is not normalized, maximum is {max:?}");
            map.clone()
        }
    }
}

/// Replaces NaN and infinite cells with zero.
pub fn remove_nan_inf(map: &CorrelationMap) -> CorrelationMap {
    let nan = map.iter().filter(|v| v.is_nan()).count();
    let inf = map.iter().filter(|v| v.is_infinite()).count();
    debug!("number of NaN values: {nan}");
    debug!("number of inf values: {inf}");
    map.mapv(|v| if v.is_finite() { v } else { 0.0 })
}

/// Every cell `(x, y)` with value `>= threshold`, in row-major order.
pub fn peaks_above(map: &CorrelationMap, threshold: f32) -> Vec<(usize, usize)> {
    map.indexed_iter()
        .filter(|(_, &v)| v >= threshold)
        .map(|((y, x), _)| (x, y))
        .collect()
}

/// The `n` largest non-NaN cells as `(value, (x, y))`, best first.
pub fn top_n_peaks(map: &CorrelationMap, n: usize) -> Vec<(f32, (usize, usize))> {
    let mut cells: Vec<(f32, (usize, usize))> = map
        .indexed_iter()
        .filter(|(_, v)| !v.is_nan())
        .map(|((y, x), &v)| (v, (x, y)))
        .collect();
    cells.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    cells.truncate(n);
    cells
}

/// Position `(x, y)` and value of the best non-NaN cell.
pub fn max_loc(map: &CorrelationMap) -> Option<(f32, (usize, usize))> {
    top_n_peaks(map, 1).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plot_with_cross() -> (nd::Array2<u8>, nd::Array2<u8>) {
        let mut image = nd::Array2::from_elem((20, 24), 200u8);
        // cross with its template top-left corner at (x=5, y=7)
        image.slice_mut(nd::s![9, 5..10]).fill(30);
        image.slice_mut(nd::s![7..12, 7]).fill(30);
        // a partial cross elsewhere
        image.slice_mut(nd::s![3, 14..19]).fill(30);
        let template = image.slice(nd::s![7..12, 5..10]).to_owned();
        (image, template)
    }

    #[test]
    fn best_match_is_the_template_origin() {
        let (image, template) = plot_with_cross();
        let mask = BinaryMask::new(nd::Array2::from_elem((5, 5), 255)).unwrap();
        let map = match_template(
            &Image::Gray(image),
            &Image::Gray(template),
            Some(&mask),
            MatchMethod::SqDiffNormed,
            true,
        )
        .unwrap();

        assert_eq!(map.dim(), (16, 20));
        let (value, position) = max_loc(&map).unwrap();
        assert_eq!(position, (5, 7));
        assert!((value - 1.0).abs() < 1e-6);
    }

    #[test]
    fn higher_better_methods_are_not_inverted() {
        let (image, template) = plot_with_cross();
        let map = match_template(
            &Image::Gray(image),
            &Image::Gray(template),
            None,
            MatchMethod::CCorrNormed,
            false,
        )
        .unwrap();
        let (value, position) = max_loc(&map).unwrap();
        assert_eq!(position, (5, 7));
        assert!((value - 1.0).abs() < 1e-4);
    }

    #[test]
    fn raw_cross_correlation_of_unit_masks_counts_overlap() {
        let mut plot = nd::Array2::<u8>::zeros((8, 8));
        plot.slice_mut(nd::s![2..5, 2..5]).fill(1);
        let marker = nd::Array2::<u8>::ones((3, 3));
        let map = match_template(
            &Image::Gray(plot),
            &Image::Gray(marker),
            None,
            MatchMethod::CCorr,
            false,
        )
        .unwrap();

        assert_eq!(map.dim(), (6, 6));
        assert!((map[[2, 2]] - 9.0).abs() < 1e-3);
        assert!((map[[0, 0]] - 1.0).abs() < 1e-3);
        assert!(map[[5, 5]].abs() < 1e-3);
    }

    #[test]
    fn zero_energy_region_gives_nan() {
        let mut image = nd::Array2::from_elem((10, 10), 100u8);
        image.slice_mut(nd::s![0..3, 0..3]).fill(0);
        let template = nd::Array2::from_elem((3, 3), 50u8);
        let mask = BinaryMask::new(nd::Array2::from_elem((3, 3), 255)).unwrap();

        let map = match_template(
            &Image::Gray(image),
            &Image::Gray(template),
            Some(&mask),
            MatchMethod::CCorrNormed,
            false,
        )
        .unwrap();
        assert!(map[[0, 0]].is_nan());
        assert!((map[[5, 5]] - 1.0).abs() < 1e-4);

        let cleaned = remove_nan_inf(&map);
        assert_eq!(cleaned[[0, 0]], 0.0);
        assert!(cleaned.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn oversized_template_is_rejected() {
        let image = Image::Gray(nd::Array2::zeros((4, 4)));
        let template = Image::Gray(nd::Array2::zeros((5, 2)));
        assert!(match_template(&image, &template, None, MatchMethod::CCorr, false).is_err());
    }

    #[test]
    fn inversion_uses_nan_max() {
        let map = nd::arr2(&[[1.0f32, f32::NAN], [3.0, 0.5]]);
        let inverted = invert_correlation_map(&map);
        assert_eq!(inverted[[0, 0]], 2.0);
        assert!(inverted[[0, 1]].is_nan());
        assert_eq!(inverted[[1, 0]], 0.0);
        assert_eq!(inverted[[1, 1]], 2.5);
    }

    #[test]
    fn normalization_peaks_at_one() {
        let map = nd::arr2(&[[1.0f32, 4.0], [f32::NAN, 2.0]]);
        let normalized = normalize_map(&map);
        assert_eq!(normalized[[0, 1]], 1.0);
        assert_eq!(normalized[[0, 0]], 0.25);

        let zeros = CorrelationMap::zeros((2, 2));
        assert_eq!(normalize_map(&zeros), zeros);
    }

    #[test]
    fn non_finite_values_are_zeroed() {
        let map = nd::arr2(&[[f32::NAN, f32::INFINITY], [f32::NEG_INFINITY, 0.7]]);
        assert_eq!(remove_nan_inf(&map), nd::arr2(&[[0.0, 0.0], [0.0, 0.7]]));
    }

    #[test]
    fn peaks_are_exactly_the_cells_above_threshold() {
        let map = nd::arr2(&[[0.1f32, 0.9, 0.5], [0.95, f32::NAN, 0.5]]);
        assert_eq!(peaks_above(&map, 0.5), vec![(1, 0), (2, 0), (0, 1), (2, 1)]);
        assert_eq!(peaks_above(&map, 0.9), vec![(1, 0), (0, 1)]);

        let mut previous = usize::MAX;
        for step in 0..=20 {
            let count = peaks_above(&map, step as f32 * 0.05).len();
            assert!(count <= previous);
            previous = count;
        }
    }

    #[test]
    fn top_peaks_are_sorted() {
        let map = nd::arr2(&[[0.1f32, 0.9], [0.95, f32::NAN]]);
        assert_eq!(top_n_peaks(&map, 2), vec![(0.95, (0, 1)), (0.9, (1, 0))]);
    }
}
