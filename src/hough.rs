//! Generalized Hough transform over Canny edges.
//!
//! The template's edge pixels are stored in an R-table keyed by their
//! gradient orientation. Every edge pixel of the target then votes for the
//! reference points its orientation allows.

use std::collections::HashMap;

use log::debug;
use ndarray as nd;
use opencv::{self as cv, imgproc};

use crate::convert::{array_to_mat, mat_to_array2};
use crate::correlation::normalize_map;
use crate::error::{Error, Result};
use crate::image::Image;

pub const CANNY_LOW: f64 = 10.0;
pub const CANNY_HIGH: f64 = 50.0;

/// R-table resolution: orientations are binned to 0.5 degree.
const BINS_PER_DEGREE: f64 = 2.0;

/// Vote array of the generalized Hough transform.
pub type Accumulator = nd::Array2<f32>;

/// Bins an orientation in degrees, folding -180 onto +180.
fn angle_key(angle: f64) -> i32 {
    let key = (angle * BINS_PER_DEGREE).round() as i32;
    let half_turn = (180.0 * BINS_PER_DEGREE) as i32;
    if key == -half_turn {
        half_turn
    } else {
        key
    }
}

fn canny(gray: &nd::Array2<u8>, low: f64, high: f64) -> Result<nd::Array2<u8>> {
    let mut edges = cv::core::Mat::default();
    imgproc::canny_def(&array_to_mat(gray)?, &mut edges, low, high)?;
    mat_to_array2(&edges)
}

/// Sobel orientation `atan2(dy, dx)` of every pixel, in degrees.
fn gradient_orientation(edges: &nd::Array2<u8>) -> Result<nd::Array2<f64>> {
    let src = array_to_mat(edges)?;
    let mut grad_x = cv::core::Mat::default();
    let mut grad_y = cv::core::Mat::default();
    imgproc::sobel_def(&src, &mut grad_x, cv::core::CV_64F, 1, 0)?;
    imgproc::sobel_def(&src, &mut grad_y, cv::core::CV_64F, 0, 1)?;
    let grad_x: nd::Array2<f64> = mat_to_array2(&grad_x)?;
    let grad_y: nd::Array2<f64> = mat_to_array2(&grad_y)?;
    Ok(nd::Zip::from(&grad_y)
        .and(&grad_x)
        .map_collect(|&dy, &dx| dy.atan2(dx).to_degrees()))
}

/// Edge map and orientation map of an image, converted to grayscale first.
fn edge_orientations(
    image: &Image,
    canny_low: f64,
    canny_high: f64,
) -> Result<(nd::Array2<u8>, nd::Array2<f64>)> {
    if image.is_empty() {
        return Err(Error::EmptyImage);
    }
    let edges = canny(&image.to_gray()?, canny_low, canny_high)?;
    let orientation = gradient_orientation(&edges)?;
    Ok((edges, orientation))
}

/// R-table of a template: displacements `(dy, dx)` from edge pixels to the
/// reference point, grouped by binned edge orientation.
#[derive(Debug, Clone, Default)]
pub struct HoughModel {
    r_table: HashMap<i32, Vec<(isize, isize)>>,
    reference: (usize, usize),
}

impl HoughModel {
    /// Builds the R-table of `template`.
    ///
    /// `reference` is `(row, col)` and defaults to the template center
    /// `(h / 2, w / 2)`.
    pub fn build(
        template: &Image,
        canny_low: f64,
        canny_high: f64,
        reference: Option<(usize, usize)>,
    ) -> Result<Self> {
        let (h, w) = template.dim();
        let reference = reference.unwrap_or((h / 2, w / 2));
        let (edges, orientation) = edge_orientations(template, canny_low, canny_high)?;

        let mut r_table: HashMap<i32, Vec<(isize, isize)>> = HashMap::new();
        for ((i, j), _) in edges.indexed_iter().filter(|(_, &v)| v != 0) {
            r_table
                .entry(angle_key(orientation[[i, j]]))
                .or_default()
                .push((
                    reference.0 as isize - i as isize,
                    reference.1 as isize - j as isize,
                ));
        }
        debug!(
            "hough model: {} edge pixels in {} orientation bins",
            r_table.values().map(Vec::len).sum::<usize>(),
            r_table.len()
        );

        Ok(Self { r_table, reference })
    }

    pub fn reference(&self) -> (usize, usize) {
        self.reference
    }

    /// Number of edge pixels stored in the table.
    pub fn len(&self) -> usize {
        self.r_table.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.r_table.is_empty()
    }

    /// Displacements stored for an orientation in degrees.
    pub fn displacements(&self, angle: f64) -> &[(isize, isize)] {
        self.r_table
            .get(&angle_key(angle))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Votes every edge pixel of `target` into an accumulator of the
    /// target's shape. Votes falling outside the accumulator are dropped.
    pub fn accumulate(&self, target: &Image, canny_low: f64, canny_high: f64) -> Result<Accumulator> {
        let (edges, orientation) = edge_orientations(target, canny_low, canny_high)?;
        let (h, w) = edges.dim();
        let mut accumulator = Accumulator::zeros((h, w));

        for ((i, j), _) in edges.indexed_iter().filter(|(_, &v)| v != 0) {
            for &(dy, dx) in self.displacements(orientation[[i, j]]) {
                let y = i as isize + dy;
                let x = j as isize + dx;
                if (0..h as isize).contains(&y) && (0..w as isize).contains(&x) {
                    accumulator[[y as usize, x as usize]] += 1.0;
                }
            }
        }
        Ok(accumulator)
    }
}

/// Crops an accumulator so that it lines up with a correlation map of the
/// same template: `floor(t / 2)` on the near side and one pixel less on the
/// far side for even template sizes, giving `image - template + 1` cells.
pub fn crop_accumulator(accumulator: &Accumulator, template_dim: (usize, usize)) -> Accumulator {
    let (h, w) = accumulator.dim();
    let (th, tw) = template_dim;
    let range = |size: usize, t: usize| {
        let near = t / 2;
        let far = near - usize::from(t % 2 == 0 && t > 0);
        let end = size.saturating_sub(far).max(near);
        near.min(end)..end
    };
    accumulator
        .slice(nd::s![range(h, th), range(w, tw)])
        .to_owned()
}

/// Runs the generalized Hough transform of `template` over `image` with the
/// default Canny thresholds.
pub fn generalized_hough(
    image: &Image,
    template: &Image,
    normalize: bool,
    crop: bool,
) -> Result<Accumulator> {
    generalized_hough_with(image, template, CANNY_LOW, CANNY_HIGH, normalize, crop)
}

pub fn generalized_hough_with(
    image: &Image,
    template: &Image,
    canny_low: f64,
    canny_high: f64,
    normalize: bool,
    crop: bool,
) -> Result<Accumulator> {
    let model = HoughModel::build(template, canny_low, canny_high, None)?;
    let mut accumulator = model.accumulate(image, canny_low, canny_high)?;

    if normalize {
        accumulator = normalize_map(&accumulator);
    }
    if crop {
        accumulator = crop_accumulator(&accumulator, template.dim());
    }
    Ok(accumulator)
}
