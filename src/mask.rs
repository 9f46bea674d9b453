//! Thresholding and binary mask operations used to prepare marker templates.

use log::{debug, warn};
use ndarray as nd;
use opencv as cv;

use crate::convert::{array_to_mat, mat_to_array2};
use crate::error::{Error, Result};
use crate::image::{Bbox, BinaryMask, Image};

/// Pixels darker than this are counted as black by [`template_mask`].
pub const BLACK_PIXEL_THRESHOLD: u8 = 20;

/// Share of black foreground pixels above which a marker is treated as black.
pub const BLACK_OBJECT_PROPORTION: f64 = 0.4;

/// Binarizes `image`: pixels below the threshold become `object_value`,
/// the others `mask_value`.
///
/// Without an explicit threshold, the truncated mean over all samples of the
/// image is used. Returns the mask and the threshold that produced it.
pub fn threshold(
    image: &Image,
    threshold: Option<f64>,
    mask_value: u8,
    object_value: u8,
) -> Result<(nd::Array2<u8>, f64)> {
    let threshold = match threshold {
        Some(threshold) => threshold,
        None => {
            let mean = image.mean().trunc();
            debug!("use mean thresholding, threshold value = {mean}");
            mean
        }
    };

    let gray = image.to_gray()?;
    let mask = gray.mapv(|v| {
        if (v as f64) < threshold {
            object_value
        } else {
            mask_value
        }
    });
    Ok((mask, threshold))
}

/// Labels the 4-connected components of the non-zero pixels of `binary`.
fn label_components(binary: &nd::Array2<u8>) -> Result<(nd::Array2<i32>, usize)> {
    let mat = array_to_mat(binary)?;
    let mut labels = cv::core::Mat::default();
    let count = cv::imgproc::connected_components(&mat, &mut labels, 4, cv::core::CV_32S)?;
    Ok((mat_to_array2::<i32>(&labels)?, count.max(0) as usize))
}

/// Drops every foreground component except the largest one.
pub fn extract_largest_component(mask: &BinaryMask) -> Result<BinaryMask> {
    let (labels, count) = label_components(&mask.view().to_owned())?;

    let mut sizes = vec![0usize; count];
    labels
        .iter()
        .filter(|&&label| label > 0)
        .for_each(|&label| sizes[label as usize] += 1);

    // label 0 is the background
    let largest = match sizes
        .iter()
        .enumerate()
        .skip(1)
        .fold(None, |best: Option<(usize, usize)>, (label, &size)| match best {
            Some((_, best_size)) if best_size >= size => best,
            _ => Some((label, size)),
        }) {
        Some((label, _)) => label as i32,
        None => return Ok(mask.clone()),
    };

    BinaryMask::new(labels.mapv(|label| {
        if label == largest {
            BinaryMask::OBJECT
        } else {
            BinaryMask::BACKGROUND
        }
    }))
}

/// Inclusive bounding box of all pixels equal to `seg_value`, with its
/// truncated center `(x, y)`.
pub fn bbox_of(mask: &BinaryMask, seg_value: u8) -> Result<(Bbox, (usize, usize))> {
    let bbox = mask
        .view()
        .indexed_iter()
        .filter(|(_, &v)| v == seg_value)
        .fold(None, |bbox: Option<Bbox>, ((y, x), _)| {
            Some(match bbox {
                None => Bbox::new(x, x, y, y),
                Some(b) => Bbox::new(b.x_min.min(x), b.x_max.max(x), b.y_min.min(y), b.y_max.max(y)),
            })
        })
        .ok_or(Error::EmptyMask { seg_value })?;
    Ok((bbox, bbox.center()))
}

/// Rebuilds a template mask so that only the region connected to the
/// top-left corner counts as outside; enclosed holes become object pixels.
pub fn reconstruct_template_mask(mask: &BinaryMask) -> Result<BinaryMask> {
    let view = mask.view();
    let Some(&corner) = view.get((0, 0)) else {
        return Ok(mask.clone());
    };

    // every pixel of the corner's value is labelled, the others are background
    let same_as_corner = view.mapv(|v| if v == corner { 255u8 } else { 0 });
    let (labels, _) = label_components(&same_as_corner)?;
    let outside = labels[[0, 0]];

    if !labels.row(0).iter().all(|&label| label == outside) {
        warn!("upper horizontal line is not a connected component");
    }

    BinaryMask::new(labels.mapv(|label| {
        if label == outside {
            BinaryMask::BACKGROUND
        } else {
            BinaryMask::OBJECT
        }
    }))
}

/// Proportion of object pixels of `mask` darker than `black_threshold` on
/// the grayscale `template`.
pub fn black_pixel_proportion(
    template: &Image,
    mask: &BinaryMask,
    black_threshold: u8,
) -> Result<f64> {
    let gray = template.to_gray()?;
    let (object, black) = nd::Zip::from(&gray).and(mask.view()).fold(
        (0usize, 0usize),
        |(object, black), &pixel, &m| {
            if m == BinaryMask::OBJECT {
                (object + 1, black + usize::from(pixel < black_threshold))
            } else {
                (object, black)
            }
        },
    );

    let proportion = if object == 0 {
        0.0
    } else {
        black as f64 / object as f64
    };
    debug!("black pixels proportion on template image: {proportion:.3}");
    Ok(proportion)
}

/// Computes the mask of a marker template and the threshold behind it.
///
/// When more than [`BLACK_OBJECT_PROPORTION`] of the object is darker than
/// [`BLACK_PIXEL_THRESHOLD`], the marker counts as black and the template is
/// thresholded again at half the mean.
pub fn template_mask(template: &Image) -> Result<(BinaryMask, f64)> {
    let (mask, threshold_value) = threshold(template, None, 0, 255)?;
    let mask = BinaryMask::new(mask)?;

    let proportion = black_pixel_proportion(template, &mask, BLACK_PIXEL_THRESHOLD)?;
    if proportion > BLACK_OBJECT_PROPORTION {
        let reduced = threshold_value / 2.0;
        debug!("object is black, threshold value reduced from {threshold_value:.2} to {reduced:.2}");
        let (mask, _) = threshold(template, Some(reduced), 0, 255)?;
        return Ok((BinaryMask::new(mask)?, reduced));
    }

    Ok((mask, threshold_value))
}

/// Crops template and mask to the largest object component and frames both
/// with `frame_width` pixels (white for the template, background for the
/// mask).
pub fn center_template(
    template: &Image,
    mask: &BinaryMask,
    frame_width: usize,
) -> Result<(Image, BinaryMask)> {
    let largest = extract_largest_component(mask)?;
    let (bbox, _) = bbox_of(&largest, BinaryMask::OBJECT)?;

    let template = template.crop(bbox).frame(frame_width, 255);
    let mask = mask.crop(bbox).frame(frame_width);
    Ok((template, mask))
}
