use ndarray as nd;
use opencv::{self as cv, prelude::*};

use crate::error::{Error, Result};

/// Copies a 2D (single channel) or 3D (`H×W×C`) array into a new `Mat`.
///
/// The last axis of a 3D array becomes the channel axis of the `Mat`.
pub fn array_to_mat<T, S, D>(array: &nd::ArrayBase<S, D>) -> Result<cv::core::Mat>
where
    T: cv::core::DataType,
    S: nd::Data<Elem = T>,
    D: nd::Dimension,
{
    if array.is_empty() {
        return Err(Error::EmptyImage);
    }
    let dims: Vec<i32> = array.shape().iter().map(|&sz| sz as i32).collect();
    let (channels, shape) = match dims.len() {
        2 => (1, &dims[..]),
        3 => (dims[2], &dims[..2]),
        _ => return Err(Error::InvalidParameter("array must be 2D or 3D")),
    };

    let array = array.as_standard_layout();
    let slice = array
        .as_slice()
        .ok_or(Error::InvalidParameter("array is not contiguous"))?;
    let mat = cv::core::Mat::from_slice(slice)?
        .reshape_nd(channels, shape)?
        .clone_pointee();
    Ok(mat)
}

/// Copies a single channel `Mat` into an owned 2D array.
///
/// Fails if the `Mat` element type differs from `T`.
pub fn mat_to_array2<T>(mat: &cv::core::Mat) -> Result<nd::Array2<T>>
where
    T: cv::core::DataType + Clone,
{
    if mat.channels() != 1 {
        return Err(Error::InvalidParameter("expected a single channel Mat"));
    }

    let continuous;
    let mat = if mat.is_continuous() {
        mat
    } else {
        continuous = mat.try_clone()?;
        &continuous
    };

    let rows = mat.rows().max(0) as usize;
    let cols = mat.cols().max(0) as usize;
    let data = mat.data_typed::<T>()?;
    Ok(nd::Array2::from_shape_vec((rows, cols), data.to_vec())?)
}

pub fn mat_to_grayscale(mat: &cv::core::Mat) -> Result<cv::core::Mat> {
    let code = match mat.channels() {
        // Mat is already grayscale, no need to convert.
        1 => return Ok(mat.try_clone()?),
        3 => cv::imgproc::COLOR_RGB2GRAY,
        4 => cv::imgproc::COLOR_RGBA2GRAY,
        _ => return Err(Error::InvalidParameter("unsupported number of channels")),
    };

    let mut res = cv::core::Mat::default();
    cv::imgproc::cvt_color_def(mat, &mut res, code)?;
    Ok(res)
}
