use std::path::PathBuf;

/// Errors returned by the marker detection pipeline.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error("no such image: {0}")]
    NotFound(PathBuf),
    #[error("mask is not a bitmap (found value {value})")]
    NotBitmap { value: u8 },
    #[error("mask has no pixels with value {seg_value}")]
    EmptyMask { seg_value: u8 },
    #[error("image is empty")]
    EmptyImage,
    #[error("you have not selected any markers")]
    NoMarkers,
    #[error("unknown marker label `{0}`")]
    UnknownMarker(String),
    #[error("marker `{label}` is at stage {actual:?}, expected at least {expected:?}")]
    StageOrder {
        label: String,
        expected: crate::plot::MarkerStage,
        actual: crate::plot::MarkerStage,
    },
    #[error("coordinates converter is not configured")]
    NotConfigured,
    #[error("invalid {axis} axis: {reason}")]
    InvalidAxis { axis: char, reason: &'static str },
    #[error("log scale bounds of {axis} axis must be positive, got {min} and {max}")]
    NonPositiveLogBound { axis: char, min: f64, max: f64 },
    #[error("unknown axis type `{0}`, expected `linear` or `logscale`")]
    UnknownAxisType(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
