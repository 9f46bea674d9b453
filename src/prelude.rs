pub use crate::cluster::collapse_points;
pub use crate::coords::{AxisType, ConverterParameters, CoordinatesConverter};
pub use crate::correlation::{match_template, CorrelationMap, MatchMethod, ScoreMode};
pub use crate::detect::{detect_points, DetectionParams};
pub use crate::error::{Error, Result};
pub use crate::hough::{generalized_hough, Accumulator, HoughModel};
pub use crate::image::{load_image, Bbox, BinaryMask, Image};
pub use crate::plot::{MarkerRecord, MarkerStage, MatchingMode, MatchingParams, Plot};
pub use crate::roi::{BoundingBox, RoiBitmap};
