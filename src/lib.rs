pub mod cluster;
pub mod convert;
pub mod coords;
pub mod correlation;
pub mod detect;
pub mod error;
pub mod fusion;
pub mod hough;
pub mod image;
pub mod mask;
pub mod nms;
pub mod plot;
pub mod prelude;
pub mod roi;

pub use error::{Error, Result};
