//! Conversion between pixel coordinates and the plot's factual coordinates.

use std::str::FromStr;

use ndarray as nd;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisType {
    #[default]
    Linear,
    Logscale,
}

impl FromStr for AxisType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(AxisType::Linear),
            "logscale" => Ok(AxisType::Logscale),
            other => Err(Error::UnknownAxisType(other.to_string())),
        }
    }
}

/// Two pixel and two factual reference values per axis.
///
/// Pixel `y` grows downwards while factual `y` grows upwards, so
/// `y_min_px > y_max_px` is required.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConverterParameters {
    pub x_min_px: f64,
    pub x_max_px: f64,
    pub y_min_px: f64,
    pub y_max_px: f64,
    pub x_min_factual: f64,
    pub x_max_factual: f64,
    pub y_min_factual: f64,
    pub y_max_factual: f64,
    #[serde(default)]
    pub x_axis_type: AxisType,
    #[serde(default)]
    pub y_axis_type: AxisType,
}

#[derive(Debug, Clone, Copy)]
struct Axis {
    name: char,
    min_px: f64,
    max_px: f64,
    min_factual: f64,
    max_factual: f64,
    kind: AxisType,
}

impl Axis {
    fn validate(&self) -> Result<()> {
        if !(self.min_px.is_finite() && self.max_px.is_finite()) {
            return Err(Error::InvalidAxis {
                axis: self.name,
                reason: "pixel references must be finite",
            });
        }
        if self.min_px == self.max_px {
            return Err(Error::InvalidAxis {
                axis: self.name,
                reason: "pixel references coincide",
            });
        }
        if self.kind == AxisType::Logscale && !(self.min_factual > 0.0 && self.max_factual > 0.0) {
            return Err(Error::NonPositiveLogBound {
                axis: self.name,
                min: self.min_factual,
                max: self.max_factual,
            });
        }
        Ok(())
    }

    /// Factual bounds in the space where the axis is linear.
    fn linear_bounds(&self) -> (f64, f64) {
        match self.kind {
            AxisType::Linear => (self.min_factual, self.max_factual),
            AxisType::Logscale => (self.min_factual.log10(), self.max_factual.log10()),
        }
    }

    fn to_factual(&self, px: f64) -> f64 {
        let (lo, hi) = self.linear_bounds();
        let alpha = (hi - lo) / (self.max_px - self.min_px);
        let value = if px >= self.min_px {
            lo + alpha * (px - self.min_px)
        } else {
            lo - alpha * (self.min_px - px)
        };
        match self.kind {
            AxisType::Linear => value,
            AxisType::Logscale => 10f64.powf(value),
        }
    }

    fn to_pixel(&self, factual: f64) -> Result<f64> {
        let value = match self.kind {
            AxisType::Linear => factual,
            AxisType::Logscale if factual > 0.0 => factual.log10(),
            AxisType::Logscale => {
                return Err(Error::InvalidParameter(
                    "log scale values must be positive",
                ))
            }
        };
        let (lo, hi) = self.linear_bounds();
        Ok(self.min_px + (value - lo) * (self.max_px - self.min_px) / (hi - lo))
    }
}

/// Maps pixel positions of detections to factual plot values.
///
/// A default converter is unconfigured and refuses to convert until
/// [`set_parameters`](Self::set_parameters) succeeds.
#[derive(Debug, Clone, Default)]
pub struct CoordinatesConverter {
    axes: Option<(Axis, Axis)>,
    parameters: Option<ConverterParameters>,
}

impl CoordinatesConverter {
    pub fn new(parameters: ConverterParameters) -> Result<Self> {
        let mut converter = Self::default();
        converter.set_parameters(parameters)?;
        Ok(converter)
    }

    pub fn set_parameters(&mut self, p: ConverterParameters) -> Result<()> {
        let x = Axis {
            name: 'x',
            min_px: p.x_min_px,
            max_px: p.x_max_px,
            min_factual: p.x_min_factual,
            max_factual: p.x_max_factual,
            kind: p.x_axis_type,
        };
        let y = Axis {
            name: 'y',
            min_px: p.y_min_px,
            max_px: p.y_max_px,
            min_factual: p.y_min_factual,
            max_factual: p.y_max_factual,
            kind: p.y_axis_type,
        };
        x.validate()?;
        y.validate()?;
        if p.y_min_px <= p.y_max_px {
            return Err(Error::InvalidAxis {
                axis: 'y',
                reason: "pixel y must grow from top to bottom (y_min_px > y_max_px)",
            });
        }

        self.axes = Some((x, y));
        self.parameters = Some(p);
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.axes.is_some()
    }

    pub fn parameters(&self) -> Option<&ConverterParameters> {
        self.parameters.as_ref()
    }

    fn axes(&self) -> Result<&(Axis, Axis)> {
        self.axes.as_ref().ok_or(Error::NotConfigured)
    }

    /// Factual `(x, y)` of a pixel position.
    pub fn from_pixel(&self, x_pixel: f64, y_pixel: f64) -> Result<(f64, f64)> {
        let (x, y) = self.axes()?;
        Ok((x.to_factual(x_pixel), y.to_factual(y_pixel)))
    }

    /// Converts an `N×2` array of pixel `(x, y)` rows, each row on its own.
    pub fn from_pixels(&self, points: &nd::Array2<f64>) -> Result<nd::Array2<f64>> {
        let (x, y) = self.axes()?;
        if points.ncols() != 2 {
            return Err(Error::InvalidParameter("points must be an N×2 array"));
        }
        let mut factual = points.clone();
        for mut row in factual.rows_mut() {
            row[0] = x.to_factual(row[0]);
            row[1] = y.to_factual(row[1]);
        }
        Ok(factual)
    }

    /// Pixel `(x, y)` of a factual position; inverse of [`from_pixel`](Self::from_pixel).
    pub fn to_pixel(&self, x_factual: f64, y_factual: f64) -> Result<(f64, f64)> {
        let (x, y) = self.axes()?;
        Ok((x.to_pixel(x_factual)?, y.to_pixel(y_factual)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn linear() -> ConverterParameters {
        ConverterParameters {
            x_min_px: 49.0,
            x_max_px: 294.0,
            y_min_px: 209.0,
            y_max_px: 29.0,
            x_min_factual: 0.0,
            x_max_factual: 0.6,
            y_min_factual: 0.0,
            y_max_factual: 0.8,
            x_axis_type: AxisType::Linear,
            y_axis_type: AxisType::Linear,
        }
    }

    fn logscale() -> ConverterParameters {
        ConverterParameters {
            x_min_px: 127.0,
            x_max_px: 433.0,
            y_min_px: 428.0,
            y_max_px: 146.0,
            x_min_factual: 1e5,
            x_max_factual: 1e9,
            y_min_factual: 1e4,
            y_max_factual: 1e8,
            x_axis_type: AxisType::Logscale,
            y_axis_type: AxisType::Logscale,
        }
    }

    #[test]
    fn linear_axes() {
        let converter = CoordinatesConverter::new(linear()).unwrap();
        for (px, py, fx, fy) in [(90.0, 164.0, 0.1, 0.2), (335.0, 74.0, 0.7, 0.6)] {
            let (x, y) = converter.from_pixel(px, py).unwrap();
            assert_abs_diff_eq!(x, fx, epsilon = 1e-3);
            assert_abs_diff_eq!(y, fy, epsilon = 1e-3);
        }
    }

    #[test]
    fn logscale_axes() {
        let converter = CoordinatesConverter::new(logscale()).unwrap();
        for (px, py, fx, fy) in [
            (80.5, 364.0, 24669.0, 80872.0),
            (280.5, 217.0, 10151633.0, 9838022.0),
        ] {
            let (x, y) = converter.from_pixel(px, py).unwrap();
            assert_abs_diff_eq!(x, fx, epsilon = 1.0);
            assert_abs_diff_eq!(y, fy, epsilon = 1.0);
        }
    }

    #[test]
    fn batch_conversion_branches_per_point() {
        let converter = CoordinatesConverter::new(linear()).unwrap();
        // one point left of the x origin, one right of it
        let points = nd::arr2(&[[8.0, 254.0], [90.0, 164.0]]);
        let factual = converter.from_pixels(&points).unwrap();
        for (row, point) in factual.rows().into_iter().zip(points.rows()) {
            let (x, y) = converter.from_pixel(point[0], point[1]).unwrap();
            assert_abs_diff_eq!(row[0], x, epsilon = 1e-12);
            assert_abs_diff_eq!(row[1], y, epsilon = 1e-12);
        }
        assert!(factual[[0, 0]] < 0.0);
        assert!(factual[[0, 1]] < 0.0);
    }

    #[test]
    fn to_pixel_inverts_from_pixel() {
        for params in [linear(), logscale()] {
            let converter = CoordinatesConverter::new(params).unwrap();
            for (px, py) in [(80.5, 364.0), (300.0, 30.0), (10.0, 500.0)] {
                let (fx, fy) = converter.from_pixel(px, py).unwrap();
                let (bx, by) = converter.to_pixel(fx, fy).unwrap();
                assert_abs_diff_eq!(bx, px, epsilon = 1e-6);
                assert_abs_diff_eq!(by, py, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn unconfigured_converter_refuses() {
        let converter = CoordinatesConverter::default();
        assert!(!converter.is_configured());
        assert!(matches!(
            converter.from_pixel(1.0, 1.0),
            Err(Error::NotConfigured)
        ));
    }

    #[test]
    fn inverted_y_convention_is_enforced() {
        let mut params = linear();
        params.y_min_px = 29.0;
        params.y_max_px = 209.0;
        assert!(matches!(
            CoordinatesConverter::new(params),
            Err(Error::InvalidAxis { axis: 'y', .. })
        ));
    }

    #[test]
    fn log_axis_needs_positive_bounds() {
        let mut params = logscale();
        params.x_min_factual = 0.0;
        assert!(matches!(
            CoordinatesConverter::new(params),
            Err(Error::NonPositiveLogBound { axis: 'x', .. })
        ));
    }

    #[test]
    fn axis_type_parses_and_deserializes() {
        assert_eq!("logscale".parse::<AxisType>().unwrap(), AxisType::Logscale);
        assert!("log".parse::<AxisType>().is_err());

        let params: ConverterParameters = serde_json::from_str(
            r#"{"x_min_px": 127, "x_max_px": 433, "y_min_px": 428, "y_max_px": 146,
                "x_min_factual": 1e5, "x_max_factual": 1e9,
                "y_min_factual": 1e4, "y_max_factual": 1e8,
                "x_axis_type": "logscale", "y_axis_type": "logscale"}"#,
        )
        .unwrap();
        assert_eq!(params, logscale());
    }
}
