use std::path::Path;

use ndarray as nd;
use opencv as cv;
use serde::{Deserialize, Serialize};

use crate::convert::{array_to_mat, mat_to_array2, mat_to_grayscale};
use crate::error::{Error, Result};

/// An 8-bit plot or template image.
///
/// Color images are stored in RGB order, `H×W×3`.
#[derive(Debug, Clone, PartialEq)]
pub enum Image {
    Gray(nd::Array2<u8>),
    Color(nd::Array3<u8>),
}

impl Image {
    pub fn height(&self) -> usize {
        self.dim().0
    }

    pub fn width(&self) -> usize {
        self.dim().1
    }

    /// Spatial shape `(height, width)`.
    pub fn dim(&self) -> (usize, usize) {
        match self {
            Image::Gray(image) => image.dim(),
            Image::Color(image) => {
                let (h, w, _) = image.dim();
                (h, w)
            }
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            Image::Gray(_) => 1,
            Image::Color(image) => image.dim().2,
        }
    }

    pub fn is_empty(&self) -> bool {
        let (h, w) = self.dim();
        h == 0 || w == 0
    }

    /// Mean over every sample of the buffer, channels included.
    pub fn mean(&self) -> f64 {
        let (sum, count) = match self {
            Image::Gray(image) => (
                image.iter().map(|&v| v as f64).sum::<f64>(),
                image.len(),
            ),
            Image::Color(image) => (
                image.iter().map(|&v| v as f64).sum::<f64>(),
                image.len(),
            ),
        };
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    pub fn to_mat(&self) -> Result<cv::core::Mat> {
        match self {
            Image::Gray(image) => array_to_mat(image),
            Image::Color(image) => array_to_mat(image),
        }
    }

    /// Grayscale view of the image. Gray images are returned as is.
    pub fn to_gray(&self) -> Result<nd::Array2<u8>> {
        match self {
            Image::Gray(image) => Ok(image.clone()),
            Image::Color(_) => {
                let gray = mat_to_grayscale(&self.to_mat()?)?;
                mat_to_array2(&gray)
            }
        }
    }

    /// Inclusive crop, clipped at the image border.
    pub fn crop(&self, bbox: Bbox) -> Image {
        match self {
            Image::Gray(image) => Image::Gray(crop_array2(image, bbox)),
            Image::Color(image) => {
                let (h, w, _) = image.dim();
                let (rows, cols) = bbox.clipped_ranges(h, w);
                Image::Color(image.slice(nd::s![rows, cols, ..]).to_owned())
            }
        }
    }

    /// Pads the image with a solid border of `width` pixels.
    pub fn frame(&self, width: usize, fill: u8) -> Image {
        match self {
            Image::Gray(image) => Image::Gray(frame_array2(image, width, fill)),
            Image::Color(image) => {
                let (h, w, c) = image.dim();
                let mut framed = nd::Array3::from_elem((h + 2 * width, w + 2 * width, c), fill);
                framed
                    .slice_mut(nd::s![width..width + h, width..width + w, ..])
                    .assign(image);
                Image::Color(framed)
            }
        }
    }

    /// Applies `f` to every pixel. Color pixels are passed as `[r, g, b]`.
    pub fn map_pixels(&self, mut f: impl FnMut(&mut [u8])) -> Image {
        match self {
            Image::Gray(image) => {
                let mut out = image.clone();
                out.iter_mut()
                    .for_each(|v| f(std::slice::from_mut(v)));
                Image::Gray(out)
            }
            Image::Color(image) => {
                let mut out = image.as_standard_layout().into_owned();
                let channels = out.dim().2;
                if let Some(data) = out.as_slice_mut() {
                    data.chunks_exact_mut(channels).for_each(&mut f);
                }
                Image::Color(out)
            }
        }
    }

    /// Sets every pixel where `select` is true to `value` in all channels.
    pub fn fill_where(&mut self, select: nd::ArrayView2<bool>, value: u8) {
        match self {
            Image::Gray(image) => {
                nd::Zip::from(image).and(select).for_each(|v, &s| {
                    if s {
                        *v = value;
                    }
                });
            }
            Image::Color(image) => {
                for ((y, x), &s) in select.indexed_iter() {
                    if s {
                        image.slice_mut(nd::s![y, x, ..]).fill(value);
                    }
                }
            }
        }
    }
}

impl From<nd::Array2<u8>> for Image {
    fn from(image: nd::Array2<u8>) -> Self {
        Image::Gray(image)
    }
}

impl From<nd::Array3<u8>> for Image {
    fn from(image: nd::Array3<u8>) -> Self {
        Image::Color(image)
    }
}

impl From<&image::GrayImage> for Image {
    fn from(from: &image::GrayImage) -> Self {
        let (width, height) = from.dimensions();
        let array = nd::Array2::from_shape_vec((height as usize, width as usize), from.to_vec())
            .unwrap_or_else(|_| nd::Array2::zeros((0, 0)));
        Image::Gray(array)
    }
}

impl From<&image::RgbImage> for Image {
    fn from(from: &image::RgbImage) -> Self {
        let (width, height) = from.dimensions();
        let array =
            nd::Array3::from_shape_vec((height as usize, width as usize, 3), from.to_vec())
                .unwrap_or_else(|_| nd::Array3::zeros((0, 0, 3)));
        Image::Color(array)
    }
}

impl From<&image::DynamicImage> for Image {
    fn from(from: &image::DynamicImage) -> Self {
        if from.color().has_color() {
            Image::from(&from.to_rgb8())
        } else {
            Image::from(&from.to_luma8())
        }
    }
}

/// Loads an image from disk, optionally forcing grayscale.
pub fn load_image(path: impl AsRef<Path>, grayscale: bool) -> Result<Image> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::NotFound(path.to_path_buf()));
    }
    let image = image::open(path)?;
    if grayscale {
        Ok(Image::from(&image.to_luma8()))
    } else {
        Ok(Image::from(&image))
    }
}

/// Inclusive bounding rectangle `(x_min, x_max, y_min, y_max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bbox {
    pub x_min: usize,
    pub x_max: usize,
    pub y_min: usize,
    pub y_max: usize,
}

impl Bbox {
    pub fn new(x_min: usize, x_max: usize, y_min: usize, y_max: usize) -> Self {
        Self {
            x_min,
            x_max,
            y_min,
            y_max,
        }
    }

    pub fn width(&self) -> usize {
        self.x_max - self.x_min + 1
    }

    pub fn height(&self) -> usize {
        self.y_max - self.y_min + 1
    }

    /// Integer-truncated center `(x, y)`.
    pub fn center(&self) -> (usize, usize) {
        (
            (self.x_max - self.x_min) / 2 + self.x_min,
            (self.y_max - self.y_min) / 2 + self.y_min,
        )
    }

    fn clipped_ranges(
        &self,
        height: usize,
        width: usize,
    ) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
        let clip = |min: usize, max: usize, size: usize| {
            let end = (max + 1).min(size);
            min.min(end)..end
        };
        (
            clip(self.y_min, self.y_max, height),
            clip(self.x_min, self.x_max, width),
        )
    }
}

pub(crate) fn crop_array2<T: Clone>(array: &nd::Array2<T>, bbox: Bbox) -> nd::Array2<T> {
    let (h, w) = array.dim();
    let (rows, cols) = bbox.clipped_ranges(h, w);
    array.slice(nd::s![rows, cols]).to_owned()
}

pub(crate) fn frame_array2<T: Clone>(array: &nd::Array2<T>, width: usize, fill: T) -> nd::Array2<T> {
    let (h, w) = array.dim();
    let mut framed = nd::Array2::from_elem((h + 2 * width, w + 2 * width), fill);
    framed
        .slice_mut(nd::s![width..width + h, width..width + w])
        .assign(array);
    framed
}

/// Bitmap with values restricted to {0, 255}; 255 marks the object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMask(nd::Array2<u8>);

impl BinaryMask {
    pub const OBJECT: u8 = 255;
    pub const BACKGROUND: u8 = 0;

    pub fn new(array: nd::Array2<u8>) -> Result<Self> {
        if let Some(&value) = array
            .iter()
            .find(|&&v| v != Self::OBJECT && v != Self::BACKGROUND)
        {
            return Err(Error::NotBitmap { value });
        }
        Ok(Self(array))
    }

    pub fn view(&self) -> nd::ArrayView2<'_, u8> {
        self.0.view()
    }

    pub fn into_inner(self) -> nd::Array2<u8> {
        self.0
    }

    pub fn dim(&self) -> (usize, usize) {
        self.0.dim()
    }

    pub fn object_pixels(&self) -> usize {
        self.0.iter().filter(|&&v| v == Self::OBJECT).count()
    }

    /// The mask with values {0, 1}.
    pub fn to_unit(&self) -> nd::Array2<u8> {
        self.0.mapv(|v| v / Self::OBJECT)
    }

    pub fn crop(&self, bbox: Bbox) -> BinaryMask {
        BinaryMask(crop_array2(&self.0, bbox))
    }

    /// Pads the mask with background.
    pub fn frame(&self, width: usize) -> BinaryMask {
        BinaryMask(frame_array2(&self.0, width, Self::BACKGROUND))
    }

    pub fn to_mat(&self) -> Result<cv::core::Mat> {
        array_to_mat(&self.0)
    }
}

impl TryFrom<nd::Array2<u8>> for BinaryMask {
    type Error = Error;

    fn try_from(array: nd::Array2<u8>) -> Result<Self> {
        BinaryMask::new(array)
    }
}

/// Converts a {0, 255} or {0, 1} mask to {0, 1}.
pub fn binary_values(mask: &nd::Array2<u8>) -> Result<nd::Array2<u8>> {
    if mask.iter().all(|&v| v == 0 || v == 1) {
        return Ok(mask.clone());
    }
    Ok(BinaryMask::new(mask.clone())?.to_unit())
}
