use anyhow::{Context, Result};
use plotscan::prelude::*;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Config {
    markers: Vec<BoundingBox>,
    #[serde(default)]
    roi: Vec<BoundingBox>,
    #[serde(default)]
    matching: MatchingParams,
    #[serde(default)]
    detection: DetectionParams,
    #[serde(default)]
    converter: Option<ConverterParameters>,
    /// Merge detections closer than this many pixels.
    #[serde(default)]
    collapse_eps: Option<f64>,
}

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let (Some(image_path), Some(config_path)) = (args.next(), args.next()) else {
        anyhow::bail!("usage: detect-markers <plot image> <config.json>");
    };

    let config: Config = serde_json::from_str(
        &std::fs::read_to_string(&config_path)
            .with_context(|| format!("reading {config_path}"))?,
    )?;
    let converter = config
        .converter
        .map(CoordinatesConverter::new)
        .transpose()?;

    let mut plot = Plot::new(load_image(&image_path, false)?);
    plot.extract_markers(&config.markers)?;
    if !config.roi.is_empty() {
        plot.apply_roi(&config.roi)?;
    }
    plot.run_matching(&config.matching)?;

    for (label, points) in plot.detect(config.detection)? {
        let points = match config.collapse_eps {
            Some(eps) => collapse_points(&points, eps),
            None => points,
        };
        println!("{label}: {} points", points.nrows());

        let values = match &converter {
            Some(converter) => Some(converter.from_pixels(&points)?),
            None => None,
        };
        for (i, point) in points.rows().into_iter().enumerate() {
            match &values {
                Some(values) => println!(
                    "  x:{:.1} y:{:.1} -> ({:.6e}, {:.6e})",
                    point[0],
                    point[1],
                    values[[i, 0]],
                    values[[i, 1]]
                ),
                None => println!("  x:{:.1} y:{:.1}", point[0], point[1]),
            }
        }
    }

    Ok(())
}
