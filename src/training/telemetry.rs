/// Summary sink: scalar, histogram and image records keyed by global step
///
/// Records are JSON lines appended to `<run_dir>/events.jsonl`; image
/// records point at PNG channel mosaics under `<run_dir>/images/`. Every
/// failure surfaces as `PoseError::Telemetry` so callers can log and go on.
use candle_core::{DType, Tensor};
use image::{GrayImage, Luma, Rgb, RgbImage};
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::PoseError;

pub const EVENTS_FILE: &str = "events.jsonl";
pub const IMAGES_DIR: &str = "images";
const HISTOGRAM_BUCKETS: usize = 30;

/// Summary statistics of a tensor
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Histogram {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
    pub count: usize,
    /// (left edge, right edge, count)
    pub buckets: Vec<(f64, f64, usize)>,
}

impl Histogram {
    pub fn from_values(values: &[f32]) -> Self {
        if values.is_empty() {
            return Self {
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                std: 0.0,
                count: 0,
                buckets: Vec::new(),
            };
        }

        let count = values.len();
        let (mut min, mut max, mut sum) = (f64::INFINITY, f64::NEG_INFINITY, 0.0f64);
        for &v in values {
            let v = v as f64;
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        let mean = sum / count as f64;
        let var = values
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / count as f64;

        let buckets = if max > min {
            let width = (max - min) / HISTOGRAM_BUCKETS as f64;
            let mut counts = vec![0usize; HISTOGRAM_BUCKETS];
            for &v in values {
                let idx = (((v as f64 - min) / width) as usize).min(HISTOGRAM_BUCKETS - 1);
                counts[idx] += 1;
            }
            counts
                .into_iter()
                .enumerate()
                .map(|(i, c)| (min + i as f64 * width, min + (i + 1) as f64 * width, c))
                .collect()
        } else {
            vec![(min, max, count)]
        };

        Self {
            min,
            max,
            mean,
            std: var.sqrt(),
            count,
            buckets,
        }
    }
}

pub struct SummaryWriter {
    events: BufWriter<File>,
    images_dir: PathBuf,
}

impl SummaryWriter {
    /// Open (append) the event file of a run directory
    pub fn open<P: AsRef<Path>>(run_dir: P) -> crate::Result<Self> {
        let run_dir = run_dir.as_ref();
        let images_dir = run_dir.join(IMAGES_DIR);
        std::fs::create_dir_all(&images_dir).map_err(telemetry)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join(EVENTS_FILE))
            .map_err(telemetry)?;

        Ok(Self {
            events: BufWriter::new(file),
            images_dir,
        })
    }

    fn write_record(&mut self, record: serde_json::Value) -> crate::Result<()> {
        let line = serde_json::to_string(&record).map_err(telemetry)?;
        writeln!(self.events, "{}", line).map_err(telemetry)
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> crate::Result<()> {
        self.write_record(json!({
            "kind": "scalar",
            "tag": tag,
            "step": step,
            "wall_time": wall_time(),
            "value": value,
        }))
    }

    pub fn add_histogram(&mut self, tag: &str, values: &Tensor, step: usize) -> crate::Result<()> {
        let flat = values
            .flatten_all()
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(telemetry)?;
        let hist = Histogram::from_values(&flat);
        self.write_record(json!({
            "kind": "histogram",
            "tag": tag,
            "step": step,
            "wall_time": wall_time(),
            "min": hist.min,
            "max": hist.max,
            "mean": hist.mean,
            "std": hist.std,
            "count": hist.count,
            "buckets": hist.buckets,
        }))
    }

    /// Render up to `max_channels` channels of a [C, h, w] tensor as a
    /// grayscale mosaic; each tile is min/max scaled independently.
    pub fn add_channel_mosaic(
        &mut self,
        tag: &str,
        maps: &Tensor,
        max_channels: usize,
        step: usize,
    ) -> crate::Result<()> {
        let (channels, h, w) = maps.dims3().map_err(telemetry)?;
        let n = channels.min(max_channels);
        if n == 0 {
            return Err(PoseError::Telemetry(format!("{}: no channels to render", tag)));
        }
        let data = maps
            .narrow(0, 0, n)
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.to_vec3::<f32>())
            .map_err(telemetry)?;

        let cols = (n as f64).sqrt().ceil() as usize;
        let rows = n.div_ceil(cols);
        let mut img = GrayImage::new((cols * w) as u32, (rows * h) as u32);
        for (c, plane) in data.iter().enumerate() {
            let (lo, hi) = plane_range(plane);
            let (ox, oy) = ((c % cols) * w, (c / cols) * h);
            for (y, row) in plane.iter().enumerate() {
                for (x, &v) in row.iter().enumerate() {
                    img.put_pixel((ox + x) as u32, (oy + y) as u32, Luma([to_u8(v, lo, hi)]));
                }
            }
        }

        let path = self.image_path(tag, step);
        img.save(&path).map_err(telemetry)?;
        self.write_image_record(tag, step, &path, n, h, w)
    }

    /// Render a [3, H, W] image normalized to [-0.5, 0.5]
    pub fn add_rgb_image(&mut self, tag: &str, image: &Tensor, step: usize) -> crate::Result<()> {
        let (_, h, w) = image.dims3().map_err(telemetry)?;
        let data = image
            .to_dtype(DType::F32)
            .and_then(|t| t.to_vec3::<f32>())
            .map_err(telemetry)?;
        if data.len() != 3 {
            return Err(PoseError::Telemetry(format!(
                "{}: expected 3 colour channels, got {}",
                tag,
                data.len()
            )));
        }

        let img = RgbImage::from_fn(w as u32, h as u32, |x, y| {
            let (x, y) = (x as usize, y as usize);
            Rgb([
                to_u8(data[0][y][x], -0.5, 0.5),
                to_u8(data[1][y][x], -0.5, 0.5),
                to_u8(data[2][y][x], -0.5, 0.5),
            ])
        });

        let path = self.image_path(tag, step);
        img.save(&path).map_err(telemetry)?;
        self.write_image_record(tag, step, &path, 3, h, w)
    }

    pub fn flush(&mut self) -> crate::Result<()> {
        self.events.flush().map_err(telemetry)
    }

    fn image_path(&self, tag: &str, step: usize) -> PathBuf {
        let safe: String = tag
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        self.images_dir.join(format!("{}-{}.png", safe, step))
    }

    fn write_image_record(
        &mut self,
        tag: &str,
        step: usize,
        path: &Path,
        channels: usize,
        height: usize,
        width: usize,
    ) -> crate::Result<()> {
        let file = path
            .strip_prefix(self.images_dir.parent().unwrap_or(Path::new("")))
            .unwrap_or(path);
        self.write_record(json!({
            "kind": "image",
            "tag": tag,
            "step": step,
            "wall_time": wall_time(),
            "path": file.to_string_lossy(),
            "channels": channels,
            "height": height,
            "width": width,
        }))
    }
}

fn telemetry<E: std::fmt::Display>(e: E) -> PoseError {
    PoseError::Telemetry(e.to_string())
}

fn wall_time() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

fn plane_range(plane: &[Vec<f32>]) -> (f32, f32) {
    plane
        .iter()
        .flatten()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

fn to_u8(v: f32, lo: f32, hi: f32) -> u8 {
    if hi > lo {
        (((v - lo) / (hi - lo)).clamp(0.0, 1.0) * 255.0).round() as u8
    } else {
        0
    }
}
