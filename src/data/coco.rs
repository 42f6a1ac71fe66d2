/// COCO keypoint producer
///
/// Reads a COCO `person_keypoints_*.json` file, maps the 17 COCO keypoints
/// onto the 18-part layout (with a synthesized neck) and renders Gaussian
/// heatmaps and part-affinity fields at the supervision resolution. Images
/// are resized to the network input; no augmentation is applied.
use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use ndarray::Array3;
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Sample, SampleProducer};
use crate::config::SampleShape;
use crate::PoseError;

/// Body parts in the 18-part layout
pub const NUM_PARTS: usize = 18;

/// COCO keypoint index for each part; `None` is the neck
const COCO_TO_PART: [Option<usize>; NUM_PARTS] = [
    Some(0),  // nose
    None,     // neck
    Some(6),  // right shoulder
    Some(8),  // right elbow
    Some(10), // right wrist
    Some(5),  // left shoulder
    Some(7),  // left elbow
    Some(9),  // left wrist
    Some(12), // right hip
    Some(14), // right knee
    Some(16), // right ankle
    Some(11), // left hip
    Some(13), // left knee
    Some(15), // left ankle
    Some(2),  // right eye
    Some(1),  // left eye
    Some(4),  // right ear
    Some(3),  // left ear
];

/// Limb (part pair) for each PAF channel pair
pub const LIMBS: [(usize, usize); 19] = [
    (1, 2),
    (1, 5),
    (2, 3),
    (3, 4),
    (5, 6),
    (6, 7),
    (1, 8),
    (8, 9),
    (9, 10),
    (1, 11),
    (11, 12),
    (12, 13),
    (1, 0),
    (0, 14),
    (14, 16),
    (0, 15),
    (15, 17),
    (2, 16),
    (5, 17),
];

/// Gaussian spread of a keypoint, in input pixels
const HEATMAP_SIGMA: f32 = 7.0;
/// Half-width of a limb in the PAF, in output cells
const LIMB_WIDTH: f32 = 1.0;
/// exp(-4.6052) ~= 0.01; contributions below are dropped
const HEATMAP_CUTOFF: f32 = 4.6052;

/// Keypoint coordinates (x, y) in original image pixels
pub type Person = [Option<(f32, f32)>; NUM_PARTS];

#[derive(Debug, Deserialize)]
struct CocoFile {
    images: Vec<CocoImage>,
    annotations: Vec<CocoAnnotation>,
}

#[derive(Debug, Deserialize)]
struct CocoImage {
    id: u64,
    file_name: String,
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct CocoAnnotation {
    image_id: u64,
    #[serde(default)]
    keypoints: Vec<f32>,
    #[serde(default)]
    num_keypoints: u32,
    #[serde(default)]
    iscrowd: u8,
}

/// One annotated image
#[derive(Debug, Clone)]
pub struct PoseEntry {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub people: Vec<Person>,
}

/// Convert a flat COCO keypoint list (x, y, v)*17 to the 18-part layout
pub fn coco_to_parts(keypoints: &[f32]) -> Person {
    let coco_point = |i: usize| -> Option<(f32, f32)> {
        let base = i * 3;
        match keypoints.get(base..base + 3) {
            Some(&[x, y, v]) if v > 0.0 => Some((x, y)),
            _ => None,
        }
    };

    let mut person: Person = [None; NUM_PARTS];
    for (part, coco) in COCO_TO_PART.iter().enumerate() {
        person[part] = match coco {
            Some(i) => coco_point(*i),
            None => match (coco_point(5), coco_point(6)) {
                (Some(l), Some(r)) => Some(((l.0 + r.0) / 2.0, (l.1 + r.1) / 2.0)),
                _ => None,
            },
        };
    }
    person
}

/// Render part heatmaps plus a trailing background channel: [h, w, NUM_PARTS + 1]
///
/// `people` coordinates are in network-input pixels.
pub fn render_heatmaps(people: &[Person], shape: &SampleShape, stride: usize) -> Array3<f32> {
    let (h, w) = (shape.output_height, shape.output_width);
    let mut maps = Array3::<f32>::zeros((h, w, NUM_PARTS + 1));
    let two_sigma_sq = 2.0 * HEATMAP_SIGMA * HEATMAP_SIGMA;
    let half = stride as f32 / 2.0 - 0.5;

    for person in people {
        for (part, point) in person.iter().enumerate() {
            let Some((px, py)) = *point else { continue };
            for gy in 0..h {
                let y = (gy * stride) as f32 + half;
                for gx in 0..w {
                    let x = (gx * stride) as f32 + half;
                    let exponent = ((x - px).powi(2) + (y - py).powi(2)) / two_sigma_sq;
                    if exponent > HEATMAP_CUTOFF {
                        continue;
                    }
                    let value = (-exponent).exp().min(1.0);
                    let cell = &mut maps[[gy, gx, part]];
                    if value > *cell {
                        *cell = value;
                    }
                }
            }
        }
    }

    for gy in 0..h {
        for gx in 0..w {
            let peak = (0..NUM_PARTS)
                .map(|p| maps[[gy, gx, p]])
                .fold(0.0f32, f32::max);
            maps[[gy, gx, NUM_PARTS]] = (1.0 - peak).max(0.0);
        }
    }

    maps
}

/// Render part-affinity fields: [h, w, 2 * LIMBS.len()], (x, y) per limb
///
/// `people` coordinates are in network-input pixels. Overlapping limbs of
/// different people are averaged.
pub fn render_pafs(people: &[Person], shape: &SampleShape, stride: usize) -> Array3<f32> {
    let (h, w) = (shape.output_height, shape.output_width);
    let mut fields = Array3::<f32>::zeros((h, w, LIMBS.len() * 2));
    let mut counts = Array3::<u32>::zeros((h, w, LIMBS.len()));
    let scale = stride as f32;

    for person in people {
        for (limb, &(a, b)) in LIMBS.iter().enumerate() {
            let (Some(pa), Some(pb)) = (person[a], person[b]) else {
                continue;
            };
            let (ax, ay) = (pa.0 / scale, pa.1 / scale);
            let (bx, by) = (pb.0 / scale, pb.1 / scale);
            let (dx, dy) = (bx - ax, by - ay);
            let norm = (dx * dx + dy * dy).sqrt();
            if norm < 1e-6 {
                continue;
            }
            let (ux, uy) = (dx / norm, dy / norm);

            let min_x = (ax.min(bx) - LIMB_WIDTH).floor().max(0.0) as usize;
            let max_x = ((ax.max(bx) + LIMB_WIDTH).ceil().max(0.0) as usize).min(w);
            let min_y = (ay.min(by) - LIMB_WIDTH).floor().max(0.0) as usize;
            let max_y = ((ay.max(by) + LIMB_WIDTH).ceil().max(0.0) as usize).min(h);

            for gy in min_y..max_y {
                for gx in min_x..max_x {
                    let (cx, cy) = (gx as f32 - ax, gy as f32 - ay);
                    let along = cx * ux + cy * uy;
                    let across = (cx * uy - cy * ux).abs();
                    if along < 0.0 || along > norm || across > LIMB_WIDTH {
                        continue;
                    }
                    fields[[gy, gx, limb * 2]] += ux;
                    fields[[gy, gx, limb * 2 + 1]] += uy;
                    counts[[gy, gx, limb]] += 1;
                }
            }
        }
    }

    for ((gy, gx, limb), &count) in counts.indexed_iter() {
        if count > 1 {
            fields[[gy, gx, limb * 2]] /= count as f32;
            fields[[gy, gx, limb * 2 + 1]] /= count as f32;
        }
    }

    fields
}

fn array_to_tensor(array: &Array3<f32>) -> candle_core::Result<Tensor> {
    let dims = array.dim();
    let data: Vec<f32> = array.iter().copied().collect();
    Tensor::from_vec(data, dims, &Device::Cpu)
}

/// Producer over a COCO keypoint annotation file
pub struct CocoPoseProducer {
    entries: Arc<Vec<PoseEntry>>,
    /// Indices into `entries` owned by this producer
    indices: Vec<usize>,
    order: Vec<usize>,
    cursor: usize,
    shape: SampleShape,
    stride: usize,
}

impl CocoPoseProducer {
    /// Load annotations and keep images with at least one annotated person
    pub fn from_annotations<P: AsRef<Path>, Q: AsRef<Path>>(
        annot_path: P,
        img_dir: Q,
        shape: SampleShape,
        stride: usize,
    ) -> crate::Result<Self> {
        if shape.hm_channels != NUM_PARTS + 1 || shape.cpm_channels != LIMBS.len() * 2 {
            return Err(PoseError::Config(format!(
                "COCO targets need hm_channels={} and cpm_channels={}, got {} and {}",
                NUM_PARTS + 1,
                LIMBS.len() * 2,
                shape.hm_channels,
                shape.cpm_channels
            )));
        }

        let annot_path = annot_path.as_ref();
        log::info!("Loading COCO annotations from: {:?}", annot_path);
        let file = std::fs::File::open(annot_path).map_err(|e| {
            PoseError::Startup(format!("cannot open annotations {:?}: {}", annot_path, e))
        })?;
        let coco: CocoFile = serde_json::from_reader(std::io::BufReader::new(file))?;

        let mut people: HashMap<u64, Vec<Person>> = HashMap::new();
        for ann in &coco.annotations {
            if ann.iscrowd != 0 || ann.num_keypoints == 0 {
                continue;
            }
            people
                .entry(ann.image_id)
                .or_default()
                .push(coco_to_parts(&ann.keypoints));
        }

        let img_dir = img_dir.as_ref();
        let entries: Vec<PoseEntry> = coco
            .images
            .into_iter()
            .filter_map(|img| {
                let people = people.remove(&img.id)?;
                Some(PoseEntry {
                    path: img_dir.join(&img.file_name),
                    width: img.width,
                    height: img.height,
                    people,
                })
            })
            .collect();

        log::info!(
            "COCO dataset loaded: {} images with annotated people",
            entries.len()
        );

        Ok(Self::from_entries(entries, shape, stride))
    }

    /// Build a producer over already-parsed entries
    pub fn from_entries(entries: Vec<PoseEntry>, shape: SampleShape, stride: usize) -> Self {
        let indices: Vec<usize> = (0..entries.len()).collect();
        let mut producer = Self {
            entries: Arc::new(entries),
            order: indices.clone(),
            indices,
            cursor: 0,
            shape,
            stride,
        };
        producer.reset();
        producer
    }

    /// Shard into at most `n` producers over disjoint, non-empty subsets of
    /// the images
    pub fn split(self, n: usize) -> Vec<Self> {
        let n = n.min(self.indices.len()).max(1);
        (0..n)
            .map(|shard| {
                let indices: Vec<usize> = self
                    .indices
                    .iter()
                    .copied()
                    .skip(shard)
                    .step_by(n)
                    .collect();
                let mut producer = Self {
                    entries: self.entries.clone(),
                    order: indices.clone(),
                    indices,
                    cursor: 0,
                    shape: self.shape,
                    stride: self.stride,
                };
                producer.reset();
                producer
            })
            .collect()
    }

    fn render(&self, entry: &PoseEntry) -> crate::Result<Sample> {
        let img = image::open(&entry.path)
            .map_err(|e| PoseError::Sample(format!("{:?}: {}", entry.path, e)))?
            .to_rgb8();
        let (src_w, src_h) = (img.width().max(1), img.height().max(1));
        let (dst_w, dst_h) = (self.shape.input_width, self.shape.input_height);
        let resized = image::imageops::resize(&img, dst_w as u32, dst_h as u32, FilterType::Triangle);

        let sx = dst_w as f32 / src_w as f32;
        let sy = dst_h as f32 / src_h as f32;
        if src_w != entry.width || src_h != entry.height {
            log::debug!(
                "{:?}: annotated as {}x{}, decoded as {}x{}",
                entry.path,
                entry.width,
                entry.height,
                src_w,
                src_h
            );
        }
        let people: Vec<Person> = entry
            .people
            .iter()
            .map(|person| person.map(|p| p.map(|(x, y)| (x * sx, y * sy))))
            .collect();

        let pixels: Vec<f32> = resized.into_raw().into_iter().map(f32::from).collect();
        let image = Tensor::from_vec(pixels, (dst_h, dst_w, 3), &Device::Cpu)?;
        let heatmap = array_to_tensor(&render_heatmaps(&people, &self.shape, self.stride))?;
        let paf = array_to_tensor(&render_pafs(&people, &self.shape, self.stride))?;

        Ok(Sample {
            image,
            heatmap,
            paf,
        })
    }
}

impl SampleProducer for CocoPoseProducer {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn next_sample(&mut self) -> Option<crate::Result<Sample>> {
        let idx = *self.order.get(self.cursor)?;
        self.cursor += 1;
        let entries = self.entries.clone();
        Some(self.render(&entries[idx]))
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.order = self.indices.clone();
        self.order.shuffle(&mut rand::thread_rng());
    }
}
