//! Fit a memory bank on synthetic normal tensors and score a defective
//! one, without any model file. Demonstrates the API shape; a real
//! deployment plugs in `OnnxBackbone` instead of the toy backbone here.

use std::error::Error;

use ndarray::Array3;
use patchgrid_core::features::adaptive_avg_pool;
use patchgrid_core::{AnomalyDetector, BackboneError, FeatureBackbone, FeatureMap};

/// Toy backbone: the image pooled to two grids with channel scaling.
struct ToyBackbone;

impl FeatureBackbone for ToyBackbone {
    fn feature_maps(&self, image: &Array3<f32>) -> Result<[FeatureMap; 2], BackboneError> {
        let tap = |channels: usize, grid: usize| {
            let pooled = adaptive_avg_pool(image, grid, grid);
            Array3::from_shape_fn((channels, grid, grid), |(c, y, x)| {
                pooled[[c % 3, y, x]] * (1.0 + 0.25 * c as f32)
            })
        };
        Ok([tap(4, 28), tap(8, 14)])
    }
}

/// Smooth synthetic "part" image with an optional bright blemish.
fn part_image(phase: f32, blemish: bool) -> Array3<f32> {
    let mut img = Array3::from_shape_fn((3, 224, 224), |(c, y, x)| {
        let u = x as f32 / 224.0;
        let v = y as f32 / 224.0;
        0.5 + 0.2 * ((u * 9.0 + phase).sin() * (v * 7.0).cos()) + 0.05 * c as f32
    });
    if blemish {
        for y in 90..110 {
            for x in 90..110 {
                img[[0, y, x]] = 1.0;
                img[[1, y, x]] = 0.0;
            }
        }
    }
    img
}

fn main() -> Result<(), Box<dyn Error>> {
    let detector = AnomalyDetector::new(ToyBackbone);

    let normal: Vec<_> = (0..8).map(|i| part_image(i as f32 * 0.01, false)).collect();
    let summary = detector.fit(&normal)?;
    println!(
        "bank: {} of {} descriptors, threshold {:.6}",
        summary.kept_vectors, summary.pooled_vectors, summary.threshold
    );

    for (name, image) in [
        ("good", part_image(0.005, false)),
        ("blemished", part_image(0.005, true)),
    ] {
        let result = detector.score(&image)?;
        println!(
            "{}: score {:.6} (normalized {:.2}) -> {}",
            name, result.score, result.normalized, result.verdict
        );
    }
    Ok(())
}
