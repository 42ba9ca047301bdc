//! Deterministic stand-in pipelines.
//!
//! These produce plausible output without a model: a blob shaped by the seed, vertex
//! paint derived from surface orientation and a two-colour gradient image. They let the
//! whole request path run on machines that have no model weights.

use std::sync::Arc;

use kiln_mesh::{Colors, Material, Mesh, Rgba};
use kiln_surface::ScalarField;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::EngineConfig;
use crate::pipeline::{
    FnLoader, Pipeline, PipelineError, PipelineInput, PipelineOutput, SamplingParams,
};
use crate::registry::PipelineRegistry;
use crate::request::Conditioning;

pub const PPM_MEDIA_TYPE: &str = "image/x-portable-pixmap";

// FNV-1a, so the same conditioning always maps to the same shape.
fn fingerprint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

fn rng_for(params: &SamplingParams, conditioning: &[u8]) -> StdRng {
    let seed = u64::from(params.seed.unwrap_or(0)) ^ fingerprint(conditioning);
    StdRng::seed_from_u64(seed)
}

fn conditioning_bytes(conditioning: &Conditioning) -> &[u8] {
    match conditioning {
        Conditioning::Image(bytes) => bytes,
        Conditioning::Prompt(prompt) => prompt.as_bytes(),
    }
}

/// Sums a few Gaussian blobs into a cube of `resolution` samples per side.
#[derive(Debug, Clone)]
pub struct ProceduralShape {
    resolution: usize,
}

impl ProceduralShape {
    pub fn new(resolution: usize) -> Self {
        Self {
            resolution: resolution.max(8),
        }
    }
}

impl Pipeline for ProceduralShape {
    fn run(&self, input: PipelineInput) -> Result<PipelineOutput, PipelineError> {
        let PipelineInput::Shape {
            conditioning,
            params,
        } = input
        else {
            return Err(PipelineError::new("procedural shape only accepts shape input"));
        };
        let mut rng = rng_for(&params, conditioning_bytes(&conditioning));

        // Higher guidance keeps the blobs tighter around the centre.
        let spread = 0.3 / params.guidance_scale.max(1.0).sqrt();
        let blobs: Vec<([f32; 3], f32)> = (0..rng.gen_range(2..=5))
            .map(|_| {
                let mut center = [0.0; 3];
                for c in &mut center {
                    *c = 0.5 + rng.gen_range(-spread..=spread);
                }
                (center, rng.gen_range(0.1..0.16))
            })
            .collect();

        let n = self.resolution;
        let step = 1.0 / (n - 1) as f32;
        let mut values = Vec::with_capacity(n * n * n);
        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    let p = [i as f32 * step, j as f32 * step, k as f32 * step];
                    let v: f32 = blobs
                        .iter()
                        .map(|(c, sigma)| {
                            let d2: f32 = (0..3).map(|a| (p[a] - c[a]).powi(2)).sum();
                            (-d2 / (2.0 * sigma * sigma)).exp()
                        })
                        .sum();
                    values.push(v);
                }
            }
        }
        let field = ScalarField::new([n; 3], [step; 3], values).map_err(PipelineError::new)?;
        Ok(PipelineOutput::Field(field))
    }
}

/// Colours each vertex by the direction its normal faces.
#[derive(Debug, Clone, Default)]
pub struct VertexPaint;

impl Pipeline for VertexPaint {
    fn run(&self, input: PipelineInput) -> Result<PipelineOutput, PipelineError> {
        let PipelineInput::Texture {
            conditioning,
            mesh,
            params,
        } = input
        else {
            return Err(PipelineError::new("vertex paint only accepts texture input"));
        };
        let mut rng = rng_for(&params, conditioning_bytes(&conditioning));
        let tint: [f32; 3] = [
            rng.gen_range(0.6..1.0),
            rng.gen_range(0.6..1.0),
            rng.gen_range(0.6..1.0),
        ];

        let colors: Vec<Rgba> = match mesh.normals() {
            Some(normals) => normals
                .iter()
                .map(|n| {
                    let channel = |v: f32, t: f32| ((v * 0.5 + 0.5) * t * 255.0).round() as u8;
                    [channel(n.x, tint[0]), channel(n.y, tint[1]), channel(n.z, tint[2]), 255]
                })
                .collect(),
            None => vec![[200, 200, 200, 255]; mesh.vertex_count()],
        };
        let material = Material {
            name: "vertex_paint".to_string(),
            base_color: [tint[0], tint[1], tint[2], 1.0],
        };
        let painted: Mesh = mesh
            .with_colors(Colors::Vertex(colors))
            .map_err(PipelineError::new)?
            .with_material(material);
        Ok(PipelineOutput::Mesh(painted))
    }
}

/// Vertical two-colour gradient written as a binary PPM.
#[derive(Debug, Clone, Default)]
pub struct GradientImage;

impl Pipeline for GradientImage {
    fn run(&self, input: PipelineInput) -> Result<PipelineOutput, PipelineError> {
        let PipelineInput::Image {
            prompt,
            width,
            height,
            params,
        } = input
        else {
            return Err(PipelineError::new("gradient image only accepts image input"));
        };
        let mut rng = rng_for(&params, prompt.as_bytes());
        let top: [u8; 3] = rng.gen();
        let bottom: [u8; 3] = rng.gen();

        let header = format!("P6\n{width} {height}\n255\n");
        let mut bytes = Vec::with_capacity(header.len() + (width * height * 3) as usize);
        bytes.extend_from_slice(header.as_bytes());
        for y in 0..height {
            let t = y as f32 / (height.max(2) - 1) as f32;
            let row: Vec<u8> = (0..3)
                .map(|c| (f32::from(top[c]) * (1.0 - t) + f32::from(bottom[c]) * t).round() as u8)
                .collect();
            for _ in 0..width {
                bytes.extend_from_slice(&row);
            }
        }
        Ok(PipelineOutput::Image {
            bytes,
            media_type: PPM_MEDIA_TYPE.to_string(),
        })
    }
}

/// Registers the stand-ins under the identities named in `config`.
pub fn register_procedural(registry: &PipelineRegistry, config: &EngineConfig, resolution: usize) {
    registry.register(
        config.geometry_pipeline(),
        Arc::new(FnLoader(move |_device| async move {
            Ok(Arc::new(ProceduralShape::new(resolution)) as Arc<dyn Pipeline>)
        })),
    );
    registry.register(
        config.texture_pipeline(),
        Arc::new(FnLoader(|_device| async {
            Ok(Arc::new(VertexPaint) as Arc<dyn Pipeline>)
        })),
    );
    registry.register(
        config.image_pipeline(),
        Arc::new(FnLoader(|_device| async {
            Ok(Arc::new(GradientImage) as Arc<dyn Pipeline>)
        })),
    );
}
