//! Request handling from validation to encoded bytes.
//!
//! Every call validates before touching a device, runs each pipeline inside a
//! [`ResourceScope`] and performs blocking work (model calls, surface extraction, export)
//! on the blocking thread pool so the async executor stays responsive.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use kiln_codec::{describe, Format, MeshInfo};
use kiln_mesh::Mesh;
use kiln_surface::field_to_mesh;
use log::{debug, info};
use serde::Serialize;
use tokio::task::JoinError;

use crate::config::EngineConfig;
use crate::device::{
    AcceleratorInfo, DeviceBackend, DeviceId, DeviceReport, ResourceManager, ResourceScope,
};
use crate::error::{EngineError, Result};
use crate::pipeline::{PipelineHandle, PipelineId, PipelineInput, PipelineOutput, SamplingParams};
use crate::registry::{PipelineRegistry, PipelineStatus};
use crate::request::{
    Conditioning, ConversionRequest, GenerationRequest, Mode, Quality, TextToImageRequest,
};

/// Encoded result of a request together with what was done to produce it.
#[derive(Debug, Clone)]
pub struct GenerationOutput<M> {
    pub bytes: Vec<u8>,
    pub media_type: String,
    pub metadata: M,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationMetadata {
    pub mode: Mode,
    pub conditioning: &'static str,
    pub guidance_scale: f32,
    pub num_steps: u32,
    pub seed: u32,
    pub output_format: Format,
    /// Wall-clock seconds from device acquisition to encoded bytes.
    pub generation_time: f64,
    pub device: DeviceId,
    pub device_report: DeviceReport,
    pub geometry_pipeline: PipelineId,
    pub texture_pipeline: Option<PipelineId>,
    /// Zero-area faces dropped before texturing.
    pub removed_degenerate_faces: usize,
    pub mesh_info: MeshInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageMetadata {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub seed: Option<u32>,
    pub generation_time: f64,
    pub device: DeviceId,
    pub device_report: DeviceReport,
    pub pipeline: PipelineId,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionMetadata {
    pub original_format: Format,
    pub target_format: Format,
    pub conversion_time: f64,
    pub modification_prompt: Option<String>,
    pub quality: Quality,
    pub mesh_info: MeshInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub pipelines: BTreeMap<PipelineId, PipelineStatus>,
    pub selected_device: DeviceId,
    pub accelerator: AcceleratorInfo,
    pub memory_fraction: f32,
    pub max_concurrent_requests: usize,
}

/// Runs `f` on the blocking pool. A panic or cancellation of the worker becomes the error
/// built by `on_join`.
async fn run_blocking<T, F>(f: F, on_join: impl FnOnce(JoinError) -> EngineError) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.unwrap_or_else(|e| Err(on_join(e)))
}

fn failed(handle: &PipelineHandle, reason: impl Into<String>) -> EngineError {
    EngineError::GenerationFailed {
        identity: handle.identity().clone(),
        reason: reason.into(),
    }
}

fn invoke(handle: &PipelineHandle, input: PipelineInput) -> Result<PipelineOutput> {
    let started = Instant::now();
    let output = handle.run(input).map_err(|e| failed(handle, e.to_string()))?;
    debug!(
        "{} returned {} in {:?}",
        handle.identity(),
        output.kind(),
        started.elapsed()
    );
    Ok(output)
}

/// Brings any geometric pipeline output into mesh form.
fn into_mesh(handle: &PipelineHandle, output: PipelineOutput) -> Result<Mesh> {
    match output {
        PipelineOutput::Mesh(mesh) => Ok(mesh),
        PipelineOutput::Field(field) => field_to_mesh(&field).map_err(EngineError::Surface),
        PipelineOutput::Encoded { format, bytes } => kiln_codec::import(&bytes, format)
            .map_err(|e| failed(handle, format!("returned unreadable {format}: {e}"))),
        PipelineOutput::Image { .. } => Err(failed(handle, "returned an image, expected geometry")),
    }
}

/// Encodes pipeline output as `target`. Payloads already in the target format are passed
/// through untouched once they have been read back for the mesh statistics.
fn encode(
    handle: &PipelineHandle,
    output: PipelineOutput,
    target: Format,
) -> Result<(Vec<u8>, MeshInfo)> {
    match output {
        PipelineOutput::Encoded { format, bytes } if format == target => {
            let mesh = kiln_codec::import(&bytes, format)
                .map_err(|e| failed(handle, format!("returned unreadable {format}: {e}")))?;
            Ok((bytes, describe(&mesh)))
        }
        other => export(&into_mesh(handle, other)?, target),
    }
}

fn export(mesh: &Mesh, target: Format) -> Result<(Vec<u8>, MeshInfo)> {
    let bytes = kiln_codec::export(mesh, target).map_err(|source| EngineError::Export {
        format: target,
        source,
    })?;
    Ok((bytes, describe(mesh)))
}

fn decode_input(data: &[u8], format: Format) -> Result<Mesh> {
    match format {
        Format::Nifti => {
            let field =
                kiln_surface::nifti::decode(data).map_err(|e| EngineError::decode(format, e))?;
            debug!(
                "decoded {}x{}x{} volume",
                field.dims()[0],
                field.dims()[1],
                field.dims()[2]
            );
            field_to_mesh(&field).map_err(EngineError::Surface)
        }
        _ => kiln_codec::import(data, format).map_err(|e| EngineError::decode(format, e)),
    }
}

// Free-text edits are recorded but not interpreted; the mesh passes through unchanged.
fn apply_modifications(mesh: Mesh, prompt: Option<&str>) -> Mesh {
    if let Some(prompt) = prompt.filter(|p| !p.trim().is_empty()) {
        info!("modification requested ({prompt:?}), passing mesh through unchanged");
    }
    mesh
}

/// The geometry output and everything needed to finish it on a worker thread.
struct Finish {
    geometry: PipelineHandle,
    texture: Option<PipelineHandle>,
    shape: PipelineOutput,
    conditioning: Conditioning,
    params: SamplingParams,
    target: Format,
    resources: ResourceManager,
}

struct Finished {
    bytes: Vec<u8>,
    mesh_info: MeshInfo,
    removed_degenerate_faces: usize,
    device_report: DeviceReport,
}

impl Finish {
    // The scope is held until the payload is encoded, then released.
    fn run(self, scope: ResourceScope) -> Result<Finished> {
        let (output, removed) = match &self.texture {
            None => (self.shape, 0),
            Some(texture) => {
                let mut mesh = into_mesh(&self.geometry, self.shape)?;
                let removed = mesh.remove_degenerate_faces();
                if removed > 0 {
                    debug!("removed {removed} degenerate faces before texturing");
                }
                let painted = invoke(
                    texture,
                    PipelineInput::Texture {
                        conditioning: self.conditioning,
                        mesh,
                        params: self.params,
                    },
                )?;
                (painted, removed)
            }
        };

        let producer = self.texture.as_ref().unwrap_or(&self.geometry);
        let (bytes, mesh_info) = encode(producer, output, self.target)?;
        let device_report = self.resources.report(scope.device());
        drop(scope);
        Ok(Finished {
            bytes,
            mesh_info,
            removed_degenerate_faces: removed,
            device_report,
        })
    }
}

/// Front door of the engine.
///
/// One orchestrator is shared by every in-flight request. It owns the device manager and
/// the pipeline registry; requests only borrow it.
pub struct Orchestrator {
    config: EngineConfig,
    resources: ResourceManager,
    registry: PipelineRegistry,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, backend: Arc<dyn DeviceBackend>) -> Self {
        let resources = ResourceManager::new(backend, &config);
        let registry = PipelineRegistry::new(resources.clone());
        Self {
            config,
            resources,
            registry,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    /// Produces a mesh from an image or a prompt, optionally textured, encoded as the
    /// requested container.
    pub async fn generate_3d(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationOutput<GenerationMetadata>> {
        request.validate()?;
        let target = Format::parse_output(&request.output_format)
            .map_err(|_| EngineError::UnsupportedFormat(request.output_format.clone()))?;

        let started = Instant::now();
        let scope = self.resources.acquire_scope(self.config.memory_fraction)?;
        let device = scope.device();
        info!(
            "generating {} from {} on {device} (seed {})",
            request.mode,
            request.conditioning.kind(),
            request.seed
        );

        let geometry = self.registry.get(&self.config.geometry_pipeline()).await?;
        let params = SamplingParams {
            guidance_scale: request.guidance_scale,
            steps: request.num_steps,
            seed: Some(request.seed),
        };
        let input = PipelineInput::Shape {
            conditioning: request.conditioning.clone(),
            params,
        };
        let handle = geometry.clone();
        let (shape, scope) = run_blocking(
            move || invoke(&handle, input).map(|shape| (shape, scope)),
            |e| failed(&geometry, e.to_string()),
        )
        .await?;

        let texture = match request.mode {
            Mode::Geometry => None,
            Mode::Textured => Some(self.registry.get(&self.config.texture_pipeline()).await?),
        };
        let geometry_pipeline = geometry.identity().clone();
        let texture_pipeline = texture.as_ref().map(|t| t.identity().clone());
        let finish = Finish {
            geometry: geometry.clone(),
            texture,
            shape,
            conditioning: request.conditioning.clone(),
            params,
            target,
            resources: self.resources.clone(),
        };
        let result = run_blocking(
            move || finish.run(scope),
            |e| failed(&geometry, e.to_string()),
        )
        .await?;

        let generation_time = started.elapsed().as_secs_f64();
        info!(
            "generated {} faces as {target} in {generation_time:.2}s",
            result.mesh_info.faces
        );
        Ok(GenerationOutput {
            bytes: result.bytes,
            media_type: target.media_type().to_string(),
            metadata: GenerationMetadata {
                mode: request.mode,
                conditioning: request.conditioning.kind(),
                guidance_scale: request.guidance_scale,
                num_steps: request.num_steps,
                seed: request.seed,
                output_format: target,
                generation_time,
                device,
                device_report: result.device_report,
                geometry_pipeline,
                texture_pipeline,
                removed_degenerate_faces: result.removed_degenerate_faces,
                mesh_info: result.mesh_info,
            },
        })
    }

    /// Renders an image from a prompt.
    pub async fn text_to_image(
        &self,
        request: TextToImageRequest,
    ) -> Result<GenerationOutput<ImageMetadata>> {
        request.validate()?;

        let started = Instant::now();
        let scope = self.resources.acquire_scope(self.config.memory_fraction)?;
        let device = scope.device();
        let pipeline = self.registry.get(&self.config.image_pipeline()).await?;
        info!(
            "rendering {}x{} image on {device} with {}",
            request.width,
            request.height,
            pipeline.identity()
        );

        let input = PipelineInput::Image {
            prompt: request.prompt.clone(),
            width: request.width,
            height: request.height,
            params: SamplingParams {
                guidance_scale: request.guidance_scale,
                steps: request.num_inference_steps,
                seed: request.seed,
            },
        };
        let resources = self.resources.clone();
        let handle = pipeline.clone();
        let (bytes, media_type, device_report) = run_blocking(
            move || {
                let output = invoke(&handle, input)?;
                let report = resources.report(scope.device());
                drop(scope);
                match output {
                    PipelineOutput::Image { bytes, media_type } => Ok((bytes, media_type, report)),
                    other => Err(failed(
                        &handle,
                        format!("returned {}, expected an image", other.kind()),
                    )),
                }
            },
            |e| failed(&pipeline, e.to_string()),
        )
        .await?;

        let generation_time = started.elapsed().as_secs_f64();
        info!("rendered image ({} bytes) in {generation_time:.2}s", bytes.len());
        Ok(GenerationOutput {
            bytes,
            media_type,
            metadata: ImageMetadata {
                prompt: request.prompt,
                width: request.width,
                height: request.height,
                num_inference_steps: request.num_inference_steps,
                guidance_scale: request.guidance_scale,
                seed: request.seed,
                generation_time,
                device,
                device_report,
                pipeline: pipeline.identity().clone(),
            },
        })
    }

    /// Re-encodes an uploaded mesh or volume as another mesh container. No device or model
    /// is involved.
    pub async fn convert(
        &self,
        request: ConversionRequest,
    ) -> Result<GenerationOutput<ConversionMetadata>> {
        request.validate()?;
        let original_format = Format::from_filename(&request.filename)
            .ok_or_else(|| EngineError::UnsupportedFormat(request.filename.clone()))?;
        let target_format = Format::parse_output(&request.target_format)
            .map_err(|_| EngineError::UnsupportedFormat(request.target_format.clone()))?;

        let started = Instant::now();
        info!(
            "converting {} ({} bytes) from {original_format} to {target_format}",
            request.filename,
            request.data.len()
        );
        let ConversionRequest {
            data,
            prompt,
            quality,
            ..
        } = request;
        let modification_prompt = prompt.clone();
        let (bytes, mesh_info) = run_blocking(
            move || {
                let mesh = decode_input(&data, original_format)?;
                let mesh = apply_modifications(mesh, prompt.as_deref());
                export(&mesh, target_format)
            },
            |e| EngineError::decode(original_format, e),
        )
        .await?;

        let conversion_time = started.elapsed().as_secs_f64();
        info!(
            "converted to {target_format} ({} vertices, {} faces) in {conversion_time:.2}s",
            mesh_info.vertices, mesh_info.faces
        );
        Ok(GenerationOutput {
            bytes,
            media_type: target_format.media_type().to_string(),
            metadata: ConversionMetadata {
                original_format,
                target_format,
                conversion_time,
                modification_prompt,
                quality,
                mesh_info,
            },
        })
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            pipelines: self.registry.status(),
            selected_device: self.resources.select_device(),
            accelerator: self.resources.report_all(),
            memory_fraction: self.config.memory_fraction,
            max_concurrent_requests: self.config.max_concurrent_requests,
        }
    }

    /// Loads every registered pipeline. Returns how many are now resident.
    pub async fn preload(&self) -> Result<usize> {
        let handles = self.registry.preload_all().await?;
        Ok(handles.len())
    }

    pub fn clear_device_cache(&self) {
        self.resources.clear_cache();
    }

    /// Releases every loaded pipeline. In-flight requests keep their own handles.
    pub fn shutdown(&self) {
        info!("shutting down, releasing pipelines");
        self.registry.release_all();
    }
}
