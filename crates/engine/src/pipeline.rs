//! The contract between the engine and the generative models it drives.
//!
//! Models are black boxes: a [`PipelineLoader`] produces a [`Pipeline`] bound to a device,
//! and the pipeline turns a [`PipelineInput`] into a [`PipelineOutput`] with one blocking
//! call.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_codec::Format;
use kiln_mesh::Mesh;
use kiln_surface::ScalarField;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::device::DeviceId;
use crate::request::Conditioning;

/// Names a loadable model: a family such as a model repository, optionally narrowed to one
/// variant inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId {
    family: String,
    variant: Option<String>,
}

impl PipelineId {
    pub fn new(family: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            variant: None,
        }
    }

    pub fn with_variant(family: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            family: family.into(),
            variant: Some(variant.into()),
        }
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(variant) => write!(f, "{}:{}", self.family, variant),
            None => f.write_str(&self.family),
        }
    }
}

// Serialized as a string so it can key JSON maps.
impl Serialize for PipelineId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SamplingParams {
    pub guidance_scale: f32,
    pub steps: u32,
    pub seed: Option<u32>,
}

#[derive(Debug, Clone)]
pub enum PipelineInput {
    /// Produce geometry from an image or a prompt.
    Shape {
        conditioning: Conditioning,
        params: SamplingParams,
    },
    /// Paint an existing untextured mesh.
    Texture {
        conditioning: Conditioning,
        mesh: Mesh,
        params: SamplingParams,
    },
    /// Produce an image from a prompt.
    Image {
        prompt: String,
        width: u32,
        height: u32,
        params: SamplingParams,
    },
}

/// Whatever a model hands back. The orchestrator turns every variant into the requested
/// container.
#[derive(Debug, Clone)]
pub enum PipelineOutput {
    Mesh(Mesh),
    Field(ScalarField),
    Encoded { format: Format, bytes: Vec<u8> },
    Image { bytes: Vec<u8>, media_type: String },
}

impl PipelineOutput {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineOutput::Mesh(_) => "mesh",
            PipelineOutput::Field(_) => "scalar field",
            PipelineOutput::Encoded { .. } => "encoded mesh",
            PipelineOutput::Image { .. } => "image",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct PipelineError(String);

impl PipelineError {
    pub fn new(reason: impl fmt::Display) -> Self {
        Self(reason.to_string())
    }
}

/// A loaded model. `run` blocks and is always called off the async executor.
pub trait Pipeline: Send + Sync {
    fn run(&self, input: PipelineInput) -> Result<PipelineOutput, PipelineError>;
}

#[async_trait]
pub trait PipelineLoader: Send + Sync {
    async fn load(&self, device: DeviceId) -> Result<Arc<dyn Pipeline>, PipelineError>;
}

/// Adapts an async closure into a [`PipelineLoader`].
pub struct FnLoader<F>(pub F);

#[async_trait]
impl<F, Fut> PipelineLoader for FnLoader<F>
where
    F: Fn(DeviceId) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Arc<dyn Pipeline>, PipelineError>> + Send,
{
    async fn load(&self, device: DeviceId) -> Result<Arc<dyn Pipeline>, PipelineError> {
        (self.0)(device).await
    }
}

/// A shared, loaded pipeline and the device it lives on.
#[derive(Clone)]
pub struct PipelineHandle {
    identity: PipelineId,
    device: DeviceId,
    pipeline: Arc<dyn Pipeline>,
}

impl PipelineHandle {
    pub fn new(identity: PipelineId, device: DeviceId, pipeline: Arc<dyn Pipeline>) -> Self {
        Self {
            identity,
            device,
            pipeline,
        }
    }

    pub fn identity(&self) -> &PipelineId {
        &self.identity
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn run(&self, input: PipelineInput) -> Result<PipelineOutput, PipelineError> {
        self.pipeline.run(input)
    }

    /// True when both handles share one loaded instance.
    pub fn same_instance(&self, other: &PipelineHandle) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.pipeline) as *const (),
            Arc::as_ptr(&other.pipeline) as *const (),
        )
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("identity", &self.identity)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Pipeline for Echo {
        fn run(&self, _input: PipelineInput) -> Result<PipelineOutput, PipelineError> {
            Ok(PipelineOutput::Mesh(Mesh::default()))
        }
    }

    #[test]
    fn identity_display() {
        assert_eq!(PipelineId::new("sdxl").to_string(), "sdxl");
        assert_eq!(PipelineId::with_variant("step1x", "geometry").to_string(), "step1x:geometry");
        assert!(PipelineId::new("a") < PipelineId::with_variant("a", "b"));
    }

    #[test]
    fn same_instance_is_pointer_identity() {
        let shared: Arc<dyn Pipeline> = Arc::new(Echo);
        let id = PipelineId::new("echo");
        let a = PipelineHandle::new(id.clone(), DeviceId::Host, shared.clone());
        let b = a.clone();
        let c = PipelineHandle::new(id.clone(), DeviceId::Host, shared);
        let d = PipelineHandle::new(id, DeviceId::Host, Arc::new(Echo));
        assert!(a.same_instance(&b));
        assert!(a.same_instance(&c));
        assert!(!a.same_instance(&d));
    }
}
