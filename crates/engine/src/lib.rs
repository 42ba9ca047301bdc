//! Generation engine: device scoping, pipeline caching and the request orchestrator.
//!
//! ```no_run
//! # async fn demo() -> Result<(), kiln::EngineError> {
//! use std::sync::Arc;
//! use kiln::{Conditioning, EngineConfig, GenerationRequest, HostBackend, Orchestrator};
//!
//! let config = EngineConfig::default();
//! let orchestrator = Orchestrator::new(config.clone(), Arc::new(HostBackend));
//! kiln::procedural::register_procedural(orchestrator.registry(), &config, 48);
//! let output = orchestrator
//!     .generate_3d(GenerationRequest::new(Conditioning::Prompt("a vase".into())))
//!     .await?;
//! println!("{} bytes of {}", output.bytes.len(), output.media_type);
//! # Ok(())
//! # }
//! ```

mod config;
mod device;
mod error;
mod orchestrator;
mod pipeline;
pub mod procedural;
mod registry;
mod request;

pub use config::*;
pub use device::*;
pub use error::*;
pub use orchestrator::*;
pub use pipeline::*;
pub use registry::*;
pub use request::*;

pub use kiln_codec::Format;
pub use kiln_mesh::MeshInfo;
