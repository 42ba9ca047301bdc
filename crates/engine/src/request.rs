//! Requests accepted by the orchestrator, with the ranges they are validated against.

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

pub const GUIDANCE_SCALE: RangeInclusive<f32> = 1.0..=15.0;
pub const NUM_STEPS: RangeInclusive<u32> = 10..=100;
pub const SEED: RangeInclusive<u32> = 0..=999_999;

pub const IMAGE_GUIDANCE_SCALE: RangeInclusive<f32> = 1.0..=20.0;
pub const IMAGE_STEPS: RangeInclusive<u32> = 10..=50;
pub const IMAGE_SIZE: RangeInclusive<u32> = 512..=2048;

pub const MAX_PROMPT_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Untextured geometry.
    #[default]
    Geometry,
    /// Geometry followed by a texturing pass.
    Textured,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Geometry => "geometry",
            Mode::Textured => "textured",
        })
    }
}

impl FromStr for Mode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "geometry" => Ok(Mode::Geometry),
            "textured" => Ok(Mode::Textured),
            other => Err(EngineError::invalid(format!(
                "mode must be `geometry` or `textured`, got `{other}`"
            ))),
        }
    }
}

/// What a shape is generated from.
#[derive(Clone, PartialEq)]
pub enum Conditioning {
    /// An encoded image.
    Image(Vec<u8>),
    Prompt(String),
}

impl Conditioning {
    pub fn kind(&self) -> &'static str {
        match self {
            Conditioning::Image(_) => "image",
            Conditioning::Prompt(_) => "prompt",
        }
    }
}

impl fmt::Debug for Conditioning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conditioning::Image(bytes) => write!(f, "Image({} bytes)", bytes.len()),
            Conditioning::Prompt(prompt) => f.debug_tuple("Prompt").field(prompt).finish(),
        }
    }
}

fn check_prompt(prompt: &str, allow_empty: bool) -> Result<(), EngineError> {
    let chars = prompt.chars().count();
    if chars > MAX_PROMPT_CHARS {
        return Err(EngineError::invalid(format!(
            "prompt is {chars} characters, at most {MAX_PROMPT_CHARS} are allowed"
        )));
    }
    if !allow_empty && prompt.trim().is_empty() {
        return Err(EngineError::invalid("prompt is empty"));
    }
    Ok(())
}

fn check_range<T: PartialOrd + fmt::Display>(
    name: &str,
    value: T,
    range: &RangeInclusive<T>,
) -> Result<(), EngineError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(EngineError::invalid(format!(
            "{name} must be between {} and {}, got {value}",
            range.start(),
            range.end()
        )))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub mode: Mode,
    pub guidance_scale: f32,
    pub num_steps: u32,
    pub seed: u32,
    pub conditioning: Conditioning,
    /// Name of the container to return, such as `glb`.
    pub output_format: String,
}

impl GenerationRequest {
    pub fn new(conditioning: Conditioning) -> Self {
        Self {
            mode: Mode::Geometry,
            guidance_scale: 7.5,
            num_steps: 50,
            seed: 2025,
            conditioning,
            output_format: "glb".to_string(),
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_output_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = format.into();
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        check_range("guidance_scale", self.guidance_scale, &GUIDANCE_SCALE)?;
        check_range("num_steps", self.num_steps, &NUM_STEPS)?;
        check_range("seed", self.seed, &SEED)?;
        match &self.conditioning {
            Conditioning::Image(bytes) if bytes.is_empty() => {
                Err(EngineError::invalid("conditioning image is empty"))
            }
            Conditioning::Image(_) => Ok(()),
            Conditioning::Prompt(prompt) => check_prompt(prompt, false),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextToImageRequest {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub seed: Option<u32>,
}

impl TextToImageRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            width: 1024,
            height: 1024,
            num_inference_steps: 20,
            guidance_scale: 7.5,
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        check_prompt(&self.prompt, false)?;
        check_range("width", self.width, &IMAGE_SIZE)?;
        check_range("height", self.height, &IMAGE_SIZE)?;
        check_range("num_inference_steps", self.num_inference_steps, &IMAGE_STEPS)?;
        check_range("guidance_scale", self.guidance_scale, &IMAGE_GUIDANCE_SCALE)?;
        if let Some(seed) = self.seed {
            check_range("seed", seed, &SEED)?;
        }
        Ok(())
    }
}

/// Requested export quality. Recorded in the metadata; every level currently exports the
/// full mesh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    #[default]
    High,
}

impl FromStr for Quality {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Quality::Low),
            "medium" => Ok(Quality::Medium),
            "high" => Ok(Quality::High),
            other => Err(EngineError::invalid(format!(
                "quality must be low, medium or high, got `{other}`"
            ))),
        }
    }
}

#[derive(Clone, PartialEq)]
pub struct ConversionRequest {
    pub data: Vec<u8>,
    /// The uploaded file name; its extension selects the decoder.
    pub filename: String,
    pub target_format: String,
    /// Free-text modification request.
    pub prompt: Option<String>,
    pub quality: Quality,
}

impl ConversionRequest {
    pub fn new(data: Vec<u8>, filename: impl Into<String>) -> Self {
        Self {
            data,
            filename: filename.into(),
            target_format: "glb".to_string(),
            prompt: None,
            quality: Quality::default(),
        }
    }

    pub fn with_target_format(mut self, format: impl Into<String>) -> Self {
        self.target_format = format.into();
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if let Some(prompt) = &self.prompt {
            check_prompt(prompt, true)?;
        }
        if self.data.is_empty() {
            return Err(EngineError::invalid(format!("{} is empty", self.filename)));
        }
        Ok(())
    }
}

impl fmt::Debug for ConversionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionRequest")
            .field("data", &format_args!("{} bytes", self.data.len()))
            .field("filename", &self.filename)
            .field("target_format", &self.target_format)
            .field("prompt", &self.prompt)
            .field("quality", &self.quality)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_defaults_are_valid() {
        let request = GenerationRequest::new(Conditioning::Prompt("a teapot".into()));
        assert_eq!(request.guidance_scale, 7.5);
        assert_eq!(request.num_steps, 50);
        assert_eq!(request.seed, 2025);
        assert_eq!(request.output_format, "glb");
        assert!(request.validate().is_ok());
    }

    #[test]
    fn generation_ranges() {
        let base = GenerationRequest::new(Conditioning::Image(vec![1, 2, 3]));
        let cases = [
            GenerationRequest { guidance_scale: 0.5, ..base.clone() },
            GenerationRequest { guidance_scale: 15.5, ..base.clone() },
            GenerationRequest { num_steps: 9, ..base.clone() },
            GenerationRequest { num_steps: 101, ..base.clone() },
            GenerationRequest { seed: 1_000_000, ..base.clone() },
            GenerationRequest::new(Conditioning::Image(vec![])),
            GenerationRequest::new(Conditioning::Prompt("  ".into())),
        ];
        for request in cases {
            let err = request.validate().unwrap_err();
            assert_eq!(err.stage(), crate::Stage::RequestValidation, "{request:?}");
        }
        assert!(GenerationRequest { seed: 999_999, num_steps: 100, ..base }.validate().is_ok());
    }

    #[test]
    fn image_ranges() {
        assert!(TextToImageRequest::new("sunset").validate().is_ok());
        assert!(TextToImageRequest::new("").validate().is_err());
        assert!(TextToImageRequest::new("x".repeat(501)).validate().is_err());
        assert!(TextToImageRequest::new("x".repeat(500)).validate().is_ok());
        let small = TextToImageRequest {
            width: 256,
            ..TextToImageRequest::new("sunset")
        };
        assert!(small.validate().is_err());
        let steps = TextToImageRequest {
            num_inference_steps: 60,
            ..TextToImageRequest::new("sunset")
        };
        assert!(steps.validate().is_err());
    }

    #[test]
    fn conversion_prompt_may_be_empty_but_not_long() {
        let request = ConversionRequest::new(vec![0; 4], "a.stl").with_prompt("");
        assert!(request.validate().is_ok());
        assert!(request.with_prompt("y".repeat(501)).validate().is_err());
    }

    #[test]
    fn parse_mode_and_quality() {
        assert_eq!("Textured".parse::<Mode>().unwrap(), Mode::Textured);
        assert!("painted".parse::<Mode>().is_err());
        assert_eq!("medium".parse::<Quality>().unwrap(), Quality::Medium);
    }
}
