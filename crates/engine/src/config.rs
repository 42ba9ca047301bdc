use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::pipeline::PipelineId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("{0}")]
    Invalid(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

/// Engine settings.
///
/// Every field has a default, so a config file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Accelerator allow-list. Only the first entry is used to pick a device.
    #[serde(deserialize_with = "deserialize_devices")]
    pub devices: Vec<u32>,
    /// Fraction of device memory a single request may claim.
    pub memory_fraction: f32,
    /// Upper bound on in-flight requests, enforced by whatever serves the engine.
    pub max_concurrent_requests: usize,
    /// Fail instead of falling back to the host when no accelerator is present.
    pub require_accelerator: bool,
    pub model_cache_dir: PathBuf,
    pub shape_model_id: String,
    pub geometry_variant: String,
    pub texture_variant: String,
    pub image_model_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            devices: vec![0, 1, 2, 3],
            memory_fraction: 0.8,
            max_concurrent_requests: 4,
            require_accelerator: false,
            model_cache_dir: PathBuf::from("./models"),
            shape_model_id: "stepfun-ai/Step1X-3D".to_string(),
            geometry_variant: "Step1X-3D-Geometry-1300m".to_string(),
            texture_variant: "Step1X-3D-Texture".to_string(),
            image_model_id: "stabilityai/stable-diffusion-xl-base-1.0".to_string(),
        }
    }
}

/// Parses a comma separated device list such as `"0,1,2,3"`.
///
/// Anything unparsable selects device 0.
pub fn parse_device_list(s: &str) -> Vec<u32> {
    let parsed: Result<Vec<u32>, _> = s
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::parse)
        .collect();
    match parsed {
        Ok(devices) => devices,
        Err(_) => {
            log::warn!("could not parse device list `{s}`, using device 0");
            vec![0]
        }
    }
}

fn deserialize_devices<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u32>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Devices {
        List(Vec<u32>),
        Csv(String),
    }
    Ok(match Devices::deserialize(d)? {
        Devices::List(list) => list,
        Devices::Csv(s) => parse_device_list(&s),
    })
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}

fn parse_bool(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue { key, value }),
    }
}

impl EngineConfig {
    /// Defaults overridden by `KILN_*` environment variables.
    ///
    /// The device list comes from `KILN_DEVICES`, falling back to `CUDA_VISIBLE_DEVICES`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(devices) = lookup("KILN_DEVICES").or_else(|| lookup("CUDA_VISIBLE_DEVICES")) {
            config.devices = parse_device_list(&devices);
        }
        if let Some(v) = lookup("KILN_MEMORY_FRACTION") {
            config.memory_fraction = parse_env("KILN_MEMORY_FRACTION", v)?;
        }
        if let Some(v) = lookup("KILN_MAX_CONCURRENT_REQUESTS") {
            config.max_concurrent_requests = parse_env("KILN_MAX_CONCURRENT_REQUESTS", v)?;
        }
        if let Some(v) = lookup("KILN_REQUIRE_ACCELERATOR") {
            config.require_accelerator = parse_bool("KILN_REQUIRE_ACCELERATOR", v)?;
        }
        if let Some(v) = lookup("KILN_MODEL_CACHE_DIR") {
            config.model_cache_dir = PathBuf::from(v);
        }
        for (key, field) in [
            ("KILN_SHAPE_MODEL_ID", &mut config.shape_model_id),
            ("KILN_GEOMETRY_VARIANT", &mut config.geometry_variant),
            ("KILN_TEXTURE_VARIANT", &mut config.texture_variant),
            ("KILN_IMAGE_MODEL_ID", &mut config.image_model_id),
        ] {
            if let Some(v) = lookup(key) {
                *field = v;
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.memory_fraction > 0.0 && self.memory_fraction <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "memory_fraction must be in (0, 1], got {}",
                self.memory_fraction
            )));
        }
        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_requests must be at least 1".into(),
            ));
        }
        for (name, id) in [
            ("shape_model_id", &self.shape_model_id),
            ("geometry_variant", &self.geometry_variant),
            ("texture_variant", &self.texture_variant),
            ("image_model_id", &self.image_model_id),
        ] {
            if id.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{name} is empty")));
            }
        }
        Ok(())
    }

    pub fn geometry_pipeline(&self) -> PipelineId {
        PipelineId::with_variant(&self.shape_model_id, &self.geometry_variant)
    }

    pub fn texture_pipeline(&self) -> PipelineId {
        PipelineId::with_variant(&self.shape_model_id, &self.texture_variant)
    }

    pub fn image_pipeline(&self) -> PipelineId {
        PipelineId::new(&self.image_model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn device_lists() {
        assert_eq!(parse_device_list("0,1,2,3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_device_list(" 2 , 5 "), vec![2, 5]);
        assert_eq!(parse_device_list("0,gpu1"), vec![0]);
        assert_eq!(parse_device_list(""), Vec::<u32>::new());
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("CUDA_VISIBLE_DEVICES", "3,1"),
            ("KILN_MEMORY_FRACTION", "0.5"),
            ("KILN_REQUIRE_ACCELERATOR", "true"),
            ("KILN_TEXTURE_VARIANT", "paint"),
        ]
        .into_iter()
        .collect();
        let config = EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.devices, vec![3, 1]);
        assert_eq!(config.memory_fraction, 0.5);
        assert!(config.require_accelerator);
        assert_eq!(config.texture_pipeline().variant(), Some("paint"));
        assert_eq!(config.max_concurrent_requests, 4);
    }

    #[test]
    fn env_rejects_garbage() {
        let err = EngineConfig::from_lookup(|k| {
            (k == "KILN_MAX_CONCURRENT_REQUESTS").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "KILN_MAX_CONCURRENT_REQUESTS",
                ..
            }
        ));
    }

    #[test]
    fn toml_accepts_both_device_forms() {
        let a = EngineConfig::from_toml_str("devices = [1, 2]").unwrap();
        let b = EngineConfig::from_toml_str("devices = \"1,2\"\nmemory_fraction = 0.6").unwrap();
        assert_eq!(a.devices, vec![1, 2]);
        assert_eq!(b.devices, vec![1, 2]);
        assert_eq!(b.memory_fraction, 0.6);
        assert_eq!(b.image_model_id, EngineConfig::default().image_model_id);
    }

    #[test]
    fn validation() {
        assert!(EngineConfig::from_toml_str("memory_fraction = 0.0").is_err());
        assert!(EngineConfig::from_toml_str("memory_fraction = 1.5").is_err());
        assert!(EngineConfig::from_toml_str("max_concurrent_requests = 0").is_err());
        assert!(EngineConfig::from_toml_str("shape_model_id = \" \"").is_err());
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn pipeline_identities() {
        let config = EngineConfig::default();
        assert_eq!(config.geometry_pipeline().family(), "stepfun-ai/Step1X-3D");
        assert_eq!(config.geometry_pipeline().variant(), Some("Step1X-3D-Geometry-1300m"));
        assert_eq!(config.image_pipeline().variant(), None);
    }
}
