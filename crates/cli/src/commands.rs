use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use kiln::procedural::register_procedural;
use kiln::{
    Conditioning, ConversionRequest, DeviceBackend, EngineConfig, Format, GenerationRequest,
    HostBackend, Orchestrator, SimulatedBackend, TextToImageRequest,
};
use kiln_mesh::describe;
use serde::Serialize;

use crate::args;

const SIMULATED_MEMORY_MB: u64 = 24 * 1024;

pub fn orchestrator(args: &args::Args) -> anyhow::Result<Orchestrator> {
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env()?,
    };
    let backend: Arc<dyn DeviceBackend> = match args.simulate {
        Some(count) => Arc::new(SimulatedBackend::new(count, SIMULATED_MEMORY_MB)),
        None => Arc::new(HostBackend),
    };
    Ok(Orchestrator::new(config, backend))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn file_name(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))
}

/// `scan.nii.gz` -> `scan.glb`, `cube.stl` -> `cube.glb`.
pub fn default_output(input: &Path, format: Format) -> PathBuf {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = match name.to_ascii_lowercase().strip_suffix(".nii.gz") {
        Some(stem) => name[..stem.len()].to_string(),
        None => Path::new(&name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or(name),
    };
    input.with_file_name(format!("{stem}{}", format.extension()))
}

fn write_output(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("writing {}", path.display()))?;
    log::info!("wrote {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

pub async fn convert_command(
    orchestrator: &Orchestrator,
    args: args::ConvertArgs,
) -> anyhow::Result<()> {
    let data = std::fs::read(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let mut request =
        ConversionRequest::new(data, file_name(&args.input)?).with_target_format(&args.format);
    request.prompt = args.prompt;
    request.quality = args.quality;

    let output = orchestrator.convert(request).await?;
    let path = args
        .output
        .unwrap_or_else(|| default_output(&args.input, output.metadata.target_format));
    write_output(&path, &output.bytes)?;
    print_json(&output.metadata)
}

pub fn describe_command(args: args::DescribeArgs) -> anyhow::Result<()> {
    let name = file_name(&args.input)?;
    let format =
        Format::from_filename(&name).ok_or_else(|| anyhow!("unsupported input {name}"))?;
    let data = std::fs::read(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let mesh = match format {
        Format::Nifti => kiln_surface::field_to_mesh(&kiln_surface::nifti::decode(&data)?)?,
        _ => kiln_codec::import(&data, format)?,
    };
    print_json(&describe(&mesh))
}

pub async fn generate_command(
    orchestrator: &Orchestrator,
    args: args::GenerateArgs,
) -> anyhow::Result<()> {
    register_procedural(orchestrator.registry(), orchestrator.config(), args.resolution);
    let conditioning = match (args.prompt, args.image) {
        (Some(prompt), _) => Conditioning::Prompt(prompt),
        (None, Some(path)) => Conditioning::Image(
            std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?,
        ),
        (None, None) => return Err(anyhow!("either --prompt or --image is required")),
    };
    let mut request = GenerationRequest::new(conditioning)
        .with_mode(args.mode)
        .with_output_format(args.format);
    request.guidance_scale = args.guidance_scale;
    request.num_steps = args.steps;
    request.seed = args.seed;

    let output = orchestrator.generate_3d(request).await?;
    write_output(&args.output, &output.bytes)?;
    print_json(&output.metadata)
}

pub async fn image_command(
    orchestrator: &Orchestrator,
    args: args::ImageArgs,
) -> anyhow::Result<()> {
    register_procedural(orchestrator.registry(), orchestrator.config(), 8);
    let mut request = TextToImageRequest::new(args.prompt);
    request.width = args.width;
    request.height = args.height;
    request.seed = args.seed;

    let output = orchestrator.text_to_image(request).await?;
    write_output(&args.output, &output.bytes)?;
    print_json(&output.metadata)
}

pub fn status_command(orchestrator: &Orchestrator) -> anyhow::Result<()> {
    print_json(&orchestrator.status())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_output_names() {
        assert_eq!(
            default_output(Path::new("/data/scan.NII.gz"), Format::Glb),
            PathBuf::from("/data/scan.glb")
        );
        assert_eq!(
            default_output(Path::new("cube.stl"), Format::Ply),
            PathBuf::from("cube.ply")
        );
        assert_eq!(
            default_output(Path::new("archive.tar.obj"), Format::Stl),
            PathBuf::from("archive.tar.stl")
        );
    }
}
