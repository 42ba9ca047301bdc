use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kiln::{Mode, Quality};

#[derive(clap::Args, Debug)]
pub struct ConvertArgs {
    /// Mesh (glb, obj, stl, ply) or volume (nii, nii.gz) to convert.
    pub input: PathBuf,

    /// Output path. Defaults to the input path with the target extension.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Target mesh format.
    #[arg(short, long, default_value = "glb")]
    pub format: String,

    /// Free-text modification request, recorded in the metadata.
    #[arg(long)]
    pub prompt: Option<String>,

    #[arg(long, default_value = "high")]
    pub quality: Quality,
}

#[derive(clap::Args, Debug)]
pub struct DescribeArgs {
    pub input: PathBuf,
}

#[derive(clap::Args, Debug)]
#[command(group(clap::ArgGroup::new("conditioning").required(true).args(["prompt", "image"])))]
pub struct GenerateArgs {
    /// Text describing the object.
    #[arg(long)]
    pub prompt: Option<String>,

    /// Reference image of the object.
    #[arg(long)]
    pub image: Option<PathBuf>,

    #[arg(short, long)]
    pub output: PathBuf,

    #[arg(short, long, default_value = "glb")]
    pub format: String,

    #[arg(long, default_value = "geometry")]
    pub mode: Mode,

    #[arg(long, default_value_t = 7.5)]
    pub guidance_scale: f32,

    #[arg(long, default_value_t = 50)]
    pub steps: u32,

    #[arg(long, default_value_t = 2025)]
    pub seed: u32,

    /// Samples per side of the procedural volume.
    #[arg(long, default_value_t = 48)]
    pub resolution: usize,
}

#[derive(clap::Args, Debug)]
pub struct ImageArgs {
    pub prompt: String,

    #[arg(short, long)]
    pub output: PathBuf,

    #[arg(long, default_value_t = 1024)]
    pub width: u32,

    #[arg(long, default_value_t = 1024)]
    pub height: u32,

    #[arg(long)]
    pub seed: Option<u32>,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Engine settings file (TOML). Without it settings come from `KILN_*` variables.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Pretend this many accelerators are present.
    #[arg(long, global = true)]
    pub simulate: Option<u32>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Re-encode a mesh or a volume as another mesh format.
    Convert(ConvertArgs),
    /// Print statistics for a mesh or a volume.
    Describe(DescribeArgs),
    /// Generate a mesh with the built-in procedural pipelines.
    Generate(GenerateArgs),
    /// Render an image with the built-in procedural pipeline.
    Image(ImageArgs),
    /// Print device and pipeline status.
    Status,
}
