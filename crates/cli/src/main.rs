use clap::Parser;

mod args;
mod commands;

use args::{Args, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let orchestrator = commands::orchestrator(&args)?;
    let result = match args.command {
        Commands::Convert(a) => commands::convert_command(&orchestrator, a).await,
        Commands::Describe(a) => commands::describe_command(a),
        Commands::Generate(a) => commands::generate_command(&orchestrator, a).await,
        Commands::Image(a) => commands::image_command(&orchestrator, a).await,
        Commands::Status => commands::status_command(&orchestrator),
    };
    orchestrator.shutdown();
    result
}
