pub mod align;
pub mod args;
pub mod audio;
pub mod cast;
pub mod chapters;
pub mod config;
pub mod keys;
pub mod pipeline;
pub mod script;
pub mod subtitle;
pub mod text;
pub mod timeline;
pub mod timing;
pub mod transcribe;
pub mod tts;
pub mod video;

use anyhow::Context;
use args::{Cli, Commands};
use config::Config;
use std::fs;
use tracing::info;
use tracing_subscriber::EnvFilter;

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    setup_tracing(cli.verbose);

    match cli.command {
        Commands::Render(args) => {
            let config = Config::load(cli.config.as_deref()).context("load config")?;
            let opts = pipeline::RenderOptions {
                script: args.script,
                out_dir: args.out,
                mode: args.timing,
                words: args.words,
                no_video: args.no_video,
                keep_work_dir: args.keep_work_dir,
            };
            let outputs = pipeline::render(&config, &opts).await?;
            println!("{}", opts.out_dir.display());
            info!("Subtitles: {}", outputs.ass.display());
            Ok(())
        }
        Commands::Align(args) => {
            let config = Config::load(cli.config.as_deref()).context("load config")?;
            let input = pipeline::AlignInput {
                audio: args.audio,
                script: args.script,
                timeline: args.timeline,
                words: args.words,
                out_dir: args.out,
            };
            let report = pipeline::align(&config, &input).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Subs(args) => {
            let config = Config::load(cli.config.as_deref()).context("load config")?;
            pipeline::subtitles_from_cues(&config, &args.cues, &args.out, &args.title)
        }
        Commands::Chapters(args) => {
            let text = pipeline::chapters_from_timeline(&args.timeline)?;
            match args.out {
                Some(path) => fs::write(&path, text)
                    .with_context(|| format!("write chapters to {}", path.display())),
                None => {
                    print!("{text}");
                    Ok(())
                }
            }
        }
        Commands::Config(args) => config_cmd(cli.config.as_deref(), args),
    }
}

fn setup_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn config_cmd(explicit: Option<&std::path::Path>, args: args::ConfigArgs) -> anyhow::Result<()> {
    if args.init {
        let path = Config::init_default()?;
        println!("Initialized config at {}", path.display());
        return Ok(());
    }

    if args.show {
        let config = Config::load(explicit)?;
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    if args.validate {
        let config = Config::load(explicit)?;
        config.validate()?;
        println!("Config OK");
        return Ok(());
    }

    let path = Config::default_path()?;
    println!("{}", path.display());
    Ok(())
}
