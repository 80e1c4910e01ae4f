use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::TimingMode;

#[derive(Parser, Debug)]
#[command(name = "dialogue-sync", version, about = "Dialogue scripts to subtitled video")]
pub struct Cli {
    /// Log at debug level.
    #[clap(long, short, global = true)]
    pub verbose: bool,

    /// Config file to use instead of the default lookup.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Synthesize a script and build subtitles, chapters and video.
    Render(RenderArgs),
    /// Subtitles for an existing voice track from a transcript.
    Align(AlignArgs),
    /// Re-render SRT and ASS from a cues.json file.
    Subs(SubsArgs),
    /// Print YouTube chapters from a timeline.json file.
    Chapters(ChaptersArgs),
    /// Show, initialize or validate the configuration.
    Config(ConfigArgs),
}

#[derive(ClapArgs, Debug)]
pub struct RenderArgs {
    /// Dialogue script JSON.
    pub script: PathBuf,

    #[clap(long, default_value = "out")]
    pub out: PathBuf,

    /// Subtitle timing strategy; overrides the config.
    #[clap(long, value_enum)]
    pub timing: Option<TimingMode>,

    /// Transcript JSON to use for stt timing instead of calling the API.
    #[clap(long)]
    pub words: Option<PathBuf>,

    #[clap(long)]
    pub no_video: bool,

    #[clap(long)]
    pub keep_work_dir: bool,
}

#[derive(ClapArgs, Debug)]
pub struct AlignArgs {
    /// Finished voice track.
    #[clap(long)]
    pub audio: PathBuf,

    #[clap(long)]
    pub script: Option<PathBuf>,

    /// timeline.json from a previous render; aligns section by section.
    #[clap(long)]
    pub timeline: Option<PathBuf>,

    #[clap(long)]
    pub words: Option<PathBuf>,

    #[clap(long, default_value = "out")]
    pub out: PathBuf,
}

#[derive(ClapArgs, Debug)]
pub struct SubsArgs {
    #[clap(long)]
    pub cues: PathBuf,

    #[clap(long, default_value = "out")]
    pub out: PathBuf,

    #[clap(long, default_value = "")]
    pub title: String,
}

#[derive(ClapArgs, Debug)]
pub struct ChaptersArgs {
    #[clap(long)]
    pub timeline: PathBuf,

    /// Write to this file instead of stdout.
    #[clap(long)]
    pub out: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
pub struct ConfigArgs {
    #[clap(long)]
    pub init: bool,

    #[clap(long)]
    pub show: bool,

    #[clap(long)]
    pub validate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_flags_parse() {
        let cli = Cli::parse_from([
            "dialogue-sync",
            "render",
            "script.json",
            "--timing",
            "stt",
            "--no-video",
            "-v",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Render(args) => {
                assert_eq!(args.timing, Some(TimingMode::Stt));
                assert!(args.no_video);
                assert_eq!(args.out, PathBuf::from("out"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn global_config_after_subcommand() {
        let cli = Cli::parse_from(["dialogue-sync", "config", "--show", "--config", "c.json"]);
        assert_eq!(cli.config, Some(PathBuf::from("c.json")));
    }
}
