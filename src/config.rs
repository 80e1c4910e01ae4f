use crate::cast::Cast;
use anyhow::{Context, bail};
use clap::ValueEnum;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const PROJECT_FILE: &str = "dialogue-sync.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cast: Cast,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub subtitles: SubtitleConfig,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub keep_work_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Used for sections without their own image.
    #[serde(default)]
    pub background: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Silence between consecutive lines of a section, seconds.
    #[serde(default = "default_line_gap")]
    pub line_gap: f64,
    /// Silence appended after the last line of a section, seconds.
    #[serde(default = "default_tail_padding")]
    pub tail_padding: f64,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Played before every ranking section.
    #[serde(default)]
    pub jingle: Option<PathBuf>,
    #[serde(default)]
    pub bgm: Option<PathBuf>,
    #[serde(default = "default_bgm_volume")]
    pub bgm_volume: f64,
    #[serde(default = "default_true")]
    pub trim_leading_silence: bool,
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum TtsBackend {
    #[default]
    Gemini,
    Piper,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default)]
    pub backend: TtsBackend,
    #[serde(default = "default_tts_model")]
    pub model: String,
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
    /// Piper voice model; the cast's voice names are ignored for piper
    /// unless they point at `.onnx` files.
    #[serde(default)]
    pub piper_model: Option<PathBuf>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,
    #[serde(default = "default_tts_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SttConfig {
    #[serde(default = "default_stt_base_url")]
    pub base_url: String,
    #[serde(default = "default_stt_model")]
    pub model: String,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimingMode {
    /// Per-line audio durations.
    #[default]
    Measured,
    /// Character-count share of each section.
    Proportional,
    /// Speech-to-text word timestamps aligned to the script.
    Stt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default)]
    pub mode: TimingMode,
    #[serde(default = "default_min_match_ratio")]
    pub min_match_ratio: f64,
    #[serde(default = "default_window_factor")]
    pub window_factor: f64,
    #[serde(default = "default_window_slack")]
    pub window_slack: usize,
    #[serde(default = "default_min_duration")]
    pub min_duration: f64,
    #[serde(default = "default_max_hold")]
    pub max_hold: f64,
    /// Transcript words this far outside a section still count for it.
    #[serde(default = "default_section_tolerance")]
    pub section_tolerance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleConfig {
    #[serde(default = "default_font")]
    pub font: String,
    #[serde(default = "default_font_size")]
    pub font_size: u32,
    /// Characters per subtitle row.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
    /// Prefix dialogue with `speaker：`.
    #[serde(default)]
    pub speaker_prefix: bool,
    /// Emit one SRT entry per word instead of per line.
    #[serde(default)]
    pub word_level_srt: bool,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("ds_tmp")
}
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_fps() -> u32 {
    30
}
fn default_line_gap() -> f64 {
    0.3
}
fn default_tail_padding() -> f64 {
    0.5
}
fn default_sample_rate() -> u32 {
    24000
}
fn default_bgm_volume() -> f64 {
    0.12
}
fn default_true() -> bool {
    true
}
fn default_silence_threshold() -> i32 {
    500
}
fn default_tts_model() -> String {
    "gemini-2.5-flash-preview-tts".to_string()
}
fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_workers() -> usize {
    8
}
fn default_max_retries() -> u32 {
    3
}
fn default_stagger_ms() -> u64 {
    1000
}
fn default_tts_timeout() -> u64 {
    120
}
fn default_stt_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_stt_model() -> String {
    "whisper-1".to_string()
}
fn default_min_match_ratio() -> f64 {
    0.5
}
fn default_window_factor() -> f64 {
    3.0
}
fn default_window_slack() -> usize {
    40
}
fn default_min_duration() -> f64 {
    0.3
}
fn default_max_hold() -> f64 {
    0.4
}
fn default_section_tolerance() -> f64 {
    0.25
}
fn default_font() -> String {
    "Noto Sans CJK JP".to_string()
}
fn default_font_size() -> u32 {
    64
}
fn default_max_chars() -> usize {
    18
}
fn default_max_lines() -> usize {
    2
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            background: None,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            line_gap: default_line_gap(),
            tail_padding: default_tail_padding(),
            sample_rate: default_sample_rate(),
            jingle: None,
            bgm: None,
            bgm_volume: default_bgm_volume(),
            trim_leading_silence: true,
            silence_threshold: default_silence_threshold(),
        }
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            backend: TtsBackend::default(),
            model: default_tts_model(),
            base_url: default_gemini_base_url(),
            piper_model: None,
            workers: default_workers(),
            max_retries: default_max_retries(),
            stagger_ms: default_stagger_ms(),
            timeout_seconds: default_tts_timeout(),
        }
    }
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            base_url: default_stt_base_url(),
            model: default_stt_model(),
            language: None,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            mode: TimingMode::default(),
            min_match_ratio: default_min_match_ratio(),
            window_factor: default_window_factor(),
            window_slack: default_window_slack(),
            min_duration: default_min_duration(),
            max_hold: default_max_hold(),
            section_tolerance: default_section_tolerance(),
        }
    }
}

impl Default for SubtitleConfig {
    fn default() -> Self {
        Self {
            font: default_font(),
            font_size: default_font_size(),
            max_chars: default_max_chars(),
            max_lines: default_max_lines(),
            speaker_prefix: false,
            word_level_srt: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cast: Cast::default(),
            video: VideoConfig::default(),
            audio: AudioConfig::default(),
            tts: TtsConfig::default(),
            stt: SttConfig::default(),
            timing: TimingConfig::default(),
            subtitles: SubtitleConfig::default(),
            work_dir: default_work_dir(),
            keep_work_dir: false,
        }
    }
}

impl Config {
    /// Explicit path first, then `./dialogue-sync.json`, then the user config
    /// dir. Falls back to built-in defaults when no file exists.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_path(path);
        }
        let project = PathBuf::from(PROJECT_FILE);
        if project.exists() {
            return Self::load_from_path(&project);
        }
        if let Ok(path) = Self::default_path() {
            if path.exists() {
                return Self::load_from_path(&path);
            }
        }
        debug!("no config file found; using defaults");
        Ok(Self::default())
    }

    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config at {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("parse config at {}", path.display()))?;
        debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn init_default() -> anyhow::Result<PathBuf> {
        let path = Self::default_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let config = Self::default();
        fs::write(&path, serde_json::to_string_pretty(&config)?)?;
        Ok(path)
    }

    pub fn default_path() -> anyhow::Result<PathBuf> {
        let base = BaseDirs::new().context("unable to resolve home directory")?;
        Ok(base.config_dir().join("dialogue-sync").join("config.json"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cast.characters().is_empty() {
            bail!("cast must contain at least one character");
        }
        for (i, c) in self.cast.characters().iter().enumerate() {
            if self.cast.characters()[..i].iter().any(|o| o.style == c.style) {
                bail!("duplicate subtitle style '{}'", c.style);
            }
            if !(0.0..=1.0).contains(&c.margin_v) {
                bail!("margin_v for {} must be between 0.0 and 1.0", c.name);
            }
        }

        if self.video.width == 0 || self.video.height == 0 || self.video.fps == 0 {
            bail!("video width, height and fps must be greater than 0");
        }

        if self.audio.line_gap < 0.0 || self.audio.tail_padding < 0.0 {
            bail!("audio gaps must not be negative");
        }
        if self.audio.sample_rate == 0 {
            bail!("audio.sample_rate must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.audio.bgm_volume) {
            bail!("bgm_volume must be between 0.0 and 1.0");
        }

        if self.tts.workers == 0 {
            bail!("tts.workers must be greater than 0");
        }
        if self.tts.max_retries == 0 {
            bail!("tts.max_retries must be greater than 0");
        }
        if self.tts.backend == TtsBackend::Piper && self.tts.piper_model.is_none() {
            bail!("piper backend requires tts.piper_model to be set");
        }

        if !(0.0..=1.0).contains(&self.timing.min_match_ratio) {
            bail!("timing.min_match_ratio must be between 0.0 and 1.0");
        }
        if self.timing.window_factor < 1.0 {
            bail!("timing.window_factor must be at least 1.0");
        }
        if self.timing.min_duration < 0.0 || self.timing.max_hold < 0.0 {
            bail!("timing durations must not be negative");
        }

        if self.subtitles.max_chars == 0 {
            bail!("subtitles.max_chars must be greater than 0");
        }

        Ok(())
    }
}
