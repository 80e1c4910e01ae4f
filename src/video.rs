use anyhow::{Context, bail};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, error, info, warn};

const STDERR_TAIL_LINES: usize = 15;

/// One still image shown for `duration` seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Slide {
    pub image: PathBuf,
    pub duration: f64,
}

/// Quote a path for an ffmpeg concat list.
fn concat_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', "'\\''"))
}

/// Escape a path for use inside a filter argument such as `ass=`.
fn filter_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "\\\\")
        .replace(':', "\\:")
        .replace('\'', "\\'")
        .replace(',', "\\,")
}

/// Concat-demuxer input for a slideshow. The demuxer ignores the duration of
/// the final entry, so the last file is listed once more.
pub fn slideshow_list(slides: &[Slide]) -> String {
    let mut out = String::new();
    for slide in slides {
        out.push_str(&format!("file {}\n", concat_quote(&slide.image)));
        out.push_str(&format!("duration {:.3}\n", slide.duration.max(0.0)));
    }
    if let Some(last) = slides.last() {
        out.push_str(&format!("file {}\n", concat_quote(&last.image)));
    }
    out
}

/// Merge consecutive slides that show the same image.
pub fn merge_slides(slides: Vec<Slide>) -> Vec<Slide> {
    let mut merged: Vec<Slide> = Vec::with_capacity(slides.len());
    for slide in slides {
        match merged.last_mut() {
            Some(prev) if prev.image == slide.image => prev.duration += slide.duration,
            _ => merged.push(slide),
        }
    }
    merged
}

pub fn concat_audio_args(inputs: &[&Path], out: &Path, sample_rate: u32) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-y".into()];
    for input in inputs {
        args.push("-i".into());
        args.push(input.as_os_str().to_owned());
    }
    let mut graph = String::new();
    for i in 0..inputs.len() {
        graph.push_str(&format!(
            "[{i}:a]aresample={sample_rate},aformat=sample_fmts=s16:channel_layouts=mono[a{i}];"
        ));
    }
    for i in 0..inputs.len() {
        graph.push_str(&format!("[a{i}]"));
    }
    graph.push_str(&format!("concat=n={}:v=0:a=1[out]", inputs.len()));
    args.extend(
        [
            "-filter_complex",
            graph.as_str(),
            "-map",
            "[out]",
            "-c:a",
            "pcm_s16le",
        ]
        .map(OsString::from),
    );
    args.push(out.as_os_str().to_owned());
    args
}

/// Join audio files of any format into one mono 16-bit WAV.
pub fn concat_audio(inputs: &[&Path], out: &Path, sample_rate: u32) -> anyhow::Result<()> {
    if inputs.is_empty() {
        bail!("no audio inputs to concatenate");
    }
    info!("Concatenating {} audio files into {}", inputs.len(), out.display());
    run_ffmpeg(&concat_audio_args(inputs, out, sample_rate))
}

/// Where the picture of the first pass comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum VideoSource {
    /// Concat list written by [`slideshow_list`].
    Slideshow(PathBuf),
    /// Plain black frame.
    Blank,
}

#[derive(Debug, Clone)]
pub struct ComposeJob<'a> {
    pub source: VideoSource,
    pub voice: &'a Path,
    pub bgm: Option<&'a Path>,
    pub bgm_volume: f64,
    pub total: f64,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub out: &'a Path,
}

/// First pass: picture plus voice, with the BGM looped under the voice when
/// one is given.
pub fn compose_args(job: &ComposeJob<'_>) -> Vec<OsString> {
    let (w, h, fps) = (job.width, job.height, job.fps);
    let mut args: Vec<OsString> = vec!["-y".into()];
    match &job.source {
        VideoSource::Slideshow(list) => {
            args.extend(["-f", "concat", "-safe", "0", "-i"].map(OsString::from));
            args.push(list.as_os_str().to_owned());
        }
        VideoSource::Blank => {
            args.extend(["-f", "lavfi", "-i"].map(OsString::from));
            args.push(format!("color=c=black:s={w}x{h}:r={fps}").into());
        }
    }
    args.push("-i".into());
    args.push(job.voice.as_os_str().to_owned());

    args.push("-vf".into());
    args.push(
        format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,fps={fps},format=yuv420p"
        )
        .into(),
    );

    match job.bgm {
        Some(bgm) => {
            args.push("-i".into());
            args.push(bgm.as_os_str().to_owned());
            args.push("-filter_complex".into());
            args.push(
                format!(
                    "[1:a]volume=1.0[voice];[2:a]volume={},aloop=loop=-1:size=2e+09[bgm_loop];[voice][bgm_loop]amix=inputs=2:duration=first:dropout_transition=2[a]",
                    job.bgm_volume
                )
                .into(),
            );
            args.extend(["-map", "0:v", "-map", "[a]"].map(OsString::from));
        }
        None => args.extend(["-map", "0:v", "-map", "1:a"].map(OsString::from)),
    }

    args.extend(
        [
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-crf",
            "23",
            "-c:a",
            "aac",
            "-b:a",
            "192k",
            "-pix_fmt",
            "yuv420p",
            "-movflags",
            "+faststart",
            "-t",
        ]
        .map(OsString::from),
    );
    args.push(format!("{:.3}", job.total + 1.0).into());
    args.push(job.out.as_os_str().to_owned());
    args
}

/// Second pass: burn the ASS subtitles in, copying the audio.
pub fn burn_args(input: &Path, ass: &Path, out: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-y".into(), "-i".into(), input.as_os_str().to_owned()];
    args.push("-vf".into());
    args.push(format!("ass={}", filter_path(ass)).into());
    args.extend(
        [
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-crf",
            "23",
            "-pix_fmt",
            "yuv420p",
            "-c:a",
            "copy",
            "-movflags",
            "+faststart",
        ]
        .map(OsString::from),
    );
    args.push(out.as_os_str().to_owned());
    args
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n")
}

pub fn run_ffmpeg(args: &[OsString]) -> anyhow::Result<()> {
    debug!("ffmpeg {:?}", args);
    let output = Command::new("ffmpeg")
        .args(args)
        .output()
        .context("failed to execute ffmpeg")?;
    if !output.status.success() {
        let tail = stderr_tail(&output.stderr);
        error!("ffmpeg exited with {}", output.status);
        bail!("ffmpeg failed ({}):\n{}", output.status, tail);
    }
    Ok(())
}

/// Run both passes. When burning subtitles fails the unsubtitled video is
/// moved to `out` so the run still produces something playable.
pub fn render_video(job: &ComposeJob<'_>, ass: &Path, out: &Path) -> anyhow::Result<PathBuf> {
    info!("Composing slideshow and audio into {}", job.out.display());
    run_ffmpeg(&compose_args(job))?;

    info!("Burning subtitles into {}", out.display());
    match run_ffmpeg(&burn_args(job.out, ass, out)) {
        Ok(()) => {}
        Err(e) => {
            warn!("Subtitle burn-in failed; keeping video without subtitles: {e:#}");
            if fs::rename(job.out, out).is_err() {
                fs::copy(job.out, out).with_context(|| {
                    format!("move {} to {}", job.out.display(), out.display())
                })?;
            }
        }
    }
    info!("Final video written to {}", out.display());
    Ok(out.to_path_buf())
}
