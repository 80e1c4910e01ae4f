use anyhow::{Context, bail};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::align::{self, AlignOptions, AlignReport, SectionSpan};
use crate::audio;
use crate::chapters;
use crate::config::{Config, TimingMode, TtsBackend};
use crate::keys::KeyRing;
use crate::script::{DialogueLine, Script};
use crate::subtitle::{self, AssDocument, SrtOptions, Topic};
use crate::timeline::{SectionAudio, Timeline, TimelineEntry};
use crate::timing::{self, Cue, MeasuredLine, OverlapOptions};
use crate::transcribe::{self, SpeechRecognizer, TranscriptWord, WhisperApiRecognizer};
use crate::tts::{self, GeminiSynthesizer, LineAudio, PiperSynthesizer, SpeechSynthesizer, SynthesisOptions};
use crate::video::{self, ComposeJob, Slide, VideoSource};

pub const GEMINI_KEY_PREFIX: &str = "GEMINI_API_KEY";

/// Longest stretch of leading silence trimmed from a clip's cue.
const MAX_LEAD_IN_MS: u32 = 2000;
const RETRY_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub script: PathBuf,
    pub out_dir: PathBuf,
    /// Overrides `timing.mode` from the config.
    pub mode: Option<TimingMode>,
    /// Pre-computed transcript for `stt` timing.
    pub words: Option<PathBuf>,
    pub no_video: bool,
    pub keep_work_dir: bool,
}

#[derive(Debug, Clone)]
pub struct AlignInput {
    pub audio: PathBuf,
    pub script: Option<PathBuf>,
    pub timeline: Option<PathBuf>,
    pub words: Option<PathBuf>,
    pub out_dir: PathBuf,
}

/// Files written into the output directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Outputs {
    pub voice: PathBuf,
    pub ass: PathBuf,
    pub srt: PathBuf,
    pub chapters: PathBuf,
    pub cues: PathBuf,
    pub timeline: PathBuf,
    pub video: PathBuf,
}

impl Outputs {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            voice: dir.join("voice.wav"),
            ass: dir.join("subtitles.ass"),
            srt: dir.join("subtitles.srt"),
            chapters: dir.join("chapters.txt"),
            cues: dir.join("cues.json"),
            timeline: dir.join("timeline.json"),
            video: dir.join("video.mp4"),
        }
    }
}

fn announcer(config: &Config) -> anyhow::Result<String> {
    config
        .cast
        .announcer()
        .map(|c| c.name.clone())
        .context("cast must contain at least one character")
}

pub fn build_synthesizer(config: &Config) -> anyhow::Result<Arc<dyn SpeechSynthesizer>> {
    Ok(match config.tts.backend {
        TtsBackend::Gemini => Arc::new(GeminiSynthesizer::new(
            config.tts.base_url.clone(),
            config.tts.model.clone(),
            Duration::from_secs(config.tts.timeout_seconds),
        )?),
        TtsBackend::Piper => {
            let model = config
                .tts
                .piper_model
                .clone()
                .context("piper backend requires tts.piper_model")?;
            Arc::new(PiperSynthesizer::new(model))
        }
    })
}

fn synthesis_options(config: &Config) -> SynthesisOptions {
    SynthesisOptions {
        workers: config.tts.workers,
        max_retries: config.tts.max_retries,
        stagger: Duration::from_millis(config.tts.stagger_ms),
        retry_backoff: RETRY_BACKOFF,
        fallback_sample_rate: config.audio.sample_rate,
    }
}

/// Full run: speech for every line, section audio, timeline, subtitles,
/// chapters and (optionally) the video.
pub async fn render(config: &Config, opts: &RenderOptions) -> anyhow::Result<Outputs> {
    config.validate()?;
    let synth = build_synthesizer(config)?;
    render_with(config, opts, synth).await
}

pub async fn render_with(
    config: &Config,
    opts: &RenderOptions,
    synth: Arc<dyn SpeechSynthesizer>,
) -> anyhow::Result<Outputs> {
    info!("Starting render of {}", opts.script.display());
    let script = Script::load(&opts.script, &announcer(config)?)?;
    let outputs = Outputs::in_dir(&opts.out_dir);
    fs::create_dir_all(&opts.out_dir)
        .with_context(|| format!("create output dir {}", opts.out_dir.display()))?;

    let work = config.work_dir.as_path();
    if work.exists() {
        info!("Removing existing work dir '{}'", work.display());
        fs::remove_dir_all(work)?;
    }
    fs::create_dir_all(work)?;
    info!("Created work directory '{}'", work.display());

    let keys = if synth.needs_key() {
        KeyRing::from_env(GEMINI_KEY_PREFIX)
    } else {
        KeyRing::default()
    };
    let lines: Vec<DialogueLine> = script.lines().cloned().collect();
    let clips = tts::synthesize_dialogue(
        &lines,
        synth,
        &config.cast,
        Arc::new(keys),
        &synthesis_options(config),
        &work.join("lines"),
    )
    .await?;

    let clips = conform_clips(clips, audio::pcm16_spec(config.audio.sample_rate, 1))?;

    info!("Joining line audio into sections");
    let sections = build_sections(config, &script, &clips, work)?;
    let jingle = match &config.audio.jingle {
        Some(path) => Some((path.as_path(), audio::probe_duration(path)?)),
        None => None,
    };
    let timeline = Timeline::build(&sections, jingle);
    info!(
        "Timeline: {} entries, {:.1}s total",
        timeline.entries.len(),
        timeline.total
    );
    assemble_voice(&timeline, &outputs.voice, config.audio.sample_rate)?;

    let mode = opts.mode.unwrap_or(config.timing.mode);
    let cues = timed_cues(config, mode, &timeline, &outputs.voice, opts.words.as_deref()).await?;
    let topics = topics_for(&script, &timeline);

    timeline.save(&outputs.timeline)?;
    write_subtitles(config, &script.title, &cues, &topics, timeline.total, &outputs)?;
    chapters::write_chapters(&outputs.chapters, &timeline.chapters())?;

    if opts.no_video {
        info!("Skipping video (--no-video)");
    } else {
        let base_dir = opts.script.parent().unwrap_or(Path::new("."));
        let source = match slides_for(config, &script, &timeline, base_dir)? {
            Some(slides) => {
                let list = work.join("slides.txt");
                fs::write(&list, video::slideshow_list(&slides))?;
                VideoSource::Slideshow(list)
            }
            None => {
                warn!("No images or background configured; rendering a black frame");
                VideoSource::Blank
            }
        };
        let intermediate = work.join("step1.mp4");
        let job = ComposeJob {
            source,
            voice: &outputs.voice,
            bgm: config.audio.bgm.as_deref(),
            bgm_volume: config.audio.bgm_volume,
            total: timeline.total,
            width: config.video.width,
            height: config.video.height,
            fps: config.video.fps,
            out: &intermediate,
        };
        video::render_video(&job, &outputs.ass, &outputs.video)?;
    }

    if config.keep_work_dir || opts.keep_work_dir {
        info!("Keeping work dir '{}'", work.display());
    } else {
        fs::remove_dir_all(work)?;
    }
    info!("Process complete.");
    Ok(outputs)
}

/// Clips are joined sample by sample, so they must share one WAV format.
/// When they do not (per-speaker voices at different rates), every clip
/// not already in `target` is converted to it.
fn conform_clips(mut clips: Vec<LineAudio>, target: hound::WavSpec) -> anyhow::Result<Vec<LineAudio>> {
    let specs = clips
        .iter()
        .map(|c| {
            hound::WavReader::open(&c.path)
                .map(|r| r.spec())
                .with_context(|| format!("open wav {}", c.path.display()))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let Some(first) = specs.first().copied() else {
        return Ok(clips);
    };
    if specs.iter().all(|s| *s == first) {
        return Ok(clips);
    }

    warn!(
        "Line clips differ in format; converting to {} Hz mono 16-bit",
        target.sample_rate
    );
    for (clip, spec) in clips.iter_mut().zip(specs) {
        if spec != target {
            clip.duration = audio::conform_wav(&clip.path, target)?;
        }
    }
    Ok(clips)
}

/// Join each section's line clips and lay out measured cues for it.
fn build_sections(
    config: &Config,
    script: &Script,
    clips: &[LineAudio],
    work: &Path,
) -> anyhow::Result<Vec<SectionAudio>> {
    let mut sections = Vec::with_capacity(script.sections.len());
    let mut offset = 0usize;
    for (i, section) in script.sections.iter().enumerate() {
        let end = offset + section.lines.len();
        let Some(section_clips) = clips.get(offset..end) else {
            bail!("missing audio for section {}", section.label());
        };
        offset = end;

        let mut measured = Vec::with_capacity(section_clips.len());
        for (line, clip) in section.lines.iter().zip(section_clips) {
            let lead_in = if config.audio.trim_leading_silence && clip.ok {
                audio::detect_leading_silence(
                    &clip.path,
                    config.audio.silence_threshold,
                    MAX_LEAD_IN_MS,
                )?
            } else {
                0.0
            };
            measured.push(MeasuredLine {
                line,
                duration: clip.duration,
                lead_in,
            });
        }

        let paths: Vec<&Path> = section_clips.iter().map(|c| c.path.as_path()).collect();
        let out = work.join(format!("section_{i:02}.wav"));
        let duration = audio::join_with_gaps(
            &paths,
            config.audio.line_gap,
            config.audio.tail_padding,
            &out,
        )?;
        debug!("section {} '{}' is {:.2}s", i, section.label(), duration);
        sections.push(SectionAudio {
            label: section.label(),
            kind: section.kind.clone(),
            audio: out,
            duration,
            cues: timing::measured(&measured, config.audio.line_gap),
        });
    }
    Ok(sections)
}

/// Write the full voice track. WAVs sharing one format are joined directly;
/// anything else (a compressed jingle, a different sample rate) goes through
/// ffmpeg.
fn assemble_voice(timeline: &Timeline, out: &Path, sample_rate: u32) -> anyhow::Result<()> {
    let inputs = timeline.audio_inputs();
    let specs: Vec<Option<hound::WavSpec>> = inputs
        .iter()
        .map(|p| hound::WavReader::open(p).ok().map(|r| r.spec()))
        .collect();
    let uniform = specs.first().copied().flatten().is_some_and(|first| {
        specs.iter().all(|s| *s == Some(first))
    });
    if uniform {
        let duration = audio::join_with_gaps(&inputs, 0.0, 0.0, out)?;
        info!("Voice track written to {} ({:.1}s)", out.display(), duration);
        Ok(())
    } else {
        video::concat_audio(&inputs, out, sample_rate)
    }
}

async fn timed_cues(
    config: &Config,
    mode: TimingMode,
    timeline: &Timeline,
    voice: &Path,
    words: Option<&Path>,
) -> anyhow::Result<Vec<Cue>> {
    info!("Timing subtitles ({:?})", mode);
    let overlap = OverlapOptions {
        min_duration: config.timing.min_duration,
        max_hold: config.timing.max_hold,
        limit: Some(timeline.total),
    };
    let cues = match mode {
        TimingMode::Measured => {
            let mut cues = timeline.cues.clone();
            timing::fix_overlaps(&mut cues, overlap);
            cues
        }
        TimingMode::Proportional => {
            let mut cues = Vec::new();
            for span in timeline.spans() {
                let refs: Vec<&DialogueLine> = span.lines.iter().collect();
                cues.extend(timing::proportional(&refs, span.start, span.end));
            }
            timing::fix_overlaps(&mut cues, overlap);
            cues
        }
        TimingMode::Stt => {
            let words = transcript_words(config, voice, words).await?;
            let (cues, _) = align::align_sections(
                &timeline.spans(),
                &words,
                &AlignOptions::from(&config.timing),
            );
            cues
        }
    };
    Ok(cues)
}

/// Words from a transcript file when given, otherwise from the Whisper API.
async fn transcript_words(
    config: &Config,
    audio: &Path,
    words: Option<&Path>,
) -> anyhow::Result<Vec<TranscriptWord>> {
    if let Some(path) = words {
        return transcribe::load_words(path);
    }
    let key = WhisperApiRecognizer::key_from_env().context(
        "speech-to-text timing needs WHISPER_API_KEY or OPENAI_API_KEY, or a --words transcript",
    )?;
    let recognizer = WhisperApiRecognizer::new(
        key,
        config.stt.base_url.clone(),
        config.stt.model.clone(),
        config.stt.language.clone(),
    )?;
    info!("Transcribing {}", audio.display());
    Ok(recognizer.transcribe(audio).await?)
}

fn topics_for(script: &Script, timeline: &Timeline) -> Vec<Topic> {
    timeline
        .entries
        .iter()
        .filter_map(|entry| match entry {
            TimelineEntry::Section {
                index, start, end, ..
            } => script
                .sections
                .get(*index)
                .and_then(|s| Topic::for_section(s, *start, *end)),
            TimelineEntry::Jingle { .. } => None,
        })
        .collect()
}

/// One slide per timeline entry. A jingle shows the picture of the section
/// it introduces; entries without any picture borrow their neighbour's.
/// `None` when nothing has a picture at all.
fn slides_for(
    config: &Config,
    script: &Script,
    timeline: &Timeline,
    base_dir: &Path,
) -> anyhow::Result<Option<Vec<Slide>>> {
    let section_image = |index: usize| -> Option<PathBuf> {
        script
            .sections
            .get(index)
            .and_then(|s| s.image.as_ref())
            .map(|p| if p.is_absolute() { p.clone() } else { base_dir.join(p) })
            .or_else(|| config.video.background.clone())
    };

    let mut images: Vec<Option<PathBuf>> = Vec::with_capacity(timeline.entries.len());
    for (i, entry) in timeline.entries.iter().enumerate() {
        let image = match entry {
            TimelineEntry::Section { index, .. } => section_image(*index),
            TimelineEntry::Jingle { .. } => match timeline.entries.get(i + 1) {
                Some(TimelineEntry::Section { index, .. }) => section_image(*index),
                _ => config.video.background.clone(),
            },
        };
        images.push(image);
    }

    let Some(first) = images.iter().flatten().next().cloned() else {
        return Ok(None);
    };
    let mut current = first;
    let mut slides = Vec::with_capacity(images.len());
    for (entry, image) in timeline.entries.iter().zip(images) {
        if let Some(image) = image {
            current = image;
        }
        slides.push(Slide {
            image: std::path::absolute(&current)
                .with_context(|| format!("resolve {}", current.display()))?,
            duration: entry.end() - entry.start(),
        });
    }
    Ok(Some(video::merge_slides(slides)))
}

fn write_subtitles(
    config: &Config,
    title: &str,
    cues: &[Cue],
    topics: &[Topic],
    duration: f64,
    outputs: &Outputs,
) -> anyhow::Result<()> {
    fs::write(&outputs.cues, serde_json::to_string_pretty(cues)?)
        .with_context(|| format!("write cues to {}", outputs.cues.display()))?;
    subtitle::write_srt(&outputs.srt, cues, &SrtOptions::from(&config.subtitles))?;
    let doc = AssDocument {
        title,
        duration,
        cues,
        topics,
        cast: &config.cast,
        video: &config.video,
        subtitles: &config.subtitles,
    };
    subtitle::write_ass(&outputs.ass, &doc)
}

/// Subtitles for a finished voice track: align the script (or the sections
/// of a saved timeline) against a transcript.
pub async fn align(config: &Config, input: &AlignInput) -> anyhow::Result<AlignReport> {
    config.validate()?;
    let duration = audio::probe_duration(&input.audio)?;
    let script = match &input.script {
        Some(path) => Some(Script::load(path, &announcer(config)?)?),
        None => None,
    };
    let timeline = input.timeline.as_deref().map(Timeline::load).transpose()?;

    let spans = match (&timeline, &script) {
        (Some(t), _) => t.spans(),
        (None, Some(s)) => vec![SectionSpan {
            start: 0.0,
            end: duration,
            lines: s.lines().cloned().collect(),
        }],
        (None, None) => bail!("align needs a script or a timeline"),
    };

    let words = transcript_words(config, &input.audio, input.words.as_deref()).await?;
    let (cues, report) =
        align::align_sections(&spans, &words, &AlignOptions::from(&config.timing));

    fs::create_dir_all(&input.out_dir)
        .with_context(|| format!("create output dir {}", input.out_dir.display()))?;
    let outputs = Outputs::in_dir(&input.out_dir);
    let topics = match (&script, &timeline) {
        (Some(s), Some(t)) => topics_for(s, t),
        _ => Vec::new(),
    };
    let title = script.as_ref().map(|s| s.title.as_str()).unwrap_or("");
    write_subtitles(config, title, &cues, &topics, duration, &outputs)?;
    if let Some(t) = &timeline {
        chapters::write_chapters(&outputs.chapters, &t.chapters())?;
    }
    Ok(report)
}

/// Re-render SRT and ASS from an edited `cues.json`.
pub fn subtitles_from_cues(
    config: &Config,
    cues_path: &Path,
    out_dir: &Path,
    title: &str,
) -> anyhow::Result<()> {
    let raw = fs::read_to_string(cues_path)
        .with_context(|| format!("read cues at {}", cues_path.display()))?;
    let cues: Vec<Cue> = serde_json::from_str(&raw)
        .with_context(|| format!("parse cues at {}", cues_path.display()))?;
    let duration = cues.iter().map(|c| c.end).fold(0.0, f64::max);
    fs::create_dir_all(out_dir)?;
    let outputs = Outputs::in_dir(out_dir);
    subtitle::write_srt(&outputs.srt, &cues, &SrtOptions::from(&config.subtitles))?;
    let doc = AssDocument {
        title,
        duration,
        cues: &cues,
        topics: &[],
        cast: &config.cast,
        video: &config.video,
        subtitles: &config.subtitles,
    };
    subtitle::write_ass(&outputs.ass, &doc)
}

pub fn chapters_from_timeline(path: &Path) -> anyhow::Result<String> {
    let timeline = Timeline::load(path)?;
    Ok(chapters::render_chapters(&timeline.chapters()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{Section, SectionKind};

    fn script() -> Script {
        let line = |t: &str| DialogueLine {
            speaker: "カツミ".into(),
            text: t.into(),
        };
        Script {
            title: "t".into(),
            sections: vec![
                Section {
                    kind: SectionKind::Opening,
                    lines: vec![line("a")],
                    image: None,
                    points: vec![],
                },
                Section {
                    kind: SectionKind::Ranking { rank: 1, title: "x".into() },
                    lines: vec![line("b")],
                    image: Some(PathBuf::from("rank1.png")),
                    points: vec![],
                },
            ],
        }
    }

    fn timeline() -> Timeline {
        let sections: Vec<SectionAudio> = script()
            .sections
            .iter()
            .enumerate()
            .map(|(i, s)| SectionAudio {
                label: s.label(),
                kind: s.kind.clone(),
                audio: PathBuf::from(format!("s{i}.wav")),
                duration: 10.0,
                cues: vec![Cue::new(&s.lines[0], 0.0, 5.0)],
            })
            .collect();
        Timeline::build(&sections, Some((Path::new("j.wav"), 2.0)))
    }

    #[test]
    fn topics_follow_ranking_sections() {
        let topics = topics_for(&script(), &timeline());
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].label, "【第1位】x");
        assert_eq!(topics[0].start, 12.0);
        assert_eq!(topics[0].end, 22.0);
    }

    #[test]
    fn slides_borrow_neighbour_images() {
        let config = Config::default();
        let slides = slides_for(&config, &script(), &timeline(), Path::new("/show"))
            .unwrap()
            .unwrap();
        assert_eq!(slides.len(), 1);
        assert_eq!(slides[0].image, PathBuf::from("/show/rank1.png"));
        assert_eq!(slides[0].duration, 22.0);
    }

    #[test]
    fn slides_absent_without_any_image() {
        let mut s = script();
        s.sections[1].image = None;
        let config = Config::default();
        assert!(slides_for(&config, &s, &timeline(), Path::new("/show")).unwrap().is_none());
    }

    #[test]
    fn background_fills_sections_without_image() {
        let mut config = Config::default();
        config.video.background = Some(PathBuf::from("/bg.png"));
        let slides = slides_for(&config, &script(), &timeline(), Path::new("/show"))
            .unwrap()
            .unwrap();
        assert_eq!(slides.len(), 2);
        assert_eq!(slides[0].image, PathBuf::from("/bg.png"));
        assert_eq!(slides[0].duration, 10.0);
        assert_eq!(slides[1].duration, 12.0);
    }

    #[test]
    fn subtitles_from_edited_cues() {
        let dir = tempfile::tempdir().unwrap();
        let cues_path = dir.path().join("cues.json");
        fs::write(
            &cues_path,
            r#"[{"speaker": "ヒロシ", "text": "へぇ", "start": 0.5, "end": 1.5}]"#,
        )
        .unwrap();
        subtitles_from_cues(&Config::default(), &cues_path, dir.path(), "題").unwrap();
        let srt = fs::read_to_string(dir.path().join("subtitles.srt")).unwrap();
        assert!(srt.contains("00:00:00,500 --> 00:00:01,500"));
        let ass = fs::read_to_string(dir.path().join("subtitles.ass")).unwrap();
        assert!(ass.contains("Hiroshi,ヒロシ"));
    }
}
