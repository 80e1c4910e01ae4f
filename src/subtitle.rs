use anyhow::Context;
use std::fmt::Write as _;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::info;

use crate::cast::{Cast, DEFAULT_STYLE};
use crate::config::{SubtitleConfig, VideoConfig};
use crate::script::{Point, Section, SectionKind};
use crate::text::wrap_text;
use crate::timing::{self, Cue};

const TITLE_WRAP: usize = 25;
const POINT_MAX_INTERVAL: f64 = 2.0;
const POINT_SLIDE_MS: u32 = 400;
const POINT_SLIDE_STAGGER_MS: u32 = 200;

pub fn format_srt_time(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_sec = total_ms / 1000;
    let s = total_sec % 60;
    let total_min = total_sec / 60;
    let m = total_min % 60;
    let h = total_min / 60;
    format!("{:02}:{:02}:{:02},{:03}", h, m, s, ms)
}

/// `H:MM:SS.cc`, centiseconds truncated.
pub fn format_ass_time(seconds: f64) -> String {
    let total_cs = (seconds.max(0.0) * 100.0 + 1e-6).floor() as u64;
    let cs = total_cs % 100;
    let total_sec = total_cs / 100;
    let s = total_sec % 60;
    let m = (total_sec / 60) % 60;
    let h = total_sec / 3600;
    format!("{}:{:02}:{:02}.{:02}", h, m, s, cs)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SrtOptions {
    pub max_chars: usize,
    pub max_lines: usize,
    pub speaker_prefix: bool,
    pub word_level: bool,
}

impl From<&SubtitleConfig> for SrtOptions {
    fn from(c: &SubtitleConfig) -> Self {
        Self {
            max_chars: c.max_chars,
            max_lines: c.max_lines,
            speaker_prefix: c.speaker_prefix,
            word_level: c.word_level_srt,
        }
    }
}

/// Cues too long for `max_lines` rows are split into sentence chunks that
/// share the original cue's time.
fn display_cues(cues: &[Cue], max_chars: usize, max_lines: usize) -> anyhow::Result<Vec<Cue>> {
    let limit = max_chars * max_lines.max(1);
    let mut out = Vec::with_capacity(cues.len());
    for cue in cues {
        out.extend(timing::split_long(cue, limit)?);
    }
    Ok(out)
}

pub fn render_srt(cues: &[Cue], opts: &SrtOptions) -> anyhow::Result<String> {
    let entries = if opts.word_level {
        let mut words = Vec::new();
        for cue in cues {
            words.extend(timing::word_cues(cue)?);
        }
        words
    } else {
        display_cues(cues, opts.max_chars, opts.max_lines)?
    };

    let mut out = String::new();
    for (i, cue) in entries.iter().enumerate() {
        writeln!(out, "{}", i + 1)?;
        writeln!(
            out,
            "{} --> {}",
            format_srt_time(cue.start),
            format_srt_time(cue.end)
        )?;
        let text = if opts.speaker_prefix && !opts.word_level {
            format!("{}：{}", cue.speaker, cue.text)
        } else {
            cue.text.clone()
        };
        for line in wrap_text(&text, opts.max_chars, opts.max_lines) {
            writeln!(out, "{}", line)?;
        }
        writeln!(out)?;
    }
    Ok(out)
}

pub fn write_srt(path: &Path, cues: &[Cue], opts: &SrtOptions) -> anyhow::Result<()> {
    let body = render_srt(cues, opts)?;
    let mut f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    f.write_all(body.as_bytes())?;
    info!("Wrote SRT with {} cues to {}", cues.len(), path.display());
    Ok(())
}

/// Banner shown at the top of the screen while a section plays.
#[derive(Debug, Clone, PartialEq)]
pub struct Topic {
    pub start: f64,
    pub end: f64,
    pub label: String,
    pub points: Vec<Point>,
}

impl Topic {
    /// Ranking and titled segment sections get a banner; opening and ending
    /// do not.
    pub fn for_section(section: &Section, start: f64, end: f64) -> Option<Self> {
        let label = match &section.kind {
            SectionKind::Ranking { rank, title } => format!("【第{rank}位】{title}"),
            SectionKind::Segment { title } if !title.trim().is_empty() => format!("【{title}】"),
            _ => return None,
        };
        Some(Self {
            start,
            end,
            label,
            points: section.points.clone(),
        })
    }
}

/// Everything that ends up in the `.ass` file.
pub struct AssDocument<'a> {
    pub title: &'a str,
    pub duration: f64,
    pub cues: &'a [Cue],
    pub topics: &'a [Topic],
    pub cast: &'a Cast,
    pub video: &'a VideoConfig,
    pub subtitles: &'a SubtitleConfig,
}

/// Escape text for an ASS event: braces would open override blocks and
/// newlines must be `\N`.
fn escape_ass(text: &str) -> String {
    text.replace('\\', "＼")
        .replace('{', "\\{")
        .replace('}', "\\}")
        .replace("\r\n", "\\N")
        .replace('\n', "\\N")
}

fn scaled(base: u32, factor: f64) -> u32 {
    (base as f64 * factor).round() as u32
}

fn render_styles(doc: &AssDocument<'_>, out: &mut String) -> std::fmt::Result {
    let font = &doc.subtitles.font;
    let size = doc.subtitles.font_size;
    let height = doc.video.height;
    writeln!(out, "[V4+ Styles]")?;
    writeln!(
        out,
        "Format: Name, Fontname, Fontsize, PrimaryColour, SecondaryColour, OutlineColour, BackColour, Bold, Italic, Underline, StrikeOut, ScaleX, ScaleY, Spacing, Angle, BorderStyle, Outline, Shadow, Alignment, MarginL, MarginR, MarginV, Encoding"
    )?;
    writeln!(
        out,
        "Style: {DEFAULT_STYLE},{font},{size},&H00FFFFFF,&H000000FF,&H00000000,&H80000000,1,0,0,0,100,100,0,0,1,4,1,2,50,50,{},1",
        scaled(height, 0.08)
    )?;
    writeln!(
        out,
        "Style: Title,{font},{},&H00FFFFFF,&H000000FF,&H00000000,&H80000000,1,0,0,0,100,100,0,0,1,4,2,8,30,30,{},1",
        scaled(size, 0.9),
        scaled(height, 0.02)
    )?;
    writeln!(
        out,
        "Style: Topic,{font},{},&H0000FFFF,&H000000FF,&H00000000,&H80808080,1,0,0,0,100,100,0,0,3,15,0,8,30,30,{},1",
        scaled(size, 1.1),
        scaled(height, 0.12)
    )?;
    writeln!(
        out,
        "Style: Point,{font},{},&H00FFFFFF,&H000000FF,&H00000000,&H00000000,0,0,0,0,100,100,0,0,1,2,1,7,100,100,0,1",
        scaled(size, 0.8)
    )?;
    writeln!(
        out,
        "Style: PointImportant,{font},{},&H003333FF,&H000000FF,&H0000FFFF,&H00000000,1,0,0,0,100,100,0,0,1,3,2,7,100,100,0,1",
        scaled(size, 0.9)
    )?;
    for c in doc.cast.characters() {
        writeln!(
            out,
            "Style: {},{font},{size},{},&H000000FF,{},&H80808080,1,0,0,0,100,100,0,0,3,8,0,2,50,50,{},1",
            c.style,
            c.color,
            c.outline,
            (c.margin_v * height as f64).round() as u32
        )?;
    }
    writeln!(out)
}

fn render_points(
    topic: &Topic,
    doc: &AssDocument<'_>,
    out: &mut String,
) -> std::fmt::Result {
    if topic.points.is_empty() {
        return Ok(());
    }
    let width = doc.video.width as f64;
    let height = doc.video.height as f64;
    let base_y = height * 0.26;
    let line_height = height * 0.088;
    let left = (width * 0.083).round() as i64;
    let enter_x = (width + 80.0).round() as i64;

    let duration = topic.end - topic.start;
    let interval = (duration / (topic.points.len() + 1) as f64).min(POINT_MAX_INTERVAL);
    let end = format_ass_time(topic.end);
    for (idx, point) in topic.points.iter().enumerate() {
        let start = topic.start + (idx + 1) as f64 * interval * 0.5;
        let y = (base_y + idx as f64 * line_height).round() as i64;
        let delay = idx as u32 * POINT_SLIDE_STAGGER_MS;
        let (style, bullet) = if point.important {
            ("PointImportant", format!("【重要】{}", point.text))
        } else if let Some(kind) = point.kind.as_deref().filter(|k| !k.is_empty()) {
            ("Point", format!("【{kind}】{}", point.text))
        } else {
            ("Point", format!("・{}", point.text))
        };
        writeln!(
            out,
            "Dialogue: 2,{},{},{},,0,0,0,,{{\\an7\\move({enter_x},{y},{left},{y},{delay},{})}}{}",
            format_ass_time(start),
            end,
            style,
            delay + POINT_SLIDE_MS,
            escape_ass(&bullet)
        )?;
    }
    Ok(())
}

pub fn render_ass(doc: &AssDocument<'_>) -> anyhow::Result<String> {
    let mut out = String::new();
    writeln!(out, "[Script Info]")?;
    writeln!(out, "Title: {}", escape_ass(doc.title))?;
    writeln!(out, "ScriptType: v4.00+")?;
    writeln!(out, "PlayResX: {}", doc.video.width)?;
    writeln!(out, "PlayResY: {}", doc.video.height)?;
    writeln!(out, "WrapStyle: 0")?;
    writeln!(out)?;
    render_styles(doc, &mut out)?;

    writeln!(out, "[Events]")?;
    writeln!(
        out,
        "Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text"
    )?;

    if !doc.title.trim().is_empty() {
        let title = wrap_text(doc.title, TITLE_WRAP, 2)
            .iter()
            .map(|l| escape_ass(l))
            .collect::<Vec<_>>()
            .join("\\N");
        writeln!(
            out,
            "Dialogue: 0,{},{},Title,,0,0,0,,★ {} ★",
            format_ass_time(0.0),
            format_ass_time(doc.duration),
            title
        )?;
    }

    for topic in doc.topics {
        writeln!(
            out,
            "Dialogue: 1,{},{},Topic,,0,0,0,,{{\\fscx50\\fscy50\\t(0,500,\\fscx100\\fscy100)}}{}",
            format_ass_time(topic.start),
            format_ass_time(topic.end),
            escape_ass(&topic.label)
        )?;
        render_points(topic, doc, &mut out)?;
    }

    let max_chars = doc.subtitles.max_chars;
    let max_lines = doc.subtitles.max_lines;
    for cue in display_cues(doc.cues, max_chars, max_lines)? {
        let text = if doc.subtitles.speaker_prefix {
            format!("{}：{}", cue.speaker, cue.text)
        } else {
            cue.text.clone()
        };
        let body = wrap_text(&text, max_chars, max_lines)
            .iter()
            .map(|l| escape_ass(l))
            .collect::<Vec<_>>()
            .join("\\N");
        writeln!(
            out,
            "Dialogue: 3,{},{},{},{},0,0,0,,{}",
            format_ass_time(cue.start),
            format_ass_time(cue.end),
            doc.cast.style_for(&cue.speaker),
            cue.speaker.replace(',', " "),
            body
        )?;
    }
    Ok(out)
}

pub fn write_ass(path: &Path, doc: &AssDocument<'_>) -> anyhow::Result<()> {
    let body = render_ass(doc)?;
    let mut f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    f.write_all(body.as_bytes())?;
    info!(
        "Wrote ASS with {} cues and {} topics to {}",
        doc.cues.len(),
        doc.topics.len(),
        path.display()
    );
    Ok(())
}
