//! Aligning script lines to word-level speech-to-text output.
//!
//! Transcript words are flattened into one normalized character stream. Each
//! line is located in that stream with a local alignment inside a window that
//! starts where the previous match ended, so matches always move forward in
//! time. A match is scored against the whole transcript words it touches.
//! Lines that cannot be located confidently are placed proportionally
//! between their matched neighbours.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TimingConfig;
use crate::script::DialogueLine;
use crate::text;
use crate::timing::{self, Cue, OverlapOptions};
use crate::transcribe::TranscriptWord;

const MATCH: i32 = 2;
const MISMATCH: i32 = -1;
const GAP: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignOptions {
    pub min_match_ratio: f64,
    pub window_factor: f64,
    pub window_slack: usize,
    pub min_duration: f64,
    pub max_hold: f64,
    pub section_tolerance: f64,
}

impl Default for AlignOptions {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for AlignOptions {
    fn from(c: &TimingConfig) -> Self {
        Self {
            min_match_ratio: c.min_match_ratio,
            window_factor: c.window_factor,
            window_slack: c.window_slack,
            min_duration: c.min_duration,
            max_hold: c.max_hold,
            section_tolerance: c.section_tolerance,
        }
    }
}

/// How well a transcript covered the script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlignReport {
    pub lines: usize,
    pub matched: usize,
    pub interpolated: usize,
    /// Mean similarity of matched lines.
    pub mean_ratio: f64,
}

impl AlignReport {
    pub fn merge(&mut self, other: &AlignReport) {
        let total = self.matched + other.matched;
        if total > 0 {
            self.mean_ratio = (self.mean_ratio * self.matched as f64
                + other.mean_ratio * other.matched as f64)
                / total as f64;
        }
        self.lines += other.lines;
        self.matched = total;
        self.interpolated += other.interpolated;
    }
}

/// The window of the final track that belongs to one script section.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionSpan {
    pub start: f64,
    pub end: f64,
    pub lines: Vec<DialogueLine>,
}

/// Normalized transcript text plus, for every char, the word it came from.
struct CharStream {
    chars: Vec<char>,
    owner: Vec<usize>,
    /// Char range of each word, end exclusive.
    bounds: Vec<(usize, usize)>,
}

impl CharStream {
    fn new(words: &[TranscriptWord]) -> Self {
        let mut chars = Vec::new();
        let mut owner = Vec::new();
        let mut bounds = Vec::with_capacity(words.len());
        for (i, w) in words.iter().enumerate() {
            let start = chars.len();
            for c in text::normalize(&w.word).chars() {
                chars.push(c);
                owner.push(i);
            }
            bounds.push((start, chars.len()));
        }
        Self {
            chars,
            owner,
            bounds,
        }
    }

    /// Chars of the whole words touched by `[from, to)`, not counting
    /// anything before `floor`.
    fn covered_len(&self, from: usize, to: usize, floor: usize) -> usize {
        let first = self.bounds[self.owner[from]].0.max(floor);
        let last = self.bounds[self.owner[to - 1]].1;
        last.saturating_sub(first)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct LocalMatch {
    hay_start: usize,
    /// Exclusive.
    hay_end: usize,
    matches: usize,
}

/// Smith-Waterman local alignment of `needle` inside `hay`.
fn local_align(needle: &[char], hay: &[char]) -> Option<LocalMatch> {
    let (n, m) = (needle.len(), hay.len());
    if n == 0 || m == 0 {
        return None;
    }
    let width = m + 1;
    let mut h = vec![0i32; (n + 1) * width];
    let mut best = (0i32, 0usize, 0usize);

    for i in 1..=n {
        for j in 1..=m {
            let s = if needle[i - 1] == hay[j - 1] { MATCH } else { MISMATCH };
            let score = (h[(i - 1) * width + j - 1] + s)
                .max(h[(i - 1) * width + j] + GAP)
                .max(h[i * width + j - 1] + GAP)
                .max(0);
            h[i * width + j] = score;
            if score > best.0 {
                best = (score, i, j);
            }
        }
    }
    if best.0 == 0 {
        return None;
    }

    let (_, mut i, mut j) = best;
    let hay_end = j;
    let mut matches = 0usize;
    while i > 0 && j > 0 && h[i * width + j] > 0 {
        let here = h[i * width + j];
        let same = needle[i - 1] == hay[j - 1];
        let diag = h[(i - 1) * width + j - 1] + if same { MATCH } else { MISMATCH };
        if here == diag {
            if same {
                matches += 1;
            }
            i -= 1;
            j -= 1;
        } else if here == h[(i - 1) * width + j] + GAP {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    Some(LocalMatch {
        hay_start: j,
        hay_end,
        matches,
    })
}

fn similarity(needle_len: usize, span_len: usize, matches: usize) -> f64 {
    let denom = needle_len + span_len;
    if denom == 0 {
        0.0
    } else {
        2.0 * matches as f64 / denom as f64
    }
}

/// Align the lines of one span against transcript words that fall inside
/// it. Cues are clamped to `[start, end]`.
pub fn align_lines(
    lines: &[DialogueLine],
    words: &[TranscriptWord],
    start: f64,
    end: f64,
    opts: &AlignOptions,
) -> (Vec<Cue>, AlignReport) {
    let stream = CharStream::new(words);
    let mut anchors: Vec<Option<(f64, f64)>> = Vec::with_capacity(lines.len());
    let mut ratios = Vec::new();
    let mut cursor = 0usize;

    for (idx, line) in lines.iter().enumerate() {
        let needle: Vec<char> = text::normalize(&line.text).chars().collect();
        if needle.is_empty() || cursor >= stream.chars.len() {
            anchors.push(None);
            continue;
        }
        let window = (needle.len() as f64 * opts.window_factor) as usize + opts.window_slack;
        let window_end = (cursor + window).min(stream.chars.len());
        let hay = &stream.chars[cursor..window_end];

        // A line claims the time of every word it touches, so it is scored
        // against those whole words. Two chars lifted out of the middle of a
        // longer line's words score low.
        let found = local_align(&needle, hay).and_then(|m| {
            let covered =
                stream.covered_len(cursor + m.hay_start, cursor + m.hay_end, cursor);
            let ratio = similarity(needle.len(), covered, m.matches);
            debug!("line {} best ratio {:.2}: {}", idx, ratio, line.text);
            (ratio >= opts.min_match_ratio).then_some((m, ratio))
        });

        match found {
            Some((m, ratio)) => {
                let first = &words[stream.owner[cursor + m.hay_start]];
                let last = &words[stream.owner[cursor + m.hay_end - 1]];
                let s = first.start.clamp(start, end);
                let e = last.end.clamp(s, end);
                anchors.push(Some((s, e)));
                ratios.push(ratio);
                cursor += m.hay_end;
            }
            None => anchors.push(None),
        }
    }

    let mut cues = Vec::with_capacity(lines.len());
    let mut i = 0usize;
    while i < lines.len() {
        if let Some((s, e)) = anchors[i] {
            cues.push(Cue::new(&lines[i], s, e));
            i += 1;
            continue;
        }
        let run_start = i;
        while i < lines.len() && anchors[i].is_none() {
            i += 1;
        }
        let left = cues.last().map_or(start, |c: &Cue| c.end);
        let right = anchors
            .get(i)
            .copied()
            .flatten()
            .map_or(end, |(s, _)| s)
            .max(left);
        let run: Vec<&DialogueLine> = lines[run_start..i].iter().collect();
        cues.extend(timing::proportional(&run, left, right));
    }

    timing::fix_overlaps(
        &mut cues,
        OverlapOptions {
            min_duration: opts.min_duration,
            max_hold: opts.max_hold,
            limit: Some(end),
        },
    );

    let matched = ratios.len();
    let report = AlignReport {
        lines: lines.len(),
        matched,
        interpolated: lines.len() - matched,
        mean_ratio: if matched > 0 {
            ratios.iter().sum::<f64>() / matched as f64
        } else {
            0.0
        },
    };
    (cues, report)
}

/// Align every section against only the words heard inside its span (with
/// `section_tolerance` of slack), so audio between sections never pulls a
/// line across a boundary. Sections without any words are timed
/// proportionally.
pub fn align_sections(
    spans: &[SectionSpan],
    words: &[TranscriptWord],
    opts: &AlignOptions,
) -> (Vec<Cue>, AlignReport) {
    let mut cues = Vec::new();
    let mut report = AlignReport::default();

    for (i, span) in spans.iter().enumerate() {
        let lo = span.start - opts.section_tolerance;
        let hi = span.end + opts.section_tolerance;
        let local: Vec<TranscriptWord> = words
            .iter()
            .filter(|w| w.end >= lo && w.start <= hi)
            .cloned()
            .collect();

        if local.is_empty() {
            debug!("section {} has no transcript words; timing proportionally", i);
            let refs: Vec<&DialogueLine> = span.lines.iter().collect();
            let mut section = timing::proportional(&refs, span.start, span.end);
            timing::fix_overlaps(
                &mut section,
                OverlapOptions {
                    min_duration: opts.min_duration,
                    max_hold: opts.max_hold,
                    limit: Some(span.end),
                },
            );
            report.merge(&AlignReport {
                lines: span.lines.len(),
                matched: 0,
                interpolated: span.lines.len(),
                mean_ratio: 0.0,
            });
            cues.extend(section);
            continue;
        }

        let (section, section_report) =
            align_lines(&span.lines, &local, span.start, span.end, opts);
        debug!(
            "section {}: {}/{} lines matched",
            i, section_report.matched, section_report.lines
        );
        report.merge(&section_report);
        cues.extend(section);
    }

    info!(
        "Aligned {} lines: {} matched, {} interpolated, mean ratio {:.2}",
        report.lines, report.matched, report.interpolated, report.mean_ratio
    );
    (cues, report)
}
