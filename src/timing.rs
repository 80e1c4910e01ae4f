//! Local subtitle timing: turning per-line audio durations or plain text
//! lengths into cues, and cleaning cue lists so they never overlap.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::script::DialogueLine;
use crate::text;

/// One subtitle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cue {
    pub speaker: String,
    pub text: String,
    pub start: f64,
    pub end: f64,
}

impl Cue {
    pub fn new(line: &DialogueLine, start: f64, end: f64) -> Self {
        Self {
            speaker: line.speaker.clone(),
            text: line.text.clone(),
            start,
            end,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn shifted(&self, offset: f64) -> Self {
        Self {
            start: self.start + offset,
            end: self.end + offset,
            ..self.clone()
        }
    }
}

/// A line together with the measured length of its synthesized audio.
#[derive(Debug, Clone)]
pub struct MeasuredLine<'a> {
    pub line: &'a DialogueLine,
    pub duration: f64,
    /// Silence at the head of the clip; the cue starts after it.
    pub lead_in: f64,
}

/// Cues laid out back to back from measured clip durations, `gap` seconds
/// apart. Times are relative to the start of the joined audio.
pub fn measured(lines: &[MeasuredLine<'_>], gap: f64) -> Vec<Cue> {
    let mut cues = Vec::with_capacity(lines.len());
    let mut current = 0.0;
    for (i, m) in lines.iter().enumerate() {
        let end = current + m.duration;
        let start = (current + m.lead_in).min(end);
        cues.push(Cue::new(m.line, start, end));
        current = end;
        if i + 1 < lines.len() {
            current += gap;
        }
    }
    cues
}

/// Split `[start, end]` between lines by spoken character count.
pub fn proportional(lines: &[&DialogueLine], start: f64, end: f64) -> Vec<Cue> {
    let weights: Vec<f64> = lines
        .iter()
        .map(|l| text::spoken_len(&l.text).max(1) as f64)
        .collect();
    allocate(lines, &weights, start, end)
}

fn allocate(lines: &[&DialogueLine], weights: &[f64], start: f64, end: f64) -> Vec<Cue> {
    let span = (end - start).max(0.0);
    let total: f64 = weights.iter().sum();
    let mut cues = Vec::with_capacity(lines.len());
    let mut current = start;
    for (line, weight) in lines.iter().zip(weights) {
        let share = if total > 0.0 { span * weight / total } else { 0.0 };
        cues.push(Cue::new(line, current, current + share));
        current += share;
    }
    if let Some(last) = cues.last_mut() {
        if span > 0.0 {
            last.end = end;
        }
    }
    cues
}

const COMMA_PAUSE: f64 = 0.20;
const SENTENCE_END_PAUSE: f64 = 0.40;
const WORD_WEIGHT_ALPHA: f64 = 0.75;

/// Kana and kanji are timed one character at a time; there are no spaces
/// to find words by.
const CJK_CLASS: &str = r"\p{Han}\p{Hiragana}\p{Katakana}ー";

/// Split a cue into one cue per word. Punctuation consumes a fixed pause;
/// the remaining time is shared by `len^0.75` of each word.
pub fn word_cues(cue: &Cue) -> anyhow::Result<Vec<Cue>> {
    let word_regex = Regex::new(&format!(
        r"[{CJK_CLASS}]|[\w--[{CJK_CLASS}]][[\w'\-]--[{CJK_CLASS}]]*|[,.!?、。！？]"
    ))?;
    let elements: Vec<&str> = word_regex.find_iter(&cue.text).map(|m| m.as_str()).collect();
    if elements.is_empty() {
        return Ok(vec![cue.clone()]);
    }

    let pause_of = |e: &str| match e {
        "," | "、" => Some(COMMA_PAUSE),
        "." | "!" | "?" | "。" | "！" | "？" => Some(SENTENCE_END_PAUSE),
        _ => None,
    };

    let mut total_pause_time = 0.0;
    let mut word_elements = Vec::new();
    for &element in &elements {
        match pause_of(element) {
            Some(p) => total_pause_time += p,
            None => word_elements.push(element),
        }
    }
    if word_elements.is_empty() {
        return Ok(vec![cue.clone()]);
    }

    // Pauses never eat more than half the cue.
    let total_pause_time = total_pause_time.min(cue.duration() * 0.5);
    let pause_scale = if total_pause_time > 0.0 {
        total_pause_time / elements.iter().filter_map(|&e| pause_of(e)).sum::<f64>()
    } else {
        0.0
    };
    let word_time_available = (cue.duration() - total_pause_time).max(0.0);
    let total_weight: f64 = word_elements
        .iter()
        .map(|w| (w.chars().count() as f64).powf(WORD_WEIGHT_ALPHA))
        .sum();

    let mut cues = Vec::with_capacity(word_elements.len());
    let mut current = cue.start;
    for element in elements {
        if let Some(p) = pause_of(element) {
            current += p * pause_scale;
            continue;
        }
        let weight = (element.chars().count() as f64).powf(WORD_WEIGHT_ALPHA);
        let duration = if total_weight > 0.0 {
            word_time_available * weight / total_weight
        } else {
            0.0
        };
        cues.push(Cue {
            speaker: cue.speaker.clone(),
            text: element.to_string(),
            start: current,
            end: current + duration,
        });
        current += duration;
    }
    Ok(cues)
}

/// Split a long cue into sentence chunks that share its span by length.
pub fn split_long(cue: &Cue, max_chars: usize) -> anyhow::Result<Vec<Cue>> {
    if max_chars == 0 || cue.text.chars().count() <= max_chars {
        return Ok(vec![cue.clone()]);
    }
    let chunks = text::chunk_text(&cue.text, max_chars)?;
    if chunks.len() <= 1 {
        return Ok(vec![cue.clone()]);
    }
    let parts: Vec<DialogueLine> = chunks
        .into_iter()
        .map(|t| DialogueLine {
            speaker: cue.speaker.clone(),
            text: t,
        })
        .collect();
    let refs: Vec<&DialogueLine> = parts.iter().collect();
    Ok(proportional(&refs, cue.start, cue.end))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlapOptions {
    /// Shortest cue kept on screen.
    pub min_duration: f64,
    /// Gaps between consecutive cues shorter than this are closed by
    /// extending the earlier cue.
    pub max_hold: f64,
    /// Nothing may end after this time.
    pub limit: Option<f64>,
}

impl Default for OverlapOptions {
    fn default() -> Self {
        Self {
            min_duration: 0.3,
            max_hold: 0.4,
            limit: None,
        }
    }
}

/// Make a cue list display cleanly: starts never go backwards, no cue runs
/// into the next, every cue lasts at least `min_duration` (later cues are
/// pushed to make room) and short gaps are bridged. When the cues before
/// `limit` cannot all get `min_duration`, they split the remaining time.
pub fn fix_overlaps(cues: &mut [Cue], opts: OverlapOptions) {
    // Each start leaves room for the previous cue's minimum duration.
    let mut floor = 0.0f64;
    let count = cues.len();
    for (i, cue) in cues.iter_mut().enumerate() {
        if !cue.start.is_finite() {
            cue.start = floor;
        }
        if !cue.end.is_finite() {
            cue.end = cue.start;
        }
        cue.start = cue.start.max(floor);
        // Near the limit the remaining cues share what is left evenly.
        let min_duration = match opts.limit {
            Some(limit) => opts
                .min_duration
                .min((limit - cue.start).max(0.0) / (count - i) as f64),
            None => opts.min_duration,
        };
        if cue.end < cue.start + min_duration {
            cue.end = cue.start + min_duration;
        }
        floor = cue.start + min_duration;
    }

    for i in 1..cues.len() {
        let next_start = cues[i].start;
        let prev = &mut cues[i - 1];
        if prev.end > next_start {
            prev.end = next_start;
        } else if next_start - prev.end < opts.max_hold {
            prev.end = next_start;
        }
    }

    if let Some(limit) = opts.limit {
        for cue in cues.iter_mut() {
            cue.start = cue.start.min(limit);
            cue.end = cue.end.clamp(cue.start, limit.max(cue.start));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn line(speaker: &str, text: &str) -> DialogueLine {
        DialogueLine {
            speaker: speaker.to_string(),
            text: text.to_string(),
        }
    }

    fn cue(start: f64, end: f64) -> Cue {
        Cue {
            speaker: "A".into(),
            text: "x".into(),
            start,
            end,
        }
    }

    #[test]
    fn measured_adds_gaps_between_lines_only() {
        let a = line("カツミ", "はい");
        let b = line("ヒロシ", "どうも");
        let cues = measured(
            &[
                MeasuredLine { line: &a, duration: 1.0, lead_in: 0.0 },
                MeasuredLine { line: &b, duration: 2.0, lead_in: 0.1 },
            ],
            0.3,
        );
        assert_relative_eq!(cues[0].start, 0.0);
        assert_relative_eq!(cues[0].end, 1.0);
        assert_relative_eq!(cues[1].start, 1.4);
        assert_relative_eq!(cues[1].end, 3.3);
    }

    #[test]
    fn proportional_follows_character_counts() {
        let a = line("A", "ab");
        let b = line("B", "cdef!!");
        let cues = proportional(&[&a, &b], 10.0, 16.0);
        assert_relative_eq!(cues[0].end, 12.0);
        assert_relative_eq!(cues[1].start, 12.0);
        assert_relative_eq!(cues[1].end, 16.0);
    }

    #[test]
    fn proportional_over_empty_window_is_zero_length() {
        let a = line("A", "ab");
        let cues = proportional(&[&a], 5.0, 5.0);
        assert_relative_eq!(cues[0].start, 5.0);
        assert_relative_eq!(cues[0].end, 5.0);
    }

    #[test]
    fn japanese_word_cues_are_per_character() {
        let c = Cue {
            speaker: "A".into(),
            text: "今日は、晴れ。".into(),
            start: 0.0,
            end: 2.0,
        };
        let words = word_cues(&c).unwrap();
        let texts: Vec<&str> = words.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(texts, ["今", "日", "は", "晴", "れ"]);
        assert!(words.iter().all(|w| w.start >= 0.0 && w.end <= 2.0 + 1e-9));
    }

    #[test]
    fn mixed_script_splits_latin_words_whole() {
        let c = Cue {
            speaker: "A".into(),
            text: "YouTube動画".into(),
            start: 0.0,
            end: 1.0,
        };
        let texts: Vec<String> = word_cues(&c).unwrap().into_iter().map(|w| w.text).collect();
        assert_eq!(texts, ["YouTube", "動", "画"]);
    }

    #[test]
    fn word_cues_stay_inside_cue() {
        let c = Cue {
            speaker: "A".into(),
            text: "Hello there, general Kenobi.".into(),
            start: 1.0,
            end: 4.0,
        };
        let words = word_cues(&c).unwrap();
        assert_eq!(words.len(), 4);
        assert_eq!(words[0].text, "Hello");
        assert!(words.iter().all(|w| w.start >= 1.0 && w.end <= 4.0 + 1e-9));
        assert!(words.windows(2).all(|p| p[0].end <= p[1].start + 1e-9));
    }

    #[test]
    fn split_long_divides_span() {
        let c = Cue {
            speaker: "A".into(),
            text: "年金は大事です。でも制度は複雑です。".into(),
            start: 0.0,
            end: 6.0,
        };
        let parts = split_long(&c, 10).unwrap();
        assert_eq!(parts.len(), 2);
        assert_relative_eq!(parts[0].start, 0.0);
        assert_relative_eq!(parts[1].end, 6.0);
        assert_relative_eq!(parts[0].end, parts[1].start);
    }

    #[test]
    fn overlaps_are_clipped() {
        let mut cues = vec![cue(0.0, 2.0), cue(1.5, 3.0)];
        fix_overlaps(&mut cues, OverlapOptions { max_hold: 0.0, ..Default::default() });
        assert_relative_eq!(cues[0].end, 1.5);
        assert_relative_eq!(cues[1].start, 1.5);
    }

    #[test]
    fn starts_never_go_backwards() {
        let mut cues = vec![cue(2.0, 3.0), cue(1.0, 1.2)];
        fix_overlaps(&mut cues, OverlapOptions { max_hold: 0.0, ..Default::default() });
        assert_relative_eq!(cues[1].start, 2.3, epsilon = 1e-9);
        assert_relative_eq!(cues[0].end, 2.3, epsilon = 1e-9);
        assert_relative_eq!(cues[1].end, 2.6, epsilon = 1e-9);
    }

    #[test]
    fn short_cues_are_extended_and_push_followers() {
        let mut cues = vec![cue(0.0, 0.05), cue(0.1, 1.0)];
        fix_overlaps(&mut cues, OverlapOptions { max_hold: 0.0, ..Default::default() });
        assert_relative_eq!(cues[0].end, 0.3);
        assert_relative_eq!(cues[1].start, 0.3);
    }

    #[test]
    fn short_gaps_are_bridged() {
        let mut cues = vec![cue(0.0, 1.0), cue(1.2, 2.0), cue(3.0, 4.0)];
        fix_overlaps(&mut cues, OverlapOptions::default());
        assert_relative_eq!(cues[0].end, 1.2);
        assert_relative_eq!(cues[1].end, 2.0);
    }

    #[test]
    fn limit_clamps_tail() {
        let mut cues = vec![cue(0.0, 1.0), cue(9.9, 12.0)];
        fix_overlaps(
            &mut cues,
            OverlapOptions { limit: Some(10.0), ..Default::default() },
        );
        assert_relative_eq!(cues[1].end, 10.0);
    }

    #[test]
    fn crowded_tail_shares_time_before_limit() {
        let mut cues: Vec<Cue> = (0..5).map(|i| cue(i as f64 * 0.2, i as f64 * 0.2 + 0.2)).collect();
        fix_overlaps(
            &mut cues,
            OverlapOptions { limit: Some(1.0), ..Default::default() },
        );
        for c in &cues {
            assert!(c.duration() > 0.15, "cue {:?} too short", c);
        }
        assert_relative_eq!(cues[4].end, 1.0);
        assert!(cues.windows(2).all(|w| w[0].end <= w[1].start + 1e-9));
    }

    #[test]
    fn cues_piled_at_limit_still_show() {
        let mut cues = vec![cue(0.9, 0.9), cue(0.9, 0.9), cue(0.9, 0.9)];
        fix_overlaps(
            &mut cues,
            OverlapOptions { limit: Some(1.0), ..Default::default() },
        );
        assert!(cues.iter().all(|c| c.duration() > 0.0));
        assert_relative_eq!(cues[2].end, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn fix_overlaps_is_idempotent() {
        let mut cues = vec![cue(0.0, 2.0), cue(1.0, 1.1), cue(1.15, 5.0)];
        let opts = OverlapOptions { limit: Some(4.0), ..Default::default() };
        fix_overlaps(&mut cues, opts);
        let once = cues.clone();
        fix_overlaps(&mut cues, opts);
        assert_eq!(once, cues);
    }
}
