//! Where every section and jingle sits in the final audio track.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::align::SectionSpan;
use crate::chapters::Chapter;
use crate::script::{DialogueLine, SectionKind};
use crate::timing::Cue;

/// Joined voice audio of one script section.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionAudio {
    pub label: String,
    pub kind: SectionKind,
    pub audio: PathBuf,
    pub duration: f64,
    /// Relative to the start of `audio`.
    pub cues: Vec<Cue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineEntry {
    Jingle {
        start: f64,
        end: f64,
        audio: PathBuf,
    },
    Section {
        index: usize,
        label: String,
        ranking: bool,
        start: f64,
        end: f64,
        audio: PathBuf,
        /// Range of this section's cues in `Timeline::cues`.
        first_cue: usize,
        cue_count: usize,
    },
}

impl TimelineEntry {
    pub fn start(&self) -> f64 {
        match self {
            Self::Jingle { start, .. } | Self::Section { start, .. } => *start,
        }
    }

    pub fn end(&self) -> f64 {
        match self {
            Self::Jingle { end, .. } | Self::Section { end, .. } => *end,
        }
    }

    pub fn audio(&self) -> &Path {
        match self {
            Self::Jingle { audio, .. } | Self::Section { audio, .. } => audio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub entries: Vec<TimelineEntry>,
    /// Absolute cues of all sections in playback order.
    pub cues: Vec<Cue>,
    pub total: f64,
}

impl Timeline {
    /// Lay sections end to end, putting the jingle (path and duration) in
    /// front of every ranking section.
    pub fn build(sections: &[SectionAudio], jingle: Option<(&Path, f64)>) -> Self {
        let mut entries = Vec::new();
        let mut cues = Vec::new();
        let mut offset = 0.0;

        for (index, section) in sections.iter().enumerate() {
            let ranking = section.kind.is_ranking();
            if let (true, Some((path, duration))) = (ranking, jingle) {
                entries.push(TimelineEntry::Jingle {
                    start: offset,
                    end: offset + duration,
                    audio: path.to_path_buf(),
                });
                offset += duration;
            }

            let first_cue = cues.len();
            cues.extend(section.cues.iter().map(|c| c.shifted(offset)));
            entries.push(TimelineEntry::Section {
                index,
                label: section.label.clone(),
                ranking,
                start: offset,
                end: offset + section.duration,
                audio: section.audio.clone(),
                first_cue,
                cue_count: section.cues.len(),
            });
            debug!(
                "section {} '{}' at {:.2}s for {:.2}s",
                index, section.label, offset, section.duration
            );
            offset += section.duration;
        }

        Self {
            entries,
            cues,
            total: offset,
        }
    }

    /// One chapter per section. A ranking chapter starts at the jingle that
    /// announces it; the first chapter always starts at zero.
    pub fn chapters(&self) -> Vec<Chapter> {
        let mut chapters = Vec::new();
        let mut previous: Option<&TimelineEntry> = None;
        for entry in &self.entries {
            if let TimelineEntry::Section {
                label,
                ranking,
                start,
                ..
            } = entry
            {
                let start = match previous {
                    Some(TimelineEntry::Jingle { start: j, .. }) if *ranking => *j,
                    _ => *start,
                };
                chapters.push(Chapter {
                    start: if chapters.is_empty() { 0.0 } else { start },
                    title: label.clone(),
                });
            }
            previous = Some(entry);
        }
        chapters
    }

    /// Section windows with their lines, for transcript alignment.
    pub fn spans(&self) -> Vec<SectionSpan> {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                TimelineEntry::Section {
                    start,
                    end,
                    first_cue,
                    cue_count,
                    ..
                } => {
                    let lines = self
                        .cues
                        .iter()
                        .skip(*first_cue)
                        .take(*cue_count)
                        .map(|c| DialogueLine {
                            speaker: c.speaker.clone(),
                            text: c.text.clone(),
                        })
                        .collect();
                    Some(SectionSpan {
                        start: *start,
                        end: *end,
                        lines,
                    })
                }
                TimelineEntry::Jingle { .. } => None,
            })
            .collect()
    }

    /// Audio files in playback order.
    pub fn audio_inputs(&self) -> Vec<&Path> {
        self.entries.iter().map(TimelineEntry::audio).collect()
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("write timeline to {}", path.display()))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read timeline at {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse timeline at {}", path.display()))
    }
}
