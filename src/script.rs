use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueLine {
    pub speaker: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SectionKind {
    Opening,
    Ranking { rank: u32, title: String },
    Ending,
    Segment { title: String },
}

impl SectionKind {
    pub fn is_ranking(&self) -> bool {
        matches!(self, SectionKind::Ranking { .. })
    }
}

/// A bullet shown on screen while a section plays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub text: String,
    #[serde(default)]
    pub important: bool,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    #[serde(flatten)]
    pub kind: SectionKind,
    pub lines: Vec<DialogueLine>,
    #[serde(default)]
    pub image: Option<PathBuf>,
    #[serde(default)]
    pub points: Vec<Point>,
}

impl Section {
    /// Chapter label for this section.
    pub fn label(&self) -> String {
        match &self.kind {
            SectionKind::Opening => "オープニング".to_string(),
            SectionKind::Ranking { rank, title } => format!("第{rank}位 {title}"),
            SectionKind::Ending => "エンディング".to_string(),
            SectionKind::Segment { title } => title.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub title: String,
    pub sections: Vec<Section>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawScript {
    Sections {
        #[serde(default)]
        title: String,
        sections: Vec<RawSection>,
    },
    Ranking {
        #[serde(default)]
        title: String,
        #[serde(default)]
        opening: Vec<DialogueLine>,
        rankings: Vec<RawRanking>,
        #[serde(default)]
        ending: Vec<DialogueLine>,
    },
}

#[derive(Debug, Deserialize)]
struct RawSection {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    rank: Option<u32>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "dialogue")]
    lines: Vec<DialogueLine>,
    #[serde(default)]
    image: Option<PathBuf>,
    #[serde(default)]
    points: Vec<RawPoint>,
}

#[derive(Debug, Deserialize)]
struct RawRanking {
    rank: u32,
    #[serde(alias = "work_title")]
    title: String,
    #[serde(default)]
    dialogue: Vec<DialogueLine>,
    #[serde(default)]
    image: Option<PathBuf>,
    #[serde(default)]
    points: Vec<RawPoint>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPoint {
    Text(String),
    Full(Point),
}

impl From<RawPoint> for Point {
    fn from(raw: RawPoint) -> Self {
        match raw {
            RawPoint::Text(text) => Point {
                text,
                important: false,
                kind: None,
            },
            RawPoint::Full(p) => p,
        }
    }
}

impl Script {
    /// Load a script file. `announcer` speaks the generated "第N位は…" line
    /// that opens each ranking section.
    pub fn load(path: &Path, announcer: &str) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read script at {}", path.display()))?;
        let script = Self::parse(&raw, announcer)
            .with_context(|| format!("parse script at {}", path.display()))?;
        info!(
            "Loaded script '{}' with {} sections and {} lines",
            script.title,
            script.sections.len(),
            script.line_count()
        );
        Ok(script)
    }

    pub fn parse(raw: &str, announcer: &str) -> anyhow::Result<Self> {
        let parsed: RawScript = serde_json::from_str(raw)?;
        let mut script = match parsed {
            RawScript::Sections { title, sections } => Script {
                title,
                sections: sections
                    .into_iter()
                    .map(RawSection::into_section)
                    .collect::<anyhow::Result<_>>()?,
            },
            RawScript::Ranking {
                title,
                opening,
                mut rankings,
                ending,
            } => {
                rankings.sort_by(|a, b| b.rank.cmp(&a.rank));
                let mut sections = Vec::with_capacity(rankings.len() + 2);
                sections.push(Section {
                    kind: SectionKind::Opening,
                    lines: opening,
                    image: None,
                    points: Vec::new(),
                });
                for r in rankings {
                    let mut lines = Vec::with_capacity(r.dialogue.len() + 1);
                    lines.push(DialogueLine {
                        speaker: announcer.to_string(),
                        text: format!("第{}位は、{}です", r.rank, r.title),
                    });
                    lines.extend(r.dialogue);
                    sections.push(Section {
                        kind: SectionKind::Ranking {
                            rank: r.rank,
                            title: r.title,
                        },
                        lines,
                        image: r.image,
                        points: r.points.into_iter().map(Point::from).collect(),
                    });
                }
                sections.push(Section {
                    kind: SectionKind::Ending,
                    lines: ending,
                    image: None,
                    points: Vec::new(),
                });
                Script { title, sections }
            }
        };
        script.drop_empty_lines();
        script.validate()?;
        Ok(script)
    }

    fn drop_empty_lines(&mut self) {
        for section in &mut self.sections {
            let label = section.label();
            section.lines.retain(|line| {
                let keep = !line.text.trim().is_empty();
                if !keep {
                    warn!("Dropping empty line by {} in {}", line.speaker, label);
                }
                keep
            });
        }
        self.sections.retain(|s| !s.lines.is_empty());
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.line_count() == 0 {
            bail!("script has no dialogue lines");
        }
        Ok(())
    }

    pub fn line_count(&self) -> usize {
        self.sections.iter().map(|s| s.lines.len()).sum()
    }

    /// All lines in playback order.
    pub fn lines(&self) -> impl Iterator<Item = &DialogueLine> {
        self.sections.iter().flat_map(|s| s.lines.iter())
    }
}

impl RawSection {
    fn into_section(self) -> anyhow::Result<Section> {
        let kind = match self.kind.as_deref().unwrap_or("segment") {
            "opening" => SectionKind::Opening,
            "ending" => SectionKind::Ending,
            "ranking" => {
                let Some(rank) = self.rank else {
                    bail!("ranking section without rank");
                };
                SectionKind::Ranking {
                    rank,
                    title: self.title.unwrap_or_default(),
                }
            }
            "segment" => SectionKind::Segment {
                title: self.title.unwrap_or_default(),
            },
            other => bail!("unknown section kind '{other}'"),
        };
        Ok(Section {
            kind,
            lines: self.lines,
            image: self.image,
            points: self.points.into_iter().map(Point::from).collect(),
        })
    }
}
