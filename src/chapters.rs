use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub start: f64,
    pub title: String,
}

/// `M:SS` below one hour, `H:MM:SS` from then on, as YouTube expects.
pub fn format_chapter_time(seconds: f64) -> String {
    let total = seconds.max(0.0).floor() as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

pub fn render_chapters(chapters: &[Chapter]) -> String {
    chapters
        .iter()
        .map(|c| format!("{} {}\n", format_chapter_time(c.start), c.title))
        .collect()
}

pub fn write_chapters(path: &Path, chapters: &[Chapter]) -> anyhow::Result<()> {
    fs::write(path, render_chapters(chapters))
        .with_context(|| format!("write chapters to {}", path.display()))?;
    info!("Wrote {} chapters to {}", chapters.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_times() {
        assert_eq!(format_chapter_time(0.0), "0:00");
        assert_eq!(format_chapter_time(65.9), "1:05");
        assert_eq!(format_chapter_time(3599.0), "59:59");
        assert_eq!(format_chapter_time(3725.0), "1:02:05");
    }

    #[test]
    fn renders_one_line_per_chapter() {
        let chapters = vec![
            Chapter { start: 0.0, title: "オープニング".into() },
            Chapter { start: 42.3, title: "第3位 加給年金".into() },
        ];
        assert_eq!(render_chapters(&chapters), "0:00 オープニング\n0:42 第3位 加給年金\n");
    }
}
