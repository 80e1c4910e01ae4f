use regex::Regex;
use tracing::warn;
use unicode_normalization::UnicodeNormalization;

/// Characters after which a CJK subtitle line may break.
const BREAK_CHARS: &[char] = &[
    '、', '。', '！', '？', '…', '」', '）', 'で', 'が', 'を', 'に', 'は', 'と', 'も',
];

/// How far back from the wrap width a CJK break point is searched for.
const BREAK_LOOKBACK: usize = 8;

/// Lowercased alphanumeric characters only, NFKC-folded (full-width and
/// half-width forms become one) with katakana mapped onto hiragana, so a
/// transcript's ハイ matches a script's はい.
pub fn normalize(text: &str) -> String {
    text.nfkc()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .map(katakana_to_hiragana)
        .collect()
}

fn katakana_to_hiragana(c: char) -> char {
    match c {
        'ァ'..='ヶ' => char::from_u32(c as u32 - 0x60).unwrap_or(c),
        _ => c,
    }
}

/// Number of characters that count towards a line's speaking time.
pub fn spoken_len(text: &str) -> usize {
    text.chars().filter(|c| c.is_alphanumeric()).count()
}

/// Split text into sentence chunks of at most `max_chars` characters.
/// A single sentence longer than the limit is kept whole.
pub fn chunk_text(text: &str, max_chars: usize) -> anyhow::Result<Vec<String>> {
    let re = Regex::new(r"(?s)([^.!?。！？]+[.!?。！？]+)|([^.!?。！？]+$)")?;
    let mut sentences = Vec::new();
    for m in re.find_iter(text) {
        let s = m.as_str().trim();
        if !s.is_empty() {
            sentences.push(s.to_string());
        }
    }
    if sentences.is_empty() {
        warn!("No sentence breaks found; returning whole text as one chunk");
        return Ok(vec![text.to_string()]);
    }

    let spaced = text.contains(char::is_whitespace);
    let mut chunks = Vec::new();
    let mut current = String::new();
    for s in sentences {
        let sep = if spaced { 1 } else { 0 };
        if current.is_empty() {
            current.push_str(&s);
        } else if current.chars().count() + sep + s.chars().count() <= max_chars {
            if spaced {
                current.push(' ');
            }
            current.push_str(&s);
        } else {
            chunks.push(current);
            current = s;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    Ok(chunks)
}

/// Wrap a subtitle line to `width` characters per row, keeping at most
/// `max_lines` rows. Truncated text ends with an ellipsis.
pub fn wrap_text(s: &str, width: usize, max_lines: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = if s.trim().contains(char::is_whitespace) {
        wrap_words(s, width)
    } else {
        wrap_chars(s.trim(), width)
    };
    if max_lines > 0 && lines.len() > max_lines {
        lines.truncate(max_lines);
        if let Some(last) = lines.last_mut() {
            if last.chars().count() >= width {
                last.pop();
            }
            last.push('…');
        }
    }
    lines
}

fn wrap_words(s: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in s.split_whitespace() {
        let current_len = current.chars().count();
        if current_len + word.chars().count() + 1 > width && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
            current.push_str(word);
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

fn wrap_chars(s: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current: Vec<char> = Vec::new();
    for c in s.chars() {
        current.push(c);
        if current.len() < width {
            continue;
        }
        let floor = current.len().saturating_sub(BREAK_LOOKBACK);
        let split = (floor..current.len() - 1)
            .rev()
            .find(|&i| BREAK_CHARS.contains(&current[i]))
            .map(|i| i + 1)
            .unwrap_or(current.len());
        let rest = current.split_off(split);
        lines.push(current.iter().collect());
        current = rest;
    }
    if !current.is_empty() {
        lines.push(current.iter().collect());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_punctuation_and_case() {
        assert_eq!(normalize("Hello, World!"), "helloworld");
        assert_eq!(normalize("第3位は、年金です。"), "第3位は年金です");
    }

    #[test]
    fn normalize_folds_kana_and_width() {
        assert_eq!(normalize("ハイ"), normalize("はい"));
        assert_eq!(normalize("ﾊｲ"), "はい");
        assert_eq!(normalize("ＡＢＣ１２３"), "abc123");
        assert_eq!(normalize("コーヒー"), "こーひー");
    }

    #[test]
    fn chunk_text_joins_short_sentences() {
        let chunks = chunk_text("One. Two. Three is longer.", 10).unwrap();
        assert_eq!(chunks, vec!["One. Two.", "Three is longer."]);
    }

    #[test]
    fn chunk_text_handles_cjk_terminators() {
        let chunks = chunk_text("今日は晴れです。明日は雨です。", 8).unwrap();
        assert_eq!(chunks, vec!["今日は晴れです。", "明日は雨です。"]);
    }

    #[test]
    fn chunk_text_without_terminator_returns_whole() {
        let chunks = chunk_text("no terminator here", 5).unwrap();
        assert_eq!(chunks, vec!["no terminator here"]);
    }

    #[test]
    fn wrap_words_respects_width() {
        let lines = wrap_text("the quick brown fox jumps", 10, 0);
        assert_eq!(lines, vec!["the quick", "brown fox", "jumps"]);
    }

    #[test]
    fn wrap_cjk_prefers_break_point() {
        let lines = wrap_text("年金の受け取りは六十五歳からが基本です", 10, 0);
        assert_eq!(lines[0], "年金の受け取りは");
        assert_eq!(lines.concat(), "年金の受け取りは六十五歳からが基本です");
    }

    #[test]
    fn wrap_truncates_to_max_lines() {
        let lines = wrap_text("あいうえおかきくけこさしすせそたちつてと", 5, 2);
        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with('…'));
    }
}
