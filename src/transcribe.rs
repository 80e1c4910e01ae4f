use anyhow::Context;
use async_trait::async_trait;
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One recognized word with its position in the audio, seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptWord {
    #[serde(alias = "text")]
    pub word: String,
    pub start: f64,
    pub end: f64,
    #[serde(default = "default_probability")]
    pub probability: f64,
}

fn default_probability() -> f64 {
    1.0
}

#[derive(Debug, thiserror::Error)]
pub enum TranscriptionError {
    #[error("could not read audio: {0}")]
    AudioRead(String),
    #[error("API request failed: {0}")]
    ApiRequestFailed(String),
    #[error("unexpected transcript format: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn transcribe(&self, audio: &Path) -> Result<Vec<TranscriptWord>, TranscriptionError>;
}

/// OpenAI-compatible `/audio/transcriptions` endpoint with word timestamps.
pub struct WhisperApiRecognizer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    language: Option<String>,
}

impl WhisperApiRecognizer {
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        language: Option<String>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            language,
        })
    }

    /// Key from `WHISPER_API_KEY`, else `OPENAI_API_KEY`.
    pub fn key_from_env() -> Option<String> {
        ["WHISPER_API_KEY", "OPENAI_API_KEY"]
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    }
}

#[async_trait]
impl SpeechRecognizer for WhisperApiRecognizer {
    async fn transcribe(&self, audio: &Path) -> Result<Vec<TranscriptWord>, TranscriptionError> {
        let url = format!("{}/audio/transcriptions", self.base_url);
        let bytes = tokio::fs::read(audio)
            .await
            .map_err(|e| TranscriptionError::AudioRead(format!("{}: {e}", audio.display())))?;
        let file_name = audio
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.wav")
            .to_string();

        let file_part = multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/wav")
            .map_err(|e| TranscriptionError::ApiRequestFailed(format!("mime: {e}")))?;

        let mut form = multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "word")
            .part("file", file_part);
        if let Some(lang) = &self.language {
            form = form.text("language", lang.clone());
        }

        debug!(model = %self.model, "Sending audio to Whisper API");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| TranscriptionError::ApiRequestFailed(format!("request: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(TranscriptionError::ApiRequestFailed(format!(
                "status {status}: {body}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| TranscriptionError::ApiRequestFailed(format!("body: {e}")))?;
        let words = parse_words(&body)?;
        info!(words = words.len(), "Whisper transcription completed");
        Ok(words)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTranscript {
    Flat(Vec<TranscriptWord>),
    Words {
        words: Vec<TranscriptWord>,
    },
    Segments {
        segments: Vec<RawSegment>,
    },
}

#[derive(Debug, Deserialize)]
struct RawSegment {
    #[serde(default)]
    words: Vec<TranscriptWord>,
}

/// Parse any of the transcript shapes Whisper tools emit: a flat word list,
/// `{"words": [...]}` (verbose_json) or `{"segments": [{"words": [...]}]}`.
pub fn parse_words(raw: &str) -> Result<Vec<TranscriptWord>, TranscriptionError> {
    let parsed: RawTranscript = serde_json::from_str(raw)
        .map_err(|e| TranscriptionError::InvalidResponse(e.to_string()))?;
    let words = match parsed {
        RawTranscript::Flat(words) | RawTranscript::Words { words } => words,
        RawTranscript::Segments { segments } => {
            segments.into_iter().flat_map(|s| s.words).collect()
        }
    };
    Ok(clean_words(words))
}

fn clean_words(words: Vec<TranscriptWord>) -> Vec<TranscriptWord> {
    let before = words.len();
    let mut words: Vec<TranscriptWord> = words
        .into_iter()
        .filter(|w| w.start.is_finite() && w.end.is_finite() && w.end >= w.start)
        .map(|w| TranscriptWord {
            word: w.word.trim().to_string(),
            ..w
        })
        .filter(|w| !w.word.is_empty())
        .collect();
    if words.len() < before {
        warn!("Dropped {} malformed transcript words", before - words.len());
    }
    words.sort_by(|a, b| a.start.total_cmp(&b.start));
    words
}

/// Read a transcript JSON file dumped by an external Whisper run.
pub fn load_words(path: &Path) -> anyhow::Result<Vec<TranscriptWord>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read transcript at {}", path.display()))?;
    let words =
        parse_words(&raw).with_context(|| format!("parse transcript at {}", path.display()))?;
    info!("Loaded {} transcript words from {}", words.len(), path.display());
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_list_is_accepted() {
        let words = parse_words(r#"[{"word": " hello", "start": 0.0, "end": 0.4}]"#).unwrap();
        assert_eq!(words[0].word, "hello");
        assert_eq!(words[0].probability, 1.0);
    }

    #[test]
    fn verbose_json_words_are_accepted() {
        let raw = r#"{"text": "hi there", "words": [
            {"word": "there", "start": 0.5, "end": 0.9},
            {"word": "hi", "start": 0.0, "end": 0.3}
        ]}"#;
        let words = parse_words(raw).unwrap();
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].word, "hi");
    }

    #[test]
    fn segment_words_are_flattened() {
        let raw = r#"{"segments": [
            {"text": "a", "words": [{"word": "こんにちは", "start": 0.0, "end": 0.8, "probability": 0.9}]},
            {"text": "b"},
            {"text": "c", "words": [{"text": "また", "start": 1.0, "end": 1.2}]}
        ]}"#;
        let words = parse_words(raw).unwrap();
        assert_eq!(words.len(), 2);
        assert_eq!(words[1].word, "また");
        assert_eq!(words[0].probability, 0.9);
    }

    #[test]
    fn backwards_and_blank_words_are_dropped() {
        let raw = r#"[
            {"word": "ok", "start": 1.0, "end": 1.5},
            {"word": "bad", "start": 2.0, "end": 1.0},
            {"word": "  ", "start": 3.0, "end": 3.2}
        ]"#;
        let words = parse_words(raw).unwrap();
        assert_eq!(words.len(), 1);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(matches!(
            parse_words(r#"{"nope": 1}"#),
            Err(TranscriptionError::InvalidResponse(_))
        ));
    }

    #[test]
    fn load_words_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("words.json");
        fs::write(&path, r#"{"words": [{"word": "x", "start": 0.1, "end": 0.2}]}"#).unwrap();
        assert_eq!(load_words(&path).unwrap().len(), 1);
    }
}
