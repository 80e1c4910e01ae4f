use anyhow::{Context, bail};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::audio::{self, pcm16_spec};
use crate::cast::Cast;
use crate::keys::{ApiKey, KeyRing};
use crate::script::DialogueLine;

/// Sample rate of the PCM Gemini returns.
pub const GEMINI_SAMPLE_RATE: u32 = 24000;

/// Length of the silence that replaces a line whose synthesis failed.
pub const FALLBACK_SECONDS: f64 = 1.0;

const MAX_STAGGER: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("no API key available")]
    NoKey,
    #[error("request failed: {0}")]
    Request(String),
    #[error("api returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("response contained no audio")]
    EmptyAudio,
    #[error("tts engine failed: {0}")]
    Engine(String),
    #[error("could not write audio: {0}")]
    Output(String),
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn name(&self) -> &str;

    /// Whether requests must carry an API key from the key ring.
    fn needs_key(&self) -> bool {
        false
    }

    /// Render `text` spoken by `voice` into a WAV file at `out`.
    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        key: Option<&ApiKey>,
        out: &Path,
    ) -> Result<(), SynthesisError>;
}

/// Gemini text-to-speech over the REST `generateContent` endpoint.
pub struct GeminiSynthesizer {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl GeminiSynthesizer {
    pub fn new(base_url: String, model: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }

    fn request_body(text: &str, voice: &str) -> serde_json::Value {
        serde_json::json!({
            "contents": [{ "parts": [{ "text": text }] }],
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": voice }
                    }
                }
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
}

/// Base64 audio payload of the first candidate part that carries one.
fn extract_audio(response: &GenerateResponse) -> Result<Vec<u8>, SynthesisError> {
    let data = response
        .candidates
        .iter()
        .filter_map(|c| c.content.as_ref())
        .flat_map(|c| c.parts.iter())
        .find_map(|p| p.inline_data.as_ref())
        .ok_or(SynthesisError::EmptyAudio)?;
    let pcm = BASE64
        .decode(data.data.as_bytes())
        .map_err(|e| SynthesisError::Request(format!("invalid base64 audio: {e}")))?;
    if pcm.is_empty() {
        return Err(SynthesisError::EmptyAudio);
    }
    Ok(pcm)
}

#[async_trait]
impl SpeechSynthesizer for GeminiSynthesizer {
    fn name(&self) -> &str {
        "gemini"
    }

    fn needs_key(&self) -> bool {
        true
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        key: Option<&ApiKey>,
        out: &Path,
    ) -> Result<(), SynthesisError> {
        let key = key.ok_or(SynthesisError::NoKey)?;
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &key.value)
            .json(&Self::request_body(text, voice))
            .send()
            .await
            .map_err(|e| SynthesisError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(SynthesisError::Status { status, body });
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| SynthesisError::Request(format!("body: {e}")))?;
        let pcm = extract_audio(&parsed)?;
        audio::write_pcm16_wav(out, &pcm, GEMINI_SAMPLE_RATE, 1)
            .map_err(|e| SynthesisError::Output(format!("{e:#}")))?;
        debug!("Gemini wrote {} bytes of PCM to {}", pcm.len(), out.display());
        Ok(())
    }
}

/// Local Piper TTS. A voice ending in `.onnx` selects that model; any other
/// voice name uses the default model.
pub struct PiperSynthesizer {
    default_model: PathBuf,
}

impl PiperSynthesizer {
    pub fn new(default_model: PathBuf) -> Self {
        Self { default_model }
    }

    fn model_for(&self, voice: &str) -> PathBuf {
        if voice.ends_with(".onnx") {
            PathBuf::from(voice)
        } else {
            self.default_model.clone()
        }
    }
}

fn run_piper(model: &Path, text: &str, out_path: &Path) -> Result<(), SynthesisError> {
    let mut child = Command::new("piper")
        .arg("--model")
        .arg(model)
        .arg("--output_file")
        .arg(out_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| SynthesisError::Engine(format!("failed to spawn piper: {e}")))?;

    {
        let stdin = child
            .stdin
            .as_mut()
            .ok_or_else(|| SynthesisError::Engine("failed to open piper stdin".to_string()))?;
        stdin
            .write_all(text.as_bytes())
            .map_err(|e| SynthesisError::Engine(e.to_string()))?;
    }

    let status = child
        .wait()
        .map_err(|e| SynthesisError::Engine(e.to_string()))?;
    if !status.success() {
        error!("Piper TTS command failed for {}", out_path.display());
        return Err(SynthesisError::Engine(format!("piper exited with {status}")));
    }
    Ok(())
}

#[async_trait]
impl SpeechSynthesizer for PiperSynthesizer {
    fn name(&self) -> &str {
        "piper"
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        _key: Option<&ApiKey>,
        out: &Path,
    ) -> Result<(), SynthesisError> {
        let model = self.model_for(voice);
        let text = text.to_string();
        let out = out.to_path_buf();
        tokio::task::spawn_blocking(move || run_piper(&model, &text, &out))
            .await
            .map_err(|e| SynthesisError::Engine(format!("piper task panicked: {e}")))?
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisOptions {
    pub workers: usize,
    pub max_retries: u32,
    /// Start offset between workers so requests do not arrive in a burst.
    pub stagger: Duration,
    /// Wait before retry `n` is `retry_backoff * n`.
    pub retry_backoff: Duration,
    /// Sample rate of the mono 16-bit silence written for failed lines.
    pub fallback_sample_rate: u32,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            workers: 8,
            max_retries: 3,
            stagger: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(5),
            fallback_sample_rate: GEMINI_SAMPLE_RATE,
        }
    }
}

/// Synthesized audio of one script line.
#[derive(Debug, Clone, PartialEq)]
pub struct LineAudio {
    pub index: usize,
    pub speaker: String,
    pub text: String,
    pub path: PathBuf,
    pub duration: f64,
    /// False when the line was replaced by fallback silence.
    pub ok: bool,
}

/// Synthesize every line in parallel. Results come back in line order; a
/// line that fails all retries is replaced by one second of silence so the
/// dialogue keeps its shape.
pub async fn synthesize_dialogue(
    lines: &[DialogueLine],
    synth: Arc<dyn SpeechSynthesizer>,
    cast: &Cast,
    keys: Arc<KeyRing>,
    opts: &SynthesisOptions,
    dir: &Path,
) -> anyhow::Result<Vec<LineAudio>> {
    if synth.needs_key() && keys.is_empty() {
        bail!("{} backend needs API keys but none are configured", synth.name());
    }
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let workers = opts.workers.max(1).min(lines.len().max(1));
    info!(
        "Synthesizing {} lines with {} ({} workers)",
        lines.len(),
        synth.name(),
        workers
    );
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut tasks = JoinSet::new();

    for (index, line) in lines.iter().enumerate() {
        let voice = cast
            .voice_for(&line.speaker)
            .with_context(|| format!("no voice for speaker {}", line.speaker))?
            .to_string();
        let text = line.text.clone();
        let path = dir.join(format!("line_{index:04}.wav"));
        let synth = Arc::clone(&synth);
        let keys = Arc::clone(&keys);
        let semaphore = Arc::clone(&semaphore);
        let opts = opts.clone();
        let stagger = (opts.stagger * (index % workers) as u32).min(MAX_STAGGER);

        tasks.spawn(async move {
            sleep(stagger).await;
            let _permit = semaphore.acquire_owned().await;
            let ok = synthesize_with_retry(synth.as_ref(), &keys, &opts, index, &text, &voice, &path)
                .await;
            (index, path, ok)
        });
    }

    let mut outcomes: Vec<Option<(PathBuf, bool)>> = vec![None; lines.len()];
    let mut done = 0usize;
    while let Some(joined) = tasks.join_next().await {
        let (index, path, ok) = joined.context("tts task panicked")?;
        outcomes[index] = Some((path, ok));
        done += 1;
        if done % 20 == 0 || done == lines.len() {
            info!("TTS progress {}/{}", done, lines.len());
        }
    }

    let fallback_spec = pcm16_spec(opts.fallback_sample_rate, 1);

    let mut results = Vec::with_capacity(lines.len());
    let mut failures = 0usize;
    for (index, (line, outcome)) in lines.iter().zip(outcomes).enumerate() {
        let (path, ok) =
            outcome.with_context(|| format!("missing tts result for line {index}"))?;
        let duration = if ok {
            audio::wav_duration_seconds(&path)?
        } else {
            failures += 1;
            audio::write_silence(&path, FALLBACK_SECONDS, fallback_spec)?;
            FALLBACK_SECONDS
        };
        results.push(LineAudio {
            index,
            speaker: line.speaker.clone(),
            text: line.text.clone(),
            path,
            duration,
            ok,
        });
    }
    if failures > 0 {
        warn!("{} of {} lines fell back to silence", failures, lines.len());
    }
    info!("TTS finished: {}/{} lines", lines.len() - failures, lines.len());
    Ok(results)
}

async fn synthesize_with_retry(
    synth: &dyn SpeechSynthesizer,
    keys: &KeyRing,
    opts: &SynthesisOptions,
    index: usize,
    text: &str,
    voice: &str,
    path: &Path,
) -> bool {
    let mut key = if synth.needs_key() {
        keys.key_for(index).cloned()
    } else {
        None
    };

    for attempt in 1..=opts.max_retries.max(1) {
        debug!("TTS line {} attempt {}: {}", index, attempt, text);
        match synth.synthesize(text, voice, key.as_ref(), path).await {
            Ok(()) => return true,
            Err(e) => {
                warn!("TTS failed for line {} (attempt {}): {}", index, attempt, e);
                if let Some(current) = &key {
                    if matches!(e, SynthesisError::Status { .. }) {
                        keys.mark_failed(&current.name);
                    }
                    key = keys.next_working(&current.name).cloned();
                }
                if attempt < opts.max_retries {
                    sleep(opts.retry_backoff * attempt).await;
                }
            }
        }
    }
    error!("TTS gave up on line {}; inserting silence", index);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes a short tone whose length depends on the text; fails for
    /// texts containing "fail".
    struct FakeSynth {
        calls: AtomicUsize,
        needs_key: bool,
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeSynth {
        fn name(&self) -> &str {
            "fake"
        }

        fn needs_key(&self) -> bool {
            self.needs_key
        }

        async fn synthesize(
            &self,
            text: &str,
            _voice: &str,
            key: Option<&ApiKey>,
            out: &Path,
        ) -> Result<(), SynthesisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.needs_key && key.is_none() {
                return Err(SynthesisError::NoKey);
            }
            if text.contains("fail") {
                return Err(SynthesisError::Status {
                    status: 429,
                    body: "quota".into(),
                });
            }
            let samples = text.chars().count() * 100;
            let pcm: Vec<u8> = std::iter::repeat_n(1000i16.to_le_bytes(), samples)
                .flatten()
                .collect();
            audio::write_pcm16_wav(out, &pcm, 1000, 1)
                .map_err(|e| SynthesisError::Output(e.to_string()))
        }
    }

    fn lines(texts: &[&str]) -> Vec<DialogueLine> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| DialogueLine {
                speaker: if i % 2 == 0 { "カツミ" } else { "ヒロシ" }.to_string(),
                text: t.to_string(),
            })
            .collect()
    }

    fn fast_opts() -> SynthesisOptions {
        SynthesisOptions {
            workers: 2,
            max_retries: 2,
            stagger: Duration::ZERO,
            retry_backoff: Duration::ZERO,
            fallback_sample_rate: 1000,
        }
    }

    #[tokio::test]
    async fn results_keep_line_order_and_durations() {
        let dir = tempfile::tempdir().unwrap();
        let synth = Arc::new(FakeSynth { calls: AtomicUsize::new(0), needs_key: false });
        let out = synthesize_dialogue(
            &lines(&["abcdefghij", "abcde", "abc"]),
            synth,
            &Cast::default(),
            Arc::new(KeyRing::default()),
            &fast_opts(),
            dir.path(),
        )
        .await
        .unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].index, 1);
        assert!((out[0].duration - 1.0).abs() < 1e-9);
        assert!((out[1].duration - 0.5).abs() < 1e-9);
        assert!(out.iter().all(|l| l.ok));
    }

    #[tokio::test]
    async fn failing_line_becomes_silence_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let synth = Arc::new(FakeSynth { calls: AtomicUsize::new(0), needs_key: false });
        let out = synthesize_dialogue(
            &lines(&["hello", "please fail"]),
            synth.clone(),
            &Cast::default(),
            Arc::new(KeyRing::default()),
            &fast_opts(),
            dir.path(),
        )
        .await
        .unwrap();
        assert!(!out[1].ok);
        assert_eq!(out[1].duration, FALLBACK_SECONDS);
        assert!((audio::wav_duration_seconds(&out[1].path).unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(synth.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn key_backend_without_keys_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let synth = Arc::new(FakeSynth { calls: AtomicUsize::new(0), needs_key: true });
        let err = synthesize_dialogue(
            &lines(&["hello"]),
            synth,
            &Cast::default(),
            Arc::new(KeyRing::default()),
            &fast_opts(),
            dir.path(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("API keys"));
    }

    #[test]
    fn gemini_audio_is_decoded_from_first_inline_part() {
        let raw = serde_json::json!({
            "candidates": [{ "content": { "parts": [
                { "text": "ignored" },
                { "inlineData": { "mimeType": "audio/L16;rate=24000", "data": BASE64.encode([1u8, 0, 2, 0]) } }
            ]}}]
        });
        let parsed: GenerateResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(extract_audio(&parsed).unwrap(), vec![1, 0, 2, 0]);
    }

    #[test]
    fn gemini_response_without_audio_is_an_error() {
        let parsed: GenerateResponse = serde_json::from_str(r#"{"candidates": []}"#).unwrap();
        assert!(matches!(extract_audio(&parsed), Err(SynthesisError::EmptyAudio)));
    }

    #[test]
    fn gemini_request_names_the_voice() {
        let body = GeminiSynthesizer::request_body("こんにちは", "Kore");
        assert_eq!(
            body["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert_eq!(body["generationConfig"]["responseModalities"][0], "AUDIO");
    }

    #[test]
    fn piper_voice_selects_model() {
        let piper = PiperSynthesizer::new(PathBuf::from("default.onnx"));
        assert_eq!(piper.model_for("Kore"), PathBuf::from("default.onnx"));
        assert_eq!(piper.model_for("voices/ja.onnx"), PathBuf::from("voices/ja.onnx"));
    }
}
