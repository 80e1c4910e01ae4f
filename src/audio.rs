use anyhow::{Context, anyhow, bail};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

/// Sample format the TTS backends emit: mono 16-bit PCM.
pub fn pcm16_spec(sample_rate: u32, channels: u16) -> WavSpec {
    WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

pub fn wav_duration_seconds(path: &Path) -> anyhow::Result<f64> {
    let reader = WavReader::open(path).with_context(|| format!("open wav {}", path.display()))?;
    let spec = reader.spec();
    let samples = reader.len();
    let frames = samples as f64 / spec.channels as f64;
    let duration = frames / spec.sample_rate as f64;
    Ok(duration)
}

/// Duration of any media file. WAV files are read directly; everything else
/// goes through ffprobe.
pub fn probe_duration(path: &Path) -> anyhow::Result<f64> {
    let is_wav = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("wav"));
    if is_wav {
        match wav_duration_seconds(path) {
            Ok(d) => return Ok(d),
            Err(e) => debug!("hound could not read {}: {e:#}; trying ffprobe", path.display()),
        }
    }

    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .context("failed to execute ffprobe")?;
    if !output.status.success() {
        bail!(
            "ffprobe failed for {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    let raw = String::from_utf8_lossy(&output.stdout);
    raw.trim()
        .parse::<f64>()
        .with_context(|| format!("unexpected ffprobe duration {:?}", raw.trim()))
}

pub fn write_silence(path: &Path, seconds: f64, spec: WavSpec) -> anyhow::Result<()> {
    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("create wav {}", path.display()))?;
    write_silent_frames(&mut writer, seconds, spec)?;
    writer.finalize()?;
    Ok(())
}

/// Wrap raw little-endian signed 16-bit PCM into a WAV file.
pub fn write_pcm16_wav(
    path: &Path,
    pcm: &[u8],
    sample_rate: u32,
    channels: u16,
) -> anyhow::Result<()> {
    if pcm.len() % 2 != 0 {
        warn!("odd PCM byte count {}; dropping trailing byte", pcm.len());
    }
    let mut writer = WavWriter::create(path, pcm16_spec(sample_rate, channels))
        .with_context(|| format!("create wav {}", path.display()))?;
    for pair in pcm.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
    }
    writer.finalize()?;
    Ok(())
}

/// Seconds of near-silent audio at the start of a WAV file. Scanning stops
/// at the first sample whose amplitude reaches `threshold` or after `max_ms`.
pub fn detect_leading_silence(path: &Path, threshold: i32, max_ms: u32) -> anyhow::Result<f64> {
    let mut reader =
        WavReader::open(path).with_context(|| format!("open wav {}", path.display()))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;
    let max_samples = (spec.sample_rate as u64 * max_ms as u64 / 1000) as usize * channels;

    let mut silent = 0usize;
    match spec.sample_format {
        SampleFormat::Int => {
            let shift = spec.bits_per_sample.saturating_sub(16) as u32;
            for sample in reader.samples::<i32>().take(max_samples) {
                let amplitude = (sample? >> shift).abs();
                if amplitude >= threshold {
                    break;
                }
                silent += 1;
            }
        }
        SampleFormat::Float => {
            let limit = threshold as f32 / i16::MAX as f32;
            for sample in reader.samples::<f32>().take(max_samples) {
                if sample?.abs() >= limit {
                    break;
                }
                silent += 1;
            }
        }
    }
    Ok((silent / channels) as f64 / spec.sample_rate as f64)
}

/// Concatenate WAV files of identical format, inserting `gap` seconds of
/// silence between inputs and `tail` seconds after the last one. Returns the
/// duration of the written file.
pub fn join_with_gaps(inputs: &[&Path], gap: f64, tail: f64, out: &Path) -> anyhow::Result<f64> {
    let Some(first) = inputs.first() else {
        bail!("no audio inputs to join");
    };
    let spec = WavReader::open(first)
        .with_context(|| format!("open wav {}", first.display()))?
        .spec();

    let mut writer =
        WavWriter::create(out, spec).with_context(|| format!("create wav {}", out.display()))?;
    for (i, input) in inputs.iter().enumerate() {
        let mut reader =
            WavReader::open(input).with_context(|| format!("open wav {}", input.display()))?;
        if reader.spec() != spec {
            bail!(
                "{} has format {:?}, expected {:?}",
                input.display(),
                reader.spec(),
                spec
            );
        }
        match spec.sample_format {
            SampleFormat::Int => {
                for sample in reader.samples::<i32>() {
                    writer.write_sample(sample?)?;
                }
            }
            SampleFormat::Float => {
                for sample in reader.samples::<f32>() {
                    writer.write_sample(sample?)?;
                }
            }
        }
        if i + 1 < inputs.len() {
            write_silent_frames(&mut writer, gap, spec)?;
        }
    }
    write_silent_frames(&mut writer, tail, spec)?;
    let frames = writer.duration();
    writer.finalize()?;
    Ok(frames as f64 / spec.sample_rate as f64)
}

const RESAMPLE_CHUNK: usize = 1024;

/// Rewrite a WAV in place in the `target` format (16-bit PCM). Channels are
/// averaged down to mono first, and a different sample rate goes through a
/// sinc resampler. Returns the new duration.
pub fn conform_wav(path: &Path, target: WavSpec) -> anyhow::Result<f64> {
    if target.sample_format != SampleFormat::Int || target.bits_per_sample != 16 {
        bail!("can only convert to 16-bit PCM, not {:?}", target);
    }
    let mut reader = WavReader::open(path).with_context(|| format!("open wav {}", path.display()))?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
        SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
    };
    drop(reader);

    let channels = spec.channels.max(1) as usize;
    let mono: Vec<f32> = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    let samples = if spec.sample_rate == target.sample_rate {
        mono
    } else {
        debug!(
            "resampling {} from {} Hz to {} Hz",
            path.display(),
            spec.sample_rate,
            target.sample_rate
        );
        resample(&mono, spec.sample_rate, target.sample_rate)?
    };

    let mut writer =
        WavWriter::create(path, target).with_context(|| format!("create wav {}", path.display()))?;
    for sample in &samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
        for _ in 0..target.channels.max(1) {
            writer.write_sample(value)?;
        }
    }
    writer.finalize()?;
    Ok(samples.len() as f64 / target.sample_rate as f64)
}

fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> anyhow::Result<Vec<f32>> {
    use rubato::{
        Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
    };

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| anyhow!("resampler init: {e}"))?;

    let expected_len = (samples.len() as f64 * ratio).round() as usize;
    let mut output = Vec::with_capacity(expected_len + RESAMPLE_CHUNK);
    // One extra chunk of silence pushes the delayed tail out of the filter.
    let flush = [0.0f32; RESAMPLE_CHUNK];
    for chunk in samples.chunks(RESAMPLE_CHUNK).chain(std::iter::once(&flush[..])) {
        let mut input = chunk.to_vec();
        input.resize(RESAMPLE_CHUNK, 0.0);
        let result = resampler
            .process(&[input], None)
            .map_err(|e| anyhow!("resample: {e}"))?;
        if let Some(channel) = result.first() {
            output.extend_from_slice(channel);
        }
    }
    let delay = resampler.output_delay().min(output.len());
    output.drain(..delay);
    output.resize(expected_len, 0.0);
    Ok(output)
}

fn write_silent_frames<W>(writer: &mut WavWriter<W>, seconds: f64, spec: WavSpec) -> anyhow::Result<()>
where
    W: std::io::Write + std::io::Seek,
{
    let frames = (seconds.max(0.0) * spec.sample_rate as f64).round() as u64;
    let samples = frames * spec.channels as u64;
    match spec.sample_format {
        SampleFormat::Int => {
            for _ in 0..samples {
                writer.write_sample(0i32)?;
            }
        }
        SampleFormat::Float => {
            for _ in 0..samples {
                writer.write_sample(0.0f32)?;
            }
        }
    }
    Ok(())
}
