use assert_cmd::Command;
use dialogue_sync::script::SectionKind;
use dialogue_sync::timeline::{SectionAudio, Timeline};
use dialogue_sync::timing::Cue;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

fn cmd(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("dialogue-sync").unwrap();
    cmd.current_dir(dir).env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("config.json");
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn config_show_merges_file_with_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), r#"{"timing": {"mode": "proportional"}}"#);
    cmd(dir.path())
        .args(["config", "--show", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""mode": "proportional""#))
        .stdout(predicate::str::contains(r#""min_match_ratio": 0.5"#));
}

#[test]
fn config_validate_rejects_zero_workers() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), r#"{"tts": {"workers": 0}}"#);
    cmd(dir.path())
        .args(["config", "--validate", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("workers"));
}

#[test]
fn subs_renders_srt_and_ass_from_cues() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "{}");
    let cues = vec![
        Cue {
            speaker: "カツミ".into(),
            text: "こんにちは".into(),
            start: 0.0,
            end: 0.8,
        },
        Cue {
            speaker: "ヒロシ".into(),
            text: "どうも".into(),
            start: 1.0,
            end: 2.5,
        },
    ];
    let cues_path = dir.path().join("cues.json");
    fs::write(&cues_path, serde_json::to_string(&cues).unwrap()).unwrap();

    cmd(dir.path())
        .args(["subs", "--out", "subs", "--title", "テスト", "--cues"])
        .arg(&cues_path)
        .arg("--config")
        .arg(&config)
        .assert()
        .success();

    let srt = fs::read_to_string(dir.path().join("subs/subtitles.srt")).unwrap();
    assert!(srt.contains("2\n00:00:01,000 --> 00:00:02,500\nどうも\n"));
    let ass = fs::read_to_string(dir.path().join("subs/subtitles.ass")).unwrap();
    assert!(ass.contains("★ テスト ★"));
    assert!(ass.contains("Dialogue: 3,0:00:01.00,0:00:02.50,Hiroshi,ヒロシ,0,0,0,,どうも"));
}

#[test]
fn chapters_prints_youtube_list() {
    let dir = tempfile::tempdir().unwrap();
    let section = |label: &str, kind: SectionKind, duration: f64| SectionAudio {
        label: label.to_string(),
        kind,
        audio: PathBuf::from("x.wav"),
        duration,
        cues: Vec::new(),
    };
    let timeline = Timeline::build(
        &[
            section("オープニング", SectionKind::Opening, 30.0),
            section(
                "第1位 繰り下げ受給",
                SectionKind::Ranking {
                    rank: 1,
                    title: "繰り下げ受給".into(),
                },
                62.0,
            ),
        ],
        Some((Path::new("jingle.wav"), 3.0)),
    );
    let path = dir.path().join("timeline.json");
    timeline.save(&path).unwrap();

    cmd(dir.path())
        .args(["chapters", "--timeline"])
        .arg(&path)
        .assert()
        .success()
        .stdout("0:00 オープニング\n0:30 第1位 繰り下げ受給\n");
}

#[test]
fn align_matches_transcript_to_script() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "{}");

    let audio = dir.path().join("voice.wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&audio, spec).unwrap();
    for _ in 0..8000 * 4 {
        writer.write_sample(0i16).unwrap();
    }
    writer.finalize().unwrap();

    let script = dir.path().join("script.json");
    fs::write(
        &script,
        r#"{"title": "t", "sections": [{"kind": "opening", "lines": [
            {"speaker": "カツミ", "text": "こんにちは！"},
            {"speaker": "ヒロシ", "text": "今日はいい天気ですね。"}
        ]}]}"#,
    )
    .unwrap();

    let words = dir.path().join("words.json");
    fs::write(
        &words,
        r#"{"segments": [{"words": [
            {"word": "こんにちは", "start": 0.2, "end": 1.0},
            {"word": "今日は", "start": 1.5, "end": 2.0},
            {"word": "いい天気ですね", "start": 2.0, "end": 3.1}
        ]}]}"#,
    )
    .unwrap();

    cmd(dir.path())
        .args(["align", "--out", "aligned", "--audio"])
        .arg(&audio)
        .arg("--script")
        .arg(&script)
        .arg("--words")
        .arg(&words)
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""matched": 2"#));

    let raw = fs::read_to_string(dir.path().join("aligned/cues.json")).unwrap();
    let cues: Vec<Cue> = serde_json::from_str(&raw).unwrap();
    assert_eq!(cues.len(), 2);
    assert!((cues[0].start - 0.2).abs() < 1e-9);
    assert!((cues[1].start - 1.5).abs() < 1e-9);
    assert!((cues[1].end - 3.1).abs() < 1e-9);
    assert!(dir.path().join("aligned/subtitles.ass").exists());
}

fn silent_wav(path: &Path, seconds: usize) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 8000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for _ in 0..8000 * seconds {
        writer.write_sample(0i16).unwrap();
    }
    writer.finalize().unwrap();
}

#[test]
fn align_with_timeline_keeps_lines_in_their_sections() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "{}");
    let audio = dir.path().join("voice.wav");
    silent_wav(&audio, 5);

    let cue = |speaker: &str, text: &str, start: f64, end: f64| Cue {
        speaker: speaker.into(),
        text: text.into(),
        start,
        end,
    };
    // Opening [0, 1], jingle [1, 2], 1st place [2, 4.5].
    let timeline = Timeline::build(
        &[
            SectionAudio {
                label: "オープニング".into(),
                kind: SectionKind::Opening,
                audio: PathBuf::from("opening.wav"),
                duration: 1.0,
                cues: vec![cue("カツミ", "こんにちは", 0.0, 0.5)],
            },
            SectionAudio {
                label: "第1位 繰り下げ受給".into(),
                kind: SectionKind::Ranking {
                    rank: 1,
                    title: "繰り下げ受給".into(),
                },
                audio: PathBuf::from("rank1.wav"),
                duration: 2.5,
                cues: vec![
                    cue("カツミ", "第1位は、繰り下げ受給です", 0.0, 1.2),
                    cue("ヒロシ", "なるほど", 1.5, 2.0),
                ],
            },
        ],
        Some((Path::new("jingle.wav"), 1.0)),
    );
    let timeline_path = dir.path().join("timeline.json");
    timeline.save(&timeline_path).unwrap();

    // "なるほど" is also heard over the jingle; it must not be used.
    let words = dir.path().join("words.json");
    fs::write(
        &words,
        r#"[
            {"word": "こんにちは", "start": 0.2, "end": 0.7},
            {"word": "なるほど", "start": 1.4, "end": 1.6},
            {"word": "第1位は", "start": 2.1, "end": 2.5},
            {"word": "繰り下げ受給です", "start": 2.5, "end": 3.2},
            {"word": "ナルホド", "start": 3.7, "end": 4.1}
        ]"#,
    )
    .unwrap();

    cmd(dir.path())
        .args(["align", "--out", "aligned", "--audio"])
        .arg(&audio)
        .arg("--timeline")
        .arg(&timeline_path)
        .arg("--words")
        .arg(&words)
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""matched": 3"#));

    let raw = fs::read_to_string(dir.path().join("aligned/cues.json")).unwrap();
    let cues: Vec<Cue> = serde_json::from_str(&raw).unwrap();
    assert_eq!(cues.len(), 3);
    assert!((cues[0].start - 0.2).abs() < 1e-9);
    assert!((cues[0].end - 0.7).abs() < 1e-9);
    assert!((cues[1].start - 2.1).abs() < 1e-9);
    assert!((cues[1].end - 3.2).abs() < 1e-9);
    assert!((cues[2].start - 3.7).abs() < 1e-9);
    assert!((cues[2].end - 4.1).abs() < 1e-9);

    let chapters = fs::read_to_string(dir.path().join("aligned/chapters.txt")).unwrap();
    assert_eq!(chapters, "0:00 オープニング\n0:01 第1位 繰り下げ受給\n");
}

#[test]
fn align_without_script_or_timeline_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "{}");
    cmd(dir.path())
        .args(["align", "--audio", "missing.wav", "--config"])
        .arg(&config)
        .assert()
        .failure();
}
