use std::path::Path;

use splicer_core::{
    assets::{LengthCache, probe_duration, probe_lengths, scan_audio_files},
    engine::EngineClient,
    fixtures::{ScriptedEngine, instant_poll_policy},
    measure::fill_lengths,
    sequencer::RenderTrack,
};
use tempfile::tempdir;

fn write_test_wav(path: &Path, seconds: f32) {
    let sample_rate = 48_000_u32;
    let frame_count = (seconds * sample_rate as f32).round() as usize;
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec).expect("test wav should be creatable");
    for frame in 0..frame_count {
        let phase = frame as f32 / sample_rate as f32 * 220.0 * std::f32::consts::TAU;
        let sample = (phase.sin() * 0.5 * f32::from(i16::MAX)).round() as i16;
        writer
            .write_sample(sample)
            .expect("test wav sample write should succeed");
    }
    writer.finalize().expect("test wav finalize should succeed");
}

#[test]
fn local_probe_reads_wav_duration() {
    let temp = tempdir().expect("tempdir should be creatable");
    let path = temp.path().join("tone.wav");
    write_test_wav(&path, 1.5);

    let duration = probe_duration(&path).expect("probe should succeed");
    assert!((duration - 1.5).abs() < 1e-3, "got {duration}");
}

#[test]
fn probe_lengths_only_fills_missing_entries() {
    let temp = tempdir().expect("tempdir should be creatable");
    let path = temp.path().join("tone.wav");
    write_test_wav(&path, 0.5);

    let mut tracks = vec![
        RenderTrack::new(&path),
        RenderTrack::with_length(temp.path().join("missing.wav"), 42.0),
    ];
    let probed = probe_lengths(&mut tracks).expect("probe should succeed");
    assert_eq!(probed, 1);
    assert_eq!(tracks[1].length, Some(42.0));
}

#[test]
fn scan_finds_audio_in_path_order() {
    let temp = tempdir().expect("tempdir should be creatable");
    std::fs::create_dir_all(temp.path().join("b")).expect("subdir should be creatable");
    write_test_wav(&temp.path().join("b").join("two.wav"), 0.1);
    write_test_wav(&temp.path().join("a-one.WAV"), 0.1);
    std::fs::write(temp.path().join("notes.txt"), "not audio").expect("text file writes");

    let tracks = scan_audio_files(temp.path()).expect("scan should succeed");
    let names: Vec<String> = tracks
        .iter()
        .map(|track| {
            track
                .file
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or_default()
                .to_string()
        })
        .collect();
    assert_eq!(names, vec!["a-one.WAV", "two.wav"]);
    assert!(tracks.iter().all(|track| track.length.is_none()));
}

#[test]
fn cached_lengths_skip_the_engine() {
    let temp = tempdir().expect("tempdir should be creatable");
    let audio = temp.path().join("tone.wav");
    write_test_wav(&audio, 0.25);
    let cache_path = temp.path().join("cache").join("lengths.json");

    let scripted = ScriptedEngine::new().with_length(&audio, 0.25);
    let mut engine = EngineClient::new(scripted.transport());
    let mut tracks = vec![RenderTrack::new(&audio)];
    let mut cache = LengthCache::open(&cache_path);
    let measured = fill_lengths(
        &mut engine,
        &mut tracks,
        &instant_poll_policy(),
        Some(&mut cache),
    )
    .expect("first pass measures");
    assert_eq!(measured, 1);
    assert!(cache_path.is_file());

    let sent_after_first = scripted.sent().len();
    let mut reopened = LengthCache::open(&cache_path);
    assert_eq!(reopened.len(), 1);
    let mut tracks = vec![RenderTrack::new(&audio)];
    let measured = fill_lengths(
        &mut engine,
        &mut tracks,
        &instant_poll_policy(),
        Some(&mut reopened),
    )
    .expect("second pass hits the cache");
    assert_eq!(measured, 0);
    assert_eq!(tracks[0].length, Some(0.25));
    assert_eq!(scripted.sent().len(), sent_after_first);
}

#[test]
fn corrupt_cache_starts_empty() {
    let temp = tempdir().expect("tempdir should be creatable");
    let cache_path = temp.path().join("lengths.json");
    std::fs::write(&cache_path, "{ not json").expect("corrupt cache writes");
    assert!(LengthCache::open(&cache_path).is_empty());
}

#[test]
fn saving_the_cache_replaces_the_file_without_leftovers() {
    let temp = tempdir().expect("tempdir should be creatable");
    let audio = temp.path().join("tone.wav");
    write_test_wav(&audio, 0.5);
    let cache_dir = temp.path().join("cache");
    let cache_path = cache_dir.join("lengths.json");

    let mut cache = LengthCache::open(&cache_path);
    cache.save().expect("empty cache saves");
    cache.insert(&audio, 0.5).expect("audio hashes");
    cache.save().expect("cache saves again");

    let entries: Vec<_> = std::fs::read_dir(&cache_dir)
        .expect("cache dir lists")
        .collect();
    assert_eq!(entries.len(), 1, "only the cache file remains");
    assert_eq!(LengthCache::open(&cache_path).get(&audio).expect("lookup"), Some(0.5));
}
