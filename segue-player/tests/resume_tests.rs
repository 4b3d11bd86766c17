//! Saving and restoring player state across restarts

mod helpers;

use helpers::Rig;
use segue_common::events::PlaybackState;
use segue_common::settings::keys;
use segue_common::SettingsStore;
use segue_player::resume::ResumeState;
use segue_player::Error;
use std::path::Path;

const TRACK: &str = "http://radio.example/a";

/// Play for `ms`, optionally pause, save, and return the saved position
fn save_after(path: &Path, ms: u64, paused: bool) -> f64 {
    let mut rig = Rig::new();
    let a = rig.track(TRACK, 60);
    rig.enqueue(&[&a]);
    rig.player.play(None).unwrap();
    rig.run(ms);
    if paused {
        assert!(rig.player.pause());
    }
    let position = rig.player.time();
    rig.player.save_state(path).unwrap();
    position
}

fn restart(settings: SettingsStore) -> Rig {
    let mut rig = Rig::with_settings(settings);
    let a = rig.track(TRACK, 60);
    rig.enqueue(&[&a]);
    rig
}

#[test]
fn test_paused_session_resumes_paused_at_position() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("player.state");
    let saved = save_after(&path, 10_000, true);

    let mut rig = restart(SettingsStore::new());
    rig.player.set_volume(0.8).unwrap();
    assert!(rig.player.restore_state(&path).unwrap());
    // muted until the stream is ready
    assert_eq!(rig.player.volume(), 0.0);

    assert!(rig.run_until(500, |p| p.is_paused()));
    assert_eq!(rig.player.volume(), 0.8);
    assert!((rig.player.time() - saved).abs() < 0.01, "{} vs {}", rig.player.time(), saved);
    assert_eq!(rig.current_locator().as_deref(), Some(TRACK));
}

#[test]
fn test_playing_session_resumes_playing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("player.state");
    let saved = save_after(&path, 10_000, false);

    let mut rig = restart(SettingsStore::new());
    assert!(rig.player.restore_state(&path).unwrap());
    rig.run(500);

    assert!(rig.player.is_playing());
    assert_eq!(rig.player.volume(), 1.0);
    let elapsed = rig.player.time() - saved;
    assert!(elapsed > 0.4 && elapsed < 0.5, "{}", elapsed);
}

#[test]
fn test_resume_paused_setting_forces_pause() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("player.state");
    save_after(&path, 3_000, false);

    let settings = SettingsStore::new();
    settings.set(keys::RESUME_PAUSED, true).unwrap();
    let mut rig = restart(settings);
    assert!(rig.player.restore_state(&path).unwrap());
    assert!(rig.run_until(500, |p| p.is_paused()));
}

#[test]
fn test_resume_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("player.state");
    save_after(&path, 3_000, false);

    let settings = SettingsStore::new();
    settings.set(keys::RESUME_PLAYBACK, false).unwrap();
    let mut rig = restart(settings);
    assert!(!rig.player.restore_state(&path).unwrap());
    assert_eq!(rig.player.state(), PlaybackState::Stopped);
    assert_eq!(rig.player.queue().len(), 1);
}

#[test]
fn test_nothing_to_resume() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("player.state");

    let mut rig = restart(SettingsStore::new());
    assert!(!rig.player.restore_state(&path).unwrap());

    ResumeState {
        state: PlaybackState::Stopped,
        position: 0.0,
        playtime_stamp: None,
    }
    .save(&path)
    .unwrap();
    assert!(!rig.player.restore_state(&path).unwrap());
    assert_eq!(rig.player.state(), PlaybackState::Stopped);
}

#[test]
fn test_corrupt_state_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("player.state");
    std::fs::write(&path, "not json").unwrap();

    let mut rig = restart(SettingsStore::new());
    assert!(matches!(
        rig.player.restore_state(&path),
        Err(Error::ResumeState(_))
    ));
    assert_eq!(rig.player.volume(), 1.0);
}

#[test]
fn test_empty_queue_restores_volume() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("player.state");
    save_after(&path, 3_000, true);

    let mut rig = Rig::new();
    rig.player.set_volume(0.6).unwrap();
    assert!(!rig.player.restore_state(&path).unwrap());
    assert_eq!(rig.player.volume(), 0.6);
}
