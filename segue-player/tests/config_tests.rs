//! Settings reactions and element providers on a live graph

mod helpers;

use helpers::Rig;
use segue_common::settings::keys;
use segue_common::SettingsStore;
use segue_player::backend::{Backend, NodeKind, NodeState};
use segue_player::engine::EngineVariant;
use segue_player::providers::{services, FactoryProvider};
use std::sync::Arc;

fn effects(rig: &Rig, factory: &str) -> Vec<segue_player::backend::NodeId> {
    rig.sim.nodes_of_kind(&NodeKind::Effect(factory.to_string()))
}

#[test]
fn test_stream_provider_applies_to_live_and_new_streams() {
    let mut rig = Rig::new();
    let a = rig.track("http://radio.example/a", 60);
    let b = rig.track("http://radio.example/b", 60);
    rig.player.play(Some(a)).unwrap();
    rig.run(100);

    rig.player.register_provider(
        services::STREAM_ELEMENT,
        Arc::new(FactoryProvider::new("eq", "equalizer", 10)),
    );
    let eq = effects(&rig, "equalizer");
    assert_eq!(eq.len(), 1);
    rig.run(50);
    assert_eq!(rig.sim.state(eq[0]), NodeState::Playing);
    assert!(rig.player.is_playing());

    rig.player.play(Some(b)).unwrap();
    assert_eq!(effects(&rig, "equalizer").len(), 1);
    assert!(!rig.sim.node_exists(eq[0]));

    assert!(rig.player.unregister_provider(services::STREAM_ELEMENT, "eq"));
    assert!(effects(&rig, "equalizer").is_empty());
    assert!(!rig.player.unregister_provider(services::STREAM_ELEMENT, "eq"));
}

#[test]
fn test_output_providers_are_ordered_by_priority() {
    let mut rig = Rig::new();
    rig.player.register_provider(
        services::POSTPROCESSING_ELEMENT,
        Arc::new(FactoryProvider::new("late", "compressor", 90)),
    );
    rig.player.register_provider(
        services::POSTPROCESSING_ELEMENT,
        Arc::new(FactoryProvider::new("early", "freeverb", 5)),
    );

    let early = effects(&rig, "freeverb")[0];
    let late = effects(&rig, "compressor")[0];
    assert!(rig.sim.is_linked(early, late));
}

#[test]
fn test_unbuildable_provider_is_skipped() {
    let mut rig = Rig::new();
    rig.sim.remove_factory("ladspa-missing");
    rig.player.register_provider(
        services::SINK_ELEMENT,
        Arc::new(FactoryProvider::new("broken", "ladspa-missing", 50)),
    );
    assert!(effects(&rig, "ladspa-missing").is_empty());

    let a = rig.track("http://radio.example/a", 60);
    rig.player.play(Some(a)).unwrap();
    rig.run(100);
    assert!(rig.player.is_playing());
}

#[test]
fn test_queue_duration_resizes_buffer() {
    let mut rig = Rig::new();
    let buffer = rig.player.engine().mixer().buffer();
    assert_eq!(
        rig.sim.property(buffer, "max-size-time").as_deref(),
        Some("100000000")
    );

    rig.settings.set(keys::QUEUE_DURATION, 250_i64).unwrap();
    rig.player.iterate();
    assert_eq!(
        rig.sim.property(buffer, "max-size-time").as_deref(),
        Some("250000000")
    );
}

#[test]
fn test_sink_options_reach_device() {
    let settings = SettingsStore::new();
    settings.set(keys::AUDIO_SINK, "alsa").unwrap();
    settings
        .set(&keys::sink_options("alsa"), vec!["device=hw:1", "bogus"])
        .unwrap();
    let mut rig = Rig::with_settings(settings);

    let sink = rig.player.engine().mixer().sink();
    assert_eq!(sink.preset().key, "alsa");
    let device = sink.device();
    assert_eq!(rig.sim.property(device, "device").as_deref(), Some("hw:1"));

    rig.settings
        .set(&keys::sink_options("alsa"), vec!["device=hw:2"])
        .unwrap();
    rig.player.iterate();
    assert_eq!(rig.sim.property(device, "device").as_deref(), Some("hw:2"));
}

#[test]
fn test_missing_sink_falls_back_to_auto() {
    let settings = SettingsStore::new();
    settings.set(keys::AUDIO_SINK, "pulse").unwrap();
    let clock = Arc::new(segue_player::clock::ManualClock::new());
    let sim = segue_player::backend::sim::SimBackend::new(clock.clone());
    sim.remove_factory("pulsesink");

    let player = segue_player::Player::new(Box::new(sim), clock, Arc::new(settings)).unwrap();
    assert_eq!(player.engine().mixer().sink().preset().key, "auto");
}

#[test]
fn test_engine_choice() {
    let settings = SettingsStore::new();
    settings.set(keys::ENGINE, "warp-drive").unwrap();
    let mut rig = Rig::with_settings(settings);
    assert_eq!(rig.player.engine().variant(), EngineVariant::Normal);

    // only read at startup
    rig.settings.set(keys::ENGINE, "unified").unwrap();
    rig.player.iterate();
    assert_eq!(rig.player.engine().variant(), EngineVariant::Normal);
}
