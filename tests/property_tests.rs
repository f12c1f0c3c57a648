use incubator::safety::SafetyMonitor;
use incubator::sensor::Reading;
use incubator::settings::{HumiditySettings, TemperatureSettings};
use incubator::subsystems::*;
use proptest::prelude::*;

fn temperature_on() -> TemperatureSettings {
    TemperatureSettings {
        enabled: true,
        ..TemperatureSettings::default()
    }
}

proptest! {
    #[test]
    fn temperature_holds_state_inside_band(
        start in prop_oneof![Just(98.0f32), Just(100.25f32)],
        samples in prop::collection::vec(99.6f32..100.19, 1..50),
    ) {
        let settings = temperature_on();
        let mut controller = TemperatureController::new();
        let initial = controller.step(Some(start), &settings, false);

        for t in samples {
            prop_assert_eq!(controller.step(Some(t), &settings, false), initial);
        }
    }

    #[test]
    fn humidity_holds_state_inside_band(
        start in prop_oneof![Just(40.0f32), Just(70.0f32)],
        samples in prop::collection::vec(55.0f32..64.99, 1..50),
    ) {
        let settings = HumiditySettings { enabled: true, ..HumiditySettings::default() };
        let mut controller = HumidityController::new();
        let initial = controller.step(Some(start), &settings, false);

        for h in samples {
            prop_assert_eq!(controller.step(Some(h), &settings, false), initial);
        }
    }

    #[test]
    fn cutoff_always_switches_heaters_off(
        history in prop::collection::vec(90.0f32..100.29, 0..20),
        hot in 100.3f32..150.0,
    ) {
        let settings = temperature_on();
        let mut controller = TemperatureController::new();
        let mut monitor = SafetyMonitor::new();
        let mut now = 0u64;

        for t in history.into_iter().chain(std::iter::once(hot)) {
            let reading = Reading {
                temperature_f: Some(t),
                humidity_pct: Some(60.0),
                secondary_temperature_f: None,
                secondary_failed: false,
                timestamp_ms: now,
            };
            let verdict = monitor.evaluate(Some(now), &reading, &settings);
            controller.step(reading.temperature_f, &settings, verdict.any());
            now += 5_000;
        }

        prop_assert!(monitor.last_verdict().cutoff_triggered);
        prop_assert_eq!(controller.state(), TemperatureState::SafetyLocked);
        prop_assert!(controller.relay_commands().iter().all(|c| !c.on));
    }
}
