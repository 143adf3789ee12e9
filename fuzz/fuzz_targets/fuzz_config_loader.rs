#![no_main]
use libfuzzer_sys::fuzz_target;
use poolwatch_core::{Device, Timings, TopicScheme};

fuzz_target!(|data: &str| {
    // Parsing and validation must reject bad input without panicking.
    let Ok(cfg) = toml::from_str::<poolwatch_config::Config>(data) else {
        return;
    };
    if cfg.validate().is_err() {
        return;
    }
    // A validated config always maps onto buildable core types.
    assert!(Timings::from(&cfg).validate().is_ok());
    let topics = TopicScheme::from(&cfg.telemetry);
    for entry in &cfg.devices {
        let device = Device::from(entry);
        let topic = topics.topic_for_key(&device.topic_key);
        assert!(topic.starts_with(topics.prefix()));
        assert!(!topic.contains(['#', '+']));
    }
});
