//! Universe discovery end-to-end: a source announces its universes, the
//! source detector picks them up and later expires the silent source.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sacn::receiver::{ReceiverOptions, Receivers};
use sacn::source::{SourceConfig, SourceOptions, Sources, UniverseConfig};
use sacn::source_detector::{SourceDetectorConfig, SourceDetectorNotifications};
use sacn::{ComponentIdentifier, RemoteSourceHandle, UniverseId};

#[derive(Default)]
struct DetectorEvents {
    updated: Mutex<Vec<(String, Vec<u16>)>>,
    expired: Mutex<Vec<String>>,
}

impl SourceDetectorNotifications for DetectorEvents {
    fn source_updated(
        &self,
        _handle: RemoteSourceHandle,
        _cid: &ComponentIdentifier,
        name: &str,
        sourced_universes: &[u16],
    ) {
        self.updated.lock().unwrap().push((name.to_string(), sourced_universes.to_vec()));
    }

    fn source_expired(&self, _handle: RemoteSourceHandle, _cid: &ComponentIdentifier, name: &str) {
        self.expired.lock().unwrap().push(name.to_string());
    }
}

fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    predicate()
}

#[test]
fn detector_sees_and_expires_a_source() {
    let _ = pretty_env_logger::try_init();
    let receiver_options = ReceiverOptions {
        periodic_interval: Duration::from_millis(50),
        read_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let Ok(receivers) = Receivers::new(receiver_options, None) else {
        eprintln!("skipping: no usable network interfaces");
        return;
    };

    let events = Arc::new(DetectorEvents::default());
    let detector_config = SourceDetectorConfig {
        expiry: Duration::from_millis(1000),
        ..Default::default()
    };
    receivers.set_source_detector(&detector_config, Arc::clone(&events) as _).unwrap();

    let source_options = SourceOptions {
        universe_discovery_interval: Duration::from_millis(300),
        ..Default::default()
    };
    let Ok(sources) = Sources::new(source_options, None) else {
        return;
    };

    let universe = UniverseId::new(108).unwrap();
    let source = sources
        .create(&SourceConfig { name: "discovery test".into(), ..Default::default() })
        .unwrap();
    sources.add_universe(source, &UniverseConfig::new(universe)).unwrap();
    // Only universes with level data are announced.
    sources.update_levels(source, universe, Some(&[0; 512])).unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            events
                .updated
                .lock()
                .unwrap()
                .iter()
                .any(|(name, universes)| name == "discovery test" && universes == &[108])
        }),
        "the source's universe list was never discovered"
    );

    // A silent source expires after the detector's expiry window.
    drop(sources);
    assert!(
        wait_until(Duration::from_secs(4), || !events.expired.lock().unwrap().is_empty()),
        "the silent source never expired"
    );
    assert_eq!(events.expired.lock().unwrap()[0], "discovery test");

    receivers.remove_source_detector().unwrap();
}
