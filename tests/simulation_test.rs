//! Kernel behaviour through the simulation IO handlers
//!
//! These tests run the full stack (interface, kernel thread, event
//! loop) with no hardware attached; the simulation handlers answer the
//! wire protocol.

mod common;

use common::{run_on_loop, wait_until};
use parking_lot::Mutex;
use railhub::core::{EventLoop, SimulateInputAction, TriState, World};
use railhub::decoder::{Decoder, DecoderControllerExt, DecoderProtocol};
use railhub::input::{ConsumerId, InputController, CHANNEL_DEFAULT};
use railhub::interface::ecos::EcosInterface;
use railhub::interface::dccex::DccExInterface;
use railhub::interface::xpressnet::XpressNetInterface;
use railhub::interface::{Interface, InterfaceStatus, TransportConfig};
use railhub::logging::Logger;
use std::sync::Arc;
use std::time::Duration;

fn unused_transport() -> TransportConfig {
    TransportConfig::Tcp {
        host: "192.0.2.1".into(),
        port: 1,
    }
}

#[test]
fn xpressnet_input_simulation_single_callback() {
    let (event_loop, _thread) = EventLoop::spawn();
    let world = World::new();
    let mut config = railhub::protocol::xpressnet::KernelConfig::default();
    config.startup_delay_ms = 20;
    let interface = XpressNetInterface::new(
        "xn1",
        unused_transport(),
        config,
        event_loop.clone(),
        Logger::default(),
        world,
    );

    {
        let interface = interface.clone();
        run_on_loop(&event_loop, move || {
            interface.set_online(true, true).unwrap()
        });
    }
    assert!(wait_until(Duration::from_secs(2), || {
        interface.status() == InterfaceStatus::Online
    }));

    let consumer = ConsumerId::next();
    let input = {
        let interface = interface.clone();
        run_on_loop(&event_loop, move || {
            interface.get_input(CHANNEL_DEFAULT, 42, consumer).unwrap()
        })
    };
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    input.on_change(move |value| seen_clone.lock().push(value));

    interface.simulate_input_change(CHANNEL_DEFAULT, 42, SimulateInputAction::SetTrue);
    assert!(wait_until(Duration::from_secs(2), || !seen.lock().is_empty()));
    assert_eq!(*seen.lock(), vec![TriState::True]);

    // identical action again: no additional callback
    interface.simulate_input_change(CHANNEL_DEFAULT, 42, SimulateInputAction::SetTrue);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(*seen.lock(), vec![TriState::True]);

    interface.simulate_input_change(CHANNEL_DEFAULT, 42, SimulateInputAction::Toggle);
    assert!(wait_until(Duration::from_secs(2), || seen.lock().len() == 2));
    assert_eq!(*seen.lock(), vec![TriState::True, TriState::False]);
}

#[test]
fn dccex_sensor_transitions_reach_domain_in_order() {
    let (event_loop, _thread) = EventLoop::spawn();
    let world = World::new();
    let mut config = railhub::protocol::dccex::KernelConfig::default();
    config.startup_delay_ms = 20;
    let interface = DccExInterface::new(
        "dccex1",
        unused_transport(),
        config,
        event_loop.clone(),
        Logger::default(),
        world,
    );

    {
        let interface = interface.clone();
        run_on_loop(&event_loop, move || {
            interface.set_online(true, true).unwrap()
        });
    }
    assert!(wait_until(Duration::from_secs(2), || {
        interface.status() == InterfaceStatus::Online
    }));

    let consumer = ConsumerId::next();
    let input = {
        let interface = interface.clone();
        run_on_loop(&event_loop, move || {
            interface.get_input(CHANNEL_DEFAULT, 42, consumer).unwrap()
        })
    };
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    input.on_change(move |value| seen_clone.lock().push(value));

    // <Q 42> then <q 42>
    interface.simulate_input_change(CHANNEL_DEFAULT, 42, SimulateInputAction::SetTrue);
    interface.simulate_input_change(CHANNEL_DEFAULT, 42, SimulateInputAction::SetFalse);

    assert!(wait_until(Duration::from_secs(2), || seen.lock().len() == 2));
    assert_eq!(*seen.lock(), vec![TriState::True, TriState::False]);
}

#[test]
fn ecos_station_query_and_lazy_control() {
    let (event_loop, _thread) = EventLoop::spawn();
    let world = World::new();
    let mut config = railhub::protocol::ecos::KernelConfig::default();
    config.startup_delay_ms = 20;
    let interface = EcosInterface::new(
        "ecos1",
        unused_transport(),
        config,
        event_loop.clone(),
        Logger::default(),
        world,
    );

    {
        let interface = interface.clone();
        run_on_loop(&event_loop, move || {
            interface.set_online(true, true).unwrap()
        });
    }

    // The station answers queryObjects with two locomotives.
    assert!(wait_until(Duration::from_secs(2), || {
        interface.station_locomotives().len() == 2
    }));
    let locomotives = interface.station_locomotives();
    assert_eq!(locomotives[0].id, 1000);
    assert_eq!(locomotives[0].address, 3);
    assert_eq!(locomotives[1].id, 1001);
    assert_eq!(locomotives[1].address, 5);
    assert!(locomotives.iter().all(|loco| !loco.control_requested));

    // Attach a decoder for address 3 and drive it: control over the
    // station locomotive is requested lazily, only for that one.
    let decoder = Decoder::new("v100", DecoderProtocol::DccShort, 3, 128);
    {
        let interface = interface.clone();
        let decoder = decoder.clone();
        assert!(run_on_loop(&event_loop, move || {
            interface.add_decoder(&decoder)
        }));
    }
    {
        let decoder = decoder.clone();
        run_on_loop(&event_loop, move || decoder.set_throttle(0.5));
    }

    assert!(wait_until(Duration::from_secs(2), || {
        interface
            .station_locomotives()
            .iter()
            .any(|loco| loco.id == 1000 && loco.control_requested)
    }));
    assert!(!interface
        .station_locomotives()
        .iter()
        .any(|loco| loco.id == 1001 && loco.control_requested));

    // Feedback modules were discovered too; sensor injection flows back.
    let consumer = ConsumerId::next();
    let input = {
        let interface = interface.clone();
        run_on_loop(&event_loop, move || {
            interface.get_input(CHANNEL_DEFAULT, 5, consumer).unwrap()
        })
    };
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    input.on_change(move |value| seen_clone.lock().push(value));

    interface.simulate_input_change(CHANNEL_DEFAULT, 5, SimulateInputAction::SetTrue);
    assert!(wait_until(Duration::from_secs(2), || !seen.lock().is_empty()));
    assert_eq!(*seen.lock(), vec![TriState::True]);
}

#[test]
fn offline_detaches_kernel_and_reports_status() {
    let (event_loop, _thread) = EventLoop::spawn();
    let world = World::new();
    let mut config = railhub::protocol::xpressnet::KernelConfig::default();
    config.startup_delay_ms = 20;
    let interface = XpressNetInterface::new(
        "xn2",
        unused_transport(),
        config,
        event_loop.clone(),
        Logger::default(),
        world,
    );

    {
        let interface = interface.clone();
        run_on_loop(&event_loop, move || {
            interface.set_online(true, true).unwrap()
        });
    }
    assert!(wait_until(Duration::from_secs(2), || {
        interface.status() == InterfaceStatus::Online
    }));

    // going online twice is refused
    {
        let interface = interface.clone();
        assert!(run_on_loop(&event_loop, move || {
            interface.set_online(true, true).is_err()
        }));
    }

    {
        let interface = interface.clone();
        run_on_loop(&event_loop, move || {
            interface.set_online(false, true).unwrap()
        });
    }
    assert_eq!(interface.status(), InterfaceStatus::Offline);

    // and online again works
    {
        let interface = interface.clone();
        run_on_loop(&event_loop, move || {
            interface.set_online(true, true).unwrap()
        });
    }
    assert!(wait_until(Duration::from_secs(2), || {
        interface.status() == InterfaceStatus::Online
    }));
}
