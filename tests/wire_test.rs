//! Wire-level behaviour against captured transports
//!
//! A local TCP listener or UDP socket plays the command station, so the
//! exact frames a kernel emits can be asserted.

mod common;

use common::{run_on_loop, wait_until};
use parking_lot::Mutex;
use railhub::core::{EventLoop, World};
use railhub::decoder::{Decoder, DecoderControllerExt, DecoderProtocol};
use railhub::interface::dccex::DccExInterface;
use railhub::interface::loconet::LocoNetInterface;
use railhub::interface::z21::Z21Interface;
use railhub::interface::{Interface, TransportConfig};
use railhub::logging::Logger;
use railhub::output::{OutputController, OutputValue};
use std::io::Read;
use std::net::{TcpListener, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

/// Accepts one connection and collects everything it sends
fn spawn_line_collector(listener: TcpListener) -> Arc<Mutex<Vec<u8>>> {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let collected_clone = collected.clone();
    std::thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .ok();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => collected_clone.lock().extend_from_slice(&buf[..n]),
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(_) => break,
            }
        }
    });
    collected
}

fn lines(collected: &Arc<Mutex<Vec<u8>>>) -> Vec<String> {
    String::from_utf8_lossy(&collected.lock())
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn dccex_reconciliation_order_on_start() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let collected = spawn_line_collector(listener);

    let (event_loop, _thread) = EventLoop::spawn();
    let world = World::new();
    let mut config = railhub::protocol::dccex::KernelConfig::default();
    config.startup_delay_ms = 100;
    let interface = DccExInterface::new(
        "dccex-wire",
        TransportConfig::Tcp {
            host: "127.0.0.1".into(),
            port,
        },
        config,
        event_loop.clone(),
        Logger::default(),
        world.clone(),
    );

    // Two moving decoders, world powered and running, then start.
    let loco3 = Decoder::new("a", DecoderProtocol::DccShort, 3, 128);
    let loco5 = Decoder::new("b", DecoderProtocol::DccShort, 5, 128);
    {
        let interface = interface.clone();
        let (loco3, loco5) = (loco3.clone(), loco5.clone());
        let world = world.clone();
        run_on_loop(&event_loop, move || {
            assert!(interface.add_decoder(&loco3));
            assert!(interface.add_decoder(&loco5));
            loco3.set_throttle(0.5);
            loco5.set_throttle(0.25);
            world.run();
            interface.set_online(true, false).unwrap();
        });
    }

    assert!(wait_until(Duration::from_secs(3), || {
        lines(&collected).len() >= 5
    }));
    let lines = lines(&collected);
    // speed step mode, status probe, then exactly the reconciliation:
    // one power on, one speed frame per decoder, no emergency stop.
    assert_eq!(lines[0], "<D SPEED128>");
    assert_eq!(lines[1], "<s>");
    assert_eq!(lines[2], "<1>");
    assert_eq!(lines[3], "<t 3 63 1>");
    assert_eq!(lines[4], "<t 5 32 1>");
    assert_eq!(lines.iter().filter(|l| *l == "<1>").count(), 1);
    assert!(!lines.contains(&"<!>".to_string()));
}

#[test]
fn dccex_mirror_idempotence() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let collected = spawn_line_collector(listener);

    let (event_loop, _thread) = EventLoop::spawn();
    let world = World::new();
    let mut config = railhub::protocol::dccex::KernelConfig::default();
    config.startup_delay_ms = 50;
    let interface = DccExInterface::new(
        "dccex-idem",
        TransportConfig::Tcp {
            host: "127.0.0.1".into(),
            port,
        },
        config,
        event_loop.clone(),
        Logger::default(),
        world.clone(),
    );

    {
        let interface = interface.clone();
        run_on_loop(&event_loop, move || {
            interface.set_online(true, false).unwrap();
        });
    }
    assert!(wait_until(Duration::from_secs(3), || {
        lines(&collected).iter().any(|l| l == "<0>")
    }));

    // Two identical accessory writes produce one frame; so do two
    // identical power transitions.
    use railhub::protocol::dccex::kernel::CHANNEL_ACCESSORY;
    {
        let interface = interface.clone();
        run_on_loop(&event_loop, move || {
            assert!(interface.set_output_value(CHANNEL_ACCESSORY, 100, OutputValue::High));
            assert!(interface.set_output_value(CHANNEL_ACCESSORY, 100, OutputValue::High));
        });
    }
    {
        let world = world.clone();
        run_on_loop(&event_loop, move || {
            world.power_on();
            world.power_on();
        });
    }

    assert!(wait_until(Duration::from_secs(2), || {
        lines(&collected).iter().any(|l| l == "<1>")
    }));
    std::thread::sleep(Duration::from_millis(300));
    let lines = lines(&collected);
    assert_eq!(lines.iter().filter(|l| *l == "<a 100 1>").count(), 1);
    assert_eq!(lines.iter().filter(|l| *l == "<1>").count(), 1);
}

#[test]
fn z21_drive_emits_reference_datagram() {
    let station = UdpSocket::bind("127.0.0.1:0").unwrap();
    station
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let port = station.local_addr().unwrap().port();

    let (event_loop, _thread) = EventLoop::spawn();
    let world = World::new();
    let mut config = railhub::protocol::z21::KernelConfig::default();
    config.startup_delay_ms = 50;
    let interface = Z21Interface::new(
        "z21-wire",
        TransportConfig::Udp {
            host: "127.0.0.1".into(),
            port,
        },
        config,
        event_loop.clone(),
        Logger::default(),
        world.clone(),
    );

    let decoder = Decoder::new("v100", DecoderProtocol::DccLong, 3, 128);
    {
        let interface = interface.clone();
        let decoder = decoder.clone();
        let world = world.clone();
        run_on_loop(&event_loop, move || {
            assert!(interface.add_decoder(&decoder));
            world.run();
            interface.set_online(true, false).unwrap();
        });
    }

    // Drain the startup datagrams, then drive.
    std::thread::sleep(Duration::from_millis(400));
    let mut buf = [0u8; 64];
    while station.recv(&mut buf).is_ok() {}

    {
        let decoder = decoder.clone();
        run_on_loop(&event_loop, move || decoder.set_throttle(0.5));
    }

    // LAN_X_SET_LOCO_DRIVE, 128 steps, long address 3, forward step 63
    let expected = [0x0A, 0x00, 0x40, 0x00, 0xE4, 0x13, 0xC0, 0x03, 0xC0, 0xF4];
    let mut found = None;
    for _ in 0..20 {
        match station.recv(&mut buf) {
            Ok(n) if buf[..n] == expected => {
                found = Some(buf[..n].to_vec());
                break;
            }
            Ok(_) => continue,
            Err(_) => continue,
        }
    }
    assert_eq!(found.as_deref(), Some(&expected[..]));
}

#[test]
fn loconet_fast_clock_cadence() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let collected = spawn_line_collector(listener);

    let (event_loop, _thread) = EventLoop::spawn();
    let world = World::new();
    let mut config = railhub::protocol::loconet::KernelConfig::default();
    config.startup_delay_ms = 50;
    config.fast_clock_sync_enabled = true;
    config.fast_clock_sync_interval = 1;
    let interface = LocoNetInterface::new(
        "ln-clock",
        TransportConfig::Tcp {
            host: "127.0.0.1".into(),
            port,
        },
        config,
        event_loop.clone(),
        Logger::default(),
        world.clone(),
    );

    {
        let interface = interface.clone();
        run_on_loop(&event_loop, move || {
            interface.set_online(true, false).unwrap();
        });
    }

    // Collect for a bit more than two intervals after start.
    std::thread::sleep(Duration::from_millis(2650));
    let frames = collected.lock().clone();

    // Count fast clock writes: OPC_WR_SL_DATA (0xEF) with slot 0x7B.
    use railhub::protocol::loconet::messages::{FAST_CLOCK_SLOT, OPC_WR_SL_DATA};
    let mut count = 0;
    let mut i = 0;
    while i + 2 < frames.len() {
        if frames[i] == OPC_WR_SL_DATA && frames[i + 1] == 0x0E && frames[i + 2] == FAST_CLOCK_SLOT
        {
            count += 1;
            i += 14;
        } else {
            i += 1;
        }
    }
    assert_eq!(count, 2, "expected two fast clock frames, got {}", count);
}
