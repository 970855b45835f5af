// Copyright (C) 2019  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Exercises the client against an in-process switch, through both backends.

use intnet_client::{
    transport::{request, ServiceTransport, Transport},
    Backend, Error, IntNetIf, OpenConfig, WaitStatus,
};
use intnet_core::{buf::BUF_HEADER_SIZE, GsoContext, GsoType};
use intnet_interface::{
    ffi::{CloseRequest, OpenRequest},
    InterfaceHandle, OpenFlags, Status, TrunkType,
};
use intnet_loopback_hosted::{LoopbackSwitch, ServiceHost};
use std::{
    fs,
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

fn frame(tag: u8, len: usize) -> Vec<u8> {
    let mut frame = vec![tag; len];
    frame[..6].copy_from_slice(&[0xff; 6]);
    frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, tag]);
    frame[12..14].copy_from_slice(&[0x88, 0xb5]);
    frame
}

fn open(backend: Backend, network: &str) -> IntNetIf {
    let intf = IntNetIf::open(&OpenConfig::new(backend, network)).unwrap();
    intf.set_active(true).unwrap();
    intf
}

fn drain_frames(intf: &IntNetIf) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    intf.drain(&mut |f: &[u8]| frames.push(f.to_vec()), None).unwrap();
    frames
}

/// Directory for the buffers and the socket of a switch, removed on drop.
struct Scratch(PathBuf);

impl Scratch {
    fn new(name: &str) -> Scratch {
        let dir = std::env::temp_dir()
            .join(format!("intnet-client-{}-{}", std::process::id(), name));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir(&dir).unwrap();
        Scratch(dir)
    }

    fn socket(&self) -> PathBuf {
        self.0.join("switch.sock")
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

#[test]
fn frames_flow_between_interfaces() {
    let _ = env_logger::try_init();
    let switch = Arc::new(LoopbackSwitch::new());
    let a = open(Backend::Driver(switch.clone()), "flow");
    let b = open(Backend::Driver(switch.clone()), "flow");
    assert_eq!(switch.interface_count("flow"), 2);
    assert_ne!(a.handle(), b.handle());

    let sent: Vec<_> = (1..=5).map(|n| frame(n, 60 + usize::from(n) * 100)).collect();
    for f in &sent {
        a.send_frame(f).unwrap();
    }

    assert_eq!(drain_frames(&b), sent);
    assert!(drain_frames(&a).is_empty());
    assert!(drain_frames(&b).is_empty());
}

#[test]
fn wait_reports_ready_and_timeout() {
    let switch = Arc::new(LoopbackSwitch::new());
    let a = open(Backend::Driver(switch.clone()), "wait");
    let b = open(Backend::Driver(switch.clone()), "wait");

    let start = Instant::now();
    assert_eq!(b.wait(50).unwrap(), WaitStatus::TimedOut);
    assert!(start.elapsed() >= Duration::from_millis(50));

    a.send_frame(&frame(1, 64)).unwrap();
    assert_eq!(b.wait(5_000).unwrap(), WaitStatus::Ready);
}

#[test]
fn pump_stops_promptly_on_abort() {
    let switch = Arc::new(LoopbackSwitch::new());
    let a = open(Backend::Driver(switch.clone()), "pump");
    let b = open(Backend::Driver(switch.clone()), "pump");
    let abort = b.abort_handle();

    let pump = thread::spawn(move || {
        let mut frames = Vec::new();
        let result = b.pump_packets(&mut |f: &[u8]| frames.push(f.to_vec()), None);
        result.map(|()| frames)
    });

    let sent: Vec<_> = (0..20).map(|n| frame(n, 100)).collect();
    for f in &sent {
        a.send_frame(f).unwrap();
    }
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    abort.abort().unwrap();
    let received = pump.join().unwrap().unwrap();
    // Far below the default wait timeout of the pump.
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(received, sent);
}

#[test]
fn permanent_abort_disallows_waits() {
    let switch = Arc::new(LoopbackSwitch::new());
    let intf = open(Backend::Driver(switch), "abort");
    let abort = intf.abort_handle();

    abort.abort_permanently().unwrap();
    assert!(intf
        .pump_packets(&mut |_: &[u8]| panic!("no frame expected"), None)
        .is_ok());
    assert!(matches!(intf.wait(10), Err(Error::WaitAborted)));
}

#[test]
fn interrupted_wait() {
    let switch = Arc::new(LoopbackSwitch::new());
    let intf = open(Backend::Driver(switch), "interrupt");
    intf.abort_handle().abort().unwrap();
    assert_eq!(intf.wait(5_000).unwrap(), WaitStatus::Interrupted);
    assert_eq!(intf.wait(10).unwrap(), WaitStatus::TimedOut);
}

#[test]
fn gso_frames_are_carved_or_passed_whole() {
    let switch = Arc::new(LoopbackSwitch::new());
    let a = open(Backend::Driver(switch.clone()), "gso");
    let b = open(Backend::Driver(switch.clone()), "gso");

    let context = GsoContext::new(GsoType::Ipv4Tcp, 14, 34, 54, 1000);
    let mut super_frame = frame(7, 54 + 2500);
    super_frame[14] = 0x45;
    super_frame[34 + 12] = 0x50;

    a.send_gso_frame(&context, &super_frame).unwrap();
    let segments = drain_frames(&b);
    let lens: Vec<_> = segments.iter().map(|s| s.len()).collect();
    assert_eq!(lens, vec![1054, 1054, 554]);
    for segment in &segments {
        assert_eq!(&segment[..14], &super_frame[..14]);
    }
    let payload: Vec<u8> = segments.iter().flat_map(|s| s[54..].to_vec()).collect();
    assert_eq!(&payload[..], &super_frame[54..]);

    a.send_gso_frame(&context, &super_frame).unwrap();
    let mut whole = Vec::new();
    let mut plain = 0;
    b.drain(
        &mut |_: &[u8]| plain += 1,
        Some(&mut |ctx: &GsoContext, f: &[u8]| whole.push((*ctx, f.to_vec()))),
    )
    .unwrap();
    assert_eq!(plain, 0);
    assert_eq!(whole, vec![(context, super_frame.clone())]);

    // Invalid contexts are dropped by the switch.
    let bad = GsoContext::new(GsoType::Ipv4Tcp, 14, 34, 54, 0);
    a.send_gso_frame(&bad, &super_frame).unwrap();
    assert!(drain_frames(&b).is_empty());
    assert_eq!(a.stats().unwrap().bad_frames, 1);
}

#[test]
fn drain_handles_every_kind_of_entry() {
    let switch = Arc::new(LoopbackSwitch::new());
    let intf = open(Backend::Driver(switch), "mixed-entries");

    let context = GsoContext::new(GsoType::Ipv4Tcp, 14, 34, 54, 1000);
    let mut super_frame = frame(5, 54 + 2500);
    super_frame[14] = 0x45;
    super_frame[34 + 12] = 0x50;

    {
        let buf = intf.buffer().unwrap();
        let mut ring = buf.recv();

        // First entry of a fresh ring, turned into an entry of unknown type.
        ring.write_frame(&[0x5a; 12]).unwrap();
        // SAFETY: The receive ring data starts right after the buffer header, and the type is
        // the upper byte of the little-endian first word of the entry header.
        unsafe {
            *buf.region().as_ptr().add(BUF_HEADER_SIZE as usize + 3) = 0x99;
        }

        ring.write_frame(&frame(1, 64)).unwrap();
        let skipped = ring.allocate_frame(40).unwrap();
        ring.abandon(skipped).unwrap();
        ring.write_gso_frame(&context, &super_frame).unwrap();
        let bad = GsoContext::new(GsoType::Ipv4Tcp, 14, 34, 54, 0);
        ring.write_gso_frame(&bad, &super_frame).unwrap();
        ring.write_frame(&frame(2, 80)).unwrap();
    }

    let mut received = Vec::new();
    let delivered = intf
        .drain(&mut |f: &[u8]| received.push(f.to_vec()), None)
        .unwrap();
    assert_eq!(delivered, 3);

    let lens: Vec<_> = received.iter().map(|f| f.len()).collect();
    assert_eq!(lens, vec![64, 1054, 1054, 554, 80]);
    assert_eq!(received[0], frame(1, 64));
    assert_eq!(received[4], frame(2, 80));
    assert_eq!(intf.stats().unwrap().bad_frames, 2);

    assert!(intf.buffer().unwrap().recv().is_empty());
    assert!(drain_frames(&intf).is_empty());
}

#[test]
fn output_frames() {
    let switch = Arc::new(LoopbackSwitch::new());
    let a = open(Backend::Driver(switch.clone()), "output");
    let b = open(Backend::Driver(switch.clone()), "output");

    let mut out = a.alloc_frame(200).unwrap();
    assert_eq!(out.len(), 200);
    out.payload_mut().copy_from_slice(&frame(3, 200));
    out.commit_partial(80).unwrap();

    let abandoned = a.alloc_frame(300).unwrap();
    drop(abandoned);

    let mut out = a.alloc_frame(64).unwrap();
    out.payload_mut().copy_from_slice(&frame(4, 64));
    out.commit().unwrap();
    a.send().unwrap();

    assert_eq!(drain_frames(&b), vec![frame(3, 200)[..80].to_vec(), frame(4, 64)]);
}

#[test]
fn inactive_interfaces_exchange_nothing() {
    let switch = Arc::new(LoopbackSwitch::new());
    let a = open(Backend::Driver(switch.clone()), "inactive");
    let b = open(Backend::Driver(switch.clone()), "inactive");

    b.set_active(false).unwrap();
    a.send_frame(&frame(1, 64)).unwrap();
    assert!(drain_frames(&b).is_empty());
    assert_eq!(b.stats().unwrap().lost_frames, 1);

    b.set_active(true).unwrap();
    a.set_active(false).unwrap();
    a.send_frame(&frame(2, 64)).unwrap();
    assert!(drain_frames(&b).is_empty());
}

#[test]
fn destroy_is_idempotent() {
    let switch = Arc::new(LoopbackSwitch::new());
    let mut a = open(Backend::Driver(switch.clone()), "destroy");
    let b = open(Backend::Driver(switch.clone()), "destroy");

    a.destroy().unwrap();
    assert!(!a.is_open());
    assert_eq!(switch.interface_count("destroy"), 1);
    a.destroy().unwrap();
    assert!(matches!(a.send_frame(&frame(1, 64)), Err(Error::Closed)));
    assert!(matches!(a.abort_handle().abort(), Err(Error::Closed)));

    drop(b);
    assert_eq!(switch.network_count(), 0);
}

#[test]
fn settings_reach_the_switch() {
    let switch = Arc::new(LoopbackSwitch::new());
    let intf = open(Backend::Driver(switch.clone()), "settings");
    let mac = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
    intf.set_mac_address(mac).unwrap();
    intf.set_promiscuous(true).unwrap();
    assert_eq!(switch.mac_address(intf.handle()), Some(mac));
    assert_eq!(switch.is_promiscuous(intf.handle()), Some(true));
}

#[test]
fn incompatible_network_rejected() {
    let switch = Arc::new(LoopbackSwitch::new());
    let config = OpenConfig::new(Backend::Driver(switch.clone()), "trunked")
        .with_trunk(TrunkType::NetFlt, "eth0");
    let _first = IntNetIf::open(&config).unwrap();

    let config = OpenConfig::new(Backend::Driver(switch.clone()), "trunked");
    match IntNetIf::open(&config) {
        Err(Error::Open { status, .. }) => assert_eq!(status, Status::INCOMPATIBLE_TRUNK),
        other => panic!("{:?}", other),
    }
    assert_eq!(switch.interface_count("trunked"), 1);
}

#[test]
fn service_backend() {
    let _ = env_logger::try_init();
    let scratch = Scratch::new("service");
    let switch = Arc::new(LoopbackSwitch::with_shared_files(&scratch.0));
    let host = ServiceHost::bind(switch.clone(), scratch.socket()).unwrap();

    let local = open(Backend::Driver(switch.clone()), "mixed");
    let remote = open(Backend::Service(host.path().to_owned()), "mixed");
    assert_eq!(switch.interface_count("mixed"), 2);

    local.send_frame(&frame(1, 500)).unwrap();
    assert_eq!(remote.wait(5_000).unwrap(), WaitStatus::Ready);
    assert_eq!(drain_frames(&remote), vec![frame(1, 500)]);

    remote.send_frame(&frame(2, 600)).unwrap();
    assert_eq!(drain_frames(&local), vec![frame(2, 600)]);

    let abort = remote.abort_handle();
    let pump = thread::spawn(move || {
        let mut frames = Vec::new();
        let result = remote.pump_packets(&mut |f: &[u8]| frames.push(f.to_vec()), None);
        result.map(|()| frames)
    });
    local.send_frame(&frame(3, 700)).unwrap();
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    abort.abort().unwrap();
    assert_eq!(pump.join().unwrap().unwrap(), vec![frame(3, 700)]);
    assert!(start.elapsed() < Duration::from_secs(5));

    // The remote interface has been dropped by the pump thread.
    assert_eq!(switch.interface_count("mixed"), 1);
    drop(local);
    drop(host);
}

#[test]
fn abort_after_the_service_closed_the_interface() {
    let scratch = Scratch::new("late-abort");
    let switch = Arc::new(LoopbackSwitch::with_shared_files(&scratch.0));
    let host = ServiceHost::bind(switch.clone(), scratch.socket()).unwrap();
    let transport = ServiceTransport::connect(host.path()).unwrap();

    let (status, opened) = request(
        &transport,
        &OpenRequest {
            session: transport.session(),
            network: "late-abort".to_owned(),
            trunk: String::new(),
            trunk_type: TrunkType::None,
            flags: OpenFlags::empty(),
            send_size: 0,
            recv_size: 0,
            handle: InterfaceHandle::INVALID,
        },
    )
    .unwrap();
    assert_eq!(status, Status::SUCCESS);

    // The pump thread closing the interface just before the abort reaches the service.
    let close = CloseRequest {
        session: transport.session(),
        handle: opened.handle,
    };
    assert_eq!(request(&transport, &close).unwrap().0, Status::SUCCESS);
    assert_eq!(switch.interface_count("late-abort"), 0);

    assert_eq!(transport.abort_wait(opened.handle, false).unwrap(), Status::SUCCESS);
    assert_eq!(transport.wait(opened.handle, 5_000).unwrap(), Status::INTERRUPTED);

    drop(transport);
    drop(host);
}

#[test]
fn auto_backend() {
    let scratch = Scratch::new("auto");
    let switch = Arc::new(LoopbackSwitch::with_shared_files(&scratch.0).driverless(true));
    let host = ServiceHost::bind(switch.clone(), scratch.socket()).unwrap();

    let backend = Backend::Auto {
        driver: switch.clone(),
        service: host.path().to_owned(),
    };
    let a = open(backend.clone(), "auto");
    let b = open(backend, "auto");
    a.send_frame(&frame(9, 128)).unwrap();
    assert_eq!(drain_frames(&b), vec![frame(9, 128)]);

    // Without the service, a driverless switch can't be reached.
    let backend = Backend::Auto {
        driver: switch.clone(),
        service: scratch.0.join("missing.sock"),
    };
    assert!(matches!(
        IntNetIf::open(&OpenConfig::new(backend, "auto")),
        Err(Error::Transport(_))
    ));
}

#[test]
fn lost_service_is_reported() {
    let scratch = Scratch::new("lost");
    let switch = Arc::new(LoopbackSwitch::with_shared_files(&scratch.0));
    let mut host = ServiceHost::bind(switch.clone(), scratch.socket()).unwrap();

    let intf = open(Backend::Service(host.path().to_owned()), "lost");
    host.shutdown();

    let start = Instant::now();
    let result = loop {
        match intf.set_active(true) {
            Ok(()) if start.elapsed() < Duration::from_secs(5) => {
                thread::sleep(Duration::from_millis(10))
            }
            other => break other,
        }
    };
    assert!(matches!(result, Err(Error::Deferred)));
    assert_eq!(switch.interface_count("lost"), 0);
}
