//! End-to-end handshake over the Unix transport: one process standing in for
//! both sides, with the helper's pages and the plugin's mapping genuinely
//! backed by the same memory.

#![cfg(all(unix, not(target_os = "macos")))]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use driftlink::ipc::{RegionClient, RegionServer};
use driftlink::plugin::{PluginEngine, StreamId};
use driftlink::shm::{DeviceState, HelperStatus, SharedLayout};

// One test function on purpose: the service name (and thus the socket path)
// is process-wide, so the phases have to run in order.
#[test]
fn handshake_lifecycle() {
    // Helper absent: lookup fails, nothing gets mapped.
    let mut client = RegionClient::new();
    let err = client.connect().expect_err("helper is not running yet");
    assert!(err.is_helper_absent(), "unexpected error: {err}");
    assert!(!client.is_connected());
    assert!(client.region().is_none());

    let mut plugin = PluginEngine::new();
    assert!(plugin.on_start_io().is_err(), "plugin start must fail too");
    assert_eq!(plugin.zero_timestamp(), (0.0, 0, 0));

    // Helper present: the region comes up initialized and the service is
    // exclusive — a second helper instance must be refused.
    let server = Arc::new(RegionServer::start().expect("register service"));
    assert!(server.size() >= size_of::<SharedLayout>());
    assert!(
        RegionServer::start().is_err(),
        "second registration must fail while the first helper lives"
    );

    let stop = Arc::new(AtomicBool::new(false));
    let loop_server = Arc::clone(&server);
    let loop_stop = Arc::clone(&stop);
    let message_loop = thread::spawn(move || loop_server.run_message_loop(&loop_stop));

    let region = client.connect().expect("handshake");
    assert!(client.is_connected());
    client.connect().expect("reconnect is a no-op");

    // The plugin maps but refuses to start until the helper reports Running.
    let helper_side = server.region();
    let err = plugin.on_start_io().expect_err("helper still Offline");
    assert!(err.is_helper_absent(), "unexpected error: {err}");

    helper_side.layout().set_helper_status(HelperStatus::Running);
    helper_side.layout().set_master_state(DeviceState::Running);
    plugin.on_start_io().expect("helper is running now");
    assert_eq!(region.layout().helper_status(), HelperStatus::Running);
    assert_eq!(region.layout().master_state(), DeviceState::Running);

    // Clock record crosses the mappings.
    helper_side.layout().clock().publish(4096.0, 77_000);
    let (sample_time, host_time, _seed) = plugin.zero_timestamp();
    assert_eq!(sample_time, 4096.0);
    assert_eq!(host_time, 77_000);

    // Input direction: helper produces, plugin serves it to its host.
    let payload = [0x5Au8; 256];
    assert!(helper_side.layout().master_input().write(&payload));
    let mut echo = [0u8; 256];
    plugin.read_client_input(StreamId::MasterInput, &mut echo);
    assert_eq!(echo, payload);

    // Underrun on the next read: the plugin host gets silence, not an error.
    let mut echo = [0xFFu8; 256];
    plugin.read_client_input(StreamId::MasterInput, &mut echo);
    assert!(echo.iter().all(|&b| b == 0));

    // Output direction: plugin writes, helper drains.
    plugin.write_mixed_output(StreamId::SlaveOutput, &payload);
    let mut echo = [0u8; 256];
    assert!(helper_side.layout().slave_output().read(&mut echo));
    assert_eq!(echo, payload);

    // Shutdown: status flips to Offline, the plugin observes it, and the
    // plugin unmaps before the helper releases the region.
    helper_side.layout().set_helper_status(HelperStatus::Offline);
    assert_eq!(region.layout().helper_status(), HelperStatus::Offline);
    assert!(plugin.on_start_io().is_err(), "restart refused once Offline");

    plugin.disconnect();
    client.disconnect();
    assert!(!client.is_connected());

    stop.store(true, Ordering::Relaxed);
    message_loop.join().expect("message loop exits");
    drop(server);

    // Deregistered: a late client is told the helper is not running.
    let mut late = RegionClient::new();
    let err = late.connect().expect_err("service is gone");
    assert!(err.is_helper_absent(), "unexpected error: {err}");
}

#[test]
fn stream_tags_round_trip() {
    for raw in 0..5u32 {
        let stream = StreamId::from_u32(raw).expect("known tag");
        assert_eq!(stream as u32, raw);
    }
    assert!(StreamId::from_u32(5).is_none());

    assert_eq!(PluginEngine::stream_latency(StreamId::MasterInput), 0);
    assert_eq!(PluginEngine::stream_latency(StreamId::MasterOutput), 0);
    assert_eq!(
        PluginEngine::stream_latency(StreamId::SlaveOutput),
        driftlink::SLAVE_STREAM_LATENCY_FRAMES
    );
}
