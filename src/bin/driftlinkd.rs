use std::env;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{error, info};

use driftlink::engine::HelperEngine;
use driftlink::ipc::RegionServer;
use driftlink::{DEFAULT_FLX4_UID, DEFAULT_PUSH_UID};

static SHOULD_QUIT: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHOULD_QUIT.store(true, Ordering::Relaxed);
}

fn usage() -> ! {
    println!(
        "Usage: driftlinkd [--push-uid <uid>] [--flx4-uid <uid>]\n\n\
         Bridges the Push (clock master) and FLX4 (clock slave) USB devices\n\
         into the shared region served to the audio-daemon plugin.\n\
         Device UIDs come from `system_profiler SPAudioDataType`."
    );
    process::exit(0);
}

fn main() {
    tracing_subscriber::fmt::init();

    let mut push_uid = DEFAULT_PUSH_UID.to_owned();
    let mut flx4_uid = DEFAULT_FLX4_UID.to_owned();

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--push-uid" => match args.next() {
                Some(value) => push_uid = value,
                None => {
                    eprintln!("driftlinkd: --push-uid requires a value");
                    process::exit(1);
                }
            },
            "--flx4-uid" => match args.next() {
                Some(value) => flx4_uid = value,
                None => {
                    eprintln!("driftlinkd: --flx4-uid requires a value");
                    process::exit(1);
                }
            },
            "--help" | "-h" => usage(),
            other => {
                eprintln!("driftlinkd: unknown argument '{other}'");
                process::exit(1);
            }
        }
    }

    let handler = on_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }

    let server = match RegionServer::start() {
        Ok(server) => Arc::new(server),
        Err(err) => {
            error!(%err, "failed to start region server");
            process::exit(1);
        }
    };

    let mut engine = HelperEngine::new(server.region(), push_uid, flx4_uid);
    if let Err(err) = engine.start() {
        error!(%err, "failed to start audio engine");
        process::exit(1);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let loop_server = Arc::clone(&server);
    let loop_stop = Arc::clone(&stop);
    let message_loop = thread::spawn(move || loop_server.run_message_loop(&loop_stop));

    info!("helper daemon running, waiting for plugin connections");
    while !SHOULD_QUIT.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
    }

    info!("shutting down");
    engine.stop();
    stop.store(true, Ordering::Relaxed);
    if message_loop.join().is_err() {
        error!("message loop panicked during shutdown");
    }
    drop(engine);
    drop(server);

    info!("helper daemon exited cleanly");
}
