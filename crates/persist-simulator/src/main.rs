//! Desktop simulator for the persist-core settings store.
//!
//! Runs the rotating-file store against a host directory instead of an SD
//! card and drives it through a scripted session:
//!
//! | Phase     | What happens                                        |
//! |-----------|-----------------------------------------------------|
//! | Configure | settings are edited while the machine is idle       |
//! | Machining | edits are refused and flushes deferred              |
//! | Idle      | pending edits are flushed, rate limited             |
//! | Card swap | the card is pulled and reinserted with edits queued |
//! | Reboot    | a fresh store reads back what was persisted         |
//!
//! Usage: `persist-simulator [DATA_DIR]` (default `./sim-card`).

mod std_fs;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::pubsub::{ImmediatePublisher, PubSubChannel, Subscriber};
use log::{error, info, warn};

use persist_core::clock::SystemTicks;
use persist_core::notify::{
    EXCEPTION_CHANNEL_CAPACITY, EXCEPTION_PUBLISHERS, EXCEPTION_SUBSCRIBERS, PersistException,
};
use persist_core::storage::RotatingFileStore;
use persist_core::{FlushOutcome, StoreConfig};

use crate::std_fs::StdFs;

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

/// Main loop period.
const TICK: Duration = Duration::from_millis(50);

/// Flush interval, shortened so the script finishes quickly.
const MIN_WRITE_INTERVAL_MS: u64 = 300;

/// Default location of the simulated card.
const DEFAULT_DATA_DIR: &str = "sim-card";

/// Settings table: slot, name, value written during the configure phase.
const SETTINGS: [(u32, &str, f32); 6] = [
    (0, "x.velocity_max", 12_000.0),
    (1, "y.velocity_max", 12_000.0),
    (2, "z.velocity_max", 1_200.0),
    (3, "x.travel_max", 300.0),
    (4, "y.travel_max", 250.0),
    (40, "spindle.dwell", 1.5),
];

type ExceptionChannel = PubSubChannel<
    CriticalSectionRawMutex,
    PersistException,
    EXCEPTION_CHANNEL_CAPACITY,
    EXCEPTION_SUBSCRIBERS,
    EXCEPTION_PUBLISHERS,
>;

type ExceptionPublisher<'a> = ImmediatePublisher<
    'a,
    CriticalSectionRawMutex,
    PersistException,
    EXCEPTION_CHANNEL_CAPACITY,
    EXCEPTION_SUBSCRIBERS,
    EXCEPTION_PUBLISHERS,
>;

type ExceptionSubscriber<'a> = Subscriber<
    'a,
    CriticalSectionRawMutex,
    PersistException,
    EXCEPTION_CHANNEL_CAPACITY,
    EXCEPTION_SUBSCRIBERS,
    EXCEPTION_PUBLISHERS,
>;

type SimStore<'a> = RotatingFileStore<StdFs, &'a AtomicBool, SystemTicks, ExceptionPublisher<'a>>;

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

/// Runs the controller's main loop for `ticks` periods, flushing and
/// draining exceptions like the firmware's idle task.
fn run_loop(store: &mut SimStore<'_>, exceptions: &mut ExceptionSubscriber<'_>, ticks: u32) {
    for _ in 0..ticks {
        match store.flush_tick() {
            FlushOutcome::Flushed { entries } => info!("Flushed {} settings", entries),
            FlushOutcome::Failed { failures } => warn!("Flush failed ({} in a row)", failures),
            FlushOutcome::Dropped { entries } => error!("Dropped {} pending settings", entries),
            FlushOutcome::Idle | FlushOutcome::RateLimited | FlushOutcome::Deferred => {}
        }

        while let Some(exception) = exceptions.try_next_message_pure() {
            warn!("Exception: {:?}", exception);
        }
        std::thread::sleep(TICK);
    }
}

fn edit(store: &mut SimStore<'_>, slot: u32, name: &str, value: f32) {
    match store.write(slot, value) {
        Ok(()) => info!("{} = {} ({} pending)", name, value, store.cache().len()),
        Err(e) => warn!("{} = {} rejected: {}", name, value, e),
    }
}

fn print_settings(store: &mut SimStore<'_>) {
    for (slot, name, _) in SETTINGS {
        match store.read(slot) {
            Ok(value) => info!("  [{:>3}] {:<16} {}", slot, name, value),
            Err(e) => warn!("  [{:>3}] {:<16} unreadable: {}", slot, name, e),
        }
    }
}

fn main() {
    env_logger::init();

    let data_dir = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
    info!("Starting persist simulator, card at {}", data_dir);

    let config = StoreConfig {
        min_write_interval_ms: MIN_WRITE_INTERVAL_MS,
        ..StoreConfig::default()
    };
    let moving = AtomicBool::new(false);
    let channel = ExceptionChannel::new();
    let Ok(mut exceptions) = channel.subscriber() else {
        error!("No subscriber slot on the exception channel");
        return;
    };

    let mut store = match RotatingFileStore::new(
        StdFs::new(&data_dir),
        &moving,
        SystemTicks,
        channel.immediate_publisher(),
        config,
    ) {
        Ok(store) => store,
        Err(e) => {
            error!("Invalid store configuration: {}", e);
            return;
        }
    };

    // --- Configure ---------------------------------------------------------
    info!("== Configure");
    for (slot, name, value) in SETTINGS {
        edit(&mut store, slot, name, value);
    }
    run_loop(&mut store, &mut exceptions, 10);
    // Same value as stored: nothing is staged
    edit(&mut store, 0, SETTINGS[0].1, SETTINGS[0].2);

    // --- Machining ---------------------------------------------------------
    info!("== Machining");
    moving.store(true, Ordering::Release);
    edit(&mut store, 3, "x.travel_max", 310.0);
    run_loop(&mut store, &mut exceptions, 10);
    moving.store(false, Ordering::Release);

    // --- Idle --------------------------------------------------------------
    info!("== Idle");
    edit(&mut store, 3, "x.travel_max", 310.0);
    edit(&mut store, 4, "y.travel_max", 260.0);
    run_loop(&mut store, &mut exceptions, 2);
    edit(&mut store, 2, "z.velocity_max", 1_000.0);
    run_loop(&mut store, &mut exceptions, 10);

    // --- Card swap ---------------------------------------------------------
    info!("== Card swap");
    edit(&mut store, 40, "spindle.dwell", 2.0);
    store.fs_mut().eject();
    run_loop(&mut store, &mut exceptions, 6);
    store.fs_mut().insert();
    run_loop(&mut store, &mut exceptions, 10);

    if let Err(e) = store.flush_now() {
        error!("Final flush failed: {}", e);
    }
    let fs = store.into_filesystem();

    // --- Reboot ------------------------------------------------------------
    info!("== Reboot");
    let mut store = match RotatingFileStore::new(
        StdFs::new(fs.root()),
        &moving,
        SystemTicks,
        channel.immediate_publisher(),
        config,
    ) {
        Ok(store) => store,
        Err(e) => {
            error!("Invalid store configuration: {}", e);
            return;
        }
    };
    print_settings(&mut store);

    info!("Simulator exiting");
}
