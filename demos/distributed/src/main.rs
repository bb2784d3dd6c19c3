//! Echo a frame between two nodes executed by separate simulation contexts.
//!
//! Node 0 (at the origin) and node 1 (190km away) each carry three endpoints
//! and steer their second endpoint at one another. At 2s node 0 sends a single
//! 1024 byte frame to node 1, which echoes it back.
//!
//! With `--systems 2`, each node runs on its own thread with its own replica of
//! the topology. Threads advance in lockstep windows of `lookahead` and
//! exchange frames through in-process channels between windows. With
//! `--systems 1`, both nodes share a single context. Either way the frame
//! arrives at the same simulated instant.
//!
//! # Usage
//!
//! ```sh
//! cargo run --release -- --systems 2 --log-level debug
//! ```
//!
//! ```sh
//! cargo run --release -- --systems 1 --config link.yaml --metrics
//! ```

use beamlink::{
    config::{DataRate, MediumConfig},
    endpoint::Received,
    frame::ETHERTYPE_IPV4,
    mobility::{Fixed, Position},
    router::{Router, System},
    transport::{self, Inbox},
    Config, Event, Simulation,
};
use beamlink_scheduler::{
    at_secs_f64,
    deterministic::Scheduler,
    telemetry::{self, Format},
    Clock,
};
use bytes::Bytes;
use clap::{value_parser, Arg, ArgAction, Command};
use commonware_utils::SystemTimeExt;
use std::{
    sync::{Arc, Barrier},
    thread,
    time::{Duration, SystemTime},
};
use tracing::{info, warn};

/// Time at which node 0 sends its frame.
const START: f64 = 2.0;

/// Size of the echoed frame, header included.
const FRAME_SIZE: usize = 1024;

/// Interface steered at the peer on both nodes.
const STEERED: u32 = 1;

fn main() {
    // Parse arguments
    let matches = Command::new("beamlink-distributed")
        .about("echo a frame between nodes executed by separate contexts")
        .arg(
            Arg::new("systems")
                .long("systems")
                .required(false)
                .default_value("2")
                .value_parser(value_parser!(u32).range(1..=2))
                .help("Number of contexts (1 runs both nodes together)"),
        )
        .arg(
            Arg::new("stop")
                .long("stop")
                .required(false)
                .default_value("10")
                .value_parser(value_parser!(f64))
                .help("Simulated second at which to stop"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .required(false)
                .help("YAML file describing devices, queues and the medium"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .required(false)
                .default_value("info"),
        )
        .arg(Arg::new("json").long("json").action(ArgAction::SetTrue))
        .arg(
            Arg::new("metrics")
                .long("metrics")
                .action(ArgAction::SetTrue)
                .help("Print every context's metrics when done"),
        )
        .get_matches();

    // Configure logging
    let level = matches
        .get_one::<String>("log-level")
        .expect("log level has a default");
    let level = telemetry::parse_level(level).expect("Log level not well-formed");
    let format = if matches.get_flag("json") {
        Format::Json
    } else {
        Format::Plain
    };
    telemetry::init(level, format).expect("Failed to initialize logging");

    // Load configuration
    let config = match matches.get_one::<String>("config") {
        Some(path) => Config::load(path).expect("Failed to load config"),
        None => Config {
            device: beamlink::config::DeviceConfig {
                data_rate: DataRate::new(5_000_000).expect("data rate is positive"),
                ..Default::default()
            },
            medium: MediumConfig {
                lookahead: Duration::from_millis(2),
            },
            ..Default::default()
        },
    };
    let systems = *matches.get_one::<u32>("systems").expect("systems has a default");
    let stop = at_secs_f64(*matches.get_one::<f64>("stop").expect("stop has a default"));
    let print_metrics = matches.get_flag("metrics");
    info!(
        systems,
        data_rate = %config.device.data_rate,
        lookahead = ?config.medium.lookahead,
        "starting"
    );

    // Run
    let reports = if systems == 1 {
        let mut simulation = build(config, Router::Local, [0, 0]);
        simulation.run_until(stop);
        vec![simulation.encode_metrics()]
    } else {
        let lookahead = config.medium.lookahead;
        if lookahead.is_zero() {
            panic!("lookahead must be positive to run several contexts");
        }
        let barrier = Arc::new(Barrier::new(systems as usize));
        let handles: Vec<_> = transport::mesh(systems)
            .into_iter()
            .map(|(channel, inbox)| {
                let config = config.clone();
                let barrier = barrier.clone();
                thread::Builder::new()
                    .name(format!("context-{}", channel.system()))
                    .spawn(move || {
                        let router = Router::distributed(channel.system(), Box::new(channel));
                        let simulation = build(config, router, [0, 1]);
                        run_windows(simulation, inbox, &barrier, lookahead, stop)
                    })
                    .expect("Failed to spawn context")
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("context panicked"))
            .collect()
    };
    if print_metrics {
        for report in reports {
            println!("{report}");
        }
    }
}

/// Build one replica of the topology where node `n` runs in `systems[n]`.
fn build(config: Config, router: Router, systems: [System; 2]) -> Simulation {
    let mut simulation = Simulation::new(config, router).expect("Failed to build simulation");
    simulation
        .add_node(0, systems[0], Box::new(Fixed(Position::new(0.01, 0.0, 0.0))))
        .expect("Failed to add node 0");
    simulation
        .add_node(1, systems[1], Box::new(Fixed(Position::new(190_000.0, 0.0, 0.0))))
        .expect("Failed to add node 1");
    simulation
        .install(&[0, 1], 3)
        .expect("Failed to install endpoints");

    // Steer the second endpoint of each node at the other
    let client = simulation.interface(0, STEERED);
    let server = simulation.interface(1, STEERED);
    simulation.declare(0, client, 1);
    simulation.declare(1, server, 0);

    simulation.set_receive_callback(
        server,
        Box::new(move |scheduler: &mut Scheduler<Event>, received: &Received| {
            info!(
                at = ?scheduler.current().epoch(),
                from = %received.source,
                size = received.payload.len(),
                "server received request"
            );
            scheduler.schedule(
                Duration::ZERO,
                Event::Send {
                    endpoint: server,
                    destination: received.source,
                    ethertype: received.ethertype,
                    payload: received.payload.clone(),
                },
            );
        }),
    );
    simulation.set_receive_callback(
        client,
        Box::new(|scheduler: &mut Scheduler<Event>, received: &Received| {
            info!(
                at = ?scheduler.current().epoch(),
                from = %received.source,
                size = received.payload.len(),
                "client received reply"
            );
        }),
    );

    let destination = simulation.endpoint(server).address();
    let payload = Bytes::from(vec![0u8; FRAME_SIZE - beamlink::frame::HEADER_LEN]);
    simulation.schedule_send(
        at_secs_f64(START),
        client,
        destination,
        ETHERTYPE_IPV4,
        payload,
    );
    simulation
}

/// Advance `simulation` one lookahead window at a time until `stop`, waiting
/// for every other context at the end of each window.
fn run_windows(
    mut simulation: Simulation,
    mut inbox: Inbox,
    barrier: &Barrier,
    lookahead: Duration,
    stop: SystemTime,
) -> String {
    let mut bound = simulation.now() + lookahead;
    let mut executed = 0;
    loop {
        let window_end = bound.min(stop);
        executed += simulation.run_before(window_end);
        barrier.wait();

        // Every frame sent before `window_end` is now in the inbox
        for remote in inbox.drain() {
            match remote {
                Ok(remote) => simulation.accept(remote),
                Err(err) => warn!(?err, "skipping malformed remote frame"),
            }
        }
        if window_end >= stop {
            break;
        }
        bound += lookahead;
    }
    simulation.run_until(stop);
    info!(system = simulation.system(), executed, "context finished");
    simulation.encode_metrics()
}
