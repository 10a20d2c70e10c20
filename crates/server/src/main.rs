mod relay;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;

use courier::{Command, PacketLossSimulation, Server, ServerConfig, ServerEvent};
use relay::{Greeter, HEARTBEAT, Relay};

const STATS_INTERVAL: Duration = Duration::from_secs(10);
// Well under the client's liveness timeout.
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "courier-server")]
#[command(about = "Courier relay server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = courier::DEFAULT_PORT)]
    port: u16,

    #[arg(long, default_value = "courier")]
    game_name: String,

    #[arg(long, default_value_t = 1)]
    game_version: u32,

    #[arg(short, long, default_value_t = 32)]
    max_clients: usize,

    #[arg(short, long, default_value_t = courier::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(long, default_value_t = 2)]
    io_threads: usize,

    #[arg(long, default_value_t = 200, help = "Control message resend interval in ms")]
    resend_interval_ms: u64,

    #[arg(long, default_value_t = 2000, help = "Liveness timeout in ms")]
    timeout_ms: u64,

    #[arg(long, help = "Enable outgoing packet loss simulation")]
    simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, help = "Stop after this many seconds")]
    duration_secs: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let bind_addr = format!("{}:{}", args.bind, args.port);

    let packet_loss = args.simulate_packet_loss.then(|| PacketLossSimulation {
        enabled: true,
        loss_percent: args.loss_percent,
    });

    let config = ServerConfig {
        game_name: args.game_name,
        version: args.game_version,
        max_clients: args.max_clients,
        tick_rate: args.tick_rate,
        io_threads: args.io_threads,
        resend_interval: Duration::from_millis(args.resend_interval_ms),
        liveness_timeout: Duration::from_millis(args.timeout_ms),
        packet_loss,
        ..Default::default()
    };

    let server = Server::bind(&bind_addr, config)?;
    server.register_handler(Arc::new(Relay::new(server.sender().clone())));
    server.add_connection_listener(Arc::new(Greeter::new(server.sender().clone())));
    server.start()?;

    run(&server, args.duration_secs.map(Duration::from_secs));

    log::info!("Server shutting down");
    server.shutdown();
    Ok(())
}

fn run(server: &Server, duration: Option<Duration>) {
    let running = server.running();
    let tick = server.config().tick_duration();
    let started = Instant::now();
    let mut last_stats = Instant::now();
    let mut last_keepalive = Instant::now();

    while running.load(Ordering::SeqCst) {
        let frame_start = Instant::now();

        if last_keepalive.elapsed() >= KEEPALIVE_INTERVAL {
            last_keepalive = Instant::now();
            server.broadcast(Command::unreliable(HEARTBEAT, Vec::new()));
        }

        server.flush();

        for event in server.drain_events() {
            match event {
                ServerEvent::ClientConnected { client_id, addr } => {
                    log::info!("Client {} connected from {}", client_id, addr);
                }
                ServerEvent::ClientDisconnected { client_id, reason } => {
                    log::info!("Client {} {}", client_id, reason.as_str());
                }
                ServerEvent::ConnectionDenied { addr, reason } => {
                    log::warn!("Connection denied to {}: {}", addr, reason);
                }
                ServerEvent::ProtocolViolation { addr, message } => {
                    log::warn!("Protocol violation from {}: {}", addr, message);
                }
            }
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            last_stats = Instant::now();
            let stats = server.stats();
            if let Some(network) = stats.network {
                log::info!(
                    "{} clients, {} pending | sent {} pkts / {} B, received {} pkts / {} B",
                    stats.connections,
                    stats.pending,
                    network.packets_sent,
                    network.bytes_sent,
                    network.packets_received,
                    network.bytes_received
                );
            }
        }

        if duration.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }

        thread::sleep(tick.saturating_sub(frame_start.elapsed()));
    }
}
