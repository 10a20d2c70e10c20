mod chat;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;

use courier::{Client, ClientConfig, Command, ConnectionState, SystemClock, UdpTransport};
use chat::{CHAT, HEARTBEAT, Printer};

#[derive(Parser)]
#[command(name = "courier-client")]
#[command(about = "Scripted courier test client")]
struct Args {
    #[arg(
        short,
        long,
        help = "Server address to connect to (e.g., 127.0.0.1:27020)"
    )]
    server: String,

    #[arg(long, default_value = "courier")]
    game_name: String,

    #[arg(long, default_value_t = 1)]
    game_version: u32,

    #[arg(short, long, default_value_t = courier::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 10, help = "Guaranteed chat messages to send")]
    messages: u32,

    #[arg(long, default_value_t = 500)]
    message_interval_ms: u64,

    #[arg(long, default_value_t = 10, help = "Stay connected this many seconds")]
    duration_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let server_addr: SocketAddr = args
        .server
        .parse()
        .with_context(|| format!("invalid server address {}", args.server))?;

    let config = ClientConfig {
        game_name: args.game_name.clone(),
        version: args.game_version,
        tick_rate: args.tick_rate,
        ..Default::default()
    };

    let transport = Arc::new(UdpTransport::bind("0.0.0.0:0")?);
    let client = Arc::new(Client::new(
        config,
        server_addr,
        transport.clone(),
        Arc::new(SystemClock),
    ));
    client.register_handler(Arc::new(Printer));

    let running = Arc::new(AtomicBool::new(true));
    let listeners = transport.spawn_listeners(1, client.clone(), running.clone())?;

    client.connect()?;
    let result = run(&client, &args);

    if client.state() != ConnectionState::Disconnected {
        client.disconnect()?;
    }
    running.store(false, Ordering::SeqCst);
    for listener in listeners {
        if listener.join().is_err() {
            log::warn!("Listener thread panicked");
        }
    }

    let stats = transport.stats();
    log::info!(
        "Sent {} packets ({} B), received {} packets ({} B)",
        stats.packets_sent,
        stats.bytes_sent,
        stats.packets_received,
        stats.bytes_received
    );

    result
}

fn run(client: &Client, args: &Args) -> Result<()> {
    let tick = client.config().tick_duration();
    let message_interval = Duration::from_millis(args.message_interval_ms);
    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);

    let mut sent_messages = 0;
    let mut last_message: Option<Instant> = None;

    while Instant::now() < deadline {
        let frame_start = Instant::now();

        if client.state() == ConnectionState::Disconnected {
            bail!(
                "disconnected: {}",
                client.close_reason().unwrap_or_else(|| "unknown".to_string())
            );
        }

        if client.is_ready() {
            let due = last_message.is_none_or(|at| at.elapsed() >= message_interval);
            if sent_messages < args.messages && due {
                let text = format!("message {} from {}", sent_messages, args.game_name);
                client.enqueue(Command::guaranteed(CHAT, text.into_bytes()));
                sent_messages += 1;
                last_message = Some(Instant::now());
            }
            client.enqueue(Command::unreliable(HEARTBEAT, Vec::new()));
        }

        client.update()?;

        thread::sleep(tick.saturating_sub(frame_start.elapsed()));
    }

    log::info!(
        "Sent {} messages, {} still unconfirmed",
        sent_messages,
        client.unconfirmed_len()
    );
    Ok(())
}
