use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use bop_term::{
    AtomicPosition, BackoffIdleStrategy, ClientConductor, IdleStrategy, PublicationConfig,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CHANNEL: &str = "udp://localhost:40123";
const DEFAULT_STREAM_ID: i32 = 10;
const DEFAULT_MESSAGES: u64 = 10;
const MAX_OFFER_ATTEMPTS: u32 = 1_000_000;

struct Settings {
    channel: String,
    stream_id: i32,
    messages: u64,
    linger: Duration,
}

fn parse_args() -> anyhow::Result<Settings> {
    let args: Vec<String> = env::args().collect();
    let mut settings = Settings {
        channel: DEFAULT_CHANNEL.to_string(),
        stream_id: DEFAULT_STREAM_ID,
        messages: DEFAULT_MESSAGES,
        linger: Duration::ZERO,
    };

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--channel" | "-c", Some(value)) => settings.channel = value.clone(),
            ("--stream-id" | "-s", Some(value)) => {
                settings.stream_id = value.parse().context("stream id")?;
            }
            ("--messages" | "-m", Some(value)) => {
                settings.messages = value.parse().context("message count")?;
            }
            ("--linger-ms" | "-l", Some(value)) => {
                settings.linger = Duration::from_millis(value.parse().context("linger")?);
            }
            (flag, _) => bail!(
                "unexpected argument {flag:?}\nusage: basic_publisher [-c channel] [-s stream-id] [-m messages] [-l linger-ms]"
            ),
        }
        i += 2;
    }
    Ok(settings)
}

fn main() -> anyhow::Result<()> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(true)
        .compact();
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,bop_term=debug")),
        )
        .init();

    let settings = parse_args()?;
    let config = PublicationConfig {
        term_buffer_length: 64 * 1024,
        ..PublicationConfig::default()
    }
    .with_env_overrides()?;
    info!(channel = %settings.channel, stream_id = settings.stream_id, "publishing");

    let conductor = ClientConductor::new(config)?;
    let _cleaner = conductor.spawn_default_cleaner()?;

    // Stands in for the receiver-tracking side: one term window ahead of the publisher.
    let window = conductor.config().term_buffer_length as i64;
    let limit = Arc::new(AtomicPosition::new(window));
    let publication = conductor.add_publication(
        &settings.channel,
        settings.stream_id,
        std::process::id() as i32,
        limit.clone(),
    )?;

    let mut idle = BackoffIdleStrategy::default();
    for i in 0..settings.messages {
        let message = format!("Hello World! {i}");
        let mut attempts = 0;
        loop {
            match publication.offer(message.as_bytes()) {
                Ok(position) => {
                    info!(message = i, position, "offered");
                    limit.propose_max_ordered(position + window);
                    idle.reset();
                    break;
                }
                Err(err) if err.is_would_block() => {
                    attempts += 1;
                    if attempts >= MAX_OFFER_ATTEMPTS {
                        warn!(message = i, %err, "giving up on message");
                        break;
                    }
                    idle.idle(0);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    let metrics = publication.metrics();
    info!(
        offers = metrics.offers,
        rotations = metrics.rotations,
        would_block = metrics.would_block_total(),
        "done sending"
    );
    if !settings.linger.is_zero() {
        info!(linger_ms = settings.linger.as_millis() as u64, "lingering");
        std::thread::sleep(settings.linger);
    }
    publication.close();
    Ok(())
}
