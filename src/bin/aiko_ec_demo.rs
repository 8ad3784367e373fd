use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use aiko::actor::Actor;
use aiko::bus::LoopbackBroker;
use aiko::config::RuntimeConfig;
use aiko::ec::{ChangeKind, Consumer, ConsumerOptions, Filter, Producer, Share, Value};
use aiko::scheduler::Message;
use aiko::Runtime;

/// Runs an EC producer and consumer over an in-process bus and prints the
/// consumer's mirror when done.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON runtime config (AIKO_* environment variables are applied on top)
    #[arg(long)]
    config: Option<PathBuf>,

    /// How long to run, in seconds
    #[arg(short, long, default_value_t = 3)]
    seconds: u64,

    /// Delay between sensor readings, in milliseconds
    #[arg(long, default_value_t = 200)]
    interval_ms: u64,

    /// Comma-separated path prefixes the consumer mirrors, or "*"
    #[arg(short, long, default_value = "*")]
    filter: String,

    /// Lease the consumer requests, in seconds
    #[arg(long, default_value_t = 2)]
    lease_seconds: u64,

    /// Take the bus offline for this many milliseconds halfway through
    #[arg(long)]
    outage_ms: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RuntimeConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?
            .with_env_overrides()?,
        None => RuntimeConfig::from_env()?,
    };
    let filter = if args.filter == "*" {
        Filter::All
    } else {
        Filter::prefixes(args.filter.split(',').map(str::trim).filter(|p| !p.is_empty()))
    };
    let run_for = Duration::from_secs(args.seconds);
    let broker = LoopbackBroker::new();

    info!("Starting EC demo for {run_for:?} (filter {filter})");

    let consumer_thread = {
        let broker = broker.clone();
        let config = config.clone();
        let options = ConsumerOptions::default()
            .filter(filter)
            .lease_seconds(args.lease_seconds);
        thread::Builder::new()
            .name("consumer".to_string())
            .spawn(move || run_consumer(config, broker, options, run_for))
            .context("Failed to spawn consumer thread")?
    };

    let outage_thread = args.outage_ms.map(|outage_ms| {
        let broker = broker.clone();
        thread::spawn(move || {
            thread::sleep(run_for / 2);
            info!("Bus offline for {outage_ms}ms");
            broker.set_online(false);
            thread::sleep(Duration::from_millis(outage_ms));
            broker.set_online(true);
        })
    });

    run_producer(config, &broker, Duration::from_millis(args.interval_ms), run_for)?;

    if let Some(handle) = outage_thread {
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("outage thread panicked"))?;
    }
    let mirror = consumer_thread
        .join()
        .map_err(|_| anyhow::anyhow!("consumer thread panicked"))??;

    println!("{}", serde_json::to_string_pretty(&mirror)?);
    info!("Broker stats: {:?}", broker.stats());
    Ok(())
}

/// Producer side: a `sensor` service whose share is fed by a worker thread
/// through the actor mailbox.
fn run_producer(
    config: RuntimeConfig,
    broker: &LoopbackBroker,
    interval: Duration,
    run_for: Duration,
) -> Result<()> {
    let runtime = Runtime::new(config, broker)?;
    let initial: Share = [("lifecycle", Value::from("ready"))].into_iter().collect();
    let producer = Producer::new(&runtime, "sensor", initial)?;
    let actor = Actor::new(&runtime, "sensor")?;
    {
        let producer = producer.clone();
        actor.on("set", move |message: &Message| {
            let (Some(path), Some(value)) = (message.arg(0), message.arg(1)) else {
                log::warn!("set needs a path and a value");
                return;
            };
            let value = Value::Scalar(aiko::ec::Scalar::from_atom(value));
            if let Err(err) = producer.update(path, value) {
                log::warn!("set {path}: {err}");
            }
        });
    }

    let stop = Arc::new(AtomicBool::new(false));
    let worker = {
        let address = actor.actor_ref();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut reading = 0u64;
            while !stop.load(Ordering::Acquire) {
                thread::sleep(interval);
                reading += 1;
                let args = vec!["stats.reading".to_string(), reading.to_string()];
                if address.send("set", args).is_err() {
                    break;
                }
            }
        })
    };

    let remote = runtime.remote();
    runtime.scheduler().add_timer(run_for, move || remote.terminate());
    runtime.run()?;

    stop.store(true, Ordering::Release);
    producer.update("lifecycle", "stopped")?;
    info!("Producer subscriptions at exit: {:?}", producer.subscriptions());
    producer.close();
    actor.close();
    runtime.close();
    worker
        .join()
        .map_err(|_| anyhow::anyhow!("worker thread panicked"))?;
    Ok(())
}

fn run_consumer(
    config: RuntimeConfig,
    broker: LoopbackBroker,
    options: ConsumerOptions,
    run_for: Duration,
) -> Result<Share> {
    let runtime = Runtime::new(config, &broker)?;
    let consumer = Consumer::new(&runtime, "dashboard", "sensor", options)?;
    consumer.add_handler(|kind: ChangeKind, path: &str, value: Option<&Value>| match value {
        Some(value) => info!("{kind} {path} = {value:?}"),
        None => info!("{kind} {path}"),
    });

    let remote = runtime.remote();
    runtime.scheduler().add_timer(run_for, move || remote.terminate());
    runtime.run()?;

    let mirror = consumer.mirror();
    info!("Consumer finished in state {:?}", consumer.state());
    consumer.terminate();
    runtime.close();
    Ok(mirror)
}
