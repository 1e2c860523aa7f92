//! CLI for telecmd
//!
//! Subcommands:
//! - `exec`: dispatch a single command envelope and print the outcome
//! - `replay`: dispatch `topic<TAB>payload` lines from stdin, then print the
//!   replies the delivery queue published

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use telecmd::command::{CommandDefinition, CommandDispatcher, CommandResult, ResponseBuffer};
use telecmd::config::{Settings, load_config};
use telecmd::delivery::{
    ChannelSink, DeliveryQueue, DeliveryWorker, NewMessage, OutboundMessage, Priority,
    RetryPolicy,
};
use telecmd::schema::{Schema, SchemaRegistry};

const BRIGHTNESS_SET_TOPIC: &str = "home/esp32_core/brightness/set";
const BRIGHTNESS_STATE_TOPIC: &str = "home/esp32_core/brightness/state";
const STATUS_TOPIC: &str = "home/esp32_core/status";

#[derive(Parser)]
#[command(name = "telecmd")]
enum Command {
    /// Dispatch one command envelope
    Exec {
        /// Topic the envelope arrived on
        #[arg(long, default_value = "home/esp32_core/command")]
        topic: String,
        /// JSON envelope, e.g. '{"command":"ping"}'
        #[arg(long)]
        payload: String,
    },
    /// Dispatch `topic<TAB>payload` lines read from stdin
    Replay,
}

struct Device {
    dispatcher: CommandDispatcher,
    queue: Arc<DeliveryQueue>,
}

#[tokio::main]
async fn main() {
    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            Settings::default()
        }
    };
    telecmd::utils::logging::init(&settings.logging.level);

    let cmd = Command::parse();

    let (tx, rx) = mpsc::unbounded_channel();
    let device = match build_device(&settings, ChannelSink::new(tx)) {
        Ok(device) => device,
        Err(e) => {
            error!("Failed to set up command handling: {}", e);
            return;
        }
    };

    let outcome = match cmd {
        Command::Exec { topic, payload } => run_exec(&device, &topic, &payload, rx).await,
        Command::Replay => run_replay(&device, rx).await,
    };
    if let Err(e) = outcome {
        error!("Command failed: {}", e);
    }
}

/// Wires the schema registry, dispatcher and delivery queue together and
/// registers the demo command set.
fn build_device(settings: &Settings, sink: ChannelSink) -> telecmd::Result<Device> {
    let registry = Arc::new(
        SchemaRegistry::new().with_lock_timeout(settings.validator.lock_timeout()),
    );
    registry.register(Schema::new(
        "brightness_command",
        BRIGHTNESS_SET_TOPIC,
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string"},
                "parameters": {
                    "type": "object",
                    "properties": {
                        "brightness": {"type": "number", "minimum": 0, "maximum": 255},
                        "mode": {"type": "string", "enum": ["manual", "auto"]}
                    },
                    "required": ["brightness"]
                }
            },
            "required": ["command", "parameters"]
        }),
    ))?;

    let config = settings
        .delivery
        .to_delivery_config()
        .with_sink(Arc::new(sink));
    let queue = Arc::new(
        DeliveryQueue::new(config).with_lock_timeout(settings.delivery.lock_timeout()),
    );

    let dispatcher = CommandDispatcher::new(registry)
        .with_lock_timeout(settings.dispatcher.lock_timeout());

    dispatcher.register(
        CommandDefinition::new("ping", |ctx| {
            ctx.response.set("pong");
            CommandResult::Success
        })
        .description("Liveness check"),
    )?;

    let status_queue = Arc::clone(&queue);
    dispatcher.register(
        CommandDefinition::new("restart", move |ctx| {
            let notice = json!({"state": "restarting"}).to_string();
            let queued = status_queue.enqueue(
                NewMessage::new(STATUS_TOPIC, notice)
                    .qos(1)
                    .priority(Priority::Urgent)
                    .retry_policy(RetryPolicy::critical()),
            );
            match queued {
                Ok(_) => {
                    ctx.response.set("ok");
                    CommandResult::Success
                }
                Err(e) => {
                    warn!("Restart notice not queued: {}", e);
                    CommandResult::SystemError
                }
            }
        })
        .description("Restart the device"),
    )?;

    let state_queue = Arc::clone(&queue);
    dispatcher.register(
        CommandDefinition::new("set_brightness", move |ctx| {
            let level = ctx.get_int_param("brightness", -1);
            if !(0..=255).contains(&level) {
                ctx.response.set("brightness must be 0-255");
                return CommandResult::InvalidParams;
            }
            let mode = ctx.get_string_param("mode", "manual");
            let state = json!({"brightness": level, "mode": mode}).to_string();
            match state_queue.enqueue(NewMessage::new(BRIGHTNESS_STATE_TOPIC, state).qos(1)) {
                Ok(_) => {
                    ctx.response.set(&format!("brightness {level}"));
                    CommandResult::Success
                }
                Err(_) => CommandResult::ExecutionFailed,
            }
        })
        .description("Set global LED brightness")
        .schema("brightness_command"),
    )?;

    info!(
        "{} commands registered",
        dispatcher.get_stats()?.registered_command_count
    );
    Ok(Device { dispatcher, queue })
}

fn dispatch(device: &Device, topic: &str, payload: &str) -> telecmd::Result<()> {
    let mut response = ResponseBuffer::default();
    let result = device.dispatcher.execute(topic, payload, &mut response)?;
    println!("{topic}\t{result}\t{response}");
    Ok(())
}

async fn run_exec(
    device: &Device,
    topic: &str,
    payload: &str,
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
) -> Result<(), Box<dyn std::error::Error>> {
    dispatch(device, topic, payload)?;

    device.queue.process_once()?;
    while let Ok(message) = rx.try_recv() {
        print_outbound(&message);
    }
    Ok(())
}

async fn run_replay(
    device: &Device,
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
) -> Result<(), Box<dyn std::error::Error>> {
    let worker = DeliveryWorker::spawn(Arc::clone(&device.queue));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let Some((topic, payload)) = line.split_once('\t') else {
            warn!("Skipping line without a tab separator: {}", line);
            continue;
        };
        dispatch(device, topic, payload)?;
        while let Ok(message) = rx.try_recv() {
            print_outbound(&message);
        }
    }

    // give the worker a chance to flush what is still queued
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !device.queue.is_empty()? && tokio::time::Instant::now() < deadline {
        tokio::select! {
            Some(message) = rx.recv() => print_outbound(&message),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }
    worker.shutdown().await;
    while let Ok(message) = rx.try_recv() {
        print_outbound(&message);
    }

    let stats = device.queue.get_stats()?;
    info!(
        "Delivered {} messages, {} failed, {} still queued",
        stats.messages_delivered, stats.messages_failed, stats.current_queue_size
    );
    Ok(())
}

fn print_outbound(message: &OutboundMessage) {
    println!("> {} (qos {})\t{}", message.topic, message.qos, message.payload);
}
