use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use router_core::{ChannelRouter, Message, StreamId, ToggleSource};
use spool::{ProducerConfig, SpoolControl, SpoolingProducer};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use utils::SpoolConfig;

#[derive(Parser)]
#[command(name = "spool-cli", about = "Run the durable spooling producer standalone")]
struct Cli {
    /// Base directory under which each stream gets its own segment
    /// directory.
    #[arg(long, default_value = "./spool")]
    path: String,

    /// Emit structured JSON logs instead of compact text.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read newline-delimited messages from stdin, feed them to a
    /// stream named `stdin`, and run until interrupted.
    Serve,
    /// Print the current segment write/read counters for each stream.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    utils::logging::init_tracing(cli.json_logs);

    let config = ProducerConfig {
        spool: {
            let mut spool = SpoolConfig::default();
            spool.path = cli.path.clone();
            spool
        },
        drop_stream: StreamId::new("_DROPPED_", 0),
    };

    let router: Arc<ChannelRouter> = Arc::new(ChannelRouter::new());
    let source = Arc::new(ToggleSource::new(false));
    let producer = SpoolingProducer::new(config, router.clone(), source, Vec::new);

    match cli.command {
        Command::Serve => serve(producer, router).await,
        Command::Status => status(producer).await,
    }
}

async fn serve(producer: Arc<SpoolingProducer>, router: Arc<ChannelRouter>) -> anyhow::Result<()> {
    let _drop_rx = router.subscribe("_DROPPED_");
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    let shutdown = producer.shutdown_flag();
    let ctrl_c_producer = producer.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c_producer.control(SpoolControl::Stop).await;
    });

    info!("spool-cli serving on stdin, Ctrl-C to stop");
    while !shutdown.is_stopping() {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(text) => {
                        let msg = Message::new(text.into_bytes(), StreamId::new("stdin", 1));
                        producer.enqueue(msg).await;
                    }
                    None => break,
                }
            }
            _ = shutdown.wait() => break,
        }
    }

    Ok(())
}

async fn status(producer: Arc<SpoolingProducer>) -> anyhow::Result<()> {
    // Give any just-spawned reader tasks a moment to report counts.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let counts = producer.segment_counts().await;
    if counts.is_empty() {
        println!("no streams have touched the spool yet");
    }
    for (stream, (writes, reads)) in counts {
        println!("{stream}: writes={writes} reads={reads}");
    }
    Ok(())
}
