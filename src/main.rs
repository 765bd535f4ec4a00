use std::io::Read;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, anyhow};
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use video_push::{Config, PushProtocol, VideoPusher};

const STDIN_SOURCE: &str = "-";

fn init_tracing() {
    // FFmpeg's own lines arrive under the `ffmpeg` target.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // Load configuration from CLI and/or config file
    let config = Config::load()?;
    let protocol = config.push_protocol()?;
    let pusher = Arc::new(VideoPusher::new(config.push_options()?)?);

    let source = config.source.clone().unwrap_or_default();
    let push_address = config.push_address.clone().unwrap_or_default();
    let reads_stdin = source == STDIN_SOURCE;
    info!(%source, %push_address, %protocol, "Starting video push");

    // A plain thread: a reader blocked on stdin must not hold up runtime shutdown.
    let (done_tx, mut done) = oneshot::channel();
    {
        let pusher = pusher.clone();
        let chunk_size = config.chunk_size;
        thread::Builder::new()
            .name("video-push".to_string())
            .spawn(move || {
                let result = if reads_stdin {
                    push_stdin(&pusher, &push_address, protocol, chunk_size)
                } else {
                    pusher
                        .push_source(&source, &push_address, protocol)
                        .map(|report| info!(?report, "Relay complete"))
                        .map_err(anyhow::Error::from)
                };
                let _ = done_tx.send(result);
            })?;
    }

    tokio::select! {
        result = &mut done => {
            result.context("Push thread exited without a result")??;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping relays");
            pusher.shutdown();

            let stopped = async {
                if reads_stdin {
                    // The stdin reader may stay blocked; wait for the relays it fed.
                    let pusher = pusher.clone();
                    tokio::task::spawn_blocking(move || pusher.join_relays())
                        .await
                        .context("Relay join task panicked")?;
                } else if let Ok(Err(error)) = done.await {
                    error!(%error, "Push stopped with error");
                }
                anyhow::Ok(())
            };

            tokio::select! {
                result = stopped => result?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted again, exiting without waiting for relays");
                    std::process::exit(130);
                }
            }
        }
    }

    Ok(())
}

/// Feeds stdin to the pusher in `chunk_size` pieces, then waits for the relay.
fn push_stdin(
    pusher: &VideoPusher,
    push_address: &str,
    protocol: PushProtocol,
    chunk_size: usize,
) -> anyhow::Result<()> {
    let mut stdin = std::io::stdin().lock();
    let mut buffer = vec![0u8; chunk_size];

    let fed = loop {
        if pusher.is_shutdown() {
            break Ok(());
        }
        let read = match stdin.read(&mut buffer) {
            Ok(0) => break Ok(()),
            Ok(read) => read,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(error) => break Err(anyhow!(error).context("Failed to read stdin")),
        };
        if let Err(error) = pusher.push_bytes(&buffer[..read], push_address, protocol) {
            break Err(anyhow!(error).context("Failed to feed relay"));
        }
    };

    pusher.finish(push_address);
    fed
}
