use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PushOptions;
use crate::error::{PushError, Result};
use crate::ffmpeg_log;
use crate::grabber::{Grabber, Source};
use crate::protocol::PushProtocol;
use crate::registry::{PipeFeed, PipeRegistry};
use crate::relay::{RelayReport, relay};

type RelayThreads = Arc<Mutex<HashMap<String, Vec<JoinHandle<()>>>>>;

/// Entry point for relaying media into RTSP or RTMP endpoints.
pub struct VideoPusher {
    options: Arc<PushOptions>,
    registry: PipeRegistry,
    threads: RelayThreads,
    cancel: CancellationToken,
}

impl VideoPusher {
    pub fn new(options: PushOptions) -> Result<Self> {
        ffmpeg_next::init()?;
        ffmpeg_log::install(options.ffmpeg_log_level);

        let options = Arc::new(options);
        let cancel = CancellationToken::new();
        let threads = RelayThreads::default();

        let registry = {
            let options = options.clone();
            let cancel = cancel.clone();
            let threads = threads.clone();
            PipeRegistry::new(Arc::new(move |feed: PipeFeed| {
                spawn_pipe_relay(feed, options.clone(), cancel.clone(), &threads)
            }))
        };

        Ok(Self {
            options,
            registry,
            threads,
            cancel,
        })
    }

    pub fn options(&self) -> &PushOptions {
        &self.options
    }

    /// Feeds a chunk of an encoded stream to `push_address`.
    ///
    /// The first chunk for an address starts a relay thread reading from a
    /// pipe; later chunks are appended to that pipe. Chunks for one address
    /// must come from a single producer to stay in order.
    pub fn push_bytes(
        &self,
        data: &[u8],
        push_address: &str,
        protocol: PushProtocol,
    ) -> Result<()> {
        self.ensure_running()?;
        self.registry.push_bytes(data, push_address, protocol)
    }

    /// Ends the byte stream of `push_address` and waits for its relay to finish.
    pub fn finish(&self, push_address: &str) {
        self.registry.close(push_address);

        let handles = self.threads.lock().remove(push_address).unwrap_or_default();
        join_all(push_address, handles);
    }

    /// Waits for every relay started by `push_bytes`.
    pub fn join_relays(&self) {
        let threads: Vec<_> = self.threads.lock().drain().collect();
        for (push_address, handles) in threads {
            join_all(&push_address, handles);
        }
    }

    /// Relays everything `reader` yields. Blocks until the stream ends.
    pub fn push_stream<R>(
        &self,
        reader: R,
        push_address: &str,
        protocol: PushProtocol,
    ) -> Result<RelayReport>
    where
        R: Read + Send + 'static,
    {
        self.ensure_running()?;
        let (pipe_reader, mut pipe_writer) = std::io::pipe()?;
        thread::Builder::new()
            .name("pipe-feed".to_string())
            .spawn(move || {
                let mut reader = reader;
                match std::io::copy(&mut reader, &mut pipe_writer) {
                    Ok(bytes) => debug!(bytes, "Input stream exhausted"),
                    Err(error) => debug!(%error, "Stopped feeding pipe"),
                }
            })?;

        let grabber = Grabber::open(Source::Pipe(pipe_reader), &self.options, &self.cancel)?;
        relay(grabber, push_address, protocol, &self.options, &self.cancel)
    }

    /// Relays a file path or network URL. Blocks until the source ends.
    pub fn push_source(
        &self,
        source_address: &str,
        push_address: &str,
        protocol: PushProtocol,
    ) -> Result<RelayReport> {
        self.ensure_running()?;
        info!(%source_address, %push_address, %protocol, "Pushing source");
        let source = Source::Address(source_address.to_string());
        let grabber = Grabber::open(source, &self.options, &self.cancel)?;
        relay(grabber, push_address, protocol, &self.options, &self.cancel)
    }

    /// Stops every running relay and refuses new pushes.
    ///
    /// Blocked FFmpeg reads are interrupted and byte-fed pipes are closed, so
    /// relays wind down without more input. Recorders still flush their
    /// trailers.
    pub fn shutdown(&self) {
        info!("Stopping all relays");
        self.cancel.cancel();
        self.registry.close_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(PushError::ShutDown);
        }
        Ok(())
    }
}

fn join_all(push_address: &str, handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            error!(%push_address, "Relay thread panicked");
        }
    }
}

fn spawn_pipe_relay(
    feed: PipeFeed,
    options: Arc<PushOptions>,
    cancel: CancellationToken,
    threads: &RelayThreads,
) {
    let push_address = feed.push_address.clone();
    let spawned = thread::Builder::new()
        .name(format!("relay-{}", feed.protocol))
        .spawn(move || {
            let PipeFeed {
                push_address,
                protocol,
                reader,
                lease,
            } = feed;

            let outcome = Grabber::open(Source::Pipe(reader), &options, &cancel)
                .and_then(|grabber| relay(grabber, &push_address, protocol, &options, &cancel));
            match outcome {
                Ok(report) => debug!(%push_address, ?report, "Pipe relay finished"),
                Err(error) => error!(%push_address, %error, "Pipe relay failed"),
            }
            drop(lease);
        });

    match spawned {
        Ok(handle) => {
            let mut threads = threads.lock();
            let handles = threads.entry(push_address).or_default();
            handles.retain(|handle| !handle.is_finished());
            handles.push(handle);
        }
        Err(error) => warn!(%push_address, %error, "Failed to spawn relay thread"),
    }
}
