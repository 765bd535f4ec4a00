use std::collections::HashMap;
use std::io::{PipeReader, PipeWriter, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::protocol::PushProtocol;

type Entries = Mutex<HashMap<String, Entry>>;

struct Entry {
    generation: u64,
    writer: Arc<Mutex<PipeWriter>>,
}

/// Starts consuming a freshly created pipe; called without the registry lock held.
pub type Launcher = Arc<dyn Fn(PipeFeed) + Send + Sync>;

/// The read side of a new pipe, handed to the launcher.
pub struct PipeFeed {
    pub push_address: String,
    pub protocol: PushProtocol,
    pub reader: PipeReader,
    /// Drop when the relay is done to forget the pipe.
    pub lease: PipeLease,
}

/// Removes its pipe from the registry on drop, unless the address has since
/// been bound to a newer pipe.
pub struct PipeLease {
    entries: Weak<Entries>,
    push_address: String,
    generation: u64,
}

impl Drop for PipeLease {
    fn drop(&mut self) {
        let Some(entries) = self.entries.upgrade() else {
            return;
        };
        let mut entries = entries.lock();
        let current = entries.get(&self.push_address).map(|entry| entry.generation);
        if current == Some(self.generation) {
            entries.remove(&self.push_address);
            info!(push_address = %self.push_address, "Released cached pipe");
        }
    }
}

/// Maps push addresses to the write end of the pipe feeding their relay.
#[derive(Clone)]
pub struct PipeRegistry {
    entries: Arc<Entries>,
    next_generation: Arc<AtomicU64>,
    launcher: Launcher,
}

impl PipeRegistry {
    pub fn new(launcher: Launcher) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_generation: Arc::new(AtomicU64::new(0)),
            launcher,
        }
    }

    /// Appends `data` to the pipe of `push_address`, creating the pipe and
    /// launching its consumer on first use.
    pub fn push_bytes(
        &self,
        data: &[u8],
        push_address: &str,
        protocol: PushProtocol,
    ) -> Result<()> {
        let (generation, writer) = self.writer_for(push_address, protocol)?;

        if let Err(error) = writer.lock().write_all(data) {
            info!(%push_address, %error, "Cleaning up pipe after write failure");
            self.remove_generation(push_address, generation);
            return Err(error.into());
        }
        Ok(())
    }

    /// Drops the write end so the consumer sees end of input.
    pub fn close(&self, push_address: &str) -> bool {
        let removed = self.entries.lock().remove(push_address).is_some();
        if removed {
            debug!(%push_address, "Pipe closed");
        }
        removed
    }

    /// Closes every pipe; returns how many were open.
    pub fn close_all(&self) -> usize {
        let closed: Vec<_> = self.entries.lock().drain().collect();
        if !closed.is_empty() {
            info!(count = closed.len(), "Closed all pipes");
        }
        closed.len()
    }

    pub fn contains(&self, push_address: &str) -> bool {
        self.entries.lock().contains_key(push_address)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn writer_for(
        &self,
        push_address: &str,
        protocol: PushProtocol,
    ) -> Result<(u64, Arc<Mutex<PipeWriter>>)> {
        let (feed, generation, writer) = {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get(push_address) {
                return Ok((entry.generation, entry.writer.clone()));
            }

            let (reader, writer) = std::io::pipe()?;
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let writer = Arc::new(Mutex::new(writer));
            entries.insert(
                push_address.to_string(),
                Entry {
                    generation,
                    writer: writer.clone(),
                },
            );
            debug!(%push_address, generation, "Created pipe");

            (
                PipeFeed {
                    push_address: push_address.to_string(),
                    protocol,
                    reader,
                    lease: PipeLease {
                        entries: Arc::downgrade(&self.entries),
                        push_address: push_address.to_string(),
                        generation,
                    },
                },
                generation,
                writer,
            )
        };

        (self.launcher)(feed);
        Ok((generation, writer))
    }

    fn remove_generation(&self, push_address: &str, generation: u64) {
        let mut entries = self.entries.lock();
        if entries.get(push_address).map(|entry| entry.generation) == Some(generation) {
            entries.remove(push_address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::mpsc;
    use std::thread;

    fn collecting_registry() -> (PipeRegistry, mpsc::Receiver<PipeFeed>) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let registry = PipeRegistry::new(Arc::new(move |feed: PipeFeed| {
            tx.lock().send(feed).unwrap();
        }));
        (registry, rx)
    }

    #[test]
    fn first_push_launches_one_consumer_per_address() {
        let (registry, feeds) = collecting_registry();

        registry.push_bytes(b"ab", "rtmp://host/live/a", PushProtocol::Rtmp).unwrap();
        registry.push_bytes(b"cd", "rtmp://host/live/a", PushProtocol::Rtmp).unwrap();
        registry.push_bytes(b"ef", "rtsp://host/b", PushProtocol::Rtsp).unwrap();

        let first = feeds.try_recv().expect("feed for address a");
        let second = feeds.try_recv().expect("feed for address b");
        assert!(feeds.try_recv().is_err());

        assert_eq!(first.push_address, "rtmp://host/live/a");
        assert_eq!(first.protocol, PushProtocol::Rtmp);
        assert_eq!(second.protocol, PushProtocol::Rtsp);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn bytes_arrive_in_order_and_close_ends_the_stream() {
        let (registry, feeds) = collecting_registry();
        let address = "rtmp://host/live/ordered";

        registry.push_bytes(b"hello ", address, PushProtocol::Rtmp).unwrap();
        let feed = feeds.recv().unwrap();
        let reader = thread::spawn(move || {
            let mut reader = feed.reader;
            let mut received = String::new();
            reader.read_to_string(&mut received).unwrap();
            received
        });

        registry.push_bytes(b"world", address, PushProtocol::Rtmp).unwrap();
        assert!(registry.close(address));
        assert!(!registry.contains(address));

        assert_eq!(reader.join().unwrap(), "hello world");
    }

    #[test]
    fn dropping_the_lease_forgets_the_pipe() {
        let (registry, feeds) = collecting_registry();
        let address = "rtsp://host/lease";

        registry.push_bytes(b"x", address, PushProtocol::Rtsp).unwrap();
        assert!(registry.contains(address));

        let feed = feeds.recv().unwrap();
        drop(feed.lease);
        assert!(!registry.contains(address));
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_lease_keeps_newer_pipe() {
        let (registry, feeds) = collecting_registry();
        let address = "rtsp://host/reused";

        registry.push_bytes(b"1", address, PushProtocol::Rtsp).unwrap();
        let old = feeds.recv().unwrap();
        registry.close(address);

        registry.push_bytes(b"2", address, PushProtocol::Rtsp).unwrap();
        let _new = feeds.recv().unwrap();

        drop(old.lease);
        assert!(registry.contains(address));
    }

    #[test]
    fn write_failure_removes_the_entry() {
        let (registry, feeds) = collecting_registry();
        let address = "rtmp://host/live/broken";

        registry.push_bytes(b"start", address, PushProtocol::Rtmp).unwrap();
        let feed = feeds.recv().unwrap();
        // Keep the lease, close the read side: writes now hit a broken pipe.
        let PipeFeed { reader, lease, .. } = feed;
        drop(reader);

        let result = registry.push_bytes(b"more", address, PushProtocol::Rtmp);
        assert!(result.is_err());
        assert!(!registry.contains(address));
        drop(lease);
    }

    #[test]
    fn close_all_ends_every_stream() {
        let (registry, feeds) = collecting_registry();

        registry.push_bytes(b"a", "rtmp://host/live/one", PushProtocol::Rtmp).unwrap();
        registry.push_bytes(b"b", "rtsp://host/two", PushProtocol::Rtsp).unwrap();
        let feeds: Vec<PipeFeed> = feeds.try_iter().collect();
        assert_eq!(feeds.len(), 2);

        assert_eq!(registry.close_all(), 2);
        assert!(registry.is_empty());

        // Buffered bytes are still readable, then the stream ends.
        for (feed, expected) in feeds.into_iter().zip([b"a", b"b"]) {
            let mut reader = feed.reader;
            let mut received = Vec::new();
            reader.read_to_end(&mut received).unwrap();
            assert_eq!(received, expected);
        }
    }

    #[test]
    fn launcher_dropping_the_feed_cleans_up() {
        let registry = PipeRegistry::new(Arc::new(|feed: PipeFeed| drop(feed)));
        let address = "rtmp://host/live/refused";

        // The consumer went away before the first write, so it fails.
        assert!(registry.push_bytes(b"data", address, PushProtocol::Rtmp).is_err());
        assert!(!registry.contains(address));
    }
}
