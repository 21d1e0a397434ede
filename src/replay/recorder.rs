//! Packet recorder.
//!
//! The recorder sits behind a bounded queue fed by the proxy receive path
//! (see [`RecorderListener`]); a drain thread owned by the controller pulls
//! from the queue and calls [`Recorder::record_packet`], so a disk latency
//! spike backs up the queue instead of the sockets. When the queue is full
//! the newest packets are dropped and counted.

use crate::device::{Device, PacketListener};
use crate::error::{Error, Result};
use crate::protocol::Packet;
use crate::replay::device_entry;
use crate::streamfile::StreamWriter;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Queue depth between the proxy receive path and the recorder drain.
pub const RECORDER_QUEUE_CAPACITY: usize = 256;

/// Status snapshot of a recorder.
#[derive(Debug, Clone)]
pub struct RecorderStatus {
    pub name: String,
    pub events: u64,
    pub bytes: u64,
    pub duration: Duration,
    /// First fatal error, if any; set when the recorder has stopped taking
    /// packets.
    pub error: Option<String>,
}

struct RecorderInner {
    writer: Option<StreamWriter>,
    name: String,
    start: Instant,
    error: Option<String>,
    // Mirrors of the writer's counters, kept so status outlives close.
    events: u64,
    bytes: u64,
    duration: Duration,
}

/// Captures packets into a stream writer.
pub struct Recorder {
    inner: Mutex<RecorderInner>,
}

impl Recorder {
    /// Take ownership of a writer and start the stream clock.
    pub fn new(writer: StreamWriter) -> Self {
        let name = writer.display_name().to_string();
        Self {
            inner: Mutex::new(RecorderInner {
                writer: Some(writer),
                name,
                start: Instant::now(),
                error: None,
                events: 0,
                bytes: 0,
                duration: Duration::ZERO,
            }),
        }
    }

    /// Record one packet observed for a device.
    ///
    /// Packets that cannot be encoded return [`Error::Encoding`] and are
    /// skipped; the recorder keeps going. Any other failure is stored as the
    /// recorder's fatal error and returned; after that every call is a
    /// no-op.
    pub fn record_packet(&self, device: &Arc<Device>, packet: &Packet) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.error.is_some() {
            return Ok(());
        }

        let offset = inner.start.elapsed();
        let entry = device_entry(device);
        let writer = match inner.writer.as_mut() {
            Some(w) => w,
            None => return Ok(()),
        };

        match writer.record_packet(&entry, offset, packet) {
            Ok(()) => {
                inner.events = inner.writer.as_ref().map(|w| w.num_events()).unwrap_or(0);
                inner.bytes = inner.writer.as_ref().map(|w| w.num_bytes()).unwrap_or(0);
                inner.duration = offset;
                Ok(())
            }
            Err(e @ Error::Encoding(_)) => Err(e),
            Err(e) => {
                inner.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub fn status(&self) -> RecorderStatus {
        let inner = self.inner.lock();
        RecorderStatus {
            name: inner.name.clone(),
            events: inner.events,
            bytes: inner.bytes,
            duration: inner.duration,
            error: inner.error.clone(),
        }
    }

    /// Close the underlying writer, committing the stream. Idempotent.
    pub fn stop(&self) -> Result<()> {
        let writer = self.inner.lock().writer.take();
        match writer {
            Some(writer) => writer.close().map(|_| ()),
            None => Ok(()),
        }
    }
}

/// Proxy listener feeding the recorder queue.
///
/// `on_packet` never blocks: a full queue drops the packet and bumps the
/// drop counter.
pub struct RecorderListener {
    tx: Sender<(Arc<Device>, Packet)>,
    dropped: AtomicU64,
}

impl RecorderListener {
    /// Create the listener and the receiving end of its queue.
    pub fn channel() -> (Arc<Self>, Receiver<(Arc<Device>, Packet)>) {
        let (tx, rx) = crossbeam_channel::bounded(RECORDER_QUEUE_CAPACITY);
        (
            Arc::new(Self {
                tx,
                dropped: AtomicU64::new(0),
            }),
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl PacketListener for RecorderListener {
    fn on_packet(&self, device: &Arc<Device>, packet: &Packet, _forwarded: bool) {
        match self.tx.try_send((Arc::clone(device), packet.clone())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    log::warn!("recorder queue full; {} packet(s) dropped", dropped);
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, DiscoveryHeaders, PacketBody, StripState};
    use crate::streamfile::{Compression, StreamConfig, StreamReader};
    use std::path::Path;
    use tempfile::TempDir;

    fn writer(root: &Path) -> StreamWriter {
        let cfg = StreamConfig {
            temp_dir: root.join("temporary"),
            compression: Compression::None,
        };
        std::fs::create_dir_all(&cfg.temp_dir).unwrap();
        StreamWriter::create(&cfg, root.join("rec.protostream"), "rec").unwrap()
    }

    fn test_device() -> Arc<Device> {
        let headers = DiscoveryHeaders {
            mac: [0, 0x11, 0x22, 0x33, 0x44, 0x55],
            group_ordinal: 2,
            controller_ordinal: 7,
            pixels_per_strip: 4,
            strips_attached: 1,
            ..DiscoveryHeaders::default()
        };
        Device::discovered(headers, "127.0.0.1:5000".parse().unwrap())
    }

    fn pixel_packet() -> Packet {
        Packet {
            sequence: 0,
            body: PacketBody::StripStates(vec![StripState::new(0, 4)]),
        }
    }

    #[test]
    fn test_record_and_close() {
        let tmp = TempDir::new().unwrap();
        let recorder = Recorder::new(writer(tmp.path()));
        let device = test_device();

        recorder.record_packet(&device, &pixel_packet()).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        recorder.record_packet(&device, &pixel_packet()).unwrap();

        let status = recorder.status();
        assert_eq!(status.events, 2);
        assert!(status.bytes > 0);
        assert!(status.duration > Duration::ZERO);
        assert!(status.error.is_none());

        recorder.stop().unwrap();
        // Stopping twice is a no-op.
        recorder.stop().unwrap();

        let mut reader = StreamReader::open(&tmp.path().join("rec.protostream")).unwrap();
        assert_eq!(reader.metadata().num_events, 2);
        assert_eq!(reader.metadata().devices[0].id, device.id().as_str());
        assert_eq!(reader.metadata().devices[0].group, 2);

        // Offsets are non-decreasing.
        let mut last = 0;
        while let Some(event) = reader.next_event().unwrap() {
            assert!(event.offset_us >= last);
            last = event.offset_us;
        }
    }

    #[test]
    fn test_encoding_error_skips_and_continues() {
        let tmp = TempDir::new().unwrap();
        let recorder = Recorder::new(writer(tmp.path()));
        let device = test_device();

        let bad = Packet {
            sequence: 0,
            body: PacketBody::Command(Command::LedConfigure(vec![1])),
        };
        assert!(matches!(
            recorder.record_packet(&device, &bad).unwrap_err(),
            Error::Encoding(_)
        ));
        assert!(recorder.status().error.is_none());

        recorder.record_packet(&device, &pixel_packet()).unwrap();
        assert_eq!(recorder.status().events, 1);
        recorder.stop().unwrap();
    }

    #[test]
    fn test_listener_queue_drops_when_full() {
        let (listener, rx) = RecorderListener::channel();
        let device = test_device();
        let packet = pixel_packet();

        for _ in 0..RECORDER_QUEUE_CAPACITY + 10 {
            listener.on_packet(&device, &packet, true);
        }
        assert_eq!(listener.dropped(), 10);
        assert_eq!(rx.len(), RECORDER_QUEUE_CAPACITY);
    }

    #[test]
    fn test_record_after_stop_is_noop() {
        let tmp = TempDir::new().unwrap();
        let recorder = Recorder::new(writer(tmp.path()));
        recorder.stop().unwrap();
        recorder
            .record_packet(&test_device(), &pixel_packet())
            .unwrap();
        assert_eq!(recorder.status().events, 0);
    }
}
