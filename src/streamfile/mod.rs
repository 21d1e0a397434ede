//! Event stream files.
//!
//! A stream is a directory holding two members:
//!
//! - `metadata.json`: the stream's display name, creation time, duration,
//!   per-device descriptors, aggregate counters, and compression descriptor.
//!   Written once when the writer closes.
//! - `events.bin`: an append-only sequence of length-prefixed (`u32` LE)
//!   postcard-encoded [`Event`] records, optionally wrapped in a DEFLATE
//!   stream.
//!
//! Writers stage the directory under a temporary location and commit it with
//! a rename on close, so readers never observe a half-written stream.
//! Device indices in events always point into the metadata's device table.

use crate::error::{Error, Result};
use crate::protocol::{Command, Packet, PacketBody};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Extension carried by stream directories.
pub const STREAM_EXT: &str = ".protostream";

const METADATA_FILE: &str = "metadata.json";
const EVENTS_FILE: &str = "events.bin";

/// Largest single event record we will read back.
const MAX_EVENT_LEN: usize = 16 * 1024 * 1024;

/// Compression applied to the event sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Deflate { level: u32 },
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Deflate { .. } => write!(f, "deflate"),
        }
    }
}

/// A device referenced by recorded events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub id: String,
    pub group: i32,
    pub controller: i32,
    pub pixels_per_strip: u16,
    pub strips_attached: u8,
}

/// Stream metadata, finalized when the writer closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub created_unix: u64,
    pub duration_us: u64,
    pub devices: Vec<DeviceEntry>,
    pub num_events: u64,
    pub num_bytes: u64,
    pub compression: Compression,
}

/// One recorded event: a packet captured for a device at an offset from the
/// stream start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub device_index: u32,
    pub offset_us: u64,
    /// Encoded packet bytes (sequence number included).
    pub payload: Vec<u8>,
}

/// Configuration shared by writers and merges.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Staging directory for in-progress writes; same filesystem as the
    /// destination so commit renames stay atomic.
    pub temp_dir: PathBuf,
    pub compression: Compression,
}

enum EventSink {
    Plain(BufWriter<File>),
    Deflate(DeflateEncoder<BufWriter<File>>),
}

impl Write for EventSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            EventSink::Plain(w) => w.write(buf),
            EventSink::Deflate(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            EventSink::Plain(w) => w.flush(),
            EventSink::Deflate(w) => w.flush(),
        }
    }
}

impl EventSink {
    fn finish(self) -> std::io::Result<()> {
        match self {
            EventSink::Plain(mut w) => w.flush(),
            EventSink::Deflate(w) => w.finish().and_then(|mut inner| inner.flush()),
        }
    }
}

/// Append-only stream writer. Commits on [`StreamWriter::close`]; an
/// uncommitted writer removes its staging directory on drop.
pub struct StreamWriter {
    staged_dir: PathBuf,
    final_dir: PathBuf,
    display_name: String,
    sink: Option<EventSink>,
    compression: Compression,
    devices: Vec<DeviceEntry>,
    index_by_id: HashMap<String, u32>,
    num_events: u64,
    num_bytes: u64,
    max_offset_us: u64,
    created_unix: u64,
}

impl StreamWriter {
    /// Create a writer that will commit to `final_dir`.
    pub fn create(cfg: &StreamConfig, final_dir: PathBuf, display_name: &str) -> Result<Self> {
        let staged_name = match final_dir.file_name() {
            Some(name) => name.to_os_string(),
            None => {
                return Err(Error::InvalidInput(format!(
                    "bad stream path {:?}",
                    final_dir
                )))
            }
        };
        let staged_dir = cfg.temp_dir.join(staged_name);
        if staged_dir.exists() {
            fs::remove_dir_all(&staged_dir)?;
        }
        fs::create_dir_all(&staged_dir)?;

        let file = File::create(staged_dir.join(EVENTS_FILE))?;
        let writer = BufWriter::new(file);
        let sink = match cfg.compression {
            Compression::None => EventSink::Plain(writer),
            Compression::Deflate { level } => EventSink::Deflate(DeflateEncoder::new(
                writer,
                flate2::Compression::new(level.min(9)),
            )),
        };

        Ok(Self {
            staged_dir,
            final_dir,
            display_name: display_name.to_string(),
            sink: Some(sink),
            compression: cfg.compression,
            devices: Vec::new(),
            index_by_id: HashMap::new(),
            num_events: 0,
            num_bytes: 0,
            max_offset_us: 0,
            created_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        })
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn num_events(&self) -> u64 {
        self.num_events
    }

    pub fn num_bytes(&self) -> u64 {
        self.num_bytes
    }

    /// Observed duration so far.
    pub fn duration(&self) -> Duration {
        Duration::from_micros(self.max_offset_us)
    }

    /// Record a packet for a device at the given offset.
    ///
    /// Pixel data packets and the reset/brightness commands are supported;
    /// firmware configuration commands cannot be represented and fail with
    /// [`Error::Encoding`], which callers treat as a skip.
    pub fn record_packet(
        &mut self,
        device: &DeviceEntry,
        offset: Duration,
        packet: &Packet,
    ) -> Result<()> {
        match &packet.body {
            PacketBody::StripStates(_) => {}
            PacketBody::Command(
                Command::Reset | Command::GlobalBrightness(_) | Command::StripBrightness { .. },
            ) => {}
            PacketBody::Command(cmd) => {
                return Err(Error::Encoding(format!("{:?}", cmd)));
            }
        }
        self.append_event(device, offset.as_micros() as u64, packet.encode())
    }

    /// Append a raw event, assigning the device an index on first sight.
    /// Used directly by merges, which must preserve payloads and offsets.
    pub fn append_event(
        &mut self,
        device: &DeviceEntry,
        offset_us: u64,
        payload: Vec<u8>,
    ) -> Result<()> {
        let device_index = self.device_index(device);
        let payload_len = payload.len();
        let event = Event {
            device_index,
            offset_us,
            payload,
        };

        let frame = postcard::to_allocvec(&event)?;
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| Error::Io(std::io::Error::other("stream writer closed")))?;
        sink.write_all(&(frame.len() as u32).to_le_bytes())?;
        sink.write_all(&frame)?;

        self.num_events += 1;
        self.num_bytes += payload_len as u64;
        self.max_offset_us = self.max_offset_us.max(offset_us);
        Ok(())
    }

    fn device_index(&mut self, device: &DeviceEntry) -> u32 {
        if let Some(&index) = self.index_by_id.get(&device.id) {
            return index;
        }
        let index = self.devices.len() as u32;
        self.devices.push(device.clone());
        self.index_by_id.insert(device.id.clone(), index);
        index
    }

    /// Finalize metadata and commit the stream to its final location.
    pub fn close(mut self) -> Result<Metadata> {
        if let Some(sink) = self.sink.take() {
            sink.finish()?;
        }

        let metadata = Metadata {
            name: self.display_name.clone(),
            created_unix: self.created_unix,
            duration_us: self.max_offset_us,
            devices: self.devices.clone(),
            num_events: self.num_events,
            num_bytes: self.num_bytes,
            compression: self.compression,
        };
        let doc = serde_json::to_vec_pretty(&metadata)?;
        fs::write(self.staged_dir.join(METADATA_FILE), doc)?;

        if self.final_dir.exists() {
            fs::remove_dir_all(&self.final_dir)?;
        }
        fs::rename(&self.staged_dir, &self.final_dir)?;

        // The staging directory is gone; disarm the drop cleanup.
        self.staged_dir = PathBuf::new();
        Ok(metadata)
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        if !self.staged_dir.as_os_str().is_empty() && self.staged_dir.exists() {
            let _ = fs::remove_dir_all(&self.staged_dir);
        }
    }
}

#[derive(Debug)]
enum EventSource {
    Plain(BufReader<File>),
    Deflate(DeflateDecoder<BufReader<File>>),
}

impl Read for EventSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            EventSource::Plain(r) => r.read(buf),
            EventSource::Deflate(r) => r.read(buf),
        }
    }
}

/// Sequential stream reader.
#[derive(Debug)]
pub struct StreamReader {
    dir: PathBuf,
    metadata: Metadata,
    source: EventSource,
}

impl StreamReader {
    pub fn open(dir: &Path) -> Result<Self> {
        let metadata = load_metadata(dir)?;
        let source = open_events(dir, metadata.compression)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            metadata,
            source,
        })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn duration(&self) -> Duration {
        Duration::from_micros(self.metadata.duration_us)
    }

    /// Read the next event; `None` at end of stream.
    pub fn next_event(&mut self) -> Result<Option<Event>> {
        let mut len_bytes = [0u8; 4];
        match self.source.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_EVENT_LEN {
            return Err(Error::Serialization(format!(
                "event record of {} bytes exceeds limit",
                len
            )));
        }

        let mut frame = vec![0u8; len];
        self.source.read_exact(&mut frame)?;
        let event: Event = postcard::from_bytes(&frame)?;

        if event.device_index as usize >= self.metadata.devices.len() {
            return Err(Error::Serialization(format!(
                "event references device index {} of {}",
                event.device_index,
                self.metadata.devices.len()
            )));
        }
        Ok(Some(event))
    }

    /// Restart from the first event.
    pub fn rewind(&mut self) -> Result<()> {
        self.source = open_events(&self.dir, self.metadata.compression)?;
        Ok(())
    }
}

fn open_events(dir: &Path, compression: Compression) -> Result<EventSource> {
    let file = File::open(dir.join(EVENTS_FILE))?;
    let reader = BufReader::new(file);
    Ok(match compression {
        Compression::None => EventSource::Plain(reader),
        Compression::Deflate { .. } => EventSource::Deflate(DeflateDecoder::new(reader)),
    })
}

fn load_metadata(dir: &Path) -> Result<Metadata> {
    let path = dir.join(METADATA_FILE);
    let doc = fs::read(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(dir.display().to_string())
        } else {
            Error::Io(e)
        }
    })?;
    Ok(serde_json::from_slice(&doc)?)
}

/// Load a stream's metadata plus its on-disk size in bytes.
pub fn load_metadata_and_size(dir: &Path) -> Result<(Metadata, u64)> {
    let metadata = load_metadata(dir)?;
    let mut size = 0;
    for entry in fs::read_dir(dir)? {
        size += entry?.metadata()?.len();
    }
    Ok((metadata, size))
}

/// Check that a path holds a readable stream.
pub fn validate(dir: &Path) -> Result<()> {
    load_metadata(dir).map(|_| ())
}

/// Delete a stream. Missing streams are a successful delete.
pub fn delete(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Merge source streams into a new destination stream.
///
/// Sources are appended in argument order with offsets preserved; device
/// identities are deduplicated by ID, so the destination's device table is
/// the union of the sources'.
pub fn merge(
    cfg: &StreamConfig,
    dest_dir: PathBuf,
    display_name: &str,
    srcs: &[PathBuf],
) -> Result<()> {
    if srcs.is_empty() {
        return Err(Error::InvalidInput("no source streams".to_string()));
    }

    let mut writer = StreamWriter::create(cfg, dest_dir, display_name)?;
    for src in srcs {
        let mut reader = StreamReader::open(src)?;
        let devices = reader.metadata().devices.clone();
        while let Some(event) = reader.next_event()? {
            let device = &devices[event.device_index as usize];
            writer.append_event(device, event.offset_us, event.payload)?;
        }
    }
    writer.close()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StripState;
    use tempfile::TempDir;

    fn config(root: &Path, compression: Compression) -> StreamConfig {
        let temp_dir = root.join("temporary");
        fs::create_dir_all(&temp_dir).unwrap();
        StreamConfig {
            temp_dir,
            compression,
        }
    }

    fn entry(id: &str, group: i32) -> DeviceEntry {
        DeviceEntry {
            id: id.to_string(),
            group,
            controller: 1,
            pixels_per_strip: 4,
            strips_attached: 1,
        }
    }

    fn pixel_packet(seq: u32) -> Packet {
        Packet {
            sequence: seq,
            body: PacketBody::StripStates(vec![StripState::new(0, 4)]),
        }
    }

    #[test]
    fn test_write_read_round_trip() {
        for compression in [Compression::None, Compression::Deflate { level: 6 }] {
            let tmp = TempDir::new().unwrap();
            let cfg = config(tmp.path(), compression);
            let dest = tmp.path().join("show.protostream");

            let mut writer = StreamWriter::create(&cfg, dest.clone(), "show").unwrap();
            let device = entry("00:11:22:33:44:55", 2);
            for (i, offset_ms) in [0u64, 100, 250].iter().enumerate() {
                writer
                    .record_packet(
                        &device,
                        Duration::from_millis(*offset_ms),
                        &pixel_packet(i as u32),
                    )
                    .unwrap();
            }
            let metadata = writer.close().unwrap();
            assert_eq!(metadata.num_events, 3);
            assert_eq!(metadata.duration_us, 250_000);
            assert_eq!(metadata.devices.len(), 1);

            let mut reader = StreamReader::open(&dest).unwrap();
            let mut offsets = Vec::new();
            while let Some(event) = reader.next_event().unwrap() {
                assert_eq!(event.device_index, 0);
                offsets.push(event.offset_us);
            }
            assert_eq!(offsets, vec![0, 100_000, 250_000]);
        }
    }

    #[test]
    fn test_rewind() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path(), Compression::Deflate { level: 1 });
        let dest = tmp.path().join("loop.protostream");

        let mut writer = StreamWriter::create(&cfg, dest.clone(), "loop").unwrap();
        writer
            .record_packet(&entry("aa:bb:cc:dd:ee:ff", 0), Duration::ZERO, &pixel_packet(9))
            .unwrap();
        writer.close().unwrap();

        let mut reader = StreamReader::open(&dest).unwrap();
        assert!(reader.next_event().unwrap().is_some());
        assert!(reader.next_event().unwrap().is_none());
        reader.rewind().unwrap();
        assert!(reader.next_event().unwrap().is_some());
    }

    #[test]
    fn test_unsupported_command_is_encoding_error() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path(), Compression::None);
        let dest = tmp.path().join("cmd.protostream");

        let mut writer = StreamWriter::create(&cfg, dest, "cmd").unwrap();
        let packet = Packet {
            sequence: 0,
            body: PacketBody::Command(Command::WifiConfigure(vec![1, 2])),
        };
        let err = writer
            .record_packet(&entry("aa:bb:cc:dd:ee:00", 0), Duration::ZERO, &packet)
            .unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
        assert_eq!(writer.num_events(), 0);

        // Supported commands still record.
        let packet = Packet {
            sequence: 0,
            body: PacketBody::Command(Command::GlobalBrightness(100)),
        };
        writer
            .record_packet(&entry("aa:bb:cc:dd:ee:00", 0), Duration::ZERO, &packet)
            .unwrap();
        assert_eq!(writer.num_events(), 1);
    }

    #[test]
    fn test_uncommitted_writer_leaves_no_stream() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path(), Compression::None);
        let dest = tmp.path().join("gone.protostream");

        let writer = StreamWriter::create(&cfg, dest.clone(), "gone").unwrap();
        drop(writer);
        assert!(!dest.exists());
        assert!(fs::read_dir(&cfg.temp_dir).unwrap().next().is_none());
    }

    #[test]
    fn test_delete_missing_is_ok() {
        let tmp = TempDir::new().unwrap();
        delete(&tmp.path().join("absent.protostream")).unwrap();
    }

    #[test]
    fn test_merge_preserves_events_and_devices() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path(), Compression::None);

        // Two sources sharing one device ID.
        let src_a = tmp.path().join("a.protostream");
        let mut writer = StreamWriter::create(&cfg, src_a.clone(), "a").unwrap();
        writer
            .record_packet(&entry("00:00:00:00:00:01", 1), Duration::from_millis(5), &pixel_packet(0))
            .unwrap();
        writer
            .record_packet(&entry("00:00:00:00:00:02", 2), Duration::from_millis(9), &pixel_packet(1))
            .unwrap();
        writer.close().unwrap();

        let src_b = tmp.path().join("b.protostream");
        let mut writer = StreamWriter::create(&cfg, src_b.clone(), "b").unwrap();
        writer
            .record_packet(&entry("00:00:00:00:00:01", 1), Duration::from_millis(2), &pixel_packet(2))
            .unwrap();
        writer.close().unwrap();

        let dest = tmp.path().join("merged.protostream");
        merge(&cfg, dest.clone(), "merged", &[src_a, src_b]).unwrap();

        let mut reader = StreamReader::open(&dest).unwrap();
        let metadata = reader.metadata().clone();
        assert_eq!(metadata.devices.len(), 2);
        assert_eq!(metadata.num_events, 3);

        // Source order preserved; offsets untouched.
        let mut events = Vec::new();
        while let Some(event) = reader.next_event().unwrap() {
            events.push((metadata.devices[event.device_index as usize].id.clone(), event.offset_us));
        }
        assert_eq!(
            events,
            vec![
                ("00:00:00:00:00:01".to_string(), 5_000),
                ("00:00:00:00:00:02".to_string(), 9_000),
                ("00:00:00:00:00:01".to_string(), 2_000),
            ]
        );
    }

    #[test]
    fn test_merge_requires_sources() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path(), Compression::None);
        let err = merge(&cfg, tmp.path().join("d.protostream"), "d", &[]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_validate_and_size() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path(), Compression::None);
        let dest = tmp.path().join("v.protostream");

        assert!(validate(&dest).is_err());

        let mut writer = StreamWriter::create(&cfg, dest.clone(), "v").unwrap();
        writer
            .record_packet(&entry("00:00:00:00:00:03", 0), Duration::ZERO, &pixel_packet(0))
            .unwrap();
        writer.close().unwrap();

        validate(&dest).unwrap();
        let (metadata, size) = load_metadata_and_size(&dest).unwrap();
        assert_eq!(metadata.num_events, 1);
        assert!(size > 0);
    }
}
