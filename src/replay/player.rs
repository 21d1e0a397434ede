//! Scheduled stream playback.
//!
//! The player owns its stream reader and a dedicated scheduler thread. For
//! every event it sleeps until `stream_start + offset`, then routes the
//! decoded packet: by (group + offset, controller) ordinal first, falling
//! back to the device ID. At end of stream it rewinds and starts the next
//! round with a fresh `stream_start`, looping until stopped.
//!
//! Pausing parks the scheduler; the paused interval is added to
//! `stream_start` on resume so the next event fires at its correct relative
//! offset, with no per-event skew accumulation. Events that fall more than
//! the configured lag age behind schedule are discarded, so a suspended
//! host does not burst its backlog on wake.
//!
//! The player holds a forwarding lease for the whole playback, paused or
//! not; only stopping releases it.

use crate::cancel::CancelToken;
use crate::device::Ordinal;
use crate::error::{Error, Result};
use crate::protocol::Packet;
use crate::streamfile::{DeviceEntry, Event, StreamReader};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Suppresses live forwarding for the duration of a playback.
pub trait PlaybackLeaser: Send + Sync {
    fn acquire_playback_lease(&self);
    fn release_playback_lease(&self);
}

/// Packet routing callback; the controller wires this to the router.
pub type RouteFn = Arc<dyn Fn(Ordinal, &str, &Packet) -> Result<()> + Send + Sync>;

/// A device the player could not route to, with the attempt count.
#[derive(Debug, Clone)]
pub struct NoRouteDevice {
    pub id: String,
    pub ordinal: Ordinal,
    pub count: u64,
}

/// Status snapshot of a player.
#[derive(Debug, Clone)]
pub struct PlayerStatus {
    pub rounds: u64,
    /// Offset of the most recently handled event within the stream.
    pub position: Duration,
    pub duration: Duration,
    /// Stream time played across all rounds.
    pub total_playtime: Duration,
    pub paused: bool,
    pub no_route_devices: Vec<NoRouteDevice>,
}

struct PlayState {
    stream_start: Instant,
    paused: bool,
    pause_started: Option<Instant>,
    rounds: u64,
    position_us: u64,
    no_route: HashMap<String, NoRouteDevice>,
}

struct PlayerShared {
    state: Mutex<PlayState>,
    cond: Condvar,
    duration: Duration,
    max_lag_age: Duration,
}

/// A running playback. Dropping the player stops it.
pub struct Player {
    shared: Arc<PlayerShared>,
    token: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl Player {
    /// Acquire a playback lease and start the scheduler on `reader`.
    pub fn play(
        reader: StreamReader,
        route: RouteFn,
        leaser: Arc<dyn PlaybackLeaser>,
        group_offset: i32,
        max_lag_age: Duration,
        parent: &CancelToken,
    ) -> Result<Self> {
        let shared = Arc::new(PlayerShared {
            state: Mutex::new(PlayState {
                stream_start: Instant::now(),
                paused: false,
                pause_started: None,
                rounds: 0,
                position_us: 0,
                no_route: HashMap::new(),
            }),
            cond: Condvar::new(),
            duration: reader.duration(),
            max_lag_age,
        });

        let token = parent.child();
        let thread = {
            let shared = Arc::clone(&shared);
            let token = token.clone();
            std::thread::Builder::new()
                .name("player".to_string())
                .spawn(move || {
                    leaser.acquire_playback_lease();
                    let result = run_scheduler(reader, &shared, &token, &route, group_offset);
                    leaser.release_playback_lease();
                    match result {
                        Ok(()) => {}
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => log::error!("playback failed: {}", e),
                    }
                    log::debug!("player scheduler stopped");
                })?
        };

        Ok(Self {
            shared,
            token,
            thread: Some(thread),
        })
    }

    /// Suspend the scheduler. The playback lease stays held.
    pub fn pause(&self) {
        let mut state = self.shared.state.lock();
        if !state.paused {
            state.paused = true;
            state.pause_started = Some(Instant::now());
            log::info!("playback paused");
        }
    }

    /// Resume a paused scheduler, shifting the stream clock past the pause.
    pub fn resume(&self) {
        let mut state = self.shared.state.lock();
        if state.paused {
            state.paused = false;
            if let Some(started) = state.pause_started.take() {
                state.stream_start += started.elapsed();
            }
            self.shared.cond.notify_all();
            log::info!("playback resumed");
        }
    }

    /// Stop playback and release the lease. Idempotent.
    pub fn stop(&mut self) {
        self.token.cancel();
        {
            let _state = self.shared.state.lock();
            self.shared.cond.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    pub fn status(&self) -> PlayerStatus {
        let state = self.shared.state.lock();
        let position = Duration::from_micros(state.position_us);
        let mut no_route_devices: Vec<_> = state.no_route.values().cloned().collect();
        no_route_devices.sort_by(|a, b| a.id.cmp(&b.id));
        PlayerStatus {
            rounds: state.rounds,
            position,
            duration: self.shared.duration,
            total_playtime: self.shared.duration * state.rounds as u32 + position,
            paused: state.paused,
            no_route_devices,
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_scheduler(
    mut reader: StreamReader,
    shared: &PlayerShared,
    token: &CancelToken,
    route: &RouteFn,
    group_offset: i32,
) -> Result<()> {
    let devices = reader.metadata().devices.clone();
    if reader.metadata().num_events == 0 {
        // Nothing to replay; hold the lease until stopped, as an empty
        // stream is still an explicit playback request.
        log::warn!("stream {:?} has no events", reader.metadata().name);
        token.wait();
        return Err(Error::Cancelled);
    }

    loop {
        {
            let mut state = shared.state.lock();
            state.stream_start = Instant::now();
            state.position_us = 0;
        }

        while let Some(event) = reader.next_event()? {
            let offset = Duration::from_micros(event.offset_us);
            let target = wait_for_emit(shared, token, offset)?;

            shared.state.lock().position_us = event.offset_us;

            // Catch-up policy: discard events that have aged past the
            // configured bound instead of bursting them out.
            let lag = Instant::now().saturating_duration_since(target);
            if lag > shared.max_lag_age {
                log::debug!("dropping event {:?} behind schedule", lag);
                continue;
            }

            emit(&event, &devices, shared, route, group_offset);
        }

        reader.rewind()?;
        let mut state = shared.state.lock();
        state.rounds += 1;
        log::debug!("playback round {} complete", state.rounds);
    }
}

/// Block until `stream_start + offset`, honoring pause and cancellation.
/// Returns the target instant the event was scheduled for.
fn wait_for_emit(shared: &PlayerShared, token: &CancelToken, offset: Duration) -> Result<Instant> {
    let mut state = shared.state.lock();
    loop {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if state.paused {
            shared.cond.wait(&mut state);
            continue;
        }
        let target = state.stream_start + offset;
        if Instant::now() >= target {
            return Ok(target);
        }
        shared.cond.wait_until(&mut state, target);
    }
}

fn emit(
    event: &Event,
    devices: &[DeviceEntry],
    shared: &PlayerShared,
    route: &RouteFn,
    group_offset: i32,
) {
    let entry = &devices[event.device_index as usize];
    let packet = match Packet::decode(&event.payload, entry.pixels_per_strip) {
        Ok(p) => p,
        Err(e) => {
            log::debug!("undecodable event for device {}: {}", entry.id, e);
            return;
        }
    };

    // Recorded ordinals refer to the real device; shifting by the proxy
    // group offset aims playback at the ordinal space the stream was
    // addressed to.
    let ordinal = Ordinal::new(entry.group + group_offset, entry.controller);
    let result = if ordinal.is_valid() {
        match route(ordinal, "", &packet) {
            Err(Error::NoRoute(_)) => route(Ordinal::INVALID, &entry.id, &packet),
            other => other,
        }
    } else {
        route(Ordinal::INVALID, &entry.id, &packet)
    };

    match result {
        Ok(()) => {}
        Err(Error::NoRoute(_)) => {
            let mut state = shared.state.lock();
            state
                .no_route
                .entry(entry.id.clone())
                .or_insert_with(|| NoRouteDevice {
                    id: entry.id.clone(),
                    ordinal,
                    count: 0,
                })
                .count += 1;
        }
        Err(e) => {
            log::warn!("failed to route event for device {}: {}", entry.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PacketBody, StripState};
    use crate::streamfile::{Compression, StreamConfig, StreamWriter};
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use tempfile::TempDir;

    struct CountingLeaser {
        held: AtomicBool,
    }

    impl PlaybackLeaser for CountingLeaser {
        fn acquire_playback_lease(&self) {
            self.held.store(true, AtomicOrdering::SeqCst);
        }
        fn release_playback_lease(&self) {
            self.held.store(false, AtomicOrdering::SeqCst);
        }
    }

    fn write_stream(root: &Path, offsets_ms: &[u64]) -> StreamReader {
        let cfg = StreamConfig {
            temp_dir: root.join("temporary"),
            compression: Compression::None,
        };
        std::fs::create_dir_all(&cfg.temp_dir).unwrap();
        let dest = root.join("play.protostream");
        let mut writer = StreamWriter::create(&cfg, dest.clone(), "play").unwrap();
        let entry = DeviceEntry {
            id: "00:11:22:33:44:55".to_string(),
            group: 2,
            controller: 7,
            pixels_per_strip: 4,
            strips_attached: 1,
        };
        for (i, ms) in offsets_ms.iter().enumerate() {
            let packet = Packet {
                sequence: i as u32,
                body: PacketBody::StripStates(vec![StripState::new(0, 4)]),
            };
            writer
                .record_packet(&entry, Duration::from_millis(*ms), &packet)
                .unwrap();
        }
        writer.close().unwrap();
        StreamReader::open(&dest).unwrap()
    }

    fn collecting_route(sink: Arc<Mutex<Vec<(Ordinal, String, Instant)>>>) -> RouteFn {
        Arc::new(move |ordinal, id, _packet| {
            sink.lock().push((ordinal, id.to_string(), Instant::now()));
            Ok(())
        })
    }

    #[test]
    fn test_playback_schedule_and_lease() {
        let tmp = TempDir::new().unwrap();
        let reader = write_stream(tmp.path(), &[0, 60, 120]);

        let sink = Arc::new(Mutex::new(Vec::new()));
        let leaser = Arc::new(CountingLeaser {
            held: AtomicBool::new(false),
        });
        let token = CancelToken::new();
        let start = Instant::now();
        let mut player = Player::play(
            reader,
            collecting_route(Arc::clone(&sink)),
            Arc::clone(&leaser) as Arc<dyn PlaybackLeaser>,
            1,
            Duration::from_secs(1),
            &token,
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(160));
        assert!(leaser.held.load(AtomicOrdering::SeqCst));

        {
            let emitted = sink.lock();
            assert!(emitted.len() >= 3, "emitted {} events", emitted.len());
            // Ordinal routing with the group offset applied.
            assert_eq!(emitted[0].0, Ordinal::new(3, 7));
            assert_eq!(emitted[0].1, "");
            // Emissions are on schedule within loose test tolerances.
            let second = emitted[1].2.duration_since(start);
            assert!(second >= Duration::from_millis(60), "second at {:?}", second);
            assert!(second < Duration::from_millis(160), "second at {:?}", second);
        }

        let status = player.status();
        assert!(!status.paused);
        assert_eq!(status.duration, Duration::from_millis(120));

        player.stop();
        assert!(!leaser.held.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn test_rounds_restart() {
        let tmp = TempDir::new().unwrap();
        let reader = write_stream(tmp.path(), &[0, 10]);

        let sink = Arc::new(Mutex::new(Vec::new()));
        let leaser = Arc::new(CountingLeaser {
            held: AtomicBool::new(false),
        });
        let token = CancelToken::new();
        let mut player = Player::play(
            reader,
            collecting_route(Arc::clone(&sink)),
            leaser,
            0,
            Duration::from_secs(1),
            &token,
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        let status = player.status();
        assert!(status.rounds >= 1, "rounds = {}", status.rounds);
        assert!(sink.lock().len() >= 4);
        player.stop();
    }

    #[test]
    fn test_pause_resume_shifts_schedule() {
        let tmp = TempDir::new().unwrap();
        let reader = write_stream(tmp.path(), &[0, 50]);

        let sink = Arc::new(Mutex::new(Vec::new()));
        let leaser = Arc::new(CountingLeaser {
            held: AtomicBool::new(false),
        });
        let token = CancelToken::new();
        let mut player = Player::play(
            reader,
            collecting_route(Arc::clone(&sink)),
            Arc::clone(&leaser) as Arc<dyn PlaybackLeaser>,
            0,
            Duration::from_secs(1),
            &token,
        )
        .unwrap();

        // Let the first event out, then pause across the second's offset.
        std::thread::sleep(Duration::from_millis(20));
        player.pause();
        assert!(player.status().paused);
        // Pause does not release the lease.
        assert!(leaser.held.load(AtomicOrdering::SeqCst));

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(sink.lock().len(), 1);

        let resume_at = Instant::now();
        player.resume();
        std::thread::sleep(Duration::from_millis(80));

        let emitted = sink.lock().clone();
        assert!(emitted.len() >= 2);
        // The second event fires ~30ms after resume (50ms offset minus the
        // 20ms played before pausing), not immediately.
        let gap = emitted[1].2.duration_since(resume_at);
        assert!(gap >= Duration::from_millis(15), "gap was {:?}", gap);
        drop(emitted);

        player.stop();
    }

    #[test]
    fn test_lag_policy_drops_stale_events() {
        let tmp = TempDir::new().unwrap();
        let reader = write_stream(tmp.path(), &[0, 10, 200]);

        let sink = Arc::new(Mutex::new(Vec::new()));
        let leaser = Arc::new(CountingLeaser {
            held: AtomicBool::new(false),
        });
        let token = CancelToken::new();

        // A route callback that stalls the scheduler past the second
        // event's deadline; with a 5ms lag bound that event must be
        // discarded rather than emitted late.
        let s = Arc::clone(&sink);
        let route: RouteFn = Arc::new(move |ordinal, id, _packet| {
            s.lock().push((ordinal, id.to_string(), Instant::now()));
            std::thread::sleep(Duration::from_millis(60));
            Ok(())
        });
        let mut player = Player::play(
            reader,
            route,
            leaser,
            0,
            Duration::from_millis(5),
            &token,
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(150));
        // First event emitted, second dropped (stale), third pending.
        assert_eq!(sink.lock().len(), 1);
        player.stop();
    }

    #[test]
    fn test_no_route_counting() {
        let tmp = TempDir::new().unwrap();
        let reader = write_stream(tmp.path(), &[0, 5, 10]);

        let leaser = Arc::new(CountingLeaser {
            held: AtomicBool::new(false),
        });
        let token = CancelToken::new();
        let route: RouteFn = Arc::new(|ordinal, id, _| {
            Err(Error::NoRoute(if id.is_empty() {
                ordinal.to_string()
            } else {
                id.to_string()
            }))
        });
        let mut player = Player::play(
            reader,
            route,
            leaser,
            0,
            Duration::from_secs(1),
            &token,
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(60));
        let status = player.status();
        assert_eq!(status.no_route_devices.len(), 1);
        let no_route = &status.no_route_devices[0];
        assert_eq!(no_route.id, "00:11:22:33:44:55");
        assert_eq!(no_route.ordinal, Ordinal::new(2, 7));
        assert!(no_route.count >= 3);
        player.stop();
    }
}
