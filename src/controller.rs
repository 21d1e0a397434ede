//! Operational state machine.
//!
//! The controller owns the current task (at most one of a recorder or a
//! player) and serializes every external operation under a single lock.
//! File opens and closes happen under the lock on purpose: they are local
//! filesystem calls and must stay ordered with respect to other
//! transitions.
//!
//! Lease discipline: the player holds the `"player"` lease for the lifetime
//! of a playback, and the controller holds the `"controller"` lease while
//! forwarding is manually disabled. The recorder never takes a lease;
//! recording with forwarding enabled is the normal case.

use crate::cancel::CancelToken;
use crate::device::{DeviceInfo, PacketListener, Router, SnapshotManager};
use crate::discovery::DiscoveryRegistry;
use crate::error::{Error, Result};
use crate::protocol::StripState;
use crate::proxy::{AutoResumeListener, ProxyManager};
use crate::replay::{PlaybackLeaser, Player, Recorder, RecorderListener, RouteFn};
use crate::storage::{sanitize_display_name, Storage};
use crate::system::SystemControl;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Lease identity used for manual forwarding control.
const MANUAL_LEASE_HOLDER: &str = "controller";
/// Lease identity used by the player.
const PLAYBACK_LEASE_HOLDER: &str = "player";

/// Controller status snapshot.
#[derive(Debug, Clone)]
pub struct ControllerStatus {
    pub start_time: Option<SystemTime>,
    pub uptime: Duration,
    pub proxy_forwarding: bool,
    /// True while the controller's manual lease blocks forwarding.
    pub disabling_proxy_forwarding: bool,
    pub playback: Option<PlaybackStatusInfo>,
    pub record: Option<RecordStatusInfo>,
}

#[derive(Debug, Clone)]
pub struct PlaybackStatusInfo {
    pub name: String,
    pub rounds: u64,
    pub position: Duration,
    pub duration: Duration,
    pub total_playtime: Duration,
    pub paused: bool,
    pub progress_percent: Option<u32>,
    /// Formatted `{group, controller} id (count)` entries, sorted.
    pub no_route_devices: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RecordStatusInfo {
    pub name: String,
    pub events: u64,
    pub bytes: u64,
    pub duration: Duration,
    pub error: Option<String>,
}

/// One stored file as presented by [`Controller::list_files`].
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub name: String,
    pub num_devices: usize,
    pub max_strips: u32,
    pub max_pixels_per_strip: u32,
    pub disk_bytes: u64,
    pub num_bytes: u64,
    pub num_events: u64,
    pub compression: String,
    pub created_unix: u64,
    pub duration: Duration,
    pub is_default: bool,
}

#[derive(Debug, Clone)]
pub struct FileList {
    pub default_file_name: String,
    pub files: Vec<FileInfo>,
}

#[derive(Debug, Clone)]
pub struct SystemStateInfo {
    pub available: bool,
    pub status: String,
}

#[derive(Default)]
struct CtrlState {
    running: bool,
    run_token: Option<CancelToken>,
    start_time: Option<(SystemTime, Instant)>,

    player: Option<Player>,
    playing_name: String,
    auto_resume: Option<AutoResumeListener>,

    recorder: Option<Arc<Recorder>>,
    recorder_listener: Option<Arc<dyn PacketListener>>,
    recording_name: String,

    has_manual_lease: bool,
}

/// The application controller. Construct with [`Controller::new`], then
/// call [`Controller::run`] on the main thread; every other operation may be
/// invoked concurrently from any thread.
pub struct Controller {
    storage: Storage,
    router: Arc<Router>,
    discovery: Arc<DiscoveryRegistry>,
    proxy: Arc<ProxyManager>,
    snapshots: Option<Arc<SnapshotManager>>,
    system: SystemControl,
    max_lag_age: Duration,
    auto_resume_delay: Duration,
    state: Mutex<CtrlState>,
}

struct ProxyPlaybackLeaser {
    manager: Arc<ProxyManager>,
}

impl PlaybackLeaser for ProxyPlaybackLeaser {
    fn acquire_playback_lease(&self) {
        self.manager.add_lease(PLAYBACK_LEASE_HOLDER);
    }
    fn release_playback_lease(&self) {
        self.manager.remove_lease(PLAYBACK_LEASE_HOLDER);
    }
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Storage,
        router: Arc<Router>,
        discovery: Arc<DiscoveryRegistry>,
        proxy: Arc<ProxyManager>,
        snapshots: Option<Arc<SnapshotManager>>,
        max_lag_age: Duration,
        auto_resume_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            router,
            discovery,
            proxy,
            snapshots,
            system: SystemControl::new(),
            max_lag_age,
            auto_resume_delay,
            state: Mutex::new(CtrlState::default()),
        })
    }

    fn running(&self) -> bool {
        self.state.lock().running
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running() {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }

    /// Run until `token` is cancelled. Plays the default file, if one is
    /// set, before blocking.
    pub fn run(self: &Arc<Self>, token: CancelToken) -> Result<()> {
        let default_name = self.storage.get_default()?;

        {
            let mut st = self.state.lock();
            assert!(!st.running, "controller is already running");
            st.running = true;
            st.run_token = Some(token.clone());
            st.start_time = Some((SystemTime::now(), Instant::now()));
            self.stop_task_locked(&mut st);
        }

        if !default_name.is_empty() {
            log::info!("playing default file {:?}", default_name);
            if let Err(e) = self.play_file(&default_name) {
                log::warn!("failed to play default file {:?}: {}", default_name, e);
            }
        }

        token.wait();

        let mut st = self.state.lock();
        if st.has_manual_lease {
            self.proxy.remove_lease(MANUAL_LEASE_HOLDER);
            st.has_manual_lease = false;
        }
        self.stop_task_locked(&mut st);
        st.running = false;
        st.run_token = None;
        Ok(())
    }

    /// Offer a captured packet for handling. Subsystems may call this before
    /// the controller runs; it is deliberately a no-op either way.
    pub fn handle_packet(&self, _device_id: &str, _packet: &[u8]) {
        let _ = self.running();
    }

    pub fn status(&self) -> ControllerStatus {
        let st = self.state.lock();

        let playback = st.player.as_ref().map(|player| {
            let s = player.status();
            let progress_percent = if !s.duration.is_zero() && s.position < s.duration {
                Some((s.position.as_secs_f64() / s.duration.as_secs_f64() * 100.0) as u32)
            } else {
                None
            };
            let mut no_route_devices: Vec<String> = s
                .no_route_devices
                .iter()
                .map(|e| {
                    if e.ordinal.is_valid() {
                        format!("{} {} ({})", e.ordinal, e.id, e.count)
                    } else {
                        format!("{} ({})", e.id, e.count)
                    }
                })
                .collect();
            no_route_devices.sort();

            PlaybackStatusInfo {
                name: st.playing_name.clone(),
                rounds: s.rounds,
                position: s.position,
                duration: s.duration,
                total_playtime: s.total_playtime,
                paused: s.paused,
                progress_percent,
                no_route_devices,
            }
        });

        let record = st.recorder.as_ref().map(|recorder| {
            let s = recorder.status();
            RecordStatusInfo {
                name: s.name,
                events: s.events,
                bytes: s.bytes,
                duration: s.duration,
                error: s.error,
            }
        });

        ControllerStatus {
            start_time: st.start_time.map(|(wall, _)| wall),
            uptime: st
                .start_time
                .map(|(_, mono)| mono.elapsed())
                .unwrap_or_default(),
            proxy_forwarding: self.proxy.forwarding(),
            disabling_proxy_forwarding: st.has_manual_lease,
            playback,
            record,
        }
    }

    /// All known devices, discovered and proxy, sorted for display.
    pub fn devices(&self) -> Vec<DeviceInfo> {
        let mut infos: Vec<DeviceInfo> = self
            .discovery
            .devices()
            .iter()
            .chain(self.proxy.proxy_devices().iter())
            .map(|d| {
                let mut info = d.info();
                if let Some(snapshots) = &self.snapshots {
                    info.has_snapshot = snapshots.has_snapshot(d.id());
                }
                info
            })
            .collect();

        infos.sort_by(|a, b| {
            a.group
                .cmp(&b.group)
                .then(a.controller.cmp(&b.controller))
                .then(a.kind.cmp(&b.kind))
                .then(a.proxied_id.cmp(&b.proxied_id))
                .then(a.id.cmp(&b.id))
        });
        infos
    }

    /// The sampled strips for a discovered device; empty when snapshots are
    /// disabled or nothing has been sampled yet.
    pub fn strips(&self, device_id: &str) -> Vec<StripState> {
        let snapshots = match &self.snapshots {
            Some(s) => s,
            None => return Vec::new(),
        };
        if !self.discovery.devices().iter().any(|d| d.id() == device_id) {
            log::info!("no device registered for {:?}", device_id);
            return Vec::new();
        }
        snapshots.snapshot_for(device_id).unwrap_or_default()
    }

    pub fn list_files(&self) -> Result<FileList> {
        self.ensure_running()?;

        let default_file_name = self.storage.get_default()?;
        let mut files: Vec<FileInfo> = self
            .storage
            .list_files()?
            .into_iter()
            .map(|f| {
                let max_strips = f
                    .metadata
                    .devices
                    .iter()
                    .map(|d| d.strips_attached as u32)
                    .max()
                    .unwrap_or(0);
                let max_pixels_per_strip = f
                    .metadata
                    .devices
                    .iter()
                    .map(|d| d.pixels_per_strip as u32)
                    .max()
                    .unwrap_or(0);
                FileInfo {
                    name: f.display_name.clone(),
                    num_devices: f.metadata.devices.len(),
                    max_strips,
                    max_pixels_per_strip,
                    disk_bytes: f.size,
                    num_bytes: f.metadata.num_bytes,
                    num_events: f.metadata.num_events,
                    compression: f.metadata.compression.to_string(),
                    created_unix: f.metadata.created_unix,
                    duration: Duration::from_micros(f.metadata.duration_us),
                    is_default: f.display_name == default_file_name,
                }
            })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(FileList {
            default_file_name,
            files,
        })
    }

    /// Start recording proxied traffic to a new stream named `name`.
    pub fn record_file(self: &Arc<Self>, name: &str) -> Result<()> {
        log::info!("beginning recording for {:?}", name);
        self.ensure_running()?;

        let mut st = self.state.lock();
        self.stop_task_locked(&mut st);

        let writer = match self.storage.open_writer(name) {
            Ok(w) => w,
            Err(e) => {
                log::error!("could not open output file {:?}: {}", name, e);
                return Err(e);
            }
        };

        let recorder = Arc::new(Recorder::new(writer));
        let (listener, rx) = RecorderListener::channel();
        let listener: Arc<dyn PacketListener> = listener;

        // Drain thread: pulls from the bounded queue so disk stalls back up
        // the queue, not the proxy sockets. A fatal recorder error detaches
        // the listener and stops the task so status reflects reality.
        {
            let recorder = Arc::clone(&recorder);
            let listener = Arc::clone(&listener);
            let ctrl = Arc::downgrade(self);
            std::thread::Builder::new()
                .name("recorder-drain".to_string())
                .spawn(move || {
                    while let Ok((device, packet)) = rx.recv() {
                        match recorder.record_packet(&device, &packet) {
                            Ok(()) => {}
                            Err(Error::Encoding(e)) => {
                                log::warn!(
                                    "unsupported encoding for packet from device {}: {}",
                                    device.id(),
                                    e
                                );
                            }
                            Err(e) => {
                                log::warn!(
                                    "error recording packet for device {}: {}",
                                    device.id(),
                                    e
                                );
                                if let Some(ctrl) = ctrl.upgrade() {
                                    ctrl.proxy.remove_listener(&listener);
                                    if let Err(e) = ctrl.stop() {
                                        log::warn!("failed to stop after recorder error: {}", e);
                                    }
                                }
                                break;
                            }
                        }
                    }
                    log::debug!("recorder drain stopped");
                })?;
        }

        self.proxy.add_listener(Arc::clone(&listener));
        st.recorder = Some(recorder);
        st.recorder_listener = Some(listener);
        st.recording_name = sanitize_display_name(name);
        Ok(())
    }

    /// Start playback of a stored stream.
    pub fn play_file(self: &Arc<Self>, name: &str) -> Result<()> {
        log::info!("playing file {:?}", name);
        self.ensure_running()?;

        let mut st = self.state.lock();
        self.stop_task_locked(&mut st);

        let reader = match self.storage.open_reader(name) {
            Ok(r) => r,
            Err(e) => {
                log::error!("could not open {:?} for playback: {}", name, e);
                return Err(e);
            }
        };

        let leaser = Arc::new(ProxyPlaybackLeaser {
            manager: Arc::clone(&self.proxy),
        });
        let router = Arc::clone(&self.router);
        let route: RouteFn = Arc::new(move |ordinal, id, packet| router.route(ordinal, id, packet));
        let token = st.run_token.clone().ok_or(Error::NotRunning)?;

        let player = Player::play(
            reader,
            route,
            leaser,
            self.proxy.group_offset(),
            self.max_lag_age,
            &token,
        )?;
        st.player = Some(player);
        st.playing_name = sanitize_display_name(name);
        Ok(())
    }

    /// Pause the current playback and arm auto-resume, if configured.
    pub fn pause_file(self: &Arc<Self>) -> Result<()> {
        log::info!("pausing playback");
        self.ensure_running()?;

        let mut st = self.state.lock();
        if let Some(player) = &st.player {
            player.pause();
        }

        if st.auto_resume.is_none() && !self.auto_resume_delay.is_zero() {
            let token = st.run_token.clone().ok_or(Error::NotRunning)?;
            let ctrl = Arc::downgrade(self);
            let listener = AutoResumeListener::start(
                Arc::clone(&self.proxy),
                self.auto_resume_delay,
                &token,
                move || {
                    if let Some(ctrl) = ctrl.upgrade() {
                        if let Err(e) = ctrl.resume_file() {
                            log::warn!("failed to auto-resume playback: {}", e);
                        }
                    }
                },
            )?;
            st.auto_resume = Some(listener);
        }
        Ok(())
    }

    /// Resume a paused playback, disarming auto-resume.
    pub fn resume_file(&self) -> Result<()> {
        log::info!("resuming playback");
        self.ensure_running()?;

        let mut st = self.state.lock();
        if let Some(mut listener) = st.auto_resume.take() {
            listener.stop();
        }
        if let Some(player) = &st.player {
            player.resume();
        }
        Ok(())
    }

    /// Stop whatever task is running. Idempotent.
    pub fn stop(&self) -> Result<()> {
        self.ensure_running()?;
        log::info!("received stop command");

        let mut st = self.state.lock();
        self.stop_task_locked(&mut st);
        Ok(())
    }

    /// Delete a stored stream, stopping the current task first if it uses
    /// the stream.
    pub fn delete_file(&self, name: &str) -> Result<()> {
        log::info!("deleting file {:?}", name);
        self.ensure_running()?;

        let name = sanitize_display_name(name);
        let mut st = self.state.lock();
        if (st.recorder.is_some() && st.recording_name == name)
            || (st.player.is_some() && st.playing_name == name)
        {
            self.stop_task_locked(&mut st);
        }
        self.storage.delete_file(&name)
    }

    /// Merge stored streams into a new one. Independent of the current task.
    pub fn merge_files(&self, dest: &str, srcs: &[String]) -> Result<()> {
        log::info!("merging {} file(s) into {:?}: {:?}", srcs.len(), dest, srcs);
        self.ensure_running()?;
        if srcs.is_empty() {
            return Err(Error::InvalidInput("no source files".to_string()));
        }
        self.storage.merge_files(dest, srcs)
    }

    /// Persist the default file name; empty clears it.
    pub fn set_default_file(&self, name: &str) -> Result<()> {
        self.ensure_running()?;
        if name.is_empty() {
            log::info!("clearing default file");
        } else {
            log::info!("setting default file to {:?}", name);
        }
        self.storage.set_default(name)
    }

    /// Enable or disable forwarding via the controller's manual lease.
    pub fn set_proxy_forwarding(&self, forward: bool) -> Result<()> {
        let mut st = self.state.lock();
        if forward {
            if st.has_manual_lease {
                log::info!("controller unblocking proxy forwarding");
                self.proxy.remove_lease(MANUAL_LEASE_HOLDER);
                st.has_manual_lease = false;
            }
        } else if !st.has_manual_lease {
            log::info!("controller blocking proxy forwarding");
            self.proxy.add_lease(MANUAL_LEASE_HOLDER);
            st.has_manual_lease = true;
        }
        Ok(())
    }

    pub fn system_state(&self) -> SystemStateInfo {
        if self.system.available() {
            SystemStateInfo {
                available: true,
                status: "working".to_string(),
            }
        } else {
            SystemStateInfo {
                available: false,
                status: "power control unavailable on this platform".to_string(),
            }
        }
    }

    /// Stop the current task and power the host off (or reboot it).
    pub fn shutdown(&self, restart: bool) -> Result<()> {
        log::warn!("received shutdown command (restart={})", restart);
        if let Err(e) = self.stop() {
            log::error!("failed to stop running tasks; shutting down anyway: {}", e);
        }
        self.system.shutdown(restart)
    }

    /// Shut down the current recorder or player. Idempotent; caller holds
    /// the state lock.
    fn stop_task_locked(&self, st: &mut CtrlState) {
        if let Some(mut player) = st.player.take() {
            log::info!("stopping player");
            player.stop();
            st.playing_name.clear();
        }

        if let Some(mut listener) = st.auto_resume.take() {
            log::info!("stopping auto-resume listener");
            listener.stop();
        }

        if let Some(listener) = st.recorder_listener.take() {
            self.proxy.remove_listener(&listener);
        }
        if let Some(recorder) = st.recorder.take() {
            log::info!("stopping recorder");
            if let Err(e) = recorder.stop() {
                log::warn!("failed to stop recorder: {}", e);
            }
            st.recording_name.clear();
        }
    }
}
