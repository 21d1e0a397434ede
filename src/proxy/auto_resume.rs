//! Auto-resume after external traffic goes quiet.
//!
//! Armed while playback is paused. Every packet observed on a proxy socket
//! refreshes a timestamp; once a packet has been seen and the configured
//! delay then passes without another, the listener fires its callback (the
//! controller's resume) and retires. If no packet ever arrives the listener
//! stays armed until stopped.

use crate::cancel::CancelToken;
use crate::device::{Device, ListenerFn, PacketListener};
use crate::error::Result;
use crate::protocol::Packet;
use crate::proxy::ProxyManager;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub struct AutoResumeListener {
    manager: Arc<ProxyManager>,
    listener: Arc<dyn PacketListener>,
    token: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl AutoResumeListener {
    /// Attach to the proxy manager and start the delay timer.
    ///
    /// `on_delay` runs at most once, from the timer thread.
    pub fn start<F>(
        manager: Arc<ProxyManager>,
        delay: Duration,
        parent: &CancelToken,
        on_delay: F,
    ) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let last_packet: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));

        let stamp = Arc::clone(&last_packet);
        let listener: Arc<dyn PacketListener> =
            Arc::new(ListenerFn(move |_: &Arc<Device>, _: &Packet, _: bool| {
                *stamp.lock() = Some(Instant::now());
            }));
        manager.add_listener(Arc::clone(&listener));

        let token = parent.child();
        let tick = (delay / 4).max(Duration::from_millis(50));
        let thread = {
            let token = token.clone();
            let last_packet = Arc::clone(&last_packet);
            std::thread::Builder::new()
                .name("auto-resume".to_string())
                .spawn(move || {
                    loop {
                        if token.sleep(tick).is_err() {
                            return;
                        }
                        let elapsed = last_packet.lock().map(|t| t.elapsed());
                        if let Some(elapsed) = elapsed {
                            if elapsed >= delay {
                                break;
                            }
                        }
                    }
                    if !token.is_cancelled() {
                        log::info!("proxy traffic quiet; auto-resuming");
                        on_delay();
                    }
                })?
        };

        Ok(Self {
            manager,
            listener,
            token,
            thread: Some(thread),
        })
    }

    /// Detach from the proxy manager and stop the timer.
    ///
    /// The timer thread is detached rather than joined: the callback path
    /// runs controller operations that may themselves stop this listener,
    /// and a join from under the controller lock would deadlock against a
    /// callback waiting for that lock. A cancelled timer thread exits on its
    /// next tick.
    pub fn stop(&mut self) {
        self.token.cancel();
        self.manager.remove_listener(&self.listener);
        self.thread.take();
    }
}

impl Drop for AutoResumeListener {
    fn drop(&mut self) {
        self.stop();
    }
}
