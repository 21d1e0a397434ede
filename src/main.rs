//! PixelProxy - recording and replaying proxy daemon for PixelPusher LED
//! controllers

use pixelproxy::cancel::{run_every, CancelToken};
use pixelproxy::config::Config;
use pixelproxy::controller::Controller;
use pixelproxy::device::{Device, ListenerFn, Registry, Router, SnapshotManager};
use pixelproxy::protocol::Packet;
use pixelproxy::discovery::{DiscoveryRegistry, Listener, Transmitter};
use pixelproxy::error::Result;
use pixelproxy::net;
use pixelproxy::proxy::ProxyManager;
use pixelproxy::storage::Storage;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("PixelProxy v0.4.0 starting...");

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/pixelproxy.toml".to_string());
    log::info!("using config: {}", config_path);
    let config = Config::load(&config_path)?;

    // Resolve the validated pieces up front so a bad config fails here.
    let prefix = config.proxy_mac_prefix()?;
    let proxy_ip = config.proxy_advertise_ip()?;
    let compression = config.compression()?;
    let listen_addr = net::parse_addr(&config.network.listen_address)?;
    let broadcast_addr = net::parse_addr(&config.network.broadcast_address)?;

    // File storage.
    let storage = Storage::new(PathBuf::from(&config.storage.root), compression);
    storage.prepare()?;

    // Root cancellation token; SIGINT/SIGTERM fire it.
    let token = CancelToken::new();
    setup_signal_handler(token.clone())?;

    // Registry of all devices, real and proxy, shared with the router.
    let registry = Arc::new(Registry::new());
    let router = Arc::new(Router::new(Arc::clone(&registry)));

    // Proxy manager pairs each discovered device with a proxy device.
    let proxy_manager = ProxyManager::new(
        prefix,
        proxy_ip,
        config.proxy.group_offset,
        Arc::clone(&registry),
        token.child(),
    );

    // Optional pixel snapshots for previews. Packets come from two places:
    // proxied traffic that was forwarded, and playback traffic sent through
    // the router (which never crosses a proxy socket).
    let snapshots = if config.snapshot.enabled {
        let snapshots = Arc::new(SnapshotManager::new(config.snapshot_sample_rate()));

        let sampler = Arc::clone(&snapshots);
        proxy_manager.add_listener(Arc::new(ListenerFn(
            move |device: &Arc<Device>, packet: &Packet, forwarded: bool| {
                // Dropped packets never reached the device, so they are not
                // representative of its state.
                if forwarded {
                    sampler.handle_packet(device, packet);
                }
            },
        )));

        let sampler = Arc::clone(&snapshots);
        router.add_listener(Arc::new(ListenerFn(
            move |device: &Arc<Device>, packet: &Packet, _forwarded: bool| {
                sampler.handle_packet(device, packet);
            },
        )));

        Some(snapshots)
    } else {
        None
    };

    // Periodic discovery broadcast for the proxy devices.
    let transmitter = Transmitter::new(SocketAddr::V4(broadcast_addr));
    {
        let proxy_manager = Arc::clone(&proxy_manager);
        let broadcast_token = token.child();
        let period = config.broadcast_period();
        std::thread::Builder::new()
            .name("proxy-broadcast".to_string())
            .spawn(move || {
                let result = run_every(&broadcast_token, period, || {
                    let devices = proxy_manager.proxy_devices();
                    log::trace!("broadcasting discovery for {} proxy device(s)", devices.len());
                    for device in devices {
                        if let Err(e) = transmitter.broadcast(&device.headers()) {
                            log::warn!(
                                "failed to broadcast discovery for proxy {}: {}",
                                device.id(),
                                e
                            );
                        }
                    }
                    Ok(())
                });
                if let Err(e) = result {
                    if !e.is_cancelled() {
                        log::error!("proxy discovery broadcast failed: {}", e);
                    }
                }
            })?;
    }

    // Discovery listener: upserts devices and pairs them with proxies.
    // Filters our own proxy prefix so we never proxy a proxy.
    let discovery_registry = Arc::new(DiscoveryRegistry::new(
        Arc::clone(&registry),
        config.discovery_expiration(),
    ));
    {
        let socket = net::listener_socket(listen_addr)?;
        log::info!("listening for discovery on {}", socket.local_addr()?);

        let filter_manager = Arc::clone(&proxy_manager);
        let listener = Listener::new(socket)
            .with_filter(move |headers| !filter_manager.is_proxy_device_addr(&headers.mac));

        let discovery_registry = Arc::clone(&discovery_registry);
        let proxy_manager = Arc::clone(&proxy_manager);
        let listen_token = token.child();
        std::thread::Builder::new()
            .name("discovery-listener".to_string())
            .spawn(move || {
                let result = listener.run(&listen_token, |headers| {
                    let (device, _new) = discovery_registry.observe(headers);
                    if let Err(e) = proxy_manager.add_device(&device) {
                        log::error!("could not create proxy for device {}: {}", device.id(), e);
                    }
                });
                if let Err(e) = result {
                    if !e.is_cancelled() {
                        log::error!("discovery listener failed: {}", e);
                    }
                }
            })?;
    }

    // Expiration sweeper tears down the proxy paired with a dead device.
    let _sweeper = {
        let proxy_manager = Arc::clone(&proxy_manager);
        discovery_registry.start_sweeper(token.child(), move |device| {
            proxy_manager.remove_device(device.id());
        })?
    };

    // Run the controller until the root token is cancelled.
    let controller = Controller::new(
        storage,
        Arc::clone(&router),
        Arc::clone(&discovery_registry),
        Arc::clone(&proxy_manager),
        snapshots,
        config.max_lag_age(),
        config.auto_resume_delay(),
    );

    log::info!("PixelProxy running. Press Ctrl-C to stop.");
    let result = controller.run(token);

    log::info!("shutting down...");
    proxy_manager.close();
    router.shutdown();

    log::info!("PixelProxy stopped");
    result
}

fn setup_signal_handler(token: CancelToken) -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                log::info!("received signal {:?}, initiating shutdown...", sig);
                token.cancel();
            }
        })?;
    Ok(())
}
