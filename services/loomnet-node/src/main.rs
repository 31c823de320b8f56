//! Loomnet routing daemon.
//!
//! Single-threaded event loop over one UDP socket: boot (restore the saved
//! maps or hook into the network), then alternate between serving inbound
//! frames and driving periodic radar cycles. The map snapshot is saved after
//! every completed cycle, so a crash loses at most one interval of topology.

use loomnet_core::{logging, Config, RadarConfig};
use loomnet_mesh::{
    AddrFamily, MapDb, MapStore, MeshError, MeshFrame, MeshPayload, MeshResult,
    NoopKernelRoutes, PeerAddr, RadarReport, RadarScanner, RoutingContext, Transport,
};
use serde::Serialize;
use std::io::ErrorKind;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const NODE_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    protocol_version: u32,
}

/// UDP-backed transport. Frames are JSON datagrams; broadcast goes to the
/// configured link broadcast address.
struct UdpTransport {
    socket: UdpSocket,
    broadcast_addr: String,
}

impl UdpTransport {
    fn new(socket: UdpSocket, broadcast_addr: String) -> Self {
        Self {
            socket,
            broadcast_addr,
        }
    }
}

impl Transport for UdpTransport {
    fn send(&self, to: &PeerAddr, frame: &MeshFrame) -> MeshResult<()> {
        let bytes = serde_json::to_vec(frame)?;
        self.socket.send_to(&bytes, to.as_str())?;
        Ok(())
    }

    fn broadcast(&self, frame: &MeshFrame) -> MeshResult<()> {
        let bytes = serde_json::to_vec(frame)?;
        self.socket.send_to(&bytes, self.broadcast_addr.as_str())?;
        Ok(())
    }

    fn request(
        &self,
        to: &PeerAddr,
        frame: &MeshFrame,
        timeout: Duration,
    ) -> MeshResult<MeshFrame> {
        self.send(to, frame)?;
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(MeshError::Timeout(format!("no reply from {to}")));
            }
            self.socket.set_read_timeout(Some(deadline - now))?;
            match self.socket.recv_from(&mut buf) {
                Ok((n, src)) => {
                    if src.to_string() != *to {
                        continue;
                    }
                    let reply: MeshFrame = match serde_json::from_slice(&buf[..n]) {
                        Ok(frame) => frame,
                        Err(_) => continue,
                    };
                    if matches!(
                        reply.payload,
                        MeshPayload::FreeSlotsReply(_) | MeshPayload::MapReply(_)
                    ) {
                        return Ok(reply);
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config_path = parse_config_path(&args)?;
    let config = Config::from_file(&config_path)?;
    if config.node.log_json {
        logging::init_json();
    } else {
        logging::init();
    }

    let family = AddrFamily::from_name(&config.node.family)?;
    let mut db = MapDb::open(&config.node.map_db)?;

    let socket = UdpSocket::bind(("0.0.0.0", config.transport.listen_port))?;
    socket.set_broadcast(true)?;
    let transport = Arc::new(UdpTransport::new(
        socket.try_clone()?,
        config.transport.broadcast_addr.clone(),
    ));

    let (addr, store, fresh) = match db.load()? {
        Some((addr, snapshot)) => {
            info!(addr = %addr, "restored saved maps");
            (addr, MapStore::from_snapshot(&snapshot), false)
        }
        None => {
            info!("no saved state; hooking into the network");
            let report = loomnet_mesh::run_hook(
                family,
                &config.hook,
                transport.as_ref(),
                &mut rand::thread_rng(),
                |hooking| hook_scan(&socket, transport.as_ref(), &config.radar, hooking),
            )?;
            (report.addr, report.store, true)
        }
    };
    info!(addr = %addr, port = config.transport.listen_port, "node online");

    let mut ctx = RoutingContext::new(
        addr,
        store,
        config.radar.clone(),
        transport.clone(),
        Arc::new(NoopKernelRoutes),
    );
    if fresh {
        db.save(ctx.local(), &ctx.store().snapshot())?;
    }

    run_event_loop(
        &socket,
        transport.as_ref(),
        &mut ctx,
        &mut db,
        &config.radar,
        fresh,
    )
}

/// Serve frames and drive radar cycles forever. A freshly hooked node
/// announces itself at every level once its first cycle has confirmed the
/// neighbors to relay through.
fn run_event_loop(
    socket: &UdpSocket,
    transport: &dyn Transport,
    ctx: &mut RoutingContext,
    db: &mut MapDb,
    radar_cfg: &RadarConfig,
    mut announce_pending: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    socket.set_read_timeout(Some(Duration::from_millis(500)))?;
    let interval = Duration::from_secs(radar_cfg.interval_secs);
    let wait = Duration::from_secs(radar_cfg.wait_secs);

    let mut buf = vec![0u8; 64 * 1024];
    let mut next_radar = Instant::now();
    let mut radar_deadline: Option<Instant> = None;

    loop {
        if radar_deadline.is_some_and(|d| Instant::now() >= d) {
            radar_deadline = None;
            match ctx.finish_radar() {
                Ok(report) => {
                    debug!(
                        neighbors = report.neighbors.len(),
                        added = report.added.len(),
                        removed = report.removed.len(),
                        "radar cycle complete"
                    );
                    if announce_pending && !report.neighbors.is_empty() {
                        ctx.announce();
                        announce_pending = false;
                    }
                    if let Err(err) = db.save(ctx.local(), &ctx.store().snapshot()) {
                        warn!(%err, "snapshot save failed");
                    }
                }
                Err(err) => warn!(%err, "radar cycle failed"),
            }
        }

        if radar_deadline.is_none() && Instant::now() >= next_radar {
            next_radar = Instant::now() + interval;
            match ctx.start_radar() {
                Ok(()) => radar_deadline = Some(Instant::now() + wait),
                Err(err) => warn!(%err, "could not start radar cycle"),
            }
        }

        match socket.recv_from(&mut buf) {
            Ok((n, src)) => {
                let from = src.to_string();
                let frame: MeshFrame = match serde_json::from_slice(&buf[..n]) {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!(from = %from, %err, "undecodable datagram");
                        continue;
                    }
                };
                match ctx.handle_frame(&from, &frame) {
                    Ok(Some(reply)) => {
                        if let Err(err) = transport.send(&from, &reply) {
                            warn!(from = %from, %err, "reply failed");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => debug!(from = %from, %err, "frame dropped"),
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// One blocking discovery cycle used while hooking, before any map store
/// exists: probe, collect echoes until the wait window closes, report what
/// answered.
fn hook_scan(
    socket: &UdpSocket,
    transport: &dyn Transport,
    cfg: &RadarConfig,
    hooking: bool,
) -> MeshResult<RadarReport> {
    let scanner = RadarScanner::new();
    let mut cycle = scanner.begin()?;
    let frame = MeshFrame::anonymous(MeshPayload::RadarProbe {
        echo_id: cycle.echo_id(),
        hooking,
    });

    let start = Instant::now();
    for _ in 0..cfg.scans {
        match transport.broadcast(&frame) {
            Ok(()) => cycle.record_probe_sent(),
            Err(err) => warn!(%err, "hook probe failed"),
        }
    }

    let deadline = start + Duration::from_secs(cfg.wait_secs);
    let mut buf = vec![0u8; 64 * 1024];
    socket.set_read_timeout(Some(Duration::from_millis(200)))?;
    while Instant::now() < deadline {
        match socket.recv_from(&mut buf) {
            Ok((n, src)) => {
                let Ok(reply) = serde_json::from_slice::<MeshFrame>(&buf[..n]) else {
                    continue;
                };
                if let MeshPayload::RadarEcho {
                    echo_id,
                    hier,
                    hooking,
                } = reply.payload
                {
                    if echo_id == cycle.echo_id() {
                        // Half the round trip, as the settled radar records it
                        let rtt_ms = (start.elapsed().as_millis() / 2) as u32;
                        cycle.record_echo(src.to_string(), hier, rtt_ms, hooking);
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let neighbors = cycle.observations()?;
    scanner.finish(Vec::new());
    Ok(RadarReport {
        neighbors,
        ..RadarReport::default()
    })
}

fn parse_config_path(args: &[String]) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(PathBuf::from(path));
            }
            return Err("--config was provided without a path".into());
        }
    }

    Err("missing required --config <path> argument".into())
}
