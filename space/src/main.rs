//! The parsec space-server binary: parse options, bind the ODP/OHDP UDP
//! endpoints, assemble a [`SpaceServer`], and run the poll loop until a
//! shutdown signal arrives.
//!
//! Exit codes: 0 on graceful shutdown, 1 on startup failure, 2 on a fatal
//! runtime error.

use std::io::ErrorKind;
use std::net::UdpSocket;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use log::{error, info, warn};
use parsec_shared::{OdpDatagram, OhdpDatagram, SpaceInstant, TimeSource};
use parsec_space::{
    MemoryStore, SpaceConfig, SpaceContext, SpaceOpts, SpaceServer, WorkPool,
};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        extern "C" fn on_sigint(_signal: libc::c_int) {
            SHUTDOWN.store(true, Ordering::Release);
        }

        fn install_shutdown_handler() {
            unsafe {
                libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
                libc::signal(libc::SIGTERM, on_sigint as libc::sighandler_t);
            }
        }
    } else {
        fn install_shutdown_handler() {
            warn!("no shutdown signal handling on this platform");
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let opts = SpaceOpts::parse();
    let config = match SpaceConfig::from_opts(opts) {
        Ok(config) => config,
        Err(error) => {
            error!("invalid configuration: {}", error);
            return ExitCode::from(1);
        }
    };

    match run(config) {
        Ok(()) => ExitCode::from(0),
        Err(RunError::Startup(message)) => {
            error!("startup failed: {}", message);
            ExitCode::from(1)
        }
        Err(RunError::Fatal(message)) => {
            error!("fatal runtime error: {}", message);
            ExitCode::from(2)
        }
    }
}

enum RunError {
    Startup(String),
    Fatal(String),
}

fn bind(addr: std::net::SocketAddr, what: &str) -> Result<UdpSocket, RunError> {
    let socket = UdpSocket::bind(addr)
        .map_err(|error| RunError::Startup(format!("cannot bind {} on {}: {}", what, addr, error)))?;
    socket
        .set_nonblocking(true)
        .map_err(|error| RunError::Startup(format!("cannot configure {}: {}", what, error)))?;
    Ok(socket)
}

fn run(config: SpaceConfig) -> Result<(), RunError> {
    install_shutdown_handler();

    let server_socket = bind(config.listen_server, "server endpoint")?;
    let object_socket = bind(config.listen_object, "object endpoint")?;

    let time = TimeSource::new(SpaceInstant::EPOCH);
    let ctx = SpaceContext::new(config.server_id, config.space, time);

    // only the local backend ships; from_opts already rejected the rest
    let store = Box::new(MemoryStore::new());

    let pool = WorkPool::new(config.workers);
    let telemetry = pool.strand("telemetry");

    let mut server = SpaceServer::new(ctx.clone(), config.server.clone(), store, ctx.now());
    server.set_peers(config.peers.clone());
    info!(
        "space server {} up: {} peers, tick {}",
        config.server_id,
        config.peers.len(),
        config.tick
    );

    let tick = Duration::from_millis((config.tick.as_micros() / 1000).max(1) as u64);
    let mut recv_buffer = vec![0u8; 64 * 1024];
    let mut last_report = Instant::now();

    while !SHUTDOWN.load(Ordering::Acquire) {
        let started = Instant::now();
        let now = ctx.now();

        // inbound inter-server datagrams
        loop {
            match server_socket.recv_from(&mut recv_buffer) {
                Ok((length, _from)) => match OhdpDatagram::decode(&recv_buffer[..length]) {
                    Ok(datagram) => server.handle_server_datagram(datagram, now),
                    Err(error) => {
                        warn!("undecodable ohdp datagram: {}", error);
                    }
                },
                Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error) => {
                    return Err(RunError::Fatal(format!("server socket failed: {}", error)))
                }
            }
        }

        // inbound object-host datagrams
        loop {
            match object_socket.recv_from(&mut recv_buffer) {
                Ok((length, _from)) => match OdpDatagram::decode(&recv_buffer[..length]) {
                    Ok(datagram) => server.handle_object_datagram(datagram, now),
                    Err(error) => {
                        warn!("undecodable odp datagram: {}", error);
                    }
                },
                Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error) => {
                    return Err(RunError::Fatal(format!("object socket failed: {}", error)))
                }
            }
        }

        for event in server.drain_session_events() {
            info!("session event: {:?}", event);
        }

        // drive the node and ship what it owes the network
        for datagram in server.tick(now) {
            let Some(addr) = config.peer_addrs.get(&datagram.header.dest_server) else {
                warn!("no address for peer {}", datagram.header.dest_server);
                continue;
            };
            if let Err(error) = server_socket.send_to(&datagram.encode(), addr) {
                if error.kind() != ErrorKind::WouldBlock {
                    warn!("send to {} failed: {}", addr, error);
                }
            }
        }

        if last_report.elapsed() >= Duration::from_secs(60) {
            last_report = Instant::now();
            // off the hot loop; the telemetry strand serializes reports
            let counters = ctx.counters.clone();
            let server_id = ctx.server_id;
            telemetry.post(move || counters.report(server_id));
        }

        let elapsed = started.elapsed();
        if elapsed < tick {
            std::thread::sleep(tick - elapsed);
        }
    }

    info!("shutting down");
    ctx.counters.report(ctx.server_id);
    pool.shutdown();
    Ok(())
}
