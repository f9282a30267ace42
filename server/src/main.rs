use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use server::config::ServerConfig;
use server::lobby::Lobby;
use server::net;

#[derive(Parser, Debug)]
#[command(about = "Multi-room Sedma card game server", version)]
struct Args {
    /// INI-style configuration file
    #[arg(short = 'c', long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Listen address (overrides the config file)
    #[arg(long)]
    ip: Option<String>,

    /// Listen port (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Client slot limit, capped at 128
    #[arg(long)]
    max_clients: Option<usize>,

    /// Room limit, capped at 64
    #[arg(long)]
    max_rooms: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let args = Args::parse();

    let mut cfg = ServerConfig::default();
    if let Some(path) = &args.config {
        if let Err(err) = cfg.load_file(path) {
            warn!("cannot load config file {}, using defaults: {err}", path.display());
        }
    }
    if let Some(ip) = args.ip {
        cfg.ip = ip;
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(max_clients) = args.max_clients {
        cfg.max_clients = max_clients;
    }
    if let Some(max_rooms) = args.max_rooms {
        cfg.max_rooms = max_rooms;
    }
    if let Err(err) = cfg.validate_and_clamp() {
        error!("invalid configuration: {err}");
        return ExitCode::from(2);
    }
    info!(
        ip = %cfg.ip,
        port = cfg.port,
        max_clients = cfg.max_clients,
        max_rooms = cfg.max_rooms,
        "config loaded"
    );

    let listener = match TcpListener::bind((cfg.ip.as_str(), cfg.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("listen failed on {}:{}: {err}", cfg.ip, cfg.port);
            return ExitCode::from(1);
        }
    };
    info!("listening on {}:{}", cfg.ip, cfg.port);
    info!("type 'quit' or 'exit' to stop");

    let lobby = Arc::new(Mutex::new(Lobby::new(cfg.max_clients, cfg.max_rooms)));

    let tick_lobby = Arc::clone(&lobby);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(250));
        loop {
            ticker.tick().await;
            tick_lobby.lock().await.tick(net::unix_now());
        }
    });

    let (quit_tx, mut quit_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let cmd = line.trim();
                    if cmd == "quit" || cmd == "exit" || cmd == "q" {
                        let _ = quit_tx.send(()).await;
                        break;
                    }
                }
                Ok(None) | Err(_) => {
                    let _ = quit_tx.send(()).await;
                    break;
                }
            }
        }
    });

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!("cannot install SIGTERM handler: {err}");
            return ExitCode::from(1);
        }
    };

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "accepted connection");
                        tokio::spawn(net::handle_connection(stream, Arc::clone(&lobby)));
                    }
                    Err(err) => warn!("accept failed: {err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
            _ = quit_rx.recv() => break,
        }
    }

    info!("shutting down");
    lobby.lock().await.shutdown();
    ExitCode::SUCCESS
}
