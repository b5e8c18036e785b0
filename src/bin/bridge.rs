use clap::{App, Arg};
use oibus::bridge::BridgeAdapter;
use oibus::config::{Board, BridgeConfig};
use oibus::connection::Connection;
use oibus::transport::{SerialTransport, SimConfig, SimTransport};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("oibus-bridge")
        .version("0.1.0")
        .about("Bridges block-programming requests to a Roomba over the Open Interface")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("board")
                .short("b")
                .long("board")
                .value_name("BOARD")
                .help("Host board: pi, usb or sim")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("device")
                .short("d")
                .long("device")
                .value_name("PATH")
                .help("Serial device, overrides the board default")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("listen")
                .short("l")
                .long("listen")
                .value_name("ADDR")
                .help("Address to accept bridge clients on")
                .takes_value(true),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };
    if let Some(board) = matches.value_of("board") {
        config.transport.board =
            Board::parse(board).ok_or_else(|| format!("unknown board '{board}'"))?;
    }
    if let Some(device) = matches.value_of("device") {
        config.transport.device = Some(device.to_string());
    }
    if let Some(listen) = matches.value_of("listen") {
        config.listen = listen.to_string();
    }
    config.validate()?;

    let settings = config.dispatch_settings();
    let connection = match config.transport.board {
        Board::Simulated => {
            Connection::open::<SimTransport>(SimConfig::new(), settings, &config.telemetry).await?
        }
        Board::RaspberryPi | Board::UsbSerial => {
            Connection::open::<SerialTransport>(
                config.transport.serial_settings(),
                settings,
                &config.telemetry,
            )
            .await?
        }
    };
    info!("Robot link up on {}", config.transport.device());

    let adapter = BridgeAdapter::new(&connection);
    let listener = TcpListener::bind(&config.listen).await?;
    info!("Bridge listening on {}", config.listen);

    tokio::select! {
        () = accept_clients(listener, adapter) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to wait for Ctrl+C: {}", e);
            }
            info!("Shutting down");
        }
    }

    connection.shutdown().await;
    Ok(())
}

async fn accept_clients(listener: TcpListener, adapter: BridgeAdapter) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("Client connected: {}", addr);
                let client_adapter = adapter.client();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_adapter).await {
                        warn!("Client {} error: {}", addr, e);
                    }
                    info!("Client {} disconnected", addr);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    adapter: BridgeAdapter,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));

    // Push every fresh sensor value to the client as it arrives
    let mut updates = adapter.telemetry().subscribe_all();
    let telemetry_writer = Arc::clone(&writer);
    let telemetry_task = tokio::spawn(async move {
        while let Some(update) = updates.next().await {
            let line = match serde_json::to_string(&serde_json::json!({ "telemetry": update })) {
                Ok(line) => line,
                Err(e) => {
                    warn!("Failed to serialize telemetry: {}", e);
                    continue;
                }
            };
            let mut writer_guard = telemetry_writer.lock().await;
            if writer_guard.write_all(line.as_bytes()).await.is_err()
                || writer_guard.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
    });

    let mut line = String::new();
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if line.trim().is_empty() {
                    continue;
                }
                let response = adapter.handle_line(&line).await;
                let mut writer_guard = writer.lock().await;
                writer_guard.write_all(response.as_bytes()).await?;
                writer_guard.write_all(b"\n").await?;
            }
            Err(e) => {
                error!("Error reading from client: {}", e);
                break;
            }
        }
    }

    telemetry_task.abort();
    Ok(())
}
