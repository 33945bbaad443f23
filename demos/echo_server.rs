use mill_sockets::{ServerConfig, ServerSettings, SocketServer, Verdict};
use std::{io::BufRead, time::Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Line-oriented echo server. Settings come from the JSON file named by
/// `MILL_SETTINGS`, if set; press Enter to shut down.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = match std::env::var("MILL_SETTINGS") {
        Ok(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        Err(_) => ServerSettings {
            host: Some("127.0.0.1".into()),
            port: 8080,
            block_time_ms: 500,
            max_subthreads: Some(32),
            ..ServerSettings::default()
        },
    };

    let config = ServerConfig::builder()
        .settings(settings)
        .on_incoming(|ctx, conn| {
            let greeting = format!("hello {}, {} online\n", conn.peer_addr(), ctx.client_count());
            Ok(Verdict::from(
                ctx.send(conn, greeting.as_bytes(), Some(Duration::from_secs(1))) > 0,
            ))
        })
        .on_readable(|ctx, conn| {
            let data = conn.recv_some(4096)?;
            if data.starts_with(b"quit") {
                return Ok(Verdict::reject("Client said goodbye"));
            }
            Ok(Verdict::from(ctx.send(conn, &data, None) == data.len()))
        })
        .on_closed(|_, conn, reason| info!(peer = %conn.peer_addr(), reason, "Client left"))
        .build();

    let server = SocketServer::new(config)?;
    server.start()?;
    if let Some(addr) = server.local_addr() {
        info!(%addr, "Echo server listening, press Enter to stop");
    }

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    server.stop()?;
    Ok(())
}
