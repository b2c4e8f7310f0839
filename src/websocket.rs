//! WebSocket Server for dashboards
//!
//! Pushes the scheduler's cycle reports as JSON to connected clients and
//! answers a few read-only commands. The bus is never touched from here;
//! reports arrive through a watch channel fed by [`WatchObserver`].

use crate::scheduler::{CycleReport, SnapshotObserver};
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    /// Maximum concurrent WebSocket connections
    pub max_connections: usize,
    /// Maximum commands per second per connection
    pub max_commands_per_second: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port: 3003,
            max_connections: 5,
            max_commands_per_second: 20,
        }
    }
}

/// Feeds cycle reports into the watch channel the server reads from
pub struct WatchObserver {
    tx: watch::Sender<Option<CycleReport>>,
    print: bool,
}

impl WatchObserver {
    pub fn new(tx: watch::Sender<Option<CycleReport>>, print: bool) -> Self {
        Self { tx, print }
    }
}

impl SnapshotObserver for WatchObserver {
    fn on_cycle(&mut self, report: &CycleReport) {
        if self.print {
            println!("[{:04}]{}", report.cycle, report.line());
        }
        self.tx.send_replace(Some(report.clone()));
    }
}

/// State shared between connections
struct AppState {
    config: WebSocketConfig,
    reports: watch::Receiver<Option<CycleReport>>,
    started: DateTime<Utc>,
    active: AtomicUsize,
}

/// WebSocket command from client
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", content = "data")]
enum WsCommand {
    #[serde(rename = "status")]
    Status,

    /// Most recent cycle report
    #[serde(rename = "latest")]
    Latest,

    /// Push every new report until unsubscribed
    #[serde(rename = "subscribe")]
    Subscribe,

    #[serde(rename = "unsubscribe")]
    Unsubscribe,
}

/// WebSocket response to client
#[derive(Debug, Serialize)]
struct WsResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl WsResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            success: true,
            event: None,
            data: Some(data),
            error: None,
        }
    }

    fn cycle(report: &CycleReport) -> Self {
        Self {
            success: true,
            event: Some("cycle"),
            data: serde_json::to_value(report).ok(),
            error: None,
        }
    }

    fn error(msg: &str) -> Self {
        Self {
            success: false,
            event: None,
            data: None,
            error: Some(msg.to_string()),
        }
    }
}

/// Fixed one-second window command counter
#[derive(Debug)]
struct RateLimiter {
    max_per_second: usize,
    count: usize,
    window_start: Instant,
}

impl RateLimiter {
    fn new(max_per_second: usize) -> Self {
        Self {
            max_per_second,
            count: 0,
            window_start: Instant::now(),
        }
    }

    fn allow(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        self.count <= self.max_per_second
    }
}

/// Bind the configured address and serve until the listener fails
pub async fn run_server(
    config: WebSocketConfig,
    reports: watch::Receiver<Option<CycleReport>>,
) -> Result<()> {
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("WebSocket server listening on ws://{}", addr);
    serve(listener, config, reports).await
}

/// Accept connections on an already bound listener
pub async fn serve(
    listener: TcpListener,
    config: WebSocketConfig,
    reports: watch::Receiver<Option<CycleReport>>,
) -> Result<()> {
    let state = Arc::new(AppState {
        config,
        reports,
        started: Utc::now(),
        active: AtomicUsize::new(0),
    });

    while let Ok((stream, addr)) = listener.accept().await {
        // Check connection limit
        let current = state.active.load(Ordering::SeqCst);
        if current >= state.config.max_connections {
            warn!(
                "Connection rejected from {}: max connections ({}) reached",
                addr, state.config.max_connections
            );
            drop(stream);
            continue;
        }

        state.active.fetch_add(1, Ordering::SeqCst);
        info!("New connection from: {} (active: {})", addr, current + 1);

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &state).await {
                error!("Connection error: {}", e);
            }
            let remaining = state.active.fetch_sub(1, Ordering::SeqCst) - 1;
            info!("Connection closed (active: {})", remaining);
        });
    }

    Ok(())
}

async fn handle_connection(stream: TcpStream, state: &AppState) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    let welcome = WsResponse::success(serde_json::json!({
        "message": "RLS Diagnostic Daemon v1.0",
        "protocol": "LIN 2.x / KWP2000",
        "limits": {
            "max_connections": state.config.max_connections,
            "max_commands_per_second": state.config.max_commands_per_second
        }
    }));
    write
        .send(Message::Text(serde_json::to_string(&welcome)?))
        .await?;

    let mut limiter = RateLimiter::new(state.config.max_commands_per_second);
    let mut reports = state.reports.clone();
    let mut subscribed = false;

    loop {
        tokio::select! {
            msg = read.next() => {
                let Some(msg) = msg else { break };
                match msg {
                    Ok(Message::Text(text)) => {
                        if !limiter.allow(Instant::now()) {
                            warn!("Rate limit exceeded");
                            let response = WsResponse::error(&format!(
                                "Rate limit exceeded. Max {} commands/second.",
                                state.config.max_commands_per_second
                            ));
                            write.send(Message::Text(serde_json::to_string(&response)?)).await?;
                            continue;
                        }

                        debug!("Received: {}", text);
                        let response = match serde_json::from_str::<WsCommand>(&text) {
                            Ok(WsCommand::Subscribe) => {
                                subscribed = true;
                                // only reports produced from now on
                                reports.borrow_and_update();
                                WsResponse::success(serde_json::json!({ "subscribed": true }))
                            }
                            Ok(WsCommand::Unsubscribe) => {
                                subscribed = false;
                                WsResponse::success(serde_json::json!({ "subscribed": false }))
                            }
                            Ok(cmd) => process_command(cmd, state),
                            Err(e) => WsResponse::error(&format!("Invalid command: {}", e)),
                        };

                        let json = serde_json::to_string(&response)?;
                        debug!("Sending: {}", json);
                        write.send(Message::Text(json)).await?;
                    }
                    Ok(Message::Close(_)) => {
                        info!("Client disconnected");
                        break;
                    }
                    Ok(Message::Ping(data)) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            changed = reports.changed(), if subscribed => {
                if changed.is_err() {
                    info!("Scheduler stopped, closing stream");
                    break;
                }
                let event = reports.borrow_and_update().as_ref().map(WsResponse::cycle);
                if let Some(event) = event {
                    write.send(Message::Text(serde_json::to_string(&event)?)).await?;
                }
            }
        }
    }

    Ok(())
}

fn process_command(cmd: WsCommand, state: &AppState) -> WsResponse {
    match cmd {
        WsCommand::Status => {
            let latest = state.reports.borrow();
            let uptime = (Utc::now() - state.started).num_seconds();
            WsResponse::success(serde_json::json!({
                "cycles": latest.as_ref().map_or(0, |r| r.cycle + 1),
                "drl": latest.as_ref().and_then(|r| r.drl),
                "status": latest.as_ref().map(|r| r.status.clone()),
                "connections": state.active.load(Ordering::SeqCst),
                "uptime_s": uptime,
            }))
        }
        WsCommand::Latest => match state.reports.borrow().as_ref() {
            Some(report) => match serde_json::to_value(report) {
                Ok(value) => WsResponse::success(value),
                Err(e) => WsResponse::error(&format!("Serialization failed: {}", e)),
            },
            None => WsResponse::error("No cycle completed yet"),
        },
        // handled per connection
        WsCommand::Subscribe | WsCommand::Unsubscribe => WsResponse::error("Unexpected command"),
    }
}
