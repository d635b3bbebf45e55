//! livedm - live room danmaku monitor
//!
//! Joins the configured rooms and logs heartbeats, danmaku, gifts, guard
//! purchases and super chats as they arrive.

mod config;

use config::Config;
use livedm_client::{ClientHandle, Dispatcher, HandlerError, LiveClient};
use livedm_protocol::HEARTBEAT_COMMAND;
use livedm_web::{OpenLiveResolver, WbiSigner, WebRoomResolver};
use serde_json::Value;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if LIVEDM_CONFIG is set, then env overrides)
    let config_path = std::env::var("LIVEDM_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = config.validate() {
        tracing::error!("{}", e);
        return Err(e.into());
    }

    tracing::info!("Starting livedm monitor");
    tracing::info!("  Rooms: {:?}", config.rooms);
    tracing::info!(
        "  Heartbeat interval: {}s",
        config.client.heartbeat_interval_secs
    );
    tracing::info!(
        "  Open platform: {}",
        if config.open_live.enabled { "enabled" } else { "disabled" }
    );

    // One HTTP client and wbi key cache shared by every room
    let http = config.http_config().build_client()?;
    let signer = Arc::new(WbiSigner::new(http.clone()));
    let mut web_resolver = WebRoomResolver::new(http.clone(), signer);
    if let Some(uid) = config.web.uid {
        web_resolver = web_resolver.with_uid(uid);
    }
    if let Some(cookie) = &config.web.cookie {
        web_resolver = web_resolver.with_cookie(cookie.clone());
    }
    let web_resolver = Arc::new(web_resolver);

    let mut clients = Vec::new();
    for &room_id in &config.rooms {
        let client = LiveClient::with_resolver(
            config.client_config(room_id),
            web_resolver.clone(),
            Arc::new(monitor_dispatcher()),
        );
        client.start();
        clients.push(client);
    }

    if config.open_live.enabled {
        let resolver = Arc::new(OpenLiveResolver::new(
            http,
            config.open_live.to_open_live_config(),
        ));
        // The room comes from the game start reply.
        let client = LiveClient::with_resolver(
            config.client_config(0),
            resolver,
            Arc::new(monitor_dispatcher()),
        );
        client.start();
        clients.push(client);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping clients...");

    futures::future::join_all(clients.iter().map(|client| client.stop_and_close())).await;

    tracing::info!("Monitor stopped");
    Ok(())
}

/// Dispatcher that logs the commands the monitor cares about.
fn monitor_dispatcher() -> Dispatcher {
    Dispatcher::new()
        .on(HEARTBEAT_COMMAND, on_heartbeat)
        .on("DANMU_MSG", on_danmaku)
        .on("SEND_GIFT", on_gift)
        .on("GUARD_BUY", on_guard)
        .on("SUPER_CHAT_MESSAGE", on_super_chat)
        .on("LIVE_OPEN_PLATFORM_DM", on_open_danmaku)
        .on("LIVE_OPEN_PLATFORM_SEND_GIFT", on_open_gift)
}

fn str_field<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value.pointer(pointer).and_then(Value::as_str).unwrap_or("")
}

fn u64_field(value: &Value, pointer: &str) -> u64 {
    value.pointer(pointer).and_then(Value::as_u64).unwrap_or(0)
}

fn on_heartbeat(client: &ClientHandle, command: &Value) -> Result<(), HandlerError> {
    tracing::info!(
        room_id = client.room_id(),
        "[heartbeat] popularity={}",
        u64_field(command, "/data/popularity")
    );
    Ok(())
}

fn on_danmaku(client: &ClientHandle, command: &Value) -> Result<(), HandlerError> {
    // info[1] is the text, info[2] the sender as [uid, uname, ...].
    let info = command
        .get("info")
        .and_then(Value::as_array)
        .ok_or("DANMU_MSG without info")?;
    let text = info.get(1).and_then(Value::as_str).unwrap_or("");
    let uname = info
        .get(2)
        .and_then(|user| user.get(1))
        .and_then(Value::as_str)
        .unwrap_or("");
    tracing::info!(room_id = client.room_id(), "[danmaku] {}: {}", uname, text);
    Ok(())
}

fn on_gift(client: &ClientHandle, command: &Value) -> Result<(), HandlerError> {
    tracing::info!(
        room_id = client.room_id(),
        "[gift] {} sent {} x{}",
        str_field(command, "/data/uname"),
        str_field(command, "/data/giftName"),
        u64_field(command, "/data/num")
    );
    Ok(())
}

fn on_guard(client: &ClientHandle, command: &Value) -> Result<(), HandlerError> {
    tracing::info!(
        room_id = client.room_id(),
        "[guard] {} bought guard level {}",
        str_field(command, "/data/username"),
        u64_field(command, "/data/guard_level")
    );
    Ok(())
}

fn on_super_chat(client: &ClientHandle, command: &Value) -> Result<(), HandlerError> {
    tracing::info!(
        room_id = client.room_id(),
        "[super chat] {} ({}): {}",
        str_field(command, "/data/user_info/uname"),
        u64_field(command, "/data/price"),
        str_field(command, "/data/message")
    );
    Ok(())
}

fn on_open_danmaku(client: &ClientHandle, command: &Value) -> Result<(), HandlerError> {
    tracing::info!(
        room_id = client.room_id(),
        "[open danmaku] {}: {}",
        str_field(command, "/data/uname"),
        str_field(command, "/data/msg")
    );
    Ok(())
}

fn on_open_gift(client: &ClientHandle, command: &Value) -> Result<(), HandlerError> {
    tracing::info!(
        room_id = client.room_id(),
        "[open gift] {} sent {} x{}",
        str_field(command, "/data/uname"),
        str_field(command, "/data/gift_name"),
        u64_field(command, "/data/gift_num")
    );
    Ok(())
}
