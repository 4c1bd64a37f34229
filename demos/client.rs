//! Connects to the echo server, sends a counter every second and prints what comes back.
//!
//! Run `cargo run --example echo_server` first.
use std::time::Duration;

use sockweave::{CloseCode, Message, Options, WebSocket};
use tokio::time::interval;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    simple_logger::init_with_level(log::Level::Debug).expect("log");

    let mut client = WebSocket::connect(
        "ws://127.0.0.1:8080/".parse()?,
        Options::default()
            .with_keep_alive(Duration::from_secs(5), Duration::from_secs(3))
            .server_no_context_takeover(),
    )
    .await?;
    log::debug!("Connected, extensions={:?}", client.extensions().header_value());

    let sender = client.sender();
    let mut ival = interval(Duration::from_secs(1));
    let mut sent = 0u32;

    loop {
        tokio::select! {
            _ = ival.tick() => {
                if sent == 10 {
                    client.close(CloseCode::Normal, "done").await?;
                    break;
                }
                sent += 1;
                sender.send_text(format!("message {sent}")).await?;
            }
            message = client.next_message() => {
                match message? {
                    Message::Text(text) => log::info!("Received: {text}"),
                    Message::Binary(data) => log::info!("Received {} bytes", data.len()),
                    Message::Close(frame) => {
                        log::debug!("Server closed: {frame:?}");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    log::debug!("Closed with {:?}", client.close_reason());
    Ok(())
}
