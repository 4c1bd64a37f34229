//! Runs the Autobahn|Testsuite fuzzing server cases against this crate.
//!
//! ```text
//! docker run -it --rm -p 9001:9001 crossbario/autobahn-testsuite
//! cargo run --example autobahn_client
//! ```
use anyhow::Result;
use sockweave::{CloseCode, CompressionLevel, Message, Options, WebSocket};
use tokio::net::TcpStream;

async fn connect(path: &str) -> Result<WebSocket<TcpStream>> {
    let client = WebSocket::connect(
        format!("ws://localhost:9001/{path}").parse()?,
        Options::default()
            .with_compression_level(CompressionLevel::none())
            .with_max_payload_read(100 * 1024 * 1024)
            .with_max_read_buffer(200 * 1024 * 1024)
            .client_no_context_takeover()
            .server_no_context_takeover(),
    )
    .await?;
    Ok(client)
}

async fn get_case_count() -> Result<u32> {
    let mut ws = connect("getCaseCount").await?;
    let count = match ws.next_message().await? {
        Message::Text(text) => text.parse()?,
        other => anyhow::bail!("unexpected answer: {other:?}"),
    };
    ws.close(CloseCode::Normal, "").await?;
    Ok(count)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    simple_logger::init_with_level(log::Level::Debug).expect("log");

    let count = get_case_count().await?;

    log::debug!("Running {count} cases");

    for case in 1..=count {
        log::debug!("Running {case}");

        let mut ws = connect(&format!("runCase?case={case}&agent=sockweave")).await?;
        let sender = ws.sender();
        while let Ok(message) = ws.next_message().await {
            match message {
                Message::Text(text) => {
                    let _ = sender.send_text(text).await;
                }
                Message::Binary(data) => {
                    let _ = sender.send_binary(data).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    }

    let mut ws = connect("updateReports?agent=sockweave").await?;
    ws.close(CloseCode::Normal, "").await?;

    Ok(())
}
