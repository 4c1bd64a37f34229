//! A WebSocket echo server.
//!
//! Accepts connections on port 8080 and echoes back every text or binary message. All
//! connections borrow their receive buffers from one shared pool.
use std::sync::Arc;

use sockweave::{
    pool::BufferPool, CompressionLevel, Message, MessageHandler, Options, Sender, WebSocket,
};
use tokio::net::{TcpListener, TcpStream};

struct Echo;

impl MessageHandler<TcpStream> for Echo {
    async fn on_message(
        &mut self,
        sender: &Sender<TcpStream>,
        message: Message,
    ) -> sockweave::Result<()> {
        match message {
            Message::Text(text) => sender.send_text(text).await,
            Message::Binary(data) => sender.send_binary(data).await,
            Message::Close(frame) => {
                log::debug!("Client closed: {frame:?}");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn on_error(&mut self, err: &sockweave::WebSocketError) {
        log::warn!("Echo failed: {err}");
    }
}

async fn handle_client(stream: TcpStream, options: Options) -> sockweave::Result<()> {
    let ws = WebSocket::accept(stream, options).await?;
    log::debug!("Upgraded, protocol={:?}", ws.protocol());

    ws.run(Echo).await?;

    log::debug!("Client disconnected");
    Ok(())
}

#[tokio::main]
async fn main() -> sockweave::Result<()> {
    // Initialize logging
    simple_logger::init_with_level(log::Level::Debug).expect("log");

    let pool = Arc::new(BufferPool::new(8192, 64, true, 2.0)?);
    let options = Options::default()
        .with_max_payload_read(100 * 1024 * 1024)
        .with_max_read_buffer(200 * 1024 * 1024)
        .with_compression_level(CompressionLevel::fast())
        .with_buffer_pool(pool);

    let listener = TcpListener::bind("0.0.0.0:8080").await?;

    log::debug!("Listening on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = listener.accept().await?;
        log::info!("Client connected from {addr}");
        stream.set_nodelay(true)?;

        let options = options.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, options).await {
                log::error!("Error in websocket connection: {}", e);
            }
        });
    }
}
