//! Echo over an in-memory data channel pair.
//!
//! Run with:
//!   cargo run -p dcstream --example memory-echo --features logging
//!
//! Set `DCSTREAM_LOG=debug` to see flags and teardown.

use dcstream::logging::{init_logging, LogFormat, LogLevel};
use dcstream::transport::MemoryDataChannel;
use dcstream::Stream;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let level = std::env::var("DCSTREAM_LOG")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(LogLevel::Info);
    init_logging(LogFormat::Text, level);

    let (client_end, server_end) = MemoryDataChannel::pair();
    let client = Stream::new(client_end);
    let server = Stream::new(server_end);

    // Echo until the client half-closes, then half-close back.
    let echo = tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        let mut total = 0;
        loop {
            let n = server.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            server.write(&buf[..n]).await?;
            total += n;
        }
        server.close_write().await?;
        server.close().await;
        Ok::<_, dcstream::StreamError>(total)
    });

    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    let reader = {
        let client = client.clone();
        let expected = payload.len();
        tokio::spawn(async move {
            let mut received = Vec::with_capacity(expected);
            let mut buf = vec![0u8; 8192];
            loop {
                let n = client.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            Ok::<_, dcstream::StreamError>(received)
        })
    };

    let written = client.write(&payload).await?;
    client.close_write().await?;
    eprintln!("client wrote {written} bytes");

    let echoed = echo.await??;
    let received = reader.await??;
    client.close().await;

    eprintln!("server echoed {echoed} bytes, client received {}", received.len());
    if received != payload {
        return Err("echoed bytes differ from what was sent".into());
    }
    eprintln!("final state: {}", client.state());
    Ok(())
}
