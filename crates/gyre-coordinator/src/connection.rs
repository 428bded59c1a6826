//! Peer connection handling.
//!
//! Every accepted TCP connection gets a random peer id and a pair of
//! tasks: a reader decoding length-prefixed frames into coordinator
//! events, and a writer draining the outbound channel the coordinator
//! replies on. Requests and replies stay strictly ordered per
//! connection.
//!
//! Peer ids are assigned here and never derived from the transport, so
//! an Alice connection and a Bob connection from the same host are just
//! two unrelated ids.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use gyre_core::types::PeerId;
use gyre_core::wire::Message;

use crate::coordinator::Event;

/// Accept loop. Runs until the listener fails or the coordinator's event
/// queue closes.
pub async fn serve(listener: TcpListener, events: mpsc::UnboundedSender<Event>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let events = events.clone();
                tokio::spawn(async move {
                    handle_connection(stream, events).await;
                });
            }
            Err(e) => {
                log::warn!("Accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, events: mpsc::UnboundedSender<Event>) {
    let peer_id = PeerId::random();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    if events
        .send(Event::Connected {
            peer_id,
            outbound: outbound_tx,
        })
        .is_err()
    {
        return;
    }

    let (mut reader, mut writer) = stream.into_split();

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let frame = match msg.to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    log::error!("Unencodable outbound message: {}", e);
                    continue;
                }
            };
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        match read_frame(&mut reader).await {
            Some(Ok(msg)) => {
                if events.send(Event::Request { peer_id, msg }).is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                log::warn!("Peer {} sent an undecodable frame: {}", peer_id, e);
                break;
            }
            None => break,
        }
    }

    let _ = events.send(Event::Disconnected { peer_id });
    writer_task.abort();
}

/// One framed message; `None` on a clean close or transport error.
async fn read_frame(
    reader: &mut OwnedReadHalf,
) -> Option<Result<Message, gyre_core::wire::WireError>> {
    let mut len_buf = [0u8; 2];
    if reader.read_exact(&mut len_buf).await.is_err() {
        return None;
    }
    let len = u16::from_be_bytes(len_buf) as usize;
    if len < 2 {
        return Some(Err(gyre_core::wire::WireError::Truncated {
            needed: 2,
            remaining: len,
        }));
    }
    let mut body = vec![0u8; len];
    if reader.read_exact(&mut body).await.is_err() {
        return None;
    }
    Some(Message::from_frame_body(&body))
}
