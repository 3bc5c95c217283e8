// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The per-connection reader and writer tasks.
//!
//! Each frame on the wire is a `u64` big-endian length prefix covering a
//! `u16` big-endian command code plus the envelope body. The writer drains
//! the connection outbox; the reader decodes frames and hands them to the
//! [TransportEvents] sink. Either side breaking reports the connection
//! closed — the node dedupes by connection id, so a double report for the
//! same break is harmless.

use std::mem::size_of;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ErrorKind};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::{ConnectionId, TransportEvents};
use crate::protocol::Frame;

/// Length of the command code carried inside each length-prefixed payload
const COMMAND_LEN: usize = 2;

/// Split the stream and spawn the reader/writer pair, returning the outbox
/// feeding the writer
pub(crate) fn spawn_io(
    stream: TcpStream,
    connection: ConnectionId,
    events: Arc<dyn TransportEvents>,
) -> mpsc::UnboundedSender<Frame> {
    let (read, write) = stream.into_split();
    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(write, outbox_rx, connection, events.clone()));
    tokio::spawn(read_loop(read, connection, events));
    outbox
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    connection: ConnectionId,
    events: Arc<dyn TransportEvents>,
) {
    loop {
        let length = match reader.read_u64().await {
            Ok(length) => length as usize,
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                tracing::trace!("EOF on connection {connection}");
                break;
            }
            Err(err) => {
                tracing::warn!("Error reading length prefix on connection {connection}: '{err}'");
                break;
            }
        };
        if length < COMMAND_LEN {
            tracing::error!(
                "Malformed frame on connection {connection} (length {length}), closing"
            );
            break;
        }

        let mut buf = vec![0u8; length];
        if let Err(err) = reader.read_exact(&mut buf).await {
            tracing::warn!("Error reading frame body on connection {connection}: '{err}'");
            break;
        }
        tracing::trace!("Payload of length {length} received on connection {connection}");

        let mut body = Bytes::from(buf);
        let header = body.split_to(COMMAND_LEN);
        let command = u16::from_be_bytes([header[0], header[1]]);
        events.message_received(connection, Frame { command, body });
    }
    events.connection_closed(connection);
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::UnboundedReceiver<Frame>,
    connection: ConnectionId,
    events: Arc<dyn TransportEvents>,
) {
    while let Some(frame) = outbox.recv().await {
        let length = (COMMAND_LEN + frame.body.len()) as u64;
        let mut buf = Vec::with_capacity(frame.body.len() + COMMAND_LEN + size_of::<u64>());
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(&frame.command.to_be_bytes());
        buf.extend_from_slice(&frame.body);

        tracing::trace!("Writing payload (len={length}) on connection {connection}");
        if let Err(err) = writer.write_all(&buf).await {
            tracing::warn!("Error writing to connection {connection}: '{err}'");
            break;
        }
        if let Err(err) = writer.flush().await {
            tracing::warn!("Error flushing connection {connection}: '{err}'");
            break;
        }
    }
    events.connection_closed(connection);
}
