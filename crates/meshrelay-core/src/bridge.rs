//! Bridge
//!
//! Splices the two authenticated connections of a matched allocation into a
//! single bidirectional pipe. The relay never inspects or rewrites the bytes.

use std::sync::Arc;

use tokio::io::{self, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::allocation::AllocationTable;

/// Copy buffer per direction
const COPY_BUF_SIZE: usize = 64 * 1024;

/// Run both copy flows until the tunnel dies, then drop the allocation.
///
/// Either direction ending (EOF or error) tears the whole tunnel down; a
/// half-closed relay stream is not meaningful. Falling out of the select
/// drops all four split halves, which closes both connections and unblocks
/// the surviving flow.
pub(crate) async fn run(
    stream_id: u64,
    server: TcpStream,
    client: TcpStream,
    table: Arc<AllocationTable>,
    cancel: CancellationToken,
) {
    let (server_read, mut server_write) = server.into_split();
    let (client_read, mut client_write) = client.into_split();
    let mut server_read = BufReader::with_capacity(COPY_BUF_SIZE, server_read);
    let mut client_read = BufReader::with_capacity(COPY_BUF_SIZE, client_read);

    tokio::select! {
        res = io::copy_buf(&mut client_read, &mut server_write) => {
            log_flow(stream_id, "client -> server", res);
        }
        res = io::copy_buf(&mut server_read, &mut client_write) => {
            log_flow(stream_id, "server -> client", res);
        }
        _ = cancel.cancelled() => {
            debug!("Stream {}: bridge cancelled", stream_id);
        }
    }

    table.remove(stream_id).await;
    info!("Stream {}: bridge closed", stream_id);
}

fn log_flow(stream_id: u64, direction: &str, res: io::Result<u64>) {
    match res {
        Ok(bytes) => debug!("Stream {}: {} done after {} bytes", stream_id, direction, bytes),
        Err(e) => debug!("Stream {}: {} ended: {}", stream_id, direction, e),
    }
}
