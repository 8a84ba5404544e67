use std::time::Duration;

use tokio::io::{self, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// How long the other direction may keep flushing after one side finished
const CLOSE_LINGER: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayTotals {
    pub to_target: u64,
    pub to_client: u64,
}

/// Copy bytes both ways until either side closes or errors.
///
/// The direction that finishes first shuts its writer down (flush then FIN);
/// the other direction gets `CLOSE_LINGER` to drain before both sockets drop.
pub async fn relay(mut inbound: TcpStream, mut outbound: TcpStream) -> RelayTotals {
    let (mut client_read, mut client_write) = inbound.split();
    let (mut target_read, mut target_write) = outbound.split();

    let upstream = async {
        let copied = io::copy(&mut client_read, &mut target_write).await;
        let _ = target_write.shutdown().await;
        copied
    };
    let downstream = async {
        let copied = io::copy(&mut target_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        copied
    };
    tokio::pin!(upstream);
    tokio::pin!(downstream);

    let (up, down) = tokio::select! {
        up = &mut upstream => {
            let down = tokio::time::timeout(CLOSE_LINGER, &mut downstream).await;
            (up, down.unwrap_or_else(|_| Ok(0)))
        }
        down = &mut downstream => {
            let up = tokio::time::timeout(CLOSE_LINGER, &mut upstream).await;
            (up.unwrap_or_else(|_| Ok(0)), down)
        }
    };

    let totals = RelayTotals {
        to_target: up.as_ref().copied().unwrap_or(0),
        to_client: down.as_ref().copied().unwrap_or(0),
    };
    if let Err(e) = up.and(down) {
        debug!("Relay ended with error: {}", e);
    }
    totals
}
