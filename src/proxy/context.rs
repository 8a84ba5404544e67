use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::registry::IpCandidate;

/// Per-connection routing state, created when the outbound connect starts and
/// owned by the connection task until it ends.
///
/// Inbound bytes that arrive before the outbound side is up are queued here and
/// handed over once, in arrival order.
#[derive(Debug)]
pub struct ConnectionContext {
    client: SocketAddr,
    origin_host: String,
    port: u16,
    candidate: Option<Arc<IpCandidate>>,
    pending: VecDeque<Bytes>,
    pending_bytes: usize,
    max_pending_bytes: usize,
    drained: bool,
}

impl ConnectionContext {
    pub fn new(
        client: SocketAddr,
        origin_host: &str,
        port: u16,
        candidate: Option<Arc<IpCandidate>>,
        max_pending_bytes: usize,
    ) -> Self {
        Self {
            client,
            origin_host: origin_host.to_string(),
            port,
            candidate,
            pending: VecDeque::new(),
            pending_bytes: 0,
            max_pending_bytes,
            drained: false,
        }
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn origin_host(&self) -> &str {
        &self.origin_host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn candidate(&self) -> Option<&Arc<IpCandidate>> {
        self.candidate.as_ref()
    }

    /// Host actually dialed: the chosen candidate's IP, else the requested name
    pub fn connect_host(&self) -> String {
        match &self.candidate {
            Some(c) => c.ip().to_string(),
            None => self.origin_host.clone(),
        }
    }

    /// Queue a chunk for the outbound side. Fails once the queue was drained.
    pub fn push_pending(&mut self, chunk: Bytes) -> anyhow::Result<()> {
        if self.drained {
            return Err(anyhow::anyhow!("pending queue for {} already drained", self.origin_host));
        }
        if chunk.is_empty() {
            return Ok(());
        }
        self.pending_bytes += chunk.len();
        self.pending.push_back(chunk);
        Ok(())
    }

    /// While full, the connection stops reading from the client
    pub fn is_full(&self) -> bool {
        self.pending_bytes >= self.max_pending_bytes
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Hand over everything queued, oldest first. Later calls get nothing.
    pub fn drain_pending(&mut self) -> VecDeque<Bytes> {
        self.drained = true;
        self.pending_bytes = 0;
        std::mem::take(&mut self.pending)
    }

    pub fn record_connect_success(&self) {
        if let Some(c) = &self.candidate {
            c.record_connect_success();
        }
    }

    /// New error count of the candidate, if one was used
    pub fn record_connect_failure(&self) -> Option<u32> {
        self.candidate.as_ref().map(|c| c.record_connect_failure())
    }
}
