//! Boundary to the server-of-record
//!
//! The transport itself lives outside this crate. [`ChannelLink`] is the
//! in-process boundary: an external transport task (or a test) holds the
//! paired [`ServerEndpoint`] and moves ops across.

use crate::protocol::{LocalOp, RemoteOp};
use crate::{Result, SyncError};
use scene_common::ClientId;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Source of remote ops and sink for local ones
pub trait SessionLink {
    fn local_client(&self) -> ClientId;

    fn send(&mut self, op: LocalOp) -> Result<()>;

    /// Next delivered op, without blocking.
    ///
    /// Fails with [`SyncError::Closed`] once the server side is gone and
    /// every op it delivered has been read.
    fn poll(&mut self) -> Result<Option<RemoteOp>>;
}

/// Client half of an in-process channel pair
pub struct ChannelLink {
    client: ClientId,
    outgoing: UnboundedSender<LocalOp>,
    incoming: UnboundedReceiver<RemoteOp>,
}

/// Server half of an in-process channel pair
pub struct ServerEndpoint {
    incoming: UnboundedReceiver<LocalOp>,
    outgoing: UnboundedSender<RemoteOp>,
}

impl ChannelLink {
    pub fn pair(client: ClientId) -> (ChannelLink, ServerEndpoint) {
        let (local_tx, local_rx) = unbounded_channel();
        let (remote_tx, remote_rx) = unbounded_channel();
        let link = ChannelLink {
            client,
            outgoing: local_tx,
            incoming: remote_rx,
        };
        let server = ServerEndpoint {
            incoming: local_rx,
            outgoing: remote_tx,
        };
        (link, server)
    }
}

impl SessionLink for ChannelLink {
    fn local_client(&self) -> ClientId {
        self.client
    }

    fn send(&mut self, op: LocalOp) -> Result<()> {
        tracing::trace!("-> {:?}", op);
        self.outgoing.send(op).map_err(|_| SyncError::Closed)
    }

    fn poll(&mut self) -> Result<Option<RemoteOp>> {
        match self.incoming.try_recv() {
            Ok(op) => Ok(Some(op)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                tracing::warn!("Server endpoint for {} dropped", self.client);
                Err(SyncError::Closed)
            }
        }
    }
}

impl ServerEndpoint {
    /// Deliver an op to the client
    pub fn push(&self, op: RemoteOp) -> Result<()> {
        self.outgoing.send(op).map_err(|_| SyncError::Closed)
    }

    pub fn try_next(&mut self) -> Option<LocalOp> {
        self.incoming.try_recv().ok()
    }

    /// Everything the client has sent so far
    pub fn drain(&mut self) -> Vec<LocalOp> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PropertyPath;

    #[test]
    fn test_channel_pair_moves_ops() {
        let (mut link, mut server) = ChannelLink::pair(ClientId(4));
        assert_eq!(link.local_client(), ClientId(4));
        assert!(link.poll().unwrap().is_none());

        server.push(RemoteOp::Unlock { id: 1 }).unwrap();
        server.push(RemoteOp::ConfirmDelete { id: 2 }).unwrap();
        assert_eq!(link.poll().unwrap(), Some(RemoteOp::Unlock { id: 1 }));
        assert_eq!(link.poll().unwrap(), Some(RemoteOp::ConfirmDelete { id: 2 }));

        link.send(LocalOp::RemoveField {
            id: 1,
            path: PropertyPath::root(),
            field: "speed".into(),
        })
        .unwrap();
        assert_eq!(server.drain().len(), 1);
    }

    #[test]
    fn test_send_after_server_drop_is_closed() {
        let (mut link, server) = ChannelLink::pair(ClientId(1));
        drop(server);
        assert!(matches!(link.send(LocalOp::Unlock { id: 1 }), Err(SyncError::Closed)));
        assert!(matches!(link.poll(), Err(SyncError::Closed)));
    }

    #[test]
    fn test_ops_delivered_before_drop_are_still_read() {
        let (mut link, server) = ChannelLink::pair(ClientId(1));
        server.push(RemoteOp::Unlock { id: 3 }).unwrap();
        drop(server);

        assert_eq!(link.poll().unwrap(), Some(RemoteOp::Unlock { id: 3 }));
        assert!(matches!(link.poll(), Err(SyncError::Closed)));
    }
}
