//! In-memory transport for tests and single-process clusters.
//!
//! Frames travel over per-replica channels; a replica can be silenced to
//! model a crashed or partitioned node (its outbound frames are dropped,
//! inbound still flows).

use crate::traits::{App, Transport, TransportError};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Per-process message fabric connecting loopback transports.
#[derive(Default)]
pub struct LoopbackNet {
    links: Mutex<HashMap<String, mpsc::Sender<(String, Vec<u8>)>>>,
    silenced: Mutex<HashSet<String>>,
}

impl LoopbackNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an address and take the receiving end of its link.
    pub fn register(&self, addr: &str) -> mpsc::Receiver<(String, Vec<u8>)> {
        let (tx, rx) = mpsc::channel(1024);
        self.links.lock().insert(addr.to_string(), tx);
        rx
    }

    /// Drop every frame originating from `addr` until unsilenced.
    pub fn silence(&self, addr: &str) {
        self.silenced.lock().insert(addr.to_string());
    }

    pub fn unsilence(&self, addr: &str) {
        self.silenced.lock().remove(addr);
    }
}

/// The sending side of one replica's connection to a [`LoopbackNet`].
pub struct LoopbackTransport {
    net: Arc<LoopbackNet>,
    origin: String,
}

impl LoopbackTransport {
    pub fn new(net: Arc<LoopbackNet>, origin: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            net,
            origin: origin.into(),
        })
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, addr: &str, path: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.net.silenced.lock().contains(&self.origin) {
            // Silenced sender: the frame vanishes, like a dead NIC.
            return Ok(());
        }
        let tx = {
            let links = self.net.links.lock();
            links.get(addr).cloned()
        };
        let Some(tx) = tx else {
            return Err(TransportError {
                addr: addr.to_string(),
                path: path.to_string(),
                detail: "unknown address".to_string(),
            });
        };
        tx.try_send((path.to_string(), bytes))
            .map_err(|e| TransportError {
                addr: addr.to_string(),
                path: path.to_string(),
                detail: e.to_string(),
            })
    }
}

/// Application that acknowledges every operation.
pub struct AckApp;

impl App for AckApp {
    fn execute(&self, _operation: &str, _data: &[u8]) -> String {
        "Executed".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_between_registered_addrs() {
        let net = LoopbackNet::new();
        let mut rx = net.register("replica-1:4000");
        let transport = LoopbackTransport::new(net.clone(), "replica-0:4000");

        transport
            .send("replica-1:4000", "/prepare", vec![1, 2, 3])
            .unwrap();
        let (path, bytes) = rx.recv().await.unwrap();
        assert_eq!(path, "/prepare");
        assert_eq!(bytes, vec![1, 2, 3]);

        assert!(transport
            .send("replica-9:4000", "/prepare", vec![])
            .is_err());
    }

    #[tokio::test]
    async fn test_silenced_origin_drops_frames() {
        let net = LoopbackNet::new();
        let mut rx = net.register("replica-1:4000");
        let transport = LoopbackTransport::new(net.clone(), "replica-0:4000");

        net.silence("replica-0:4000");
        transport
            .send("replica-1:4000", "/commit", vec![7])
            .unwrap();
        assert!(rx.try_recv().is_err());

        net.unsilence("replica-0:4000");
        transport
            .send("replica-1:4000", "/commit", vec![7])
            .unwrap();
        assert!(rx.try_recv().is_ok());
    }
}
