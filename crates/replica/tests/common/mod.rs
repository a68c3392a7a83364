//! Shared cluster harness for the end-to-end scenarios.

use palisade_replica::loopback::{AckApp, LoopbackNet, LoopbackTransport};
use palisade_replica::{Replica, ReplicaConfig, ReplicaHandle};
use palisade_types::{NodeTable, ReplicaId, ReplicaInfo, RequestMsg};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A single-process cluster wired over the loopback fabric.
pub struct Cluster {
    pub net: Arc<LoopbackNet>,
    pub handles: Vec<ReplicaHandle>,
    // Held so the replicas' tasks stay alive for the test's duration.
    _replicas: Vec<Replica>,
    pumps: Vec<JoinHandle<()>>,
}

impl Cluster {
    /// Spawn `n` replicas. Replica `i` gets id `i` and address
    /// `replica-i`.
    pub fn spawn(n: u64, config: ReplicaConfig) -> Cluster {
        let infos: Vec<ReplicaInfo> = (0..n)
            .map(|i| ReplicaInfo {
                id: ReplicaId(i),
                addr: format!("replica-{i}"),
            })
            .collect();

        let net = LoopbackNet::new();
        let mut replicas = Vec::new();
        let mut handles = Vec::new();
        let mut pumps = Vec::new();

        for info in &infos {
            let table = NodeTable::new(info.id, infos.clone());
            let mut wire_rx = net.register(&info.addr);
            let transport = LoopbackTransport::new(net.clone(), info.addr.clone());
            let replica = Replica::spawn(table, config.clone(), transport, Arc::new(AckApp));
            let handle = replica.handle();

            let pump_handle = handle.clone();
            pumps.push(tokio::spawn(async move {
                while let Some((path, bytes)) = wire_rx.recv().await {
                    let _ = pump_handle.feed_wire(&path, &bytes).await;
                }
            }));

            handles.push(handle);
            replicas.push(replica);
        }

        Cluster {
            net,
            handles,
            _replicas: replicas,
            pumps,
        }
    }

    /// Submit a request to every replica, the way a broadcasting client
    /// does.
    pub async fn submit_to_all(&self, req: &RequestMsg) {
        for handle in &self.handles {
            handle.submit_request(req.clone()).await;
        }
    }

    /// Stop delivering frames sent by replica `idx`.
    pub fn silence(&self, idx: usize) {
        self.net.silence(&format!("replica-{idx}"));
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

/// Configuration with a suspicion timeout long enough that healthy-path
/// tests never trip a view change.
pub fn steady_config() -> ReplicaConfig {
    ReplicaConfig {
        suspicion_timeout: Duration::from_secs(30),
        ..ReplicaConfig::default()
    }
}

/// Configuration that suspects the primary quickly, for view-change
/// scenarios.
pub fn suspicious_config() -> ReplicaConfig {
    ReplicaConfig {
        suspicion_timeout: Duration::from_millis(200),
        ..ReplicaConfig::default()
    }
}

/// Poll a condition until it holds or the deadline passes.
pub async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
