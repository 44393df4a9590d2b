//! Cluster tests for kvraft-node
//!
//! Three-node clusters over the in-process network (with partitions and
//! restarts) and one over real sockets.

use std::future::Future;
use std::time::Duration;

use kvraft_core::{NodeId, NodeState};
use kvraft_node::{
    ClientError, KvClient, KvError, KvService, LocalNetwork, MemberConfig, Network, Node,
    NodeConfig, NodeStatus, ReadOptions,
};
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

const WAIT: Duration = Duration::from_secs(15);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll `probe` until it yields a value
async fn eventually<T, F, Fut>(what: &str, mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(value) = probe().await {
            return value;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(25)).await;
    }
}

fn members(size: u64) -> Vec<MemberConfig> {
    (0..size)
        .map(|id| MemberConfig {
            id,
            peer_addr: format!("127.0.0.1:{}", 4000 + id),
            client_addr: None,
        })
        .collect()
}

fn fast_timers(config: &mut NodeConfig) {
    config.raft.election_timeout_min_ms = 300;
    config.raft.election_timeout_max_ms = 600;
    config.raft.heartbeat_interval_ms = 50;
    config.request_timeout_ms = 2000;
}

struct Cluster {
    network: LocalNetwork,
    dirs: Vec<TempDir>,
    nodes: Vec<Option<Node>>,
    tweak: fn(&mut NodeConfig),
}

impl Cluster {
    async fn start(size: u64, tweak: fn(&mut NodeConfig)) -> Self {
        let mut cluster = Self {
            network: LocalNetwork::new(),
            dirs: (0..size).map(|_| TempDir::new().unwrap()).collect(),
            nodes: (0..size).map(|_| None).collect(),
            tweak,
        };
        for id in 0..size {
            cluster.start_node(id).await;
        }
        cluster
    }

    /// Three nodes with node0 elected in term 1
    async fn with_leader(tweak: fn(&mut NodeConfig)) -> Self {
        let cluster = Self::start(3, tweak).await;
        cluster.service(0).campaign().await.unwrap();
        let leader = cluster.leader(&[]).await;
        assert_eq!(leader.id, 0);
        cluster
    }

    fn config(&self, id: NodeId) -> NodeConfig {
        let mut config = NodeConfig::new(id, members(self.dirs.len() as u64));
        config.data_dir = Some(self.dirs[id as usize].path().to_path_buf());
        fast_timers(&mut config);
        (self.tweak)(&mut config);
        config
    }

    async fn start_node(&mut self, id: NodeId) {
        let node = Node::start(self.config(id), Network::Local(self.network.clone()))
            .await
            .unwrap();
        self.nodes[id as usize] = Some(node);
    }

    async fn stop_node(&mut self, id: NodeId) {
        if let Some(node) = self.nodes[id as usize].take() {
            node.shutdown().await.unwrap();
        }
    }

    async fn shutdown(mut self) {
        for id in 0..self.nodes.len() as u64 {
            self.stop_node(id).await;
        }
    }

    fn service(&self, id: NodeId) -> KvService {
        self.nodes[id as usize].as_ref().unwrap().service()
    }

    fn live_services(&self, exclude: &[NodeId]) -> Vec<KvService> {
        self.nodes
            .iter()
            .flatten()
            .filter(|node| !exclude.contains(&node.id()))
            .map(Node::service)
            .collect()
    }

    /// The leader of the highest term among live nodes not in `exclude`
    async fn leader(&self, exclude: &[NodeId]) -> NodeStatus {
        let services = self.live_services(exclude);
        eventually("a leader", move || {
            let services = services.clone();
            async move {
                let mut statuses = Vec::new();
                for service in &services {
                    if let Ok(status) = service.status().await {
                        statuses.push(status);
                    }
                }
                let max_term = statuses.iter().map(|s| s.term).max()?;
                statuses
                    .into_iter()
                    .find(|s| s.role == NodeState::Leader && s.term == max_term)
            }
        })
        .await
    }
}

/// Wait until node `service` serves `key == value` from local state
async fn await_value(service: &KvService, key: &'static str, value: &'static str) -> u64 {
    let service = service.clone();
    eventually(&format!("{key}={value} on node {}", service.id()), move || {
        let service = service.clone();
        async move {
            match service.get(key, ReadOptions::stale()).await {
                Ok(kv) if kv.value == value.as_bytes() => Some(kv.mod_revision),
                _ => None,
            }
        }
    })
    .await
}

// ============================================================================
// SECTION 1: Election And Replication
// ============================================================================

mod election_and_replication {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn node0_leads_term_one_and_writes_converge() {
        let cluster = Cluster::with_leader(|_| {}).await;
        let status = cluster.service(0).status().await.unwrap();
        assert_eq!(status.term, 1);
        assert_eq!(status.role, NodeState::Leader);

        let revision = cluster.service(0).put("foo", "bar1").await.unwrap();
        assert_eq!(revision, 1);

        for id in 0..3 {
            let seen = await_value(&cluster.service(id), "foo", "bar1").await;
            assert_eq!(seen, revision);
        }
        for id in 1..3 {
            let status = cluster.service(id).status().await.unwrap();
            assert_eq!(status.role, NodeState::Follower);
            assert_eq!(status.leader_id, Some(0));
        }
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_most_one_leader_per_term() {
        let cluster = Cluster::start(3, |_| {}).await;
        cluster.leader(&[]).await;

        for _ in 0..10 {
            let mut leaders = Vec::new();
            for id in 0..3 {
                let status = cluster.service(id).status().await.unwrap();
                if status.role == NodeState::Leader {
                    leaders.push(status.term);
                }
            }
            let mut terms = leaders.clone();
            terms.sort_unstable();
            terms.dedup();
            assert_eq!(terms.len(), leaders.len(), "two leaders share a term");
            sleep(Duration::from_millis(50)).await;
        }
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn followers_refuse_writes_with_a_leader_hint() {
        let cluster = Cluster::with_leader(|_| {}).await;
        cluster.service(0).put("foo", "bar1").await.unwrap();
        await_value(&cluster.service(1), "foo", "bar1").await;
        await_value(&cluster.service(2), "foo", "bar1").await;

        let err = cluster.service(1).put("foo", "nope").await.unwrap_err();
        assert!(matches!(err, KvError::NotLeader { leader_id: Some(0), .. }));
        let err = cluster.service(2).delete("foo").await.unwrap_err();
        assert!(matches!(err, KvError::NotLeader { leader_id: Some(0), .. }));
        cluster.shutdown().await;
    }
}

// ============================================================================
// SECTION 2: Reads
// ============================================================================

mod reads {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn linearizable_read_sees_the_acknowledged_write() {
        let cluster = Cluster::with_leader(|_| {}).await;
        let leader = cluster.service(0);
        let revision = leader.put("foo", "bar1").await.unwrap();

        let kv = leader.get("foo", ReadOptions::default()).await.unwrap();
        assert_eq!(kv.value, b"bar1");
        assert!(kv.mod_revision >= revision);
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn linearizable_read_on_a_follower_is_not_leader() {
        let cluster = Cluster::with_leader(|_| {}).await;
        cluster.service(0).put("foo", "bar1").await.unwrap();
        await_value(&cluster.service(2), "foo", "bar1").await;

        let err = cluster
            .service(2)
            .get("foo", ReadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::NotLeader { leader_id: Some(0), .. }));
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn historical_reads_and_deletes() {
        let cluster = Cluster::with_leader(|_| {}).await;
        let leader = cluster.service(0);
        let first = leader.put("foo", "bar1").await.unwrap();
        let second = leader.put("foo", "bar2").await.unwrap();
        assert_eq!(second, first + 1);

        let old = leader
            .get("foo", ReadOptions::default().at_revision(first))
            .await
            .unwrap();
        assert_eq!(old.value, b"bar1");
        assert_eq!(old.version, 1);

        let deleted = leader.delete("foo").await.unwrap();
        assert_eq!(deleted, second + 1);
        assert_eq!(
            leader.get("foo", ReadOptions::default()).await,
            Err(KvError::NotFound)
        );
        assert_eq!(
            leader
                .get("foo", ReadOptions::default().at_revision(deleted + 10))
                .await,
            Err(KvError::NotFound)
        );

        // the delete reaches followers too
        let follower = cluster.service(1);
        eventually("delete on node 1", move || {
            let follower = follower.clone();
            async move {
                match follower.get("foo", ReadOptions::stale()).await {
                    Err(KvError::NotFound) => Some(()),
                    _ => None,
                }
            }
        })
        .await;
        cluster.shutdown().await;
    }
}

// ============================================================================
// SECTION 3: Partitions
// ============================================================================

mod partitions {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn isolated_leader_is_replaced_and_catches_up() {
        let cluster = Cluster::with_leader(|_| {}).await;
        let revision = cluster.service(0).put("foo", "bar1").await.unwrap();
        for id in 0..3 {
            await_value(&cluster.service(id), "foo", "bar1").await;
        }

        cluster.network.isolate(0);
        let new_leader = cluster.leader(&[0]).await;
        assert_ne!(new_leader.id, 0);
        assert!(new_leader.term > 1);

        // the old leader notices it lost its quorum and stops claiming leadership
        let old = cluster.service(0);
        eventually("node 0 to step down", move || {
            let old = old.clone();
            async move {
                let status = old.status().await.ok()?;
                (status.role != NodeState::Leader).then_some(())
            }
        })
        .await;
        let err = cluster.service(0).put("foo", "stale").await.unwrap_err();
        assert!(matches!(err, KvError::NotLeader { .. }));

        let majority = cluster.service(new_leader.id);
        let newer = majority.put("foo", "bar2").await.unwrap();
        assert!(newer > revision);

        cluster.network.heal();
        let caught_up = await_value(&cluster.service(0), "foo", "bar2").await;
        assert_eq!(caught_up, newer);
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn minority_cannot_commit() {
        let cluster = Cluster::with_leader(|config| config.request_timeout_ms = 800).await;
        cluster.network.isolate(1);
        cluster.network.isolate(2);

        let err = cluster.service(0).put("foo", "lonely").await.unwrap_err();
        assert!(matches!(err, KvError::Timeout | KvError::NotLeader { .. }));
        assert_eq!(
            cluster.service(0).get("foo", ReadOptions::stale()).await,
            Err(KvError::NotFound)
        );
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lagging_follower_catches_up_from_a_snapshot() {
        let cluster = Cluster::with_leader(|config| {
            config.raft.snapshot_threshold = 5;
            config.raft.snapshot_catch_up_threshold = 8;
        })
        .await;
        cluster.network.isolate(2);

        let leader = cluster.service(0);
        for i in 0..20 {
            leader.put(format!("k{i}"), "v").await.unwrap();
        }
        leader.put("foo", "last").await.unwrap();
        let status = leader.status().await.unwrap();
        assert!(status.snapshot_index > 0);

        cluster.network.heal();
        await_value(&cluster.service(2), "foo", "last").await;
        let kv = cluster
            .service(2)
            .get("k0", ReadOptions::stale())
            .await
            .unwrap();
        assert_eq!(kv.value, b"v");
        cluster.shutdown().await;
    }
}

// ============================================================================
// SECTION 4: Restarts
// ============================================================================

mod restarts {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn restarted_follower_recovers_and_catches_up() {
        let mut cluster = Cluster::with_leader(|_| {}).await;
        cluster.service(0).put("foo", "bar1").await.unwrap();
        await_value(&cluster.service(2), "foo", "bar1").await;

        cluster.stop_node(2).await;
        cluster.service(0).put("foo", "bar2").await.unwrap();
        cluster.start_node(2).await;

        // local state is back before any message arrives
        let status = cluster.service(2).status().await.unwrap();
        assert!(status.term >= 1);
        assert!(status.last_applied >= 2);

        await_value(&cluster.service(2), "foo", "bar2").await;
        cluster.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn whole_cluster_restart_keeps_terms_and_data() {
        let mut cluster = Cluster::with_leader(|_| {}).await;
        let revision = cluster.service(0).put("foo", "bar1").await.unwrap();
        for id in 0..3 {
            await_value(&cluster.service(id), "foo", "bar1").await;
        }
        let old_term = cluster.service(0).status().await.unwrap().term;

        for id in 0..3 {
            cluster.stop_node(id).await;
        }
        for id in 0..3 {
            cluster.start_node(id).await;
        }

        for id in 0..3 {
            let kv = cluster
                .service(id)
                .get("foo", ReadOptions::stale())
                .await
                .unwrap();
            assert_eq!(kv.value, b"bar1");
            assert_eq!(kv.mod_revision, revision);
        }

        cluster.service(0).campaign().await.unwrap();
        let leader = cluster.leader(&[]).await;
        assert!(leader.term > old_term);

        let leader = cluster.service(leader.id);
        let next = leader.put("foo", "bar2").await.unwrap();
        assert_eq!(next, revision + 1);
        cluster.shutdown().await;
    }
}

// ============================================================================
// SECTION 5: TCP Cluster
// ============================================================================

mod tcp_cluster {
    use super::*;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn clients_and_peers_over_sockets() {
        let peer_ports: Vec<u16> = (0..3).map(|_| free_port()).collect();
        let members: Vec<MemberConfig> = peer_ports
            .iter()
            .enumerate()
            .map(|(id, port)| MemberConfig {
                id: id as NodeId,
                peer_addr: format!("127.0.0.1:{port}"),
                client_addr: None,
            })
            .collect();

        let dirs: Vec<TempDir> = (0..3).map(|_| TempDir::new().unwrap()).collect();
        let mut nodes = Vec::new();
        for id in 0..3u64 {
            let mut config = NodeConfig::new(id, members.clone());
            config.client_listen = Some(format!("127.0.0.1:{}", free_port()));
            config.data_dir = Some(dirs[id as usize].path().to_path_buf());
            config.cluster_token = "tcp-test".into();
            fast_timers(&mut config);
            nodes.push(Node::start(config, Network::Tcp).await.unwrap());
        }
        let addrs: Vec<String> = nodes
            .iter()
            .map(|n| n.client_addr().unwrap().to_string())
            .collect();

        let mut client0 = KvClient::connect(addrs[0].clone(), CLIENT_TIMEOUT).await.unwrap();
        client0.campaign().await.unwrap();
        let leader_addr = addrs[0].clone();
        let revision = eventually("a write through node 0", || {
            let addr = leader_addr.clone();
            async move {
                let mut client = KvClient::connect(addr, CLIENT_TIMEOUT).await.ok()?;
                client.put("foo", "bar1").await.ok()
            }
        })
        .await;

        // node 1 redirects to node 0's client address, learned from the peer handshake
        let follower_addr = addrs[1].clone();
        let expected = addrs[0].clone();
        eventually("a redirect from node 1", || {
            let addr = follower_addr.clone();
            let expected = expected.clone();
            async move {
                let mut client = KvClient::connect(addr, CLIENT_TIMEOUT).await.ok()?;
                match client.put("foo", "nope").await {
                    Err(ClientError::Kv(KvError::NotLeader {
                        leader_addr: Some(leader),
                        ..
                    })) if leader == expected => Some(()),
                    _ => None,
                }
            }
        })
        .await;

        let follower_addr = addrs[2].clone();
        let kv = eventually("foo on node 2", || {
            let addr = follower_addr.clone();
            async move {
                let mut client = KvClient::connect(addr, CLIENT_TIMEOUT).await.ok()?;
                client.get("foo", ReadOptions::stale()).await.ok()
            }
        })
        .await;
        assert_eq!(kv.value, b"bar1");
        assert_eq!(kv.mod_revision, revision);

        let mut client2 = KvClient::connect(addrs[2].clone(), CLIENT_TIMEOUT).await.unwrap();
        let status = client2.status().await.unwrap();
        assert_eq!(status.id, 2);
        assert_eq!(status.leader_id, Some(0));

        for node in nodes {
            node.shutdown().await.unwrap();
        }
    }
}
