//! # demo
//!
//! why: make a three-node cluster visibly do something when started by hand
//! relations: writes through KvService, forwards to the leader with KvClient
//! what: run_demo loop (periodic write of this node's key, then a stale read of every key)

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{info, warn};

use crate::client::{ClientError, KvClient};
use crate::error::KvError;
use crate::service::{KvService, ReadOptions};

pub const DEMO_KEYS: [&str; 3] = ["foo", "bar", "hakuna"];

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// The key node `id` keeps writing
pub fn demo_key(id: u64) -> &'static str {
    DEMO_KEYS[(id % DEMO_KEYS.len() as u64) as usize]
}

pub async fn run_demo(service: KvService, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(every);
    // the first tick completes immediately; give the cluster one period to elect
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }
        // a stalled leader must not hold up shutdown
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = demo_round(&service) => {}
        }
    }
}

async fn demo_round(service: &KvService) {
    let node = service.id();
    let key = demo_key(node);
    let value = unix_millis().to_string();
    match service.put(key, value.clone()).await {
        Ok(revision) => info!(node, key, value = %value, revision, "demo write"),
        Err(KvError::NotLeader {
            leader_id,
            leader_addr: Some(addr),
        }) => match forward_put(&addr, key, &value, service.request_timeout()).await {
            Ok(revision) => {
                info!(node, key, value = %value, revision, leader = ?leader_id, "demo write forwarded")
            }
            Err(e) => warn!(node, key, leader = %addr, error = %e, "forwarded demo write failed"),
        },
        Err(e) => warn!(node, key, error = %e, "demo write failed"),
    }

    let mut found = 0;
    for key in DEMO_KEYS {
        match service.get(key, ReadOptions::stale()).await {
            Ok(kv) => {
                found += 1;
                info!("{} ===> {}", key, String::from_utf8_lossy(&kv.value));
            }
            Err(KvError::NotFound) => {}
            Err(e) => warn!(node, key, error = %e, "demo read failed"),
        }
    }
    info!(node, found, "demo keys present");
}

async fn forward_put(addr: &str, key: &str, value: &str, limit: Duration) -> Result<u64, ClientError> {
    let mut client = KvClient::connect(addr, limit).await?;
    client.put(key, value).await
}
