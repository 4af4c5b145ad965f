// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Watch of the shard lock lease expirations.
//!
//! Storage nodes hold one lease protected lock per owned shard. When a node
//! dies its leases run out and the locks disappear; the watch turns every
//! delete event into an [`ShardExpireEvent`] for the registered listener.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common_types::shard::ShardId;
use futures::StreamExt;
use log::{error, info, warn};
use meta_storage::{
    keys,
    kv::{KvBackend, KvBackendRef, KvEventKind},
};
use snafu::ResultExt;
use tokio::{
    sync::mpsc::{self, Sender},
    task::JoinHandle,
};

use crate::{MetaStorageFailure, Result};

#[derive(Debug, Clone)]
pub struct ShardExpireEvent {
    pub shard_id: ShardId,
    pub old_leader: String,
}

#[async_trait]
pub trait ShardExpiryListener: Send + Sync {
    async fn on_shard_expired(&self, event: ShardExpireEvent);
}

pub type ShardExpiryListenerRef = Arc<dyn ShardExpiryListener>;

#[async_trait]
pub trait ShardWatch: Send + Sync {
    async fn start(&self, listener: ShardExpiryListenerRef) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

pub type ShardWatchRef = Arc<dyn ShardWatch>;

/// Watch over the shard lock prefix of one cluster.
pub struct KvShardWatch {
    kv: KvBackendRef,
    prefix: String,
    watch_handle: Mutex<Option<JoinHandle<()>>>,
    stop_watch_tx: Mutex<Option<Sender<()>>>,
}

impl KvShardWatch {
    pub fn new(kv: KvBackendRef, lock_root: &str, cluster_name: &str) -> Result<Self> {
        let prefix = keys::shard_lock_prefix(lock_root, cluster_name).context(
            MetaStorageFailure {
                msg: "build shard lock prefix",
            },
        )?;

        Ok(Self {
            kv,
            prefix,
            watch_handle: Mutex::new(None),
            stop_watch_tx: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ShardWatch for KvShardWatch {
    async fn start(&self, listener: ShardExpiryListenerRef) -> Result<()> {
        let mut stream =
            self.kv
                .watch_prefix(&self.prefix)
                .await
                .context(MetaStorageFailure {
                    msg: "watch shard locks",
                })?;

        let prefix = self.prefix.clone();
        let (tx, mut rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            info!("Shard watch starts, prefix:{prefix}");
            loop {
                tokio::select! {
                    event = stream.next() => match event {
                        Some(Ok(event)) => {
                            if event.kind != KvEventKind::Delete {
                                continue;
                            }
                            let shard_id =
                                match keys::shard_id_from_lock_key(&prefix, &event.key) {
                                    Some(shard_id) => shard_id,
                                    None => {
                                        warn!("Ignore unknown shard lock key:{}", event.key);
                                        continue;
                                    }
                                };
                            let old_leader = event
                                .prev_value
                                .map(|value| String::from_utf8_lossy(&value).to_string())
                                .unwrap_or_default();
                            info!(
                                "Shard lock expired, shard_id:{shard_id}, old_leader:{old_leader}"
                            );
                            listener
                                .on_shard_expired(ShardExpireEvent {
                                    shard_id,
                                    old_leader,
                                })
                                .await;
                        }
                        Some(Err(e)) => {
                            error!("Shard watch stream broken, err:{e}");
                            break;
                        }
                        None => {
                            warn!("Shard watch stream closed");
                            break;
                        }
                    },
                    _ = rx.recv() => {
                        warn!("Receive exit command and exit shard watch loop");
                        break;
                    }
                }
            }
        });

        *self.stop_watch_tx.lock().unwrap() = Some(tx);
        *self.watch_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let tx = self.stop_watch_tx.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }

        let handle = self.watch_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

/// Used by the static topology where no shard locks exist.
pub struct NoopShardWatch;

#[async_trait]
impl ShardWatch for NoopShardWatch {
    async fn start(&self, _listener: ShardExpiryListenerRef) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use meta_storage::kv::{KvBackend, MemoryKv};
    use tokio::sync::mpsc::UnboundedSender;

    use super::*;

    struct ForwardListener {
        tx: UnboundedSender<ShardExpireEvent>,
    }

    #[async_trait]
    impl ShardExpiryListener for ForwardListener {
        async fn on_shard_expired(&self, event: ShardExpireEvent) {
            let _ = self.tx.send(event);
        }
    }

    #[tokio::test]
    async fn test_expiry_events() {
        let kv = Arc::new(MemoryKv::default());
        let watch = KvShardWatch::new(kv.clone(), "/ceresdb", "defaultCluster").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        watch
            .start(Arc::new(ForwardListener { tx }))
            .await
            .unwrap();

        kv.put("/ceresdb/defaultCluster/shards/3", b"n1".to_vec())
            .await
            .unwrap();
        // Another cluster's lock must be ignored.
        kv.put("/ceresdb/otherCluster/shards/4", b"n9".to_vec())
            .await
            .unwrap();
        kv.delete("/ceresdb/defaultCluster/shards/3").await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.shard_id, 3);
        assert_eq!(event.old_leader, "n1");

        watch.stop().await.unwrap();
    }
}
