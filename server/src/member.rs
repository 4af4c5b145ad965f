// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Leader election of the meta server quorum.
//!
//! The leader owns a lease protected key holding its endpoint. Candidates
//! try a create-if-absent transaction; the loser caches the observed leader
//! endpoint (the forwarding target) and watches the key, re-campaigning as
//! soon as it disappears.

use std::{
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use etcd_client::{
    Client, Compare, CompareOp, EventType, PutOptions, Txn, TxnOp, TxnOpResponse,
};
use log::{error, info, warn};
use meta_storage::keys;
use snafu::ResultExt;
use tokio::{
    sync::{
        mpsc::{self, Sender},
        watch,
    },
    task::JoinHandle,
    time,
};

use crate::{EtcdFailure, Result};

const CAMPAIGN_RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub struct Member {
    etcd: Client,
    key: String,
    /// The advertised http endpoint of this node, also the value stored
    /// under the leader key.
    endpoint: String,
    lease_ttl_sec: i64,
    leader_tx: watch::Sender<bool>,
    leader_rx: watch::Receiver<bool>,
    leader_cache: RwLock<Option<String>>,
    campaign_handle: Mutex<Option<JoinHandle<()>>>,
    stop_campaign_tx: Mutex<Option<Sender<()>>>,
}

pub type MemberRef = Arc<Member>;

impl Member {
    pub fn new(etcd: Client, root_path: &str, endpoint: String, lease_ttl_sec: i64) -> Self {
        assert!(lease_ttl_sec > 0);
        let (leader_tx, leader_rx) = watch::channel(false);
        Self {
            etcd,
            key: keys::leader_key(root_path),
            endpoint,
            lease_ttl_sec,
            leader_tx,
            leader_rx,
            leader_cache: RwLock::new(None),
            campaign_handle: Mutex::new(None),
            stop_campaign_tx: Mutex::new(None),
        }
    }

    #[inline]
    pub fn is_leader(&self) -> bool {
        *self.leader_rx.borrow()
    }

    /// Subscribe to leadership changes; used to cancel running procedures on
    /// a lost lease.
    pub fn leader_watch(&self) -> watch::Receiver<bool> {
        self.leader_rx.clone()
    }

    /// The endpoint mutating requests should be sent to.
    pub fn leader_addr(&self) -> Option<String> {
        if self.is_leader() {
            return Some(self.endpoint.clone());
        }
        self.leader_cache.read().unwrap().clone()
    }

    fn set_leader(&self, is_leader: bool) {
        let _ = self.leader_tx.send(is_leader);
    }

    pub fn start(self: Arc<Self>) {
        let member = self.clone();
        let (tx, mut rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            info!("Member campaign starts, endpoint:{}", member.endpoint);
            loop {
                tokio::select! {
                    _ = rx.recv() => {
                        warn!("Receive exit command and exit campaign loop");
                        break;
                    }
                    result = member.campaign_once() => {
                        if let Err(e) = result {
                            error!("Member campaign failed, err:{e}");
                            time::sleep(CAMPAIGN_RETRY_INTERVAL).await;
                        }
                    }
                }
            }
            member.step_down().await;
        });

        *self.stop_campaign_tx.lock().unwrap() = Some(tx);
        *self.campaign_handle.lock().unwrap() = Some(handle);
    }

    pub async fn stop(&self) {
        let tx = self.stop_campaign_tx.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
        let handle = self.campaign_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// One election round: either win and hold the leadership until the
    /// lease breaks, or observe the winner until its key disappears.
    async fn campaign_once(&self) -> Result<()> {
        let mut etcd = self.etcd.clone();

        let lease = etcd
            .lease_grant(self.lease_ttl_sec, None)
            .await
            .context(EtcdFailure { msg: "grant lease" })?;
        let lease_id = lease.id();

        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                self.key.as_str(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(
                self.key.as_str(),
                self.endpoint.as_str(),
                Some(PutOptions::new().with_lease(lease_id)),
            )])
            .or_else(vec![TxnOp::get(self.key.as_str(), None)]);
        let resp = etcd
            .txn(txn)
            .await
            .context(EtcdFailure { msg: "campaign txn" })?;

        if resp.succeeded() {
            self.set_leader(true);
            info!("Member becomes leader, endpoint:{}", self.endpoint);

            self.keep_leadership(lease_id).await;

            self.set_leader(false);
            warn!("Member lost leadership, endpoint:{}", self.endpoint);
            return Ok(());
        }

        // Somebody else won, remember its endpoint for forwarding.
        let _ = etcd.lease_revoke(lease_id).await;
        for op in resp.op_responses() {
            if let TxnOpResponse::Get(get) = op {
                if let Some(kv) = get.kvs().first() {
                    let leader = String::from_utf8_lossy(kv.value()).to_string();
                    info!("Member observes leader, leader:{leader}");
                    *self.leader_cache.write().unwrap() = Some(leader);
                }
            }
        }

        self.watch_leader().await
    }

    /// Refresh the lease until it cannot be kept alive anymore.
    async fn keep_leadership(&self, lease_id: i64) {
        let mut etcd = self.etcd.clone();
        let (mut keeper, mut responses) = match etcd.lease_keep_alive(lease_id).await {
            Ok(pair) => pair,
            Err(e) => {
                error!("Failed to start lease keep alive, err:{e}");
                return;
            }
        };

        let interval = Duration::from_secs((self.lease_ttl_sec as u64 / 3).max(1));
        loop {
            time::sleep(interval).await;
            if keeper.keep_alive().await.is_err() {
                return;
            }
            match responses.message().await {
                Ok(Some(resp)) if resp.ttl() > 0 => {}
                _ => return,
            }
        }
    }

    /// Follow the leader key until it is deleted, then re-campaign.
    async fn watch_leader(&self) -> Result<()> {
        let mut etcd = self.etcd.clone();
        let (_watcher, mut stream) = etcd
            .watch(self.key.as_str(), None)
            .await
            .context(EtcdFailure { msg: "watch leader" })?;

        while let Ok(Some(resp)) = stream.message().await {
            for event in resp.events() {
                match event.event_type() {
                    EventType::Delete => {
                        warn!("Leader key expired, re-campaign");
                        *self.leader_cache.write().unwrap() = None;
                        return Ok(());
                    }
                    EventType::Put => {
                        if let Some(kv) = event.kv() {
                            let leader = String::from_utf8_lossy(kv.value()).to_string();
                            *self.leader_cache.write().unwrap() = Some(leader);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Give the leadership up on a clean shutdown so the next election does
    /// not have to wait for the lease timeout.
    async fn step_down(&self) {
        if !self.is_leader() {
            return;
        }
        self.set_leader(false);

        let mut etcd = self.etcd.clone();
        let txn = Txn::new()
            .when(vec![Compare::value(
                self.key.as_str(),
                CompareOp::Equal,
                self.endpoint.as_str(),
            )])
            .and_then(vec![TxnOp::delete(self.key.as_str(), None)]);
        if let Err(e) = etcd.txn(txn).await {
            error!("Failed to delete the leader key on shutdown, err:{e}");
        }
    }
}
