// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Key value backend abstraction.

use std::{collections::BTreeMap, pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, Txn, TxnOp, WatchOptions,
};
use futures::Stream;
use snafu::{ensure, ResultExt};
use tokio::sync::broadcast;

use crate::{EtcdFailure, EtcdTimeout, Error, InvalidKey, Result, TooManyTxnOps};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventKind {
    Put,
    Delete,
}

/// One observed change of a watched key.
#[derive(Debug, Clone)]
pub struct KvEvent {
    pub kind: KvEventKind,
    pub key: String,
    pub value: Vec<u8>,
    pub prev_value: Option<Vec<u8>>,
}

pub type KvEventStream = Pin<Box<dyn Stream<Item = Result<KvEvent>> + Send>>;

/// The key value store the meta server persists to.
///
/// Writes of one `txn_put_all` call are committed atomically.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    async fn txn_put_all(&self, kvs: Vec<(String, Vec<u8>)>) -> Result<()>;

    /// Put `value` only if the current value of `key` equals `expect`
    /// (`None` means the key must not exist). Returns whether the put
    /// happened.
    async fn compare_and_put(
        &self,
        key: &str,
        expect: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool>;

    async fn watch_prefix(&self, prefix: &str) -> Result<KvEventStream>;
}

pub type KvBackendRef = Arc<dyn KvBackend>;

/// Compute the end of the range covering every key with `prefix`.
fn prefix_range_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return end;
        }
        end.pop();
    }
    // Every key, the etcd convention for an unbounded range.
    vec![0]
}

/// Etcd backed implementation.
///
/// Every call is bounded by `call_timeout`; scans page through the range with
/// at most `max_scan_limit` keys per request.
pub struct EtcdKv {
    client: Client,
    call_timeout: Duration,
    max_scan_limit: i64,
    max_ops_per_txn: usize,
}

impl EtcdKv {
    pub fn new(
        client: Client,
        call_timeout: Duration,
        max_scan_limit: i64,
        max_ops_per_txn: usize,
    ) -> Self {
        assert!(max_scan_limit > 0);
        Self {
            client,
            call_timeout,
            max_scan_limit,
            max_ops_per_txn,
        }
    }

    async fn with_timeout<T, F>(&self, msg: &'static str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, etcd_client::Error>> + Send,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(resp) => resp.context(EtcdFailure { msg }),
            Err(_) => EtcdTimeout { msg }.fail(),
        }
    }
}

#[async_trait]
impl KvBackend for EtcdKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut client = self.client.clone();
        let resp = self
            .with_timeout("get", client.get(key, None))
            .await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut client = self.client.clone();
        self.with_timeout("put", client.put(key, value, None))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        self.with_timeout("delete", client.delete(key, None))
            .await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let range_end = prefix_range_end(prefix);
        let mut cursor = prefix.to_string();
        let mut result = Vec::new();

        loop {
            let opts = GetOptions::new()
                .with_range(range_end.clone())
                .with_limit(self.max_scan_limit);
            let mut client = self.client.clone();
            let resp = self
                .with_timeout("scan", client.get(cursor.as_str(), Some(opts)))
                .await?;

            for kv in resp.kvs() {
                let key = kv.key_str().context(InvalidKey)?.to_string();
                result.push((key, kv.value().to_vec()));
            }

            if !resp.more() {
                return Ok(result);
            }
            // Continue right behind the last returned key.
            match result.last() {
                Some((last_key, _)) => cursor = format!("{last_key}\0"),
                None => return Ok(result),
            }
        }
    }

    async fn txn_put_all(&self, kvs: Vec<(String, Vec<u8>)>) -> Result<()> {
        ensure!(
            kvs.len() <= self.max_ops_per_txn,
            TooManyTxnOps {
                max: self.max_ops_per_txn,
                given: kvs.len(),
            }
        );

        let ops = kvs
            .into_iter()
            .map(|(key, value)| TxnOp::put(key, value, None))
            .collect::<Vec<_>>();
        let txn = Txn::new().and_then(ops);

        let mut client = self.client.clone();
        self.with_timeout("txn", client.txn(txn)).await?;
        Ok(())
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expect: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool> {
        let compare = match expect {
            None => Compare::create_revision(key, CompareOp::Equal, 0),
            Some(expect) => Compare::value(key, CompareOp::Equal, expect.to_vec()),
        };
        let txn = Txn::new()
            .when(vec![compare])
            .and_then(vec![TxnOp::put(key, value, None)]);

        let mut client = self.client.clone();
        let resp = self.with_timeout("compare_and_put", client.txn(txn)).await?;
        Ok(resp.succeeded())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<KvEventStream> {
        let mut client = self.client.clone();
        let opts = WatchOptions::new().with_prefix().with_prev_key();
        let (watcher, mut stream) = client
            .watch(prefix, Some(opts))
            .await
            .context(EtcdFailure { msg: "watch" })?;

        let events = async_stream::stream! {
            // Dropping the watcher cancels the watch, keep it alive with the
            // stream.
            let _watcher = watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        for event in resp.events() {
                            let kind = match event.event_type() {
                                EventType::Put => KvEventKind::Put,
                                EventType::Delete => KvEventKind::Delete,
                            };
                            let (key, value) = match event.kv() {
                                Some(kv) => (
                                    String::from_utf8_lossy(kv.key()).to_string(),
                                    kv.value().to_vec(),
                                ),
                                None => continue,
                            };
                            let prev_value = event.prev_kv().map(|kv| kv.value().to_vec());
                            yield Ok(KvEvent {
                                kind,
                                key,
                                value,
                                prev_value,
                            });
                        }
                    }
                    Ok(None) => break,
                    Err(source) => {
                        let err: Result<KvEvent> = Err(Error::EtcdFailure {
                            msg: "watch stream broken".to_string(),
                            source,
                        });
                        yield err;
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(events))
    }
}

/// In-memory implementation used by tests and tools.
pub struct MemoryKv {
    inner: Arc<std::sync::Mutex<BTreeMap<String, Vec<u8>>>>,
    events: broadcast::Sender<KvEvent>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(std::sync::Mutex::new(BTreeMap::new())),
            events,
        }
    }
}

impl MemoryKv {
    fn publish(&self, event: KvEvent) {
        // No subscriber is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let prev_value = {
            let mut inner = self.inner.lock().unwrap();
            inner.insert(key.to_string(), value.clone())
        };
        self.publish(KvEvent {
            kind: KvEventKind::Put,
            key: key.to_string(),
            value,
            prev_value,
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let prev_value = {
            let mut inner = self.inner.lock().unwrap();
            inner.remove(key)
        };
        if prev_value.is_some() {
            self.publish(KvEvent {
                kind: KvEventKind::Delete,
                key: key.to_string(),
                value: Vec::new(),
                prev_value,
            });
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn txn_put_all(&self, kvs: Vec<(String, Vec<u8>)>) -> Result<()> {
        for (key, value) in kvs {
            self.put(&key, value).await?;
        }
        Ok(())
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expect: Option<&[u8]>,
        value: Vec<u8>,
    ) -> Result<bool> {
        let prev_value = {
            let mut inner = self.inner.lock().unwrap();
            let current = inner.get(key).map(|v| v.as_slice());
            if current != expect {
                return Ok(false);
            }
            inner.insert(key.to_string(), value.clone())
        };
        self.publish(KvEvent {
            kind: KvEventKind::Put,
            key: key.to_string(),
            value,
            prev_value,
        });
        Ok(true)
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<KvEventStream> {
        let mut rx = self.events.subscribe();
        let prefix = prefix.to_string();
        let events = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) if event.key.starts_with(&prefix) => yield Ok(event),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(events))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[test]
    fn test_prefix_range_end() {
        assert_eq!(prefix_range_end("/a"), b"/b".to_vec());
        assert_eq!(prefix_range_end("a\u{7f}"), vec![b'a', 0x80]);
        assert_eq!(prefix_range_end(""), vec![0]);
    }

    #[tokio::test]
    async fn test_memory_kv_basic() {
        let kv = MemoryKv::default();

        kv.put("/r/a", b"1".to_vec()).await.unwrap();
        kv.put("/r/b", b"2".to_vec()).await.unwrap();
        kv.put("/s/c", b"3".to_vec()).await.unwrap();

        assert_eq!(kv.get("/r/a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(kv.get("/r/missing").await.unwrap(), None);

        let scanned = kv.scan_prefix("/r/").await.unwrap();
        assert_eq!(
            scanned,
            vec![
                ("/r/a".to_string(), b"1".to_vec()),
                ("/r/b".to_string(), b"2".to_vec()),
            ]
        );

        kv.delete("/r/a").await.unwrap();
        assert_eq!(kv.get("/r/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_kv_compare_and_put() {
        let kv = MemoryKv::default();

        assert!(kv
            .compare_and_put("/k", None, b"v1".to_vec())
            .await
            .unwrap());
        // Create again must fail.
        assert!(!kv
            .compare_and_put("/k", None, b"v2".to_vec())
            .await
            .unwrap());
        // Update with the right expectation succeeds.
        assert!(kv
            .compare_and_put("/k", Some(b"v1"), b"v2".to_vec())
            .await
            .unwrap());
        assert_eq!(kv.get("/k").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn test_memory_kv_watch() {
        let kv = MemoryKv::default();
        let mut stream = kv.watch_prefix("/watched/").await.unwrap();

        kv.put("/other/a", b"x".to_vec()).await.unwrap();
        kv.put("/watched/a", b"1".to_vec()).await.unwrap();
        kv.delete("/watched/a").await.unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.kind, KvEventKind::Put);
        assert_eq!(event.key, "/watched/a");

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.kind, KvEventKind::Delete);
        assert_eq!(event.prev_value, Some(b"1".to_vec()));
    }
}
