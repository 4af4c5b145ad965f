// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Monotonic id allocation in batched ranges.
//!
//! Ids are handed out from an in-memory window and a new high watermark is
//! persisted through the provided closure whenever the window is exhausted,
//! so at most one write per `alloc_step` allocations hits the backing store.
//! After a restart allocation resumes from the persisted watermark, which may
//! skip ids but never reuses one.

use std::future::Future;

use tokio::sync::RwLock;

use crate::error::GenericResult;

#[derive(Debug)]
struct Inner {
    next_id: u64,
    batch_end: u64,
    alloc_step: u64,
}

impl Inner {
    fn new(next_id: u64, batch_end: u64, alloc_step: u64) -> Self {
        assert!(alloc_step > 0);
        Self {
            next_id,
            batch_end,
            alloc_step,
        }
    }

    async fn alloc_id<F, T>(&mut self, persist_next_max_id: F) -> GenericResult<u64>
    where
        F: FnOnce(u64) -> T,
        T: Future<Output = GenericResult<()>>,
    {
        if self.next_id < self.batch_end {
            self.next_id += 1;
            return Ok(self.next_id);
        }

        let next_max_id = self.next_id + self.alloc_step;
        persist_next_max_id(next_max_id).await?;
        self.batch_end = next_max_id;

        self.next_id += 1;
        Ok(self.next_id)
    }

    async fn alloc_id_batch<F, T>(
        &mut self,
        count: usize,
        persist_next_max_id: F,
    ) -> GenericResult<Vec<u64>>
    where
        F: FnOnce(u64) -> T,
        T: Future<Output = GenericResult<()>>,
    {
        let wanted_end = self.next_id + count as u64;
        if wanted_end > self.batch_end {
            // Extend the window by whole steps until the batch fits.
            let missing = wanted_end - self.batch_end;
            let steps = (missing + self.alloc_step - 1) / self.alloc_step;
            let next_max_id = self.batch_end + steps * self.alloc_step;
            persist_next_max_id(next_max_id).await?;
            self.batch_end = next_max_id;
        }

        let ids = (self.next_id + 1..=wanted_end).collect();
        self.next_id = wanted_end;
        Ok(ids)
    }
}

/// Allocator of monotonic 64-bit ids.
///
/// `next_id`/`batch_end` should be seeded with the persisted high watermark
/// read from the backing store before the first allocation.
#[derive(Debug)]
pub struct IdAllocator {
    inner: RwLock<Inner>,
}

impl IdAllocator {
    pub fn new(next_id: u64, batch_end: u64, alloc_step: u64) -> Self {
        Self {
            inner: RwLock::new(Inner::new(next_id, batch_end, alloc_step)),
        }
    }

    /// Alloc one id.
    pub async fn alloc_id<F, T>(&self, persist_next_max_id: F) -> GenericResult<u64>
    where
        F: FnOnce(u64) -> T,
        T: Future<Output = GenericResult<()>>,
    {
        self.inner
            .write()
            .await
            .alloc_id(persist_next_max_id)
            .await
    }

    /// Alloc `count` consecutive ids.
    pub async fn alloc_id_batch<F, T>(
        &self,
        count: usize,
        persist_next_max_id: F,
    ) -> GenericResult<Vec<u64>>
    where
        F: FnOnce(u64) -> T,
        T: Future<Output = GenericResult<()>>,
    {
        self.inner
            .write()
            .await
            .alloc_id_batch(count, persist_next_max_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::IdAllocator;

    #[tokio::test]
    async fn test_alloc_id() {
        let allocator = IdAllocator::new(0, 0, 100);

        let persist = move |next_max_id| async move {
            assert_eq!(next_max_id, 100);
            Ok(())
        };
        for expected in 1..=100 {
            let id = allocator.alloc_id(persist).await.unwrap();
            assert_eq!(id, expected);
        }

        let persist = move |next_max_id| async move {
            assert_eq!(next_max_id, 200);
            Ok(())
        };
        for expected in 101..=200 {
            let id = allocator.alloc_id(persist).await.unwrap();
            assert_eq!(id, expected);
        }
    }

    #[tokio::test]
    async fn test_alloc_id_batch() {
        let allocator = IdAllocator::new(0, 0, 10);

        // The first batch spans three steps.
        let ids = allocator
            .alloc_id_batch(25, move |next_max_id| async move {
                assert_eq!(next_max_id, 30);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(ids, (1..=25).collect::<Vec<_>>());

        // The rest of the window is served without persisting.
        let ids = allocator
            .alloc_id_batch(5, move |_| async move {
                panic!("should not persist");
            })
            .await
            .unwrap();
        assert_eq!(ids, (26..=30).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_resume_from_watermark() {
        // Simulate a restart: the persisted watermark is 300, ids before it
        // are lost but never reused.
        let allocator = IdAllocator::new(300, 300, 100);

        let id = allocator
            .alloc_id(move |next_max_id| async move {
                assert_eq!(next_max_id, 400);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(id, 301);
    }
}
