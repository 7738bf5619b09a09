//! The bounded channel between polling workers and the buffer consumer.
//!
//! Many writers (one per running group), exactly one reader (the buffer
//! consumer). `put` blocks up to 30s and fails the caller on timeout rather
//! than dropping the sample silently or growing without bound — this is the
//! back-pressure signal workers react to (spec §4.9, §7 error kind 5).

use crate::sample::Sample;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub const DEFAULT_CAPACITY: usize = 10_000;
const PUT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("data queue full for {0:?}")]
pub struct QueueFull(pub Duration);

pub struct DataQueueSender {
    tx: mpsc::Sender<Sample>,
}

impl Clone for DataQueueSender {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl DataQueueSender {
    /// Enqueue a sample, blocking up to 30s if the queue is full. Returns
    /// `QueueFull` on expiry; the caller (a polling worker) treats this as a
    /// failed poll cycle and continues to its next tick.
    pub async fn put(&self, sample: Sample) -> Result<(), QueueFull> {
        match tokio::time::timeout(PUT_TIMEOUT, self.tx.send(sample)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(QueueFull(PUT_TIMEOUT)),
            Err(_) => Err(QueueFull(PUT_TIMEOUT)),
        }
    }
}

pub struct DataQueueReceiver {
    rx: mpsc::Receiver<Sample>,
}

impl DataQueueReceiver {
    /// Blocks without timeout until a sample is available or every sender
    /// has been dropped.
    pub async fn get(&mut self) -> Option<Sample> {
        self.rx.recv().await
    }
}

/// Construct the single data-queue channel shared by every worker and the
/// one buffer-consumer task.
pub fn data_queue(capacity: usize) -> (DataQueueSender, DataQueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (DataQueueSender { tx }, DataQueueReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mc3e::{DeviceAddress, DeviceCode};
    use crate::sample::{Quality, RawValue, Sample, TagKind};

    fn sample() -> Sample {
        Sample::new(
            "PLC01",
            DeviceAddress::new(DeviceCode::D, 1),
            "EQUIP0000000001",
            TagKind::WordHost,
            RawValue::Word(1),
            1.0,
            Quality::Good,
        )
    }

    #[tokio::test]
    async fn put_then_get_round_trips_in_order() {
        let (tx, mut rx) = data_queue(4);
        tx.put(sample()).await.unwrap();
        tx.put(sample()).await.unwrap();
        assert!(rx.get().await.is_some());
        assert!(rx.get().await.is_some());
    }

    #[tokio::test]
    async fn get_returns_none_once_all_senders_dropped() {
        let (tx, mut rx) = data_queue(4);
        drop(tx);
        assert!(rx.get().await.is_none());
    }

    #[tokio::test]
    async fn multiple_senders_can_enqueue_concurrently() {
        let (tx, mut rx) = data_queue(8);
        let tx2 = tx.clone();
        tx.put(sample()).await.unwrap();
        tx2.put(sample()).await.unwrap();
        assert!(rx.get().await.is_some());
        assert!(rx.get().await.is_some());
    }
}
