//! Testing utilities for link implementations.

use crate::traits::{HciLink, LinkParams, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;

/// Mock link for testing
pub struct MockLink {
    sent: Mutex<Vec<Bytes>>,
    recv_queue: Mutex<VecDeque<Bytes>>,
    recv_ready: Notify,
    connected: AtomicBool,
    latency: Duration,
    frame_loss: f64,
    params: LinkParams,
}

impl MockLink {
    /// Create a new mock link with the given frame budget.
    pub fn new(max_frame: usize) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            recv_queue: Mutex::new(VecDeque::new()),
            recv_ready: Notify::new(),
            connected: AtomicBool::new(true),
            latency: Duration::ZERO,
            frame_loss: 0.0,
            params: LinkParams {
                conn_id: 1,
                max_frame,
            },
        }
    }

    /// Configure simulated latency
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Configure simulated frame loss (0.0 - 1.0)
    pub fn with_frame_loss(mut self, loss: f64) -> Self {
        self.frame_loss = loss.clamp(0.0, 1.0);
        self
    }

    /// Inject an inbound frame
    pub fn inject_recv(&self, frame: Bytes) {
        self.recv_queue.lock().push_back(frame);
        self.recv_ready.notify_one();
    }

    /// Get sent frames
    pub fn get_sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// Clear sent frames
    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Simulate disconnect
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.recv_ready.notify_waiters();
    }

    /// Simulate reconnect
    pub fn connect(&self) {
        self.connected.store(true, Ordering::Relaxed);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl HciLink for MockLink {
    async fn open(&self) -> Result<LinkParams, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        Ok(self.params)
    }

    async fn send(&self, _conn_id: u8, frame: Bytes) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }

        let should_drop = {
            let mut rng = rand::thread_rng();
            rng.gen::<f64>() < self.frame_loss
        };
        if should_drop {
            return Err(TransportError::Other("Frame lost".to_string()));
        }

        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }

        self.sent.lock().push(frame);
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        loop {
            if !self.is_connected() {
                return Err(TransportError::Disconnected);
            }
            // The queue lock must not be held across an await point.
            let frame = self.recv_queue.lock().pop_front();
            if let Some(frame) = frame {
                if !self.latency.is_zero() {
                    sleep(self.latency).await;
                }
                return Ok(frame);
            }
            self.recv_ready.notified().await;
        }
    }

    async fn close(&self, _conn_id: u8) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::Relaxed);
        self.recv_ready.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_capture() {
        let link = MockLink::new(29);
        let params = link.open().await.unwrap();
        assert_eq!(params.max_frame, 29);

        link.send(params.conn_id, Bytes::from_static(&[0x01, 0x83]))
            .await
            .unwrap();
        let sent = link.get_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][..], &[0x01, 0x83]);
    }

    #[tokio::test]
    async fn test_inject_then_recv() {
        let link = MockLink::new(29);
        link.inject_recv(Bytes::from_static(&[0x01, 0x80]));
        let frame = link.recv().await.unwrap();
        assert_eq!(&frame[..], &[0x01, 0x80]);
    }

    #[tokio::test]
    async fn test_recv_future_moves_across_tasks() {
        let link =
            std::sync::Arc::new(MockLink::new(29).with_latency(Duration::from_millis(2)));
        let task = tokio::spawn({
            let link = link.clone();
            async move { link.recv().await }
        });
        link.inject_recv(Bytes::from_static(&[0x05, 0x81]));
        let frame = task.await.unwrap().unwrap();
        assert_eq!(&frame[..], &[0x05, 0x81]);
    }

    #[tokio::test]
    async fn test_disconnected_send_fails() {
        let link = MockLink::new(29);
        link.disconnect();
        let err = link.send(1, Bytes::new()).await;
        assert!(matches!(err, Err(TransportError::Disconnected)));
    }
}
