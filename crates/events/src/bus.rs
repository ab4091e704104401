//! Subscription handle for queue announcements.
//!
//! Delivery is at-least-once: a subscriber may see the same announcement more
//! than once (for example after a Redis reconnect) and must be idempotent.

use tokio::sync::mpsc;

/// A subscription to a stream of messages.
///
/// The sending side is owned by whoever produced the subscription (an
/// in-memory queue, or a background reader over a Redis stream). When it is
/// dropped, `recv` returns `None`.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: mpsc::Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: mpsc::Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message. `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Take a message if one is ready.
    pub fn try_recv(&mut self) -> Result<M, mpsc::error::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn into_inner(self) -> mpsc::Receiver<M> {
        self.receiver
    }
}

impl<M> From<mpsc::Receiver<M>> for Subscription<M> {
    fn from(receiver: mpsc::Receiver<M>) -> Self {
        Self::new(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_ends_when_producer_drops() {
        let (tx, rx) = mpsc::channel(4);
        let mut sub = Subscription::new(rx);

        tx.send(1u32).await.unwrap();
        drop(tx);

        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn try_recv_reports_empty() {
        let (_tx, rx) = mpsc::channel::<u32>(1);
        let mut sub = Subscription::from(rx);
        assert!(matches!(
            sub.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
    }
}
