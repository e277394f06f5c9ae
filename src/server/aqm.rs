use tokio::sync::{mpsc, oneshot};

/// Handle to the task owning the last observed queueing-delay sample.
///
/// Reads and writes are serialized by the owning task, so the value is never
/// shared mutable state.
#[derive(Clone)]
pub(crate) struct DelayCell {
    requests: mpsc::Sender<DelayOp>,
}

enum DelayOp {
    Store(f64),
    Load(oneshot::Sender<f64>),
}

impl DelayCell {
    /// Spawn the owner task. Must be called within a tokio runtime.
    pub(crate) fn spawn() -> Self {
        let (requests, mut inbox) = mpsc::channel(8);
        tokio::spawn(async move {
            let mut delay = 0.0f64;
            while let Some(op) = inbox.recv().await {
                match op {
                    DelayOp::Store(value) => delay = value,
                    DelayOp::Load(reply) => {
                        let _ = reply.send(delay);
                    }
                }
            }
        });
        Self { requests }
    }

    /// Non-blocking publish. At most one sample lands per RTT window, so a
    /// full inbox just means the next window's sample wins.
    pub(crate) fn store(&self, value: f64) {
        let _ = self.requests.try_send(DelayOp::Store(value));
    }

    pub(crate) async fn load(&self) -> f64 {
        let (reply, answer) = oneshot::channel();
        if self.requests.send(DelayOp::Load(reply)).await.is_err() {
            return 0.0;
        }
        answer.await.unwrap_or(0.0)
    }
}
