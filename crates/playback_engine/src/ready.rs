use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("playback engine was dropped before it became available")]
pub struct EngineUnavailable;

/// Fired by the engine exactly once, when it has finished loading.
#[derive(Debug)]
pub struct ReadyNotifier {
    tx: oneshot::Sender<()>,
}

/// Awaited exactly once by whoever wires the engine into a session.
#[derive(Debug)]
pub struct ReadyWaiter {
    rx: oneshot::Receiver<()>,
}

pub fn ready_signal() -> (ReadyNotifier, ReadyWaiter) {
    let (tx, rx) = oneshot::channel();
    (ReadyNotifier { tx }, ReadyWaiter { rx })
}

impl ReadyNotifier {
    pub fn notify(self) {
        let _ = self.tx.send(());
    }
}

impl ReadyWaiter {
    /// Resolves once the notifier fires. Never resolves if the engine keeps loading;
    /// fails if the notifier is dropped without firing.
    pub async fn wait(self) -> Result<(), EngineUnavailable> {
        self.rx.await.map_err(|_| EngineUnavailable)
    }
}
