//! The dump barrier.
//!
//! While a dump is wiping the global tier, every session entry point and
//! CRUD primitive parks on this gate instead of racing the wipe. The gate
//! is open almost always; `wait` is a single atomic load on that path.

use tokio::sync::watch;

/// One-writer, many-waiter barrier around cache dumps.
pub struct DumpGate {
    state: watch::Sender<bool>,
}

impl DumpGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self { state }
    }

    /// Raise the barrier. Callers pair this with [`DumpGate::finish`].
    pub fn begin(&self) {
        self.state.send_replace(true);
    }

    /// Lower the barrier and wake every parked waiter.
    pub fn finish(&self) {
        self.state.send_replace(false);
    }

    /// Park until no dump is in progress. No-op when the gate is open.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for DumpGate {
    fn default() -> Self {
        Self::new()
    }
}
