use std::sync::{
    Arc, atomic::{AtomicBool, Ordering}
};

use tracing::debug;

use super::control::{BackendControl, ClientControl};

/// Closes both legs of a session exactly once, no matter how many tasks race to end it.
pub struct Teardown {
    client: Arc<dyn ClientControl>,
    backend: Arc<dyn BackendControl>,
    done: AtomicBool,
}

impl Teardown {
    pub fn new(client: Arc<dyn ClientControl>, backend: Arc<dyn BackendControl>) -> Self {
        Self {
            client,
            backend,
            done: AtomicBool::new(false),
        }
    }

    /// Close the client channel, then the backend channel. Returns false if teardown already ran.
    pub async fn run(&self) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Err(e) = self.client.close().await {
            debug!(error = %e, "client channel already gone");
        }
        if let Err(e) = self.backend.close().await {
            debug!(error = %e, "backend channel already gone");
        }
        true
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use russh::Sig;
    use tokio::sync::oneshot;

    use super::*;
    use crate::{
        error::{RelayError, RelayResult}, relay::request::ChannelRequest
    };

    #[derive(Default)]
    struct Counting {
        closes: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ClientControl for Counting {
        async fn exit_status(&self, _code: u32) -> RelayResult<()> {
            Ok(())
        }
        async fn exit_signal(&self, _signal: Sig, _core_dumped: bool, _message: String) -> RelayResult<()> {
            Ok(())
        }
        async fn close(&self) -> RelayResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RelayError::StreamTerminated("client gone"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl BackendControl for Counting {
        async fn forward(&self, _request: ChannelRequest) -> RelayResult<Option<oneshot::Receiver<bool>>> {
            Ok(None)
        }
        async fn close(&self) -> RelayResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_teardown_closes_each_leg_once() {
        let client = Arc::new(Counting::default());
        let backend = Arc::new(Counting::default());
        let teardown = Arc::new(Teardown::new(client.clone(), backend.clone()));

        let (a, b, c) = tokio::join!(teardown.run(), teardown.run(), teardown.run());
        assert_eq!([a, b, c].iter().filter(|ran| **ran).count(), 1);
        assert!(teardown.is_done());
        assert_eq!(client.closes.load(Ordering::SeqCst), 1);
        assert_eq!(backend.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backend_is_closed_even_if_client_is_gone() {
        let client = Arc::new(Counting {
            fail: true,
            ..Default::default()
        });
        let backend = Arc::new(Counting::default());
        let teardown = Teardown::new(client.clone(), backend.clone());

        assert!(teardown.run().await);
        assert!(!teardown.run().await);
        assert_eq!(backend.closes.load(Ordering::SeqCst), 1);
    }
}
