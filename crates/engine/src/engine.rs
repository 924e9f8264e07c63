//! Engine lifecycle: one ingestion task draining the bus into the
//! router, and a graceful shutdown sequence.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use cv_bus::Filter;
use cv_domain::cancel::CancelToken;
use cv_domain::error::Result;

use crate::router::Router;
use crate::state::EngineState;

pub struct Engine {
    state: EngineState,
    router: Arc<Router>,
    ingest: Mutex<Option<JoinHandle<()>>>,
    stop: CancelToken,
}

impl Engine {
    pub fn new(state: EngineState) -> Self {
        let router = Arc::new(Router::new(state.clone()));
        Self {
            state,
            router,
            ingest: Mutex::new(None),
            stop: CancelToken::new(),
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Subscribe to the bus and start routing. Idempotent-ish: calling
    /// twice spawns a second drain, so don't.
    pub async fn start(&self) -> Result<()> {
        let mut stream = self.state.bus.subscribe(Filter::all()).await?;
        let router = self.router.clone();
        let stop = self.stop.clone();

        let handle = tokio::spawn(async move {
            tracing::info!("event ingestion started");
            loop {
                let watch_stop = async {
                    loop {
                        if stop.is_cancelled() {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                };
                tokio::select! {
                    event = stream.next() => {
                        match event {
                            Some(event) => router.route(event).await,
                            None => {
                                tracing::info!("event stream closed");
                                break;
                            }
                        }
                    }
                    _ = watch_stop => {
                        tracing::info!("event ingestion stopping");
                        break;
                    }
                }
            }
        });
        *self.ingest.lock() = Some(handle);
        Ok(())
    }

    /// Graceful shutdown: stop ingesting, cancel every live loop, and
    /// close the bus. The seen-marker store persists eagerly, so nothing
    /// needs flushing here.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let handle = self.ingest.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.state.cancels.cancel_all();
        // Give cancelled loops a moment to run their terminal flush.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while self.state.live_rals.live_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.state.bus.close().await;
        tracing::info!("engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cv_bus::{HmacSigner, InMemoryRelayPool};
    use cv_domain::config::EngineConfig;
    use cv_domain::event::{EventBuilder, EventKind};

    #[tokio::test]
    async fn start_routes_published_events() {
        let pool = Arc::new(InMemoryRelayPool::new());
        let state =
            EngineState::ephemeral(EngineConfig::default(), pool.clone()).unwrap();
        let engine = Engine::new(state.clone());
        engine.start().await.unwrap();

        let human = HmacSigner::from_name("human");
        let event = EventBuilder::new(EventKind::NOTE)
            .content("hello engine")
            .created_at(1)
            .sign(&human);
        pool.inject(event.clone());

        // Wait for the ingestion task to route it.
        for _ in 0..100 {
            if state.store.snapshot(&event.id).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(state.store.snapshot(&event.id).is_some());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_ingestion() {
        let pool = Arc::new(InMemoryRelayPool::new());
        let state =
            EngineState::ephemeral(EngineConfig::default(), pool.clone()).unwrap();
        let engine = Engine::new(state.clone());
        engine.start().await.unwrap();
        engine.shutdown().await;

        let human = HmacSigner::from_name("human");
        let event = EventBuilder::new(EventKind::NOTE)
            .content("after shutdown")
            .created_at(2)
            .sign(&human);
        pool.inject(event.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(state.store.snapshot(&event.id).is_none());
    }
}
