//! Flush triggers: lifecycle, manual, mount, post-enqueue, and periodic.
//!
//! Every trigger funnels into the engine's single-flight flush, so a burst of
//! triggers costs one real flush plus no-ops.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::sync::SyncEngine;

/// Foreground state of the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppState {
    #[default]
    Active,
    Background,
    Inactive,
}

#[derive(Clone)]
pub struct Triggers {
    engine: Arc<SyncEngine>,
}

impl Triggers {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    /// Manual "sync now". Returns the number of mutations applied.
    pub async fn sync_now(&self) -> usize {
        self.run("manual").await
    }

    /// Flush when a screen or the app mounts.
    pub async fn on_mount(&self) -> usize {
        self.run("mount").await
    }

    /// Best-effort flush after an enqueue. The caller does not await it and
    /// nothing guarantees it runs before the next trigger.
    pub fn after_enqueue(&self) -> JoinHandle<usize> {
        let this = self.clone();
        tokio::spawn(async move { this.run("enqueue").await })
    }

    /// Flush once on start, then on every transition into `Active`.
    /// The task ends when the sender side is dropped.
    pub fn watch_lifecycle(&self, mut rx: watch::Receiver<AppState>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut last = *rx.borrow_and_update();
            this.run("mount").await;

            while rx.changed().await.is_ok() {
                let next = *rx.borrow_and_update();
                if next == AppState::Active && last != AppState::Active {
                    debug!(from = ?last, "app returned to foreground");
                    this.run("foreground").await;
                }
                last = next;
            }
            debug!("lifecycle source closed");
        })
    }

    /// Flush every `interval` until `shutdown` is notified.
    pub fn periodic(&self, interval: Duration, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "periodic sync started");
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        info!("periodic sync shutting down");
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {
                        this.run("periodic").await;
                    }
                }
            }
        })
    }

    async fn run(&self, trigger: &'static str) -> usize {
        match self.engine.flush_for(trigger).await {
            Ok(report) => report.applied_count(),
            Err(e) => {
                error!(trigger, error = %e, "triggered flush failed");
                0
            }
        }
    }
}
