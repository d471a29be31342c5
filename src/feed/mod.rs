//! Change Feed Bus
//!
//! Per-table, optionally filtered invalidation notices. Subscribers only learn
//! that something matching their `(table, filter)` changed and must re-fetch.
//! Delivery is at-least-once; after a transport gap every live subscription
//! receives a [`ChangeKind::Resync`] notice.

pub mod filter;
pub mod poll;
pub mod source;

pub use filter::RowFilter;
pub use poll::PollingSource;
pub use source::{ChangeSource, ChangeStream, ChannelSource, FeedPublisher};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::{ChangeEvent, ChangeKind, ChangeNotice, Table};
use crate::utils::ReconnectBackoff;

pub type ChangeCallback = Arc<dyn Fn(ChangeNotice) + Send + Sync>;

struct Registration {
    table: Table,
    filter: Option<RowFilter>,
    callback: ChangeCallback,
    active: Arc<AtomicBool>,
}

impl Registration {
    fn wants(&self, event: &ChangeEvent) -> bool {
        self.table == event.table
            && self
                .filter
                .as_ref()
                .map_or(true, |filter| filter.matches(&event.row))
    }
}

struct BusInner {
    subscriptions: Mutex<HashMap<u64, Registration>>,
    next_id: AtomicU64,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl BusInner {
    fn lock_subscriptions(&self) -> MutexGuard<'_, HashMap<u64, Registration>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: u64) {
        if self.lock_subscriptions().remove(&id).is_some() {
            debug!(subscription = id, "Subscription released");
        }
    }

    /// Fire every matching callback. Callbacks run outside the registry lock so
    /// they may subscribe or unsubscribe freely.
    fn dispatch(&self, event: &ChangeEvent) -> usize {
        let targets: Vec<(ChangeCallback, Arc<AtomicBool>)> = {
            let subs = self.lock_subscriptions();
            subs.values()
                .filter(|reg| reg.wants(event))
                .map(|reg| (reg.callback.clone(), reg.active.clone()))
                .collect()
        };

        let notice = ChangeNotice {
            table: event.table,
            kind: event.kind,
        };
        let mut fired = 0;
        for (callback, active) in targets {
            if active.load(Ordering::SeqCst) {
                callback(notice);
                fired += 1;
            }
        }
        fired
    }

    /// Tell every live subscription to re-fetch
    fn dispatch_resync(&self) -> usize {
        let targets: Vec<(Table, ChangeCallback, Arc<AtomicBool>)> = {
            let subs = self.lock_subscriptions();
            subs.values()
                .map(|reg| (reg.table, reg.callback.clone(), reg.active.clone()))
                .collect()
        };

        let mut fired = 0;
        for (table, callback, active) in targets {
            if active.load(Ordering::SeqCst) {
                callback(ChangeNotice {
                    table,
                    kind: ChangeKind::Resync,
                });
                fired += 1;
            }
        }
        fired
    }
}

/// Handle for one registration
///
/// Released by [`Subscription::unsubscribe`] or on drop, whichever comes
/// first. Once released, no new callback invocation starts for it.
pub struct Subscription {
    id: u64,
    table: Table,
    filter: Option<RowFilter>,
    bus: Weak<BusInner>,
    active: Arc<AtomicBool>,
}

impl Subscription {
    /// Safe to call repeatedly and after the bus is gone
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn filter(&self) -> Option<&RowFilter> {
        self.filter.as_ref()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("table", &self.table)
            .field("filter", &self.filter)
            .field("active", &self.is_active())
            .finish()
    }
}

/// The bus. Clones share the same registry and connection.
#[derive(Clone)]
pub struct ChangeFeedBus {
    inner: Arc<BusInner>,
}

impl ChangeFeedBus {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(BusInner {
                subscriptions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                connected: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Register interest in `(table, filter)`. Each call gets its own
    /// registration, even for identical arguments.
    pub fn subscribe<F>(
        &self,
        table: Table,
        filter: Option<RowFilter>,
        on_change: F,
    ) -> Subscription
    where
        F: Fn(ChangeNotice) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let active = Arc::new(AtomicBool::new(true));

        self.inner.lock_subscriptions().insert(
            id,
            Registration {
                table,
                filter: filter.clone(),
                callback: Arc::new(on_change),
                active: active.clone(),
            },
        );
        debug!(
            subscription = id,
            table = %table,
            filter = ?filter.as_ref().map(|f| f.to_string()),
            "Subscription registered"
        );

        Subscription {
            id,
            table,
            filter,
            bus: Arc::downgrade(&self.inner),
            active,
        }
    }

    /// Deliver one committed change to matching subscriptions
    pub fn dispatch(&self, event: &ChangeEvent) -> usize {
        self.inner.dispatch(event)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock_subscriptions().len()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Pump events from `source` until [`ChangeFeedBus::shutdown`], reconnecting
    /// with backoff whenever the transport drops
    pub fn spawn<S>(
        &self,
        source: S,
        backoff_min: Duration,
        backoff_max: Duration,
    ) -> JoinHandle<()>
    where
        S: ChangeSource + 'static,
    {
        let inner = self.inner.clone();
        let shutdown = self.inner.shutdown.subscribe();
        let backoff = ReconnectBackoff::new(backoff_min, backoff_max);
        tokio::spawn(run_feed(inner, source, backoff, shutdown))
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }
}

impl Default for ChangeFeedBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_feed<S: ChangeSource>(
    inner: Arc<BusInner>,
    source: S,
    mut backoff: ReconnectBackoff,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ever_connected = false;

    while !*shutdown.borrow() {
        match source.connect().await {
            Ok(mut stream) => {
                inner.connected.store(true, Ordering::SeqCst);
                backoff.reset();

                if ever_connected {
                    let notified = inner.dispatch_resync();
                    info!(subscriptions = notified, "Change feed reconnected, resync sent");
                } else {
                    info!("Change feed connected");
                }
                ever_connected = true;

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            inner.connected.store(false, Ordering::SeqCst);
                            info!("Change feed stopped");
                            return;
                        }
                        next = stream.next_event() => match next {
                            Some(Ok(event)) => {
                                let fired = inner.dispatch(&event);
                                debug!(
                                    table = %event.table,
                                    kind = ?event.kind,
                                    fired,
                                    "Change dispatched"
                                );
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Change feed transport error");
                                break;
                            }
                            None => {
                                warn!("Change feed connection closed");
                                break;
                            }
                        }
                    }
                }
                inner.connected.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                warn!(error = %e, attempt = backoff.attempts() + 1, "Change feed connect failed");
            }
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Change feed waiting before reconnect");
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    inner.connected.store(false, Ordering::SeqCst);
    info!("Change feed stopped");
}
