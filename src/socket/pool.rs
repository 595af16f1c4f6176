//! Connection pool.
//!
//! Pools live HTTP/1 request handles per route (scheme, host, port) and
//! enforces a per-route ceiling and a global ceiling. The pooled unit is a
//! [`SendRequest`] handle rather than a raw socket: once the HTTP handshake
//! runs, the socket belongs to the connection driver task and the handle is
//! the only thing left to share.
//!
//! The pool does pure accounting. [`acquire`](ConnectionPool::acquire)
//! either hands back an idle handle ([`Permit::Reuse`]) or reserves a slot
//! ([`Permit::Connect`]) and leaves the dialing to the caller; a failed
//! dial must be reported with [`abandon`](ConnectionPool::abandon) so the
//! slot is freed. Callers over their route's ceiling park on that route's
//! FIFO queue; callers over the total ceiling park on a pool-wide queue,
//! since the slot that frees them can belong to any route. Every release
//! and abandon services both queues.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use hyper::client::conn::http1::SendRequest;
use tokio::sync::oneshot;
use tracing::{debug, trace};
use url::Url;

use crate::base::NetError;
use crate::http::body::OutboundBody;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

pub type PooledSender = SendRequest<OutboundBody>;

/// One route: connections to the same (scheme, host, port) are
/// interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl RouteKey {
    pub fn from_url(url: &Url) -> Result<Self, NetError> {
        Ok(Self {
            scheme: url.scheme().to_string(),
            host: url.host_str().ok_or(NetError::InvalidUrl)?.to_string(),
            port: url.port_or_known_default().ok_or(NetError::InvalidUrl)?,
        })
    }
}

/// Outcome of an acquire: either an idle handle to reuse, or a reserved
/// slot the caller fills by dialing.
pub enum Permit {
    Reuse(PooledSender),
    Connect,
}

struct IdleSender {
    sender: PooledSender,
    parked_at: Instant,
}

struct Route {
    idle: VecDeque<IdleSender>,
    active: usize,
    waiters: VecDeque<oneshot::Sender<Permit>>,
}

/// Acquirer parked on the total ceiling; its slot can come from any route.
struct TotalWaiter {
    key: RouteKey,
    tx: oneshot::Sender<Permit>,
}

impl Route {
    fn new() -> Self {
        Self { idle: VecDeque::new(), active: 0, waiters: VecDeque::new() }
    }

    fn slots(&self) -> usize {
        self.active + self.idle.len()
    }
}

pub struct ConnectionPool {
    max_per_route: usize,
    max_total: usize,
    routes: DashMap<RouteKey, Route>,
    total_active: AtomicUsize,
    total_waiters: Mutex<VecDeque<TotalWaiter>>,
}

impl ConnectionPool {
    pub fn new(max_per_route: usize, max_total: usize) -> Self {
        Self {
            max_per_route,
            max_total,
            routes: DashMap::new(),
            total_active: AtomicUsize::new(0),
            total_waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Obtain a permit for one exchange on `key`, waiting if the route or
    /// the pool is at its ceiling.
    pub async fn acquire(&self, key: &RouteKey) -> Result<Permit, NetError> {
        let waiter = {
            let mut route = self.routes.entry(key.clone()).or_insert_with(Route::new);

            // Prefer a live idle handle; closed ones are shed here.
            while let Some(parked) = route.idle.pop_front() {
                if !parked.sender.is_closed() {
                    route.active += 1;
                    self.total_active.fetch_add(1, Ordering::Relaxed);
                    trace!(?key, "reusing pooled connection");
                    return Ok(Permit::Reuse(parked.sender));
                }
            }

            let under_route_limit = route.slots() < self.max_per_route;
            let under_total_limit = self.total_active.load(Ordering::Relaxed) < self.max_total;
            if under_route_limit && under_total_limit {
                route.active += 1;
                self.total_active.fetch_add(1, Ordering::Relaxed);
                return Ok(Permit::Connect);
            }

            let (tx, rx) = oneshot::channel();
            if under_route_limit {
                // Blocked only by the total ceiling: park on the pool-wide
                // queue, outside the route guard.
                drop(route);
                debug!(?key, "pool at total ceiling, queueing");
                self.total_waiters
                    .lock()
                    .unwrap()
                    .push_back(TotalWaiter { key: key.clone(), tx });
                // A slot may have freed between the check and the enqueue;
                // re-service the queue so the wakeup is not lost.
                if self.total_active.load(Ordering::Relaxed) < self.max_total {
                    self.wake_total_waiter();
                }
            } else {
                route.waiters.push_back(tx);
                debug!(?key, "route at ceiling, queueing");
            }
            rx
        };

        waiter.await.map_err(|_| NetError::ConnectionFailed)
    }

    /// Return a reusable handle after a fully consumed exchange. A closed
    /// handle is treated as an abandon.
    pub fn release(&self, key: &RouteKey, sender: PooledSender) {
        if sender.is_closed() {
            self.abandon(key);
            return;
        }
        {
            let mut route = self.routes.entry(key.clone()).or_insert_with(Route::new);
            let mut sender = sender;
            // Lease transfers to a same-route waiter without touching the
            // counters. A waiter that gave up hands the permit back; try
            // the next one.
            while let Some(waiter) = route.waiters.pop_front() {
                match waiter.send(Permit::Reuse(sender)) {
                    Ok(()) => return,
                    Err(Permit::Reuse(returned)) => sender = returned,
                    Err(Permit::Connect) => unreachable!(),
                }
            }
            self.park_idle(&mut route, sender);
        }
        // Parking freed a total slot; it may unblock another route.
        self.wake_total_waiter();
    }

    fn park_idle(&self, route: &mut Route, sender: PooledSender) {
        route.active = route.active.saturating_sub(1);
        self.total_active.fetch_sub(1, Ordering::Relaxed);
        route.idle.push_back(IdleSender { sender, parked_at: Instant::now() });
    }

    /// Give up a reserved or active slot with nothing to return: the dial
    /// failed, the exchange errored, or the handle died mid-use.
    pub fn abandon(&self, key: &RouteKey) {
        {
            let mut route = self.routes.entry(key.clone()).or_insert_with(Route::new);
            // Hand the freed slot to a same-route waiter as a dial permit;
            // the counters carry over with the lease.
            while let Some(waiter) = route.waiters.pop_front() {
                if waiter.send(Permit::Connect).is_ok() {
                    return;
                }
            }
            route.active = route.active.saturating_sub(1);
        }
        self.total_active.fetch_sub(1, Ordering::Relaxed);
        self.wake_total_waiter();
    }

    /// Grant freed total slots to acquirers parked on the pool-wide queue.
    /// Must be called with no route guard held: granting touches the
    /// waiter's own route entry.
    fn wake_total_waiter(&self) {
        loop {
            let waiter = { self.total_waiters.lock().unwrap().pop_front() };
            let Some(waiter) = waiter else { return };
            if self.total_active.load(Ordering::Relaxed) >= self.max_total {
                // Slot taken meanwhile; put the waiter back for the next
                // release or abandon.
                self.total_waiters.lock().unwrap().push_front(waiter);
                return;
            }
            let mut route = self.routes.entry(waiter.key.clone()).or_insert_with(Route::new);
            if route.slots() >= self.max_per_route {
                // Their route filled up while they waited on the total
                // ceiling; they are now a route waiter.
                route.waiters.push_back(waiter.tx);
                drop(route);
                continue;
            }
            route.active += 1;
            self.total_active.fetch_add(1, Ordering::Relaxed);
            if waiter.tx.send(Permit::Connect).is_err() {
                // Waiter gave up; undo the grant and try the next one.
                route.active -= 1;
                self.total_active.fetch_sub(1, Ordering::Relaxed);
                drop(route);
                continue;
            }
            return;
        }
    }

    pub fn active_count(&self) -> usize {
        self.total_active.load(Ordering::Relaxed)
    }

    pub fn idle_count(&self) -> usize {
        self.routes.iter().map(|r| r.idle.len()).sum()
    }

    /// Drop idle handles past their timeout or whose connection died, and
    /// forget routes with no state left.
    pub fn prune_idle(&self) {
        let now = Instant::now();
        let mut empty = Vec::new();
        for mut entry in self.routes.iter_mut() {
            let route = entry.value_mut();
            route.idle.retain(|parked| {
                now.duration_since(parked.parked_at) < IDLE_TIMEOUT && !parked.sender.is_closed()
            });
            if route.idle.is_empty() && route.active == 0 && route.waiters.is_empty() {
                empty.push(entry.key().clone());
            }
        }
        for key in empty {
            self.routes
                .remove_if(&key, |_, r| r.idle.is_empty() && r.active == 0 && r.waiters.is_empty());
        }
    }

    /// Periodic prune loop. Call once at engine startup, on the engine
    /// runtime.
    pub fn start_prune_task(self: &Arc<Self>, handle: &tokio::runtime::Handle) {
        let pool = Arc::clone(self);
        handle.spawn(async move {
            loop {
                tokio::time::sleep(CLEANUP_INTERVAL).await;
                pool.prune_idle();
            }
        });
    }
}
