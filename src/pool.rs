//! Destination-partitioned connection pool.
//!
//! Every open connection is counted against its destination's cap and the
//! pool-wide cap from the moment capacity is reserved for it (before the
//! connect starts) until it is destroyed. Free connections sit in a
//! per-destination list ordered by release time; a lease always takes the
//! most recently released one. Leased connections are owned by exactly one
//! [`Lease`], which returns its capacity when released, destroyed or dropped.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::config::PoolLimits;
use crate::destination::Destination;
use crate::error::{Error, TimeoutPhase};
use crate::util::{lock_unpoisoned, read_unpoisoned, write_unpoisoned};

/// A transport channel that can be parked in the pool between requests.
pub trait Poolable: Send + 'static {
    /// Whether the underlying channel can still carry a request. Closed
    /// channels are destroyed instead of being leased or pooled.
    fn is_open(&self) -> bool {
        true
    }
}

/// Opens new transport channels for a destination.
pub trait Connect: Send + Sync + 'static {
    type Connection: Poolable;

    fn connect<'a>(
        &'a self,
        destination: &'a Destination,
    ) -> BoxFuture<'a, Result<Self::Connection, Error>>;
}

pub struct Connection<T> {
    id: u64,
    destination: Destination,
    created_at: Instant,
    last_used_at: Instant,
    keep_alive_deadline: Option<Instant>,
    use_count: u64,
    io: T,
}

impl<T> Connection<T> {
    fn new(id: u64, destination: Destination, io: T, now: Instant) -> Self {
        Self {
            id,
            destination,
            created_at: now,
            last_used_at: now,
            keep_alive_deadline: None,
            use_count: 0,
            io,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    pub fn keep_alive_deadline(&self) -> Option<Instant> {
        self.keep_alive_deadline
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn io(&self) -> &T {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut T {
        &mut self.io
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.keep_alive_deadline
            .is_some_and(|deadline| deadline <= now)
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Connection")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .field("keep_alive_deadline", &self.keep_alive_deadline)
            .field("use_count", &self.use_count)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DestinationStats {
    pub leased: usize,
    pub available: usize,
    pub pending: usize,
    pub max: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub leased: usize,
    pub available: usize,
    pub pending: usize,
    pub max_total: usize,
    pub destinations: BTreeMap<Destination, DestinationStats>,
    pub created: u64,
    pub reused: u64,
    pub evicted_expired: u64,
    pub evicted_idle: u64,
    pub destroyed: u64,
}

impl PoolStats {
    /// Connections currently counted against `max_total`.
    pub fn allocated(&self) -> usize {
        self.leased + self.available + self.pending
    }
}

struct Route<T> {
    destination: Destination,
    max: usize,
    state: Mutex<RouteState<T>>,
}

struct RouteState<T> {
    free: Vec<Connection<T>>,
    leased: usize,
    pending: usize,
    retired: bool,
}

impl<T> RouteState<T> {
    fn allocated(&self) -> usize {
        self.free.len() + self.leased + self.pending
    }
}

impl<T> Route<T> {
    fn new(destination: Destination, max: usize) -> Self {
        Self {
            destination,
            max,
            state: Mutex::new(RouteState {
                free: Vec::new(),
                leased: 0,
                pending: 0,
                retired: false,
            }),
        }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    evicted_expired: AtomicU64,
    evicted_idle: AtomicU64,
    destroyed: AtomicU64,
}

#[derive(Clone, Copy, Debug)]
enum EvictReason {
    Expired,
    Idle,
    Shutdown,
}

impl EvictReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "keep_alive_expired",
            Self::Idle => "idle_timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

enum Checkout<T> {
    Reused(Connection<T>),
    Reserved,
    DestinationFull,
    GlobalFull,
    Retired,
}

pub(crate) struct PoolCore<T> {
    limits: PoolLimits,
    routes: RwLock<HashMap<Destination, Arc<Route<T>>>>,
    allocated: AtomicUsize,
    released: Notify,
    closed: AtomicBool,
    next_id: AtomicU64,
    counters: PoolCounters,
}

impl<T: Poolable> PoolCore<T> {
    fn new(limits: PoolLimits) -> Self {
        Self {
            limits,
            routes: RwLock::new(HashMap::new()),
            allocated: AtomicUsize::new(0),
            released: Notify::new(),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            counters: PoolCounters::default(),
        }
    }

    fn route(&self, destination: &Destination) -> Arc<Route<T>> {
        {
            let routes = read_unpoisoned(&self.routes);
            if let Some(route) = routes.get(destination) {
                return Arc::clone(route);
            }
        }
        let mut routes = write_unpoisoned(&self.routes);
        let route = routes.entry(destination.clone()).or_insert_with(|| {
            Arc::new(Route::new(
                destination.clone(),
                self.limits.max_for(destination),
            ))
        });
        Arc::clone(route)
    }

    fn routes_snapshot(&self) -> Vec<Arc<Route<T>>> {
        read_unpoisoned(&self.routes).values().cloned().collect()
    }

    fn try_reserve_global(&self) -> bool {
        let max_total = self.limits.max_total();
        self.allocated
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < max_total).then_some(current + 1)
            })
            .is_ok()
    }

    fn return_capacity(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.allocated.fetch_sub(count, Ordering::SeqCst);
        self.released.notify_waiters();
    }

    fn try_checkout(&self, route: &Route<T>, now: Instant) -> Checkout<T> {
        let mut stale = Vec::new();
        let mut expired = 0_u64;
        let checkout = {
            let mut state = lock_unpoisoned(&route.state);
            if state.retired {
                Checkout::Retired
            } else {
                loop {
                    match state.free.pop() {
                        Some(connection) if connection.is_expired(now) => {
                            expired += 1;
                            stale.push(connection);
                        }
                        Some(connection) if !connection.io.is_open() => {
                            stale.push(connection);
                        }
                        Some(mut connection) => {
                            state.leased += 1;
                            connection.last_used_at = now;
                            break Checkout::Reused(connection);
                        }
                        None if state.allocated() >= route.max => {
                            break Checkout::DestinationFull;
                        }
                        None if self.try_reserve_global() => {
                            state.pending += 1;
                            break Checkout::Reserved;
                        }
                        None => break Checkout::GlobalFull,
                    }
                }
            }
        };

        if !stale.is_empty() {
            trace!(
                destination = %route.destination,
                count = stale.len(),
                "discarding stale pooled connections"
            );
            let closed = stale.len() as u64 - expired;
            self.counters
                .evicted_expired
                .fetch_add(expired, Ordering::Relaxed);
            self.counters.destroyed.fetch_add(closed, Ordering::Relaxed);
            self.return_capacity(stale.len());
        }
        checkout
    }

    /// Frees one idle connection of another destination so `destination` can
    /// use the global capacity it occupied. Picks the least recently used one.
    fn evict_lru_idle(&self, destination: &Destination) -> bool {
        let mut candidate: Option<(Arc<Route<T>>, Instant)> = None;
        for route in self.routes_snapshot() {
            if &route.destination == destination {
                continue;
            }
            let oldest = lock_unpoisoned(&route.state)
                .free
                .first()
                .map(|connection| connection.last_used_at);
            if let Some(last_used_at) = oldest
                && candidate
                    .as_ref()
                    .is_none_or(|(_, best)| last_used_at < *best)
            {
                candidate = Some((route, last_used_at));
            }
        }

        let Some((route, _)) = candidate else {
            return false;
        };
        let evicted = {
            let mut state = lock_unpoisoned(&route.state);
            if state.free.is_empty() {
                None
            } else {
                Some(state.free.remove(0))
            }
        };
        let Some(connection) = evicted else {
            return false;
        };

        debug!(
            destination = %route.destination,
            connection_id = connection.id,
            for_destination = %destination,
            "evicting idle connection to free global capacity"
        );
        self.counters.evicted_idle.fetch_add(1, Ordering::Relaxed);
        drop(connection);
        self.allocated.fetch_sub(1, Ordering::SeqCst);
        true
    }

    fn check_in(&self, route: &Route<T>, mut connection: Connection<T>, keep_alive: Duration) {
        let now = Instant::now();
        let reusable = !keep_alive.is_zero() && connection.io.is_open();
        if reusable {
            connection.last_used_at = now;
            connection.keep_alive_deadline = now.checked_add(keep_alive);
        }

        let rejected = {
            let mut state = lock_unpoisoned(&route.state);
            state.leased = state.leased.saturating_sub(1);
            if reusable && !self.closed.load(Ordering::SeqCst) {
                trace!(
                    destination = %route.destination,
                    connection_id = connection.id,
                    keep_alive_ms = keep_alive.as_millis() as u64,
                    "connection returned to pool"
                );
                state.free.push(connection);
                None
            } else {
                Some(connection)
            }
        };

        match rejected {
            None => self.released.notify_waiters(),
            Some(connection) => {
                debug!(
                    destination = %route.destination,
                    connection_id = connection.id,
                    keep_alive_ms = keep_alive.as_millis() as u64,
                    "closing connection instead of pooling it"
                );
                self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
                drop(connection);
                self.return_capacity(1);
            }
        }
    }

    fn discard_leased(&self, route: &Route<T>) {
        {
            let mut state = lock_unpoisoned(&route.state);
            state.leased = state.leased.saturating_sub(1);
        }
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        self.return_capacity(1);
    }

    fn cancel_reservation(&self, route: &Route<T>) {
        {
            let mut state = lock_unpoisoned(&route.state);
            state.pending = state.pending.saturating_sub(1);
        }
        self.return_capacity(1);
    }

    fn evict_free<F>(&self, reason: EvictReason, should_evict: F) -> usize
    where
        F: Fn(&Connection<T>) -> bool,
    {
        let mut evicted_total = 0;
        for route in self.routes_snapshot() {
            let evicted: Vec<Connection<T>> = {
                let mut state = lock_unpoisoned(&route.state);
                if state.free.is_empty() {
                    continue;
                }
                let (evicted, kept) = std::mem::take(&mut state.free)
                    .into_iter()
                    .partition(|connection| should_evict(connection));
                state.free = kept;
                evicted
            };
            if evicted.is_empty() {
                continue;
            }
            trace!(
                destination = %route.destination,
                count = evicted.len(),
                reason = reason.as_str(),
                "evicting pooled connections"
            );
            let count = evicted.len();
            drop(evicted);
            self.allocated.fetch_sub(count, Ordering::SeqCst);
            evicted_total += count;
        }

        if evicted_total > 0 {
            let counter = match reason {
                EvictReason::Expired => &self.counters.evicted_expired,
                EvictReason::Idle => &self.counters.evicted_idle,
                EvictReason::Shutdown => &self.counters.destroyed,
            };
            counter.fetch_add(evicted_total as u64, Ordering::Relaxed);
            self.released.notify_waiters();
            debug!(
                count = evicted_total,
                reason = reason.as_str(),
                "evicted pooled connections"
            );
        }
        evicted_total
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn close_expired_at(&self, now: Instant) -> usize {
        self.evict_free(EvictReason::Expired, |connection| {
            connection.is_expired(now)
        })
    }

    pub(crate) fn close_idle_at(&self, idle: Duration, now: Instant) -> usize {
        self.evict_free(EvictReason::Idle, |connection| {
            connection.idle_for(now) > idle
        })
    }

    pub(crate) fn prune_idle_destinations(&self) -> usize {
        let mut routes = write_unpoisoned(&self.routes);
        let before = routes.len();
        routes.retain(|_, route| {
            let mut state = lock_unpoisoned(&route.state);
            if state.allocated() == 0 {
                state.retired = true;
                false
            } else {
                true
            }
        });
        before - routes.len()
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let closed = self.evict_free(EvictReason::Shutdown, |_| true);
        self.released.notify_waiters();
        debug!(closed, "connection pool shut down");
    }

    fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            max_total: self.limits.max_total(),
            created: self.counters.created.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            evicted_expired: self.counters.evicted_expired.load(Ordering::Relaxed),
            evicted_idle: self.counters.evicted_idle.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            ..PoolStats::default()
        };
        for route in self.routes_snapshot() {
            let state = lock_unpoisoned(&route.state);
            let destination_stats = DestinationStats {
                leased: state.leased,
                available: state.free.len(),
                pending: state.pending,
                max: route.max,
            };
            drop(state);
            stats.leased += destination_stats.leased;
            stats.available += destination_stats.available;
            stats.pending += destination_stats.pending;
            stats
                .destinations
                .insert(route.destination.clone(), destination_stats);
        }
        stats
    }
}

/// Capacity reserved for a connection that is still being opened. Dropping
/// it (connect failure, timeout or cancellation) hands the capacity back.
struct Reservation<T: Poolable> {
    core: Arc<PoolCore<T>>,
    route: Arc<Route<T>>,
    armed: bool,
}

impl<T: Poolable> Reservation<T> {
    fn complete(mut self, io: T) -> Lease<T> {
        let id = self.core.next_id.fetch_add(1, Ordering::Relaxed);
        let mut connection = Connection::new(id, self.route.destination.clone(), io, Instant::now());
        connection.use_count = 1;
        {
            let mut state = lock_unpoisoned(&self.route.state);
            state.pending = state.pending.saturating_sub(1);
            state.leased += 1;
        }
        self.armed = false;
        self.core.counters.created.fetch_add(1, Ordering::Relaxed);
        Lease {
            connection,
            guard: LeaseGuard {
                core: Arc::clone(&self.core),
                route: Arc::clone(&self.route),
                armed: true,
            },
            reused: false,
        }
    }
}

impl<T: Poolable> Drop for Reservation<T> {
    fn drop(&mut self) {
        if self.armed {
            self.core.cancel_reservation(&self.route);
        }
    }
}

struct LeaseGuard<T: Poolable> {
    core: Arc<PoolCore<T>>,
    route: Arc<Route<T>>,
    armed: bool,
}

impl<T: Poolable> Drop for LeaseGuard<T> {
    fn drop(&mut self) {
        if self.armed {
            debug!(
                destination = %self.route.destination,
                "lease dropped without release; connection closed"
            );
            self.core.discard_leased(&self.route);
        }
    }
}

/// Exclusive claim on one pooled connection.
///
/// Hand it back with [`Lease::release`] when the channel is reusable or
/// [`Lease::destroy`] when it is not. A lease that is simply dropped, for
/// example because the request future was cancelled, closes its connection.
pub struct Lease<T: Poolable> {
    connection: Connection<T>,
    guard: LeaseGuard<T>,
    reused: bool,
}

impl<T: Poolable> Lease<T> {
    pub fn connection(&self) -> &Connection<T> {
        &self.connection
    }

    pub fn id(&self) -> u64 {
        self.connection.id
    }

    pub fn destination(&self) -> &Destination {
        &self.connection.destination
    }

    /// Whether this connection served an earlier request.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn io(&self) -> &T {
        &self.connection.io
    }

    pub fn io_mut(&mut self) -> &mut T {
        &mut self.connection.io
    }

    pub fn release(self, keep_alive: Duration) {
        let Lease {
            connection,
            mut guard,
            ..
        } = self;
        guard.armed = false;
        guard.core.check_in(&guard.route, connection, keep_alive);
    }

    pub fn destroy(self) {
        let Lease {
            connection,
            mut guard,
            ..
        } = self;
        guard.armed = false;
        debug!(
            destination = %connection.destination,
            connection_id = connection.id,
            "destroying leased connection"
        );
        drop(connection);
        guard.core.discard_leased(&guard.route);
    }
}

impl<T: Poolable> fmt::Debug for Lease<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Lease")
            .field("connection", &self.connection)
            .field("reused", &self.reused)
            .finish()
    }
}

pub struct ConnectionPool<C: Connect> {
    core: Arc<PoolCore<C::Connection>>,
    connector: Arc<C>,
}

impl<C: Connect> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            connector: Arc::clone(&self.connector),
        }
    }
}

impl<C: Connect> ConnectionPool<C> {
    pub fn new(connector: C, limits: PoolLimits) -> Self {
        debug!(
            max_total = limits.max_total(),
            default_max_per_destination = limits.default_max_per_destination(),
            overrides = limits.overrides().len(),
            "connection pool initialized"
        );
        Self {
            core: Arc::new(PoolCore::new(limits)),
            connector: Arc::new(connector),
        }
    }

    pub fn limits(&self) -> &PoolLimits {
        &self.core.limits
    }

    pub(crate) fn core(&self) -> &Arc<PoolCore<C::Connection>> {
        &self.core
    }

    /// Leases a connection to `destination`.
    ///
    /// Reuses a free connection when one is live, opens a new one when both
    /// the destination cap and the global cap allow it, and otherwise waits
    /// for capacity until `lease_wait` elapses.
    ///
    /// # Errors
    ///
    /// [`Error::PoolExhausted`] when no capacity frees up within
    /// `lease_wait`, [`Error::Timeout`] with [`TimeoutPhase::Connect`] when
    /// opening takes longer than `connect_timeout`, [`Error::PoolClosed`]
    /// after [`ConnectionPool::shutdown`], or the connector's own error.
    pub async fn acquire(
        &self,
        destination: &Destination,
        lease_wait: Duration,
        connect_timeout: Duration,
    ) -> Result<Lease<C::Connection>, Error> {
        let deadline = tokio::time::Instant::now() + lease_wait;
        loop {
            if self.core.closed.load(Ordering::SeqCst) {
                return Err(Error::PoolClosed);
            }

            let notified = self.core.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let route = self.core.route(destination);
            match self.core.try_checkout(&route, Instant::now()) {
                Checkout::Reused(mut connection) => {
                    connection.use_count += 1;
                    self.core.counters.reused.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        destination = %destination,
                        connection_id = connection.id,
                        use_count = connection.use_count,
                        "reusing pooled connection"
                    );
                    return Ok(Lease {
                        connection,
                        guard: LeaseGuard {
                            core: Arc::clone(&self.core),
                            route,
                            armed: true,
                        },
                        reused: true,
                    });
                }
                Checkout::Reserved => {
                    let reservation = Reservation {
                        core: Arc::clone(&self.core),
                        route,
                        armed: true,
                    };
                    return self.open(reservation, connect_timeout).await;
                }
                Checkout::Retired => continue,
                Checkout::GlobalFull if self.core.evict_lru_idle(destination) => continue,
                Checkout::GlobalFull | Checkout::DestinationFull => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(
                    destination = %destination,
                    lease_wait_ms = lease_wait.as_millis() as u64,
                    "no pooled connection became available"
                );
                return Err(Error::PoolExhausted {
                    destination: destination.clone(),
                    lease_wait_ms: lease_wait.as_millis(),
                });
            }
        }
    }

    async fn open(
        &self,
        reservation: Reservation<C::Connection>,
        connect_timeout: Duration,
    ) -> Result<Lease<C::Connection>, Error> {
        let destination = reservation.route.destination.clone();
        let started = Instant::now();
        let io = match tokio::time::timeout(connect_timeout, self.connector.connect(&destination))
            .await
        {
            Ok(Ok(io)) => io,
            Ok(Err(error)) => {
                debug!(destination = %destination, error = %error, "connect failed");
                return Err(error);
            }
            Err(_) => {
                debug!(
                    destination = %destination,
                    timeout_ms = connect_timeout.as_millis() as u64,
                    "connect timed out"
                );
                return Err(Error::Timeout {
                    phase: TimeoutPhase::Connect,
                    timeout_ms: connect_timeout.as_millis(),
                    destination,
                });
            }
        };

        let lease = reservation.complete(io);
        debug!(
            destination = %destination,
            connection_id = lease.id(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "opened new connection"
        );
        Ok(lease)
    }

    pub fn release(&self, lease: Lease<C::Connection>, keep_alive: Duration) {
        lease.release(keep_alive);
    }

    pub fn destroy(&self, lease: Lease<C::Connection>) {
        lease.destroy();
    }

    /// Closes free connections whose keep-alive deadline has passed.
    pub fn close_expired(&self) -> usize {
        self.core.close_expired_at(Instant::now())
    }

    /// Closes free connections unused for longer than `idle`, whatever
    /// their keep-alive deadline says.
    pub fn close_idle_longer_than(&self, idle: Duration) -> usize {
        self.core.close_idle_at(idle, Instant::now())
    }

    /// Drops bookkeeping for destinations with no open connections.
    pub fn prune_idle_destinations(&self) -> usize {
        self.core.prune_idle_destinations()
    }

    pub fn stats(&self) -> PoolStats {
        self.core.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Closes every free connection and rejects further leases. Connections
    /// leased at this point are closed when they come back.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }
}
