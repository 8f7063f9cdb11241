//! Bounded cache of live authenticated sessions for one credential tuple.
//!
//! Sessions are expensive to open (TCP + TLS + AUTH), so released ones are
//! buffered and handed back out until they expire. The pool accounts for
//! every session it ever created: at all times `opened` equals the number
//! of idle-buffered sessions plus the number held by callers, and never
//! exceeds `max_cap`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender, TryRecvError, TrySendError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::error::Error;
use crate::session::{Session, SessionFactory};

pub mod manager;

/// Upper bound on one wait for a released session when the pool is at
/// capacity. Expiry loops back around rather than failing the acquire.
const ACQUIRE_WAIT: Duration = Duration::from_secs(2);

/// Floor for the reaper cycle so a zero idle-timeout cannot busy-loop.
const REAP_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// First pause after a failed warm-up dial; doubles up to the ceiling.
const WARM_BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const WARM_BACKOFF_CEILING: Duration = Duration::from_secs(5);

/// Consecutive warm-up failures tolerated before the task gives up and
/// leaves the remaining sessions to on-demand creation.
const WARM_MAX_FAILURES: u32 = 8;

/// A released session together with the instant it last finished work.
struct Idle {
    session: Box<dyn Session>,
    last_used: Instant,
}

impl Idle {
    fn new(session: Box<dyn Session>) -> Self {
        Idle {
            session,
            last_used: Instant::now(),
        }
    }
}

/// Cheap handle to one pool; clones share the same sessions. The manager
/// hands these out, and the background tasks hold one each.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn SessionFactory>,
    idle_tx: Sender<Idle>,
    idle_rx: Receiver<Idle>,
    /// Sessions the pool is accountable for: idle-buffered + caller-held.
    opened: AtomicU32,
    running: AtomicBool,
    /// Serializes the "may I open another session?" decision. Never held
    /// across a dial.
    create_lock: Mutex<()>,
    /// Stops the warming and reaper tasks once the pool closes.
    shutdown: CancellationToken,
}

impl Pool {
    pub(crate) fn new(config: PoolConfig, factory: Arc<dyn SessionFactory>) -> Pool {
        let (idle_tx, idle_rx) = async_channel::bounded(config.max_idle.max(1) as usize);
        Pool {
            inner: Arc::new(PoolInner {
                config,
                factory,
                idle_tx,
                idle_rx,
                opened: AtomicU32::new(0),
                running: AtomicBool::new(false),
                create_lock: Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Warms the pool and starts its background tasks. Called exactly once,
    /// before any acquire. The first session is created synchronously so a
    /// dead credential tuple fails fast; the rest fill in behind an
    /// asynchronous warming task.
    pub(crate) async fn init(&self) -> Result<(), Error> {
        self.inner.running.store(true, Ordering::SeqCst);
        if self.inner.config.initial_cap > 0 {
            let session = self.inner.factory.create().await?;
            self.inner.opened.fetch_add(1, Ordering::SeqCst);
            self.stash(Idle::new(session)).await;
            self.spawn_warmer();
        }
        self.spawn_reaper();
        Ok(())
    }

    /// Number of live sessions the pool currently accounts for.
    pub fn opened(&self) -> u32 {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Hands out an idle session, or opens a fresh one when the pool is
    /// below capacity. At capacity, waits in bounded slices for a release
    /// and loops until one arrives. Never returns an expired session.
    pub async fn acquire(&self) -> Result<Box<dyn Session>, Error> {
        loop {
            if !self.is_running() {
                return Err(Error::PoolClosed);
            }

            match self.inner.idle_rx.try_recv() {
                Ok(idle) => match self.admit(idle).await {
                    Some(session) => return Ok(session),
                    None => continue,
                },
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Closed) => return Err(Error::PoolClosed),
            }

            // Racy fast-path read; authoritative only under `create_lock`.
            if self.opened() >= self.inner.config.max_cap {
                match tokio::time::timeout(ACQUIRE_WAIT, self.inner.idle_rx.recv()).await {
                    Ok(Ok(idle)) => match self.admit(idle).await {
                        Some(session) => return Ok(session),
                        None => {}
                    },
                    Ok(Err(_)) => return Err(Error::PoolClosed),
                    Err(_) => {
                        debug!(
                            wait = ?ACQUIRE_WAIT,
                            "no session released within the wait window, retrying"
                        );
                    }
                }
                continue;
            }

            if !self.try_reserve(self.inner.config.max_cap).await {
                continue;
            }

            match self.inner.factory.create().await {
                Ok(session) => return Ok(session),
                Err(err) => {
                    self.inner.opened.fetch_sub(1, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
    }

    /// Returns a session to the idle buffer with a refreshed timestamp.
    /// Once the pool has closed, the session is closed instead.
    pub async fn release(&self, session: Box<dyn Session>) {
        if !self.is_running() {
            let _ = self.discard(session).await;
            return;
        }
        self.stash(Idle::new(session)).await;
    }

    /// Closes a session's transport and gives up its accounting slot. Used
    /// when a send fails or the session has expired.
    pub async fn discard(&self, session: Box<dyn Session>) -> Result<(), Error> {
        self.inner.opened.fetch_sub(1, Ordering::SeqCst);
        session.close().await
    }

    /// Transitions the pool to closed: stops the background tasks, drains
    /// the idle buffer and closes everything in it. Sessions still held by
    /// callers are closed as they come back through [`Pool::release`].
    /// Calling this again is a no-op.
    pub async fn close(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.idle_tx.close();
        while let Ok(idle) = self.inner.idle_rx.try_recv() {
            let _ = self.discard(idle.session).await;
        }
    }

    /// Freshness and liveness gate for a dequeued idle session.
    async fn admit(&self, mut idle: Idle) -> Option<Box<dyn Session>> {
        if self.is_stale(&idle) {
            let _ = self.discard(idle.session).await;
            return None;
        }
        if let Some(ping) = &self.inner.config.ping {
            if !ping(idle.session.as_any()) {
                let _ = self.discard(idle.session).await;
                return None;
            }
        }
        Some(idle.session)
    }

    // The boundary counts as expired so a zero timeout always redials.
    fn is_stale(&self, idle: &Idle) -> bool {
        idle.last_used.elapsed() >= self.inner.config.idle_timeout
    }

    /// Reserves one accounting slot below `limit`. The caller owns the slot
    /// and must decrement `opened` if its dial fails.
    async fn try_reserve(&self, limit: u32) -> bool {
        let _guard = self.inner.create_lock.lock().await;
        if self.inner.opened.load(Ordering::SeqCst) >= limit {
            return false;
        }
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Enqueues an idle session, closing it instead when the buffer is
    /// gone (pool closed) or unexpectedly full.
    async fn stash(&self, idle: Idle) {
        if let Err(err) = self.inner.idle_tx.try_send(idle) {
            let idle = match err {
                TrySendError::Full(idle) | TrySendError::Closed(idle) => idle,
            };
            let _ = self.discard(idle.session).await;
        }
    }

    /// Keeps opening sessions until the pool holds `initial_cap`, backing
    /// off on errors so a dead server is not hammered.
    fn spawn_warmer(&self) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut delay = WARM_BACKOFF_INITIAL;
            let mut failures = 0u32;
            loop {
                if pool.inner.shutdown.is_cancelled() {
                    break;
                }
                if !pool.try_reserve(pool.inner.config.initial_cap).await {
                    break;
                }
                match pool.inner.factory.create().await {
                    Ok(session) => {
                        pool.stash(Idle::new(session)).await;
                        failures = 0;
                        delay = WARM_BACKOFF_INITIAL;
                    }
                    Err(err) => {
                        pool.inner.opened.fetch_sub(1, Ordering::SeqCst);
                        failures += 1;
                        warn!(error = %err, failures, "warm-up dial failed");
                        if failures >= WARM_MAX_FAILURES {
                            warn!("giving up on warm-up, sessions will be created on demand");
                            break;
                        }
                        tokio::select! {
                            _ = pool.inner.shutdown.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        delay = (delay * 2).min(WARM_BACKOFF_CEILING);
                    }
                }
            }
        });
    }

    fn spawn_reaper(&self) {
        let pool = self.clone();
        let cycle = (self.inner.config.idle_timeout * 2).max(REAP_MIN_INTERVAL);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pool.inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(cycle) => pool.reap().await,
                }
            }
        });
    }

    /// One pass over the idle buffer: expired sessions are closed, fresh
    /// ones re-enqueued with their original timestamp. The pass is
    /// probabilistic under concurrent traffic; acquire re-checks freshness
    /// anyway, so a missed session costs a dial, not correctness.
    async fn reap(&self) {
        let passes = self.opened();
        for _ in 0..passes {
            match self.inner.idle_rx.try_recv() {
                Ok(idle) => {
                    if self.is_stale(&idle) {
                        let _ = self.discard(idle.session).await;
                    } else {
                        self.stash(idle).await;
                    }
                }
                Err(_) => break,
            }
        }
    }
}
