use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{descriptor::SshTarget, error::GatewayError, filesystem::RemoteFilesystem, key::ConnectionKey};

/// Dials a new SFTP session for a resolved target.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: RemoteFilesystem + 'static;

    async fn connect(&self, target: &SshTarget<'_>) -> Result<Self::Session, GatewayError>;
}

struct PooledSession<S> {
    session: Arc<S>,
    created_at: Instant,
}

/// One per key. The mutex serializes lookup and dial for that key alone.
struct Slot<S> {
    pooled: Mutex<Option<PooledSession<S>>>,
    last_used: AtomicU64,
}

impl<S> Slot<S> {
    fn new() -> Slot<S> {
        Slot {
            pooled: Mutex::new(None),
            last_used: AtomicU64::new(0),
        }
    }
}

/// Keyed pool of live sessions, shared by every request the gateway serves.
pub struct SessionPool<C: Connector> {
    connector: C,
    slots: DashMap<ConnectionKey, Arc<Slot<C::Session>>>,
    max_sessions: Option<usize>,
    live: AtomicUsize,
    clock: AtomicU64,
    dials: AtomicU64,
}

impl<C: Connector> SessionPool<C> {
    pub fn new(connector: C, max_sessions: Option<usize>) -> SessionPool<C> {
        SessionPool {
            connector,
            slots: DashMap::new(),
            max_sessions,
            live: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            dials: AtomicU64::new(0),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Number of sessions currently pooled.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total dials performed over the pool's lifetime.
    pub fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::SeqCst)
    }

    /// Returns the live session for `key`, dialing one if there is none or the
    /// pooled one is dead. Concurrent callers with the same key share one dial.
    pub async fn acquire(&self, key: ConnectionKey, target: &SshTarget<'_>) -> Result<Arc<C::Session>, GatewayError> {
        loop {
            let slot = self.slot(key);
            let mut pooled = slot.pooled.lock().await;
            // evicted or forgotten while we waited for the lock
            if !self.holds(&key, &slot) {
                continue;
            }
            slot.last_used.store(self.tick(), Ordering::SeqCst);

            if let Some(existing) = pooled.as_ref() {
                if existing.session.is_alive() {
                    debug!(key = ?key, age = ?existing.created_at.elapsed(), "reusing pooled session");
                    return Ok(existing.session.clone());
                }
            }
            if let Some(dead) = pooled.take() {
                self.live.fetch_sub(1, Ordering::SeqCst);
                warn!(key = ?key, host = %target.host, "pooled session is dead, redialing");
                dead.session.close().await;
            }

            self.dials.fetch_add(1, Ordering::SeqCst);
            info!(key = ?key, host = %target.host, port = target.port, user = %target.username, auth = ?target.auth, "dialing");
            let session = match self.connector.connect(target).await {
                Ok(session) => Arc::new(session),
                Err(err) => {
                    drop(pooled);
                    self.forget_if_idle(key, &slot);
                    return Err(err);
                }
            };
            *pooled = Some(PooledSession {
                session: session.clone(),
                created_at: Instant::now(),
            });
            self.live.fetch_add(1, Ordering::SeqCst);
            drop(pooled);

            self.enforce_limit(key).await;
            return Ok(session);
        }
    }

    /// Closes and forgets the session pooled under `key`, if any. Other keys are untouched.
    pub async fn invalidate(&self, key: ConnectionKey) -> bool {
        let Some(slot) = self.existing_slot(&key) else {
            return false;
        };
        let taken = slot.pooled.lock().await.take();
        self.forget_if_idle(key, &slot);
        match taken {
            Some(pooled) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                info!(key = ?key, "invalidated pooled session");
                pooled.session.close().await;
                true
            }
            None => false,
        }
    }

    /// Like [`SessionPool::invalidate`], but only when the pool still holds `session`.
    /// A failure observed on an old session never evicts its replacement.
    pub async fn invalidate_if_matches(&self, key: ConnectionKey, session: &Arc<C::Session>) -> bool {
        let Some(slot) = self.existing_slot(&key) else {
            return false;
        };
        let mut pooled = slot.pooled.lock().await;
        let matches = pooled
            .as_ref()
            .is_some_and(|existing| Arc::ptr_eq(&existing.session, session));
        if !matches {
            return false;
        }
        let taken = pooled.take();
        drop(pooled);
        self.forget_if_idle(key, &slot);
        self.live.fetch_sub(1, Ordering::SeqCst);
        warn!(key = ?key, "invalidated session after transport failure");
        if let Some(pooled) = taken {
            pooled.session.close().await;
        }
        true
    }

    pub async fn close_all(&self) {
        let slots: Vec<(ConnectionKey, Arc<Slot<C::Session>>)> = self
            .slots
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        self.slots.clear();
        for (key, slot) in slots {
            if let Some(pooled) = slot.pooled.lock().await.take() {
                self.live.fetch_sub(1, Ordering::SeqCst);
                debug!(key = ?key, "closing pooled session");
                pooled.session.close().await;
            }
        }
    }

    /// Number of keys the pool currently tracks, pooled or mid-dial.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, key: ConnectionKey) -> Arc<Slot<C::Session>> {
        self.slots.entry(key).or_insert_with(|| Arc::new(Slot::new())).clone()
    }

    fn existing_slot(&self, key: &ConnectionKey) -> Option<Arc<Slot<C::Session>>> {
        self.slots.get(key).map(|entry| entry.value().clone())
    }

    fn holds(&self, key: &ConnectionKey, slot: &Arc<Slot<C::Session>>) -> bool {
        self.slots
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), slot))
    }

    /// Drops an empty slot from the map unless another caller is about to use it.
    /// The map and the caller's handle account for the two expected references.
    fn forget_if_idle(&self, key: ConnectionKey, slot: &Arc<Slot<C::Session>>) {
        let removed = self.slots.remove_if(&key, |_, current| {
            Arc::ptr_eq(current, slot)
                && Arc::strong_count(current) == 2
                && current.pooled.try_lock().is_ok_and(|pooled| pooled.is_none())
        });
        if removed.is_some() {
            debug!(key = ?key, "forgot idle slot");
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn enforce_limit(&self, keep: ConnectionKey) {
        let Some(max) = self.max_sessions else {
            return;
        };
        if self.len() <= max {
            return;
        }
        for (victim_key, victim) in self.eviction_candidates(keep) {
            if self.len() <= max {
                break;
            }
            let evicted = {
                // mid-dial or mid-lookup: in use right now, try the next one
                let Ok(mut pooled) = victim.pooled.try_lock() else {
                    continue;
                };
                let Some(evicted) = pooled.take() else {
                    continue;
                };
                // waiters on this slot see it gone once the guard drops and retry
                self.slots.remove_if(&victim_key, |_, slot| Arc::ptr_eq(slot, &victim));
                evicted
            };
            self.live.fetch_sub(1, Ordering::SeqCst);
            info!(key = ?victim_key, "evicted least recently used session");
            // still held by an in-flight request: its last holder drops the connection
            if Arc::strong_count(&evicted.session) == 1 {
                evicted.session.close().await;
            }
        }
    }

    /// Every other key's slot, least recently used first.
    fn eviction_candidates(&self, keep: ConnectionKey) -> Vec<(ConnectionKey, Arc<Slot<C::Session>>)> {
        let mut candidates: Vec<_> = self
            .slots
            .iter()
            .filter(|entry| *entry.key() != keep)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        candidates.sort_by_key(|(_, slot)| slot.last_used.load(Ordering::SeqCst));
        candidates
    }
}
