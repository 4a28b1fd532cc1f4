//! Multiplexed link management.
//!
//! Two backends, picked once from the negotiated kernel mode:
//!
//! - [`LinkPool::Dynamic`] (rmnet): every `setup_link` creates a link with an
//!   automatically assigned mux id and `cleanup_link` deletes it.
//! - [`LinkPool::Preallocated`] (qmi_wwan): the first `setup_link` creates a
//!   fixed number of links on one main interface; after that links are only
//!   handed out and taken back.
//!
//! Callers that arrive while the preallocated pool is being created wait in
//! arrival order and all get the outcome of that one initialization.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::device::{LinkFlags, LinkInfo, QmiDevice};
use crate::error::{Error, Result};
use crate::format::KernelDataMode;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State of a preallocated link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Acquired,
}

#[derive(Debug, Clone)]
struct Slot {
    link: LinkInfo,
    state: SlotState,
}

type InitWaiter = oneshot::Sender<std::result::Result<(), String>>;

enum Init {
    Idle,
    InProgress(VecDeque<InitWaiter>),
    Ready,
}

struct PoolState {
    main_iface: Option<String>,
    init: Init,
    slots: Vec<Slot>,
    torn_down: bool,
}

#[derive(Default)]
struct DynamicState {
    links: Vec<LinkInfo>,
    torn_down: bool,
}

/// Links created on demand.
pub struct DynamicLinks {
    state: Mutex<DynamicState>,
}

/// A fixed set of links created up front on one main interface.
pub struct PreallocatedLinks {
    size: usize,
    state: Mutex<PoolState>,
}

/// Multiplexed links of one port.
pub enum LinkPool {
    Dynamic(DynamicLinks),
    Preallocated(PreallocatedLinks),
}

impl LinkPool {
    /// Create a dynamic backend.
    pub fn dynamic() -> Self {
        Self::Dynamic(DynamicLinks {
            state: Mutex::new(DynamicState::default()),
        })
    }

    /// Create a preallocated backend of `size` links.
    pub fn preallocated(size: usize) -> Self {
        Self::Preallocated(PreallocatedLinks {
            size,
            state: Mutex::new(PoolState {
                main_iface: None,
                init: Init::Idle,
                slots: Vec::new(),
                torn_down: false,
            }),
        })
    }

    /// Backend for a negotiated kernel mode, if it multiplexes.
    pub fn for_mode(mode: KernelDataMode, pool_size: usize) -> Option<Self> {
        if mode == KernelDataMode::MUX_RMNET {
            Some(Self::dynamic())
        } else if mode == KernelDataMode::MUX_QMIWWAN {
            Some(Self::preallocated(pool_size))
        } else {
            None
        }
    }

    /// Check if this is the preallocated backend.
    pub fn is_preallocated(&self) -> bool {
        matches!(self, Self::Preallocated(_))
    }

    /// Number of links currently handed out.
    pub fn allocated(&self) -> usize {
        match self {
            Self::Dynamic(d) => lock(&d.state).links.len(),
            Self::Preallocated(p) => lock(&p.state)
                .slots
                .iter()
                .filter(|s| s.state == SlotState::Acquired)
                .count(),
        }
    }

    /// Get a link on `main_iface` for a new data session.
    pub async fn setup_link<D: QmiDevice>(
        &self,
        device: &D,
        main_iface: &str,
        ifname_prefix: &str,
        flags: LinkFlags,
        timeout: Duration,
    ) -> Result<LinkInfo> {
        match self {
            Self::Dynamic(d) => {
                if lock(&d.state).torn_down {
                    return Err(torn_down());
                }
                let link = device
                    .add_link(main_iface, ifname_prefix, flags, timeout)
                    .await?;
                {
                    let mut state = lock(&d.state);
                    if !state.torn_down {
                        debug!(link = %link.name, mux_id = link.mux_id, "created multiplexed link");
                        state.links.push(link.clone());
                        return Ok(link);
                    }
                }
                debug!(link = %link.name, "link pool torn down while creating link");
                delete_links(device, std::slice::from_ref(&link), timeout).await;
                Err(torn_down())
            }
            Self::Preallocated(p) => {
                p.ensure_initialized(device, main_iface, ifname_prefix, flags, timeout)
                    .await?;
                p.acquire(main_iface)
            }
        }
    }

    /// Give back a link obtained from [`setup_link`](Self::setup_link).
    pub async fn cleanup_link<D: QmiDevice>(
        &self,
        device: &D,
        name: &str,
        mux_id: u32,
        timeout: Duration,
    ) -> Result<()> {
        match self {
            Self::Dynamic(d) => {
                let known = lock(&d.state)
                    .links
                    .iter()
                    .any(|l| l.name == name && l.mux_id == mux_id);
                if !known {
                    debug!(link = name, mux_id, "deleting link not created by this port");
                }
                let result = device.delete_link(name, mux_id, timeout).await;
                if result.is_ok() || result.as_ref().is_err_and(Error::is_not_found) {
                    lock(&d.state)
                        .links
                        .retain(|l| !(l.name == name && l.mux_id == mux_id));
                }
                result
            }
            Self::Preallocated(p) => p.release(name, mux_id),
        }
    }

    /// Delete every link this pool created. Failures are logged.
    ///
    /// The pool is unusable afterwards: links still being created are
    /// deleted once they exist and their callers get [`Error::WrongState`].
    pub async fn teardown<D: QmiDevice>(&self, device: &D, timeout: Duration) {
        let links: Vec<LinkInfo> = match self {
            Self::Dynamic(d) => {
                let mut state = lock(&d.state);
                state.torn_down = true;
                std::mem::take(&mut state.links)
            }
            Self::Preallocated(p) => {
                let mut state = lock(&p.state);
                state.torn_down = true;
                if matches!(state.init, Init::Ready) {
                    state.init = Init::Idle;
                }
                std::mem::take(&mut state.slots)
                    .into_iter()
                    .map(|s| s.link)
                    .collect()
            }
        };

        delete_links(device, &links, timeout).await;
    }
}

fn torn_down() -> Error {
    Error::WrongState("link pool torn down".to_string())
}

async fn delete_links<D: QmiDevice>(device: &D, links: &[LinkInfo], timeout: Duration) {
    for link in links {
        if let Err(e) = device.delete_link(&link.name, link.mux_id, timeout).await {
            warn!(link = %link.name, mux_id = link.mux_id, error = %e, "couldn't delete link");
        }
    }
}

/// Resets a pool initialization that never finished, e.g. because the
/// initializing caller was dropped.
struct InitGuard<'a> {
    pool: &'a PreallocatedLinks,
    done: bool,
}

impl InitGuard<'_> {
    /// Store the created links and wake the waiters.
    ///
    /// If the pool was torn down meanwhile, the links are handed back for
    /// deletion instead.
    fn finish(mut self, created: Result<Vec<LinkInfo>>) -> (Result<()>, Vec<LinkInfo>) {
        self.done = true;
        let (outcome, orphans, waiters) = {
            let mut state = lock(&self.pool.state);
            match created {
                Ok(links) if state.torn_down => {
                    let waiters = take_waiters(&mut state, Init::Idle);
                    (Err(torn_down()), links, waiters)
                }
                Ok(links) => {
                    state.slots = links
                        .into_iter()
                        .map(|link| Slot {
                            link,
                            state: SlotState::Free,
                        })
                        .collect();
                    (Ok(()), Vec::new(), take_waiters(&mut state, Init::Ready))
                }
                Err(e) => (Err(e), Vec::new(), take_waiters(&mut state, Init::Idle)),
            }
        };

        let shared = outcome.as_ref().map(|_| ()).map_err(|e| e.to_string());
        for waiter in waiters {
            let _ = waiter.send(shared.clone());
        }
        (outcome, orphans)
    }
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        warn!("link pool initialization abandoned");
        let waiters = take_waiters(&mut lock(&self.pool.state), Init::Idle);
        for waiter in waiters {
            let _ = waiter.send(Err("initialization abandoned".to_string()));
        }
    }
}

fn take_waiters(state: &mut PoolState, next: Init) -> VecDeque<InitWaiter> {
    match std::mem::replace(&mut state.init, next) {
        Init::InProgress(waiters) => waiters,
        _ => VecDeque::new(),
    }
}

impl PreallocatedLinks {
    fn check_interface(state: &PoolState, main_iface: &str) -> Result<()> {
        match &state.main_iface {
            Some(expected) if expected != main_iface => Err(Error::WrongInterface {
                expected: expected.clone(),
                actual: main_iface.to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn ensure_initialized<D: QmiDevice>(
        &self,
        device: &D,
        main_iface: &str,
        ifname_prefix: &str,
        flags: LinkFlags,
        timeout: Duration,
    ) -> Result<()> {
        let waiter = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            if state.torn_down {
                return Err(torn_down());
            }
            Self::check_interface(state, main_iface)?;
            match state.init {
                Init::Ready => return Ok(()),
                Init::InProgress(ref mut waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push_back(tx);
                    Some(rx)
                }
                Init::Idle => {
                    state.main_iface = Some(main_iface.to_string());
                    state.init = Init::InProgress(VecDeque::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return match rx.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(message)) => Err(Error::PoolInit(message)),
                Err(_) => Err(Error::PoolInit("initialization abandoned".to_string())),
            };
        }

        let guard = InitGuard {
            pool: self,
            done: false,
        };
        let created = self
            .create_links(device, main_iface, ifname_prefix, flags, timeout)
            .await;
        let (outcome, orphans) = guard.finish(created);
        if !orphans.is_empty() {
            debug!(main = main_iface, "link pool torn down during initialization");
            delete_links(device, &orphans, timeout).await;
        }
        outcome
    }

    async fn create_links<D: QmiDevice>(
        &self,
        device: &D,
        main_iface: &str,
        ifname_prefix: &str,
        flags: LinkFlags,
        timeout: Duration,
    ) -> Result<Vec<LinkInfo>> {
        debug!(main = main_iface, size = self.size, "preallocating multiplexed links");
        let mut links = Vec::with_capacity(self.size);
        for _ in 0..self.size {
            match device.add_link(main_iface, ifname_prefix, flags, timeout).await {
                Ok(link) => links.push(link),
                Err(e) => {
                    warn!(main = main_iface, error = %e, "couldn't preallocate links");
                    delete_links(device, &links, timeout).await;
                    return Err(e);
                }
            }
        }
        Ok(links)
    }

    /// Hand out a free link.
    pub fn acquire(&self, main_iface: &str) -> Result<LinkInfo> {
        let mut state = lock(&self.state);
        Self::check_interface(&state, main_iface)?;
        let slot = state
            .slots
            .iter_mut()
            .find(|s| s.state == SlotState::Free)
            .ok_or(Error::Exhausted {
                capacity: self.size,
            })?;
        slot.state = SlotState::Acquired;
        Ok(slot.link.clone())
    }

    /// Take back an acquired link.
    pub fn release(&self, name: &str, mux_id: u32) -> Result<()> {
        let mut state = lock(&self.state);
        let slot = state
            .slots
            .iter_mut()
            .find(|s| {
                s.state == SlotState::Acquired && s.link.name == name && s.link.mux_id == mux_id
            })
            .ok_or_else(|| Error::NotFound(format!("acquired link {} (mux id {})", name, mux_id)))?;
        slot.state = SlotState::Free;
        Ok(())
    }

    /// Links in the pool with their state.
    pub fn links(&self) -> Vec<(LinkInfo, SlotState)> {
        lock(&self.state)
            .slots
            .iter()
            .map(|s| (s.link.clone(), s.state))
            .collect()
    }
}
