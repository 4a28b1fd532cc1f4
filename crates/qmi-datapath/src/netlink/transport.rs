//! Correlated link-state requests over a shared routing socket.
//!
//! Every request gets a fresh sequence number and a pending entry in a
//! [`Transactions`] table. Whichever waiter happens to read the socket
//! dispatches the acks it finds to their owners, so several requests (from
//! several ports) can be in flight on the one socket at the same time and
//! complete in any order.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use qmi_datapath::netlink::{LinkControl, NetlinkTransport};
//!
//! let netlink = NetlinkTransport::shared();
//! netlink.set_link(ifindex, false, Some(16384), Duration::from_secs(5)).await?;
//! ```

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::builder::MessageBuilder;
use super::message::{MessageIter, NLM_F_ACK, NLM_F_REQUEST, NlMsgError, NlMsgType};
use super::socket::NetlinkSocket;
use super::types::{IfInfoMsg, IflaAttr, iff};
use crate::error::{Error, Result};

/// Default time to wait for a link request ack.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Kernel link control used by the data-path code.
///
/// Implemented by [`NetlinkTransport`]; tests substitute a recorder.
pub trait LinkControl {
    /// Bring an interface up or down, optionally changing its MTU in the
    /// same request.
    fn set_link(
        &self,
        ifindex: u32,
        up: bool,
        mtu: Option<u32>,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>>;
}

impl<T: LinkControl + ?Sized> LinkControl for Arc<T> {
    fn set_link(
        &self,
        ifindex: u32,
        up: bool,
        mtu: Option<u32>,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> {
        (**self).set_link(ifindex, up, mtu, timeout)
    }
}

struct Pending {
    last_seq: u32,
    waiters: HashMap<u32, oneshot::Sender<Result<()>>>,
}

/// Table of requests waiting for their ack, keyed by sequence number.
pub struct Transactions {
    inner: Mutex<Pending>,
}

impl Default for Transactions {
    fn default() -> Self {
        Self::new()
    }
}

impl Transactions {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Pending {
                last_seq: 0,
                waiters: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new transaction under the next free sequence number.
    pub fn begin(&self) -> Transaction<'_> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        let seq = loop {
            inner.last_seq = inner.last_seq.wrapping_add(1);
            if inner.last_seq != 0 && !inner.waiters.contains_key(&inner.last_seq) {
                break inner.last_seq;
            }
        };
        inner.waiters.insert(seq, tx);
        Transaction {
            table: self,
            seq,
            rx,
        }
    }

    /// Number of transactions still waiting for an answer.
    pub fn pending(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Complete the transaction with the given sequence number.
    ///
    /// Returns `false` if no such transaction is pending.
    fn complete(&self, seq: u32, result: Result<()>) -> bool {
        let Some(tx) = self.lock().waiters.remove(&seq) else {
            return false;
        };
        // The waiter may already be gone; the entry is removed either way.
        let _ = tx.send(result);
        true
    }

    fn forget(&self, seq: u32) -> bool {
        self.lock().waiters.remove(&seq).is_some()
    }

    /// Dispatch the acks found in a received datagram.
    ///
    /// Unknown sequence numbers belong to someone else and are skipped;
    /// malformed trailing data is dropped. Returns how many transactions
    /// were completed.
    pub fn dispatch(&self, datagram: &[u8]) -> usize {
        let mut completed = 0;
        for msg in MessageIter::new(datagram) {
            let Ok((header, payload)) = msg else {
                trace!(len = datagram.len(), "dropping malformed netlink datagram");
                break;
            };
            if !header.is_error() {
                continue;
            }
            let Ok(err) = NlMsgError::from_bytes(payload) else {
                continue;
            };
            let result = if err.is_ack() {
                Ok(())
            } else {
                Err(Error::from_errno(err.error))
            };
            if self.complete(header.nlmsg_seq, result) {
                completed += 1;
            } else {
                trace!(seq = header.nlmsg_seq, "ack for unknown netlink transaction");
            }
        }
        completed
    }
}

/// A request waiting for its ack.
///
/// Dropping it (for instance when the caller abandons the operation)
/// removes the pending entry so a late ack is ignored.
pub struct Transaction<'a> {
    table: &'a Transactions,
    seq: u32,
    rx: oneshot::Receiver<Result<()>>,
}

impl Transaction<'_> {
    /// Sequence number assigned to this transaction.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Wait for the ack while `pump` reads and dispatches incoming
    /// datagrams. Completes exactly once: with the ack, or with
    /// [`Error::Timeout`] once `timeout` elapses.
    pub async fn wait<F>(mut self, pump: F, timeout: Duration) -> Result<()>
    where
        F: Future<Output = Infallible>,
    {
        let seq = self.seq;
        let table = self.table;
        tokio::select! {
            biased;
            answer = &mut self.rx => {
                answer.unwrap_or_else(|_| Err(Error::InvalidMessage(format!(
                    "netlink transaction {} dropped",
                    seq
                ))))
            }
            never = pump => match never {},
            _ = tokio::time::sleep(timeout) => {
                table.forget(seq);
                Err(Error::timeout(format!("netlink transaction {}", seq), timeout))
            }
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.table.forget(self.seq);
    }
}

/// Build an RTM_SETLINK request toggling IFF_UP and optionally setting the MTU.
pub fn setlink_request(ifindex: u32, up: bool, mtu: Option<u32>, seq: u32, pid: u32) -> Vec<u8> {
    let mut ifinfo = IfInfoMsg::new().with_index(ifindex as i32);
    ifinfo.ifi_flags = if up { iff::UP } else { 0 };
    ifinfo.ifi_change = iff::UP;

    let mut builder = MessageBuilder::new(NlMsgType::RTM_SETLINK, NLM_F_REQUEST | NLM_F_ACK);
    builder.append(&ifinfo);
    if let Some(mtu) = mtu {
        builder.append_attr_u32(IflaAttr::Mtu as u16, mtu);
    }
    builder.set_seq(seq);
    builder.set_pid(pid);
    builder.finish()
}

/// Link control over a NETLINK_ROUTE socket.
pub struct NetlinkTransport {
    socket: std::result::Result<NetlinkSocket, String>,
    transactions: Transactions,
    closed: AtomicBool,
}

impl NetlinkTransport {
    /// Open the routing socket.
    ///
    /// Never fails: if the socket cannot be set up the transport stays
    /// permanently unavailable and every request fails with
    /// [`Error::Unavailable`]. Must be called from within a tokio runtime.
    pub fn new() -> Self {
        match NetlinkSocket::new() {
            Ok(socket) => Self::with_socket(Ok(socket)),
            Err(e) => {
                warn!(error = %e, "couldn't setup netlink socket");
                Self::with_socket(Err(e.to_string()))
            }
        }
    }

    /// Create a transport that rejects every request.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::with_socket(Err(reason.into()))
    }

    fn with_socket(socket: std::result::Result<NetlinkSocket, String>) -> Self {
        Self {
            socket,
            transactions: Transactions::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Process-wide transport, created on first use.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<NetlinkTransport>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(Self::new())).clone()
    }

    /// Check if the socket was set up.
    pub fn is_available(&self) -> bool {
        self.socket.is_ok()
    }

    /// Number of requests waiting for an ack.
    pub fn pending(&self) -> usize {
        self.transactions.pending()
    }

    /// Read the socket forever, handing acks to their transactions.
    ///
    /// After a socket error no further datagrams are processed; waiting
    /// transactions then run into their timeout.
    async fn pump(&self, socket: &NetlinkSocket) -> Infallible {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return std::future::pending().await;
            }
            match socket.recv_from().await {
                Ok((data, 0)) => {
                    self.transactions.dispatch(&data);
                }
                Ok((_, pid)) => debug!(pid, "ignoring non-kernel netlink message"),
                Err(e) => {
                    warn!(error = %e, "netlink socket failed, no longer reading");
                    self.closed.store(true, Ordering::Release);
                }
            }
        }
    }
}

impl LinkControl for NetlinkTransport {
    async fn set_link(
        &self,
        ifindex: u32,
        up: bool,
        mtu: Option<u32>,
        timeout: Duration,
    ) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .map_err(|reason| Error::Unavailable(reason.clone()))?;
        let operation = match mtu {
            Some(mtu) => format!(
                "setting link {} {} with mtu {}",
                ifindex,
                if up { "up" } else { "down" },
                mtu
            ),
            None => format!("setting link {} {}", ifindex, if up { "up" } else { "down" }),
        };

        let transaction = self.transactions.begin();
        let msg = setlink_request(ifindex, up, mtu, transaction.seq(), socket.pid());
        debug!(seq = transaction.seq(), ifindex, up, ?mtu, "sending netlink setlink");
        socket.send(&msg).await?;

        transaction
            .wait(self.pump(socket), timeout)
            .await
            .map_err(|e| e.with_context(operation))
    }
}
