//! Link state control over rtnetlink.
//!
//! Only what the data path needs: RTM_SETLINK requests toggling IFF_UP and
//! setting the MTU, correlated with their acks by sequence number.

pub mod attr;
pub mod builder;
pub mod message;
pub mod socket;
pub mod transport;
pub mod types;

pub use attr::{AttrIter, NlAttr};
pub use builder::MessageBuilder;
pub use message::{MessageIter, NLM_F_ACK, NLM_F_REQUEST, NlMsgError, NlMsgHdr, NlMsgType};
pub use socket::NetlinkSocket;
pub use transport::{
    DEFAULT_TIMEOUT, LinkControl, NetlinkTransport, Transaction, Transactions, setlink_request,
};
pub use types::IfInfoMsg;
