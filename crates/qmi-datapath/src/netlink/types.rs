//! Link-level rtnetlink structures.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Interface info message (mirrors struct ifinfomsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IfInfoMsg {
    /// Address family (AF_UNSPEC for link requests).
    pub ifi_family: u8,
    pub __ifi_pad: u8,
    /// Device type (ARPHRD_*).
    pub ifi_type: u16,
    /// Interface index.
    pub ifi_index: i32,
    /// Device flags (IFF_*).
    pub ifi_flags: u32,
    /// Mask of flags to change.
    pub ifi_change: u32,
}

impl IfInfoMsg {
    /// Size of the structure on the wire.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Create an empty message for AF_UNSPEC.
    pub fn new() -> Self {
        Self {
            ifi_family: libc::AF_UNSPEC as u8,
            ..Default::default()
        }
    }

    /// Set the interface index.
    pub fn with_index(mut self, index: i32) -> Self {
        self.ifi_index = index;
        self
    }
}

/// Interface flags.
pub mod iff {
    pub const UP: u32 = libc::IFF_UP as u32;
}

/// Link attributes (IFLA_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum IflaAttr {
    Ifname = 3,
    Mtu = 4,
}
