//! ACL link management core for an L2CAP host.
//!
//! This crate owns the lifecycle and outbound packet scheduling of ACL
//! links between the local host and remote controllers, on both the
//! Classic (BR/EDR) and Low Energy transports. It sits between an HCI
//! that reports connection, disconnection and flow-control events, and an
//! upper channel layer that produces per-channel data.
//!
//! The core is synchronous and single threaded by construction: every
//! entry point runs to completion on the caller's thread, and state only
//! advances through event callbacks and timer expirations. Collaborators
//! (the channel state machine, HCI data paths, security manager, power
//! manager, persistent statistics and the timer facility) are injected as
//! one [`LinkEvents`] implementation.
#![no_std]
#![warn(missing_docs)]

use core::mem::MaybeUninit;

mod fmt;

pub mod config;
pub mod events;
pub mod types;

mod channel_manager;
mod link_manager;
mod packet_pool;
mod pdu;
mod scheduler;

#[cfg(test)]
pub(crate) mod mock;

pub use channel_manager::{ChannelIndex, ChannelStorage};
pub use events::LinkEvents;
pub use link_manager::{LinkIndex, LinkManager, LinkStorage};
pub use packet_pool::{DefaultPacket, DefaultPacketPool};
pub use pdu::{Pdu, ACL_HEADER_LEN};

/// Convenience include of the most commonly used types.
pub mod prelude {
    pub use bt_hci::param::{BdAddr, ConnHandle, LeConnRole as Role, Status};

    pub use super::events::LinkEvents;
    pub use super::types::*;
    pub use super::{
        new, ChannelIndex, Error, LinkIndex, LinkManager, LinkResources, Packet, PacketPool, Pdu,
    };
    pub use crate::packet_pool::DefaultPacketPool;
}

/// Errors returned by the link core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A fixed-size pool is exhausted.
    NoResources,
    /// No record matches the given identifier.
    NotFound,
    /// The channel id is not valid.
    InvalidChannelId,
    /// The operation does not apply in the current state.
    InvalidState,
    /// A queue is full.
    OutOfMemory,
    /// The channel has been closed.
    ChannelClosed,
    /// The link is not connected.
    Disconnected,
}

/// A packet is a byte buffer with a fixed capacity.
pub trait Packet: Sized + AsRef<[u8]> + AsMut<[u8]> {}

/// A packet pool that can allocate packets of the desired size.
pub trait PacketPool: 'static {
    /// Packet type provided by this pool.
    type Packet: Packet;

    /// The maximum size a packet can have.
    const MTU: usize;

    /// Allocate a new buffer with space for `MTU` bytes. Returns `None`
    /// when the allocation cannot be fulfilled.
    fn allocate() -> Option<Self::Packet>;

    /// Capacity of this pool in number of packets.
    fn capacity() -> usize;
}

/// Storage for the link and channel pools.
///
/// The pools are caller-sized through the const parameters and borrowed by
/// the [`LinkManager`] for its lifetime.
pub struct LinkResources<P: PacketPool, const LINKS: usize, const CHANNELS: usize> {
    links: MaybeUninit<[LinkStorage<P::Packet>; LINKS]>,
    channels: MaybeUninit<[ChannelStorage<P::Packet>; CHANNELS]>,
}

impl<P: PacketPool, const LINKS: usize, const CHANNELS: usize> Default for LinkResources<P, LINKS, CHANNELS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PacketPool, const LINKS: usize, const CHANNELS: usize> LinkResources<P, LINKS, CHANNELS> {
    /// Create a new instance of the resources.
    pub const fn new() -> Self {
        Self {
            links: MaybeUninit::uninit(),
            channels: MaybeUninit::uninit(),
        }
    }
}

/// Create a new link manager over the provided resources and collaborator
/// callbacks.
pub fn new<'resources, P: PacketPool, const LINKS: usize, const CHANNELS: usize>(
    resources: &'resources mut LinkResources<P, LINKS, CHANNELS>,
    hooks: &'resources dyn LinkEvents<P>,
) -> LinkManager<'resources, P> {
    let links = &mut resources.links.write([const { LinkStorage::new() }; LINKS])[..];
    let channels = &mut resources.channels.write([const { ChannelStorage::new() }; CHANNELS])[..];
    LinkManager::new(links, channels, hooks)
}
