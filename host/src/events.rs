//! Collaborator contracts of the link core.
//!
//! Everything the core asks of the rest of the stack goes through
//! [`LinkEvents`]: channel state machine events going up, HCI data and
//! control going down, plus security, power management, persistent
//! statistics and the timer facility. One implementation of this trait is
//! handed to [`LinkManager::new`](crate::LinkManager::new) and kept for
//! the manager's lifetime.
//!
//! The core never calls these methods while holding its internal state
//! borrow, so an implementation is free to call back into the manager.

use bt_hci::param::{BdAddr, ConnHandle, LeConnRole, Status};
use embassy_time::Duration;

use crate::link_manager::LinkIndex;
use crate::pdu::Pdu;
use crate::types::{AclPriority, ChannelEvent, DisconnectStat, PowerMode, SecurityStatus, Transport};
use crate::PacketPool;

/// Callbacks invoked by the link core.
pub trait LinkEvents<P: PacketPool> {
    /// Deliver an event to the channel state machine owning `cid`.
    fn channel_event(&self, cid: u16, event: ChannelEvent);

    /// Hand a prepared ACL buffer to the BR/EDR data path.
    fn send_acl_br_edr(&self, peer: BdAddr, pdu: Pdu<P::Packet>);

    /// Hand a prepared ACL buffer to the LE data path.
    fn send_acl_le(&self, peer: BdAddr, pdu: Pdu<P::Packet>);

    /// Request an HCI disconnect of `handle`.
    fn disconnect_acl(&self, handle: ConnHandle, reason: Status, context: &str);

    /// Start an outgoing BR/EDR connection to `peer`.
    fn create_classic_connection(&self, peer: BdAddr);

    /// Start an outgoing LE connection to `peer`. Returns `false` when the
    /// connection cannot be initiated (e.g. the LE topology is full).
    fn create_le_connection(&self, peer: BdAddr) -> bool;

    /// An ACL link reached the connected state.
    fn acl_created(&self, peer: BdAddr, handle: ConnHandle, role: LeConnRole, transport: Transport);

    /// The ACL bookkeeping for `handle` should be dropped.
    fn acl_removed(&self, handle: ConnHandle);

    /// Drop any SCO links riding on the ACL to `peer`.
    fn sco_acl_removed(&self, peer: BdAddr);

    /// An LE link with the given role went away.
    fn ble_decrement_link_topology_mask(&self, role: LeConnRole);

    /// Ask the security manager to disconnect `handle` once outstanding
    /// security work allows it.
    fn security_disconnect(&self, handle: ConnHandle, reason: Status, context: &str) -> SecurityStatus;

    /// Read the current power mode of the link to `peer`. `None` when the
    /// peer is unknown to the power manager.
    fn read_power_mode(&self, peer: BdAddr) -> Option<PowerMode>;

    /// Apply the ACL priority of the link to `peer` at the controller.
    fn set_acl_priority(&self, peer: BdAddr, priority: AclPriority, reset: bool);

    /// Bump a persisted per-peer disconnect counter.
    fn record_disconnect_stat(&self, peer: BdAddr, stat: DisconnectStat);

    /// A fixed channel was torn down together with its link.
    fn fixed_channel_closed(&self, cid: u16, peer: BdAddr, reason: Status, transport: Transport);

    /// `count` SDUs finished transmission on `cid`.
    fn tx_complete(&self, cid: u16, count: u16);

    /// The congestion state of `cid` changed.
    fn congestion_status(&self, cid: u16, congested: bool);

    /// Arm the single-shot link timer; a previously armed deadline is
    /// replaced. Expiry re-enters the core through
    /// [`LinkManager::link_timeout`](crate::LinkManager::link_timeout).
    fn arm_link_timer(&self, link: LinkIndex, timeout: Duration);

    /// Cancel the link timer.
    fn cancel_link_timer(&self, link: LinkIndex);

    /// Arm the single-shot information-response timer. Expiry re-enters
    /// the core through
    /// [`LinkManager::info_resp_timeout`](crate::LinkManager::info_resp_timeout).
    fn arm_info_resp_timer(&self, link: LinkIndex, timeout: Duration);

    /// Cancel the information-response timer.
    fn cancel_info_resp_timer(&self, link: LinkIndex);

    /// Arm the single-shot timer of the channel owning `cid`. Expiry is
    /// handled by the channel state machine.
    fn arm_channel_timer(&self, cid: u16, timeout: Duration);
}
