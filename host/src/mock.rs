//! Test doubles: an unbounded packet source and a recording collaborator.

extern crate std;

use core::cell::{Cell, RefCell};
use std::boxed::Box;
use std::vec::Vec;

use bt_hci::param::{BdAddr, ConnHandle, LeConnRole, Status};
use embassy_time::Duration;

use crate::events::LinkEvents;
use crate::link_manager::LinkIndex;
use crate::pdu::Pdu;
use crate::types::{
    AclPriority, ChannelEvent, DisconnectStat, PowerMode, SecurityStatus, Transport,
};
use crate::{ChannelStorage, LinkManager, LinkStorage, Packet, PacketPool};

pub struct TestPacket(pub [u8; 64]);

impl AsRef<[u8]> for TestPacket {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsMut<[u8]> for TestPacket {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl Packet for TestPacket {}

pub struct TestPool;

impl PacketPool for TestPool {
    type Packet = TestPacket;

    const MTU: usize = 64;

    fn allocate() -> Option<TestPacket> {
        Some(TestPacket([0; 64]))
    }

    fn capacity() -> usize {
        64
    }
}

pub fn addr(n: u8) -> BdAddr {
    BdAddr::new([n, 0x22, 0x33, 0x44, 0x55, 0x66])
}

/// A link-queue buffer with a recognizable payload marker at the first
/// byte after the ACL header.
pub fn raw_pkt(marker: u8, len: usize) -> Pdu<TestPacket> {
    let mut packet = TestPacket([0; 64]);
    packet.0[4] = marker;
    Pdu::new(packet, len)
}

/// Like [`raw_pkt`], but with a stamped ACL header, the way a partially
/// transmitted segment comes back from the HCI layer.
pub fn stamped_pkt(handle: ConnHandle, marker: u8, len: usize) -> Pdu<TestPacket> {
    let mut pdu = raw_pkt(marker, len);
    let raw = (handle.raw() & 0x0fff) | (0b10 << 12);
    pdu.as_mut()[0..2].copy_from_slice(&raw.to_le_bytes());
    pdu
}

pub fn payload_marker(payload: &[u8]) -> u8 {
    payload[4]
}

type Reenter = (&'static LinkManager<'static, TestPool>, LinkIndex);

/// Records every collaborator callback, with canned results for the ones
/// that return something.
pub struct Recorder {
    pub channel_events: RefCell<Vec<(u16, ChannelEvent)>>,
    pub classic_tx: RefCell<Vec<(BdAddr, Vec<u8>)>>,
    pub le_tx: RefCell<Vec<(BdAddr, Vec<u8>)>>,
    pub acl_disconnects: RefCell<Vec<ConnHandle>>,
    pub classic_connects: RefCell<Vec<BdAddr>>,
    pub le_connects: RefCell<Vec<BdAddr>>,
    pub le_connect_result: Cell<bool>,
    pub acl_created: RefCell<Vec<(BdAddr, ConnHandle, Transport)>>,
    pub acl_removed: RefCell<Vec<ConnHandle>>,
    pub sco_removed: RefCell<Vec<BdAddr>>,
    pub topology_decrements: Cell<usize>,
    pub security_disconnects: RefCell<Vec<ConnHandle>>,
    pub security_disconnect_result: Cell<SecurityStatus>,
    pub power_mode: Cell<Option<PowerMode>>,
    pub priority_updates: RefCell<Vec<(BdAddr, AclPriority, bool)>>,
    pub disconnect_stats: RefCell<Vec<(BdAddr, DisconnectStat)>>,
    pub fixed_closed: RefCell<Vec<(u16, Status)>>,
    pub tx_completes: RefCell<Vec<(u16, u16)>>,
    pub congestion: RefCell<Vec<(u16, bool)>>,
    pub link_timers: RefCell<Vec<(u8, Duration)>>,
    pub link_timer_cancels: RefCell<Vec<u8>>,
    pub info_timers: RefCell<Vec<(u8, Duration)>>,
    pub info_timer_cancels: RefCell<Vec<u8>>,
    pub channel_timers: RefCell<Vec<(u16, Duration)>>,
    /// One-shot: re-enter the scheduler from the next uncongested
    /// callback, submitting a buffer on the given link.
    pub reenter_with: Cell<Option<Reenter>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            channel_events: RefCell::new(Vec::new()),
            classic_tx: RefCell::new(Vec::new()),
            le_tx: RefCell::new(Vec::new()),
            acl_disconnects: RefCell::new(Vec::new()),
            classic_connects: RefCell::new(Vec::new()),
            le_connects: RefCell::new(Vec::new()),
            le_connect_result: Cell::new(true),
            acl_created: RefCell::new(Vec::new()),
            acl_removed: RefCell::new(Vec::new()),
            sco_removed: RefCell::new(Vec::new()),
            topology_decrements: Cell::new(0),
            security_disconnects: RefCell::new(Vec::new()),
            security_disconnect_result: Cell::new(SecurityStatus::CmdStarted),
            power_mode: Cell::new(None),
            priority_updates: RefCell::new(Vec::new()),
            disconnect_stats: RefCell::new(Vec::new()),
            fixed_closed: RefCell::new(Vec::new()),
            tx_completes: RefCell::new(Vec::new()),
            congestion: RefCell::new(Vec::new()),
            link_timers: RefCell::new(Vec::new()),
            link_timer_cancels: RefCell::new(Vec::new()),
            info_timers: RefCell::new(Vec::new()),
            info_timer_cancels: RefCell::new(Vec::new()),
            channel_timers: RefCell::new(Vec::new()),
            reenter_with: Cell::new(None),
        }
    }

    pub fn classic_tx_markers(&self) -> Vec<u8> {
        self.classic_tx.borrow().iter().map(|(_, p)| payload_marker(p)).collect()
    }

    pub fn classic_tx_peers(&self) -> Vec<BdAddr> {
        self.classic_tx.borrow().iter().map(|(peer, _)| *peer).collect()
    }
}

impl LinkEvents<TestPool> for Recorder {
    fn channel_event(&self, cid: u16, event: ChannelEvent) {
        self.channel_events.borrow_mut().push((cid, event));
    }

    fn send_acl_br_edr(&self, peer: BdAddr, pdu: Pdu<TestPacket>) {
        self.classic_tx.borrow_mut().push((peer, pdu.as_ref().to_vec()));
    }

    fn send_acl_le(&self, peer: BdAddr, pdu: Pdu<TestPacket>) {
        self.le_tx.borrow_mut().push((peer, pdu.as_ref().to_vec()));
    }

    fn disconnect_acl(&self, handle: ConnHandle, _reason: Status, _context: &str) {
        self.acl_disconnects.borrow_mut().push(handle);
    }

    fn create_classic_connection(&self, peer: BdAddr) {
        self.classic_connects.borrow_mut().push(peer);
    }

    fn create_le_connection(&self, peer: BdAddr) -> bool {
        self.le_connects.borrow_mut().push(peer);
        self.le_connect_result.get()
    }

    fn acl_created(&self, peer: BdAddr, handle: ConnHandle, _role: LeConnRole, transport: Transport) {
        self.acl_created.borrow_mut().push((peer, handle, transport));
    }

    fn acl_removed(&self, handle: ConnHandle) {
        self.acl_removed.borrow_mut().push(handle);
    }

    fn sco_acl_removed(&self, peer: BdAddr) {
        self.sco_removed.borrow_mut().push(peer);
    }

    fn ble_decrement_link_topology_mask(&self, _role: LeConnRole) {
        self.topology_decrements.set(self.topology_decrements.get() + 1);
    }

    fn security_disconnect(&self, handle: ConnHandle, _reason: Status, _context: &str) -> SecurityStatus {
        self.security_disconnects.borrow_mut().push(handle);
        self.security_disconnect_result.get()
    }

    fn read_power_mode(&self, _peer: BdAddr) -> Option<PowerMode> {
        self.power_mode.get()
    }

    fn set_acl_priority(&self, peer: BdAddr, priority: AclPriority, reset: bool) {
        self.priority_updates.borrow_mut().push((peer, priority, reset));
    }

    fn record_disconnect_stat(&self, peer: BdAddr, stat: DisconnectStat) {
        self.disconnect_stats.borrow_mut().push((peer, stat));
    }

    fn fixed_channel_closed(&self, cid: u16, _peer: BdAddr, reason: Status, _transport: Transport) {
        self.fixed_closed.borrow_mut().push((cid, reason));
    }

    fn tx_complete(&self, cid: u16, count: u16) {
        self.tx_completes.borrow_mut().push((cid, count));
    }

    fn congestion_status(&self, cid: u16, congested: bool) {
        self.congestion.borrow_mut().push((cid, congested));
        if !congested {
            if let Some((mgr, link)) = self.reenter_with.take() {
                mgr.check_send_packets(Some(link), 0, Some(raw_pkt(0x77, 8)));
            }
        }
    }

    fn arm_link_timer(&self, link: LinkIndex, timeout: Duration) {
        self.link_timers.borrow_mut().push((link.raw(), timeout));
    }

    fn cancel_link_timer(&self, link: LinkIndex) {
        self.link_timer_cancels.borrow_mut().push(link.raw());
    }

    fn arm_info_resp_timer(&self, link: LinkIndex, timeout: Duration) {
        self.info_timers.borrow_mut().push((link.raw(), timeout));
    }

    fn cancel_info_resp_timer(&self, link: LinkIndex) {
        self.info_timer_cancels.borrow_mut().push(link.raw());
    }

    fn arm_channel_timer(&self, cid: u16, timeout: Duration) {
        self.channel_timers.borrow_mut().push((cid, timeout));
    }
}

/// Leak a manager over fresh pools, the way the long-lived host owns its
/// resources.
pub fn harness<const LINKS: usize, const CHANNELS: usize>(
) -> (&'static LinkManager<'static, TestPool>, &'static Recorder) {
    let hooks: &'static Recorder = Box::leak(Box::new(Recorder::new()));
    let links = Box::leak(Box::new([const { LinkStorage::<TestPacket>::new() }; LINKS]));
    let channels = Box::leak(Box::new([const { ChannelStorage::<TestPacket>::new() }; CHANNELS]));
    let mgr = Box::leak(Box::new(LinkManager::<TestPool>::new(
        &mut links[..],
        &mut channels[..],
        hooks,
    )));
    (mgr, hooks)
}
