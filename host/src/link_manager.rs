//! Link control block table and the per-link state machine.
//!
//! A link is an ACL connection between this host and a remote controller.
//! One [`LinkStorage`] record exists per (peer, transport) pair while the
//! link is in use; records are stable slots in a caller-provided pool.

use core::cell::RefCell;

use bt_hci::param::{BdAddr, ConnHandle, LeConnRole, Status};
use heapless::{Deque, Vec};

use crate::channel_manager::{detach_channel, ChannelIndex, ChannelStorage, ServeQueue};
use crate::config;
use crate::events::LinkEvents;
use crate::pdu::Pdu;
use crate::types::{
    AclPriority, ChannelEvent, ChannelState, DisconnectStat, LinkState, SecurityAction, SecurityStatus, SecurityToken,
    Transport,
};
use crate::{Error, PacketPool};

/// Stable identifier of a link pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkIndex(pub(crate) u8);

impl LinkIndex {
    /// Raw slot number, for diagnostics.
    pub fn raw(&self) -> u8 {
        self.0
    }
}

/// A buffer parked on the link transmit queue, tagged with the channel it
/// came from so channel teardown can reclaim it.
pub(crate) struct Outbound<P> {
    pub(crate) cid: u16,
    pub(crate) pdu: Pdu<P>,
}

/// Per-link record (the link control block).
pub struct LinkStorage<P> {
    pub(crate) in_use: bool,
    pub(crate) transport: Transport,
    pub(crate) peer: Option<BdAddr>,
    pub(crate) handle: Option<ConnHandle>,
    pub(crate) state: LinkState,
    pub(crate) role: LeConnRole,
    pub(crate) acl_priority: AclPriority,
    pub(crate) disconnect_reason: Option<Status>,
    pub(crate) is_bonding: bool,
    pub(crate) link_xmit_quota: u16,
    pub(crate) sent_not_acked: u16,
    pub(crate) xmit_queue: Deque<Outbound<P>, { config::LINK_TX_QUEUE_SIZE }>,
    pub(crate) channels: Vec<ChannelIndex, { config::CHANNELS_PER_LINK }>,
    pub(crate) fixed: [Option<ChannelIndex>; config::NUM_FIXED_CHANNELS],
    pub(crate) pending: Option<ChannelIndex>,
    pub(crate) rr_pri: usize,
    pub(crate) rr_serv: [ServeQueue; config::NUM_CHNL_PRIORITY],
    pub(crate) w4_info_rsp: bool,
    pub(crate) sec_act: SecurityAction,
}

impl<P> LinkStorage<P> {
    /// An unused link record.
    pub const fn new() -> Self {
        Self {
            in_use: false,
            transport: Transport::BrEdr,
            peer: None,
            handle: None,
            state: LinkState::Disconnected,
            role: LeConnRole::Central,
            acl_priority: AclPriority::Normal,
            disconnect_reason: None,
            is_bonding: false,
            link_xmit_quota: 0,
            sent_not_acked: 0,
            xmit_queue: Deque::new(),
            channels: Vec::new(),
            fixed: [None; config::NUM_FIXED_CHANNELS],
            pending: None,
            rr_pri: 0,
            rr_serv: [const { ServeQueue::new() }; config::NUM_CHNL_PRIORITY],
            w4_info_rsp: false,
            sec_act: SecurityAction::None,
        }
    }

    pub(crate) fn peer(&self) -> BdAddr {
        unwrap!(self.peer)
    }

    fn reset(&mut self) {
        self.in_use = false;
        self.transport = Transport::BrEdr;
        self.peer = None;
        self.handle = None;
        self.state = LinkState::Disconnected;
        self.role = LeConnRole::Central;
        self.acl_priority = AclPriority::Normal;
        self.disconnect_reason = None;
        self.is_bonding = false;
        self.link_xmit_quota = 0;
        self.sent_not_acked = 0;
        self.xmit_queue.clear();
        self.channels.clear();
        self.fixed = [None; config::NUM_FIXED_CHANNELS];
        self.pending = None;
        self.rr_pri = 0;
        for (pri, group) in self.rr_serv.iter_mut().enumerate() {
            group.reset(config::priority_quota(pri));
        }
        self.w4_info_rsp = false;
        self.sec_act = SecurityAction::None;
    }
}

impl<P> Default for LinkStorage<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> core::fmt::Debug for LinkStorage<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LinkStorage")
            .field("state", &self.state)
            .field("transport", &self.transport)
            .field("handle", &self.handle)
            .field("quota", &self.link_xmit_quota)
            .field("sent_not_acked", &self.sent_not_acked)
            .finish()
    }
}

pub(crate) struct State<'d, P> {
    pub(crate) links: &'d mut [LinkStorage<P>],
    pub(crate) channels: &'d mut [ChannelStorage<P>],
    pub(crate) num_acl_bufs: u16,
    pub(crate) num_ble_bufs: u16,
    pub(crate) xmit_window: u16,
    pub(crate) le_xmit_window: u16,
    pub(crate) round_robin_quota: u16,
    pub(crate) round_robin_unacked: u16,
    pub(crate) ble_round_robin_quota: u16,
    pub(crate) ble_round_robin_unacked: u16,
    pub(crate) check_round_robin: bool,
    pub(crate) ble_check_round_robin: bool,
    pub(crate) cong_cback_depth: u8,
}

impl<P> State<'_, P> {
    pub(crate) fn find_by_peer(&self, peer: BdAddr, transport: Transport) -> Option<usize> {
        self.links
            .iter()
            .position(|l| l.in_use && l.transport == transport && l.peer == Some(peer))
    }

    pub(crate) fn find_by_handle(&self, handle: ConnHandle) -> Option<usize> {
        self.links.iter().position(|l| l.in_use && l.handle == Some(handle))
    }

    pub(crate) fn find_by_state(&self, state: LinkState) -> Option<usize> {
        self.links.iter().position(|l| l.in_use && l.state == state)
    }

    fn alloc_link(&mut self, peer: BdAddr, is_bonding: bool, transport: Transport) -> Option<usize> {
        for (idx, lk) in self.links.iter_mut().enumerate() {
            if !lk.in_use {
                lk.reset();
                lk.in_use = true;
                lk.peer = Some(peer);
                lk.transport = transport;
                lk.is_bonding = is_bonding;
                debug!("[link][idx = {}] allocated", idx);
                return Some(idx);
            }
        }
        None
    }

    fn print(&self, verbose: bool) {
        for (idx, lk) in self.links.iter().enumerate() {
            if verbose || lk.in_use {
                debug!("[link][idx = {}] state = {:?}", idx, lk);
            }
        }
    }
}

/// The ACL link manager.
///
/// Owns the link and channel pools and drives the link state machine, the
/// transmit scheduler and the controller credit accounting. All entry
/// points run to completion on the caller's thread.
pub struct LinkManager<'d, P: PacketPool> {
    pub(crate) state: RefCell<State<'d, P::Packet>>,
    pub(crate) hooks: &'d dyn LinkEvents<P>,
}

impl<'d, P: PacketPool> LinkManager<'d, P> {
    /// Create a link manager over the given storage pools.
    pub fn new(
        links: &'d mut [LinkStorage<P::Packet>],
        channels: &'d mut [ChannelStorage<P::Packet>],
        hooks: &'d dyn LinkEvents<P>,
    ) -> Self {
        Self {
            state: RefCell::new(State {
                links,
                channels,
                num_acl_bufs: 0,
                num_ble_bufs: config::BLE_BUF_SHARED,
                xmit_window: 0,
                le_xmit_window: 0,
                round_robin_quota: 0,
                round_robin_unacked: 0,
                ble_round_robin_quota: 0,
                ble_round_robin_unacked: 0,
                check_round_robin: false,
                ble_check_round_robin: false,
                cong_cback_depth: 0,
            }),
            hooks,
        }
    }

    pub(crate) fn with_state<F: FnOnce(&mut State<'d, P::Packet>) -> R, R>(&self, f: F) -> R {
        let mut state = self.state.borrow_mut();
        f(&mut state)
    }

    /// Record the controller's ACL buffer counts and reset both transmit
    /// windows. `le` equal to [`config::BLE_BUF_SHARED`] means the
    /// controller shares one buffer pool between both transports.
    pub fn set_controller_buffers(&self, classic: u16, le: u16) {
        self.with_state(|s| {
            s.num_acl_bufs = classic;
            s.xmit_window = classic;
            s.num_ble_bufs = le;
            s.le_xmit_window = if le == config::BLE_BUF_SHARED { 0 } else { le };
        });
        self.adjust_allocation();
    }

    /// Look up the link for a peer on a transport.
    pub fn find_link(&self, peer: BdAddr, transport: Transport) -> Option<LinkIndex> {
        self.with_state(|s| s.find_by_peer(peer, transport)).map(|i| LinkIndex(i as u8))
    }

    /// Current state of a link.
    pub fn link_state(&self, link: LinkIndex) -> LinkState {
        self.with_state(|s| {
            let lk = &s.links[link.0 as usize];
            if lk.in_use {
                lk.state
            } else {
                LinkState::Disconnected
            }
        })
    }

    /// Controller handle bound to a link, if any.
    pub fn link_handle(&self, link: LinkIndex) -> Option<ConnHandle> {
        self.with_state(|s| s.links[link.0 as usize].handle)
    }

    /// Log the state of every link slot.
    pub fn log_status(&self, verbose: bool) {
        let state = self.state.borrow();
        state.print(verbose);
    }

    pub(crate) fn allocate_link(
        &self,
        peer: BdAddr,
        is_bonding: bool,
        transport: Transport,
    ) -> Result<LinkIndex, Error> {
        let idx = self
            .with_state(|s| s.alloc_link(peer, is_bonding, transport))
            .ok_or(Error::NoResources)?;
        self.adjust_allocation();
        Ok(LinkIndex(idx as u8))
    }

    /// Release a link: tear down timers, free queued buffers, detach any
    /// remaining channels (fixed ones notify their owner) and mark the
    /// slot free.
    pub(crate) fn release_link(&self, idx: usize) {
        let link = LinkIndex(idx as u8);
        self.hooks.cancel_link_timer(link);
        self.hooks.cancel_info_resp_timer(link);
        self.release_fixed_channels(idx, false);
        self.with_state(|s| {
            let State { links, channels, .. } = s;
            let lk = &mut links[idx];
            while let Some(ci) = lk.channels.pop() {
                channels[ci.0 as usize].reset();
            }
            lk.reset();
        });
        self.adjust_allocation();
    }

    /// Deliver `event` to every channel on the link, except `skip`.
    /// The snapshot is taken up front so the receivers may detach
    /// channels while the fan-out is in progress.
    pub(crate) fn fan_out(&self, idx: usize, event: ChannelEvent, skip: Option<ChannelIndex>) {
        let cids: Vec<u16, { config::CHANNELS_PER_LINK }> = self.with_state(|s| {
            s.links[idx]
                .channels
                .iter()
                .filter(|&&c| Some(c) != skip)
                .map(|&c| s.channels[c.0 as usize].cid)
                .collect()
        });
        for cid in cids {
            self.hooks.channel_event(cid, event);
        }
    }

    /// Release every fixed channel on the link (optionally keeping the
    /// pending one) and notify their owners with the recorded disconnect
    /// reason.
    pub(crate) fn release_fixed_channels(&self, idx: usize, keep_pending: bool) {
        let mut closed: Vec<(u16, BdAddr, Status, Transport), { config::NUM_FIXED_CHANNELS }> = Vec::new();
        self.with_state(|s| {
            let State { links, channels, .. } = s;
            let lk = &mut links[idx];
            for slot in 0..config::NUM_FIXED_CHANNELS {
                let Some(ci) = lk.fixed[slot] else { continue };
                if keep_pending && lk.pending == Some(ci) {
                    continue;
                }
                detach_channel(lk, channels, ci);
                channels[ci.0 as usize].reset();
                let reason = lk.disconnect_reason.unwrap_or(Status::UNSPECIFIED);
                let _ = closed.push((config::FIRST_FIXED_CID + slot as u16, lk.peer(), reason, lk.transport));
            }
        });
        for (cid, peer, reason, transport) in closed {
            self.hooks.fixed_channel_closed(cid, peer, reason, transport);
        }
    }

    /// Handle an HCI connection-complete event on the BR/EDR transport.
    pub fn connect_complete(&self, status: Status, handle: ConnHandle, peer: BdAddr) {
        let idx = match self.with_state(|s| s.find_by_peer(peer, Transport::BrEdr)) {
            Some(idx) => idx,
            None => match self.allocate_link(peer, false, Transport::BrEdr) {
                Ok(link) => {
                    self.with_state(|s| s.links[link.0 as usize].state = LinkState::Connecting);
                    link.0 as usize
                }
                Err(_) => {
                    warn!("[link] failed to allocate a link block");
                    return;
                }
            },
        };
        let link = LinkIndex(idx as u8);

        let (state, stored_handle) = self.with_state(|s| (s.links[idx].state, s.links[idx].handle));
        if state == LinkState::Connected && status == Status::CONN_ALREADY_EXISTS {
            warn!("[link] connection already exists, handle = {:?}", handle);
            return;
        } else if state != LinkState::Connecting {
            error!(
                "[link] unexpected connection complete, state = {:?} status = {:?}",
                state, status
            );
            if status != Status::SUCCESS {
                if let Some(h) = stored_handle {
                    self.disconnect_complete(h, status);
                }
            }
            return;
        }

        self.with_state(|s| s.links[idx].handle = Some(handle));

        if status == Status::SUCCESS {
            let (role, bonding) = self.with_state(|s| {
                let lk = &mut s.links[idx];
                lk.state = LinkState::Connected;
                (lk.role, lk.is_bonding)
            });
            self.hooks.acl_created(peer, handle, role, Transport::BrEdr);

            if bonding {
                debug!("[link] dedicated bonding link, handle = {:?}", handle);
                self.hooks.arm_link_timer(link, config::LINK_BONDING_TIMEOUT);
                return;
            }

            self.hooks.cancel_link_timer(link);
            self.fan_out(idx, ChannelEvent::ConnectConfirm, None);
            if self.with_state(|s| s.links[idx].channels.is_empty()) {
                self.hooks.arm_link_timer(link, config::LINK_STARTUP_TIMEOUT);
            }
        } else if status == Status::CONN_LIMIT_EXCEEDED
            && self.with_state(|s| s.find_by_state(LinkState::Disconnecting).is_some())
        {
            warn!("[link] controller at max connections, holding");
            self.with_state(|s| {
                let lk = &mut s.links[idx];
                lk.state = LinkState::ConnectHolding;
                lk.handle = None;
            });
        } else {
            // Set the state first, in case the upper layer retries from
            // inside the callback.
            self.with_state(|s| {
                let lk = &mut s.links[idx];
                lk.state = LinkState::Disconnecting;
                lk.disconnect_reason = Some(status);
            });
            self.fan_out(idx, ChannelEvent::ConnectConfirmNeg(status), None);
            info!("[link] connect failed, handle = {:?} status = {:?}", handle, status);

            if self.with_state(|s| s.links[idx].channels.is_empty()) {
                self.release_link(idx);
            } else if status == Status::CONN_ALREADY_EXISTS {
                // Collision: wait for the controller driven retry.
                self.with_state(|s| s.links[idx].state = LinkState::Connecting);
            } else {
                self.start_classic_connect(idx);
            }
        }
    }

    /// Handle an LE connection-complete: bind the handle, record the role
    /// and bring the link up.
    pub fn le_connect_complete(&self, handle: ConnHandle, peer: BdAddr, role: LeConnRole) {
        let idx = match self.with_state(|s| s.find_by_peer(peer, Transport::Le)) {
            Some(idx) => idx,
            None => match self.allocate_link(peer, false, Transport::Le) {
                Ok(link) => link.0 as usize,
                Err(_) => {
                    warn!("[link] failed to allocate an LE link block");
                    return;
                }
            },
        };
        let link = LinkIndex(idx as u8);
        self.with_state(|s| {
            let lk = &mut s.links[idx];
            lk.handle = Some(handle);
            lk.role = role;
            lk.state = LinkState::Connected;
        });
        self.hooks.acl_created(peer, handle, role, Transport::Le);
        self.hooks.cancel_link_timer(link);
        self.fan_out(idx, ChannelEvent::ConnectConfirm, None);
        if self.with_state(|s| s.links[idx].channels.is_empty()) {
            self.hooks.arm_link_timer(link, config::LINK_STARTUP_TIMEOUT);
        }
    }

    /// Handle an HCI disconnection-complete event. Returns whether the
    /// handle was known.
    pub fn disconnect_complete(&self, handle: ConnHandle, reason: Status) -> bool {
        let Some(idx) = self.with_state(|s| s.find_by_handle(handle)) else {
            return false;
        };

        let (peer, transport, role) = self.with_state(|s| {
            let lk = &mut s.links[idx];
            lk.disconnect_reason = Some(reason);
            // Set the state first, in case the upper layer retries from
            // inside the callback.
            lk.state = LinkState::Disconnecting;
            (lk.peer(), lk.transport, lk.role)
        });

        self.hooks.record_disconnect_stat(peer, DisconnectStat::Total);
        if reason == Status::CONN_TIMEOUT {
            self.hooks.record_disconnect_stat(peer, DisconnectStat::ConnTimeout);
        }

        if transport == Transport::Le {
            self.hooks.ble_decrement_link_topology_mask(role);
        }

        // The pending channel survives the disconnect; it is retried once
        // the link is reopened.
        let pending = self.with_state(|s| s.links[idx].pending);
        self.fan_out(idx, ChannelEvent::DisconnectInd(Some(reason)), pending);

        if transport == Transport::BrEdr {
            self.hooks.sco_acl_removed(peer);
        }

        let mut lcb_is_free = true;
        let has_work = self.with_state(|s| !s.links[idx].channels.is_empty() || s.links[idx].pending.is_some());
        if has_work {
            debug!("[link] restarting pending request after disconnect");
            self.with_state(|s| s.links[idx].xmit_queue.clear());
            if transport == Transport::Le {
                // Always drop and re-open the LE link so the remote
                // features are re-read.
                self.hooks.acl_removed(handle);
                if self.start_le_connect(idx) {
                    lcb_is_free = false;
                }
            } else {
                self.release_fixed_channels(idx, true);
                self.hooks.acl_removed(handle);
                self.with_state(|s| s.links[idx].handle = None);
                self.start_classic_connect(idx);
                lcb_is_free = false;
            }
        }

        self.with_state(|s| s.links[idx].pending = None);

        if lcb_is_free {
            self.release_link(idx);
            // A slot freed up; promote a held connection attempt.
            if let Some(held) = self.with_state(|s| s.find_by_state(LinkState::ConnectHolding)) {
                self.start_classic_connect(held);
            }
        }
        true
    }

    /// Handle a security-manager completion callback for `peer`. `token`
    /// identifies the channel that registered the request.
    pub fn security_complete(&self, peer: BdAddr, transport: Transport, token: SecurityToken, status: SecurityStatus) {
        let status = if status == SecurityStatus::SuccessNoSecurity {
            SecurityStatus::Success
        } else {
            status
        };
        debug!("[link] security complete status = {:?}", status);

        let Some(idx) = self.with_state(|s| s.find_by_peer(peer, transport)) else {
            warn!("[link] security complete for unknown peer");
            return;
        };

        let matched: Vec<u16, { config::CHANNELS_PER_LINK }> = self.with_state(|s| {
            s.links[idx]
                .channels
                .iter()
                .filter(|&&c| s.channels[c.0 as usize].sec_token == Some(token))
                .map(|&c| s.channels[c.0 as usize].cid)
                .collect()
        });
        for cid in matched {
            match status {
                SecurityStatus::Success => self.hooks.channel_event(cid, ChannelEvent::SecComp),
                SecurityStatus::DelayCheck => {
                    // Encryption change not received before the connect
                    // request; give it a little longer.
                    self.hooks.arm_channel_timer(cid, config::DELAY_CHECK_SM4_TIMEOUT);
                    return;
                }
                _ => self.hooks.channel_event(cid, ChannelEvent::SecCompNeg),
            }
        }
    }

    /// Handle the expiry of a link timer.
    pub fn link_timeout(&self, link: LinkIndex) {
        let idx = link.0 as usize;
        let (state, bonding) = self.with_state(|s| (s.links[idx].state, s.links[idx].is_bonding));
        debug!("[link] timeout in state {:?}, bonding = {}", state, bonding);

        match state {
            LinkState::Connecting
            | LinkState::ConnectingWaitSwitch
            | LinkState::ConnectHolding
            | LinkState::Disconnecting => {
                self.with_state(|s| s.links[idx].pending = None);
                self.fan_out(idx, ChannelEvent::DisconnectInd(None), None);
                self.release_link(idx);
            }
            LinkState::Connected => {
                if self.with_state(|s| s.links[idx].channels.is_empty()) {
                    let handle = unwrap!(self.with_state(|s| s.links[idx].handle));
                    let rc = self.hooks.security_disconnect(
                        handle,
                        Status::REMOTE_USER_TERMINATED_CONN,
                        "l2link::link_timeout all channels closed",
                    );
                    match rc {
                        SecurityStatus::CmdStored | SecurityStatus::Busy => {
                            // The security manager finishes the disconnect.
                        }
                        SecurityStatus::CmdStarted => {
                            self.with_state(|s| s.links[idx].state = LinkState::Disconnecting);
                            self.hooks.arm_link_timer(link, config::LINK_DISCONNECT_TIMEOUT);
                        }
                        SecurityStatus::Success => {
                            self.release_fixed_channels(idx, false);
                            self.with_state(|s| s.links[idx].state = LinkState::Disconnecting);
                        }
                        _ if bonding => {
                            self.hooks.disconnect_acl(
                                handle,
                                Status::REMOTE_USER_TERMINATED_CONN,
                                "l2link::link_timeout timer expired while bonding",
                            );
                            self.release_fixed_channels(idx, false);
                            self.with_state(|s| s.links[idx].state = LinkState::Disconnecting);
                            self.hooks.arm_link_timer(link, config::LINK_DISCONNECT_TIMEOUT);
                        }
                        _ => {
                            // Probably no buffer to send the disconnect.
                            self.hooks.arm_link_timer(link, config::RETRY_1S_TIMEOUT);
                        }
                    }
                } else {
                    // We may have been flow controlled.
                    self.check_send_packets(Some(link), 0, None);
                }
            }
            LinkState::Disconnected => {}
        }
    }

    /// Handle the expiry of the information-response timer.
    pub fn info_resp_timeout(&self, link: LinkIndex) {
        let idx = link.0 as usize;
        if !self.with_state(|s| s.links[idx].w4_info_rsp) {
            return;
        }
        // While a channel still waits on the security manager, keep
        // waiting for the peer as well.
        let still_waiting = self.with_state(|s| {
            s.links[idx].channels.iter().any(|&c| {
                matches!(
                    s.channels[c.0 as usize].state,
                    ChannelState::OrigWaitSecComp | ChannelState::TermWaitSecComp
                )
            })
        });
        if still_waiting {
            self.hooks.arm_info_resp_timer(link, config::WAIT_INFO_RSP_TIMEOUT);
            return;
        }

        self.with_state(|s| s.links[idx].w4_info_rsp = false);
        let link_up = self.with_state(|s| {
            s.links[idx].in_use && !matches!(s.links[idx].state, LinkState::Disconnected | LinkState::Disconnecting)
        });
        if link_up {
            // Proceed in basic mode.
            self.fan_out(idx, ChannelEvent::InfoResponse(Status::SUCCESS), None);
        }
    }

    /// Handle an HCI role-change event. A `None` peer (command-status
    /// path) only scans for links parked on a pending switch.
    pub fn role_changed(&self, peer: Option<BdAddr>, new_role: LeConnRole, hci_status: Status) {
        if let Some(peer) = peer {
            if let Some(idx) = self.with_state(|s| s.find_by_peer(peer, Transport::BrEdr)) {
                let priority = self.with_state(|s| {
                    let lk = &mut s.links[idx];
                    lk.role = new_role;
                    lk.acl_priority
                });
                if hci_status == Status::SUCCESS {
                    self.hooks.set_acl_priority(peer, priority, true);
                }
            }
        }

        // Resume any connection attempt parked on the switch.
        let n = self.with_state(|s| s.links.len());
        for idx in 0..n {
            let parked = self.with_state(|s| {
                s.links[idx].in_use && s.links[idx].state == LinkState::ConnectingWaitSwitch
            });
            if parked {
                self.create_conn_after_switch(idx);
            }
        }
    }

    /// Handle a pin-code request: with no channels active yet, extend the
    /// first connection timer to cover the user interaction.
    pub fn pin_code_request(&self, peer: BdAddr) {
        if let Some(idx) = self.with_state(|s| s.find_by_peer(peer, Transport::BrEdr)) {
            if self.with_state(|s| s.links[idx].channels.is_empty()) {
                self.hooks.arm_link_timer(LinkIndex(idx as u8), config::LINK_CONNECT_EXT_TIMEOUT);
            }
        }
    }

    /// Bring up a BR/EDR link on behalf of the security manager.
    pub fn connect_for_security(&self, peer: BdAddr) -> Result<SecurityStatus, Error> {
        if let Some(idx) = self.with_state(|s| s.find_by_peer(peer, Transport::BrEdr)) {
            let state = self.with_state(|s| s.links[idx].state);
            if state == LinkState::Connected || state == LinkState::Connecting {
                warn!("[link] connection already exists");
                return Ok(SecurityStatus::CmdStarted);
            }
            self.start_classic_connect(idx);
            return Ok(SecurityStatus::Success);
        }
        let link = self.allocate_link(peer, true, Transport::BrEdr)?;
        self.start_classic_connect(link.0 as usize);
        Ok(SecurityStatus::Success)
    }

    /// Record the security intent for an LE link. The link must exist.
    pub fn update_sec_act(&self, peer: BdAddr, sec_act: SecurityAction) -> Result<(), Error> {
        let idx = self
            .with_state(|s| s.find_by_peer(peer, Transport::Le))
            .ok_or(Error::NotFound)?;
        self.with_state(|s| s.links[idx].sec_act = sec_act);
        Ok(())
    }

    /// Mark the link as waiting for the peer's information response and
    /// arm the response timer.
    pub fn await_info_response(&self, link: LinkIndex) {
        self.with_state(|s| s.links[link.0 as usize].w4_info_rsp = true);
        self.hooks.arm_info_resp_timer(link, config::WAIT_INFO_RSP_TIMEOUT);
    }

    /// The peer's information response arrived before the timeout.
    pub fn info_response_received(&self, link: LinkIndex) {
        self.with_state(|s| s.links[link.0 as usize].w4_info_rsp = false);
        self.hooks.cancel_info_resp_timer(link);
    }

    /// Change the scheduling priority of a link and re-divide the
    /// controller buffers.
    pub fn set_link_priority(&self, link: LinkIndex, priority: AclPriority) {
        let peer = self.with_state(|s| {
            let lk = &mut s.links[link.0 as usize];
            lk.acl_priority = priority;
            lk.peer()
        });
        self.hooks.set_acl_priority(peer, priority, false);
        self.adjust_allocation();
    }

    /// Start (or park) an outgoing BR/EDR connection for the link. When
    /// another BR/EDR link is up, the attempt waits for a role switch
    /// first.
    pub(crate) fn start_classic_connect(&self, idx: usize) {
        let (peer, wait_switch) = self.with_state(|s| {
            let wait = s.links.iter().enumerate().any(|(i, l)| {
                i != idx && l.in_use && l.transport == Transport::BrEdr && l.state == LinkState::Connected
            });
            let lk = &mut s.links[idx];
            lk.state = if wait {
                LinkState::ConnectingWaitSwitch
            } else {
                LinkState::Connecting
            };
            (lk.peer(), wait)
        });
        if !wait_switch {
            self.hooks.create_classic_connection(peer);
        }
        self.hooks.arm_link_timer(LinkIndex(idx as u8), config::LINK_CONNECT_TIMEOUT);
    }

    /// Issue the deferred connection attempt once the role switch is done.
    pub(crate) fn create_conn_after_switch(&self, idx: usize) {
        let peer = self.with_state(|s| {
            let lk = &mut s.links[idx];
            lk.state = LinkState::Connecting;
            lk.peer()
        });
        self.hooks.create_classic_connection(peer);
        self.hooks.arm_link_timer(LinkIndex(idx as u8), config::LINK_CONNECT_TIMEOUT);
    }

    /// Start an outgoing LE connection. Returns whether the attempt was
    /// initiated.
    pub(crate) fn start_le_connect(&self, idx: usize) -> bool {
        let peer = self.with_state(|s| s.links[idx].peer());
        if self.hooks.create_le_connection(peer) {
            self.with_state(|s| s.links[idx].state = LinkState::Connecting);
            self.hooks.arm_link_timer(LinkIndex(idx as u8), config::LINK_CONNECT_TIMEOUT);
            true
        } else {
            false
        }
    }
}
