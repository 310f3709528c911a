//! Transmit scheduling and controller credit accounting.
//!
//! The controller exposes a finite transmit window per transport. Links
//! with a dedicated quota send directly against it; when there are not
//! enough buffers for every link to own at least one, low priority links
//! share a global round-robin quota and are served in pool order. Credits
//! flow back through `Number of Completed Packets` events and immediately
//! re-drive the scheduler.

use bt_hci::param::{BdAddr, ConnHandle};

use crate::channel_manager::{next_buffer_to_send, ChannelPull};
use crate::config;
use crate::link_manager::{LinkIndex, Outbound, State};
use crate::pdu::Pdu;
use crate::types::{AclPriority, LinkState, PowerMode, Transport};
use crate::{LinkManager, PacketPool};

/// Which controller window a link draws from. With a shared buffer pool
/// every link draws from the classic window.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    Classic,
    Le,
}

impl<P> State<'_, P> {
    pub(crate) fn lane(&self, transport: Transport) -> Lane {
        if transport == Transport::BrEdr || self.num_ble_bufs == config::BLE_BUF_SHARED {
            Lane::Classic
        } else {
            Lane::Le
        }
    }

    fn window(&self, lane: Lane) -> u16 {
        match lane {
            Lane::Classic => self.xmit_window,
            Lane::Le => self.le_xmit_window,
        }
    }

    fn rr_open(&self, lane: Lane) -> bool {
        match lane {
            Lane::Classic => self.window(lane) > 0 && self.round_robin_unacked < self.round_robin_quota,
            Lane::Le => self.window(lane) > 0 && self.ble_round_robin_unacked < self.ble_round_robin_quota,
        }
    }
}

/// One buffer leaving the host, with the accounting already applied and
/// the callbacks its delivery owes.
struct SendJob<P> {
    peer: BdAddr,
    transport: Transport,
    pdu: Pdu<P>,
    pre_tx_complete: Option<(u16, u16)>,
    congestion: Option<(u16, bool)>,
    post_tx_complete: Option<(u16, u16)>,
}

/// Deduct the packet from the transport window and the link's in-flight
/// count. Round-robin members also count against the shared quota.
fn account_send<P>(s: &mut State<'_, P>, li: usize) {
    let lane = s.lane(s.links[li].transport);
    let rr_member = s.links[li].link_xmit_quota == 0;
    match lane {
        Lane::Classic => {
            s.xmit_window = s.xmit_window.saturating_sub(1);
            if rr_member {
                s.round_robin_unacked += 1;
            }
        }
        Lane::Le => {
            s.le_xmit_window = s.le_xmit_window.saturating_sub(1);
            if rr_member {
                s.ble_round_robin_unacked += 1;
            }
        }
    }
    s.links[li].sent_not_acked += 1;
    trace!(
        "[link][idx = {}] window = {} le_window = {} unacked = {} quota = {}",
        li,
        s.xmit_window,
        s.le_xmit_window,
        s.links[li].sent_not_acked,
        s.links[li].link_xmit_quota
    );
}

fn link_job<P>(s: &State<'_, P>, li: usize, pdu: Pdu<P>) -> SendJob<P> {
    SendJob {
        peer: s.links[li].peer(),
        transport: s.links[li].transport,
        pdu,
        pre_tx_complete: None,
        congestion: None,
        post_tx_complete: None,
    }
}

fn channel_job<P>(s: &State<'_, P>, li: usize, pull: ChannelPull<P>) -> SendJob<P> {
    SendJob {
        peer: s.links[li].peer(),
        transport: s.links[li].transport,
        pdu: pull.pdu,
        pre_tx_complete: pull.pre_tx_complete,
        congestion: pull.congestion,
        post_tx_complete: pull.post_tx_complete,
    }
}

enum RrStep<P> {
    Job(SendJob<P>),
    BreakSingle,
    Idle,
}

impl<'d, P: PacketPool> LinkManager<'d, P> {
    /// Push packets towards the controller.
    ///
    /// With `buf` present the buffer is queued on the link first, tagged
    /// with the channel id it came from; a non-zero `local_cid` requests
    /// single-write behavior (send just this buffer). Without `buf` this
    /// is a pure poke, and without `link` the scheduler sweeps all
    /// round-robin links.
    pub fn check_send_packets(&self, link: Option<LinkIndex>, local_cid: u16, buf: Option<Pdu<P::Packet>>) {
        let mut single_write = false;
        if let Some(pdu) = buf {
            let Some(l) = link else {
                warn!("[link] dropping buffer submitted without a link");
                return;
            };
            single_write = local_cid != 0;
            self.with_state(|s| {
                let li = l.0 as usize;
                let lane = s.lane(s.links[li].transport);
                let lk = &mut s.links[li];
                if lk.xmit_queue.push_back(Outbound { cid: local_cid, pdu }).is_err() {
                    warn!("[link][idx = {}] transmit queue full, dropping buffer", li);
                    return;
                }
                if lk.link_xmit_quota == 0 {
                    match lane {
                        Lane::Classic => s.check_round_robin = true,
                        Lane::Le => s.ble_check_round_robin = true,
                    }
                }
            });
        }

        // An uncongested callback further up the stack is still on the
        // way out; this link is served again on the next credit event.
        if self.with_state(|s| s.cong_cback_depth > 0) {
            warn!("[link] skipping send, congestion callback context");
            return;
        }

        let round_robin = match link {
            None => true,
            Some(l) => self.with_state(|s| s.links[l.0 as usize].link_xmit_quota == 0),
        };
        if round_robin {
            self.round_robin_send(link, single_write);
        } else {
            self.direct_send(unwrap!(link), single_write);
        }
    }

    /// Sweep the link pool once, starting after the triggering link, and
    /// send at most one buffer per eligible round-robin link.
    fn round_robin_send(&self, origin: Option<LinkIndex>, single_write: bool) {
        let n = self.with_state(|s| s.links.len());
        if n == 0 {
            return;
        }
        let start = match origin {
            None => 0,
            Some(l) if single_write => l.0 as usize,
            Some(l) => (l.0 as usize + 1) % n,
        };
        debug!("[link] round robin sweep from {}", start);

        'sweep: for off in 0..n {
            let idx = (start + off) % n;
            let gate_ok = self.with_state(|s| {
                let lk = &s.links[idx];
                if !s.rr_open(s.lane(lk.transport)) {
                    return false;
                }
                lk.in_use && lk.state == LinkState::Connected && lk.link_xmit_quota == 0
            });
            if !gate_ok {
                continue;
            }
            if self.check_power_mode(LinkIndex(idx as u8)) {
                continue;
            }
            let step = self.with_state(|s| {
                if !s.rr_open(s.lane(s.links[idx].transport)) {
                    return RrStep::Idle;
                }
                if let Some(out) = s.links[idx].xmit_queue.pop_front() {
                    account_send(s, idx);
                    RrStep::Job(link_job(s, idx, out.pdu))
                } else if single_write {
                    RrStep::BreakSingle
                } else {
                    match next_buffer_to_send(s, idx) {
                        Some(pull) => {
                            account_send(s, idx);
                            RrStep::Job(channel_job(s, idx, pull))
                        }
                        None => RrStep::Idle,
                    }
                }
            });
            match step {
                RrStep::Job(job) => self.dispatch(job),
                RrStep::BreakSingle => break 'sweep,
                RrStep::Idle => {}
            }
        }

        // If the sweep ended without using up a lane's quota, no safety
        // recheck is needed on the next credit event.
        self.with_state(|s| {
            if s.xmit_window > 0 && s.round_robin_unacked < s.round_robin_quota {
                s.check_round_robin = false;
            }
            if s.le_xmit_window > 0 && s.ble_round_robin_unacked < s.ble_round_robin_quota {
                s.ble_check_round_robin = false;
            }
        });
    }

    /// Send against the link's dedicated quota: first the prepared link
    /// queue, then channel data.
    fn direct_send(&self, link: LinkIndex, single_write: bool) {
        let li = link.0 as usize;
        if self.with_state(|s| s.links[li].state != LinkState::Connected) || self.check_power_mode(link) {
            warn!("[link][idx = {}] not connected or power transition pending", li);
            return;
        }

        loop {
            let job = self.with_state(|s| {
                let lk = &s.links[li];
                if s.window(s.lane(lk.transport)) == 0 || lk.sent_not_acked >= lk.link_xmit_quota {
                    return None;
                }
                let out = s.links[li].xmit_queue.pop_front()?;
                account_send(s, li);
                Some(link_job(s, li, out.pdu))
            });
            match job {
                Some(job) => self.dispatch(job),
                None => break,
            }
        }

        if !single_write {
            loop {
                let job = self.with_state(|s| {
                    let lk = &s.links[li];
                    if s.window(s.lane(lk.transport)) == 0 || lk.sent_not_acked >= lk.link_xmit_quota {
                        return None;
                    }
                    let pull = next_buffer_to_send(s, li)?;
                    account_send(s, li);
                    Some(channel_job(s, li, pull))
                });
                match job {
                    Some(job) => self.dispatch(job),
                    None => break,
                }
            }
        }

        // Quota left but data still queued: another link may have eaten
        // the window, retry shortly.
        let stalled = self.with_state(|s| {
            let lk = &s.links[li];
            !lk.xmit_queue.is_empty() && lk.sent_not_acked < lk.link_xmit_quota
        });
        if stalled {
            self.hooks.arm_link_timer(link, config::LINK_FLOW_CONTROL_TIMEOUT);
        }
    }

    fn dispatch(&self, job: SendJob<P::Packet>) {
        if let Some((cid, count)) = job.pre_tx_complete {
            self.hooks.tx_complete(cid, count);
        }
        if let Some((cid, congested)) = job.congestion {
            self.notify_congestion(cid, congested);
        }
        match job.transport {
            Transport::BrEdr => self.hooks.send_acl_br_edr(job.peer, job.pdu),
            Transport::Le => self.hooks.send_acl_le(job.peer, job.pdu),
        }
        if let Some((cid, count)) = job.post_tx_complete {
            self.hooks.tx_complete(cid, count);
        }
    }

    /// Report a congestion edge, holding the re-entrancy counter so a
    /// nested send attempt from the callback returns immediately.
    pub(crate) fn notify_congestion(&self, cid: u16, congested: bool) {
        self.with_state(|s| s.cong_cback_depth += 1);
        self.hooks.congestion_status(cid, congested);
        self.with_state(|s| s.cong_cback_depth -= 1);
    }

    /// Whether sending should hold off because the link is leaving park.
    /// Only meaningful on BR/EDR; LE has no link power modes.
    pub(crate) fn check_power_mode(&self, link: LinkIndex) -> bool {
        let li = link.0 as usize;
        let probe = self.with_state(|s| {
            let lk = &s.links[li];
            if lk.transport == Transport::Le {
                return None;
            }
            let unsent = !lk.xmit_queue.is_empty()
                || lk.channels.iter().any(|&c| !s.channels[c.0 as usize].xmit_hold_q.is_empty());
            if unsent {
                Some(lk.peer())
            } else {
                None
            }
        });
        match probe {
            Some(peer) => {
                if self.hooks.read_power_mode(peer) == Some(PowerMode::Pending) {
                    debug!("[link][idx = {}] power mode transition pending", li);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Apply a `Number of Completed Packets` report: return the credits
    /// to the transport window and resume sending.
    pub fn packets_completed(&self, handle: ConnHandle, num_sent: u16) {
        let Some(idx) = self.with_state(|s| s.find_by_handle(handle)) else {
            return;
        };
        let (lane, high_priority) = self.with_state(|s| {
            let lane = s.lane(s.links[idx].transport);
            let rr_member = s.links[idx].link_xmit_quota == 0;
            let lk = &mut s.links[idx];
            lk.sent_not_acked = lk.sent_not_acked.saturating_sub(num_sent);
            let high_priority = lk.acl_priority == AclPriority::High;
            match lane {
                Lane::Classic => {
                    s.xmit_window += num_sent;
                    if rr_member {
                        s.round_robin_unacked = s.round_robin_unacked.saturating_sub(num_sent);
                    }
                }
                Lane::Le => {
                    s.le_xmit_window += num_sent;
                    if rr_member {
                        s.ble_round_robin_unacked = s.ble_round_robin_unacked.saturating_sub(num_sent);
                    }
                }
            }
            (lane, high_priority)
        });

        self.check_send_packets(Some(LinkIndex(idx as u8)), 0, None);

        // A high priority link may have starved the round-robin pool;
        // give it a pass now that quota is back.
        if high_priority {
            let recheck = self.with_state(|s| match lane {
                Lane::Classic => s.check_round_robin && s.round_robin_unacked < s.round_robin_quota,
                Lane::Le => s.ble_check_round_robin && s.ble_round_robin_unacked < s.ble_round_robin_quota,
            });
            if recheck {
                self.check_send_packets(None, 0, None);
            }
        }
    }

    /// A partially transmitted ACL segment came back from the HCI layer.
    /// It goes to the head of the link queue so the residue keeps its
    /// place in line.
    pub fn segments_xmitted(&self, pdu: Pdu<P::Packet>) {
        let Some(handle) = pdu.acl_handle() else {
            warn!("[link] segment without an ACL header");
            return;
        };
        let Some(idx) = self.with_state(|s| s.find_by_handle(handle)) else {
            warn!("[link] segment complete for unknown handle {:?}", handle);
            return;
        };
        if self.with_state(|s| s.links[idx].state != LinkState::Connected) {
            info!("[link] segment complete for unconnected handle {:?}", handle);
            return;
        }
        self.with_state(|s| {
            if s.links[idx].xmit_queue.push_front(Outbound { cid: 0, pdu }).is_err() {
                warn!("[link][idx = {}] transmit queue full, dropping segment", idx);
            }
        });
        self.check_send_packets(Some(LinkIndex(idx as u8)), 0, None);
    }

    /// The controller reported the link active again (e.g. left sniff);
    /// flush anything held back.
    pub fn mode_change_active(&self, peer: BdAddr) {
        if let Some(idx) = self.with_state(|s| s.find_by_peer(peer, Transport::BrEdr)) {
            trace!("[link][idx = {}] mode change to active, resuming", idx);
            self.check_send_packets(Some(LinkIndex(idx as u8)), 0, None);
        }
    }

    /// Divide the controller buffers over the links: each high priority
    /// link reserves a fixed quota, the remainder is split across normal
    /// links, and when that split cannot give every link a buffer the
    /// normal links fall into round-robin mode over a shared quota.
    pub(crate) fn adjust_allocation(&self) {
        self.with_state(adjust_allocation_locked);

        // A link may have regained quota while holding queued data; kick
        // its transmission shortly.
        let n = self.with_state(|s| s.links.len());
        for idx in 0..n {
            let stalled = self.with_state(|s| {
                let lk = &s.links[idx];
                lk.in_use
                    && lk.state == LinkState::Connected
                    && !lk.xmit_queue.is_empty()
                    && lk.sent_not_acked < lk.link_xmit_quota
            });
            if stalled {
                self.hooks.arm_link_timer(LinkIndex(idx as u8), config::LINK_FLOW_CONTROL_TIMEOUT);
            }
        }
    }
}

fn adjust_allocation_locked<P>(s: &mut State<'_, P>) {
    let shared = s.num_ble_bufs == config::BLE_BUF_SHARED;

    // No links: windows back to full size, nothing to divide.
    if !s.links.iter().any(|l| l.in_use) {
        s.xmit_window = s.num_acl_bufs;
        s.round_robin_quota = 0;
        s.round_robin_unacked = 0;
        if !shared {
            s.le_xmit_window = s.num_ble_bufs;
            s.ble_round_robin_quota = 0;
            s.ble_round_robin_unacked = 0;
        }
        return;
    }

    let included = |l: &&mut crate::LinkStorage<P>| -> bool {
        l.in_use && (shared || l.transport == Transport::BrEdr)
    };
    let hi = s
        .links
        .iter()
        .filter(|l| l.in_use && (shared || l.transport == Transport::BrEdr) && l.acl_priority == AclPriority::High)
        .count() as u16;
    let lo = s
        .links
        .iter()
        .filter(|l| l.in_use && (shared || l.transport == Transport::BrEdr) && l.acl_priority == AclPriority::Normal)
        .count() as u16;

    let mut high_quota = config::HIGH_PRI_MIN_XMIT_QUOTA;
    let floor: u16 = if lo > 0 { 1 } else { 0 };
    while high_quota > 0 && hi * high_quota + floor > s.num_acl_bufs {
        high_quota -= 1;
    }
    let hi_total = hi * high_quota;
    let low_total = if hi_total < s.num_acl_bufs {
        s.num_acl_bufs - hi_total
    } else {
        1
    };

    let (qq, mut remainder) = if lo > low_total {
        // Not enough buffers for one each: share the whole low quota
        // round-robin. The outstanding counter carries over.
        s.round_robin_quota = low_total;
        (0, 0)
    } else if lo > 0 {
        s.round_robin_quota = 0;
        s.round_robin_unacked = 0;
        (low_total / lo, low_total % lo)
    } else {
        s.round_robin_quota = 0;
        s.round_robin_unacked = 0;
        (1, 0)
    };

    debug!(
        "[link] adjust allocation hi = {} lo = {} low_total = {} rr_quota = {} qq = {}",
        hi, lo, low_total, s.round_robin_quota, qq
    );

    {
        let State {
            links,
            round_robin_unacked,
            ..
        } = s;
        for lk in links.iter_mut().filter(included) {
            if lk.acl_priority == AclPriority::High {
                lk.link_xmit_quota = high_quota;
            } else {
                // A link moving into round robin folds its in-flight
                // count into the shared counter exactly once; it keeps
                // updating sent_not_acked for leaving round robin later.
                if lk.link_xmit_quota > 0 && qq == 0 {
                    *round_robin_unacked += lk.sent_not_acked;
                }
                lk.link_xmit_quota = qq;
                if remainder > 0 {
                    lk.link_xmit_quota += 1;
                    remainder -= 1;
                }
            }
            trace!(
                "[link] quota = {} sent_not_acked = {} rr_unacked = {}",
                lk.link_xmit_quota,
                lk.sent_not_acked,
                round_robin_unacked
            );
        }
    }

    // A dedicated LE buffer pool is always shared round-robin across the
    // LE links.
    if !shared {
        let le_links = s
            .links
            .iter()
            .filter(|l| l.in_use && l.transport == Transport::Le)
            .count();
        if le_links == 0 {
            s.ble_round_robin_quota = 0;
            s.ble_round_robin_unacked = 0;
        } else {
            s.ble_round_robin_quota = s.num_ble_bufs;
            let State {
                links,
                ble_round_robin_unacked,
                ..
            } = s;
            for lk in links
                .iter_mut()
                .filter(|l| l.in_use && l.transport == Transport::Le)
            {
                if lk.link_xmit_quota > 0 {
                    *ble_round_robin_unacked += lk.sent_not_acked;
                }
                lk.link_xmit_quota = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use bt_hci::param::{LeConnRole, Status};

    use super::*;
    use crate::mock::{addr, harness, raw_pkt, stamped_pkt};
    use crate::types::{ChannelMode, ChannelPriority, ChannelState};

    /// `xmit_window + sent_not_acked over classic links = buffer count`,
    /// and the round-robin counter covers exactly the quota-less links.
    fn assert_classic_conservation(mgr: &crate::LinkManager<'static, crate::mock::TestPool>) {
        mgr.with_state(|s| {
            let in_flight: u16 = s
                .links
                .iter()
                .filter(|l| l.in_use && l.transport == Transport::BrEdr)
                .map(|l| l.sent_not_acked)
                .sum();
            assert_eq!(s.xmit_window + in_flight, s.num_acl_bufs);
            let rr_in_flight: u16 = s
                .links
                .iter()
                .filter(|l| l.in_use && l.transport == Transport::BrEdr && l.link_xmit_quota == 0)
                .map(|l| l.sent_not_acked)
                .sum();
            assert_eq!(s.round_robin_unacked, rr_in_flight);
        });
    }

    #[test]
    fn quota_redistribution() {
        let (mgr, _hooks) = harness::<6, 2>();
        mgr.set_controller_buffers(10, config::BLE_BUF_SHARED);

        for i in 0..4u8 {
            mgr.connect_complete(Status::SUCCESS, ConnHandle::new(1 + i as u16), addr(1 + i));
        }
        let hi = mgr.find_link(addr(1), Transport::BrEdr).unwrap();
        mgr.set_link_priority(hi, crate::types::AclPriority::High);

        let quotas: Vec<u16> = mgr.with_state(|s| {
            s.links.iter().filter(|l| l.in_use).map(|l| l.link_xmit_quota).collect()
        });
        assert_eq!(quotas, [5, 2, 2, 1]);

        // A fifth link re-divides the low quota; nothing in flight moves.
        mgr.connect_complete(Status::SUCCESS, ConnHandle::new(5), addr(5));
        let quotas: Vec<u16> = mgr.with_state(|s| {
            s.links.iter().filter(|l| l.in_use).map(|l| l.link_xmit_quota).collect()
        });
        assert_eq!(quotas, [5, 2, 1, 1, 1]);
        mgr.with_state(|s| {
            assert!(s.links.iter().all(|l| l.sent_not_acked == 0));
            assert_eq!(s.round_robin_quota, 0);
        });
    }

    #[test]
    fn high_priority_quota_shrinks_to_fit() {
        let (mgr, _hooks) = harness::<3, 2>();
        mgr.set_controller_buffers(3, config::BLE_BUF_SHARED);

        for i in 0..3u8 {
            mgr.connect_complete(Status::SUCCESS, ConnHandle::new(1 + i as u16), addr(1 + i));
        }
        mgr.set_link_priority(mgr.find_link(addr(1), Transport::BrEdr).unwrap(), crate::types::AclPriority::High);
        mgr.set_link_priority(mgr.find_link(addr(2), Transport::BrEdr).unwrap(), crate::types::AclPriority::High);

        mgr.with_state(|s| {
            let quotas: Vec<u16> = s.links.iter().filter(|l| l.in_use).map(|l| l.link_xmit_quota).collect();
            // Two high priority links fit one buffer each next to the
            // floor reserved for the low priority link.
            assert_eq!(quotas, [1, 1, 1]);
            assert!(2 * (1 + 1) + 1 > 3);
        });
    }

    #[test]
    fn round_robin_engagement_rotates_in_pool_order() {
        let (mgr, hooks) = harness::<5, 2>();
        mgr.set_controller_buffers(2, config::BLE_BUF_SHARED);

        for i in 0..5u8 {
            mgr.connect_complete(Status::SUCCESS, ConnHandle::new(1 + i as u16), addr(10 + i));
        }
        mgr.with_state(|s| {
            assert!(s.links.iter().all(|l| l.link_xmit_quota == 0));
            assert_eq!(s.round_robin_quota, 2);
        });

        let links: Vec<_> = (0..5u8)
            .map(|i| mgr.find_link(addr(10 + i), Transport::BrEdr).unwrap())
            .collect();
        for (i, link) in links.iter().enumerate() {
            mgr.check_send_packets(Some(*link), 0, Some(raw_pkt(0xa0 + i as u8, 8)));
        }

        // Two credits, two links served, in pool order.
        assert_eq!(hooks.classic_tx_peers(), [addr(10), addr(11)]);
        assert_classic_conservation(mgr);

        mgr.packets_completed(ConnHandle::new(1), 1);
        assert_eq!(hooks.classic_tx_peers(), [addr(10), addr(11), addr(12)]);
        mgr.packets_completed(ConnHandle::new(2), 1);
        mgr.packets_completed(ConnHandle::new(3), 1);
        assert_eq!(
            hooks.classic_tx_peers(),
            [addr(10), addr(11), addr(12), addr(13), addr(14)]
        );
        assert_classic_conservation(mgr);
    }

    #[test]
    fn per_link_fifo_across_segment_reprepend() {
        let (mgr, hooks) = harness::<1, 1>();
        mgr.set_controller_buffers(1, config::BLE_BUF_SHARED);

        let h = ConnHandle::new(0x0042);
        mgr.connect_complete(Status::SUCCESS, h, addr(1));
        let link = mgr.find_link(addr(1), Transport::BrEdr).unwrap();

        // First buffer goes straight out and uses up the window.
        mgr.check_send_packets(Some(link), 0, Some(raw_pkt(0xa1, 8)));
        assert_eq!(hooks.classic_tx_markers(), [0xa1]);

        // Second waits for credit.
        mgr.check_send_packets(Some(link), 0, Some(raw_pkt(0xa2, 8)));

        // The controller hands back the unsent remainder of the first
        // buffer; it must retake the head of the line.
        mgr.segments_xmitted(stamped_pkt(h, 0xb1, 8));

        // New data lands behind everything.
        mgr.check_send_packets(Some(link), 0, Some(raw_pkt(0xa3, 8)));

        mgr.packets_completed(h, 1);
        mgr.packets_completed(h, 1);
        mgr.packets_completed(h, 1);
        assert_eq!(hooks.classic_tx_markers(), [0xa1, 0xb1, 0xa2, 0xa3]);
        assert_classic_conservation(mgr);
    }

    #[test]
    fn segment_for_unknown_or_unconnected_handle_is_dropped() {
        let (mgr, hooks) = harness::<1, 1>();
        mgr.set_controller_buffers(2, config::BLE_BUF_SHARED);

        mgr.segments_xmitted(stamped_pkt(ConnHandle::new(0x77), 0xb1, 8));
        assert!(hooks.classic_tx.borrow().is_empty());

        let h = ConnHandle::new(0x42);
        mgr.connect_complete(Status::SUCCESS, h, addr(1));
        let link = mgr.find_link(addr(1), Transport::BrEdr).unwrap();
        mgr.with_state(|s| s.links[link.raw() as usize].state = crate::types::LinkState::Disconnecting);
        mgr.segments_xmitted(stamped_pkt(h, 0xb2, 8));
        mgr.with_state(|s| assert!(s.links[link.raw() as usize].xmit_queue.is_empty()));
    }

    #[test]
    fn adjust_allocation_is_idempotent_entering_round_robin() {
        let (mgr, _hooks) = harness::<3, 2>();
        mgr.set_controller_buffers(2, config::BLE_BUF_SHARED);

        mgr.connect_complete(Status::SUCCESS, ConnHandle::new(1), addr(1));
        mgr.connect_complete(Status::SUCCESS, ConnHandle::new(2), addr(2));
        let l0 = mgr.find_link(addr(1), Transport::BrEdr).unwrap();
        let l1 = mgr.find_link(addr(2), Transport::BrEdr).unwrap();

        // One packet in flight on each dedicated-quota link.
        mgr.check_send_packets(Some(l0), 0, Some(raw_pkt(1, 8)));
        mgr.check_send_packets(Some(l1), 0, Some(raw_pkt(2, 8)));
        mgr.with_state(|s| assert_eq!(s.xmit_window, 0));

        // A third link forces round-robin mode; the in-flight packets
        // fold into the shared counter exactly once.
        mgr.connect_complete(Status::SUCCESS, ConnHandle::new(3), addr(3));
        mgr.with_state(|s| {
            assert!(s.links.iter().all(|l| l.link_xmit_quota == 0));
            assert_eq!(s.round_robin_quota, 2);
            assert_eq!(s.round_robin_unacked, 2);
        });

        mgr.adjust_allocation();
        mgr.adjust_allocation();
        mgr.with_state(|s| {
            assert_eq!(s.round_robin_unacked, 2);
            let sent: Vec<u16> = s.links.iter().filter(|l| l.in_use).map(|l| l.sent_not_acked).collect();
            assert_eq!(sent, [1, 1, 0]);
        });
        assert_classic_conservation(mgr);
    }

    #[test]
    fn congestion_callback_context_blocks_nested_sends() {
        let (mgr, hooks) = harness::<2, 2>();
        mgr.set_controller_buffers(4, config::BLE_BUF_SHARED);

        mgr.connect_complete(Status::SUCCESS, ConnHandle::new(1), addr(1));
        mgr.connect_complete(Status::SUCCESS, ConnHandle::new(2), addr(2));
        let l0 = mgr.find_link(addr(1), Transport::BrEdr).unwrap();
        let l1 = mgr.find_link(addr(2), Transport::BrEdr).unwrap();

        let ch = mgr.attach_channel(l0, ChannelPriority::Medium, ChannelMode::Basic).unwrap();
        mgr.set_channel_state(ch, ChannelState::Open);
        let cid = mgr.channel_cid(ch);
        mgr.with_state(|s| {
            s.channels[ch.0 as usize].congested = true;
            let _ = s.channels[ch.0 as usize].xmit_hold_q.push_back(raw_pkt(0x55, 8));
        });

        // Draining the channel reports it uncongested; the callback
        // immediately tries to push data on the other link.
        hooks.reenter_with.set(Some((mgr, l1)));
        mgr.check_send_packets(Some(l0), 0, None);

        assert_eq!(hooks.congestion.borrow()[..], [(cid, false)]);
        // Only this link's buffer went out; the nested submission was
        // queued but not sent despite the open window.
        assert_eq!(hooks.classic_tx_markers(), [0x55]);
        mgr.with_state(|s| assert_eq!(s.links[l1.raw() as usize].xmit_queue.len(), 1));

        // Outside callback context it drains normally.
        mgr.check_send_packets(Some(l1), 0, None);
        assert_eq!(hooks.classic_tx_markers(), [0x55, 0x77]);
    }

    #[test]
    fn pending_power_transition_holds_transmission() {
        let (mgr, hooks) = harness::<1, 1>();
        mgr.set_controller_buffers(2, config::BLE_BUF_SHARED);

        mgr.connect_complete(Status::SUCCESS, ConnHandle::new(1), addr(1));
        let link = mgr.find_link(addr(1), Transport::BrEdr).unwrap();

        hooks.power_mode.set(Some(PowerMode::Pending));
        mgr.check_send_packets(Some(link), 0, Some(raw_pkt(0x31, 8)));
        assert!(hooks.classic_tx.borrow().is_empty());

        hooks.power_mode.set(Some(PowerMode::Active));
        mgr.mode_change_active(addr(1));
        assert_eq!(hooks.classic_tx_markers(), [0x31]);
    }

    #[test]
    fn dedicated_le_pool_schedules_round_robin() {
        let (mgr, hooks) = harness::<2, 2>();
        mgr.set_controller_buffers(4, 3);

        let h = ConnHandle::new(0x31);
        mgr.le_connect_complete(h, addr(7), LeConnRole::Central);
        let link = mgr.find_link(addr(7), Transport::Le).unwrap();
        mgr.with_state(|s| {
            assert_eq!(s.links[link.raw() as usize].link_xmit_quota, 0);
            assert_eq!(s.ble_round_robin_quota, 3);
            assert_eq!(s.le_xmit_window, 3);
        });

        mgr.check_send_packets(Some(link), 0, Some(raw_pkt(0x61, 8)));
        assert_eq!(hooks.le_tx.borrow().len(), 1);
        mgr.with_state(|s| {
            assert_eq!(s.le_xmit_window, 2);
            assert_eq!(s.ble_round_robin_unacked, 1);
            // The classic window is untouched.
            assert_eq!(s.xmit_window, 4);
        });

        mgr.packets_completed(h, 1);
        mgr.with_state(|s| {
            assert_eq!(s.le_xmit_window, 3);
            assert_eq!(s.ble_round_robin_unacked, 0);
        });
    }

    #[test]
    fn flow_control_timer_armed_when_quota_left_with_data() {
        let (mgr, hooks) = harness::<2, 1>();
        mgr.set_controller_buffers(2, config::BLE_BUF_SHARED);

        mgr.connect_complete(Status::SUCCESS, ConnHandle::new(1), addr(1));
        mgr.connect_complete(Status::SUCCESS, ConnHandle::new(2), addr(2));
        let l0 = mgr.find_link(addr(1), Transport::BrEdr).unwrap();
        let l1 = mgr.find_link(addr(2), Transport::BrEdr).unwrap();

        // The second link eats the whole window.
        mgr.check_send_packets(Some(l1), 0, Some(raw_pkt(1, 8)));
        mgr.with_state(|s| {
            // Pretend it overdrew while quotas were larger.
            s.links[l1.raw() as usize].sent_not_acked = 2;
            s.xmit_window = 0;
        });

        mgr.check_send_packets(Some(l0), 0, Some(raw_pkt(2, 8)));
        assert_eq!(
            hooks.link_timers.borrow().last().copied(),
            Some((l0.raw(), config::LINK_FLOW_CONTROL_TIMEOUT))
        );
    }
}
