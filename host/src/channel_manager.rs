//! Channel records and the per-link channel scheduler.
//!
//! Channels attached to a link are partitioned into strict priority
//! groups. Within a group, service rotates over a circular membership
//! list; each group spends a quota of services before the scheduler moves
//! to the next group. Fixed channels bypass the groups entirely and are
//! always served first, in slot order.

use heapless::{Deque, Vec};

use crate::config;
use crate::link_manager::{LinkIndex, LinkStorage, State};
use crate::pdu::Pdu;
use crate::types::{ChannelMode, ChannelPriority, ChannelState, DataRate, SecurityToken};
use crate::{Error, Packet, PacketPool};

/// Stable identifier of a channel pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelIndex(pub(crate) u8);

/// Round-robin record of one priority group: the members in attachment
/// order, the cursor of the next channel to serve, and the remaining
/// service quota of the group.
pub(crate) struct ServeQueue {
    pub(crate) members: Vec<ChannelIndex, { config::CHANNELS_PER_LINK }>,
    pub(crate) cursor: usize,
    pub(crate) quota: u16,
}

impl ServeQueue {
    pub(crate) const fn new() -> Self {
        Self {
            members: Vec::new(),
            cursor: 0,
            quota: 0,
        }
    }

    pub(crate) fn reset(&mut self, quota: u16) {
        self.members.clear();
        self.cursor = 0;
        self.quota = quota;
    }

    fn push(&mut self, ci: ChannelIndex) {
        let _ = self.members.push(ci);
    }

    fn remove(&mut self, ci: ChannelIndex) {
        if let Some(pos) = self.members.iter().position(|&c| c == ci) {
            self.members.remove(pos);
            if pos < self.cursor {
                self.cursor -= 1;
            }
            if self.cursor >= self.members.len() {
                self.cursor = 0;
            }
        }
    }
}

/// Per-channel record, as far as the link core needs one. The channel
/// state machine above this crate owns the protocol; this record carries
/// the queues and flags the scheduler consults.
pub struct ChannelStorage<P> {
    pub(crate) in_use: bool,
    pub(crate) link: Option<LinkIndex>,
    pub(crate) cid: u16,
    pub(crate) state: ChannelState,
    pub(crate) priority: ChannelPriority,
    pub(crate) mode: ChannelMode,
    pub(crate) tx_data_rate: DataRate,
    pub(crate) rx_data_rate: DataRate,
    pub(crate) buff_quota: u16,
    pub(crate) xmit_hold_q: Deque<Pdu<P>, { config::CHANNEL_TX_QUEUE_SIZE }>,
    pub(crate) retrans_q: Deque<Pdu<P>, { config::RETRANS_QUEUE_SIZE }>,
    pub(crate) wait_ack: bool,
    pub(crate) remote_busy: bool,
    pub(crate) window_closed: bool,
    pub(crate) peer_credits: u16,
    pub(crate) congested: bool,
    pub(crate) fixed_slot: Option<u8>,
    pub(crate) tx_complete: bool,
    pub(crate) sec_token: Option<SecurityToken>,
}

impl<P> ChannelStorage<P> {
    /// An unused channel record.
    pub const fn new() -> Self {
        Self {
            in_use: false,
            link: None,
            cid: 0,
            state: ChannelState::Closed,
            priority: ChannelPriority::Medium,
            mode: ChannelMode::Basic,
            tx_data_rate: DataRate::Low,
            rx_data_rate: DataRate::Low,
            buff_quota: 0,
            xmit_hold_q: Deque::new(),
            retrans_q: Deque::new(),
            wait_ack: false,
            remote_busy: false,
            window_closed: false,
            peer_credits: 0,
            congested: false,
            fixed_slot: None,
            tx_complete: false,
            sec_token: None,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.in_use = false;
        self.link = None;
        self.cid = 0;
        self.state = ChannelState::Closed;
        self.priority = ChannelPriority::Medium;
        self.mode = ChannelMode::Basic;
        self.tx_data_rate = DataRate::Low;
        self.rx_data_rate = DataRate::Low;
        self.buff_quota = 0;
        self.xmit_hold_q.clear();
        self.retrans_q.clear();
        self.wait_ack = false;
        self.remote_busy = false;
        self.window_closed = false;
        self.peer_credits = 0;
        self.congested = false;
        self.fixed_slot = None;
        self.tx_complete = false;
        self.sec_token = None;
    }
}

impl<P> Default for ChannelStorage<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> core::fmt::Debug for ChannelStorage<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelStorage")
            .field("cid", &self.cid)
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("mode", &self.mode)
            .field("quota", &self.buff_quota)
            .field("queued", &self.xmit_hold_q.len())
            .finish()
    }
}

/// Detach a channel from its link: attachment list, fixed slot or
/// priority group, and any buffers it parked on the link queue.
pub(crate) fn detach_channel<P>(lk: &mut LinkStorage<P>, channels: &mut [ChannelStorage<P>], ci: ChannelIndex) {
    let ch = &mut channels[ci.0 as usize];
    if let Some(pos) = lk.channels.iter().position(|&c| c == ci) {
        lk.channels.remove(pos);
    }
    if let Some(slot) = ch.fixed_slot {
        lk.fixed[slot as usize] = None;
    } else {
        lk.rr_serv[ch.priority.group()].remove(ci);
    }
    let cid = ch.cid;
    for _ in 0..lk.xmit_queue.len() {
        if let Some(out) = lk.xmit_queue.pop_front() {
            if out.cid != cid {
                let _ = lk.xmit_queue.push_back(out);
            }
        }
    }
}

/// Watermark check of a channel's transmit backlog against its buffer
/// quota. Returns a congestion edge to report, if any. A channel becomes
/// congested above its quota and uncongested once drained to half.
pub(crate) fn check_channel_congestion<P>(ch: &mut ChannelStorage<P>) -> Option<(u16, bool)> {
    let queued = (ch.xmit_hold_q.len() + ch.retrans_q.len()) as u16;
    if ch.congested {
        if queued <= ch.buff_quota / 2 {
            ch.congested = false;
            return Some((ch.cid, false));
        }
    } else if queued > ch.buff_quota {
        ch.congested = true;
        return Some((ch.cid, true));
    }
    None
}

fn eligible<P>(ch: &ChannelStorage<P>) -> bool {
    if ch.state != ChannelState::Open {
        return false;
    }
    match ch.mode {
        ChannelMode::LeCredit => !ch.xmit_hold_q.is_empty() && ch.peer_credits > 0,
        ChannelMode::Ertm => {
            if ch.wait_ack || ch.remote_busy {
                return false;
            }
            if !ch.retrans_q.is_empty() {
                return true;
            }
            !ch.xmit_hold_q.is_empty() && !ch.window_closed
        }
        ChannelMode::Basic => !ch.xmit_hold_q.is_empty(),
    }
}

/// Select the next dynamic channel to serve on the link, honouring strict
/// priority between groups and circular fairness within one.
pub(crate) fn next_channel_in_rr<P>(s: &mut State<'_, P>, li: usize) -> Option<ChannelIndex> {
    let State { links, channels, .. } = s;
    let lk = &mut links[li];

    let mut serve = None;
    for _ in 0..config::NUM_CHNL_PRIORITY {
        if serve.is_none() {
            let pri = lk.rr_pri;
            let group = &mut lk.rr_serv[pri];
            for _ in 0..group.members.len() {
                let ci = group.members[group.cursor];
                group.cursor = (group.cursor + 1) % group.members.len();
                if eligible(&channels[ci.0 as usize]) {
                    serve = Some(ci);
                    group.quota = group.quota.saturating_sub(1);
                    break;
                }
            }
        }
        // Out of quota, or nothing to serve here: rotate to the next
        // group and refill its quota.
        if lk.rr_serv[lk.rr_pri].quota == 0 || serve.is_none() {
            lk.rr_pri = (lk.rr_pri + 1) % config::NUM_CHNL_PRIORITY;
            lk.rr_serv[lk.rr_pri].quota = config::priority_quota(lk.rr_pri);
        } else {
            break;
        }
    }
    serve
}

/// A buffer pulled from a channel, along with the callbacks its delivery
/// owes: an immediate tx-complete (dynamic basic channels), a congestion
/// edge, and a post-send tx-complete (fixed basic channels).
pub(crate) struct ChannelPull<P> {
    pub(crate) pdu: Pdu<P>,
    pub(crate) pre_tx_complete: Option<(u16, u16)>,
    pub(crate) congestion: Option<(u16, bool)>,
    pub(crate) post_tx_complete: Option<(u16, u16)>,
}

fn next_fcr_segment<P>(ch: &mut ChannelStorage<P>) -> Option<Pdu<P>> {
    if let Some(pdu) = ch.retrans_q.pop_front() {
        Some(pdu)
    } else {
        ch.xmit_hold_q.pop_front()
    }
}

/// Pull the next buffer to send on the link: fixed channels first in slot
/// order, then the dynamic priority round-robin. The returned buffer
/// carries a freshly stamped ACL header.
pub(crate) fn next_buffer_to_send<P: Packet>(s: &mut State<'_, P>, li: usize) -> Option<ChannelPull<P>> {
    let handle = s.links[li].handle?;

    for slot in 0..config::NUM_FIXED_CHANNELS {
        let Some(ci) = s.links[li].fixed[slot] else { continue };
        let ch = &mut s.channels[ci.0 as usize];
        if ch.mode != ChannelMode::Basic {
            if ch.wait_ack || ch.remote_busy {
                continue;
            }
            if ch.retrans_q.is_empty() {
                if ch.xmit_hold_q.is_empty() {
                    continue;
                }
                if ch.mode == ChannelMode::Ertm && ch.window_closed {
                    continue;
                }
            }
            let Some(mut pdu) = next_fcr_segment(ch) else { continue };
            let congestion = check_channel_congestion(ch);
            pdu.stamp_acl_header(handle);
            return Some(ChannelPull {
                pdu,
                pre_tx_complete: None,
                congestion,
                post_tx_complete: None,
            });
        } else if let Some(mut pdu) = ch.xmit_hold_q.pop_front() {
            let post = Some((ch.cid, 1));
            let congestion = check_channel_congestion(ch);
            pdu.stamp_acl_header(handle);
            return Some(ChannelPull {
                pdu,
                pre_tx_complete: None,
                congestion,
                post_tx_complete: post,
            });
        }
    }

    let ci = next_channel_in_rr(s, li)?;
    let ch = &mut s.channels[ci.0 as usize];
    let mut pdu = match ch.mode {
        ChannelMode::LeCredit => {
            if ch.peer_credits == 0 {
                debug!("[l2cap][cid = {}] no credits to send", ch.cid);
                return None;
            }
            let pdu = ch.xmit_hold_q.pop_front()?;
            ch.peer_credits -= 1;
            pdu
        }
        ChannelMode::Ertm => next_fcr_segment(ch)?,
        ChannelMode::Basic => ch.xmit_hold_q.pop_front()?,
    };
    let pre = if ch.tx_complete && ch.mode != ChannelMode::Ertm {
        Some((ch.cid, 1))
    } else {
        None
    };
    let congestion = check_channel_congestion(ch);
    pdu.stamp_acl_header(handle);
    Some(ChannelPull {
        pdu,
        pre_tx_complete: pre,
        congestion,
        post_tx_complete: None,
    })
}

impl<'d, P: PacketPool> crate::LinkManager<'d, P> {
    /// Attach a dynamic channel to a link.
    pub fn attach_channel(
        &self,
        link: LinkIndex,
        priority: ChannelPriority,
        mode: ChannelMode,
    ) -> Result<ChannelIndex, Error> {
        let ci = self.with_state(|s| {
            let li = link.0 as usize;
            if !s.links[li].in_use {
                return Err(Error::Disconnected);
            }
            if s.links[li].channels.is_full() {
                return Err(Error::NoResources);
            }
            let State { links, channels, .. } = s;
            let lk = &mut links[li];
            for (idx, ch) in channels.iter_mut().enumerate() {
                if !ch.in_use {
                    ch.reset();
                    ch.in_use = true;
                    ch.link = Some(link);
                    ch.cid = config::DYN_CID_BASE + idx as u16;
                    ch.priority = priority;
                    ch.mode = mode;
                    let ci = ChannelIndex(idx as u8);
                    let _ = lk.channels.push(ci);
                    lk.rr_serv[priority.group()].push(ci);
                    debug!("[l2cap][cid = {}] attached to link {}", ch.cid, li);
                    return Ok(ci);
                }
            }
            Err(Error::NoResources)
        })?;
        self.adjust_chnl_allocation();
        Ok(ci)
    }

    /// Bind a fixed channel slot on a link.
    pub fn attach_fixed_channel(&self, link: LinkIndex, slot: u8, mode: ChannelMode) -> Result<ChannelIndex, Error> {
        if slot as usize >= config::NUM_FIXED_CHANNELS {
            return Err(Error::InvalidChannelId);
        }
        let ci = self.with_state(|s| {
            let li = link.0 as usize;
            if !s.links[li].in_use {
                return Err(Error::Disconnected);
            }
            if s.links[li].fixed[slot as usize].is_some() {
                return Err(Error::InvalidState);
            }
            if s.links[li].channels.is_full() {
                return Err(Error::NoResources);
            }
            let State { links, channels, .. } = s;
            let lk = &mut links[li];
            for (idx, ch) in channels.iter_mut().enumerate() {
                if !ch.in_use {
                    ch.reset();
                    ch.in_use = true;
                    ch.link = Some(link);
                    ch.cid = config::FIRST_FIXED_CID + slot as u16;
                    ch.mode = mode;
                    ch.fixed_slot = Some(slot);
                    let ci = ChannelIndex(idx as u8);
                    let _ = lk.channels.push(ci);
                    lk.fixed[slot as usize] = Some(ci);
                    debug!("[l2cap][cid = {}] fixed channel bound", ch.cid);
                    return Ok(ci);
                }
            }
            Err(Error::NoResources)
        })?;
        self.adjust_chnl_allocation();
        Ok(ci)
    }

    /// Release a channel and reclaim any buffers it holds.
    pub fn release_channel(&self, ch: ChannelIndex) {
        self.with_state(|s| {
            let idx = ch.0 as usize;
            if !s.channels[idx].in_use {
                return;
            }
            let link = s.channels[idx].link;
            let State { links, channels, .. } = s;
            if let Some(link) = link {
                let lk = &mut links[link.0 as usize];
                detach_channel(lk, channels, ch);
                if lk.pending == Some(ch) {
                    lk.pending = None;
                }
            }
            channels[idx].reset();
        });
        self.adjust_chnl_allocation();
    }

    /// Channel id of a channel record.
    pub fn channel_cid(&self, ch: ChannelIndex) -> u16 {
        self.with_state(|s| s.channels[ch.0 as usize].cid)
    }

    /// Look up a channel by its id.
    pub fn find_channel(&self, cid: u16) -> Option<ChannelIndex> {
        self.with_state(|s| {
            s.channels
                .iter()
                .position(|c| c.in_use && c.cid == cid)
                .map(|i| ChannelIndex(i as u8))
        })
    }

    /// Record the channel state reported by the channel state machine.
    pub fn set_channel_state(&self, ch: ChannelIndex, state: ChannelState) {
        self.with_state(|s| s.channels[ch.0 as usize].state = state);
    }

    /// Preserve (or clear) a channel across a link disconnect, to be
    /// retried once the link is reopened.
    pub fn set_pending_channel(&self, link: LinkIndex, pending: Option<ChannelIndex>) {
        self.with_state(|s| s.links[link.0 as usize].pending = pending);
    }

    /// Update a channel's data rates and re-divide the buffer quotas.
    pub fn set_data_rates(&self, ch: ChannelIndex, tx: DataRate, rx: DataRate) {
        self.with_state(|s| {
            let c = &mut s.channels[ch.0 as usize];
            c.tx_data_rate = tx;
            c.rx_data_rate = rx;
        });
        self.adjust_chnl_allocation();
    }

    /// Update the flow-control flags the scheduler consults for non-basic
    /// modes.
    pub fn set_channel_flow(&self, ch: ChannelIndex, wait_ack: bool, remote_busy: bool, window_closed: bool) {
        self.with_state(|s| {
            let c = &mut s.channels[ch.0 as usize];
            c.wait_ack = wait_ack;
            c.remote_busy = remote_busy;
            c.window_closed = window_closed;
        });
    }

    /// Record credits granted by the peer of an LE credit based channel
    /// and resume sending.
    pub fn set_peer_credits(&self, ch: ChannelIndex, credits: u16) {
        let link = self.with_state(|s| {
            let c = &mut s.channels[ch.0 as usize];
            c.peer_credits = credits;
            c.link
        });
        if let Some(link) = link {
            self.check_send_packets(Some(link), 0, None);
        }
    }

    /// Queue a segment for retransmission ahead of new data.
    pub fn push_retransmit(&self, ch: ChannelIndex, packet: P::Packet, len: usize) -> Result<(), Error> {
        self.with_state(|s| {
            let c = &mut s.channels[ch.0 as usize];
            if !c.in_use {
                return Err(Error::ChannelClosed);
            }
            c.retrans_q.push_back(Pdu::new(packet, len)).map_err(|_| Error::OutOfMemory)
        })
    }

    /// Enable or disable the transmit-complete callback for a channel.
    pub fn set_tx_complete(&self, ch: ChannelIndex, enabled: bool) {
        self.with_state(|s| s.channels[ch.0 as usize].tx_complete = enabled);
    }

    /// Issue the token identifying this channel in a future
    /// [`security_complete`](crate::LinkManager::security_complete)
    /// callback.
    pub fn security_token(&self, ch: ChannelIndex) -> SecurityToken {
        self.with_state(|s| {
            let c = &mut s.channels[ch.0 as usize];
            let token = SecurityToken(c.cid);
            c.sec_token = Some(token);
            token
        })
    }

    /// Submit an outbound buffer on a channel. The first
    /// [`ACL_HEADER_LEN`](crate::ACL_HEADER_LEN) bytes must be reserved
    /// for the ACL header.
    pub fn send(&self, ch: ChannelIndex, packet: P::Packet, len: usize) -> Result<(), Error> {
        let (link, congestion) = self.with_state(|s| {
            let c = &mut s.channels[ch.0 as usize];
            if !c.in_use {
                return Err(Error::ChannelClosed);
            }
            let link = c.link.ok_or(Error::Disconnected)?;
            c.xmit_hold_q
                .push_back(Pdu::new(packet, len))
                .map_err(|_| Error::OutOfMemory)?;
            Ok((link, check_channel_congestion(c)))
        })?;
        if let Some((cid, congested)) = congestion {
            self.notify_congestion(cid, congested);
        }
        self.check_send_packets(Some(link), 0, None);
        Ok(())
    }

    /// Re-divide the per-channel buffer quotas from the recorded data
    /// rates, reporting any congestion edges the change causes.
    pub(crate) fn adjust_chnl_allocation(&self) {
        let n = self.with_state(|s| s.channels.len());
        for idx in 0..n {
            let edge = self.with_state(|s| {
                let c = &mut s.channels[idx];
                if !c.in_use {
                    return None;
                }
                c.buff_quota = config::DEFAULT_DATA_RATE_BUFF_QUOTA * (c.tx_data_rate.weight() + c.rx_data_rate.weight());
                debug!("[l2cap][cid = {}] buffer quota = {}", c.cid, c.buff_quota);
                check_channel_congestion(c)
            });
            if let Some((cid, congested)) = edge {
                self.notify_congestion(cid, congested);
            }
        }
    }
}
