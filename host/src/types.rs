//! Shared vocabulary of the link core: transports, states and the event
//! and status codes exchanged with collaborators.

use bt_hci::param::Status;

/// Logical transport of an ACL link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Transport {
    /// Classic (BR/EDR) transport.
    BrEdr,
    /// Low Energy transport.
    Le,
}

/// Lifecycle state of a link control block. A slot that is not in use is
/// free regardless of the recorded state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    /// No connection, or slot recycled.
    Disconnected,
    /// Outgoing or incoming connection in progress.
    Connecting,
    /// Outgoing connection parked until a role switch completes.
    ConnectingWaitSwitch,
    /// Controller reported its connection limit; retry when a slot frees.
    ConnectHolding,
    /// ACL link is up.
    Connected,
    /// Disconnect in progress.
    Disconnecting,
}

/// Scheduling priority of a link when controller buffers are divided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AclPriority {
    /// Default priority.
    Normal,
    /// Reserved a fixed transmit quota ahead of normal links.
    High,
}

/// Channel state as far as the link core needs to know it. The full
/// channel state machine lives above this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelState {
    /// Not open; never scheduled.
    Closed,
    /// Originator waiting for the security manager.
    OrigWaitSecComp,
    /// Terminator waiting for the security manager.
    TermWaitSecComp,
    /// Open for data transfer.
    Open,
}

/// Strict priority group of a channel within its link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelPriority {
    /// Served first.
    High = 0,
    /// Default.
    Medium = 1,
    /// Served last.
    Low = 2,
}

impl ChannelPriority {
    /// Index of the priority group this channel belongs to.
    pub fn group(self) -> usize {
        self as usize
    }
}

/// Relative data rate of a channel, used to size its buffer quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataRate {
    /// No traffic expected.
    NoTraffic = 0,
    /// Low rate.
    Low = 1,
    /// Medium rate.
    Medium = 2,
    /// High rate.
    High = 3,
}

impl DataRate {
    pub(crate) fn weight(self) -> u16 {
        self as u16
    }
}

/// Transmit mode of a channel. Non-basic modes add windowing constraints
/// the scheduler has to respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelMode {
    /// Basic L2CAP mode, no flow control.
    Basic,
    /// Enhanced retransmission mode.
    Ertm,
    /// LE credit based flow control.
    LeCredit,
}

/// Event delivered to the channel state machine above this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelEvent {
    /// The link below the channel came up.
    ConnectConfirm,
    /// The link below the channel failed to come up.
    ConnectConfirmNeg(Status),
    /// The link below the channel went away. Carries the HCI reason when
    /// one was reported.
    DisconnectInd(Option<Status>),
    /// Security procedures completed successfully.
    SecComp,
    /// Security procedures failed.
    SecCompNeg,
    /// Peer information exchange finished (possibly synthesised on
    /// timeout); proceed in basic mode.
    InfoResponse(Status),
}

/// Outcome of a request to the security manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecurityStatus {
    /// Completed successfully.
    Success,
    /// Completed; no security was required.
    SuccessNoSecurity,
    /// Command sent to the controller; completion will be signalled.
    CmdStarted,
    /// Command stored; the security manager will finish the operation.
    CmdStored,
    /// Security manager busy with another procedure.
    Busy,
    /// Hold off: wait for an encryption change before proceeding.
    DelayCheck,
    /// Request failed.
    Failed,
}

/// Link power mode as reported by the power manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerMode {
    /// Active.
    Active,
    /// Hold mode.
    Hold,
    /// Sniff mode.
    Sniff,
    /// Park state.
    Park,
    /// A mode transition is in progress.
    Pending,
}

/// Security intent recorded for an LE link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SecurityAction {
    /// No pending security action.
    None,
    /// Encrypt the link.
    Encrypt,
    /// Pair without man-in-the-middle protection.
    EncryptNoMitm,
    /// Pair with man-in-the-middle protection.
    EncryptMitm,
}

/// Opaque token correlating a security-manager callback with the channel
/// that requested the procedure. Issued by
/// [`LinkManager::security_token`](crate::LinkManager::security_token) and
/// compared by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SecurityToken(pub(crate) u16);

/// Bucketed disconnect counters persisted through the device configuration
/// store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisconnectStat {
    /// Total disconnect count for the peer.
    Total,
    /// Disconnects caused by a connection timeout.
    ConnTimeout,
}
