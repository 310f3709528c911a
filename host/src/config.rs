//! Compile-time configuration.
//!
//! Timeouts, scheduling quotas and queue capacities used by the link core.
//! Storage pool sizes (number of links and channels) are chosen by the
//! caller through [`LinkResources`](crate::LinkResources); everything else
//! is fixed here.

use embassy_time::Duration;

/// Timeout for a freshly connected link with no channels attached.
pub const LINK_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for an outgoing connection attempt.
pub const LINK_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Extended connection timeout, applied when user interaction (e.g. a pin
/// code entry) is in progress before any channel exists.
pub const LINK_CONNECT_EXT_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for a disconnect issued by the link core to complete.
pub const LINK_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Retry delay after a link was left flow controlled with data still
/// queued and quota available.
pub const LINK_FLOW_CONTROL_TIMEOUT: Duration = Duration::from_secs(2);

/// Idle timeout applied to a dedicated bonding link right after the
/// connection completes.
pub const LINK_BONDING_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay-check timer armed when the security manager asks the channel to
/// wait for an encryption change before acting on a connect request.
pub const DELAY_CHECK_SM4_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout waiting for the peer's information response.
pub const WAIT_INFO_RSP_TIMEOUT: Duration = Duration::from_secs(3);

/// Generic one second retry delay.
pub const RETRY_1S_TIMEOUT: Duration = Duration::from_secs(1);

/// Initial controller-buffer quota granted to each high priority link.
/// Lowered at allocation time if the controller cannot cover it.
pub const HIGH_PRI_MIN_XMIT_QUOTA: u16 = 5;

/// Number of strict channel priority groups per link.
pub const NUM_CHNL_PRIORITY: usize = 3;

/// Per-group service quota for the channel round-robin. Higher priority
/// groups are allowed more consecutive services before rotation.
pub const fn priority_quota(pri: usize) -> u16 {
    ((NUM_CHNL_PRIORITY - pri) * 2) as u16
}

/// Buffer quota granted to a channel per unit of combined tx/rx data rate.
pub const DEFAULT_DATA_RATE_BUFF_QUOTA: u16 = 3;

/// Sentinel LE buffer count reported by controllers that share one buffer
/// pool between BR/EDR and LE.
pub const BLE_BUF_SHARED: u16 = 1;

/// Number of fixed channel slots per link.
pub const NUM_FIXED_CHANNELS: usize = 4;

/// Channel id of fixed slot 0; slot `n` maps to `FIRST_FIXED_CID + n`.
pub const FIRST_FIXED_CID: u16 = 0x0004;

/// First dynamically assigned channel id.
pub const DYN_CID_BASE: u16 = 0x0040;

/// Capacity of the per-link queue of prepared outbound buffers.
pub const LINK_TX_QUEUE_SIZE: usize = 8;

/// Capacity of a channel's transmit hold queue.
pub const CHANNEL_TX_QUEUE_SIZE: usize = 8;

/// Capacity of a channel's retransmission queue (non-basic modes).
pub const RETRANS_QUEUE_SIZE: usize = 4;

/// Maximum number of channels attached to a single link.
pub const CHANNELS_PER_LINK: usize = 8;

/// Number of packets in the default packet pool.
pub const DEFAULT_PACKET_POOL_SIZE: usize = 16;

/// Size of each packet in the default packet pool.
pub const DEFAULT_PACKET_POOL_MTU: usize = 251;
