//! Default packet pool: a fixed set of MTU-sized buffers shared by the
//! whole host. Buffers are freed when the [`DefaultPacket`] is dropped.

use core::cell::UnsafeCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::{config, Packet, PacketPool};

struct PacketBuf {
    buf: [u8; config::DEFAULT_PACKET_POOL_MTU],
    free: bool,
}

impl PacketBuf {
    const NEW: PacketBuf = PacketBuf {
        buf: [0; config::DEFAULT_PACKET_POOL_MTU],
        free: true,
    };
}

struct PoolState {
    packets: UnsafeCell<[PacketBuf; config::DEFAULT_PACKET_POOL_SIZE]>,
}

// The packets cell is only touched under the pool mutex.
unsafe impl Send for PoolState {}

static POOL: Mutex<CriticalSectionRawMutex, PoolState> = Mutex::new(PoolState {
    packets: UnsafeCell::new([PacketBuf::NEW; config::DEFAULT_PACKET_POOL_SIZE]),
});

fn alloc() -> Option<DefaultPacket> {
    POOL.lock(|state| {
        let packets = unsafe { &mut *state.packets.get() };
        for (idx, packet) in packets.iter_mut().enumerate() {
            if packet.free {
                packet.free = false;
                packet.buf.fill(0);
                return Some(DefaultPacket {
                    idx,
                    buf: &mut packet.buf[..] as *mut [u8],
                });
            }
        }
        None
    })
}

fn free(idx: usize) {
    POOL.lock(|state| {
        let packets = unsafe { &mut *state.packets.get() };
        packets[idx].free = true;
    });
}

/// A buffer allocated from [`DefaultPacketPool`].
pub struct DefaultPacket {
    idx: usize,
    buf: *mut [u8],
}

impl Drop for DefaultPacket {
    fn drop(&mut self) {
        free(self.idx);
    }
}

impl AsRef<[u8]> for DefaultPacket {
    fn as_ref(&self) -> &[u8] {
        unsafe { &(&*self.buf)[..] }
    }
}

impl AsMut<[u8]> for DefaultPacket {
    fn as_mut(&mut self) -> &mut [u8] {
        unsafe { &mut (&mut *self.buf)[..] }
    }
}

impl Packet for DefaultPacket {}

/// The default packet pool.
pub struct DefaultPacketPool;

impl PacketPool for DefaultPacketPool {
    type Packet = DefaultPacket;

    const MTU: usize = config::DEFAULT_PACKET_POOL_MTU;

    fn allocate() -> Option<DefaultPacket> {
        alloc()
    }

    fn capacity() -> usize {
        config::DEFAULT_PACKET_POOL_SIZE
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use super::*;

    #[test]
    fn exhaustion_and_reuse() {
        let mut held = Vec::new();
        for _ in 0..config::DEFAULT_PACKET_POOL_SIZE {
            held.push(DefaultPacketPool::allocate().unwrap());
        }
        assert!(DefaultPacketPool::allocate().is_none());

        held.pop();
        let again = DefaultPacketPool::allocate();
        assert!(again.is_some());
        assert!(DefaultPacketPool::allocate().is_none());

        drop(held);
        drop(again);
        let mut refill = Vec::new();
        for _ in 0..config::DEFAULT_PACKET_POOL_SIZE {
            refill.push(DefaultPacketPool::allocate().unwrap());
        }
    }
}
