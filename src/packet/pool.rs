use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use util::sync::Mutex;

use super::Packet;
use crate::error::{Error, Result};

/// SharedPacket is a packet handed through the pipeline by shared ownership.
/// The slot goes back to its pool when the last clone is dropped.
pub type SharedPacket = Arc<PooledPacket>;

struct PoolSlots {
    free: Mutex<Vec<Box<Packet>>>,
    capacity: usize,
}

impl PoolSlots {
    fn give_back(&self, mut packet: Box<Packet>) {
        packet.reset();
        let mut free = self.free.lock();
        debug_assert!(free.len() < self.capacity, "packet returned to a full pool");
        free.push(packet);
    }
}

/// PooledPacket is a checked-out pool slot. Dropping it returns the slot.
pub struct PooledPacket {
    packet: Option<Box<Packet>>,
    pool: Weak<PoolSlots>,
}

impl PooledPacket {
    /// share converts the exclusive handle into a reference-counted one.
    pub fn share(self) -> SharedPacket {
        Arc::new(self)
    }
}

impl Deref for PooledPacket {
    type Target = Packet;

    fn deref(&self) -> &Packet {
        // only None while dropping
        self.packet.as_deref().expect("pooled packet accessed after release")
    }
}

impl DerefMut for PooledPacket {
    fn deref_mut(&mut self) -> &mut Packet {
        self.packet
            .as_deref_mut()
            .expect("pooled packet accessed after release")
    }
}

impl Drop for PooledPacket {
    fn drop(&mut self) {
        if let Some(packet) = self.packet.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.give_back(packet);
            }
        }
    }
}

impl std::fmt::Debug for PooledPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.packet {
            Some(p) => p.fmt(f),
            None => f.write_str("PooledPacket(released)"),
        }
    }
}

/// PacketPool is a fixed set of pre-allocated packet buffers.
///
/// Slots are allocated once by `create` and recycled for the lifetime of the call; the pool
/// never grows. `acquire` and the release performed by dropping a [`PooledPacket`] are safe to
/// call from the socket thread and the playback task concurrently.
pub struct PacketPool {
    buffer_size: usize,
    slots: Mutex<Option<Arc<PoolSlots>>>,
}

impl PacketPool {
    pub fn new(buffer_size: usize) -> Self {
        PacketPool {
            buffer_size,
            slots: Mutex::new(None),
        }
    }

    /// create allocates `capacity` packets of the pool's buffer size.
    pub fn create(&self, capacity: usize) -> Result<()> {
        let mut slots = self.slots.lock();
        if slots.is_some() {
            return Err(Error::ErrPoolAlreadyCreated);
        }

        let free = (0..capacity)
            .map(|_| Box::new(Packet::new(self.buffer_size)))
            .collect();
        *slots = Some(Arc::new(PoolSlots {
            free: Mutex::new(free),
            capacity,
        }));

        Ok(())
    }

    /// acquire checks out a free packet, or returns None when the pool is exhausted.
    pub fn acquire(&self) -> Option<PooledPacket> {
        let slots = self.slots.lock();
        let pool = slots.as_ref()?;
        let packet = pool.free.lock().pop()?;
        Some(PooledPacket {
            packet: Some(packet),
            pool: Arc::downgrade(pool),
        })
    }

    /// count returns the number of free slots.
    pub fn count(&self) -> usize {
        let slots = self.slots.lock();
        slots.as_ref().map(|p| p.free.lock().len()).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        let slots = self.slots.lock();
        slots.as_ref().map(|p| p.capacity).unwrap_or(0)
    }

    /// outstanding returns the number of packets currently checked out.
    pub fn outstanding(&self) -> usize {
        let slots = self.slots.lock();
        slots
            .as_ref()
            .map(|p| p.capacity - p.free.lock().len())
            .unwrap_or(0)
    }

    pub fn is_created(&self) -> bool {
        self.slots.lock().is_some()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// destroy releases every slot. All packets must have been returned first; any that are
    /// still out are freed when dropped instead of being recycled.
    pub fn destroy(&self) -> Result<()> {
        let pool = self.slots.lock().take().ok_or(Error::ErrPoolNotCreated)?;
        let outstanding = pool.capacity - pool.free.lock().len();
        if outstanding != 0 {
            log::error!(
                "packet pool destroyed with {} of {} packets outstanding",
                outstanding,
                pool.capacity
            );
            return Err(Error::ErrPoolPacketsOutstanding(outstanding));
        }
        Ok(())
    }
}

impl Drop for PacketPool {
    fn drop(&mut self) {
        if let Some(pool) = self.slots.lock().as_ref() {
            let outstanding = pool.capacity - pool.free.lock().len();
            if outstanding != 0 {
                log::error!("packet pool dropped with {} packets outstanding", outstanding);
            }
        }
    }
}
