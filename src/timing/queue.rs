//! SPSC packet queue between the CS controller task and the Timing Engine ISR.
//!
//! The Timing Engine only ever pops (from interrupt context, non-blocking); the controller
//! task only ever pushes. [`heapless::spsc::Queue`] already gives a single wait-free pop/push
//! pair with no locking, which is exactly the shape §4.C and §3's Data Model ask for.
use heapless::spsc::{Consumer, Producer, Queue};

use crate::CS_PACKET_QUEUE_DEPTH;
use crate::codec::Packet;

/// A host-loaded custom packet slot (`command_station_load_packet` / `_repeat` / `_clear`).
///
/// Distinct from the normal controller-generated traffic: a custom packet is transmitted
/// `count` times (or forever, if `count == 0`) before the slot empties itself, independent of
/// whatever the CS controller's own test-loop mode is doing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CustomPacket {
    pub packet: Option<Packet>,
    /// Remaining repeat count; `None` means repeat indefinitely until cleared.
    pub remaining: Option<u32>,
    /// Minimum delay, in milliseconds, the controller should hold between repeats of this
    /// packet (coarser-grained than the ISR; enforced by the task that feeds the queue, not
    /// by the Timing Engine itself).
    pub delay_ms: u16,
}

impl CustomPacket {
    pub const fn empty() -> Self {
        CustomPacket {
            packet: None,
            remaining: None,
            delay_ms: 0,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.packet.is_some()
    }

    /// Consume one repeat. Returns the packet to transmit, clearing the slot once a finite
    /// `remaining` count reaches zero.
    pub fn take_one(&mut self) -> Option<Packet> {
        let packet = self.packet.clone()?;
        match self.remaining {
            Some(0) => {
                self.packet = None;
                return None;
            }
            Some(n) => {
                self.remaining = Some(n - 1);
                if n - 1 == 0 {
                    self.packet = None;
                }
            }
            None => {}
        }
        Some(packet)
    }
}

/// Owns the backing storage for the CS packet queue; split into a [`Producer`]/[`Consumer`]
/// pair, handed one each to the controller task and the ISR driver respectively.
pub struct PacketQueue {
    queue: Queue<Packet, CS_PACKET_QUEUE_DEPTH>,
}

impl PacketQueue {
    pub const fn new() -> Self {
        PacketQueue {
            queue: Queue::new(),
        }
    }

    pub fn split(&mut self) -> (Producer<'_, Packet, CS_PACKET_QUEUE_DEPTH>, Consumer<'_, Packet, CS_PACKET_QUEUE_DEPTH>) {
        self.queue.split()
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}
