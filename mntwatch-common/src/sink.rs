//! Outbound delivery channel.

use bytemuck::Pod;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Submitted,
    /// The assembler rejected the record; nothing was delivered.
    Filtered,
    /// The channel had no room (backpressure). Not retried.
    Dropped,
}

/// Fixed-size record push towards user space.
///
/// The sink hands out a zeroed record slot; `fill` assembles the event in
/// place and returns whether it should be delivered.
pub trait EventSink<E: Pod> {
    fn deliver<F>(&self, fill: F) -> Delivery
    where
        F: FnOnce(&mut E) -> bool;
}
