//! Named, typed sample streams
//!
//! A [`StreamRegistry`] is the discovery layer: the producer side creates one
//! [`StreamOutlet`] per `(name, type)` key, consumers resolve any number of
//! [`StreamInlet`]s by the same key. Every inlet gets its own bounded, ordered
//! queue, so a slow consumer never blocks the producer or another consumer;
//! once its queue is full it loses new samples until it pulls again.
//!
//! ```text
//! DeviceReader ──push──► StreamOutlet ──┬──► StreamInlet (bridge)
//!                                       └──► StreamInlet (recorder, ...)
//! ```
//!
//! Samples travel as whole [`TimestampedSample`] values, a consumer sees
//! either the complete vector with its timestamp or nothing at all.

pub mod channel;

pub use channel::{
    ChannelError, StreamInfo, StreamInlet, StreamOutlet, StreamRegistry, TimestampedSample,
};
