//! PCM Bridge Library
//!
//! Low-latency PCM output streams for a host application: either the engine
//! pulls frames through a realtime callback, or the caller pushes frames with
//! blocking writes. Underruns are counted and reported to the producer.

pub mod audio;
pub mod ffi;
