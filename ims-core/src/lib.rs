#![warn(rust_2018_idioms)]
#![allow(dead_code)]

//! Per-session media pipeline engine for an IMS real-time stack.
//!
//! A [`session::Session`] owns three [`graph::StreamGraph`]s (RTP send,
//! RTP receive, RTCP), each a chain of [`node::Node`]s driven by a
//! cooperative [`graph::scheduler::StreamScheduler`] plus per-node pacing
//! threads. Wire codecs live in the `rtp` and `rtcp` crates; this crate
//! provides the nodes, jitter buffers, quality analyzer and session
//! control around them.

pub mod config;
pub mod device;
pub mod event;
pub mod graph;
pub mod jitter;
pub mod node;
pub mod quality;
pub mod session;
pub mod stats;
pub mod utils;

pub use config::{AudioConfig, MediaConfig, MediaQualityThreshold, MediaType, TextConfig, VideoConfig};
pub use event::{SessionCallback, SessionEvent, SessionState, StreamState};
pub use session::{MediaManager, Session, SessionCommand};
