//! Host-side OSC control and scheduling core for driving an external
//! real-time audio synthesis engine over the network.
//!
//! This crate covers the wire codec, transport, timed bundling, ID
//! allocation, and server handshake a control-language runtime needs to
//! talk to an engine like SuperCollider's `scsynth`. It does not cover the
//! engine itself, DSP, MIDI, a GUI, or file I/O — those are external
//! collaborators that sit on top of this crate's `Server`.

pub mod bundler;
pub mod config;
pub mod error;
pub mod idalloc;
pub mod osc;
pub mod peers;
pub mod replyqueue;
pub mod server;
pub mod timedqueue;
pub mod transport;

pub use bundler::{current_bundler, BundleSink, Bundler, BundlerScope};
pub use config::Config;
pub use error::{OscError, Result};
pub use idalloc::IdAllocator;
pub use osc::{OscArg, OscBundle, OscElement, OscMessage, OscPacket, OscTimeTag};
pub use peers::PeerRegistry;
pub use replyqueue::ReplyQueue;
pub use server::Server;
pub use timedqueue::{TimedQueue, TimedTask};
pub use transport::Transport;
