/*! A sans-I/O implementation of the Micro Transport Protocol (µTP): a
reliable, ordered, congestion-controlled byte stream carried over UDP.

Follows the same split as the teacher this crate grew out of: [`wire`] is
the packet codec, [`storage`] is the buffering layer (reorder queue and
in-flight window), [`socket`] is the single-stream state machine, and
[`iface`] is the socket manager that demultiplexes a shared UDP socket
across every open stream and drives their timers. Nothing in this crate
touches a real socket or a real clock directly — an embedder supplies both
through the [`iface::UdpSocket`] and [`time::Clock`] traits, so the whole
transport can be driven deterministically in tests.
*/

pub mod config;
pub mod error;
pub mod iface;
pub mod socket;
pub mod stats;
pub mod storage;
pub mod time;
pub mod wire;

pub use config::Config;
pub use error::{BufferFull, Error};
pub use iface::{ConnectionId, Manager, Notification, UdpSocket};
pub use socket::{CloseMode, CloseReason, Connection, ConnectionEvent, OutboundPacket};
pub use stats::Counters;
pub use time::{Clock, Duration, Instant, VirtualClock};
