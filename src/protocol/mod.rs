// ABOUTME: Protocol module for the snapsource intercom
// ABOUTME: JSON control messages and the binary audio packet layout

/// Control message and audio packet definitions
pub mod messages;

pub use messages::{AudioPacketHeader, Message, AUDIO_PACKET_HEADER_LEN};
