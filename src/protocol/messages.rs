// ABOUTME: Intercom message type definitions and serialization
// ABOUTME: client/hello, client/goodbye, server/hello and the audio packet header

use crate::audio::CodecTag;
use serde::{Deserialize, Serialize};

/// Audio packet type byte
pub const AUDIO_CHUNK_TYPE: u8 = 0x04;

/// Bytes preceding the payload in every audio packet:
/// `[type u8][seq u32 BE][play_at i64 BE][codec u8]`
pub const AUDIO_PACKET_HEADER_LEN: usize = 1 + 4 + 8 + 1;

/// Top-level control message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    /// Client hello handshake message
    #[serde(rename = "client/hello")]
    ClientHello(ClientHello),

    /// Server hello handshake response
    #[serde(rename = "server/hello")]
    ServerHello(ServerHello),

    /// Client goodbye message
    #[serde(rename = "client/goodbye")]
    ClientGoodbye(ClientGoodbye),
}

/// Client hello message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientHello {
    /// Unique client identifier
    pub client_id: String,
    /// Human-readable client name
    pub name: String,
}

/// Server hello message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerHello {
    /// Unique server identifier
    pub server_id: String,
    /// Format of the audio packets that will follow
    pub stream: StreamFormat,
}

/// Audio format announced to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFormat {
    /// Audio codec name ("pcm" or "opus")
    pub codec: String,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of audio channels
    pub channels: u16,
    /// Bit depth per sample
    pub bit_depth: u16,
    /// Play-ahead buffer in milliseconds
    pub buffer_ms: u64,
}

/// Client goodbye message (client -> server)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientGoodbye {
    /// Client leaving
    pub client_id: String,
    /// Reason for disconnect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Header of a binary audio packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioPacketHeader {
    /// Packet sequence number
    pub seq: u32,
    /// Server time (microseconds) at which clients play this chunk
    pub play_at: i64,
    /// Payload codec
    pub codec: CodecTag,
}

impl AudioPacketHeader {
    /// Build a packet: header followed by `payload`
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(AUDIO_PACKET_HEADER_LEN + payload.len());
        packet.push(AUDIO_CHUNK_TYPE);
        packet.extend_from_slice(&self.seq.to_be_bytes());
        packet.extend_from_slice(&self.play_at.to_be_bytes());
        packet.push(self.codec.wire_id());
        packet.extend_from_slice(payload);
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_hello_wire_format() {
        let json = r#"{"type":"client/hello","payload":{"client_id":"abc","name":"Kitchen"}}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            Message::ClientHello(ClientHello {
                client_id: "abc".to_string(),
                name: "Kitchen".to_string(),
            })
        );
    }

    #[test]
    fn test_goodbye_reason_optional() {
        let json = r#"{"type":"client/goodbye","payload":{"client_id":"abc"}}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, Message::ClientGoodbye(ClientGoodbye { reason: None, .. })));
    }

    #[test]
    fn test_audio_packet_layout() {
        let header = AudioPacketHeader {
            seq: 7,
            play_at: 1_000_000,
            codec: CodecTag::CompressedOpus,
        };
        let packet = header.encode(&[0xAA, 0xBB]);

        assert_eq!(packet.len(), AUDIO_PACKET_HEADER_LEN + 2);
        assert_eq!(packet[0], AUDIO_CHUNK_TYPE);
        assert_eq!(&packet[1..5], &7u32.to_be_bytes());
        assert_eq!(&packet[5..13], &1_000_000i64.to_be_bytes());
        assert_eq!(packet[13], 1);
        assert_eq!(&packet[14..], &[0xAA, 0xBB]);
    }
}
