// ABOUTME: Distribution boundary and its UDP implementation
// ABOUTME: Sends finished chunks to registered clients and answers control messages

use crate::audio::{AudioChunk, CodecTag};
use crate::protocol::messages::{
    AudioPacketHeader, ClientHello, Message, ServerHello, StreamFormat,
};
use crate::server::client_manager::{ClientManager, ConnectedClient};
use crate::server::clock::Clock;
use crate::server::config::{AppContext, SourceConfig, StreamCodec};
use crate::server::reactor::{EventSource, Readiness};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::UdpSocket;

/// Largest control datagram accepted
const MAX_CONTROL_DATAGRAM: usize = 2048;

/// Receiver of finished audio and of inbound network readiness
pub trait Distribution {
    /// Take ownership of a finished, codec-tagged chunk
    fn send_audio(&mut self, chunk: AudioChunk);

    /// Handle readable network input
    fn handle_inbound(&mut self);
}

/// UDP intercom: clients announce themselves with `client/hello`
pub struct UdpIntercom {
    socket: UdpSocket,
    clients: ClientManager,
    clock: Arc<dyn Clock>,
    config: Arc<SourceConfig>,
    server_id: String,
    seq: u32,
    recv_buf: Vec<u8>,
    /// Set once the first oversized packet has been reported
    oversize_warned: bool,
}

impl UdpIntercom {
    /// Bind the intercom socket to `ctx.config.bind_addr`
    pub async fn bind(ctx: &AppContext) -> io::Result<Self> {
        let socket = UdpSocket::bind(ctx.config.bind_addr).await?;
        log::info!("Intercom listening on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            clients: ClientManager::new(),
            clock: Arc::clone(&ctx.clock),
            config: Arc::clone(&ctx.config),
            server_id: ctx.server_id.clone(),
            seq: 0,
            recv_buf: vec![0u8; MAX_CONTROL_DATAGRAM],
            oversize_warned: false,
        })
    }

    /// Local address of the intercom socket
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Registered clients
    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    fn stream_format(&self) -> StreamFormat {
        let codec = match self.config.codec {
            StreamCodec::Pcm => CodecTag::RawPcm,
            StreamCodec::Opus => CodecTag::CompressedOpus,
        };
        StreamFormat {
            codec: codec.as_str().to_string(),
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            bit_depth: self.config.frame_size * 8,
            buffer_ms: self.config.buffer_ms,
        }
    }

    fn handle_message(&mut self, msg: Message, from: SocketAddr) {
        match msg {
            Message::ClientHello(ClientHello { client_id, name }) => {
                log::info!("Client hello: {} ({}) from {}", name, client_id, from);
                self.clients.add_client(ConnectedClient {
                    client_id,
                    name,
                    addr: from,
                    last_seen: self.clock.now_micros(),
                });

                let reply = Message::ServerHello(ServerHello {
                    server_id: self.server_id.clone(),
                    stream: self.stream_format(),
                });
                match serde_json::to_vec(&reply) {
                    Ok(json) => {
                        if let Err(e) = self.socket.try_send_to(&json, from) {
                            log::warn!("Failed to send server/hello to {}: {}", from, e);
                        }
                    }
                    Err(e) => log::error!("Failed to serialize server/hello: {}", e),
                }
            }
            Message::ClientGoodbye(goodbye) => {
                log::info!(
                    "Client goodbye: {} ({})",
                    goodbye.client_id,
                    goodbye.reason.as_deref().unwrap_or("no reason")
                );
                self.clients.remove_client(&goodbye.client_id);
            }
            Message::ServerHello(_) => {
                log::warn!("Ignoring server/hello from {}", from);
            }
        }
    }
}

impl Distribution for UdpIntercom {
    fn send_audio(&mut self, chunk: AudioChunk) {
        let header = AudioPacketHeader {
            seq: self.seq,
            play_at: self.clock.now_micros() + self.config.buffer_ms as i64 * 1000,
            codec: chunk.codec,
        };
        self.seq = self.seq.wrapping_add(1);

        let packet = header.encode(&chunk.data);
        if packet.len() > self.config.mtu {
            if self.oversize_warned {
                log::debug!("Audio packet of {} bytes exceeds mtu {}", packet.len(), self.config.mtu);
            } else {
                log::warn!(
                    "Audio packets of {} bytes exceed mtu {} and will be fragmented",
                    packet.len(),
                    self.config.mtu
                );
                self.oversize_warned = true;
            }
        }

        let socket = &self.socket;
        self.clients.for_each(|client| {
            if let Err(e) = socket.try_send_to(&packet, client.addr) {
                log::warn!("Failed to send audio to {}: {}", client.addr, e);
            }
        });
    }

    fn handle_inbound(&mut self) {
        loop {
            let (len, from) = match self.socket.try_recv_from(&mut self.recv_buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("Intercom receive failed: {}", e);
                    break;
                }
            };

            match serde_json::from_slice::<Message>(&self.recv_buf[..len]) {
                Ok(msg) => self.handle_message(msg, from),
                Err(e) => log::warn!("Discarding {} byte datagram from {}: {}", len, from, e),
            }
        }
    }
}

impl EventSource for UdpIntercom {
    async fn readiness(&self) -> io::Result<Readiness> {
        self.socket.ready(Interest::READABLE).await.map(Readiness::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::clock::ManualClock;

    async fn intercom() -> (Arc<ManualClock>, UdpIntercom) {
        let clock = Arc::new(ManualClock::new());
        let config = SourceConfig::new("/tmp/fifo")
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .buffer_ms(500);
        let ctx = AppContext::with_clock(config, clock.clone()).unwrap();
        (clock, UdpIntercom::bind(&ctx).await.unwrap())
    }

    #[tokio::test]
    async fn test_hello_registers_client_and_receives_audio() {
        let (clock, mut intercom) = intercom().await;
        let server_addr = intercom.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let hello = br#"{"type":"client/hello","payload":{"client_id":"k1","name":"Kitchen"}}"#;
        client.send_to(hello, server_addr).await.unwrap();

        intercom.readiness().await.unwrap();
        intercom.handle_inbound();
        assert_eq!(intercom.clients().client_count(), 1);

        let mut buf = [0u8; 2048];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        let reply: Message = serde_json::from_slice(&buf[..len]).unwrap();
        match reply {
            Message::ServerHello(hello) => {
                assert_eq!(hello.stream.codec, "opus");
                assert_eq!(hello.stream.buffer_ms, 500);
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        clock.advance_ms(10);
        intercom.send_audio(AudioChunk::pcm(48000, 2, 2, vec![1, 2, 3, 4]));

        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        let packet = &buf[..len];
        assert_eq!(packet[0], crate::protocol::messages::AUDIO_CHUNK_TYPE);
        assert_eq!(&packet[5..13], &510_000i64.to_be_bytes());
        assert_eq!(packet[13], CodecTag::RawPcm.wire_id());
        assert_eq!(&packet[14..], &[1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_oversized_packets_warn_once() {
        let (_clock, mut intercom) = intercom().await;
        let server_addr = intercom.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(br#"{"type":"client/hello","payload":{"client_id":"k1","name":"K"}}"#, server_addr)
            .await
            .unwrap();
        intercom.readiness().await.unwrap();
        intercom.handle_inbound();

        intercom.send_audio(AudioChunk::pcm(48000, 2, 2, vec![0; 8]));
        assert!(!intercom.oversize_warned);

        // 20ms of 48kHz stereo pcm does not fit a 1500 byte mtu
        for _ in 0..2 {
            intercom.send_audio(AudioChunk::pcm(48000, 2, 2, vec![0; 3840]));
            assert!(intercom.oversize_warned);
        }
        assert_eq!(intercom.seq, 3);
    }

    #[tokio::test]
    async fn test_goodbye_removes_client() {
        let (_clock, mut intercom) = intercom().await;
        let server_addr = intercom.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        client
            .send_to(br#"{"type":"client/hello","payload":{"client_id":"k1","name":"K"}}"#, server_addr)
            .await
            .unwrap();
        intercom.readiness().await.unwrap();
        intercom.handle_inbound();
        assert_eq!(intercom.clients().client_count(), 1);

        client
            .send_to(br#"{"type":"client/goodbye","payload":{"client_id":"k1"}}"#, server_addr)
            .await
            .unwrap();
        intercom.readiness().await.unwrap();
        intercom.handle_inbound();
        assert_eq!(intercom.clients().client_count(), 0);
    }
}
