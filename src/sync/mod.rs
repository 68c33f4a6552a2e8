use crate::model::BladeTarget;
use std::io;
use tokio::net::UdpSocket;
use tokio::sync::watch;

pub const WLED_SYNC_PORT: u16 = 21324;

/// WLED notifier packets lead with this discriminant; anything else on the
/// port is some other WLED realtime protocol and is ignored.
pub const NOTIFIER_DISCRIMINANT: u8 = 0;

const MIN_PACKET_LEN: usize = 6;
const MAX_PACKET_LEN: usize = 256;

/// Latest length-valid packet observed on the sync port. `generation`
/// increases by one per published packet; zero means nothing arrived yet.
#[derive(Debug, Clone, Default)]
pub struct SyncFrame {
    pub generation: u64,
    pub payload: Vec<u8>,
}

/// Decode the 6-byte notifier header: byte 2 is the global brightness
/// (0-255, zero meaning off), bytes 3-5 the RGB triple. Brightness and
/// color arrive separately, so no premultiplication recovery applies here.
pub fn decode_packet(payload: &[u8]) -> Option<BladeTarget> {
    if payload.len() < MIN_PACKET_LEN || payload[0] != NOTIFIER_DISCRIMINANT {
        return None;
    }
    let brightness = payload[2];
    Some(BladeTarget {
        power: brightness > 0,
        brightness: (u32::from(brightness) * 100 / 255) as u8,
        color: (payload[3], payload[4], payload[5]),
    })
}

/// One consumer's position in the packet stream. Every saber reads the same
/// shared frame; the cursor guarantees it decodes each generation at most
/// once and never re-applies a quiet tick.
#[derive(Debug, Default)]
pub struct SyncCursor {
    last_seen: u64,
}

impl SyncCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_new(&mut self, frame: &SyncFrame) -> Option<BladeTarget> {
        if frame.generation == 0 || frame.generation == self.last_seen {
            return None;
        }
        self.last_seen = frame.generation;
        decode_packet(&frame.payload)
    }
}

/// Receive loop for the shared sync socket. Each cycle drains every queued
/// datagram, keeps only the most recent length-valid one and publishes it
/// with a fresh generation, so all consumers observe the same latest
/// packet. Lost packets are simply never published; nothing is retried.
pub async fn run_listener(socket: UdpSocket, frames: watch::Sender<SyncFrame>) -> io::Result<()> {
    let mut generation: u64 = 0;
    let mut buf = [0u8; 512];
    loop {
        let (len, _) = socket.recv_from(&mut buf).await?;
        let mut latest = keep_valid(&buf, len);

        loop {
            match socket.try_recv_from(&mut buf) {
                Ok((len, _)) => {
                    if let Some(payload) = keep_valid(&buf, len) {
                        latest = Some(payload);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }

        if let Some(payload) = latest {
            generation += 1;
            tracing::debug!(
                generation,
                len = payload.len(),
                proto = payload[0],
                bri = payload[2],
                "wled packet"
            );
            frames.send_replace(SyncFrame {
                generation,
                payload,
            });
        }
    }
}

fn keep_valid(buf: &[u8], len: usize) -> Option<Vec<u8>> {
    if (MIN_PACKET_LEN..=MAX_PACKET_LEN).contains(&len) {
        Some(buf[..len].to_vec())
    } else {
        None
    }
}
