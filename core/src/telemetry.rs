//! Typed state datagrams and the UDP telemetry link.
//!
//! The estimator publishes its state to a ground station (and accepts scalar
//! parameter writes back) as fixed-layout binary datagrams:
//!
//! ```text
//! bytes 0..8    timestamp, microseconds, u64 little endian
//! bytes 8..12   packet kind tag, u32 little endian
//! bytes 12..    fixed-size payload for that kind
//! ```
//!
//! Datagrams are connectionless and unordered; the receiver discards any
//! record whose timestamp is older than the last accepted one, so a late
//! packet can never roll state backwards on the display or in a consumer.
//! A socket error marks the link not ready rather than tearing down the
//! estimator; the owner may rebuild the link and carry on.

use std::error::Error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use log::warn;
use nalgebra::Vector3;

/// A telemetry datagram that could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryError {
    /// Datagram shorter than its kind requires.
    ShortDatagram,
    /// Unrecognized kind tag.
    UnknownKind(u32),
}

impl fmt::Display for TelemetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryError::ShortDatagram => write!(f, "datagram too short"),
            TelemetryError::UnknownKind(kind) => write!(f, "unknown packet kind {kind}"),
        }
    }
}

impl Error for TelemetryError {}

const KIND_ATTITUDE: u32 = 1;
const KIND_POSITION: u32 = 2;
const KIND_VELOCITY: u32 = 3;
const KIND_RATES: u32 = 4;
const KIND_PARAMETER: u32 = 5;

const HEADER_LEN: usize = 12;

/// One telemetry record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Packet {
    /// Euler attitude (roll, pitch, yaw), radians.
    Attitude(Vector3<f64>),
    /// NED position, meters.
    Position(Vector3<f64>),
    /// NED velocity, m/s.
    Velocity(Vector3<f64>),
    /// Body rates (p, q, r), rad/s.
    Rates(Vector3<f64>),
    /// A scalar parameter write, ground station to vehicle.
    Parameter { id: u32, value: f64 },
}

impl Packet {
    fn kind(&self) -> u32 {
        match self {
            Packet::Attitude(_) => KIND_ATTITUDE,
            Packet::Position(_) => KIND_POSITION,
            Packet::Velocity(_) => KIND_VELOCITY,
            Packet::Rates(_) => KIND_RATES,
            Packet::Parameter { .. } => KIND_PARAMETER,
        }
    }
}

fn put_vector(buf: &mut Vec<u8>, v: &Vector3<f64>) {
    for i in 0..3 {
        buf.extend_from_slice(&v[i].to_le_bytes());
    }
}

fn get_f64(buf: &[u8], offset: usize) -> Result<f64, TelemetryError> {
    let bytes = buf
        .get(offset..offset + 8)
        .ok_or(TelemetryError::ShortDatagram)?;
    Ok(f64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
}

fn get_vector(buf: &[u8], offset: usize) -> Result<Vector3<f64>, TelemetryError> {
    Ok(Vector3::new(
        get_f64(buf, offset)?,
        get_f64(buf, offset + 8)?,
        get_f64(buf, offset + 16)?,
    ))
}

/// Serialize a packet with its timestamp in microseconds.
pub fn encode(timestamp_micros: u64, packet: &Packet) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + 24);
    buf.extend_from_slice(&timestamp_micros.to_le_bytes());
    buf.extend_from_slice(&packet.kind().to_le_bytes());

    match packet {
        Packet::Attitude(v) | Packet::Position(v) | Packet::Velocity(v) | Packet::Rates(v) => {
            put_vector(&mut buf, v);
        }
        Packet::Parameter { id, value } => {
            buf.extend_from_slice(&id.to_le_bytes());
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }
    buf
}

/// Deserialize a datagram into its timestamp and packet.
pub fn decode(buf: &[u8]) -> Result<(u64, Packet), TelemetryError> {
    if buf.len() < HEADER_LEN {
        return Err(TelemetryError::ShortDatagram);
    }
    let timestamp = u64::from_le_bytes(buf[0..8].try_into().expect("8-byte slice"));
    let kind = u32::from_le_bytes(buf[8..12].try_into().expect("4-byte slice"));

    let packet = match kind {
        KIND_ATTITUDE => Packet::Attitude(get_vector(buf, HEADER_LEN)?),
        KIND_POSITION => Packet::Position(get_vector(buf, HEADER_LEN)?),
        KIND_VELOCITY => Packet::Velocity(get_vector(buf, HEADER_LEN)?),
        KIND_RATES => Packet::Rates(get_vector(buf, HEADER_LEN)?),
        KIND_PARAMETER => {
            let id_bytes = buf
                .get(HEADER_LEN..HEADER_LEN + 4)
                .ok_or(TelemetryError::ShortDatagram)?;
            Packet::Parameter {
                id: u32::from_le_bytes(id_bytes.try_into().expect("4-byte slice")),
                value: get_f64(buf, HEADER_LEN + 4)?,
            }
        }
        other => return Err(TelemetryError::UnknownKind(other)),
    };

    Ok((timestamp, packet))
}

/// Non-blocking UDP state link with stale-record discard.
pub struct StateLink {
    socket: UdpSocket,
    peer: SocketAddr,
    ready: bool,
    last_accepted_micros: u64,
}

impl StateLink {
    /// Bind a local socket and aim it at a peer. The socket is non-blocking;
    /// `receive` returns `Ok(None)` when nothing is pending.
    pub fn bind<A: ToSocketAddrs, B: ToSocketAddrs>(local: A, peer: B) -> io::Result<Self> {
        let socket = UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;
        let peer = peer
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no peer address"))?;

        Ok(StateLink {
            socket,
            peer,
            ready: true,
            last_accepted_micros: 0,
        })
    }

    /// Whether the last transport operation succeeded.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Forget transport failures and stale-discard history, e.g. after the
    /// peer was restarted.
    pub fn reset(&mut self) {
        self.ready = true;
        self.last_accepted_micros = 0;
    }

    /// Send one timestamped packet to the peer.
    pub fn send(&mut self, timestamp_micros: u64, packet: &Packet) -> io::Result<()> {
        let buf = encode(timestamp_micros, packet);
        match self.socket.send_to(&buf, self.peer) {
            Ok(_) => {
                self.ready = true;
                Ok(())
            }
            Err(e) => {
                self.ready = false;
                Err(e)
            }
        }
    }

    /// Receive the next fresh packet, if one is pending.
    ///
    /// Undecodable datagrams and records older than the last accepted one
    /// are dropped; both return `Ok(None)` so the caller just polls again.
    pub fn receive(&mut self) -> io::Result<Option<(u64, Packet)>> {
        let mut buf = [0u8; 512];
        let len = match self.socket.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => {
                self.ready = false;
                return Err(e);
            }
        };
        self.ready = true;

        match decode(&buf[..len]) {
            Ok((timestamp, packet)) => {
                if timestamp < self.last_accepted_micros {
                    return Ok(None);
                }
                self.last_accepted_micros = timestamp;
                Ok(Some((timestamp, packet)))
            }
            Err(e) => {
                warn!("dropping undecodable telemetry datagram: {e}");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn attitude_round_trip() {
        let sent = Packet::Attitude(Vector3::new(0.1, -0.2, 3.0));
        let (timestamp, received) = decode(&encode(123_456, &sent)).unwrap();
        assert_eq!(timestamp, 123_456);
        assert_eq!(received, sent);
    }

    #[test]
    fn parameter_round_trip() {
        let sent = Packet::Parameter {
            id: 7,
            value: -0.25,
        };
        let (_, received) = decode(&encode(1, &sent)).unwrap();
        assert_eq!(received, sent);
    }

    #[test]
    fn short_datagram_is_rejected() {
        assert_eq!(decode(&[0u8; 5]).unwrap_err(), TelemetryError::ShortDatagram);

        // valid header, truncated payload
        let mut buf = encode(9, &Packet::Rates(Vector3::zeros()));
        buf.truncate(HEADER_LEN + 10);
        assert_eq!(decode(&buf).unwrap_err(), TelemetryError::ShortDatagram);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut buf = encode(9, &Packet::Position(Vector3::zeros()));
        buf[8] = 0xFF;
        assert_eq!(decode(&buf).unwrap_err(), TelemetryError::UnknownKind(0xFF));
    }

    #[test]
    fn link_round_trip_and_stale_discard() {
        let mut receiver = StateLink::bind("127.0.0.1:0", "127.0.0.1:9").unwrap();
        let receiver_addr = receiver.socket.local_addr().unwrap();
        let mut sender = StateLink::bind("127.0.0.1:0", receiver_addr).unwrap();

        let fresh = Packet::Position(Vector3::new(1.0, 2.0, -3.0));
        sender.send(1_000, &fresh).unwrap();

        let (timestamp, packet) = poll_until(&mut receiver).expect("fresh packet");
        assert_eq!(timestamp, 1_000);
        match packet {
            Packet::Position(v) => assert_approx_eq!(v[2], -3.0, 1e-12),
            other => panic!("unexpected packet {other:?}"),
        }

        // a record older than the last accepted one is silently dropped
        sender.send(500, &fresh).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(receiver.receive().unwrap().is_none());
        assert!(receiver.is_ready());
    }

    fn poll_until(link: &mut StateLink) -> Option<(u64, Packet)> {
        for _ in 0..100 {
            if let Some(result) = link.receive().unwrap() {
                return Some(result);
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        None
    }
}
