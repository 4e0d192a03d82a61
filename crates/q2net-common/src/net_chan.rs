// net_chan.rs -- sequenced datagram channel with one reliable message in flight
//
// Packet header:
//   31  sequence (30 bits) | reliable slot << 30 | reliable present << 31
//   31  acknowledged sequence (31 bits) | last reliable slot received << 31
//   16  qport (client to server only)
//
// When the reliable bit is set a 16-bit length and the reliable bytes follow
// the header; unreliable data fills the rest.
//
// The sender keeps a single reliable message in flight and attaches it to
// every packet until the peer acknowledges its slot. Anything queued for
// reliable delivery meanwhile waits in `message`. The receiver delivers a
// reliable payload only when its slot differs from the last one it took, so
// retransmissions are skipped and every reliable message arrives once.
//
// Out-of-band packets start with a sequence of -1 and carry text commands.

use crate::common::{
    msg_begin_reading, msg_read_long, msg_read_short, msg_write_long, msg_write_short,
};
use crate::error::ProtocolError;
use crate::net::{net_send_packet, NetAdr, NetTransport};
use crate::qcommon::{SizeBuf, MAX_MSGLEN};

const SEQUENCE_MASK: u32 = 0x3fff_ffff;
const ACK_MASK: u32 = 0x7fff_ffff;

/// Which end of the connection a channel is; clients send a qport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetSrc {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub struct NetChan {
    pub sock: NetSrc,
    pub remote_address: NetAdr,
    /// Identifies the client when its address changes behind a NAT.
    pub qport: u16,

    pub last_received: i32,
    pub last_sent: i32,

    /// Sequence gap of the last accepted packet.
    pub dropped: i32,
    pub total_dropped: u32,
    /// Stale or duplicated packets rejected.
    pub duplicates: u32,
    /// Retransmitted reliable payloads skipped.
    pub reliable_duplicates: u32,

    pub incoming_sequence: i32,
    pub incoming_acknowledged: i32,
    pub incoming_reliable_acknowledged: u8,
    /// Slot of the last reliable message taken from the peer.
    pub incoming_reliable_sequence: u8,

    pub outgoing_sequence: i32,
    /// Slot of our in-flight reliable message.
    pub reliable_sequence: u8,
    pub last_reliable_sequence: i32,

    /// Staging buffer for reliable data not yet in flight.
    pub message: SizeBuf,
    pub reliable_buf: Vec<u8>,
}

/// Outcome of `netchan_process`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Older than or equal to the newest accepted packet.
    Stale,
    /// Too short to hold its header or reliable block.
    Runt,
    /// The read cursor is at the payload. `new_reliable` is true when a
    /// reliable message not seen before sits at the front of it.
    Accepted { new_reliable: bool },
}

impl ProcessResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ProcessResult::Accepted { .. })
    }
}

impl NetChan {
    pub fn new(sock: NetSrc, adr: NetAdr, qport: u16) -> Self {
        let mut message = SizeBuf::new(MAX_MSGLEN - 16);
        message.allow_overflow = true;
        Self {
            sock,
            remote_address: adr,
            qport,
            last_received: 0,
            last_sent: 0,
            dropped: 0,
            total_dropped: 0,
            duplicates: 0,
            reliable_duplicates: 0,
            incoming_sequence: 0,
            incoming_acknowledged: 0,
            incoming_reliable_acknowledged: 0,
            incoming_reliable_sequence: 0,
            outgoing_sequence: 1,
            reliable_sequence: 0,
            last_reliable_sequence: 0,
            message,
            reliable_buf: Vec::new(),
        }
    }

    pub fn reliable_length(&self) -> usize {
        self.reliable_buf.len()
    }
}

/// Create a fresh channel to `adr`.
pub fn netchan_setup(sock: NetSrc, adr: NetAdr, qport: u16, curtime: i32) -> NetChan {
    let mut chan = NetChan::new(sock, adr, qport);
    chan.last_received = curtime;
    chan
}

/// True when no reliable message is in flight.
pub fn netchan_can_reliable(chan: &NetChan) -> bool {
    chan.reliable_buf.is_empty()
}

/// True if the next transmit will carry a reliable block.
pub fn netchan_need_reliable(chan: &NetChan) -> bool {
    !chan.reliable_buf.is_empty() || chan.message.cursize > 0
}

/// Build the next datagram. Staged reliable data goes in flight when the
/// previous reliable message has been acknowledged; unreliable `data` is
/// appended if it fits and dropped otherwise.
pub fn netchan_transmit(chan: &mut NetChan, data: &[u8], curtime: i32) -> Result<Vec<u8>, ProtocolError> {
    if chan.message.overflowed {
        log::warn!("{}: Outgoing message overflow", chan.remote_address);
        return Err(ProtocolError::Overflow);
    }

    if chan.reliable_buf.is_empty() && chan.message.cursize > 0 {
        chan.reliable_buf = chan.message.as_slice().to_vec();
        chan.message.clear();
        chan.reliable_sequence ^= 1;
    }
    let send_reliable = !chan.reliable_buf.is_empty();

    let mut send = SizeBuf::new(MAX_MSGLEN);

    let w1 = (chan.outgoing_sequence as u32 & SEQUENCE_MASK)
        | ((chan.reliable_sequence as u32) << 30)
        | ((send_reliable as u32) << 31);
    let w2 = (chan.incoming_sequence as u32 & ACK_MASK)
        | ((chan.incoming_reliable_sequence as u32) << 31);

    msg_write_long(&mut send, w1 as i32);
    msg_write_long(&mut send, w2 as i32);

    if chan.sock == NetSrc::Client {
        msg_write_short(&mut send, chan.qport as i32);
    }

    if send_reliable {
        msg_write_short(&mut send, chan.reliable_buf.len() as i32);
        send.write(&chan.reliable_buf);
        chan.last_reliable_sequence = chan.outgoing_sequence;
    }

    if send.has_room(data.len()) {
        send.write(data);
    } else {
        log::debug!("{}: dumped unreliable", chan.remote_address);
    }

    log::trace!(
        "send {:4} : s={} ack={} rack={}{}",
        send.cursize,
        chan.outgoing_sequence,
        chan.incoming_sequence,
        chan.incoming_reliable_sequence,
        if send_reliable { format!(" reliable={}", chan.reliable_sequence) } else { String::new() }
    );

    chan.outgoing_sequence += 1;
    chan.last_sent = curtime;

    Ok(send.as_slice().to_vec())
}

/// Transmit and hand the datagram to `transport`.
pub fn netchan_send(
    chan: &mut NetChan,
    transport: &dyn NetTransport,
    data: &[u8],
    curtime: i32,
) -> Result<(), ProtocolError> {
    let packet = netchan_transmit(chan, data, curtime)?;
    net_send_packet(transport, &packet, &chan.remote_address);
    Ok(())
}

/// Validate and consume the header of a sequenced packet. Rejected packets
/// leave the channel untouched apart from the duplicate counter.
pub fn netchan_process(chan: &mut NetChan, msg: &mut SizeBuf, curtime: i32) -> ProcessResult {
    msg_begin_reading(msg);

    let header = match read_header(chan.sock, msg) {
        Some(h) => h,
        None => {
            log::debug!("{}: runt packet", chan.remote_address);
            return ProcessResult::Runt;
        }
    };

    if header.sequence <= chan.incoming_sequence {
        chan.duplicates += 1;
        log::debug!(
            "{}: out of order packet {} at {}",
            chan.remote_address,
            header.sequence,
            chan.incoming_sequence
        );
        return ProcessResult::Stale;
    }

    let reliable_len = if header.reliable {
        match msg_read_short(msg) {
            Ok(len) if msg.readcount + len as u16 as usize <= msg.cursize => Some(len as u16 as usize),
            _ => {
                log::debug!("{}: reliable block overruns packet", chan.remote_address);
                return ProcessResult::Runt;
            }
        }
    } else {
        None
    };

    chan.dropped = header.sequence - (chan.incoming_sequence + 1);
    if chan.dropped > 0 {
        chan.total_dropped += chan.dropped as u32;
        log::debug!("{}: dropped {} packets at {}", chan.remote_address, chan.dropped, header.sequence);
    }

    // the peer has our in-flight reliable once it reports that slot
    if header.reliable_ack == chan.reliable_sequence {
        chan.reliable_buf.clear();
    }

    chan.incoming_sequence = header.sequence;
    chan.incoming_acknowledged = header.ack;
    chan.incoming_reliable_acknowledged = header.reliable_ack;
    chan.last_received = curtime;

    let mut new_reliable = false;
    if let Some(len) = reliable_len {
        if header.slot != chan.incoming_reliable_sequence {
            chan.incoming_reliable_sequence = header.slot;
            new_reliable = true;
        } else {
            msg.readcount += len;
            chan.reliable_duplicates += 1;
        }
    }

    ProcessResult::Accepted { new_reliable }
}

struct PacketHeader {
    sequence: i32,
    slot: u8,
    reliable: bool,
    ack: i32,
    reliable_ack: u8,
}

fn read_header(sock: NetSrc, msg: &mut SizeBuf) -> Option<PacketHeader> {
    let w1 = msg_read_long(msg).ok()? as u32;
    let w2 = msg_read_long(msg).ok()? as u32;
    if sock == NetSrc::Server {
        // matched against the client record by the caller
        msg_read_short(msg).ok()?;
    }

    Some(PacketHeader {
        sequence: (w1 & SEQUENCE_MASK) as i32,
        slot: ((w1 >> 30) & 1) as u8,
        reliable: w1 >> 31 != 0,
        ack: (w2 & ACK_MASK) as i32,
        reliable_ack: (w2 >> 31) as u8,
    })
}

/// The qport of a client-to-server packet, without consuming anything.
pub fn netchan_peek_qport(data: &[u8]) -> Option<u16> {
    data.get(8..10).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

// ============================================================
// Out of band
// ============================================================

pub fn is_out_of_band(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == [0xff; 4]
}

/// Build an out-of-band packet (sequence -1).
pub fn netchan_out_of_band_data(data: &[u8]) -> Vec<u8> {
    let mut send = SizeBuf::new(MAX_MSGLEN);
    msg_write_long(&mut send, -1);
    if send.has_room(data.len()) {
        send.write(data);
    } else {
        log::warn!("out of band message too long, truncated");
        let room = send.maxsize - send.cursize;
        send.write(&data[..room]);
    }
    send.as_slice().to_vec()
}

pub fn netchan_out_of_band(transport: &dyn NetTransport, adr: &NetAdr, data: &[u8]) {
    net_send_packet(transport, &netchan_out_of_band_data(data), adr);
}

pub fn netchan_out_of_band_print(transport: &dyn NetTransport, adr: &NetAdr, text: &str) {
    netchan_out_of_band(transport, adr, text.as_bytes());
}

// ============================================================
// Tests
// ============================================================
