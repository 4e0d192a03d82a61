// qcommon.rs -- definitions shared by the client and the server protocol code

use bitflags::bitflags;

// ============================================================
// SizeBuf
// ============================================================

/// Fixed-capacity message buffer with a write cursor (`cursize`) and a
/// read cursor (`readcount`). `readcount <= cursize <= maxsize` always holds.
#[derive(Debug, Clone)]
pub struct SizeBuf {
    /// If false, writing past `maxsize` is a programming error and panics.
    pub allow_overflow: bool,
    /// Set when an overflow-tolerant buffer was cleared because it filled up.
    pub overflowed: bool,
    pub data: Vec<u8>,
    pub maxsize: usize,
    pub cursize: usize,
    pub readcount: usize,
}

impl SizeBuf {
    pub fn new(maxsize: usize) -> Self {
        Self {
            allow_overflow: false,
            overflowed: false,
            data: vec![0u8; maxsize],
            maxsize,
            cursize: 0,
            readcount: 0,
        }
    }

    /// Wrap a received datagram for reading.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut sb = Self::new(bytes.len().max(MAX_MSGLEN));
        sb.data[..bytes.len()].copy_from_slice(bytes);
        sb.cursize = bytes.len();
        sb
    }

    pub fn clear(&mut self) {
        self.cursize = 0;
        self.readcount = 0;
        self.overflowed = false;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.cursize]
    }

    pub fn remaining(&self) -> usize {
        self.cursize - self.readcount
    }
}

// ============================================================
// Protocol
// ============================================================

/// Checked by the server on `connect` and by the client on `svc_serverdata`.
pub const PROTOCOL_VERSION: i32 = 1;

pub const PORT_MASTER: u16 = 27900;
pub const PORT_CLIENT: u16 = 27901;
pub const PORT_SERVER: u16 = 27910;

/// Copies of frames kept for delta compression.
pub const UPDATE_BACKUP: usize = 16;
pub const UPDATE_MASK: usize = UPDATE_BACKUP - 1;

/// Maximum datagram payload.
pub const MAX_MSGLEN: usize = 1400;
/// Netchan header: two sequence longs plus the qport short.
pub const PACKET_HEADER: usize = 10;

// ============================================================
// Server-to-client ops
// ============================================================

/// In-band server commands. Numbering follows the classic table; ops this
/// layer does not carry (muzzle flashes, temp entities, layouts, downloads)
/// are left out and decode as unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SvcOps {
    Nop = 6,
    Disconnect = 7,
    Reconnect = 8,
    Sound = 9,
    Print = 10,
    StuffText = 11,
    ServerData = 12,
    ConfigString = 13,
    SpawnBaseline = 14,
    CenterPrint = 15,
    PlayerInfo = 17,
    PacketEntities = 18,
    Frame = 20,
}

impl TryFrom<u8> for SvcOps {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        Ok(match v {
            6 => SvcOps::Nop,
            7 => SvcOps::Disconnect,
            8 => SvcOps::Reconnect,
            9 => SvcOps::Sound,
            10 => SvcOps::Print,
            11 => SvcOps::StuffText,
            12 => SvcOps::ServerData,
            13 => SvcOps::ConfigString,
            14 => SvcOps::SpawnBaseline,
            15 => SvcOps::CenterPrint,
            17 => SvcOps::PlayerInfo,
            18 => SvcOps::PacketEntities,
            20 => SvcOps::Frame,
            other => return Err(other),
        })
    }
}

impl SvcOps {
    pub fn name(self) -> &'static str {
        match self {
            SvcOps::Nop => "svc_nop",
            SvcOps::Disconnect => "svc_disconnect",
            SvcOps::Reconnect => "svc_reconnect",
            SvcOps::Sound => "svc_sound",
            SvcOps::Print => "svc_print",
            SvcOps::StuffText => "svc_stufftext",
            SvcOps::ServerData => "svc_serverdata",
            SvcOps::ConfigString => "svc_configstring",
            SvcOps::SpawnBaseline => "svc_spawnbaseline",
            SvcOps::CenterPrint => "svc_centerprint",
            SvcOps::PlayerInfo => "svc_playerinfo",
            SvcOps::PacketEntities => "svc_packetentities",
            SvcOps::Frame => "svc_frame",
        }
    }
}

// ============================================================
// Client-to-server ops
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClcOps {
    Nop = 1,
    Move = 2,
    UserInfo = 3,
    StringCmd = 4,
}

impl TryFrom<u8> for ClcOps {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, u8> {
        Ok(match v {
            1 => ClcOps::Nop,
            2 => ClcOps::Move,
            3 => ClcOps::UserInfo,
            4 => ClcOps::StringCmd,
            other => return Err(other),
        })
    }
}

// ============================================================
// Print levels
// ============================================================

pub const PRINT_LOW: u8 = 0;
pub const PRINT_MEDIUM: u8 = 1;
pub const PRINT_HIGH: u8 = 2;
pub const PRINT_CHAT: u8 = 3;

// ============================================================
// Delta bitmasks
// ============================================================

bitflags! {
    /// Player state communication flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PlayerStateBits: u16 {
        const M_TYPE = 1 << 0;
        const M_ORIGIN = 1 << 1;
        const M_VELOCITY = 1 << 2;
        const M_TIME = 1 << 3;
        const M_FLAGS = 1 << 4;
        const M_GRAVITY = 1 << 5;
        const M_DELTA_ANGLES = 1 << 6;
        const VIEWOFFSET = 1 << 7;
        const VIEWANGLES = 1 << 8;
        const KICKANGLES = 1 << 9;
        const BLEND = 1 << 10;
        const FOV = 1 << 11;
        const WEAPONINDEX = 1 << 12;
        const WEAPONFRAME = 1 << 13;
        const RDFLAGS = 1 << 14;
    }
}

bitflags! {
    /// User command communication flags. `msec` and `lightlevel` are
    /// always sent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UserCmdBits: u8 {
        const ANGLE1 = 1 << 0;
        const ANGLE2 = 1 << 1;
        const ANGLE3 = 1 << 2;
        const FORWARD = 1 << 3;
        const SIDE = 1 << 4;
        const UP = 1 << 5;
        const BUTTONS = 1 << 6;
        const IMPULSE = 1 << 7;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SoundFlags: u8 {
        const VOLUME = 1 << 0;
        const ATTENUATION = 1 << 1;
        const POS = 1 << 2;
        const ENT = 1 << 3;
        const OFFSET = 1 << 4;
    }
}

pub const DEFAULT_SOUND_PACKET_VOLUME: f32 = 1.0;
pub const DEFAULT_SOUND_PACKET_ATTENUATION: f32 = 1.0;

bitflags! {
    /// Entity state communication flags. The header is sent as one to four
    /// bytes; each `MOREBITS` flag announces the next byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntityBits: u32 {
        // first byte
        const ORIGIN1 = 1 << 0;
        const ORIGIN2 = 1 << 1;
        const ANGLE2 = 1 << 2;
        const ANGLE3 = 1 << 3;
        const FRAME8 = 1 << 4;
        const EVENT = 1 << 5;
        const REMOVE = 1 << 6;
        const MOREBITS1 = 1 << 7;

        // second byte
        const NUMBER16 = 1 << 8;
        const ORIGIN3 = 1 << 9;
        const ANGLE1 = 1 << 10;
        const MODEL = 1 << 11;
        const RENDERFX8 = 1 << 12;
        const EFFECTS8 = 1 << 14;
        const MOREBITS2 = 1 << 15;

        // third byte
        const SKIN8 = 1 << 16;
        const FRAME16 = 1 << 17;
        const RENDERFX16 = 1 << 18;
        const EFFECTS16 = 1 << 19;
        const MODEL2 = 1 << 20;
        const MODEL3 = 1 << 21;
        const MODEL4 = 1 << 22;
        const MOREBITS3 = 1 << 23;

        // fourth byte
        const OLDORIGIN = 1 << 24;
        const SKIN16 = 1 << 25;
        const SOUND = 1 << 26;
        const SOLID = 1 << 27;
    }
}

impl EntityBits {
    /// Field bits only, without the header-chaining and number-size flags.
    pub fn fields(self) -> EntityBits {
        self - (EntityBits::MOREBITS1
            | EntityBits::MOREBITS2
            | EntityBits::MOREBITS3
            | EntityBits::NUMBER16)
    }
}
