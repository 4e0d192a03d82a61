// server.rs -- core server types and constants

use q2net_common::cmodel::CollisionModel;
use q2net_common::cvar::CvarContext;
use q2net_common::net::{NetAdr, NetTransport};
use q2net_common::net_chan::{NetChan, NetSrc};
use q2net_common::q_shared::*;
use q2net_common::qcommon::*;

// ============================================================
// Constants
// ============================================================

pub const LATENCY_COUNTS: usize = 16;

pub const MAX_CHALLENGES: usize = 1024;

/// String commands executed per client packet; the rest are ignored.
pub const MAX_STRINGCMDS: usize = 8;

/// Player bounding box.
pub const PLAYER_MINS: Vec3 = [-16.0, -16.0, -24.0];
pub const PLAYER_MAXS: Vec3 = [16.0, 16.0, 32.0];

/// Model index sent for player entities.
pub const PLAYER_MODEL: i32 = 255;

// ============================================================
// Server state
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerState {
    #[default]
    Dead,    // no map loaded
    Loading, // spawning level entities
    Game,    // actively running
}

/// Connection state of a client slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ClientState {
    #[default]
    Free,      // can be reused for a new connection
    Zombie,    // client has been disconnected, but don't reuse for a couple seconds
    Connected, // has been assigned a slot, but not in game yet
    Spawned,   // client is fully in game
}

// ============================================================
// Edicts
// ============================================================

/// One slot of the world entity table. Slots 1..=maxclients belong to
/// the players.
#[derive(Debug, Clone, Copy, Default)]
pub struct Edict {
    pub inuse: bool,
    pub s: EntityState,
}

/// Per-level state, rebuilt by every map change.
pub struct Server {
    pub state: ServerState,

    pub attractloop: bool,

    /// Time of the next game frame.
    pub time: i32,
    pub framenum: i32,

    pub name: String, // map name

    pub configstrings: Vec<String>,
    pub baselines: Vec<EntityState>,
    pub edicts: Vec<Edict>,
    /// Where players appear when they begin.
    pub spawn_origin: Vec3,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            state: ServerState::Dead,
            attractloop: false,
            time: 0,
            framenum: 0,
            name: String::new(),
            configstrings: vec![String::new(); MAX_CONFIGSTRINGS],
            baselines: (0..MAX_EDICTS as i32).map(EntityState::with_number).collect(),
            edicts: vec![Edict::default(); MAX_EDICTS],
            spawn_origin: [0.0, 0.0, 24.125],
        }
    }
}

// ============================================================
// ClientFrame -- what one client was sent in one server frame
// ============================================================

#[derive(Debug, Clone, Default)]
pub struct ClientFrame {
    pub areabits: Vec<u8>,
    pub ps: PlayerState,
    /// Visible entities in ascending number order.
    pub entities: Vec<EntityState>,
    pub senttime: i32, // for ping calculations
}

// ============================================================
// Client -- per-client server data
// ============================================================

pub struct Client {
    pub state: ClientState,

    pub userinfo: String,

    pub lastframe: i32,   // for delta compression
    pub lastcmd: UserCmd, // for filling in big drops

    pub frame_latency: [i32; LATENCY_COUNTS],
    pub ping: i32,

    pub rate: i32,
    pub surpress_count: i32,

    pub edict_index: i32,
    pub name: String,
    pub messagelevel: u8,

    /// Player state produced by running this client's commands.
    pub ps: PlayerState,

    // The datagram is written to by sound calls, prints, etc.
    // It can be harmlessly overflowed.
    pub datagram: SizeBuf,

    pub frames: Vec<ClientFrame>, // [UPDATE_BACKUP]

    pub lastmessage: i32, // svs.realtime when packet was last received
    pub lastconnect: i32,

    pub challenge: i32,

    pub netchan: NetChan,
}

// A client can leave the server in one of four ways:
// - dropping properly by quitting or disconnecting
// - timing out if no valid messages are received for timeout.value seconds
// - getting kicked off by the server operator
// - a protocol error, like an overflowed reliable buffer

impl Default for Client {
    fn default() -> Self {
        let mut datagram = SizeBuf::new(MAX_MSGLEN);
        datagram.allow_overflow = true;
        Self {
            state: ClientState::Free,
            userinfo: String::new(),
            lastframe: -1,
            lastcmd: UserCmd::default(),
            frame_latency: [0; LATENCY_COUNTS],
            ping: 0,
            rate: 0,
            surpress_count: 0,
            edict_index: 0,
            name: String::new(),
            messagelevel: 0,
            ps: PlayerState::default(),
            datagram,
            frames: vec![ClientFrame::default(); UPDATE_BACKUP],
            lastmessage: 0,
            lastconnect: 0,
            challenge: 0,
            netchan: NetChan::new(NetSrc::Server, NetAdr::Loopback(0), 0),
        }
    }
}

// ============================================================
// Challenge
// ============================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct Challenge {
    pub adr: Option<NetAdr>,
    pub challenge: i32,
    pub time: i32,
}

// ============================================================
// ServerStatic -- persistent across level changes
// ============================================================

pub struct ServerStatic {
    pub initialized: bool,
    pub realtime: i32, // always increasing, no clamping, etc

    /// Incremented each level start; used to check late spawns.
    pub spawncount: i32,

    pub clients: Vec<Client>, // [maxclients]

    pub challenges: Vec<Challenge>, // [MAX_CHALLENGES] -- to prevent invalid IPs from connecting
}

impl Default for ServerStatic {
    fn default() -> Self {
        Self {
            initialized: false,
            realtime: 0,
            spawncount: 0,
            clients: Vec::new(),
            challenges: vec![Challenge::default(); MAX_CHALLENGES],
        }
    }
}

// ============================================================
// ServerContext -- everything a running server owns
// ============================================================

pub struct ServerContext {
    pub sv: Server,
    pub svs: ServerStatic,

    pub cvars: CvarContext,
    pub maxclients: usize,

    pub transport: Box<dyn NetTransport>,
    pub world: Box<dyn CollisionModel + Send>,
}

impl ServerContext {
    pub fn client(&self, index: usize) -> Option<&Client> {
        self.svs.clients.get(index)
    }

    /// Slot indices of every client in at least `state`.
    pub fn clients_in(&self, state: ClientState) -> Vec<usize> {
        self.svs
            .clients
            .iter()
            .enumerate()
            .filter(|(_, cl)| cl.state >= state)
            .map(|(i, _)| i)
            .collect()
    }

    /// Frame length in milliseconds from `sv_fps`.
    pub fn frametime(&self) -> i32 {
        let fps = (self.cvars.variable_value("sv_fps") as i32).clamp(1, 1000);
        1000 / fps
    }

    pub fn edict(&self, number: i32) -> Option<&Edict> {
        self.sv.edicts.get(usize::try_from(number).ok()?)
    }

    pub fn edict_mut(&mut self, number: i32) -> Option<&mut Edict> {
        self.sv.edicts.get_mut(usize::try_from(number).ok()?)
    }
}
