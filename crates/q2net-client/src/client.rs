// client.rs -- client connection and level state

use q2net_common::cmd::CmdArgs;
use q2net_common::delta::SoundPacket;
use q2net_common::error::DropReason;
use q2net_common::net::NetAdr;
use q2net_common::net_chan::NetChan;
use q2net_common::q_shared::*;
use q2net_common::qcommon::UPDATE_BACKUP;

/// Commands kept for prediction and resending. Must be a power of two.
pub const CMD_BACKUP: usize = 64;
pub const CMD_MASK: usize = CMD_BACKUP - 1;

/// Entity states kept for delta reference by recent frames. Must be a power
/// of two.
pub const MAX_PARSE_ENTITIES: usize = 1024;

/// Larger corrections than this are teleports and are not smoothed.
pub const MAX_PREDICTION_ERROR: f32 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ConnState {
    #[default]
    Disconnected,
    /// Waiting for a challenge number.
    Challenging,
    /// Sent `connect`, waiting for `client_connect`.
    Connecting,
    /// Netchan up, receiving level data.
    Connected,
    /// Receiving frames.
    Active,
}

impl ConnState {
    pub fn name(self) -> &'static str {
        match self {
            ConnState::Disconnected => "disconnected",
            ConnState::Challenging => "challenging",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Active => "active",
        }
    }
}

/// One server snapshot.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    /// False if it was delta compressed from a frame we no longer have.
    pub valid: bool,
    pub serverframe: i32,
    pub deltaframe: i32,
    pub areabits: Vec<u8>,
    pub playerstate: PlayerState,
    pub num_entities: usize,
    /// Position of the first entity in the parse ring (not masked).
    pub parse_entities: usize,
}

/// What the client does with a line of `svc_stufftext`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StuffCommand {
    /// Level data is complete; answer with `begin <servercount>`.
    Precache(Option<i32>),
    /// The server is changing levels.
    Changing,
    Reconnect,
    /// `cmd ...`: sent back to the server as a string command.
    ForwardToServer(String),
    Other(String),
}

impl StuffCommand {
    pub fn parse(cmd: &CmdArgs) -> Self {
        match cmd.argv(0) {
            "precache" => StuffCommand::Precache(cmd.argv(1).parse().ok()),
            "changing" => StuffCommand::Changing,
            "reconnect" => StuffCommand::Reconnect,
            "cmd" => StuffCommand::ForwardToServer(cmd.args().to_string()),
            _ => {
                let mut line = cmd.argv(0).to_string();
                if !cmd.args().is_empty() {
                    line.push(' ');
                    line.push_str(cmd.args());
                }
                StuffCommand::Other(line)
            }
        }
    }
}

/// Things the application layer sees happen.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The server accepted the connection.
    Connected,
    /// The first valid frame arrived.
    Active,
    Disconnected(DropReason),
    /// The server refused the connection; the text is the server's.
    Rejected(String),
    Print { level: u8, text: String },
    CenterPrint(String),
    /// Reply to an `info` query.
    ServerInfo(String),
    Stuff(StuffCommand),
    Sound(SoundPacket),
    ConfigString { index: usize, value: String },
}

// ============================================================
// Entities
// ============================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct ClientEntity {
    pub baseline: EntityState,
    /// State in the latest valid frame that contained the entity.
    pub current: EntityState,
    pub prev: EntityState,
    pub serverframe: i32,
}

pub struct ClientEntities {
    pub entities: Vec<ClientEntity>,
    parse_entities: Vec<EntityState>,
    /// Total states ever parsed; indexes the ring modulo its size.
    pub parse_count: usize,
    latest_serverframe: Option<i32>,
}

impl ClientEntities {
    pub fn new() -> Self {
        Self {
            entities: vec![ClientEntity::default(); MAX_EDICTS],
            parse_entities: vec![EntityState::default(); MAX_PARSE_ENTITIES],
            parse_count: 0,
            latest_serverframe: None,
        }
    }

    pub fn baseline(&self, number: usize) -> &EntityState {
        &self.entities[number].baseline
    }

    pub fn set_baseline(&mut self, number: usize, state: EntityState) {
        self.entities[number].baseline = state;
    }

    /// State of entity `number` in the latest valid frame, if it was in it.
    pub fn entity(&self, number: usize) -> Option<&EntityState> {
        let ent = self.entities.get(number)?;
        (Some(ent.serverframe) == self.latest_serverframe).then_some(&ent.current)
    }

    pub fn parse_entity(&self, index: usize) -> &EntityState {
        &self.parse_entities[index & (MAX_PARSE_ENTITIES - 1)]
    }

    /// Append a state to the ring.
    pub fn push_parse_entity(&mut self, state: EntityState) {
        self.parse_entities[self.parse_count & (MAX_PARSE_ENTITIES - 1)] = state;
        self.parse_count += 1;
    }

    pub fn frame_entities<'a>(&'a self, frame: &Frame) -> impl Iterator<Item = &'a EntityState> + 'a {
        let start = frame.parse_entities;
        (0..frame.num_entities).map(move |i| self.parse_entity(start + i))
    }

    /// Make `frame` the current view of the world.
    pub fn commit_frame(&mut self, frame: &Frame) {
        for i in 0..frame.num_entities {
            let state = *self.parse_entity(frame.parse_entities + i);
            let ent = &mut self.entities[state.number as usize];
            ent.prev = if ent.serverframe == frame.serverframe - 1 {
                ent.current
            } else {
                // wasn't in the last update
                EntityState {
                    origin: state.old_origin,
                    ..state
                }
            };
            ent.current = state;
            ent.serverframe = frame.serverframe;
        }
        self.latest_serverframe = Some(frame.serverframe);
    }
}

impl Default for ClientEntities {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================
// Prediction bookkeeping
// ============================================================

#[derive(Debug, Clone, Copy)]
struct CommandEntry {
    sequence: i32,
    cmd: UserCmd,
    predicted: Option<PmoveState>,
    realtime: i32,
}

/// The last `CMD_BACKUP` commands sent, keyed by the netchan sequence that
/// carried them. Older entries are overwritten silently.
pub struct CommandHistory {
    entries: Vec<Option<CommandEntry>>,
}

impl CommandHistory {
    pub fn new() -> Self {
        Self {
            entries: vec![None; CMD_BACKUP],
        }
    }

    fn slot(&self, sequence: i32) -> Option<&CommandEntry> {
        self.entries[sequence as usize & CMD_MASK]
            .as_ref()
            .filter(|e| e.sequence == sequence)
    }

    pub fn store(&mut self, sequence: i32, cmd: UserCmd, realtime: i32) {
        self.entries[sequence as usize & CMD_MASK] = Some(CommandEntry {
            sequence,
            cmd,
            predicted: None,
            realtime,
        });
    }

    pub fn command(&self, sequence: i32) -> Option<&UserCmd> {
        self.slot(sequence).map(|e| &e.cmd)
    }

    /// When the command was sent, for ping measurement.
    pub fn sent_time(&self, sequence: i32) -> Option<i32> {
        self.slot(sequence).map(|e| e.realtime)
    }

    pub fn set_predicted(&mut self, sequence: i32, state: PmoveState) {
        if let Some(entry) = self.entries[sequence as usize & CMD_MASK]
            .as_mut()
            .filter(|e| e.sequence == sequence)
        {
            entry.predicted = Some(state);
        }
    }

    /// None if the command was never stored, never predicted or has been
    /// overwritten.
    pub fn predicted(&self, sequence: i32) -> Option<PmoveState> {
        self.slot(sequence).and_then(|e| e.predicted)
    }

    pub fn oldest_sequence(&self) -> Option<i32> {
        self.entries.iter().flatten().map(|e| e.sequence).min()
    }

    pub fn newest_sequence(&self) -> Option<i32> {
        self.entries.iter().flatten().map(|e| e.sequence).max()
    }

    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = None);
    }
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// How far a prediction may be from the server's answer before it is
/// corrected. Distances are in world units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PredictionTolerance {
    /// Every origin and velocity component within the bound.
    PerAxis(f32),
    /// Euclidean distance between origins within the bound.
    Aggregate(f32),
}

impl Default for PredictionTolerance {
    fn default() -> Self {
        PredictionTolerance::PerAxis(0.125)
    }
}

impl PredictionTolerance {
    /// From the `cl_predict_metric` and `cl_predict_epsilon` values.
    pub fn from_cvars(metric: &str, epsilon: f32) -> Self {
        match metric {
            "aggregate" => PredictionTolerance::Aggregate(epsilon),
            "axis" => PredictionTolerance::PerAxis(epsilon),
            other => {
                log::warn!("unknown cl_predict_metric {}, using axis", other);
                PredictionTolerance::PerAxis(epsilon)
            }
        }
    }

    pub fn accepts(&self, predicted: &PmoveState, actual: &PmoveState) -> bool {
        let units = |a: i16, b: i16| (a as f32 - b as f32) * 0.125;
        match *self {
            PredictionTolerance::PerAxis(eps) => (0..3).all(|i| {
                units(predicted.origin[i], actual.origin[i]).abs() <= eps
                    && units(predicted.velocity[i], actual.velocity[i]).abs() <= eps
            }),
            PredictionTolerance::Aggregate(eps) => {
                let d = [
                    units(predicted.origin[0], actual.origin[0]),
                    units(predicted.origin[1], actual.origin[1]),
                    units(predicted.origin[2], actual.origin[2]),
                ];
                vector_length(&d) <= eps
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PredictionStats {
    /// Authoritative states compared against a prediction.
    pub checks: u32,
    /// Comparisons outside tolerance, each followed by a replay.
    pub misses: u32,
    /// Acknowledged commands no longer buffered.
    pub stale: u32,
}

// ============================================================
// Client state
// ============================================================

/// Survives level changes; reset on disconnect.
#[derive(Debug, Default)]
pub struct ClientStatic {
    pub state: ConnState,
    pub realtime: i32,

    pub servername: String,
    pub server_address: Option<NetAdr>,
    /// Last challenge or connect send; None to send on the next frame.
    pub connect_time: Option<i32>,
    /// Sends since entering the current handshake stage.
    pub connect_count: u32,
    pub challenge: i32,
    pub quake_port: u16,

    /// Exists from `client_connect` until the connection drops.
    pub netchan: Option<NetChan>,
    pub last_drop: Option<DropReason>,
}

/// Cleared by `serverdata` and by disconnects.
pub struct ClientState {
    pub timeoutcount: i32,

    pub servercount: i32,
    pub attractloop: bool,
    pub gamedir: String,
    pub playernum: i32,
    pub levelname: String,
    /// `svc_serverdata` has been parsed for this level.
    pub serverdata: bool,
    /// `begin` has been sent for this level.
    pub begin_sent: bool,

    pub configstrings: Vec<String>,

    pub frame: Frame,
    pub frames: Vec<Frame>,
    pub surpress_count: i32,
    pub entities: ClientEntities,

    pub cmds: CommandHistory,
    pub predicted_state: PmoveState,
    pub predicted_origin: Vec3,
    pub predicted_angles: Vec3,
    pub prediction_error: Vec3,
    pub prediction_stats: PredictionStats,
}

impl ClientState {
    pub fn new() -> Self {
        Self {
            timeoutcount: 0,
            servercount: 0,
            attractloop: false,
            gamedir: String::new(),
            playernum: 0,
            levelname: String::new(),
            serverdata: false,
            begin_sent: false,
            configstrings: vec![String::new(); MAX_CONFIGSTRINGS],
            frame: Frame::default(),
            frames: vec![Frame::default(); UPDATE_BACKUP],
            surpress_count: 0,
            entities: ClientEntities::new(),
            cmds: CommandHistory::new(),
            predicted_state: PmoveState::default(),
            predicted_origin: [0.0; 3],
            predicted_angles: [0.0; 3],
            prediction_error: [0.0; 3],
            prediction_stats: PredictionStats::default(),
        }
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new()
    }
}
