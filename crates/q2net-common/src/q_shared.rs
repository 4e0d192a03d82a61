// q_shared.rs -- types shared by the client, the server and the movement code

pub type Vec3 = [f32; 3];

pub const VEC3_ORIGIN: Vec3 = [0.0, 0.0, 0.0];

pub const PITCH: usize = 0;
pub const YAW: usize = 1;
pub const ROLL: usize = 2;

pub const MAX_CLIENTS: usize = 256;
pub const MAX_EDICTS: usize = 1024;
pub const MAX_MODELS: usize = 256;
pub const MAX_SOUNDS: usize = 256;
pub const MAX_IMAGES: usize = 256;
pub const MAX_STATS: usize = 32;
pub const MAX_CLIP_PLANES: usize = 5;
pub const MAX_QPATH: usize = 64;

/// Player stat slot holding the score shown by `status`.
pub const STAT_FRAGS: usize = 14;

pub const MAX_STRING_CHARS: usize = 1024;
pub const MAX_STRING_TOKENS: usize = 80;
pub const MAX_INFO_KEY: usize = 64;
pub const MAX_INFO_VALUE: usize = 64;
pub const MAX_INFO_STRING: usize = 512;

// ============================================================
// Configstrings
// ============================================================

pub const CS_NAME: usize = 0;
pub const CS_CDTRACK: usize = 1;
pub const CS_SKY: usize = 2;
pub const CS_MAXCLIENTS: usize = 30;
pub const CS_MODELS: usize = 32;
pub const CS_SOUNDS: usize = CS_MODELS + MAX_MODELS;
pub const CS_IMAGES: usize = CS_SOUNDS + MAX_SOUNDS;
pub const CS_PLAYERSKINS: usize = CS_IMAGES + MAX_IMAGES;
pub const MAX_CONFIGSTRINGS: usize = CS_PLAYERSKINS + MAX_CLIENTS;

// ============================================================
// Contents
// ============================================================

pub const CONTENTS_SOLID: i32 = 1;
pub const CONTENTS_WINDOW: i32 = 2;
pub const CONTENTS_LAVA: i32 = 8;
pub const CONTENTS_SLIME: i32 = 16;
pub const CONTENTS_WATER: i32 = 32;
pub const CONTENTS_PLAYERCLIP: i32 = 0x10000;
pub const CONTENTS_MONSTER: i32 = 0x2000000;
pub const CONTENTS_DEADMONSTER: i32 = 0x4000000;

pub const MASK_ALL: i32 = -1;
pub const MASK_SOLID: i32 = CONTENTS_SOLID | CONTENTS_WINDOW;
pub const MASK_PLAYERSOLID: i32 =
    CONTENTS_SOLID | CONTENTS_PLAYERCLIP | CONTENTS_WINDOW | CONTENTS_MONSTER;
pub const MASK_WATER: i32 = CONTENTS_WATER | CONTENTS_LAVA | CONTENTS_SLIME;

// ============================================================
// Vector math
// ============================================================

pub fn dot_product(a: &Vec3, b: &Vec3) -> f32 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

pub fn cross_product(v1: &Vec3, v2: &Vec3) -> Vec3 {
    [
        v1[1] * v2[2] - v1[2] * v2[1],
        v1[2] * v2[0] - v1[0] * v2[2],
        v1[0] * v2[1] - v1[1] * v2[0],
    ]
}

pub fn vector_subtract(a: &Vec3, b: &Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub fn vector_ma(start: &Vec3, scale: f32, dir: &Vec3) -> Vec3 {
    [
        start[0] + scale * dir[0],
        start[1] + scale * dir[1],
        start[2] + scale * dir[2],
    ]
}

pub fn vector_scale(v: &Vec3, scale: f32) -> Vec3 {
    [v[0] * scale, v[1] * scale, v[2] * scale]
}

pub fn vector_length(v: &Vec3) -> f32 {
    dot_product(v, v).sqrt()
}

/// Normalize in place, returns original length.
pub fn vector_normalize(v: &mut Vec3) -> f32 {
    let length = vector_length(v);
    if length != 0.0 {
        let ilength = 1.0 / length;
        v[0] *= ilength;
        v[1] *= ilength;
        v[2] *= ilength;
    }
    length
}

pub fn angle_vectors(angles: &Vec3) -> (Vec3, Vec3, Vec3) {
    let (sy, cy) = angles[YAW].to_radians().sin_cos();
    let (sp, cp) = angles[PITCH].to_radians().sin_cos();
    let (sr, cr) = angles[ROLL].to_radians().sin_cos();

    let forward = [cp * cy, cp * sy, -sp];
    let right = [
        -sr * sp * cy + cr * sy,
        -sr * sp * sy - cr * cy,
        -sr * cp,
    ];
    let up = [
        cr * sp * cy + sr * sy,
        cr * sp * sy - sr * cy,
        cr * cp,
    ];
    (forward, right, up)
}

#[inline]
pub fn angle2short(x: f32) -> i32 {
    ((x * 65536.0 / 360.0) as i32) & 65535
}

#[inline]
pub fn short2angle(x: i16) -> f32 {
    (x as f32) * (360.0 / 65536.0)
}

/// Reduce an angle to [0, 360).
pub fn anglemod(a: f32) -> f32 {
    a.rem_euclid(360.0)
}

// ============================================================
// Plane / trace
// ============================================================

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CPlane {
    pub normal: Vec3,
    pub dist: f32,
}

/// Result of a box sweep through the collision model.
#[derive(Debug, Clone, Copy)]
pub struct Trace {
    pub allsolid: bool,
    pub startsolid: bool,
    pub fraction: f32,
    pub endpos: Vec3,
    pub plane: CPlane,
    pub contents: i32,
    /// Entity that was hit, -1 for none. 0 is the world.
    pub ent_index: i32,
}

impl Default for Trace {
    fn default() -> Self {
        Self {
            allsolid: false,
            startsolid: false,
            fraction: 1.0,
            endpos: [0.0; 3],
            plane: CPlane::default(),
            contents: 0,
            ent_index: -1,
        }
    }
}

// ============================================================
// Player movement types
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PmType {
    #[default]
    Normal = 0,
    Spectator = 1,
    Dead = 2,
    Gib = 3,
    Freeze = 4,
}

impl PmType {
    pub fn from_u8(v: u8) -> PmType {
        match v {
            1 => PmType::Spectator,
            2 => PmType::Dead,
            3 => PmType::Gib,
            4 => PmType::Freeze,
            _ => PmType::Normal,
        }
    }
}

pub const PMF_DUCKED: u8 = 1;
pub const PMF_JUMP_HELD: u8 = 2;
pub const PMF_ON_GROUND: u8 = 4;
pub const PMF_TIME_LAND: u8 = 16;
pub const PMF_TIME_TELEPORT: u8 = 32;
pub const PMF_NO_PREDICTION: u8 = 64;

/// Communicated bit-accurate between server and client for prediction sync.
/// Origin and velocity are 13.3 fixed point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PmoveState {
    pub pm_type: PmType,
    pub origin: [i16; 3],
    pub velocity: [i16; 3],
    pub pm_flags: u8,
    pub pm_time: u8,
    pub gravity: i16,
    pub delta_angles: [i16; 3],
}

impl PmoveState {
    pub fn origin_f32(&self) -> Vec3 {
        [
            self.origin[0] as f32 * 0.125,
            self.origin[1] as f32 * 0.125,
            self.origin[2] as f32 * 0.125,
        ]
    }
}

pub const BUTTON_ATTACK: u8 = 1;
pub const BUTTON_USE: u8 = 2;
pub const BUTTON_ANY: u8 = 128;

/// One frame of player input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserCmd {
    pub msec: u8,
    pub buttons: u8,
    pub angles: [i16; 3],
    pub forwardmove: i16,
    pub sidemove: i16,
    pub upmove: i16,
    pub impulse: u8,
    pub lightlevel: u8,
}

pub const MAXTOUCH: usize = 32;

/// In/out block for one `pmove` call.
#[derive(Debug, Clone)]
pub struct PmoveData {
    pub s: PmoveState,
    pub cmd: UserCmd,
    pub snapinitial: bool,
    /// Entity the traces ignore, normally the player's own.
    pub passent: i32,
    pub touchents: Vec<i32>,
    pub viewangles: Vec3,
    pub viewheight: f32,
    pub mins: Vec3,
    pub maxs: Vec3,
    /// -1 when airborne.
    pub groundentity: i32,
    pub watertype: i32,
    pub waterlevel: i32,
}

impl Default for PmoveData {
    fn default() -> Self {
        Self {
            s: PmoveState::default(),
            cmd: UserCmd::default(),
            snapinitial: false,
            passent: -1,
            touchents: Vec::new(),
            viewangles: [0.0; 3],
            viewheight: 0.0,
            mins: [0.0; 3],
            maxs: [0.0; 3],
            groundentity: -1,
            watertype: 0,
            waterlevel: 0,
        }
    }
}

// ============================================================
// Entity / player state
// ============================================================

/// Network-visible state of one entity.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EntityState {
    pub number: i32,
    pub origin: Vec3,
    pub angles: Vec3,
    pub old_origin: Vec3,
    pub modelindex: i32,
    pub modelindex2: i32,
    pub modelindex3: i32,
    pub modelindex4: i32,
    pub frame: i32,
    pub skinnum: i32,
    pub effects: u32,
    pub renderfx: i32,
    /// Packed bbox for prediction clipping, see `encode_solid`.
    pub solid: i32,
    pub sound: i32,
    pub event: i32,
}

impl EntityState {
    pub fn with_number(number: i32) -> Self {
        Self { number, ..Default::default() }
    }
}

/// Pack an entity bbox into the 16-bit `solid` field
/// (x/y radius and z extents in units of 8).
pub fn encode_solid(mins: &Vec3, maxs: &Vec3) -> i32 {
    let x = ((maxs[0] / 8.0) as i32).clamp(1, 31);
    let zd = ((-mins[2] / 8.0) as i32).clamp(1, 31);
    let zu = (((maxs[2] + 32.0) / 8.0) as i32).clamp(1, 63);
    (zu << 10) | (zd << 5) | x
}

pub fn decode_solid(solid: i32) -> (Vec3, Vec3) {
    let x = (8 * (solid & 31)) as f32;
    let zd = (8 * ((solid >> 5) & 31)) as f32;
    let zu = (8 * ((solid >> 10) & 63) - 32) as f32;
    ([-x, -x, -zd], [x, x, zu])
}

/// Everything the client needs to draw its own view; only the pmove part
/// takes part in prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerState {
    pub pmove: PmoveState,
    pub viewangles: Vec3,
    pub viewoffset: Vec3,
    pub kick_angles: Vec3,
    pub gunangles: Vec3,
    pub gunoffset: Vec3,
    pub gunindex: i32,
    pub gunframe: i32,
    pub blend: [f32; 4],
    pub fov: f32,
    pub rdflags: i32,
    pub stats: [i16; MAX_STATS],
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            pmove: PmoveState::default(),
            viewangles: [0.0; 3],
            viewoffset: [0.0; 3],
            kick_angles: [0.0; 3],
            gunangles: [0.0; 3],
            gunoffset: [0.0; 3],
            gunindex: 0,
            gunframe: 0,
            blend: [0.0; 4],
            fov: 90.0,
            rdflags: 0,
            stats: [0; MAX_STATS],
        }
    }
}

// ============================================================
// Cvar flags
// ============================================================

pub const CVAR_ARCHIVE: i32 = 1;
pub const CVAR_USERINFO: i32 = 2;
pub const CVAR_SERVERINFO: i32 = 4;
pub const CVAR_NOSET: i32 = 8;
pub const CVAR_LATCH: i32 = 16;

// ============================================================
// Info strings: "\key\value\key\value"
// ============================================================

fn info_pairs(s: &str) -> impl Iterator<Item = (&str, &str)> {
    let body = s.strip_prefix('\\').unwrap_or(s);
    let mut parts = body.split('\\');
    std::iter::from_fn(move || {
        let key = parts.next()?;
        if key.is_empty() {
            return None;
        }
        Some((key, parts.next().unwrap_or("")))
    })
}

/// Search info string `s` for `key`, return value or empty string.
pub fn info_value_for_key(s: &str, key: &str) -> String {
    info_pairs(s)
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
        .unwrap_or_default()
}

pub fn info_remove_key(s: &mut String, key: &str) {
    if key.contains('\\') {
        return;
    }
    let mut result = String::with_capacity(s.len());
    for (k, v) in info_pairs(s).filter(|(k, _)| *k != key) {
        result.push('\\');
        result.push_str(k);
        result.push('\\');
        result.push_str(v);
    }
    *s = result;
}

/// Check that an info string contains no characters that would break
/// quoting on the connect line.
pub fn info_validate(s: &str) -> bool {
    !s.contains('"') && !s.contains(';')
}

/// Set a key/value pair. Illegal or oversized pairs are ignored, an empty
/// value removes the key.
pub fn info_set_value_for_key(s: &mut String, key: &str, value: &str) {
    if key.contains('\\') || value.contains('\\') || key.contains(';') {
        log::debug!("Can't use keys or values with a \\ or ;");
        return;
    }
    if key.contains('"') || value.contains('"') {
        log::debug!("Can't use keys or values with a \"");
        return;
    }
    if key.len() >= MAX_INFO_KEY || value.len() >= MAX_INFO_KEY {
        log::debug!("Keys and values must be < 64 characters.");
        return;
    }

    info_remove_key(s, key);
    if value.is_empty() {
        return;
    }

    let pair = format!("\\{}\\{}", key, value);
    if pair.len() + s.len() > MAX_INFO_STRING {
        log::debug!("Info string length exceeded");
        return;
    }
    s.extend(pair.chars().filter(|c| (' '..='~').contains(c)));
}
