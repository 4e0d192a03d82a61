// delta.rs -- delta compression of entity and player states
//
// Only fields that differ from the reference state are sent, announced by a
// leading bitmask. The reader must hold exactly the reference the writer
// used; a mismatch produces wrong state until the next full update, which is
// accepted rather than treated as an error.

use crate::common::*;
use crate::error::ProtocolError;
use crate::q_shared::{EntityState, PlayerState, PmType, Vec3, MAX_EDICTS, MAX_STATS};
use crate::qcommon::{
    EntityBits, PlayerStateBits, SizeBuf, SoundFlags, DEFAULT_SOUND_PACKET_ATTENUATION,
    DEFAULT_SOUND_PACKET_VOLUME,
};

/// Beams need their old origin every frame as the second endpoint.
pub const RF_BEAM: i32 = 128;

// ============================================================
// Entity state
// ============================================================

/// Field bits needed to turn `from` into `to`. Header bits (MOREBITS,
/// NUMBER16) are not included.
pub fn delta_entity_bits(from: &EntityState, to: &EntityState, newentity: bool) -> EntityBits {
    let mut bits = EntityBits::empty();

    bits.set(EntityBits::ORIGIN1, to.origin[0] != from.origin[0]);
    bits.set(EntityBits::ORIGIN2, to.origin[1] != from.origin[1]);
    bits.set(EntityBits::ORIGIN3, to.origin[2] != from.origin[2]);

    bits.set(EntityBits::ANGLE1, to.angles[0] != from.angles[0]);
    bits.set(EntityBits::ANGLE2, to.angles[1] != from.angles[1]);
    bits.set(EntityBits::ANGLE3, to.angles[2] != from.angles[2]);

    if to.skinnum != from.skinnum {
        bits |= match to.skinnum as u32 {
            0..=0xff => EntityBits::SKIN8,
            0x100..=0xffff => EntityBits::SKIN16,
            _ => EntityBits::SKIN8 | EntityBits::SKIN16,
        };
    }

    if to.frame != from.frame {
        bits |= if (to.frame as u32) < 256 { EntityBits::FRAME8 } else { EntityBits::FRAME16 };
    }

    if to.effects != from.effects {
        bits |= match to.effects {
            0..=0xff => EntityBits::EFFECTS8,
            0x100..=0x7fff => EntityBits::EFFECTS16,
            _ => EntityBits::EFFECTS8 | EntityBits::EFFECTS16,
        };
    }

    if to.renderfx != from.renderfx {
        bits |= match to.renderfx as u32 {
            0..=0xff => EntityBits::RENDERFX8,
            0x100..=0x7fff => EntityBits::RENDERFX16,
            _ => EntityBits::RENDERFX8 | EntityBits::RENDERFX16,
        };
    }

    bits.set(EntityBits::SOLID, to.solid != from.solid);
    // events are one-shot and never carried forward by the reader
    bits.set(EntityBits::EVENT, to.event != 0);
    bits.set(EntityBits::MODEL, to.modelindex != from.modelindex);
    bits.set(EntityBits::MODEL2, to.modelindex2 != from.modelindex2);
    bits.set(EntityBits::MODEL3, to.modelindex3 != from.modelindex3);
    bits.set(EntityBits::MODEL4, to.modelindex4 != from.modelindex4);
    bits.set(EntityBits::SOUND, to.sound != from.sound);
    bits.set(EntityBits::OLDORIGIN, newentity || (to.renderfx & RF_BEAM) != 0);

    bits
}

fn write_entity_header(msg: &mut SizeBuf, mut bits: EntityBits, number: i32) {
    if number >= 256 {
        bits |= EntityBits::NUMBER16;
    }

    let raw = bits.bits();
    if raw & 0xff00_0000 != 0 {
        bits |= EntityBits::MOREBITS3 | EntityBits::MOREBITS2 | EntityBits::MOREBITS1;
    } else if raw & 0x00ff_0000 != 0 {
        bits |= EntityBits::MOREBITS2 | EntityBits::MOREBITS1;
    } else if raw & 0x0000_ff00 != 0 {
        bits |= EntityBits::MOREBITS1;
    }

    let raw = bits.bits();
    msg_write_byte(msg, (raw & 255) as i32);
    if bits.contains(EntityBits::MOREBITS1) {
        msg_write_byte(msg, ((raw >> 8) & 255) as i32);
    }
    if bits.contains(EntityBits::MOREBITS2) {
        msg_write_byte(msg, ((raw >> 16) & 255) as i32);
    }
    if bits.contains(EntityBits::MOREBITS3) {
        msg_write_byte(msg, ((raw >> 24) & 255) as i32);
    }

    if bits.contains(EntityBits::NUMBER16) {
        msg_write_short(msg, number);
    } else {
        msg_write_byte(msg, number);
    }
}

/// Write one value whose width is chosen by a pair of size bits.
fn write_sized(msg: &mut SizeBuf, bits: EntityBits, small: EntityBits, large: EntityBits, value: i32) {
    match (bits.contains(small), bits.contains(large)) {
        (true, true) => msg_write_long(msg, value),
        (true, false) => msg_write_byte(msg, value),
        (false, true) => msg_write_short(msg, value),
        (false, false) => {}
    }
}

fn read_sized(
    msg: &mut SizeBuf,
    bits: EntityBits,
    small: EntityBits,
    large: EntityBits,
) -> MsgResult<Option<i32>> {
    Ok(match (bits.contains(small), bits.contains(large)) {
        (true, true) => Some(msg_read_long(msg)?),
        (true, false) => Some(msg_read_byte(msg)? as i32),
        (false, true) => Some(msg_read_short(msg)? as u16 as i32),
        (false, false) => None,
    })
}

/// Write the changes from `from` to `to`. Nothing is written for an
/// unchanged entity unless `force` is set, in which case only the header
/// and number go out (the "still present" marker).
pub fn msg_write_delta_entity(
    from: &EntityState,
    to: &EntityState,
    msg: &mut SizeBuf,
    force: bool,
    newentity: bool,
) {
    assert!(to.number > 0, "Unset entity number");
    assert!((to.number as usize) < MAX_EDICTS, "Entity number >= MAX_EDICTS");

    let bits = delta_entity_bits(from, to, newentity);
    if bits.is_empty() && !force {
        return;
    }

    write_entity_header(msg, bits, to.number);

    if bits.contains(EntityBits::MODEL) { msg_write_byte(msg, to.modelindex); }
    if bits.contains(EntityBits::MODEL2) { msg_write_byte(msg, to.modelindex2); }
    if bits.contains(EntityBits::MODEL3) { msg_write_byte(msg, to.modelindex3); }
    if bits.contains(EntityBits::MODEL4) { msg_write_byte(msg, to.modelindex4); }

    if bits.contains(EntityBits::FRAME8) { msg_write_byte(msg, to.frame); }
    if bits.contains(EntityBits::FRAME16) { msg_write_short(msg, to.frame); }

    write_sized(msg, bits, EntityBits::SKIN8, EntityBits::SKIN16, to.skinnum);
    write_sized(msg, bits, EntityBits::EFFECTS8, EntityBits::EFFECTS16, to.effects as i32);
    write_sized(msg, bits, EntityBits::RENDERFX8, EntityBits::RENDERFX16, to.renderfx);

    if bits.contains(EntityBits::ORIGIN1) { msg_write_coord(msg, to.origin[0]); }
    if bits.contains(EntityBits::ORIGIN2) { msg_write_coord(msg, to.origin[1]); }
    if bits.contains(EntityBits::ORIGIN3) { msg_write_coord(msg, to.origin[2]); }

    if bits.contains(EntityBits::ANGLE1) { msg_write_angle(msg, to.angles[0]); }
    if bits.contains(EntityBits::ANGLE2) { msg_write_angle(msg, to.angles[1]); }
    if bits.contains(EntityBits::ANGLE3) { msg_write_angle(msg, to.angles[2]); }

    if bits.contains(EntityBits::OLDORIGIN) { msg_write_pos(msg, &to.old_origin); }

    if bits.contains(EntityBits::SOUND) { msg_write_byte(msg, to.sound); }
    if bits.contains(EntityBits::EVENT) { msg_write_byte(msg, to.event); }
    if bits.contains(EntityBits::SOLID) { msg_write_short(msg, to.solid); }
}

/// Tell the receiver the entity left the frame.
pub fn msg_write_remove_entity(msg: &mut SizeBuf, number: i32) {
    write_entity_header(msg, EntityBits::REMOVE, number);
}

/// Terminates a packet-entities list.
pub fn msg_write_entities_end(msg: &mut SizeBuf) {
    msg_write_short(msg, 0);
}

/// Read an entity header. Number 0 ends a packet-entities list and is
/// returned as is; the caller checks for it.
pub fn msg_read_entity_bits(msg: &mut SizeBuf) -> Result<(i32, EntityBits), ProtocolError> {
    let mut total = msg_read_byte(msg)? as u32;
    if total & EntityBits::MOREBITS1.bits() != 0 {
        total |= (msg_read_byte(msg)? as u32) << 8;
    }
    if total & EntityBits::MOREBITS2.bits() != 0 {
        total |= (msg_read_byte(msg)? as u32) << 16;
    }
    if total & EntityBits::MOREBITS3.bits() != 0 {
        total |= (msg_read_byte(msg)? as u32) << 24;
    }
    let bits = EntityBits::from_bits_retain(total);

    let number = if bits.contains(EntityBits::NUMBER16) {
        msg_read_short(msg)? as i32
    } else {
        msg_read_byte(msg)? as i32
    };

    if number < 0 || number as usize >= MAX_EDICTS {
        return Err(ProtocolError::BadEntityNumber(number));
    }

    Ok((number, bits))
}

/// Apply a delta to `from`. Only flagged fields are read. Unless the delta
/// carries one, `old_origin` becomes the previous origin, and `event` is
/// cleared when not flagged.
pub fn msg_read_delta_entity(
    from: &EntityState,
    number: i32,
    bits: EntityBits,
    msg: &mut SizeBuf,
) -> Result<EntityState, ProtocolError> {
    let mut to = *from;
    to.number = number;
    to.old_origin = from.origin;
    to.event = 0;

    if bits.contains(EntityBits::MODEL) { to.modelindex = msg_read_byte(msg)? as i32; }
    if bits.contains(EntityBits::MODEL2) { to.modelindex2 = msg_read_byte(msg)? as i32; }
    if bits.contains(EntityBits::MODEL3) { to.modelindex3 = msg_read_byte(msg)? as i32; }
    if bits.contains(EntityBits::MODEL4) { to.modelindex4 = msg_read_byte(msg)? as i32; }

    if bits.contains(EntityBits::FRAME8) { to.frame = msg_read_byte(msg)? as i32; }
    if bits.contains(EntityBits::FRAME16) { to.frame = msg_read_short(msg)? as u16 as i32; }

    if let Some(v) = read_sized(msg, bits, EntityBits::SKIN8, EntityBits::SKIN16)? {
        to.skinnum = v;
    }
    if let Some(v) = read_sized(msg, bits, EntityBits::EFFECTS8, EntityBits::EFFECTS16)? {
        to.effects = v as u32;
    }
    if let Some(v) = read_sized(msg, bits, EntityBits::RENDERFX8, EntityBits::RENDERFX16)? {
        to.renderfx = v;
    }

    if bits.contains(EntityBits::ORIGIN1) { to.origin[0] = msg_read_coord(msg)?; }
    if bits.contains(EntityBits::ORIGIN2) { to.origin[1] = msg_read_coord(msg)?; }
    if bits.contains(EntityBits::ORIGIN3) { to.origin[2] = msg_read_coord(msg)?; }

    if bits.contains(EntityBits::ANGLE1) { to.angles[0] = msg_read_angle(msg)?; }
    if bits.contains(EntityBits::ANGLE2) { to.angles[1] = msg_read_angle(msg)?; }
    if bits.contains(EntityBits::ANGLE3) { to.angles[2] = msg_read_angle(msg)?; }

    if bits.contains(EntityBits::OLDORIGIN) { to.old_origin = msg_read_pos(msg)?; }

    if bits.contains(EntityBits::SOUND) { to.sound = msg_read_byte(msg)? as i32; }
    if bits.contains(EntityBits::EVENT) { to.event = msg_read_byte(msg)? as i32; }
    if bits.contains(EntityBits::SOLID) { to.solid = msg_read_short(msg)? as u16 as i32; }

    Ok(to)
}

// ============================================================
// Player state
// ============================================================

fn write_char_vec(msg: &mut SizeBuf, v: &[f32; 3]) {
    for c in v {
        msg_write_char(msg, (c * 4.0) as i32);
    }
}

fn read_char_vec(msg: &mut SizeBuf) -> MsgResult<[f32; 3]> {
    Ok([
        msg_read_char(msg)? as f32 * 0.25,
        msg_read_char(msg)? as f32 * 0.25,
        msg_read_char(msg)? as f32 * 0.25,
    ])
}

pub fn delta_playerstate_bits(from: &PlayerState, to: &PlayerState) -> PlayerStateBits {
    let (ps, ops) = (&to.pmove, &from.pmove);
    let mut bits = PlayerStateBits::empty();

    bits.set(PlayerStateBits::M_TYPE, ps.pm_type != ops.pm_type);
    bits.set(PlayerStateBits::M_ORIGIN, ps.origin != ops.origin);
    bits.set(PlayerStateBits::M_VELOCITY, ps.velocity != ops.velocity);
    bits.set(PlayerStateBits::M_TIME, ps.pm_time != ops.pm_time);
    bits.set(PlayerStateBits::M_FLAGS, ps.pm_flags != ops.pm_flags);
    bits.set(PlayerStateBits::M_GRAVITY, ps.gravity != ops.gravity);
    bits.set(PlayerStateBits::M_DELTA_ANGLES, ps.delta_angles != ops.delta_angles);

    bits.set(PlayerStateBits::VIEWOFFSET, to.viewoffset != from.viewoffset);
    bits.set(PlayerStateBits::VIEWANGLES, to.viewangles != from.viewangles);
    bits.set(PlayerStateBits::KICKANGLES, to.kick_angles != from.kick_angles);
    bits.set(PlayerStateBits::BLEND, to.blend != from.blend);
    bits.set(PlayerStateBits::FOV, to.fov != from.fov);
    bits.set(PlayerStateBits::RDFLAGS, to.rdflags != from.rdflags);
    bits.set(PlayerStateBits::WEAPONINDEX, to.gunindex != from.gunindex);
    bits.set(
        PlayerStateBits::WEAPONFRAME,
        to.gunframe != from.gunframe
            || to.gunoffset != from.gunoffset
            || to.gunangles != from.gunangles,
    );

    bits
}

/// Write `to` as a delta against `from` (a default state for full updates).
pub fn msg_write_delta_playerstate(from: &PlayerState, to: &PlayerState, msg: &mut SizeBuf) {
    let bits = delta_playerstate_bits(from, to);
    let ps = &to.pmove;

    msg_write_short(msg, bits.bits() as i32);

    if bits.contains(PlayerStateBits::M_TYPE) {
        msg_write_byte(msg, ps.pm_type as i32);
    }
    if bits.contains(PlayerStateBits::M_ORIGIN) {
        for v in ps.origin {
            msg_write_short(msg, v as i32);
        }
    }
    if bits.contains(PlayerStateBits::M_VELOCITY) {
        for v in ps.velocity {
            msg_write_short(msg, v as i32);
        }
    }
    if bits.contains(PlayerStateBits::M_TIME) {
        msg_write_byte(msg, ps.pm_time as i32);
    }
    if bits.contains(PlayerStateBits::M_FLAGS) {
        msg_write_byte(msg, ps.pm_flags as i32);
    }
    if bits.contains(PlayerStateBits::M_GRAVITY) {
        msg_write_short(msg, ps.gravity as i32);
    }
    if bits.contains(PlayerStateBits::M_DELTA_ANGLES) {
        for v in ps.delta_angles {
            msg_write_short(msg, v as i32);
        }
    }

    if bits.contains(PlayerStateBits::VIEWOFFSET) {
        write_char_vec(msg, &to.viewoffset);
    }
    if bits.contains(PlayerStateBits::VIEWANGLES) {
        for v in to.viewangles {
            msg_write_angle16(msg, v);
        }
    }
    if bits.contains(PlayerStateBits::KICKANGLES) {
        write_char_vec(msg, &to.kick_angles);
    }
    if bits.contains(PlayerStateBits::WEAPONINDEX) {
        msg_write_byte(msg, to.gunindex);
    }
    if bits.contains(PlayerStateBits::WEAPONFRAME) {
        msg_write_byte(msg, to.gunframe);
        write_char_vec(msg, &to.gunoffset);
        write_char_vec(msg, &to.gunangles);
    }
    if bits.contains(PlayerStateBits::BLEND) {
        for v in to.blend {
            msg_write_byte(msg, (v * 255.0) as i32);
        }
    }
    if bits.contains(PlayerStateBits::FOV) {
        msg_write_byte(msg, to.fov as i32);
    }
    if bits.contains(PlayerStateBits::RDFLAGS) {
        msg_write_byte(msg, to.rdflags);
    }

    let mut statbits: i32 = 0;
    for i in 0..MAX_STATS {
        if to.stats[i] != from.stats[i] {
            statbits |= 1 << i;
        }
    }
    msg_write_long(msg, statbits);
    for i in 0..MAX_STATS {
        if statbits & (1 << i) != 0 {
            msg_write_short(msg, to.stats[i] as i32);
        }
    }
}

pub fn msg_read_delta_playerstate(
    from: &PlayerState,
    msg: &mut SizeBuf,
) -> Result<PlayerState, ProtocolError> {
    let mut state = *from;
    let bits = PlayerStateBits::from_bits_retain(msg_read_short(msg)? as u16);
    let pm = &mut state.pmove;

    if bits.contains(PlayerStateBits::M_TYPE) {
        pm.pm_type = PmType::from_u8(msg_read_byte(msg)?);
    }
    if bits.contains(PlayerStateBits::M_ORIGIN) {
        for v in pm.origin.iter_mut() {
            *v = msg_read_short(msg)?;
        }
    }
    if bits.contains(PlayerStateBits::M_VELOCITY) {
        for v in pm.velocity.iter_mut() {
            *v = msg_read_short(msg)?;
        }
    }
    if bits.contains(PlayerStateBits::M_TIME) {
        pm.pm_time = msg_read_byte(msg)?;
    }
    if bits.contains(PlayerStateBits::M_FLAGS) {
        pm.pm_flags = msg_read_byte(msg)?;
    }
    if bits.contains(PlayerStateBits::M_GRAVITY) {
        pm.gravity = msg_read_short(msg)?;
    }
    if bits.contains(PlayerStateBits::M_DELTA_ANGLES) {
        for v in pm.delta_angles.iter_mut() {
            *v = msg_read_short(msg)?;
        }
    }

    if bits.contains(PlayerStateBits::VIEWOFFSET) {
        state.viewoffset = read_char_vec(msg)?;
    }
    if bits.contains(PlayerStateBits::VIEWANGLES) {
        for i in 0..3 {
            state.viewangles[i] = msg_read_angle16(msg)?;
        }
    }
    if bits.contains(PlayerStateBits::KICKANGLES) {
        state.kick_angles = read_char_vec(msg)?;
    }
    if bits.contains(PlayerStateBits::WEAPONINDEX) {
        state.gunindex = msg_read_byte(msg)? as i32;
    }
    if bits.contains(PlayerStateBits::WEAPONFRAME) {
        state.gunframe = msg_read_byte(msg)? as i32;
        state.gunoffset = read_char_vec(msg)?;
        state.gunangles = read_char_vec(msg)?;
    }
    if bits.contains(PlayerStateBits::BLEND) {
        for i in 0..4 {
            state.blend[i] = msg_read_byte(msg)? as f32 / 255.0;
        }
    }
    if bits.contains(PlayerStateBits::FOV) {
        state.fov = msg_read_byte(msg)? as f32;
    }
    if bits.contains(PlayerStateBits::RDFLAGS) {
        state.rdflags = msg_read_byte(msg)? as i32;
    }

    let statbits = msg_read_long(msg)?;
    for i in 0..MAX_STATS {
        if statbits & (1 << i) != 0 {
            state.stats[i] = msg_read_short(msg)?;
        }
    }

    Ok(state)
}

// ============================================================
// Sound packets
// ============================================================

/// A positioned sound start carried by `svc_sound`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoundPacket {
    pub sound_num: i32,
    pub volume: f32,
    pub attenuation: f32,
    /// Seconds into the frame at which the sound starts.
    pub timeofs: f32,
    /// 0 when the sound is not attached to an entity.
    pub entity: i32,
    pub channel: i32,
    pub origin: Option<Vec3>,
}

impl Default for SoundPacket {
    fn default() -> Self {
        Self {
            sound_num: 0,
            volume: DEFAULT_SOUND_PACKET_VOLUME,
            attenuation: DEFAULT_SOUND_PACKET_ATTENUATION,
            timeofs: 0.0,
            entity: 0,
            channel: 0,
            origin: None,
        }
    }
}

/// Write the body of an `svc_sound`; the opcode is written by the caller.
pub fn msg_write_sound(msg: &mut SizeBuf, snd: &SoundPacket) {
    let mut flags = SoundFlags::empty();
    flags.set(SoundFlags::VOLUME, snd.volume != DEFAULT_SOUND_PACKET_VOLUME);
    flags.set(SoundFlags::ATTENUATION, snd.attenuation != DEFAULT_SOUND_PACKET_ATTENUATION);
    flags.set(SoundFlags::OFFSET, snd.timeofs != 0.0);
    flags.set(SoundFlags::ENT, snd.entity != 0);
    flags.set(SoundFlags::POS, snd.origin.is_some());

    msg_write_byte(msg, flags.bits() as i32);
    msg_write_byte(msg, snd.sound_num);

    if flags.contains(SoundFlags::VOLUME) {
        msg_write_byte(msg, (snd.volume * 255.0) as i32);
    }
    if flags.contains(SoundFlags::ATTENUATION) {
        msg_write_byte(msg, (snd.attenuation * 64.0) as i32);
    }
    if flags.contains(SoundFlags::OFFSET) {
        msg_write_byte(msg, (snd.timeofs * 1000.0) as i32);
    }
    if flags.contains(SoundFlags::ENT) {
        msg_write_short(msg, (snd.entity << 3) | (snd.channel & 7));
    }
    if let Some(origin) = &snd.origin {
        msg_write_pos(msg, origin);
    }
}

pub fn msg_read_sound(msg: &mut SizeBuf) -> Result<SoundPacket, ProtocolError> {
    let flags = SoundFlags::from_bits_retain(msg_read_byte(msg)?);
    let mut snd = SoundPacket {
        sound_num: msg_read_byte(msg)? as i32,
        ..Default::default()
    };

    if flags.contains(SoundFlags::VOLUME) {
        snd.volume = msg_read_byte(msg)? as f32 / 255.0;
    }
    if flags.contains(SoundFlags::ATTENUATION) {
        snd.attenuation = msg_read_byte(msg)? as f32 / 64.0;
    }
    if flags.contains(SoundFlags::OFFSET) {
        snd.timeofs = msg_read_byte(msg)? as f32 / 1000.0;
    }
    if flags.contains(SoundFlags::ENT) {
        let v = msg_read_short(msg)? as u16 as i32;
        snd.channel = v & 7;
        snd.entity = v >> 3;
        if snd.entity as usize >= MAX_EDICTS {
            return Err(ProtocolError::BadEntityNumber(snd.entity));
        }
    }
    if flags.contains(SoundFlags::POS) {
        snd.origin = Some(msg_read_pos(msg)?);
    }

    Ok(snd)
}
