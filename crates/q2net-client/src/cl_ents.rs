// cl_ents.rs -- frame parsing and the entity store

use q2net_common::common::{msg_read_byte, msg_read_data, msg_read_long};
use q2net_common::delta::{msg_read_delta_entity, msg_read_delta_playerstate, msg_read_entity_bits};
use q2net_common::error::ProtocolError;
use q2net_common::q_shared::*;
use q2net_common::qcommon::{EntityBits, SizeBuf, SvcOps, UPDATE_MASK};

use crate::client::*;

/// `svc_spawnbaseline`: an entity's state decoded against the null state.
pub fn cl_parse_baseline(cl: &mut ClientState, msg: &mut SizeBuf) -> Result<(), ProtocolError> {
    let (number, bits) = msg_read_entity_bits(msg)?;
    let nullstate = EntityState::default();
    let state = msg_read_delta_entity(&nullstate, number, bits, msg)?;
    cl.entities.set_baseline(number as usize, state);
    Ok(())
}

/// Read a frame: header, area bits, player state and packet entities.
/// The frame is stored for later deltas even when its reference was lost,
/// but only a valid frame becomes `cl.frame`'s world view.
pub fn cl_parse_frame(cl: &mut ClientState, msg: &mut SizeBuf) -> Result<(), ProtocolError> {
    let mut frame = Frame {
        serverframe: msg_read_long(msg)?,
        deltaframe: msg_read_long(msg)?,
        ..Default::default()
    };
    cl.surpress_count = msg_read_byte(msg)? as i32;

    log::trace!("   frame:{}  delta:{}", frame.serverframe, frame.deltaframe);

    // If the frame is delta compressed from data we no longer have, read
    // the rest of it but do not use it; the next command asks for a full
    // update.
    let old = if frame.deltaframe <= 0 {
        frame.valid = true;
        None
    } else {
        let old = cl.frames[frame.deltaframe as usize & UPDATE_MASK].clone();
        if !old.valid {
            log::debug!("Delta from invalid frame (not supposed to happen!).");
        }
        if old.serverframe != frame.deltaframe {
            log::debug!("Delta frame too old.");
        } else if cl.entities.parse_count - old.parse_entities > MAX_PARSE_ENTITIES - 128 {
            log::debug!("Delta parse_entities too old.");
        } else {
            frame.valid = old.valid;
        }
        Some(old)
    };

    let len = msg_read_byte(msg)? as usize;
    frame.areabits = msg_read_data(msg, len)?;

    expect_op(msg, SvcOps::PlayerInfo, "CL_ParseFrame: not playerinfo")?;
    let from = old.as_ref().map(|f| f.playerstate).unwrap_or_default();
    frame.playerstate = msg_read_delta_playerstate(&from, msg)?;

    expect_op(msg, SvcOps::PacketEntities, "CL_ParseFrame: not packetentities")?;
    cl_parse_packet_entities(cl, old.as_ref(), &mut frame, msg)?;

    cl.frames[frame.serverframe as usize & UPDATE_MASK] = frame.clone();

    if frame.valid {
        cl.entities.commit_frame(&frame);
    } else {
        log::debug!("frame {} dropped, requesting full update", frame.serverframe);
    }
    cl.frame = frame;
    Ok(())
}

fn expect_op(msg: &mut SizeBuf, op: SvcOps, what: &str) -> Result<(), ProtocolError> {
    let cmd = msg_read_byte(msg)?;
    if SvcOps::try_from(cmd) != Ok(op) {
        return Err(ProtocolError::BadMessage(what.to_string()));
    }
    log::trace!("{:3}:{:?}", msg.readcount - 1, op);
    Ok(())
}

/// Merge the old frame's entity list with the incoming deltas. Both are in
/// ascending entity order; entities absent from the deltas carry over
/// unchanged.
pub fn cl_parse_packet_entities(
    cl: &mut ClientState,
    oldframe: Option<&Frame>,
    newframe: &mut Frame,
    msg: &mut SizeBuf,
) -> Result<(), ProtocolError> {
    newframe.parse_entities = cl.entities.parse_count;
    newframe.num_entities = 0;

    let ents = &mut cl.entities;
    let mut oldindex = 0;
    let mut oldstate = old_at(ents, oldframe, oldindex);

    loop {
        let (newnum, bits) = msg_read_entity_bits(msg)?;
        if newnum == 0 {
            break;
        }

        // entities from the old packet that are unchanged
        while let Some(old) = oldstate.filter(|o| o.number < newnum) {
            delta_entity(ents, newframe, old.number, &old, EntityBits::empty(), msg)?;
            oldindex += 1;
            oldstate = old_at(ents, oldframe, oldindex);
        }

        if bits.contains(EntityBits::REMOVE) {
            match oldstate {
                Some(old) if old.number == newnum => {
                    oldindex += 1;
                    oldstate = old_at(ents, oldframe, oldindex);
                }
                _ => log::debug!("U_REMOVE: oldnum != newnum"),
            }
            continue;
        }

        match oldstate {
            Some(old) if old.number == newnum => {
                // delta from previous state
                delta_entity(ents, newframe, newnum, &old, bits, msg)?;
                oldindex += 1;
                oldstate = old_at(ents, oldframe, oldindex);
            }
            _ => {
                // delta from baseline
                let baseline = *ents.baseline(newnum as usize);
                delta_entity(ents, newframe, newnum, &baseline, bits, msg)?;
            }
        }
    }

    // any remaining entities in the old frame are copied over
    while let Some(old) = oldstate {
        delta_entity(ents, newframe, old.number, &old, EntityBits::empty(), msg)?;
        oldindex += 1;
        oldstate = old_at(ents, oldframe, oldindex);
    }

    Ok(())
}

fn old_at(ents: &ClientEntities, oldframe: Option<&Frame>, index: usize) -> Option<EntityState> {
    let f = oldframe?;
    (index < f.num_entities).then(|| *ents.parse_entity(f.parse_entities + index))
}

fn delta_entity(
    ents: &mut ClientEntities,
    frame: &mut Frame,
    number: i32,
    from: &EntityState,
    bits: EntityBits,
    msg: &mut SizeBuf,
) -> Result<(), ProtocolError> {
    let state = msg_read_delta_entity(from, number, bits, msg)?;
    ents.push_parse_entity(state);
    frame.num_entities += 1;
    Ok(())
}
