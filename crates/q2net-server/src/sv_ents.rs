// sv_ents.rs -- building and delta-compressing client frames

use rayon::prelude::*;

use q2net_common::common::{msg_write_byte, msg_write_long};
use q2net_common::delta::{
    msg_write_delta_entity, msg_write_delta_playerstate, msg_write_entities_end, msg_write_remove_entity,
};
use q2net_common::q_shared::*;
use q2net_common::qcommon::*;

use crate::server::*;

/// Number used for "no more entities" on either side of the merge.
const SENTINEL: i32 = 9999;

// =============================================================================
// Encode a client frame onto the network channel
// =============================================================================

/// Writes a delta update of an entity list from `from` to `to`. Entities
/// present in both get a plain delta, new ones are sent against their
/// baseline and vanished ones get a remove marker.
pub fn sv_emit_packet_entities(
    from: Option<&ClientFrame>,
    to: &ClientFrame,
    msg: &mut SizeBuf,
    baselines: &[EntityState],
    maxclients: usize,
) {
    msg_write_byte(msg, SvcOps::PacketEntities as i32);

    let old_entities: &[EntityState] = from.map_or(&[], |f| &f.entities);
    let mut newindex = 0;
    let mut oldindex = 0;

    while newindex < to.entities.len() || oldindex < old_entities.len() {
        let newnum = to.entities.get(newindex).map_or(SENTINEL, |e| e.number);
        let oldnum = old_entities.get(oldindex).map_or(SENTINEL, |e| e.number);

        if newnum == oldnum {
            // because the force parm is false, this will not result
            // in any bytes being emitted if the entity has not changed at all
            // note that players are always 'newentities', this updates their
            // oldorigin always and prevents warping
            let newent = &to.entities[newindex];
            msg_write_delta_entity(
                &old_entities[oldindex],
                newent,
                msg,
                false,
                newent.number as usize <= maxclients,
            );
            oldindex += 1;
            newindex += 1;
        } else if newnum < oldnum {
            // this is a new entity, send it from the baseline
            let baseline = baselines
                .get(newnum as usize)
                .copied()
                .unwrap_or_else(|| EntityState::with_number(newnum));
            msg_write_delta_entity(&baseline, &to.entities[newindex], msg, true, true);
            newindex += 1;
        } else {
            // the old entity isn't present in the new message
            msg_write_remove_entity(msg, oldnum);
            oldindex += 1;
        }
    }

    msg_write_entities_end(msg);
}

/// Write this frame's svc_frame block for one client, delta compressed
/// against the last frame the client acknowledged when that is still in
/// the backup window.
pub fn sv_write_frame_to_client(ctx: &mut ServerContext, client_idx: usize, msg: &mut SizeBuf) {
    let framenum = ctx.sv.framenum;
    let maxclients = ctx.maxclients;
    let baselines = &ctx.sv.baselines;
    let client = &mut ctx.svs.clients[client_idx];

    // this is the frame we are creating
    let frame_index = framenum as usize & UPDATE_MASK;

    let (lastframe, oldframe_index) = if client.lastframe <= 0 {
        // client is asking for a retransmit
        (-1, None)
    } else if framenum - client.lastframe >= (UPDATE_BACKUP - 3) as i32 {
        // client hasn't gotten a good message through in a long time
        (-1, None)
    } else {
        // we have a valid message to delta from
        (client.lastframe, Some(client.lastframe as usize & UPDATE_MASK))
    };

    msg_write_byte(msg, SvcOps::Frame as i32);
    msg_write_long(msg, framenum);
    msg_write_long(msg, lastframe); // what we are delta'ing from
    msg_write_byte(msg, client.surpress_count); // rate dropped packets
    client.surpress_count = 0;

    let frame = &client.frames[frame_index];
    msg_write_byte(msg, frame.areabits.len() as i32);
    msg.write(&frame.areabits);

    let oldframe = oldframe_index.map(|idx| &client.frames[idx]);

    msg_write_byte(msg, SvcOps::PlayerInfo as i32);
    let oldps = oldframe.map(|f| f.ps).unwrap_or_default();
    msg_write_delta_playerstate(&oldps, &frame.ps, msg);

    sv_emit_packet_entities(oldframe, frame, msg, baselines, maxclients);
}

// =============================================================================
// Build a client frame structure
// =============================================================================

/// Snapshot what `client` should see right now. Entities with nothing to
/// draw or hear are left out.
pub fn sv_build_client_frame(sv: &Server, client: &Client, realtime: i32) -> ClientFrame {
    let entities = sv
        .edicts
        .iter()
        .enumerate()
        .skip(1)
        .filter(|(_, ed)| ed.inuse)
        .filter(|(_, ed)| ed.s.modelindex != 0 || ed.s.effects != 0 || ed.s.sound != 0 || ed.s.event != 0)
        .map(|(number, ed)| {
            let mut state = ed.s;
            if state.number != number as i32 {
                log::debug!("FIXING ENT->S.NUMBER!!!");
                state.number = number as i32;
            }
            state
        })
        .collect();

    ClientFrame {
        areabits: Vec::new(),
        ps: client.ps,
        entities,
        senttime: realtime,
    }
}

/// Build this frame's snapshot for every client in game.
pub fn sv_build_client_frames(ctx: &mut ServerContext) {
    let sv = &ctx.sv;
    let realtime = ctx.svs.realtime;
    let frame_index = sv.framenum as usize & UPDATE_MASK;

    ctx.svs
        .clients
        .par_iter_mut()
        .filter(|cl| cl.state == ClientState::Spawned)
        .for_each(|cl| {
            let frame = sv_build_client_frame(sv, cl, realtime);
            cl.frames[frame_index] = frame;
        });
}

/// Clear one-shot entity events after they have gone out with a frame.
pub fn sv_clear_entity_events(ctx: &mut ServerContext) {
    for ed in ctx.sv.edicts.iter_mut().filter(|ed| ed.inuse) {
        ed.s.event = 0;
    }
}
