// sv_send.rs -- server packet sending

use rayon::prelude::*;

use q2net_common::common::{msg_write_byte, msg_write_short, msg_write_string};
use q2net_common::delta::{msg_write_sound, SoundPacket};
use q2net_common::net_chan::netchan_send;
use q2net_common::qcommon::*;

use crate::server::*;
use crate::sv_ents::sv_write_frame_to_client;
use crate::sv_main::sv_drop_client;

/// Idle interval after which a client that is not in game gets a
/// keepalive.
const KEEPALIVE_MSEC: i32 = 1000;

// =============================================================================
// EVENT MESSAGES
// =============================================================================

/// Sends text across to be displayed if the level passes.
pub fn sv_client_printf(cl: &mut Client, level: u8, msg: &str) {
    if level < cl.messagelevel {
        return;
    }

    msg_write_byte(&mut cl.netchan.message, SvcOps::Print as i32);
    msg_write_byte(&mut cl.netchan.message, level as i32);
    msg_write_string(&mut cl.netchan.message, msg);
}

pub fn sv_client_centerprintf(cl: &mut Client, msg: &str) {
    msg_write_byte(&mut cl.netchan.message, SvcOps::CenterPrint as i32);
    msg_write_string(&mut cl.netchan.message, msg);
}

/// Sends text to all active clients.
pub fn sv_broadcast_printf(ctx: &mut ServerContext, level: u8, msg: &str) {
    log::info!("{}", msg.trim_end());
    for cl in ctx.svs.clients.iter_mut().filter(|cl| cl.state == ClientState::Spawned) {
        sv_client_printf(cl, level, msg);
    }
}

/// Sends a stufftext to every client that has a connection.
pub fn sv_broadcast_command(ctx: &mut ServerContext, msg: &str) {
    if ctx.sv.state == ServerState::Dead {
        return;
    }
    for cl in ctx.svs.clients.iter_mut().filter(|cl| cl.state >= ClientState::Connected) {
        msg_write_byte(&mut cl.netchan.message, SvcOps::StuffText as i32);
        msg_write_string(&mut cl.netchan.message, msg);
    }
}

/// Resend a changed configstring to every client already in game.
pub fn sv_broadcast_configstring(ctx: &mut ServerContext, index: usize) {
    let value = &ctx.sv.configstrings[index];
    for cl in ctx.svs.clients.iter_mut().filter(|cl| cl.state == ClientState::Spawned) {
        msg_write_byte(&mut cl.netchan.message, SvcOps::ConfigString as i32);
        msg_write_short(&mut cl.netchan.message, index as i32);
        msg_write_string(&mut cl.netchan.message, value);
    }
}

/// Queue a sound on the unreliable datagram of every client in game.
/// Sounds are lost with the packet that carries them.
pub fn sv_start_sound(ctx: &mut ServerContext, snd: &SoundPacket) {
    if !(0.0..=1.0).contains(&snd.volume) {
        log::warn!("SV_StartSound: volume = {}", snd.volume);
        return;
    }
    if !(0.0..=4.0).contains(&snd.attenuation) {
        log::warn!("SV_StartSound: attenuation = {}", snd.attenuation);
        return;
    }

    for cl in ctx.svs.clients.iter_mut().filter(|cl| cl.state == ClientState::Spawned) {
        msg_write_byte(&mut cl.datagram, SvcOps::Sound as i32);
        msg_write_sound(&mut cl.datagram, snd);
    }
}

// =============================================================================
// FRAME UPDATES
// =============================================================================

/// Send the frame and anything queued on the datagram to one client in
/// game.
pub fn sv_send_client_datagram(ctx: &mut ServerContext, client_idx: usize) {
    let mut msg = SizeBuf::new(MAX_MSGLEN);
    msg.allow_overflow = true;

    sv_write_frame_to_client(ctx, client_idx, &mut msg);

    let cl = &mut ctx.svs.clients[client_idx];

    // copy the accumulated multicast datagram
    // for this client out to the message
    // it is necessary for this to be after the WriteEntities
    // so that entity references will be current
    if cl.datagram.overflowed {
        log::warn!("datagram overflowed for {}", cl.name);
    } else if msg.has_room(cl.datagram.cursize) {
        msg.write(cl.datagram.as_slice());
    }
    cl.datagram.clear();

    if msg.overflowed {
        // must have room left for the packet header
        log::warn!("msg overflowed for {}", cl.name);
        msg.clear();
    }

    let realtime = ctx.svs.realtime;
    if netchan_send(&mut cl.netchan, &*ctx.transport, msg.as_slice(), realtime).is_err() {
        sv_drop_client(ctx, client_idx);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientSendAction {
    Skip,
    Overflow,
    SendDatagram,
    SendReliable,
}

pub fn sv_send_client_messages(ctx: &mut ServerContext) {
    let curtime = ctx.svs.realtime;

    // Phase 1: decide what each client gets (read-only)
    let actions: Vec<(usize, ClientSendAction)> = ctx
        .svs
        .clients
        .par_iter()
        .enumerate()
        .map(|(i, c)| {
            let action = if c.state == ClientState::Free {
                ClientSendAction::Skip
            } else if c.netchan.message.overflowed {
                ClientSendAction::Overflow
            } else if c.state == ClientState::Spawned {
                ClientSendAction::SendDatagram
            } else if !c.netchan.reliable_buf.is_empty()
                || c.netchan.message.cursize > 0
                || curtime - c.netchan.last_sent > KEEPALIVE_MSEC
            {
                ClientSendAction::SendReliable
            } else {
                ClientSendAction::Skip
            };
            (i, action)
        })
        .collect();

    // Phase 2: send
    for (i, action) in actions {
        match action {
            ClientSendAction::Skip => {}
            ClientSendAction::Overflow => {
                ctx.svs.clients[i].netchan.message.clear();
                ctx.svs.clients[i].datagram.clear();
                let name = ctx.svs.clients[i].name.clone();
                sv_broadcast_printf(ctx, PRINT_HIGH, &format!("{} overflowed\n", name));
                sv_drop_client(ctx, i);
            }
            ClientSendAction::SendDatagram => sv_send_client_datagram(ctx, i),
            ClientSendAction::SendReliable => {
                let cl = &mut ctx.svs.clients[i];
                if netchan_send(&mut cl.netchan, &*ctx.transport, &[], curtime).is_err() {
                    sv_drop_client(ctx, i);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use q2net_common::common::{msg_read_byte, msg_read_string};
    use q2net_common::cmodel::BoxWorld;
    use q2net_common::cvar::CvarContext;
    use q2net_common::net::{LoopbackHub, NetAdr, NetTransport};
    use q2net_common::net_chan::{netchan_setup, NetSrc};
    use crate::sv_init::sv_spawn_server;

    fn context_with_client(state: ClientState) -> (LoopbackHub, ServerContext) {
        let hub = LoopbackHub::new();
        let mut cvars = CvarContext::new();
        cvars.get("maxclients", Some("2"), 0);
        let mut ctx = ServerContext::new(Box::new(hub.bind(27910)), Box::new(BoxWorld::new()), cvars);
        sv_spawn_server(&mut ctx, "base1", &[]);
        let cl = &mut ctx.svs.clients[0];
        cl.state = state;
        cl.name = "player".into();
        cl.netchan = netchan_setup(NetSrc::Server, NetAdr::Loopback(27901), 1, 0);
        (hub, ctx)
    }

    #[test]
    fn test_printf_respects_messagelevel() {
        let (_hub, mut ctx) = context_with_client(ClientState::Spawned);
        let cl = &mut ctx.svs.clients[0];
        cl.messagelevel = PRINT_MEDIUM;
        sv_client_printf(cl, PRINT_LOW, "pickup\n");
        assert_eq!(cl.netchan.message.cursize, 0);
        sv_client_printf(cl, PRINT_CHAT, "hello\n");

        let mut msg = SizeBuf::from_bytes(cl.netchan.message.as_slice());
        assert_eq!(msg_read_byte(&mut msg).unwrap(), SvcOps::Print as u8);
        assert_eq!(msg_read_byte(&mut msg).unwrap(), PRINT_CHAT);
        assert_eq!(msg_read_string(&mut msg).unwrap(), "hello\n");
    }

    #[test]
    fn test_broadcast_command_skips_free_slots() {
        let (_hub, mut ctx) = context_with_client(ClientState::Connected);
        sv_broadcast_command(&mut ctx, "changing\n");
        assert!(ctx.svs.clients[0].netchan.message.cursize > 0);
        assert_eq!(ctx.svs.clients[1].netchan.message.cursize, 0);
    }

    #[test]
    fn test_sound_goes_on_the_datagram() {
        let (_hub, mut ctx) = context_with_client(ClientState::Spawned);
        let snd = SoundPacket {
            sound_num: 3,
            entity: 1,
            ..Default::default()
        };
        sv_start_sound(&mut ctx, &snd);
        assert_eq!(ctx.svs.clients[0].datagram.as_slice()[0], SvcOps::Sound as u8);
        assert_eq!(ctx.svs.clients[0].netchan.message.cursize, 0);

        let loud = SoundPacket { volume: 2.0, ..snd };
        ctx.svs.clients[0].datagram.clear();
        sv_start_sound(&mut ctx, &loud);
        assert_eq!(ctx.svs.clients[0].datagram.cursize, 0);
    }

    #[test]
    fn test_keepalive_for_connected_clients() {
        let (hub, mut ctx) = context_with_client(ClientState::Connected);
        let client = hub.bind(27901);

        sv_send_client_messages(&mut ctx);
        assert!(client.get_packet().is_none());

        ctx.svs.realtime = 1001;
        sv_send_client_messages(&mut ctx);
        assert!(client.get_packet().is_some());
    }

    #[test]
    fn test_overflow_drops_client() {
        let (_hub, mut ctx) = context_with_client(ClientState::Spawned);
        let text = "x".repeat(600);
        for _ in 0..3 {
            sv_client_printf(&mut ctx.svs.clients[0], PRINT_HIGH, &text);
        }
        assert!(ctx.svs.clients[0].netchan.message.overflowed);
        sv_send_client_messages(&mut ctx);
        assert_eq!(ctx.svs.clients[0].state, ClientState::Zombie);
    }
}
