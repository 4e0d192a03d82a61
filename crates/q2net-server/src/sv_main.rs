// sv_main.rs -- server main program: connections, packets, frames

use rayon::prelude::*;

use q2net_common::cmd::CmdArgs;
use q2net_common::common::{msg_read_long, msg_read_string_line, msg_write_byte, msg_write_string};
use q2net_common::net::{net_compare_base_adr, NetAdr};
use q2net_common::net_chan::{
    is_out_of_band, netchan_out_of_band_print, netchan_peek_qport, netchan_process, netchan_send,
    netchan_setup, NetSrc,
};
use q2net_common::q_shared::*;
use q2net_common::qcommon::*;

use crate::server::*;
use crate::sv_ccmds::sv_execute_command;
use crate::sv_ents::{sv_build_client_frames, sv_clear_entity_events};
use crate::sv_init::sv_set_configstring;
use crate::sv_send::sv_send_client_messages;
use crate::sv_user::sv_execute_client_message;

// ============================================================
// SV_DropClient
//
// Called when the player is totally leaving the server, either
// willingly or unwillingly.  This is NOT called if the entire
// server is quiting or crashing.
// ============================================================

pub fn sv_drop_client(ctx: &mut ServerContext, client_index: usize) {
    let cl = &mut ctx.svs.clients[client_index];
    if cl.state <= ClientState::Zombie {
        return;
    }

    // add the disconnect; it goes out with the next send to the zombie
    if cl.netchan.message.overflowed {
        cl.netchan.message.clear();
    }
    msg_write_byte(&mut cl.netchan.message, SvcOps::Disconnect as i32);

    log::info!("{} dropped", if cl.name.is_empty() { "client" } else { &cl.name });

    // become free in a few seconds
    cl.state = ClientState::Zombie;
    cl.lastframe = -1;
    let edict_index = cl.edict_index;
    cl.name.clear();

    if let Some(ed) = ctx.edict_mut(edict_index) {
        *ed = Edict {
            inuse: false,
            s: EntityState::with_number(edict_index),
        };
    }
}

// ============================================================
// CONNECTIONLESS COMMANDS
// ============================================================

/// Requests that arrive outside a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectionlessRequest {
    Ping,
    Ack,
    Status,
    Info { version: i32 },
    GetChallenge,
    Connect {
        version: i32,
        qport: u16,
        challenge: i32,
        userinfo: String,
    },
    Rcon { password: String, command: String },
    Unknown(String),
}

impl ConnectionlessRequest {
    fn parse(cmd: &CmdArgs) -> Self {
        match cmd.argv(0) {
            "ping" => Self::Ping,
            "ack" => Self::Ack,
            "status" => Self::Status,
            "info" => Self::Info {
                version: cmd.argv(1).parse().unwrap_or(0),
            },
            "getchallenge" => Self::GetChallenge,
            "connect" => Self::Connect {
                version: cmd.argv(1).parse().unwrap_or(0),
                qport: (cmd.argv(2).parse::<i32>().unwrap_or(0) & 0xffff) as u16,
                challenge: cmd.argv(3).parse().unwrap_or(0),
                userinfo: cmd.argv(4).to_string(),
            },
            "rcon" => Self::Rcon {
                password: cmd.argv(1).to_string(),
                command: (2..cmd.argc()).map(|i| cmd.argv(i)).collect::<Vec<_>>().join(" "),
            },
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Builds the string that is sent as status replies.
pub fn sv_status_string(ctx: &ServerContext) -> String {
    let mut status = format!("{}\n", ctx.cvars.serverinfo());

    for cl in ctx.svs.clients.iter().filter(|cl| cl.state >= ClientState::Connected) {
        let player = format!("{} {} \"{}\"\n", cl.ps.stats[STAT_FRAGS], cl.ping, cl.name);
        if status.len() + player.len() >= MAX_MSGLEN - 16 {
            break; // can't hold any more
        }
        status.push_str(&player);
    }

    status
}

/// Responds with short info for broadcast scans.
fn svc_info(ctx: &ServerContext, from: &NetAdr, version: i32) {
    if ctx.maxclients == 1 {
        return; // ignore in single player
    }

    let hostname = ctx.cvars.variable_string("hostname");
    let string = if version != PROTOCOL_VERSION {
        format!("{}: wrong version\n", hostname)
    } else {
        let count = ctx.clients_in(ClientState::Connected).len();
        format!("{:>16} {:>8} {:>2}/{:>2}\n", hostname, ctx.sv.name, count, ctx.maxclients)
    };

    netchan_out_of_band_print(&*ctx.transport, from, &format!("info\n{}", string));
}

/// Returns a challenge number that can be used in a subsequent
/// connect command. Prevents spoofed connects.
fn svc_get_challenge(ctx: &mut ServerContext, from: &NetAdr) {
    // see if we already have a challenge for this ip
    let existing = ctx
        .svs
        .challenges
        .iter()
        .position(|c| c.adr.is_some_and(|adr| net_compare_base_adr(from, &adr)));

    let index = existing.unwrap_or_else(|| {
        // overwrite the oldest
        let oldest = ctx
            .svs
            .challenges
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| if c.adr.is_some() { c.time } else { i32::MIN })
            .map_or(0, |(i, _)| i);
        ctx.svs.challenges[oldest] = Challenge {
            adr: Some(*from),
            challenge: rand::random::<i32>() & 0x7fff,
            time: ctx.svs.realtime,
        };
        oldest
    });

    let challenge = ctx.svs.challenges[index].challenge;
    netchan_out_of_band_print(&*ctx.transport, from, &format!("challenge {}", challenge));
}

/// A connection request. On success the client gets a slot and a
/// netchan and is told `client_connect`.
fn svc_direct_connect(
    ctx: &mut ServerContext,
    from: &NetAdr,
    version: i32,
    qport: u16,
    challenge: i32,
    mut userinfo: String,
) {
    log::debug!("SVC_DirectConnect ()");

    if version != PROTOCOL_VERSION {
        netchan_out_of_band_print(
            &*ctx.transport,
            from,
            &format!("print\nServer is version {}.\n", PROTOCOL_VERSION),
        );
        log::debug!("    rejected connect from version {}", version);
        return;
    }

    if userinfo.len() >= MAX_INFO_STRING {
        userinfo.truncate(MAX_INFO_STRING - 1);
    }

    // force the IP key/value pair so the game can filter based on ip
    info_set_value_for_key(&mut userinfo, "ip", &from.to_string());

    // see if the challenge is valid
    match ctx
        .svs
        .challenges
        .iter()
        .find(|c| c.adr.is_some_and(|adr| net_compare_base_adr(from, &adr)))
    {
        Some(c) if c.challenge == challenge => {}
        Some(_) => {
            netchan_out_of_band_print(&*ctx.transport, from, "print\nBad challenge.\n");
            return;
        }
        None => {
            netchan_out_of_band_print(&*ctx.transport, from, "print\nNo challenge for address.\n");
            return;
        }
    }

    // if there is already a slot for this ip, reuse it
    let reconnecting = ctx.svs.clients.iter().position(|cl| {
        cl.state != ClientState::Free
            && net_compare_base_adr(from, &cl.netchan.remote_address)
            && (cl.netchan.qport == qport || from.port() == cl.netchan.remote_address.port())
    });
    if reconnecting.is_some() {
        log::info!("{}:reconnect", from);
    }

    // find a free client slot if we didn't find a reconnecting one
    let Some(index) = reconnecting.or_else(|| {
        ctx.svs
            .clients
            .iter()
            .position(|cl| cl.state == ClientState::Free)
    }) else {
        netchan_out_of_band_print(&*ctx.transport, from, "print\nServer is full.\n");
        log::debug!("Rejected a connection.");
        return;
    };

    // build a new connection
    // this is the only place a client is ever initialized
    let realtime = ctx.svs.realtime;
    ctx.svs.clients[index] = Client {
        edict_index: index as i32 + 1,
        challenge,
        userinfo,
        ..Default::default()
    };
    sv_userinfo_changed(ctx, index);

    // send the connect packet to the client
    netchan_out_of_band_print(&*ctx.transport, from, "client_connect");

    let cl = &mut ctx.svs.clients[index];
    cl.netchan = netchan_setup(NetSrc::Server, *from, qport, realtime);
    cl.state = ClientState::Connected;
    cl.lastmessage = realtime; // don't timeout
    cl.lastconnect = realtime;

    log::info!("{} connected from {} (slot {})", cl.name, from, index);
}

/// A remote operator command. Output goes back as one print packet.
fn svc_remote_command(ctx: &mut ServerContext, from: &NetAdr, password: &str, command: &str) {
    let expected = ctx.cvars.variable_string("rcon_password");
    let valid = !expected.is_empty() && password == expected;

    let output = if valid {
        log::info!("Rcon from {}:\n{}", from, command);
        sv_execute_command(ctx, &CmdArgs::tokenize(command))
    } else {
        log::warn!("Bad rcon from {}:\n{}", from, command);
        "Bad rcon_password.\n".to_string()
    };

    netchan_out_of_band_print(&*ctx.transport, from, &format!("print\n{}", output));
}

/// A connectionless packet has four leading 0xff characters to
/// distinguish it from a game channel.
pub fn sv_connectionless_packet(ctx: &mut ServerContext, from: &NetAdr, data: &[u8]) {
    let mut msg = SizeBuf::from_bytes(data);
    if msg_read_long(&mut msg).is_err() {
        return; // skip the -1 marker
    }
    let Ok(line) = msg_read_string_line(&mut msg) else {
        return;
    };

    let cmd = CmdArgs::tokenize(&line);
    log::trace!("Packet {} : {}", from, cmd.argv(0));

    match ConnectionlessRequest::parse(&cmd) {
        ConnectionlessRequest::Ping => netchan_out_of_band_print(&*ctx.transport, from, "ack"),
        ConnectionlessRequest::Ack => log::info!("Ping acknowledge from {}", from),
        ConnectionlessRequest::Status => {
            let status = sv_status_string(ctx);
            netchan_out_of_band_print(&*ctx.transport, from, &format!("print\n{}", status));
        }
        ConnectionlessRequest::Info { version } => svc_info(ctx, from, version),
        ConnectionlessRequest::GetChallenge => svc_get_challenge(ctx, from),
        ConnectionlessRequest::Connect {
            version,
            qport,
            challenge,
            userinfo,
        } => svc_direct_connect(ctx, from, version, qport, challenge, userinfo),
        ConnectionlessRequest::Rcon { password, command } => {
            svc_remote_command(ctx, from, &password, &command)
        }
        ConnectionlessRequest::Unknown(_) => {
            log::warn!("bad connectionless packet from {}:\n{}", from, line);
        }
    }
}

// ============================================================
// Per-frame upkeep
// ============================================================

/// Updates the cl.ping variables from the frame latency samples.
pub fn sv_calc_pings(ctx: &mut ServerContext) {
    ctx.svs
        .clients
        .par_iter_mut()
        .filter(|cl| cl.state == ClientState::Spawned)
        .for_each(|cl| {
            let (total, count) = cl
                .frame_latency
                .iter()
                .filter(|&&l| l > 0)
                .fold((0, 0), |(t, c), &l| (t + l, c + 1));
            cl.ping = if count == 0 { 0 } else { total / count };
        });
}

/// Client timeout check result.
enum TimeoutAction {
    None,
    /// Client should be dropped
    Drop(usize),
    /// Zombie client can be freed
    FreeZombie(usize),
    /// Fix message time wraparound
    FixTime(usize),
}

/// If a packet has not been received from a client for the `timeout`
/// cvar's seconds, drop the connection. Zombies are freed after
/// `zombietime` seconds.
pub fn sv_check_timeouts(ctx: &mut ServerContext) {
    let realtime = ctx.svs.realtime;
    let droppoint = realtime - (1000.0 * ctx.cvars.variable_value("timeout")) as i32;
    let zombiepoint = realtime - (1000.0 * ctx.cvars.variable_value("zombietime")) as i32;

    // Phase 1: check timeout conditions
    let actions: Vec<TimeoutAction> = ctx
        .svs
        .clients
        .par_iter()
        .enumerate()
        .map(|(i, cl)| {
            // message times may be wrong across a changelevel
            if cl.lastmessage > realtime {
                return TimeoutAction::FixTime(i);
            }
            match cl.state {
                ClientState::Zombie if cl.lastmessage < zombiepoint => TimeoutAction::FreeZombie(i),
                ClientState::Connected | ClientState::Spawned if cl.lastmessage < droppoint => {
                    TimeoutAction::Drop(i)
                }
                _ => TimeoutAction::None,
            }
        })
        .collect();

    // Phase 2: apply drops and state changes
    for action in actions {
        match action {
            TimeoutAction::None => {}
            TimeoutAction::FixTime(i) => ctx.svs.clients[i].lastmessage = realtime,
            TimeoutAction::FreeZombie(i) => ctx.svs.clients[i].state = ClientState::Free,
            TimeoutAction::Drop(i) => {
                let name = ctx.svs.clients[i].name.clone();
                crate::sv_send::sv_broadcast_printf(ctx, PRINT_HIGH, &format!("{} timed out\n", name));
                sv_drop_client(ctx, i);
                // don't bother with zombie state
                ctx.svs.clients[i].state = ClientState::Free;
            }
        }
    }
}

/// Route every queued packet: connectionless ones to the request handler,
/// sequenced ones to the client they belong to.
pub fn sv_read_packets(ctx: &mut ServerContext) {
    while let Some((from, data)) = ctx.transport.get_packet() {
        // check for connectionless packet (0xffffffff) first
        if is_out_of_band(&data) {
            sv_connectionless_packet(ctx, &from, &data);
            continue;
        }

        // read the qport out of the message so we can fix up
        // stupid address translating routers
        let Some(qport) = netchan_peek_qport(&data) else {
            log::trace!("{}: runt packet", from);
            continue;
        };

        // check for packets from connected clients
        let Some(index) = ctx.svs.clients.iter().position(|cl| {
            cl.state != ClientState::Free
                && net_compare_base_adr(&from, &cl.netchan.remote_address)
                && cl.netchan.qport == qport
        }) else {
            log::trace!("{}: sequenced packet without connection", from);
            continue;
        };

        let realtime = ctx.svs.realtime;
        let cl = &mut ctx.svs.clients[index];
        if cl.netchan.remote_address.port() != from.port() {
            log::info!("SV_ReadPackets: fixing up a translated port");
            cl.netchan.remote_address = from;
        }

        let mut msg = SizeBuf::from_bytes(&data);
        if !netchan_process(&mut cl.netchan, &mut msg, realtime).is_accepted() {
            continue;
        }

        // this is a valid, sequenced packet, so process it
        if cl.state != ClientState::Zombie {
            cl.lastmessage = realtime; // don't timeout
            sv_execute_client_message(ctx, index, &mut msg);
        }
    }
}

/// Advance the level by one frame.
pub fn sv_run_game_frame(ctx: &mut ServerContext) {
    // we always need to bump framenum, even if we
    // don't run the world, otherwise the delta
    // compression can get confused when a client
    // has the "current" frame
    ctx.sv.framenum += 1;
    ctx.sv.time += ctx.frametime();

    // never get more than one tic behind
    if ctx.sv.time < ctx.svs.realtime {
        log::debug!("sv highclamp");
        ctx.sv.time = ctx.svs.realtime;
    }
}

/// Main server frame entry point. `msec` is the real time since the last
/// call; game frames run at `sv_fps`.
pub fn sv_frame(ctx: &mut ServerContext, msec: i32) {
    // if server is not active, do nothing
    if !ctx.svs.initialized {
        return;
    }

    ctx.svs.realtime += msec;

    // check timeouts
    sv_check_timeouts(ctx);

    // get packets from clients
    sv_read_packets(ctx);

    if ctx.sv.state != ServerState::Game {
        return;
    }

    // move autonomous things around if enough time has passed
    if ctx.svs.realtime < ctx.sv.time {
        // never let the time get too far off
        let frametime = ctx.frametime();
        if ctx.sv.time - ctx.svs.realtime > frametime {
            log::debug!("sv lowclamp");
            ctx.svs.realtime = ctx.sv.time - frametime;
        }
        return;
    }

    // update ping based on the last known frame from all clients
    sv_calc_pings(ctx);

    sv_run_game_frame(ctx);

    // send messages back to the clients that had packets read this frame
    sv_build_client_frames(ctx);
    sv_send_client_messages(ctx);

    // events only last for a single message
    sv_clear_entity_events(ctx);
}

/// Milliseconds until the next game frame is due.
pub fn sv_time_to_next_frame(ctx: &ServerContext) -> i32 {
    (ctx.sv.time - ctx.svs.realtime).max(0)
}

// ============================================================
// SV_UserinfoChanged
//
// Pull specific info from a newly changed userinfo string
// into a more convenient form.
// ============================================================

pub fn sv_userinfo_changed(ctx: &mut ServerContext, client_index: usize) {
    let cl = &mut ctx.svs.clients[client_index];

    // mask off high bit
    let name: String = info_value_for_key(&cl.userinfo, "name")
        .bytes()
        .map(|b| (b & 127) as char)
        .filter(|c| !c.is_control())
        .take(15)
        .collect();
    cl.name = name;

    // rate command
    let rate = info_value_for_key(&cl.userinfo, "rate");
    cl.rate = if rate.is_empty() {
        25000
    } else {
        rate.parse::<i32>().unwrap_or(25000).clamp(100, 90000)
    };

    // msg command
    let msg = info_value_for_key(&cl.userinfo, "msg");
    if !msg.is_empty() {
        cl.messagelevel = msg.parse().unwrap_or(0);
    }

    let skin = info_value_for_key(&cl.userinfo, "skin");
    let value = format!("{}\\{}", cl.name, skin);
    if client_index < MAX_CLIENTS {
        sv_set_configstring(ctx, CS_PLAYERSKINS + client_index, &value);
    }
}

// ============================================================
// Shutdown
// ============================================================

/// Used by `sv_shutdown` to send a final message to all connected
/// clients before the server goes down. The message is sent unreliably,
/// twice.
pub fn sv_final_message(ctx: &mut ServerContext, message: &str, reconnect: bool) {
    let mut msg = SizeBuf::new(MAX_MSGLEN);
    msg_write_byte(&mut msg, SvcOps::Print as i32);
    msg_write_byte(&mut msg, PRINT_HIGH as i32);
    msg_write_string(&mut msg, message);

    if reconnect {
        msg_write_byte(&mut msg, SvcOps::Reconnect as i32);
    } else {
        msg_write_byte(&mut msg, SvcOps::Disconnect as i32);
    }

    // stagger the packets to crutch operating system limited buffers
    let realtime = ctx.svs.realtime;
    for _pass in 0..2 {
        for cl in ctx.svs.clients.iter_mut().filter(|cl| cl.state >= ClientState::Connected) {
            if let Err(e) = netchan_send(&mut cl.netchan, &*ctx.transport, msg.as_slice(), realtime) {
                log::debug!("final message to {}: {}", cl.name, e);
            }
        }
    }
}

/// Called when the server quits. Clients are told to reconnect or to go
/// away, then every slot is freed.
pub fn sv_shutdown(ctx: &mut ServerContext, finalmsg: &str, reconnect: bool) {
    if ctx.svs.initialized {
        sv_final_message(ctx, finalmsg, reconnect);
    }

    ctx.sv = Server::default();
    for cl in ctx.svs.clients.iter_mut() {
        *cl = Client::default();
    }
    ctx.svs.initialized = false;

    log::info!("Server shut down");
}
