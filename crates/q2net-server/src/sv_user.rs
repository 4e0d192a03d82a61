// sv_user.rs -- server code for moving users

use q2net_common::cmd::CmdArgs;
use q2net_common::cmodel::EntityClipWorld;
use q2net_common::common::{
    msg_read_byte, msg_read_delta_usercmd, msg_read_long, msg_read_string, msg_write_byte, msg_write_long,
    msg_write_short, msg_write_string, MsgResult,
};
use q2net_common::delta::msg_write_delta_entity;
use q2net_common::pmove::pmove;
use q2net_common::q_shared::*;
use q2net_common::qcommon::*;

use crate::server::*;
use crate::sv_main::{sv_drop_client, sv_userinfo_changed};
use crate::sv_send::sv_client_printf;

// ============================================================================
// USER STRINGCMD EXECUTION
// ============================================================================

/// Level data goes out in pages of roughly this many bytes, each fetched by
/// a separate string command.
const PAGE_BYTES: usize = MAX_MSGLEN / 2;

/// Queue a stufftext on the client's reliable stream.
fn stuff_text(cl: &mut Client, text: &str) {
    msg_write_byte(&mut cl.netchan.message, SvcOps::StuffText as i32);
    msg_write_string(&mut cl.netchan.message, text);
}

/// Sends the first message from the server to a connected client.
/// This will be sent on the initial connection and upon each server load.
pub fn sv_new_f(ctx: &mut ServerContext, client_idx: usize) {
    let spawncount = ctx.svs.spawncount;
    let attractloop = ctx.sv.attractloop;
    let levelname = ctx.sv.configstrings[CS_NAME].clone();
    let gamedir = ctx.cvars.variable_string("game").to_string();
    let cl = &mut ctx.svs.clients[client_idx];

    log::debug!("New() from {}", cl.name);

    if cl.state != ClientState::Connected {
        log::debug!("New not valid -- already spawned");
        return;
    }

    // serverdata needs to go over for all types of servers
    // to make sure the protocol is right, and to set the gamedir
    let msg = &mut cl.netchan.message;
    msg_write_byte(msg, SvcOps::ServerData as i32);
    msg_write_long(msg, PROTOCOL_VERSION);
    msg_write_long(msg, spawncount);
    msg_write_byte(msg, attractloop as i32);
    msg_write_string(msg, &gamedir);
    msg_write_short(msg, client_idx as i32);
    msg_write_string(msg, &levelname);

    cl.edict_index = client_idx as i32 + 1;
    cl.lastcmd = UserCmd::default();

    // begin fetching configstrings
    stuff_text(cl, &format!("cmd configstrings {} 0\n", spawncount));
}

/// Parse the `<spawncount> <start>` arguments of a paged level-data
/// request. A request for another level starts the client over.
fn page_start(ctx: &mut ServerContext, client_idx: usize, args: &CmdArgs, what: &str) -> Option<usize> {
    if ctx.svs.clients[client_idx].state != ClientState::Connected {
        log::debug!("{} not valid -- already spawned", what);
        return None;
    }

    // handle the case of a level changing while a client was connecting
    if args.argv(1).parse::<i32>().ok() != Some(ctx.svs.spawncount) {
        log::debug!("SV_{}_f from different level", what);
        sv_new_f(ctx, client_idx);
        return None;
    }

    match args.argv(2).parse::<usize>() {
        Ok(start) => Some(start),
        Err(_) => {
            log::warn!("Illegal {} offset from {}", what, ctx.svs.clients[client_idx].name);
            sv_drop_client(ctx, client_idx);
            None
        }
    }
}

pub fn sv_configstrings_f(ctx: &mut ServerContext, client_idx: usize, args: &CmdArgs) {
    let Some(mut start) = page_start(ctx, client_idx, args, "Configstrings") else {
        return;
    };
    let spawncount = ctx.svs.spawncount;
    let configstrings = &ctx.sv.configstrings;
    let cl = &mut ctx.svs.clients[client_idx];

    // write a packet full of data
    while cl.netchan.message.cursize < PAGE_BYTES && start < MAX_CONFIGSTRINGS {
        if !configstrings[start].is_empty() {
            msg_write_byte(&mut cl.netchan.message, SvcOps::ConfigString as i32);
            msg_write_short(&mut cl.netchan.message, start as i32);
            msg_write_string(&mut cl.netchan.message, &configstrings[start]);
        }
        start += 1;
    }

    // send next command
    if start >= MAX_CONFIGSTRINGS {
        stuff_text(cl, &format!("cmd baselines {} 0\n", spawncount));
    } else {
        stuff_text(cl, &format!("cmd configstrings {} {}\n", spawncount, start));
    }
}

pub fn sv_baselines_f(ctx: &mut ServerContext, client_idx: usize, args: &CmdArgs) {
    let Some(mut start) = page_start(ctx, client_idx, args, "Baselines") else {
        return;
    };
    let spawncount = ctx.svs.spawncount;
    let baselines = &ctx.sv.baselines;
    let cl = &mut ctx.svs.clients[client_idx];
    let nullstate = EntityState::default();

    // write a packet full of data
    while cl.netchan.message.cursize < PAGE_BYTES && start < MAX_EDICTS {
        let base = &baselines[start];
        if start > 0 && (base.modelindex != 0 || base.sound != 0 || base.effects != 0) {
            msg_write_byte(&mut cl.netchan.message, SvcOps::SpawnBaseline as i32);
            msg_write_delta_entity(&nullstate, base, &mut cl.netchan.message, true, true);
        }
        start += 1;
    }

    // send next command
    if start >= MAX_EDICTS {
        stuff_text(cl, &format!("precache {}\n", spawncount));
    } else {
        stuff_text(cl, &format!("cmd baselines {} {}\n", spawncount, start));
    }
}

/// Put a client that finished loading into the world.
pub fn sv_begin_f(ctx: &mut ServerContext, client_idx: usize, args: &CmdArgs) {
    log::debug!("Begin() from {}", ctx.svs.clients[client_idx].name);

    if ctx.svs.clients[client_idx].state != ClientState::Connected {
        log::debug!("Begin not valid -- already spawned");
        return;
    }

    // handle the case of a level changing while a client was connecting
    if args.argv(1).parse::<i32>().ok() != Some(ctx.svs.spawncount) {
        log::debug!("SV_Begin_f from different level");
        sv_new_f(ctx, client_idx);
        return;
    }

    sv_spawn_player(ctx, client_idx);
    let cl = &mut ctx.svs.clients[client_idx];
    cl.state = ClientState::Spawned;
    cl.lastframe = -1;

    log::info!("{} entered the game", cl.name);
}

/// Give the client's player entity a body at its spawn spot.
fn sv_spawn_player(ctx: &mut ServerContext, client_idx: usize) {
    let number = client_idx as i32 + 1;
    let spot = ctx.sv.spawn_origin;
    let origin = [spot[0] + 64.0 * client_idx as f32, spot[1], spot[2]];
    let gravity = ctx.cvars.variable_value("sv_gravity") as i16;

    let cl = &mut ctx.svs.clients[client_idx];
    cl.edict_index = number;
    cl.lastcmd = UserCmd::default();
    cl.ps = PlayerState::default();
    cl.ps.pmove.origin = origin.map(|v| (v * 8.0) as i16);
    cl.ps.pmove.gravity = gravity;
    cl.ps.viewoffset = [0.0, 0.0, 22.0];

    if let Some(ed) = ctx.edict_mut(number) {
        *ed = Edict {
            inuse: true,
            s: EntityState {
                number,
                origin,
                old_origin: origin,
                modelindex: PLAYER_MODEL,
                solid: encode_solid(&PLAYER_MINS, &PLAYER_MAXS),
                ..Default::default()
            },
        };
    }
}

/// The client is going to disconnect, so remove the connection immediately.
pub fn sv_disconnect_f(ctx: &mut ServerContext, client_idx: usize) {
    sv_drop_client(ctx, client_idx);
}

/// Dumps the serverinfo info string.
pub fn sv_showserverinfo_f(ctx: &mut ServerContext, client_idx: usize) {
    let info = ctx.cvars.serverinfo();
    let mut text = String::new();
    let mut parts = info.trim_start_matches('\\').split('\\');
    while let Some(key) = parts.next() {
        text.push_str(&format!("{:<20}{}\n", key, parts.next().unwrap_or("")));
    }
    sv_client_printf(&mut ctx.svs.clients[client_idx], PRINT_HIGH, &text);
}

/// String commands a client may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UserCommand {
    New,
    ConfigStrings,
    Baselines,
    Begin,
    Disconnect,
    Info,
    Unknown,
}

impl UserCommand {
    fn parse(name: &str) -> Self {
        match name {
            "new" => UserCommand::New,
            "configstrings" => UserCommand::ConfigStrings,
            "baselines" => UserCommand::Baselines,
            "begin" => UserCommand::Begin,
            "disconnect" => UserCommand::Disconnect,
            "info" => UserCommand::Info,
            _ => UserCommand::Unknown,
        }
    }
}

pub fn sv_execute_user_command(ctx: &mut ServerContext, client_idx: usize, s: &str) {
    let args = CmdArgs::tokenize(s);
    if args.is_empty() {
        return;
    }

    match UserCommand::parse(args.argv(0)) {
        UserCommand::New => sv_new_f(ctx, client_idx),
        UserCommand::ConfigStrings => sv_configstrings_f(ctx, client_idx, &args),
        UserCommand::Baselines => sv_baselines_f(ctx, client_idx, &args),
        UserCommand::Begin => sv_begin_f(ctx, client_idx, &args),
        UserCommand::Disconnect => sv_disconnect_f(ctx, client_idx),
        UserCommand::Info => sv_showserverinfo_f(ctx, client_idx),
        UserCommand::Unknown => {
            log::debug!("{}: unknown command \"{}\"", ctx.svs.clients[client_idx].name, args.argv(0));
        }
    }
}

// ============================================================================
// CLIENT MOVEMENT
// ============================================================================

/// Run one user command for the client: player movement against the
/// world and every other solid entity, then update the player entity.
pub fn sv_client_think(ctx: &mut ServerContext, client_idx: usize, cmd: &UserCmd) {
    let gravity = ctx.cvars.variable_value("sv_gravity") as i16;
    let cl = &ctx.svs.clients[client_idx];
    let edict_index = cl.edict_index;

    let mut pm = PmoveData {
        s: cl.ps.pmove,
        cmd: *cmd,
        passent: edict_index,
        ..Default::default()
    };
    pm.s.gravity = gravity;

    let mut clip = EntityClipWorld::new(&*ctx.world);
    for (number, ed) in ctx.sv.edicts.iter().enumerate().skip(1) {
        if ed.inuse && number as i32 != edict_index {
            clip.add_entity(number as i32, &ed.s.origin, ed.s.solid);
        }
    }
    pmove(&mut pm, &clip);

    let cl = &mut ctx.svs.clients[client_idx];
    cl.ps.pmove = pm.s;
    cl.ps.viewangles = pm.viewangles;

    if let Some(ed) = ctx.edict_mut(edict_index) {
        ed.s.origin = pm.s.origin_f32();
        ed.s.angles = [0.0, pm.viewangles[YAW], 0.0];
    }
}

/// How the command loop goes on after one clc op.
enum Next {
    Continue,
    Stop,
}

/// The current net_message is parsed for the given client.
pub fn sv_execute_client_message(ctx: &mut ServerContext, client_idx: usize, msg: &mut SizeBuf) {
    // only allow one move command
    let mut move_issued = false;
    let mut stringcmd_count = 0;

    while msg.readcount < msg.cursize {
        let byte = match msg_read_byte(msg) {
            Ok(b) => b,
            Err(_) => break,
        };

        let op = match ClcOps::try_from(byte) {
            Ok(op) => op,
            Err(c) => {
                log::warn!("SV_ReadClientMessage: unknown command char {}", c);
                sv_drop_client(ctx, client_idx);
                return;
            }
        };

        let result = match op {
            ClcOps::Nop => Ok(Next::Continue),
            ClcOps::UserInfo => read_userinfo(ctx, client_idx, msg),
            ClcOps::Move => {
                if move_issued {
                    return; // someone is trying to cheat...
                }
                move_issued = true;
                read_move(ctx, client_idx, msg)
            }
            ClcOps::StringCmd => read_stringcmd(ctx, client_idx, msg, &mut stringcmd_count),
        };

        match result {
            Ok(Next::Continue) => {}
            Ok(Next::Stop) => return,
            Err(_) => {
                log::warn!("SV_ReadClientMessage: badread");
                sv_drop_client(ctx, client_idx);
                return;
            }
        }
    }
}

fn read_userinfo(ctx: &mut ServerContext, client_idx: usize, msg: &mut SizeBuf) -> MsgResult<Next> {
    let mut info = msg_read_string(msg)?;
    if info.len() >= MAX_INFO_STRING {
        info.truncate(MAX_INFO_STRING - 1);
    }
    ctx.svs.clients[client_idx].userinfo = info;
    sv_userinfo_changed(ctx, client_idx);
    Ok(Next::Continue)
}

fn read_move(ctx: &mut ServerContext, client_idx: usize, msg: &mut SizeBuf) -> MsgResult<Next> {
    let realtime = ctx.svs.realtime;
    let lastframe = msg_read_long(msg)?;

    let cl = &mut ctx.svs.clients[client_idx];
    if lastframe != cl.lastframe {
        cl.lastframe = lastframe;
        if lastframe > 0 {
            let sent = cl.frames[lastframe as usize & UPDATE_MASK].senttime;
            cl.frame_latency[lastframe as usize & (LATENCY_COUNTS - 1)] = realtime - sent;
        }
    }

    let nullcmd = UserCmd::default();
    let oldest = msg_read_delta_usercmd(msg, &nullcmd)?;
    let oldcmd = msg_read_delta_usercmd(msg, &oldest)?;
    let newcmd = msg_read_delta_usercmd(msg, &oldcmd)?;

    if cl.state != ClientState::Spawned {
        cl.lastframe = -1;
        return Ok(Next::Continue);
    }

    // commands from packets that never arrived are in this one; past
    // two of them, repeat the last command we know
    let mut net_drop = cl.netchan.dropped;
    if net_drop < 20 {
        while net_drop > 2 {
            let lastcmd = ctx.svs.clients[client_idx].lastcmd;
            sv_client_think(ctx, client_idx, &lastcmd);
            net_drop -= 1;
        }
        if net_drop > 1 {
            sv_client_think(ctx, client_idx, &oldest);
        }
        if net_drop > 0 {
            sv_client_think(ctx, client_idx, &oldcmd);
        }
    }
    sv_client_think(ctx, client_idx, &newcmd);

    ctx.svs.clients[client_idx].lastcmd = newcmd;
    Ok(Next::Continue)
}

fn read_stringcmd(
    ctx: &mut ServerContext,
    client_idx: usize,
    msg: &mut SizeBuf,
    count: &mut usize,
) -> MsgResult<Next> {
    let s = msg_read_string(msg)?;

    // malicious users may try using too many string commands
    *count += 1;
    if *count <= MAX_STRINGCMDS {
        sv_execute_user_command(ctx, client_idx, &s);
    } else {
        log::debug!("{}: too many string commands, ignored \"{}\"", ctx.svs.clients[client_idx].name, s);
    }

    if ctx.svs.clients[client_idx].state == ClientState::Zombie {
        return Ok(Next::Stop); // disconnect command
    }
    Ok(Next::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use q2net_common::cmodel::BoxWorld;
    use q2net_common::common::{msg_read_short, msg_write_delta_usercmd};
    use q2net_common::cvar::CvarContext;
    use q2net_common::net::{LoopbackHub, NetAdr};
    use q2net_common::net_chan::{netchan_setup, NetSrc};
    use crate::sv_init::{sv_set_configstring, sv_spawn_server};

    fn context() -> ServerContext {
        let hub = LoopbackHub::new();
        let mut cvars = CvarContext::new();
        cvars.get("maxclients", Some("2"), 0);
        let mut ctx = ServerContext::new(Box::new(hub.bind(27910)), Box::new(BoxWorld::with_floor(0.0)), cvars);
        let level = [EntityState {
            modelindex: 2,
            origin: [256.0, 0.0, 0.0],
            ..Default::default()
        }];
        sv_spawn_server(&mut ctx, "base1", &level);
        let cl = &mut ctx.svs.clients[0];
        cl.state = ClientState::Connected;
        cl.name = "player".into();
        cl.netchan = netchan_setup(NetSrc::Server, NetAdr::Loopback(27901), 1, 0);
        ctx
    }

    /// Every stufftext queued for client 0, in order.
    fn stuffed(ctx: &ServerContext) -> Vec<String> {
        let mut msg = SizeBuf::from_bytes(ctx.svs.clients[0].netchan.message.as_slice());
        let mut out = Vec::new();
        while msg.readcount < msg.cursize {
            match SvcOps::try_from(msg_read_byte(&mut msg).unwrap()).unwrap() {
                SvcOps::StuffText => out.push(msg_read_string(&mut msg).unwrap()),
                SvcOps::ServerData => {
                    msg_read_long(&mut msg).unwrap();
                    msg_read_long(&mut msg).unwrap();
                    msg_read_byte(&mut msg).unwrap();
                    msg_read_string(&mut msg).unwrap();
                    msg_read_short(&mut msg).unwrap();
                    msg_read_string(&mut msg).unwrap();
                }
                SvcOps::ConfigString => {
                    msg_read_short(&mut msg).unwrap();
                    msg_read_string(&mut msg).unwrap();
                }
                // baselines are the last thing in their page
                _ => break,
            }
        }
        out
    }

    fn run_command(ctx: &mut ServerContext, text: &str) {
        ctx.svs.clients[0].netchan.message.clear();
        sv_execute_user_command(ctx, 0, text);
    }

    #[test]
    fn test_new_starts_configstrings() {
        let mut ctx = context();
        run_command(&mut ctx, "new");
        assert_eq!(ctx.svs.clients[0].netchan.message.as_slice()[0], SvcOps::ServerData as u8);
        assert_eq!(stuffed(&ctx), vec!["cmd configstrings 1 0\n"]);
        assert_eq!(ctx.svs.clients[0].edict_index, 1);
    }

    #[test]
    fn test_configstrings_are_paged() {
        let mut ctx = context();
        for i in 0..25 {
            sv_set_configstring(&mut ctx, CS_SOUNDS + 1 + i, &format!("sound/long/path/name/number{:03}.wav", i));
        }

        run_command(&mut ctx, "configstrings 1 0");
        let next = stuffed(&ctx);
        let start: usize = next[0].trim().rsplit(' ').next().unwrap().parse().unwrap();
        assert!(next[0].starts_with("cmd configstrings 1 "));
        assert!(start > CS_SOUNDS && start < CS_SOUNDS + 26);

        run_command(&mut ctx, &format!("configstrings 1 {}", start));
        assert_eq!(stuffed(&ctx), vec!["cmd baselines 1 0\n"]);
    }

    #[test]
    fn test_baselines_end_with_precache() {
        let mut ctx = context();
        run_command(&mut ctx, "baselines 1 0");
        let msg = ctx.svs.clients[0].netchan.message.as_slice().to_vec();
        assert_eq!(msg[0], SvcOps::SpawnBaseline as u8);
        let tail = String::from_utf8_lossy(&msg);
        assert!(tail.contains("precache 1\n"));
    }

    #[test]
    fn test_wrong_level_restarts() {
        let mut ctx = context();
        run_command(&mut ctx, "configstrings 7 0");
        assert_eq!(stuffed(&ctx), vec!["cmd configstrings 1 0\n"]);

        run_command(&mut ctx, "begin 7");
        assert_eq!(ctx.svs.clients[0].state, ClientState::Connected);
    }

    #[test]
    fn test_begin_spawns_player() {
        let mut ctx = context();
        run_command(&mut ctx, "begin 1");

        let cl = &ctx.svs.clients[0];
        assert_eq!(cl.state, ClientState::Spawned);
        assert_eq!(cl.ps.pmove.origin, [0, 0, 193]);
        assert_eq!(cl.ps.pmove.gravity, 800);
        let ed = ctx.edict(1).unwrap();
        assert!(ed.inuse);
        assert_eq!(ed.s.modelindex, PLAYER_MODEL);
        assert_eq!(ed.s.solid, encode_solid(&PLAYER_MINS, &PLAYER_MAXS));

        // a second begin changes nothing
        run_command(&mut ctx, "begin 1");
        assert_eq!(ctx.svs.clients[0].state, ClientState::Spawned);
    }

    fn move_packet(lastframe: i32, cmds: [UserCmd; 3]) -> SizeBuf {
        let mut msg = SizeBuf::new(MAX_MSGLEN);
        msg_write_byte(&mut msg, ClcOps::Move as i32);
        msg_write_long(&mut msg, lastframe);
        msg_write_delta_usercmd(&mut msg, &UserCmd::default(), &cmds[0]);
        msg_write_delta_usercmd(&mut msg, &cmds[0], &cmds[1]);
        msg_write_delta_usercmd(&mut msg, &cmds[1], &cmds[2]);
        SizeBuf::from_bytes(msg.as_slice())
    }

    fn forward(msec: u8) -> UserCmd {
        UserCmd {
            msec,
            forwardmove: 200,
            ..Default::default()
        }
    }

    #[test]
    fn test_move_runs_dropped_commands() {
        let mut a = context();
        run_command(&mut a, "begin 1");
        let mut b = context();
        run_command(&mut b, "begin 1");

        // a sees every packet, b lost the two before this one
        let cmds = [forward(10), forward(20), forward(30)];
        for cmd in &cmds {
            sv_client_think(&mut a, 0, cmd);
        }
        b.svs.clients[0].netchan.dropped = 2;
        sv_execute_client_message(&mut b, 0, &mut move_packet(-1, cmds));

        assert_eq!(a.svs.clients[0].ps.pmove, b.svs.clients[0].ps.pmove);
        assert!(b.svs.clients[0].ps.pmove.origin[0] > 0);
        assert_eq!(b.svs.clients[0].lastcmd, cmds[2]);
        assert_eq!(b.edict(1).unwrap().s.origin, b.svs.clients[0].ps.pmove.origin_f32());
    }

    #[test]
    fn test_move_records_latency() {
        let mut ctx = context();
        run_command(&mut ctx, "begin 1");
        ctx.svs.clients[0].frames[5].senttime = 100;
        ctx.svs.realtime = 180;

        sv_execute_client_message(&mut ctx, 0, &mut move_packet(5, [forward(10); 3]));
        assert_eq!(ctx.svs.clients[0].lastframe, 5);
        assert_eq!(ctx.svs.clients[0].frame_latency[5], 80);
    }

    #[test]
    fn test_move_before_spawn_is_ignored() {
        let mut ctx = context();
        ctx.svs.clients[0].lastframe = 3;
        sv_execute_client_message(&mut ctx, 0, &mut move_packet(4, [forward(10); 3]));
        assert_eq!(ctx.svs.clients[0].lastframe, -1);
        assert_eq!(ctx.svs.clients[0].ps.pmove, PmoveState::default());
    }

    #[test]
    fn test_only_one_move_per_packet() {
        let mut ctx = context();
        run_command(&mut ctx, "begin 1");
        let once = move_packet(-1, [forward(10); 3]);
        let mut twice = SizeBuf::new(MAX_MSGLEN);
        twice.write(once.as_slice());
        twice.write(once.as_slice());

        let mut single = context();
        run_command(&mut single, "begin 1");
        sv_execute_client_message(&mut single, 0, &mut SizeBuf::from_bytes(once.as_slice()));
        sv_execute_client_message(&mut ctx, 0, &mut SizeBuf::from_bytes(twice.as_slice()));
        assert_eq!(ctx.svs.clients[0].ps.pmove, single.svs.clients[0].ps.pmove);
    }

    #[test]
    fn test_userinfo_and_disconnect() {
        let mut ctx = context();
        let mut msg = SizeBuf::new(MAX_MSGLEN);
        msg_write_byte(&mut msg, ClcOps::UserInfo as i32);
        msg_write_string(&mut msg, "\\name\\grunt\\rate\\50\\msg\\2");
        msg_write_byte(&mut msg, ClcOps::StringCmd as i32);
        msg_write_string(&mut msg, "disconnect");
        msg_write_byte(&mut msg, ClcOps::StringCmd as i32);
        msg_write_string(&mut msg, "new");

        sv_execute_client_message(&mut ctx, 0, &mut SizeBuf::from_bytes(msg.as_slice()));
        let cl = &ctx.svs.clients[0];
        assert_eq!(cl.rate, 100);
        assert_eq!(cl.messagelevel, PRINT_HIGH);
        assert_eq!(cl.state, ClientState::Zombie);
        // nothing after the disconnect ran
        assert_eq!(cl.netchan.message.as_slice(), &[SvcOps::Disconnect as u8]);
    }

    #[test]
    fn test_bad_messages_drop() {
        let mut ctx = context();
        sv_execute_client_message(&mut ctx, 0, &mut SizeBuf::from_bytes(&[99]));
        assert_eq!(ctx.svs.clients[0].state, ClientState::Zombie);

        let mut ctx = context();
        // a move cut short
        sv_execute_client_message(&mut ctx, 0, &mut SizeBuf::from_bytes(&[ClcOps::Move as u8, 1]));
        assert_eq!(ctx.svs.clients[0].state, ClientState::Zombie);
    }

    #[test]
    fn test_stringcmd_flood_is_capped() {
        let mut ctx = context();
        let mut msg = SizeBuf::new(MAX_MSGLEN);
        for _ in 0..MAX_STRINGCMDS {
            msg_write_byte(&mut msg, ClcOps::StringCmd as i32);
            msg_write_string(&mut msg, "info");
        }
        msg_write_byte(&mut msg, ClcOps::StringCmd as i32);
        msg_write_string(&mut msg, "new");

        sv_execute_client_message(&mut ctx, 0, &mut SizeBuf::from_bytes(msg.as_slice()));
        // the ninth command never ran
        assert!(!ctx.svs.clients[0].netchan.message.as_slice().contains(&(SvcOps::ServerData as u8)));
    }
}
