// sv_ccmds.rs -- operator console commands

use q2net_common::cmd::CmdArgs;
use q2net_common::qcommon::PRINT_HIGH;

use crate::server::*;
use crate::sv_init::sv_map;
use crate::sv_main::{sv_drop_client, sv_shutdown};
use crate::sv_send::{sv_broadcast_printf, sv_client_printf};

/// Commands an operator can run from the console or through rcon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperatorCommand {
    Status,
    Map,
    Kick,
    ServerInfo,
    DumpUser,
    Say,
    Set,
    KillServer,
    Other,
}

impl OperatorCommand {
    fn parse(name: &str) -> Self {
        match name {
            "status" => OperatorCommand::Status,
            "map" => OperatorCommand::Map,
            "kick" => OperatorCommand::Kick,
            "serverinfo" => OperatorCommand::ServerInfo,
            "dumpuser" => OperatorCommand::DumpUser,
            "say" => OperatorCommand::Say,
            "set" => OperatorCommand::Set,
            "killserver" => OperatorCommand::KillServer,
            _ => OperatorCommand::Other,
        }
    }
}

/// Run one operator command line and return the text it printed.
/// Anything that is not a command is tried as a variable query or set.
pub fn sv_execute_command(ctx: &mut ServerContext, args: &CmdArgs) -> String {
    if args.is_empty() {
        return String::new();
    }

    match OperatorCommand::parse(args.argv(0)) {
        OperatorCommand::Status => sv_status_f(ctx),
        OperatorCommand::Map => sv_map_f(ctx, args),
        OperatorCommand::Kick => sv_kick_f(ctx, args),
        OperatorCommand::ServerInfo => format!("Server info settings:\n{}", info_print(&ctx.cvars.serverinfo())),
        OperatorCommand::DumpUser => sv_dump_user_f(ctx, args),
        OperatorCommand::Say => sv_con_say_f(ctx, args),
        OperatorCommand::Set => {
            if ctx.cvars.set_f(args) {
                String::new()
            } else {
                "usage: set <variable> <value> [u / s]\n".to_string()
            }
        }
        OperatorCommand::KillServer => {
            sv_shutdown(ctx, "Server was killed.\n", false);
            String::new()
        }
        OperatorCommand::Other => {
            let name = args.argv(0);
            let Some(var) = ctx.cvars.find_var(name) else {
                return format!("Unknown command \"{}\"\n", name);
            };
            if args.argc() == 1 {
                return format!("\"{}\" is \"{}\"\n", var.name, var.string);
            }
            ctx.cvars.command(args);
            String::new()
        }
    }
}

/// Find a client by slot number or name. Free slots never match.
fn sv_set_player(ctx: &ServerContext, id: &str) -> Result<usize, String> {
    // numeric values are just slot numbers
    if id.starts_with(|c: char| c.is_ascii_digit()) {
        let idx = match id.parse::<usize>() {
            Ok(idx) if idx < ctx.maxclients => idx,
            _ => return Err(format!("Bad client slot: {}\n", id)),
        };
        if ctx.svs.clients[idx].state == ClientState::Free {
            return Err(format!("Client {} is not active\n", idx));
        }
        return Ok(idx);
    }

    // check for a name match
    ctx.svs
        .clients
        .iter()
        .position(|cl| cl.state != ClientState::Free && cl.name == id)
        .ok_or_else(|| format!("Userid {} is not on the server\n", id))
}

/// Lay out an info string one key per line.
fn info_print(info: &str) -> String {
    let mut out = String::new();
    let mut parts = info.trim_start_matches('\\').split('\\');
    while let Some(key) = parts.next() {
        if key.is_empty() {
            continue;
        }
        match parts.next() {
            Some(value) => out.push_str(&format!("{:<20}{}\n", key, value)),
            None => out.push_str(&format!("{:<20}MISSING VALUE\n", key)),
        }
    }
    out
}

pub fn sv_status_f(ctx: &ServerContext) -> String {
    if !ctx.svs.initialized {
        return "No server running.\n".to_string();
    }

    let mut out = format!("map              : {}\n", ctx.sv.name);
    out.push_str("num ping name            lastmsg address               qport \n");
    out.push_str("--- ---- --------------- ------- --------------------- ------\n");

    for (i, cl) in ctx.svs.clients.iter().enumerate() {
        let ping = match cl.state {
            ClientState::Free => continue,
            ClientState::Connected => "CNCT".to_string(),
            ClientState::Zombie => "ZMBI".to_string(),
            ClientState::Spawned => cl.ping.min(9999).to_string(),
        };
        out.push_str(&format!(
            "{:3} {:>4} {:<15} {:7} {:<21} {:5}\n",
            i,
            ping,
            cl.name,
            ctx.svs.realtime - cl.lastmessage,
            cl.netchan.remote_address.to_string(),
            cl.netchan.qport
        ));
    }
    out
}

/// `map <mapname>`: change levels, taking every connected client along.
pub fn sv_map_f(ctx: &mut ServerContext, args: &CmdArgs) -> String {
    if args.argc() != 2 {
        return "USAGE: map <mapname>\n".to_string();
    }
    sv_map(ctx, args.argv(1), &[]);
    String::new()
}

/// Kick a user off of the server.
pub fn sv_kick_f(ctx: &mut ServerContext, args: &CmdArgs) -> String {
    if ctx.sv.state != ServerState::Game {
        return "No server running.\n".to_string();
    }
    if args.argc() != 2 {
        return "Usage: kick <userid>\n".to_string();
    }

    let idx = match sv_set_player(ctx, args.argv(1)) {
        Ok(idx) => idx,
        Err(e) => return e,
    };

    let name = ctx.svs.clients[idx].name.clone();
    sv_broadcast_printf(ctx, PRINT_HIGH, &format!("{} was kicked\n", name));
    // print directly, because the dropped client won't get the
    // sv_broadcast_printf message
    sv_client_printf(&mut ctx.svs.clients[idx], PRINT_HIGH, "You were kicked from the game\n");
    sv_drop_client(ctx, idx);
    ctx.svs.clients[idx].lastmessage = ctx.svs.realtime; // in case there is a funny zombie
    String::new()
}

/// Examine all a user's info strings.
pub fn sv_dump_user_f(ctx: &ServerContext, args: &CmdArgs) -> String {
    if args.argc() != 2 {
        return "Usage: dumpuser <userid>\n".to_string();
    }
    match sv_set_player(ctx, args.argv(1)) {
        Ok(idx) => format!("userinfo\n--------\n{}", info_print(&ctx.svs.clients[idx].userinfo)),
        Err(e) => e,
    }
}

pub fn sv_con_say_f(ctx: &mut ServerContext, args: &CmdArgs) -> String {
    if args.argc() < 2 {
        return String::new();
    }

    let text = args.args().trim_matches('"');
    sv_broadcast_printf(ctx, q2net_common::qcommon::PRINT_CHAT, &format!("console: {}\n", text));
    String::new()
}
