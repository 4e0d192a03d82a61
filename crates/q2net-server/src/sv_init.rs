// sv_init.rs -- server initialization and level changes

use q2net_common::cmodel::CollisionModel;
use q2net_common::cvar::CvarContext;
use q2net_common::net::NetTransport;
use q2net_common::q_shared::*;
use q2net_common::qcommon::PROTOCOL_VERSION;

use crate::server::*;
use crate::sv_send::{sv_broadcast_command, sv_send_client_messages};

pub const DEFAULT_SV_FPS: i32 = 10;

pub fn sv_init_cvars(cvars: &mut CvarContext) {
    cvars.get("rcon_password", Some(""), 0);
    cvars.get("protocol", Some(&PROTOCOL_VERSION.to_string()), CVAR_SERVERINFO | CVAR_NOSET);
    cvars.get("maxclients", Some("8"), CVAR_SERVERINFO | CVAR_LATCH);
    cvars.get("hostname", Some("noname"), CVAR_SERVERINFO | CVAR_ARCHIVE);
    cvars.get("mapname", Some(""), CVAR_SERVERINFO | CVAR_NOSET);
    cvars.get("timeout", Some("125"), 0);
    cvars.get("zombietime", Some("2"), 0);
    cvars.get("port", Some(&q2net_common::qcommon::PORT_SERVER.to_string()), CVAR_NOSET);
    cvars.get("sv_fps", Some(&DEFAULT_SV_FPS.to_string()), CVAR_ARCHIVE);
    cvars.get("sv_gravity", Some("800"), 0);
}

impl ServerContext {
    /// Set up a server on `transport` with no level loaded. `cvars` may
    /// already hold values from the command line.
    pub fn new(
        transport: Box<dyn NetTransport>,
        world: Box<dyn CollisionModel + Send>,
        mut cvars: CvarContext,
    ) -> Self {
        sv_init_cvars(&mut cvars);
        cvars.get_latched_vars();

        let maxclients = (cvars.variable_value("maxclients") as usize).clamp(1, MAX_CLIENTS);
        cvars.full_set("maxclients", &maxclients.to_string(), CVAR_SERVERINFO | CVAR_LATCH);

        let mut svs = ServerStatic::default();
        svs.clients = (0..maxclients).map(|_| Client::default()).collect();
        svs.initialized = true;

        log::info!("Server initialized for {} clients on {}", maxclients, transport.local_adr());

        Self {
            sv: Server::default(),
            svs,
            cvars,
            maxclients,
            transport,
            world,
        }
    }
}

// ============================================================
// Configstrings and entities
// ============================================================

/// Set a configstring. Connected clients learn the change over their
/// reliable stream; clients still downloading the level pick it up there.
pub fn sv_set_configstring(ctx: &mut ServerContext, index: usize, value: &str) {
    if index >= MAX_CONFIGSTRINGS {
        log::warn!("configstring: bad index {}", index);
        return;
    }
    let value: String = value.chars().take(MAX_QPATH - 1).collect();
    if ctx.sv.configstrings[index] == value {
        return;
    }
    ctx.sv.configstrings[index] = value;

    if ctx.sv.state == ServerState::Game {
        crate::sv_send::sv_broadcast_configstring(ctx, index);
    }
}

/// Search for `name` among the configstrings `start+1 .. start+max`,
/// adding it if `create` is set. Returns the index relative to `start`,
/// 0 for an empty name or when not found.
pub fn sv_find_index(ctx: &mut ServerContext, name: &str, start: usize, max: usize, create: bool) -> i32 {
    if name.is_empty() {
        return 0;
    }

    let mut i = 1;
    while i < max && !ctx.sv.configstrings[start + i].is_empty() {
        if ctx.sv.configstrings[start + i] == name {
            return i as i32;
        }
        i += 1;
    }

    if !create || i == max {
        if create {
            log::warn!("*Index: overflow");
        }
        return 0;
    }

    sv_set_configstring(ctx, start + i, name);
    i as i32
}

pub fn sv_model_index(ctx: &mut ServerContext, name: &str) -> i32 {
    sv_find_index(ctx, name, CS_MODELS, MAX_MODELS, true)
}

pub fn sv_sound_index(ctx: &mut ServerContext, name: &str) -> i32 {
    sv_find_index(ctx, name, CS_SOUNDS, MAX_SOUNDS, true)
}

/// Put a non-player entity into the world and return its number. Only
/// entities spawned with the level get baselines; later ones are sent
/// against an empty state.
pub fn sv_spawn_entity(ctx: &mut ServerContext, mut s: EntityState) -> Option<i32> {
    let first = ctx.maxclients + 1;
    let index = (first..MAX_EDICTS).find(|&i| !ctx.sv.edicts[i].inuse)?;

    s.number = index as i32;
    ctx.sv.edicts[index] = Edict { inuse: true, s };
    Some(s.number)
}

pub fn sv_free_entity(ctx: &mut ServerContext, number: i32) {
    if number as usize <= ctx.maxclients {
        return;
    }
    if let Some(ed) = ctx.edict_mut(number) {
        *ed = Edict {
            inuse: false,
            s: EntityState::with_number(number),
        };
    }
}

/// Entity baselines are used to compress the update messages to the
/// clients: only the fields that differ from the baseline are sent.
pub fn sv_create_baseline(ctx: &mut ServerContext) {
    for (number, ed) in ctx.sv.edicts.iter().enumerate().skip(1) {
        if !ed.inuse {
            continue;
        }
        if ed.s.modelindex == 0 && ed.s.sound == 0 && ed.s.effects == 0 {
            continue;
        }
        let mut base = ed.s;
        base.number = number as i32;
        base.old_origin = base.origin;
        ctx.sv.baselines[number] = base;
    }
}

// ============================================================
// Level start
// ============================================================

/// Change the server to a new level, taking all connected clients along.
/// `entities` are spawned while loading and get baselines.
pub fn sv_spawn_server(ctx: &mut ServerContext, mapname: &str, entities: &[EntityState]) {
    log::info!("------- Server Initialization -------");
    log::debug!("SpawnServer: {}", mapname);

    ctx.svs.spawncount = ctx.svs.spawncount.wrapping_add(1);
    if ctx.svs.spawncount <= 0 {
        ctx.svs.spawncount = 1;
    }

    let spawn_origin = ctx.sv.spawn_origin;
    ctx.sv = Server::default();
    ctx.sv.spawn_origin = spawn_origin;
    ctx.sv.state = ServerState::Loading;
    ctx.sv.name = mapname.to_string();
    ctx.sv.time = ctx.svs.realtime;

    // leave slots at start for clients only
    for client in ctx.svs.clients.iter_mut() {
        // needs to reconnect
        if client.state > ClientState::Connected {
            client.state = ClientState::Connected;
        }
        client.lastframe = -1;
    }

    ctx.sv.configstrings[CS_NAME] = mapname.chars().take(MAX_QPATH - 1).collect();
    ctx.sv.configstrings[CS_MAXCLIENTS] = ctx.maxclients.to_string();
    ctx.sv.configstrings[CS_MODELS + 1] = format!("maps/{}.bsp", mapname);

    for s in entities {
        if sv_spawn_entity(ctx, *s).is_none() {
            log::warn!("SpawnServer: no free edicts");
            break;
        }
    }
    sv_create_baseline(ctx);

    ctx.cvars.full_set("mapname", mapname, CVAR_SERVERINFO | CVAR_NOSET);
    ctx.sv.state = ServerState::Game;

    log::info!("-------------------------------------");
}

/// Run a map change for clients already in game: tell them, switch
/// levels, then have them fetch the new level on their existing
/// connection.
pub fn sv_map(ctx: &mut ServerContext, mapname: &str, entities: &[EntityState]) {
    let running = ctx.sv.state == ServerState::Game;
    if running {
        sv_broadcast_command(ctx, "changing\n");
        sv_send_client_messages(ctx);
    }

    sv_spawn_server(ctx, mapname, entities);

    if running {
        sv_broadcast_command(ctx, "reconnect\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use q2net_common::cmodel::BoxWorld;
    use q2net_common::net::LoopbackHub;

    fn context() -> ServerContext {
        let hub = LoopbackHub::new();
        let mut cvars = CvarContext::new();
        cvars.get("maxclients", Some("4"), 0);
        ServerContext::new(Box::new(hub.bind(27910)), Box::new(BoxWorld::new()), cvars)
    }

    fn model(index: i32) -> EntityState {
        EntityState {
            modelindex: index,
            origin: [64.0, 0.0, 0.0],
            ..Default::default()
        }
    }

    #[test]
    fn test_new_context() {
        let ctx = context();
        assert_eq!(ctx.maxclients, 4);
        assert_eq!(ctx.svs.clients.len(), 4);
        assert_eq!(ctx.sv.state, ServerState::Dead);
        assert_eq!(ctx.frametime(), 100);
    }

    #[test]
    fn test_spawn_server() {
        let mut ctx = context();
        sv_spawn_server(&mut ctx, "q2dm1", &[model(2), EntityState::default()]);

        assert_eq!(ctx.sv.state, ServerState::Game);
        assert_eq!(ctx.svs.spawncount, 1);
        assert_eq!(ctx.sv.configstrings[CS_NAME], "q2dm1");
        assert_eq!(ctx.sv.configstrings[CS_MAXCLIENTS], "4");
        assert_eq!(ctx.cvars.variable_string("mapname"), "q2dm1");

        // entities start after the player slots
        assert!(ctx.sv.edicts[5].inuse);
        assert_eq!(ctx.sv.baselines[5].modelindex, 2);
        assert_eq!(ctx.sv.baselines[5].number, 5);
        // invisible entities get no baseline
        assert!(ctx.sv.edicts[6].inuse);
        assert_eq!(ctx.sv.baselines[6], EntityState::with_number(6));
    }

    #[test]
    fn test_late_entities_have_no_baseline() {
        let mut ctx = context();
        sv_spawn_server(&mut ctx, "q2dm1", &[]);
        let n = sv_spawn_entity(&mut ctx, model(3)).unwrap();
        assert_eq!(n, 5);
        assert_eq!(ctx.sv.baselines[5].modelindex, 0);

        sv_free_entity(&mut ctx, n);
        assert!(!ctx.sv.edicts[5].inuse);
        sv_free_entity(&mut ctx, 1); // player slots are not ours to free
    }

    #[test]
    fn test_find_index() {
        let mut ctx = context();
        sv_spawn_server(&mut ctx, "q2dm1", &[]);
        // slot 1 holds the map model
        assert_eq!(sv_model_index(&mut ctx, "maps/q2dm1.bsp"), 1);
        assert_eq!(sv_model_index(&mut ctx, "models/box.md2"), 2);
        assert_eq!(sv_model_index(&mut ctx, "models/box.md2"), 2);
        assert_eq!(sv_sound_index(&mut ctx, ""), 0);
        assert_eq!(ctx.sv.configstrings[CS_MODELS + 2], "models/box.md2");
    }
}
