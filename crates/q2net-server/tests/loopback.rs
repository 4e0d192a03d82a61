// End-to-end sessions between real clients and a server over the
// in-process loopback network.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use q2net_client::{Client, ClientEvent, ConnState};
use q2net_common::cmd::CmdArgs;
use q2net_common::cmodel::BoxWorld;
use q2net_common::common::{msg_write_byte, msg_write_string};
use q2net_common::cvar::CvarContext;
use q2net_common::error::DropReason;
use q2net_common::net::{LoopbackHub, LoopbackTransport, NetAdr, NetTransport};
use q2net_common::net_chan::{is_out_of_band, netchan_setup, netchan_transmit, NetSrc};
use q2net_common::q_shared::UserCmd;
use q2net_common::q_shared::CS_NAME;
use q2net_common::qcommon::ClcOps;
use q2net_server::{sv_execute_command, sv_frame, sv_map, sv_spawn_server, ClientState, ServerContext};

const SERVER_PORT: u16 = 27910;
const TICK: i32 = 25;

/// Drops and reorders sequenced packets once switched on. Handshake
/// packets always go through.
struct FlakyLink {
    inner: LoopbackTransport,
    enabled: Arc<AtomicBool>,
    drop_every: usize,
    swap_pairs: bool,
    sent: AtomicUsize,
    held: Mutex<Option<(Vec<u8>, NetAdr)>>,
}

impl FlakyLink {
    fn new(inner: LoopbackTransport, enabled: Arc<AtomicBool>, drop_every: usize, swap_pairs: bool) -> Self {
        Self {
            inner,
            enabled,
            drop_every,
            swap_pairs,
            sent: AtomicUsize::new(0),
            held: Mutex::new(None),
        }
    }
}

impl NetTransport for FlakyLink {
    fn send_packet(&self, data: &[u8], to: &NetAdr) -> io::Result<()> {
        if is_out_of_band(data) || !self.enabled.load(Ordering::Relaxed) {
            return self.inner.send_packet(data, to);
        }

        let n = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        if self.drop_every > 0 && n % self.drop_every == 0 {
            return Ok(());
        }
        if !self.swap_pairs {
            return self.inner.send_packet(data, to);
        }

        let mut held = self.held.lock();
        match held.take() {
            Some((earlier, adr)) => {
                self.inner.send_packet(data, to)?;
                self.inner.send_packet(&earlier, &adr)
            }
            None => {
                *held = Some((data.to_vec(), *to));
                Ok(())
            }
        }
    }

    fn get_packet(&self) -> Option<(NetAdr, Vec<u8>)> {
        self.inner.get_packet()
    }

    fn local_adr(&self) -> NetAdr {
        self.inner.local_adr()
    }
}

struct Session {
    hub: LoopbackHub,
    server: ServerContext,
    clients: Vec<Client>,
    time: i32,
}

fn server_cvars(maxclients: &str) -> CvarContext {
    let mut cvars = CvarContext::new();
    cvars.get("maxclients", Some(maxclients), 0);
    cvars.get("hostname", Some("loopback test"), 0);
    cvars
}

fn new_client(transport: Box<dyn NetTransport>, qport: u16, name: &str) -> Client {
    let mut client = Client::new(transport);
    client.cvars.force_set("qport", &qport.to_string());
    client.cvars.set("name", name);
    client.set_world(Box::new(BoxWorld::with_floor(0.0)));
    client
}

impl Session {
    fn new(maxclients: &str) -> Self {
        let hub = LoopbackHub::new();
        let transport = hub.bind(SERVER_PORT);
        Self::with_transport(hub, Box::new(transport), maxclients)
    }

    fn with_transport(hub: LoopbackHub, transport: Box<dyn NetTransport>, maxclients: &str) -> Self {
        let mut server = ServerContext::new(transport, Box::new(BoxWorld::with_floor(0.0)), server_cvars(maxclients));
        sv_spawn_server(&mut server, "base1", &[]);
        Self {
            hub,
            server,
            clients: Vec::new(),
            time: 0,
        }
    }

    /// Add a client on its own port and start it connecting.
    fn connect(&mut self, name: &str) -> usize {
        let n = self.clients.len() as u16;
        let transport = self.hub.bind(27901 + n);
        self.connect_with(Box::new(transport), name)
    }

    fn connect_with(&mut self, transport: Box<dyn NetTransport>, name: &str) -> usize {
        let n = self.clients.len() as u16;
        let mut client = new_client(transport, 10 + n, name);
        client
            .connect(&format!("loopback:{}", SERVER_PORT), self.time)
            .expect("loopback address");
        self.clients.push(client);
        self.clients.len() - 1
    }

    /// One tick of everything: clients read and send, the server runs.
    fn tick(&mut self, cmd: &UserCmd) {
        self.time += TICK;
        for client in self.clients.iter_mut() {
            client.frame(self.time);
            client.send_cmd(cmd);
        }
        sv_frame(&mut self.server, TICK);
    }

    fn run(&mut self, ticks: usize, cmd: &UserCmd) {
        for _ in 0..ticks {
            self.tick(cmd);
        }
    }

    /// Tick until `client` is active, or give up after a minute.
    fn run_until_active(&mut self, client: usize) -> bool {
        for _ in 0..(60_000 / TICK) {
            if self.clients[client].state() == ConnState::Active {
                return true;
            }
            self.tick(&idle());
        }
        false
    }
}

fn idle() -> UserCmd {
    UserCmd {
        msec: TICK as u8,
        ..Default::default()
    }
}

fn forward() -> UserCmd {
    UserCmd {
        msec: TICK as u8,
        forwardmove: 200,
        ..Default::default()
    }
}

#[test]
fn client_becomes_active() {
    let mut s = Session::new("4");
    let c = s.connect("grunt");
    assert!(s.run_until_active(c));

    let events = s.clients[c].drain_events();
    assert!(events.contains(&ClientEvent::Connected));
    assert!(events.contains(&ClientEvent::Active));

    let client = &s.clients[c];
    assert_eq!(client.cl.servercount, s.server.svs.spawncount);
    assert_eq!(client.cl.levelname, "base1");
    assert_eq!(client.cl.playernum, 0);
    assert_eq!(client.cl.configstrings[CS_NAME], "base1");

    let slot = &s.server.svs.clients[0];
    assert_eq!(slot.state, ClientState::Spawned);
    assert_eq!(slot.name, "grunt");
    assert_eq!(slot.netchan.qport, 10);
}

#[test]
fn sequenced_packets_need_a_connection() {
    let mut s = Session::new("4");
    let stranger = s.hub.bind(4000);

    // a netchan the server never agreed to
    let mut chan = netchan_setup(NetSrc::Client, NetAdr::Loopback(SERVER_PORT), 99, 0);
    msg_write_byte(&mut chan.message, ClcOps::StringCmd as i32);
    msg_write_string(&mut chan.message, "new");
    let packet = netchan_transmit(&mut chan, &[], 0).unwrap();
    stranger.send_packet(&packet, &NetAdr::Loopback(SERVER_PORT)).unwrap();

    s.run(10, &idle());
    assert!(stranger.get_packet().is_none());
    assert!(s.server.svs.clients.iter().all(|cl| cl.state == ClientState::Free));
}

#[test]
fn full_server_rejects() {
    let mut s = Session::new("2");
    let a = s.connect("a");
    let b = s.connect("b");
    assert!(s.run_until_active(a));
    assert!(s.run_until_active(b));

    let c = s.connect("c");
    s.run(20, &idle());

    let client = &mut s.clients[c];
    assert_eq!(client.state(), ConnState::Disconnected);
    assert!(client.netchan().is_none());
    assert!(client
        .drain_events()
        .contains(&ClientEvent::Rejected("Server is full.\n".into())));
    assert_eq!(s.server.clients_in(ClientState::Connected).len(), 2);
}

#[test]
fn prediction_matches_server() {
    let mut s = Session::new("4");
    let c = s.connect("runner");
    assert!(s.run_until_active(c));

    s.run(80, &forward());

    let stats = s.clients[c].cl.prediction_stats;
    assert!(stats.checks > 0);
    assert_eq!(stats.misses, 0);

    let ps = &s.server.svs.clients[0].ps;
    assert!(ps.pmove.origin[0] > 0);
    // the entity everyone else sees follows the player
    assert_eq!(s.server.sv.edicts[1].s.origin, ps.pmove.origin_f32());
}

#[test]
fn survives_loss_and_reordering() {
    let hub = LoopbackHub::new();
    let flaky = Arc::new(AtomicBool::new(false));

    // server to client packets arrive swapped; client to server every
    // fourth one is lost
    let server_link = FlakyLink::new(hub.bind(SERVER_PORT), flaky.clone(), 0, true);
    let mut s = Session::with_transport(hub.clone(), Box::new(server_link), "4");
    let client_link = FlakyLink::new(hub.bind(27901), flaky.clone(), 4, false);
    let c = s.connect_with(Box::new(client_link), "lossy");
    assert!(s.run_until_active(c));

    flaky.store(true, Ordering::Relaxed);
    s.run(200, &forward());

    assert_eq!(s.clients[c].state(), ConnState::Active);
    let slot = &s.server.svs.clients[0];
    assert_eq!(slot.state, ClientState::Spawned);
    assert!(slot.netchan.total_dropped > 0);
    assert!(s.clients[c].netchan().unwrap().total_dropped > 0);

    // the server ran every command the client sent, so prediction holds
    let stats = s.clients[c].cl.prediction_stats;
    assert!(stats.checks > 0);
    assert_eq!(stats.misses, 0);
    assert!(slot.ps.pmove.origin[0] > 0);

    // reliable data still gets through
    sv_execute_command(&mut s.server, &CmdArgs::tokenize("say hello"));
    s.run(40, &forward());
    let events = s.clients[c].drain_events();
    assert!(events.iter().any(|e| matches!(e, ClientEvent::Print { text, .. } if text == "console: hello\n")));
}

#[test]
fn silent_client_times_out() {
    let mut s = Session::new("4");
    let c = s.connect("quiet");
    assert!(s.run_until_active(c));

    // the client goes away without a word
    s.clients.clear();
    for _ in 0..(120_000 / 100) {
        sv_frame(&mut s.server, 100);
    }
    assert_eq!(s.server.svs.clients[0].state, ClientState::Spawned);
    for _ in 0..(10_000 / 100) {
        sv_frame(&mut s.server, 100);
    }
    assert_eq!(s.server.svs.clients[0].state, ClientState::Free);
}

#[test]
fn client_times_out_on_silent_server() {
    let mut s = Session::new("4");
    let c = s.connect("patient");
    assert!(s.run_until_active(c));

    let mut time = s.time;
    let client = &mut s.clients[c];
    for _ in 0..200 {
        time += 1000;
        client.frame(time);
    }
    assert_eq!(client.state(), ConnState::Disconnected);
    assert!(client
        .drain_events()
        .contains(&ClientEvent::Disconnected(DropReason::TimedOut)));
}

#[test]
fn kick_disconnects_client() {
    let mut s = Session::new("4");
    let c = s.connect("victim");
    assert!(s.run_until_active(c));

    let out = sv_execute_command(&mut s.server, &CmdArgs::tokenize("kick victim"));
    assert_eq!(out, "");
    s.run(10, &idle());

    assert_eq!(s.clients[c].state(), ConnState::Disconnected);
    assert!(s.clients[c]
        .drain_events()
        .contains(&ClientEvent::Disconnected(DropReason::ServerDisconnected)));
}

#[test]
fn map_change_keeps_clients() {
    let mut s = Session::new("4");
    let a = s.connect("a");
    let b = s.connect("b");
    assert!(s.run_until_active(a));
    assert!(s.run_until_active(b));
    s.clients.iter_mut().for_each(|c| {
        c.drain_events();
    });

    sv_map(&mut s.server, "q2dm2", &[]);
    assert!(s.server.clients_in(ClientState::Spawned).is_empty());
    assert_eq!(s.server.clients_in(ClientState::Connected).len(), 2);

    // the clients hear "changing" and drop back to loading
    s.run(4, &idle());
    assert!(s.clients.iter().all(|c| c.state() == ConnState::Connected));

    assert!(s.run_until_active(a));
    assert!(s.run_until_active(b));
    for client in s.clients.iter_mut() {
        assert_eq!(client.cl.levelname, "q2dm2");
        assert_eq!(client.cl.servercount, 2);
        assert!(client.drain_events().contains(&ClientEvent::Active));
    }
    assert_eq!(s.server.clients_in(ClientState::Spawned).len(), 2);
}
