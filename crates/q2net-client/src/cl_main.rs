// cl_main.rs -- client connection lifecycle
//
// Disconnected -> Challenging -> Connecting -> Connected -> Active
//
// The handshake is two connectionless exchanges: `getchallenge` is answered
// with `challenge <n>`, then `connect` (carrying the challenge, our qport and
// userinfo) is answered with `client_connect`, which creates the netchan.
// Sends are retried with a growing interval until the stage's reply comes.
// Level data then arrives over the reliable stream and the first valid frame
// after `begin` makes the client active.

use std::collections::VecDeque;

use rand::Rng;

use q2net_common::cmd::CmdArgs;
use q2net_common::cmodel::{BoxWorld, CollisionModel};
use q2net_common::common::{msg_begin_reading, msg_read_long, msg_read_string, msg_read_string_line, msg_write_byte, msg_write_string};
use q2net_common::cvar::CvarContext;
use q2net_common::error::DropReason;
use q2net_common::net::{net_send_packet, net_string_to_server_adr, NetAdr, NetTransport};
use q2net_common::net_chan::*;
use q2net_common::q_shared::*;
use q2net_common::qcommon::{ClcOps, SizeBuf, PRINT_HIGH, PROTOCOL_VERSION};

use crate::client::*;

/// Longest wait between handshake retries, as a multiple of `cl_resend`.
const MAX_RESEND_SCALE: u32 = 4;

/// Consecutive late frames before the connection is declared dead.
const TIMEOUT_FRAMES: i32 = 5;

pub struct Client {
    pub cls: ClientStatic,
    pub cl: ClientState,
    pub cvars: CvarContext,
    pub(crate) transport: Box<dyn NetTransport>,
    /// Static geometry used for prediction.
    pub(crate) world: Box<dyn CollisionModel + Send>,
    events: VecDeque<ClientEvent>,
}

/// Connectionless commands a server may send us.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectionlessCommand {
    Challenge(i32),
    ClientConnect,
    Print,
    Info,
    Ping,
    Ack,
    Echo(String),
    Unknown(String),
}

impl ConnectionlessCommand {
    fn parse(cmd: &CmdArgs) -> Self {
        match cmd.argv(0) {
            "challenge" => ConnectionlessCommand::Challenge(cmd.argv(1).parse().unwrap_or(0)),
            "client_connect" => ConnectionlessCommand::ClientConnect,
            "print" => ConnectionlessCommand::Print,
            "info" => ConnectionlessCommand::Info,
            "ping" => ConnectionlessCommand::Ping,
            "ack" => ConnectionlessCommand::Ack,
            "echo" => ConnectionlessCommand::Echo(cmd.args().to_string()),
            other => ConnectionlessCommand::Unknown(other.to_string()),
        }
    }
}

// ============================================================
// Setup
// ============================================================

pub fn cl_init_cvars(cvars: &mut CvarContext) {
    cvars.get("cl_timeout", Some("120"), 0);
    cvars.get("cl_resend", Some("3000"), 0);
    cvars.get("cl_predict", Some("1"), 0);
    cvars.get("cl_predict_metric", Some("axis"), 0);
    cvars.get("cl_predict_epsilon", Some("0.125"), 0);
    cvars.get("cl_showmiss", Some("0"), 0);

    // a random port so a NAT rewriting our source port does not lose us
    let port = rand::thread_rng().gen_range(1..=255u16).to_string();
    cvars.get("qport", Some(&port), CVAR_NOSET);

    cvars.get("name", Some("unnamed"), CVAR_USERINFO | CVAR_ARCHIVE);
    cvars.get("skin", Some("male/grunt"), CVAR_USERINFO | CVAR_ARCHIVE);
    cvars.get("rate", Some("25000"), CVAR_USERINFO | CVAR_ARCHIVE);
    cvars.get("msg", Some("1"), CVAR_USERINFO | CVAR_ARCHIVE);
}

impl Client {
    pub fn new(transport: Box<dyn NetTransport>) -> Self {
        let mut cvars = CvarContext::new();
        cl_init_cvars(&mut cvars);
        Self {
            cls: ClientStatic::default(),
            cl: ClientState::new(),
            cvars,
            transport,
            world: Box::new(BoxWorld::new()),
            events: VecDeque::new(),
        }
    }

    /// Geometry of the current map, for prediction.
    pub fn set_world(&mut self, world: Box<dyn CollisionModel + Send>) {
        self.world = world;
    }

    pub fn state(&self) -> ConnState {
        self.cls.state
    }

    pub fn netchan(&self) -> Option<&NetChan> {
        self.cls.netchan.as_ref()
    }

    pub fn local_adr(&self) -> NetAdr {
        self.transport.local_adr()
    }

    pub fn poll_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        self.events.drain(..).collect()
    }

    pub(crate) fn push_event(&mut self, event: ClientEvent) {
        log::trace!("event {:?}", event);
        self.events.push_back(event);
    }

    /// Run one client frame: take in everything that arrived, then check
    /// the timeout and the handshake timers.
    pub fn frame(&mut self, realtime: i32) {
        self.cls.realtime = realtime;
        self.read_packets();
        self.check_timeout();
        self.check_for_resend(realtime);
    }

    // ============================================================
    // Connecting
    // ============================================================

    /// Start connecting to `server`, dropping any current connection first.
    pub fn connect(&mut self, server: &str, realtime: i32) -> Result<(), DropReason> {
        self.cls.realtime = realtime;

        let Some(adr) = net_string_to_server_adr(server) else {
            log::warn!("Bad server address {}", server);
            let reason = DropReason::BadServerAddress(server.to_string());
            self.cls.last_drop = Some(reason.clone());
            return Err(reason);
        };

        if self.cls.state != ConnState::Disconnected {
            self.disconnect();
        }

        self.cls.servername = server.to_string();
        self.cls.server_address = Some(adr);
        self.cls.quake_port = self.cvars.variable_value("qport") as u16;
        self.cls.challenge = 0;
        self.enter_handshake(ConnState::Challenging);

        log::info!("Connecting to {}...", server);
        self.check_for_resend(realtime);
        Ok(())
    }

    fn enter_handshake(&mut self, state: ConnState) {
        self.cls.state = state;
        self.cls.connect_time = None;
        self.cls.connect_count = 0;
    }

    /// Interval before the next handshake retry: `cl_resend` after the
    /// first send, doubling up to four times that.
    pub fn resend_interval(&self) -> i32 {
        let base = self.cvars.variable_value("cl_resend").max(100.0) as i32;
        let scale = 1u32 << self.cls.connect_count.saturating_sub(1).min(2);
        base * scale.min(MAX_RESEND_SCALE) as i32
    }

    /// Send the pending handshake packet if its retry timer has expired.
    pub fn check_for_resend(&mut self, realtime: i32) {
        self.cls.realtime = realtime;
        if !matches!(self.cls.state, ConnState::Challenging | ConnState::Connecting) {
            return;
        }
        let Some(adr) = self.cls.server_address else {
            return;
        };
        if let Some(last) = self.cls.connect_time {
            if realtime - last < self.resend_interval() {
                return;
            }
        }

        self.cls.connect_time = Some(realtime);
        self.cls.connect_count += 1;

        if self.cls.state == ConnState::Challenging {
            log::debug!("Requesting challenge from {} ({})", adr, self.cls.connect_count);
            netchan_out_of_band_print(&*self.transport, &adr, "getchallenge\n");
        } else {
            self.send_connect_packet(&adr);
        }
    }

    fn send_connect_packet(&mut self, adr: &NetAdr) {
        // the server gets the current userinfo here, so no update is pending
        self.cvars.userinfo_modified = false;
        let text = format!(
            "connect {} {} {} \"{}\"\n",
            PROTOCOL_VERSION,
            self.cls.quake_port,
            self.cls.challenge,
            self.cvars.userinfo()
        );
        log::debug!("Sending connect to {} ({})", adr, self.cls.connect_count);
        netchan_out_of_band_print(&*self.transport, adr, &text);
    }

    /// Send a connectionless text command, e.g. `info 1` to query a server.
    pub fn send_connectionless(&self, to: &NetAdr, text: &str) {
        netchan_out_of_band_print(&*self.transport, to, text);
    }

    // ============================================================
    // Disconnecting
    // ============================================================

    /// Leave the server, telling it so. Harmless when not connected.
    pub fn disconnect(&mut self) {
        if self.cls.state == ConnState::Disconnected {
            return;
        }
        self.drop_connection(DropReason::UserDisconnect);
    }

    /// The single teardown path. Sends `disconnect` a few times if there is
    /// a channel, resets all connection state and reports `reason`.
    pub(crate) fn drop_connection(&mut self, reason: DropReason) {
        if let Some(mut chan) = self.cls.netchan.take() {
            let mut msg = SizeBuf::new(32);
            msg_write_byte(&mut msg, ClcOps::StringCmd as i32);
            msg_write_string(&mut msg, "disconnect");

            // whatever was staged is moot, and may be what overflowed
            chan.message.clear();
            chan.reliable_buf.clear();
            for _ in 0..3 {
                if let Ok(packet) = netchan_transmit(&mut chan, msg.as_slice(), self.cls.realtime) {
                    net_send_packet(&*self.transport, &packet, &chan.remote_address);
                }
            }
        }

        match reason {
            DropReason::UserDisconnect => log::info!("Disconnected from {}", self.cls.servername),
            _ => log::warn!("{}: {}", self.cls.servername, reason),
        }

        self.cls.state = ConnState::Disconnected;
        self.cls.connect_time = None;
        self.cls.connect_count = 0;
        self.cls.challenge = 0;
        self.cl.clear();

        self.cls.last_drop = Some(reason.clone());
        self.push_event(ClientEvent::Disconnected(reason));
    }

    fn rejected(&mut self, text: String) {
        log::warn!("Connection refused: {}", text.trim_end());
        self.cls.netchan = None;
        self.cls.state = ConnState::Disconnected;
        self.cls.connect_time = None;
        self.cls.connect_count = 0;
        self.cl.clear();
        self.cls.last_drop = Some(DropReason::Rejected(text.clone()));
        self.push_event(ClientEvent::Rejected(text));
    }

    /// Throw away the channel without telling the server and start over
    /// with the challenge we already hold.
    pub(crate) fn restart_connect(&mut self) {
        self.cls.netchan = None;
        self.cl.clear();
        self.enter_handshake(ConnState::Connecting);
    }

    /// Full reconnect from scratch: leave, then ask for a new challenge.
    pub(crate) fn reconnect(&mut self) {
        if self.cls.server_address.is_none() {
            return;
        }
        if self.cls.state >= ConnState::Connected {
            self.drop_connection(DropReason::UserDisconnect);
        }
        self.enter_handshake(ConnState::Challenging);
    }

    fn check_timeout(&mut self) {
        if self.cls.state < ConnState::Connected {
            return;
        }
        let Some(chan) = self.cls.netchan.as_ref() else {
            return;
        };

        let timeout = (self.cvars.variable_value("cl_timeout") * 1000.0) as i32;
        if self.cls.realtime - chan.last_received > timeout {
            self.cl.timeoutcount += 1;
            if self.cl.timeoutcount > TIMEOUT_FRAMES {
                self.drop_connection(DropReason::TimedOut);
            }
        } else {
            self.cl.timeoutcount = 0;
        }
    }

    // ============================================================
    // Packet reading
    // ============================================================

    pub fn read_packets(&mut self) {
        while let Some((from, data)) = self.transport.get_packet() {
            if is_out_of_band(&data) {
                self.connectionless_packet(&from, &data);
                continue;
            }

            if self.cls.state < ConnState::Connected {
                continue; // dump it while connecting
            }
            let realtime = self.cls.realtime;
            let Some(chan) = self.cls.netchan.as_mut() else {
                continue;
            };

            if data.len() < 8 {
                log::debug!("{}: Runt packet", from);
                continue;
            }
            if from != chan.remote_address {
                log::debug!("{}: sequenced packet without connection", from);
                continue;
            }

            let mut msg = SizeBuf::from_bytes(&data);
            if !netchan_process(chan, &mut msg, realtime).is_accepted() {
                continue; // wasn't accepted for some reason
            }

            if let Err(reason) = self.parse_server_message(&mut msg) {
                self.drop_connection(reason);
            }
        }
    }

    fn connectionless_packet(&mut self, from: &NetAdr, data: &[u8]) {
        let mut msg = SizeBuf::from_bytes(data);
        msg_begin_reading(&mut msg);
        if !matches!(msg_read_long(&mut msg), Ok(-1)) {
            return;
        }

        let line = msg_read_string_line(&mut msg).unwrap_or_default();
        let cmd = CmdArgs::tokenize(&line);
        log::debug!("{}: {}", from, cmd.argv(0));

        let from_server = self.cls.server_address.as_ref() == Some(from);

        match ConnectionlessCommand::parse(&cmd) {
            ConnectionlessCommand::Challenge(challenge) => {
                if self.cls.state != ConnState::Challenging || !from_server {
                    log::debug!("{}: unexpected challenge", from);
                    return;
                }
                self.cls.challenge = challenge;
                self.enter_handshake(ConnState::Connecting);
                self.check_for_resend(self.cls.realtime);
            }
            ConnectionlessCommand::ClientConnect => {
                if self.cls.state >= ConnState::Connected {
                    log::debug!("Dup connect received.  Ignored.");
                    return;
                }
                if self.cls.state != ConnState::Connecting || !from_server {
                    log::debug!("{}: unexpected client_connect", from);
                    return;
                }
                let mut chan = netchan_setup(NetSrc::Client, *from, self.cls.quake_port, self.cls.realtime);
                msg_write_byte(&mut chan.message, ClcOps::StringCmd as i32);
                msg_write_string(&mut chan.message, "new");
                self.cls.netchan = Some(chan);
                self.cls.state = ConnState::Connected;
                self.cls.connect_time = None;
                log::info!("Connected to {}", self.cls.servername);
                self.push_event(ClientEvent::Connected);
            }
            ConnectionlessCommand::Print => {
                let text = msg_read_string(&mut msg).unwrap_or_default();
                if from_server && matches!(self.cls.state, ConnState::Challenging | ConnState::Connecting) {
                    self.rejected(text);
                } else {
                    self.push_event(ClientEvent::Print { level: PRINT_HIGH, text });
                }
            }
            ConnectionlessCommand::Info => {
                let text = msg_read_string(&mut msg).unwrap_or_default();
                self.push_event(ClientEvent::ServerInfo(text));
            }
            ConnectionlessCommand::Ping => {
                netchan_out_of_band_print(&*self.transport, from, "ack");
            }
            ConnectionlessCommand::Ack => {}
            ConnectionlessCommand::Echo(text) => {
                netchan_out_of_band_print(&*self.transport, from, &text);
            }
            ConnectionlessCommand::Unknown(name) => {
                log::debug!("{}: unknown connectionless command {}", from, name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use q2net_common::net::LoopbackHub;
    use q2net_common::net_chan::netchan_out_of_band_data;

    const SERVER: u16 = 27910;

    fn client(hub: &LoopbackHub) -> Client {
        let mut cl = Client::new(Box::new(hub.bind(27901)));
        cl.cvars.force_set("qport", "7");
        cl
    }

    fn read_oob(server: &dyn NetTransport) -> Option<String> {
        let (_, data) = server.get_packet()?;
        assert!(is_out_of_band(&data));
        Some(String::from_utf8_lossy(&data[4..]).into_owned())
    }

    fn reply(server: &dyn NetTransport, text: &str) {
        let packet = netchan_out_of_band_data(text.as_bytes());
        server.send_packet(&packet, &NetAdr::Loopback(27901)).unwrap();
    }

    #[test]
    fn test_bad_address() {
        let hub = LoopbackHub::new();
        let mut cl = client(&hub);
        let err = cl.connect("loopback:notaport", 0).unwrap_err();
        assert_eq!(err, DropReason::BadServerAddress("loopback:notaport".into()));
        assert_eq!(cl.state(), ConnState::Disconnected);
    }

    #[test]
    fn test_handshake() {
        let hub = LoopbackHub::new();
        let server = hub.bind(SERVER);
        let mut cl = client(&hub);

        cl.connect("loopback:27910", 0).unwrap();
        assert_eq!(cl.state(), ConnState::Challenging);
        assert_eq!(read_oob(&server).as_deref(), Some("getchallenge\n"));

        reply(&server, "challenge 1234");
        cl.frame(10);
        assert_eq!(cl.state(), ConnState::Connecting);
        let connect = read_oob(&server).unwrap();
        let args = CmdArgs::tokenize(&connect);
        assert_eq!(args.argv(0), "connect");
        assert_eq!(args.argv(1), PROTOCOL_VERSION.to_string());
        assert_eq!(args.argv(2), "7");
        assert_eq!(args.argv(3), "1234");
        assert!(args.argv(4).contains("\\name\\unnamed"));

        reply(&server, "client_connect");
        cl.frame(20);
        assert_eq!(cl.state(), ConnState::Connected);
        assert_eq!(cl.poll_event(), Some(ClientEvent::Connected));
        assert!(netchan_need_reliable(cl.netchan().unwrap()));
    }

    #[test]
    fn test_resend_backoff() {
        let hub = LoopbackHub::new();
        let server = hub.bind(SERVER);
        let mut cl = client(&hub);

        cl.connect("loopback:27910", 0).unwrap();
        assert!(read_oob(&server).is_some());

        cl.frame(2999);
        assert!(read_oob(&server).is_none());
        cl.frame(3000);
        assert!(read_oob(&server).is_some());

        // second retry waits twice as long
        cl.frame(3000 + 5999);
        assert!(read_oob(&server).is_none());
        cl.frame(3000 + 6000);
        assert!(read_oob(&server).is_some());

        // and never more than four times
        assert_eq!(cl.resend_interval(), 12000);
        cl.cls.connect_count = 10;
        assert_eq!(cl.resend_interval(), 12000);
    }

    #[test]
    fn test_rejection() {
        let hub = LoopbackHub::new();
        let server = hub.bind(SERVER);
        let mut cl = client(&hub);

        cl.connect("loopback:27910", 0).unwrap();
        reply(&server, "challenge 99");
        cl.frame(10);
        reply(&server, "print\nServer is full.\n");
        cl.frame(20);

        assert_eq!(cl.state(), ConnState::Disconnected);
        assert!(cl.netchan().is_none());
        assert_eq!(cl.poll_event(), Some(ClientEvent::Rejected("Server is full.\n".into())));
        assert_eq!(cl.poll_event(), None);
        assert_eq!(cl.cls.last_drop, Some(DropReason::Rejected("Server is full.\n".into())));
    }

    #[test]
    fn test_ignores_strangers() {
        let hub = LoopbackHub::new();
        let _server = hub.bind(SERVER);
        let stranger = hub.bind(4000);
        let mut cl = client(&hub);

        cl.connect("loopback:27910", 0).unwrap();
        reply(&stranger, "challenge 5");
        reply(&stranger, "client_connect");
        cl.frame(10);
        assert_eq!(cl.state(), ConnState::Challenging);
    }

    #[test]
    fn test_empty_connectionless_packet() {
        let hub = LoopbackHub::new();
        let server = hub.bind(SERVER);
        let mut cl = client(&hub);

        cl.connect("loopback:27910", 0).unwrap();
        reply(&server, "");
        cl.frame(10);
        assert_eq!(cl.state(), ConnState::Challenging);
        assert_eq!(cl.poll_event(), None);
    }

    #[test]
    fn test_ping_and_info() {
        let hub = LoopbackHub::new();
        let other = hub.bind(4000);
        let mut cl = client(&hub);

        reply(&other, "ping");
        reply(&other, "info\nbase1 0/8\n");
        cl.frame(0);
        assert_eq!(read_oob(&other).as_deref(), Some("ack"));
        assert_eq!(cl.poll_event(), Some(ClientEvent::ServerInfo("base1 0/8\n".into())));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let hub = LoopbackHub::new();
        let server = hub.bind(SERVER);
        let mut cl = client(&hub);

        cl.disconnect();
        assert_eq!(cl.poll_event(), None);

        cl.connect("loopback:27910", 0).unwrap();
        reply(&server, "challenge 1");
        cl.frame(1);
        reply(&server, "client_connect");
        cl.frame(2);
        while server.get_packet().is_some() {}
        cl.drain_events();

        cl.disconnect();
        assert_eq!(cl.state(), ConnState::Disconnected);
        assert!(cl.netchan().is_none());
        assert_eq!(cl.poll_event(), Some(ClientEvent::Disconnected(DropReason::UserDisconnect)));

        // three sequenced disconnect notices
        let mut sent = 0;
        while let Some((_, data)) = server.get_packet() {
            assert!(!is_out_of_band(&data));
            sent += 1;
        }
        assert_eq!(sent, 3);

        cl.disconnect();
        assert_eq!(cl.poll_event(), None);
    }

    #[test]
    fn test_timeout() {
        let hub = LoopbackHub::new();
        let server = hub.bind(SERVER);
        let mut cl = client(&hub);
        cl.cvars.set("cl_timeout", "1");

        cl.connect("loopback:27910", 0).unwrap();
        reply(&server, "challenge 1");
        cl.frame(1);
        reply(&server, "client_connect");
        cl.frame(2);
        cl.drain_events();

        for t in 0..TIMEOUT_FRAMES {
            cl.frame(2000 + t);
            assert_eq!(cl.state(), ConnState::Connected);
        }
        cl.frame(2100);
        assert_eq!(cl.state(), ConnState::Disconnected);
        assert_eq!(cl.poll_event(), Some(ClientEvent::Disconnected(DropReason::TimedOut)));
    }
}
