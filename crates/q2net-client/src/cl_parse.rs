// cl_parse.rs -- parse a message received from the server

use q2net_common::cmd::cmd_tokenize_lines;
use q2net_common::common::{msg_peek_byte, msg_read_byte, msg_read_long, msg_read_short, msg_read_string};
use q2net_common::delta::msg_read_sound;
use q2net_common::error::{DropReason, ProtocolError};
use q2net_common::q_shared::*;
use q2net_common::qcommon::{SizeBuf, SvcOps, PROTOCOL_VERSION};

use crate::cl_ents::{cl_parse_baseline, cl_parse_frame};
use crate::cl_main::Client;
use crate::cl_pred::check_prediction_error;
use crate::client::*;

impl Client {
    /// Dispatch every command in `msg`. An error ends the connection with
    /// the returned reason.
    pub(crate) fn parse_server_message(&mut self, msg: &mut SizeBuf) -> Result<(), DropReason> {
        while msg_peek_byte(msg).is_some() {
            let byte = msg_read_byte(msg)?;
            let op = SvcOps::try_from(byte).map_err(ProtocolError::BadCommand)?;
            log::trace!("{:3}:{}", msg.readcount - 1, op.name());

            match op {
                SvcOps::Nop => {}

                SvcOps::Disconnect => return Err(DropReason::ServerDisconnected),

                SvcOps::Reconnect => {
                    log::info!("Server disconnected, reconnecting");
                    self.restart_connect();
                    // nothing after this belongs to the old connection
                    return Ok(());
                }

                SvcOps::Print => {
                    let level = msg_read_byte(msg)?;
                    let text = msg_read_string(msg)?;
                    self.push_event(ClientEvent::Print { level, text });
                }

                SvcOps::CenterPrint => {
                    let text = msg_read_string(msg)?;
                    self.push_event(ClientEvent::CenterPrint(text));
                }

                SvcOps::StuffText => {
                    let text = msg_read_string(msg)?;
                    log::debug!("stufftext: {}", text.trim_end());
                    self.parse_stuff_text(&text);
                    if self.cls.state < ConnState::Connected {
                        return Ok(());
                    }
                }

                SvcOps::ServerData => self.parse_server_data(msg)?,

                SvcOps::ConfigString => self.parse_config_string(msg)?,

                SvcOps::SpawnBaseline => cl_parse_baseline(&mut self.cl, msg)?,

                SvcOps::Sound => {
                    let sound = msg_read_sound(msg)?;
                    self.push_event(ClientEvent::Sound(sound));
                }

                SvcOps::Frame => self.parse_frame(msg)?,

                // only legal inside a frame
                SvcOps::PlayerInfo | SvcOps::PacketEntities => {
                    return Err(ProtocolError::IllegalCommand {
                        cmd: op.name(),
                        state: "outside a frame",
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    fn parse_server_data(&mut self, msg: &mut SizeBuf) -> Result<(), ProtocolError> {
        log::debug!("Serverdata packet received.");

        // wipe the level but keep the connection
        self.cl.clear();
        self.cls.state = ConnState::Connected;

        let protocol = msg_read_long(msg)?;
        if protocol != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                server: protocol,
                client: PROTOCOL_VERSION,
            });
        }

        self.cl.servercount = msg_read_long(msg)?;
        self.cl.attractloop = msg_read_byte(msg)? != 0;
        self.cl.gamedir = msg_read_string(msg)?;
        self.cl.playernum = msg_read_short(msg)? as i32;
        self.cl.levelname = msg_read_string(msg)?;
        self.cl.serverdata = true;

        log::info!("{} (servercount {})", self.cl.levelname, self.cl.servercount);
        Ok(())
    }

    fn parse_config_string(&mut self, msg: &mut SizeBuf) -> Result<(), ProtocolError> {
        let index = msg_read_short(msg)? as i32;
        if index < 0 || index as usize >= MAX_CONFIGSTRINGS {
            return Err(ProtocolError::BadConfigStringIndex(index));
        }
        let value = msg_read_string(msg)?;
        self.cl.configstrings[index as usize] = value.clone();
        self.push_event(ClientEvent::ConfigString {
            index: index as usize,
            value,
        });
        Ok(())
    }

    fn parse_frame(&mut self, msg: &mut SizeBuf) -> Result<(), ProtocolError> {
        if !self.cl.serverdata {
            return Err(ProtocolError::IllegalCommand {
                cmd: SvcOps::Frame.name(),
                state: "before serverdata",
            });
        }

        cl_parse_frame(&mut self.cl, msg)?;
        if !self.cl.frame.valid {
            return Ok(());
        }

        if self.cls.state == ConnState::Connected && self.cl.begin_sent {
            self.cls.state = ConnState::Active;
            self.cl.predicted_state = self.cl.frame.playerstate.pmove;
            self.cl.predicted_origin = self.cl.predicted_state.origin_f32();
            self.cl.predicted_angles = self.cl.frame.playerstate.viewangles;
            log::info!("Entered {}", self.cl.levelname);
            self.push_event(ClientEvent::Active);
        }

        if self.cls.state == ConnState::Active && self.cvars.variable_value("cl_predict") != 0.0 {
            let ack = self.cls.netchan.as_ref().map_or(0, |c| c.incoming_acknowledged);
            let tolerance = PredictionTolerance::from_cvars(
                self.cvars.variable_string("cl_predict_metric"),
                self.cvars.variable_value("cl_predict_epsilon"),
            );
            let showmiss = self.cvars.variable_value("cl_showmiss") != 0.0;
            check_prediction_error(&mut self.cl, ack, tolerance, &*self.world, showmiss);
        }
        Ok(())
    }

    fn parse_stuff_text(&mut self, text: &str) {
        for cmd in cmd_tokenize_lines(text) {
            match StuffCommand::parse(&cmd) {
                StuffCommand::Precache(count) => {
                    let servercount = count.unwrap_or(self.cl.servercount);
                    self.add_reliable_command(&format!("begin {}\n", servercount));
                    self.cl.begin_sent = true;
                }
                StuffCommand::Changing => {
                    log::info!("Changing map...");
                    if self.cls.state == ConnState::Active {
                        self.cls.state = ConnState::Connected;
                    }
                }
                StuffCommand::Reconnect => {
                    if self.cls.state == ConnState::Connected {
                        // the new level is ready on the same connection
                        log::info!("reconnecting...");
                        self.cl.clear();
                        self.add_reliable_command("new");
                    } else {
                        self.reconnect();
                        return;
                    }
                }
                StuffCommand::ForwardToServer(text) => self.add_reliable_command(&text),
                other => self.push_event(ClientEvent::Stuff(other)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use q2net_common::common::{msg_write_byte, msg_write_long, msg_write_short, msg_write_string};
    use q2net_common::net::{LoopbackHub, NetAdr};
    use q2net_common::net_chan::{netchan_setup, NetSrc};
    use q2net_common::qcommon::{ClcOps, MAX_MSGLEN, PRINT_CHAT};

    fn connected_client() -> Client {
        let hub = LoopbackHub::new();
        let mut client = Client::new(Box::new(hub.bind(27901)));
        client.cls.state = ConnState::Connected;
        client.cls.server_address = Some(NetAdr::Loopback(27910));
        client.cls.netchan = Some(netchan_setup(NetSrc::Client, NetAdr::Loopback(27910), 7, 0));
        client
    }

    fn serverdata(msg: &mut SizeBuf, protocol: i32) {
        msg_write_byte(msg, SvcOps::ServerData as i32);
        msg_write_long(msg, protocol);
        msg_write_long(msg, 42);
        msg_write_byte(msg, 0);
        msg_write_string(msg, "baseq2");
        msg_write_short(msg, 3);
        msg_write_string(msg, "The Edge");
    }

    fn staged_commands(client: &Client) -> Vec<String> {
        let chan = client.netchan().unwrap();
        let mut msg = SizeBuf::from_bytes(chan.message.as_slice());
        let mut out = Vec::new();
        while msg_peek_byte(&msg).is_some() {
            assert_eq!(msg_read_byte(&mut msg).unwrap(), ClcOps::StringCmd as u8);
            out.push(msg_read_string(&mut msg).unwrap());
        }
        out
    }

    #[test]
    fn test_serverdata() {
        let mut client = connected_client();
        let mut msg = SizeBuf::new(MAX_MSGLEN);
        serverdata(&mut msg, PROTOCOL_VERSION);
        client.parse_server_message(&mut msg).unwrap();

        assert!(client.cl.serverdata);
        assert_eq!(client.cl.servercount, 42);
        assert_eq!(client.cl.gamedir, "baseq2");
        assert_eq!(client.cl.playernum, 3);
        assert_eq!(client.cl.levelname, "The Edge");
    }

    #[test]
    fn test_version_mismatch() {
        let mut client = connected_client();
        let mut msg = SizeBuf::new(MAX_MSGLEN);
        serverdata(&mut msg, 34);
        let err = client.parse_server_message(&mut msg).unwrap_err();
        assert_eq!(
            err,
            DropReason::Protocol(ProtocolError::VersionMismatch { server: 34, client: PROTOCOL_VERSION })
        );
    }

    #[test]
    fn test_unknown_command() {
        let mut client = connected_client();
        let mut msg = SizeBuf::new(MAX_MSGLEN);
        msg_write_byte(&mut msg, SvcOps::Nop as i32);
        msg_write_byte(&mut msg, 99);
        let err = client.parse_server_message(&mut msg).unwrap_err();
        assert_eq!(err, DropReason::Protocol(ProtocolError::BadCommand(99)));
    }

    #[test]
    fn test_frame_before_serverdata() {
        let mut client = connected_client();
        let mut msg = SizeBuf::new(MAX_MSGLEN);
        msg_write_byte(&mut msg, SvcOps::Frame as i32);
        msg_write_long(&mut msg, 1);
        let err = client.parse_server_message(&mut msg).unwrap_err();
        assert!(matches!(err, DropReason::Protocol(ProtocolError::IllegalCommand { .. })));
    }

    #[test]
    fn test_out_of_place_frame_data() {
        let mut client = connected_client();
        let mut msg = SizeBuf::new(MAX_MSGLEN);
        msg_write_byte(&mut msg, SvcOps::PacketEntities as i32);
        assert!(client.parse_server_message(&mut msg).is_err());
    }

    #[test]
    fn test_configstrings_and_prints() {
        let mut client = connected_client();
        let mut msg = SizeBuf::new(MAX_MSGLEN);
        msg_write_byte(&mut msg, SvcOps::ConfigString as i32);
        msg_write_short(&mut msg, CS_NAME as i32);
        msg_write_string(&mut msg, "The Edge");
        msg_write_byte(&mut msg, SvcOps::Print as i32);
        msg_write_byte(&mut msg, PRINT_CHAT as i32);
        msg_write_string(&mut msg, "hi\n");
        client.parse_server_message(&mut msg).unwrap();

        assert_eq!(client.cl.configstrings[CS_NAME], "The Edge");
        assert_eq!(
            client.drain_events(),
            vec![
                ClientEvent::ConfigString { index: CS_NAME, value: "The Edge".into() },
                ClientEvent::Print { level: PRINT_CHAT, text: "hi\n".into() },
            ]
        );

        let mut msg = SizeBuf::new(MAX_MSGLEN);
        msg_write_byte(&mut msg, SvcOps::ConfigString as i32);
        msg_write_short(&mut msg, MAX_CONFIGSTRINGS as i32);
        msg_write_string(&mut msg, "x");
        let err = client.parse_server_message(&mut msg).unwrap_err();
        assert_eq!(
            err,
            DropReason::Protocol(ProtocolError::BadConfigStringIndex(MAX_CONFIGSTRINGS as i32))
        );
    }

    #[test]
    fn test_stufftext_drives_level_download() {
        let mut client = connected_client();
        let mut msg = SizeBuf::new(MAX_MSGLEN);
        serverdata(&mut msg, PROTOCOL_VERSION);
        msg_write_byte(&mut msg, SvcOps::StuffText as i32);
        msg_write_string(&mut msg, "cmd configstrings 42 0\n");
        msg_write_byte(&mut msg, SvcOps::StuffText as i32);
        msg_write_string(&mut msg, "precache 42\nexec autoexec.cfg\n");
        client.parse_server_message(&mut msg).unwrap();

        assert_eq!(staged_commands(&client), vec!["configstrings 42 0", "begin 42\n"]);
        assert!(client.cl.begin_sent);
        assert_eq!(
            client.drain_events(),
            vec![ClientEvent::Stuff(StuffCommand::Other("exec autoexec.cfg".into()))]
        );
    }

    #[test]
    fn test_reconnect_on_same_connection() {
        let mut client = connected_client();
        client.cl.serverdata = true;
        client.cl.begin_sent = true;

        let mut msg = SizeBuf::new(MAX_MSGLEN);
        msg_write_byte(&mut msg, SvcOps::StuffText as i32);
        msg_write_string(&mut msg, "changing\nreconnect\n");
        client.parse_server_message(&mut msg).unwrap();

        assert_eq!(client.state(), ConnState::Connected);
        assert!(!client.cl.serverdata);
        assert!(!client.cl.begin_sent);
        assert_eq!(staged_commands(&client), vec!["new"]);
    }

    #[test]
    fn test_svc_reconnect() {
        let mut client = connected_client();
        let mut msg = SizeBuf::new(MAX_MSGLEN);
        msg_write_byte(&mut msg, SvcOps::Reconnect as i32);
        msg_write_byte(&mut msg, 99); // never looked at
        client.parse_server_message(&mut msg).unwrap();

        assert_eq!(client.state(), ConnState::Connecting);
        assert!(client.netchan().is_none());
        assert_eq!(client.cls.connect_time, None);
        assert_eq!(client.poll_event(), None);
    }

    #[test]
    fn test_server_disconnect() {
        let mut client = connected_client();
        let mut msg = SizeBuf::new(MAX_MSGLEN);
        msg_write_byte(&mut msg, SvcOps::Disconnect as i32);
        assert_eq!(client.parse_server_message(&mut msg), Err(DropReason::ServerDisconnected));
    }
}
