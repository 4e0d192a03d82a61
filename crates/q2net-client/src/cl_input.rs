// cl_input.rs -- builds and sends the client's packets

use q2net_common::common::{msg_write_byte, msg_write_delta_usercmd, msg_write_long, msg_write_string};
use q2net_common::error::DropReason;
use q2net_common::net_chan::{netchan_need_reliable, netchan_send};
use q2net_common::q_shared::*;
use q2net_common::qcommon::{ClcOps, SizeBuf};

use crate::cl_main::Client;
use crate::cl_pred::cl_predict_movement;
use crate::client::*;

/// Idle interval after which a connected client sends a keepalive.
const KEEPALIVE_MSEC: i32 = 1000;

impl Client {
    /// Queue a string command on the reliable stream.
    pub fn add_reliable_command(&mut self, text: &str) {
        let Some(chan) = self.cls.netchan.as_mut() else {
            log::debug!("no connection for \"{}\"", text.trim_end());
            return;
        };
        msg_write_byte(&mut chan.message, ClcOps::StringCmd as i32);
        msg_write_string(&mut chan.message, text);
    }

    /// Send one packet carrying `cmd` and the two commands before it, so a
    /// lost packet costs nothing as long as one of the next two arrives.
    /// Before the level is running only reliable traffic and keepalives go
    /// out.
    pub fn send_cmd(&mut self, cmd: &UserCmd) {
        match self.cls.state {
            ConnState::Connected => self.send_keepalive(),
            ConnState::Active => self.send_move(cmd),
            _ => {}
        }
    }

    fn send_keepalive(&mut self) {
        let Some(chan) = self.cls.netchan.as_ref() else {
            return;
        };
        if netchan_need_reliable(chan) || self.cls.realtime - chan.last_sent > KEEPALIVE_MSEC {
            self.transmit(&[]);
        }
    }

    fn send_move(&mut self, cmd: &UserCmd) {
        let Some(chan) = self.cls.netchan.as_ref() else {
            return;
        };
        let sequence = chan.outgoing_sequence;
        let ack = chan.incoming_acknowledged;

        self.cl.cmds.store(sequence, *cmd, self.cls.realtime);

        if self.cvars.userinfo_modified {
            self.cvars.userinfo_modified = false;
            let userinfo = self.cvars.userinfo();
            if let Some(chan) = self.cls.netchan.as_mut() {
                msg_write_byte(&mut chan.message, ClcOps::UserInfo as i32);
                msg_write_string(&mut chan.message, &userinfo);
            }
        }

        if self.cvars.variable_value("cl_predict") != 0.0 && self.cl.frame.valid {
            cl_predict_movement(&mut self.cl, ack, sequence, &*self.world);
        }

        let mut buf = SizeBuf::new(128);
        msg_write_byte(&mut buf, ClcOps::Move as i32);

        // let the server know what the last frame we got was, so the next
        // message can be delta compressed
        let lastframe = if self.cl.frame.valid { self.cl.frame.serverframe } else { -1 };
        msg_write_long(&mut buf, lastframe);

        let nullcmd = UserCmd::default();
        let oldest = self.cl.cmds.command(sequence - 2).copied().unwrap_or_default();
        let older = self.cl.cmds.command(sequence - 1).copied().unwrap_or_default();
        msg_write_delta_usercmd(&mut buf, &nullcmd, &oldest);
        msg_write_delta_usercmd(&mut buf, &oldest, &older);
        msg_write_delta_usercmd(&mut buf, &older, cmd);

        self.transmit(buf.as_slice());
    }

    fn transmit(&mut self, data: &[u8]) {
        let Some(chan) = self.cls.netchan.as_mut() else {
            return;
        };
        if netchan_send(chan, &*self.transport, data, self.cls.realtime).is_err() {
            self.drop_connection(DropReason::Overflow);
        }
    }
}
