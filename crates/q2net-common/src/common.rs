// common.rs -- message buffer reading and writing
//
// All multi-byte values are little-endian on the wire regardless of host
// order. Writes that do not fit panic unless the buffer allows overflow;
// reads past the end return `EndOfMessage` and leave the cursor alone.

use crate::error::EndOfMessage;
use crate::q_shared::{UserCmd, Vec3};
use crate::qcommon::{SizeBuf, UserCmdBits};

pub type MsgResult<T> = Result<T, EndOfMessage>;

/// Longest string a read will return; the rest is consumed and dropped.
pub const MAX_MSG_STRING: usize = 2047;

// ============================================================
// SizeBuf operations
// ============================================================

impl SizeBuf {
    /// Reserve `length` bytes at the write cursor and return their offset.
    pub fn get_space(&mut self, length: usize) -> usize {
        if self.cursize + length > self.maxsize {
            if !self.allow_overflow {
                panic!(
                    "SizeBuf::get_space: overflow without allow_overflow set ({} + {} > {})",
                    self.cursize, length, self.maxsize
                );
            }
            if length > self.maxsize {
                panic!("SizeBuf::get_space: {} is > full buffer size", length);
            }
            log::warn!("SizeBuf::get_space: overflow");
            self.clear();
            self.overflowed = true;
        }

        let start = self.cursize;
        self.cursize += length;
        start
    }

    /// Write raw bytes into the buffer.
    pub fn write(&mut self, src: &[u8]) {
        let start = self.get_space(src.len());
        self.data[start..start + src.len()].copy_from_slice(src);
    }

    /// Append a NUL-terminated string, merging with a trailing NUL.
    pub fn print(&mut self, s: &str) {
        if self.cursize > 0 && self.data[self.cursize - 1] == 0 {
            self.cursize -= 1;
        }
        self.write(s.as_bytes());
        self.write(&[0]);
    }

    /// True if `length` more bytes fit without overflowing.
    pub fn has_room(&self, length: usize) -> bool {
        self.cursize + length <= self.maxsize
    }
}

// ============================================================
// MSG write functions
// ============================================================

pub fn msg_write_char(sb: &mut SizeBuf, c: i32) {
    let start = sb.get_space(1);
    sb.data[start] = c as i8 as u8;
}

pub fn msg_write_byte(sb: &mut SizeBuf, c: i32) {
    let start = sb.get_space(1);
    sb.data[start] = c as u8;
}

pub fn msg_write_short(sb: &mut SizeBuf, c: i32) {
    let start = sb.get_space(2);
    sb.data[start..start + 2].copy_from_slice(&(c as i16).to_le_bytes());
}

pub fn msg_write_long(sb: &mut SizeBuf, c: i32) {
    let start = sb.get_space(4);
    sb.data[start..start + 4].copy_from_slice(&c.to_le_bytes());
}

pub fn msg_write_float(sb: &mut SizeBuf, f: f32) {
    let start = sb.get_space(4);
    sb.data[start..start + 4].copy_from_slice(&f.to_le_bytes());
}

pub fn msg_write_string(sb: &mut SizeBuf, s: &str) {
    sb.write(s.as_bytes());
    sb.write(&[0]);
}

/// 13.3 fixed point.
pub fn msg_write_coord(sb: &mut SizeBuf, f: f32) {
    msg_write_short(sb, (f * 8.0) as i32);
}

pub fn msg_write_pos(sb: &mut SizeBuf, pos: &Vec3) {
    for v in pos {
        msg_write_coord(sb, *v);
    }
}

pub fn msg_write_angle(sb: &mut SizeBuf, f: f32) {
    msg_write_byte(sb, ((f * 256.0 / 360.0) as i32) & 255);
}

pub fn msg_write_angle16(sb: &mut SizeBuf, f: f32) {
    msg_write_short(sb, crate::q_shared::angle2short(f));
}

pub fn msg_write_delta_usercmd(buf: &mut SizeBuf, from: &UserCmd, cmd: &UserCmd) {
    let mut bits = UserCmdBits::empty();
    bits.set(UserCmdBits::ANGLE1, cmd.angles[0] != from.angles[0]);
    bits.set(UserCmdBits::ANGLE2, cmd.angles[1] != from.angles[1]);
    bits.set(UserCmdBits::ANGLE3, cmd.angles[2] != from.angles[2]);
    bits.set(UserCmdBits::FORWARD, cmd.forwardmove != from.forwardmove);
    bits.set(UserCmdBits::SIDE, cmd.sidemove != from.sidemove);
    bits.set(UserCmdBits::UP, cmd.upmove != from.upmove);
    bits.set(UserCmdBits::BUTTONS, cmd.buttons != from.buttons);
    bits.set(UserCmdBits::IMPULSE, cmd.impulse != from.impulse);

    msg_write_byte(buf, bits.bits() as i32);

    if bits.contains(UserCmdBits::ANGLE1) { msg_write_short(buf, cmd.angles[0] as i32); }
    if bits.contains(UserCmdBits::ANGLE2) { msg_write_short(buf, cmd.angles[1] as i32); }
    if bits.contains(UserCmdBits::ANGLE3) { msg_write_short(buf, cmd.angles[2] as i32); }
    if bits.contains(UserCmdBits::FORWARD) { msg_write_short(buf, cmd.forwardmove as i32); }
    if bits.contains(UserCmdBits::SIDE) { msg_write_short(buf, cmd.sidemove as i32); }
    if bits.contains(UserCmdBits::UP) { msg_write_short(buf, cmd.upmove as i32); }
    if bits.contains(UserCmdBits::BUTTONS) { msg_write_byte(buf, cmd.buttons as i32); }
    if bits.contains(UserCmdBits::IMPULSE) { msg_write_byte(buf, cmd.impulse as i32); }

    msg_write_byte(buf, cmd.msec as i32);
    msg_write_byte(buf, cmd.lightlevel as i32);
}

// ============================================================
// MSG read functions
// ============================================================

pub fn msg_begin_reading(msg: &mut SizeBuf) {
    msg.readcount = 0;
}

fn msg_read_bytes<const N: usize>(msg: &mut SizeBuf) -> MsgResult<[u8; N]> {
    let rc = msg.readcount;
    if rc + N > msg.cursize {
        return Err(EndOfMessage);
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&msg.data[rc..rc + N]);
    msg.readcount += N;
    Ok(out)
}

/// Next byte without consuming it, `None` at end of message.
pub fn msg_peek_byte(msg: &SizeBuf) -> Option<u8> {
    (msg.readcount < msg.cursize).then(|| msg.data[msg.readcount])
}

pub fn msg_read_char(msg: &mut SizeBuf) -> MsgResult<i8> {
    msg_read_bytes::<1>(msg).map(|b| b[0] as i8)
}

pub fn msg_read_byte(msg: &mut SizeBuf) -> MsgResult<u8> {
    msg_read_bytes::<1>(msg).map(|b| b[0])
}

pub fn msg_read_short(msg: &mut SizeBuf) -> MsgResult<i16> {
    msg_read_bytes::<2>(msg).map(i16::from_le_bytes)
}

pub fn msg_read_long(msg: &mut SizeBuf) -> MsgResult<i32> {
    msg_read_bytes::<4>(msg).map(i32::from_le_bytes)
}

pub fn msg_read_float(msg: &mut SizeBuf) -> MsgResult<f32> {
    msg_read_bytes::<4>(msg).map(f32::from_le_bytes)
}

fn msg_read_until(msg: &mut SizeBuf, stop_at_newline: bool) -> MsgResult<String> {
    if msg.readcount >= msg.cursize {
        return Err(EndOfMessage);
    }
    let mut result = Vec::new();
    while msg.readcount < msg.cursize {
        let c = msg.data[msg.readcount];
        msg.readcount += 1;
        if c == 0 || (stop_at_newline && c == b'\n') {
            break;
        }
        if result.len() < MAX_MSG_STRING {
            result.push(c);
        }
    }
    Ok(String::from_utf8_lossy(&result).into_owned())
}

/// NUL-terminated string. The end of the buffer also terminates it; an
/// empty remainder is `EndOfMessage`.
pub fn msg_read_string(msg: &mut SizeBuf) -> MsgResult<String> {
    msg_read_until(msg, false)
}

/// Like `msg_read_string` but also stops at a newline.
pub fn msg_read_string_line(msg: &mut SizeBuf) -> MsgResult<String> {
    msg_read_until(msg, true)
}

pub fn msg_read_coord(msg: &mut SizeBuf) -> MsgResult<f32> {
    Ok(msg_read_short(msg)? as f32 * (1.0 / 8.0))
}

pub fn msg_read_pos(msg: &mut SizeBuf) -> MsgResult<Vec3> {
    Ok([msg_read_coord(msg)?, msg_read_coord(msg)?, msg_read_coord(msg)?])
}

pub fn msg_read_angle(msg: &mut SizeBuf) -> MsgResult<f32> {
    Ok(msg_read_char(msg)? as f32 * (360.0 / 256.0))
}

pub fn msg_read_angle16(msg: &mut SizeBuf) -> MsgResult<f32> {
    Ok(crate::q_shared::short2angle(msg_read_short(msg)?))
}

pub fn msg_read_delta_usercmd(msg: &mut SizeBuf, from: &UserCmd) -> MsgResult<UserCmd> {
    let mut cmd = *from;
    let bits = UserCmdBits::from_bits_retain(msg_read_byte(msg)?);

    if bits.contains(UserCmdBits::ANGLE1) { cmd.angles[0] = msg_read_short(msg)?; }
    if bits.contains(UserCmdBits::ANGLE2) { cmd.angles[1] = msg_read_short(msg)?; }
    if bits.contains(UserCmdBits::ANGLE3) { cmd.angles[2] = msg_read_short(msg)?; }

    if bits.contains(UserCmdBits::FORWARD) { cmd.forwardmove = msg_read_short(msg)?; }
    if bits.contains(UserCmdBits::SIDE) { cmd.sidemove = msg_read_short(msg)?; }
    if bits.contains(UserCmdBits::UP) { cmd.upmove = msg_read_short(msg)?; }

    if bits.contains(UserCmdBits::BUTTONS) { cmd.buttons = msg_read_byte(msg)?; }
    if bits.contains(UserCmdBits::IMPULSE) { cmd.impulse = msg_read_byte(msg)?; }

    cmd.msec = msg_read_byte(msg)?;
    cmd.lightlevel = msg_read_byte(msg)?;

    Ok(cmd)
}

pub fn msg_read_data(msg: &mut SizeBuf, len: usize) -> MsgResult<Vec<u8>> {
    if msg.readcount + len > msg.cursize {
        return Err(EndOfMessage);
    }
    let out = msg.data[msg.readcount..msg.readcount + len].to_vec();
    msg.readcount += len;
    Ok(out)
}

/// Milliseconds since the first call in this process.
pub fn sys_milliseconds() -> i32 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as i32
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_write_read_integers() {
        let mut sb = SizeBuf::new(64);
        msg_write_char(&mut sb, -5);
        msg_write_byte(&mut sb, 200);
        msg_write_short(&mut sb, -1234);
        msg_write_long(&mut sb, 0x12345678);
        msg_write_long(&mut sb, -1);
        msg_begin_reading(&mut sb);
        assert_eq!(msg_read_char(&mut sb), Ok(-5));
        assert_eq!(msg_read_byte(&mut sb), Ok(200));
        assert_eq!(msg_read_short(&mut sb), Ok(-1234));
        assert_eq!(msg_read_long(&mut sb), Ok(0x12345678));
        // a legitimate -1 is a value, not end of message
        assert_eq!(msg_read_long(&mut sb), Ok(-1));
        assert_eq!(msg_read_byte(&mut sb), Err(EndOfMessage));
    }

    #[test]
    fn test_msg_little_endian_layout() {
        let mut sb = SizeBuf::new(8);
        msg_write_short(&mut sb, 0x0102);
        msg_write_long(&mut sb, 0x03040506);
        assert_eq!(sb.as_slice(), &[0x02, 0x01, 0x06, 0x05, 0x04, 0x03]);
    }

    #[test]
    fn test_msg_write_read_float() {
        let mut sb = SizeBuf::new(64);
        msg_write_float(&mut sb, 3.14);
        msg_write_float(&mut sb, -0.0001);
        msg_begin_reading(&mut sb);
        assert_eq!(msg_read_float(&mut sb), Ok(3.14));
        assert_eq!(msg_read_float(&mut sb), Ok(-0.0001));
    }

    #[test]
    fn test_msg_short_read_does_not_advance() {
        let mut sb = SizeBuf::new(64);
        msg_write_byte(&mut sb, 7);
        msg_write_byte(&mut sb, 9);
        msg_write_byte(&mut sb, 11);
        msg_begin_reading(&mut sb);
        assert_eq!(msg_read_short(&mut sb), Ok(i16::from_le_bytes([7, 9])));
        assert_eq!(msg_read_long(&mut sb), Err(EndOfMessage));
        assert_eq!(sb.readcount, 2);
        assert_eq!(msg_read_byte(&mut sb), Ok(11));
    }

    #[test]
    fn test_msg_strings() {
        let mut sb = SizeBuf::new(256);
        msg_write_string(&mut sb, "hello world");
        msg_write_string(&mut sb, "");
        sb.write(b"line one\nline two");
        msg_begin_reading(&mut sb);
        assert_eq!(msg_read_string(&mut sb).as_deref(), Ok("hello world"));
        assert_eq!(msg_read_string(&mut sb).as_deref(), Ok(""));
        assert_eq!(msg_read_string_line(&mut sb).as_deref(), Ok("line one"));
        // unterminated at end of buffer
        assert_eq!(msg_read_string_line(&mut sb).as_deref(), Ok("line two"));
        assert_eq!(msg_read_string(&mut sb), Err(EndOfMessage));
    }

    #[test]
    fn test_sizebuf_print_merges_nul() {
        let mut sb = SizeBuf::new(64);
        sb.print("abc");
        sb.print("def");
        assert_eq!(sb.as_slice(), b"abcdef\0");
    }

    #[test]
    fn test_msg_coord_exact_on_eighths() {
        for &f in &[0.0f32, 1.0, -1.0, 100.5, -100.5, 0.125, -0.125, 4095.875, -4095.875] {
            let mut sb = SizeBuf::new(8);
            msg_write_coord(&mut sb, f);
            msg_begin_reading(&mut sb);
            assert_eq!(msg_read_coord(&mut sb), Ok(f));
        }
    }

    #[test]
    fn test_msg_coord_truncates_to_eighths() {
        let mut sb = SizeBuf::new(8);
        msg_write_coord(&mut sb, 10.06);
        msg_begin_reading(&mut sb);
        assert_eq!(msg_read_coord(&mut sb), Ok(10.0));
    }

    fn angle_diff(a: f32, b: f32) -> f32 {
        let d = (a - b).rem_euclid(360.0);
        d.min(360.0 - d)
    }

    #[test]
    fn test_msg_angles_within_one_step() {
        for i in 0..720 {
            let f = i as f32 * 0.5;
            let mut sb = SizeBuf::new(8);
            msg_write_angle(&mut sb, f);
            msg_write_angle16(&mut sb, f);
            msg_begin_reading(&mut sb);
            let a8 = msg_read_angle(&mut sb).unwrap();
            let a16 = msg_read_angle16(&mut sb).unwrap();
            assert!(angle_diff(a8, f) <= 360.0 / 256.0, "angle8 {} -> {}", f, a8);
            assert!(angle_diff(a16, f) <= 360.0 / 65536.0, "angle16 {} -> {}", f, a16);
        }
    }

    #[test]
    fn test_delta_usercmd() {
        let from = UserCmd { msec: 16, forwardmove: 200, ..Default::default() };
        let to = UserCmd {
            msec: 17,
            forwardmove: 200,
            sidemove: -100,
            angles: [10, -20, 0],
            buttons: 1,
            lightlevel: 64,
            ..Default::default()
        };

        let mut sb = SizeBuf::new(64);
        msg_write_delta_usercmd(&mut sb, &from, &to);
        // bits + 2 angles + side + buttons + msec + lightlevel
        assert_eq!(sb.cursize, 1 + 4 + 2 + 1 + 2);
        msg_begin_reading(&mut sb);
        assert_eq!(msg_read_delta_usercmd(&mut sb, &from), Ok(to));
    }

    #[test]
    fn test_delta_usercmd_truncated() {
        let mut sb = SizeBuf::new(64);
        msg_write_byte(&mut sb, UserCmdBits::FORWARD.bits() as i32);
        msg_begin_reading(&mut sb);
        assert_eq!(
            msg_read_delta_usercmd(&mut sb, &UserCmd::default()),
            Err(EndOfMessage)
        );
    }

    #[test]
    fn test_read_data() {
        let mut sb = SizeBuf::from_bytes(&[1, 2, 3, 4]);
        assert_eq!(msg_read_data(&mut sb, 3), Ok(vec![1, 2, 3]));
        assert_eq!(msg_read_data(&mut sb, 2), Err(EndOfMessage));
        assert_eq!(msg_peek_byte(&sb), Some(4));
    }

    #[test]
    #[should_panic]
    fn test_sizebuf_overflow_is_fatal() {
        let mut sb = SizeBuf::new(4);
        msg_write_long(&mut sb, 1);
        msg_write_byte(&mut sb, 0);
    }

    #[test]
    fn test_sizebuf_overflow_allowed() {
        let mut sb = SizeBuf::new(4);
        sb.allow_overflow = true;
        msg_write_long(&mut sb, 0x12345678);
        assert!(!sb.overflowed);
        msg_write_byte(&mut sb, 0);
        assert!(sb.overflowed);
        assert_eq!(sb.cursize, 1);
    }
}
