// cvar.rs -- named configuration variables
//
// Every setting the protocol layer reads (timeouts, prediction tolerance,
// qport, rcon password, ...) is a cvar owned by a `CvarContext`. Each client
// and server carries its own context, so several can run in one process.

use std::collections::HashMap;

use crate::cmd::{cmd_tokenize_lines, CmdArgs};
use crate::q_shared::{
    info_set_value_for_key, info_validate, CVAR_ARCHIVE, CVAR_LATCH, CVAR_NOSET, CVAR_SERVERINFO,
    CVAR_USERINFO, MAX_INFO_STRING,
};

#[derive(Debug, Clone)]
pub struct Cvar {
    pub name: String,
    pub string: String,
    pub latched_string: Option<String>,
    pub flags: i32,
    pub modified: bool,
    pub value: f32,
}

impl Cvar {
    fn assign(&mut self, value: &str) {
        self.string = value.to_string();
        self.value = parse_value(value);
    }
}

fn parse_value(s: &str) -> f32 {
    s.trim().parse::<f32>().unwrap_or(0.0)
}

/// Info cvar names and values end up inside quoted connect lines and
/// `\key\value` strings.
fn info_safe(s: &str) -> bool {
    !s.contains('\\') && info_validate(s)
}

#[derive(Debug, Default)]
pub struct CvarContext {
    pub cvar_vars: Vec<Cvar>,
    cvar_index: HashMap<String, usize>,
    /// Set when a CVAR_USERINFO variable changes; the client clears it after
    /// sending the new userinfo.
    pub userinfo_modified: bool,
    /// While true, CVAR_LATCH variables only take new values at the next
    /// `get_latched_vars`.
    pub latch_active: bool,
}

impl CvarContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_var(&self, name: &str) -> Option<&Cvar> {
        self.cvar_index.get(name).map(|&idx| &self.cvar_vars[idx])
    }

    fn find_var_index(&self, name: &str) -> Option<usize> {
        self.cvar_index.get(name).copied()
    }

    /// 0 if the variable does not exist.
    pub fn variable_value(&self, name: &str) -> f32 {
        self.find_var(name).map_or(0.0, |var| var.value)
    }

    /// "" if the variable does not exist.
    pub fn variable_string(&self, name: &str) -> &str {
        self.find_var(name).map_or("", |var| var.string.as_str())
    }

    /// Get or create a variable. An existing variable keeps its value and
    /// gains `flags`. Returns None for invalid info names or values, or when
    /// the variable does not exist and no default is given.
    pub fn get(&mut self, name: &str, value: Option<&str>, flags: i32) -> Option<usize> {
        if flags & (CVAR_USERINFO | CVAR_SERVERINFO) != 0 && !info_safe(name) {
            log::warn!("invalid info cvar name {}", name);
            return None;
        }

        if let Some(idx) = self.find_var_index(name) {
            self.cvar_vars[idx].flags |= flags;
            return Some(idx);
        }

        let value = value?;
        if flags & (CVAR_USERINFO | CVAR_SERVERINFO) != 0 && !info_safe(value) {
            log::warn!("invalid info cvar value for {}", name);
            return None;
        }

        let idx = self.cvar_vars.len();
        self.cvar_vars.push(Cvar {
            name: name.to_string(),
            string: value.to_string(),
            latched_string: None,
            flags,
            modified: true,
            value: parse_value(value),
        });
        self.cvar_index.insert(name.to_string(), idx);
        if flags & CVAR_USERINFO != 0 {
            self.userinfo_modified = true;
        }
        Some(idx)
    }

    fn set2(&mut self, name: &str, value: &str, force: bool) -> Option<usize> {
        let Some(idx) = self.find_var_index(name) else {
            return self.get(name, Some(value), 0);
        };
        let latch_active = self.latch_active;
        let var = &mut self.cvar_vars[idx];

        if var.flags & (CVAR_USERINFO | CVAR_SERVERINFO) != 0 && !info_safe(value) {
            log::warn!("invalid info cvar value for {}", name);
            return Some(idx);
        }

        if force {
            var.latched_string = None;
        } else {
            if var.flags & CVAR_NOSET != 0 {
                log::warn!("{} is write protected.", name);
                return Some(idx);
            }

            if var.flags & CVAR_LATCH != 0 {
                let current = var.latched_string.as_deref().unwrap_or(&var.string);
                if value == current {
                    return Some(idx);
                }
                if latch_active {
                    log::info!("{} will be changed for next game.", name);
                    var.latched_string = Some(value.to_string());
                } else {
                    var.assign(value);
                    var.modified = true;
                }
                return Some(idx);
            }
        }

        if value == var.string {
            return Some(idx);
        }

        var.modified = true;
        var.assign(value);
        if var.flags & CVAR_USERINFO != 0 {
            self.userinfo_modified = true;
        }
        Some(idx)
    }

    /// Set a value, honouring CVAR_NOSET and CVAR_LATCH.
    pub fn set(&mut self, name: &str, value: &str) -> Option<usize> {
        self.set2(name, value, false)
    }

    /// Set a value regardless of flags.
    pub fn force_set(&mut self, name: &str, value: &str) -> Option<usize> {
        self.set2(name, value, true)
    }

    /// Set a value and replace the flags.
    pub fn full_set(&mut self, name: &str, value: &str, flags: i32) -> Option<usize> {
        let Some(idx) = self.find_var_index(name) else {
            return self.get(name, Some(value), flags);
        };

        let var = &mut self.cvar_vars[idx];
        var.modified = true;
        var.assign(value);
        var.flags = flags;
        if flags & CVAR_USERINFO != 0 {
            self.userinfo_modified = true;
        }
        Some(idx)
    }

    pub fn set_value(&mut self, name: &str, value: f32) {
        let val_str = if value == (value as i32) as f32 {
            format!("{}", value as i32)
        } else {
            format!("{}", value)
        };
        self.set(name, &val_str);
    }

    /// Apply pending CVAR_LATCH changes.
    pub fn get_latched_vars(&mut self) {
        for var in &mut self.cvar_vars {
            if let Some(latched) = var.latched_string.take() {
                var.assign(&latched);
                var.modified = true;
            }
        }
    }

    /// Clear and return a variable's modified flag.
    pub fn take_modified(&mut self, name: &str) -> bool {
        match self.find_var_index(name) {
            Some(idx) => std::mem::take(&mut self.cvar_vars[idx].modified),
            None => false,
        }
    }

    /// Handle `name` or `name value` typed as a command. Returns false if
    /// `name` is not a variable.
    pub fn command(&mut self, cmd: &CmdArgs) -> bool {
        let Some(idx) = self.find_var_index(cmd.argv(0)) else {
            return false;
        };

        if cmd.argc() == 1 {
            let var = &self.cvar_vars[idx];
            log::info!("\"{}\" is \"{}\"", var.name, var.string);
            return true;
        }

        let name = self.cvar_vars[idx].name.clone();
        self.set(&name, cmd.argv(1));
        true
    }

    /// `set <variable> <value> [u / s]`
    pub fn set_f(&mut self, cmd: &CmdArgs) -> bool {
        match cmd.argc() {
            3 => {
                self.set(cmd.argv(1), cmd.argv(2));
                true
            }
            4 => {
                let flags = match cmd.argv(3) {
                    "u" => CVAR_USERINFO,
                    "s" => CVAR_SERVERINFO,
                    _ => {
                        log::warn!("flags can only be 'u' or 's'");
                        return false;
                    }
                };
                self.full_set(cmd.argv(1), cmd.argv(2), flags);
                true
            }
            _ => {
                log::warn!("usage: set <variable> <value> [u / s]");
                false
            }
        }
    }

    /// Run configuration text: `set` commands and `name value` lines.
    /// Returns the lines that were neither, for the caller to handle.
    pub fn exec_text(&mut self, text: &str) -> Vec<CmdArgs> {
        let mut rest = Vec::new();
        for cmd in cmd_tokenize_lines(text) {
            let handled = match cmd.argv(0) {
                "set" => self.set_f(&cmd),
                _ => self.command(&cmd),
            };
            if !handled {
                rest.push(cmd);
            }
        }
        rest
    }

    /// Apply `+set name value` pairs from a command line. Other `+command`
    /// sequences are returned as command text in order.
    pub fn parse_command_line<S: AsRef<str>>(&mut self, args: &[S]) -> Vec<String> {
        let mut commands = Vec::new();
        let mut i = 0;
        while i < args.len() {
            let arg = args[i].as_ref();
            if arg == "+set" && i + 2 < args.len() {
                self.set(args[i + 1].as_ref(), args[i + 2].as_ref());
                i += 3;
                continue;
            }
            if let Some(name) = arg.strip_prefix('+') {
                let mut text = name.to_string();
                i += 1;
                while i < args.len() && !args[i].as_ref().starts_with('+') {
                    text.push(' ');
                    text.push_str(args[i].as_ref());
                    i += 1;
                }
                commands.push(text);
                continue;
            }
            log::debug!("ignoring command line argument {}", arg);
            i += 1;
        }
        commands
    }

    pub fn write_variables(&self, writer: &mut dyn std::io::Write) -> std::io::Result<()> {
        for var in self.cvar_vars.iter().filter(|v| v.flags & CVAR_ARCHIVE != 0) {
            writeln!(writer, "set {} \"{}\"", var.name, var.string)?;
        }
        Ok(())
    }

    /// Info string of every variable with `bit` set.
    pub fn bit_info(&self, bit: i32) -> String {
        let mut info = String::with_capacity(MAX_INFO_STRING);
        for var in self.cvar_vars.iter().filter(|v| v.flags & bit != 0) {
            info_set_value_for_key(&mut info, &var.name, &var.string);
        }
        info
    }

    pub fn userinfo(&self) -> String {
        self.bit_info(CVAR_USERINFO)
    }

    pub fn serverinfo(&self) -> String {
        self.bit_info(CVAR_SERVERINFO)
    }
}
