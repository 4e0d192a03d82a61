// cmd.rs -- command line tokenizing
//
// Text commands show up in several places: stufftext from the server,
// clc_stringcmd from clients, rcon, connectionless packets and config text.
// They all share the same rules: a buffer splits into lines at `\n` and at
// `;` outside quotes, and each line splits into whitespace separated
// tokens where a quoted string is one token.

use crate::q_shared::MAX_STRING_TOKENS;

/// One tokenized command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdArgs {
    argv: Vec<String>,
    /// Everything after the first token, untokenized.
    args: String,
}

impl CmdArgs {
    /// Tokenize the first line of `text`.
    pub fn tokenize(text: &str) -> Self {
        let mut out = CmdArgs::default();
        let bytes = text.as_bytes();
        let mut pos = 0;

        loop {
            // skip whitespace up to a \n
            while pos < bytes.len() && bytes[pos] <= b' ' && bytes[pos] != b'\n' {
                pos += 1;
            }
            if pos >= bytes.len() || bytes[pos] == b'\n' {
                break;
            }

            if out.argv.len() == 1 {
                let rest = &text[pos..];
                let line = rest.split('\n').next().unwrap_or(rest);
                out.args = line.trim_end().to_string();
            }

            let (token, new_pos) = parse_token(bytes, pos);
            if new_pos == pos {
                break;
            }
            pos = new_pos;

            if out.argv.len() < MAX_STRING_TOKENS {
                out.argv.push(token);
            }
        }

        out
    }

    pub fn argc(&self) -> usize {
        self.argv.len()
    }

    /// Token `i`, or "" past the end.
    pub fn argv(&self, i: usize) -> &str {
        self.argv.get(i).map(String::as_str).unwrap_or("")
    }

    pub fn args(&self) -> &str {
        &self.args
    }

    pub fn is_empty(&self) -> bool {
        self.argv.is_empty()
    }
}

/// Read one token starting at `pos`. Returns the token and the position
/// after it; the position is unchanged at end of line.
fn parse_token(data: &[u8], mut pos: usize) -> (String, usize) {
    while pos < data.len() && data[pos] <= b' ' {
        if data[pos] == b'\n' {
            return (String::new(), pos);
        }
        pos += 1;
    }
    if pos >= data.len() {
        return (String::new(), pos);
    }

    let start;
    if data[pos] == b'"' {
        pos += 1;
        start = pos;
        while pos < data.len() && data[pos] != b'"' && data[pos] != b'\n' {
            pos += 1;
        }
        let token = String::from_utf8_lossy(&data[start..pos]).into_owned();
        if pos < data.len() && data[pos] == b'"' {
            pos += 1;
        }
        return (token, pos);
    }

    start = pos;
    while pos < data.len() && data[pos] > b' ' {
        pos += 1;
    }
    (String::from_utf8_lossy(&data[start..pos]).into_owned(), pos)
}

/// Split a command buffer into lines at `\n` and at `;` outside quotes.
/// Empty lines are dropped.
pub fn cmd_split_lines(text: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut quotes = 0;
    let mut start = 0;

    for (i, ch) in text.char_indices() {
        match ch {
            '"' => quotes += 1,
            ';' if quotes & 1 == 0 => {
                lines.push(&text[start..i]);
                start = i + 1;
            }
            '\n' => {
                lines.push(&text[start..i]);
                start = i + 1;
                quotes = 0;
            }
            _ => {}
        }
    }
    lines.push(&text[start..]);

    lines.retain(|l| !l.trim().is_empty());
    lines
}

/// Tokenize every line of a command buffer.
pub fn cmd_tokenize_lines(text: &str) -> Vec<CmdArgs> {
    cmd_split_lines(text)
        .into_iter()
        .map(CmdArgs::tokenize)
        .filter(|c| !c.is_empty())
        .collect()
}
