//! Frame encoding for the persistent shell channel.
//!
//! Every command is wrapped so the shell prints
//!
//! ```text
//! <<<hostprobe:begin:ID>>>
//! <base64 of the command's stdout, possibly over several lines>
//! <<<hostprobe:end:ID>>>
//! ```
//!
//! The payload alphabet (`A-Z a-z 0-9 + / =`) cannot contain a marker, so
//! command output that happens to look like a marker is carried inside the
//! payload untouched. The command itself travels as base64 too and is
//! decoded inside the frame, so unbalanced quoting or a syntax error stays
//! within that frame. Command stderr is discarded inside the frame and
//! command stdin is detached so a command cannot swallow the frames after it.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hostprobe_core::ShellDialect;

const BEGIN_PREFIX: &str = "<<<hostprobe:begin:";
const END_PREFIX: &str = "<<<hostprobe:end:";
const MARKER_SUFFIX: &str = ">>>";

pub fn begin_marker(id: &str) -> String {
    format!("{BEGIN_PREFIX}{id}{MARKER_SUFFIX}")
}

pub fn end_marker(id: &str) -> String {
    format!("{END_PREFIX}{id}{MARKER_SUFFIX}")
}

/// Build the stdin text that runs `command` inside a frame tagged `id`.
pub fn encode_command(dialect: ShellDialect, id: &str, command: &str) -> String {
    let begin = begin_marker(id);
    let end = end_marker(id);
    let script = STANDARD.encode(command.as_bytes());
    match dialect {
        // The pipeline runs the group in a subshell: a parse error in the
        // decoded script ends that subshell, not the channel's shell.
        ShellDialect::Posix => format!(
            "printf '%s\\n' '{begin}'\n\
             {{ eval \"$(printf '%s' '{script}' | base64 -d)\"; }} </dev/null 2>/dev/null | base64\n\
             printf '%s\\n' '{end}'\n"
        ),
        // The trailing blank line terminates multi-line input in `-Command -` mode.
        ShellDialect::PowerShell => format!(
            "Write-Output '{begin}'\n\
             $__hp = try {{ (& ([ScriptBlock]::Create([Text.Encoding]::UTF8.GetString(\
             [Convert]::FromBase64String('{script}')))) 2>$null | Out-String) }} catch {{ '' }}\n\
             [Convert]::ToBase64String([Text.Encoding]::UTF8.GetBytes([string]$__hp))\n\
             Write-Output '{end}'\n\n"
        ),
    }
}

/// Instruction that asks the shell to exit.
pub const fn exit_instruction(_dialect: ShellDialect) -> &'static str {
    "exit\n"
}

/// A fully decoded output frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: String,
    pub text: String,
}

/// Framing violations. The decoder recovers from all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Desync {
    /// END marker with no open frame.
    EndWithoutBegin { id: String },
    /// END marker whose id differs from the open frame; the open frame is dropped.
    MismatchedEnd { open: String, got: String },
    /// BEGIN marker while a frame is open; the older frame is dropped.
    UnterminatedFrame { open: String, next: String },
    /// Payload was not valid base64.
    BadPayload { id: String, reason: String },
}

/// What one line of shell stdout meant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// A frame closed.
    Frame(Frame),
    /// A framing violation was detected and discarded.
    Desync(Desync),
    /// Marker opened a frame, payload was buffered, or noise outside a frame.
    Consumed,
}

#[derive(Debug)]
struct OpenFrame {
    id: String,
    payload: String,
}

/// Incremental, line-oriented frame decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    open: Option<OpenFrame>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a frame is currently being collected.
    pub const fn in_frame(&self) -> bool {
        self.open.is_some()
    }

    /// Feed one line (without its terminator; a trailing `\r` is tolerated).
    pub fn feed_line(&mut self, line: &str) -> LineEvent {
        let line = line.trim();

        if let Some(id) = parse_marker(line, BEGIN_PREFIX) {
            let previous = self.open.replace(OpenFrame {
                id: id.to_string(),
                payload: String::new(),
            });
            return match previous {
                Some(prev) => LineEvent::Desync(Desync::UnterminatedFrame {
                    open: prev.id,
                    next: id.to_string(),
                }),
                None => LineEvent::Consumed,
            };
        }

        if let Some(id) = parse_marker(line, END_PREFIX) {
            let Some(open) = self.open.take() else {
                return LineEvent::Desync(Desync::EndWithoutBegin { id: id.to_string() });
            };
            if open.id != id {
                return LineEvent::Desync(Desync::MismatchedEnd {
                    open: open.id,
                    got: id.to_string(),
                });
            }
            return match decode_payload(&open.payload) {
                Ok(text) => LineEvent::Frame(Frame { id: open.id, text }),
                Err(reason) => LineEvent::Desync(Desync::BadPayload {
                    id: open.id,
                    reason,
                }),
            };
        }

        if let Some(open) = self.open.as_mut() {
            open.payload.push_str(line);
        }
        LineEvent::Consumed
    }
}

fn parse_marker<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let id = line.strip_prefix(prefix)?.strip_suffix(MARKER_SUFFIX)?;
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric())).then_some(id)
}

fn decode_payload(payload: &str) -> Result<String, String> {
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = STANDARD.decode(compact).map_err(|e| e.to_string())?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
