//! In-channel requests in their RFC 4254 wire form.
//!
//! Requests are captured from the client leg, queued as [`ChannelRequest`] and replayed on the
//! backend leg with the same type, reply flag and type-specific payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use russh::{Pty, Sig};

use crate::error::{RelayError, RelayResult};

pub const PTY_REQ: &str = "pty-req";
pub const ENV: &str = "env";
pub const SHELL: &str = "shell";
pub const EXEC: &str = "exec";
pub const SUBSYSTEM: &str = "subsystem";
pub const WINDOW_CHANGE: &str = "window-change";
pub const SIGNAL: &str = "signal";

const TTY_OP_END: u8 = 0;
// Opcodes 160 and above carry no defined argument; parsing stops there.
const TTY_OP_LAST_WITH_ARG: u8 = 159;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub kind: String,
    pub want_reply: bool,
    pub payload: Bytes,
}

/// Typed view of a request payload, as the backend leg needs it.
#[derive(Debug, Clone)]
pub enum DecodedRequest {
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Env {
        name: String,
        value: String,
    },
    Shell,
    Exec {
        command: Vec<u8>,
    },
    Subsystem {
        name: String,
    },
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal(Sig),
}

impl ChannelRequest {
    pub fn new(kind: impl Into<String>, want_reply: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: kind.into(),
            want_reply,
            payload: payload.into(),
        }
    }

    pub fn pty(term: &str, col_width: u32, row_height: u32, pix_width: u32, pix_height: u32, modes: &[(Pty, u32)]) -> Self {
        let mut buf = BytesMut::new();
        put_string(&mut buf, term.as_bytes());
        buf.put_u32(col_width);
        buf.put_u32(row_height);
        buf.put_u32(pix_width);
        buf.put_u32(pix_height);

        let mut encoded_modes = BytesMut::with_capacity(modes.len() * 5 + 1);
        for (mode, value) in modes {
            encoded_modes.put_u8(*mode as u8);
            encoded_modes.put_u32(*value);
        }
        encoded_modes.put_u8(TTY_OP_END);
        put_string(&mut buf, &encoded_modes);

        Self::new(PTY_REQ, true, buf.freeze())
    }

    pub fn env(name: &str, value: &str) -> Self {
        let mut buf = BytesMut::new();
        put_string(&mut buf, name.as_bytes());
        put_string(&mut buf, value.as_bytes());
        Self::new(ENV, true, buf.freeze())
    }

    pub fn shell() -> Self {
        Self::new(SHELL, true, Bytes::new())
    }

    pub fn exec(command: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(command.len() + 4);
        put_string(&mut buf, command);
        Self::new(EXEC, true, buf.freeze())
    }

    pub fn subsystem(name: &str) -> Self {
        let mut buf = BytesMut::new();
        put_string(&mut buf, name.as_bytes());
        Self::new(SUBSYSTEM, true, buf.freeze())
    }

    pub fn window_change(col_width: u32, row_height: u32, pix_width: u32, pix_height: u32) -> Self {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u32(col_width);
        buf.put_u32(row_height);
        buf.put_u32(pix_width);
        buf.put_u32(pix_height);
        Self::new(WINDOW_CHANGE, false, buf.freeze())
    }

    pub fn signal(signal: &Sig) -> Self {
        let mut buf = BytesMut::new();
        put_string(&mut buf, signal_name(signal).as_bytes());
        Self::new(SIGNAL, false, buf.freeze())
    }

    /// True for the requests that start the remote program.
    pub fn starts_program(&self) -> bool {
        matches!(self.kind.as_str(), SHELL | EXEC | SUBSYSTEM)
    }

    pub fn decode(&self) -> RelayResult<DecodedRequest> {
        let mut buf = &self.payload[..];
        let malformed = |what: &str| RelayError::forwarding(self.kind.clone(), format!("malformed payload: {what}"));

        let decoded = match self.kind.as_str() {
            PTY_REQ => {
                let term = get_utf8(&mut buf).ok_or_else(|| malformed("terminal name"))?;
                let dims = get_u32s::<4>(&mut buf).ok_or_else(|| malformed("dimensions"))?;
                let modes = get_string(&mut buf).map(decode_modes).unwrap_or_default();
                DecodedRequest::Pty {
                    term,
                    col_width: dims[0],
                    row_height: dims[1],
                    pix_width: dims[2],
                    pix_height: dims[3],
                    modes,
                }
            }
            ENV => {
                let name = get_utf8(&mut buf).ok_or_else(|| malformed("variable name"))?;
                let value = get_utf8(&mut buf).ok_or_else(|| malformed("variable value"))?;
                DecodedRequest::Env { name, value }
            }
            SHELL => DecodedRequest::Shell,
            EXEC => DecodedRequest::Exec {
                command: get_string(&mut buf).ok_or_else(|| malformed("command"))?.to_vec(),
            },
            SUBSYSTEM => DecodedRequest::Subsystem {
                name: get_utf8(&mut buf).ok_or_else(|| malformed("subsystem name"))?,
            },
            WINDOW_CHANGE => {
                let dims = get_u32s::<4>(&mut buf).ok_or_else(|| malformed("dimensions"))?;
                DecodedRequest::WindowChange {
                    col_width: dims[0],
                    row_height: dims[1],
                    pix_width: dims[2],
                    pix_height: dims[3],
                }
            }
            SIGNAL => DecodedRequest::Signal(signal_from_name(
                &get_utf8(&mut buf).ok_or_else(|| malformed("signal name"))?,
            )),
            other => return Err(RelayError::forwarding(other, "request type is not relayed")),
        };
        Ok(decoded)
    }
}

/// Command text of an `exec` payload: a length-prefixed string.
///
/// `None` when the payload is too short for its header or its declared length.
pub fn exec_command(payload: &[u8]) -> Option<String> {
    let mut buf = payload;
    get_string(&mut buf).map(|raw| String::from_utf8_lossy(raw).into_owned())
}

/// Subsystem name of a `subsystem` payload.
pub fn subsystem_name(payload: &[u8]) -> Option<String> {
    let mut buf = payload;
    get_utf8(&mut buf)
}

/// SSH signal name without the `SIG` prefix.
pub fn signal_name(signal: &Sig) -> String {
    match signal {
        Sig::Custom(name) => name.clone(),
        other => format!("{other:?}"),
    }
}

pub fn signal_from_name(name: &str) -> Sig {
    match name.trim_start_matches("SIG") {
        "ABRT" => Sig::ABRT,
        "ALRM" => Sig::ALRM,
        "FPE" => Sig::FPE,
        "HUP" => Sig::HUP,
        "ILL" => Sig::ILL,
        "INT" => Sig::INT,
        "KILL" => Sig::KILL,
        "PIPE" => Sig::PIPE,
        "QUIT" => Sig::QUIT,
        "SEGV" => Sig::SEGV,
        "TERM" => Sig::TERM,
        "USR1" => Sig::USR1,
        other => Sig::Custom(other.to_string()),
    }
}

fn put_string(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

fn get_string<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return None;
    }
    let (value, rest) = (*buf).split_at(len);
    *buf = rest;
    Some(value)
}

fn get_utf8(buf: &mut &[u8]) -> Option<String> {
    get_string(buf).and_then(|raw| std::str::from_utf8(raw).ok()).map(str::to_string)
}

fn get_u32s<const N: usize>(buf: &mut &[u8]) -> Option<[u32; N]> {
    if buf.remaining() < 4 * N {
        return None;
    }
    let mut out = [0u32; N];
    for slot in &mut out {
        *slot = buf.get_u32();
    }
    Some(out)
}

fn decode_modes(mut raw: &[u8]) -> Vec<(Pty, u32)> {
    let mut modes = Vec::new();
    while raw.has_remaining() {
        let opcode = raw.get_u8();
        if opcode == TTY_OP_END || opcode > TTY_OP_LAST_WITH_ARG || raw.remaining() < 4 {
            break;
        }
        let value = raw.get_u32();
        if let Some(mode) = Pty::from_u8(opcode) {
            modes.push((mode, value));
        }
    }
    modes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_payload_carries_length_prefixed_command() {
        let request = ChannelRequest::exec(b"ls -la");
        assert_eq!(&request.payload[..4], &[0, 0, 0, 6]);
        assert_eq!(exec_command(&request.payload).as_deref(), Some("ls -la"));
        assert!(matches!(
            request.decode().unwrap(),
            DecodedRequest::Exec { command } if command == b"ls -la"
        ));
    }

    #[test]
    fn short_exec_payloads_are_unparseable() {
        assert_eq!(exec_command(&[]), None);
        assert_eq!(exec_command(&[0, 0, 1]), None);
        // Header claims more bytes than follow.
        assert_eq!(exec_command(&[0, 0, 0, 9, b'l', b's']), None);
        assert!(ChannelRequest::new(EXEC, true, vec![0u8, 1]).decode().is_err());
    }

    #[test]
    fn empty_exec_command_is_parseable() {
        assert_eq!(exec_command(&[0, 0, 0, 0]).as_deref(), Some(""));
    }

    #[test]
    fn pty_request_keeps_terminal_and_modes() {
        let modes = [(Pty::ECHO, 1), (Pty::TTY_OP_ISPEED, 38400)];
        let request = ChannelRequest::pty("xterm-256color", 120, 40, 0, 0, &modes);
        assert!(request.want_reply);
        match request.decode().unwrap() {
            DecodedRequest::Pty {
                term,
                col_width,
                row_height,
                modes: decoded,
                ..
            } => {
                assert_eq!(term, "xterm-256color");
                assert_eq!((col_width, row_height), (120, 40));
                assert_eq!(decoded, modes.to_vec());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn window_change_and_signal_want_no_reply() {
        let resize = ChannelRequest::window_change(80, 24, 640, 480);
        assert!(!resize.want_reply);
        assert!(matches!(
            resize.decode().unwrap(),
            DecodedRequest::WindowChange {
                col_width: 80,
                row_height: 24,
                pix_width: 640,
                pix_height: 480
            }
        ));

        let signal = ChannelRequest::signal(&Sig::INT);
        assert!(!signal.want_reply);
        assert!(matches!(signal.decode().unwrap(), DecodedRequest::Signal(Sig::INT)));
    }

    #[test]
    fn signal_names_match_the_wire_format() {
        assert_eq!(signal_name(&Sig::TERM), "TERM");
        assert_eq!(signal_name(&Sig::Custom("WINCH".into())), "WINCH");
        assert!(matches!(signal_from_name("SIGHUP"), Sig::HUP));
        assert!(matches!(signal_from_name("XCPU"), Sig::Custom(name) if name == "XCPU"));
    }

    #[test]
    fn env_and_subsystem_round_trip() {
        assert!(matches!(
            ChannelRequest::env("LANG", "C.UTF-8").decode().unwrap(),
            DecodedRequest::Env { name, value } if name == "LANG" && value == "C.UTF-8"
        ));
        let sftp = ChannelRequest::subsystem("sftp");
        assert_eq!(subsystem_name(&sftp.payload).as_deref(), Some("sftp"));
        assert!(sftp.starts_program());
        assert!(!ChannelRequest::env("A", "b").starts_program());
    }

    #[test]
    fn unknown_request_types_are_not_decoded() {
        let err = ChannelRequest::new("x11-req", true, Bytes::new()).decode().unwrap_err();
        assert!(matches!(err, RelayError::RequestForwarding { .. }));
    }
}
