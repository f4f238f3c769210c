/*!
 * Command Execution
 *
 * Turns a decoded `Command` into a typed `Cmd`, validating arity and
 * options, then runs it against the store. No I/O happens here and the
 * current instant is passed in by the caller.
 */

use crate::error::CommandError;
use crate::protocol::{Command, Value};
use crate::storage::Store;
use bytes::Bytes;
use std::time::{Duration, Instant};

/// Relative expiry requested by `SET ... EX|PX`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// `EX seconds`
    Seconds(u64),
    /// `PX milliseconds`
    Millis(u64),
}

impl Expiry {
    /// Absolute deadline relative to `now`, `None` if it cannot be represented
    pub fn deadline(self, now: Instant) -> Option<Instant> {
        let millis = match self {
            Expiry::Seconds(s) => s.checked_mul(1000)?,
            Expiry::Millis(ms) => ms,
        };
        now.checked_add(Duration::from_millis(millis))
    }
}

/// Commands supported by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cmd {
    /// PING [message]
    Ping(Option<Bytes>),
    /// ECHO message
    Echo(Bytes),
    /// SET key value [EX seconds | PX milliseconds]
    Set {
        key: Bytes,
        value: Bytes,
        expiry: Option<Expiry>,
    },
    /// GET key
    Get(Bytes),
}

impl Cmd {
    /// Validate a decoded command
    ///
    /// The command name and the EX/PX option are matched case-insensitively.
    pub fn parse(cmd: &Command) -> Result<Self, CommandError> {
        let name = cmd.name();
        let args = cmd.args();

        if name.eq_ignore_ascii_case(b"PING") {
            match args {
                [] => Ok(Cmd::Ping(None)),
                [msg] => Ok(Cmd::Ping(Some(msg.clone()))),
                _ => Err(CommandError::WrongArity),
            }
        } else if name.eq_ignore_ascii_case(b"ECHO") {
            match args {
                [msg] => Ok(Cmd::Echo(msg.clone())),
                _ => Err(CommandError::WrongArity),
            }
        } else if name.eq_ignore_ascii_case(b"GET") {
            match args {
                [key] => Ok(Cmd::Get(key.clone())),
                _ => Err(CommandError::WrongArity),
            }
        } else if name.eq_ignore_ascii_case(b"SET") {
            let (key, value, expiry) = match args {
                [key, value] => (key, value, None),
                [key, value, opt, amount] => (key, value, Some(parse_expiry(opt, amount)?)),
                [_, _, _] => return Err(CommandError::Syntax),
                _ => return Err(CommandError::WrongArity),
            };
            Ok(Cmd::Set {
                key: key.clone(),
                value: value.clone(),
                expiry,
            })
        } else {
            Err(CommandError::Unknown(printable_name(name)))
        }
    }

    /// Run the command against `store` as of `now`
    pub fn exec(self, store: &Store, now: Instant) -> Result<Value, CommandError> {
        match self {
            Cmd::Ping(None) => Ok(Value::simple("PONG")),
            Cmd::Ping(Some(msg)) | Cmd::Echo(msg) => Ok(Value::bulk(msg)),
            Cmd::Set { key, value, expiry } => {
                // Resolve the deadline before touching the store so an
                // out-of-range TTL leaves the key alone.
                let expires_at = match expiry {
                    Some(e) => Some(e.deadline(now).ok_or(CommandError::NotAnInteger)?),
                    None => None,
                };
                store.set(key, value, expires_at);
                Ok(Value::ok())
            }
            Cmd::Get(key) => Ok(match store.get(&key, now) {
                Some(entry) => Value::bulk(entry.value),
                None => Value::null(),
            }),
        }
    }
}

fn parse_expiry(opt: &[u8], amount: &[u8]) -> Result<Expiry, CommandError> {
    let ctor: fn(u64) -> Expiry = if opt.eq_ignore_ascii_case(b"EX") {
        Expiry::Seconds
    } else if opt.eq_ignore_ascii_case(b"PX") {
        Expiry::Millis
    } else {
        return Err(CommandError::Syntax);
    };
    Ok(ctor(parse_u64(amount)?))
}

/// Command name as it may appear inside a one-line error reply
///
/// CR and LF would end the reply early, so they become spaces.
fn printable_name(name: &[u8]) -> String {
    String::from_utf8_lossy(name)
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect()
}

/// Parse a non-negative decimal integer argument
fn parse_u64(b: &[u8]) -> Result<u64, CommandError> {
    std::str::from_utf8(b)
        .ok()
        .filter(|s| !s.starts_with('+'))
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or(CommandError::NotAnInteger)
}

/// Execute one command and produce its reply
///
/// Command errors become RESP error replies; the store is only touched when
/// the command is valid.
pub fn dispatch(cmd: &Command, store: &Store, now: Instant) -> Value {
    let result = Cmd::parse(cmd).and_then(|c| c.exec(store, now));
    match result {
        Ok(v) => v,
        Err(e) => {
            log::trace!("command error: {}", e);
            Value::error(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(args: &[&str]) -> Command {
        Command::from_args(args).unwrap()
    }

    #[test]
    fn parse_set_variants() {
        assert_eq!(
            Cmd::parse(&cmd(&["set", "k", "v", "ex", "10"])),
            Ok(Cmd::Set {
                key: Bytes::from_static(b"k"),
                value: Bytes::from_static(b"v"),
                expiry: Some(Expiry::Seconds(10)),
            })
        );
        assert_eq!(
            Cmd::parse(&cmd(&["SET", "k", "v", "Px", "5"])).map(|c| matches!(
                c,
                Cmd::Set { expiry: Some(Expiry::Millis(5)), .. }
            )),
            Ok(true)
        );
        assert_eq!(Cmd::parse(&cmd(&["SET", "k"])), Err(CommandError::WrongArity));
        assert_eq!(Cmd::parse(&cmd(&["SET", "k", "v", "EX"])), Err(CommandError::Syntax));
        assert_eq!(
            Cmd::parse(&cmd(&["SET", "k", "v", "KEEP", "1"])),
            Err(CommandError::Syntax)
        );
        assert_eq!(
            Cmd::parse(&cmd(&["SET", "k", "v", "EX", "-1"])),
            Err(CommandError::NotAnInteger)
        );
        assert_eq!(
            Cmd::parse(&cmd(&["SET", "k", "v", "EX", "+1"])),
            Err(CommandError::NotAnInteger)
        );
        assert_eq!(
            Cmd::parse(&cmd(&["SET", "a", "1", "b", "2", "EX", "1"])),
            Err(CommandError::WrongArity)
        );
    }

    #[test]
    fn deadline_overflow_is_out_of_range() {
        assert_eq!(Expiry::Seconds(u64::MAX).deadline(Instant::now()), None);
        let store = Store::new();
        let reply = dispatch(
            &cmd(&["SET", "k", "v", "EX", u64::MAX.to_string().as_str()]),
            &store,
            Instant::now(),
        );
        assert_eq!(reply, Value::error("ERR value is not an integer or out of range"));
        assert!(store.is_empty());
    }

    #[test]
    fn unknown_command_echoes_name_as_sent() {
        let store = Store::new();
        assert_eq!(
            dispatch(&cmd(&["FlushAll"]), &store, Instant::now()),
            Value::error("ERR unknown command 'FlushAll'")
        );
    }

    #[test]
    fn unknown_command_name_loses_line_breaks() {
        let store = Store::new();
        assert_eq!(
            dispatch(&cmd(&["X\r\n+OK"]), &store, Instant::now()),
            Value::error("ERR unknown command 'X  +OK'")
        );
    }
}
