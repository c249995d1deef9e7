use crate::packet::Method;
use crate::support::{MisuseError, ProtocolError, WasError, WasResult};
use indexmap::IndexMap;

/// Response header names that may not go through the normal header API.
/// Content-Length is declared through `set_length`; the rest are
/// hop-by-hop names the peer manages itself.
const FORBIDDEN_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn header_allowed(name: &str) -> bool {
    !FORBIDDEN_HEADERS
        .iter()
        .any(|forbidden| name.eq_ignore_ascii_case(forbidden))
}

/// Lifecycle of the request body arriving on the input pipe.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InputState {
    /// No body announced, or no DATA packet yet.
    NoBody,
    /// DATA received without a declared length.
    BodyUnknown { received: u64 },
    /// DATA plus a declared length; `remaining` counts down to the
    /// boundary.
    BodyKnown { received: u64, remaining: u64 },
    /// The body boundary was reached.
    End,
    /// The worker asked the peer to stop; pending bytes are being drained.
    /// `remaining` stays unknown until the peer reveals the boundary.
    Closed { received: u64, remaining: Option<u64> },
    /// The input pipe failed.
    Error,
}

/// Lifecycle of the response body leaving on the output pipe.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum OutputState {
    /// Nothing committed yet.
    None,
    /// Status sent, headers accumulating.
    Headers,
    /// Streaming without a declared length.
    BodyUnknown { sent: u64 },
    /// Streaming against a declared length.
    BodyKnown { sent: u64, remaining: u64 },
    End,
    Error,
}

/// Which accounting path the application chose for a body pipe. The
/// convenience I/O calls and the raw-descriptor calls are mutually
/// exclusive within one request.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Accounting {
    Unset,
    Stream,
    Raw,
}

/// Everything the session knows about the request in flight. Created on
/// REQUEST, mutated by control packets and API calls, dropped on the next
/// accept.
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub script_name: String,
    pub path_info: String,
    pub query_string: String,
    pub remote_host: String,
    pub headers: Vec<(String, String)>,
    pub parameters: IndexMap<String, String>,

    pub input: InputState,
    pub output: OutputState,
    pub status: Option<u16>,

    /// LENGTH received ahead of DATA.
    pub announced: Option<u64>,
    /// `set_length` value, applied when the body begins.
    pub out_announced: Option<u64>,

    pub body_seen: bool,
    pub complete: bool,
    pub want_metrics: bool,
    pub stopped: bool,
    pub failed: bool,

    pub input_mode: Accounting,
    pub output_mode: Accounting,
}

impl Request {
    pub fn new() -> Request {
        Request {
            method: Method::Get,
            uri: String::new(),
            script_name: String::new(),
            path_info: String::new(),
            query_string: String::new(),
            remote_host: String::new(),
            headers: Vec::new(),
            parameters: IndexMap::new(),
            input: InputState::NoBody,
            output: OutputState::None,
            status: None,
            announced: None,
            out_announced: None,
            body_seen: false,
            complete: false,
            want_metrics: false,
            stopped: false,
            failed: false,
            input_mode: Accounting::Unset,
            output_mode: Accounting::Unset,
        }
    }

    /// First header whose name matches case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(entry, _)| entry.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// DATA: the request body follows on the input pipe.
    pub fn input_data(&mut self) -> WasResult<()> {
        if self.complete || self.input != InputState::NoBody {
            return Err(WasError::Protocol(ProtocolError::UnexpectedPacket));
        }

        self.body_seen = true;
        self.complete = true;
        self.input = match self.announced.take() {
            Some(0) => InputState::End,
            Some(total) => InputState::BodyKnown {
                received: 0,
                remaining: total,
            },
            None => InputState::BodyUnknown { received: 0 },
        };

        Ok(())
    }

    /// NO_DATA: the request is complete and carries no body.
    pub fn input_no_data(&mut self) -> WasResult<()> {
        if self.complete || self.input != InputState::NoBody {
            return Err(WasError::Protocol(ProtocolError::UnexpectedPacket));
        }

        self.complete = true;
        Ok(())
    }

    /// LENGTH: the declared total body length. Legal ahead of DATA, or
    /// once while the length is still unknown; the already-consumed byte
    /// count is subtracted to obtain the remaining share.
    pub fn input_length(&mut self, total: u64) -> WasResult<()> {
        match self.input {
            InputState::NoBody if !self.complete && self.announced.is_none() => {
                self.announced = Some(total);
                Ok(())
            }
            InputState::BodyUnknown { received } => {
                if total < received {
                    return Err(WasError::Protocol(ProtocolError::LengthMismatch));
                }
                let remaining = total - received;
                self.input = if remaining == 0 {
                    InputState::End
                } else {
                    InputState::BodyKnown { received, remaining }
                };
                Ok(())
            }
            InputState::Closed {
                received,
                remaining: None,
            } => {
                if total < received {
                    return Err(WasError::Protocol(ProtocolError::LengthMismatch));
                }
                let remaining = total - received;
                self.input = if remaining == 0 {
                    InputState::End
                } else {
                    InputState::Closed {
                        received,
                        remaining: Some(remaining),
                    }
                };
                Ok(())
            }
            _ => Err(WasError::Protocol(ProtocolError::UnexpectedPacket)),
        }
    }

    /// PREMATURE: the peer truncated the body at `offset`. Bytes up to the
    /// offset may still sit in the pipe and stay readable; past it the
    /// body is at its end.
    pub fn input_premature(&mut self, offset: u64) -> WasResult<()> {
        match self.input {
            InputState::BodyUnknown { received } | InputState::BodyKnown { received, .. } => {
                if offset < received {
                    return Err(WasError::Protocol(ProtocolError::LengthMismatch));
                }
                let remaining = offset - received;
                self.input = if remaining == 0 {
                    InputState::End
                } else {
                    InputState::BodyKnown { received, remaining }
                };
                Ok(())
            }
            InputState::Closed { received, .. } => {
                if offset < received {
                    return Err(WasError::Protocol(ProtocolError::LengthMismatch));
                }
                let remaining = offset - received;
                self.input = if remaining == 0 {
                    InputState::End
                } else {
                    InputState::Closed {
                        received,
                        remaining: Some(remaining),
                    }
                };
                Ok(())
            }
            _ => Err(WasError::Protocol(ProtocolError::UnexpectedPacket)),
        }
    }

    /// Account for bytes consumed off the input pipe; reaching a known
    /// boundary ends the body.
    pub fn input_consumed(&mut self, count: u64) -> WasResult<()> {
        match self.input {
            InputState::BodyUnknown { received } => {
                self.input = InputState::BodyUnknown {
                    received: received + count,
                };
                Ok(())
            }
            InputState::BodyKnown { received, remaining } => {
                if count > remaining {
                    self.input = InputState::Error;
                    return Err(WasError::Misuse(MisuseError::BodyOverrun));
                }
                let remaining = remaining - count;
                self.input = if remaining == 0 {
                    InputState::End
                } else {
                    InputState::BodyKnown {
                        received: received + count,
                        remaining,
                    }
                };
                Ok(())
            }
            InputState::Closed { received, remaining } => {
                match remaining {
                    Some(left) => {
                        if count > left {
                            self.input = InputState::Error;
                            return Err(WasError::Misuse(MisuseError::BodyOverrun));
                        }
                        let left = left - count;
                        self.input = if left == 0 {
                            InputState::End
                        } else {
                            InputState::Closed {
                                received: received + count,
                                remaining: Some(left),
                            }
                        };
                    }
                    None => {
                        self.input = InputState::Closed {
                            received: received + count,
                            remaining: None,
                        };
                    }
                }
                Ok(())
            }
            _ => Err(WasError::Misuse(MisuseError::NoBody)),
        }
    }

    /// Move an open body into the drain state after STOP went out.
    pub fn input_close(&mut self) {
        self.input = match self.input {
            InputState::BodyUnknown { received } => InputState::Closed {
                received,
                remaining: None,
            },
            InputState::BodyKnown { received, remaining } => InputState::Closed {
                received,
                remaining: Some(remaining),
            },
            other => other,
        };
    }

    pub fn input_remaining(&self) -> Option<u64> {
        match self.input {
            InputState::BodyKnown { remaining, .. } => Some(remaining),
            _ => None,
        }
    }

    /// STATUS may be committed exactly once, before anything else of the
    /// response.
    pub fn output_commit(&mut self, status: u16) -> WasResult<()> {
        match self.output {
            OutputState::None => {
                self.status = Some(status);
                self.output = OutputState::Headers;
                Ok(())
            }
            _ => Err(WasError::Misuse(MisuseError::StatusAlreadySet)),
        }
    }

    /// Record the declared response length; legal until the first body
    /// byte went out.
    pub fn output_announce(&mut self, total: u64) -> WasResult<()> {
        if self.out_announced.is_some() {
            return Err(WasError::Misuse(MisuseError::LengthAlreadySet));
        }
        match self.output {
            OutputState::Headers => {
                self.out_announced = Some(total);
                Ok(())
            }
            OutputState::BodyUnknown { sent: 0 } => {
                self.out_announced = Some(total);
                self.output = OutputState::BodyKnown {
                    sent: 0,
                    remaining: total,
                };
                Ok(())
            }
            _ => Err(WasError::Misuse(MisuseError::BodyStarted)),
        }
    }

    /// DATA went out; the response body begins. Idempotent once streaming.
    pub fn output_begun(&mut self) -> WasResult<()> {
        match self.output {
            OutputState::Headers => {
                self.output = match self.out_announced {
                    Some(total) => OutputState::BodyKnown {
                        sent: 0,
                        remaining: total,
                    },
                    None => OutputState::BodyUnknown { sent: 0 },
                };
                Ok(())
            }
            OutputState::BodyUnknown { .. } | OutputState::BodyKnown { .. } => Ok(()),
            _ => Err(WasError::Misuse(MisuseError::Finished)),
        }
    }

    /// Account for bytes put on the output pipe; writing past a declared
    /// length fails the response.
    pub fn output_consumed(&mut self, count: u64) -> WasResult<()> {
        match self.output {
            OutputState::BodyUnknown { sent } => {
                self.output = OutputState::BodyUnknown { sent: sent + count };
                Ok(())
            }
            OutputState::BodyKnown { sent, remaining } => {
                if count > remaining {
                    self.output = OutputState::Error;
                    return Err(WasError::Misuse(MisuseError::BodyOverrun));
                }
                self.output = OutputState::BodyKnown {
                    sent: sent + count,
                    remaining: remaining - count,
                };
                Ok(())
            }
            _ => Err(WasError::Misuse(MisuseError::NoBody)),
        }
    }

    pub fn output_remaining(&self) -> Option<u64> {
        match self.output {
            OutputState::BodyKnown { remaining, .. } => Some(remaining),
            _ => None,
        }
    }
}

/// Owned snapshot over name/value entries (headers or parameters).
/// Snapshots are independent of later session mutation and of each other.
pub struct EntryIter {
    entries: std::vec::IntoIter<(String, String)>,
}

impl EntryIter {
    pub(crate) fn new(entries: Vec<(String, String)>) -> EntryIter {
        EntryIter {
            entries: entries.into_iter(),
        }
    }
}

impl Iterator for EntryIter {
    type Item = (String, String);

    fn next(&mut self) -> Option<(String, String)> {
        self.entries.next()
    }
}
