use crate::channel::Channel;
use crate::fdio;
use crate::logging;
use crate::packet::{self, Command, Method, Packet};
use crate::poll::Poller;
use crate::request::{header_allowed, Accounting, EntryIter, InputState, OutputState, Request};
use crate::support::{MisuseError, PollStatus, WasError, WasResult};
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Descriptor slots inherited from the peer.
pub const INPUT_FILENO: RawFd = 0;
pub const OUTPUT_FILENO: RawFd = 1;
pub const CONTROL_FILENO: RawFd = 3;

const DRAIN_CHUNK: usize = 8192;

/// One protocol session bound to a control/input/output descriptor triple,
/// serving requests serially. The API is synchronous; every blocking entry
/// point waits on the relevant descriptor together with the control
/// descriptor, so out-of-band packets are serviced while the application
/// sits in a body read or write.
///
/// A session is single-threaded; independent sessions on disjoint
/// descriptor triples do not interact. Descriptors are owned and closed at
/// teardown.
pub struct Session {
    channel: Channel,
    input: RawFd,
    output: RawFd,
    poller: Poller,
    request: Option<Request>,
    stopping: bool,
    log: logging::Logger,
}

impl Session {
    /// Binds the descriptor slots inherited from the peer.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> WasResult<Session> {
        Session::with_fds(CONTROL_FILENO, INPUT_FILENO, OUTPUT_FILENO, log)
    }

    /// Binds an explicit descriptor triple. The body pipes are switched to
    /// non-blocking mode; the control descriptor stays blocking and is
    /// polled before every read.
    pub fn with_fds<'a, L: Into<Option<&'a logging::Logger>>>(
        control: RawFd,
        input: RawFd,
        output: RawFd,
        log: L,
    ) -> WasResult<Session> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::Logger::root(logging::Discard, logging::o!()),
        };

        fdio::set_nonblocking(input)?;
        fdio::set_nonblocking(output)?;
        let poller = Poller::new(control, input, output)?;

        logging::debug!(log, "session bound";
                        "control" => control,
                        "input" => input,
                        "output" => output);

        Ok(Session {
            channel: Channel::new(control, &log),
            input,
            output,
            poller,
            request: None,
            stopping: false,
            log,
        })
    }

    #[inline]
    pub fn control_fd(&self) -> RawFd {
        self.channel.fd()
    }

    #[inline]
    pub fn input_fd(&self) -> RawFd {
        self.input
    }

    #[inline]
    pub fn output_fd(&self) -> RawFd {
        self.output
    }
}

// Request inspection.
impl Session {
    pub fn method(&self) -> Option<Method> {
        self.request.as_ref().map(|request| request.method)
    }

    pub fn uri(&self) -> Option<&str> {
        self.request.as_ref().map(|request| request.uri.as_str())
    }

    pub fn script_name(&self) -> Option<&str> {
        self.request.as_ref().map(|request| request.script_name.as_str())
    }

    pub fn path_info(&self) -> Option<&str> {
        self.request.as_ref().map(|request| request.path_info.as_str())
    }

    pub fn query_string(&self) -> Option<&str> {
        self.request.as_ref().map(|request| request.query_string.as_str())
    }

    pub fn remote_host(&self) -> Option<&str> {
        self.request.as_ref().map(|request| request.remote_host.as_str())
    }

    /// First request header matching `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.as_ref().and_then(|request| request.header(name))
    }

    /// Snapshot over every value of one header name, in request order.
    pub fn multi_header(&self, name: &str) -> EntryIter {
        let entries = match &self.request {
            Some(request) => request
                .headers
                .iter()
                .filter(|(entry, _)| entry.eq_ignore_ascii_case(name))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        EntryIter::new(entries)
    }

    /// Snapshot over all request headers, in request order.
    pub fn header_iter(&self) -> EntryIter {
        let entries = match &self.request {
            Some(request) => request.headers.clone(),
            None => Vec::new(),
        };
        EntryIter::new(entries)
    }

    /// Parameter lookup; names are case-sensitive.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.request
            .as_ref()
            .and_then(|request| request.parameters.get(name))
            .map(|value| value.as_str())
    }

    pub fn parameter_iter(&self) -> EntryIter {
        let entries = match &self.request {
            Some(request) => request
                .parameters
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            None => Vec::new(),
        };
        EntryIter::new(entries)
    }

    pub fn want_metrics(&self) -> bool {
        self.request
            .as_ref()
            .map(|request| request.want_metrics)
            .unwrap_or(false)
    }

    /// True once the peer announced a body, even after it was consumed.
    pub fn has_body(&self) -> bool {
        self.request
            .as_ref()
            .map(|request| request.body_seen)
            .unwrap_or(false)
    }

    /// Declared bytes left on the input pipe; None while the length is
    /// unknown or there is no body.
    pub fn input_remaining(&self) -> Option<u64> {
        self.request.as_ref().and_then(|request| request.input_remaining())
    }
}

// Accept loop and control channel dispatch.
impl Session {
    /// Waits for the next request and returns its URI, finalizing the
    /// previous request first. `None` means the peer shut the session
    /// down; once reported it is reported forever.
    pub fn accept(&mut self) -> WasResult<Option<String>> {
        match self.next_request(true) {
            Err(WasError::Io(kind)) => {
                logging::warn!(self.log, "session transport failed"; "error" => ?kind);
                self.channel.set_broken();
                self.stopping = true;
                self.request = None;
                Ok(None)
            }
            other => other,
        }
    }

    /// Non-blocking accept: `Err(Wait)` when no packet is immediately
    /// available. The caller is expected to poll `control_fd` externally.
    pub fn try_accept(&mut self) -> WasResult<Option<String>> {
        match self.next_request(false) {
            Err(WasError::Io(kind)) => {
                logging::warn!(self.log, "session transport failed"; "error" => ?kind);
                self.channel.set_broken();
                self.stopping = true;
                self.request = None;
                Ok(None)
            }
            other => other,
        }
    }

    fn next_request(&mut self, blocking: bool) -> WasResult<Option<String>> {
        self.finish_request()?;

        loop {
            let failed = self
                .request
                .as_ref()
                .map(|request| request.failed)
                .unwrap_or(false);
            if failed {
                // Realign the input pipe, then wait for a fresh REQUEST.
                self.drain_input()?;
                self.request = None;
            }

            if let Some(request) = &self.request {
                if request.complete {
                    logging::debug!(self.log, "request accepted";
                                    "method" => request.method.as_str(),
                                    "uri" => request.uri.as_str());
                    return Ok(Some(request.uri.clone()));
                }
            }

            if self.stopping {
                return Ok(None);
            }

            let timeout = if blocking {
                None
            } else {
                Some(Duration::from_millis(0))
            };
            let ready = self.poller.wait(false, false, timeout)?;
            if !ready.control {
                if blocking {
                    continue;
                }
                return Err(WasError::Wait);
            }
            self.pump()?;
        }
    }

    /// Finalize the previous request: implicit end when the application
    /// did not finish the response, then drop all request state.
    fn finish_request(&mut self) -> WasResult<()> {
        let needs_end = match &self.request {
            None => return Ok(()),
            Some(request) => {
                !request.failed
                    && !request.stopped
                    && request.output != OutputState::End
                    && request.output != OutputState::Error
            }
        };

        if needs_end {
            match self.end() {
                Ok(()) => (),
                Err(WasError::Io(kind)) => return Err(WasError::Io(kind)),
                Err(err) => {
                    logging::warn!(self.log, "implicit end failed, aborting the response";
                                   "error" => ?err);
                    match self.abort() {
                        Err(WasError::Io(kind)) => return Err(WasError::Io(kind)),
                        _ => (),
                    }
                }
            }
        } else {
            match self.drain_input() {
                Err(WasError::Io(kind)) => return Err(WasError::Io(kind)),
                _ => (),
            }
        }

        if let Some(request) = self.request.take() {
            logging::debug!(self.log, "request finished"; "status" => request.status);
        }
        Ok(())
    }

    /// Service the control channel after a readable event: one read, then
    /// dispatch of every complete packet in the buffer. Peer violations
    /// fail the current request; only transport errors propagate.
    fn pump(&mut self) -> WasResult<()> {
        match self.channel.fill() {
            Ok(0) => {
                logging::debug!(self.log, "control channel closed by peer");
                self.stopping = true;
                self.channel.set_broken();
                if let Some(request) = &mut self.request {
                    request.failed = true;
                    request.output = OutputState::Error;
                }
                return Ok(());
            }
            Ok(_) => (),
            Err(WasError::Wait) => return Ok(()),
            Err(err) => return Err(err),
        }

        loop {
            let packet = match self.channel.try_next() {
                Ok(packet) => packet,
                Err(WasError::Wait) => return Ok(()),
                Err(err) => {
                    logging::warn!(self.log, "dropping unrecognized packet"; "error" => ?err);
                    self.fail_request();
                    continue;
                }
            };

            if let Err(err) = self.dispatch(packet) {
                match err {
                    WasError::Io(kind) => return Err(WasError::Io(kind)),
                    err => {
                        logging::warn!(self.log, "packet failed the request"; "error" => ?err);
                        self.fail_request();
                    }
                }
            }
        }
    }

    /// Abort the request after a peer violation. A request that never
    /// became complete is discarded outright so the accept loop waits for
    /// a fresh REQUEST.
    fn fail_request(&mut self) {
        let discard = match &self.request {
            Some(request) => !request.complete,
            None => return,
        };
        if discard {
            self.request = None;
            return;
        }
        let request = self.request.as_mut().expect("active request");
        request.failed = true;
        request.output = OutputState::Error;
    }

    fn dispatch(&mut self, packet: Packet) -> WasResult<()> {
        match packet.command {
            Command::Nop => Ok(()),
            Command::Shutdown => {
                self.stopping = true;
                Ok(())
            }
            Command::Request => {
                if self.request.is_some() {
                    logging::debug!(self.log, "new request displaces the active one");
                }
                self.request = Some(Request::new());
                Ok(())
            }
            Command::Stop => self.peer_stop(),
            command => {
                let request = match &mut self.request {
                    Some(request) => request,
                    None => {
                        logging::debug!(self.log, "ignoring straggler packet"; "command" => ?command);
                        return Ok(());
                    }
                };
                match command {
                    Command::Method => {
                        request.method = Method::from_wire(packet::decode_u32(&packet.payload)?)?;
                        Ok(())
                    }
                    Command::Uri => {
                        request.uri = packet::decode_str(&packet.payload)?.to_owned();
                        Ok(())
                    }
                    Command::ScriptName => {
                        request.script_name = packet::decode_str(&packet.payload)?.to_owned();
                        Ok(())
                    }
                    Command::PathInfo => {
                        request.path_info = packet::decode_str(&packet.payload)?.to_owned();
                        Ok(())
                    }
                    Command::QueryString => {
                        request.query_string = packet::decode_str(&packet.payload)?.to_owned();
                        Ok(())
                    }
                    Command::RemoteHost => {
                        request.remote_host = packet::decode_str(&packet.payload)?.to_owned();
                        Ok(())
                    }
                    Command::Header => {
                        let (name, value) = packet::decode_pair(&packet.payload)?;
                        request.headers.push((name.to_owned(), value.to_owned()));
                        Ok(())
                    }
                    Command::Parameter => {
                        let (name, value) = packet::decode_pair(&packet.payload)?;
                        request.parameters.insert(name.to_owned(), value.to_owned());
                        Ok(())
                    }
                    Command::Length => request.input_length(packet::decode_u64(&packet.payload)?),
                    Command::Data => request.input_data(),
                    Command::NoData => request.input_no_data(),
                    Command::Premature => {
                        let offset = packet::decode_u64(&packet.payload)?;
                        logging::debug!(self.log, "peer truncated the request body"; "offset" => offset);
                        request.input_premature(offset)
                    }
                    Command::Metric => {
                        request.want_metrics = true;
                        Ok(())
                    }
                    Command::Status => Err(WasError::Protocol(
                        crate::support::ProtocolError::UnexpectedPacket,
                    )),
                    Command::Nop | Command::Request | Command::Stop | Command::Shutdown => {
                        unreachable!()
                    }
                }
            }
        }
    }

    /// STOP from the peer: close the response direction with a truncation
    /// notice, mark the request cancelled, and put the input side into the
    /// drain state. A request that is not yet complete is discarded.
    fn peer_stop(&mut self) -> WasResult<()> {
        let complete = match &self.request {
            None => return Ok(()),
            Some(request) => request.complete,
        };
        if !complete {
            logging::debug!(self.log, "request cancelled before it was complete");
            self.request = None;
            return Ok(());
        }

        let output = self.request.as_ref().expect("active request").output;
        match output {
            OutputState::BodyUnknown { sent } | OutputState::BodyKnown { sent, .. } => {
                self.channel.send(Command::Premature, &packet::encode_u64(sent))?;
            }
            OutputState::None => {
                self.commit_status(500)?;
                self.channel.send(Command::NoData, &[])?;
            }
            OutputState::Headers => {
                self.channel.send(Command::NoData, &[])?;
            }
            OutputState::End | OutputState::Error => (),
        }

        let request = self.request.as_mut().expect("active request");
        request.stopped = true;
        request.output = OutputState::Error;
        request.input_close();
        logging::debug!(self.log, "request cancelled by peer");
        Ok(())
    }
}

// Request body input.
impl Session {
    /// Waits for input readiness, servicing control packets that arrive
    /// during the wait. A negative timeout waits indefinitely.
    pub fn input_poll(&mut self, timeout_ms: i32) -> WasResult<PollStatus> {
        if self.request.is_none() {
            return Err(WasError::Misuse(MisuseError::NoRequest));
        }

        let deadline = Session::deadline(timeout_ms);
        let mut expired = false;
        loop {
            match &self.request {
                None => return Ok(PollStatus::Closed),
                Some(request) => {
                    if request.failed || request.stopped {
                        return Ok(PollStatus::Closed);
                    }
                    match request.input {
                        InputState::NoBody | InputState::End => return Ok(PollStatus::End),
                        InputState::Closed { .. } | InputState::Error => {
                            return Ok(PollStatus::Closed)
                        }
                        InputState::BodyUnknown { .. } | InputState::BodyKnown { .. } => (),
                    }
                }
            }

            if expired {
                return Ok(PollStatus::Timeout);
            }
            let timeout = match deadline {
                None => None,
                Some(at) => match at.checked_duration_since(Instant::now()) {
                    Some(left) => Some(left),
                    None => {
                        expired = true;
                        Some(Duration::from_millis(0))
                    }
                },
            };

            let ready = self.poller.wait(true, false, timeout)?;
            if ready.control {
                self.pump()?;
                continue;
            }
            if ready.input {
                return Ok(PollStatus::Ready);
            }
            if timeout.is_some() {
                expired = true;
            }
        }
    }

    /// Raw-descriptor accounting: the application read `count` bytes off
    /// `input_fd` itself. Mutually exclusive with `read`.
    pub fn received(&mut self, count: u64) -> WasResult<()> {
        let request = self.require_request()?;
        if request.failed || request.stopped {
            return Err(WasError::Misuse(MisuseError::RequestFailed));
        }
        if request.input_mode == Accounting::Stream {
            return Err(WasError::Misuse(MisuseError::AccountingConflict));
        }
        request.input_mode = Accounting::Raw;
        request.input_consumed(count)
    }

    /// Blocking body read; `Ok(0)` is the end of the body. Control packets
    /// arriving during the wait are serviced.
    pub fn read(&mut self, buf: &mut [u8]) -> WasResult<usize> {
        {
            let request = self.require_request()?;
            if request.failed || request.stopped {
                return Err(WasError::Misuse(MisuseError::RequestFailed));
            }
            if request.input_mode == Accounting::Raw {
                return Err(WasError::Misuse(MisuseError::AccountingConflict));
            }
            request.input_mode = Accounting::Stream;
        }
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let cap = match &self.request {
                None => return Ok(0),
                Some(request) => match request.input {
                    InputState::NoBody | InputState::End | InputState::Closed { .. } => {
                        return Ok(0)
                    }
                    InputState::Error => return Err(WasError::Io(io::ErrorKind::Other)),
                    InputState::BodyKnown { remaining, .. } => {
                        remaining.min(buf.len() as u64) as usize
                    }
                    InputState::BodyUnknown { .. } => buf.len(),
                },
            };

            match fdio::read(self.input, &mut buf[..cap]) {
                Ok(0) => {
                    if let Some(request) = &mut self.request {
                        request.input = InputState::Error;
                    }
                    return Err(WasError::Io(io::ErrorKind::UnexpectedEof));
                }
                Ok(count) => {
                    self.request
                        .as_mut()
                        .expect("active request")
                        .input_consumed(count as u64)?;
                    return Ok(count);
                }
                Err(err) => {
                    if err.kind() == io::ErrorKind::WouldBlock {
                        match self.input_poll(-1)? {
                            PollStatus::Ready | PollStatus::Timeout => (),
                            PollStatus::End => return Ok(0),
                            PollStatus::Closed => {
                                return Err(WasError::Misuse(MisuseError::RequestFailed))
                            }
                        }
                    } else {
                        if let Some(request) = &mut self.request {
                            request.input = InputState::Error;
                        }
                        return Err(WasError::from(err));
                    }
                }
            }
        }
    }

    /// Gives up on the rest of the request body: asks the peer to stop,
    /// then discards pending bytes until the peer-declared boundary.
    pub fn input_close(&mut self) -> WasResult<()> {
        match &self.request {
            None => return Err(WasError::Misuse(MisuseError::NoRequest)),
            Some(request) => {
                if request.failed || request.stopped {
                    return Err(WasError::Misuse(MisuseError::RequestFailed));
                }
            }
        }
        self.drain_input()
    }

    /// Discard whatever is left of the request body so the input pipe is
    /// positioned at the next request. Sends STOP if the body is still
    /// open.
    fn drain_input(&mut self) -> WasResult<()> {
        let open = match &self.request {
            None => return Ok(()),
            Some(request) => match request.input {
                InputState::BodyUnknown { .. } | InputState::BodyKnown { .. } => true,
                InputState::Closed { .. } => false,
                InputState::NoBody | InputState::End | InputState::Error => return Ok(()),
            },
        };
        if open {
            self.channel.send(Command::Stop, &[])?;
            self.request.as_mut().expect("active request").input_close();
        }

        let mut scratch = [0u8; DRAIN_CHUNK];
        loop {
            let cap = match &self.request {
                None => return Ok(()),
                Some(request) => match request.input {
                    InputState::Closed { remaining, .. } => remaining,
                    InputState::NoBody | InputState::End => return Ok(()),
                    InputState::Error => return Ok(()),
                    InputState::BodyUnknown { .. } | InputState::BodyKnown { .. } => {
                        unreachable!("input was just closed")
                    }
                },
            };

            let want = match cap {
                Some(left) => left.min(DRAIN_CHUNK as u64) as usize,
                None => DRAIN_CHUNK,
            };
            match fdio::read(self.input, &mut scratch[..want]) {
                Ok(0) => {
                    if let Some(request) = &mut self.request {
                        request.input = InputState::Error;
                    }
                    return Err(WasError::Io(io::ErrorKind::UnexpectedEof));
                }
                Ok(count) => {
                    self.request
                        .as_mut()
                        .expect("active request")
                        .input_consumed(count as u64)?;
                }
                Err(err) => {
                    if err.kind() == io::ErrorKind::WouldBlock {
                        let ready = self.poller.wait(true, false, None)?;
                        if ready.control {
                            self.pump()?;
                        }
                    } else {
                        if let Some(request) = &mut self.request {
                            request.input = InputState::Error;
                        }
                        return Err(WasError::from(err));
                    }
                }
            }
        }
    }
}

// Response head and body output.
impl Session {
    pub fn status(&mut self, status: u16) -> WasResult<()> {
        self.require_live()?;
        if status < 100 || status > 599 {
            return Err(WasError::Misuse(MisuseError::InvalidStatus));
        }
        self.commit_status(status)
    }

    fn commit_status(&mut self, status: u16) -> WasResult<()> {
        {
            let request = self.request.as_mut().expect("active request");
            request.output_commit(status)?;
        }
        self.channel.send(Command::Status, &packet::encode_u32(u32::from(status)))
    }

    /// Adds one response header. Rejected for hop-by-hop names and
    /// Content-Length; `set_length` is the only way to declare a length.
    /// Commits the default 200 status if none was set yet.
    pub fn set_header(&mut self, name: &str, value: &str) -> WasResult<()> {
        self.require_live()?;
        if name.is_empty() || name.contains('=') {
            return Err(WasError::Misuse(MisuseError::InvalidHeader));
        }
        if !header_allowed(name) {
            return Err(WasError::Misuse(MisuseError::ForbiddenHeader));
        }
        match self.request.as_ref().expect("active request").output {
            OutputState::None => self.commit_status(200)?,
            OutputState::Headers => (),
            _ => return Err(WasError::Misuse(MisuseError::HeadersSent)),
        }
        self.channel.send(Command::Header, &packet::encode_pair(name, value))
    }

    /// Copies every request header into the response, skipping the names
    /// the header API refuses.
    pub fn copy_all_headers(&mut self) -> WasResult<()> {
        self.require_live()?;
        let entries = self.request.as_ref().expect("active request").headers.clone();
        for (name, value) in entries {
            if !header_allowed(&name) {
                continue;
            }
            self.set_header(&name, &value)?;
        }
        Ok(())
    }

    /// Declares the response body length. Legal until the first body byte
    /// went out.
    pub fn set_length(&mut self, total: u64) -> WasResult<()> {
        self.require_live()?;
        if self.request.as_ref().expect("active request").output == OutputState::None {
            self.commit_status(200)?;
        }
        {
            let request = self.request.as_mut().expect("active request");
            request.output_announce(total)?;
        }
        self.channel.send(Command::Length, &packet::encode_u64(total))
    }

    /// Begins the response body: commits the default status if needed and
    /// tells the peer to start streaming. Idempotent once streaming.
    pub fn output_begin(&mut self) -> WasResult<()> {
        self.require_live()?;
        match self.request.as_ref().expect("active request").output {
            OutputState::None => self.commit_status(200)?,
            OutputState::Headers => (),
            OutputState::BodyUnknown { .. } | OutputState::BodyKnown { .. } => return Ok(()),
            OutputState::End | OutputState::Error => {
                return Err(WasError::Misuse(MisuseError::Finished))
            }
        }
        {
            let request = self.request.as_mut().expect("active request");
            request.output_begun()?;
        }
        self.channel.send(Command::Data, &[])
    }

    /// Waits for output writability, servicing control packets that arrive
    /// during the wait.
    pub fn output_poll(&mut self, timeout_ms: i32) -> WasResult<PollStatus> {
        if self.request.is_none() {
            return Err(WasError::Misuse(MisuseError::NoRequest));
        }

        let deadline = Session::deadline(timeout_ms);
        let mut expired = false;
        loop {
            match &self.request {
                None => return Ok(PollStatus::Closed),
                Some(request) => {
                    if request.failed || request.stopped {
                        return Ok(PollStatus::Closed);
                    }
                    match request.output {
                        OutputState::End => return Ok(PollStatus::End),
                        OutputState::Error => return Ok(PollStatus::Closed),
                        _ => (),
                    }
                }
            }

            if expired {
                return Ok(PollStatus::Timeout);
            }
            let timeout = match deadline {
                None => None,
                Some(at) => match at.checked_duration_since(Instant::now()) {
                    Some(left) => Some(left),
                    None => {
                        expired = true;
                        Some(Duration::from_millis(0))
                    }
                },
            };

            let ready = self.poller.wait(false, true, timeout)?;
            if ready.control {
                self.pump()?;
                continue;
            }
            if ready.output {
                return Ok(PollStatus::Ready);
            }
            if timeout.is_some() {
                expired = true;
            }
        }
    }

    /// Raw-descriptor accounting: the application wrote `count` bytes to
    /// `output_fd` itself. Mutually exclusive with `write`.
    pub fn sent(&mut self, count: u64) -> WasResult<()> {
        self.require_live()?;
        let request = self.request.as_mut().expect("active request");
        if request.output_mode == Accounting::Stream {
            return Err(WasError::Misuse(MisuseError::AccountingConflict));
        }
        request.output_mode = Accounting::Raw;
        request.output_consumed(count)
    }

    /// Blocking body write; begins the body implicitly. Succeeds only once
    /// every byte is on the pipe.
    pub fn write(&mut self, data: &[u8]) -> WasResult<()> {
        self.require_live()?;
        {
            let request = self.request.as_mut().expect("active request");
            if request.output_mode == Accounting::Raw {
                return Err(WasError::Misuse(MisuseError::AccountingConflict));
            }
            request.output_mode = Accounting::Stream;
        }
        self.output_begin()?;
        {
            let request = self.request.as_mut().expect("active request");
            if let Some(remaining) = request.output_remaining() {
                if data.len() as u64 > remaining {
                    request.output = OutputState::Error;
                    return Err(WasError::Misuse(MisuseError::BodyOverrun));
                }
            }
        }

        let mut offset = 0;
        while offset < data.len() {
            match fdio::write(self.output, &data[offset..]) {
                Ok(0) => {
                    if let Some(request) = &mut self.request {
                        request.output = OutputState::Error;
                    }
                    return Err(WasError::Io(io::ErrorKind::WriteZero));
                }
                Ok(count) => {
                    self.request
                        .as_mut()
                        .expect("active request")
                        .output_consumed(count as u64)?;
                    offset += count;
                }
                Err(err) => {
                    if err.kind() == io::ErrorKind::WouldBlock {
                        match self.output_poll(-1)? {
                            PollStatus::Ready | PollStatus::Timeout => (),
                            PollStatus::End | PollStatus::Closed => {
                                return Err(WasError::Misuse(MisuseError::RequestFailed))
                            }
                        }
                    } else {
                        if let Some(request) = &mut self.request {
                            request.output = OutputState::Error;
                        }
                        return Err(WasError::from(err));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn puts(&mut self, text: &str) -> WasResult<()> {
        self.write(text.as_bytes())
    }

    pub fn write_fmt(&mut self, args: fmt::Arguments) -> WasResult<()> {
        let text = fmt::format(args);
        self.write(text.as_bytes())
    }

    /// Copies up to `max` bytes from the input pipe to the output pipe.
    pub fn splice(&mut self, max: u64) -> WasResult<u64> {
        let mut chunk = [0u8; DRAIN_CHUNK];
        let mut copied = 0u64;

        while copied < max {
            let want = (max - copied).min(chunk.len() as u64) as usize;
            let count = self.read(&mut chunk[..want])?;
            if count == 0 {
                break;
            }
            self.write(&chunk[..count])?;
            copied += count as u64;
        }

        Ok(copied)
    }

    /// Copies the whole remaining request body into the response. When
    /// `end` is set, the declared input length (if known and nothing was
    /// committed yet) becomes the declared output length, and the response
    /// is finished afterwards.
    pub fn splice_all(&mut self, end: bool) -> WasResult<u64> {
        if end {
            let announce = match &self.request {
                Some(request) => match request.output {
                    OutputState::None | OutputState::Headers if request.out_announced.is_none() => {
                        request.input_remaining()
                    }
                    _ => None,
                },
                None => None,
            };
            if let Some(total) = announce {
                self.set_length(total)?;
            }
        }

        let mut chunk = [0u8; DRAIN_CHUNK];
        let mut total = 0u64;
        loop {
            let count = self.read(&mut chunk)?;
            if count == 0 {
                break;
            }
            self.write(&chunk[..count])?;
            total += count as u64;
        }

        if end {
            self.end()?;
        }
        Ok(total)
    }
}

// Termination and metrics.
impl Session {
    /// Finishes the response: 204 if nothing was committed, NO_DATA if no
    /// body was begun, the final length for an unknown-length body. The
    /// rest of the request body is drained before returning.
    pub fn end(&mut self) -> WasResult<()> {
        self.require_live()?;

        let state = self.request.as_ref().expect("active request").output;
        match state {
            OutputState::End => return Err(WasError::Misuse(MisuseError::Finished)),
            OutputState::Error => return Err(WasError::Misuse(MisuseError::RequestFailed)),
            OutputState::BodyKnown { remaining, .. } if remaining > 0 => {
                self.request.as_mut().expect("active request").output = OutputState::Error;
                return Err(WasError::Misuse(MisuseError::BodyIncomplete));
            }
            OutputState::None => {
                self.commit_status(204)?;
                self.channel.send(Command::NoData, &[])?;
            }
            OutputState::Headers => {
                self.channel.send(Command::NoData, &[])?;
            }
            OutputState::BodyUnknown { sent } => {
                self.channel.send(Command::Length, &packet::encode_u64(sent))?;
            }
            OutputState::BodyKnown { .. } => (),
        }

        self.request.as_mut().expect("active request").output = OutputState::End;
        self.drain_input()
    }

    /// Gives up on the response: announces the truncation offset if a body
    /// was begun, a complete error response otherwise. The request body is
    /// drained; only a fresh accept is valid afterwards.
    pub fn abort(&mut self) -> WasResult<()> {
        let state = match &self.request {
            None => return Err(WasError::Misuse(MisuseError::NoRequest)),
            Some(request) => request.output,
        };

        let sent_result = match state {
            OutputState::End => return Err(WasError::Misuse(MisuseError::Finished)),
            OutputState::BodyUnknown { sent } | OutputState::BodyKnown { sent, .. } => {
                self.channel.send(Command::Premature, &packet::encode_u64(sent))
            }
            OutputState::None => self
                .commit_status(500)
                .and_then(|()| self.channel.send(Command::NoData, &[])),
            OutputState::Headers => self.channel.send(Command::NoData, &[]),
            OutputState::Error => Ok(()),
        };

        if let Some(request) = &mut self.request {
            request.output = OutputState::Error;
        }
        match sent_result {
            Err(WasError::Io(kind)) => return Err(WasError::Io(kind)),
            _ => (),
        }
        self.drain_input()
    }

    /// Emits one metric sample. A no-op unless the peer asked for metrics
    /// on this request.
    pub fn metric(&mut self, name: &str, value: f32) -> WasResult<()> {
        self.require_live()?;
        if !self.request.as_ref().expect("active request").want_metrics {
            return Ok(());
        }
        self.channel.send(Command::Metric, &packet::encode_metric(name, value))
    }
}

impl Session {
    fn require_request(&mut self) -> WasResult<&mut Request> {
        match &mut self.request {
            Some(request) => Ok(request),
            None => Err(WasError::Misuse(MisuseError::NoRequest)),
        }
    }

    fn require_live(&mut self) -> WasResult<()> {
        match &self.request {
            None => Err(WasError::Misuse(MisuseError::NoRequest)),
            Some(request) => {
                if request.failed || request.stopped {
                    Err(WasError::Misuse(MisuseError::RequestFailed))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn deadline(timeout_ms: i32) -> Option<Instant> {
        if timeout_ms < 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        fdio::close(self.input);
        fdio::close(self.output);
        // The control descriptor is closed by the channel.
    }
}
