use mio::unix::EventedFd;
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

const CONTROL_TOKEN: Token = Token(0);
const INPUT_TOKEN: Token = Token(1);
const OUTPUT_TOKEN: Token = Token(2);

/// Readiness of the session descriptors after one wait.
#[derive(Debug, Default, Copy, Clone)]
pub struct Readiness {
    pub control: bool,
    pub input: bool,
    pub output: bool,
}

/// Waits on the session descriptors. The control descriptor is part of
/// every wait set; the body descriptors join only the waits that ask for
/// them.
pub struct Poller {
    poll: Poll,
    events: Events,
    input: RawFd,
    output: RawFd,
}

impl Poller {
    pub fn new(control: RawFd, input: RawFd, output: RawFd) -> io::Result<Poller> {
        let poll = Poll::new()?;

        poll.register(
            &EventedFd(&control),
            CONTROL_TOKEN,
            Ready::readable(),
            PollOpt::level(),
        )?;

        Ok(Poller {
            poll,
            events: Events::with_capacity(8),
            input,
            output,
        })
    }

    /// Wait until one of the selected descriptors is ready or the timeout
    /// elapses; `None` waits indefinitely.
    pub fn wait(&mut self, input: bool, output: bool, timeout: Option<Duration>) -> io::Result<Readiness> {
        if input {
            self.poll.register(
                &EventedFd(&self.input),
                INPUT_TOKEN,
                Ready::readable(),
                PollOpt::level(),
            )?;
        }
        if output {
            let registered = self.poll.register(
                &EventedFd(&self.output),
                OUTPUT_TOKEN,
                Ready::writable(),
                PollOpt::level(),
            );
            if let Err(err) = registered {
                if input {
                    let _ = self.poll.deregister(&EventedFd(&self.input));
                }
                return Err(err);
            }
        }

        let result = self.poll.poll(&mut self.events, timeout);

        if input {
            let _ = self.poll.deregister(&EventedFd(&self.input));
        }
        if output {
            let _ = self.poll.deregister(&EventedFd(&self.output));
        }
        result?;

        let mut ready = Readiness::default();
        for event in &self.events {
            match event.token() {
                CONTROL_TOKEN => ready.control = true,
                INPUT_TOKEN => ready.input = true,
                OUTPUT_TOKEN => ready.output = true,
                _ => (),
            }
        }

        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    struct Fixture {
        poller: Poller,
        control_peer: UnixStream,
        input_peer: UnixStream,
        _output_peer: UnixStream,
        _control: UnixStream,
        _input: UnixStream,
        _output: UnixStream,
    }

    fn fixture() -> Fixture {
        let (control_peer, control) = UnixStream::pair().unwrap();
        let (input_peer, input) = UnixStream::pair().unwrap();
        let (output_peer, output) = UnixStream::pair().unwrap();

        let poller = Poller::new(control.as_raw_fd(), input.as_raw_fd(), output.as_raw_fd()).unwrap();

        Fixture {
            poller,
            control_peer,
            input_peer,
            _output_peer: output_peer,
            _control: control,
            _input: input,
            _output: output,
        }
    }

    #[test]
    fn test_timeout_with_idle_descriptors() {
        let mut fix = fixture();

        let ready = fix
            .poller
            .wait(true, false, Some(Duration::from_millis(10)))
            .unwrap();

        assert!(!ready.control && !ready.input && !ready.output);
    }

    #[test]
    fn test_control_is_always_watched() {
        let mut fix = fixture();
        fix.control_peer.write_all(&[1]).unwrap();

        let ready = fix.poller.wait(false, false, None).unwrap();

        assert!(ready.control);
    }

    #[test]
    fn test_input_joins_the_wait_set_on_demand() {
        let mut fix = fixture();
        fix.input_peer.write_all(&[1]).unwrap();

        let ready = fix
            .poller
            .wait(false, false, Some(Duration::from_millis(0)))
            .unwrap();
        assert!(!ready.input);

        let ready = fix.poller.wait(true, false, None).unwrap();
        assert!(ready.input);
    }

    #[test]
    fn test_output_reports_writable() {
        let mut fix = fixture();

        let ready = fix.poller.wait(false, true, None).unwrap();

        assert!(ready.output);
    }
}
