use crate::buffer::Buffer;
use crate::fdio;
use crate::logging;
use crate::packet::{self, Command, Packet, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::support::{MisuseError, WasError, WasResult};
use byteorder::{ByteOrder, LittleEndian};
use std::io;
use std::os::unix::io::RawFd;

const RECV_BUF_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE;

/// The framed side of the session: turns the bidirectional control
/// descriptor into typed packets and back. Once a transport error is seen
/// the channel is broken and every further operation short-circuits.
pub struct Channel {
    fd: RawFd,
    recv: Buffer,
    broken: bool,
    log: logging::Logger,
}

impl Channel {
    pub fn new(fd: RawFd, log: &logging::Logger) -> Channel {
        Channel {
            fd,
            recv: Buffer::new(RECV_BUF_SIZE),
            broken: false,
            log: log.new(logging::o!("channel" => fd)),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Marks the channel dead; pending unparsed bytes are dropped and all
    /// further operations short-circuit.
    pub fn set_broken(&mut self) {
        self.broken = true;
        self.recv.clear();
    }

    /// Read once from the control descriptor into the receive buffer and
    /// return the byte count. Zero means the peer closed the channel.
    pub fn fill(&mut self) -> WasResult<usize> {
        if self.broken {
            return Err(WasError::Io(io::ErrorKind::BrokenPipe));
        }

        match self.recv.fill(fdio::Fd(self.fd)) {
            Ok(count) => {
                logging::trace!(self.log, "control bytes received";
                                "count" => count,
                                "buffered" => self.recv.len(),
                                "free" => self.recv.free_capacity());
                Ok(count)
            }
            Err(err) => {
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Err(WasError::Wait);
                }
                logging::warn!(self.log, "control read failed"; "error" => ?err);
                self.broken = true;
                Err(WasError::from(err))
            }
        }
    }

    /// Parse one complete packet out of the receive buffer. An unknown
    /// command still consumes its frame, so the stream stays synchronized.
    pub fn try_next(&mut self) -> WasResult<Packet> {
        if self.recv.is_empty() {
            return Err(WasError::Wait);
        }

        let (code, length) = {
            let data = self.recv.data();
            if data.len() < HEADER_SIZE {
                return Err(WasError::Wait);
            }
            (
                LittleEndian::read_u16(&data[0..2]),
                LittleEndian::read_u16(&data[2..4]) as usize,
            )
        };

        if self.recv.len() < HEADER_SIZE + length {
            return Err(WasError::Wait);
        }

        let payload = self.recv.data()[HEADER_SIZE..HEADER_SIZE + length].to_vec();
        self.recv.consume(HEADER_SIZE + length);

        let command = Command::from_wire(code)?;

        logging::trace!(self.log, "received packet"; "command" => ?command, "length" => length);

        Ok(Packet { command, payload })
    }

    /// Serialize and transmit one packet. Header and payload go out as a
    /// single buffer; partial writes are retried until the whole frame is
    /// on the wire.
    pub fn send(&mut self, command: Command, payload: &[u8]) -> WasResult<()> {
        if self.broken {
            return Err(WasError::Io(io::ErrorKind::BrokenPipe));
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WasError::Misuse(MisuseError::OversizedPayload));
        }

        let frame = packet::serialize(command, payload);
        let mut offset = 0;

        while offset < frame.len() {
            match fdio::write(self.fd, &frame[offset..]) {
                Ok(0) => {
                    self.broken = true;
                    return Err(WasError::Io(io::ErrorKind::WriteZero));
                }
                Ok(count) => offset += count,
                Err(err) => {
                    logging::warn!(self.log, "control write failed"; "error" => ?err);
                    self.broken = true;
                    return Err(WasError::from(err));
                }
            }
        }

        logging::trace!(self.log, "sent packet"; "command" => ?command, "length" => payload.len());

        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        fdio::close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::support::ProtocolError;
    use std::io::{Read, Write};
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;

    fn pair() -> (Channel, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let log = logging::Logger::root(logging::Discard, logging::o!());
        (Channel::new(ours.into_raw_fd(), &log), theirs)
    }

    #[test]
    fn test_recv_one_packet() {
        let (mut channel, mut peer) = pair();

        peer.write_all(&packet::serialize(Command::Uri, b"/index")).unwrap();
        channel.fill().unwrap();

        let packet = channel.try_next().unwrap();
        assert_eq!(packet.command, Command::Uri);
        assert_eq!(packet.payload, b"/index");

        assert_eq!(channel.try_next().unwrap_err(), WasError::Wait);
    }

    #[test]
    fn test_recv_zero_length_payload() {
        let (mut channel, mut peer) = pair();

        peer.write_all(&packet::serialize(Command::NoData, &[])).unwrap();
        channel.fill().unwrap();

        let packet = channel.try_next().unwrap();
        assert_eq!(packet.command, Command::NoData);
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_the_rest() {
        let (mut channel, mut peer) = pair();
        let frame = packet::serialize(Command::Uri, b"/split");

        peer.write_all(&frame[..3]).unwrap();
        channel.fill().unwrap();
        assert_eq!(channel.try_next().unwrap_err(), WasError::Wait);

        peer.write_all(&frame[3..]).unwrap();
        channel.fill().unwrap();
        assert_eq!(channel.try_next().unwrap().payload, b"/split");
    }

    #[test]
    fn test_unknown_command_keeps_the_stream_in_sync() {
        let (mut channel, mut peer) = pair();

        peer.write_all(&[0xe7, 0x03, 2, 0, 9, 9]).unwrap();
        peer.write_all(&packet::serialize(Command::Request, &[])).unwrap();
        channel.fill().unwrap();

        assert_eq!(
            channel.try_next().unwrap_err(),
            WasError::Protocol(ProtocolError::UnknownCommand)
        );
        assert_eq!(channel.try_next().unwrap().command, Command::Request);
    }

    #[test]
    fn test_send_frames_packets() {
        let (mut channel, mut peer) = pair();

        channel.send(Command::Status, &packet::encode_u32(200)).unwrap();

        let mut frame = [0u8; 8];
        peer.read_exact(&mut frame).unwrap();
        assert_eq!(&frame, &[9, 0, 4, 0, 200, 0, 0, 0]);
    }

    #[test]
    fn test_send_after_error_short_circuits() {
        let (mut channel, peer) = pair();
        drop(peer);

        assert_eq!(
            channel.send(Command::NoData, &[]),
            Err(WasError::Io(io::ErrorKind::BrokenPipe))
        );

        // No syscall happens once the channel is broken.
        assert_eq!(
            channel.send(Command::NoData, &[]),
            Err(WasError::Io(io::ErrorKind::BrokenPipe))
        );
    }

    #[test]
    fn test_fill_reports_peer_close() {
        let (mut channel, peer) = pair();
        drop(peer);

        assert_eq!(channel.fill().unwrap(), 0);
    }
}
