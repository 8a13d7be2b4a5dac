//! Control channel to the supervisor.
//!
//! Two inherited descriptors carry 4-byte native-endian control words. The
//! meaning of a word comes from its position in the exchange:
//!
//! | direction            | word              | when                                  |
//! |----------------------|-------------------|---------------------------------------|
//! | bridge → supervisor  | [`HELLO`]         | once, after the coverage map attached |
//! | supervisor → bridge  | any               | acknowledgement / go-ahead            |
//! | child → supervisor   | child pid         | start of every generation             |
//! | child → supervisor   | [`DONE`]          | iteration finished, child stops       |
//! | parent → supervisor  | raw wait status   | child of the generation has exited    |
//!
//! Wait statuses fit in 16 bits, so a status report is never equal to `DONE`.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use thiserror::Error;
use tracing::trace;

pub const WORD_LEN: usize = 4;

pub const HELLO: u32 = 0;
pub const DONE: u32 = u32::MAX;

#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The descriptor is not open. Expected when no supervisor launched us.
    #[error("Control descriptor {fd} is not open, no supervisor attached")]
    Unavailable { fd: RawFd },

    /// The supervisor went away or the stream is out of step.
    #[error("Short read on control channel: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("Control channel I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Everything except a missing channel means the supervisor can no longer
    /// be trusted to agree with us about where we are.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::Unavailable { .. })
    }
}

/// The supervisor's reply to the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack(pub u32);

/// Word-level access to the supervisor plus the protocol steps built on it.
///
/// Implementors provide [`write_word`](ControlChannel::write_word) and
/// [`read_word`](ControlChannel::read_word); the provided methods fix which
/// word goes where.
pub trait ControlChannel: Send {
    fn write_word(&mut self, word: u32) -> Result<(), ProtocolError>;

    fn read_word(&mut self) -> Result<u32, ProtocolError>;

    /// Announces this process to the supervisor and blocks for its reply.
    fn handshake(&mut self) -> Result<Ack, ProtocolError> {
        self.write_word(HELLO)?;
        let ack = self.read_word()?;
        trace!(ack, "handshake acknowledged");
        Ok(Ack(ack))
    }

    /// Tells the supervisor which process runs the iterations of this generation.
    fn announce(&mut self, pid: u32) -> Result<(), ProtocolError> {
        self.write_word(pid)
    }

    fn signal_done(&mut self) -> Result<(), ProtocolError> {
        self.write_word(DONE)
    }

    fn wait_go(&mut self) -> Result<u32, ProtocolError> {
        self.read_word()
    }

    fn report_exit(&mut self, status: i32) -> Result<(), ProtocolError> {
        self.write_word(status as u32)
    }
}

/// Reads exactly one control word, resuming after `EINTR`.
pub fn read_word_from<R: Read>(reader: &mut R) -> Result<u32, ProtocolError> {
    let mut buf = [0u8; WORD_LEN];
    let mut got = 0;
    while got < WORD_LEN {
        match reader.read(&mut buf[got..]) {
            Ok(0) => {
                return Err(ProtocolError::ShortRead {
                    expected: WORD_LEN,
                    got,
                });
            }
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtocolError::Io(e)),
        }
    }
    Ok(u32::from_ne_bytes(buf))
}

/// The control channel over the descriptors inherited from the supervisor.
#[derive(Debug)]
pub struct FdControlChannel {
    reader: File,
    writer: File,
    read_fd: RawFd,
    write_fd: RawFd,
}

impl FdControlChannel {
    /// Takes ownership of `read_fd` and `write_fd` if both are open.
    pub fn inherit(read_fd: RawFd, write_fd: RawFd) -> Result<Self, ProtocolError> {
        for fd in [read_fd, write_fd] {
            if !fd_is_open(fd) {
                return Err(ProtocolError::Unavailable { fd });
            }
        }

        // SAFETY: both descriptors were verified open above and are handed to
        // us by the supervisor for our exclusive use.
        let (reader, writer) =
            unsafe { (File::from_raw_fd(read_fd), File::from_raw_fd(write_fd)) };
        Ok(Self {
            reader,
            writer,
            read_fd,
            write_fd,
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn write_fd(&self) -> RawFd {
        self.write_fd
    }
}

impl ControlChannel for FdControlChannel {
    fn write_word(&mut self, word: u32) -> Result<(), ProtocolError> {
        match self.writer.write_all(&word.to_ne_bytes()) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBADF) => Err(ProtocolError::Unavailable {
                fd: self.write_fd,
            }),
            Err(e) => Err(ProtocolError::Io(e)),
        }
    }

    fn read_word(&mut self) -> Result<u32, ProtocolError> {
        read_word_from(&mut self.reader)
    }
}

fn fd_is_open(fd: RawFd) -> bool {
    // SAFETY: F_GETFD only inspects the descriptor table.
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}
