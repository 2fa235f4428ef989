//! Length-prefixed JSON frames over non-blocking descriptors.
//!
//! A frame is a 4-byte big-endian length followed by that many bytes of
//! JSON. Both the SyncChannel and the scale worker's result pipe carry
//! frames, so neither side ever depends on end-of-file to find the end of
//! a message.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tern_core::error::{ChannelError, Error, Result};
use tern_core::utils::deadline::{CancellationToken, Deadline, WAIT_SLICE};

/// Maximum frame body size.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Pause between reads while a reader waits for its first writer.
const WRITER_RETRY_INTERVAL: Duration = Duration::from_millis(2);

/// What a reader makes of a hang-up seen before any byte of the frame.
///
/// A FIFO reports a hang-up whenever it has no writer, including before the
/// peer has opened its end, and a descriptor inherited by a forked process
/// can close and raise one at any time. Only a hang-up in the middle of a
/// frame means the peer is really gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hangup {
    /// The peer is gone: fail with `ChannelError::Closed`.
    Closed,
    /// No writer yet: keep waiting until the deadline.
    AwaitWriter,
}

/// Encode a message into a complete frame.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge(body.len()).into());
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame body.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| ChannelError::Malformed(e.to_string()).into())
}

/// Wait until `fd` reports one of `events`, or any error/hangup condition.
///
/// Passing empty `events` waits only for the error/hangup conditions, which
/// the kernel always reports.
pub(crate) fn wait_ready(
    fd: BorrowedFd<'_>,
    events: PollFlags,
    deadline: Deadline,
    cancel: &CancellationToken,
    what: &str,
) -> Result<PollFlags> {
    loop {
        deadline.check(cancel, what)?;

        let slice = deadline.slice(WAIT_SLICE).as_millis().clamp(1, u16::MAX as u128) as u16;
        let mut fds = [PollFd::new(fd, events)];
        match poll(&mut fds, PollTimeout::from(slice)) {
            Ok(0) => continue,
            Ok(_) => return Ok(fds[0].revents().unwrap_or_else(PollFlags::empty)),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e).into()),
        }
    }
}

/// Write a complete frame to a non-blocking file.
///
/// # Arguments
///
/// * `file` - The write end, opened with `O_NONBLOCK`.
/// * `frame` - An encoded frame.
/// * `origin` - Name of the descriptor, used in errors.
pub fn write_frame(
    file: &mut File,
    frame: &[u8],
    origin: &Path,
    deadline: Deadline,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut written = 0;
    while written < frame.len() {
        match file.write(&frame[written..]) {
            Ok(0) => return Err(ChannelError::Closed(origin.to_path_buf()).into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let revents =
                    wait_ready(file.as_fd(), PollFlags::POLLOUT, deadline, cancel, "writing frame")?;
                if revents.contains(PollFlags::POLLERR) && !revents.contains(PollFlags::POLLOUT) {
                    return Err(ChannelError::Closed(origin.to_path_buf()).into());
                }
            }
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                return Err(ChannelError::Closed(origin.to_path_buf()).into());
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Read a complete frame body from a non-blocking file.
pub fn read_frame(
    file: &mut File,
    origin: &Path,
    hangup: Hangup,
    deadline: Deadline,
    cancel: &CancellationToken,
) -> Result<Vec<u8>> {
    let mut header = [0u8; HEADER_LEN];
    fill(file, &mut header, origin, hangup, deadline, cancel)?;

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ChannelError::FrameTooLarge(len).into());
    }

    let mut body = vec![0u8; len];
    fill(file, &mut body, origin, Hangup::Closed, deadline, cancel)?;
    Ok(body)
}

/// Read and decode one message.
pub fn read_message<T: DeserializeOwned>(
    file: &mut File,
    origin: &Path,
    hangup: Hangup,
    deadline: Deadline,
    cancel: &CancellationToken,
) -> Result<T> {
    let body = read_frame(file, origin, hangup, deadline, cancel)?;
    decode(&body)
}

/// Fill `buf` completely. `hangup` applies only while `buf` is empty.
fn fill(
    file: &mut File,
    buf: &mut [u8],
    origin: &Path,
    hangup: Hangup,
    deadline: Deadline,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => {
                // No writer right now. A ready descriptor means bytes raced
                // in; a hang-up is judged by `hangup`.
                let revents =
                    wait_ready(file.as_fd(), PollFlags::POLLIN, deadline, cancel, "reading frame")?;
                if revents.contains(PollFlags::POLLIN) {
                    continue;
                }
                if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL) {
                    if hangup == Hangup::AwaitWriter && filled == 0 {
                        // The hang-up stays raised until a writer opens, so
                        // poll would return at once. Sleep instead.
                        deadline.check(cancel, "waiting for a writer")?;
                        thread::sleep(deadline.slice(WRITER_RETRY_INTERVAL));
                        continue;
                    }
                    return Err(Error::Channel(ChannelError::Closed(origin.to_path_buf())));
                }
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                wait_ready(file.as_fd(), PollFlags::POLLIN, deadline, cancel, "reading frame")?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
