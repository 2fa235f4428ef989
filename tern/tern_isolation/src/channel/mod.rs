//! SyncChannel: a single-use named FIFO between a caller and a worker.
//!
//! The exchange carries exactly one request frame and one response frame:
//!
//! 1. The worker opens the read end and waits for the request.
//! 2. The caller opens the write end, which only succeeds once a reader
//!    exists, and writes the request.
//! 3. The worker reads the request and closes its read end. The caller
//!    observes this as an error condition on its write end.
//! 4. The caller closes the write end, opens its own read end and waits.
//! 5. The worker opens the write end and writes the response.
//!
//! Neither reader treats a hang-up before the first byte of a frame as the
//! end of the exchange: a FIFO without a writer always reports one, and a
//! forked process may briefly hold and then close a copy of a write end.
//! Only the deadline ends those waits.
//!
//! Every step is bounded by a deadline and observes a cancellation token.
//! The caller owns the FIFO file and removes it when the `SyncChannel` is
//! dropped, whatever the outcome of the exchange.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::PollFlags;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tern_core::error::{ChannelError, Error, Result, SetupError};
use tern_core::utils::deadline::{CancellationToken, Deadline};
use tracing::{debug, trace, warn};

use crate::frame::{self, wait_ready, Hangup};
use crate::naming::random_token;

/// File name prefix of channels created by `SyncChannel::create`.
pub const CHANNEL_PREFIX: &str = "tern-";

const CHANNEL_SUFFIX: &str = ".fifo";
const NAME_LEN: usize = 12;
const OPEN_RETRY_INTERVAL: Duration = Duration::from_millis(2);

/// The caller's side of a SyncChannel.
#[derive(Debug)]
pub struct SyncChannel {
    path: PathBuf,
}

impl SyncChannel {
    /// Create a channel with a random name inside `dir`.
    ///
    /// # Returns
    ///
    /// * `Err(SetupError::ChannelCollision)` - The generated path already
    ///   exists. Nothing is created and nothing needs cleaning up.
    pub fn create(dir: &Path) -> Result<Self> {
        let name = format!("{}{}{}", CHANNEL_PREFIX, random_token(NAME_LEN), CHANNEL_SUFFIX);
        Self::create_at(dir.join(name))
    }

    /// Create a channel at an explicit path.
    pub fn create_at(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR) {
            Ok(()) => {
                trace!(path = %path.display(), "Created sync channel");
                Ok(Self { path })
            }
            Err(Errno::EEXIST) => Err(SetupError::ChannelCollision(path).into()),
            Err(e) => Err(SetupError::Channel {
                path,
                source: io::Error::from(e),
            }
            .into()),
        }
    }

    /// Path of the FIFO.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hand the request to the worker.
    ///
    /// Returns once the worker has taken the request and closed its read
    /// end. The returned reader is already attached to the FIFO, so the
    /// worker's response cannot be missed, and the worker cannot open its
    /// write end before it exists.
    ///
    /// # Arguments
    ///
    /// * `request` - The request message.
    /// * `deadline` - Bound on the whole hand-off.
    /// * `cancel` - Abandons the hand-off when cancelled.
    pub fn send<T: Serialize>(
        &self,
        request: &T,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> Result<ResponseReader<'_>> {
        let frame = frame::encode(request)?;

        let mut writer = open_writer(&self.path, deadline, cancel, "waiting for a worker to open the channel")?;
        frame::write_frame(&mut writer, &frame, &self.path, deadline, cancel)?;

        loop {
            let revents = wait_ready(
                writer.as_fd(),
                PollFlags::empty(),
                deadline,
                cancel,
                "waiting for the worker to take the request",
            )?;
            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
                break;
            }
        }

        // Release the write end first. A reader opened while a writer is
        // attached reports a hang-up as soon as that writer closes.
        drop(writer);
        let reader = open_reader(&self.path)?;

        debug!(path = %self.path.display(), bytes = frame.len(), "Request handed to worker");
        Ok(ResponseReader {
            file: reader,
            path: &self.path,
        })
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => trace!(path = %self.path.display(), "Removed sync channel"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove sync channel"),
        }
    }
}

/// The caller's read end, attached before the write end was released.
#[derive(Debug)]
pub struct ResponseReader<'a> {
    file: File,
    path: &'a Path,
}

impl ResponseReader<'_> {
    /// Wait for the worker's response.
    pub fn receive<T: DeserializeOwned>(
        mut self,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> Result<T> {
        frame::read_message(&mut self.file, self.path, Hangup::AwaitWriter, deadline, cancel)
    }
}

/// The worker's side of a SyncChannel, addressed by path.
#[derive(Debug, Clone)]
pub struct WorkerEndpoint {
    path: PathBuf,
}

impl WorkerEndpoint {
    /// Address the channel at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the FIFO.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for and take the request.
    ///
    /// The read end is closed before this returns, which is the caller's
    /// signal that the request was consumed.
    pub fn receive<T: DeserializeOwned>(
        &self,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> Result<T> {
        let mut reader = open_reader(&self.path)?;
        frame::read_message(&mut reader, &self.path, Hangup::AwaitWriter, deadline, cancel)
    }

    /// Write the response.
    ///
    /// Fails with `ChannelError::Gone` if the caller already abandoned the
    /// exchange and removed the channel.
    pub fn reply<T: Serialize>(
        &self,
        response: &T,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let frame = frame::encode(response)?;
        let mut writer = open_writer(&self.path, deadline, cancel, "waiting for the caller to read the response")?;
        frame::write_frame(&mut writer, &frame, &self.path, deadline, cancel)
    }
}

fn open_reader(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
        .map_err(|e| open_error(path, e))
}

/// Open the write end, retrying while no reader is attached.
fn open_writer(
    path: &Path,
    deadline: Deadline,
    cancel: &CancellationToken,
    what: &str,
) -> Result<File> {
    loop {
        deadline.check(cancel, what)?;
        match OpenOptions::new()
            .write(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(path)
        {
            Ok(file) => return Ok(file),
            Err(e) if e.raw_os_error() == Some(Errno::ENXIO as i32) => {
                thread::sleep(deadline.slice(OPEN_RETRY_INTERVAL));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(open_error(path, e)),
        }
    }
}

fn open_error(path: &Path, e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        ChannelError::Gone(path.to_path_buf()).into()
    } else {
        e.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_create_and_remove_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let channel = SyncChannel::create(dir.path()).unwrap();
        let path = channel.path().to_path_buf();

        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(CHANNEL_PREFIX));
        assert!(name.ends_with(CHANNEL_SUFFIX));
        assert!(path.exists());

        drop(channel);
        assert!(!path.exists());
    }

    #[test]
    fn test_collision_is_a_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken.fifo");
        let _first = SyncChannel::create_at(&path).unwrap();

        let err = SyncChannel::create_at(&path).unwrap_err();
        assert!(matches!(err, Error::Setup(SetupError::ChannelCollision(_))));
    }

    #[test]
    fn test_exchange_with_worker_thread() {
        let dir = tempfile::tempdir().unwrap();
        let channel = SyncChannel::create(dir.path()).unwrap();
        let endpoint = WorkerEndpoint::new(channel.path());

        let worker = thread::spawn(move || {
            let deadline = Deadline::after(Duration::from_secs(5));
            let cancel = CancellationToken::new();
            let request: Value = endpoint.receive(deadline, &cancel).unwrap();
            endpoint
                .reply(&json!({ "echo": request }), deadline, &cancel)
                .unwrap();
        });

        let deadline = Deadline::after(Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let reader = channel.send(&json!({"n": 7}), deadline, &cancel).unwrap();
        let response: Value = reader.receive(deadline, &cancel).unwrap();

        worker.join().unwrap();
        assert_eq!(response, json!({"echo": {"n": 7}}));
    }

    #[test]
    fn test_response_waits_for_slow_worker() {
        let dir = tempfile::tempdir().unwrap();
        let channel = SyncChannel::create(dir.path()).unwrap();
        let endpoint = WorkerEndpoint::new(channel.path());

        let worker = thread::spawn(move || {
            let deadline = Deadline::after(Duration::from_secs(5));
            let cancel = CancellationToken::new();
            let request: Value = endpoint.receive(deadline, &cancel).unwrap();
            // The caller sits on a writerless FIFO meanwhile.
            thread::sleep(Duration::from_millis(150));
            endpoint.reply(&json!({ "late": request }), deadline, &cancel).unwrap();
        });

        let deadline = Deadline::after(Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let reader = channel.send(&json!(1), deadline, &cancel).unwrap();
        let response: Value = reader.receive(deadline, &cancel).unwrap();

        worker.join().unwrap();
        assert_eq!(response, json!({"late": 1}));
    }

    #[test]
    fn test_stray_writer_does_not_end_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let channel = SyncChannel::create(dir.path()).unwrap();
        let endpoint = WorkerEndpoint::new(channel.path());

        let worker = thread::spawn(move || {
            let deadline = Deadline::after(Duration::from_secs(5));
            let cancel = CancellationToken::new();
            let _: Value = endpoint.receive(deadline, &cancel).unwrap();

            // A write end that opens and closes without a byte, as one
            // inherited by a forked process does.
            thread::sleep(Duration::from_millis(20));
            let stray = open_writer(endpoint.path(), deadline, &cancel, "opening a stray writer").unwrap();
            drop(stray);

            thread::sleep(Duration::from_millis(50));
            endpoint.reply(&json!("done"), deadline, &cancel).unwrap();
        });

        let deadline = Deadline::after(Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let reader = channel.send(&json!(null), deadline, &cancel).unwrap();
        let response: Value = reader.receive(deadline, &cancel).unwrap();

        worker.join().unwrap();
        assert_eq!(response, json!("done"));
    }

    #[test]
    fn test_receive_times_out_without_response() {
        let dir = tempfile::tempdir().unwrap();
        let channel = SyncChannel::create(dir.path()).unwrap();
        let endpoint = WorkerEndpoint::new(channel.path());

        let worker = thread::spawn(move || {
            let _: Value = endpoint
                .receive(Deadline::after(Duration::from_secs(5)), &CancellationToken::new())
                .unwrap();
        });

        let cancel = CancellationToken::new();
        let reader = channel
            .send(&json!(null), Deadline::after(Duration::from_secs(5)), &cancel)
            .unwrap();
        worker.join().unwrap();

        let err = reader
            .receive::<Value>(Deadline::after(Duration::from_millis(100)), &cancel)
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_send_times_out_without_worker() {
        let dir = tempfile::tempdir().unwrap();
        let channel = SyncChannel::create(dir.path()).unwrap();

        let err = channel
            .send(
                &json!(null),
                Deadline::after(Duration::from_millis(50)),
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_send_observes_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let channel = SyncChannel::create(dir.path()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = channel
            .send(&json!(null), Deadline::never(), &cancel)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[test]
    fn test_reply_to_removed_channel_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let channel = SyncChannel::create(dir.path()).unwrap();
        let endpoint = WorkerEndpoint::new(channel.path());
        drop(channel);

        let err = endpoint
            .reply(
                &json!(1),
                Deadline::after(Duration::from_millis(50)),
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Channel(ChannelError::Gone(_))));
    }
}
