// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The event pipe: a one-way framed channel from the message-handler
//! process to the main process.
//!
//! Single writer, single reader, no lock. The writer blocks when the
//! pipe fills (the reader guarantees progress); the reader reassembles
//! whole frames and retries partial reads. No frame is ever dropped.

use crate::error::LaunchError;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::time::Duration;
use steprun_wire::{FrameHeader, PipeFrame, FRAME_HEADER_LEN};

/// What one read attempt produced.
#[derive(Debug, PartialEq, Eq)]
pub enum PipeEvent {
    Frame(PipeFrame),
    /// The writer closed; no more frames will ever arrive
    Eof,
    /// Nothing arrived within the caller's timeout
    TimedOut,
}

/// Write half, owned by the helper process after the fork.
pub struct PipeWriter {
    file: File,
}

/// Read half, owned by the main process.
pub struct PipeReader {
    file: File,
}

/// Create the event pipe.
pub fn event_pipe() -> Result<(PipeReader, PipeWriter), LaunchError> {
    let (read_fd, write_fd) = nix::unistd::pipe()
        .map_err(|err| LaunchError::FatalInternal(format!("pipe creation failed: {}", err)))?;
    Ok((PipeReader { file: File::from(read_fd) }, PipeWriter { file: File::from(write_fd) }))
}

impl PipeWriter {
    /// Write one frame, blocking if the pipe is full.
    pub fn write(&mut self, frame: &PipeFrame) -> Result<(), LaunchError> {
        let bytes = frame.encode()?;
        self.file.write_all(&bytes)?;
        Ok(())
    }
}

impl PipeReader {
    /// Read one whole frame.
    ///
    /// With a timeout, waits at most that long for the first byte; once
    /// a header starts arriving the rest of the frame is read to
    /// completion (the writer emits whole frames, so the remainder is
    /// never far behind). `None` blocks until a frame or EOF.
    pub fn read_event(&mut self, timeout: Option<Duration>) -> Result<PipeEvent, LaunchError> {
        if !self.wait_readable(timeout)? {
            return Ok(PipeEvent::TimedOut);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        let n = self.file.read(&mut header)?;
        if n == 0 {
            return Ok(PipeEvent::Eof);
        }
        self.read_fully(&mut header[n..])?;

        let parsed = FrameHeader::parse(header)?;
        let mut payload = vec![0u8; parsed.len as usize];
        self.read_fully(&mut payload)?;

        Ok(PipeEvent::Frame(PipeFrame::decode(parsed.tag, &payload)?))
    }

    /// Drain the pipe to EOF, yielding every remaining frame.
    pub fn drain(&mut self) -> Result<Vec<PipeFrame>, LaunchError> {
        let mut frames = Vec::new();
        loop {
            match self.read_event(None)? {
                PipeEvent::Frame(frame) => frames.push(frame),
                PipeEvent::Eof => return Ok(frames),
                PipeEvent::TimedOut => unreachable!("blocking read cannot time out"),
            }
        }
    }

    /// Poll for readability. True when data (or EOF) is waiting.
    fn wait_readable(&self, timeout: Option<Duration>) -> Result<bool, LaunchError> {
        let poll_timeout = match timeout {
            None => PollTimeout::NONE,
            Some(d) => {
                let ms = d.as_millis().min(u128::from(u16::MAX)) as u16;
                PollTimeout::from(ms)
            }
        };
        loop {
            let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, poll_timeout) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    return Err(LaunchError::FatalInternal(format!("pipe poll failed: {}", err)))
                }
            }
        }
    }

    /// `read_exact`, except a clean EOF mid-frame is a protocol fault.
    fn read_fully(&mut self, buf: &mut [u8]) -> Result<(), LaunchError> {
        if buf.is_empty() {
            return Ok(());
        }
        self.file.read_exact(buf).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                LaunchError::PipeClosed
            } else {
                LaunchError::Io(err)
            }
        })
    }
}

#[cfg(test)]
#[path = "pipe_tests.rs"]
mod tests;
