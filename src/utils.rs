// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.

use std::os::fd::AsFd;
use std::os::fd::OwnedFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;

/// Rounds `value` up to the next multiple of `alignment`. `alignment` must be non-zero.
pub fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Runs `cb` until it returns something else than `EINTR`.
pub fn handle_eintr<T>(mut cb: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match cb() {
            Err(Errno::EINTR) => continue,
            res => return res,
        }
    }
}

/// Error returned by [`wait_sync_fd`].
#[derive(Debug, thiserror::Error)]
pub enum SyncWaitError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("poll failed: {0}")]
    Poll(#[from] Errno),
}

/// Waits until the sync file `fd` signals, or `timeout` expires.
///
/// The fd is consumed and closed regardless of the outcome.
pub fn wait_sync_fd(fd: OwnedFd, timeout: Duration) -> Result<(), SyncWaitError> {
    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);

    let ready = handle_eintr(|| {
        let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
        poll(&mut fds, PollTimeout::from(millis))
    })?;

    if ready == 0 {
        return Err(SyncWaitError::Timeout(timeout));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use nix::unistd::pipe;

    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(1281, 128), 1408);
    }

    #[test]
    fn test_handle_eintr() {
        let mut calls = 0;
        let res = handle_eintr(|| {
            calls += 1;
            if calls < 3 {
                Err(Errno::EINTR)
            } else {
                Ok(calls)
            }
        });
        assert_eq!(res, Ok(3));
    }

    #[test]
    fn wait_signaled_fd() {
        let (read, write) = pipe().unwrap();
        let mut write = std::fs::File::from(write);
        write.write_all(&[1]).unwrap();

        wait_sync_fd(read, Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn wait_unsignaled_fd_times_out() {
        let (read, _write) = pipe().unwrap();

        assert!(matches!(
            wait_sync_fd(read, Duration::from_millis(10)),
            Err(SyncWaitError::Timeout(_))
        ));
    }
}
