// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Contract between the deletion coordinator and the removal driver, plus
//! the result codes the coordinator delivers to waiters.

use futures::future::BoxFuture;
use std::sync::Arc;

/// Result code delivered when the cluster has revoked this agent's access.
///
/// Recovery requires re-bootstrapping credentials, so the coordinator
/// treats a blacklisted removal as terminal rather than retryable.
pub const EBLACKLISTED: i32 = 108;

/// Result code delivered to a waiter displaced by a newer registration.
pub const ESTALE: i32 = libc::ESTALE;

/// Result code delivered to a waiter detached by
/// [`ImageDeleter::cancel_waiter`](crate::ImageDeleter::cancel_waiter) or by
/// coordinator shutdown.
pub const ECANCELED: i32 = libc::ECANCELED;

/// Render a coordinator result code for an operator.
pub(crate) fn errno_string(code: i32) -> String {
    if code == 0 {
        "Success".to_string()
    } else if code == -EBLACKLISTED {
        "client blacklisted".to_string()
    } else {
        std::io::Error::from_raw_os_error(-code).to_string()
    }
}

/// Shared handle to the local pool holding a replica.
///
/// Cheap to clone; the caller, the coordinator, and the removal driver all
/// hold it for the lifetime of one deletion request.
#[derive(Clone, Debug)]
pub struct IoCtx {
    inner: Arc<IoCtxInner>,
}

#[derive(Debug)]
struct IoCtxInner {
    pool_id: i64,
    pool_name: String,
}

impl IoCtx {
    pub fn new<S: Into<String>>(pool_id: i64, pool_name: S) -> IoCtx {
        IoCtx {
            inner: Arc::new(IoCtxInner {
                pool_id,
                pool_name: pool_name.into(),
            }),
        }
    }

    pub fn pool_id(&self) -> i64 {
        self.inner.pool_id
    }

    pub fn pool_name(&self) -> &str {
        &self.inner.pool_name
    }
}

/// How the removal driver classified a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorResult {
    /// The failure is final; the caller must not retry through the
    /// coordinator.
    Complete,
    /// Retry right away, ahead of any queued work.
    RetryImmediately,
    /// Retry after the failed-deletion interval elapses.
    RetryAfterDelay,
}

/// A failed removal, as reported by the driver.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("image removal failed ({code}): {}", errno_string(*.code))]
pub struct RemoveError {
    /// Negative POSIX-style error code.
    pub code: i32,
    /// Retry classification.
    pub result: ErrorResult,
}

/// The asynchronous state machine that actually unlinks an image: forces
/// clients off, drops snapshots, purges journal state.
///
/// Consumed by the coordinator as a black box. The returned future resolves
/// exactly once, and the coordinator never polls it while holding its lock.
pub trait ImageRemover: Send + Sync + 'static {
    fn remove<'a>(
        &'a self,
        io_ctx: &'a IoCtx,
        global_image_id: &'a str,
        ignore_orphaned: bool,
    ) -> BoxFuture<'a, Result<(), RemoveError>>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_rendering() {
        assert_eq!(errno_string(0), "Success");
        assert_eq!(errno_string(-EBLACKLISTED), "client blacklisted");
        assert_eq!(
            errno_string(-libc::ENOENT),
            std::io::Error::from_raw_os_error(libc::ENOENT).to_string()
        );
    }

    #[test]
    fn io_ctx_accessors() {
        let io_ctx = IoCtx::new(7, "mirror-pool");
        assert_eq!(io_ctx.pool_id(), 7);
        assert_eq!(io_ctx.pool_name(), "mirror-pool");

        let clone = io_ctx.clone();
        assert_eq!(clone.pool_id(), 7);
    }

    #[test]
    fn remove_error_display() {
        let err = RemoveError {
            code: -libc::EBUSY,
            result: ErrorResult::RetryImmediately,
        };
        let rendered = err.to_string();
        assert!(rendered.contains("image removal failed"), "{rendered}");
    }
}
