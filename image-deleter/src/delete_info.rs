// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-request record for a scheduled image deletion.

use crate::remover::errno_string;
use crate::remover::IoCtx;
use serde_json::json;
use std::fmt;
use tokio::sync::oneshot;

/// One scheduled deletion of a local replica.
///
/// Uniquely identified by `(local_pool_id, global_image_id)`. At any
/// instant a record is owned by exactly one of the coordinator's active
/// slot, pending queue, or failed queue; transfers between them are moves
/// under the coordinator lock.
pub(crate) struct DeleteInfo {
    pub(crate) local_pool_id: i64,
    pub(crate) global_image_id: String,
    pub(crate) io_ctx: IoCtx,
    pub(crate) ignore_orphaned: bool,
    pub(crate) retries: u32,
    pub(crate) error_code: i32,
    pub(crate) on_delete: Option<oneshot::Sender<i32>>,
    pub(crate) notify_on_failed_retry: bool,
}

impl DeleteInfo {
    pub(crate) fn new(
        io_ctx: IoCtx,
        global_image_id: String,
        ignore_orphaned: bool,
    ) -> DeleteInfo {
        DeleteInfo {
            local_pool_id: io_ctx.pool_id(),
            global_image_id,
            io_ctx,
            ignore_orphaned,
            retries: 0,
            error_code: 0,
            on_delete: None,
            notify_on_failed_retry: false,
        }
    }

    pub(crate) fn matches(
        &self,
        local_pool_id: i64,
        global_image_id: &str,
    ) -> bool {
        self.local_pool_id == local_pool_id
            && self.global_image_id == global_image_id
    }

    /// Fire the registered waiter with `r`, if there is one. The hook is
    /// consumed; a later waiter must register again.
    pub(crate) fn notify(&mut self, r: i32) {
        if let Some(hook) = self.on_delete.take() {
            // The waiter may have dropped its receiver; nobody is
            // listening then.
            let _ = hook.send(r);
        }
    }

    /// Structured rendering for the status document. Failure detail is
    /// only meaningful for entries on the failed queue.
    pub(crate) fn status_json(
        &self,
        include_failure_detail: bool,
    ) -> serde_json::Value {
        let mut value = json!({
            "local_pool_id": self.local_pool_id,
            "global_image_id": self.global_image_id,
        });
        if include_failure_detail {
            value["error_code"] = json!(errno_string(self.error_code));
            value["retries"] = json!(self.retries);
        }
        value
    }
}

impl fmt::Display for DeleteInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[local_pool_id={}, global_image_id={}]",
            self.local_pool_id, self.global_image_id
        )
    }
}
