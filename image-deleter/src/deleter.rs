// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serializing coordinator for mirrored-image deletions.
//!
//! One long-lived worker task consumes scheduled deletions and drives each
//! through the removal driver; there is no per-request parallelism. A
//! single mutex guards the active slot, the pending and failed queues, and
//! all per-request mutable state, paired with a [`Notify`] playing the role
//! of the work-queue condition variable. The lock is held only for short,
//! bounded work: never across a removal, and firing a waiter hook under it
//! runs no caller code (the waiting task resumes on its own executor
//! thread).

use crate::config::Config;
use crate::delete_info::DeleteInfo;
use crate::remover::ErrorResult;
use crate::remover::ImageRemover;
use crate::remover::IoCtx;
use crate::remover::RemoveError;
use crate::remover::EBLACKLISTED;
use crate::remover::ECANCELED;
use crate::remover::ESTALE;
use serde_json::json;
use slog::Logger;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Coordinates deletion of local replicas whose remote source went away.
///
/// Requests are serialized through one worker task. Transient failures are
/// parked on a failed queue and retried on a timer; fresh schedules always
/// jump ahead of timed retries (known-failing work must not block new
/// work). Callers can await a scheduled deletion's outcome with
/// [`ImageDeleter::wait_for_scheduled_deletion`] and detach again with
/// [`ImageDeleter::cancel_waiter`].
pub struct ImageDeleter {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    log: Logger,
    remover: Arc<dyn ImageRemover>,
    state: Mutex<State>,
    /// Signalled when work lands on the pending queue, when the retry
    /// timer promotes failed entries, and when `running` is cleared.
    work_available: Notify,
}

struct State {
    running: bool,
    /// The at-most-one entry currently being processed. Written and
    /// cleared only by the worker.
    active: Option<DeleteInfo>,
    /// Fresh schedules and immediate retries are pushed to the front; the
    /// worker also pops the front. Timed retries are appended to the back,
    /// oldest failure first, so a steady stream of fresh schedules defers
    /// them indefinitely.
    pending: VecDeque<DeleteInfo>,
    /// Entries awaiting the retry timer; drained in bulk when it fires.
    failed: VecDeque<DeleteInfo>,
    /// Whether a retry-timer event is outstanding. Armed only on the
    /// failed queue's empty-to-non-empty transition.
    timer_armed: bool,
    timer_task: Option<JoinHandle<()>>,
    failed_interval: Duration,
}

impl State {
    /// Scan the active slot, then the pending queue, then the failed queue
    /// for the identity key.
    fn find_delete_info(
        &mut self,
        local_pool_id: i64,
        global_image_id: &str,
    ) -> Option<&mut DeleteInfo> {
        self.active
            .iter_mut()
            .chain(self.pending.iter_mut())
            .chain(self.failed.iter_mut())
            .find(|info| info.matches(local_pool_id, global_image_id))
    }
}

/// Snapshot of the fields the removal driver needs, taken while moving an
/// entry into the active slot so the lock is not held across the removal.
struct ActiveRequest {
    io_ctx: IoCtx,
    global_image_id: String,
    ignore_orphaned: bool,
}

impl ImageDeleter {
    /// Construct the coordinator and spawn its worker task.
    pub fn new(
        log: &Logger,
        remover: Arc<dyn ImageRemover>,
        config: &Config,
    ) -> ImageDeleter {
        let inner = Arc::new(Inner {
            log: log.new(o!("component" => "ImageDeleter")),
            remover,
            state: Mutex::new(State {
                running: true,
                active: None,
                pending: VecDeque::new(),
                failed: VecDeque::new(),
                timer_armed: false,
                timer_task: None,
                failed_interval: config.retry_interval(),
            }),
            work_available: Notify::new(),
        });
        let worker = tokio::spawn(Arc::clone(&inner).run());
        ImageDeleter { inner, worker: Mutex::new(Some(worker)) }
    }

    /// Schedule deletion of a local replica.
    ///
    /// Idempotent: if the image is already scheduled (pending, failed, or
    /// being processed right now), this only upgrades `ignore_orphaned`
    /// from `false` to `true`.
    pub fn schedule_image_delete(
        &self,
        io_ctx: IoCtx,
        global_image_id: &str,
        ignore_orphaned: bool,
    ) {
        let local_pool_id = io_ctx.pool_id();
        {
            let mut state = self.inner.lock_state();
            if let Some(info) =
                state.find_delete_info(local_pool_id, global_image_id)
            {
                debug!(
                    self.inner.log,
                    "image was already scheduled for deletion";
                    "global_image_id" => global_image_id,
                );
                if ignore_orphaned {
                    info.ignore_orphaned = true;
                }
                return;
            }
            state.pending.push_front(DeleteInfo::new(
                io_ctx,
                global_image_id.to_string(),
                ignore_orphaned,
            ));
        }
        self.inner.work_available.notify_one();
    }

    /// Register to be notified of the outcome of a scheduled deletion.
    ///
    /// The returned receiver resolves with `0` once the image is deleted,
    /// with a negative code on a terminal failure, with a transient
    /// failure code if `notify_on_failed_retry` is set (consuming the
    /// registration; re-register to keep watching), or with `-ESTALE` if a
    /// newer waiter displaces this one. If the image is not scheduled for
    /// deletion at all, the receiver resolves immediately with `0`.
    pub fn wait_for_scheduled_deletion(
        &self,
        local_pool_id: i64,
        global_image_id: &str,
        notify_on_failed_retry: bool,
    ) -> oneshot::Receiver<i32> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.lock_state();
        let Some(info) =
            state.find_delete_info(local_pool_id, global_image_id)
        else {
            // Image not scheduled for deletion; nothing to wait for.
            let _ = tx.send(0);
            return rx;
        };

        debug!(
            self.inner.log,
            "registering deletion waiter";
            "local_pool_id" => local_pool_id,
            "global_image_id" => global_image_id,
        );
        if info.on_delete.is_some() {
            warn!(
                self.inner.log,
                "displacing existing deletion waiter";
                "local_pool_id" => local_pool_id,
                "global_image_id" => global_image_id,
            );
            info.notify(-ESTALE);
        }
        info.on_delete = Some(tx);
        info.notify_on_failed_retry = notify_on_failed_retry;
        rx
    }

    /// Detach the registered waiter, if any, delivering `-ECANCELED` to
    /// it. The deletion itself is not interruptible and proceeds.
    pub fn cancel_waiter(&self, local_pool_id: i64, global_image_id: &str) {
        let mut state = self.inner.lock_state();
        if let Some(info) =
            state.find_delete_info(local_pool_id, global_image_id)
        {
            info.notify(-ECANCELED);
        }
    }

    /// Structured status for an operator: the pending queue, then the
    /// failed queue with failure detail. The entry being processed right
    /// now is not listed.
    pub fn print_status(&self) -> serde_json::Value {
        let state = self.inner.lock_state();
        let pending = state
            .pending
            .iter()
            .map(|info| info.status_json(false))
            .collect::<Vec<_>>();
        let failed = state
            .failed
            .iter()
            .map(|info| info.status_json(true))
            .collect::<Vec<_>>();
        json!({
            "image_deleter_status": {
                "delete_images_queue": pending,
                "failed_deletes_queue": failed,
            }
        })
    }

    /// Global image ids awaiting deletion, next-up first.
    pub fn delete_queue_items(&self) -> Vec<String> {
        let state = self.inner.lock_state();
        state
            .pending
            .iter()
            .map(|info| info.global_image_id.clone())
            .collect()
    }

    /// Global image ids whose deletion failed, with the last error code.
    pub fn failed_queue_items(&self) -> Vec<(String, i32)> {
        let state = self.inner.lock_state();
        state
            .failed
            .iter()
            .map(|info| (info.global_image_id.clone(), info.error_code))
            .collect()
    }

    /// Adjust the failed-deletion retry interval. Takes effect the next
    /// time the retry timer is armed.
    pub fn set_failed_timer_interval(&self, interval: Duration) {
        self.inner.lock_state().failed_interval = interval;
    }

    /// Stop the worker and detach all registered waiters.
    ///
    /// An in-flight removal is allowed to finish and its waiter is
    /// notified normally. Waiters of entries still queued receive
    /// `-ECANCELED`; the entries themselves are dropped (deletion is not
    /// guaranteed across coordinator restarts).
    pub async fn shutdown(&self) {
        debug!(self.inner.log, "shutting down");
        {
            let mut state = self.inner.lock_state();
            state.running = false;
        }
        self.inner.work_available.notify_one();

        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            // The worker notices the cleared flag once the current
            // removal, if any, has been driven to an outcome.
            let _ = worker.await;
        }

        let mut state = self.inner.lock_state();
        if let Some(timer) = state.timer_task.take() {
            timer.abort();
        }
        state.timer_armed = false;
        for mut info in state.pending.drain(..) {
            info.notify(-ECANCELED);
        }
        for mut info in state.failed.drain(..) {
            info.notify(-ECANCELED);
        }
    }
}

impl Drop for ImageDeleter {
    fn drop(&mut self) {
        // Abort rather than leak the background tasks if the caller never
        // called shutdown().
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
        if let Some(timer) = self.inner.lock_state().timer_task.take() {
            timer.abort();
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    async fn run(self: Arc<Self>) {
        debug!(self.log, "worker started");
        loop {
            // Take the next pending entry, or wait for one. The Notified
            // future is created before the check so a signal sent between
            // the check and the await is not lost.
            let request = loop {
                let work_available = self.work_available.notified();
                {
                    let mut state = self.lock_state();
                    if !state.running {
                        debug!(self.log, "worker exiting");
                        return;
                    }
                    if let Some(info) = state.pending.pop_front() {
                        assert!(state.active.is_none());
                        let request = ActiveRequest {
                            io_ctx: info.io_ctx.clone(),
                            global_image_id: info.global_image_id.clone(),
                            ignore_orphaned: info.ignore_orphaned,
                        };
                        state.active = Some(info);
                        break request;
                    }
                    debug!(self.log, "waiting for delete requests");
                }
                work_available.await;
            };

            self.process_image_delete(request).await;
        }
    }

    /// Drive one removal to an outcome and reconcile the active slot.
    async fn process_image_delete(
        self: &Arc<Self>,
        request: ActiveRequest,
    ) {
        info!(
            self.log,
            "start processing delete request";
            "local_pool_id" => request.io_ctx.pool_id(),
            "global_image_id" => request.global_image_id.clone(),
        );

        let result = self
            .remover
            .remove(
                &request.io_ctx,
                &request.global_image_id,
                request.ignore_orphaned,
            )
            .await;

        match result {
            Ok(()) => self.complete_active_delete(0),
            Err(RemoveError { code, result: ErrorResult::Complete }) => {
                self.complete_active_delete(code);
            }
            Err(RemoveError {
                code,
                result: ErrorResult::RetryImmediately,
            }) => {
                // Back to the head of the line; the worker picks it up
                // again on its next iteration.
                let mut state = self.lock_state();
                let mut info = state
                    .active
                    .take()
                    .expect("an active delete is being processed");
                if info.notify_on_failed_retry {
                    info.notify(code);
                }
                state.pending.push_front(info);
            }
            Err(RemoveError {
                code,
                result: ErrorResult::RetryAfterDelay,
            }) => {
                self.enqueue_failed_delete(code);
            }
        }
    }

    /// Fire the waiter with `r` and drop the active entry. Both happen in
    /// one critical section: the entry is out of every queue before the
    /// waiter can observe the outcome.
    fn complete_active_delete(&self, r: i32) {
        let mut state = self.lock_state();
        let mut info = state
            .active
            .take()
            .expect("an active delete is being processed");
        debug!(
            self.log,
            "completed delete request";
            "delete_info" => info.to_string(),
            "r" => r,
        );
        info.notify(r);
    }

    /// Park the active entry on the failed queue and make sure a retry
    /// timer is ticking.
    ///
    /// Blacklisting is terminal even though the driver classified it as
    /// retryable: a blacklisted agent cannot make progress until it
    /// re-bootstraps its credentials, and requeueing would spin.
    fn enqueue_failed_delete(self: &Arc<Self>, error_code: i32) {
        if error_code == -EBLACKLISTED {
            error!(self.log, "blacklisted while deleting local image");
            self.complete_active_delete(error_code);
            return;
        }

        let mut arm_after = None;
        {
            let mut state = self.lock_state();
            let mut info = state
                .active
                .take()
                .expect("an active delete is being processed");
            if info.notify_on_failed_retry {
                info.notify(error_code);
            }
            info.error_code = error_code;
            let was_empty = state.failed.is_empty();
            state.failed.push_front(info);
            if was_empty && !state.timer_armed {
                state.timer_armed = true;
                arm_after = Some(state.failed_interval);
            }
        }

        // The coordinator lock is released before the timer is touched.
        if let Some(delay) = arm_after {
            let inner = Arc::clone(self);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.retry_failed_deletions();
            });
            self.lock_state().timer_task = Some(timer);
        }
    }

    /// Timer callback: promote everything on the failed queue back onto
    /// the tail of the pending queue, oldest failure first.
    fn retry_failed_deletions(&self) {
        let moved = {
            let mut state = self.lock_state();
            state.timer_armed = false;
            state.timer_task = None;
            let moved = !state.failed.is_empty();
            while let Some(mut info) = state.failed.pop_back() {
                info.retries += 1;
                state.pending.push_back(info);
            }
            moved
        };
        if moved {
            debug!(self.log, "retrying failed deletions");
            self.work_available.notify_one();
        }
    }
}
