// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deletion coordinator for mirrored block-device images.
//!
//! When a mirror agent decides a local replica is no longer wanted (its
//! remote source was removed, demoted, or the mirror relationship was
//! broken), the image must be deleted from the local pool. Deletion is not
//! a single atomic act: it interacts with snapshots, journals, and clients
//! that may still hold the image open, and it can fail in transient or
//! permanent ways.
//!
//! [`ImageDeleter`] serializes deletion requests, drives each one through
//! the removal driver to completion or a decisive failure, retries
//! transient failures on a timer, lets callers await or cancel a scheduled
//! deletion, and exposes its queues for inspection. Deletions are strictly
//! serialized; throughput is not the goal, progress and observability are.
//!
//! State lives in memory only. Deletion is not guaranteed across
//! coordinator restarts, and there is no cross-process coordination.

pub mod config;
mod delete_info;
mod deleter;
mod remover;

pub use config::Config;
pub use deleter::ImageDeleter;
pub use remover::ErrorResult;
pub use remover::ImageRemover;
pub use remover::IoCtx;
pub use remover::RemoveError;
pub use remover::EBLACKLISTED;
pub use remover::ECANCELED;
pub use remover::ESTALE;

#[cfg(test)]
mod test_util;

#[macro_use]
extern crate slog;
