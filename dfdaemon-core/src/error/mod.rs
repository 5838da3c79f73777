/*
 *     Copyright 2025 The Dragonfly Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

// DFError is the error for dfdaemon.
#[derive(thiserror::Error, Debug)]
pub enum DFError {
    // IO is the error for IO operation.
    #[error(transparent)]
    IO(#[from] std::io::Error),

    // JSON is the error for serde_json.
    #[error(transparent)]
    JSON(#[from] serde_json::Error),

    // TaskNotFound is the error when the task is not found.
    #[error("task {0} not found")]
    TaskNotFound(String),

    // PieceNotFound is the error when the piece is not found.
    #[error("piece {0} not found")]
    PieceNotFound(String),

    // DigestMismatch is the error when the digest of a rewritten piece does
    // not match the persisted one.
    #[error("digest mismatch expected: {0}, actual: {1}")]
    DigestMismatch(String, String),

    // InvalidStateTransition is the error when the state transition is invalid.
    #[error("can not transit from {0} to {1}")]
    InvalidStateTransition(String, String),

    // TaskNotReady is the error when the task metadata is not complete enough
    // to store the task to its destination.
    #[error("task {0} not ready")]
    TaskNotReady(String),

    // TaskReclaimed is the error when the task storage is being reclaimed.
    #[error("task {0} reclaimed")]
    TaskReclaimed(String),

    // ReloadFailed is the error when loading persisted tasks from disk failed
    // for some task directories.
    #[error("reload tasks from disk failed: {0}")]
    ReloadFailed(String),

    // ValidationError is the error for validate.
    #[error("validate failed: {0}")]
    ValidationError(String),
}
