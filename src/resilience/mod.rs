// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Health probing, retry policy and the queue journal.

pub mod health;
pub mod journal;
pub mod retry;
