// SPDX-License-Identifier: MIT

//! Short unique id generation.
//!
//! Job ids, session ids, and transaction log ids all come from here. IDs are
//! a fixed-length alphabet-62 nanoid; short enough to be readable in logs
//! but collision-resistant enough for a single cluster's lifetime.

const ID_LEN: usize = 16;

/// Generates a new short unique id, e.g. a job id such as `j4f9a1c0b2e3d6a8`.
pub fn new_id(prefix: &str) -> String {
    let suffix = nanoid::nanoid!(ID_LEN);
    format!("{prefix}{suffix}")
}
