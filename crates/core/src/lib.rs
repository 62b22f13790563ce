// SPDX-License-Identifier: MIT

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! cronicle-core: dependency-free domain types shared by every other crate.
//!
//! Mirrors the role of the foundation crate in the workspace: everything in
//! here describes *what* a schedule, a job, or a server group is, never
//! *how* it is stored or dispatched.

pub mod category;
pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod plugin;
pub mod schedule;
pub mod server_group;
pub mod session;
pub mod state;
pub mod target;
pub mod timing;

pub use category::Category;
pub use clock::{Clock, FakeClock, SystemClock};
pub use error::CoreError;
pub use id::new_id;
pub use job::{Job, JobStatus};
pub use plugin::Plugin;
pub use schedule::Event;
pub use server_group::ServerGroup;
pub use session::Session;
pub use state::SchedulerState;
pub use target::RunTarget;
pub use timing::Timing;
