// SPDX-License-Identifier: AGPL-3.0-only

mod clock;
mod job_store;
mod remote_exec;
mod scheduler;

pub use clock::ClockPort;
pub use job_store::JobStorePort;
pub use remote_exec::RemoteExecPort;
pub use scheduler::SchedulerPort;
