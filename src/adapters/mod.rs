// SPDX-License-Identifier: AGPL-3.0-only

pub mod db;
pub mod slurm;
pub mod ssh;
pub mod time;
