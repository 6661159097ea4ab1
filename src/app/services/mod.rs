// SPDX-License-Identifier: AGPL-3.0-only

pub mod connection;
pub mod lifecycle;
pub mod paths;
pub mod retry;
pub mod shell;
pub mod slurm;
