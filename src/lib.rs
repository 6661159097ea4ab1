// SPDX-License-Identifier: AGPL-3.0-only

//! Core for running molecular-dynamics jobs on a remote SLURM cluster over
//! password-authenticated SSH. The `app` layer holds the domain logic behind
//! port traits; `adapters` provides the SSH, SLURM, SQLite, and clock
//! implementations.

pub mod adapters;
pub mod app;
pub mod config;
pub mod logging;
