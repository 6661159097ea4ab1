// SPDX-License-Identifier: AGPL-3.0-only

pub mod errors;
pub mod orchestrator;
pub mod ports;
pub mod services;
pub mod types;
