// SPDX-License-Identifier: AGPL-3.0-only

mod store;

pub use store::{SqliteJobStore, StoreError};
