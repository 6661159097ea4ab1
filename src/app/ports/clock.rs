// SPDX-License-Identifier: AGPL-3.0-only

use time::OffsetDateTime;

pub trait ClockPort: Send + Sync {
    fn now_utc(&self) -> OffsetDateTime;
}
