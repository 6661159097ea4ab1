// SPDX-License-Identifier: AGPL-3.0-only

use time::OffsetDateTime;

use crate::app::ports::ClockPort;

pub struct SystemClock;

impl ClockPort for SystemClock {
    fn now_utc(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}
