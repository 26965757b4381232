use cdh_core::Cursor;
use cdh_core::protocol::{EventType, GetEvents, Request};

use crate::config::{FeedConfig, StallAction, StallPolicy};

/// Builds the next GetEvents request, resuming after the cursor's last event.
pub fn get_events(config: &FeedConfig, cursor: &Cursor) -> Request {
    Request::GetEvents(GetEvents {
        event_type: EventType::All,
        event_partition: config.event_partition,
        max_event_count: config.max_event_count,
        preceding_event_id: cursor.last_event_id.clone(),
    })
}

/// Outcome of one poll tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Poll,
    /// A request is still queued, outstanding or being prepared.
    Skip { skipped: u32 },
    /// Too many ticks in a row were skipped.
    Stalled { skipped: u32, action: StallAction },
}

/// Per-connection poll bookkeeping.
#[derive(Debug)]
pub struct Poller {
    policy: StallPolicy,
    skipped: u32,
}

impl Poller {
    pub fn new(policy: StallPolicy) -> Self {
        Self { policy, skipped: 0 }
    }

    /// Decides what a tick does given whether the sequencer is busy.
    pub fn tick(&mut self, busy: bool) -> Tick {
        if !busy {
            self.skipped = 0;
            return Tick::Poll;
        }

        self.skipped += 1;
        match self.policy.max_skipped_polls {
            Some(max) if self.skipped >= max => {
                let skipped = self.skipped;
                self.skipped = 0;
                Tick::Stalled {
                    skipped,
                    action: self.policy.action,
                }
            }
            _ => Tick::Skip {
                skipped: self.skipped,
            },
        }
    }
}
