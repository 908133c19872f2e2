use std::time::Instant;

use crate::streamer::RangeStreamer;

/// Shared application state
pub struct AppState {
    pub streamer: RangeStreamer,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(streamer: RangeStreamer) -> Self {
        Self {
            streamer,
            started_at: Instant::now(),
        }
    }
}
