/// Per-connection configuration applied at construction time.
///
/// The only setting the core consumes is `max_concurrent_streams`: `None`
/// leaves admission unbounded, `Some(0)` means no inbound call is ever
/// admitted.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    max_concurrent_streams: Option<u32>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent_streams(mut self, limit: u32) -> Self {
        self.max_concurrent_streams = Some(limit);
        self
    }

    pub fn max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }
}
