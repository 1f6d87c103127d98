//! Scripted reader for tests and hardware-less development.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{CardReader, ReaderError, ReaderEvent, ReaderResult};
use crate::types::{CardTechnology, Target};

/// Call counters shared between a [`MockReader`] and the test observing it.
#[derive(Debug, Default)]
pub struct MockReaderStats {
    begin_calls: AtomicUsize,
    connect_calls: AtomicUsize,
    read_calls: AtomicUsize,
    invalidate_calls: AtomicUsize,
}

impl MockReaderStats {
    /// Number of `begin_polling` calls.
    pub fn begin_calls(&self) -> usize {
        self.begin_calls.load(Ordering::SeqCst)
    }

    /// Number of `connect` calls.
    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    /// Number of `read_identifier` calls.
    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }

    /// Number of `invalidate` calls.
    pub fn invalidate_calls(&self) -> usize {
        self.invalidate_calls.load(Ordering::SeqCst)
    }
}

/// A reader whose behavior is fixed up front.
///
/// Every session replays the same script: each scheduled event is sent after
/// its delay (measured from `begin_polling`).
#[derive(Debug)]
pub struct MockReader {
    available: bool,
    script: Vec<(Duration, ReaderEvent)>,
    connect_result: ReaderResult<()>,
    connect_delay: Duration,
    teardown_delay: Duration,
    identifier: ReaderResult<Vec<u8>>,
    stats: Arc<MockReaderStats>,
    feeder: Option<JoinHandle<()>>,
}

impl Default for MockReader {
    fn default() -> Self {
        Self::new()
    }
}

impl MockReader {
    /// An available reader that never sees a card.
    #[must_use]
    pub fn new() -> Self {
        Self {
            available: true,
            script: Vec::new(),
            connect_result: Ok(()),
            connect_delay: Duration::ZERO,
            teardown_delay: Duration::ZERO,
            identifier: Ok(Vec::new()),
            stats: Arc::new(MockReaderStats::default()),
            feeder: None,
        }
    }

    /// A reader that presents one FeliCa card after `delay`.
    ///
    /// Used by the server when built without PC/SC support.
    #[must_use]
    pub fn demo(delay: Duration) -> Self {
        Self::new()
            .with_card(delay, Target::new("mock-0", CardTechnology::Felica))
            .with_identifier(vec![0x01, 0x27, 0x00, 0x5d, 0x2a, 0x1b, 0x3c, 0x4d])
    }

    /// Set hardware availability.
    #[must_use]
    pub fn with_available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    /// Schedule an arbitrary event.
    #[must_use]
    pub fn with_event(mut self, delay: Duration, event: ReaderEvent) -> Self {
        self.script.push((delay, event));
        self
    }

    /// Schedule a discovery event carrying a single card.
    #[must_use]
    pub fn with_card(self, delay: Duration, target: Target) -> Self {
        self.with_event(delay, ReaderEvent::TargetsDiscovered(vec![target]))
    }

    /// Make `connect` fail.
    #[must_use]
    pub fn with_connect_error(mut self, message: &str) -> Self {
        self.connect_result = Err(ReaderError::ConnectFailed {
            handle: "mock".into(),
            message: message.into(),
        });
        self
    }

    /// Make `connect` take `delay` before answering.
    #[must_use]
    pub const fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Make `invalidate` take `delay` before returning.
    #[must_use]
    pub const fn with_teardown_delay(mut self, delay: Duration) -> Self {
        self.teardown_delay = delay;
        self
    }

    /// Identifier bytes returned by `read_identifier`.
    #[must_use]
    pub fn with_identifier(mut self, bytes: Vec<u8>) -> Self {
        self.identifier = Ok(bytes);
        self
    }

    /// Make `read_identifier` fail.
    #[must_use]
    pub fn with_read_error(mut self, message: &str) -> Self {
        self.identifier = Err(ReaderError::Communication {
            message: message.into(),
        });
        self
    }

    /// Shared call counters.
    #[must_use]
    pub fn stats(&self) -> Arc<MockReaderStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl CardReader for MockReader {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn is_available(&mut self) -> bool {
        self.available
    }

    async fn begin_polling(&mut self, events: mpsc::Sender<ReaderEvent>) -> ReaderResult<()> {
        self.stats.begin_calls.fetch_add(1, Ordering::SeqCst);

        let mut script = self.script.clone();
        script.sort_by_key(|(delay, _)| *delay);
        self.feeder = Some(tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            for (delay, event) in script {
                tokio::time::sleep_until(started + delay).await;
                // The session may already be over; late events are dropped.
                let _ = events.send(event).await;
            }
        }));
        Ok(())
    }

    async fn connect(&mut self, _target: &Target) -> ReaderResult<()> {
        self.stats.connect_calls.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        self.connect_result.clone()
    }

    async fn read_identifier(&mut self, _target: &Target) -> ReaderResult<Vec<u8>> {
        self.stats.read_calls.fetch_add(1, Ordering::SeqCst);
        self.identifier.clone()
    }

    async fn invalidate(&mut self, _reason: &str) {
        self.stats.invalidate_calls.fetch_add(1, Ordering::SeqCst);
        // Dropping the handle detaches the feeder; anything it still sends
        // lands on a closed channel.
        self.feeder = None;
        if !self.teardown_delay.is_zero() {
            tokio::time::sleep(self.teardown_delay).await;
        }
    }
}
