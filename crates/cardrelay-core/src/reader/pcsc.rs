//! PC/SC backend for USB contactless readers.
//!
//! PC/SC calls block, so every driver call runs on `spawn_blocking`. One
//! polling pass over all attached readers is one discovery event: every
//! reader reporting a present card contributes one target.

use std::collections::BTreeSet;
use std::ffi::CString;
use std::time::Duration;

use async_trait::async_trait;
use pcsc::{Card, Context, Disposition, Protocols, Scope, ShareMode, State};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    technology_from_atr, CardReader, InvalidationReason, ReaderError, ReaderEvent, ReaderResult,
};
use crate::types::Target;

/// PC/SC pseudo-APDU returning the card UID (FeliCa IDm).
const GET_UID_APDU: [u8; 5] = [0xff, 0xca, 0x00, 0x00, 0x00];
const SW_SUCCESS: [u8; 2] = [0x90, 0x00];

/// Reader backed by the system PC/SC service (pcscd / WinSCard).
pub struct PcscReader {
    poll_interval: Duration,
    context: Option<Context>,
    card: Option<Card>,
    stop: Option<CancellationToken>,
}

impl std::fmt::Debug for PcscReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcscReader")
            .field("poll_interval", &self.poll_interval)
            .field("connected", &self.card.is_some())
            .finish_non_exhaustive()
    }
}

impl PcscReader {
    /// Create a reader polling every `poll_interval`.
    ///
    /// The PC/SC context is established lazily, so a missing service only
    /// surfaces as an unavailable reader when a session starts.
    #[must_use]
    pub const fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            context: None,
            card: None,
            stop: None,
        }
    }

    async fn context(&mut self) -> ReaderResult<Context> {
        if let Some(context) = &self.context {
            return Ok(context.clone());
        }
        let context = tokio::task::spawn_blocking(|| Context::establish(Scope::User))
            .await
            .map_err(|e| unavailable(&e))?
            .map_err(|e| unavailable(&e))?;
        self.context = Some(context.clone());
        Ok(context)
    }
}

fn unavailable(err: &dyn std::fmt::Display) -> ReaderError {
    ReaderError::Unavailable {
        message: err.to_string(),
    }
}

/// Strip the status word from a GET DATA response.
fn uid_from_response(response: &[u8]) -> ReaderResult<Vec<u8>> {
    if response.len() < SW_SUCCESS.len() {
        return Err(ReaderError::Communication {
            message: "short response to GET DATA".into(),
        });
    }
    let (uid, sw) = response.split_at(response.len() - SW_SUCCESS.len());
    if sw == SW_SUCCESS {
        Ok(uid.to_vec())
    } else {
        Err(ReaderError::Communication {
            message: format!("GET DATA failed with SW {:02X}{:02X}", sw[0], sw[1]),
        })
    }
}

fn communication(err: &dyn std::fmt::Display) -> ReaderError {
    ReaderError::Communication {
        message: err.to_string(),
    }
}

#[async_trait]
impl CardReader for PcscReader {
    fn kind(&self) -> &'static str {
        "pcsc"
    }

    async fn is_available(&mut self) -> bool {
        let Ok(context) = self.context().await else {
            return false;
        };
        let readers = tokio::task::spawn_blocking(move || context.list_readers_owned()).await;
        match readers {
            Ok(Ok(readers)) => !readers.is_empty(),
            Ok(Err(e)) => {
                debug!(error = %e, "No PC/SC readers listed");
                // The context may have gone stale (pcscd restarted).
                self.context = None;
                false
            }
            Err(_) => false,
        }
    }

    async fn begin_polling(&mut self, events: mpsc::Sender<ReaderEvent>) -> ReaderResult<()> {
        let context = self.context().await?;
        let stop = CancellationToken::new();
        self.stop = Some(stop.clone());
        let interval = self.poll_interval;

        tokio::task::spawn_blocking(move || poll_loop(&context, interval, &events, &stop));
        Ok(())
    }

    async fn connect(&mut self, target: &Target) -> ReaderResult<()> {
        let context = self.context().await?;
        let name = CString::new(target.handle.clone()).map_err(|e| ReaderError::ConnectFailed {
            handle: target.handle.clone(),
            message: e.to_string(),
        })?;

        let card = tokio::task::spawn_blocking(move || {
            context.connect(&name, ShareMode::Shared, Protocols::ANY)
        })
        .await
        .map_err(|e| communication(&e))?
        .map_err(|e| ReaderError::ConnectFailed {
            handle: target.handle.clone(),
            message: e.to_string(),
        })?;

        self.card = Some(card);
        Ok(())
    }

    async fn read_identifier(&mut self, _target: &Target) -> ReaderResult<Vec<u8>> {
        let card = self.card.take().ok_or_else(|| ReaderError::Communication {
            message: "no card connected".into(),
        })?;

        let (card, response) = tokio::task::spawn_blocking(move || {
            let mut buffer = [0_u8; pcsc::MAX_BUFFER_SIZE];
            let response = card
                .transmit(&GET_UID_APDU, &mut buffer)
                .map(<[u8]>::to_vec);
            (card, response)
        })
        .await
        .map_err(|e| communication(&e))?;
        self.card = Some(card);

        let response = response.map_err(|e| communication(&e))?;
        uid_from_response(&response)
    }

    async fn invalidate(&mut self, reason: &str) {
        debug!(reason, "Invalidating PC/SC session");
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
        if let Some(card) = self.card.take() {
            let result =
                tokio::task::spawn_blocking(move || card.disconnect(Disposition::LeaveCard)).await;
            if let Ok(Err((_, e))) = result {
                warn!(error = %e, "Failed to disconnect card");
            }
        }
    }
}

/// Blocking discovery loop. Exits on stop, on a closed channel, or once the
/// readers disappear.
fn poll_loop(
    context: &Context,
    interval: Duration,
    events: &mpsc::Sender<ReaderEvent>,
    stop: &CancellationToken,
) {
    let mut last_present = BTreeSet::new();

    while !stop.is_cancelled() && !events.is_closed() {
        let readers = match context.list_readers_owned() {
            Ok(readers) if !readers.is_empty() => readers,
            Ok(_) | Err(pcsc::Error::NoReadersAvailable) => {
                let _ = events.try_send(ReaderEvent::Invalidated(InvalidationReason::Other(
                    "card reader disconnected".into(),
                )));
                return;
            }
            Err(e) => {
                let _ = events.try_send(ReaderEvent::Invalidated(InvalidationReason::Other(
                    e.to_string(),
                )));
                return;
            }
        };

        let mut states: Vec<pcsc::ReaderState> = readers
            .into_iter()
            .map(|name| pcsc::ReaderState::new(name, State::UNAWARE))
            .collect();

        match context.get_status_change(Duration::ZERO, &mut states) {
            Ok(()) | Err(pcsc::Error::Timeout) => {}
            Err(e) => {
                debug!(error = %e, "PC/SC status query failed");
                std::thread::sleep(interval);
                continue;
            }
        }

        let targets: Vec<Target> = states
            .iter()
            .filter(|state| {
                let flags = state.event_state();
                flags.contains(State::PRESENT) && !flags.contains(State::MUTE)
            })
            .map(|state| {
                Target::new(
                    state.name().to_string_lossy(),
                    technology_from_atr(state.atr()),
                )
            })
            .collect();

        let present: BTreeSet<String> = targets.iter().map(|t| t.handle.clone()).collect();
        if !targets.is_empty() && present != last_present {
            let _ = events.try_send(ReaderEvent::TargetsDiscovered(targets));
        }
        last_present = present;

        std::thread::sleep(interval);
    }
}
