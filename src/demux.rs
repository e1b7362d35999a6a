//! Bridge from a [`SourceReader`] to the codec library's pull I/O contract.
//!
//! The demuxer sees plain read/seek callbacks: `read() == 0` is end of
//! stream and the size-query whence resolves to the total size. What the
//! codec surface cannot express is *why* a stream ended early, so the
//! bridge records it on the side: an underrun becomes the caught-up flag,
//! a source failure is parked for the transcoder to pick up after the
//! demuxer gives up.

use crate::error::SessionError;
use crate::source::{SourceReader, Whence};
use castbridge_codec::{CodecError, IoWhence, MediaIo};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Side channel the transcoder inspects when the demuxer reports EOF or an
/// error.
#[derive(Default)]
pub struct BridgeState {
    caught_up: AtomicBool,
    terminal: Mutex<Option<SessionError>>,
}

impl BridgeState {
    /// The last EOF was an underrun, not the end of the source.
    pub fn caught_up(&self) -> bool {
        self.caught_up.load(Ordering::Acquire)
    }

    /// Take the terminal source error, if one occurred.
    pub fn take_terminal(&self) -> Option<SessionError> {
        self.terminal.lock().take()
    }
}

pub struct DemuxBridge {
    reader: SourceReader,
    state: Arc<BridgeState>,
}

impl DemuxBridge {
    pub fn new(reader: SourceReader) -> (Self, Arc<BridgeState>) {
        let state = Arc::new(BridgeState::default());
        (
            Self {
                reader,
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl MediaIo for DemuxBridge {
    fn read(&mut self, buf: &mut [u8]) -> castbridge_codec::Result<usize> {
        match self.reader.read(buf) {
            Ok(0) => {
                if self.reader.caught_up() {
                    self.state.caught_up.store(true, Ordering::Release);
                }
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                let message = e.to_string();
                *self.state.terminal.lock() = Some(e);
                Err(CodecError::Backend(message))
            }
        }
    }

    fn seek(&mut self, offset: i64, whence: IoWhence) -> castbridge_codec::Result<u64> {
        let whence = match whence {
            IoWhence::Start => Whence::Absolute,
            IoWhence::Current => Whence::Relative,
            IoWhence::End => Whence::FromEnd,
            IoWhence::Size => Whence::SizeQuery,
        };
        self.reader.seek(offset, whence).map_err(|e| {
            let message = e.to_string();
            *self.state.terminal.lock() = Some(e);
            CodecError::Backend(message)
        })
    }

    fn size(&self) -> Option<u64> {
        Some(self.reader.absolute_size())
    }
}
