//! Scripted transceiver for unit tests
//!
//! Replies are queued per frame id and consumed one per header. Every header
//! and byte the master puts on the bus is recorded.

use crate::clock::{Clock, VirtualClock};
use crate::error::TransceiverError;
use crate::frame::{ChecksumKind, FrameId, SYNC_BYTE};
use crate::transceiver::BusTransceiver;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// What the simulated slave answers to one header
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// Data bytes followed by a checksum of the given kind
    Frame { payload: Vec<u8>, kind: ChecksumKind },
    /// Bytes after the echoed header, sent verbatim
    Raw(Vec<u8>),
    /// Nothing; the read runs into its timeout
    Silence,
}

impl Reply {
    pub(crate) fn frame(payload: &[u8], kind: ChecksumKind) -> Self {
        Reply::Frame {
            payload: payload.to_vec(),
            kind,
        }
    }

    /// Diagnostic response frame (classic checksum)
    pub(crate) fn diag(payload: [u8; 8]) -> Self {
        Self::frame(&payload, ChecksumKind::Classic)
    }
}

/// One header plus the bytes the master sent after it
#[derive(Debug, Clone)]
pub(crate) struct Transmission {
    pub id: FrameId,
    pub bytes: Vec<u8>,
    pub at: Duration,
}

impl Transmission {
    /// Data bytes without the trailing checksum
    pub(crate) fn data(&self) -> &[u8] {
        match self.bytes.split_last() {
            Some((_, data)) => data,
            None => &[],
        }
    }
}

pub(crate) struct ScriptedTransceiver {
    clock: VirtualClock,
    replies: HashMap<FrameId, VecDeque<Reply>>,
    transmissions: Vec<Transmission>,
    purges: usize,
    echo: bool,
}

impl ScriptedTransceiver {
    pub(crate) fn new(clock: VirtualClock) -> Self {
        Self {
            clock,
            replies: HashMap::new(),
            transmissions: Vec::new(),
            purges: 0,
            echo: true,
        }
    }

    pub(crate) fn push(&mut self, id: FrameId, reply: Reply) {
        self.replies.entry(id).or_default().push_back(reply);
    }

    /// Queue a diagnostic response on 0x3D
    pub(crate) fn push_diag(&mut self, payload: [u8; 8]) {
        self.push(FrameId::DIAG_RESPONSE, Reply::diag(payload));
    }

    pub(crate) fn set_echo(&mut self, echo: bool) {
        self.echo = echo;
    }

    pub(crate) fn transmissions(&self) -> &[Transmission] {
        &self.transmissions
    }

    /// Headers sent, in order
    pub(crate) fn header_ids(&self) -> Vec<FrameId> {
        self.transmissions.iter().map(|t| t.id).collect()
    }

    /// Data bytes of every master frame published on `id`
    pub(crate) fn sent_on(&self, id: FrameId) -> Vec<Vec<u8>> {
        self.transmissions
            .iter()
            .filter(|t| t.id == id && !t.bytes.is_empty())
            .map(|t| t.data().to_vec())
            .collect()
    }

    pub(crate) fn purges(&self) -> usize {
        self.purges
    }

    pub(crate) fn pending(&self, id: FrameId) -> usize {
        self.replies.get(&id).map_or(0, VecDeque::len)
    }
}

impl BusTransceiver for ScriptedTransceiver {
    fn purge_rx(&mut self) -> Result<(), TransceiverError> {
        self.purges += 1;
        Ok(())
    }

    fn send_break_sync_id(&mut self, id: FrameId) -> Result<u8, TransceiverError> {
        self.transmissions.push(Transmission {
            id,
            bytes: Vec::new(),
            at: self.clock.now(),
        });
        Ok(id.pid())
    }

    fn send_byte(&mut self, byte: u8) -> Result<(), TransceiverError> {
        match self.transmissions.last_mut() {
            Some(tx) => {
                tx.bytes.push(byte);
                Ok(())
            }
            None => Err(TransceiverError::Device("byte sent before any header".into())),
        }
    }

    fn read_bytes(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransceiverError> {
        let Some(id) = self.transmissions.last().map(|t| t.id) else {
            self.clock.advance(timeout);
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        if self.echo {
            out.extend_from_slice(&[SYNC_BYTE, id.pid()]);
        }

        let reply = self
            .replies
            .get_mut(&id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Reply::Silence);

        match reply {
            Reply::Frame { payload, kind } => {
                out.extend_from_slice(&payload);
                out.push(kind.compute(id, &payload));
            }
            Reply::Raw(bytes) => out.extend_from_slice(&bytes),
            Reply::Silence => self.clock.advance(timeout),
        }

        out.truncate(max_len);
        Ok(out)
    }
}
