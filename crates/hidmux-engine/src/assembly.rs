use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::error::AssemblyError;

/// Observable state of the reassembly buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyStatus {
    /// No message staged.
    Empty,
    /// A message is staged and waiting for continuation fragments.
    Buffering,
    /// The staged message is complete and ready to be taken.
    Buffered,
}

/// A fully reassembled logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel the message arrived on.
    pub channel: u32,
    /// Raw command byte announced by the initial fragment.
    pub command: u8,
    /// Exactly `declared_length` payload bytes.
    pub payload: Bytes,
}

#[derive(Debug)]
struct Inflight {
    channel: u32,
    command: u8,
    declared: usize,
    next_seq: u8,
    payload: BytesMut,
}

/// Single staging area for one fragmented inbound message.
///
/// The device has one physical pipe, so it can only ever be mid-reassembly
/// for one message at a time; a second channel trying to start a message
/// while this buffer is occupied is the dispatcher's busy case, not ours.
#[derive(Debug)]
pub struct Assembler {
    max_payload: usize,
    current: Option<Inflight>,
}

impl Assembler {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            current: None,
        }
    }

    pub fn status(&self) -> AssemblyStatus {
        match &self.current {
            None => AssemblyStatus::Empty,
            Some(cur) if cur.payload.len() == cur.declared => AssemblyStatus::Buffered,
            Some(_) => AssemblyStatus::Buffering,
        }
    }

    /// Channel of the staged message, if any.
    pub fn owner(&self) -> Option<u32> {
        self.current.as_ref().map(|cur| cur.channel)
    }

    /// Stage a new message from its initial fragment.
    ///
    /// Only legal while [`AssemblyStatus::Empty`]; validates the declared
    /// length before mutating any state. A message whose declared length is
    /// satisfied by the first fragment (including zero-length messages) is
    /// `Buffered` immediately.
    pub fn begin(
        &mut self,
        channel: u32,
        command: u8,
        declared: u16,
        first: &[u8],
    ) -> Result<AssemblyStatus, AssemblyError> {
        if let Some(cur) = &self.current {
            return Err(AssemblyError::InProgress(cur.channel));
        }
        let declared = declared as usize;
        if declared > self.max_payload {
            return Err(AssemblyError::Oversize {
                size: declared,
                max: self.max_payload,
            });
        }

        let take = first.len().min(declared);
        let mut payload = BytesMut::with_capacity(declared);
        payload.extend_from_slice(&first[..take]);

        trace!(channel, command, declared, got = take, "reassembly started");
        self.current = Some(Inflight {
            channel,
            command,
            declared,
            next_seq: 0,
            payload,
        });
        Ok(self.status())
    }

    /// Add a continuation fragment to the staged message.
    ///
    /// Sequence numbers must run 0, 1, 2, … with no gaps; a mismatch aborts
    /// with [`AssemblyError::BadSequence`] and leaves the buffer for the
    /// caller to reset. Bytes beyond the declared length are never copied.
    pub fn append(
        &mut self,
        channel: u32,
        sequence: u8,
        fragment: &[u8],
    ) -> Result<AssemblyStatus, AssemblyError> {
        let cur = self.current.as_mut().ok_or(AssemblyError::NotBuffering)?;
        if cur.channel != channel {
            return Err(AssemblyError::WrongChannel {
                owner: cur.channel,
                got: channel,
            });
        }
        if cur.payload.len() >= cur.declared {
            return Err(AssemblyError::NotBuffering);
        }
        if sequence != cur.next_seq {
            return Err(AssemblyError::BadSequence {
                expected: cur.next_seq,
                got: sequence,
            });
        }
        cur.next_seq = cur.next_seq.wrapping_add(1);

        let remaining = cur.declared - cur.payload.len();
        let take = remaining.min(fragment.len());
        cur.payload.extend_from_slice(&fragment[..take]);

        trace!(
            channel,
            sequence,
            received = cur.payload.len(),
            declared = cur.declared,
            "reassembly advanced"
        );
        Ok(self.status())
    }

    /// Clear the buffer unconditionally. Safe from any state.
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Hand over the completed message and reset to empty.
    pub fn take(&mut self) -> Result<Message, AssemblyError> {
        match self.status() {
            AssemblyStatus::Buffered => {}
            AssemblyStatus::Empty => return Err(AssemblyError::NotBuffering),
            AssemblyStatus::Buffering => return Err(AssemblyError::NotBuffered),
        }
        let cur = self.current.take().expect("status checked above");
        Ok(Message {
            channel: cur.channel,
            command: cur.command,
            payload: cur.payload.freeze(),
        })
    }
}
