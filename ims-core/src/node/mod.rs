pub mod audio_device;
pub mod audio_payload;
pub mod dtmf;
pub mod rtcp_decoder;
pub mod rtcp_encoder;
pub mod rtp_decoder;
pub mod rtp_encoder;
pub mod socket;
pub mod text;
pub mod video;

use std::any::Any;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use shared::error::Result;

use crate::config::{MediaConfig, MediaType};

/// Closed set of node kinds, used to locate concrete nodes inside a graph.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeId {
    SocketReader,
    SocketWriter,
    RtpEncoder,
    RtpDecoder,
    RtcpEncoder,
    RtcpDecoder,
    AudioSource,
    AudioPlayer,
    DtmfEncoder,
    DtmfSender,
    AudioPayloadEncoder,
    AudioPayloadDecoder,
    VideoSource,
    VideoRenderer,
    VideoPayloadEncoder,
    VideoPayloadDecoder,
    TextSource,
    TextRenderer,
    TextPayloadEncoder,
    TextPayloadDecoder,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum NodeState {
    #[default]
    Stopped,
    Running,
}

/// Tag attached to every entry, steering routing inside nodes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum SubType {
    #[default]
    Undefined,
    RtpPayload,
    RtpPacket,
    RtcpPacket,
    RtcpPacketBye,
    RawData,
    RawDataRot90,
    RawDataRot90Flip,
    RawDataRot180,
    RawDataRot270,
    RawDataCrop,
    RawDataCropRot90,
    RawDataCropRot90Flip,
    RawDataCropRot270,
    DtmfStart,
    DtmfPayload,
    DtmfEnd,
    DtxStart,
    BitstreamH263,
    BitstreamMpeg4,
    BitstreamH264,
    BitstreamHevc,
    BitstreamPcmu,
    BitstreamPcma,
    BitstreamAmrWb,
    BitstreamAmr,
    /// SSRC changed upstream; receive state must reset.
    Refreshed,
    BitstreamT140,
    BitstreamT140Red,
    PcmData,
    PcmNoData,
    NotReady,
    BitstreamCodecConfig,
}

/// One sample or packet traversing a graph. Ownership moves with the entry.
#[derive(Debug, Clone, Default)]
pub struct DataEntry {
    pub subtype: SubType,
    pub data: Bytes,
    /// Unit depends on subtype: wall-clock ms, RTP ticks, or presentation.
    pub timestamp: u32,
    pub mark: bool,
    pub seq: u16,
    /// Secondary tag, e.g. the rotation for raw video frames.
    pub data_type: SubType,
    /// Arrival wall clock in ms, zero when locally generated.
    pub arrival_time: u32,
    /// Remaining redundant transmissions (text RED bookkeeping).
    pub redundancy_left: u32,
}

impl DataEntry {
    pub fn new(subtype: SubType, data: Bytes) -> Self {
        Self {
            subtype,
            data,
            ..Default::default()
        }
    }
}

/// A node's input queue. Producer and consumer serialise on the internal
/// lock only for the enqueue or dequeue itself.
#[derive(Debug, Clone, Default)]
pub struct DataQueue {
    inner: Arc<Mutex<VecDeque<DataEntry>>>,
}

impl DataQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: DataEntry) {
        let mut q = self.inner.lock().unwrap();
        q.push_back(entry);
    }

    pub fn push_front(&self, entry: DataEntry) {
        let mut q = self.inner.lock().unwrap();
        q.push_front(entry);
    }

    pub fn pop(&self) -> Option<DataEntry> {
        let mut q = self.inner.lock().unwrap();
        q.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

/// Common contract for every graph node.
///
/// Non-runtime nodes buffer entries in their [`DataQueue`] and are stepped
/// by the scheduler through [`Node::process`]. Runtime nodes handle entries
/// inline in [`Node::consume`] on whichever thread delivered them, or drive
/// themselves from their own timer or I/O thread.
pub trait Node: Send {
    fn id(&self) -> NodeId;
    fn media(&self) -> MediaType;
    fn state(&self) -> NodeState;

    /// Begins operation using the config set by `set_config`.
    fn start(&mut self) -> Result<()>;
    /// Idempotent, infallible.
    fn stop(&mut self);

    /// True when the node drives itself and is never scheduled.
    fn is_runtime(&self) -> bool {
        false
    }
    /// True when the node has no upstream; the scheduler gives sources one
    /// `process` turn per tick.
    fn is_source(&self) -> bool {
        false
    }

    /// Stores a config snapshot. Only meaningful in `Stopped`.
    fn set_config(&mut self, config: &MediaConfig);
    fn is_same_config(&self, config: &MediaConfig) -> bool;

    fn update_config(&mut self, config: &MediaConfig) -> Result<()> {
        if self.is_same_config(config) {
            return Ok(());
        }
        self.stop();
        self.set_config(config);
        self.start()
    }

    fn queue(&self) -> &DataQueue;

    fn data_count(&self) -> usize {
        self.queue().len()
    }

    /// One scheduler step: consume a queued entry (or produce, for
    /// sources). Returned entries are routed to the rear node. Must not
    /// panic; malformed input is dropped and counted.
    fn process(&mut self) -> Vec<DataEntry> {
        let entry = self.queue().pop();
        match entry {
            Some(entry) => self.consume(entry),
            None => vec![],
        }
    }

    /// Handles one entry delivered by the front node.
    fn consume(&mut self, entry: DataEntry) -> Vec<DataEntry> {
        let _ = entry;
        vec![]
    }

    /// For runtime nodes paced by a periodic thread: the tick period. The
    /// graph runs a pump thread per such node while the graph is running.
    fn runtime_period(&self) -> Option<std::time::Duration> {
        None
    }

    /// Periodic step for nodes with a [`Node::runtime_period`]. Runs with
    /// the graph lock held so it serialises with `stop`.
    fn poll_runtime(&mut self) -> Vec<DataEntry> {
        vec![]
    }

    fn as_any_mut(&mut self) -> &mut (dyn Any + 'static);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_queue_fifo() {
        let q = DataQueue::new();
        q.push(DataEntry {
            seq: 1,
            ..Default::default()
        });
        q.push(DataEntry {
            seq: 2,
            ..Default::default()
        });
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().seq, 1);
        assert_eq!(q.pop().unwrap().seq, 2);
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_data_queue_shared_handle() {
        let q = DataQueue::new();
        let producer = q.clone();
        producer.push(DataEntry::new(SubType::RtpPacket, Bytes::from_static(b"x")));
        assert_eq!(q.len(), 1);
    }
}
