//! Encrypted UDP voice transport.
//!
//! Everything between a negotiated session descriptor and audible audio:
//! the wire packet codec (AES-CTR with the header as IV), receive-side
//! sequence tracking, the jitter buffer and playout state machine, the
//! Opus wrappers, and the threaded capture/receive pipelines with their
//! session runtime. Signaling (how the descriptor is obtained) is the
//! caller's concern.

pub mod capture;
pub mod codec;
pub mod jitter;
pub mod packet;
pub mod receive;
pub mod runtime;
pub mod sequence;
pub mod session;
pub mod signals;

pub use capture::{CaptureConfig, CapturePipeline, CaptureSource};
pub use codec::{VoiceDecoder, VoiceEncoder};
pub use jitter::{AudioSink, JitterBuffer, PcmFrame, Player, PlayerConfig, PlayerState};
pub use packet::{PacketCodec, PacketError, PacketHeader, HEADER_LEN};
pub use receive::{ReceiveConfig, ReceivePipeline};
pub use runtime::{PipelineSet, RuntimeConfig};
pub use sequence::{
    Classification, GapRecord, SequenceStats, SequenceTracker, SequenceTrackerConfig,
};
pub use session::{AudioParams, Session, SessionDescriptor, SessionError, UdpDescriptor};
pub use signals::{CaptureGate, RxActivity, ShutdownFlag, SilenceWatchdog, WatchdogVerdict};
