//! Audio side-tap pipeline.
//!
//! Every (non-screen) audio producer gets an auxiliary plain-RTP consumer
//! feeding a local segmenter subprocess, which writes fixed-duration WAV
//! segments plus a segment-list file. A single watcher polls the lists and
//! hands finished segments to the transcription worker; results are stored
//! per room and broadcast to its sockets.

pub mod ports;
pub mod sdp;
pub mod segmenter;
pub mod store;
pub mod tap;
pub mod transcribe;

pub use ports::PortPool;
pub use store::{StoredSegment, TranscriptStore};
pub use tap::AudioCapture;
pub use transcribe::{TranscriptionResult, TranscriptionWorker};
