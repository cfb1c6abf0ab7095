//! Segmenter subprocess management.
//!
//! ffmpeg reads the tap's SDP feed and writes fixed-duration PCM 16-bit,
//! 16 kHz mono WAV segments, appending each finished filename to a flat
//! segment-list file. The list file is the authoritative "segment complete"
//! signal; partial WAVs are never picked up.

use std::path::{Path, PathBuf};
use tokio::process::{Child, Command};

use confab_core::{Error, Result};

#[derive(Debug, Clone)]
pub struct SegmenterCommand {
    pub ffmpeg_bin: String,
    pub sdp_path: PathBuf,
    pub segment_pattern: PathBuf,
    pub segment_list: PathBuf,
    pub segment_secs: u32,
}

impl SegmenterCommand {
    /// Argument vector handed to the subprocess (without the binary).
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        vec![
            "-nostdin".into(),
            "-y".into(),
            "-protocol_whitelist".into(),
            "file,udp,rtp".into(),
            "-i".into(),
            self.sdp_path.display().to_string(),
            "-ar".into(),
            "16000".into(),
            "-ac".into(),
            "1".into(),
            "-acodec".into(),
            "pcm_s16le".into(),
            "-f".into(),
            "segment".into(),
            "-segment_time".into(),
            self.segment_secs.to_string(),
            "-segment_list".into(),
            self.segment_list.display().to_string(),
            "-reset_timestamps".into(),
            "1".into(),
            self.segment_pattern.display().to_string(),
        ]
    }

    /// Spawn the segmenter. The child is killed if its handle is dropped.
    pub fn spawn(&self) -> Result<Child> {
        Command::new(&self.ffmpeg_bin)
            .args(self.args())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Internal(format!("Failed to spawn segmenter: {e}")))
    }
}

/// Parse the segment index out of a `..._segment_NNN.wav` filename.
#[must_use]
pub fn segment_index(filename: &str) -> Option<i64> {
    let stem = filename.strip_suffix(".wav")?;
    let (_, index) = stem.rsplit_once("_segment_")?;
    index.parse().ok()
}

/// Parse a segment-list file into `(index, filename)` entries, ignoring
/// blank lines and names that do not follow the segment pattern.
#[must_use]
pub fn parse_segment_list(contents: &str) -> Vec<(i64, String)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let name = Path::new(line)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(line);
            segment_index(name).map(|index| (index, name.to_string()))
        })
        .collect()
}
