//! SDP description for the plain-RTP audio feed.
//!
//! The segmenter reads this file to know where the Opus stream arrives.
//! Payload type 100 matches the plain consumer's preferred mapping.

use std::path::Path;

use confab_core::{Error, Result};

/// Render the session description for a local Opus feed on `rtp_port`.
#[must_use]
pub fn render(rtp_port: u16, rtcp_port: u16) -> String {
    format!(
        "v=0\r\n\
         o=- 0 0 IN IP4 127.0.0.1\r\n\
         s=confab-audio-tap\r\n\
         c=IN IP4 127.0.0.1\r\n\
         t=0 0\r\n\
         m=audio {rtp_port} RTP/AVP 100\r\n\
         a=rtpmap:100 opus/48000/2\r\n\
         a=fmtp:100 minptime=10;useinbandfec=1\r\n\
         a=rtcp:{rtcp_port}\r\n\
         a=recvonly\r\n"
    )
}

/// Write the SDP file for a tap session.
pub async fn write(path: &Path, rtp_port: u16, rtcp_port: u16) -> Result<()> {
    tokio::fs::write(path, render(rtp_port, rtcp_port))
        .await
        .map_err(|e| Error::Internal(format!("Failed to write SDP {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdp_structure() {
        let sdp = render(60000, 60001);
        assert!(sdp.contains("m=audio 60000 RTP/AVP 100"));
        assert!(sdp.contains("a=rtpmap:100 opus/48000/2"));
        assert!(sdp.contains("a=rtcp:60001"));
        assert!(sdp.contains("c=IN IP4 127.0.0.1"));
        assert!(sdp.starts_with("v=0\r\n"));
    }

    #[tokio::test]
    async fn test_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tap.sdp");
        write(&path, 60010, 60011).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, render(60010, 60011));
    }
}
