//! External audio transcoder (spec.md §4.6 step 1, §4.7, §5, §9): shells
//! out to `ffmpeg` for the two conversions this service needs — μ-law to
//! 16 kHz cleaned-up WAV for STT upload, and MP3-family TTS output to raw
//! 8 kHz mono μ-law. Every temp file is a `tempfile` RAII handle so it is
//! removed on every exit path, including early `?` returns.

use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum TranscoderError {
    #[error("failed to write temp file: {0}")]
    Io(#[from] std::io::Error),
    #[error("ffmpeg failed to launch: {0}")]
    Spawn(std::io::Error),
    #[error("ffmpeg exited with status {status}: {stderr}")]
    NonZeroExit { status: i32, stderr: String },
}

pub struct Transcoder {
    ffmpeg_path: String,
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcoder {
    pub fn new() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }

    /// Raw 8 kHz mono μ-law → 16 kHz mono WAV with the fixed cleanup filter
    /// chain (`highpass`, `lowpass`, gain), applied before STT upload.
    pub async fn mulaw_to_wav16k(
        &self,
        mulaw_bytes: &[u8],
        audio_filters: &str,
    ) -> Result<Vec<u8>, TranscoderError> {
        let in_file = tempfile::Builder::new().suffix(".ul").tempfile()?;
        tokio::fs::write(in_file.path(), mulaw_bytes).await?;

        let out_file = tempfile::Builder::new().suffix(".wav").tempfile()?;

        self.run(&[
            "-y",
            "-f",
            "mulaw",
            "-ar",
            "8000",
            "-ac",
            "1",
            "-i",
            in_file.path().to_str().unwrap_or_default(),
            "-af",
            audio_filters,
            "-ar",
            "16000",
            "-ac",
            "1",
            out_file.path().to_str().unwrap_or_default(),
        ])
        .await?;

        let bytes = tokio::fs::read(out_file.path()).await?;
        // in_file/out_file drop here, deleting both temp files regardless
        // of whether `run` or the final read succeeded.
        Ok(bytes)
    }

    /// MP3-family TTS output → raw 8 kHz mono μ-law bytes, no header.
    pub async fn to_mulaw(&self, compressed_audio: &[u8]) -> Result<Vec<u8>, TranscoderError> {
        let in_file = tempfile::Builder::new().suffix(".mp3").tempfile()?;
        tokio::fs::write(in_file.path(), compressed_audio).await?;

        let out_file = tempfile::Builder::new().suffix(".ul").tempfile()?;

        self.run(&[
            "-y",
            "-i",
            in_file.path().to_str().unwrap_or_default(),
            "-f",
            "mulaw",
            "-ar",
            "8000",
            "-ac",
            "1",
            out_file.path().to_str().unwrap_or_default(),
        ])
        .await?;

        Ok(tokio::fs::read(out_file.path()).await?)
    }

    async fn run(&self, args: &[&str]) -> Result<(), TranscoderError> {
        let output = Command::new(&self.ffmpeg_path)
            .args(args)
            .output()
            .await
            .map_err(TranscoderError::Spawn)?;

        if !output.status.success() {
            return Err(TranscoderError::NonZeroExit {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_ffmpeg_binary_surfaces_as_spawn_error() {
        let mut transcoder = Transcoder::new();
        transcoder.ffmpeg_path = "definitely-not-a-real-binary-xyz".to_string();
        let result = transcoder.mulaw_to_wav16k(&[0xFFu8; 160], "highpass=f=120").await;
        assert!(matches!(result, Err(TranscoderError::Spawn(_))));
    }
}
