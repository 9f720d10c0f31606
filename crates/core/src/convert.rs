//! Audio conversion contract between the upstream and the client.
//!
//! The session does no signal processing itself. It hands each upstream
//! audio chunk to a converter and forwards whatever comes back.

use crate::bridge::AudioFormat;
use crate::error::ConversionError;
use bytes::Bytes;

pub trait AudioConverter: Send {
    /// Converts one upstream PCM16 chunk into the client's output format.
    fn convert(&mut self, chunk: &[u8]) -> Result<Bytes, ConversionError>;

    /// Format of the bytes returned by [`AudioConverter::convert`].
    fn output_format(&self) -> AudioFormat;
}

/// Forwards audio unchanged. Used when upstream and client rates match.
#[derive(Debug, Clone)]
pub struct Passthrough {
    format: AudioFormat,
}

impl Passthrough {
    pub fn new(format: AudioFormat) -> Self {
        Self { format }
    }
}

impl AudioConverter for Passthrough {
    fn convert(&mut self, chunk: &[u8]) -> Result<Bytes, ConversionError> {
        if chunk.len() % 2 != 0 {
            return Err(ConversionError::OddLength(chunk.len()));
        }
        Ok(Bytes::copy_from_slice(chunk))
    }

    fn output_format(&self) -> AudioFormat {
        self.format.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_keeps_bytes_and_rejects_half_samples() {
        let mut converter = Passthrough::new(AudioFormat::pcm16(24_000));
        let out = converter.convert(&[1, 0, 2, 0]).unwrap();
        assert_eq!(&out[..], &[1, 0, 2, 0]);
        assert!(matches!(
            converter.convert(&[1, 2, 3]),
            Err(ConversionError::OddLength(3))
        ));
        assert_eq!(converter.output_format().sample_rate, 24_000);
    }
}
