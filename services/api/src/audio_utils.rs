use bytes::Bytes;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use voicelink_core::bridge::AudioFormat;
use voicelink_core::convert::{AudioConverter, Passthrough};
use voicelink_core::error::ConversionError;

/// Gemini Live always replies with 24kHz PCM16.
pub const GEMINI_OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Input frames per resampler pass (20ms at 24kHz).
const RESAMPLER_CHUNK_SIZE: usize = 480;

/// Creates a mono resampler converting between two sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Interprets little-endian PCM16 bytes as normalized f32 samples.
/// A trailing odd byte is ignored.
pub fn pcm16_bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| {
            let v = i16::from_le_bytes([chunk[0], chunk[1]]);
            (v as f32 / 32768.0).clamp(-1.0, 1.0)
        })
        .collect()
}

/// Encodes f32 samples as little-endian PCM16 bytes, clamping out-of-range values.
pub fn f32_to_pcm16_bytes(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&sample| {
            let v = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            v.to_le_bytes()
        })
        .collect()
}

/// Resamples upstream PCM16 to the client's output rate.
///
/// Input is consumed in fixed-size frames; samples that do not fill a whole
/// frame are carried over to the next call, so audio is never dropped, only
/// delayed by at most one frame.
pub struct ResamplingConverter {
    resampler: FastFixedIn<f32>,
    pending: Vec<f32>,
    format: AudioFormat,
}

impl ResamplingConverter {
    pub fn new(input_rate: u32, output_rate: u32) -> anyhow::Result<Self> {
        let resampler = create_resampler(
            input_rate as f64,
            output_rate as f64,
            RESAMPLER_CHUNK_SIZE,
        )?;
        Ok(Self {
            resampler,
            pending: Vec::with_capacity(RESAMPLER_CHUNK_SIZE * 2),
            format: AudioFormat::pcm16(output_rate),
        })
    }

    /// Samples waiting for a full frame.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }
}

impl AudioConverter for ResamplingConverter {
    fn convert(&mut self, chunk: &[u8]) -> Result<Bytes, ConversionError> {
        if chunk.len() % 2 != 0 {
            return Err(ConversionError::OddLength(chunk.len()));
        }
        self.pending.extend(pcm16_bytes_to_f32(chunk));

        let mut resampled = Vec::new();
        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let frame: Vec<f32> = self.pending.drain(..needed).collect();
            let out = self
                .resampler
                .process(&[frame], None)
                .map_err(|e| ConversionError::Resample(e.to_string()))?;
            resampled.extend_from_slice(&out[0]);
        }
        Ok(Bytes::from(f32_to_pcm16_bytes(&resampled)))
    }

    fn output_format(&self) -> AudioFormat {
        self.format.clone()
    }
}

/// Picks the converter for upstream audio headed to a client expecting
/// `output_rate`.
pub fn converter_for(output_rate: u32) -> anyhow::Result<Box<dyn AudioConverter>> {
    if output_rate == GEMINI_OUTPUT_SAMPLE_RATE {
        Ok(Box::new(Passthrough::new(AudioFormat::pcm16(output_rate))))
    } else {
        Ok(Box::new(ResamplingConverter::new(
            GEMINI_OUTPUT_SAMPLE_RATE,
            output_rate,
        )?))
    }
}
