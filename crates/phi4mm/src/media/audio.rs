use std::io::Cursor;

use log::debug;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::error::Phi4MmError;

/// A decoded mono waveform.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    /// Samples in `[-1, 1]`.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioClip {
    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Decode an encoded audio stream (wav, flac, mp3, ogg, ...) into a mono clip.
///
/// Multi-channel audio is averaged down to one channel.
pub fn decode_audio(bytes: Vec<u8>, extension: Option<&str>) -> Result<AudioClip, Phi4MmError> {
    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let mss = MediaSourceStream::new(
        Box::new(Cursor::new(bytes)),
        MediaSourceStreamOptions::default(),
    );
    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(Phi4MmError::EmptyAudio)?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                debug!("Skipping undecodable audio packet: {e}");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let spec = *decoded.spec();
        sample_rate.get_or_insert(spec.rate);
        let channels = spec.channels.count().max(1);

        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        downmix_into(buf.samples(), channels, &mut samples);
    }

    let sample_rate = sample_rate.ok_or(Phi4MmError::EmptyAudio)?;
    if samples.is_empty() {
        return Err(Phi4MmError::EmptyAudio);
    }
    debug!(
        "Decoded {} samples at {} Hz ({:.2}s)",
        samples.len(),
        sample_rate,
        samples.len() as f32 / sample_rate as f32
    );

    Ok(AudioClip {
        samples,
        sample_rate,
    })
}

/// Average interleaved frames into a single channel.
fn downmix_into(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels == 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    out.extend(
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
    );
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 16-bit PCM wav file with the given interleaved samples.
    pub(crate) fn wav_bytes(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let block_align = channels * 2;
        let byte_rate = sample_rate * block_align as u32;

        let mut bytes = Vec::with_capacity(44 + data_len as usize);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&byte_rate.to_le_bytes());
        bytes.extend_from_slice(&block_align.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_decode_mono_wav() -> Result<(), Phi4MmError> {
        let samples = (0..1600)
            .map(|i| ((i % 100) as i16 - 50) * 300)
            .collect::<Vec<_>>();
        let clip = decode_audio(wav_bytes(&samples, 16000, 1), Some("wav"))?;

        assert_eq!(clip.sample_rate, 16000);
        assert_eq!(clip.samples.len(), 1600);
        approx::assert_relative_eq!(clip.samples[0], -15000.0 / 32768.0, epsilon = 1e-4);
        approx::assert_relative_eq!(clip.duration_secs(), 0.1, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_decode_stereo_wav_is_downmixed() -> Result<(), Phi4MmError> {
        // left = 16384, right = 0 => mono = 0.25
        let samples = (0..800).flat_map(|_| [16384i16, 0]).collect::<Vec<_>>();
        let clip = decode_audio(wav_bytes(&samples, 8000, 2), None)?;

        assert_eq!(clip.sample_rate, 8000);
        assert_eq!(clip.samples.len(), 800);
        for s in clip.samples {
            approx::assert_relative_eq!(s, 0.25, epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_audio(vec![0u8; 64], None).is_err());
    }

    #[test]
    fn test_downmix() {
        let mut out = Vec::new();
        downmix_into(&[1.0, 3.0, -1.0, 1.0], 2, &mut out);
        assert_eq!(out, vec![2.0, 0.0]);
    }
}
