use std::f64::consts::PI;

use candle_core::{Device, Tensor};
use log::debug;

use crate::error::Phi4MmError;
use crate::media::AudioClip;

pub const SAMPLE_RATE: u32 = 16000;
pub const MIN_SAMPLE_RATE: u32 = 8000;
pub const WIN_LENGTH: usize = 400;
pub const HOP_LENGTH: usize = 160;
pub const N_FFT: usize = 512;
pub const N_MELS: usize = 80;

const MEL_FMAX: f64 = 7690.0;
const PREEMPHASIS: f32 = 0.97;
const RESAMPLE_ZERO_CROSSINGS: f64 = 16.0;

/// Log-mel features of one clip.
#[derive(Debug, Clone)]
pub struct AudioInputs {
    /// `[1, num_frames, N_MELS]`
    pub features: Tensor,
    pub num_frames: usize,
    pub num_tokens: usize,
}

/// Phi-4 speech front-end: 25 ms hamming windows every 10 ms, 512 point power
/// spectrum and 80 log-mel bins up to 7690 Hz.
pub struct AudioFeatureExtractor {
    compression_rate: usize,
    qformer_compression_rate: usize,
    window: Vec<f32>,
    /// `[WIN_LENGTH, N_FFT / 2 + 1]` real and imaginary DFT bases.
    dft_real: Tensor,
    dft_imag: Tensor,
    /// `[N_FFT / 2 + 1, N_MELS]`
    mel_filters: Tensor,
}

impl AudioFeatureExtractor {
    pub fn new(
        compression_rate: usize,
        qformer_compression_rate: usize,
        device: &Device,
    ) -> Result<Self, Phi4MmError> {
        if compression_rate == 0 || qformer_compression_rate == 0 {
            return Err(Phi4MmError::InvalidConfig(
                "audio compression rates must be positive".to_string(),
            ));
        }

        let bins = N_FFT / 2 + 1;
        let mut real = Vec::with_capacity(WIN_LENGTH * bins);
        let mut imag = Vec::with_capacity(WIN_LENGTH * bins);
        for n in 0..WIN_LENGTH {
            for k in 0..bins {
                let angle = 2.0 * PI * (k * n) as f64 / N_FFT as f64;
                real.push(angle.cos() as f32);
                imag.push(-angle.sin() as f32);
            }
        }

        let mel = mel_filter_bank(SAMPLE_RATE, N_FFT, N_MELS, 0.0, MEL_FMAX);

        Ok(Self {
            compression_rate,
            qformer_compression_rate,
            window: hamming_window(WIN_LENGTH),
            dft_real: Tensor::from_vec(real, (WIN_LENGTH, bins), device)?,
            dft_imag: Tensor::from_vec(imag, (WIN_LENGTH, bins), device)?,
            mel_filters: Tensor::from_vec(mel, (bins, N_MELS), device)?,
        })
    }

    /// Number of audio embeddings produced by the encoder for `num_frames`
    /// feature frames.
    pub fn num_audio_tokens(&self, num_frames: usize) -> usize {
        num_frames
            .div_ceil(self.compression_rate)
            .div_ceil(self.qformer_compression_rate)
    }

    pub fn extract(&self, clip: &AudioClip) -> Result<AudioInputs, Phi4MmError> {
        if clip.sample_rate < MIN_SAMPLE_RATE {
            return Err(Phi4MmError::UnsupportedSampleRate(clip.sample_rate));
        }
        let waveform = resample(&clip.samples, clip.sample_rate, SAMPLE_RATE);
        if waveform.len() < WIN_LENGTH {
            return Err(Phi4MmError::AudioTooShort {
                samples: waveform.len(),
                window: WIN_LENGTH,
            });
        }

        let num_frames = (waveform.len() - WIN_LENGTH) / HOP_LENGTH + 1;
        let frames = self.windowed_frames(&waveform, num_frames);
        let device = self.mel_filters.device();
        let frames = Tensor::from_vec(frames, (num_frames, WIN_LENGTH), device)?;

        let real = frames.matmul(&self.dft_real)?;
        let imag = frames.matmul(&self.dft_imag)?;
        let power = (real.sqr()? + imag.sqr()?)?;

        let features = power
            .matmul(&self.mel_filters)?
            .maximum(1f32)?
            .log()?
            .unsqueeze(0)?;

        let num_tokens = self.num_audio_tokens(num_frames);
        debug!(
            "Audio of {:.2}s -> {num_frames} frames -> {num_tokens} tokens",
            waveform.len() as f32 / SAMPLE_RATE as f32
        );

        Ok(AudioInputs {
            features,
            num_frames,
            num_tokens,
        })
    }

    /// Frames of the waveform with pre-emphasis, int16 scaling and the hamming window.
    fn windowed_frames(&self, waveform: &[f32], num_frames: usize) -> Vec<f32> {
        let mut frames = Vec::with_capacity(num_frames * WIN_LENGTH);
        for i in 0..num_frames {
            let frame = &waveform[i * HOP_LENGTH..i * HOP_LENGTH + WIN_LENGTH];
            for (n, &sample) in frame.iter().enumerate() {
                // the first sample of a frame is emphasized against itself
                let prev = frame[n.saturating_sub(1)];
                let emphasized = (sample - PREEMPHASIS * prev) * 32768.0;
                frames.push(emphasized * self.window[n]);
            }
        }
        frames
    }
}

/// Symmetric hamming window.
fn hamming_window(len: usize) -> Vec<f32> {
    if len == 1 {
        return vec![1.0];
    }
    (0..len)
        .map(|n| (0.54 - 0.46 * (2.0 * PI * n as f64 / (len - 1) as f64).cos()) as f32)
        .collect()
}

/// Triangular filters on the `1127 ln(1 + f / 700)` mel scale, laid out as
/// `[n_fft / 2 + 1, n_mels]` so a power spectrum can be projected with a matmul.
fn mel_filter_bank(sample_rate: u32, n_fft: usize, n_mels: usize, fmin: f64, fmax: f64) -> Vec<f32> {
    let bins = n_fft / 2 + 1;
    let sr = sample_rate as f64;
    let mel = |f: f64| 1127.0 * (1.0 + f / 700.0).ln();
    let bin_to_mel = |bin: usize| 1127.0 * (1.0 + bin as f64 * sr / (n_fft as f64 * 700.0)).ln();
    let freq_to_bin = |f: f64| (f * n_fft as f64 / sr + 0.5) as usize;

    let klo = freq_to_bin(fmin) + 1;
    let khi = freq_to_bin(fmax).max(klo);
    let mlo = mel(fmin);
    let mhi = mel(fmax);
    let spacing = (mhi - mlo) / (n_mels + 1) as f64;
    let center = |m: usize| mlo + spacing * m as f64;

    let mut matrix = vec![0f32; bins * n_mels];
    for m in 0..n_mels {
        let (left, mid, right) = (center(m), center(m + 1), center(m + 2));
        for bin in klo..khi {
            let mbin = bin_to_mel(bin);
            if left < mbin && mbin < right {
                matrix[bin * n_mels + m] = (1.0 - (mid - mbin).abs() / spacing) as f32;
            }
        }
    }
    matrix
}

/// Band-limited resampling with a hann-windowed sinc kernel.
fn resample(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = to as f64 / from as f64;
    let cutoff = ratio.min(1.0);
    let half_width = RESAMPLE_ZERO_CROSSINGS / cutoff;
    let out_len = (samples.len() as f64 * ratio).round() as usize;
    let last = samples.len() as isize - 1;

    (0..out_len)
        .map(|n| {
            let t = n as f64 / ratio;
            let lo = ((t - half_width).ceil() as isize).max(0);
            let hi = ((t + half_width).floor() as isize).min(last);
            let mut acc = 0.0;
            for k in lo..=hi {
                let x = t - k as f64;
                let window = 0.5 * (1.0 + (PI * x / half_width).cos());
                acc += samples[k as usize] as f64 * cutoff * sinc(cutoff * x) * window;
            }
            acc as f32
        })
        .collect()
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-9 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> AudioFeatureExtractor {
        AudioFeatureExtractor::new(8, 1, &Device::Cpu).expect("Failed to create extractor")
    }

    fn tone(freq: f32, len: usize, sample_rate: u32) -> AudioClip {
        let samples = (0..len)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
            .collect();
        AudioClip {
            samples,
            sample_rate,
        }
    }

    #[test]
    fn test_num_audio_tokens() {
        let fe = extractor();
        assert_eq!(fe.num_audio_tokens(8), 1);
        assert_eq!(fe.num_audio_tokens(9), 2);
        assert_eq!(fe.num_audio_tokens(98), 13);
        let fe = AudioFeatureExtractor::new(8, 2, &Device::Cpu).expect("extractor");
        assert_eq!(fe.num_audio_tokens(98), 7);
    }

    #[test]
    fn test_zero_compression_rate_rejected() {
        assert!(AudioFeatureExtractor::new(0, 1, &Device::Cpu).is_err());
    }

    #[test]
    fn test_silence_gives_zero_log_mel() -> Result<(), Phi4MmError> {
        let clip = AudioClip {
            samples: vec![0.0; 1600],
            sample_rate: SAMPLE_RATE,
        };
        let inputs = extractor().extract(&clip)?;

        assert_eq!(inputs.num_frames, 8);
        assert_eq!(inputs.num_tokens, 1);
        assert_eq!(inputs.features.dims(), &[1, 8, N_MELS]);
        for v in inputs.features.flatten_all()?.to_vec1::<f32>()? {
            assert_eq!(v, 0.0);
        }
        Ok(())
    }

    #[test]
    fn test_one_second_clip() -> Result<(), Phi4MmError> {
        let inputs = extractor().extract(&tone(440.0, 16000, SAMPLE_RATE))?;
        assert_eq!(inputs.num_frames, 98);
        assert_eq!(inputs.num_tokens, 13);
        assert!(inputs
            .features
            .flatten_all()?
            .to_vec1::<f32>()?
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0));
        Ok(())
    }

    #[test]
    fn test_tone_energy_lands_in_matching_mel_bin() -> Result<(), Phi4MmError> {
        let inputs = extractor().extract(&tone(1000.0, 8000, SAMPLE_RATE))?;
        let mean = inputs.features.squeeze(0)?.mean(0)?.to_vec1::<f32>()?;
        let peak = mean
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or_default();
        // 1 kHz sits at ~1000 mel, centers are spaced ~34.6 mel apart
        assert!((26..=30).contains(&peak), "peak at {peak}");
        Ok(())
    }

    #[test]
    fn test_too_short_and_low_rate() {
        let fe = extractor();
        let clip = AudioClip {
            samples: vec![0.1; 399],
            sample_rate: SAMPLE_RATE,
        };
        assert!(matches!(
            fe.extract(&clip),
            Err(Phi4MmError::AudioTooShort { samples: 399, window: 400 })
        ));

        let clip = AudioClip {
            samples: vec![0.1; 4000],
            sample_rate: 4000,
        };
        assert!(matches!(
            fe.extract(&clip),
            Err(Phi4MmError::UnsupportedSampleRate(4000))
        ));
    }

    #[test]
    fn test_mel_filter_bank_support() {
        let bins = N_FFT / 2 + 1;
        let mel = mel_filter_bank(SAMPLE_RATE, N_FFT, N_MELS, 0.0, MEL_FMAX);
        assert_eq!(mel.len(), bins * N_MELS);
        assert!(mel.iter().all(|v| (0.0..=1.0).contains(v)));

        let row = |bin: usize| &mel[bin * N_MELS..(bin + 1) * N_MELS];
        // dc and everything from f2bin(7690) = 246 upwards is left out
        assert!(row(0).iter().all(|v| *v == 0.0));
        for bin in 246..bins {
            assert!(row(bin).iter().all(|v| *v == 0.0));
        }
        for m in 0..N_MELS {
            assert!((0..bins).any(|bin| row(bin)[m] > 0.0), "empty filter {m}");
        }
    }

    #[test]
    fn test_hamming_window() {
        let w = hamming_window(WIN_LENGTH);
        approx::assert_relative_eq!(w[0], 0.08, epsilon = 1e-6);
        approx::assert_relative_eq!(w[WIN_LENGTH - 1], 0.08, epsilon = 1e-6);
        assert!(w.iter().all(|v| *v <= 1.0));
    }

    #[test]
    fn test_resample_lengths_and_dc() {
        let constant = vec![0.5f32; 4800];
        let down = resample(&constant, 48000, 16000);
        assert_eq!(down.len(), 1600);
        // away from the edges a constant signal stays constant
        for v in &down[100..1500] {
            approx::assert_relative_eq!(*v, 0.5, epsilon = 1e-2);
        }

        let up = resample(&constant[..800], 8000, 16000);
        assert_eq!(up.len(), 1600);
        approx::assert_relative_eq!(up[800], 0.5, epsilon = 1e-2);

        assert_eq!(resample(&constant, 16000, 16000), constant);
    }

    #[test]
    fn test_resampled_clip_is_extracted() -> Result<(), Phi4MmError> {
        let inputs = extractor().extract(&tone(300.0, 8000, 8000))?;
        assert_eq!(inputs.num_frames, 98);
        Ok(())
    }
}
