use std::sync::Arc;

use anyhow::Context;
use ndarray::Array2;
use realfft::{RealFftPlanner, RealToComplex};

/// Sample rate every clip is converted to before the STFT.
pub const SAMPLE_RATE: u32 = 8192;
pub const N_FFT: usize = 1024;
pub const HOP_LENGTH: usize = 768;
/// `N_FFT / 2 + 1` bins minus the Nyquist bin, so the U-Net can halve it four times.
pub const FREQ_BINS: usize = N_FFT / 2;

pub struct Stft {
    n_fft: usize,
    hop: usize,
    window: Vec<f32>,
    fft: Arc<dyn RealToComplex<f32>>,
}

impl Stft {
    pub fn new(n_fft: usize, hop: usize) -> anyhow::Result<Self> {
        if n_fft < 2 || n_fft % 2 != 0 {
            anyhow::bail!("n_fft must be even and >= 2, got {n_fft}");
        }
        if hop == 0 {
            anyhow::bail!("hop must be > 0");
        }
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n_fft);
        Ok(Self {
            n_fft,
            hop,
            window: hann_window(n_fft),
            fft,
        })
    }

    pub fn frame_count(&self, len: usize) -> usize {
        if len <= self.n_fft {
            1
        } else {
            (len - self.n_fft).div_ceil(self.hop) + 1
        }
    }

    /// Magnitude spectrogram shaped `(n_fft / 2, frames)`; the Nyquist bin is dropped.
    ///
    /// The signal is zero padded at the end so the last frame is complete.
    pub fn magnitude(&self, signal: &[f32]) -> anyhow::Result<Array2<f32>> {
        let bins = self.n_fft / 2;
        let frames = self.frame_count(signal.len());
        let mut spec = Array2::<f32>::zeros((bins, frames));

        let mut input = self.fft.make_input_vec();
        let mut output = self.fft.make_output_vec();
        let mut scratch = self.fft.make_scratch_vec();

        for frame in 0..frames {
            let start = frame * self.hop;
            for (i, slot) in input.iter_mut().enumerate() {
                let sample = signal.get(start + i).copied().unwrap_or(0.0);
                *slot = sample * self.window[i];
            }
            self.fft
                .process_with_scratch(&mut input, &mut output, &mut scratch)
                .map_err(|err| anyhow::anyhow!("FFT failed: {err}"))
                .with_context(|| format!("STFT frame {frame}"))?;
            for (bin, value) in output.iter().take(bins).enumerate() {
                spec[[bin, frame]] = value.norm();
            }
        }

        Ok(spec)
    }
}

fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / size as f32).cos()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use super::*;

    #[test]
    fn frame_count_covers_signal() {
        let stft = Stft::new(N_FFT, HOP_LENGTH).unwrap();
        assert_eq!(stft.frame_count(0), 1);
        assert_eq!(stft.frame_count(N_FFT), 1);
        assert_eq!(stft.frame_count(N_FFT + 1), 2);
        assert_eq!(stft.frame_count(N_FFT + HOP_LENGTH), 2);
        assert_eq!(stft.frame_count(N_FFT + HOP_LENGTH + 1), 3);
    }

    #[test]
    fn tone_peaks_in_expected_bin() {
        let stft = Stft::new(N_FFT, HOP_LENGTH).unwrap();
        // 1 kHz at 8192 Hz lands exactly on bin 125.
        let freq = 1000.0;
        let signal: Vec<f32> = (0..SAMPLE_RATE as usize)
            .map(|i| (2.0 * PI * freq * i as f32 / SAMPLE_RATE as f32).sin())
            .collect();
        let spec = stft.magnitude(&signal).unwrap();
        assert_eq!(spec.nrows(), FREQ_BINS);

        let column = spec.column(2);
        let (peak_bin, _) = column
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (bin, &v)| if v > best.1 { (bin, v) } else { best });
        let expected = (freq * N_FFT as f32 / SAMPLE_RATE as f32).round() as usize;
        assert_eq!(peak_bin, expected);
    }

    #[test]
    fn silence_is_zero() {
        let stft = Stft::new(N_FFT, HOP_LENGTH).unwrap();
        let spec = stft.magnitude(&[0.0; 3000]).unwrap();
        assert!(spec.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn rejects_odd_fft_size() {
        assert!(Stft::new(1023, 256).is_err());
        assert!(Stft::new(1024, 0).is_err());
    }
}
