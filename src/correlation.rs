use rustfft::{Fft, FftPlanner, num_complex::Complex};
use std::sync::Arc;

use crate::audio::Frame;
use crate::error::{Error, Result};

/// FFT cross-correlation over a fixed frame length and lag range.
///
/// The transform is padded to at least `frame_len + max_lag` points so the
/// circular correlation never wraps into the lags we read back.
pub struct CrossCorrelator {
    frame_len: usize,
    max_lag: usize,
    size: usize,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl CrossCorrelator {
    pub fn new(frame_len: usize, max_lag: usize) -> Self {
        let size = (frame_len + max_lag).next_power_of_two();
        let mut planner = FftPlanner::new();
        Self {
            frame_len,
            max_lag,
            size,
            forward: planner.plan_fft_forward(size),
            inverse: planner.plan_fft_inverse(size),
        }
    }

    /// `sum_t a[t] * b[t + lag]` for every lag in `-max_lag..=max_lag`,
    /// indexed by `lag + max_lag`.
    pub fn correlate(&self, a: &[f64], b: &[f64]) -> Result<Vec<f64>> {
        if a.len() != self.frame_len || b.len() != self.frame_len {
            return Err(Error::config(format!(
                "correlator planned for {} samples, got {} and {}",
                self.frame_len,
                a.len(),
                b.len()
            )));
        }

        let mut spectrum_a = self.padded(a);
        let mut spectrum_b = self.padded(b);
        self.forward.process(&mut spectrum_a);
        self.forward.process(&mut spectrum_b);

        let mut product: Vec<Complex<f64>> = spectrum_a
            .iter()
            .zip(spectrum_b.iter())
            .map(|(x, y)| x.conj() * y)
            .collect();
        self.inverse.process(&mut product);

        let scale = 1.0 / self.size as f64;
        let max = self.max_lag as i64;
        let series = (-max..=max)
            .map(|lag| {
                let index = lag.rem_euclid(self.size as i64) as usize;
                product[index].re * scale
            })
            .collect();
        Ok(series)
    }

    pub fn correlate_channels(&self, frame: &Frame, ch1: usize, ch2: usize) -> Result<Vec<f64>> {
        let a: Vec<f64> = frame.channel(ch1).map(f64::from).collect();
        let b: Vec<f64> = frame.channel(ch2).map(f64::from).collect();
        self.correlate(&a, &b)
    }

    fn padded(&self, samples: &[f64]) -> Vec<Complex<f64>> {
        let mut buffer = vec![Complex::new(0.0, 0.0); self.size];
        for (slot, &sample) in buffer.iter_mut().zip(samples.iter()) {
            *slot = Complex::new(sample, 0.0);
        }
        buffer
    }
}
