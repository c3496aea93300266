//! RMS-energy classifier — the built-in zero-dependency backend.
//!
//! Reports a single `"activity"` label whose score is the window's RMS
//! level scaled against a reference. Good enough for event-triggered
//! recording of loud calls; heavier neural backends plug in through the
//! same [`SoundClassifier`](super::SoundClassifier) trait.

use super::{Detection, SoundClassifier};
use crate::error::Result;

/// Energy classifier with a configurable reference level.
#[derive(Debug, Clone)]
pub struct EnergyClassifier {
    /// RMS level that maps to score 1.0. Typical range: 0.05–0.5.
    reference_rms: f32,
}

impl EnergyClassifier {
    pub fn new(reference_rms: f32) -> Self {
        Self {
            reference_rms: reference_rms.max(f32::EPSILON),
        }
    }

    fn rms(window: &[f32]) -> f32 {
        if window.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = window.iter().map(|s| s * s).sum();
        (sum_sq / window.len() as f32).sqrt()
    }
}

impl Default for EnergyClassifier {
    fn default() -> Self {
        Self::new(0.1)
    }
}

impl SoundClassifier for EnergyClassifier {
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }

    fn classify(&mut self, window: &[f32]) -> Result<Vec<Detection>> {
        let score = (Self::rms(window) / self.reference_rms).min(1.0);
        Ok(vec![Detection {
            label: "activity".into(),
            score,
        }])
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_scores_zero() {
        let mut clf = EnergyClassifier::default();
        let dets = clf.classify(&vec![0.0; 256]).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].score, 0.0);
    }

    #[test]
    fn loud_window_saturates_at_one() {
        let mut clf = EnergyClassifier::new(0.1);
        let dets = clf.classify(&vec![0.8; 256]).unwrap();
        assert_eq!(dets[0].score, 1.0);
        assert_eq!(dets[0].label, "activity");
    }

    #[test]
    fn score_scales_with_rms() {
        let mut clf = EnergyClassifier::new(0.5);
        // ±0.25 square wave has RMS 0.25 → score 0.5.
        let window: Vec<f32> = (0..256)
            .map(|i| if i % 2 == 0 { 0.25 } else { -0.25 })
            .collect();
        let dets = clf.classify(&window).unwrap();
        assert!((dets[0].score - 0.5).abs() < 1e-5, "score {}", dets[0].score);
    }

    #[test]
    fn empty_window_is_silent() {
        let mut clf = EnergyClassifier::default();
        let dets = clf.classify(&[]).unwrap();
        assert_eq!(dets[0].score, 0.0);
    }
}
