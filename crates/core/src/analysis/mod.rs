use rand::Rng;

use crate::graph::AnalyserNode;

/// Gain applied to the mean square before taking the root.
pub const LOUDNESS_GAIN: f32 = 20.0;

/// Computes the loudness of a window of time-domain samples:
/// `sqrt(mean(x²) * LOUDNESS_GAIN)` rounded to one decimal.
///
/// An empty window is silent.
pub fn loudness(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    round_to_tenth((mean_square(samples) * LOUDNESS_GAIN).sqrt())
}

/// Reading used when a clip has no analyser to measure.
///
/// Animation code always receives *some* value in `[0.0, 1.0]` so a mouth
/// keeps moving while the analysis path is missing.
pub fn fallback_loudness() -> f32 {
    round_to_tenth(rand::thread_rng().gen_range(0.0..=1.0))
}

/// Measures the analyser's current window, or falls back when there is none.
pub fn measure(analyser: Option<&AnalyserNode>) -> f32 {
    match analyser {
        Some(analyser) => {
            let mut window = vec![0.0; analyser.fft_size()];
            analyser.float_time_domain_data(&mut window);
            loudness(&window)
        }
        None => fallback_loudness(),
    }
}

/// Offline loudness envelope of a decoded clip, one reading per window.
pub fn envelope(samples: &[f32], window: usize) -> Vec<f32> {
    if window == 0 {
        return Vec::new();
    }

    samples.chunks(window).map(loudness).collect()
}

pub fn round_to_tenth(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

fn mean_square(samples: &[f32]) -> f32 {
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    sum / samples.len() as f32
}
