//! Audio capture and playback via cpal.

pub mod capture;
pub mod playback;

pub use capture::{CpalListener, ListenerHandle, ListenerHooks, UtteranceListener};
pub use playback::{AudioSink, CpalPlayback};

/// Linear-interpolation resampler. Adequate for speech, whose energy sits
/// well below the Nyquist limit of either pipeline rate.
pub(crate) fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() || src_rate == 0 || dst_rate == 0 {
        return samples.to_vec();
    }

    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = pos - idx as f64;
            if idx < last {
                (f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac)
                    as f32
            } else {
                samples[idx.min(last)]
            }
        })
        .collect()
}
