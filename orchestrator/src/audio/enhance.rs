//! Pre-emphasis, Butterworth bandpass, and RMS normalization applied to a
//! completed segment right before ASR submission.

/// Complex number as a plain `(re, im)` pair; no pack crate supplies a ready
/// Butterworth design function, so the bandpass coefficients are derived
/// analytically here at construction time rather than hand-copied from a
/// table.
type Complex = (f64, f64);

fn cadd(a: Complex, b: Complex) -> Complex {
    (a.0 + b.0, a.1 + b.1)
}
fn csub(a: Complex, b: Complex) -> Complex {
    (a.0 - b.0, a.1 - b.1)
}
fn cmul(a: Complex, b: Complex) -> Complex {
    (a.0 * b.0 - a.1 * b.1, a.0 * b.1 + a.1 * b.0)
}
fn cdiv(a: Complex, b: Complex) -> Complex {
    let denom = b.0 * b.0 + b.1 * b.1;
    ((a.0 * b.0 + a.1 * b.1) / denom, (a.1 * b.0 - a.0 * b.1) / denom)
}
fn cscale(a: Complex, s: f64) -> Complex {
    (a.0 * s, a.1 * s)
}
fn cconj(a: Complex) -> Complex {
    (a.0, -a.1)
}
fn csqrt(a: Complex) -> Complex {
    let r = a.0.hypot(a.1);
    let re = ((r + a.0) / 2.0).max(0.0).sqrt();
    let im = ((r - a.0) / 2.0).max(0.0).sqrt().copysign(a.1);
    (re, im)
}

/// One biquad in direct-form-II transposed: `a0` is implicitly 1.
#[derive(Debug, Clone, Copy)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    /// Filter `x` in place, direct form I, matching a single-pass (non
    /// zero-phase) IIR application.
    fn apply(&self, x: &mut [f32]) {
        let (mut x1, mut x2, mut y1, mut y2) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
        for sample in x.iter_mut() {
            let x0 = *sample as f64;
            let y0 = self.b0 * x0 + self.b1 * x1 + self.b2 * x2 - self.a1 * y1 - self.a2 * y2;
            x2 = x1;
            x1 = x0;
            y2 = y1;
            y1 = y0;
            *sample = y0 as f32;
        }
    }
}

/// Cascade of second-order sections implementing an order-`n` Butterworth
/// bandpass filter between `low_hz` and `high_hz` at sample rate `sr`.
pub struct Bandpass {
    sections: Vec<Biquad>,
}

impl Bandpass {
    pub fn design(order: usize, low_hz: f64, high_hz: f64, sr: f64) -> Self {
        let fs2 = 2.0 * sr;
        // Pre-warp the analog cutoffs for the bilinear transform.
        let wl = fs2 * (std::f64::consts::PI * low_hz / sr).tan();
        let wh = fs2 * (std::f64::consts::PI * high_hz / sr).tan();
        let w0 = (wl * wh).sqrt();
        let bw = wh - wl;

        // Analog Butterworth lowpass prototype poles on the unit circle.
        let lp_poles: Vec<Complex> = (0..order)
            .map(|k| {
                let theta = std::f64::consts::PI * (2 * k + order + 1) as f64 / (2 * order) as f64;
                (theta.cos(), theta.sin())
            })
            .collect();

        // lp -> bp: each prototype pole yields two bandpass poles.
        let mut bp_poles: Vec<Complex> = Vec::with_capacity(order * 2);
        for &p in &lp_poles {
            let p_lp = cscale(p, bw / 2.0);
            let disc = csub(cmul(p_lp, p_lp), (w0 * w0, 0.0));
            let sq = csqrt(disc);
            bp_poles.push(cadd(p_lp, sq));
            bp_poles.push(csub(p_lp, sq));
        }

        // Bilinear transform: s -> z.
        let bp_poles_z: Vec<Complex> = bp_poles
            .iter()
            .map(|&p| cdiv(cadd((fs2, 0.0), p), csub((fs2, 0.0), p)))
            .collect();

        // N finite analog zeros at the origin map to z=1; the implicit
        // zeros at infinity (relative degree = order) map to z=-1.
        let analog_zeros = vec![(0.0, 0.0); order];
        let num_prod: Complex = analog_zeros
            .iter()
            .fold((1.0, 0.0), |acc, &z| cmul(acc, csub((fs2, 0.0), z)));
        let den_prod: Complex = bp_poles
            .iter()
            .fold((1.0, 0.0), |acc, &p| cmul(acc, csub((fs2, 0.0), p)));
        let bw_pow_order = bw.powi(order as i32);
        let gain = cmul((bw_pow_order, 0.0), cdiv(num_prod, den_prod)).0; // imaginary part cancels

        // Pair each pole with its conjugate partner to build real biquads.
        let mut unpaired: Vec<Complex> = bp_poles_z;
        let mut sections = Vec::with_capacity(order);
        let section_gain = gain.abs().powf(1.0 / order as f64) * gain.signum();
        while !unpaired.is_empty() {
            let p1 = unpaired.remove(0);
            let target = cconj(p1);
            let (idx, _) = unpaired
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    let da = (a.0 - target.0).hypot(a.1 - target.1);
                    let db = (b.0 - target.0).hypot(b.1 - target.1);
                    da.partial_cmp(&db).unwrap()
                })
                .expect("even number of poles remaining");
            let p2 = unpaired.remove(idx);
            let a1 = -(p1.0 + p2.0);
            let a2 = p1.0 * p2.0 - p1.1 * p2.1; // Re(p1 * p2), since p2 ~= conj(p1)
            sections.push(Biquad {
                b0: section_gain,
                b1: 0.0,
                b2: -section_gain,
                a1,
                a2,
            });
        }

        Bandpass { sections }
    }

    pub fn apply(&self, x: &mut [f32]) {
        for section in &self.sections {
            section.apply(x);
        }
    }
}

pub fn pre_emphasis(x: &[f32], coeff: f32) -> Vec<f32> {
    if x.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(x.len());
    out.push(x[0]);
    for i in 1..x.len() {
        out.push(x[i] - coeff * x[i - 1]);
    }
    out
}

pub fn rms_normalize(x: &mut [f32], target_db: f32) {
    if x.is_empty() {
        return;
    }
    let mean_sq = x.iter().map(|&v| (v as f64) * (v as f64)).sum::<f64>() / x.len() as f64;
    let rms = mean_sq.sqrt();
    if rms == 0.0 {
        return;
    }
    let target_rms = 10f64.powf(target_db as f64 / 20.0);
    let gain = (target_rms / rms) as f32;
    for v in x.iter_mut() {
        *v *= gain;
    }
}

/// Pre-emphasis, then order-3 Butterworth bandpass (250-3300 Hz), then RMS
/// normalization to -20 dBFS, clipped to `[-1, 1]`.
pub fn enhance_speech(audio: &[f32], sr: u32) -> Vec<f32> {
    let mut x = pre_emphasis(audio, 0.8);
    let bandpass = Bandpass::design(3, 250.0, 3300.0, sr as f64);
    bandpass.apply(&mut x);
    rms_normalize(&mut x, -20.0);
    for v in x.iter_mut() {
        *v = v.clamp(-1.0, 1.0);
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_emphasis_on_empty_is_empty() {
        assert!(pre_emphasis(&[], 0.8).is_empty());
    }

    #[test]
    fn pre_emphasis_keeps_first_sample_unchanged() {
        let out = pre_emphasis(&[0.5, 0.5, 0.5], 0.8);
        assert_eq!(out[0], 0.5);
        assert!((out[1] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn rms_normalize_leaves_silence_untouched() {
        let mut x = vec![0.0f32; 10];
        rms_normalize(&mut x, -20.0);
        assert!(x.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn rms_normalize_targets_requested_level() {
        let mut x = vec![0.1f32; 100];
        rms_normalize(&mut x, -20.0);
        let rms = (x.iter().map(|&v| (v as f64).powi(2)).sum::<f64>() / x.len() as f64).sqrt();
        let target = 10f64.powf(-20.0 / 20.0);
        assert!((rms - target).abs() < 1e-3);
    }

    #[test]
    fn bandpass_design_produces_stable_sections() {
        let bp = Bandpass::design(3, 250.0, 3300.0, 16000.0);
        assert_eq!(bp.sections.len(), 3);
        for s in &bp.sections {
            // poles of a stable digital filter lie inside the unit circle: |a2| < 1.
            assert!(s.a2.abs() < 1.0);
        }
    }

    #[test]
    fn bandpass_attenuates_far_out_of_band_tone_more_than_in_band() {
        let sr = 16000.0;
        let n = 1600;
        let make_tone = |freq: f64| -> Vec<f32> {
            (0..n)
                .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / sr).sin() as f32)
                .collect()
        };
        let bp = Bandpass::design(3, 250.0, 3300.0, sr);

        let mut in_band = make_tone(1000.0);
        bp.apply(&mut in_band);
        let mut out_of_band = make_tone(20.0);
        bp.apply(&mut out_of_band);

        let rms = |x: &[f32]| (x.iter().map(|&v| (v as f64).powi(2)).sum::<f64>() / x.len() as f64).sqrt();
        assert!(rms(&in_band) > rms(&out_of_band));
    }

    #[test]
    fn enhance_speech_clips_output_to_unit_range() {
        let loud: Vec<f32> = (0..1000)
            .map(|i| (2.0 * std::f64::consts::PI * 1000.0 * i as f64 / 16000.0).sin() as f32 * 10.0)
            .collect();
        let out = enhance_speech(&loud, 16000);
        assert!(out.iter().all(|&v| (-1.0..=1.0).contains(&v)));
    }
}
