use rand::Rng;

/// Decide whether to emit an event subject to a sampling ratio: 1-in-`ratio` on average.
/// A ratio of 0 never samples; 1 always does.
pub(crate) fn sample(ratio: u32) -> bool {
    sample_with(&mut rand::thread_rng(), ratio)
}

fn sample_with(rng: &mut impl Rng, ratio: u32) -> bool {
    match ratio {
        0 => false,
        1 => true,
        _ => rng.gen::<f64>() < 1.0 / f64::from(ratio),
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::mock::StepRng;

    use super::*;

    #[test]
    fn zero_never_samples() {
        assert!(!sample(0));
    }

    #[test]
    fn one_always_samples() {
        assert!(sample(1));
    }

    #[test]
    fn ratio_approximates_one_in_n() {
        let mut rng = StepRng::new(0, u64::MAX / 100);
        let hits = (0..1000).filter(|_| sample_with(&mut rng, 10)).count();
        // StepRng cycles uniformly, so the rate is almost exactly 1/10.
        assert!((80..=120).contains(&hits), "got {hits}");
    }
}
