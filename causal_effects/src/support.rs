//! Common support on the logit scale.
use crate::math::moments::std_dev;
use crate::CausalError;
use serde::Serialize;
use tracing::{debug, info};

/// Default caliper, as a fraction of the overall logit-score SD.
pub const DEFAULT_CALIPER: f64 = 0.2;

/// The overlap band of logit scores and the units it keeps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommonSupport {
    /// `max(min_treated, min_control) - caliper_width`.
    pub lower: f64,
    /// `min(max_treated, max_control) + caliper_width`.
    pub upper: f64,
    pub caliper: f64,
    /// `caliper * sd(all logits)`.
    pub caliper_width: f64,
    pub in_support: Vec<bool>,
    pub excluded_treated: usize,
    pub excluded_control: usize,
}

impl CommonSupport {
    /// Computes the band from row-aligned logit scores and treatment flags.
    ///
    /// Fails with `InsufficientCommonSupport` when the band is empty or keeps
    /// no unit of one of the groups.
    pub fn compute(logits: &[f64], treated: &[bool], caliper: f64) -> Result<Self, CausalError> {
        if logits.len() != treated.len() {
            return Err(CausalError::InvalidInput(
                "logit scores and treatment flags differ in length".to_string(),
            ));
        }
        if caliper.is_nan() || caliper < 0.0 {
            return Err(CausalError::InvalidInput(format!(
                "caliper must be non-negative, got {}",
                caliper
            )));
        }
        let bounds = |group: bool| {
            logits
                .iter()
                .zip(treated)
                .filter(|(_, &t)| t == group)
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (&z, _)| {
                    (lo.min(z), hi.max(z))
                })
        };
        let (min_t, max_t) = bounds(true);
        let (min_c, max_c) = bounds(false);

        let sd = std_dev(logits);
        let caliper_width = if sd.is_finite() { caliper * sd } else { 0.0 };
        let lower = min_t.max(min_c) - caliper_width;
        let upper = max_t.min(max_c) + caliper_width;
        debug!(lower, upper, caliper_width, "common support band");

        let in_support: Vec<bool> = logits.iter().map(|&z| z >= lower && z <= upper).collect();
        let count = |group: bool, keep: bool| {
            in_support
                .iter()
                .zip(treated)
                .filter(|(&s, &t)| t == group && s == keep)
                .count()
        };
        let retained_treated = count(true, true);
        let retained_control = count(false, true);
        if lower > upper || retained_treated == 0 || retained_control == 0 {
            return Err(CausalError::InsufficientCommonSupport {
                lower,
                upper,
                retained_treated,
                retained_control,
            });
        }

        let support = Self {
            lower,
            upper,
            caliper,
            caliper_width,
            excluded_treated: count(true, false),
            excluded_control: count(false, false),
            in_support,
        };
        info!(
            retained = retained_treated + retained_control,
            excluded = support.excluded(),
            "common support applied"
        );
        Ok(support)
    }

    /// Number of units outside the band.
    pub fn excluded(&self) -> usize {
        self.excluded_treated + self.excluded_control
    }

    /// Row indices inside the band, ascending.
    pub fn retained_rows(&self) -> Vec<usize> {
        self.in_support
            .iter()
            .enumerate()
            .filter_map(|(i, &s)| s.then_some(i))
            .collect()
    }

    pub fn contains(&self, logit: f64) -> bool {
        logit >= self.lower && logit <= self.upper
    }
}
