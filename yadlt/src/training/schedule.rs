//! Per-epoch schedules for hyperparameters such as the learning rate.
use serde::{Deserialize, Serialize};
use snafu::{ensure, Snafu};

/// Schedule construction errors.
#[derive(Debug, Snafu)]
pub enum ScheduleError {
    #[snafu(display("Unknown update rule: {rule}"))]
    UnknownRule { rule: String },

    #[snafu(display("Update rule '{rule}' needs {expected} value(s), got {got}"))]
    ValueCount {
        rule: &'static str,
        expected: usize,
        got: usize,
    },

    #[snafu(display("Exponential update rule needs positive values, got {start} and {end}"))]
    NonPositive { start: f64, end: f64 },
}

/// Value of a hyperparameter as a function of the epoch.
///
/// Deserialization applies the same checks as [`Schedule::from_rule`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case", try_from = "UncheckedSchedule")]
pub enum Schedule {
    /// The same value for every epoch.
    Constant { value: f64 },

    /// Linear interpolation from `start` (first epoch) to `end` (last epoch).
    Linear { start: f64, end: f64 },

    /// Geometric interpolation from `start` (first epoch) to `end` (last
    /// epoch).
    Exponential { start: f64, end: f64 },
}

impl Schedule {
    /// Constant schedule.
    pub fn constant(value: f64) -> Self {
        Schedule::Constant { value }
    }

    /// Build a schedule from an update rule name and its values.
    ///
    /// * `rule` - `constant`, `linear` or `exponential`.
    /// * `values` - One value for `constant` (extra values are ignored), the
    ///   start and end values for the other rules.
    pub fn from_rule(rule: &str, values: &[f64]) -> Result<Self, ScheduleError> {
        match rule {
            "constant" => {
                ensure!(
                    !values.is_empty(),
                    ValueCountSnafu {
                        rule: "constant",
                        expected: 1usize,
                        got: 0usize
                    }
                );
                Ok(Schedule::Constant { value: values[0] })
            }
            "linear" => {
                let (start, end) = start_end("linear", values)?;
                Ok(Schedule::Linear { start, end })
            }
            "exponential" => {
                let (start, end) = start_end("exponential", values)?;
                Schedule::Exponential { start, end }.checked()
            }
            rule => UnknownRuleSnafu { rule }.fail(),
        }
    }

    fn checked(self) -> Result<Self, ScheduleError> {
        if let Schedule::Exponential { start, end } = self {
            ensure!(start > 0. && end > 0., NonPositiveSnafu { start, end });
        }
        Ok(self)
    }

    /// Value at `epoch` (zero-based) of a run with `n_epochs` epochs.
    pub fn value(&self, epoch: usize, n_epochs: usize) -> f64 {
        let progress = if n_epochs > 1 {
            epoch.min(n_epochs - 1) as f64 / (n_epochs - 1) as f64
        } else {
            0.
        };

        match *self {
            Schedule::Constant { value } => value,
            Schedule::Linear { start, end } => start + (end - start) * progress,
            Schedule::Exponential { start, end } => start * (end / start).powf(progress),
        }
    }
}

fn start_end(rule: &'static str, values: &[f64]) -> Result<(f64, f64), ScheduleError> {
    match values {
        [start, end, ..] => Ok((*start, *end)),
        _ => ValueCountSnafu {
            rule,
            expected: 2usize,
            got: values.len(),
        }
        .fail(),
    }
}

/// Schedule as written in configuration files, before validation.
#[derive(Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
enum UncheckedSchedule {
    Constant { value: f64 },
    Linear { start: f64, end: f64 },
    Exponential { start: f64, end: f64 },
}

impl TryFrom<UncheckedSchedule> for Schedule {
    type Error = ScheduleError;

    fn try_from(schedule: UncheckedSchedule) -> Result<Self, Self::Error> {
        match schedule {
            UncheckedSchedule::Constant { value } => Ok(Schedule::Constant { value }),
            UncheckedSchedule::Linear { start, end } => Ok(Schedule::Linear { start, end }),
            UncheckedSchedule::Exponential { start, end } => {
                Schedule::Exponential { start, end }.checked()
            }
        }
    }
}

impl From<f64> for Schedule {
    fn from(value: f64) -> Self {
        Schedule::constant(value)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rstest::rstest;

    use super::{Schedule, ScheduleError};

    #[rstest]
    #[case(Schedule::constant(0.1), [0.1, 0.1, 0.1])]
    #[case(Schedule::Linear { start: 0.5, end: 0.9 }, [0.5, 0.7, 0.9])]
    #[case(Schedule::Exponential { start: 0.1, end: 0.001 }, [0.1, 0.01, 0.001])]
    fn interpolates_over_epochs(#[case] schedule: Schedule, #[case] expected: [f64; 3]) {
        for (epoch, expected) in expected.into_iter().enumerate() {
            assert_relative_eq!(schedule.value(epoch, 3), expected, max_relative = 1e-9);
        }
    }

    #[test]
    fn single_epoch_uses_start() {
        let schedule = Schedule::Linear {
            start: 0.5,
            end: 0.9,
        };
        assert_eq!(schedule.value(0, 1), 0.5);
    }

    #[test]
    fn builds_from_rule_names() {
        assert_eq!(
            Schedule::from_rule("constant", &[0.01]).unwrap(),
            Schedule::constant(0.01)
        );
        assert_eq!(
            Schedule::from_rule("linear", &[0.5, 0.9]).unwrap(),
            Schedule::Linear {
                start: 0.5,
                end: 0.9
            }
        );
        assert!(matches!(
            Schedule::from_rule("linear", &[0.5]),
            Err(ScheduleError::ValueCount { got: 1, .. })
        ));
        assert!(matches!(
            Schedule::from_rule("exponential", &[0.5, 0.]),
            Err(ScheduleError::NonPositive { .. })
        ));
        assert!(matches!(
            Schedule::from_rule("cosine", &[0.5]),
            Err(ScheduleError::UnknownRule { .. })
        ));
    }

    #[test]
    fn deserialization_rejects_non_positive_exponential() {
        let err = serde_json::from_str::<Schedule>(
            r#"{"rule": "exponential", "start": 0.0, "end": 0.01}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("positive"), "{err}");

        let schedule: Schedule =
            serde_json::from_str(r#"{"rule": "exponential", "start": 0.1, "end": 0.01}"#).unwrap();
        assert!(schedule.value(1, 3).is_finite());
        assert_eq!(
            serde_json::from_str::<Schedule>(r#"{"rule": "linear", "start": 0.0, "end": 1.0}"#)
                .unwrap(),
            Schedule::Linear {
                start: 0.,
                end: 1.
            }
        );
    }
}
