use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::db::models::{Nutrient, Readings, ThresholdSettings};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Bound {
    Below,
    Above,
}

/// One nutrient outside its band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ThresholdAlert {
    pub nutrient: Nutrient,
    pub bound: Bound,
    /// The limit that was crossed, in percent.
    pub limit: f64,
    pub message: String,
}

impl ThresholdAlert {
    fn new(nutrient: Nutrient, bound: Bound, limit: f64) -> Self {
        let message = match bound {
            Bound::Below => format!("{} below minimum threshold ({limit}%)", nutrient.label()),
            Bound::Above => format!("{} above maximum threshold ({limit}%)", nutrient.label()),
        };
        Self { nutrient, bound, limit, message }
    }
}

impl fmt::Display for ThresholdAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ThresholdCheck {
    pub exceeded: bool,
    /// Ordered nitrogen, phosphorus, potassium.
    pub alerts: Vec<ThresholdAlert>,
}

/// Compare every reading against its band. At most one alert per nutrient.
pub fn check_thresholds(readings: &Readings, thresholds: &ThresholdSettings) -> ThresholdCheck {
    let alerts: Vec<_> = Nutrient::ALL
        .into_iter()
        .filter_map(|n| {
            let value = readings.get(n);
            let band = thresholds.band(n);
            if value < band.min {
                Some(ThresholdAlert::new(n, Bound::Below, band.min))
            } else if value > band.max {
                Some(ThresholdAlert::new(n, Bound::Above, band.max))
            } else {
                None
            }
        })
        .collect();

    ThresholdCheck {
        exceeded: !alerts.is_empty(),
        alerts,
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ThresholdError {
    #[error("{nutrient} threshold {field} must be a finite percentage in [0, 100], got {value}")]
    OutOfRange {
        nutrient: Nutrient,
        field: &'static str,
        value: f64,
    },
    #[error("{nutrient} minimum ({min}) exceeds maximum ({max})")]
    Inverted { nutrient: Nutrient, min: f64, max: f64 },
}

/// Reject bands that are inverted or leave the percentage range.
pub fn validate(thresholds: &ThresholdSettings) -> Result<(), ThresholdError> {
    for nutrient in Nutrient::ALL {
        let band = thresholds.band(nutrient);
        for (field, value) in [("min", band.min), ("max", band.max)] {
            if !value.is_finite() || !(0.0..=100.0).contains(&value) {
                return Err(ThresholdError::OutOfRange { nutrient, field, value });
            }
        }
        if band.min > band.max {
            return Err(ThresholdError::Inverted {
                nutrient,
                min: band.min,
                max: band.max,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ThresholdBand;

    fn readings(n: f64, p: f64, k: f64) -> Readings {
        Readings { nitrogen: n, phosphorus: p, potassium: k }
    }

    #[test]
    fn nitrogen_below_minimum_is_single_alert() {
        let check = check_thresholds(&readings(25.0, 50.0, 60.0), &ThresholdSettings::DEFAULT);
        assert!(check.exceeded);
        assert_eq!(check.alerts.len(), 1);
        assert_eq!(check.alerts[0].nutrient, Nutrient::Nitrogen);
        assert_eq!(check.alerts[0].bound, Bound::Below);
        assert_eq!(check.alerts[0].message, "Nitrogen below minimum threshold (30%)");
    }

    #[test]
    fn all_inside_band_is_clean() {
        let check = check_thresholds(&readings(50.0, 50.0, 60.0), &ThresholdSettings::DEFAULT);
        assert!(!check.exceeded);
        assert!(check.alerts.is_empty());
    }

    #[test]
    fn band_edges_are_inclusive() {
        let check = check_thresholds(&readings(30.0, 70.0, 90.0), &ThresholdSettings::DEFAULT);
        assert!(!check.exceeded);
    }

    #[test]
    fn alerts_are_ordered_by_nutrient() {
        let check = check_thresholds(&readings(90.0, 5.0, 95.0), &ThresholdSettings::DEFAULT);
        let order: Vec<_> = check.alerts.iter().map(|a| a.nutrient).collect();
        assert_eq!(order, Nutrient::ALL.to_vec());
        assert_eq!(check.alerts[0].message, "Nitrogen above maximum threshold (80%)");
        assert_eq!(check.alerts[1].message, "Phosphorus below minimum threshold (20%)");
        assert_eq!(check.alerts[2].message, "Potassium above maximum threshold (90%)");
    }

    #[test]
    fn fractional_limits_render_as_given() {
        let mut t = ThresholdSettings::DEFAULT;
        t.nitrogen = ThresholdBand::new(30.5, 80.0);
        let check = check_thresholds(&readings(30.0, 50.0, 60.0), &t);
        assert_eq!(check.alerts[0].to_string(), "Nitrogen below minimum threshold (30.5%)");
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(validate(&ThresholdSettings::DEFAULT).is_ok());
    }

    #[test]
    fn validate_rejects_inverted_band() {
        let mut t = ThresholdSettings::DEFAULT;
        t.phosphorus = ThresholdBand::new(70.0, 20.0);
        let err = validate(&t).unwrap_err();
        assert!(matches!(err, ThresholdError::Inverted { nutrient: Nutrient::Phosphorus, .. }));
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn validate_rejects_out_of_range_and_nan() {
        let mut t = ThresholdSettings::DEFAULT;
        t.potassium = ThresholdBand::new(40.0, 120.0);
        assert!(matches!(validate(&t), Err(ThresholdError::OutOfRange { field: "max", .. })));

        t.potassium = ThresholdBand::new(f64::NAN, 90.0);
        assert!(matches!(validate(&t), Err(ThresholdError::OutOfRange { field: "min", .. })));
    }

    #[test]
    fn validate_allows_collapsed_band() {
        let mut t = ThresholdSettings::DEFAULT;
        t.nitrogen = ThresholdBand::new(50.0, 50.0);
        assert!(validate(&t).is_ok());
    }
}
