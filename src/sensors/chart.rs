use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::models::{ChartPoint, Device, Readings, DEFAULT_GROUPS, UNCATEGORIZED};

/// Selector matching every group in [`filter_by_group`].
pub const ALL_GROUPS: &str = "all";

/// Mean of each nutrient over `devices`, or `None` when there are none.
pub fn average_readings<'a>(devices: impl IntoIterator<Item = &'a Device>) -> Option<Readings> {
    let mut sum = Readings::default();
    let mut count = 0usize;
    for d in devices {
        sum.nitrogen += d.readings.nitrogen;
        sum.phosphorus += d.readings.phosphorus;
        sum.potassium += d.readings.potassium;
        count += 1;
    }
    if count == 0 {
        return None;
    }
    let n = count as f64;
    Some(Readings {
        nitrogen: sum.nitrogen / n,
        phosphorus: sum.phosphorus / n,
        potassium: sum.potassium / n,
    })
}

/// Chart point for one tick, averaged over every device.
pub fn average_point(devices: &[Device], time: DateTime<Utc>) -> Option<ChartPoint> {
    average_readings(devices).map(|r| ChartPoint {
        time,
        nitrogen: r.nitrogen,
        phosphorus: r.phosphorus,
        potassium: r.potassium,
    })
}

/// Append `point`, dropping the oldest entries beyond `capacity`.
pub fn push_point(history: &mut Vec<ChartPoint>, point: ChartPoint, capacity: usize) {
    history.push(point);
    if history.len() > capacity {
        let excess = history.len() - capacity;
        history.drain(..excess);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AxisDomain {
    pub min: f64,
    pub max: f64,
}

/// Y-axis range that fits every plotted value.
///
/// Pads by 10% of the data range (at least 5), clamps to `[0, 100]` and
/// widens to a 20-point window around the middle when the result is narrower.
pub fn y_axis_domain(points: &[ChartPoint]) -> AxisDomain {
    if points.is_empty() {
        return AxisDomain { min: 0.0, max: 100.0 };
    }

    let (mut lo, mut hi) = (100.0_f64, 0.0_f64);
    for p in points {
        for v in [p.nitrogen, p.phosphorus, p.potassium] {
            lo = lo.min(v);
            hi = hi.max(v);
        }
    }

    let padding = ((hi - lo) * 0.1).max(5.0);
    let mut min = (lo - padding).floor().max(0.0);
    let mut max = (hi + padding).ceil().min(100.0);

    if max - min < 20.0 {
        let middle = (min + max) / 2.0;
        min = (middle - 10.0).floor().max(0.0);
        max = (middle + 10.0).ceil().min(100.0);
    }

    AxisDomain { min, max }
}

/// Devices in `group`. `"all"` matches everything; `"Uncategorized"` also
/// matches devices with an empty or missing group.
pub fn filter_by_group<'a>(devices: &'a [Device], group: &str) -> Vec<&'a Device> {
    devices
        .iter()
        .filter(|d| group == ALL_GROUPS || d.group_label() == group)
        .collect()
}

/// Default groups followed by any other group in use, sorted.
pub fn known_groups(devices: &[Device]) -> Vec<String> {
    let extra: BTreeSet<&str> = devices
        .iter()
        .map(Device::group_label)
        .filter(|g| *g != UNCATEGORIZED && !DEFAULT_GROUPS.contains(g))
        .collect();

    DEFAULT_GROUPS
        .iter()
        .map(|g| (*g).to_owned())
        .chain(extra.into_iter().map(str::to_owned))
        .collect()
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn device(group: Option<&str>, n: f64, p: f64, k: f64) -> Device {
        Device::paired(
            Uuid::new_v4(),
            "probe".into(),
            group.map(str::to_owned),
            Readings { nitrogen: n, phosphorus: p, potassium: k },
        )
    }

    fn point(n: f64, p: f64, k: f64) -> ChartPoint {
        ChartPoint { time: Utc::now(), nitrogen: n, phosphorus: p, potassium: k }
    }

    #[test]
    fn average_of_nothing_is_none() {
        assert!(average_readings(&[]).is_none());
        assert!(average_point(&[], Utc::now()).is_none());
    }

    #[test]
    fn average_point_means_each_nutrient() {
        let devices = [device(None, 40.0, 20.0, 60.0), device(None, 60.0, 30.0, 80.0)];
        let p = average_point(&devices, Utc::now()).unwrap();
        assert_eq!(p.nitrogen, 50.0);
        assert_eq!(p.phosphorus, 25.0);
        assert_eq!(p.potassium, 70.0);
    }

    #[test]
    fn push_point_caps_history() {
        let mut history = Vec::new();
        for i in 0..30 {
            push_point(&mut history, point(i as f64, 0.0, 0.0), 24);
        }
        assert_eq!(history.len(), 24);
        assert_eq!(history[0].nitrogen, 6.0);
        assert_eq!(history[23].nitrogen, 29.0);
    }

    #[test]
    fn domain_defaults_when_empty() {
        assert_eq!(y_axis_domain(&[]), AxisDomain { min: 0.0, max: 100.0 });
    }

    #[test]
    fn domain_pads_wide_ranges() {
        // range 60, padding 6
        let d = y_axis_domain(&[point(20.0, 50.0, 80.0)]);
        assert_eq!(d, AxisDomain { min: 14.0, max: 86.0 });
    }

    #[test]
    fn domain_widens_narrow_ranges() {
        // range 2, padding 5 → [45, 57] is 12 wide → recentred to [41, 61]
        let d = y_axis_domain(&[point(50.0, 51.0, 52.0)]);
        assert_eq!(d, AxisDomain { min: 41.0, max: 61.0 });
    }

    #[test]
    fn domain_clamps_to_percentage_range() {
        let d = y_axis_domain(&[point(1.0, 2.0, 99.0)]);
        assert_eq!(d, AxisDomain { min: 0.0, max: 100.0 });
    }

    #[test]
    fn filter_by_group_folds_missing_into_uncategorized() {
        let devices = [
            device(Some("Garden"), 0.0, 0.0, 0.0),
            device(Some(""), 0.0, 0.0, 0.0),
            device(Some(UNCATEGORIZED), 0.0, 0.0, 0.0),
        ];
        assert_eq!(filter_by_group(&devices, ALL_GROUPS).len(), 3);
        assert_eq!(filter_by_group(&devices, "Garden").len(), 1);
        assert_eq!(filter_by_group(&devices, UNCATEGORIZED).len(), 2);
        assert!(filter_by_group(&devices, "Research").is_empty());
    }

    #[test]
    fn known_groups_appends_custom_groups() {
        let devices = [
            device(Some("Orchard"), 0.0, 0.0, 0.0),
            device(Some("Garden"), 0.0, 0.0, 0.0),
            device(None, 0.0, 0.0, 0.0),
        ];
        let groups = known_groups(&devices);
        assert_eq!(groups.len(), DEFAULT_GROUPS.len() + 1);
        assert_eq!(groups.last().map(String::as_str), Some("Orchard"));
    }
}
