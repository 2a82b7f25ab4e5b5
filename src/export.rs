//! Flat CSV renderings of the device table and chart history.
//!
//! Fields are comma-joined as-is: values containing commas or newlines are
//! not quoted.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::db::models::Device;

pub const DEVICE_CSV_HEADER: &str =
    "Device ID,Device Name,Group,Status,Nitrogen (%),Phosphorus (%),Potassium (%)";

/// Device table, one row per device, readings to one decimal place.
pub fn devices_csv(devices: &[Device]) -> String {
    let rows = devices.iter().map(|d| {
        [
            d.id.to_string(),
            d.name.clone(),
            d.group_label().to_owned(),
            d.status.to_string(),
            format!("{:.1}", d.readings.nitrogen),
            format!("{:.1}", d.readings.phosphorus),
            format!("{:.1}", d.readings.potassium),
        ]
        .join(",")
    });

    std::iter::once(DEVICE_CSV_HEADER.to_owned())
        .chain(rows)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Generic table whose columns are the keys of the first row, in field order.
///
/// Later rows are looked up column by column; a key they lack renders as an
/// empty field. An empty input yields an empty header line.
pub fn rows_csv<T: Serialize>(rows: &[T]) -> Result<String> {
    let objects = rows
        .iter()
        .map(|r| -> Result<Map<String, Value>> {
            match serde_json::to_value(r).context("failed to serialise CSV row")? {
                Value::Object(map) => Ok(map),
                other => anyhow::bail!("CSV rows must serialise to objects, got {other}"),
            }
        })
        .collect::<Result<Vec<_>>>()?;

    let columns: Vec<String> = objects
        .first()
        .map(|first| first.keys().cloned().collect())
        .unwrap_or_default();

    let lines = objects.iter().map(|obj| {
        columns
            .iter()
            .map(|c| obj.get(c).map(render_field).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(",")
    });

    Ok(std::iter::once(columns.join(","))
        .chain(lines)
        .collect::<Vec<_>>()
        .join("\n"))
}

fn render_field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => f.to_string(),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// `nitcat-<kind>-<timestamp>.csv` with `:` and `.` in the timestamp replaced by `-`.
pub fn export_filename(kind: &str, at: DateTime<Utc>) -> String {
    let ts = at
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("nitcat-{kind}-{ts}.csv")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use uuid::Uuid;

    use super::*;
    use crate::db::models::{ChartPoint, DeviceStatus, Readings};

    fn device(name: &str, group: Option<&str>) -> Device {
        let mut d = Device::paired(
            Uuid::nil(),
            name.into(),
            None,
            Readings { nitrogen: 45.06, phosphorus: 30.0, potassium: 61.24 },
        );
        d.group = group.map(str::to_owned);
        d
    }

    #[test]
    fn devices_csv_header_only_when_empty() {
        assert_eq!(devices_csv(&[]), DEVICE_CSV_HEADER);
    }

    #[test]
    fn devices_csv_formats_rows() {
        let mut d = device("North bed", Some("Garden"));
        d.status = DeviceStatus::Offline;
        let csv = devices_csv(&[d.clone(), device("South", None)]);
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], format!("{},North bed,Garden,offline,45.1,30.0,61.2", d.id));
        assert!(lines[2].contains(",Uncategorized,online,"));
    }

    #[test]
    fn devices_csv_does_not_quote_commas() {
        let csv = devices_csv(&[device("a,b", None)]);
        assert!(csv.lines().nth(1).unwrap().contains(",a,b,"));
    }

    #[test]
    fn chart_csv_uses_first_row_keys() {
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let points = [
            ChartPoint { time, nitrogen: 50.5, phosphorus: 30.0, potassium: 70.25 },
            ChartPoint { time, nitrogen: 51.0, phosphorus: 29.5, potassium: 70.0 },
        ];
        let csv = rows_csv(&points).unwrap();
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines[0], "time,nitrogen,phosphorus,potassium");
        assert_eq!(lines[1], "2024-05-01T12:00:00Z,50.5,30,70.25");
        assert_eq!(lines[2], "2024-05-01T12:00:00Z,51,29.5,70");
    }

    #[test]
    fn rows_csv_missing_keys_are_empty() {
        let rows = [
            serde_json::json!({ "a": 1, "b": "x" }),
            serde_json::json!({ "a": 2, "c": true }),
        ];
        let csv = rows_csv(&rows).unwrap();
        assert_eq!(csv, "a,b\n1,x\n2,");
    }

    #[test]
    fn rows_csv_empty_input() {
        let rows: [ChartPoint; 0] = [];
        assert_eq!(rows_csv(&rows).unwrap(), "");
    }

    #[test]
    fn rows_csv_rejects_scalars() {
        assert!(rows_csv(&[1, 2]).is_err());
    }

    #[test]
    fn filename_replaces_separators() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 15).unwrap();
        assert_eq!(
            export_filename("readings", at),
            "nitcat-readings-2024-05-01T12-30-15-000Z.csv"
        );
    }
}
