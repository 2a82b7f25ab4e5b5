use crate::db::models::{Device, GateState, ThresholdBand, ThresholdSettings};

/// Fraction of the band span kept as a dead zone inside each edge.
pub const HYSTERESIS_FRACTION: f64 = 0.05;

/// Decide whether the nitrogen gate should be open.
///
/// Schmitt-trigger style: an open gate stays open until the reading reaches
/// `max - buffer`, a closed gate stays closed until the reading drops below
/// `min + buffer`, where `buffer` is 5% of the band span. An unknown state is
/// treated as closed. A band with `max <= min` has a non-positive buffer and
/// degenerates into plain less-than comparisons.
pub fn should_gate_be_open(reading: f64, band: ThresholdBand, current: Option<GateState>) -> bool {
    let buffer = (band.max - band.min) * HYSTERESIS_FRACTION;

    match current {
        Some(GateState::Open) => reading < band.max - buffer,
        Some(GateState::Closed) | None => reading < band.min + buffer,
    }
}

/// The gate state the controller wants, or `None` if it should stay as is.
pub fn gate_transition(device: &Device, thresholds: &ThresholdSettings) -> Option<GateState> {
    let open = should_gate_be_open(
        device.readings.nitrogen,
        thresholds.nitrogen,
        device.nitrogen_gate,
    );

    match (device.nitrogen_gate, open) {
        (Some(GateState::Open), false) => Some(GateState::Closed),
        (Some(GateState::Closed) | None, true) => Some(GateState::Open),
        _ => None,
    }
}

/// Apply automatic gate control to `device`.
///
/// Only an actual transition touches `nitrogen_gate`; otherwise the device
/// comes back unchanged, so repeated calls with the same inputs are stable.
pub fn update_device_gate_auto(device: &Device, thresholds: &ThresholdSettings) -> Device {
    let mut next = device.clone();
    if let Some(state) = gate_transition(device, thresholds) {
        next.nitrogen_gate = Some(state);
    }
    next
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::db::models::Readings;

    const BAND: ThresholdBand = ThresholdBand::new(30.0, 80.0);

    fn device(nitrogen: f64, gate: Option<GateState>) -> Device {
        let mut d = Device::paired(Uuid::new_v4(), "probe".into(), None, Readings::default());
        d.readings.nitrogen = nitrogen;
        d.nitrogen_gate = gate;
        d
    }

    #[test]
    fn open_gate_stays_open_below_inner_max() {
        // buffer = 2.5, inner max = 77.5
        assert!(should_gate_be_open(77.4, BAND, Some(GateState::Open)));
        assert!(should_gate_be_open(30.0, BAND, Some(GateState::Open)));
    }

    #[test]
    fn open_gate_closes_at_inner_max() {
        assert!(!should_gate_be_open(77.5, BAND, Some(GateState::Open)));
        assert!(!should_gate_be_open(95.0, BAND, Some(GateState::Open)));
    }

    #[test]
    fn closed_gate_opens_below_inner_min() {
        // inner min = 32.5
        assert!(should_gate_be_open(32.4, BAND, Some(GateState::Closed)));
        assert!(!should_gate_be_open(32.5, BAND, Some(GateState::Closed)));
        assert!(!should_gate_be_open(60.0, BAND, Some(GateState::Closed)));
    }

    #[test]
    fn unknown_state_behaves_as_closed() {
        assert_eq!(
            should_gate_be_open(50.0, BAND, None),
            should_gate_be_open(50.0, BAND, Some(GateState::Closed))
        );
        assert!(should_gate_be_open(10.0, BAND, None));
    }

    #[test]
    fn collapsed_band_is_plain_comparison() {
        let band = ThresholdBand::new(50.0, 50.0);
        assert!(should_gate_be_open(49.9, band, None));
        assert!(!should_gate_be_open(50.0, band, None));
        assert!(should_gate_be_open(49.9, band, Some(GateState::Open)));
        assert!(!should_gate_be_open(50.0, band, Some(GateState::Open)));
    }

    #[test]
    fn auto_update_opens_closed_gate_when_low() {
        let d = device(20.0, Some(GateState::Closed));
        let next = update_device_gate_auto(&d, &ThresholdSettings::DEFAULT);
        assert_eq!(next.nitrogen_gate, Some(GateState::Open));
    }

    #[test]
    fn auto_update_closes_open_gate_when_high() {
        let d = device(85.0, Some(GateState::Open));
        let next = update_device_gate_auto(&d, &ThresholdSettings::DEFAULT);
        assert_eq!(next.nitrogen_gate, Some(GateState::Closed));
    }

    #[test]
    fn auto_update_leaves_unknown_gate_alone_inside_band() {
        let d = device(50.0, None);
        let next = update_device_gate_auto(&d, &ThresholdSettings::DEFAULT);
        assert_eq!(next, d);
        assert!(gate_transition(&d, &ThresholdSettings::DEFAULT).is_none());
    }

    #[test]
    fn auto_update_is_idempotent() {
        let d = device(20.0, Some(GateState::Closed));
        let once = update_device_gate_auto(&d, &ThresholdSettings::DEFAULT);
        let twice = update_device_gate_auto(&once, &ThresholdSettings::DEFAULT);
        assert_eq!(once, twice);
    }
}
