//! Endpoint classification
//!
//! Derives a single best-fit kind for an endpoint from the clusters in
//! its Simple Descriptor, plus the verb lists consumed by the UI.
//! "Device type" is profile-specific, so this is a practical heuristic:
//! server clusters accept commands and report; client clusters emit.

use crate::cluster::id;
use crate::device::EndpointRecord;

/// Best-fit endpoint kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    ColorLight,
    DimmableLight,
    Relay,
    DimmerSwitch,
    Switch,
    TemperatureSensor,
    HumiditySensor,
    TempHumiditySensor,
    OccupancySensor,
    IlluminanceSensor,
    PressureSensor,
    FlowSensor,
    Sensor,
    Unknown,
}

impl EndpointKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ColorLight => "color_light",
            Self::DimmableLight => "dimmable_light",
            Self::Relay => "relay",
            Self::DimmerSwitch => "dimmer_switch",
            Self::Switch => "switch",
            Self::TemperatureSensor => "temperature_sensor",
            Self::HumiditySensor => "humidity_sensor",
            Self::TempHumiditySensor => "temp_humidity_sensor",
            Self::OccupancySensor => "occupancy_sensor",
            Self::IlluminanceSensor => "illuminance_sensor",
            Self::PressureSensor => "pressure_sensor",
            Self::FlowSensor => "flow_sensor",
            Self::Sensor => "sensor",
            Self::Unknown => "unknown",
        }
    }

    /// The endpoint drives a light or relay load.
    #[must_use]
    pub fn is_light(self) -> bool {
        matches!(self, Self::ColorLight | Self::DimmableLight)
    }

    /// The endpoint emits commands (button-style controller).
    #[must_use]
    pub fn is_controller(self) -> bool {
        matches!(self, Self::DimmerSwitch | Self::Switch)
    }
}

/// Classify an endpoint. Precedence: actuators, then controllers,
/// then sensors (combined temperature+humidity beats either alone).
#[must_use]
pub fn classify(ep: &EndpointRecord) -> EndpointKind {
    let onoff_srv = ep.has_in_cluster(id::ON_OFF);
    let onoff_cli = ep.has_out_cluster(id::ON_OFF);
    let level_srv = ep.has_in_cluster(id::LEVEL_CONTROL);
    let color_srv = ep.has_in_cluster(id::COLOR_CONTROL);

    let temp_srv = ep.has_in_cluster(id::TEMPERATURE_MEASUREMENT);
    let hum_srv = ep.has_in_cluster(id::HUMIDITY_MEASUREMENT);
    let occ_srv = ep.has_in_cluster(id::OCCUPANCY_SENSING);
    let illum_srv = ep.has_in_cluster(id::ILLUMINANCE_MEASUREMENT);
    let press_srv = ep.has_in_cluster(id::PRESSURE_MEASUREMENT);
    let flow_srv = ep.has_in_cluster(id::FLOW_MEASUREMENT);

    if color_srv {
        return EndpointKind::ColorLight;
    }
    if level_srv && onoff_srv {
        return EndpointKind::DimmableLight;
    }
    if onoff_srv {
        return EndpointKind::Relay;
    }

    if onoff_cli {
        if ep.has_out_cluster(id::LEVEL_CONTROL) {
            return EndpointKind::DimmerSwitch;
        }
        return EndpointKind::Switch;
    }

    if temp_srv || hum_srv || occ_srv || illum_srv || press_srv || flow_srv {
        if temp_srv && hum_srv {
            return EndpointKind::TempHumiditySensor;
        }
        if temp_srv {
            return EndpointKind::TemperatureSensor;
        }
        if hum_srv {
            return EndpointKind::HumiditySensor;
        }
        if occ_srv {
            return EndpointKind::OccupancySensor;
        }
        if illum_srv {
            return EndpointKind::IlluminanceSensor;
        }
        if press_srv {
            return EndpointKind::PressureSensor;
        }
        if flow_srv {
            return EndpointKind::FlowSensor;
        }
        return EndpointKind::Sensor;
    }

    EndpointKind::Unknown
}

/// Verbs the endpoint accepts (server clusters).
#[must_use]
pub fn accepts(ep: &EndpointRecord) -> Vec<&'static str> {
    let mut items = Vec::new();
    if ep.has_in_cluster(id::ON_OFF) {
        items.extend(["onoff.off", "onoff.on", "onoff.toggle"]);
    }
    if ep.has_in_cluster(id::LEVEL_CONTROL) {
        items.extend([
            "level.move_to_level",
            "level.move",
            "level.step",
            "level.stop",
        ]);
    }
    if ep.has_in_cluster(id::COLOR_CONTROL) {
        items.extend([
            "color.move_to_color_xy",
            "color.move_to_color_temperature",
        ]);
    }
    if ep.has_in_cluster(id::GROUPS) {
        items.extend(["groups.add", "groups.remove"]);
    }
    if ep.has_in_cluster(id::SCENES) {
        items.extend(["scenes.store", "scenes.recall"]);
    }
    items
}

/// Verbs the endpoint emits (client clusters).
#[must_use]
pub fn emits(ep: &EndpointRecord) -> Vec<&'static str> {
    let mut items = Vec::new();
    if ep.has_out_cluster(id::ON_OFF) {
        items.extend(["onoff.off", "onoff.on", "onoff.toggle"]);
    }
    if ep.has_out_cluster(id::LEVEL_CONTROL) {
        items.extend(["level.move_to_level", "level.move", "level.step", "level.stop"]);
    }
    if ep.has_out_cluster(id::COLOR_CONTROL) {
        items.push("color.*");
    }
    items
}

/// State keys the endpoint is expected to report.
#[must_use]
pub fn reports(ep: &EndpointRecord) -> Vec<&'static str> {
    let mut items = Vec::new();
    if ep.has_in_cluster(id::ON_OFF) {
        items.push("onoff");
    }
    if ep.has_in_cluster(id::LEVEL_CONTROL) {
        items.push("level");
    }
    if ep.has_in_cluster(id::TEMPERATURE_MEASUREMENT) {
        items.push("temperature_c");
    }
    if ep.has_in_cluster(id::HUMIDITY_MEASUREMENT) {
        items.push("humidity_pct");
    }
    if ep.has_in_cluster(id::OCCUPANCY_SENSING) {
        items.push("occupancy");
    }
    if ep.has_in_cluster(id::ILLUMINANCE_MEASUREMENT) {
        items.push("illuminance_raw");
    }
    if ep.has_in_cluster(id::POWER_CONFIG) {
        items.push("battery_pct");
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep_with(in_clusters: &[u16], out_clusters: &[u16]) -> EndpointRecord {
        let mut ep = EndpointRecord::new(1, 0x0104, 0x0100);
        for &c in in_clusters {
            ep.push_in_cluster(c);
        }
        for &c in out_clusters {
            ep.push_out_cluster(c);
        }
        ep
    }

    #[test]
    fn test_actuator_precedence() {
        assert_eq!(
            classify(&ep_with(&[id::ON_OFF, id::LEVEL_CONTROL, id::COLOR_CONTROL], &[])),
            EndpointKind::ColorLight
        );
        assert_eq!(
            classify(&ep_with(&[id::ON_OFF, id::LEVEL_CONTROL], &[])),
            EndpointKind::DimmableLight
        );
        assert_eq!(classify(&ep_with(&[id::ON_OFF], &[])), EndpointKind::Relay);
    }

    #[test]
    fn test_controllers() {
        assert_eq!(
            classify(&ep_with(&[], &[id::ON_OFF, id::LEVEL_CONTROL])),
            EndpointKind::DimmerSwitch
        );
        assert_eq!(
            classify(&ep_with(&[], &[id::ON_OFF])),
            EndpointKind::Switch
        );
    }

    #[test]
    fn test_sensors() {
        assert_eq!(
            classify(&ep_with(
                &[id::TEMPERATURE_MEASUREMENT, id::HUMIDITY_MEASUREMENT],
                &[]
            )),
            EndpointKind::TempHumiditySensor
        );
        assert_eq!(
            classify(&ep_with(&[id::TEMPERATURE_MEASUREMENT], &[])),
            EndpointKind::TemperatureSensor
        );
        assert_eq!(
            classify(&ep_with(&[id::OCCUPANCY_SENSING], &[])),
            EndpointKind::OccupancySensor
        );
        assert_eq!(
            classify(&ep_with(&[id::PRESSURE_MEASUREMENT], &[])),
            EndpointKind::PressureSensor
        );
    }

    #[test]
    fn test_actuator_beats_sensor() {
        // On/Off server plus a temperature server still reads as a relay.
        assert_eq!(
            classify(&ep_with(&[id::ON_OFF, id::TEMPERATURE_MEASUREMENT], &[])),
            EndpointKind::Relay
        );
    }

    #[test]
    fn test_unknown() {
        assert_eq!(classify(&ep_with(&[id::BASIC], &[])), EndpointKind::Unknown);
    }

    #[test]
    fn test_verbs() {
        let light = ep_with(&[id::ON_OFF, id::LEVEL_CONTROL, id::GROUPS], &[]);
        let acc = accepts(&light);
        assert!(acc.contains(&"onoff.toggle"));
        assert!(acc.contains(&"level.move_to_level"));
        assert!(acc.contains(&"groups.add"));

        let button = ep_with(&[], &[id::ON_OFF]);
        assert!(emits(&button).contains(&"onoff.toggle"));
        assert!(accepts(&button).is_empty());

        let sensor = ep_with(&[id::TEMPERATURE_MEASUREMENT, id::POWER_CONFIG], &[]);
        let rep = reports(&sensor);
        assert_eq!(rep, vec!["temperature_c", "battery_pct"]);
    }
}
