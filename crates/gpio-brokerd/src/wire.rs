//! Method call payload decoding
//!
//! Method arguments arrive as JSON values. Everything is decoded and checked
//! here so that malformed payloads are rejected before any hardware access.

use crate::error::{BrokerError, Result};
use crate::line::{
    Bias, Direction, Drive, Edge, EventClock, LineConfig, LineSettings, LineValue, RequestConfig,
};
use serde_json::{Map, Value, json};

/// Decoded method call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MethodCall {
    /// Chip.RequestLines
    RequestLines {
        /// Grouped line settings
        line_config: LineConfig,
        /// Consumer and buffer size
        request_config: RequestConfig,
    },
    /// Request.Release
    Release,
    /// Request.ReconfigureLines
    ReconfigureLines {
        /// Replacement line settings
        line_config: LineConfig,
    },
    /// Request.GetValues
    GetValues {
        /// Subset of the reserved offsets, all lines when absent
        offsets: Option<Vec<u32>>,
    },
    /// Request.SetValues
    SetValues {
        /// Offsets to drive
        offsets: Vec<u32>,
        /// Values, one per offset
        values: Vec<LineValue>,
    },
}

impl MethodCall {
    /// Bus method name
    pub fn name(&self) -> &'static str {
        match self {
            MethodCall::RequestLines { .. } => "RequestLines",
            MethodCall::Release => "Release",
            MethodCall::ReconfigureLines { .. } => "ReconfigureLines",
            MethodCall::GetValues { .. } => "GetValues",
            MethodCall::SetValues { .. } => "SetValues",
        }
    }

    /// Decode a method call from its name and JSON arguments
    pub fn from_wire(path: &str, method: &str, args: &Value) -> Result<Self> {
        match method {
            "RequestLines" => {
                let args = args_object(args, &["line_config", "request_config"])?;
                let line_config = match args.get("line_config") {
                    Some(v) => line_config_from_wire(v)?,
                    None => return Err(BrokerError::invalid_args("missing argument 'line_config'")),
                };
                let request_config = match args.get("request_config") {
                    Some(v) => request_config_from_wire(v)?,
                    None => RequestConfig::default(),
                };
                Ok(MethodCall::RequestLines {
                    line_config,
                    request_config,
                })
            }
            "Release" => {
                args_object(args, &[])?;
                Ok(MethodCall::Release)
            }
            "ReconfigureLines" => {
                let args = args_object(args, &["line_config"])?;
                match args.get("line_config") {
                    Some(v) => Ok(MethodCall::ReconfigureLines {
                        line_config: line_config_from_wire(v)?,
                    }),
                    None => Err(BrokerError::invalid_args("missing argument 'line_config'")),
                }
            }
            "GetValues" => {
                let args = args_object(args, &["offsets"])?;
                let offsets = match args.get("offsets") {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(offsets_from_wire(v)?),
                };
                Ok(MethodCall::GetValues { offsets })
            }
            "SetValues" => {
                let args = args_object(args, &["values"])?;
                let pairs = match args.get("values") {
                    Some(Value::Array(pairs)) => pairs,
                    _ => {
                        return Err(BrokerError::invalid_args(
                            "'values' must be a list of [offset, value] pairs",
                        ));
                    }
                };

                let mut offsets = Vec::with_capacity(pairs.len());
                let mut values = Vec::with_capacity(pairs.len());
                for pair in pairs {
                    let (offset, value) = match pair.as_array().map(Vec::as_slice) {
                        Some([offset, value]) => (offset, value),
                        _ => {
                            return Err(BrokerError::invalid_args(format!(
                                "invalid offset/value pair received: {}",
                                pair
                            )));
                        }
                    };
                    offsets.push(offset_from_wire(offset)?);
                    values.push(value_from_wire(value)?);
                }
                Ok(MethodCall::SetValues { offsets, values })
            }
            _ => Err(BrokerError::UnknownMethod {
                path: path.to_string(),
                method: method.to_string(),
            }),
        }
    }
}

/// Successful method reply
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MethodReply {
    /// No return value
    Unit,
    /// Path of a newly exported object
    ObjectPath(String),
    /// Line values in request order
    Values(Vec<i32>),
}

impl MethodReply {
    /// JSON rendition of the reply
    pub fn to_wire(&self) -> Value {
        match self {
            MethodReply::Unit => Value::Null,
            MethodReply::ObjectPath(path) => json!(path),
            MethodReply::Values(values) => json!(values),
        }
    }
}

fn args_object(args: &Value, allowed: &[&str]) -> Result<Map<String, Value>> {
    let map = match args {
        Value::Null => return Ok(Map::new()),
        Value::Object(map) => map,
        other => {
            return Err(BrokerError::invalid_args(format!(
                "method arguments must be an object, got {}",
                other
            )));
        }
    };

    if let Some(key) = map.keys().find(|k| !allowed.contains(&k.as_str())) {
        return Err(BrokerError::invalid_args(format!(
            "unexpected argument received: '{}'",
            key
        )));
    }

    Ok(map.clone())
}

fn offset_from_wire(value: &Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| BrokerError::invalid_args(format!("invalid offset received: {}", value)))
}

fn offsets_from_wire(value: &Value) -> Result<Vec<u32>> {
    match value {
        Value::Array(items) => items.iter().map(offset_from_wire).collect(),
        other => Err(BrokerError::invalid_args(format!(
            "offsets must be a list, got {}",
            other
        ))),
    }
}

fn value_from_wire(value: &Value) -> Result<LineValue> {
    value
        .as_i64()
        .and_then(LineValue::from_wire)
        .ok_or_else(|| {
            BrokerError::invalid_args(format!("invalid line value received: {}", value))
        })
}

fn setting_str<'a>(key: &str, value: &'a Value) -> Result<&'a str> {
    value.as_str().ok_or_else(|| {
        BrokerError::invalid_args(format!("config option '{}' must be a string", key))
    })
}

fn apply_setting(settings: &mut LineSettings, key: &str, value: &Value) -> Result<()> {
    match key {
        "direction" => {
            settings.direction = match setting_str(key, value)? {
                "input" => Direction::Input,
                "output" => Direction::Output,
                "as-is" => Direction::AsIs,
                other => {
                    return Err(BrokerError::invalid_args(format!(
                        "invalid direction value received: '{}'",
                        other
                    )));
                }
            };
        }
        "edge" => {
            settings.edge = match setting_str(key, value)? {
                "falling" => Edge::Falling,
                "rising" => Edge::Rising,
                "both" => Edge::Both,
                other => {
                    return Err(BrokerError::invalid_args(format!(
                        "invalid edge value received: '{}'",
                        other
                    )));
                }
            };
        }
        "active-low" => {
            settings.active_low = value.as_bool().ok_or_else(|| {
                BrokerError::invalid_args("config option 'active-low' must be a boolean")
            })?;
        }
        "bias" => {
            settings.bias = match setting_str(key, value)? {
                "as-is" => Bias::AsIs,
                "pull-up" => Bias::PullUp,
                "pull-down" => Bias::PullDown,
                "disabled" => Bias::Disabled,
                other => {
                    return Err(BrokerError::invalid_args(format!(
                        "invalid bias value received: '{}'",
                        other
                    )));
                }
            };
        }
        "drive" => {
            settings.drive = match setting_str(key, value)? {
                "push-pull" => Drive::PushPull,
                "open-drain" => Drive::OpenDrain,
                "open-source" => Drive::OpenSource,
                other => {
                    return Err(BrokerError::invalid_args(format!(
                        "invalid drive value received: '{}'",
                        other
                    )));
                }
            };
        }
        "debounce-period" => {
            settings.debounce_period_us = value.as_u64().ok_or_else(|| {
                BrokerError::invalid_args(format!(
                    "invalid debounce period received: {}",
                    value
                ))
            })?;
        }
        "event-clock" => {
            settings.event_clock = match setting_str(key, value)? {
                "monotonic" => EventClock::Monotonic,
                "realtime" => EventClock::Realtime,
                "hte" => EventClock::Hte,
                other => {
                    return Err(BrokerError::invalid_args(format!(
                        "invalid event clock value received: '{}'",
                        other
                    )));
                }
            };
        }
        _ => {
            return Err(BrokerError::invalid_args(format!(
                "invalid config option received: '{}'",
                key
            )));
        }
    }

    Ok(())
}

/// Decode `[[[offsets], {settings}], ...], [output values]]`
pub fn line_config_from_wire(value: &Value) -> Result<LineConfig> {
    let (groups, outputs) = match value.as_array().map(Vec::as_slice) {
        Some([groups]) => (groups, None),
        Some([groups, outputs]) => (groups, Some(outputs)),
        _ => {
            return Err(BrokerError::invalid_args(
                "line config must be [groups, output values]",
            ));
        }
    };

    let groups = groups
        .as_array()
        .ok_or_else(|| BrokerError::invalid_args("line config groups must be a list"))?;

    let mut config = LineConfig::new();
    for group in groups {
        let (offsets, settings_v) = match group.as_array().map(Vec::as_slice) {
            Some([offsets, settings]) => (offsets, settings),
            _ => {
                return Err(BrokerError::invalid_args(format!(
                    "invalid line config group received: {}",
                    group
                )));
            }
        };

        let mut settings = LineSettings::default();
        match settings_v {
            Value::Object(map) => {
                for (key, value) in map {
                    apply_setting(&mut settings, key, value)?;
                }
            }
            Value::Null => {}
            other => {
                return Err(BrokerError::invalid_args(format!(
                    "line settings must be an object, got {}",
                    other
                )));
            }
        }

        config.add_group(offsets_from_wire(offsets)?, settings);
    }

    let values = match outputs {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(value_from_wire)
            .collect::<Result<Vec<_>>>()?,
        Some(other) => {
            return Err(BrokerError::invalid_args(format!(
                "output values must be a list, got {}",
                other
            )));
        }
    };

    let num_offsets = config.offsets().len();
    if values.len() > num_offsets {
        return Err(BrokerError::invalid_args(format!(
            "too many output values: {} for {} lines",
            values.len(),
            num_offsets
        )));
    }
    config.set_output_values(values);

    Ok(config)
}

/// Decode `{"consumer": str, "event-buffer-size": u32}`
pub fn request_config_from_wire(value: &Value) -> Result<RequestConfig> {
    let map = match value {
        Value::Null => return Ok(RequestConfig::default()),
        Value::Object(map) => map,
        other => {
            return Err(BrokerError::invalid_args(format!(
                "request config must be an object, got {}",
                other
            )));
        }
    };

    let mut config = RequestConfig::default();
    for (key, value) in map {
        match key.as_str() {
            "consumer" => {
                config.consumer = Some(setting_str(key, value)?.to_string());
            }
            "event-buffer-size" => {
                config.event_buffer_size = value
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| {
                        BrokerError::invalid_args(format!(
                            "invalid event buffer size received: {}",
                            value
                        ))
                    })?;
            }
            _ => {
                return Err(BrokerError::invalid_args(format!(
                    "invalid request config option received: '{}'",
                    key
                )));
            }
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_line_config_groups_and_outputs() {
        let config = line_config_from_wire(&json!([
            [
                [[2, 5], {"direction": "output", "drive": "open-drain"}],
                [[1], {"direction": "input", "edge": "both", "bias": "pull-up",
                       "debounce-period": 500, "event-clock": "realtime",
                       "active-low": true}]
            ],
            [1, 0]
        ]))
        .unwrap();

        assert_eq!(config.offsets(), vec![2, 5, 1]);
        let resolved = config.resolved();
        assert_eq!(resolved[0].1.direction, Direction::Output);
        assert_eq!(resolved[0].1.drive, Drive::OpenDrain);
        assert_eq!(resolved[0].1.output_value, LineValue::Active);
        assert_eq!(resolved[1].1.output_value, LineValue::Inactive);

        let input = resolved[2].1;
        assert_eq!(input.edge, Edge::Both);
        assert_eq!(input.bias, Bias::PullUp);
        assert_eq!(input.debounce_period_us, 500);
        assert_eq!(input.event_clock, EventClock::Realtime);
        assert!(input.active_low);
    }

    #[test]
    fn test_outputs_are_optional() {
        let config = line_config_from_wire(&json!([[[[0], {}]]])).unwrap();
        assert_eq!(config.offsets(), vec![0]);
        assert!(config.output_values().is_empty());

        let config = line_config_from_wire(&json!([[[[3], null]], []])).unwrap();
        assert_eq!(config.offsets(), vec![3]);
    }

    #[test]
    fn test_rejects_unknown_setting() {
        let err = line_config_from_wire(&json!([[[[0], {"colour": "red"}]], []])).unwrap_err();
        assert_eq!(err.to_string(), "invalid config option received: 'colour'");
        assert_eq!(err.bus_name(), "broker.Error.InvalidArgs");
    }

    #[test]
    fn test_rejects_bad_setting_values() {
        for settings in [
            json!({"direction": "sideways"}),
            json!({"edge": "none"}),
            json!({"bias": "pull-sideways"}),
            json!({"drive": 3}),
            json!({"active-low": "yes"}),
            json!({"debounce-period": -1}),
            json!({"event-clock": "sundial"}),
        ] {
            assert!(
                line_config_from_wire(&json!([[[[0], settings]], []])).is_err(),
                "accepted {}",
                settings
            );
        }
    }

    #[test]
    fn test_rejects_bad_shapes() {
        assert!(line_config_from_wire(&json!({"offsets": [1]})).is_err());
        assert!(line_config_from_wire(&json!([[[1, 2]], []])).is_err());
        assert!(line_config_from_wire(&json!([[[["a"], {}]], []])).is_err());
        assert!(line_config_from_wire(&json!([[[[0], {}]], [2]])).is_err());
    }

    #[test]
    fn test_rejects_too_many_output_values() {
        let err = line_config_from_wire(&json!([[[[0, 1], {}]], [1, 1, 1]])).unwrap_err();
        assert_eq!(err.to_string(), "too many output values: 3 for 2 lines");
    }

    #[test]
    fn test_request_config() {
        let config =
            request_config_from_wire(&json!({"consumer": "led-ctl", "event-buffer-size": 64}))
                .unwrap();
        assert_eq!(config.consumer.as_deref(), Some("led-ctl"));
        assert_eq!(config.event_buffer_size, 64);

        assert_eq!(
            request_config_from_wire(&Value::Null).unwrap(),
            RequestConfig::default()
        );

        let err = request_config_from_wire(&json!({"priority": 1})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid request config option received: 'priority'"
        );
    }

    #[test]
    fn test_get_values_arguments() {
        let path = "/broker/requests/request0";
        assert_eq!(
            MethodCall::from_wire(path, "GetValues", &Value::Null).unwrap(),
            MethodCall::GetValues { offsets: None }
        );
        assert_eq!(
            MethodCall::from_wire(path, "GetValues", &json!({})).unwrap(),
            MethodCall::GetValues { offsets: None }
        );
        assert_eq!(
            MethodCall::from_wire(path, "GetValues", &json!({"offsets": [4, 2]})).unwrap(),
            MethodCall::GetValues {
                offsets: Some(vec![4, 2])
            }
        );
    }

    #[test]
    fn test_set_values_arguments() {
        let call = MethodCall::from_wire(
            "/broker/requests/request0",
            "SetValues",
            &json!({"values": [[1, 1], [3, 0]]}),
        )
        .unwrap();
        assert_eq!(
            call,
            MethodCall::SetValues {
                offsets: vec![1, 3],
                values: vec![LineValue::Active, LineValue::Inactive],
            }
        );

        assert!(
            MethodCall::from_wire("/r", "SetValues", &json!({"values": [[1, 5]]})).is_err()
        );
        assert!(MethodCall::from_wire("/r", "SetValues", &json!({"values": [1]})).is_err());
    }

    #[test]
    fn test_unknown_method_and_arguments() {
        let err = MethodCall::from_wire("/broker/chips/gpiochip0", "Explode", &Value::Null)
            .unwrap_err();
        assert_eq!(err.bus_name(), "broker.Error.UnknownMethod");

        let err = MethodCall::from_wire("/r", "Release", &json!({"force": true})).unwrap_err();
        assert_eq!(err.to_string(), "unexpected argument received: 'force'");
    }

    #[test]
    fn test_request_lines_requires_line_config() {
        let err = MethodCall::from_wire("/c", "RequestLines", &json!({})).unwrap_err();
        assert_eq!(err.to_string(), "missing argument 'line_config'");
    }

    #[test]
    fn test_reply_wire_form() {
        assert_eq!(MethodReply::Unit.to_wire(), Value::Null);
        assert_eq!(
            MethodReply::ObjectPath("/broker/requests/request0".into()).to_wire(),
            json!("/broker/requests/request0")
        );
        assert_eq!(MethodReply::Values(vec![1, 0]).to_wire(), json!([1, 0]));
    }
}
