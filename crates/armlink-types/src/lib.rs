use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Number of decimal places used for every scalar on the telemetry wire.
pub const TELEMETRY_PRECISION: usize = 3;

/// Field count of an inbound pose message (`X,Y,Z,W,P,R`).
pub const POSE_FIELDS: usize = 6;

/// Field count of an inbound calibration message.
pub const CALIBRATION_FIELDS: usize = 13;

/// A 6-scalar world-frame target: position in millimetres plus the
/// W/P/R orientation angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
    pub p: f64,
    pub r: f64,
}

impl Pose {
    pub const fn new(x: f64, y: f64, z: f64, w: f64, p: f64, r: f64) -> Self {
        Self { x, y, z, w, p, r }
    }

    /// Parse exactly six comma-separated fields in `X,Y,Z,W,P,R` order.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] if the field count is wrong or any field is not
    /// a finite decimal.
    pub fn from_fields(fields: &[&str]) -> Result<Self, ParseError> {
        let v = parse_scalars::<POSE_FIELDS>(fields)?;
        Ok(Self::new(v[0], v[1], v[2], v[3], v[4], v[5]))
    }

    pub fn as_array(&self) -> [f64; 6] {
        [self.x, self.y, self.z, self.w, self.p, self.r]
    }

    /// Straight-line distance of the position from the robot base origin.
    pub fn radial_distance(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// The six joint angles of the manipulator, in degrees, J1 first.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct JointAngles(pub [f64; 6]);

/// Joint and world-pose readings taken in one refresh of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ArmState {
    pub joints: JointAngles,
    pub pose: Pose,
}

/// Immutable snapshot produced once per broadcaster cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub joints: JointAngles,
    pub pose: Pose,
    /// State of the configured digital output, when one is sampled.
    pub digital_signal: Option<bool>,
    pub sampled_at: DateTime<Utc>,
}

impl TelemetryFrame {
    pub fn new(state: ArmState, digital_signal: Option<bool>) -> Self {
        Self {
            joints: state.joints,
            pose: state.pose,
            digital_signal,
            sampled_at: Utc::now(),
        }
    }

    /// Render the wire line (without the trailing newline): six joints, six
    /// pose scalars, then an optional `0`/`1` signal field.
    ///
    /// The timestamp is deliberately not part of the line so that identical
    /// samples render to identical bytes.
    pub fn to_line(&self) -> String {
        let mut fields: Vec<String> = self
            .joints
            .0
            .iter()
            .chain(self.pose.as_array().iter())
            .map(|v| format!("{v:.prec$}", prec = TELEMETRY_PRECISION))
            .collect();
        if let Some(bit) = self.digital_signal {
            fields.push(if bit { "1" } else { "0" }.to_string());
        }
        fields.join(",")
    }
}

/// Render the reachability wire line (without the trailing newline).
pub fn reachability_line(reachable: bool) -> &'static str {
    if reachable { "True" } else { "False" }
}

/// Scene calibration sent by a vision client: camera position, the two
/// opposite corners and the center of the work-object bounding box, and the
/// camera-to-surface distance.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationFrame {
    pub camera: [f64; 3],
    pub bbox_min: [f64; 3],
    pub bbox_max: [f64; 3],
    pub bbox_center: [f64; 3],
    pub surface_distance: f64,
}

impl CalibrationFrame {
    /// Parse exactly thirteen comma-separated fields.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] if the field count is wrong or any field is not
    /// a finite decimal.
    pub fn from_fields(fields: &[&str]) -> Result<Self, ParseError> {
        let v = parse_scalars::<CALIBRATION_FIELDS>(fields)?;
        Ok(Self {
            camera: [v[0], v[1], v[2]],
            bbox_min: [v[3], v[4], v[5]],
            bbox_max: [v[6], v[7], v[8]],
            bbox_center: [v[9], v[10], v[11]],
            surface_distance: v[12],
        })
    }

    /// One-line human-readable scene description appended to prompts.
    pub fn summary(&self) -> String {
        fn triple(v: &[f64; 3]) -> String {
            format!("({:.3}, {:.3}, {:.3})", v[0], v[1], v[2])
        }
        format!(
            "Scene calibration: camera at {}, object bounding box from {} to {} centered at {}, camera-to-surface distance {:.3}.",
            triple(&self.camera),
            triple(&self.bbox_min),
            triple(&self.bbox_max),
            triple(&self.bbox_center),
            self.surface_distance
        )
    }
}

/// Discrete control keywords accepted on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscreteCommand {
    /// Re-home, abort, reset alarms, then select and run the configured program.
    Run,
    /// Clear active alarms.
    Reset,
    /// Abort all running tasks.
    Stop,
    /// Re-home without running a program.
    Home,
}

impl DiscreteCommand {
    /// Exact, case-sensitive keyword match.
    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "run" => Some(Self::Run),
            "reset" => Some(Self::Reset),
            "stop" => Some(Self::Stop),
            "home" => Some(Self::Home),
            _ => None,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Reset => "reset",
            Self::Stop => "stop",
            Self::Home => "home",
        }
    }
}

impl fmt::Display for DiscreteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Unique identity of one accepted client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A numeric field of an inbound message could not be used.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected {expected} fields, got {got}")]
    FieldCount { expected: usize, got: usize },

    #[error("field {index} is not a finite decimal: {raw:?}")]
    Field { index: usize, raw: String },
}

/// Global error type spanning actuator faults, transport failures and parsing.
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ArmError {
    #[error("Actuator fault during {operation}: {details}")]
    ActuatorFault { operation: String, details: String },

    #[error("Actuator unavailable: {0}")]
    ActuatorUnavailable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl ArmError {
    pub fn fault(operation: impl Into<String>, details: impl Into<String>) -> Self {
        Self::ActuatorFault {
            operation: operation.into(),
            details: details.into(),
        }
    }
}

impl From<ParseError> for ArmError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e.to_string())
    }
}

fn parse_scalars<const N: usize>(fields: &[&str]) -> Result<[f64; N], ParseError> {
    if fields.len() != N {
        return Err(ParseError::FieldCount {
            expected: N,
            got: fields.len(),
        });
    }
    let mut out = [0.0; N];
    for (index, raw) in fields.iter().enumerate() {
        out[index] = raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ParseError::Field {
                index,
                raw: (*raw).to_string(),
            })?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pose_parses_in_field_order() {
        let fields: Vec<&str> = "630,-70,835.273,0,62.596,-180".split(',').collect();
        let pose = Pose::from_fields(&fields).unwrap();
        assert_eq!(pose, Pose::new(630.0, -70.0, 835.273, 0.0, 62.596, -180.0));
    }

    #[test]
    fn pose_tolerates_whitespace_around_fields() {
        let fields = [" 1", "2 ", "3", "4", "5", "6\r"];
        let pose = Pose::from_fields(&fields).unwrap();
        assert_eq!(pose.r, 6.0);
    }

    #[test]
    fn pose_rejects_non_numeric_field() {
        let fields = ["1", "2", "abc", "4", "5", "6"];
        let err = Pose::from_fields(&fields).unwrap_err();
        assert_eq!(
            err,
            ParseError::Field {
                index: 2,
                raw: "abc".to_string()
            }
        );
    }

    #[test]
    fn pose_rejects_non_finite_field() {
        let fields = ["1", "2", "NaN", "4", "inf", "6"];
        assert!(matches!(
            Pose::from_fields(&fields),
            Err(ParseError::Field { index: 2, .. })
        ));
    }

    #[test]
    fn pose_rejects_wrong_field_count() {
        let fields = ["1", "2", "3"];
        assert_eq!(
            Pose::from_fields(&fields).unwrap_err(),
            ParseError::FieldCount {
                expected: 6,
                got: 3
            }
        );
    }

    #[test]
    fn calibration_frame_maps_all_thirteen_fields() {
        let line = "1,2,3,4,5,6,7,8,9,10,11,12,13";
        let fields: Vec<&str> = line.split(',').collect();
        let frame = CalibrationFrame::from_fields(&fields).unwrap();
        assert_eq!(frame.camera, [1.0, 2.0, 3.0]);
        assert_eq!(frame.bbox_min, [4.0, 5.0, 6.0]);
        assert_eq!(frame.bbox_max, [7.0, 8.0, 9.0]);
        assert_eq!(frame.bbox_center, [10.0, 11.0, 12.0]);
        assert_eq!(frame.surface_distance, 13.0);
        assert!(frame.summary().contains("distance 13.000"));
    }

    #[test]
    fn telemetry_line_has_twelve_fields_without_signal() {
        let frame = TelemetryFrame::new(
            ArmState {
                joints: JointAngles([1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
                pose: Pose::new(630.0, -70.0, 835.273, 0.0, 62.596, -180.0),
            },
            None,
        );
        let line = frame.to_line();
        assert_eq!(line.split(',').count(), 12);
        assert!(line.ends_with("630.000,-70.000,835.273,0.000,62.596,-180.000"));
    }

    #[test]
    fn telemetry_line_appends_signal_bit() {
        let frame = TelemetryFrame::new(ArmState::default(), Some(true));
        let line = frame.to_line();
        assert_eq!(line.split(',').count(), 13);
        assert!(line.ends_with(",1"));
    }

    #[test]
    fn identical_samples_render_identical_lines() {
        let state = ArmState::default();
        let a = TelemetryFrame::new(state, Some(false));
        let b = TelemetryFrame::new(state, Some(false));
        assert_eq!(a.to_line(), b.to_line());
    }

    #[test]
    fn reachability_line_literals() {
        assert_eq!(reachability_line(true), "True");
        assert_eq!(reachability_line(false), "False");
    }

    #[test]
    fn discrete_command_keywords_are_case_sensitive() {
        assert_eq!(DiscreteCommand::from_keyword("run"), Some(DiscreteCommand::Run));
        assert_eq!(DiscreteCommand::from_keyword("home"), Some(DiscreteCommand::Home));
        assert_eq!(DiscreteCommand::from_keyword("Run"), None);
        assert_eq!(DiscreteCommand::from_keyword("STOP"), None);
        assert_eq!(DiscreteCommand::Reset.to_string(), "reset");
    }

    #[test]
    fn arm_error_display() {
        let err = ArmError::fault("apply_pose", "servo off");
        assert!(err.to_string().contains("apply_pose"));

        let err2: ArmError = ParseError::FieldCount {
            expected: 13,
            got: 2,
        }
        .into();
        assert!(err2.to_string().contains("expected 13 fields"));
    }
}
