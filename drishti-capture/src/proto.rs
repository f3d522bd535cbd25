//! SSL-Vision wire messages.
//!
//! Hand-declared `prost` messages mirroring `ssl_vision_wrapper.proto`,
//! `ssl_vision_detection.proto` and `ssl_vision_geometry.proto`. Field tags
//! match the upstream definitions so packets interoperate with SSL-Vision and
//! any processor speaking the same protocol.
//!
//! # Wire Protocol
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ One UDP datagram = one SSL_WrapperPacket     │
//! │ (no length prefix, no framing)               │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The messages also derive `serde` so detection sequences can be persisted
//! and geometry can be loaded from YAML/JSON files.

use crate::error::Result;
use prost::Message as ProstMessage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level packet. At most one payload is expected to be populated.
#[derive(Clone, PartialEq, ProstMessage, Serialize, Deserialize)]
#[serde(default)]
pub struct WrapperPacket {
    #[prost(message, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection: Option<DetectionFrame>,
    #[prost(message, optional, tag = "2")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry: Option<GeometryData>,
}

/// Observed objects for one capture instant of one camera.
#[derive(Clone, PartialEq, ProstMessage, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionFrame {
    #[prost(uint32, required, tag = "1")]
    pub frame_number: u32,
    /// Capture time in seconds
    #[prost(double, required, tag = "2")]
    pub t_capture: f64,
    #[prost(double, required, tag = "3")]
    pub t_sent: f64,
    #[prost(uint32, required, tag = "4")]
    pub camera_id: u32,
    #[prost(message, repeated, tag = "5")]
    pub balls: Vec<DetectionBall>,
    #[prost(message, repeated, tag = "6")]
    pub robots_yellow: Vec<DetectionRobot>,
    #[prost(message, repeated, tag = "7")]
    pub robots_blue: Vec<DetectionRobot>,
    #[prost(double, optional, tag = "8")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t_capture_camera: Option<f64>,
}

#[derive(Clone, PartialEq, ProstMessage, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionBall {
    #[prost(float, required, tag = "1")]
    pub confidence: f32,
    #[prost(uint32, optional, tag = "2")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area: Option<u32>,
    #[prost(float, required, tag = "3")]
    pub x: f32,
    #[prost(float, required, tag = "4")]
    pub y: f32,
    #[prost(float, optional, tag = "5")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z: Option<f32>,
    #[prost(float, required, tag = "6")]
    pub pixel_x: f32,
    #[prost(float, required, tag = "7")]
    pub pixel_y: f32,
}

#[derive(Clone, PartialEq, ProstMessage, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionRobot {
    #[prost(float, required, tag = "1")]
    pub confidence: f32,
    #[prost(uint32, optional, tag = "2")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub robot_id: Option<u32>,
    #[prost(float, required, tag = "3")]
    pub x: f32,
    #[prost(float, required, tag = "4")]
    pub y: f32,
    #[prost(float, optional, tag = "5")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orientation: Option<f32>,
    #[prost(float, required, tag = "6")]
    pub pixel_x: f32,
    #[prost(float, required, tag = "7")]
    pub pixel_y: f32,
    #[prost(float, optional, tag = "8")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f32>,
}

/// Static field description sent once before detections.
#[derive(Clone, PartialEq, ProstMessage, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryData {
    #[prost(message, optional, tag = "1")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<GeometryFieldSize>,
    #[prost(message, repeated, tag = "2")]
    pub calib: Vec<GeometryCameraCalibration>,
}

/// Field dimensions in millimetres.
#[derive(Clone, PartialEq, ProstMessage, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryFieldSize {
    #[prost(int32, required, tag = "1")]
    pub field_length: i32,
    #[prost(int32, required, tag = "2")]
    pub field_width: i32,
    #[prost(int32, required, tag = "3")]
    pub goal_width: i32,
    #[prost(int32, required, tag = "4")]
    pub goal_depth: i32,
    #[prost(int32, required, tag = "5")]
    pub boundary_width: i32,
    #[prost(int32, optional, tag = "8")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub penalty_area_depth: Option<i32>,
    #[prost(int32, optional, tag = "9")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub penalty_area_width: Option<i32>,
}

#[derive(Clone, PartialEq, ProstMessage, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryCameraCalibration {
    #[prost(uint32, required, tag = "1")]
    pub camera_id: u32,
    #[prost(float, required, tag = "2")]
    pub focal_length: f32,
    #[prost(float, required, tag = "3")]
    pub principal_point_x: f32,
    #[prost(float, required, tag = "4")]
    pub principal_point_y: f32,
    #[prost(float, required, tag = "5")]
    pub distortion: f32,
    #[prost(float, required, tag = "6")]
    pub q0: f32,
    #[prost(float, required, tag = "7")]
    pub q1: f32,
    #[prost(float, required, tag = "8")]
    pub q2: f32,
    #[prost(float, required, tag = "9")]
    pub q3: f32,
    #[prost(float, required, tag = "10")]
    pub tx: f32,
    #[prost(float, required, tag = "11")]
    pub ty: f32,
    #[prost(float, required, tag = "12")]
    pub tz: f32,
    #[prost(uint32, optional, tag = "16")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pixel_image_width: Option<u32>,
    #[prost(uint32, optional, tag = "17")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pixel_image_height: Option<u32>,
}

/// Accumulation key: which payload of the wrapper a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKey {
    Detection,
    Geometry,
}

impl FieldKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKey::Detection => "detection",
            FieldKey::Geometry => "geometry",
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One populated payload of a wrapper packet
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Detection(DetectionFrame),
    Geometry(GeometryData),
}

impl Payload {
    pub fn key(&self) -> FieldKey {
        match self {
            Payload::Detection(_) => FieldKey::Detection,
            Payload::Geometry(_) => FieldKey::Geometry,
        }
    }

    pub fn into_detection(self) -> Option<DetectionFrame> {
        match self {
            Payload::Detection(frame) => Some(frame),
            _ => None,
        }
    }
}

impl WrapperPacket {
    /// Wrap a detection frame
    pub fn from_detection(frame: DetectionFrame) -> Self {
        Self {
            detection: Some(frame),
            geometry: None,
        }
    }

    /// Wrap geometry data
    pub fn from_geometry(geometry: GeometryData) -> Self {
        Self {
            detection: None,
            geometry: Some(geometry),
        }
    }

    /// Decode one datagram
    pub fn decode_datagram(bytes: &[u8]) -> Result<Self> {
        Ok(Self::decode(bytes)?)
    }

    /// Split into the populated payloads (detection first).
    pub fn into_payloads(self) -> Vec<Payload> {
        let mut payloads = Vec::with_capacity(1);
        if let Some(frame) = self.detection {
            payloads.push(Payload::Detection(frame));
        }
        if let Some(geometry) = self.geometry {
            payloads.push(Payload::Geometry(geometry));
        }
        payloads
    }
}

impl DetectionFrame {
    /// Minimal frame carrying only identity and timing
    pub fn at(frame_number: u32, camera_id: u32, t_capture: f64) -> Self {
        Self {
            frame_number,
            camera_id,
            t_capture,
            t_sent: t_capture,
            ..Default::default()
        }
    }
}
