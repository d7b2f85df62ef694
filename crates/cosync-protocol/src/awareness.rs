//! Awareness payloads and normalized cursor records
//!
//! A participant broadcasts one [`AwarenessPayload`] at a time, always in
//! full. Receivers normalize every complete payload into a
//! [`MultiplayerCursor`] for the rendering layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 2x3 affine camera transform, row-major
pub type Transform = [[f64; 3]; 2];

pub const IDENTITY_TRANSFORM: Transform = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];

/// Color scale assigned to a participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Palette {
    #[serde(rename = "50")]
    pub shade_50: String,
    #[serde(rename = "100")]
    pub shade_100: String,
    #[serde(rename = "200")]
    pub shade_200: String,
    #[serde(rename = "300")]
    pub shade_300: String,
    #[serde(rename = "400")]
    pub shade_400: String,
    #[serde(rename = "500")]
    pub shade_500: String,
    #[serde(rename = "600")]
    pub shade_600: String,
    #[serde(rename = "700")]
    pub shade_700: String,
    #[serde(rename = "800")]
    pub shade_800: String,
    #[serde(rename = "900")]
    pub shade_900: String,
    #[serde(rename = "950")]
    pub shade_950: String,
}

impl Palette {
    /// Gray scale
    pub fn neutral() -> Self {
        Self::from_shades([
            "#fafafa", "#f5f5f5", "#e5e5e5", "#d4d4d4", "#a3a3a3", "#737373", "#525252",
            "#404040", "#262626", "#171717", "#0a0a0a",
        ])
    }

    pub fn from_shades(shades: [&str; 11]) -> Self {
        let [s50, s100, s200, s300, s400, s500, s600, s700, s800, s900, s950] =
            shades.map(str::to_string);
        Self {
            shade_50: s50,
            shade_100: s100,
            shade_200: s200,
            shade_300: s300,
            shade_400: s400,
            shade_500: s500,
            shade_600: s600,
            shade_700: s700,
            shade_800: s800,
            shade_900: s900,
            shade_950: s950,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub palette: Palette,
}

/// Medium-frequency slice: active scene and selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Focus {
    pub scene_id: Option<String>,
    #[serde(default)]
    pub selection: Vec<String>,
}

/// High-frequency slice: pointer, camera and marquee anchor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geo {
    pub transform: Transform,
    pub position: [f64; 2],
    #[serde(default)]
    pub marquee_a: Option<[f64; 2]>,
}

impl Default for Geo {
    fn default() -> Self {
        Self {
            transform: IDENTITY_TRANSFORM,
            position: [0.0, 0.0],
            marquee_a: None,
        }
    }
}

/// Ephemeral chat bubble next to a cursor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorChat {
    pub txt: String,
    pub ts: u64,
}

/// Full per-participant awareness record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessPayload {
    pub cursor_id: String,
    pub profile: Profile,
    pub focus: Focus,
    pub geo: Geo,
    pub cursor_chat: Option<CursorChat>,
    /// Logical clock, milliseconds since the Unix epoch
    pub ts: u64,
}

impl AwarenessPayload {
    /// Read a presence entry, `None` if it is incomplete
    pub fn from_state(state: &Value) -> Option<Self> {
        serde_json::from_value(state.clone()).ok()
    }

    pub fn to_state(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Marquee rectangle from anchor `a` to pointer `b`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Marquee {
    pub a: [f64; 2],
    pub b: [f64; 2],
}

/// Normalized remote cursor handed to the rendering layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiplayerCursor {
    pub t: u64,
    pub id: String,
    pub position: [f64; 2],
    pub palette: Palette,
    pub marquee: Option<Marquee>,
    pub transform: Transform,
    pub selection: Vec<String>,
    pub scene_id: Option<String>,
    pub ephemeral_chat: Option<CursorChat>,
}

impl From<&AwarenessPayload> for MultiplayerCursor {
    fn from(payload: &AwarenessPayload) -> Self {
        Self {
            t: payload.ts,
            id: payload.cursor_id.clone(),
            position: payload.geo.position,
            palette: payload.profile.palette.clone(),
            marquee: payload.geo.marquee_a.map(|a| Marquee {
                a,
                b: payload.geo.position,
            }),
            transform: payload.geo.transform,
            selection: payload.focus.selection.clone(),
            scene_id: payload.focus.scene_id.clone(),
            ephemeral_chat: payload.cursor_chat.clone(),
        }
    }
}
