//! Pan/zoom animation for still images.
//!
//! The effect is picked from a hash of the output file name so re-running a
//! build renders the same motion. Frames are generated at twice the target
//! rate and then dropped to the target fps, which hides zoompan's integer
//! pixel stepping.

use crate::stable_seed;
use serde::{Deserialize, Serialize};

/// Zoom factor at the "zoomed" end of every motion.
pub const MAX_ZOOM: f64 = 1.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    None,
    ZoomIn,
    ZoomOut,
    PanLeft,
    PanRight,
    DiagTlBr,
    DiagBrTl,
}

impl Effect {
    pub const ANIMATED: [Effect; 6] = [
        Effect::ZoomIn,
        Effect::ZoomOut,
        Effect::PanLeft,
        Effect::PanRight,
        Effect::DiagTlBr,
        Effect::DiagBrTl,
    ];

    /// Deterministic choice for a still rendered to `output_name`.
    pub fn for_output(output_name: &str) -> Self {
        let idx = (stable_seed(output_name) % Self::ANIMATED.len() as u64) as usize;
        Self::ANIMATED[idx]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Effect::None => "none",
            Effect::ZoomIn => "zoom_in",
            Effect::ZoomOut => "zoom_out",
            Effect::PanLeft => "pan_left",
            Effect::PanRight => "pan_right",
            Effect::DiagTlBr => "diag_tl_br",
            Effect::DiagBrTl => "diag_br_tl",
        }
    }
}

/// Smoothstep coefficients: eased progress is `3p^2 - 2p^3` on `[0, 1]`.
const EASE_SQUARE: f64 = 3.0;
const EASE_CUBE: f64 = 2.0;

/// Smoothstep over an ffmpeg expression already clamped to `[0, 1]`.
fn eased_expr(progress: &str) -> String {
    format!(
        "({a}*pow({p},2)-{b}*pow({p},3))",
        a = EASE_SQUARE,
        b = EASE_CUBE,
        p = progress
    )
}

/// Frames generated internally for `duration` seconds at `fps`.
pub fn internal_frames(duration: f64, fps: u32) -> u32 {
    ((duration.max(0.0) * fps as f64 * 2.0).ceil() as u32).max(2)
}

/// Full `-vf` chain for a still: cover-scale to 2x target, animate, then
/// downsample to the target rate.
pub fn panzoom_filter(effect: Effect, width: u32, height: u32, fps: u32, duration: f64) -> String {
    let frames = internal_frames(duration, fps);
    let progress = format!("min(on/{},1)", frames - 1);
    let eased = eased_expr(&progress);
    let span = MAX_ZOOM - 1.0;

    let center_x = "iw/2-(iw/zoom/2)".to_string();
    let center_y = "ih/2-(ih/zoom/2)".to_string();
    let along_x = format!("(iw-iw/zoom)*{}", eased);
    let back_x = format!("(iw-iw/zoom)*(1-{})", eased);
    let along_y = format!("(ih-ih/zoom)*{}", eased);
    let back_y = format!("(ih-ih/zoom)*(1-{})", eased);
    let held = format!("{:.2}", MAX_ZOOM);

    let (z, x, y) = match effect {
        Effect::None => ("1".to_string(), "0".to_string(), "0".to_string()),
        Effect::ZoomIn => (format!("1+{:.2}*{}", span, eased), center_x, center_y),
        Effect::ZoomOut => (format!("{}-{:.2}*{}", held, span, eased), center_x, center_y),
        Effect::PanLeft => (held, back_x, center_y),
        Effect::PanRight => (held, along_x, center_y),
        Effect::DiagTlBr => (held, along_x, along_y),
        Effect::DiagBrTl => (held, back_x, back_y),
    };

    format!(
        "scale={w2}:{h2}:force_original_aspect_ratio=increase,crop={w2}:{h2},setsar=1,\
zoompan=z='{z}':x='{x}':y='{y}':d={d}:s={w}x{h}:fps={fps2},fps={fps},format=yuv420p",
        w2 = width * 2,
        h2 = height * 2,
        z = z,
        x = x,
        y = y,
        d = frames,
        w = width,
        h = height,
        fps2 = fps * 2,
        fps = fps,
    )
}
