//! The [`GenerationRequest`] data model and its construction from
//! untrusted client input.
//!
//! A request is a pure value: it carries no callbacks and no transport
//! handles, so it serializes cleanly. Progress/image sinks are injected
//! into the engine's `run` call per invocation, never attached here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::sampler::Sampler;

// ---------------------------------------------------------------------------
// Defaults and resource-imposed constraints
// ---------------------------------------------------------------------------

/// Default img2img conditioning strength when the field is omitted.
pub const DEFAULT_STRENGTH: f32 = 0.75;

/// Default upscale strength when `upscaleLevel` is set without a strength.
pub const DEFAULT_UPSCALE_STRENGTH: f32 = 0.75;

/// Sentinel seed meaning "use the resource's current seed".
pub const SEED_UNSET: i64 = -1;

/// Output dimensions must be multiples of this (latent-space downsampling
/// factor of the underlying model).
pub const DIMENSION_ALIGNMENT: u32 = 64;

/// Highest supported upscale factor (the upscaler ships 2x and 4x models).
pub const MAX_UPSCALE_LEVEL: u32 = 4;

// ---------------------------------------------------------------------------
// Upscale
// ---------------------------------------------------------------------------

/// Post-processing upscale settings. Either wholly absent from a request
/// or fully specified.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Upscale {
    /// Upscale factor (2 = 2x, 4 = 4x). Always in `1..=`[`MAX_UPSCALE_LEVEL`].
    pub level: u32,
    /// Blend strength of the upscaled result, in `[0, 1]`.
    pub strength: f32,
}

// ---------------------------------------------------------------------------
// GenerationRequest
// ---------------------------------------------------------------------------

/// One unit of generation work.
///
/// Immutable once constructed, except for seed resolution: a `seed` of
/// [`SEED_UNSET`] is replaced with a concrete value by the engine before
/// the request is enqueued (and before any request id is derived).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    /// The text prompt.
    pub prompt: String,

    /// Optional initial image reference (data URL or output path) for
    /// img2img. The core never decodes this; the backend does.
    #[serde(rename = "initialImage", default)]
    pub init_image: Option<String>,

    /// How strongly the initial image constrains the output, in `[0, 1]`.
    pub strength: f32,

    /// Number of images to produce. Always >= 1.
    pub iterations: u32,

    /// Diffusion steps per image. Always >= 1.
    pub steps: u32,

    /// Output width in pixels. Positive multiple of [`DIMENSION_ALIGNMENT`].
    pub width: u32,

    /// Output height in pixels. Positive multiple of [`DIMENSION_ALIGNMENT`].
    pub height: u32,

    /// Resize the initial image to the requested dimensions instead of
    /// cropping.
    #[serde(rename = "fitToInitialImage", default)]
    pub fit: bool,

    /// Classifier-free guidance scale. Always > 0.
    pub cfg_scale: f32,

    /// Sampling scheduler.
    pub sampler: Sampler,

    /// Face restoration strength, in `[0, 1]`. Forced to 0 when the
    /// running deployment has no face-restoration model.
    pub face_restore_strength: f32,

    /// Optional post-processing upscale.
    #[serde(default)]
    pub upscale: Option<Upscale>,

    /// Emit intermediate preview images with progress events.
    #[serde(rename = "emitIntermediateImages", default)]
    pub progress_images: bool,

    /// Random seed, or [`SEED_UNSET`] to use the resource's current seed.
    pub seed: i64,

    /// When this request was accepted.
    pub created_at: DateTime<Utc>,
}

impl GenerationRequest {
    /// Construct a request from untyped client JSON.
    ///
    /// Numeric fields accept both JSON numbers and numeric strings (HTML
    /// form inputs arrive as strings). Missing optional fields take their
    /// documented defaults. Any malformed or out-of-range field fails
    /// with [`CoreError::Validation`] naming the field.
    ///
    /// `face_restore_available` reflects whether the deployment has a
    /// face-restoration model; when it does not, `faceRestoreStrength`
    /// is forced to 0 regardless of what the client sent.
    pub fn from_json(input: &Value, face_restore_available: bool) -> Result<Self, CoreError> {
        let obj = input
            .as_object()
            .ok_or_else(|| CoreError::Validation("Request body must be a JSON object".into()))?;

        let prompt = match obj.get("prompt") {
            Some(Value::String(s)) => s.clone(),
            Some(_) => return Err(invalid("prompt", "must be a string")),
            None => return Err(missing("prompt")),
        };

        let init_image = match obj.get("initialImage") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(invalid("initialImage", "must be a string")),
        };

        let face_restore_strength = if face_restore_available {
            f32_field(obj, "faceRestoreStrength", Some(0.0))?
        } else {
            0.0
        };

        let request = Self {
            prompt,
            init_image,
            strength: f32_field(obj, "strength", Some(DEFAULT_STRENGTH))?,
            iterations: u32_field(obj, "iterations", None)?,
            steps: u32_field(obj, "steps", None)?,
            width: u32_field(obj, "width", None)?,
            height: u32_field(obj, "height", None)?,
            fit: bool_field(obj, "fitToInitialImage")?,
            cfg_scale: f32_field(obj, "cfgScale", None)?,
            sampler: sampler_field(obj)?,
            face_restore_strength,
            upscale: upscale_field(obj)?,
            progress_images: bool_field(obj, "emitIntermediateImages")?,
            seed: i64_field(obj, "seed", Some(SEED_UNSET))?,
            created_at: Utc::now(),
        };

        request.validate()?;
        Ok(request)
    }

    /// Check every range and alignment invariant.
    ///
    /// Called by [`from_json`](Self::from_json); also useful for requests
    /// constructed programmatically.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.prompt.trim().is_empty() {
            return Err(invalid("prompt", "must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.strength) {
            return Err(invalid("strength", "must be in [0, 1]"));
        }
        if self.iterations == 0 {
            return Err(invalid("iterations", "must be at least 1"));
        }
        if self.steps == 0 {
            return Err(invalid("steps", "must be at least 1"));
        }
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if value == 0 || value % DIMENSION_ALIGNMENT != 0 {
                return Err(invalid(
                    name,
                    &format!("must be a positive multiple of {DIMENSION_ALIGNMENT}"),
                ));
            }
        }
        if self.cfg_scale <= 0.0 {
            return Err(invalid("cfgScale", "must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&self.face_restore_strength) {
            return Err(invalid("faceRestoreStrength", "must be in [0, 1]"));
        }
        if let Some(upscale) = self.upscale {
            if upscale.level == 0 {
                return Err(invalid("upscaleLevel", "must be at least 1"));
            }
            if upscale.level > MAX_UPSCALE_LEVEL {
                return Err(invalid(
                    "upscaleLevel",
                    &format!("must be at most {MAX_UPSCALE_LEVEL}"),
                ));
            }
            if !(0.0..=1.0).contains(&upscale.strength) {
                return Err(invalid("upscaleStrength", "must be in [0, 1]"));
            }
        }
        if self.seed < SEED_UNSET {
            return Err(invalid("seed", "must be -1 or a non-negative integer"));
        }
        Ok(())
    }

    /// Whether the seed still carries the [`SEED_UNSET`] sentinel.
    pub fn seed_is_unset(&self) -> bool {
        self.seed == SEED_UNSET
    }
}

// ---------------------------------------------------------------------------
// Lenient field extraction
// ---------------------------------------------------------------------------

fn missing(field: &str) -> CoreError {
    CoreError::Validation(format!("Missing required field '{field}'"))
}

fn invalid(field: &str, reason: &str) -> CoreError {
    CoreError::Validation(format!("Field '{field}' {reason}"))
}

/// Extract an f32 from a number or numeric string.
fn f32_field(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    default: Option<f32>,
) -> Result<f32, CoreError> {
    match obj.get(field) {
        None | Some(Value::Null) => default.ok_or_else(|| missing(field)),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(|f| f as f32)
            .ok_or_else(|| invalid(field, "must be a number")),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f32>()
            .map_err(|_| invalid(field, "must be a number")),
        Some(_) => Err(invalid(field, "must be a number")),
    }
}

/// Extract an i64 from a number or numeric string.
fn i64_field(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    default: Option<i64>,
) -> Result<i64, CoreError> {
    match obj.get(field) {
        None | Some(Value::Null) => default.ok_or_else(|| missing(field)),
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| invalid(field, "must be an integer")),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid(field, "must be an integer")),
        Some(_) => Err(invalid(field, "must be an integer")),
    }
}

/// Extract a u32 from a number or numeric string.
fn u32_field(
    obj: &serde_json::Map<String, Value>,
    field: &str,
    default: Option<u32>,
) -> Result<u32, CoreError> {
    let value = i64_field(obj, field, default.map(i64::from))?;
    u32::try_from(value).map_err(|_| invalid(field, "must be a non-negative integer"))
}

/// Extract a bool. Absent/null means false; the original UI sends the key
/// only when the checkbox is ticked.
fn bool_field(obj: &serde_json::Map<String, Value>, field: &str) -> Result<bool, CoreError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(invalid(field, "must be a boolean")),
    }
}

fn sampler_field(obj: &serde_json::Map<String, Value>) -> Result<Sampler, CoreError> {
    match obj.get("sampler") {
        Some(Value::String(s)) => s.parse(),
        Some(_) => Err(invalid("sampler", "must be a string")),
        None => Err(missing("sampler")),
    }
}

/// Parse the upscale pair. Present only when `upscaleLevel` is a nonzero,
/// non-empty value; `0` and `""` both mean "no upscaling" (the original
/// UI sends one of those when the option is off).
fn upscale_field(obj: &serde_json::Map<String, Value>) -> Result<Option<Upscale>, CoreError> {
    let level = match obj.get("upscaleLevel") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(_) => i64_field(obj, "upscaleLevel", None)?,
    };
    if level == 0 {
        return Ok(None);
    }
    let level =
        u32::try_from(level).map_err(|_| invalid("upscaleLevel", "must be a positive integer"))?;
    let strength = f32_field(obj, "upscaleStrength", Some(DEFAULT_UPSCALE_STRENGTH))?;
    Ok(Some(Upscale { level, strength }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
