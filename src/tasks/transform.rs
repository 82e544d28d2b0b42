// Remote image transform interface
// The task manager is written against the ImageTransform trait; the shipped
// implementation talks to fal.ai. Implementations must observe the cancel
// token between phases and abandon in-flight work when it fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db::store::Store;

// fal.ai model endpoints
pub const FAL_COLORIZE: &str = "fal-ai/ddcolor";
pub const FAL_CLARITY_UPSCALE: &str = "fal-ai/clarity-upscaler";
pub const FAL_ESRGAN: &str = "fal-ai/esrgan";
pub const FAL_CREATIVE_UPSCALE: &str = "fal-ai/creative-upscaler";
pub const FAL_RESTORE: &str = "fal-ai/image-apps-v2/photo-restoration";
pub const FAL_CODEFORMER: &str = "fal-ai/codeformer";
pub const FAL_FLUX2_EDIT: &str = "fal-ai/flux-2/turbo/edit";
pub const FAL_FLUX2_PRO_EDIT: &str = "fal-ai/flux-2-pro/edit";
pub const FAL_FLUX1_DEV_EDIT: &str = "fal-ai/flux/dev/image-to-image";
pub const FAL_VECTORIZE: &str = "fal-ai/recraft/vectorize";

const TRANSFORM_TIMEOUT_SECS: u64 = 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    Colorize,
    Upscale,
    Restore,
    Edit,
    Vectorize,
}

impl std::fmt::Display for TransformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransformKind::Colorize => "colorize",
            TransformKind::Upscale => "upscale",
            TransformKind::Restore => "restore",
            TransformKind::Edit => "edit",
            TransformKind::Vectorize => "vectorize",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformOptions {
    pub task: TransformKind,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub strength: f64,
    #[serde(default)]
    pub fix_colors: bool,
    #[serde(default)]
    pub remove_scratches: bool,
}

#[derive(Debug)]
pub struct TransformedImage {
    pub data: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug)]
pub enum TransformError {
    /// The cancel token fired; the item must not be recorded as a result.
    Cancelled,
    Failed(String),
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransformError::Cancelled => write!(f, "cancelled"),
            TransformError::Failed(msg) => write!(f, "{}", msg),
        }
    }
}

/// Cancellation-aware remote transform over a base64 data URI.
pub trait ImageTransform: Send + Sync {
    fn transform(
        &self,
        cancel: &Arc<AtomicBool>,
        image_data_uri: &str,
        options: &TransformOptions,
    ) -> Result<TransformedImage, TransformError>;
}

/// Model metadata for task pickers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub description: String,
}

pub fn available_models() -> Vec<(TransformKind, Vec<ModelInfo>)> {
    let model = |id: &str, name: &str, description: &str| ModelInfo {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
    };
    vec![
        (
            TransformKind::Colorize,
            vec![model(FAL_COLORIZE, "DDColor", "Automatic colorization")],
        ),
        (
            TransformKind::Upscale,
            vec![
                model(FAL_CLARITY_UPSCALE, "Clarity Upscaler", "High-fidelity upscaling (default)"),
                model(FAL_ESRGAN, "ESRGAN", "Fast 4x upscaling"),
                model(FAL_CREATIVE_UPSCALE, "Creative Upscaler", "AI-enhanced with prompt support"),
            ],
        ),
        (
            TransformKind::Restore,
            vec![
                model(FAL_RESTORE, "Photo Restoration", "Fix scratches, colors, resolution (default)"),
                model(FAL_CODEFORMER, "CodeFormer", "Face & image restoration"),
            ],
        ),
        (
            TransformKind::Edit,
            vec![
                model(FAL_FLUX2_EDIT, "FLUX.2 Turbo", "Fast text-guided editing (default)"),
                model(FAL_FLUX2_PRO_EDIT, "FLUX.2 Pro", "Professional quality editing"),
                model(FAL_FLUX1_DEV_EDIT, "FLUX.1 Dev", "Development model with strength control"),
            ],
        ),
    ]
}

#[derive(Debug, Deserialize)]
struct FalImage {
    url: String,
    #[serde(default)]
    content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FalResponse {
    #[serde(default)]
    image: Option<FalImage>,
    #[serde(default)]
    images: Vec<FalImage>,
    /// Error message from the content checker or other issues
    #[serde(default, rename = "msg")]
    message: Option<String>,
}

/// fal.ai-backed implementation of ImageTransform. The credential is read
/// from settings per call, so a key configured after startup takes effect
/// without a restart.
pub struct FalClient {
    store: Arc<Store>,
    client: reqwest::blocking::Client,
}

impl FalClient {
    pub fn new(store: Arc<Store>) -> Result<FalClient, String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(TRANSFORM_TIMEOUT_SECS))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(FalClient { store, client })
    }

    fn api_key(&self) -> Result<String, TransformError> {
        let key = self
            .store
            .get_setting(crate::constants::FAL_API_KEY_SETTING)
            .ok()
            .flatten()
            .unwrap_or_default();
        if key.is_empty() {
            return Err(TransformError::Failed("fal.ai API key not configured".into()));
        }
        Ok(key)
    }

    fn call_api(
        &self,
        cancel: &Arc<AtomicBool>,
        model: &str,
        payload: serde_json::Value,
    ) -> Result<FalResponse, TransformError> {
        if cancel.load(Ordering::Relaxed) {
            return Err(TransformError::Cancelled);
        }

        let api_key = self.api_key()?;
        let url = format!("https://fal.run/{}", model);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Key {}", api_key))
            .json(&payload)
            .send()
            .map_err(|e| {
                if cancel.load(Ordering::Relaxed) {
                    TransformError::Cancelled
                } else {
                    TransformError::Failed(format!("request failed: {}", e))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| TransformError::Failed(format!("failed to read response: {}", e)))?;
        if !status.is_success() {
            return Err(TransformError::Failed(format!(
                "API error (status {}): {}",
                status.as_u16(),
                body
            )));
        }

        let parsed: FalResponse = serde_json::from_str(&body)
            .map_err(|e| TransformError::Failed(format!("failed to parse response: {}", e)))?;
        if let Some(message) = &parsed.message {
            if !message.is_empty() {
                return Err(TransformError::Failed(message.clone()));
            }
        }
        Ok(parsed)
    }

    fn request_payload(
        image_data_uri: &str,
        options: &TransformOptions,
    ) -> Result<(String, serde_json::Value), TransformError> {
        let model = options.model.as_str();
        let payload = match options.task {
            TransformKind::Colorize => (
                FAL_COLORIZE.to_string(),
                json!({ "image_url": image_data_uri }),
            ),
            TransformKind::Upscale => match model {
                FAL_CLARITY_UPSCALE | "" => (
                    FAL_CLARITY_UPSCALE.to_string(),
                    json!({
                        "image_url": image_data_uri,
                        "prompt": "masterpiece, best quality, highres",
                        "negative_prompt": "(worst quality, low quality, normal quality:2)",
                        "enable_safety_checker": false,
                    }),
                ),
                FAL_ESRGAN => (
                    FAL_ESRGAN.to_string(),
                    json!({
                        "image_url": image_data_uri,
                        "scale": 4,
                        "model": "RealESRGAN_x4plus",
                    }),
                ),
                FAL_CREATIVE_UPSCALE => (
                    FAL_CREATIVE_UPSCALE.to_string(),
                    json!({ "image_url": image_data_uri }),
                ),
                other => {
                    return Err(TransformError::Failed(format!(
                        "unknown upscale model: {}",
                        other
                    )))
                }
            },
            TransformKind::Restore => match model {
                FAL_RESTORE | "" => (
                    FAL_RESTORE.to_string(),
                    json!({
                        "image_url": image_data_uri,
                        "enhance_resolution": true,
                        "fix_colors": options.fix_colors,
                        "remove_scratches": options.remove_scratches,
                        "enable_safety_checker": false,
                    }),
                ),
                FAL_CODEFORMER => (
                    FAL_CODEFORMER.to_string(),
                    json!({ "image_url": image_data_uri }),
                ),
                other => {
                    return Err(TransformError::Failed(format!(
                        "unknown restore model: {}",
                        other
                    )))
                }
            },
            TransformKind::Edit => {
                if options.prompt.is_empty() {
                    return Err(TransformError::Failed("prompt required for edit task".into()));
                }
                match model {
                    FAL_FLUX2_EDIT | "" => (
                        FAL_FLUX2_EDIT.to_string(),
                        json!({
                            "image_urls": [image_data_uri],
                            "prompt": options.prompt,
                            "guidance_scale": 2.5,
                            "safety_tolerance": 6,
                        }),
                    ),
                    FAL_FLUX2_PRO_EDIT => (
                        FAL_FLUX2_PRO_EDIT.to_string(),
                        json!({
                            "image_urls": [image_data_uri],
                            "prompt": options.prompt,
                            "guidance_scale": 2.5,
                            "safety_tolerance": 6,
                        }),
                    ),
                    FAL_FLUX1_DEV_EDIT => {
                        let strength = if options.strength == 0.0 { 0.75 } else { options.strength };
                        (
                            FAL_FLUX1_DEV_EDIT.to_string(),
                            json!({
                                "image_url": image_data_uri,
                                "prompt": options.prompt,
                                "strength": strength,
                                "num_inference_steps": 40,
                                "guidance_scale": 3.5,
                                "safety_tolerance": 6,
                            }),
                        )
                    }
                    other => {
                        return Err(TransformError::Failed(format!(
                            "unknown edit model: {}",
                            other
                        )))
                    }
                }
            }
            TransformKind::Vectorize => (
                FAL_VECTORIZE.to_string(),
                json!({ "image_url": image_data_uri }),
            ),
        };
        Ok(payload)
    }

    fn download_image(
        &self,
        cancel: &Arc<AtomicBool>,
        url: &str,
    ) -> Result<TransformedImage, TransformError> {
        if cancel.load(Ordering::Relaxed) {
            return Err(TransformError::Cancelled);
        }

        let response = self.client.get(url).send().map_err(|e| {
            if cancel.load(Ordering::Relaxed) {
                TransformError::Cancelled
            } else {
                TransformError::Failed(format!("failed to download: {}", e))
            }
        })?;

        if !response.status().is_success() {
            return Err(TransformError::Failed(format!(
                "download failed with status {}",
                response.status().as_u16()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|ct| !ct.is_empty())
            .unwrap_or("image/png")
            .to_string();

        let data = response
            .bytes()
            .map_err(|e| TransformError::Failed(format!("failed to read image: {}", e)))?
            .to_vec();

        Ok(TransformedImage { data, content_type })
    }
}

impl ImageTransform for FalClient {
    fn transform(
        &self,
        cancel: &Arc<AtomicBool>,
        image_data_uri: &str,
        options: &TransformOptions,
    ) -> Result<TransformedImage, TransformError> {
        let (model, payload) = Self::request_payload(image_data_uri, options)?;
        let response = self.call_api(cancel, &model, payload)?;

        let image = response
            .images
            .into_iter()
            .next()
            .or(response.image)
            .ok_or_else(|| TransformError::Failed("no image URL returned from API".into()))?;
        if image.url.is_empty() {
            return Err(TransformError::Failed("no image URL returned from API".into()));
        }

        let mut result = self.download_image(cancel, &image.url)?;
        if let Some(ct) = image.content_type {
            if !ct.is_empty() {
                result.content_type = ct;
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_requires_prompt() {
        let options = TransformOptions {
            task: TransformKind::Edit,
            model: String::new(),
            prompt: String::new(),
            strength: 0.0,
            fix_colors: false,
            remove_scratches: false,
        };
        let err = FalClient::request_payload("data:image/png;base64,AAAA", &options).unwrap_err();
        assert!(err.to_string().contains("prompt required"));
    }

    #[test]
    fn test_unknown_model_rejected() {
        let options = TransformOptions {
            task: TransformKind::Upscale,
            model: "fal-ai/does-not-exist".into(),
            prompt: String::new(),
            strength: 0.0,
            fix_colors: false,
            remove_scratches: false,
        };
        let err = FalClient::request_payload("data:image/png;base64,AAAA", &options).unwrap_err();
        assert!(err.to_string().contains("unknown upscale model"));
    }

    #[test]
    fn test_available_models_catalog() {
        let catalog = available_models();
        assert_eq!(catalog.len(), 4);
        for (task, models) in &catalog {
            assert!(!models.is_empty(), "no models listed for {}", task);
        }

        // The first model per task is the default the client falls back to
        let upscale = catalog
            .iter()
            .find(|(task, _)| *task == TransformKind::Upscale)
            .map(|(_, models)| models)
            .unwrap();
        assert_eq!(upscale[0].id, FAL_CLARITY_UPSCALE);

        let colorize = catalog
            .iter()
            .find(|(task, _)| *task == TransformKind::Colorize)
            .map(|(_, models)| models)
            .unwrap();
        assert_eq!(colorize[0].id, FAL_COLORIZE);
    }

    #[test]
    fn test_default_models_per_task() {
        let options = TransformOptions {
            task: TransformKind::Upscale,
            model: String::new(),
            prompt: String::new(),
            strength: 0.0,
            fix_colors: false,
            remove_scratches: false,
        };
        let (model, _) = FalClient::request_payload("data:x;base64,AAAA", &options).unwrap();
        assert_eq!(model, FAL_CLARITY_UPSCALE);
    }
}
