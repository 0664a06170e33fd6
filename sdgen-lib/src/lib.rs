//! Client library for Stable Diffusion Web UI-style generation engines.
//!
//! Talks to an engine exposing the `sdapi/v1` txt2img/img2img endpoints and
//! the ControlNet extension. Request construction and response decoding are
//! pure and separately testable; only [`Client`] performs network I/O.

use std::collections::HashMap;
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub mod imaging;
pub mod refine;
mod request;
mod response;

pub use refine::PromptRefiner;
pub use request::{
    ConditioningSource, ControlMode, ControlNetUnit, ImageToImagePayload, ImageToImageRequest,
    InpaintingFill, ResizeMode, TextToImagePayload, TextToImageRequest, DEFAULT_SAMPLER,
};
pub use response::{GenerationResponse, GenerationResult};

/// Wait ceiling for one generation call. Generation on slow hardware can
/// take minutes; the engine is given ten before the call is abandoned.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid url; make sure it starts with http")]
    InvalidUrl,
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("{0} must be positive")]
    InvalidParameter(&'static str),
    #[error("missing required image: {0}")]
    MissingImage(&'static str),
    #[error("{field} is {actual_width}x{actual_height}, expected {expected_width}x{expected_height}")]
    DimensionMismatch {
        field: &'static str,
        actual_width: u32,
        actual_height: u32,
        expected_width: u32,
        expected_height: u32,
    },
    #[error("mask selects no pixels; paint the region to edit with non-zero alpha")]
    EmptyMask,
    #[error("engine request failed; check that the engine is running with its API enabled")]
    ReqwestError(#[from] reqwest::Error),
    #[error("serde json error")]
    SerdeJsonError(#[from] serde_json::Error),
    #[error("image codec error")]
    ImageError(#[from] image::ImageError),
    #[error("base64 decode error")]
    Base64Error(#[from] data_encoding::DecodeError),
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("invalid response body (expected {expected:?})")]
    InvalidResponse { expected: String },
    #[error("the engine produced no image")]
    NoImageProduced,
}
impl ClientError {
    fn invalid_response(expected: &str) -> Self {
        Self::InvalidResponse {
            expected: expected.to_string(),
        }
    }
}
pub type Result<T> = core::result::Result<T, ClientError>;

pub struct Client {
    url: String,
    client: reqwest::Client,
}
impl Client {
    pub async fn new(url: &str, authentication: Option<(&str, &str)>) -> Result<Self> {
        if !url.starts_with("http") {
            return Err(ClientError::InvalidUrl);
        }

        let url = url.strip_suffix('/').unwrap_or(url).to_owned();
        let client = reqwest::ClientBuilder::new()
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let mut body = HashMap::new();
        if let Some((username, password)) = authentication {
            body.insert("username", username);
            body.insert("password", password);
        }
        client
            .post(format!("{url}/login"))
            .form(&body)
            .send()
            .await?
            .text()
            .await?;

        Ok(Self { url, client })
    }

    fn check_for_authentication<R: DeserializeOwned>(body: String) -> Result<R> {
        let json_body: HashMap<String, serde_json::Value> = serde_json::from_str(&body)?;
        match json_body.get("detail") {
            Some(serde_json::Value::String(payload)) if payload == "Not authenticated" => {
                Err(ClientError::NotAuthenticated)
            }
            _ => Ok(serde_json::from_str(&body)?),
        }
    }

    async fn get<R: DeserializeOwned>(&self, endpoint: &str) -> Result<R> {
        Self::check_for_authentication(
            self.client
                .get(format!("{}/{}", self.url, endpoint))
                .send()
                .await?
                .text()
                .await?,
        )
    }

    async fn post<R: DeserializeOwned, T: Serialize>(&self, endpoint: &str, body: &T) -> Result<R> {
        Self::check_for_authentication(
            self.client
                .post(format!("{}/{}", self.url, endpoint))
                .json(body)
                .send()
                .await?
                .text()
                .await?,
        )
    }

    /// Generates an image from text alone. One blocking call, no retries;
    /// a failed attempt is surfaced to the caller as-is.
    pub async fn txt2img(&self, request: &TextToImageRequest) -> Result<GenerationResult> {
        let payload = request.payload()?;
        tracing::debug!(
            steps = request.steps,
            width = request.width,
            height = request.height,
            "dispatching txt2img request"
        );
        let response: GenerationResponse = self.post("sdapi/v1/txt2img", &payload).await?;
        response.into_result(None)
    }

    /// Generates a variation of a source image, optionally constrained by a
    /// mask (inpainting) and/or a ControlNet conditioning image. When the
    /// conditioning image was derived from the source, the derived edge map
    /// is returned alongside the result as a preview.
    pub async fn img2img(&self, request: &ImageToImageRequest) -> Result<GenerationResult> {
        let (payload, preview) = request.payload()?;
        tracing::debug!(
            steps = request.steps,
            denoising_strength = request.denoising_strength,
            inpainting = request.mask_overlay.is_some(),
            "dispatching img2img request"
        );
        let response: GenerationResponse = self.post("sdapi/v1/img2img", &payload).await?;
        response.into_result(preview)
    }

    /// Lists the conditioning-model identifiers the engine has installed.
    /// The exact string (e.g. `control_v11p_sd15_canny [d14c016b]`) must be
    /// passed verbatim in [`ControlNetUnit::model`].
    pub async fn controlnet_model_list(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct ModelList {
            model_list: Option<Vec<String>>,
        }
        let list: ModelList = self.get("controlnet/model_list").await?;
        list.model_list
            .ok_or_else(|| ClientError::invalid_response("model_list"))
    }
}
