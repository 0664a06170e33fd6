//! Decoding of engine responses.

use image::DynamicImage;
use serde::Deserialize;

use crate::imaging;
use crate::{ClientError, Result};

/// Raw engine response body. `images` is ordered; the first entry is the
/// primary result.
#[derive(Deserialize, Debug)]
pub struct GenerationResponse {
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub info: String,
}
impl GenerationResponse {
    /// Decodes the primary image. An absent or empty `images` list is a
    /// distinct condition from transport failures and from malformed image
    /// data: the engine answered, it just produced nothing.
    pub fn decode_first(&self) -> Result<DynamicImage> {
        let first = self.images.first().ok_or(ClientError::NoImageProduced)?;
        imaging::decode_base64_image(first)
    }

    pub(crate) fn into_result(self, preview: Option<DynamicImage>) -> Result<GenerationResult> {
        Ok(GenerationResult {
            image: self.decode_first()?,
            preview,
        })
    }
}

/// One finished generation: the decoded primary image plus an optional
/// auxiliary preview (the client-derived edge map) for display alongside it.
pub struct GenerationResult {
    pub image: DynamicImage,
    pub preview: Option<DynamicImage>,
}
