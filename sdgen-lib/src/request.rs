//! Request construction for the engine's txt2img/img2img endpoints.
//!
//! Builders validate and encode but never touch the network, so every
//! payload can be inspected offline.

use image::DynamicImage;
use serde::Serialize;

use crate::imaging;
use crate::{ClientError, Result};

pub const DEFAULT_SAMPLER: &str = "Euler a";

/// How strongly the conditioning image overrides the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlMode {
    #[default]
    Balanced,
    PromptImportant,
    ControlNetImportant,
}
impl ControlMode {
    /// The exact strings the ControlNet extension recognizes.
    fn as_str(self) -> &'static str {
        match self {
            Self::Balanced => "Balanced",
            Self::PromptImportant => "My prompt is more important",
            Self::ControlNetImportant => "ControlNet is more important",
        }
    }
}

/// Where the conditioning image comes from.
#[derive(Debug, Clone)]
pub enum ConditioningSource {
    /// A ready-made conditioning image (e.g. a pose skeleton), transmitted
    /// as-is with the unit's preprocessor module.
    Image(DynamicImage),
    /// Derive an edge map from the request's source image with the fixed
    /// Canny thresholds. Only valid for image-to-image requests.
    CannyFromSource,
}

/// One ControlNet conditioning unit. The `model` identifier must be the
/// exact string the engine reports from `controlnet/model_list`; it is
/// deployment-time configuration, not something this crate guesses.
#[derive(Debug, Clone)]
pub struct ControlNetUnit {
    pub source: ConditioningSource,
    pub module: String,
    pub model: String,
    pub weight: f32,
    pub control_mode: ControlMode,
}
impl ControlNetUnit {
    /// Unit carrying a precomputed conditioning image; no engine-side
    /// preprocessing (`module: "none"`).
    pub fn from_image(image: DynamicImage, model: impl Into<String>) -> Self {
        Self {
            source: ConditioningSource::Image(image),
            module: "none".to_owned(),
            model: model.into(),
            weight: 1.0,
            control_mode: ControlMode::default(),
        }
    }

    /// Unit whose conditioning image is derived client-side from the source
    /// image. The derived map is transmitted directly, so the engine-side
    /// module stays `"none"`.
    pub fn canny_from_source(model: impl Into<String>) -> Self {
        Self {
            source: ConditioningSource::CannyFromSource,
            module: "none".to_owned(),
            model: model.into(),
            weight: 1.0,
            control_mode: ControlMode::default(),
        }
    }

    pub fn with_weight(mut self, weight: f32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_control_mode(mut self, control_mode: ControlMode) -> Self {
        self.control_mode = control_mode;
        self
    }
}

/// `inpainting_fill` wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InpaintingFill {
    Fill,
    #[default]
    Original,
    LatentNoise,
    LatentNothing,
}
impl InpaintingFill {
    fn as_u32(self) -> u32 {
        match self {
            Self::Fill => 0,
            Self::Original => 1,
            Self::LatentNoise => 2,
            Self::LatentNothing => 3,
        }
    }
}

/// `resize_mode` wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeMode {
    #[default]
    JustResize,
    CropAndResize,
    ResizeAndFill,
}
impl ResizeMode {
    fn as_u32(self) -> u32 {
        match self {
            Self::JustResize => 0,
            Self::CropAndResize => 1,
            Self::ResizeAndFill => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextToImageRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub cfg_scale: f64,
    pub width: u32,
    pub height: u32,
    pub sampler_name: String,
    pub seed: Option<i64>,
    pub controlnet: Option<ControlNetUnit>,
}
impl Default for TextToImageRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            steps: 20,
            cfg_scale: 7.0,
            width: 512,
            height: 512,
            sampler_name: DEFAULT_SAMPLER.to_owned(),
            seed: None,
            controlnet: None,
        }
    }
}
impl TextToImageRequest {
    /// Builds the wire payload. Fails fast on invalid input so no doomed
    /// request ever reaches the engine.
    pub fn payload(&self) -> Result<TextToImagePayload> {
        validate_common(
            &self.prompt,
            self.steps,
            self.cfg_scale,
            self.width,
            self.height,
        )?;

        let alwayson_scripts = match &self.controlnet {
            Some(unit) => {
                let conditioning = match &unit.source {
                    ConditioningSource::Image(image) => {
                        check_dimensions("conditioning image", image, self.width, self.height)?;
                        image
                    }
                    ConditioningSource::CannyFromSource => {
                        return Err(ClientError::MissingImage(
                            "source image to derive an edge map from",
                        ))
                    }
                };
                Some(AlwaysOnScripts::controlnet(unit, conditioning)?)
            }
            None => None,
        };

        Ok(TextToImagePayload {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            steps: self.steps,
            cfg_scale: self.cfg_scale,
            width: self.width,
            height: self.height,
            sampler_name: self.sampler_name.clone(),
            seed: self.seed,
            alwayson_scripts,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ImageToImageRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub cfg_scale: f64,
    pub width: u32,
    pub height: u32,
    pub sampler_name: String,
    pub seed: Option<i64>,
    /// Source image the generation starts from.
    pub init_image: DynamicImage,
    /// Fraction of the process allowed to diverge from the source.
    pub denoising_strength: f64,
    /// Alpha-bearing overlay for inpainting; non-zero alpha marks the
    /// region to regenerate. Must match the source image's dimensions.
    pub mask_overlay: Option<DynamicImage>,
    pub mask_blur: u32,
    pub inpainting_fill: InpaintingFill,
    pub inpaint_full_res: bool,
    pub resize_mode: ResizeMode,
    pub controlnet: Option<ControlNetUnit>,
}
impl ImageToImageRequest {
    pub fn new(init_image: DynamicImage) -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            steps: 20,
            cfg_scale: 7.0,
            width: 512,
            height: 512,
            sampler_name: DEFAULT_SAMPLER.to_owned(),
            seed: None,
            init_image,
            denoising_strength: 0.75,
            mask_overlay: None,
            mask_blur: 4,
            inpainting_fill: InpaintingFill::default(),
            inpaint_full_res: false,
            resize_mode: ResizeMode::default(),
            controlnet: None,
        }
    }

    /// Builds the wire payload plus, when the conditioning image was derived
    /// from the source, the derived edge map for preview.
    pub fn payload(&self) -> Result<(ImageToImagePayload, Option<DynamicImage>)> {
        validate_common(
            &self.prompt,
            self.steps,
            self.cfg_scale,
            self.width,
            self.height,
        )?;
        if !(self.denoising_strength > 0.0) {
            return Err(ClientError::InvalidParameter("denoising_strength"));
        }

        let mask = match &self.mask_overlay {
            Some(overlay) => {
                check_dimensions(
                    "mask overlay",
                    overlay,
                    self.init_image.width(),
                    self.init_image.height(),
                )?;
                let mask = imaging::alpha_mask(overlay);
                if imaging::mask_is_empty(&mask) {
                    return Err(ClientError::EmptyMask);
                }
                Some(imaging::encode_png(&DynamicImage::ImageLuma8(mask))?)
            }
            None => None,
        };

        let mut preview = None;
        let alwayson_scripts = match &self.controlnet {
            Some(unit) => {
                let derived;
                let conditioning = match &unit.source {
                    ConditioningSource::Image(image) => {
                        check_dimensions("conditioning image", image, self.width, self.height)?;
                        image
                    }
                    ConditioningSource::CannyFromSource => {
                        check_dimensions("source image", &self.init_image, self.width, self.height)?;
                        derived = DynamicImage::ImageLuma8(imaging::edge_map(&self.init_image));
                        preview = Some(derived.clone());
                        &derived
                    }
                };
                Some(AlwaysOnScripts::controlnet(unit, conditioning)?)
            }
            None => None,
        };

        let payload = ImageToImagePayload {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            steps: self.steps,
            cfg_scale: self.cfg_scale,
            width: self.width,
            height: self.height,
            sampler_name: self.sampler_name.clone(),
            seed: self.seed,
            init_images: vec![imaging::encode_png(&self.init_image)?],
            denoising_strength: self.denoising_strength,
            resize_mode: self.resize_mode.as_u32(),
            mask_blur: mask.as_ref().map(|_| self.mask_blur),
            inpainting_fill: mask.as_ref().map(|_| self.inpainting_fill.as_u32()),
            inpaint_full_res: mask.as_ref().map(|_| self.inpaint_full_res),
            mask,
            alwayson_scripts,
        };
        Ok((payload, preview))
    }
}

fn validate_common(prompt: &str, steps: u32, cfg_scale: f64, width: u32, height: u32) -> Result<()> {
    if prompt.trim().is_empty() {
        return Err(ClientError::EmptyPrompt);
    }
    if steps == 0 {
        return Err(ClientError::InvalidParameter("steps"));
    }
    if !(cfg_scale > 0.0) {
        return Err(ClientError::InvalidParameter("cfg_scale"));
    }
    if width == 0 || height == 0 {
        return Err(ClientError::InvalidParameter("width/height"));
    }
    Ok(())
}

fn check_dimensions(
    field: &'static str,
    image: &DynamicImage,
    expected_width: u32,
    expected_height: u32,
) -> Result<()> {
    if image.width() != expected_width || image.height() != expected_height {
        return Err(ClientError::DimensionMismatch {
            field,
            actual_width: image.width(),
            actual_height: image.height(),
            expected_width,
            expected_height,
        });
    }
    Ok(())
}

#[derive(Serialize, Debug)]
pub struct TextToImagePayload {
    pub(crate) prompt: String,
    pub(crate) negative_prompt: String,
    pub(crate) steps: u32,
    pub(crate) cfg_scale: f64,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) sampler_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) alwayson_scripts: Option<AlwaysOnScripts>,
}

#[derive(Serialize, Debug)]
pub struct ImageToImagePayload {
    pub(crate) prompt: String,
    pub(crate) negative_prompt: String,
    pub(crate) steps: u32,
    pub(crate) cfg_scale: f64,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) sampler_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) seed: Option<i64>,
    pub(crate) init_images: Vec<String>,
    pub(crate) denoising_strength: f64,
    pub(crate) resize_mode: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) mask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) mask_blur: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) inpainting_fill: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) inpaint_full_res: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) alwayson_scripts: Option<AlwaysOnScripts>,
}

#[derive(Serialize, Debug)]
pub(crate) struct AlwaysOnScripts {
    controlnet: ControlNetScript,
}
impl AlwaysOnScripts {
    fn controlnet(unit: &ControlNetUnit, conditioning: &DynamicImage) -> Result<Self> {
        Ok(Self {
            controlnet: ControlNetScript {
                args: vec![ControlNetArgs {
                    image: imaging::encode_png(conditioning)?,
                    module: unit.module.clone(),
                    model: unit.model.clone(),
                    weight: unit.weight,
                    control_mode: unit.control_mode.as_str(),
                }],
            },
        })
    }
}

#[derive(Serialize, Debug)]
struct ControlNetScript {
    args: Vec<ControlNetArgs>,
}

#[derive(Serialize, Debug)]
struct ControlNetArgs {
    image: String,
    module: String,
    model: String,
    weight: f32,
    control_mode: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    const MODEL: &str = "control_v11p_sd15_canny [d14c016b]";

    fn solid_image(width: u32, height: u32, pixel: [u8; 4]) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba(pixel)))
    }

    fn textured_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
            if (x / 8 + y / 8) % 2 == 0 {
                Rgba([255, 255, 255, 255])
            } else {
                Rgba([0, 0, 0, 255])
            }
        }))
    }

    #[test]
    fn txt2img_payload_has_no_image_fields() {
        let request = TextToImageRequest {
            prompt: "a red shield".to_owned(),
            ..Default::default()
        };
        let body = serde_json::to_value(request.payload().unwrap()).unwrap();
        assert!(body.get("init_images").is_none());
        assert!(body.get("mask").is_none());
        assert!(body.get("alwayson_scripts").is_none());
        assert_eq!(body["prompt"], "a red shield");
        assert_eq!(body["steps"], 20);
        assert_eq!(body["width"], 512);
        assert_eq!(body["height"], 512);
        assert_eq!(body["sampler_name"], "Euler a");
    }

    #[test]
    fn empty_prompt_is_rejected_before_any_network_call() {
        let request = TextToImageRequest::default();
        assert!(matches!(request.payload(), Err(ClientError::EmptyPrompt)));

        let request = TextToImageRequest {
            prompt: "   ".to_owned(),
            ..Default::default()
        };
        assert!(matches!(request.payload(), Err(ClientError::EmptyPrompt)));
    }

    #[test]
    fn non_positive_parameters_are_rejected() {
        let request = TextToImageRequest {
            prompt: "knight".to_owned(),
            steps: 0,
            ..Default::default()
        };
        assert!(matches!(
            request.payload(),
            Err(ClientError::InvalidParameter("steps"))
        ));

        let request = TextToImageRequest {
            prompt: "knight".to_owned(),
            cfg_scale: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            request.payload(),
            Err(ClientError::InvalidParameter("cfg_scale"))
        ));
    }

    #[test]
    fn controlnet_args_ride_under_alwayson_scripts() {
        let pose = solid_image(512, 512, [0, 0, 0, 255]);
        let request = TextToImageRequest {
            prompt: "1 character, full body".to_owned(),
            controlnet: Some(
                ControlNetUnit::from_image(pose, MODEL)
                    .with_control_mode(ControlMode::ControlNetImportant),
            ),
            ..Default::default()
        };
        let body = serde_json::to_value(request.payload().unwrap()).unwrap();
        let args = &body["alwayson_scripts"]["controlnet"]["args"];
        assert_eq!(args.as_array().unwrap().len(), 1);
        assert_eq!(args[0]["model"], MODEL);
        assert_eq!(args[0]["module"], "none");
        assert_eq!(args[0]["weight"], 1.0);
        assert_eq!(args[0]["control_mode"], "ControlNet is more important");
        assert!(args[0]["image"].as_str().unwrap().len() > 0);
    }

    #[test]
    fn conditioning_image_must_match_output_dimensions() {
        let pose = solid_image(256, 256, [0, 0, 0, 255]);
        let request = TextToImageRequest {
            prompt: "knight".to_owned(),
            controlnet: Some(ControlNetUnit::from_image(pose, MODEL)),
            ..Default::default()
        };
        assert!(matches!(
            request.payload(),
            Err(ClientError::DimensionMismatch {
                field: "conditioning image",
                ..
            })
        ));
    }

    #[test]
    fn txt2img_cannot_derive_edges_without_a_source() {
        let request = TextToImageRequest {
            prompt: "knight".to_owned(),
            controlnet: Some(ControlNetUnit::canny_from_source(MODEL)),
            ..Default::default()
        };
        assert!(matches!(request.payload(), Err(ClientError::MissingImage(_))));
    }

    #[test]
    fn img2img_payload_carries_source_image() {
        let mut request = ImageToImageRequest::new(textured_image(512, 512));
        request.prompt = "a walking knight sprite".to_owned();
        let (payload, preview) = request.payload().unwrap();
        assert!(preview.is_none());

        let body = serde_json::to_value(payload).unwrap();
        assert_eq!(body["init_images"].as_array().unwrap().len(), 1);
        assert_eq!(body["denoising_strength"], 0.75);
        assert_eq!(body["resize_mode"], 0);
        assert!(body.get("mask").is_none());
        assert!(body.get("mask_blur").is_none());
        assert!(body.get("inpainting_fill").is_none());
    }

    #[test]
    fn derived_canny_conditioning_is_deterministic_and_previewed() {
        let mut request = ImageToImageRequest::new(textured_image(512, 512));
        request.prompt = "a walking knight sprite".to_owned();
        request.controlnet = Some(ControlNetUnit::canny_from_source(MODEL));

        let (first, preview) = request.payload().unwrap();
        let (second, _) = request.payload().unwrap();

        let first = serde_json::to_value(first).unwrap();
        let second = serde_json::to_value(second).unwrap();
        assert_eq!(
            first["alwayson_scripts"]["controlnet"]["args"][0]["image"],
            second["alwayson_scripts"]["controlnet"]["args"][0]["image"]
        );

        let preview = preview.expect("derived edge map should be previewed");
        let expected = imaging::encode_png(&preview).unwrap();
        assert_eq!(
            first["alwayson_scripts"]["controlnet"]["args"][0]["image"],
            serde_json::Value::String(expected)
        );
    }

    #[test]
    fn inpainting_fields_appear_only_with_a_mask() {
        let mut overlay = RgbaImage::from_pixel(512, 512, Rgba([0, 0, 0, 0]));
        for x in 100..200 {
            for y in 100..200 {
                overlay.put_pixel(x, y, Rgba([255, 0, 0, 255]));
            }
        }
        let mut request = ImageToImageRequest::new(textured_image(512, 512));
        request.prompt = "replace the shield".to_owned();
        request.mask_overlay = Some(DynamicImage::ImageRgba8(overlay));
        request.inpaint_full_res = true;

        let (payload, _) = request.payload().unwrap();
        let body = serde_json::to_value(payload).unwrap();
        assert!(body["mask"].as_str().unwrap().len() > 0);
        assert_eq!(body["mask_blur"], 4);
        assert_eq!(body["inpainting_fill"], 1);
        assert_eq!(body["inpaint_full_res"], true);
    }

    #[test]
    fn all_transparent_mask_is_rejected() {
        let mut request = ImageToImageRequest::new(textured_image(512, 512));
        request.prompt = "replace the shield".to_owned();
        request.mask_overlay = Some(solid_image(512, 512, [255, 255, 255, 0]));
        assert!(matches!(request.payload(), Err(ClientError::EmptyMask)));
    }

    #[test]
    fn mask_must_match_source_dimensions() {
        let mut request = ImageToImageRequest::new(textured_image(512, 512));
        request.prompt = "replace the shield".to_owned();
        request.mask_overlay = Some(solid_image(256, 256, [255, 0, 0, 255]));
        assert!(matches!(
            request.payload(),
            Err(ClientError::DimensionMismatch {
                field: "mask overlay",
                ..
            })
        ));
    }
}
