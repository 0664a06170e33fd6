//! Image transport encoding and deterministic derivations.
//!
//! Everything the engine sees is PNG inside base64, so no pixel value is
//! ever altered by re-compression on the way out or back.

use std::io::Cursor;

use data_encoding::BASE64;
use image::{DynamicImage, GrayImage, ImageOutputFormat, Luma};
use imageproc::edges::canny;

use crate::Result;

/// Canny hysteresis thresholds. Fixed so that the same source always yields
/// the same edge map.
pub const CANNY_LOW: f32 = 100.0;
pub const CANNY_HIGH: f32 = 200.0;

/// Losslessly serializes an image for transmission: PNG bytes, base64-encoded.
pub fn encode_png(image: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)?;
    Ok(BASE64.encode(&bytes))
}

/// Decodes a base64 image field from an engine response. Tolerates an
/// optional `data:image/...;base64,` prefix, which some engine builds emit.
pub fn decode_base64_image(data: &str) -> Result<DynamicImage> {
    let data = match data.split_once(',') {
        Some((head, rest)) if head.starts_with("data:") => rest,
        _ => data,
    };
    let bytes = BASE64.decode(data.as_bytes())?;
    Ok(image::load_from_memory(&bytes)?)
}

/// Derives a single-channel edge map from a source image. Pure and
/// deterministic: the thresholds are fixed, so identical input pixels always
/// produce byte-identical output.
pub fn edge_map(image: &DynamicImage) -> GrayImage {
    canny(&image.to_luma8(), CANNY_LOW, CANNY_HIGH)
}

/// Derives a binary inpainting mask from an overlay's alpha channel. Pixels
/// with non-zero alpha are "to be edited" (255), everything else 0.
pub fn alpha_mask(overlay: &DynamicImage) -> GrayImage {
    let rgba = overlay.to_rgba8();
    GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        if rgba.get_pixel(x, y)[3] != 0 {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    })
}

pub(crate) fn mask_is_empty(mask: &GrayImage) -> bool {
    mask.pixels().all(|p| p[0] == 0)
}
