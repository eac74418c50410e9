//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! The image engine: decoding and validation, the luminance histogram,
//! in-place histogram equalization, dominant-color classification, and
//! encoding of the processed results.
//!
//! Classification runs on the pixels as uploaded; equalization happens
//! afterwards and only the equalized pixels are written out. The dominant
//! color is the channel whose image-wide mean beats each of the other two by
//! strictly more than `COLOR_MARGIN`; anything less decisive is "undefined"
//! and grayscale images are always undefined.

use std::{
    borrow::Cow,
    fs,
    io::BufWriter,
    path::{Path, PathBuf},
};
use anyhow::{Result, Context};
use image::{
    ImageEncoder, ImageFormat, ExtendedColorType,
    codecs::{jpeg::JpegEncoder, png::PngEncoder},
};
use crate::{
    config::Config,
    log_warning,
    util::file_extension,
};

pub const MAX_DIMENSION: u32 = 10_000;

/// Minimum lead (exclusive) a channel mean needs over both others.
const COLOR_MARGIN: i64 = 20;

const JPEG_QUALITY: u8 = 90;

/// Decoded pixels in their source channel layout: 1 = gray, 2 = gray+alpha,
/// 3 = RGB, 4 = RGBA. Row-major, interleaved, 8 bits per sample.
pub struct PixelBuf {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predominant {
    Undefined,
    Red,
    Green,
    Blue,
}

impl Predominant {
    pub fn name(self) -> &'static str {
        match self {
            Predominant::Undefined => "undefined",
            Predominant::Red => "red",
            Predominant::Green => "green",
            Predominant::Blue => "blue",
        }
    }
}

/// Everything the worker needs to build the success response.
pub struct ProcessedImageInfo {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub predominant_color: Predominant,
    pub equalized_path: PathBuf,
    pub classified_path: Option<PathBuf>,
}

/// Decodes and validates an uploaded image. Accepts JPEG, PNG, and GIF;
/// anything else fails, as do out-of-range dimensions or channel counts.
pub fn decode(bytes: &[u8]) -> Result<PixelBuf> {
    let format = image::guess_format(bytes).context("Unrecognized image data")?;
    ensure!(matches!(format, ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Gif),
            "Unsupported image format {:?}", format);

    let img = image::load_from_memory_with_format(bytes, format)
        .context("Failed to decode image")?;

    let (width, height) = (img.width(), img.height());
    ensure!(width >= 1 && width <= MAX_DIMENSION && height >= 1 && height <= MAX_DIMENSION,
            "Invalid image dimensions {}x{}", width, height);

    let channels = img.color().channel_count();
    ensure!(channels >= 1 && channels <= 4, "Invalid channel count {}", channels);

    let data = match channels {
        1 => img.into_luma8().into_raw(),
        2 => img.into_luma_alpha8().into_raw(),
        3 => img.into_rgb8().into_raw(),
        _ => img.into_rgba8().into_raw(),
    };

    Ok(PixelBuf { data, width, height, channels })
}

fn luminance(r: u8, g: u8, b: u8) -> u8 {
    let y = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
    y.round().clamp(0.0, 255.0) as u8
}

/// Luminance histogram for color images, plain value histogram for gray.
pub fn histogram(buf: &PixelBuf) -> [u32; 256] {
    let mut hist = [0u32; 256];
    let channels = buf.channels as usize;

    for px in buf.data.chunks_exact(channels) {
        let y = if channels >= 3 { luminance(px[0], px[1], px[2]) } else { px[0] };
        hist[y as usize] += 1;
    }
    hist
}

/// Equalizes the histogram in place. Color channels are remapped through the
/// shared luminance LUT independently; an alpha channel passes through.
pub fn equalize(buf: &mut PixelBuf) {
    let hist = histogram(buf);
    let total_pixels = buf.width as u64 * buf.height as u64;

    // LUT[i] = (cdf[i] * 255) / total, in integer arithmetic. This maps the
    // highest occupied bin to exactly 255.
    let mut lut = [0u8; 256];
    let mut cumulative: u64 = 0;
    for (i, count) in hist.iter().enumerate() {
        cumulative += *count as u64;
        lut[i] = ((cumulative * 255) / total_pixels) as u8;
    }

    let channels = buf.channels as usize;
    for px in buf.data.chunks_exact_mut(channels) {
        if channels >= 3 {
            px[0] = lut[px[0] as usize];
            px[1] = lut[px[1] as usize];
            px[2] = lut[px[2] as usize];
        } else {
            px[0] = lut[px[0] as usize];
        }
    }
}

/// Classifies the dominant color from per-channel means. Computed on the
/// original pixels, so call this before `equalize()`.
pub fn predominant_color(buf: &PixelBuf) -> Predominant {
    if buf.channels < 3 {
        return Predominant::Undefined;
    }

    let channels = buf.channels as usize;
    let (mut red_sum, mut green_sum, mut blue_sum) = (0u64, 0u64, 0u64);
    for px in buf.data.chunks_exact(channels) {
        red_sum += px[0] as u64;
        green_sum += px[1] as u64;
        blue_sum += px[2] as u64;
    }

    let total_pixels = buf.width as u64 * buf.height as u64;
    let red = (red_sum / total_pixels) as i64;
    let green = (green_sum / total_pixels) as i64;
    let blue = (blue_sum / total_pixels) as i64;

    if red > green && red > blue && red - green > COLOR_MARGIN && red - blue > COLOR_MARGIN {
        Predominant::Red
    } else if green > red && green > blue && green - red > COLOR_MARGIN && green - blue > COLOR_MARGIN {
        Predominant::Green
    } else if blue > red && blue > green && blue - red > COLOR_MARGIN && blue - green > COLOR_MARGIN {
        Predominant::Blue
    } else {
        Predominant::Undefined
    }
}

/// `photo.jpg` + `equalized` -> `photo_equalized.jpg`. Without an extension
/// the output falls back to `.jpg`.
pub fn derive_filename(original: &str, suffix: &str) -> String {
    match original.rfind('.') {
        Some(pos) => format!("{}_{}{}", &original[..pos], suffix, &original[pos..]),
        None => format!("{}_{}.jpg", original, suffix),
    }
}

/// Encodes `buf` at `path`. The *original* filename's extension picks the
/// codec: `.png`/`.PNG` mean PNG, everything else JPEG at quality 90.
pub fn encode_to(buf: &PixelBuf, path: &Path, original_filename: &str) -> Result<()> {
    let file = fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let ext = file_extension(original_filename);
    if ext == Some(".png") || ext == Some(".PNG") {
        let color = match buf.channels {
            1 => ExtendedColorType::L8,
            2 => ExtendedColorType::La8,
            3 => ExtendedColorType::Rgb8,
            _ => ExtendedColorType::Rgba8,
        };
        PngEncoder::new(&mut writer)
            .write_image(&buf.data, buf.width, buf.height, color)
            .with_context(|| format!("Failed to encode PNG {}", path.display()))?;
    } else {
        // JPEG has no alpha; drop it before encoding.
        let channels = buf.channels as usize;
        let (data, color): (Cow<[u8]>, _) = match buf.channels {
            1 => (Cow::Borrowed(&buf.data[..]), ExtendedColorType::L8),
            3 => (Cow::Borrowed(&buf.data[..]), ExtendedColorType::Rgb8),
            2 => (Cow::Owned(buf.data.chunks_exact(channels).map(|px| px[0]).collect()),
                  ExtendedColorType::L8),
            _ => (Cow::Owned(buf.data.chunks_exact(channels)
                                .flat_map(|px| [px[0], px[1], px[2]])
                                .collect()),
                  ExtendedColorType::Rgb8),
        };
        JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
            .write_image(&data, buf.width, buf.height, color)
            .with_context(|| format!("Failed to encode JPEG {}", path.display()))?;
    }

    Ok(())
}

/// Full pipeline for one upload: decode from the temp file, classify, then
/// equalize and write the outputs. The equalized image always lands in the
/// processed directory; a classified copy additionally lands in its color
/// directory when classification is decisive.
pub fn process_image(temp_path: &Path, original_filename: &str, config: &Config)
    -> Result<ProcessedImageInfo>
{
    let bytes = fs::read(temp_path)
        .with_context(|| format!("Failed to read {}", temp_path.display()))?;
    let mut buf = decode(&bytes)?;

    let predominant = predominant_color(&buf);
    equalize(&mut buf);

    let equalized_path = config.processed_path
        .join(derive_filename(original_filename, "equalized"));
    encode_to(&buf, &equalized_path, original_filename)?;

    let classified_path = if predominant != Predominant::Undefined {
        let color_dir = match predominant {
            Predominant::Red => &config.red_path,
            Predominant::Green => &config.green_path,
            _ => &config.blue_path,
        };
        let path = color_dir.join(derive_filename(original_filename, predominant.name()));
        match encode_to(&buf, &path, original_filename) {
            Ok(()) => Some(path),
            Err(e) => {
                // The classified copy is best-effort; the upload already
                // succeeded once the equalized image is on disk.
                log_warning!("Failed to write classified copy {}: {:#}", path.display(), e);
                None
            }
        }
    } else {
        None
    };

    Ok(ProcessedImageInfo {
        width: buf.width,
        height: buf.height,
        channels: buf.channels,
        predominant_color: predominant,
        equalized_path,
        classified_path,
    })
}
