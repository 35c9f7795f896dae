//! Image preprocessing driven by `preprocessor_config.json`.

use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, RgbImage};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SizeSpec {
    #[serde(default)]
    pub shortest_edge: Option<usize>,
    #[serde(default)]
    pub height: Option<usize>,
    #[serde(default)]
    pub width: Option<usize>,
}

impl SizeSpec {
    pub fn exact(height: usize, width: usize) -> Self {
        Self {
            shortest_edge: None,
            height: Some(height),
            width: Some(width),
        }
    }

    fn exact_dims(&self) -> Option<(usize, usize)> {
        Some((self.height?, self.width?))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreprocessorConfig {
    #[serde(default = "default_true")]
    pub do_resize: bool,
    #[serde(default)]
    pub size: SizeSpec,
    #[serde(default)]
    pub do_center_crop: bool,
    #[serde(default)]
    pub crop_size: Option<SizeSpec>,
    #[serde(default = "default_true")]
    pub do_rescale: bool,
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f64,
    #[serde(default = "default_true")]
    pub do_normalize: bool,
    #[serde(default = "default_image_mean")]
    pub image_mean: [f32; 3],
    #[serde(default = "default_image_std")]
    pub image_std: [f32; 3],
    /// Tile budget of tiled processors
    #[serde(default)]
    pub max_image_tiles: Option<usize>,
}

fn default_true() -> bool {
    true
}

fn default_rescale_factor() -> f64 {
    1.0 / 255.0
}

fn default_image_mean() -> [f32; 3] {
    CLIP_MEAN
}

fn default_image_std() -> [f32; 3] {
    CLIP_STD
}

impl PreprocessorConfig {
    /// CLIP normalization with an exact square resize.
    pub fn square(side: usize) -> Self {
        Self {
            do_resize: true,
            size: SizeSpec::exact(side, side),
            do_center_crop: false,
            crop_size: None,
            do_rescale: true,
            rescale_factor: default_rescale_factor(),
            do_normalize: true,
            image_mean: CLIP_MEAN,
            image_std: CLIP_STD,
            max_image_tiles: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageProcessor {
    config: PreprocessorConfig,
}

impl ImageProcessor {
    pub fn new(config: PreprocessorConfig) -> Self {
        Self { config }
    }

    /// Read `preprocessor_config.json`, or use `fallback` when absent.
    pub fn from_model_dir(model_dir: &Path, fallback: PreprocessorConfig) -> Result<Self> {
        let path = model_dir.join("preprocessor_config.json");
        let config = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            debug!("No preprocessor_config.json in {:?}, using defaults", model_dir);
            fallback
        };
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &PreprocessorConfig {
        &self.config
    }

    pub fn load_image(path: &Path) -> Result<DynamicImage> {
        Ok(image::open(path)?)
    }

    /// Height and width of the produced pixel tensor.
    pub fn output_size(&self, image: &DynamicImage) -> (usize, usize) {
        let (width, height) = image.dimensions();
        let (mut h, mut w) = (height as usize, width as usize);
        if self.config.do_resize {
            (h, w) = self.resized_dims(h, w);
        }
        if let Some((ch, cw)) = self.crop_dims() {
            (h, w) = (ch, cw);
        }
        (h, w)
    }

    /// `[3, H, W]` f32 tensor: resized, cropped, rescaled and normalized.
    pub fn preprocess(&self, image: &DynamicImage, device: &Device) -> Result<Tensor> {
        let mut image = DynamicImage::ImageRgb8(image.to_rgb8());

        if self.config.do_resize {
            let (width, height) = image.dimensions();
            let (h, w) = self.resized_dims(height as usize, width as usize);
            image = image.resize_exact(w as u32, h as u32, FilterType::CatmullRom);
        }

        if let Some((ch, cw)) = self.crop_dims() {
            image = center_crop(&image, ch, cw);
        }

        self.normalize(image.to_rgb8(), device)
    }

    /// Fit the image onto the best canvas of at most `max_tiles` square tiles
    /// without distorting it, pad the rest of the canvas with black, then
    /// rescale, normalize and split it into tiles.
    pub fn preprocess_tiled(
        &self,
        image: &DynamicImage,
        tile_size: usize,
        max_tiles: usize,
        device: &Device,
    ) -> Result<TiledImage> {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        if width == 0 || height == 0 {
            return Err(Error::InvalidInput("Image has no pixels".to_string()));
        }
        let (height, width) = (height as usize, width as usize);
        let tile_size = tile_size.max(1);

        let (rows, cols) = optimal_tile_arrangement(height, width, tile_size, max_tiles.max(1));
        let (canvas_h, canvas_w) = (rows * tile_size, cols * tile_size);
        let (new_h, new_w) = fit_to_canvas(height, width, canvas_h, canvas_w, tile_size);
        debug!(
            "Tiling {}x{} image as {}x{} tiles ({}x{} before padding)",
            width, height, cols, rows, new_w, new_h
        );

        let resized = imageops::resize(&rgb, new_w as u32, new_h as u32, FilterType::Triangle);
        let mut canvas = RgbImage::new(canvas_w as u32, canvas_h as u32);
        imageops::replace(&mut canvas, &resized, 0, 0);

        let tiles = self
            .normalize(canvas, device)?
            .reshape((3, rows, tile_size, cols, tile_size))?
            .permute((1, 3, 0, 2, 4))?
            .contiguous()?
            .reshape((rows * cols, 3, tile_size, tile_size))?;
        Ok(TiledImage { tiles, rows, cols })
    }

    /// `[3, H, W]` f32 tensor of `rgb`, rescaled and normalized.
    fn normalize(&self, rgb: RgbImage, device: &Device) -> Result<Tensor> {
        let (width, height) = rgb.dimensions();
        let data: Vec<f32> = rgb.into_raw().into_iter().map(f32::from).collect();
        let mut pixels = Tensor::from_vec(data, (height as usize, width as usize, 3), device)?
            .permute((2, 0, 1))?
            .contiguous()?;

        if self.config.do_rescale {
            pixels = pixels.affine(self.config.rescale_factor, 0.0)?;
        }
        if self.config.do_normalize {
            let mean = Tensor::new(&self.config.image_mean, device)?.reshape((3, 1, 1))?;
            let std = Tensor::new(&self.config.image_std, device)?.reshape((3, 1, 1))?;
            pixels = pixels.broadcast_sub(&mean)?.broadcast_div(&std)?;
        }

        Ok(pixels.to_dtype(DType::F32)?)
    }

    fn resized_dims(&self, height: usize, width: usize) -> (usize, usize) {
        if let Some(dims) = self.config.size.exact_dims() {
            return dims;
        }
        match self.config.size.shortest_edge {
            Some(edge) if height > 0 && width > 0 => {
                let short = height.min(width) as f64;
                let scale = edge as f64 / short;
                (
                    ((height as f64 * scale).round() as usize).max(1),
                    ((width as f64 * scale).round() as usize).max(1),
                )
            }
            _ => (height, width),
        }
    }

    fn crop_dims(&self) -> Option<(usize, usize)> {
        if !self.config.do_center_crop {
            return None;
        }
        let crop = self.config.crop_size.as_ref()?;
        crop.exact_dims()
    }
}

/// An image split into a `rows x cols` grid of square tiles.
#[derive(Debug, Clone)]
pub struct TiledImage {
    /// `[rows * cols, 3, tile, tile]`, row-major
    pub tiles: Tensor,
    pub rows: usize,
    pub cols: usize,
}

impl TiledImage {
    pub fn num_tiles(&self) -> usize {
        self.rows * self.cols
    }
}

/// Tile grids `(rows, cols)` of at most `max_tiles` tiles. Aspect-ratio ids
/// are positions in this list, starting at 1.
pub fn tile_arrangements(max_tiles: usize) -> Vec<(usize, usize)> {
    let mut arrangements = Vec::new();
    for rows in 1..=max_tiles {
        for cols in 1..=max_tiles {
            if rows * cols <= max_tiles {
                arrangements.push((rows, cols));
            }
        }
    }
    arrangements
}

/// Grid whose canvas needs the smallest upscale of the image, or the
/// smallest downscale when every canvas is smaller. Ties go to the grid with
/// fewer tiles.
pub fn optimal_tile_arrangement(
    height: usize,
    width: usize,
    tile_size: usize,
    max_tiles: usize,
) -> (usize, usize) {
    let arrangements = tile_arrangements(max_tiles);
    let scales: Vec<f64> = arrangements
        .iter()
        .map(|&(rows, cols)| {
            let scale_h = (rows * tile_size) as f64 / height.max(1) as f64;
            let scale_w = (cols * tile_size) as f64 / width.max(1) as f64;
            scale_h.min(scale_w)
        })
        .collect();

    let upscale = scales.iter().copied().filter(|s| *s >= 1.0).reduce(f64::min);
    let Some(selected) = upscale.or_else(|| scales.iter().copied().reduce(f64::max)) else {
        return (1, 1);
    };
    arrangements
        .iter()
        .zip(&scales)
        .filter(|(_, scale)| **scale == selected)
        .map(|(arrangement, _)| *arrangement)
        .min_by_key(|(rows, cols)| rows * cols)
        .unwrap_or((1, 1))
}

/// Size `(height, width)` of the image resized onto a canvas, keeping its
/// aspect ratio. Sides already between one tile and the canvas are kept.
pub fn fit_to_canvas(
    height: usize,
    width: usize,
    canvas_h: usize,
    canvas_w: usize,
    tile_size: usize,
) -> (usize, usize) {
    let target_w = width.clamp(tile_size.min(canvas_w), canvas_w);
    let target_h = height.clamp(tile_size.min(canvas_h), canvas_h);
    let scale_h = target_h as f64 / height.max(1) as f64;
    let scale_w = target_w as f64 / width.max(1) as f64;
    if scale_w < scale_h {
        let new_h = ((height as f64 * scale_w).floor() as usize).max(1).min(target_h);
        (new_h, target_w)
    } else {
        let new_w = ((width as f64 * scale_h).floor() as usize).max(1).min(target_w);
        (target_h, new_w)
    }
}

fn center_crop(image: &DynamicImage, height: usize, width: usize) -> DynamicImage {
    let (w, h) = image.dimensions();
    let (cw, ch) = (width as u32, height as u32);
    if w < cw || h < ch {
        return image.resize_exact(cw, ch, FilterType::CatmullRom);
    }
    image.crop_imm((w - cw) / 2, (h - ch) / 2, cw, ch)
}
