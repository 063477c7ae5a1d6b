use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, GenericImage, Rgb, RgbImage};
use log::debug;

use crate::error::Phi4MmError;

pub struct ImageProcessorConfig {
    /// Side of a square crop fed to the vision encoder.
    pub crop_size: u32,
    pub patch_size: u32,
    /// Maximum number of high resolution crops.
    pub dynamic_hd: usize,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    pub rescale_factor: f32,
}

impl ImageProcessorConfig {
    pub fn phi4_mm(dynamic_hd: usize) -> Self {
        Self {
            crop_size: 448,
            patch_size: 14,
            dynamic_hd,
            image_mean: [0.5, 0.5, 0.5],
            image_std: [0.5, 0.5, 0.5],
            rescale_factor: 1.0 / 255.0,
        }
    }

    /// Side of the per-crop token grid after the encoder's 2x2 pooling.
    pub fn tokens_per_side(&self) -> usize {
        (self.crop_size / self.patch_size / 2) as usize
    }
}

/// How an image is laid out over the high resolution crop grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HdLayout {
    /// Number of crops along the width.
    pub cols: usize,
    /// Number of crops along the height.
    pub rows: usize,
    /// Size of the aspect-preserving resize, before padding.
    pub resized_width: u32,
    pub resized_height: u32,
    /// Extent of the pooled token grid not covered by padding.
    pub useful_width: usize,
    pub useful_height: usize,
}

impl HdLayout {
    pub fn num_crops(&self) -> usize {
        self.cols * self.rows
    }
}

/// Preprocessed image ready for the vision encoder.
#[derive(Debug, Clone)]
pub struct ImageInputs {
    /// Global view followed by the row-major crops, `[1 + rows * cols, 3, crop, crop]`.
    pub pixel_values: Tensor,
    pub layout: HdLayout,
    pub num_tokens: usize,
}

/// Phi-4 "dynamic HD" image preprocessor.
pub struct ImageProcessor {
    config: ImageProcessorConfig,
    mean: Tensor,
    std: Tensor,
}

impl ImageProcessor {
    pub fn new(config: ImageProcessorConfig, device: &Device) -> Result<Self, Phi4MmError> {
        Ok(Self {
            mean: Tensor::from_slice(&config.image_mean, (3, 1, 1), device)?,
            std: Tensor::from_slice(&config.image_std, (3, 1, 1), device)?,
            config,
        })
    }

    pub fn config(&self) -> &ImageProcessorConfig {
        &self.config
    }

    /// Number of embeddings the model produces for an image with the given layout:
    /// the useful sub-crop grid with one separator per row, one separator between
    /// sub-crops and global view, and the global view with one separator per row.
    pub fn num_image_tokens(&self, layout: &HdLayout) -> usize {
        let side = self.config.tokens_per_side();
        side * side + 1 + layout.useful_height * layout.useful_width + layout.useful_height + side
    }

    /// Pick the crop grid and the resize/pad geometry for an image.
    pub fn layout(&self, width: u32, height: u32) -> HdLayout {
        let crop = self.config.crop_size;
        let width = width.max(1);
        let height = height.max(1);

        let mut cols = width.div_ceil(crop) as usize;
        let mut rows = height.div_ceil(crop) as usize;
        if cols * rows > self.config.dynamic_hd {
            (cols, rows) = closest_aspect_ratio(width, height, self.config.dynamic_hd, crop);
        }

        let target_width = crop as usize * cols;
        let target_height = crop as usize * rows;
        let ratio_width = target_width as f64 / width as f64;
        let ratio_height = target_height as f64 / height as f64;

        let (resized_width, resized_height) = if ratio_width < ratio_height {
            let h = ((height as f64 * ratio_width) as usize).clamp(1, target_height);
            (target_width, h)
        } else {
            let w = ((width as f64 * ratio_height) as usize).clamp(1, target_width);
            (w, target_height)
        };

        let patches_per_crop = (crop / self.config.patch_size) as usize;
        let patch = self.config.patch_size as usize;
        let useful_patches = |total: usize, padding: usize| {
            let masked = if padding >= patch { padding / patch } else { 0 };
            // the patch mask is subsampled with a stride of 2
            (patches_per_crop * total - masked).div_ceil(2)
        };

        HdLayout {
            cols,
            rows,
            resized_width: resized_width as u32,
            resized_height: resized_height as u32,
            useful_width: useful_patches(cols, target_width - resized_width),
            useful_height: useful_patches(rows, target_height - resized_height),
        }
    }

    pub fn preprocess(&self, image: &RgbImage, device: &Device) -> Result<ImageInputs, Phi4MmError> {
        let layout = self.layout(image.width(), image.height());
        let crop = self.config.crop_size;
        debug!(
            "Image size: {}x{} -> {}x{} crops (resized to {}x{})",
            image.width(),
            image.height(),
            layout.cols,
            layout.rows,
            layout.resized_width,
            layout.resized_height
        );

        let resized = image::imageops::resize(
            image,
            layout.resized_width,
            layout.resized_height,
            FilterType::CatmullRom,
        );
        let mut hd_image = RgbImage::from_pixel(
            crop * layout.cols as u32,
            crop * layout.rows as u32,
            Rgb([255, 255, 255]),
        );
        hd_image.copy_from(&resized, 0, 0)?;

        let global_image = image::imageops::resize(&hd_image, crop, crop, FilterType::CatmullRom);

        let hd_tensor = self.image_to_normalized_tensor(hd_image, device)?;
        let global_tensor = self.image_to_normalized_tensor(global_image, device)?;

        let crops = self.split_crops(&hd_tensor, &layout)?;
        let pixel_values = Tensor::cat(&[&global_tensor.unsqueeze(0)?, &crops], 0)?;

        let num_tokens = self.num_image_tokens(&layout);
        debug!("Image expands to {num_tokens} tokens");

        Ok(ImageInputs {
            pixel_values,
            layout,
            num_tokens,
        })
    }

    /// `[3, H, W]` normalized float tensor of an RGB8 image.
    fn image_to_normalized_tensor(
        &self,
        image: RgbImage,
        device: &Device,
    ) -> Result<Tensor, Phi4MmError> {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let tensor = Tensor::from_vec(image.into_raw(), (height, width, 3), device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(self.config.rescale_factor as f64, 0.0)?;

        Ok(tensor.broadcast_sub(&self.mean)?.broadcast_div(&self.std)?)
    }

    /// `[3, rows * crop, cols * crop]` => `[rows * cols, 3, crop, crop]`
    fn split_crops(&self, image: &Tensor, layout: &HdLayout) -> Result<Tensor, Phi4MmError> {
        let crop = self.config.crop_size as usize;
        let c = image.dim(0)?;
        Ok(image
            .reshape((c, layout.rows, crop, layout.cols, crop))?
            .permute((1, 3, 0, 2, 4))?
            .reshape((layout.rows * layout.cols, c, crop, crop))?)
    }
}

/// Among all `cols x rows` grids with at most `max_num` crops, the one whose
/// aspect ratio is closest to the image's. Ties go to the larger grid when the
/// image has enough pixels to fill it.
fn closest_aspect_ratio(width: u32, height: u32, max_num: usize, crop: u32) -> (usize, usize) {
    let mut ratios = (1..=max_num)
        .flat_map(|i| (1..=max_num).map(move |j| (i, j)))
        .filter(|(i, j)| i * j <= max_num)
        .collect::<Vec<_>>();
    ratios.sort_by_key(|&(i, j)| (i * j, i, j));

    let aspect_ratio = width as f64 / height as f64;
    let area = width as f64 * height as f64;

    let mut best_diff = f64::INFINITY;
    let mut best = (1, 1);
    for (i, j) in ratios {
        let diff = (aspect_ratio - i as f64 / j as f64).abs();
        if diff < best_diff {
            best_diff = diff;
            best = (i, j);
        } else if diff == best_diff && area > 0.5 * (crop * crop) as f64 * (i * j) as f64 {
            best = (i, j);
        }
    }
    best
}
