//! Retrieval and decoding of the media attached to a request.

mod audio;
mod fetch;

pub use audio::{decode_audio, AudioClip};
pub use fetch::MediaFetcher;

use image::RgbImage;
use log::debug;

use crate::error::Phi4MmError;
use crate::request::TaskType;

/// A decoded media item, ready for the processor.
#[derive(Debug, Clone)]
pub enum Media {
    Image(RgbImage),
    Audio(AudioClip),
}

impl Media {
    pub fn task_type(&self) -> TaskType {
        match self {
            Media::Image(_) => TaskType::Image,
            Media::Audio(_) => TaskType::Audio,
        }
    }
}

/// Decode an encoded raster image (jpeg, png, webp, ...) into RGB8.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, Phi4MmError> {
    let image = image::load_from_memory(bytes)?.to_rgb8();
    debug!("Decoded image of size {}x{}", image.width(), image.height());
    Ok(image)
}

/// Fetch `content_url` and decode it according to the request modality.
pub fn load_media(
    fetcher: &MediaFetcher,
    task_type: TaskType,
    content_url: &str,
) -> Result<Media, Phi4MmError> {
    let bytes = fetcher.fetch(content_url)?;
    match task_type {
        TaskType::Image => Ok(Media::Image(decode_image(&bytes)?)),
        TaskType::Audio => {
            let extension = fetch::url_extension(content_url);
            Ok(Media::Audio(decode_audio(bytes, extension.as_deref())?))
        }
    }
}
