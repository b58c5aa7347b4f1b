//! Decoding of downloaded blobs into displayable images.

use std::sync::Arc;

use async_trait::async_trait;
use image::DynamicImage;

use crate::blob::BlobHandle;
use crate::error::{ImageLoadError, Result};

/// A decoded image and its natural dimensions.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    width: u32,
    height: u32,
    frame: Option<Arc<DynamicImage>>,
}

impl DecodedImage {
    /// Dimensions only, for decoders that hand pixels to another owner.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame: None,
        }
    }

    pub fn with_frame(frame: DynamicImage) -> Self {
        Self {
            width: frame.width(),
            height: frame.height(),
            frame: Some(Arc::new(frame)),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn frame(&self) -> Option<&Arc<DynamicImage>> {
        self.frame.as_ref()
    }
}

/// Turns blob bytes into a [`DecodedImage`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageDecoder: Send + Sync {
    async fn decode(&self, blob: &BlobHandle) -> Result<DecodedImage>;
}

/// Decodes with the `image` crate on the blocking pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct RasterDecoder;

#[async_trait]
impl ImageDecoder for RasterDecoder {
    async fn decode(&self, blob: &BlobHandle) -> Result<DecodedImage> {
        let bytes = blob.bytes().ok_or_else(|| {
            ImageLoadError::Decode("blob revoked before decode".to_string())
        })?;

        let decoded =
            tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
                .await
                .map_err(|e| ImageLoadError::Decode(e.to_string()))?
                .map_err(|e| ImageLoadError::Decode(e.to_string()))?;

        Ok(DecodedImage::with_frame(decoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobStore, InMemoryBlobStore};
    use bytes::Bytes;
    use image::{ImageFormat, RgbaImage};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Bytes {
        let mut out = Cursor::new(Vec::new());
        RgbaImage::new(width, height)
            .write_to(&mut out, ImageFormat::Png)
            .expect("encode png");
        Bytes::from(out.into_inner())
    }

    #[tokio::test]
    async fn raster_decoder_reports_natural_dimensions() {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        let blob = BlobHandle::create(&store, png_bytes(12, 7));

        let decoded = RasterDecoder.decode(&blob).await.expect("decodes");
        assert_eq!((decoded.width(), decoded.height()), (12, 7));
        assert!(decoded.frame().is_some());
    }

    #[tokio::test]
    async fn raster_decoder_rejects_garbage() {
        let store: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        let blob =
            BlobHandle::create(&store, Bytes::from_static(b"not an image"));

        let err = RasterDecoder.decode(&blob).await.unwrap_err();
        assert!(matches!(err, ImageLoadError::Decode(_)));
    }
}
