//! LOD photo processor: decode + downsample a source photo to a target
//! edge length (§4.5).

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};

use crate::error::ProcessError;
use crate::photo::{LodLevel, PhotoRef};

/// How a photo's aspect ratio is reconciled with the target square tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleStrategy {
    /// Scale so the longer edge equals `res(L)`, preserving aspect ratio.
    FitCenter,
    /// Scale to `res(L) x res(L)`, cropping the shorter axis.
    CenterCrop,
}

/// Capability the processor consumes to turn a [`PhotoRef`] into pixels.
/// External collaborator per the crate's Non-goals (decoding primitives are
/// a capability, not core logic) — a default `image`-crate-backed
/// implementation is provided below so the crate is runnable standalone.
pub trait ImageDecoder: Send + Sync {
    fn decode_bounds(&self, photo: &PhotoRef) -> Result<(u32, u32), ProcessError>;
    fn decode(&self, photo: &PhotoRef, sample: u32) -> Result<DynamicImage, ProcessError>;
}

/// Decodes photos from the filesystem path encoded in [`PhotoRef::uri`].
pub struct FileImageDecoder;

impl ImageDecoder for FileImageDecoder {
    fn decode_bounds(&self, photo: &PhotoRef) -> Result<(u32, u32), ProcessError> {
        let reader = image::ImageReader::open(photo.uri())?.with_guessed_format()?;
        Ok(reader.into_dimensions()?)
    }

    fn decode(&self, photo: &PhotoRef, sample: u32) -> Result<DynamicImage, ProcessError> {
        let img = image::open(photo.uri())?;

        if sample <= 1 {
            return Ok(img);
        }

        let (w, h) = img.dimensions();
        let target = (
            (w / sample).max(1),
            (h / sample).max(1),
        );

        Ok(img.resize(target.0, target.1, FilterType::Triangle))
    }
}

/// A decoded, scaled photo ready to be packed. Pixels are owned
/// exclusively by whichever pipeline stage holds this value; the caller is
/// responsible for returning `pixels` to the bitmap pool once done.
pub struct ProcessedPhoto {
    pub photo: PhotoRef,
    pub original_size: (u32, u32),
    pub scaled_size: (u32, u32),
    pub aspect_ratio: f32,
    pub pixels: Vec<u8>,
    pub effective_lod: LodLevel,
}

/// Computes the power-of-two subsample factor such that the decoded image's
/// edges are both `>= target` after dividing by `sample`, per §4.5 step 2.
fn subsample_factor(orig: u32, target: u32) -> u32 {
    let mut sample = 1u32;

    while orig / (sample * 2) >= target && sample * 2 <= orig.max(1) {
        sample *= 2;
    }

    sample
}

/// Decodes and downsamples `photo` to `lod`'s target resolution using
/// `strategy`, checking `cancelled` between each suspension point (§5).
pub fn process(
    decoder: &dyn ImageDecoder,
    photo: &PhotoRef,
    lod: LodLevel,
    strategy: ScaleStrategy,
    cancelled: impl Fn() -> bool,
) -> Result<ProcessedPhoto, ProcessError> {
    let (orig_w, orig_h) = decoder.decode_bounds(photo)?;

    if cancelled() {
        return Err(ProcessError::Cancelled);
    }

    let res = lod.resolution();
    let decode_cap = res.saturating_mul(2).min(2048);

    let sample_w = subsample_factor(orig_w, decode_cap.min(orig_w.max(1)));
    let sample_h = subsample_factor(orig_h, decode_cap.min(orig_h.max(1)));
    let sample = sample_w.min(sample_h).max(1);

    let decoded = decoder.decode(photo, sample)?;

    if cancelled() {
        return Err(ProcessError::Cancelled);
    }

    let (dw, dh) = decoded.dimensions();
    let aspect_ratio = dw as f32 / dh.max(1) as f32;

    let scaled = match strategy {
        ScaleStrategy::FitCenter => {
            decoded.resize(res, res, FilterType::Triangle)
        },
        ScaleStrategy::CenterCrop => {
            decoded.resize_to_fill(res, res, FilterType::Triangle)
        },
    };

    let scaled_size = scaled.dimensions();
    let pixels = scaled.to_rgba8().into_raw();

    Ok(ProcessedPhoto {
        photo: photo.clone(),
        original_size: (orig_w, orig_h),
        scaled_size,
        aspect_ratio,
        pixels,
        effective_lod: lod,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeDecoder {
        size: (u32, u32),
    }

    impl ImageDecoder for FakeDecoder {
        fn decode_bounds(&self, _photo: &PhotoRef) -> Result<(u32, u32), ProcessError> {
            Ok(self.size)
        }

        fn decode(&self, _photo: &PhotoRef, sample: u32) -> Result<DynamicImage, ProcessError> {
            let (w, h) = self.size;
            let img = DynamicImage::new_rgba8((w / sample.max(1)).max(1), (h / sample.max(1)).max(1));
            Ok(img)
        }
    }

    #[test]
    fn subsample_factor_is_power_of_two() {
        assert_eq!(subsample_factor(4096, 512), 8);
        assert_eq!(subsample_factor(100, 512), 1);
        assert_eq!(subsample_factor(0, 512), 1);
    }

    #[test]
    fn fit_center_preserves_aspect_and_bounds_longest_edge() {
        let decoder = FakeDecoder { size: (4000, 2000) };
        let photo = PhotoRef::new("fake://a".to_string(), (4000, 2000));
        let result = process(&decoder, &photo, LodLevel::L4, ScaleStrategy::FitCenter, || false).unwrap();
        assert_eq!(result.scaled_size.0.max(result.scaled_size.1), 256);
    }

    #[test]
    fn center_crop_produces_square_output() {
        let decoder = FakeDecoder { size: (4000, 2000) };
        let photo = PhotoRef::new("fake://a".to_string(), (4000, 2000));
        let result = process(&decoder, &photo, LodLevel::L3, ScaleStrategy::CenterCrop, || false).unwrap();
        assert_eq!(result.scaled_size, (192, 192));
    }

    #[test]
    fn cancellation_is_observed_before_decode() {
        let decoder = FakeDecoder { size: (100, 100) };
        let photo = PhotoRef::new("fake://a".to_string(), (100, 100));
        let cancelled = AtomicBool::new(true);
        let result = process(&decoder, &photo, LodLevel::L0, ScaleStrategy::FitCenter, || {
            cancelled.load(Ordering::Relaxed)
        });
        assert!(matches!(result, Err(ProcessError::Cancelled)));
    }
}
