//! SDXL micro-conditioning ids.

use candle_core::{Device, Tensor};

use crate::config::SamplingConfig;
use crate::error::Result;

/// `[orig_h, orig_w, crop_top, crop_left, target_h, target_w]` for an uncropped
/// image generated at its native size.
pub fn time_ids_row(config: &SamplingConfig) -> [f32; 6] {
    let h = config.height as f32;
    let w = config.width as f32;
    [h, w, 0.0, 0.0, h, w]
}

/// Time ids for the whole network batch.
///
/// With guidance the row is stacked as `[uncond, cond]` and that pair is
/// repeated `batch_size` times, giving `(2b, 6)`. Without guidance the
/// result is `(b, 6)`.
pub fn time_ids(config: &SamplingConfig, device: &Device) -> Result<Tensor> {
    let row = Tensor::from_slice(&time_ids_row(config), (1, 6), device)?;
    let pair = if config.do_classifier_free_guidance {
        Tensor::cat(&[&row, &row], 0)?
    } else {
        row
    };
    Ok(pair.repeat((config.batch_size, 1))?.to_dtype(config.dtype())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Precision;

    #[test]
    fn guided_batch_doubles() {
        let config = SamplingConfig::new(1024, 768, 3, 10).with_precision(Precision::Full);
        let ids = time_ids(&config, &Device::Cpu).unwrap();
        assert_eq!(ids.dims(), &[6, 6]);
        let rows = ids.to_vec2::<f32>().unwrap();
        assert_eq!(rows[0], vec![1024.0, 768.0, 0.0, 0.0, 1024.0, 768.0]);
        assert_eq!(rows[5], rows[0]);
    }

    #[test]
    fn unguided_batch_matches_batch_size() {
        let config = SamplingConfig::new(512, 512, 2, 10).with_guidance(false, 1.0);
        let ids = time_ids(&config, &Device::Cpu).unwrap();
        assert_eq!(ids.dims(), &[2, 6]);
        assert_eq!(ids.dtype(), candle_core::DType::F16);
    }
}
