//! HSP perceptual-luminance extraction over a blit-and-mipmap-reduced frame (§4.3).

use tracing::warn;

use super::context::GpuContext;
use super::importer::ImportedImage;

/// Sentinel returned on any submit/wait/map failure; the dispatcher skips the cycle.
pub const LUMA_FAILURE: i32 = -1;

/// Runs the mip-chain blit and readback, then computes perceived lightness with the
/// HSP coefficients `(0.241, 0.691, 0.068)` rather than BT.601 luma, since the signal
/// drives human-perceived brightness preference (§4.3).
pub fn extract_luma(context: &mut GpuContext, image: &ImportedImage) -> i32 {
    let extent = image.extent();
    match context.blit_mip_readback(image.image(), extent) {
        Some([b, g, r, _a]) => {
            let (r, g, b) = (r as f64, g as f64, b as f64);
            let perceived =
                (0.241 * r * r + 0.691 * g * g + 0.068 * b * b).sqrt() / 255.0 * 100.0;
            perceived.round().clamp(0.0, 100.0) as i32
        }
        None => {
            warn!("luma extraction failed; skipping cycle");
            LUMA_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    fn hsp_luma(r: u8, g: u8, b: u8) -> i32 {
        let (r, g, b) = (r as f64, g as f64, b as f64);
        ((0.241 * r * r + 0.691 * g * g + 0.068 * b * b).sqrt() / 255.0 * 100.0)
            .round()
            .clamp(0.0, 100.0) as i32
    }

    #[test]
    fn black_is_zero() {
        assert_eq!(hsp_luma(0, 0, 0), 0);
    }

    #[test]
    fn white_is_one_hundred() {
        assert_eq!(hsp_luma(255, 255, 255), 100);
    }

    #[test]
    fn pure_green_weighs_more_than_pure_red_or_blue() {
        assert!(hsp_luma(0, 255, 0) > hsp_luma(255, 0, 0));
        assert!(hsp_luma(255, 0, 0) > hsp_luma(0, 0, 255));
    }
}
