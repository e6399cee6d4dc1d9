use stereocalib_image::{Image, ImageError};

use crate::parallel;

const RW: f64 = 0.299;
const GW: f64 = 0.587;
const BW: f64 = 0.114;

/// Convert an RGB image to grayscale with the BT.601 luma weights.
///
/// # Arguments
///
/// * `src` - The input RGB image.
/// * `dst` - The output grayscale image.
///
/// Precondition: the input and output images must have the same size.
pub fn gray_from_rgb<T>(src: &Image<T, 3>, dst: &mut Image<T, 1>) -> Result<(), ImageError>
where
    T: Send + Sync + num_traits::Float,
{
    if src.size() != dst.size() {
        return Err(ImageError::InvalidImageSize(
            src.cols(),
            src.rows(),
            dst.cols(),
            dst.rows(),
        ));
    }

    let rw = T::from(RW).ok_or(ImageError::CastError)?;
    let gw = T::from(GW).ok_or(ImageError::CastError)?;
    let bw = T::from(BW).ok_or(ImageError::CastError)?;

    parallel::par_iter_rows(src, dst, |src_pixel, dst_pixel| {
        dst_pixel[0] = rw * src_pixel[0] + gw * src_pixel[1] + bw * src_pixel[2];
    });

    Ok(())
}

/// Convert an RGB8 image to grayscale with fixed-point weights.
pub fn gray_from_rgb_u8(src: &Image<u8, 3>, dst: &mut Image<u8, 1>) -> Result<(), ImageError> {
    if src.size() != dst.size() {
        return Err(ImageError::InvalidImageSize(
            src.cols(),
            src.rows(),
            dst.cols(),
            dst.rows(),
        ));
    }

    parallel::par_iter_rows(src, dst, |src_pixel, dst_pixel| {
        let r = src_pixel[0] as u16;
        let g = src_pixel[1] as u16;
        let b = src_pixel[2] as u16;
        dst_pixel[0] = ((r * 77 + g * 150 + b * 29) >> 8) as u8;
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stereocalib_image::ImageSize;

    #[test]
    fn test_gray_from_rgb() -> Result<(), ImageError> {
        let size = ImageSize {
            width: 2,
            height: 1,
        };
        let rgb = Image::<f32, 3>::new(size, vec![1.0, 0.0, 0.0, 0.5, 0.5, 0.5])?;
        let mut gray = Image::<f32, 1>::from_size_val(size, 0.0)?;
        gray_from_rgb(&rgb, &mut gray)?;
        assert!((gray.as_slice()[0] - 0.299).abs() < 1e-6);
        assert!((gray.as_slice()[1] - 0.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_gray_from_rgb_u8() -> Result<(), ImageError> {
        let size = ImageSize {
            width: 1,
            height: 2,
        };
        let rgb = Image::<u8, 3>::new(size, vec![255, 255, 255, 0, 0, 0])?;
        let mut gray = Image::<u8, 1>::from_size_val(size, 0)?;
        gray_from_rgb_u8(&rgb, &mut gray)?;
        assert_eq!(gray.as_slice(), &[255, 0]);

        let mut wrong = Image::<u8, 1>::from_size_val([2, 2].into(), 0)?;
        assert!(gray_from_rgb_u8(&rgb, &mut wrong).is_err());
        Ok(())
    }
}
