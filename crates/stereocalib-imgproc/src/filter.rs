use stereocalib_image::{Image, ImageError};

use crate::parallel;

/// Create a normalized 1D gaussian kernel.
///
/// # Arguments
///
/// * `kernel_size` - The size of the kernel, should be odd.
/// * `sigma` - The standard deviation of the gaussian.
pub fn gaussian_kernel_1d(kernel_size: usize, sigma: f32) -> Vec<f32> {
    let mut kernel = Vec::with_capacity(kernel_size);

    let mean = (kernel_size as f32 - 1.0) / 2.0;
    let sigma_sq = sigma * sigma;

    for i in 0..kernel_size {
        let x = i as f32 - mean;
        kernel.push((-(x * x) / (2.0 * sigma_sq)).exp());
    }

    let norm = kernel.iter().sum::<f32>();
    kernel.iter_mut().for_each(|k| *k /= norm);
    kernel
}

/// Kernel size covering `±3σ` of a gaussian, always odd.
pub fn kernel_size_for_sigma(sigma: f32) -> usize {
    2 * (3.0 * sigma).ceil().max(1.0) as usize + 1
}

/// Apply a separable filter to a single channel image.
///
/// Borders are handled by replicating the edge pixels.
///
/// # Arguments
///
/// * `src` - The source image.
/// * `dst` - The destination image, same size as `src`.
/// * `kernel_x` - The horizontal kernel, odd length.
/// * `kernel_y` - The vertical kernel, odd length.
pub fn separable_filter(
    src: &Image<f32, 1>,
    dst: &mut Image<f32, 1>,
    kernel_x: &[f32],
    kernel_y: &[f32],
) -> Result<(), ImageError> {
    if src.size() != dst.size() {
        return Err(ImageError::InvalidImageSize(
            src.cols(),
            src.rows(),
            dst.cols(),
            dst.rows(),
        ));
    }

    let (cols, rows) = (src.cols(), src.rows());
    let src_data = src.as_slice();

    // horizontal pass
    let mut temp = Image::<f32, 1>::from_size_val(src.size(), 0.0)?;
    let half_x = kernel_x.len() as isize / 2;
    parallel::par_for_each_row(&mut temp, |y, row| {
        let src_row = &src_data[y * cols..(y + 1) * cols];
        for (x, out) in row.iter_mut().enumerate() {
            *out = kernel_x
                .iter()
                .enumerate()
                .map(|(k, w)| {
                    let xs = (x as isize + k as isize - half_x).clamp(0, cols as isize - 1);
                    w * src_row[xs as usize]
                })
                .sum();
        }
    });

    // vertical pass
    let temp_data = temp.as_slice();
    let half_y = kernel_y.len() as isize / 2;
    parallel::par_for_each_row(dst, |y, row| {
        for (x, out) in row.iter_mut().enumerate() {
            *out = kernel_y
                .iter()
                .enumerate()
                .map(|(k, w)| {
                    let ys = (y as isize + k as isize - half_y).clamp(0, rows as isize - 1);
                    w * temp_data[ys as usize * cols + x]
                })
                .sum();
        }
    });

    Ok(())
}

/// Blur an image with a gaussian kernel.
///
/// # Arguments
///
/// * `src` - The source image.
/// * `dst` - The destination image.
/// * `sigma` - The standard deviation of the gaussian, in pixels.
pub fn gaussian_blur(
    src: &Image<f32, 1>,
    dst: &mut Image<f32, 1>,
    sigma: f32,
) -> Result<(), ImageError> {
    let kernel = gaussian_kernel_1d(kernel_size_for_sigma(sigma), sigma);
    separable_filter(src, dst, &kernel, &kernel)
}

/// Compute the image gradients with central differences.
///
/// The border pixels are left at zero.
pub fn central_gradients(
    src: &Image<f32, 1>,
    gx: &mut Image<f32, 1>,
    gy: &mut Image<f32, 1>,
) -> Result<(), ImageError> {
    for dst in [&*gx, &*gy] {
        if src.size() != dst.size() {
            return Err(ImageError::InvalidImageSize(
                src.cols(),
                src.rows(),
                dst.cols(),
                dst.rows(),
            ));
        }
    }

    let (cols, rows) = (src.cols(), src.rows());
    let data = src.as_slice();

    parallel::par_for_each_row(gx, |y, row| {
        for x in 1..cols.saturating_sub(1) {
            let idx = y * cols + x;
            row[x] = 0.5 * (data[idx + 1] - data[idx - 1]);
        }
    });

    parallel::par_for_each_row(gy, |y, row| {
        if y == 0 || y + 1 >= rows {
            return;
        }
        for (x, out) in row.iter_mut().enumerate() {
            *out = 0.5 * (data[(y + 1) * cols + x] - data[(y - 1) * cols + x]);
        }
    });

    Ok(())
}
