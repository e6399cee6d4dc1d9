use rayon::prelude::*;
use stereocalib_image::{Image, ImageError};

/// Compute the saddle point response of an image.
///
/// The response is the negated determinant of the Hessian, `dxy² − dxx·dyy`.
/// It is positive at X-junctions such as the inner corners of a chessboard,
/// zero along straight edges and negative at blobs.
///
/// # Arguments
///
/// * `src` - The source image with shape (H, W), usually blurred.
/// * `dst` - The destination image with shape (H, W). Border pixels are set to zero.
pub fn saddle_response(src: &Image<f32, 1>, dst: &mut Image<f32, 1>) -> Result<(), ImageError> {
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

    dst.as_slice_mut()
        .par_chunks_exact_mut(cols)
        .enumerate()
        .for_each(|(row_idx, row_chunk)| {
            if row_idx == 0 || row_idx + 1 >= rows {
                row_chunk.iter_mut().for_each(|v| *v = 0.0);
                return;
            }

            let row_offset = row_idx * cols;

            row_chunk
                .iter_mut()
                .enumerate()
                .for_each(|(col_idx, dst_pixel)| {
                    if col_idx == 0 || col_idx + 1 >= cols {
                        *dst_pixel = 0.0;
                        return;
                    }

                    let current_idx = row_offset + col_idx;
                    let prev_row_idx = current_idx - cols;
                    let next_row_idx = current_idx + cols;

                    let v11 = src_data[prev_row_idx - 1];
                    let v12 = src_data[prev_row_idx];
                    let v13 = src_data[prev_row_idx + 1];
                    let v21 = src_data[current_idx - 1];
                    let v22 = src_data[current_idx];
                    let v23 = src_data[current_idx + 1];
                    let v31 = src_data[next_row_idx - 1];
                    let v32 = src_data[next_row_idx];
                    let v33 = src_data[next_row_idx + 1];

                    let dxx = v21 - 2.0 * v22 + v23;
                    let dyy = v12 - 2.0 * v22 + v32;
                    let dxy = 0.25 * (v33 - v31 - v13 + v11);

                    *dst_pixel = dxy * dxy - dxx * dyy;
                });
        });

    Ok(())
}

/// A local maximum of a response map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    /// Column of the peak.
    pub x: usize,
    /// Row of the peak.
    pub y: usize,
    /// Response value at the peak.
    pub score: f32,
}

/// Extract local maxima of a response map with non-maximum suppression.
///
/// A pixel is kept when its response is above `threshold_rel` times the
/// global maximum and it dominates every pixel within `radius`. Ties go to
/// the first pixel in raster order, so the result is deterministic. Pixels
/// closer than `border` to the image edge are ignored.
///
/// The peaks are returned sorted by decreasing score.
pub fn find_peaks(
    response: &Image<f32, 1>,
    threshold_rel: f32,
    radius: usize,
    border: usize,
) -> Vec<Peak> {
    let (cols, rows) = (response.cols(), response.rows());
    let data = response.as_slice();

    let max_response = data.iter().copied().fold(0.0f32, f32::max);
    if max_response <= 0.0 {
        return Vec::new();
    }
    let threshold = threshold_rel * max_response;

    let border = border.max(radius);
    if cols <= 2 * border || rows <= 2 * border {
        return Vec::new();
    }

    let mut peaks: Vec<Peak> = (border..rows - border)
        .into_par_iter()
        .flat_map_iter(|y| {
            (border..cols - border).filter_map(move |x| {
                let idx = y * cols + x;
                let score = data[idx];
                if score <= threshold {
                    return None;
                }
                for ny in y - radius..=y + radius {
                    for nx in x - radius..=x + radius {
                        let nidx = ny * cols + nx;
                        if nidx == idx {
                            continue;
                        }
                        let other = data[nidx];
                        // earlier pixels win ties
                        if other > score || (other == score && nidx < idx) {
                            return None;
                        }
                    }
                }
                Some(Peak { x, y, score })
            })
        })
        .collect();

    peaks.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.y.cmp(&b.y))
            .then(a.x.cmp(&b.x))
    });
    peaks
}

#[cfg(test)]
mod tests {
    use super::*;
    use stereocalib_image::ImageSize;

    #[test]
    fn test_saddle_response_signs() -> Result<(), ImageError> {
        let size = ImageSize {
            width: 9,
            height: 9,
        };
        // f = x * y is a saddle, f = x² + y² a blob, f = x an edge-like ramp
        let saddle = Image::<f32, 1>::from_fn(size, |x, y| {
            [(x as f32 - 4.0) * (y as f32 - 4.0)]
        })?;
        let blob = Image::<f32, 1>::from_fn(size, |x, y| {
            [(x as f32 - 4.0).powi(2) + (y as f32 - 4.0).powi(2)]
        })?;
        let ramp = Image::<f32, 1>::from_fn(size, |x, _| [x as f32])?;

        let mut dst = Image::<f32, 1>::from_size_val(size, 0.0)?;
        saddle_response(&saddle, &mut dst)?;
        assert_eq!(dst.get_pixel(4, 4, 0)?, 1.0);
        assert_eq!(dst.get_pixel(0, 4, 0)?, 0.0);

        saddle_response(&blob, &mut dst)?;
        assert_eq!(dst.get_pixel(4, 4, 0)?, -4.0);

        saddle_response(&ramp, &mut dst)?;
        assert_eq!(dst.get_pixel(4, 4, 0)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_find_peaks() -> Result<(), ImageError> {
        let size = ImageSize {
            width: 20,
            height: 12,
        };
        let mut response = Image::<f32, 1>::from_size_val(size, 0.0)?;
        {
            let data = response.as_slice_mut();
            data[5 * 20 + 5] = 10.0;
            data[5 * 20 + 6] = 9.0;
            data[6 * 20 + 14] = 4.0;
            // plateau: only the first in raster order survives
            data[8 * 20 + 9] = 3.0;
            data[8 * 20 + 10] = 3.0;
            // below the relative threshold
            data[3 * 20 + 16] = 0.5;
        }

        let peaks = find_peaks(&response, 0.1, 2, 2);
        let coords: Vec<_> = peaks.iter().map(|p| (p.x, p.y)).collect();
        assert_eq!(coords, vec![(5, 5), (14, 6), (9, 8)]);
        Ok(())
    }
}
