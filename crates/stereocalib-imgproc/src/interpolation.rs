use stereocalib_image::Image;

/// Sample a single channel image at a sub-pixel location.
///
/// Pixel centres are at integer coordinates. Returns `None` when the 2x2
/// neighbourhood of `(u, v)` is not fully inside the image.
pub fn bilinear(image: &Image<f32, 1>, u: f64, v: f64) -> Option<f32> {
    let (cols, rows) = (image.cols(), image.rows());
    if !(u >= 0.0 && v >= 0.0) {
        return None;
    }
    let (x0, y0) = (u.floor() as usize, v.floor() as usize);
    if x0 + 1 >= cols || y0 + 1 >= rows {
        return None;
    }
    let (ax, ay) = ((u - x0 as f64) as f32, (v - y0 as f64) as f32);
    let data = image.as_slice();
    let idx = y0 * cols + x0;

    let top = data[idx] * (1.0 - ax) + data[idx + 1] * ax;
    let bottom = data[idx + cols] * (1.0 - ax) + data[idx + cols + 1] * ax;
    Some(top * (1.0 - ay) + bottom * ay)
}
