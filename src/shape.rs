//! 形状描述子：Hu 矩、Chamfer 距离和宽高比惩罚

use opencv::core::{self, Mat, Size};
use opencv::imgproc;
use opencv::prelude::*;

use crate::normalize::NormalizedImage;

/// Chamfer 距离的重采样边长
pub const CHAMFER_SIZE: i32 = 512;
/// 任一图像没有墨迹时的 Chamfer 距离
pub const CHAMFER_EMPTY: f64 = 999.;

/// 7 个 Hu 不变矩，已经做了带符号的对数压缩
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HuVector(pub [f64; 7]);

impl HuVector {
    pub fn compute(image: &NormalizedImage) -> opencv::Result<Self> {
        let mat = image.to_mat()?;
        let mut edges = Mat::default();
        imgproc::canny_def(&mat, &mut edges, 50., 150.)?;
        let moments = imgproc::moments(&edges, false)?;
        let mut hu = Mat::default();
        imgproc::hu_moments(moments, &mut hu)?;

        let mut v = [0f64; 7];
        for (dst, &h) in v.iter_mut().zip(hu.data_typed::<f64>()?) {
            // f64::signum(0.0) 是 1.0，这里需要 0
            let sign = if h == 0. { 0. } else { h.signum() };
            *dst = sign * (h.abs() + 1e-12).log10();
        }
        Ok(Self(v))
    }

    /// 欧氏距离
    pub fn distance(&self, other: &Self) -> f64 {
        self.0.iter().zip(&other.0).map(|(a, b)| (a - b).powi(2)).sum::<f64>().sqrt()
    }
}

/// 对称 Chamfer 距离，按重采样画布的对角线归一化后乘以 100
pub fn chamfer_distance(query: &NormalizedImage, candidate: &NormalizedImage) -> opencv::Result<f64> {
    let (q, dq) = ink_and_distance(query)?;
    let (c, dc) = ink_and_distance(candidate)?;
    let (Some(q_to_c), Some(c_to_q)) = (mean_at_ink(&q, &dc), mean_at_ink(&c, &dq)) else {
        return Ok(CHAMFER_EMPTY);
    };
    let diagonal = std::f64::consts::SQRT_2 * CHAMFER_SIZE as f64;
    Ok((q_to_c + c_to_q) / 2. / diagonal * 100.)
}

/// 重采样后的墨迹掩码，以及每个像素到最近墨迹的距离
fn ink_and_distance(image: &NormalizedImage) -> opencv::Result<(Vec<bool>, Vec<f32>)> {
    let mat = image.to_mat()?;
    let mut resized = Mat::default();
    imgproc::resize(
        &mat,
        &mut resized,
        Size::new(CHAMFER_SIZE, CHAMFER_SIZE),
        0.,
        0.,
        imgproc::INTER_NEAREST,
    )?;
    // distance_transform 计算的是到最近零像素的距离，所以墨迹要取反成 0
    let mut background = Mat::default();
    core::bitwise_not_def(&resized, &mut background)?;
    let mut dist = Mat::default();
    imgproc::distance_transform_def(&background, &mut dist, imgproc::DIST_L2, 3)?;

    let ink = resized.data_bytes()?.iter().map(|&v| v > 0).collect();
    Ok((ink, dist.data_typed::<f32>()?.to_vec()))
}

fn mean_at_ink(ink: &[bool], dist: &[f32]) -> Option<f64> {
    let (sum, n) = ink
        .iter()
        .zip(dist)
        .filter(|(i, _)| **i)
        .fold((0f64, 0usize), |(s, n), (_, &d)| (s + d as f64, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// 宽高比惩罚：两个宽高比的对数差的绝对值
///
/// 候选图标旋转 90° 后宽高比会取倒数，所以同时比较两种朝向，取较小者。
pub fn aspect_penalty(query: f64, candidate: f64) -> f64 {
    let upright = (query / candidate).ln().abs();
    let turned = (query * candidate).ln().abs();
    upright.min(turned)
}

#[cfg(test)]
pub(crate) mod tests {
    use opencv::core::{Point, Rect, Scalar};

    use super::*;
    use crate::config::NormalizeOptions;
    use crate::normalize::Normalizer;
    use crate::normalize::tests::draw_symbol;

    /// 白底黑色同心圆环，带外框
    pub fn draw_ring(size: i32) -> Mat {
        let mut img =
            Mat::new_rows_cols_with_default(size, size, core::CV_8UC1, Scalar::all(255.)).unwrap();
        imgproc::rectangle(&mut img, Rect::new(0, 0, size, size), Scalar::all(0.), 2, imgproc::LINE_8, 0)
            .unwrap();
        let c = Point::new(size / 2, size / 2);
        for r in [size / 3, size / 5] {
            imgproc::circle(&mut img, c, r, Scalar::all(0.), 3, imgproc::LINE_8, 0).unwrap();
        }
        img
    }

    fn normalize(mat: &Mat) -> NormalizedImage {
        Normalizer::new(NormalizeOptions::default()).normalize_mat(mat).unwrap()
    }

    #[test]
    fn hu_distance_to_self_is_zero() {
        let image = normalize(&draw_symbol(200, 160));
        let hu = HuVector::compute(&image).unwrap();
        assert_eq!(hu.distance(&hu), 0.);
        assert!(hu.0.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn hu_distance_separates_shapes() {
        let a = HuVector::compute(&normalize(&draw_symbol(200, 160))).unwrap();
        let b = HuVector::compute(&normalize(&draw_ring(200))).unwrap();
        assert!(a.distance(&b) > 0.1);
    }

    #[test]
    fn chamfer_is_zero_for_identical_and_symmetric() {
        let a = normalize(&draw_symbol(200, 160));
        let b = normalize(&draw_ring(200));
        assert!(chamfer_distance(&a, &a).unwrap().abs() < 1e-9);
        let ab = chamfer_distance(&a, &b).unwrap();
        let ba = chamfer_distance(&b, &a).unwrap();
        assert!(ab > 0.);
        assert!((ab - ba).abs() < 1e-9);
    }

    #[test]
    fn chamfer_of_empty_image() {
        let a = normalize(&draw_symbol(200, 160));
        let empty = NormalizedImage::blank(a.width(), a.height());
        assert_eq!(chamfer_distance(&a, &empty).unwrap(), CHAMFER_EMPTY);
    }

    #[test]
    fn aspect_penalty_is_orientation_free() {
        assert_eq!(aspect_penalty(1., 1.), 0.);
        assert!((aspect_penalty(1., 3.) - 3f64.ln()).abs() < 1e-12);
        assert!((aspect_penalty(2., 0.5)).abs() < 1e-12);
        assert!((aspect_penalty(2., 3.) - aspect_penalty(3., 2.)).abs() < 1e-12);
    }
}
