use std::cell::RefCell;
use std::collections::HashMap;

use log::debug;
use opencv::calib3d;
use opencv::core::{self, KeyPoint, Mat, Point2f, Ptr, Scalar, Vector};
use opencv::features2d::{self, ORB, ORB_ScoreType};
use opencv::prelude::*;

use crate::config::OrbOptions;
use crate::error::MatchError;
use crate::hamming::ratio_matches;
use crate::normalize::NormalizedImage;

/// 检测前在画布四周补的空白，避免贴边的笔画因为描述子邻域越界而被丢弃
pub const BORDER: i32 = 32;

thread_local! {
    // opencv 的 ORB 对象不能跨线程共享，每个线程按参数缓存一份
    static DETECTORS: RefCell<HashMap<DetectorKey, Ptr<ORB>>> = RefCell::new(HashMap::new());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DetectorKey {
    nfeatures: i32,
    scale_factor: u32,
    nlevels: i32,
    fast_threshold: i32,
    patch_size: i32,
}

impl From<&OrbOptions> for DetectorKey {
    fn from(opts: &OrbOptions) -> Self {
        Self {
            nfeatures: opts.orb_nfeatures,
            scale_factor: opts.orb_scale_factor.to_bits(),
            nlevels: opts.orb_nlevels,
            fast_threshold: opts.orb_fast_threshold,
            patch_size: opts.orb_patch_size,
        }
    }
}

fn create_detector(opts: &OrbOptions) -> opencv::Result<Ptr<ORB>> {
    ORB::create(
        opts.orb_nfeatures,
        opts.orb_scale_factor,
        opts.orb_nlevels,
        opts.orb_patch_size,
        0,
        2,
        ORB_ScoreType::HARRIS_SCORE,
        opts.orb_patch_size,
        opts.orb_fast_threshold,
    )
}

/// 一张图的特征点坐标和 256 位描述子，两者一一对应
///
/// 坐标位于补边后的画布上。
#[derive(Debug, Clone, Default)]
pub struct Keypoints {
    pub points: Vec<Point2f>,
    pub descriptors: Vec<[u8; 32]>,
}

impl Keypoints {
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// 在补边后的画布上检测 ORB 特征点，同时返回画布，便于调试时绘制
pub fn detect_with_canvas(
    image: &NormalizedImage,
    opts: &OrbOptions,
) -> opencv::Result<(Mat, Vector<KeyPoint>, Keypoints)> {
    let mat = image.to_mat()?;
    let mut padded = Mat::default();
    core::copy_make_border(
        &mat,
        &mut padded,
        BORDER,
        BORDER,
        BORDER,
        BORDER,
        core::BORDER_CONSTANT,
        Scalar::all(0.),
    )?;

    let mut kps = Vector::<KeyPoint>::new();
    let mut des = Mat::default();
    DETECTORS.with(|cell| -> opencv::Result<()> {
        let mut detectors = cell.borrow_mut();
        let key = DetectorKey::from(opts);
        if !detectors.contains_key(&key) {
            detectors.insert(key, create_detector(opts)?);
        }
        if let Some(orb) = detectors.get_mut(&key) {
            orb.detect_and_compute(&padded, &core::no_array(), &mut kps, &mut des, false)?;
        }
        Ok(())
    })?;

    let descriptors = if des.empty() {
        vec![]
    } else {
        des.data_bytes()?
            .chunks_exact(32)
            .map(|c| {
                let mut d = [0u8; 32];
                d.copy_from_slice(c);
                d
            })
            .collect()
    };
    let points = kps.iter().map(|kp| kp.pt()).collect();
    Ok((padded, kps, Keypoints { points, descriptors }))
}

pub fn detect(image: &NormalizedImage, opts: &OrbOptions) -> opencv::Result<Keypoints> {
    detect_with_canvas(image, opts).map(|(_, _, kps)| kps)
}

/// 比值检验后剩下的匹配对
pub fn good_matches(query: &Keypoints, train: &Keypoints, ratio: f32) -> Vec<(usize, usize)> {
    ratio_matches(&query.descriptors, &train.descriptors, ratio)
}

/// 用 RANSAC 拟合单应矩阵，返回内点数量
///
/// 匹配点不足或拟合失败时记为 0 个内点。
pub fn homography_inliers(
    query: &Keypoints,
    train: &Keypoints,
    matches: &[(usize, usize)],
    reproj_threshold: f64,
    min_correspondences: usize,
) -> usize {
    fit_homography(query, train, matches, reproj_threshold, min_correspondences).unwrap_or_else(|e| {
        debug!("单应矩阵拟合跳过: {e}");
        0
    })
}

/// 匹配点少于 `min_correspondences`（且至少 4 个）时返回 [`MatchError::GeometricFitUnavailable`]
pub fn fit_homography(
    query: &Keypoints,
    train: &Keypoints,
    matches: &[(usize, usize)],
    reproj_threshold: f64,
    min_correspondences: usize,
) -> Result<usize, MatchError> {
    let required = min_correspondences.max(4);
    if matches.len() < required {
        return Err(MatchError::GeometricFitUnavailable { found: matches.len(), required });
    }
    let src = matches.iter().map(|&(q, _)| query.points[q]).collect::<Vector<Point2f>>();
    let dst = matches.iter().map(|&(_, t)| train.points[t]).collect::<Vector<Point2f>>();
    let mut mask = Mat::default();
    let h = calib3d::find_homography(&src, &dst, &mut mask, calib3d::RANSAC, reproj_threshold)?;
    if h.empty() || mask.empty() {
        return Ok(0);
    }
    Ok(mask.data_bytes()?.iter().filter(|&&v| v != 0).count())
}

/// 在补边后的画布上绘制特征点
pub fn draw_keypoints(canvas: &Mat, keypoints: &Vector<KeyPoint>) -> opencv::Result<Mat> {
    let mut output = Mat::default();
    features2d::draw_keypoints(
        canvas,
        keypoints,
        &mut output,
        Scalar::all(-1.),
        features2d::DrawMatchesFlags::DEFAULT,
    )?;
    Ok(output)
}
