//! 感知哈希，以及对旋转/镜像不敏感的哈希比较

use opencv::core::{self, Mat, Size};
use opencv::imgproc;
use opencv::prelude::*;

use crate::hamming::hamming_u64;
use crate::normalize::{NormalizedImage, Pose};

/// 哈希边长，结果为 8 × 8 = 64 位
const HASH_SIZE: usize = 8;
/// DCT 前的缩放倍数
const HIGH_FREQ: usize = 4;

/// 计算 64 位 pHash
///
/// 缩放到 32×32 后做 DCT，取左上角 8×8 的低频块，以去掉首行首列（直流分量所在）
/// 后的中位数为阈值二值化。位序为行优先，第 0 位在最高位。
pub fn phash(image: &NormalizedImage) -> opencv::Result<u64> {
    let side = (HASH_SIZE * HIGH_FREQ) as i32;
    let mat = image.to_mat()?;
    let mut small = Mat::default();
    imgproc::resize(&mat, &mut small, Size::new(side, side), 0., 0., imgproc::INTER_AREA)?;
    let mut real = Mat::default();
    small.convert_to(&mut real, core::CV_32F, 1., 0.)?;
    let mut freq = Mat::default();
    core::dct(&real, &mut freq, 0)?;

    let data = freq.data_typed::<f32>()?;
    let block = (0..HASH_SIZE)
        .flat_map(|r| (0..HASH_SIZE).map(move |c| (r, c)))
        .map(|(r, c)| data[r * side as usize + c])
        .collect::<Vec<_>>();

    let mut ac = (1..HASH_SIZE)
        .flat_map(|r| (1..HASH_SIZE).map(move |c| block[r * HASH_SIZE + c]))
        .collect::<Vec<_>>();
    ac.sort_by(f32::total_cmp);
    let median = ac[ac.len() / 2];

    Ok(block.iter().fold(0u64, |acc, &v| (acc << 1) | (v > median) as u64))
}

/// 一个图标在每个姿态下的 pHash，按 [`Pose::index`] 存放
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoseHashes {
    hashes: [u64; 8],
    mirror: bool,
}

impl PoseHashes {
    pub fn compute(image: &NormalizedImage, mirror: bool) -> opencv::Result<Self> {
        let mut hashes = [0u64; 8];
        for pose in Pose::search_order(mirror) {
            hashes[pose.index()] = phash(&image.oriented(pose))?;
        }
        Ok(Self { hashes, mirror })
    }

    pub fn get(&self, pose: Pose) -> u64 {
        self.hashes[pose.index()]
    }

    /// 未变换时的哈希
    pub fn identity(&self) -> u64 {
        self.hashes[0]
    }

    /// 找到与 `query` 最接近的姿态，距离相同时保留搜索顺序中靠前的姿态
    pub fn best_against(&self, query: u64, mirror: bool) -> PoseMatch {
        let mirror = mirror && self.mirror;
        let mut best = PoseMatch { distance: u32::MAX, pose: Pose::IDENTITY };
        for pose in Pose::search_order(mirror) {
            let distance = hamming_u64(query, self.get(pose));
            if distance < best.distance {
                best = PoseMatch { distance, pose };
            }
        }
        best
    }
}

/// 姿态搜索的结果：最小汉明距离以及对应的候选姿态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoseMatch {
    pub distance: u32,
    pub pose: Pose,
}

/// 尝试候选图标的所有旋转（以及镜像），返回与查询图标最接近的姿态
pub fn phash_best_rotflip(
    query: &NormalizedImage,
    candidate: &NormalizedImage,
    mirror: bool,
) -> opencv::Result<PoseMatch> {
    let query = phash(query)?;
    Ok(PoseHashes::compute(candidate, mirror)?.best_against(query, mirror))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::config::NormalizeOptions;
    use crate::normalize::Normalizer;
    use crate::normalize::tests::draw_symbol;

    fn symbol() -> NormalizedImage {
        Normalizer::new(NormalizeOptions::default()).normalize_mat(&draw_symbol(200, 160)).unwrap()
    }

    /// 逆时针旋转 k 次
    fn rotate90(image: &NormalizedImage, k: usize) -> NormalizedImage {
        image.rotated_cw((4 - k % 4) % 4)
    }

    #[test]
    fn identical_images_have_zero_distance() {
        let image = symbol();
        assert_eq!(phash(&image).unwrap(), phash(&image.clone()).unwrap());
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    fn rotation_invariance(#[case] k: usize, #[values(false, true)] mirror: bool) {
        let image = symbol();
        let result = phash_best_rotflip(&image, &rotate90(&image, k), mirror).unwrap();
        assert_eq!(result.distance, 0);
        assert_eq!(result.pose, Pose { rotation: k as u16 * 90, mirrored: false });
    }

    #[test]
    fn mirror_invariance() {
        let image = symbol();
        let result = phash_best_rotflip(&image, &image.mirrored(), true).unwrap();
        assert_eq!(result.distance, 0);
        assert!(result.pose.mirrored);
        assert_eq!(result.pose.rotation, 0);
    }

    #[test]
    fn mirror_disabled_searches_four_poses() {
        let image = symbol();
        let hashes = PoseHashes::compute(&image, false).unwrap();
        let result = hashes.best_against(phash(&image.mirrored()).unwrap(), true);
        assert!(!result.pose.mirrored);
    }

    #[test]
    fn different_symbols_are_far_apart() {
        let a = symbol();
        let b = Normalizer::new(NormalizeOptions::default())
            .normalize_mat(&crate::shape::tests::draw_ring(200))
            .unwrap();
        let d = hamming_u64(phash(&a).unwrap(), phash(&b).unwrap());
        assert!(d > 8, "distance = {d}");
    }
}
