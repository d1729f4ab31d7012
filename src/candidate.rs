//! 候选图标（母库）和待匹配图标的特征
//!
//! 母库在处理任何查询之前一次性构建，之后只读共享。

use std::path::{Path, PathBuf};

use indicatif::{ParallelProgressIterator, ProgressBar};
use log::warn;
use rayon::prelude::*;

use crate::cache::FileIdentity;
use crate::config::{NormalizeOptions, OrbOptions};
use crate::error::MatchError;
use crate::normalize::{NormalizedImage, Normalizer};
use crate::orb::{self, Keypoints};
use crate::phash::PoseHashes;
use crate::shape::HuVector;

/// 一个归一化图标的全部描述子
#[derive(Debug, Clone)]
pub struct Features {
    pub image: NormalizedImage,
    pub hu: HuVector,
    pub keypoints: Keypoints,
    pub hashes: PoseHashes,
}

impl Features {
    pub fn aspect_ratio(&self) -> f64 {
        self.image.aspect_ratio()
    }
}

#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    normalizer: Normalizer,
    orb: OrbOptions,
    mirror: bool,
}

impl FeatureExtractor {
    pub fn new(normalize: NormalizeOptions, orb: OrbOptions, mirror: bool) -> Self {
        Self { normalizer: Normalizer::new(normalize), orb, mirror }
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn extract_file<P: AsRef<Path>>(&self, path: P) -> Result<Features, MatchError> {
        self.extract(self.normalizer.normalize_file(path)?)
    }

    pub fn extract(&self, image: NormalizedImage) -> Result<Features, MatchError> {
        let hu = HuVector::compute(&image)?;
        let keypoints = orb::detect(&image, &self.orb)?;
        let hashes = PoseHashes::compute(&image, self.mirror)?;
        Ok(Features { image, hu, keypoints, hashes })
    }
}

#[derive(Debug, Clone)]
pub struct CandidateRecord {
    /// 在 [`CandidateSet`] 中的序号
    pub id: usize,
    pub path: PathBuf,
    pub features: Features,
}

#[derive(Debug, Clone)]
pub struct QueryRecord {
    pub path: PathBuf,
    pub features: Features,
}

impl QueryRecord {
    pub fn load(path: &Path, extractor: &FeatureExtractor) -> Result<Self, MatchError> {
        let features = extractor.extract_file(path)?;
        Ok(Self { path: path.to_path_buf(), features })
    }
}

/// 母库：按路径顺序排列的候选图标，无法归一化的图片被跳过
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    records: Vec<CandidateRecord>,
    skipped: Vec<(PathBuf, String)>,
}

impl CandidateSet {
    pub fn build(paths: &[PathBuf], extractor: &FeatureExtractor, pb: &ProgressBar) -> Self {
        let results = paths
            .par_iter()
            .progress_with(pb.clone())
            .map(|path| (path, extractor.extract_file(path)))
            .collect::<Vec<_>>();

        let mut set = Self::default();
        for (path, result) in results {
            match result {
                Ok(features) => {
                    let id = set.records.len();
                    set.records.push(CandidateRecord { id, path: path.clone(), features });
                }
                Err(e) => {
                    warn!("跳过母库图片 {}: {e}", path.display());
                    set.skipped.push((path.clone(), e.to_string()));
                }
            }
        }
        set
    }

    /// 由已经提取好的特征直接构造，序号按给定顺序分配
    pub fn from_features(items: Vec<(PathBuf, Features)>) -> Self {
        let records = items
            .into_iter()
            .enumerate()
            .map(|(id, (path, features))| CandidateRecord { id, path, features })
            .collect();
        Self { records, skipped: vec![] }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&CandidateRecord> {
        self.records.get(id)
    }

    pub fn records(&self) -> &[CandidateRecord] {
        &self.records
    }

    pub fn skipped(&self) -> &[(PathBuf, String)] {
        &self.skipped
    }

    /// 源文件路径列表，顺序与候选序号一致
    pub fn sources(&self) -> Vec<String> {
        self.records.iter().map(|r| r.path.to_string_lossy().into_owned()).collect()
    }

    pub fn identities(&self) -> Vec<FileIdentity> {
        self.records.iter().map(|r| FileIdentity::of(&r.path)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::tests::draw_symbol;
    use crate::utils::imwrite;

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new(NormalizeOptions::default(), OrbOptions::default(), false)
    }

    #[test]
    fn unreadable_images_are_skipped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let good = dir.path().join("a.png");
        imwrite(&good, &draw_symbol(160, 120))?;
        let bad = dir.path().join("b.png");
        std::fs::write(&bad, b"not an image")?;
        let other = dir.path().join("c.png");
        imwrite(&other, &draw_symbol(120, 160))?;

        let set = CandidateSet::build(&[good.clone(), bad.clone(), other.clone()], &extractor(), &ProgressBar::hidden());
        assert_eq!(set.len(), 2);
        assert_eq!(set.skipped().len(), 1);
        assert_eq!(set.skipped()[0].0, bad);
        // 序号连续，顺序与输入一致
        assert_eq!(set.get(0).unwrap().path, good);
        assert_eq!(set.get(1).unwrap().path, other);
        assert_eq!(set.get(1).unwrap().id, 1);
        assert_eq!(set.sources().len(), 2);
        Ok(())
    }

    #[test]
    fn features_carry_content_aspect() {
        let image = extractor().normalizer().normalize_mat(&draw_symbol(300, 100)).unwrap();
        let features = extractor().extract(image).unwrap();
        assert!(features.aspect_ratio() > 1.5);
        assert!(!features.keypoints.is_empty());
    }
}
