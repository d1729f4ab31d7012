//! 候选验证和打分
//!
//! 对一对（查询，候选）依次执行：宽高比门限、姿态感知的 pHash 门限、
//! ORB 匹配与单应矩阵内点统计、Hu 矩距离、按姿态对齐后的 Chamfer 距离，
//! 最后合成为一个越小越好的综合得分。

use serde::{Deserialize, Serialize};

use crate::candidate::{CandidateRecord, Features};
use crate::error::MatchError;
use crate::orb::{good_matches, homography_inliers};
use crate::shape::{aspect_penalty, chamfer_distance};

/// 综合得分的权重和上限
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub phash: f64,
    pub chamfer: f64,
    pub chamfer_cap: f64,
    pub aspect: f64,
    pub aspect_cap: f64,
    pub shape: f64,
    pub shape_cap: f64,
    /// 比值检验后匹配数的奖励
    pub good: f64,
    pub good_cap: usize,
    /// 单应矩阵内点数的奖励
    pub inliers: f64,
    pub inliers_cap: usize,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            phash: 1.0,
            chamfer: 2.2,
            chamfer_cap: 8.0,
            aspect: 6.0,
            aspect_cap: 0.8,
            shape: 0.6,
            shape_cap: 5.0,
            good: 0.1,
            good_cap: 40,
            inliers: 0.25,
            inliers_cap: 40,
        }
    }
}

impl ScoreWeights {
    pub fn composite(&self, s: &MatchScore) -> f64 {
        self.phash * s.phash_distance as f64
            + self.chamfer * s.chamfer_distance.min(self.chamfer_cap)
            + self.aspect * s.aspect_penalty.min(self.aspect_cap)
            + self.shape * s.shape_distance.min(self.shape_cap)
            - self.good * s.good_matches.min(self.good_cap) as f64
            - self.inliers * s.inliers.min(self.inliers_cap) as f64
    }
}

/// 是否接受最佳匹配，三条规则满足任意一条即可
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptPolicy {
    pub strict_phash: u32,
    pub strict_good: usize,
    pub strict_inliers: usize,
    pub loose_phash: u32,
    pub loose_inliers: usize,
    pub shape_max: f64,
    pub shape_good: usize,
}

impl Default for AcceptPolicy {
    fn default() -> Self {
        Self {
            strict_phash: 12,
            strict_good: 12,
            strict_inliers: 10,
            loose_phash: 18,
            loose_inliers: 14,
            shape_max: 0.55,
            shape_good: 16,
        }
    }
}

impl AcceptPolicy {
    pub fn accepts(&self, s: &MatchScore) -> bool {
        (s.phash_distance <= self.strict_phash
            && (s.good_matches >= self.strict_good || s.inliers >= self.strict_inliers))
            || (s.phash_distance <= self.loose_phash && s.inliers >= self.loose_inliers)
            || (s.shape_distance <= self.shape_max && s.good_matches >= self.shape_good)
    }
}

/// 打分参数，可以从 JSON 文件读取，缺省字段取默认值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// 宽高比惩罚超过该值的候选直接跳过
    pub aspect_gate: f64,
    /// pHash 距离超过该值的候选直接跳过
    pub phash_ceiling: u32,
    pub ratio: f32,
    pub ransac_reproj: f64,
    /// 拟合单应矩阵所需的最少匹配数
    pub min_correspondences: usize,
    pub weights: ScoreWeights,
    pub accept: AcceptPolicy,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            aspect_gate: 0.45,
            phash_ceiling: 26,
            ratio: 0.75,
            ransac_reproj: 3.0,
            min_correspondences: 8,
            weights: ScoreWeights::default(),
            accept: AcceptPolicy::default(),
        }
    }
}

/// 一对（查询，候选）的打分结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchScore {
    pub candidate_id: usize,
    pub phash_distance: u32,
    pub good_matches: usize,
    pub inliers: usize,
    pub shape_distance: f64,
    pub chamfer_distance: f64,
    pub aspect_penalty: f64,
    pub composite_score: f64,
    /// 候选需要顺时针旋转的角度（在镜像之后）
    pub rotation: u16,
    pub mirrored: bool,
    pub accepted: bool,
}

#[derive(Debug, Clone)]
pub struct Verifier {
    config: ScoringConfig,
    mirror: bool,
}

impl Verifier {
    pub fn new(config: ScoringConfig, mirror: bool) -> Self {
        Self { config, mirror }
    }

    /// 计算一对图标的得分；`gated` 为真时，未通过宽高比或 pHash 门限的候选返回 None
    pub fn verify(
        &self,
        query: &Features,
        candidate: &CandidateRecord,
        gated: bool,
    ) -> Result<Option<MatchScore>, MatchError> {
        let cfg = &self.config;
        let cand = &candidate.features;

        let ap = aspect_penalty(query.aspect_ratio(), cand.aspect_ratio());
        if gated && ap > cfg.aspect_gate {
            return Ok(None);
        }

        let pose = cand.hashes.best_against(query.hashes.identity(), self.mirror);
        if gated && pose.distance > cfg.phash_ceiling {
            return Ok(None);
        }

        let matches = good_matches(&query.keypoints, &cand.keypoints, cfg.ratio);
        let inliers = homography_inliers(
            &query.keypoints,
            &cand.keypoints,
            &matches,
            cfg.ransac_reproj,
            cfg.min_correspondences,
        );
        let shape = query.hu.distance(&cand.hu);
        let chamfer = chamfer_distance(&query.image, &cand.image.oriented(pose.pose))?;

        let mut score = MatchScore {
            candidate_id: candidate.id,
            phash_distance: pose.distance,
            good_matches: matches.len(),
            inliers,
            shape_distance: shape,
            chamfer_distance: chamfer,
            aspect_penalty: ap,
            composite_score: 0.,
            rotation: pose.pose.rotation,
            mirrored: pose.pose.mirrored,
            accepted: false,
        };
        score.composite_score = cfg.weights.composite(&score);
        score.accepted = cfg.accept.accepts(&score);
        Ok(Some(score))
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn score() -> MatchScore {
        MatchScore {
            candidate_id: 0,
            phash_distance: 10,
            good_matches: 5,
            inliers: 3,
            shape_distance: 1.0,
            chamfer_distance: 2.0,
            aspect_penalty: 0.1,
            composite_score: 0.,
            rotation: 0,
            mirrored: false,
            accepted: false,
        }
    }

    #[test]
    fn composite_uses_default_weights() {
        let s = score();
        let expected = 10. + 2.2 * 2.0 + 6.0 * 0.1 + 0.6 * 1.0 - 0.1 * 5. - 0.25 * 3.;
        assert!((ScoreWeights::default().composite(&s) - expected).abs() < 1e-9);
    }

    #[test]
    fn caps_limit_each_term() {
        let w = ScoreWeights::default();
        let mut s = score();
        s.chamfer_distance = 999.;
        s.good_matches = 1000;
        s.inliers = 1000;
        let expected = 10. + 2.2 * 8. + 6.0 * 0.1 + 0.6 * 1.0 - 0.1 * 40. - 0.25 * 40.;
        assert!((w.composite(&s) - expected).abs() < 1e-9);
    }

    #[test]
    fn score_is_monotonic() {
        let w = ScoreWeights::default();
        let mut prev = f64::NEG_INFINITY;
        for chamfer in [0., 0.5, 3., 7.9, 8., 20., 999.] {
            let s = MatchScore { chamfer_distance: chamfer, ..score() };
            let c = w.composite(&s);
            assert!(c >= prev);
            prev = c;
        }
        let mut prev = f64::INFINITY;
        for inliers in [0, 1, 8, 39, 40, 41, 500] {
            let s = MatchScore { inliers, ..score() };
            let c = w.composite(&s);
            assert!(c <= prev);
            prev = c;
        }
    }

    #[rstest]
    #[case(12, 12, 0, 9.0, true)]
    #[case(12, 0, 10, 9.0, true)]
    #[case(13, 12, 9, 9.0, false)]
    #[case(18, 0, 14, 9.0, true)]
    #[case(19, 0, 14, 9.0, false)]
    #[case(26, 16, 0, 0.55, true)]
    #[case(26, 15, 0, 0.55, false)]
    #[case(26, 16, 0, 0.56, false)]
    fn accept_policy_clauses(
        #[case] phash_distance: u32,
        #[case] good_matches: usize,
        #[case] inliers: usize,
        #[case] shape_distance: f64,
        #[case] expected: bool,
    ) {
        let s = MatchScore { phash_distance, good_matches, inliers, shape_distance, ..score() };
        assert_eq!(AcceptPolicy::default().accepts(&s), expected);
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: ScoringConfig = serde_json::from_str(r#"{ "accept": { "strict_phash": 10 } }"#).unwrap();
        assert_eq!(cfg.accept.strict_phash, 10);
        assert_eq!(cfg.accept.loose_phash, 18);
        assert_eq!(cfg.phash_ceiling, 26);
        assert_eq!(cfg.weights, ScoreWeights::default());
    }
}
