//! 单个查询的匹配流程：预筛选 → 验证 → 排序 → 取前 K 个
//!
//! 预筛选结果为空、或者预筛选出的候选全部被门限拒绝时，依次退回到完整母库和不设门限的完整母库，
//! 只要母库非空，每个查询至少得到一个结果。

use std::cmp::Ordering;
use std::path::PathBuf;

use indicatif::{ParallelProgressIterator, ProgressBar};
use log::{debug, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::candidate::{CandidateSet, FeatureExtractor, QueryRecord};
use crate::error::MatchError;
use crate::index::Prefilter;
use crate::normalize::Pose;
use crate::verify::{MatchScore, Verifier};

/// 最终得分来自哪一轮验证
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    /// 预筛选的候选
    Shortlist,
    /// 完整母库（没有预筛选，或者预筛选的候选全部被拒绝）
    FullSet,
    /// 不设门限的完整母库
    Ungated,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub query_path: PathBuf,
    /// 按综合得分升序，至多 K 个
    pub scores: Vec<MatchScore>,
    pub stage: Stage,
}

impl MatchResult {
    pub fn best(&self) -> Option<&MatchScore> {
        self.scores.first()
    }

    /// 最佳候选相对查询的姿态，供下游对齐图块使用
    pub fn pose_hint(&self) -> Option<Pose> {
        self.best().map(|s| Pose { rotation: s.rotation, mirrored: s.mirrored })
    }
}

/// 批量匹配的结果，`skipped` 记录失败的查询及原因
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub matched: Vec<(QueryRecord, MatchResult)>,
    pub skipped: Vec<(PathBuf, String)>,
}

pub struct Matcher<'a> {
    candidates: &'a CandidateSet,
    verifier: Verifier,
    prefilter: Option<&'a Prefilter>,
    top_k: usize,
}

impl<'a> Matcher<'a> {
    pub fn new(candidates: &'a CandidateSet, verifier: Verifier, top_k: usize) -> Self {
        Self { candidates, verifier, prefilter: None, top_k: top_k.max(1) }
    }

    pub fn with_prefilter(mut self, prefilter: Option<&'a Prefilter>) -> Self {
        self.prefilter = prefilter;
        self
    }

    pub fn match_query(&self, query: &QueryRecord) -> Result<MatchResult, MatchError> {
        let shortlist = match self.prefilter {
            Some(prefilter) => prefilter.shortlist(&query.features.image).unwrap_or_else(|e| {
                warn!("预筛选失败，改为验证完整母库 {}: {e}", query.path.display());
                vec![]
            }),
            None => vec![],
        };

        let all = || 0..self.candidates.len();
        let (mut scores, mut stage) = if shortlist.is_empty() {
            (self.verify_ids(query, all(), true)?, Stage::FullSet)
        } else {
            (self.verify_ids(query, shortlist.iter().copied(), true)?, Stage::Shortlist)
        };
        if scores.is_empty() && stage == Stage::Shortlist {
            debug!("预筛选候选全部被拒绝，验证完整母库: {}", query.path.display());
            scores = self.verify_ids(query, all(), true)?;
            stage = Stage::FullSet;
        }
        if scores.is_empty() {
            debug!("所有候选都未通过门限，不设门限重新验证: {}", query.path.display());
            scores = self.verify_ids(query, all(), false)?;
            stage = Stage::Ungated;
        }

        scores.sort_by(compare_scores);
        scores.truncate(self.top_k);
        Ok(MatchResult { query_path: query.path.clone(), scores, stage })
    }

    fn verify_ids(
        &self,
        query: &QueryRecord,
        ids: impl Iterator<Item = usize>,
        gated: bool,
    ) -> Result<Vec<MatchScore>, MatchError> {
        let mut scores = vec![];
        for candidate in ids.filter_map(|id| self.candidates.get(id)) {
            if let Some(score) = self.verifier.verify(&query.features, candidate, gated)? {
                scores.push(score);
            }
        }
        Ok(scores)
    }

    /// 并行匹配所有查询，输出顺序与输入一致
    pub fn match_all(&self, paths: &[PathBuf], extractor: &FeatureExtractor, pb: &ProgressBar) -> BatchOutcome {
        let results = paths
            .par_iter()
            .progress_with(pb.clone())
            .map(|path| {
                let query = QueryRecord::load(path, extractor)?;
                let result = self.match_query(&query)?;
                Ok::<_, MatchError>((query, result))
            })
            .collect::<Vec<_>>();

        let mut outcome = BatchOutcome::default();
        for (path, result) in paths.iter().zip(results) {
            match result {
                Ok(matched) => outcome.matched.push(matched),
                Err(e) => {
                    warn!("跳过 {}: {e}", path.display());
                    outcome.skipped.push((path.clone(), e.to_string()));
                }
            }
        }
        outcome
    }
}

/// 综合得分升序，相同时候选序号小的在前
pub fn compare_scores(a: &MatchScore, b: &MatchScore) -> Ordering {
    a.composite_score.total_cmp(&b.composite_score).then(a.candidate_id.cmp(&b.candidate_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NormalizeOptions, OrbOptions};
    use crate::normalize::tests::draw_symbol;
    use crate::shape::tests::draw_ring;
    use crate::verify::ScoringConfig;

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new(NormalizeOptions::default(), OrbOptions::default(), false)
    }

    fn features(mat: &opencv::core::Mat) -> crate::candidate::Features {
        let ex = extractor();
        ex.extract(ex.normalizer().normalize_mat(mat).unwrap()).unwrap()
    }

    fn candidates() -> CandidateSet {
        CandidateSet::from_features(vec![
            (PathBuf::from("ring.png"), features(&draw_ring(200))),
            (PathBuf::from("symbol.png"), features(&draw_symbol(200, 200))),
        ])
    }

    fn query(mat: &opencv::core::Mat) -> QueryRecord {
        QueryRecord { path: PathBuf::from("q.png"), features: features(mat) }
    }

    #[test]
    fn identical_symbol_ranks_first() {
        let set = candidates();
        let matcher = Matcher::new(&set, Verifier::new(ScoringConfig::default(), false), 5);
        let result = matcher.match_query(&query(&draw_symbol(200, 200))).unwrap();
        assert_eq!(result.best().unwrap().candidate_id, 1);
        assert_eq!(result.best().unwrap().phash_distance, 0);
        assert_eq!(result.pose_hint(), Some(Pose::IDENTITY));
        assert_eq!(result.stage, Stage::FullSet);
    }

    #[test]
    fn gates_never_leave_a_query_without_answer() {
        let set = candidates();
        let config = ScoringConfig { aspect_gate: 0., phash_ceiling: 0, ..ScoringConfig::default() };
        let matcher = Matcher::new(&set, Verifier::new(config, false), 5);
        // 宽高比 3:1 的查询不会通过任何门限
        let result = matcher.match_query(&query(&draw_symbol(300, 100))).unwrap();
        assert_eq!(result.stage, Stage::Ungated);
        assert_eq!(result.scores.len(), 2);
    }

    #[test]
    fn top_k_truncates() {
        let set = candidates();
        let matcher = Matcher::new(&set, Verifier::new(ScoringConfig::default(), false), 1);
        let config = ScoringConfig { aspect_gate: 0., phash_ceiling: 0, ..ScoringConfig::default() };
        let result = matcher.match_query(&query(&draw_symbol(200, 200))).unwrap();
        assert_eq!(result.scores.len(), 1);
        let ungated = Matcher::new(&set, Verifier::new(config, false), 1)
            .match_query(&query(&draw_symbol(300, 100)))
            .unwrap();
        assert_eq!(ungated.scores.len(), 1);
    }

    #[test]
    fn ties_break_by_candidate_id() {
        let mut a = MatchScore {
            candidate_id: 3,
            phash_distance: 0,
            good_matches: 0,
            inliers: 0,
            shape_distance: 0.,
            chamfer_distance: 0.,
            aspect_penalty: 0.,
            composite_score: 1.5,
            rotation: 0,
            mirrored: false,
            accepted: false,
        };
        let mut b = a.clone();
        b.candidate_id = 1;
        let mut scores = vec![a.clone(), b.clone()];
        scores.sort_by(compare_scores);
        assert_eq!(scores[0].candidate_id, 1);
        a.composite_score = 1.0;
        b.composite_score = 2.0;
        assert_eq!(compare_scores(&a, &b), Ordering::Less);
    }

    #[test]
    fn repeated_runs_are_identical() {
        let set = candidates();
        let matcher = Matcher::new(&set, Verifier::new(ScoringConfig::default(), true), 5);
        let q = query(&draw_symbol(220, 180));
        let first = matcher.match_query(&q).unwrap();
        let second = matcher.match_query(&q).unwrap();
        assert_eq!(first.scores, second.scores);
    }
}
