//! 母库的多姿态嵌入索引，用于预筛选候选图标

use std::sync::Arc;
use std::time::Instant;

use indicatif::{ParallelProgressIterator, ProgressBar};
use log::{debug, info, warn};
use ndarray::{Array2, ArrayView2, Axis, concatenate};
use rayon::prelude::*;

use crate::ann::{self, AnnIndex};
use crate::cache::{CachedEmbeddings, EmbeddingCache, cache_key};
use crate::candidate::CandidateSet;
use crate::config::PrefilterOptions;
use crate::embed::{Embedder, orientation_variants, orientations};
use crate::error::MatchError;
use crate::normalize::NormalizedImage;

/// 每个姿态查询向量至少取回的行数
const MIN_ROWS_PER_QUERY: usize = 50;

pub struct EmbeddingIndex {
    /// (候选数 × 姿态数, 维度)，每行 L2 归一化
    vectors: Array2<f32>,
    /// 每一行所属的候选序号，同一候选的行相邻
    owner: Vec<usize>,
    candidates: usize,
    mirror: bool,
    ann: Option<Box<dyn AnnIndex>>,
}

impl EmbeddingIndex {
    /// 构建索引；缓存命中时直接加载，不调用骨干网络
    pub fn build(
        candidates: &CandidateSet,
        embedder: &dyn Embedder,
        opts: &PrefilterOptions,
        cache: Option<&EmbeddingCache>,
        pb: &ProgressBar,
    ) -> Result<Self, MatchError> {
        let sources = candidates.sources();
        let key = cache.map(|_| cache_key(&candidates.identities(), opts.mirror, embedder.identity()));

        if let (Some(cache), Some(key)) = (cache, key.as_deref()) {
            if let Some(cached) = cache.load(key, &sources) {
                info!("从缓存加载 {} 行嵌入", cached.rows());
                let vectors = Array2::from_shape_vec((cached.rows(), cached.dim), cached.vectors)
                    .map_err(|e| MatchError::CacheMismatch(e.to_string()))?;
                let owner = cached.owner.into_iter().map(|o| o as usize).collect();
                return Ok(Self::from_parts(vectors, owner, sources.len(), opts));
            }
        }

        let start = Instant::now();
        let vectors = embed_candidates(candidates, embedder, opts, pb)?;
        let k = orientations(opts.mirror);
        let owner = (0..candidates.len()).flat_map(|id| std::iter::repeat_n(id, k)).collect::<Vec<_>>();
        info!("计算 {} 行嵌入，耗时 {:.2}s", owner.len(), start.elapsed().as_secs_f32());

        if let (Some(cache), Some(key)) = (cache, key.as_deref()) {
            let cached = CachedEmbeddings::new(
                vectors.ncols(),
                k,
                vectors.iter().copied().collect(),
                owner.iter().map(|&o| o as u32).collect(),
                sources.clone(),
            );
            if let Err(e) = cache.store(key, &cached) {
                warn!("写入嵌入缓存失败: {e}");
            }
        }

        Ok(Self::from_parts(vectors, owner, sources.len(), opts))
    }

    pub fn from_parts(
        vectors: Array2<f32>,
        owner: Vec<usize>,
        candidates: usize,
        opts: &PrefilterOptions,
    ) -> Self {
        let ann = if vectors.nrows() > 0 {
            ann::create(opts.ann, vectors.nrows(), opts.ef_search).map(|mut index| {
                index.add(vectors.view());
                index
            })
        } else {
            None
        };
        Self { vectors, owner, candidates, mirror: opts.mirror, ann }
    }

    pub fn len(&self) -> usize {
        self.owner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owner.is_empty()
    }

    pub fn vectors(&self) -> ArrayView2<'_, f32> {
        self.vectors.view()
    }

    pub fn owner(&self) -> &[usize] {
        &self.owner
    }

    /// 对查询图标的各个姿态做嵌入，返回按最大余弦相似度排序的前 `top_m` 个候选序号
    pub fn shortlist(
        &self,
        query: &NormalizedImage,
        embedder: &dyn Embedder,
        top_m: usize,
    ) -> Result<Vec<usize>, MatchError> {
        if self.is_empty() || top_m == 0 {
            return Ok(vec![]);
        }
        let variants = orientation_variants(query, self.mirror);
        let queries = embedder.embed_batch(&variants)?;
        Ok(self.rank_owners(queries.view(), top_m).into_iter().map(|(id, _)| id).collect())
    }

    /// 给定查询向量，返回 (候选序号, 最大相似度)，相似度降序，相同时序号小的在前
    pub fn rank_owners(&self, queries: ArrayView2<f32>, top_m: usize) -> Vec<(usize, f32)> {
        if self.is_empty() || queries.nrows() == 0 {
            return vec![];
        }
        // (姿态数, 行数) 的相似度矩阵
        let sims = queries.dot(&self.vectors.t());

        let mut wanted = vec![self.ann.is_none(); self.candidates];
        if let Some(ann) = &self.ann {
            let k = top_m.max(MIN_ROWS_PER_QUERY).min(self.len());
            for q in queries.axis_iter(Axis(0)) {
                for row in ann.search(q, k) {
                    wanted[self.owner[row]] = true;
                }
            }
        }

        let mut best = vec![f32::NEG_INFINITY; self.candidates];
        for q in sims.axis_iter(Axis(0)) {
            for (row, &s) in q.iter().enumerate() {
                let o = self.owner[row];
                if wanted[o] && s > best[o] {
                    best[o] = s;
                }
            }
        }

        let mut ranked = best
            .into_iter()
            .enumerate()
            .filter(|(_, s)| s.is_finite())
            .collect::<Vec<_>>();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(top_m);
        debug!("预筛选保留 {} 个候选", ranked.len());
        ranked
    }
}

/// 分块计算所有候选的姿态嵌入，每块约 `batch_size` 张图片，结果按候选顺序拼接
fn embed_candidates(
    candidates: &CandidateSet,
    embedder: &dyn Embedder,
    opts: &PrefilterOptions,
    pb: &ProgressBar,
) -> Result<Array2<f32>, MatchError> {
    let k = orientations(opts.mirror);
    let per_chunk = (opts.batch_size / k).max(1);
    let chunks = candidates.records().chunks(per_chunk).collect::<Vec<_>>();
    pb.set_length(chunks.len() as u64);

    let blocks = chunks
        .par_iter()
        .progress_with(pb.clone())
        .map(|chunk| {
            let variants = chunk
                .iter()
                .flat_map(|c| orientation_variants(&c.features.image, opts.mirror))
                .collect::<Vec<_>>();
            let block = embedder.embed_batch(&variants)?;
            if block.nrows() != variants.len() {
                return Err(MatchError::Embedding(format!(
                    "输入 {} 张图片，输出 {} 行",
                    variants.len(),
                    block.nrows()
                )));
            }
            Ok(block)
        })
        .collect::<Result<Vec<_>, MatchError>>()?;

    if blocks.is_empty() {
        return Ok(Array2::zeros((0, embedder.dim())));
    }
    let views = blocks.iter().map(|b| b.view()).collect::<Vec<_>>();
    concatenate(Axis(0), &views).map_err(|e| MatchError::Embedding(e.to_string()))
}

/// 预筛选器：嵌入索引加上生成它的骨干网络
pub struct Prefilter {
    index: EmbeddingIndex,
    embedder: Arc<dyn Embedder>,
    top_m: usize,
}

impl Prefilter {
    pub fn new(index: EmbeddingIndex, embedder: Arc<dyn Embedder>, top_m: usize) -> Self {
        Self { index, embedder, top_m }
    }

    pub fn index(&self) -> &EmbeddingIndex {
        &self.index
    }

    pub fn shortlist(&self, query: &NormalizedImage) -> Result<Vec<usize>, MatchError> {
        self.index.shortlist(query, self.embedder.as_ref(), self.top_m)
    }
}
