use hnsw_rs::prelude::*;
use ndarray::{ArrayView1, ArrayView2, Axis};

use crate::config::AnnKind;

/// 向量近邻搜索，向量均已 L2 归一化，相似度为内积
pub trait AnnIndex: Send + Sync {
    /// 追加一批向量，行号依次递增
    fn add(&mut self, vectors: ArrayView2<f32>);

    /// 返回与 `query` 最相似的至多 `k` 个行号
    fn search(&self, query: ArrayView1<f32>, k: usize) -> Vec<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 按配置创建近邻索引，`AnnKind::None` 表示不使用索引
pub fn create(kind: AnnKind, capacity: usize, ef_search: usize) -> Option<Box<dyn AnnIndex>> {
    match kind {
        AnnKind::Hnsw => Some(Box::new(HnswAnn::new(capacity, ef_search))),
        AnnKind::Flat => Some(Box::new(BruteForceAnn::default())),
        AnnKind::None => None,
    }
}

pub struct HnswAnn {
    hnsw: Hnsw<'static, f32, DistCosine>,
    ef_search: usize,
    len: usize,
}

impl HnswAnn {
    pub fn new(capacity: usize, ef_search: usize) -> Self {
        let capacity = capacity.max(1);
        let nb_layer = 16.min((capacity as f32).ln().trunc() as usize).max(1);
        let hnsw = Hnsw::<f32, _>::new(32, capacity, nb_layer, 200, DistCosine {});
        Self { hnsw, ef_search, len: 0 }
    }
}

impl AnnIndex for HnswAnn {
    fn add(&mut self, vectors: ArrayView2<f32>) {
        let rows = vectors.axis_iter(Axis(0)).map(|row| row.to_vec()).collect::<Vec<_>>();
        let data = rows.iter().enumerate().map(|(i, v)| (v, self.len + i)).collect::<Vec<_>>();
        self.hnsw.parallel_insert(&data);
        self.len += rows.len();
    }

    fn search(&self, query: ArrayView1<f32>, k: usize) -> Vec<usize> {
        if k == 0 || self.len == 0 {
            return vec![];
        }
        let query = query.to_vec();
        self.hnsw
            .search(&query, k, self.ef_search.max(k))
            .iter()
            .map(|n| n.d_id)
            .collect()
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// 逐行计算内积的精确搜索
#[derive(Default)]
pub struct BruteForceAnn {
    dim: usize,
    data: Vec<f32>,
}

impl AnnIndex for BruteForceAnn {
    fn add(&mut self, vectors: ArrayView2<f32>) {
        if vectors.nrows() == 0 {
            return;
        }
        self.dim = vectors.ncols();
        self.data.extend(vectors.iter().copied());
    }

    fn search(&self, query: ArrayView1<f32>, k: usize) -> Vec<usize> {
        if self.dim == 0 {
            return vec![];
        }
        let mut sims = self
            .data
            .chunks_exact(self.dim)
            .map(|row| row.iter().zip(query.iter()).map(|(a, b)| a * b).sum::<f32>())
            .enumerate()
            .collect::<Vec<_>>();
        // 相似度降序，相同时行号小的在前
        sims.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        sims.into_iter().take(k).map(|(i, _)| i).collect()
    }

    fn len(&self) -> usize {
        if self.dim == 0 { 0 } else { self.data.len() / self.dim }
    }
}
