use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use log::{info, warn};

use crate::cache::EmbeddingCache;
use crate::candidate::{CandidateSet, FeatureExtractor};
use crate::cli::SubCommandExtend;
use crate::config::{NormalizeOptions, Opts, OrbOptions, PrefilterOptions};
use crate::embed::{Embedder, OnnxEmbedder};
use crate::error::MatchError;
use crate::index::{EmbeddingIndex, Prefilter};
use crate::utils::{IMAGE_SUFFIX, list_images, progress_bar, suffix_regex};

#[derive(Parser, Debug, Clone)]
pub struct IndexCommand {
    #[command(flatten)]
    pub normalize: NormalizeOptions,
    #[command(flatten)]
    pub orb: OrbOptions,
    #[command(flatten)]
    pub prefilter: PrefilterOptions,
    /// 母库导出的图标目录，每个分类一个子目录
    pub master: PathBuf,
    /// 需要建立索引的分类子目录，多个分类用逗号分隔
    #[arg(long = "category", value_delimiter = ',', default_value = "AUTO_CLUSTERS,INSTANCES")]
    pub categories: Vec<String>,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = IMAGE_SUFFIX)]
    pub suffix: String,
}

impl SubCommandExtend for IndexCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let Some(model) = &self.prefilter.model else {
            bail!("建立嵌入索引需要指定 --model");
        };
        if self.prefilter.no_cache {
            warn!("--no-cache 与 index 命令同时使用时，索引不会被保存");
        }
        let embedder: Arc<dyn Embedder> = Arc::new(OnnxEmbedder::open(model, self.prefilter.input_size)?);
        let extractor =
            FeatureExtractor::new(self.normalize.clone(), self.orb.clone(), self.prefilter.mirror);
        let suffix = suffix_regex(&self.suffix);
        let master_name = self
            .master
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "UNNAMED".to_string());

        for category in &self.categories {
            let dir = self.master.join(category);
            let paths = list_images(&dir, &suffix);
            if paths.is_empty() {
                warn!("[{category}] 跳过: {}", MatchError::EmptyCandidateSet(dir));
                continue;
            }
            let pb = progress_bar(paths.len(), "提取母库特征");
            let candidates = CandidateSet::build(&paths, &extractor, &pb);
            pb.finish_and_clear();

            let tag = format!("{master_name}_{category}");
            let prefilter = build_prefilter(&candidates, embedder.clone(), &self.prefilter, opts, &tag)?;
            info!(
                "[{category}] 索引完成：{} 个候选，{} 行嵌入",
                candidates.len(),
                prefilter.index().len()
            );
        }
        Ok(())
    }
}

/// 构建（或从缓存加载）一个分类的嵌入索引
pub(crate) fn build_prefilter(
    candidates: &CandidateSet,
    embedder: Arc<dyn Embedder>,
    prefilter: &PrefilterOptions,
    opts: &Opts,
    tag: &str,
) -> Result<Prefilter, MatchError> {
    let cache = (!prefilter.no_cache).then(|| EmbeddingCache::new(opts.cache_dir.embeddings(), tag));
    let pb = progress_bar(0, "计算嵌入");
    let index = EmbeddingIndex::build(candidates, embedder.as_ref(), prefilter, cache.as_ref(), &pb)?;
    pb.finish_and_clear();
    Ok(Prefilter::new(index, embedder, prefilter.top_m))
}
