use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use crate::candidate::{CandidateSet, FeatureExtractor};
use crate::cli::SubCommandExtend;
use crate::config::{NormalizeOptions, Opts, OrbOptions, PrefilterOptions, ScoringOptions};
use crate::embed::{Embedder, OnnxEmbedder};
use crate::error::MatchError;
use crate::matcher::Matcher;
use crate::report::{CsvRow, Summaries, write_bucket, write_csv};
use crate::utils::{IMAGE_SUFFIX, list_images, progress_bar, suffix_regex};
use crate::verify::{ScoringConfig, Verifier};

use super::index::build_prefilter;

#[derive(Parser, Debug, Clone)]
pub struct MatchCommand {
    #[command(flatten)]
    pub normalize: NormalizeOptions,
    #[command(flatten)]
    pub orb: OrbOptions,
    #[command(flatten)]
    pub prefilter: PrefilterOptions,
    #[command(flatten)]
    pub scoring: ScoringOptions,
    /// 工作图纸导出的图标目录，每个分类一个子目录
    pub work: PathBuf,
    /// 母库导出的图标目录，每个分类一个子目录
    pub master: PathBuf,
    /// 需要匹配的分类子目录，多个分类用逗号分隔
    #[arg(long = "category", value_delimiter = ',', default_value = "AUTO_CLUSTERS,INSTANCES")]
    pub categories: Vec<String>,
    /// 输出目录
    #[arg(short, long, default_value = "_MATCH_RESULTS")]
    pub output: PathBuf,
    /// 每个查询保留的结果数量
    #[arg(short = 'k', long, default_value_t = 5)]
    pub top_k: usize,
    /// 扫描的文件后缀名，多个后缀用逗号分隔
    #[arg(short, long, default_value = IMAGE_SUFFIX)]
    pub suffix: String,
    /// 为每个查询建立核对目录
    #[arg(long)]
    pub buckets: bool,
    /// 核对目录中不生成并排预览图
    #[arg(long)]
    pub no_preview: bool,
}

/// 一个分类的处理结果
struct CategoryOutcome {
    rows: Vec<CsvRow>,
    processed: usize,
    skipped: usize,
}

/// 匹配过程中不变的上下文
struct Run<'a> {
    cmd: &'a MatchCommand,
    opts: &'a Opts,
    scoring: ScoringConfig,
    extractor: FeatureExtractor,
    embedder: Option<Arc<dyn Embedder>>,
    work_name: String,
    master_name: String,
}

impl SubCommandExtend for MatchCommand {
    fn run(&self, opts: &Opts) -> Result<()> {
        let scoring = self.scoring.load()?;
        let extractor =
            FeatureExtractor::new(self.normalize.clone(), self.orb.clone(), self.prefilter.mirror);
        let embedder: Option<Arc<dyn Embedder>> = match &self.prefilter.model {
            Some(model) => Some(Arc::new(OnnxEmbedder::open(model, self.prefilter.input_size)?)),
            None => {
                info!("未指定 --model，跳过嵌入预筛选");
                None
            }
        };

        let run = Run {
            cmd: self,
            opts,
            scoring,
            extractor,
            embedder,
            work_name: dir_name(&self.work),
            master_name: dir_name(&self.master),
        };

        std::fs::create_dir_all(&self.output)?;
        let mut all_rows = vec![];
        let mut summaries = Summaries::default();
        let (mut processed, mut skipped, mut skipped_categories) = (0, 0, 0);

        for category in &self.categories {
            match run.category(category, &mut summaries) {
                Ok(outcome) => {
                    processed += outcome.processed;
                    skipped += outcome.skipped;
                    all_rows.extend(outcome.rows);
                }
                Err(e) => {
                    warn!("[{category}] 跳过: {e}");
                    skipped_categories += 1;
                }
            }
        }

        if !all_rows.is_empty() {
            let file = self
                .output
                .join(format!("matches_{}_vs_{}_COMBINED.csv", run.work_name, run.master_name));
            write_csv(&file, &all_rows)?;
            info!("写入汇总表 {}", file.display());
        }
        let (by_handle, by_stem) = summaries.write(&self.output)?;
        info!("写入 {}（{} 条）", by_handle.display(), summaries.by_handle.len());
        info!("写入 {}（{} 条）", by_stem.display(), summaries.by_stem.len());
        info!("完成：匹配 {processed} 张，跳过 {skipped} 张，跳过分类 {skipped_categories} 个");
        Ok(())
    }
}

impl Run<'_> {
    fn category(&self, category: &str, summaries: &mut Summaries) -> Result<CategoryOutcome> {
        let cmd = self.cmd;
        let suffix = suffix_regex(&cmd.suffix);
        let work_dir = cmd.work.join(category);
        let master_dir = cmd.master.join(category);
        let queries = list_images(&work_dir, &suffix);
        let masters = list_images(&master_dir, &suffix);
        info!("[{category}] 待匹配 {} 张，母库 {} 张", queries.len(), masters.len());
        if masters.is_empty() {
            return Err(MatchError::EmptyCandidateSet(master_dir).into());
        }
        if queries.is_empty() {
            return Err(MatchError::EmptyQuerySet(work_dir).into());
        }

        let pb = progress_bar(masters.len(), "提取母库特征");
        let candidates = CandidateSet::build(&masters, &self.extractor, &pb);
        pb.finish_and_clear();
        if candidates.is_empty() {
            return Err(MatchError::EmptyCandidateSet(master_dir).into());
        }

        let prefilter = self.embedder.as_ref().and_then(|embedder| {
            let tag = format!("{}_{category}", self.master_name);
            build_prefilter(&candidates, embedder.clone(), &cmd.prefilter, self.opts, &tag)
                .inspect_err(|e| warn!("[{category}] 嵌入索引构建失败，不使用预筛选: {e}"))
                .ok()
        });

        let verifier = Verifier::new(self.scoring.clone(), cmd.prefilter.mirror);
        let matcher = Matcher::new(&candidates, verifier, cmd.top_k).with_prefilter(prefilter.as_ref());
        let pb = progress_bar(queries.len(), "匹配");
        let outcome = matcher.match_all(&queries, &self.extractor, &pb);
        pb.finish_and_clear();

        let buckets_root =
            cmd.output.join(format!("buckets_{}_{category}", self.work_name));
        let mut rows = vec![];
        let total = outcome.matched.len();
        for (i, (query, result)) in outcome.matched.iter().enumerate() {
            let bucket = if cmd.buckets {
                write_bucket(&buckets_root, &self.master_name, query, result, &candidates, !cmd.no_preview)
                    .inspect_err(|e| warn!("核对目录写入失败 {}: {e}", query.path.display()))
                    .ok()
            } else {
                None
            };
            rows.extend(CsvRow::from_result(category, bucket.as_deref(), result, &candidates));
            summaries.record(result, &candidates);

            if let Some(best) = result.best() {
                let cand = candidates.get(best.candidate_id).map(|c| file_name(&c.path)).unwrap_or_default();
                info!(
                    "[{category}] [{}/{total}] {} -> {cand} (score={:.2}, pH={}, good={}, inl={}, rot={}, mirrored={}, accepted={})",
                    i + 1,
                    file_name(&query.path),
                    best.composite_score,
                    best.phash_distance,
                    best.good_matches,
                    best.inliers,
                    best.rotation,
                    best.mirrored,
                    best.accepted,
                );
            }
        }

        let file = cmd
            .output
            .join(format!("matches_{}_vs_{}_{category}.csv", self.work_name, self.master_name));
        write_csv(&file, &rows)?;
        info!("[{category}] 写入 {}", file.display());

        Ok(CategoryOutcome {
            rows,
            processed: outcome.matched.len(),
            skipped: outcome.skipped.len() + candidates.skipped().len(),
        })
    }
}

fn dir_name(path: &Path) -> String {
    path.canonicalize()
        .ok()
        .as_deref()
        .unwrap_or(path)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "UNNAMED".to_string())
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}
