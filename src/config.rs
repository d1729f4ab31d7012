use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;

use crate::cli::*;
use crate::verify::ScoringConfig;

static CACHE_DIR: LazyLock<String> = LazyLock::new(|| {
    ProjectDirs::from("", "symmatch", "symmatch")
        .map(|dirs| dirs.cache_dir().to_string_lossy().into_owned())
        .unwrap_or_else(|| ".symmatch-cache".to_string())
});

fn default_cache_dir() -> &'static str {
    CACHE_DIR.as_str()
}

#[derive(Parser, Debug, Clone)]
pub struct NormalizeOptions {
    /// 归一化画布边长
    #[arg(long, value_name = "PIXELS", default_value_t = 320)]
    pub canvas_size: u32,
    /// 内容长边占画布边长的比例
    #[arg(long, value_name = "RATIO", default_value_t = 0.82)]
    pub margin_ratio: f32,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self::parse_from(["symmatch"])
    }
}

#[derive(Parser, Debug, Clone)]
pub struct OrbOptions {
    /// ORB 特征点最大保留数量
    #[arg(long, value_name = "N", default_value_t = 500)]
    pub orb_nfeatures: i32,
    /// ORB 特征金字塔缩放因子
    #[arg(long, value_name = "SCALE", default_value_t = 1.2)]
    pub orb_scale_factor: f32,
    /// ORB 特征金字塔层数
    #[arg(long, value_name = "N", default_value_t = 8)]
    pub orb_nlevels: i32,
    /// ORB FAST 角点检测器阈值
    #[arg(long, value_name = "THRESHOLD", default_value_t = 20)]
    pub orb_fast_threshold: i32,
    /// ORB 描述子的邻域大小，同时也是边缘留白
    #[arg(long, value_name = "PIXELS", default_value_t = 31)]
    pub orb_patch_size: i32,
}

impl Default for OrbOptions {
    fn default() -> Self {
        Self::parse_from(["symmatch"])
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnKind {
    /// HNSW 近似最近邻
    Hnsw,
    /// 逐行暴力搜索
    Flat,
    /// 不建立近邻索引，直接计算稠密相似度矩阵
    None,
}

#[derive(Parser, Debug, Clone)]
pub struct PrefilterOptions {
    /// ONNX 格式的特征提取网络，不指定时跳过嵌入预筛选
    #[arg(long, value_name = "FILE")]
    pub model: Option<PathBuf>,
    /// 网络输入尺寸
    #[arg(long, value_name = "PIXELS", default_value_t = 224)]
    pub input_size: i32,
    /// 同时搜索镜像姿态（8 个方向，否则只有 4 个旋转）
    #[arg(long)]
    pub mirror: bool,
    /// 预筛选保留的候选数量
    #[arg(long, value_name = "M", default_value_t = 80)]
    pub top_m: usize,
    /// 每批送入网络的图片数量
    #[arg(long, value_name = "SIZE", default_value_t = 64)]
    pub batch_size: usize,
    /// 近邻搜索方式
    #[arg(long, value_enum, default_value_t = AnnKind::Hnsw)]
    pub ann: AnnKind,
    /// HNSW 搜索时每次访问的节点数量
    #[arg(long, default_value_t = 64)]
    pub ef_search: usize,
    /// 不读写嵌入缓存
    #[arg(long)]
    pub no_cache: bool,
}

impl Default for PrefilterOptions {
    fn default() -> Self {
        Self::parse_from(["symmatch"])
    }
}

#[derive(Parser, Debug, Clone, Default)]
pub struct ScoringOptions {
    /// 评分参数文件（JSON），未列出的字段使用默认值
    #[arg(long, value_name = "FILE")]
    pub scoring: Option<PathBuf>,
    /// 宽高比门限，覆盖评分参数文件
    #[arg(long, value_name = "PENALTY")]
    pub aspect_gate: Option<f64>,
    /// pHash 距离上限，覆盖评分参数文件
    #[arg(long, value_name = "BITS")]
    pub phash_ceiling: Option<u32>,
}

impl ScoringOptions {
    pub fn load(&self) -> Result<ScoringConfig> {
        let mut config = match &self.scoring {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("无法读取评分参数: {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("评分参数格式错误: {}", path.display()))?
            }
            None => ScoringConfig::default(),
        };
        if let Some(gate) = self.aspect_gate {
            config.aspect_gate = gate;
        }
        if let Some(ceiling) = self.phash_ceiling {
            config.phash_ceiling = ceiling;
        }
        Ok(config)
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "symmatch", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// 嵌入缓存目录
    #[arg(short, long, default_value = default_cache_dir())]
    pub cache_dir: CacheDir,
    /// 并行线程数，默认为 CPU 核心数
    #[arg(short = 'j', long, value_name = "N")]
    pub threads: Option<usize>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 将工作图纸的图标与母库逐一匹配
    Match(MatchCommand),
    /// 预先构建母库的嵌入索引缓存
    Index(IndexCommand),
    /// 查看单张图片的归一化结果和特征点，可选与另一张图片打分
    Inspect(InspectCommand),
}

#[derive(Debug, Clone)]
pub struct CacheDir {
    path: PathBuf,
}

impl CacheDir {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回嵌入缓存文件所在目录
    pub fn embeddings(&self) -> PathBuf {
        self.path.join("embeddings")
    }
}

impl FromStr for CacheDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cli_defaults() {
        let normalize = NormalizeOptions::default();
        assert_eq!(normalize.canvas_size, 320);
        assert!((normalize.margin_ratio - 0.82).abs() < 1e-6);

        let prefilter = PrefilterOptions::default();
        assert_eq!(prefilter.top_m, 80);
        assert_eq!(prefilter.batch_size, 64);
        assert_eq!(prefilter.ann, AnnKind::Hnsw);
        assert!(!prefilter.mirror);
    }

    #[test]
    fn scoring_overrides() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("scoring.json");
        std::fs::write(&file, r#"{ "phash_ceiling": 20, "weights": { "phash": 2.0 } }"#)?;

        let opts = ScoringOptions { scoring: Some(file), aspect_gate: Some(0.3), phash_ceiling: None };
        let config = opts.load()?;
        assert_eq!(config.phash_ceiling, 20);
        assert!((config.aspect_gate - 0.3).abs() < 1e-12);
        assert!((config.weights.phash - 2.0).abs() < 1e-12);
        // 未指定的字段保持默认
        assert!((config.weights.chamfer - 2.2).abs() < 1e-12);
        Ok(())
    }
}
