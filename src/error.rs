use std::path::PathBuf;

use thiserror::Error;

/// 匹配流程中可以被单独跳过的错误
///
/// 这些错误都不会中断整个批处理：单张图片或单个分类失败时记录一行原因后继续。
#[derive(Debug, Error)]
pub enum MatchError {
    /// 图片无法读取，或者清理后没有剩下任何前景
    #[error("图片归一化失败: {0}")]
    NormalizationFailed(String),
    /// 母库目录中没有可用的图片
    #[error("母库为空: {}", .0.display())]
    EmptyCandidateSet(PathBuf),
    /// 工作目录中没有可用的图片
    #[error("待匹配图片为空: {}", .0.display())]
    EmptyQuerySet(PathBuf),
    /// 缓存中记录的源文件列表与当前母库不一致
    #[error("嵌入缓存与当前母库不一致: {0}")]
    CacheMismatch(String),
    /// 匹配点少于拟合单应矩阵所需的数量
    #[error("匹配点不足: {found} < {required}")]
    GeometricFitUnavailable { found: usize, required: usize },
    /// 特征提取网络推理失败
    #[error("嵌入计算失败: {0}")]
    Embedding(String),
    #[error(transparent)]
    OpenCv(#[from] opencv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
