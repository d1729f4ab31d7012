use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use opencv::core::{Mat, Vector};
use opencv::imgcodecs;
use regex::Regex;
use walkdir::WalkDir;

/// 默认扫描的图片后缀
pub const IMAGE_SUFFIX: &str = "png,jpg,jpeg,bmp,webp";

/// 构建匹配文件后缀的正则，多个后缀用逗号分隔，不区分大小写
pub fn suffix_regex(suffix: &str) -> Regex {
    let re = format!("(?i)^({})$", suffix.replace(',', "|"));
    Regex::new(&re).expect("failed to build regex")
}

/// 递归列出目录下的所有图片，按路径排序
pub fn list_images<P: AsRef<Path>>(dir: P, suffix: &Regex) -> Vec<PathBuf> {
    let mut paths = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|s| suffix.is_match(&s.to_string_lossy())))
        .collect::<Vec<_>>();
    paths.sort();
    paths
}

pub fn imwrite<P: AsRef<Path>>(path: P, img: &Mat) -> opencv::Result<bool> {
    let flags = Vector::<i32>::new();
    imgcodecs::imwrite(&path.as_ref().to_string_lossy(), img, &flags)
}

/// 把文件名中不能出现在路径里的字符替换成下划线
pub fn safe_name(s: &str) -> String {
    let name = s
        .chars()
        .map(|c| if matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') { '_' } else { c })
        .collect::<String>();
    let name = name.trim();
    if name.is_empty() { "Unnamed".to_string() } else { name.to_string() }
}

pub fn pb_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
        .expect("failed to build progress style")
        .progress_chars("##-")
}

/// 带统一样式的进度条
pub fn progress_bar(len: usize, msg: &'static str) -> ProgressBar {
    ProgressBar::new(len as u64).with_style(pb_style()).with_message(msg)
}
