//! 匹配结果的输出：CSV 明细、按图块句柄和文件名汇总的 JSON，以及人工核对用的目录

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use log::{debug, warn};
use opencv::core::{self, Mat, Size, Vector};
use opencv::imgproc;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::candidate::{CandidateSet, QueryRecord};
use crate::matcher::MatchResult;
use crate::normalize::NormalizedImage;
use crate::utils::{imwrite, safe_name};

static HANDLE_ANY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"H([0-9A-Fa-f]{4,})").expect("failed to build regex"));
static HANDLE_TRAIL_HEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([0-9A-Fa-f]{4,})$").expect("failed to build regex"));
static SEQUENCE_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__\d{2,}$").expect("failed to build regex"));

/// 预览图中每张图片的边长
const PREVIEW_SIDE: i32 = 380;

pub const CSV_HEADER: [&str; 15] = [
    "category",
    "bucket",
    "query_path",
    "cand_path",
    "rank",
    "score",
    "phash_dist",
    "good_matches",
    "inliers",
    "shape_dist",
    "rotation",
    "mirrored",
    "aspect_penalty",
    "chamfer",
    "accepted",
];

fn stem(path: &Path) -> String {
    path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}

/// 从文件名中提取图块句柄：优先匹配 `H` 开头的十六进制串，否则取结尾的十六进制串，统一转为大写
pub fn extract_handle(path: &Path) -> Option<String> {
    let stem = stem(path);
    HANDLE_ANY
        .captures(&stem)
        .or_else(|| HANDLE_TRAIL_HEX.captures(&stem))
        .map(|c| c[1].to_uppercase())
}

/// 母库图块名：去掉文件名结尾的 `__NN` 序号
pub fn master_block(path: &Path) -> String {
    SEQUENCE_SUFFIX.replace(&stem(path), "").into_owned()
}

/// CSV 中的一行
#[derive(Debug, Clone, PartialEq)]
pub struct CsvRow {
    pub category: String,
    pub bucket: String,
    pub query_path: String,
    pub cand_path: String,
    pub rank: usize,
    pub score: f64,
    pub phash_dist: u32,
    pub good_matches: usize,
    pub inliers: usize,
    pub shape_dist: f64,
    pub rotation: u16,
    pub mirrored: bool,
    pub aspect_penalty: f64,
    pub chamfer: f64,
    pub accepted: bool,
}

impl CsvRow {
    /// 一个查询的前 K 个结果展开成多行，rank 从 1 开始
    pub fn from_result(
        category: &str,
        bucket: Option<&Path>,
        result: &MatchResult,
        candidates: &CandidateSet,
    ) -> Vec<Self> {
        let bucket = bucket.map(|b| b.to_string_lossy().into_owned()).unwrap_or_default();
        result
            .scores
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                let cand = candidates.get(s.candidate_id)?;
                Some(Self {
                    category: category.to_string(),
                    bucket: bucket.clone(),
                    query_path: result.query_path.to_string_lossy().into_owned(),
                    cand_path: cand.path.to_string_lossy().into_owned(),
                    rank: i + 1,
                    score: round4(s.composite_score),
                    phash_dist: s.phash_distance,
                    good_matches: s.good_matches,
                    inliers: s.inliers,
                    shape_dist: round4(s.shape_distance),
                    rotation: s.rotation,
                    mirrored: s.mirrored,
                    aspect_penalty: round4(s.aspect_penalty),
                    chamfer: round4(s.chamfer_distance),
                    accepted: s.accepted,
                })
            })
            .collect()
    }

    fn fields(&self) -> [String; 15] {
        [
            self.category.clone(),
            self.bucket.clone(),
            self.query_path.clone(),
            self.cand_path.clone(),
            self.rank.to_string(),
            self.score.to_string(),
            self.phash_dist.to_string(),
            self.good_matches.to_string(),
            self.inliers.to_string(),
            self.shape_dist.to_string(),
            self.rotation.to_string(),
            self.mirrored.to_string(),
            self.aspect_penalty.to_string(),
            self.chamfer.to_string(),
            self.accepted.to_string(),
        ]
    }
}

fn round4(v: f64) -> f64 {
    (v * 1e4).round() / 1e4
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// 写入 CSV，带 UTF-8 BOM 以便表格软件正确识别编码
pub fn write_csv<P: AsRef<Path>>(path: P, rows: &[CsvRow]) -> Result<()> {
    let path = path.as_ref();
    let mut w = BufWriter::new(
        File::create(path).with_context(|| format!("无法创建 {}", path.display()))?,
    );
    w.write_all("\u{feff}".as_bytes())?;
    writeln!(w, "{}", CSV_HEADER.join(","))?;
    for row in rows {
        let fields = row.fields().iter().map(|f| csv_field(f)).collect::<Vec<_>>();
        writeln!(w, "{}", fields.join(","))?;
    }
    w.flush()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopKItem {
    pub master_block: String,
    pub score: f64,
    pub preview: String,
    pub rot: u16,
    pub mirrored: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub work_image: String,
    pub topk: Vec<TopKItem>,
}

impl SummaryEntry {
    fn best_score(&self) -> f64 {
        self.topk.first().map(|t| t.score).unwrap_or(f64::INFINITY)
    }
}

/// 按图块句柄和按文件名汇总的最佳匹配，同一个键出现多次时保留最佳得分更低的一条
#[derive(Debug, Default)]
pub struct Summaries {
    pub by_handle: BTreeMap<String, SummaryEntry>,
    pub by_stem: BTreeMap<String, SummaryEntry>,
    pub missing_handle: usize,
}

impl Summaries {
    pub fn record(&mut self, result: &MatchResult, candidates: &CandidateSet) {
        let entry = SummaryEntry {
            work_image: result.query_path.to_string_lossy().into_owned(),
            topk: result
                .scores
                .iter()
                .filter_map(|s| {
                    let cand = candidates.get(s.candidate_id)?;
                    Some(TopKItem {
                        master_block: master_block(&cand.path),
                        score: s.composite_score,
                        preview: cand.path.to_string_lossy().into_owned(),
                        rot: s.rotation,
                        mirrored: s.mirrored,
                    })
                })
                .collect(),
        };

        match extract_handle(&result.query_path) {
            Some(handle) => insert_better(&mut self.by_handle, handle, entry.clone()),
            None => {
                warn!("文件名中没有图块句柄: {}", result.query_path.display());
                self.missing_handle += 1;
            }
        }
        insert_better(&mut self.by_stem, stem(&result.query_path), entry);
    }

    /// 写入 `work_to_master.json` 和 `work_to_master_by_stem.json`
    pub fn write<P: AsRef<Path>>(&self, dir: P) -> Result<(PathBuf, PathBuf)> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let by_handle = dir.join("work_to_master.json");
        let by_stem = dir.join("work_to_master_by_stem.json");
        std::fs::write(&by_handle, serde_json::to_string_pretty(&self.by_handle)?)?;
        std::fs::write(&by_stem, serde_json::to_string_pretty(&self.by_stem)?)?;
        Ok((by_handle, by_stem))
    }
}

fn insert_better(map: &mut BTreeMap<String, SummaryEntry>, key: String, entry: SummaryEntry) {
    match map.get(&key) {
        Some(old) if old.best_score() <= entry.best_score() => {}
        _ => {
            map.insert(key, entry);
        }
    }
}

fn extension(path: &Path) -> String {
    path.extension().map(|e| format!(".{}", e.to_string_lossy().to_lowercase())).unwrap_or_default()
}

/// 为一个查询建立核对目录：原始查询图、最佳匹配图、文字说明和并排预览
pub fn write_bucket(
    root: &Path,
    master_name: &str,
    query: &QueryRecord,
    result: &MatchResult,
    candidates: &CandidateSet,
    preview: bool,
) -> Result<PathBuf> {
    let dir = root.join(safe_name(&stem(&query.path)));
    std::fs::create_dir_all(&dir)?;
    std::fs::copy(&query.path, dir.join(format!("00_query{}", extension(&query.path))))?;

    let Some((best, cand)) = result.best().and_then(|b| Some((b, candidates.get(b.candidate_id)?)))
    else {
        return Ok(dir);
    };
    std::fs::copy(
        &cand.path,
        dir.join(format!("01_match_from_{}{}", safe_name(master_name), extension(&cand.path))),
    )?;

    let info = format!(
        "query: {}\nmatch: {}\nscore: {:.4}\nphash_dist: {}\ngood_matches: {}\ninliers: {}\nshape_dist: {:.4}\nrotation: {}\nmirrored: {}\nchamfer: {:.3}\naccepted: {}\n",
        query.path.display(),
        cand.path.display(),
        best.composite_score,
        best.phash_distance,
        best.good_matches,
        best.inliers,
        best.shape_distance,
        best.rotation,
        best.mirrored,
        best.chamfer_distance,
        best.accepted,
    );
    std::fs::write(dir.join("info.txt"), info)?;

    if preview {
        let file = dir.join("preview_side_by_side.png");
        match side_by_side(&query.features.image, &cand.features.image)
            .and_then(|m| imwrite(&file, &m))
        {
            Ok(_) => debug!("写入预览 {}", file.display()),
            Err(e) => warn!("预览生成失败 {}: {e}", file.display()),
        }
    }
    Ok(dir)
}

/// 两张归一化图标缩放到同样大小后左右拼接，恢复成白底黑线
pub fn side_by_side(a: &NormalizedImage, b: &NormalizedImage) -> opencv::Result<Mat> {
    let mut parts = Vector::<Mat>::new();
    for image in [a, b] {
        let mat = image.to_paper_mat()?;
        let mut resized = Mat::default();
        imgproc::resize(
            &mat,
            &mut resized,
            Size::new(PREVIEW_SIDE, PREVIEW_SIDE),
            0.,
            0.,
            imgproc::INTER_AREA,
        )?;
        parts.push(resized);
    }
    let mut output = Mat::default();
    core::hconcat(&parts, &mut output)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use opencv::prelude::*;

    use super::*;
    use crate::candidate::{FeatureExtractor, Features};
    use crate::config::{NormalizeOptions, OrbOptions};
    use crate::matcher::Stage;
    use crate::normalize::tests::draw_symbol;
    use crate::verify::MatchScore;

    fn score(candidate_id: usize, composite_score: f64) -> MatchScore {
        MatchScore {
            candidate_id,
            phash_distance: 4,
            good_matches: 20,
            inliers: 15,
            shape_distance: 0.2,
            chamfer_distance: 0.5,
            aspect_penalty: 0.,
            composite_score,
            rotation: 90,
            mirrored: false,
            accepted: true,
        }
    }

    fn features() -> Features {
        let ex = FeatureExtractor::new(NormalizeOptions::default(), OrbOptions::default(), false);
        ex.extract(ex.normalizer().normalize_mat(&draw_symbol(160, 120)).unwrap()).unwrap()
    }

    fn candidates() -> CandidateSet {
        CandidateSet::from_features(vec![
            (PathBuf::from("master/VALVE__012.png"), features()),
            (PathBuf::from("master/PUMP.png"), features()),
        ])
    }

    fn result(query: &str, scores: Vec<MatchScore>) -> MatchResult {
        MatchResult { query_path: PathBuf::from(query), scores, stage: Stage::FullSet }
    }

    #[test]
    fn handles_are_extracted() {
        assert_eq!(extract_handle(Path::new("x/blk_H1a2B_3.png")), Some("1A2B".to_string()));
        assert_eq!(extract_handle(Path::new("x/VALVE__00ff3c.png")), Some("00FF3C".to_string()));
        assert_eq!(extract_handle(Path::new("x/VALVE__012.png")), None);
    }

    #[test]
    fn master_block_strips_sequence() {
        assert_eq!(master_block(Path::new("a/VALVE__012.png")), "VALVE");
        assert_eq!(master_block(Path::new("a/VALVE__1.png")), "VALVE__1");
        assert_eq!(master_block(Path::new("a/PUMP.png")), "PUMP");
    }

    #[test]
    fn summaries_keep_lower_best_score() {
        let set = candidates();
        let mut summaries = Summaries::default();
        summaries.record(&result("w/a_HBEEF.png", vec![score(1, 5.)]), &set);
        summaries.record(&result("w2/a_HBEEF.png", vec![score(0, 3.)]), &set);
        summaries.record(&result("w3/a_HBEEF.png", vec![score(1, 4.)]), &set);
        summaries.record(&result("w/plain.png", vec![score(0, 1.)]), &set);

        let entry = &summaries.by_handle["BEEF"];
        assert_eq!(entry.work_image, "w2/a_HBEEF.png");
        assert_eq!(entry.topk[0].master_block, "VALVE");
        assert_eq!(entry.topk[0].rot, 90);
        assert_eq!(summaries.by_stem.len(), 2);
        assert_eq!(summaries.by_stem["a_HBEEF"].work_image, "w2/a_HBEEF.png");
        assert_eq!(summaries.missing_handle, 1);
    }

    #[test]
    fn summaries_are_written_as_json() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut summaries = Summaries::default();
        summaries.record(&result("w/a_HBEEF.png", vec![score(1, 5.)]), &candidates());
        let (by_handle, by_stem) = summaries.write(dir.path())?;
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(by_handle)?)?;
        assert_eq!(value["BEEF"]["topk"][0]["master_block"], "PUMP");
        assert!(by_stem.exists());
        Ok(())
    }

    #[test]
    fn csv_rows_are_ranked_and_quoted() -> Result<()> {
        let set = candidates();
        let rows = CsvRow::from_result(
            "INSTANCES",
            None,
            &result("w/a,b.png", vec![score(1, 1.23456), score(0, 2.)]),
            &set,
        );
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].rank, 1);
        assert_eq!(rows[0].score, 1.2346);
        assert_eq!(rows[1].cand_path, "master/VALVE__012.png");

        let dir = tempfile::tempdir()?;
        let file = dir.path().join("m.csv");
        write_csv(&file, &rows)?;
        let text = std::fs::read_to_string(&file)?;
        let mut lines = text.trim_start_matches('\u{feff}').lines();
        assert_eq!(lines.next(), Some(CSV_HEADER.join(",").as_str()));
        assert!(lines.next().unwrap().starts_with("INSTANCES,,\"w/a,b.png\",master/PUMP.png,1,1.2346,"));
        Ok(())
    }

    #[test]
    fn preview_is_two_images_wide() {
        let f = features();
        let preview = side_by_side(&f.image, &f.image).unwrap();
        assert_eq!((preview.cols(), preview.rows()), (2 * PREVIEW_SIDE, PREVIEW_SIDE));
    }
}
