use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;

use crate::candidate::{CandidateSet, FeatureExtractor};
use crate::cli::SubCommandExtend;
use crate::config::{NormalizeOptions, Opts, OrbOptions, ScoringOptions};
use crate::orb;
use crate::utils;
use crate::verify::Verifier;

#[derive(Parser, Debug, Clone)]
pub struct InspectCommand {
    #[command(flatten)]
    pub normalize: NormalizeOptions,
    #[command(flatten)]
    pub orb: OrbOptions,
    #[command(flatten)]
    pub scoring: ScoringOptions,
    /// 图片路径
    #[arg(required_unless_present = "dump_scoring")]
    pub image: Option<PathBuf>,
    /// 与另一张图片（作为候选）打分
    #[arg(long, value_name = "IMAGE")]
    pub against: Option<PathBuf>,
    /// 将归一化结果和特征点绘制到该文件
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// 打分时同时搜索镜像姿态
    #[arg(long)]
    pub mirror: bool,
    /// 输出当前生效的打分参数（JSON）后退出
    #[arg(long)]
    pub dump_scoring: bool,
}

impl SubCommandExtend for InspectCommand {
    fn run(&self, _opts: &Opts) -> Result<()> {
        let scoring = self.scoring.load()?;
        if self.dump_scoring {
            println!("{}", serde_json::to_string_pretty(&scoring)?);
            return Ok(());
        }
        let Some(image) = &self.image else {
            return Ok(());
        };

        let extractor = FeatureExtractor::new(self.normalize.clone(), self.orb.clone(), self.mirror);
        let features = extractor.extract_file(image)?;
        println!("宽高比    : {:.4}", features.aspect_ratio());
        println!("墨迹像素  : {}", features.image.ink_count());
        println!("特征点    : {}", features.keypoints.len());
        println!("pHash     : {:016x}", features.hashes.identity());
        println!("Hu 矩     : {:?}", features.hu.0);

        if let Some(output) = &self.output {
            let (canvas, kps, _) = orb::detect_with_canvas(&features.image, &self.orb)?;
            let drawn = orb::draw_keypoints(&canvas, &kps)?;
            utils::imwrite(output, &drawn)?;
            info!("写入 {}", output.display());
        }

        if let Some(against) = &self.against {
            let candidate = extractor.extract_file(against)?;
            let set = CandidateSet::from_features(vec![(against.clone(), candidate)]);
            let verifier = Verifier::new(scoring, self.mirror);
            let Some(record) = set.get(0) else {
                return Ok(());
            };
            if verifier.verify(&features, record, true)?.is_none() {
                println!("未通过宽高比或 pHash 门限，以下为不设门限的得分");
            }
            if let Some(score) = verifier.verify(&features, record, false)? {
                println!("{}", serde_json::to_string_pretty(&score)?);
            }
        }
        Ok(())
    }
}
