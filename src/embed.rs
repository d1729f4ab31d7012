//! 深度特征提取
//!
//! 预筛选只依赖 [`Embedder`]：把一批归一化图标转换成 L2 归一化的特征向量。
//! 默认实现通过 opencv 的 dnn 模块加载 ONNX 格式的骨干网络。

use std::path::Path;
use std::sync::Mutex;

use log::{debug, info};
use ndarray::{Array2, Axis};
use opencv::core::{self, Mat, Scalar, Size, Vector};
use opencv::dnn;
use opencv::imgproc;
use opencv::prelude::*;

use crate::error::MatchError;
use crate::normalize::{NormalizedImage, Pose};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub trait Embedder: Send + Sync {
    /// 骨干网络的标识，参与缓存键的计算，网络变化后缓存自动失效
    fn identity(&self) -> &str;

    /// 特征维度
    fn dim(&self) -> usize;

    /// 返回 (图片数量, 维度) 的矩阵，每行已经 L2 归一化
    fn embed_batch(&self, images: &[NormalizedImage]) -> Result<Array2<f32>, MatchError>;
}

/// 每个图标参与嵌入的姿态数量：4 个旋转，开启镜像后为 8
pub fn orientations(mirror: bool) -> usize {
    if mirror { 8 } else { 4 }
}

/// 按搜索顺序生成图标的所有姿态变体
pub fn orientation_variants(image: &NormalizedImage, mirror: bool) -> Vec<NormalizedImage> {
    Pose::search_order(mirror).map(|pose| image.oriented(pose)).collect()
}

/// 就地对每一行做 L2 归一化，全零的行保持不变
pub fn l2_normalize_rows(m: &mut Array2<f32>) {
    for mut row in m.axis_iter_mut(Axis(0)) {
        let norm = row.dot(&row).sqrt();
        if norm > f32::EPSILON {
            row /= norm;
        }
    }
}

/// 基于 opencv dnn 的 ONNX 骨干网络
///
/// 输入为 RGB 三通道、ImageNet 均值方差归一化的图片，输出取全局池化后的特征。
pub struct OnnxEmbedder {
    net: Mutex<dnn::Net>,
    identity: String,
    input_size: i32,
    dim: usize,
}

impl OnnxEmbedder {
    pub fn open<P: AsRef<Path>>(model: P, input_size: i32) -> Result<Self, MatchError> {
        let model = model.as_ref();
        let bytes = std::fs::read(model)?;
        let hash = blake3::hash(&bytes).to_hex();
        let name = model.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let identity = format!("{name}-{}", &hash[..16]);

        let net = dnn::read_net_from_onnx(&model.to_string_lossy())?;
        let mut embedder = Self { net: Mutex::new(net), identity, input_size, dim: 0 };

        // 用一张空白图探测输出维度
        let side = input_size.max(1) as usize;
        let blank = NormalizedImage::blank(side, side);
        embedder.dim = embedder.forward(&[blank])?.ncols();
        info!("加载特征提取网络 {}，维度 {}", embedder.identity, embedder.dim);
        Ok(embedder)
    }

    fn blob(&self, images: &[NormalizedImage]) -> opencv::Result<Mat> {
        let mut batch = Vector::<Mat>::with_capacity(images.len());
        for image in images {
            // 网络在白底黑线的图片上训练，这里把墨迹反转回深色
            let gray = image.to_paper_mat()?;
            let mut bgr = Mat::default();
            imgproc::cvt_color_def(&gray, &mut bgr, imgproc::COLOR_GRAY2BGR)?;
            batch.push(bgr);
        }
        let size = Size::new(self.input_size, self.input_size);
        let mut blob =
            dnn::blob_from_images(&batch, 1. / 255., size, Scalar::default(), true, false, core::CV_32F)?;

        let plane = (self.input_size * self.input_size) as usize;
        for (i, v) in blob.data_typed_mut::<f32>()?.iter_mut().enumerate() {
            let c = (i / plane) % 3;
            *v = (*v - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
        Ok(blob)
    }

    fn forward(&self, images: &[NormalizedImage]) -> Result<Array2<f32>, MatchError> {
        let blob = self.blob(images)?;
        let output = {
            let mut net = self.net.lock().map_err(|e| MatchError::Embedding(e.to_string()))?;
            net.set_input_def(&blob)?;
            net.forward_single_def()?
        };
        let data = output.data_typed::<f32>()?;
        let n = images.len();
        if n == 0 || data.len() % n != 0 {
            return Err(MatchError::Embedding(format!("输出大小 {} 无法按 {n} 张图片切分", data.len())));
        }
        let mut m = Array2::from_shape_vec((n, data.len() / n), data.to_vec())
            .map_err(|e| MatchError::Embedding(e.to_string()))?;
        l2_normalize_rows(&mut m);
        Ok(m)
    }
}

impl Embedder for OnnxEmbedder {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn embed_batch(&self, images: &[NormalizedImage]) -> Result<Array2<f32>, MatchError> {
        if images.is_empty() {
            return Ok(Array2::zeros((0, self.dim)));
        }
        debug!("嵌入 {} 张图片", images.len());
        self.forward(images)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::normalize::INK;

    #[test]
    fn rows_are_unit_length() {
        let mut m = array![[3., 4.], [0., 0.], [1., 0.]];
        l2_normalize_rows(&mut m);
        assert_eq!(m.row(0).to_vec(), vec![0.6, 0.8]);
        assert_eq!(m.row(1).to_vec(), vec![0., 0.]);
        assert_eq!(m.row(2).to_vec(), vec![1., 0.]);
    }

    #[test]
    fn variants_follow_pose_order() {
        let pixels = (0..6).map(|v| if v == 0 { INK } else { 0 }).collect();
        let image = NormalizedImage::new(3, 2, pixels, 1.5).unwrap();
        let variants = orientation_variants(&image, false);
        assert_eq!(variants.len(), orientations(false));
        assert_eq!(variants[0], image);
        assert_eq!(variants[1], image.rotated_cw(1));
        assert_eq!(orientation_variants(&image, true).len(), orientations(true));
    }

    #[test]
    fn missing_model_fails() {
        assert!(OnnxEmbedder::open("/nonexistent/model.onnx", 224).is_err());
    }
}
