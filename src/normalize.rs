//! 图标归一化
//!
//! 把任意尺寸的栅格图标转换成固定尺寸的二值画布：
//! 裁掉白边、抑制长直线、去掉贴边的外框、居中放到正方形画布上，最后细化成单像素宽的骨架。
//!
//! 约定：前景（墨迹）为 255，背景为 0。

use std::path::Path;

use opencv::core::{self, Mat, Point, Rect, Scalar, Size, Vec4i, Vector};
use opencv::imgcodecs;
use opencv::imgproc;
use opencv::prelude::*;

use crate::config::NormalizeOptions;
use crate::error::MatchError;

/// 墨迹像素值
pub const INK: u8 = 255;

/// 低于该灰度值的像素视为内容，用于裁掉白边
const WHITE_THRESHOLD: f64 = 250.;
/// 自适应阈值的邻域大小和偏移
const ADAPTIVE_BLOCK: i32 = 25;
const ADAPTIVE_C: f64 = 5.;
/// 长直线的最小长度，相对于短边
const LONG_LINE_RATIO: f64 = 0.58;
const HOUGH_THRESHOLD: i32 = 90;
const HOUGH_MAX_GAP: f64 = 8.;
const LINE_ERASE_THICKNESS: i32 = 7;
/// 外框判定：贴边且宽或高超过画布的这个比例
const FRAME_SPAN_RATIO: f64 = 0.5;

/// 图标的相对姿态：先水平镜像，再顺时针旋转 `rotation` 度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Pose {
    pub rotation: u16,
    pub mirrored: bool,
}

impl Pose {
    pub const IDENTITY: Pose = Pose { rotation: 0, mirrored: false };

    /// 按搜索顺序列出所有姿态：先不镜像，再镜像；每组依次 0/90/180/270
    pub fn search_order(mirror: bool) -> impl Iterator<Item = Pose> {
        let flips: &'static [bool] = if mirror { &[false, true] } else { &[false] };
        flips.iter().flat_map(|&mirrored| {
            [0u16, 90, 180, 270].into_iter().map(move |rotation| Pose { rotation, mirrored })
        })
    }

    /// 在 8 个姿态中的序号
    pub fn index(self) -> usize {
        (self.rotation / 90) as usize + if self.mirrored { 4 } else { 0 }
    }

    fn quarter_turns(self) -> usize {
        (self.rotation / 90) as usize % 4
    }
}

/// 归一化后的二值图标，生成后不再修改
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedImage {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
    /// 内容区域（放到画布之前）的宽高比
    aspect_ratio: f64,
}

impl NormalizedImage {
    pub fn new(width: usize, height: usize, pixels: Vec<u8>, aspect_ratio: f64) -> Result<Self, MatchError> {
        if width * height != pixels.len() {
            return Err(MatchError::NormalizationFailed(format!(
                "像素数量 {} 与尺寸 {width}×{height} 不一致",
                pixels.len()
            )));
        }
        Ok(Self { width, height, pixels, aspect_ratio })
    }

    /// 全空白的图标
    pub fn blank(width: usize, height: usize) -> Self {
        Self { width, height, pixels: vec![0; width * height], aspect_ratio: 1. }
    }

    /// 从单通道 8 位 Mat 构造，非零像素视为墨迹
    pub fn from_mat(mat: &Mat, aspect_ratio: f64) -> opencv::Result<Self> {
        if mat.typ() != core::CV_8UC1 {
            return Err(opencv::Error::new(core::StsUnsupportedFormat, "需要单通道 8 位图像"));
        }
        let owned;
        let mat = if mat.is_continuous() {
            mat
        } else {
            owned = mat.try_clone()?;
            &owned
        };
        let pixels = mat.data_bytes()?.iter().map(|&v| if v > 0 { INK } else { 0 }).collect();
        Ok(Self { width: mat.cols() as usize, height: mat.rows() as usize, pixels, aspect_ratio })
    }

    pub fn to_mat(&self) -> opencv::Result<Mat> {
        let rows = self.pixels.chunks_exact(self.width).collect::<Vec<_>>();
        Mat::from_slice_2d(&rows)
    }

    /// 恢复成白底黑线，用于预览和网络输入
    pub fn to_paper_mat(&self) -> opencv::Result<Mat> {
        let paper = self.pixels.iter().map(|&v| if v == INK { 0 } else { 255 }).collect::<Vec<u8>>();
        let rows = paper.chunks_exact(self.width).collect::<Vec<_>>();
        Mat::from_slice_2d(&rows)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.aspect_ratio
    }

    pub fn ink_count(&self) -> usize {
        self.pixels.iter().filter(|&&v| v == INK).count()
    }

    /// 水平镜像
    pub fn mirrored(&self) -> Self {
        let mut pixels = Vec::with_capacity(self.pixels.len());
        for row in self.pixels.chunks_exact(self.width) {
            pixels.extend(row.iter().rev());
        }
        Self { pixels, ..*self }
    }

    /// 顺时针旋转 90° × `turns`
    pub fn rotated_cw(&self, turns: usize) -> Self {
        let mut image = self.clone();
        for _ in 0..turns % 4 {
            image = image.rotate_cw_once();
        }
        image
    }

    fn rotate_cw_once(&self) -> Self {
        let (w, h) = (self.width, self.height);
        // 旋转后宽高互换：dst[i][j] = src[h - 1 - j][i]
        let mut pixels = vec![0; w * h];
        for i in 0..w {
            for j in 0..h {
                pixels[i * h + j] = self.pixels[(h - 1 - j) * w + i];
            }
        }
        Self { width: h, height: w, pixels, aspect_ratio: 1. / self.aspect_ratio }
    }

    /// 按姿态变换：先镜像再旋转
    pub fn oriented(&self, pose: Pose) -> Self {
        let base = if pose.mirrored { self.mirrored() } else { self.clone() };
        base.rotated_cw(pose.quarter_turns())
    }
}

/// 图标归一化器
#[derive(Debug, Clone)]
pub struct Normalizer {
    opts: NormalizeOptions,
}

impl Normalizer {
    pub fn new(opts: NormalizeOptions) -> Self {
        Self { opts }
    }

    pub fn normalize_file<P: AsRef<Path>>(&self, path: P) -> Result<NormalizedImage, MatchError> {
        let path = path.as_ref();
        let image = imgcodecs::imread(&path.to_string_lossy(), imgcodecs::IMREAD_GRAYSCALE)
            .map_err(|e| MatchError::NormalizationFailed(format!("{}: {e}", path.display())))?;
        if image.empty() {
            return Err(MatchError::NormalizationFailed(format!("无法读取 {}", path.display())));
        }
        self.normalize_mat(&image)
    }

    /// 归一化一张灰度图（白底深色线条）
    pub fn normalize_mat(&self, gray: &Mat) -> Result<NormalizedImage, MatchError> {
        self.clean(gray)
            .map_err(|e| MatchError::NormalizationFailed(e.to_string()))?
            .ok_or_else(|| MatchError::NormalizationFailed("没有可用的前景像素".to_string()))
    }

    fn clean(&self, gray: &Mat) -> opencv::Result<Option<NormalizedImage>> {
        // 裁掉白边
        let mut th = Mat::default();
        imgproc::threshold(gray, &mut th, WHITE_THRESHOLD, 255., imgproc::THRESH_BINARY_INV)?;
        let Some(rect) = ink_bounding_rect(&th)? else {
            return Ok(None);
        };
        let cropped = Mat::roi(gray, rect)?.try_clone()?;

        let mut blur = Mat::default();
        imgproc::gaussian_blur_def(&cropped, &mut blur, Size::new(3, 3), 0.)?;
        let mut binary = Mat::default();
        imgproc::adaptive_threshold(
            &blur,
            &mut binary,
            255.,
            imgproc::ADAPTIVE_THRESH_GAUSSIAN_C,
            imgproc::THRESH_BINARY,
            ADAPTIVE_BLOCK,
            ADAPTIVE_C,
        )?;
        let mut ink = Mat::default();
        core::bitwise_not_def(&binary, &mut ink)?;

        // 只保留最大外轮廓所在的区域
        let Some(rect) = largest_contour_rect(&ink)? else {
            return Ok(None);
        };
        let mut content = Mat::roi(&ink, rect)?.try_clone()?;

        suppress_long_lines(&mut content)?;
        remove_border_frames(&mut content)?;

        // 去掉外框后重新裁剪
        let Some(rect) = ink_bounding_rect(&content)? else {
            return Ok(None);
        };
        let content = Mat::roi(&content, rect)?.try_clone()?;
        let aspect_ratio = rect.width as f64 / rect.height as f64;

        let canvas = self.place_on_canvas(&content)?;
        let skeleton = skeletonize(&canvas)?;
        if core::count_non_zero(&skeleton)? == 0 {
            return Ok(None);
        }
        Ok(Some(NormalizedImage::from_mat(&skeleton, aspect_ratio)?))
    }

    /// 按固定边距比例缩放并居中到正方形画布
    fn place_on_canvas(&self, content: &Mat) -> opencv::Result<Mat> {
        let side = self.opts.canvas_size as i32;
        let target = (side as f64 * self.opts.margin_ratio as f64).round();
        let scale = target / content.cols().max(content.rows()) as f64;
        let w = ((content.cols() as f64 * scale).round() as i32).clamp(1, side);
        let h = ((content.rows() as f64 * scale).round() as i32).clamp(1, side);

        let mut resized = Mat::default();
        imgproc::resize(content, &mut resized, Size::new(w, h), 0., 0., imgproc::INTER_AREA)?;
        // 缩小时细笔画会被平均成很浅的灰度，只要有墨迹覆盖就保留
        let cutoff = if scale < 1. { 0. } else { 127. };
        let mut binary = Mat::default();
        imgproc::threshold(&resized, &mut binary, cutoff, 255., imgproc::THRESH_BINARY)?;

        let mut canvas = Mat::new_rows_cols_with_default(side, side, core::CV_8UC1, Scalar::all(0.))?;
        let (x0, y0) = (((side - w) / 2) as usize, ((side - h) / 2) as usize);
        let src = binary.data_bytes()?;
        let dst = canvas.data_bytes_mut()?;
        for (r, row) in src.chunks_exact(w as usize).enumerate() {
            let start = (y0 + r) * side as usize + x0;
            dst[start..start + w as usize].copy_from_slice(row);
        }
        Ok(canvas)
    }
}

fn ink_bounding_rect(mask: &Mat) -> opencv::Result<Option<Rect>> {
    let mut coords = Vector::<Point>::new();
    core::find_non_zero(mask, &mut coords)?;
    if coords.is_empty() {
        return Ok(None);
    }
    Ok(Some(imgproc::bounding_rect(&coords)?))
}

fn largest_contour_rect(ink: &Mat) -> opencv::Result<Option<Rect>> {
    let mut contours = Vector::<Vector<Point>>::new();
    imgproc::find_contours_def(
        ink,
        &mut contours,
        imgproc::RETR_EXTERNAL,
        imgproc::CHAIN_APPROX_SIMPLE,
    )?;
    let mut best: Option<(f64, Rect)> = None;
    for contour in contours.iter() {
        let area = imgproc::contour_area_def(&contour)?;
        if best.is_none_or(|(a, _)| area > a) {
            best = Some((area, imgproc::bounding_rect(&contour)?));
        }
    }
    Ok(best.map(|(_, rect)| rect))
}

/// 擦除接近图标尺寸的长直线，这些线通常是渲染时带出来的包围框
pub fn suppress_long_lines(ink: &mut Mat) -> opencv::Result<()> {
    let mut edges = Mat::default();
    imgproc::canny_def(ink, &mut edges, 60., 140.)?;
    let min_len = (LONG_LINE_RATIO * ink.cols().min(ink.rows()) as f64).floor();
    let mut lines = Vector::<Vec4i>::new();
    imgproc::hough_lines_p(
        &edges,
        &mut lines,
        1.,
        std::f64::consts::PI / 180.,
        HOUGH_THRESHOLD,
        min_len,
        HOUGH_MAX_GAP,
    )?;
    for l in lines.iter() {
        imgproc::line(
            ink,
            Point::new(l[0], l[1]),
            Point::new(l[2], l[3]),
            Scalar::all(0.),
            LINE_ERASE_THICKNESS,
            imgproc::LINE_8,
            0,
        )?;
    }
    Ok(())
}

/// 去掉贴着边界、且宽或高超过一半的连通域（外框）
pub fn remove_border_frames(ink: &mut Mat) -> opencv::Result<()> {
    let (w, h) = (ink.cols(), ink.rows());
    let mut labels = Mat::default();
    let mut stats = Mat::default();
    let mut centroids = Mat::default();
    let n = imgproc::connected_components_with_stats(
        ink,
        &mut labels,
        &mut stats,
        &mut centroids,
        8,
        core::CV_32S,
    )?;

    let mut frame = vec![false; n as usize];
    for (i, is_frame) in frame.iter_mut().enumerate().skip(1) {
        let i = i as i32;
        let x = *stats.at_2d::<i32>(i, imgproc::CC_STAT_LEFT)?;
        let y = *stats.at_2d::<i32>(i, imgproc::CC_STAT_TOP)?;
        let cw = *stats.at_2d::<i32>(i, imgproc::CC_STAT_WIDTH)?;
        let ch = *stats.at_2d::<i32>(i, imgproc::CC_STAT_HEIGHT)?;
        let on_border = x == 0 || y == 0 || x + cw >= w - 1 || y + ch >= h - 1;
        let large = cw as f64 > FRAME_SPAN_RATIO * w as f64 || ch as f64 > FRAME_SPAN_RATIO * h as f64;
        *is_frame = on_border && large;
    }
    if !frame.iter().any(|&f| f) {
        return Ok(());
    }

    let labels = labels.data_typed::<i32>()?.to_vec();
    // 只有外框时保留原图，图标本身就是一个框
    if labels.iter().all(|&label| label == 0 || frame[label as usize]) {
        return Ok(());
    }
    let pixels = ink.data_bytes_mut()?;
    for (px, &label) in pixels.iter_mut().zip(&labels) {
        if frame[label as usize] {
            *px = 0;
        }
    }
    Ok(())
}

/// 形态学骨架：反复腐蚀，直到图像被腐蚀为空
pub fn skeletonize(ink: &Mat) -> opencv::Result<Mat> {
    let kernel =
        imgproc::get_structuring_element_def(imgproc::MORPH_CROSS, Size::new(3, 3))?;
    let mut img = ink.try_clone()?;
    let mut skel = Mat::new_rows_cols_with_default(ink.rows(), ink.cols(), core::CV_8UC1, Scalar::all(0.))?;
    let mut eroded = Mat::default();
    let mut opened = Mat::default();
    let mut residue = Mat::default();
    loop {
        imgproc::erode_def(&img, &mut eroded, &kernel)?;
        imgproc::dilate_def(&eroded, &mut opened, &kernel)?;
        core::subtract_def(&img, &opened, &mut residue)?;
        let mut merged = Mat::default();
        core::bitwise_or_def(&skel, &residue, &mut merged)?;
        skel = merged;
        img = eroded.try_clone()?;
        if core::count_non_zero(&img)? == 0 {
            break;
        }
    }
    Ok(skel)
}
