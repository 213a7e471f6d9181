// 该文件是 Lampwatch （守灯人） 项目的一部分。
// src/frame.rs - 视频帧定义
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::time::Instant;

use chrono::{DateTime, Local};
use image::RgbImage;

const RGB_CHANNELS: usize = 3;

/// 已解码的视频帧
///
/// 帧在一次采样节拍内只读使用，节拍结束后丢弃。告警快照需要显式复制图像。
#[derive(Debug, Clone)]
pub struct Frame {
  image: RgbImage,
  index: u64,
  captured_at: Instant,
  wall_clock: DateTime<Local>,
}

impl Frame {
  pub fn new(image: RgbImage, index: u64) -> Self {
    Self::with_timestamp(image, index, Instant::now())
  }

  pub fn with_timestamp(image: RgbImage, index: u64, captured_at: Instant) -> Self {
    Self {
      image,
      index,
      captured_at,
      wall_clock: Local::now(),
    }
  }

  /// 从 RGB 交错（HWC）字节构造帧，长度不足时返回 `None`
  pub fn from_rgb_bytes(width: u32, height: u32, data: &[u8], index: u64) -> Option<Self> {
    let size = RGB_CHANNELS * width as usize * height as usize;
    if data.len() < size {
      return None;
    }
    let image = RgbImage::from_raw(width, height, data[..size].to_vec())?;
    Some(Self::new(image, index))
  }

  /// 从 BGR 交错字节构造帧，转换为 RGB
  pub fn from_bgr_bytes(width: u32, height: u32, data: &[u8], index: u64) -> Option<Self> {
    let size = RGB_CHANNELS * width as usize * height as usize;
    if data.len() < size {
      return None;
    }
    let mut rgb = Vec::with_capacity(size);
    for pixel in data[..size].chunks_exact(RGB_CHANNELS) {
      rgb.extend_from_slice(&[pixel[2], pixel[1], pixel[0]]);
    }
    let image = RgbImage::from_raw(width, height, rgb)?;
    Some(Self::new(image, index))
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn index(&self) -> u64 {
    self.index
  }

  pub fn captured_at(&self) -> Instant {
    self.captured_at
  }

  pub fn wall_clock(&self) -> DateTime<Local> {
    self.wall_clock
  }

  pub fn image(&self) -> &RgbImage {
    &self.image
  }

  /// 像素亮度，取 HSV 的 V 通道，即 `max(R, G, B)`
  pub fn brightness(&self, x: u32, y: u32) -> u8 {
    let pixel = self.image.get_pixel(x, y);
    pixel[0].max(pixel[1]).max(pixel[2])
  }

  /// 复制一份图像作为告警快照
  pub fn snapshot(&self) -> RgbImage {
    self.image.clone()
  }
}
