// 该文件是 Lampwatch （守灯人） 项目的一部分。
// src/photometry.rs - ROI 亮度采样
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

use std::str::FromStr;

use thiserror::Error;

use crate::{
  frame::Frame,
  roi::{PixelRect, Roi},
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SampleError {
  #[error("ROI {roi} 超出帧范围 {width}x{height}")]
  InvalidRoi { roi: Roi, width: u32, height: u32 },
}

/// 背景环的统计方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackgroundStat {
  #[default]
  Mean,
  Median,
}

impl FromStr for BackgroundStat {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "mean" => Ok(BackgroundStat::Mean),
      "median" => Ok(BackgroundStat::Median),
      _ => Err(format!("未知的背景统计方式: {}", s)),
    }
  }
}

/// 单个 ROI 在单个节拍上的亮度统计
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrightnessSample {
  /// ROI 内亮度的高分位数
  pub core: f32,
  /// 背景环的亮度
  pub background: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerConfig {
  pub quantile: f32,
  pub ring_thickness: u32,
  pub background_stat: BackgroundStat,
}

impl Default for SamplerConfig {
  fn default() -> Self {
    Self {
      quantile: 0.90,
      ring_thickness: 12,
      background_stat: BackgroundStat::Mean,
    }
  }
}

#[derive(Debug, Clone)]
pub struct Sampler {
  config: SamplerConfig,
}

/// 256 级亮度直方图
struct Histogram {
  bins: [u64; 256],
  count: u64,
  sum: u64,
}

impl Histogram {
  fn new() -> Self {
    Self {
      bins: [0; 256],
      count: 0,
      sum: 0,
    }
  }

  fn push(&mut self, value: u8) {
    self.bins[value as usize] += 1;
    self.count += 1;
    self.sum += value as u64;
  }

  /// 最近秩分位数
  fn quantile(&self, q: f32) -> f32 {
    if self.count == 0 {
      return 0.0;
    }
    let rank = ((q.clamp(0.0, 1.0) as f64 * self.count as f64).ceil() as u64).max(1);
    let mut seen = 0;
    for (value, n) in self.bins.iter().enumerate() {
      seen += n;
      if seen >= rank {
        return value as f32;
      }
    }
    255.0
  }

  fn mean(&self) -> f32 {
    if self.count == 0 {
      0.0
    } else {
      (self.sum as f64 / self.count as f64) as f32
    }
  }
}

impl Sampler {
  pub fn new(config: SamplerConfig) -> Self {
    Self { config }
  }

  /// 检查 ROI 及其背景环在给定帧尺寸下是否可用
  pub fn check(&self, roi: &Roi, width: u32, height: u32) -> Result<(PixelRect, PixelRect), SampleError> {
    let invalid = || SampleError::InvalidRoi {
      roi: *roi,
      width,
      height,
    };
    let inner = roi.clip(width, height).ok_or_else(invalid)?;
    let outer = roi
      .expand_clip(self.config.ring_thickness, width, height)
      .ok_or_else(invalid)?;
    if outer.area() <= inner.area() {
      return Err(invalid());
    }
    Ok((inner, outer))
  }

  pub fn sample(&self, frame: &Frame, roi: &Roi) -> Result<BrightnessSample, SampleError> {
    let (inner, outer) = self.check(roi, frame.width(), frame.height())?;

    let mut core = Histogram::new();
    for y in inner.y0..inner.y1 {
      for x in inner.x0..inner.x1 {
        core.push(frame.brightness(x, y));
      }
    }

    let mut ring = Histogram::new();
    for y in outer.y0..outer.y1 {
      for x in outer.x0..outer.x1 {
        if !inner.contains(x, y) {
          ring.push(frame.brightness(x, y));
        }
      }
    }

    let background = match self.config.background_stat {
      BackgroundStat::Mean => ring.mean(),
      BackgroundStat::Median => ring.quantile(0.5),
    };

    Ok(BrightnessSample {
      core: core.quantile(self.config.quantile),
      background,
    })
  }
}
