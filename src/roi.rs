// 该文件是 Lampwatch （守灯人） 项目的一部分。
// src/roi.rs - 感兴趣区域（ROI）存储
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

//! # ROI 存储
//!
//! ROI 文件为 JSON 格式，每个矩形以 `[x, y, w, h]` 表示：
//!
//! ```json
//! {"rois": [[120, 40, 32, 32], [300, 48, 28, 30]]}
//! ```
//!
//! 文件在启动时读取一次，运行期间不再写回。

use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum RoiStoreError {
  #[error("ROI 文件不存在: {0}，请先使用 lampwatch-roi 生成")]
  Missing(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("ROI 文件格式错误: {0}")]
  FormatError(#[from] serde_json::Error),
  #[error("ROI 列表为空")]
  Empty,
  #[error("ROI #{0} 的宽或高为 0")]
  ZeroSized(usize),
  #[error("ROI #{0} 与 ROI #{1} 位置重复")]
  Duplicate(usize, usize),
  #[error("无法解析 ROI 描述 '{0}'，期望格式 x,y,w,h")]
  ParseError(String),
}

/// 帧坐标系下的轴对齐矩形
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u32; 4]", into = "[u32; 4]")]
pub struct Roi {
  pub x: u32,
  pub y: u32,
  pub width: u32,
  pub height: u32,
}

impl From<[u32; 4]> for Roi {
  fn from([x, y, width, height]: [u32; 4]) -> Self {
    Roi {
      x,
      y,
      width,
      height,
    }
  }
}

impl From<Roi> for [u32; 4] {
  fn from(roi: Roi) -> Self {
    [roi.x, roi.y, roi.width, roi.height]
  }
}

impl fmt::Display for Roi {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "({}, {}, {}x{})", self.x, self.y, self.width, self.height)
  }
}

impl FromStr for Roi {
  type Err = RoiStoreError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let parts = s
      .split(',')
      .map(|v| v.trim().parse::<u32>())
      .collect::<Result<Vec<_>, _>>()
      .map_err(|_| RoiStoreError::ParseError(s.to_string()))?;
    match parts.as_slice() {
      [x, y, w, h] => Ok(Roi::from([*x, *y, *w, *h])),
      _ => Err(RoiStoreError::ParseError(s.to_string())),
    }
  }
}

/// 半开区间表示的像素矩形 `[x0, x1) × [y0, y1)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
  pub x0: u32,
  pub y0: u32,
  pub x1: u32,
  pub y1: u32,
}

impl PixelRect {
  pub fn is_empty(&self) -> bool {
    self.x0 >= self.x1 || self.y0 >= self.y1
  }

  pub fn area(&self) -> u64 {
    if self.is_empty() {
      0
    } else {
      (self.x1 - self.x0) as u64 * (self.y1 - self.y0) as u64
    }
  }

  pub fn contains(&self, x: u32, y: u32) -> bool {
    x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
  }
}

impl Roi {
  /// 裁剪到帧范围内，完全在帧外时返回 `None`
  pub fn clip(&self, frame_width: u32, frame_height: u32) -> Option<PixelRect> {
    self.expand_clip(0, frame_width, frame_height)
  }

  /// 向外扩张 `margin` 像素后裁剪到帧范围内
  pub fn expand_clip(&self, margin: u32, frame_width: u32, frame_height: u32) -> Option<PixelRect> {
    let margin = margin as i64;
    let x0 = (self.x as i64 - margin).max(0);
    let y0 = (self.y as i64 - margin).max(0);
    let x1 = (self.x as i64 + self.width as i64 + margin).min(frame_width as i64);
    let y1 = (self.y as i64 + self.height as i64 + margin).min(frame_height as i64);
    let rect = PixelRect {
      x0: x0 as u32,
      y0: y0 as u32,
      x1: x1.max(0) as u32,
      y1: y1.max(0) as u32,
    };
    if rect.is_empty() { None } else { Some(rect) }
  }
}

#[derive(Serialize, Deserialize)]
struct RoiFile {
  rois: Vec<Roi>,
}

/// 启动时加载、运行期间不可变的 ROI 集合
///
/// 下标即 ROI 编号，用于日志和告警。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoiSet {
  rois: Vec<Roi>,
}

impl RoiSet {
  pub fn new(rois: Vec<Roi>) -> Result<Self, RoiStoreError> {
    if rois.is_empty() {
      return Err(RoiStoreError::Empty);
    }
    for (i, roi) in rois.iter().enumerate() {
      if roi.width == 0 || roi.height == 0 {
        return Err(RoiStoreError::ZeroSized(i));
      }
      if let Some(j) = rois[..i].iter().position(|other| other == roi) {
        return Err(RoiStoreError::Duplicate(j, i));
      }
    }
    Ok(Self { rois })
  }

  pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RoiStoreError> {
    let path = path.as_ref();
    if !path.exists() {
      return Err(RoiStoreError::Missing(path.display().to_string()));
    }
    let content = std::fs::read_to_string(path)?;
    let file: RoiFile = serde_json::from_str(&content)?;
    let set = Self::new(file.rois)?;
    info!("从 {} 加载了 {} 个 ROI", path.display(), set.len());
    Ok(set)
  }

  /// 写入 ROI 文件，仅供 ROI 选择工具使用
  pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), RoiStoreError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    let file = RoiFile {
      rois: self.rois.clone(),
    };
    std::fs::write(path, serde_json::to_string(&file)?)?;
    info!("ROI 已写入: {}", path.display());
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.rois.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rois.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (usize, &Roi)> {
    self.rois.iter().enumerate()
  }
}
