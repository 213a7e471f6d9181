// 该文件是 Lampwatch （守灯人） 项目的一部分。
// src/alert/draw.rs - 在告警快照上标注 ROI
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

use image::{Rgb, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

use crate::roi::RoiSet;

const BORDER_THICKNESS: u32 = 2;
const ALERT_COLOR: [u8; 3] = [255, 48, 0]; // 橙红
const IDLE_COLOR: [u8; 3] = [0, 0, 255]; // 蓝色

/// 画出所有 ROI，触发告警的 ROI 用醒目颜色
pub fn draw_rois(image: &mut RgbImage, rois: &RoiSet, highlighted: &[usize]) {
  for (index, roi) in rois.iter() {
    let Some(rect) = roi.clip(image.width(), image.height()) else {
      continue;
    };
    let color = if highlighted.contains(&index) {
      ALERT_COLOR
    } else {
      IDLE_COLOR
    };

    // 向内逐像素收缩以加粗边框
    for t in 0..BORDER_THICKNESS {
      let width = (rect.x1 - rect.x0).saturating_sub(2 * t);
      let height = (rect.y1 - rect.y0).saturating_sub(2 * t);
      if width == 0 || height == 0 {
        break;
      }
      let r = Rect::at((rect.x0 + t) as i32, (rect.y0 + t) as i32).of_size(width, height);
      draw_hollow_rect_mut(image, r, Rgb(color));
    }
  }
}
