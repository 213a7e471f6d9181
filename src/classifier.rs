// 该文件是 Lampwatch （守灯人） 项目的一部分。
// src/classifier.rs - 灯亮/灯灭判定
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

//! # 灯状态分类器
//!
//! 每个节拍同时计算两条规则，任意一条成立即判定为亮：
//!
//! - 绝对规则：`core >= max(absolute_threshold, baseline + delta_over_base)`，
//!   适用于夜间等环境光较暗的场景；
//! - 相对规则：`core / background >= min_ratio` 或
//!   `core - background >= min_diff`，适用于白天环境光较强的场景。
//!
//! 背景亮度低于 `relative_floor` 时比值不稳定，此时只用绝对规则。

use std::fmt;

use crate::photometry::BrightnessSample;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierConfig {
  pub absolute_threshold: f32,
  pub delta_over_base: f32,
  pub min_ratio: f32,
  pub min_diff: f32,
  pub relative_floor: f32,
}

impl Default for ClassifierConfig {
  fn default() -> Self {
    Self {
      absolute_threshold: 115.0,
      delta_over_base: 30.0,
      min_ratio: 1.20,
      min_diff: 20.0,
      relative_floor: 16.0,
    }
  }
}

/// 单个 ROI 单个节拍的判定结果，仅用于本节拍和状态日志
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationResult {
  pub is_on: bool,
  pub core: f32,
  pub background: f32,
  /// 背景为 0 时为 `None`
  pub ratio: Option<f32>,
  pub diff: f32,
  pub threshold_used: f32,
  pub absolute_on: bool,
  pub relative_on: bool,
}

impl fmt::Display for ClassificationResult {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let ratio = self
      .ratio
      .map(|r| format!("{:.2}", r))
      .unwrap_or_else(|| "-".to_string());
    write!(
      f,
      "core={:.0} bg={:.0} ratio={} diff={:.0} thr={:.0} {}{}",
      self.core,
      self.background,
      ratio,
      self.diff,
      self.threshold_used,
      if self.is_on { "ON" } else { "OFF" },
      match (self.absolute_on, self.relative_on) {
        (true, true) => "[abs+rel]",
        (true, false) => "[abs]",
        (false, true) => "[rel]",
        (false, false) => "",
      }
    )
  }
}

#[derive(Debug, Clone)]
pub struct Classifier {
  config: ClassifierConfig,
}

impl Classifier {
  pub fn new(config: ClassifierConfig) -> Self {
    Self { config }
  }

  pub fn classify(
    &self,
    sample: &BrightnessSample,
    baseline_background: Option<f32>,
  ) -> ClassificationResult {
    let BrightnessSample { core, background } = *sample;
    let cfg = &self.config;

    let threshold_used = match baseline_background {
      Some(base) => cfg.absolute_threshold.max(base + cfg.delta_over_base),
      None => cfg.absolute_threshold,
    };
    let absolute_on = core >= threshold_used;

    let ratio = if background > 0.0 {
      Some(core / background)
    } else {
      None
    };
    let diff = core - background;
    let relative_on = background >= cfg.relative_floor
      && (ratio.is_some_and(|r| r >= cfg.min_ratio) || diff >= cfg.min_diff);

    ClassificationResult {
      is_on: absolute_on || relative_on,
      core,
      background,
      ratio,
      diff,
      threshold_used,
      absolute_on,
      relative_on,
    }
  }
}

/// 缓慢自适应的环境背景亮度估计
///
/// 以第一次观测值初始化，之后只在灯灭的节拍上做指数平滑，
/// 避免长时间亮灯把基线抬高。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Baseline {
  alpha: f32,
  value: Option<f32>,
}

impl Baseline {
  pub fn new(alpha: f32) -> Self {
    Self { alpha, value: None }
  }

  pub fn value(&self) -> Option<f32> {
    self.value
  }

  pub fn observe(&mut self, background: f32, is_on: bool) {
    match self.value {
      None => self.value = Some(background),
      Some(current) if !is_on => {
        self.value = Some((1.0 - self.alpha) * current + self.alpha * background);
      }
      Some(_) => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn classifier(absolute: f32, delta: f32) -> Classifier {
    Classifier::new(ClassifierConfig {
      absolute_threshold: absolute,
      delta_over_base: delta,
      min_ratio: 1.20,
      min_diff: 20.0,
      relative_floor: 16.0,
    })
  }

  #[test]
  fn daylight_lamp_is_on_by_contrast() {
    // 白天场景：绝对阈值拉高到 255 以外，只看相对规则
    let result = classifier(1000.0, 30.0).classify(
      &BrightnessSample {
        core: 176.0,
        background: 120.0,
      },
      None,
    );
    assert!(result.is_on);
    assert!(result.relative_on);
    assert!(!result.absolute_on);
    assert!((result.ratio.unwrap() - 1.4667).abs() < 1e-3);
    assert_eq!(result.diff, 56.0);
  }

  #[test]
  fn dim_lamp_is_off() {
    let result = classifier(128.0, 30.0).classify(
      &BrightnessSample {
        core: 47.0,
        background: 43.0,
      },
      Some(98.0),
    );
    assert!(!result.is_on);
    assert_eq!(result.threshold_used, 128.0);
    assert!(result.ratio.unwrap() < 1.2);
    assert_eq!(result.diff, 4.0);
  }

  #[test]
  fn baseline_raises_absolute_threshold() {
    let c = classifier(100.0, 30.0);
    let sample = BrightnessSample {
      core: 120.0,
      background: 10.0,
    };
    assert!(c.classify(&sample, Some(50.0)).is_on);
    let result = c.classify(&sample, Some(95.0));
    assert_eq!(result.threshold_used, 125.0);
    assert!(!result.absolute_on);
    // 背景低于下限，相对规则不参与
    assert!(!result.relative_on);
  }

  #[test]
  fn dark_background_uses_absolute_rule_only() {
    let result = classifier(128.0, 30.0).classify(
      &BrightnessSample {
        core: 60.0,
        background: 0.0,
      },
      None,
    );
    assert_eq!(result.ratio, None);
    assert!(!result.is_on);
  }

  #[test]
  fn baseline_updates_only_when_off() {
    let mut baseline = Baseline::new(0.5);
    baseline.observe(100.0, true);
    assert_eq!(baseline.value(), Some(100.0));
    baseline.observe(200.0, true);
    assert_eq!(baseline.value(), Some(100.0));
    baseline.observe(50.0, false);
    assert_eq!(baseline.value(), Some(75.0));
  }
}
