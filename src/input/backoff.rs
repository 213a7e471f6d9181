// 该文件是 Lampwatch （守灯人） 项目的一部分。
// src/input/backoff.rs - 重连退避策略
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

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
  pub base: Duration,
  pub cap: Duration,
  /// 随机抖动比例，0 表示不抖动
  pub jitter: f64,
}

impl Default for BackoffConfig {
  fn default() -> Self {
    Self {
      base: Duration::from_secs(3),
      cap: Duration::from_secs(30),
      jitter: 0.0,
    }
  }
}

/// 指数退避状态：第 N 次连续失败后的等待为 `min(base * 2^(N-1), cap)`
#[derive(Debug, Clone)]
pub struct Backoff {
  config: BackoffConfig,
  failures: u32,
}

impl Backoff {
  pub fn new(config: BackoffConfig) -> Self {
    Self {
      config,
      failures: 0,
    }
  }

  pub fn failures(&self) -> u32 {
    self.failures
  }

  /// 记录一次失败，返回下一次重试前应等待的时间
  pub fn next_delay(&mut self) -> Duration {
    self.failures = self.failures.saturating_add(1);
    let delay = self.delay_for(self.failures);
    if self.config.jitter > 0.0 {
      let factor = rand::thread_rng().gen_range(0.0..self.config.jitter);
      (delay + delay.mul_f64(factor)).min(self.config.cap)
    } else {
      delay
    }
  }

  fn delay_for(&self, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    self
      .config
      .base
      .checked_mul(1u32 << exponent)
      .unwrap_or(self.config.cap)
      .min(self.config.cap)
  }

  pub fn reset(&mut self) {
    self.failures = 0;
  }
}
