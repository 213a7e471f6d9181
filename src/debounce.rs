// 该文件是 Lampwatch （守灯人） 项目的一部分。
// src/debounce.rs - 亮灯计时与告警冷却状态机
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

use std::{
  str::FromStr,
  time::{Duration, Instant},
};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebounceConfig {
  pub alert_after: Duration,
  pub cooldown: Duration,
  /// 连续多少个灭灯节拍后才清零计时，1 表示单帧即清零
  pub off_grace_ticks: u32,
}

impl Default for DebounceConfig {
  fn default() -> Self {
    Self {
      alert_after: Duration::from_secs(120),
      cooldown: Duration::from_secs(900),
      off_grace_ticks: 1,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  OffIdle,
  OnAccumulating,
  Alerted,
}

/// 一个监控单元的计时状态
#[derive(Debug, Clone, PartialEq)]
pub struct LampState {
  accumulated_on: Duration,
  last_alert_time: Option<Instant>,
  next_alert_at: Duration,
  off_streak: u32,
  phase: Phase,
}

impl LampState {
  pub fn new(config: &DebounceConfig) -> Self {
    Self {
      accumulated_on: Duration::ZERO,
      last_alert_time: None,
      next_alert_at: config.alert_after,
      off_streak: 0,
      phase: Phase::OffIdle,
    }
  }

  pub fn accumulated_on(&self) -> Duration {
    self.accumulated_on
  }

  pub fn accumulated_on_seconds(&self) -> f64 {
    self.accumulated_on.as_secs_f64()
  }

  pub fn last_alert_time(&self) -> Option<Instant> {
    self.last_alert_time
  }

  pub fn phase(&self) -> Phase {
    self.phase
  }

  fn cooling(&self, config: &DebounceConfig, now: Instant) -> bool {
    self
      .last_alert_time
      .is_some_and(|t| now.saturating_duration_since(t) < config.cooldown)
  }

  /// 冷却期之外即可再次告警
  pub fn armed(&self, config: &DebounceConfig, now: Instant) -> bool {
    !self.cooling(config, now)
  }
}

/// 状态机发出的告警触发
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trigger {
  pub on_duration: Duration,
  pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct Debouncer {
  config: DebounceConfig,
}

impl Debouncer {
  pub fn new(config: DebounceConfig) -> Self {
    Self { config }
  }

  pub fn new_state(&self) -> LampState {
    LampState::new(&self.config)
  }

  /// 推进一个节拍
  ///
  /// `elapsed` 为距上一个节拍的实际时间，亮灯时累加到计时上。
  pub fn update(
    &self,
    state: &mut LampState,
    is_on: bool,
    elapsed: Duration,
    now: Instant,
  ) -> Option<Trigger> {
    if !is_on {
      state.off_streak = state.off_streak.saturating_add(1);
      if state.off_streak >= self.config.off_grace_ticks.max(1) {
        if state.phase != Phase::OffIdle {
          debug!(
            "灭灯，计时清零 (已累计 {:.1}s)",
            state.accumulated_on_seconds()
          );
        }
        state.accumulated_on = Duration::ZERO;
        state.next_alert_at = self.config.alert_after;
        state.phase = Phase::OffIdle;
      }
      return None;
    }

    state.off_streak = 0;
    state.accumulated_on = state.accumulated_on.saturating_add(elapsed);

    let cooling = state.cooling(&self.config, now);
    match state.phase {
      Phase::OffIdle => state.phase = Phase::OnAccumulating,
      Phase::Alerted if !cooling => state.phase = Phase::OnAccumulating,
      _ => {}
    }

    if state.accumulated_on >= state.next_alert_at && !cooling {
      state.last_alert_time = Some(now);
      state.next_alert_at = state.accumulated_on.saturating_add(self.config.alert_after);
      state.phase = Phase::Alerted;
      return Some(Trigger {
        on_duration: state.accumulated_on,
        at: now,
      });
    }

    None
  }
}

/// 多个 ROI 的组合方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CombinePolicy {
  /// 任意一个 ROI 亮即视为亮
  #[default]
  Any,
  /// 所有 ROI 都亮才视为亮
  All,
  /// 每个 ROI 单独计时、单独告警
  Each,
}

impl FromStr for CombinePolicy {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "any" => Ok(CombinePolicy::Any),
      "all" => Ok(CombinePolicy::All),
      "each" => Ok(CombinePolicy::Each),
      _ => Err(format!("未知的组合策略: {}", s)),
    }
  }
}

impl CombinePolicy {
  /// 监控单元数量
  pub fn units(&self, roi_count: usize) -> usize {
    match self {
      CombinePolicy::Each => roi_count,
      CombinePolicy::Any | CombinePolicy::All => 1,
    }
  }

  /// 把各 ROI 的判定折叠成各监控单元的判定
  pub fn fold(&self, verdicts: &[bool]) -> Vec<bool> {
    match self {
      CombinePolicy::Any => vec![verdicts.iter().any(|v| *v)],
      CombinePolicy::All => vec![!verdicts.is_empty() && verdicts.iter().all(|v| *v)],
      CombinePolicy::Each => verdicts.to_vec(),
    }
  }

  /// 监控单元在告警中报告的 ROI 编号
  pub fn members(&self, unit: usize, verdicts: &[bool]) -> Vec<usize> {
    match self {
      CombinePolicy::Any => verdicts
        .iter()
        .enumerate()
        .filter_map(|(i, on)| on.then_some(i))
        .collect(),
      CombinePolicy::All => (0..verdicts.len()).collect(),
      CombinePolicy::Each => vec![unit],
    }
  }
}
