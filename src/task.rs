// 该文件是 Lampwatch （守灯人） 项目的一部分。
// src/task.rs - 监控主循环
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
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
  alert::{AlertDispatcher, AlertEvent, Notifier},
  classifier::{Baseline, ClassificationResult, Classifier},
  config::{MonitorConfig, TaskConfig},
  debounce::{CombinePolicy, Debouncer, LampState},
  frame::Frame,
  input::{StreamError, StreamSource, VideoConnector},
  photometry::{SampleError, Sampler},
  roi::RoiSet,
};

/// 收到中断信号后允许清理的最长时间
const FORCED_EXIT_AFTER: Duration = Duration::from_secs(30);

pub trait Task<I, R, O>: Sized {
  type Error;
  fn run_task(self, input: I, rois: R, output: O) -> Result<(), Self::Error>;
}

/// 节拍之间保存的全部状态
#[derive(Debug, Clone)]
pub struct MonitorState {
  baselines: Vec<Baseline>,
  lamps: Vec<LampState>,
  last_results: Vec<Option<ClassificationResult>>,
  last_tick: Option<Instant>,
  ticks: u64,
}

impl MonitorState {
  pub fn baselines(&self) -> &[Baseline] {
    &self.baselines
  }

  pub fn lamps(&self) -> &[LampState] {
    &self.lamps
  }

  pub fn last_results(&self) -> &[Option<ClassificationResult>] {
    &self.last_results
  }

  pub fn ticks(&self) -> u64 {
    self.ticks
  }

  /// 距上一个节拍的时间，首个节拍或重连之后使用名义间隔
  pub fn elapsed_since_last_tick(&self, captured_at: Instant, nominal: Duration) -> Duration {
    match self.last_tick {
      Some(last) => captured_at.saturating_duration_since(last),
      None => nominal,
    }
  }

  /// 视频流中断后重新开始计时
  pub fn reset_clock(&mut self) {
    self.last_tick = None;
  }
}

/// 单个节拍的处理器：采样、判定、消抖
pub struct Monitor {
  rois: RoiSet,
  sampler: Sampler,
  classifier: Classifier,
  debouncer: Debouncer,
  policy: CombinePolicy,
  baseline_alpha: f32,
}

impl Monitor {
  pub fn new(rois: RoiSet, config: &MonitorConfig) -> Self {
    Self {
      rois,
      sampler: Sampler::new(config.sampler),
      classifier: Classifier::new(config.classifier),
      debouncer: Debouncer::new(config.debounce),
      policy: config.task.combine,
      baseline_alpha: config.task.baseline_alpha,
    }
  }

  pub fn rois(&self) -> &RoiSet {
    &self.rois
  }

  pub fn new_state(&self) -> MonitorState {
    MonitorState {
      baselines: vec![Baseline::new(self.baseline_alpha); self.rois.len()],
      lamps: (0..self.policy.units(self.rois.len()))
        .map(|_| self.debouncer.new_state())
        .collect(),
      last_results: vec![None; self.rois.len()],
      last_tick: None,
      ticks: 0,
    }
  }

  /// 用帧尺寸检查所有 ROI
  pub fn validate_rois(&self, width: u32, height: u32) -> Result<(), SampleError> {
    for (index, roi) in self.rois.iter() {
      self.sampler.check(roi, width, height)?;
      debug!("ROI #{} {} 在 {}x{} 内有效", index, roi, width, height);
    }
    Ok(())
  }

  /// 处理一帧，返回本节拍产生的告警
  ///
  /// 任一 ROI 采样失败时整拍跳过，状态不变。
  pub fn tick(
    &self,
    state: &mut MonitorState,
    frame: &Frame,
    elapsed: Duration,
  ) -> Result<Vec<AlertEvent>, SampleError> {
    let samples = self
      .rois
      .iter()
      .map(|(_, roi)| self.sampler.sample(frame, roi))
      .collect::<Result<Vec<_>, _>>()?;

    let mut results = Vec::with_capacity(samples.len());
    for (baseline, sample) in state.baselines.iter_mut().zip(&samples) {
      let result = self.classifier.classify(sample, baseline.value());
      baseline.observe(sample.background, result.is_on);
      results.push(result);
    }

    let verdicts: Vec<bool> = results.iter().map(|r| r.is_on).collect();
    let now = frame.captured_at();
    let mut alerts = Vec::new();
    for (unit, (lamp, is_on)) in state
      .lamps
      .iter_mut()
      .zip(self.policy.fold(&verdicts))
      .enumerate()
    {
      let Some(trigger) = self.debouncer.update(lamp, is_on, elapsed, now) else {
        continue;
      };
      let roi_ids = self.policy.members(unit, &verdicts);
      let brightest = roi_ids
        .iter()
        .map(|&id| &results[id])
        .max_by(|a, b| a.core.total_cmp(&b.core));
      let (core, threshold) = brightest
        .map(|r| (r.core, r.threshold_used))
        .unwrap_or_default();
      alerts.push(AlertEvent {
        timestamp: frame.wall_clock(),
        roi_ids,
        on_duration: trigger.on_duration,
        core,
        threshold,
        snapshot: Some(frame.snapshot()),
      });
    }

    debug!(
      "第 {} 帧: {}",
      frame.index(),
      results
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ")
    );

    state.last_results = results.into_iter().map(Some).collect();
    state.last_tick = Some(now);
    state.ticks += 1;
    Ok(alerts)
  }

  pub fn log_status(&self, state: &MonitorState) {
    for (index, result) in state.last_results.iter().enumerate() {
      match result {
        Some(result) => info!("ROI #{} {}", index, result),
        None => info!("ROI #{} 暂无数据", index),
      }
    }
    for (unit, lamp) in state.lamps.iter().enumerate() {
      info!(
        "单元 {} 累计亮灯 {:.1}s ({:?})",
        unit,
        lamp.accumulated_on_seconds(),
        lamp.phase()
      );
    }
  }
}

/// 安装 Ctrl-C 处理：置位退出标志，30 秒内未退出则强制结束进程
pub fn install_signal_handler(shutdown: Arc<AtomicBool>) -> Result<(), ctrlc::Error> {
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    shutdown.store(true, Ordering::SeqCst);
    thread::spawn(|| {
      thread::sleep(FORCED_EXIT_AFTER);
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })
}

/// 持续监控任务
#[derive(Debug)]
pub struct MonitorTask {
  config: MonitorConfig,
  shutdown: Arc<AtomicBool>,
  handle_signals: bool,
}

impl MonitorTask {
  pub fn new(config: MonitorConfig) -> Self {
    Self {
      config,
      shutdown: Arc::new(AtomicBool::new(false)),
      handle_signals: true,
    }
  }

  /// 是否在运行时安装 Ctrl-C 处理
  pub fn with_signal_handler(mut self, enabled: bool) -> Self {
    self.handle_signals = enabled;
    self
  }

  /// 退出标志，可交给视频源的等待器共享
  pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
    self.shutdown.clone()
  }

  fn task_config(&self) -> &TaskConfig {
    &self.config.task
  }

  fn stopping(&self) -> bool {
    self.shutdown.load(Ordering::SeqCst)
  }
}

impl<C: VideoConnector, N: Notifier> Task<StreamSource<C>, RoiSet, AlertDispatcher<N>>
  for MonitorTask
{
  type Error = anyhow::Error;

  fn run_task(
    self,
    mut input: StreamSource<C>,
    rois: RoiSet,
    output: AlertDispatcher<N>,
  ) -> Result<(), Self::Error> {
    if self.handle_signals {
      install_signal_handler(self.shutdown_flag())?;
    }

    let monitor = Monitor::new(rois, &self.config);
    let task = *self.task_config();
    info!(
      "开始监控 {} 个 ROI，每 {} 帧采样一次，组合策略 {:?}",
      monitor.rois().len(),
      task.sample_stride,
      task.combine
    );

    let first = match input.next_frame_resilient() {
      Ok(frame) => frame,
      Err(StreamError::Shutdown) => {
        info!("启动阶段收到退出信号");
        return Ok(());
      }
      Err(e) => return Err(e.into()),
    };
    monitor.validate_rois(first.width(), first.height())?;
    info!("首帧 {}x{}，ROI 检查通过", first.width(), first.height());

    let mut state = monitor.new_state();
    let mut pending = Some(first);
    let mut frame_counter: u64 = 0;
    let mut last_status = Instant::now();
    let (mut delivered, mut failed) = (0u64, 0u64);

    loop {
      if self.stopping() {
        warn!("中断信号接收，退出任务循环");
        break;
      }

      let frame = match pending.take() {
        Some(frame) => frame,
        None => match input.next_frame() {
          Ok(frame) => frame,
          Err(StreamError::Shutdown) => {
            warn!("中断信号接收，退出任务循环");
            break;
          }
          Err(e) => {
            debug!("视频流错误，重置节拍时钟: {}", e);
            state.reset_clock();
            continue;
          }
        },
      };

      frame_counter += 1;
      if frame_counter % task.sample_stride as u64 != 0 {
        continue;
      }

      let nominal = task.nominal_interval(input.fps());
      let elapsed = state.elapsed_since_last_tick(frame.captured_at(), nominal);
      match monitor.tick(&mut state, &frame, elapsed) {
        Ok(alerts) => {
          for alert in alerts {
            match output.dispatch(&alert) {
              Ok(ack) if ack.delivered => delivered += 1,
              Ok(_) => {}
              Err(_) => failed += 1,
            }
          }
        }
        Err(e) => warn!("跳过本节拍: {}", e),
      }

      if last_status.elapsed() >= task.status_interval {
        monitor.log_status(&state);
        last_status = Instant::now();
      }

      if task.max_ticks.is_some_and(|n| state.ticks() >= n) {
        info!("达到指定节拍数 {}, 退出任务循环", state.ticks());
        break;
      }
    }

    input.close();
    info!(
      "任务完成，共 {} 个节拍，告警成功 {} 次，失败 {} 次",
      state.ticks(),
      delivered,
      failed
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    alert::DeliveryError, classifier::ClassifierConfig, debounce::DebounceConfig,
    input::{Sleeper, VideoStream},
    roi::Roi,
  };
  use image::{Rgb, RgbImage};
  use std::{cell::RefCell, rc::Rc};

  const LAMP: [u32; 4] = [8, 8, 8, 8];

  fn scene(lamp_on: bool) -> RgbImage {
    let mut image = RgbImage::from_pixel(32, 32, Rgb([10, 10, 10]));
    if lamp_on {
      for y in 8..16 {
        for x in 8..16 {
          image.put_pixel(x, y, Rgb([250, 240, 200]));
        }
      }
    }
    image
  }

  fn config(alert_after: u64) -> MonitorConfig {
    let mut config = MonitorConfig::default();
    config.sampler.ring_thickness = 4;
    config.debounce = DebounceConfig {
      alert_after: Duration::from_secs(alert_after),
      cooldown: Duration::from_secs(900),
      off_grace_ticks: 1,
    };
    config.task.sample_stride = 1;
    config
  }

  fn rois(list: &[[u32; 4]]) -> RoiSet {
    RoiSet::new(list.iter().map(|r| Roi::from(*r)).collect()).unwrap()
  }

  /// 以 1 秒间隔产生的帧序列
  struct TimedFrames {
    base: Instant,
    lamp: Vec<bool>,
    index: u64,
  }

  impl VideoStream for TimedFrames {
    fn pull_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, StreamError> {
      let Some(&on) = self.lamp.get(self.index as usize) else {
        thread::sleep(timeout);
        return Ok(None);
      };
      let at = self.base + Duration::from_secs(self.index);
      self.index += 1;
      Ok(Some(Frame::with_timestamp(scene(on), self.index, at)))
    }

    fn fps(&self) -> Option<f64> {
      Some(1.0)
    }
  }

  struct TimedConnector {
    lamp: Vec<bool>,
  }

  impl VideoConnector for TimedConnector {
    type Stream = TimedFrames;

    fn connect(&mut self) -> Result<Self::Stream, StreamError> {
      Ok(TimedFrames {
        base: Instant::now(),
        lamp: self.lamp.clone(),
        index: 0,
      })
    }

    fn describe(&self) -> String {
      "timed".to_string()
    }
  }

  #[derive(Clone, Default)]
  struct CountingNotifier {
    sent: Rc<RefCell<Vec<String>>>,
    fail: bool,
  }

  impl Notifier for CountingNotifier {
    fn send(&self, text: &str, _image: Option<&[u8]>) -> Result<(), DeliveryError> {
      self.sent.borrow_mut().push(text.to_string());
      if self.fail {
        Err(DeliveryError::Network("offline".to_string()))
      } else {
        Ok(())
      }
    }
  }

  fn run(config: MonitorConfig, lamp: Vec<bool>, notifier: CountingNotifier) -> anyhow::Result<()> {
    let source = StreamSource::new(TimedConnector { lamp }, config.stream);
    MonitorTask::new(config)
      .with_signal_handler(false)
      .run_task(source, rois(&[LAMP]), AlertDispatcher::new(notifier, true))
  }

  fn at(base: Instant, secs: u64) -> Frame {
    Frame::with_timestamp(scene(true), secs, base + Duration::from_secs(secs))
  }

  #[test]
  fn alert_fires_on_fifth_tick_at_one_sample_per_second() {
    let monitor = Monitor::new(rois(&[LAMP]), &config(5));
    let mut state = monitor.new_state();
    let base = Instant::now();
    let nominal = Duration::from_secs(1);

    let mut fired = Vec::new();
    for tick in 1..=7 {
      let frame = at(base, tick);
      let elapsed = state.elapsed_since_last_tick(frame.captured_at(), nominal);
      if !monitor.tick(&mut state, &frame, elapsed).unwrap().is_empty() {
        fired.push(tick);
      }
    }
    assert_eq!(fired, vec![5]);
    assert_eq!(state.ticks(), 7);
  }

  #[test]
  fn alert_carries_roi_ids_and_brightness() {
    let monitor = Monitor::new(rois(&[[0, 24, 4, 4], LAMP]), &config(1));
    let mut state = monitor.new_state();
    let alerts = monitor
      .tick(&mut state, &at(Instant::now(), 0), Duration::from_secs(1))
      .unwrap();

    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].roi_ids, vec![1]);
    assert!(alerts[0].core >= 240.0);
    assert_eq!(alerts[0].threshold, 115.0);
    assert!(alerts[0].snapshot.is_some());
  }

  #[test]
  fn each_policy_tracks_rois_separately() {
    let mut config = config(2);
    config.task.combine = CombinePolicy::Each;
    let monitor = Monitor::new(rois(&[[0, 24, 4, 4], LAMP]), &config);
    let mut state = monitor.new_state();
    assert_eq!(state.lamps().len(), 2);

    let base = Instant::now();
    let mut alerts = Vec::new();
    for tick in 0..3 {
      alerts.extend(
        monitor
          .tick(&mut state, &at(base, tick), Duration::from_secs(1))
          .unwrap(),
      );
    }
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].roi_ids, vec![1]);
    assert_eq!(state.lamps()[0].accumulated_on_seconds(), 0.0);
  }

  #[test]
  fn baseline_only_follows_dark_ticks() {
    let monitor = Monitor::new(rois(&[LAMP]), &config(100));
    let mut state = monitor.new_state();
    let base = Instant::now();

    let dark = Frame::with_timestamp(scene(false), 0, base);
    monitor.tick(&mut state, &dark, Duration::from_secs(1)).unwrap();
    assert_eq!(state.baselines()[0].value(), Some(10.0));

    monitor
      .tick(&mut state, &at(base, 1), Duration::from_secs(1))
      .unwrap();
    assert_eq!(state.baselines()[0].value(), Some(10.0));
    assert!(state.last_results()[0].unwrap().is_on);
  }

  #[test]
  fn off_tick_resets_accumulated_time() {
    let monitor = Monitor::new(rois(&[LAMP]), &config(100));
    let mut state = monitor.new_state();
    let base = Instant::now();
    for tick in 0..3 {
      monitor
        .tick(&mut state, &at(base, tick), Duration::from_secs(1))
        .unwrap();
    }
    assert_eq!(state.lamps()[0].accumulated_on_seconds(), 3.0);

    let dark = Frame::with_timestamp(scene(false), 3, base + Duration::from_secs(3));
    monitor.tick(&mut state, &dark, Duration::from_secs(1)).unwrap();
    assert_eq!(state.lamps()[0].accumulated_on_seconds(), 0.0);
  }

  #[test]
  fn sampling_error_skips_tick_without_touching_state() {
    let monitor = Monitor::new(rois(&[[40, 40, 4, 4]]), &config(1));
    let mut state = monitor.new_state();
    let result = monitor.tick(&mut state, &at(Instant::now(), 0), Duration::from_secs(1));
    assert!(matches!(result, Err(SampleError::InvalidRoi { .. })));
    assert_eq!(state.ticks(), 0);
    assert!(state.last_results()[0].is_none());
  }

  #[test]
  fn reset_clock_uses_nominal_interval() {
    let monitor = Monitor::new(rois(&[LAMP]), &config(100));
    let mut state = monitor.new_state();
    let base = Instant::now();
    let frame = at(base, 0);
    monitor.tick(&mut state, &frame, Duration::from_secs(1)).unwrap();

    let later = base + Duration::from_secs(4);
    let nominal = Duration::from_millis(500);
    assert_eq!(
      state.elapsed_since_last_tick(later, nominal),
      Duration::from_secs(4)
    );
    state.reset_clock();
    assert_eq!(state.elapsed_since_last_tick(later, nominal), nominal);
  }

  #[test]
  fn classifier_thresholds_flow_from_config() {
    let mut config = config(1);
    config.classifier = ClassifierConfig {
      absolute_threshold: 255.0,
      relative_floor: 255.0,
      ..ClassifierConfig::default()
    };
    let monitor = Monitor::new(rois(&[LAMP]), &config);
    let mut state = monitor.new_state();
    let alerts = monitor
      .tick(&mut state, &at(Instant::now(), 0), Duration::from_secs(1))
      .unwrap();
    assert!(alerts.is_empty());
  }

  #[test]
  fn run_loop_dispatches_once_within_tick_budget() {
    let notifier = CountingNotifier::default();
    let mut config = config(5);
    config.task.max_ticks = Some(6);
    run(config, vec![true; 6], notifier.clone()).unwrap();

    let sent = notifier.sent.borrow();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("ON for 5s"));
  }

  #[test]
  fn run_loop_stops_before_threshold() {
    let notifier = CountingNotifier::default();
    let mut config = config(5);
    config.task.max_ticks = Some(4);
    run(config, vec![true; 4], notifier.clone()).unwrap();
    assert!(notifier.sent.borrow().is_empty());
  }

  #[test]
  fn run_loop_applies_frame_stride() {
    let notifier = CountingNotifier::default();
    let mut config = config(5);
    config.task.sample_stride = 2;
    config.task.max_ticks = Some(3);
    // 每两帧取一帧，三个节拍各累计 2 秒
    run(config, vec![true; 6], notifier.clone()).unwrap();
    assert_eq!(notifier.sent.borrow().len(), 1);
  }

  #[test]
  fn run_loop_survives_delivery_failure() {
    let notifier = CountingNotifier {
      fail: true,
      ..Default::default()
    };
    let mut config = config(1);
    config.debounce.cooldown = Duration::ZERO;
    config.task.max_ticks = Some(3);
    run(config, vec![true; 3], notifier.clone()).unwrap();
    assert_eq!(notifier.sent.borrow().len(), 3);
  }

  /// 每个会话按给定秒偏移产出帧，帧用完后连接断开
  struct RebootingStream {
    base: Instant,
    offsets: std::collections::VecDeque<u64>,
  }

  impl VideoStream for RebootingStream {
    fn pull_frame(&mut self, _timeout: Duration) -> Result<Option<Frame>, StreamError> {
      match self.offsets.pop_front() {
        Some(secs) => Ok(Some(at(self.base, secs))),
        None => Err(StreamError::Unavailable("摄像头重启".to_string())),
      }
    }

    fn fps(&self) -> Option<f64> {
      Some(1.0)
    }
  }

  struct RebootingConnector {
    base: Instant,
    sessions: std::collections::VecDeque<Vec<u64>>,
    connects: Rc<RefCell<u32>>,
  }

  impl VideoConnector for RebootingConnector {
    type Stream = RebootingStream;

    fn connect(&mut self) -> Result<Self::Stream, StreamError> {
      *self.connects.borrow_mut() += 1;
      let offsets = self
        .sessions
        .pop_front()
        .ok_or_else(|| StreamError::Unavailable("连接被拒绝".to_string()))?;
      Ok(RebootingStream {
        base: self.base,
        offsets: offsets.into(),
      })
    }

    fn describe(&self) -> String {
      "rebooting".to_string()
    }
  }

  struct NoWait;

  impl Sleeper for NoWait {
    fn sleep(&mut self, _duration: Duration) -> bool {
      true
    }
  }

  #[test]
  fn run_loop_rides_through_camera_reboot() {
    let connects = Rc::new(RefCell::new(0));
    let connector = RebootingConnector {
      base: Instant::now(),
      sessions: vec![vec![0, 1, 2], vec![100, 101]].into(),
      connects: connects.clone(),
    };
    let mut config = config(5);
    config.task.max_ticks = Some(5);
    let source = StreamSource::with_sleeper(connector, config.stream, Box::new(NoWait));
    let notifier = CountingNotifier::default();

    MonitorTask::new(config)
      .with_signal_handler(false)
      .run_task(source, rois(&[LAMP]), AlertDispatcher::new(notifier.clone(), false))
      .unwrap();

    assert_eq!(*connects.borrow(), 2);
    // 重连后的首个节拍按名义间隔 1 秒计，而不是两帧之间的 98 秒
    let sent = notifier.sent.borrow();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("ON for 5s"), "{}", sent[0]);
  }

  #[test]
  fn invalid_roi_on_first_frame_is_fatal() {
    let config = config(5);
    let source = StreamSource::new(TimedConnector { lamp: vec![true] }, config.stream);
    let result = MonitorTask::new(config).with_signal_handler(false).run_task(
      source,
      rois(&[[100, 100, 8, 8]]),
      AlertDispatcher::new(CountingNotifier::default(), false),
    );
    assert!(result.is_err());
  }

  #[test]
  fn shutdown_before_start_exits_cleanly() {
    let config = config(5);
    let task = MonitorTask::new(config).with_signal_handler(false);
    task.shutdown_flag().store(true, Ordering::SeqCst);
    let source = StreamSource::with_sleeper(
      TimedConnector { lamp: vec![true; 3] },
      config.stream,
      Box::new(crate::input::InterruptibleSleeper::new(task.shutdown_flag())),
    );
    let notifier = CountingNotifier::default();
    task
      .run_task(source, rois(&[LAMP]), AlertDispatcher::new(notifier.clone(), false))
      .unwrap();
    assert!(notifier.sent.borrow().is_empty());
  }
}
