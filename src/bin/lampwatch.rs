// 该文件是 Lampwatch （守灯人） 项目的一部分。
// src/bin/lampwatch.rs - 亮灯监控主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use lampwatch::{
  FromUrl,
  alert::{AlertDispatcher, LogNotifier, NotifierWrapper},
  config::{DvrEndpoint, MonitorConfig},
  debounce::CombinePolicy,
  input::{BackoffConfig, InputWrapper, InterruptibleSleeper, StreamSource},
  photometry::BackgroundStat,
  roi::RoiSet,
  task::{MonitorTask, Task},
};

/// Lampwatch 亮灯监控参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 视频源，例如 rtsp://...、gst://file/...、image:///path.jpg
  /// 未指定时根据 --dvr-host 等参数拼出 RTSP 地址
  #[arg(long, value_name = "SOURCE")]
  pub input: Option<Url>,

  #[arg(long, env = "DVR_IP", value_name = "HOST")]
  pub dvr_host: Option<String>,
  #[arg(long, env = "DVR_USER", default_value = "")]
  pub dvr_user: String,
  #[arg(long, env = "DVR_PASS", default_value = "", hide_env_values = true)]
  pub dvr_pass: String,
  #[arg(long, env = "DVR_PORT", default_value_t = 554)]
  pub dvr_port: u16,
  #[arg(long, env = "DVR_CHANNEL", default_value_t = 1)]
  pub dvr_channel: u32,
  #[arg(long, env = "DVR_SUBTYPE", default_value_t = 1)]
  pub dvr_subtype: u32,

  /// ROI 文件，可用 lampwatch-roi 生成
  #[arg(long, env = "ROI_FILE", default_value = "rois.json", value_name = "FILE")]
  pub roi_file: PathBuf,

  /// 通知地址，例如 telegram://api.telegram.org/bot<TOKEN>?chat_id=<ID>、folder:///var/lampwatch、log://
  #[arg(long, value_name = "NOTIFY")]
  pub notify: Option<Url>,
  #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
  pub telegram_bot_token: Option<String>,
  #[arg(long, env = "TELEGRAM_CHAT_ID")]
  pub telegram_chat_id: Option<String>,

  /// 告警时附带快照，接受 1/0、true/false、yes/no
  #[arg(
    long,
    env = "SAVE_FRAME_ON_ALERT",
    default_value_t = true,
    action = clap::ArgAction::Set,
    value_parser = clap::builder::BoolishValueParser::new()
  )]
  pub save_frame_on_alert: bool,

  /// 连续亮灯多少秒后告警
  #[arg(long, env = "ALERT_AFTER_SEC", default_value_t = 120)]
  pub alert_after: u64,
  /// 两次告警之间的最短间隔（秒）
  #[arg(long, env = "COOLDOWN_SEC", default_value_t = 900)]
  pub cooldown: u64,
  /// 连续多少个灭灯节拍后清零计时
  #[arg(long, default_value_t = 1)]
  pub off_grace_ticks: u32,
  /// 多个 ROI 的组合方式: any / all / each
  #[arg(long, default_value = "any")]
  pub combine: CombinePolicy,

  /// 每 N 帧处理一帧
  #[arg(long, env = "FRAME_SAMPLE_EVERY", default_value_t = 5)]
  pub frame_sample_every: u32,

  /// 绝对亮度阈值 (0 - 255)
  #[arg(long, env = "ABS_THRESH", default_value_t = 115.0)]
  pub abs_thresh: f32,
  /// 相对基线的亮度增量
  #[arg(long, env = "DELTA_OVER_BASE", default_value_t = 30.0)]
  pub delta_over_base: f32,
  #[arg(long, default_value_t = 1.20)]
  pub min_ratio: f32,
  #[arg(long, default_value_t = 20.0)]
  pub min_diff: f32,
  /// 背景低于该值时不使用相对判定
  #[arg(long, default_value_t = 16.0)]
  pub relative_floor: f32,
  #[arg(long, default_value_t = 0.05)]
  pub baseline_alpha: f32,

  /// ROI 内亮度分位数
  #[arg(long, default_value_t = 0.90)]
  pub quantile: f32,
  /// 背景环宽度（像素）
  #[arg(long, default_value_t = 12)]
  pub ring_thickness: u32,
  /// 背景统计方式: mean / median
  #[arg(long, default_value = "mean")]
  pub background_stat: BackgroundStat,

  /// 多少秒没有新帧视为停滞
  #[arg(long, default_value_t = 10)]
  pub stall_timeout: u64,
  #[arg(long, default_value_t = 3)]
  pub backoff_base: u64,
  #[arg(long, default_value_t = 30)]
  pub backoff_cap: u64,
  /// 退避时间的随机抖动比例 (0 - 1)
  #[arg(long, default_value_t = 0.0)]
  pub backoff_jitter: f64,

  /// 状态日志间隔（秒）
  #[arg(long, default_value_t = 30)]
  pub status_interval: u64,
  /// 处理指定数量的采样节拍后退出
  #[arg(long, value_name = "TICKS")]
  pub max_ticks: Option<u64>,
}

impl Args {
  fn monitor_config(&self) -> MonitorConfig {
    let mut config = MonitorConfig::default();

    config.sampler.quantile = self.quantile;
    config.sampler.ring_thickness = self.ring_thickness;
    config.sampler.background_stat = self.background_stat;

    config.classifier.absolute_threshold = self.abs_thresh;
    config.classifier.delta_over_base = self.delta_over_base;
    config.classifier.min_ratio = self.min_ratio;
    config.classifier.min_diff = self.min_diff;
    config.classifier.relative_floor = self.relative_floor;

    config.debounce.alert_after = Duration::from_secs(self.alert_after);
    config.debounce.cooldown = Duration::from_secs(self.cooldown);
    config.debounce.off_grace_ticks = self.off_grace_ticks;

    config.stream.stall_timeout = Duration::from_secs(self.stall_timeout);
    config.stream.backoff = BackoffConfig {
      base: Duration::from_secs(self.backoff_base),
      cap: Duration::from_secs(self.backoff_cap),
      jitter: self.backoff_jitter,
    };

    config.task.sample_stride = self.frame_sample_every;
    config.task.status_interval = Duration::from_secs(self.status_interval);
    config.task.max_ticks = self.max_ticks;
    config.task.baseline_alpha = self.baseline_alpha;
    config.task.combine = self.combine;
    config
  }

  fn input_url(&self) -> Result<Url> {
    if let Some(url) = &self.input {
      return Ok(url.clone());
    }
    let dvr = DvrEndpoint {
      user: self.dvr_user.clone(),
      password: self.dvr_pass.clone(),
      host: self.dvr_host.clone().unwrap_or_default(),
      port: self.dvr_port,
      channel: self.dvr_channel,
      subtype: self.dvr_subtype,
    };
    Ok(dvr.rtsp_url()?)
  }

  fn notifier(&self) -> Result<NotifierWrapper> {
    if let Some(url) = &self.notify {
      return Ok(NotifierWrapper::from_url(url)?);
    }

    #[cfg(feature = "telegram_notify")]
    {
      if let (Some(token), Some(chat_id)) = (&self.telegram_bot_token, &self.telegram_chat_id) {
        let notifier = lampwatch::alert::TelegramNotifier::new(token, chat_id)?;
        return Ok(NotifierWrapper::Telegram(notifier));
      }
    }

    warn!("Telegram 未配置，告警只写入日志");
    Ok(NotifierWrapper::Log(LogNotifier))
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();
  let config = args.monitor_config();
  config.validate()?;

  // 文件不存在时错误信息会提示使用 lampwatch-roi
  let rois = RoiSet::load(&args.roi_file)?;

  let input_url = args.input_url()?;
  info!("输入来源: {}", input_url.host_str().unwrap_or(input_url.scheme()));
  let connector = InputWrapper::from_url(&input_url)?;
  let dispatcher = AlertDispatcher::new(args.notifier()?, args.save_frame_on_alert).with_rois(rois.clone());

  let task = MonitorTask::new(config);
  let source = StreamSource::with_sleeper(
    connector,
    config.stream,
    Box::new(InterruptibleSleeper::new(task.shutdown_flag())),
  );

  task.run_task(source, rois, dispatcher)?;

  Ok(())
}
