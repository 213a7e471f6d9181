// 该文件是 Lampwatch （守灯人） 项目的一部分。
// src/alert.rs - 告警发送
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

use std::{io::Cursor, time::Duration};

use chrono::{DateTime, Local};
use image::{RgbImage, codecs::jpeg::JpegEncoder};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{FromUrl, roi::RoiSet};

#[cfg(feature = "draw_roi")]
pub mod draw;

#[cfg(feature = "telegram_notify")]
mod telegram;
#[cfg(feature = "telegram_notify")]
pub use self::telegram::TelegramNotifier;

#[cfg(feature = "directory_record")]
mod directory_record;
#[cfg(feature = "directory_record")]
pub use self::directory_record::DirectoryRecordNotifier;

const SNAPSHOT_JPEG_QUALITY: u8 = 85;

#[derive(Error, Debug)]
pub enum DeliveryError {
  #[error("网络错误: {0}")]
  Network(String),
  #[error("认证失败: {0}")]
  Auth(String),
  #[error("触发限流: {0}")]
  RateLimited(String),
  #[error("服务端拒绝: {0}")]
  Rejected(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum NotifierError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("通知地址无效: {0}")]
  InvalidUrl(String),
  #[cfg(feature = "telegram_notify")]
  #[error("HTTP 客户端错误: {0}")]
  ClientError(#[from] reqwest::Error),
}

/// 外部通知通道：发送一条文本及可选的 JPEG 图像
pub trait Notifier {
  fn send(&self, text: &str, image: Option<&[u8]>) -> Result<(), DeliveryError>;

  /// `false` 表示消息并不会真正送达外部
  fn delivers(&self) -> bool {
    true
  }
}

impl<N: Notifier + ?Sized> Notifier for Box<N> {
  fn send(&self, text: &str, image: Option<&[u8]>) -> Result<(), DeliveryError> {
    (**self).send(text, image)
  }

  fn delivers(&self) -> bool {
    (**self).delivers()
  }
}

/// 未配置通知通道时只写日志
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn send(&self, text: &str, image: Option<&[u8]>) -> Result<(), DeliveryError> {
    warn!(
      "通知通道未配置，跳过消息: {} (快照 {} 字节)",
      text,
      image.map(<[u8]>::len).unwrap_or(0)
    );
    Ok(())
  }

  fn delivers(&self) -> bool {
    false
  }
}

/// 一次告警
#[derive(Debug, Clone)]
pub struct AlertEvent {
  pub timestamp: DateTime<Local>,
  pub roi_ids: Vec<usize>,
  pub on_duration: Duration,
  pub core: f32,
  pub threshold: f32,
  pub snapshot: Option<RgbImage>,
}

impl AlertEvent {
  pub fn message(&self) -> String {
    let rois = self
      .roi_ids
      .iter()
      .map(|id| format!("#{}", id))
      .collect::<Vec<_>>()
      .join(", ");
    format!(
      "⚡ Lampwatch: lights look ON for {}s at ROI {} (V≈{:.0} ≥ {:.0}) @ {}",
      self.on_duration.as_secs(),
      rois,
      self.core,
      self.threshold,
      self.timestamp.format("%d-%m-%Y %H:%M:%S")
    )
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
  pub with_snapshot: bool,
  pub delivered: bool,
}

pub struct AlertDispatcher<N: Notifier> {
  notifier: N,
  attach_snapshot: bool,
  rois: Option<RoiSet>,
}

impl<N: Notifier> AlertDispatcher<N> {
  pub fn new(notifier: N, attach_snapshot: bool) -> Self {
    Self {
      notifier,
      attach_snapshot,
      rois: None,
    }
  }

  /// 在快照上标出 ROI
  pub fn with_rois(mut self, rois: RoiSet) -> Self {
    self.rois = Some(rois);
    self
  }

  fn encode_snapshot(&self, event: &AlertEvent) -> Option<Vec<u8>> {
    if !self.attach_snapshot {
      return None;
    }
    #[allow(unused_mut)]
    let mut image = event.snapshot.clone()?;
    #[cfg(feature = "draw_roi")]
    if let Some(rois) = &self.rois {
      draw::draw_rois(&mut image, rois, &event.roi_ids);
    }

    let mut buffer = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buffer, SNAPSHOT_JPEG_QUALITY);
    match image.write_with_encoder(encoder) {
      Ok(()) => Some(buffer.into_inner()),
      Err(e) => {
        warn!("快照编码失败，仅发送文本: {}", e);
        None
      }
    }
  }

  /// 发送告警，失败时记录日志并返回错误，不重试
  pub fn dispatch(&self, event: &AlertEvent) -> Result<Ack, DeliveryError> {
    let text = event.message();
    let snapshot = self.encode_snapshot(event);
    match self.notifier.send(&text, snapshot.as_deref()) {
      Ok(()) => {
        let delivered = self.notifier.delivers();
        if delivered {
          info!("告警已发送: {}", text);
        } else {
          debug!("告警未送达外部通道: {}", text);
        }
        Ok(Ack {
          with_snapshot: snapshot.is_some(),
          delivered,
        })
      }
      Err(e) => {
        error!("告警发送失败: {}", e);
        Err(e)
      }
    }
  }
}

pub enum NotifierWrapper {
  #[cfg(feature = "telegram_notify")]
  Telegram(TelegramNotifier),
  #[cfg(feature = "directory_record")]
  DirectoryRecord(DirectoryRecordNotifier),
  Log(LogNotifier),
}

impl FromUrl for NotifierWrapper {
  type Error = NotifierError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    #[allow(unused_imports)]
    use crate::FromUrlWithScheme;

    match url.scheme() {
      #[cfg(feature = "telegram_notify")]
      TelegramNotifier::SCHEME => Ok(NotifierWrapper::Telegram(TelegramNotifier::from_url(url)?)),
      #[cfg(feature = "directory_record")]
      DirectoryRecordNotifier::SCHEME => Ok(NotifierWrapper::DirectoryRecord(
        DirectoryRecordNotifier::from_url(url)?,
      )),
      "log" => Ok(NotifierWrapper::Log(LogNotifier)),
      other => Err(NotifierError::SchemeMismatch(other.to_string())),
    }
  }
}

impl Notifier for NotifierWrapper {
  fn send(&self, text: &str, image: Option<&[u8]>) -> Result<(), DeliveryError> {
    match self {
      #[cfg(feature = "telegram_notify")]
      NotifierWrapper::Telegram(notifier) => notifier.send(text, image),
      #[cfg(feature = "directory_record")]
      NotifierWrapper::DirectoryRecord(notifier) => notifier.send(text, image),
      NotifierWrapper::Log(notifier) => notifier.send(text, image),
    }
  }

  fn delivers(&self) -> bool {
    match self {
      #[cfg(feature = "telegram_notify")]
      NotifierWrapper::Telegram(notifier) => notifier.delivers(),
      #[cfg(feature = "directory_record")]
      NotifierWrapper::DirectoryRecord(notifier) => notifier.delivers(),
      NotifierWrapper::Log(notifier) => notifier.delivers(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::roi::Roi;
  use std::cell::RefCell;

  #[derive(Default)]
  struct FakeNotifier {
    fail: bool,
    sent: RefCell<Vec<(String, Option<usize>)>>,
  }

  impl Notifier for FakeNotifier {
    fn send(&self, text: &str, image: Option<&[u8]>) -> Result<(), DeliveryError> {
      self
        .sent
        .borrow_mut()
        .push((text.to_string(), image.map(<[u8]>::len)));
      if self.fail {
        Err(DeliveryError::RateLimited("retry after 30".to_string()))
      } else {
        Ok(())
      }
    }
  }

  fn event(snapshot: Option<RgbImage>) -> AlertEvent {
    AlertEvent {
      timestamp: Local::now(),
      roi_ids: vec![0, 2],
      on_duration: Duration::from_secs_f64(125.7),
      core: 180.4,
      threshold: 145.0,
      snapshot,
    }
  }

  #[test]
  fn message_names_duration_and_rois() {
    let text = event(None).message();
    assert!(text.contains("ON for 125s"));
    assert!(text.contains("ROI #0, #2"));
    assert!(text.contains("V≈180 ≥ 145"));
  }

  #[test]
  fn snapshot_is_attached_as_jpeg() {
    let dispatcher = AlertDispatcher::new(FakeNotifier::default(), true)
      .with_rois(RoiSet::new(vec![Roi::from([1, 1, 4, 4])]).unwrap());
    let ack = dispatcher
      .dispatch(&event(Some(RgbImage::new(16, 16))))
      .unwrap();
    assert!(ack.with_snapshot);
    assert!(ack.delivered);
    let sent = dispatcher.notifier.sent.borrow();
    assert!(sent[0].1.unwrap() > 0);
  }

  #[test]
  fn snapshot_disabled_sends_text_only() {
    let dispatcher = AlertDispatcher::new(FakeNotifier::default(), false);
    let ack = dispatcher
      .dispatch(&event(Some(RgbImage::new(16, 16))))
      .unwrap();
    assert!(!ack.with_snapshot);
    assert_eq!(dispatcher.notifier.sent.borrow()[0].1, None);
  }

  #[test]
  fn delivery_failure_is_returned_not_panicked() {
    let dispatcher = AlertDispatcher::new(
      FakeNotifier {
        fail: true,
        ..Default::default()
      },
      true,
    );
    assert!(matches!(
      dispatcher.dispatch(&event(None)),
      Err(DeliveryError::RateLimited(_))
    ));
  }

  #[test]
  fn log_only_channel_is_not_reported_as_delivered() {
    let dispatcher = AlertDispatcher::new(LogNotifier, true);
    let ack = dispatcher
      .dispatch(&event(Some(RgbImage::new(16, 16))))
      .unwrap();
    assert!(!ack.delivered);
    assert!(ack.with_snapshot);
  }

  #[test]
  fn notifier_from_url() {
    let log = NotifierWrapper::from_url(&Url::parse("log://").unwrap()).unwrap();
    assert!(matches!(log, NotifierWrapper::Log(_)));
    assert!(log.send("hello", None).is_ok());
    assert!(!log.delivers());
    assert!(matches!(
      NotifierWrapper::from_url(&Url::parse("smtp://mail").unwrap()),
      Err(NotifierError::SchemeMismatch(_))
    ));
  }
}
