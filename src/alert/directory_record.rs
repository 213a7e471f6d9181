// 该文件是 Lampwatch （守灯人） 项目的一部分。
// src/alert/directory_record.rs - 告警目录记录
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
  path::PathBuf,
  sync::atomic::{AtomicU16, Ordering},
};

use chrono::{Datelike, Local};
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  alert::{DeliveryError, Notifier, NotifierError},
};

/// 把告警写入按日期分层的目录：`YYYY/MM/DD/HH-MM-SS-XXXX.{txt,jpg}`
pub struct DirectoryRecordNotifier {
  directory: PathBuf,
  counter: AtomicU16,
}

impl FromUrlWithScheme for DirectoryRecordNotifier {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordNotifier {
  type Error = NotifierError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(NotifierError::SchemeMismatch(uri.scheme().to_string()));
    }
    if uri.path().is_empty() {
      return Err(NotifierError::InvalidUrl("缺少目录路径".to_string()));
    }

    Ok(Self::new(uri.path()))
  }
}

impl DirectoryRecordNotifier {
  pub fn new<P: Into<PathBuf>>(directory: P) -> Self {
    Self {
      directory: directory.into(),
      counter: AtomicU16::new(0),
    }
  }

  fn record_path(&self) -> Result<PathBuf, std::io::Error> {
    let now = Local::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    let id = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    Ok(directory.join(format!("{}-{:04X}", now.format("%H-%M-%S"), id)))
  }
}

impl Notifier for DirectoryRecordNotifier {
  fn send(&self, text: &str, image: Option<&[u8]>) -> Result<(), DeliveryError> {
    let path = self.record_path()?;
    std::fs::write(path.with_extension("txt"), text)?;
    if let Some(jpeg) = image {
      std::fs::write(path.with_extension("jpg"), jpeg)?;
    }
    info!("告警已记录到 {}", path.display());
    Ok(())
  }
}
