// 该文件是 Lampwatch （守灯人） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

//! 以固定间隔重复输出一张静态图像，用于在没有摄像头时调试阈值。
//!
//! URL 形如 `image:///path/to/snapshot.jpg?interval_ms=1000`。

use std::{
  thread,
  time::{Duration, Instant},
};

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::error;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Frame,
  input::{StreamError, VideoConnector, VideoStream},
};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("Invalid interval: {0}")]
  InvalidInterval(String),
}

const DEFAULT_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct ImageFileInput {
  path: String,
  interval: Duration,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let interval_ms = match url.query_pairs().find(|(k, _)| k == "interval_ms") {
      Some((_, v)) => v
        .parse::<u64>()
        .ok()
        .filter(|ms| *ms > 0)
        .ok_or_else(|| ImageFileInputError::InvalidInterval(v.to_string()))?,
      None => DEFAULT_INTERVAL_MS,
    };

    Ok(ImageFileInput {
      path: url.path().to_string(),
      interval: Duration::from_millis(interval_ms),
    })
  }
}

impl ImageFileInput {
  fn load(&self) -> Result<RgbImage, ImageFileInputError> {
    Ok(ImageReader::open(&self.path)?.decode()?.into_rgb8())
  }
}

impl VideoConnector for ImageFileInput {
  type Stream = ImageFileStream;

  fn connect(&mut self) -> Result<Self::Stream, StreamError> {
    let image = self
      .load()
      .map_err(|e| StreamError::Unavailable(e.to_string()))?;
    Ok(ImageFileStream {
      image,
      interval: self.interval,
      next_due: Instant::now(),
      index: 0,
    })
  }

  fn describe(&self) -> String {
    format!("image://{}", self.path)
  }
}

pub struct ImageFileStream {
  image: RgbImage,
  interval: Duration,
  next_due: Instant,
  index: u64,
}

impl VideoStream for ImageFileStream {
  fn pull_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, StreamError> {
    let wait = self.next_due.saturating_duration_since(Instant::now());
    if wait > timeout {
      thread::sleep(timeout);
      return Ok(None);
    }
    thread::sleep(wait);
    self.next_due += self.interval;
    self.index += 1;
    Ok(Some(Frame::new(self.image.clone(), self.index)))
  }

  fn fps(&self) -> Option<f64> {
    Some(1.0 / self.interval.as_secs_f64())
  }
}
